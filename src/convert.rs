//! Conversion rules between device payloads and normalized variable text.
//!
//! Each item-table row may carry one converter. `from_device` is the
//! postprocess step (decoded payload bytes -> normalized text) and
//! `to_device` the preprocess step (normalized text -> wire payload) used for
//! writes. Converters returning `None` signal an unconvertible payload, which
//! the engine treats as a malformed answer for that item.

/// One conversion rule, selected per item-table row.
pub trait ItemConverter: Sync {
    /// Device payload (already window-extracted) to normalized text.
    fn from_device(&self, raw: &[u8]) -> Option<String>;

    /// Normalized text to wire payload. Only meaningful for settable items;
    /// the default marks the conversion as unsupported.
    fn to_device(&self, _value: &str) -> Option<Vec<u8>> {
        None
    }
}

fn parse_ascii_f64(raw: &[u8]) -> Option<f64> {
    core::str::from_utf8(raw).ok()?.trim().parse::<f64>().ok()
}

/// Render a float without trailing noise; per-item format templates do the
/// final rounding at publish time.
fn render(value: f64) -> String {
    if value == value.trunc() && value.abs() < 1e9 {
        format!("{}", value as i64)
    } else {
        format!("{value:.3}")
    }
}

/// ASCII decimal field scaled by a fixed factor, e.g. a device reporting
/// tenths. Encodes zero-padded to `encode_width` digits for writes.
pub struct AsciiScale {
    pub factor: f64,
    pub encode_width: usize,
}

impl ItemConverter for AsciiScale {
    fn from_device(&self, raw: &[u8]) -> Option<String> {
        Some(render(parse_ascii_f64(raw)? * self.factor))
    }

    fn to_device(&self, value: &str) -> Option<Vec<u8>> {
        let raw = (value.trim().parse::<f64>().ok()? / self.factor).round() as i64;
        if raw < 0 {
            return None;
        }
        Some(format!("{raw:0width$}", width = self.encode_width).into_bytes())
    }
}

/// Big-endian u16 payload scaled by a fixed factor. Used by binary-framed
/// protocols for measured values and delay registers.
pub struct BeU16 {
    pub factor: f64,
}

impl ItemConverter for BeU16 {
    fn from_device(&self, raw: &[u8]) -> Option<String> {
        let bytes: [u8; 2] = raw.try_into().ok()?;
        Some(render(u16::from_be_bytes(bytes) as f64 * self.factor))
    }

    fn to_device(&self, value: &str) -> Option<Vec<u8>> {
        let raw = (value.trim().parse::<f64>().ok()? / self.factor).round();
        if !(0.0..=u16::MAX as f64).contains(&raw) {
            return None;
        }
        Some((raw as u16).to_be_bytes().to_vec())
    }
}

/// Single-byte payload scaled by a fixed factor, e.g. a load percentage.
pub struct U8Scale {
    pub factor: f64,
}

impl ItemConverter for U8Scale {
    fn from_device(&self, raw: &[u8]) -> Option<String> {
        match raw {
            [byte] => Some(render(*byte as f64 * self.factor)),
            _ => None,
        }
    }

    fn to_device(&self, value: &str) -> Option<Vec<u8>> {
        let raw = (value.trim().parse::<f64>().ok()? / self.factor).round();
        if !(0.0..=u8::MAX as f64).contains(&raw) {
            return None;
        }
        Some(vec![raw as u8])
    }
}

/// A 0/1 flag rendered as the usual on/off text.
pub struct OnOff;

impl ItemConverter for OnOff {
    fn from_device(&self, raw: &[u8]) -> Option<String> {
        match raw {
            [0] | b"0" => Some("off".into()),
            [1] | b"1" => Some("on".into()),
            _ => None,
        }
    }

    fn to_device(&self, value: &str) -> Option<Vec<u8>> {
        if value.eq_ignore_ascii_case("on") {
            Some(vec![1])
        } else if value.eq_ignore_ascii_case("off") {
            Some(vec![0])
        } else {
            None
        }
    }
}

/// Device reports minutes, the published variable is in seconds.
pub struct MinutesToSeconds;

impl ItemConverter for MinutesToSeconds {
    fn from_device(&self, raw: &[u8]) -> Option<String> {
        Some(render(parse_ascii_f64(raw)? * 60.0))
    }

    fn to_device(&self, value: &str) -> Option<Vec<u8>> {
        let minutes = (value.trim().parse::<f64>().ok()? / 60.0).round() as i64;
        if minutes < 0 {
            return None;
        }
        Some(format!("{minutes:02}").into_bytes())
    }
}
