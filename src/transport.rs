//! Byte-level link handling: paced sends, deadline-bounded receives.
//!
//! Anything implementing [embedded_io::Read] + [embedded_io::Write] can sit
//! behind a [Transport]: a real serial port (see [crate::serial]) or the mock
//! link used in unit tests. The underlying link is expected to return
//! immediately with an [embedded_io::ErrorKind::TimedOut]-kind error when no
//! bytes are available; all waiting happens here, bounded by an absolute
//! deadline.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Pause between polls of an empty link while waiting for a reply.
const RECEIVE_POLL: Duration = Duration::from_millis(5);

/// Upper bound on drain iterations, in case a chattering device never shuts up.
const DRAIN_ROUNDS: usize = 32;

/// One exclusively-owned byte link to the device.
pub struct Transport<S: embedded_io::Read + embedded_io::Write> {
    link: S,
    /// Absolute deadline for a whole receive, measured from the call.
    timeout: Duration,
    /// Per-byte pacing delay. Zero writes the whole buffer in one go. Some
    /// UPS firmware drops bytes arriving faster than its UART ISR can drain,
    /// so sends can be slowed to one byte per delay tick.
    char_delay: Duration,
}

impl<S: embedded_io::Read + embedded_io::Write> Transport<S> {
    pub fn new(link: S, timeout: Duration) -> Self {
        Self {
            link,
            timeout,
            char_delay: Duration::ZERO,
        }
    }

    /// Configure per-byte pacing for slow devices.
    pub fn with_char_delay(mut self, delay: Duration) -> Self {
        self.char_delay = delay;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Access the underlying link, e.g. to script the mock in tests.
    pub fn link_mut(&mut self) -> &mut S {
        &mut self.link
    }

    /// Discard whatever is sitting in the input buffer, e.g. the tail of a
    /// previous aborted exchange.
    fn drain(&mut self) -> Result<(), S::Error> {
        let mut scratch = [0u8; 64];
        for _ in 0..DRAIN_ROUNDS {
            match self.link.read(&mut scratch) {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    tracing::trace!(discarded = n, "drained stale bytes before send");
                }
                Err(e) if is_would_block(&e) => return Ok(()),
                Err(e) => return Err(Error::DeviceGone(e)),
            }
        }
        Ok(())
    }

    /// Send a fully framed request. Stale input is discarded first so a
    /// half-read answer from a previous exchange cannot be mistaken for the
    /// reply to this one.
    pub fn send(&mut self, bytes: &[u8]) -> Result<usize, S::Error> {
        self.drain()?;

        if self.char_delay.is_zero() {
            self.link.write_all(bytes).map_err(Error::DeviceGone)?;
        } else {
            for byte in bytes {
                self.link
                    .write_all(core::slice::from_ref(byte))
                    .map_err(Error::DeviceGone)?;
                std::thread::sleep(self.char_delay);
            }
        }
        self.link.flush().map_err(Error::DeviceGone)?;
        tracing::trace!(len = bytes.len(), "sent frame");
        Ok(bytes.len())
    }

    /// Receive exactly `want` bytes, or fail at the deadline.
    ///
    /// Returns [Error::Timeout] when nothing at all arrived and
    /// [Error::ShortRead] when the reply broke off partway.
    pub fn receive_exact(&mut self, want: usize) -> Result<Vec<u8>, S::Error> {
        let deadline = Instant::now() + self.timeout;
        let mut answer = Vec::with_capacity(want);
        let mut scratch = [0u8; 64];

        while answer.len() < want {
            let room = want - answer.len();
            let slot = &mut scratch[..room.min(64)];
            match self.link.read(slot) {
                Ok(0) => {}
                Ok(n) => {
                    answer.extend_from_slice(&slot[..n]);
                    continue;
                }
                Err(e) if is_would_block(&e) => {}
                Err(e) => return Err(Error::DeviceGone(e)),
            }
            if Instant::now() >= deadline {
                return if answer.is_empty() {
                    Err(Error::Timeout)
                } else {
                    Err(Error::ShortRead {
                        expected: want,
                        got: answer.len(),
                    })
                };
            }
            std::thread::sleep(RECEIVE_POLL);
        }
        Ok(answer)
    }

    /// Receive up to and including `terminator`, or fail at the deadline.
    /// `max` bounds the answer so a babbling device cannot grow the buffer
    /// forever.
    pub fn receive_until(&mut self, terminator: u8, max: usize) -> Result<Vec<u8>, S::Error> {
        let deadline = Instant::now() + self.timeout;
        let mut answer = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            match self.link.read(&mut byte) {
                Ok(1) => {
                    answer.push(byte[0]);
                    if byte[0] == terminator {
                        return Ok(answer);
                    }
                    if answer.len() >= max {
                        return Err(Error::Malformed("answer exceeds maximum length"));
                    }
                    continue;
                }
                Ok(_) => {}
                Err(e) if is_would_block(&e) => {}
                Err(e) => return Err(Error::DeviceGone(e)),
            }
            if Instant::now() >= deadline {
                return if answer.is_empty() {
                    Err(Error::Timeout)
                } else {
                    Err(Error::ShortRead {
                        expected: answer.len() + 1,
                        got: answer.len(),
                    })
                };
            }
            std::thread::sleep(RECEIVE_POLL);
        }
    }
}

/// "No bytes right now" as opposed to a real I/O failure.
fn is_would_block(e: &impl embedded_io::Error) -> bool {
    matches!(
        e.kind(),
        embedded_io::ErrorKind::TimedOut | embedded_io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_serial::MockSerial;

    fn transport(mock: MockSerial) -> Transport<MockSerial> {
        Transport::new(mock, Duration::from_millis(20))
    }

    #[test]
    fn send_writes_whole_frame() {
        let mut t = transport(MockSerial::new());
        t.send(b"Q1\r").unwrap();
        assert_eq!(t.link.written_data(), b"Q1\r");
    }

    #[test]
    fn send_discards_stale_input() {
        let mut mock = MockSerial::new();
        mock.set_pending_input(b"leftover");
        let mut t = transport(mock);
        t.send(b"Q1\r").unwrap();
        // The stale bytes must not surface as an answer.
        assert!(matches!(t.receive_exact(1), Err(Error::Timeout)));
    }

    #[test]
    fn receive_exact_assembles_chunks() {
        let mut mock = MockSerial::new();
        mock.queue_reply(b"abcdef");
        let mut t = transport(mock);
        t.send(b"x").unwrap();
        assert_eq!(t.receive_exact(4).unwrap(), b"abcd");
        assert_eq!(t.receive_exact(2).unwrap(), b"ef");
    }

    #[test]
    fn receive_exact_times_out_on_silence() {
        let mut t = transport(MockSerial::new());
        assert!(matches!(t.receive_exact(4), Err(Error::Timeout)));
    }

    #[test]
    fn receive_exact_reports_short_read() {
        let mut mock = MockSerial::new();
        mock.queue_reply(b"ab");
        let mut t = transport(mock);
        t.send(b"x").unwrap();
        match t.receive_exact(5) {
            Err(Error::ShortRead { expected: 5, got: 2 }) => {}
            other => panic!("expected short read, got {other:?}"),
        }
    }

    #[test]
    fn receive_until_stops_at_terminator() {
        let mut mock = MockSerial::new();
        mock.queue_reply(b"#226.0\rtrailing");
        let mut t = transport(mock);
        t.send(b"x").unwrap();
        assert_eq!(t.receive_until(b'\r', 64).unwrap(), b"#226.0\r");
    }

    #[test]
    fn receive_until_rejects_oversized_answer() {
        let mut mock = MockSerial::new();
        mock.queue_reply(b"aaaaaaaaaa");
        let mut t = transport(mock);
        t.send(b"x").unwrap();
        assert!(matches!(
            t.receive_until(b'\r', 4),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn io_failure_maps_to_device_gone() {
        let mut mock = MockSerial::new();
        mock.set_read_error(true);
        let mut t = transport(mock);
        assert!(matches!(t.receive_exact(1), Err(Error::DeviceGone(_))));
    }
}
