//! The pluggable wire-protocol abstraction.
//!
//! One [Subdriver] encodes/decodes the actual bytes for one protocol family
//! and carries that family's item table. Selection happens exactly once at
//! startup: a registry of candidates is probed in declared order via
//! [Subdriver::claim] and the first match wins, for the lifetime of the
//! process.

use crate::error::{Error, Result};
use crate::item::Item;
use crate::transport::Transport;

pub trait Subdriver<S: embedded_io::Read + embedded_io::Write> {
    fn name(&self) -> &'static str;

    /// Probe whether the connected device speaks this protocol. May perform
    /// session establishment as a side effect.
    fn claim(&mut self, link: &mut Transport<S>) -> bool;

    /// The ordered mapping table for this protocol family. Taken once after
    /// a successful claim; the engine owns the rows from then on.
    fn items(&self) -> Vec<Item>;

    /// One full encode/exchange/decode round trip for a command descriptor,
    /// returning the decoded answer payload. The protocol's rejected marker
    /// maps to [Error::Rejected], a broken envelope to [Error::Malformed].
    fn round_trip(&mut self, link: &mut Transport<S>, command: &[u8])
    -> Result<Vec<u8>, S::Error>;

    /// Whether this answer is the protocol's "write accepted, no further
    /// data" marker.
    fn accepted(&self, answer: &[u8]) -> bool;

    /// Ask the device whether it supports an instant command, without
    /// executing it. Protocols with no capability query report everything
    /// declared in their table as supported.
    fn probe_command(
        &mut self,
        link: &mut Transport<S>,
        command: &[u8],
    ) -> Result<bool, S::Error> {
        let _ = (link, command);
        Ok(true)
    }
}

/// Try each candidate's claim in declared order; first match wins. A forced
/// name restricts the probe to that one subdriver.
pub fn claim_subdriver<S: embedded_io::Read + embedded_io::Write>(
    link: &mut Transport<S>,
    candidates: Vec<Box<dyn Subdriver<S>>>,
    forced: Option<&str>,
) -> Result<Box<dyn Subdriver<S>>, S::Error> {
    for mut candidate in candidates {
        if let Some(name) = forced {
            if candidate.name() != name {
                continue;
            }
        }
        tracing::debug!(subdriver = candidate.name(), "probing");
        if candidate.claim(link) {
            tracing::info!(subdriver = candidate.name(), "device claimed");
            return Ok(candidate);
        }
    }
    Err(Error::NotClaimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_serial::MockSerial;
    use std::time::Duration;

    struct Dummy {
        name: &'static str,
        claims: bool,
    }

    impl Subdriver<MockSerial> for Dummy {
        fn name(&self) -> &'static str {
            self.name
        }
        fn claim(&mut self, _link: &mut Transport<MockSerial>) -> bool {
            self.claims
        }
        fn items(&self) -> Vec<Item> {
            Vec::new()
        }
        fn round_trip(
            &mut self,
            _link: &mut Transport<MockSerial>,
            _command: &[u8],
        ) -> Result<Vec<u8>, <MockSerial as embedded_io::ErrorType>::Error> {
            Ok(Vec::new())
        }
        fn accepted(&self, _answer: &[u8]) -> bool {
            true
        }
    }

    fn link() -> Transport<MockSerial> {
        Transport::new(MockSerial::new(), Duration::from_millis(10))
    }

    #[test]
    fn first_claiming_candidate_wins() {
        let mut l = link();
        let picked = claim_subdriver(
            &mut l,
            vec![
                Box::new(Dummy { name: "first", claims: false }),
                Box::new(Dummy { name: "second", claims: true }),
                Box::new(Dummy { name: "third", claims: true }),
            ],
            None,
        )
        .unwrap();
        assert_eq!(picked.name(), "second");
    }

    #[test]
    fn forced_name_skips_other_candidates() {
        let mut l = link();
        let picked = claim_subdriver(
            &mut l,
            vec![
                Box::new(Dummy { name: "first", claims: true }),
                Box::new(Dummy { name: "second", claims: true }),
            ],
            Some("second"),
        )
        .unwrap();
        assert_eq!(picked.name(), "second");
    }

    #[test]
    fn nothing_claims_is_an_error() {
        let mut l = link();
        let result = claim_subdriver(
            &mut l,
            vec![Box::new(Dummy { name: "first", claims: false })],
            None,
        );
        assert!(matches!(result, Err(Error::NotClaimed)));
    }
}
