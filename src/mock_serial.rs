//! We use this mocking module in unit tests to emulate a serial link.
//!
//! Replies are scripted per exchange: each `write` call pops the next queued
//! reply and makes it readable, which is how a scripted device "responds" to
//! whatever the driver just sent. Tests drive whole poll cycles this way.

use std::collections::VecDeque;

/// Our mock type used to emulate a serial link.
pub struct MockSerial {
    /// Everything the driver has written, in order.
    written: Vec<u8>,
    /// Bytes currently readable.
    pending: VecDeque<u8>,
    /// Scripted replies, one popped per write call.
    replies: VecDeque<Vec<u8>>,
    /// Number of write calls seen. One unpaced send equals one write.
    writes: usize,
    should_error_on_write: bool,
    should_error_on_read: bool,
}

#[derive(Debug)]
pub enum MockSerialError {
    /// No data available right now.
    WouldBlock,
    /// Generic simulated I/O failure.
    SimulatedError,
}

impl core::fmt::Display for MockSerialError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MockSerialError::WouldBlock => write!(f, "no data available"),
            MockSerialError::SimulatedError => write!(f, "simulated i/o failure"),
        }
    }
}

impl core::error::Error for MockSerialError {}

impl embedded_io::Error for MockSerialError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            MockSerialError::WouldBlock => embedded_io::ErrorKind::TimedOut,
            MockSerialError::SimulatedError => embedded_io::ErrorKind::Other,
        }
    }
}

impl embedded_io::ErrorType for MockSerial {
    type Error = MockSerialError;
}

impl embedded_io::Write for MockSerial {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if self.should_error_on_write {
            return Err(MockSerialError::SimulatedError);
        }
        self.writes += 1;
        self.written.extend_from_slice(buf);
        if let Some(reply) = self.replies.pop_front() {
            self.pending.extend(reply);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        if self.should_error_on_write {
            return Err(MockSerialError::SimulatedError);
        }
        Ok(())
    }
}

impl embedded_io::Read for MockSerial {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.should_error_on_read {
            return Err(MockSerialError::SimulatedError);
        }
        if self.pending.is_empty() {
            return Err(MockSerialError::WouldBlock);
        }
        let mut n = 0;
        while n < buf.len() {
            match self.pending.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl MockSerial {
    pub fn new() -> Self {
        Self {
            written: Vec::new(),
            pending: VecDeque::new(),
            replies: VecDeque::new(),
            writes: 0,
            should_error_on_write: false,
            should_error_on_read: false,
        }
    }

    /// Queue a reply for the next unanswered write.
    pub fn queue_reply(&mut self, data: &[u8]) {
        self.replies.push_back(data.to_vec());
    }

    /// Make bytes readable immediately, without waiting for a write. Used to
    /// emulate stale input from an aborted exchange.
    pub fn set_pending_input(&mut self, data: &[u8]) {
        self.pending.extend(data.iter().copied());
    }

    /// Everything written to the mock link so far.
    pub fn written_data(&self) -> &[u8] {
        &self.written
    }

    /// How many write calls (= unpaced sends) the driver has made.
    pub fn write_count(&self) -> usize {
        self.writes
    }

    pub fn set_write_error(&mut self, should_error: bool) {
        self.should_error_on_write = should_error;
    }

    pub fn set_read_error(&mut self, should_error: bool) {
        self.should_error_on_read = should_error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_io::{Read, Write};

    #[test]
    fn write_records_data_and_releases_reply() {
        let mut mock = MockSerial::new();
        mock.queue_reply(b"pong");

        mock.write(b"ping").unwrap();
        assert_eq!(mock.written_data(), b"ping");

        let mut buf = [0u8; 8];
        let n = mock.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[test]
    fn read_blocks_when_no_reply_queued() {
        let mut mock = MockSerial::new();
        mock.write(b"ping").unwrap();

        let mut buf = [0u8; 8];
        assert!(matches!(
            mock.read(&mut buf),
            Err(MockSerialError::WouldBlock)
        ));
    }

    #[test]
    fn replies_are_consumed_in_order() {
        let mut mock = MockSerial::new();
        mock.queue_reply(b"first");
        mock.queue_reply(b"second");

        let mut buf = [0u8; 16];
        mock.write(b"a").unwrap();
        let n = mock.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"first");

        mock.write(b"b").unwrap();
        let n = mock.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"second");

        assert_eq!(mock.write_count(), 2);
    }

    #[test]
    fn partial_reads_drain_pending_bytes() {
        let mut mock = MockSerial::new();
        mock.queue_reply(b"abcdef");
        mock.write(b"x").unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(mock.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(mock.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
    }

    #[test]
    fn errors_are_real_error_types() {
        // embedded_io::Error requires core::error::Error, so the mock's
        // errors must render and source like any other.
        let e: &dyn core::error::Error = &MockSerialError::WouldBlock;
        assert_eq!(e.to_string(), "no data available");
        assert_eq!(
            MockSerialError::SimulatedError.to_string(),
            "simulated i/o failure"
        );
    }

    #[test]
    fn error_flags_simulate_failures() {
        let mut mock = MockSerial::new();
        mock.set_write_error(true);
        assert!(mock.write(b"x").is_err());
        assert!(mock.flush().is_err());

        mock.set_write_error(false);
        mock.set_read_error(true);
        let mut buf = [0u8; 4];
        assert!(mock.read(&mut buf).is_err());
    }
}
