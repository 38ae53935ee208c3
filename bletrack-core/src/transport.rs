//! Byte transport boundary for the frame decoder.
//!
//! Concrete bindings (serial device, TCP, files) live in `bletrack-feeder`.
//! `MemoryTransport` replays an in-memory buffer and backs offline decoding
//! and tests.

use crate::types::TransportError;

/// A byte-oriented input that can read one byte or exactly `n` bytes.
pub trait Transport {
    /// Read a single byte. Blocks until one arrives or the read times out.
    fn read_byte(&mut self) -> Result<u8, TransportError>;

    /// Read exactly `n` bytes, or fail with `ShortRead` if fewer arrived.
    fn read_exact_bytes(&mut self, n: usize) -> Result<Vec<u8>, TransportError>;

    /// Release the underlying resource. Later reads fail with `Closed`.
    fn close(&mut self);

    /// Human-readable identifier for logs.
    fn name(&self) -> &str {
        "transport"
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read_byte(&mut self) -> Result<u8, TransportError> {
        (**self).read_byte()
    }

    fn read_exact_bytes(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        (**self).read_exact_bytes(n)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Transport over a fixed byte buffer. End of buffer reads as `Closed`.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    data: Vec<u8>,
    pos: usize,
    closed: bool,
}

impl MemoryTransport {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        MemoryTransport {
            data: data.into(),
            pos: 0,
            closed: false,
        }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Offset of the next unread byte.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Transport for MemoryTransport {
    fn read_byte(&mut self) -> Result<u8, TransportError> {
        if self.closed || self.remaining() == 0 {
            return Err(TransportError::Closed);
        }
        let b = self.data[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_exact_bytes(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        if self.closed || (self.remaining() == 0 && n > 0) {
            return Err(TransportError::Closed);
        }
        let take = n.min(self.remaining());
        let out = self.data[self.pos..self.pos + take].to_vec();
        self.pos += take;
        if take < n {
            return Err(TransportError::ShortRead {
                expected: n,
                actual: take,
            });
        }
        Ok(out)
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_byte_until_closed() {
        let mut t = MemoryTransport::new(vec![1, 2]);
        assert_eq!(t.read_byte().unwrap(), 1);
        assert_eq!(t.read_byte().unwrap(), 2);
        assert!(matches!(t.read_byte(), Err(TransportError::Closed)));
    }

    #[test]
    fn test_read_exact_short() {
        let mut t = MemoryTransport::new(vec![1, 2, 3]);
        assert_eq!(t.read_exact_bytes(2).unwrap(), vec![1, 2]);
        match t.read_exact_bytes(4) {
            Err(TransportError::ShortRead { expected, actual }) => {
                assert_eq!(expected, 4);
                assert_eq!(actual, 1);
            }
            other => panic!("expected short read, got {other:?}"),
        }
        assert!(matches!(t.read_exact_bytes(1), Err(TransportError::Closed)));
    }

    #[test]
    fn test_close_stops_reads() {
        let mut t = MemoryTransport::new(vec![1, 2, 3]);
        t.close();
        assert!(t.is_closed());
        assert!(matches!(t.read_byte(), Err(TransportError::Closed)));
    }

    #[test]
    fn test_boxed_transport() {
        let mut t: Box<dyn Transport> = Box::new(MemoryTransport::new(vec![9]));
        assert_eq!(t.name(), "memory");
        assert_eq!(t.read_byte().unwrap(), 9);
    }
}
