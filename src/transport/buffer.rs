use super::error::TransportError;

/// Bytes received from the socket that have not been decoded yet.
#[derive(Debug, Default)]
pub struct ReadBuffer {
    bytes: Vec<u8>,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    /// Drops the first `n` bytes. Asking for more than is buffered is a bug
    /// in the caller and leaves the buffer untouched.
    pub fn consume_prefix(&mut self, n: usize) -> Result<(), TransportError> {
        if n > self.bytes.len() {
            return Err(TransportError::BufferUnderflow {
                requested: n,
                available: self.bytes.len(),
            });
        }
        self.bytes.drain(..n);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}
