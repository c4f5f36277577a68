mod backoff;
mod buffer;
mod error;

pub use backoff::Backoff;
pub use buffer::ReadBuffer;
pub use error::TransportError;

use log::{debug, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::shutdown::Shutdown;
use crate::status::StatusReporter;

const READ_CHUNK: usize = 4096;

/// Owns the single TCP socket to the collection service together with the
/// bytes read from it but not yet consumed.
///
/// Every fault closes the socket and clears the buffer before it is returned,
/// so a failed transport is always ready for the next `connect`.
pub struct Transport {
    addr: String,
    stream: Option<TcpStream>,
    buffer: ReadBuffer,
    status: StatusReporter,
    shutdown: Shutdown,
}

impl Transport {
    pub fn new(addr: String, status: StatusReporter, shutdown: Shutdown) -> Self {
        status.set_phase("Not yet connected");
        Self {
            addr,
            stream: None,
            buffer: ReadBuffer::new(),
            status,
            shutdown,
        }
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn connect(&mut self) -> Result<(), TransportError> {
        self.close();
        if self.shutdown.is_triggered() {
            return Err(TransportError::Cancelled);
        }

        self.status.set_phase(format!("Connecting to {}", self.addr));
        let mut shutdown = self.shutdown.clone();
        let result = tokio::select! {
            res = TcpStream::connect(self.addr.as_str()) => Some(res),
            _ = shutdown.triggered() => None,
        };

        match result {
            Some(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Unable to disable Nagle on {}: {}", self.addr, e);
                }
                info!("Connected to {}", self.addr);
                self.stream = Some(stream);
                self.status.set_phase("Connected");
                Ok(())
            }
            Some(Err(source)) => Err(self.fault(TransportError::Connect {
                addr: self.addr.clone(),
                source,
            })),
            None => Err(self.fault(TransportError::Cancelled)),
        }
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.stream.is_none() {
            return Err(self.fault(TransportError::NotConnected));
        }
        let mut shutdown = self.shutdown.clone();
        let result = {
            let Some(stream) = self.stream.as_mut() else {
                return Err(TransportError::NotConnected);
            };
            tokio::select! {
                res = stream.write_all(bytes) => Some(res),
                _ = shutdown.triggered() => None,
            }
        };

        match result {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(self.fault(TransportError::Write(e))),
            None => Err(self.fault(TransportError::Cancelled)),
        }
    }

    /// Waits for more bytes, appends them to the buffer and returns the
    /// whole buffered content.
    pub async fn read(&mut self) -> Result<&[u8], TransportError> {
        if self.shutdown.is_triggered() {
            return Err(self.fault(TransportError::Cancelled));
        }
        if self.stream.is_none() {
            return Err(self.fault(TransportError::NotConnected));
        }

        let mut chunk = [0u8; READ_CHUNK];
        let mut shutdown = self.shutdown.clone();
        let result = {
            let Some(stream) = self.stream.as_mut() else {
                return Err(TransportError::NotConnected);
            };
            tokio::select! {
                res = stream.read(&mut chunk) => Some(res),
                _ = shutdown.triggered() => None,
            }
        };

        match result {
            Some(Ok(0)) => Err(self.fault(TransportError::Closed)),
            Some(Ok(n)) => {
                self.buffer.append(&chunk[..n]);
                Ok(self.buffer.as_slice())
            }
            Some(Err(e)) => Err(self.fault(TransportError::Read(e))),
            None => Err(self.fault(TransportError::Cancelled)),
        }
    }

    pub fn buffered(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn consume(&mut self, n: usize) -> Result<(), TransportError> {
        self.buffer.consume_prefix(n)
    }

    /// Drops the socket and any buffered bytes. Safe to call at any time.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("Closing socket to {}", self.addr);
        }
        if !self.buffer.is_empty() {
            debug!("Discarding {} buffered bytes", self.buffer.len());
            self.buffer.clear();
        }
    }

    fn fault(&mut self, err: TransportError) -> TransportError {
        self.close();
        self.status.set_phase(err.to_string());
        err
    }
}
