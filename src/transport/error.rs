use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unable to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("socket error while reading: {0}")]
    Read(#[source] std::io::Error),
    #[error("send failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("connection closed by peer")]
    Closed,
    #[error("socket disconnected")]
    NotConnected,
    #[error("interrupted by shutdown")]
    Cancelled,
    #[error("cannot consume {requested} bytes, only {available} buffered")]
    BufferUnderflow { requested: usize, available: usize },
}
