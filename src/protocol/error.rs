use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum CodecError {
    /// The buffer ends before the record does; read more and retry.
    #[error("truncated buffer")]
    Truncated,
    #[error("failed to parse record: {0}")]
    Corrupt(String),
    #[error("failed to encode record: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}
