use thiserror::Error;

use crate::protocol::{ResponseKind, SessionError};
use crate::routecache::RouteCacheError;

/// Faults that end the current connection. None of them stop the connector.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("received response with wrong call id: expected {expected} but got {got}")]
    CallIdMismatch { expected: u64, got: u64 },
    #[error("received response for wrong method: expected {expected} but got {got}")]
    WrongResponse {
        expected: ResponseKind,
        got: ResponseKind,
    },
    #[error("received call {id} where a response was expected")]
    UnexpectedCall { id: u64 },
    #[error("server error: {0}")]
    Remote(String),
    #[error("route cache error: {0}")]
    Storage(#[from] RouteCacheError),
    #[error("background task failed: {0}")]
    Task(String),
    #[error("connector cancelled")]
    Cancelled,
}
