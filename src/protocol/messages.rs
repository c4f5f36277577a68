use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// One unit on the wire: either a request from us or the service's reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Call(Call),
    Response(Response),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub id: u64,
    pub payload: CallPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallPayload {
    Login { api_key: String },
    Submit(Submit),
}

impl CallPayload {
    /// The response kind a successful reply to this call must carry.
    pub fn expected_response(&self) -> ResponseKind {
        match self {
            CallPayload::Login { .. } => ResponseKind::Login,
            CallPayload::Submit(_) => ResponseKind::Submit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub payload: ResponsePayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    Login,
    Submit,
    Error { message: String },
}

impl ResponsePayload {
    pub fn kind(&self) -> ResponseKind {
        match self {
            ResponsePayload::Login => ResponseKind::Login,
            ResponsePayload::Submit => ResponseKind::Submit,
            ResponsePayload::Error { .. } => ResponseKind::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ResponseKind {
    Login,
    Submit,
    Error,
}

/// A route segment of one track. `start` is epoch milliseconds and point
/// timestamps are millisecond offsets from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submit {
    /// Track UUID in its hyphenated text form.
    pub uuid: String,
    pub start: i64,
    pub route: Vec<RoutePoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoutePoint {
    pub timestamp: i64,
    pub lat: f64,
    pub lon: f64,
}
