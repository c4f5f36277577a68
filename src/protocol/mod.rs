pub mod codec;
pub mod error;
pub mod messages;
mod session;

pub use error::SessionError;
pub use messages::{Call, CallPayload, Message, ResponseKind, ResponsePayload, RoutePoint, Submit};
pub use session::Session;
