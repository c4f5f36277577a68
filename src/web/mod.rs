mod error;
pub mod handlers;
pub mod server;

pub use handlers::AppState;
pub use server::run_server;
