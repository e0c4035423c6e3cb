//! WebSocket front end: connection manager, per-session handler and the HTTP
//! router.

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod server;
pub mod session;

pub use client::{ClientSession, NoopObserver, SessionObserver, SessionRegistry};
pub use config::ServerConfig;
pub use error::ServerError;
pub use handler::ConnectionHandler;
pub use server::{build_router, start, AppState, ServerHandle};
