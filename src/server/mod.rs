//! WebSocket server module
//!
//! Accepts connections, authenticates the upgrade and drives each session
//! between the socket and the hub.

mod auth;
mod handler;
mod protocol;
mod websocket;

#[allow(unused_imports)]
pub use auth::*;
#[allow(unused_imports)]
pub use handler::*;
pub use protocol::*;
pub use websocket::*;
