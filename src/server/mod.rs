//! WebSocket relay server module
//!
//! Accepts client connections and routes chat, commands, and WebRTC
//! signaling between them through the shared registries.

mod connection;
mod protocol;
mod relay;
mod websocket;

pub use connection::ConnectionCoordinator;
pub use protocol::ServerMessage;
pub use websocket::WebSocketServer;
