//! Client Gateway
//!
//! WebSocket front door for chat clients. Maps client frames onto the room
//! multiplexer, credentials, presence and history.

mod events;
mod handler;
pub mod protocol;

pub use events::Gateway;
pub use handler::handle_client_ws;
