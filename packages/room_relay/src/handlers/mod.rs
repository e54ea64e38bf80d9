pub mod health;
pub mod websocket;

// Re-export all handlers for easy route registration
pub use health::{health_handler, health_live_handler, health_ready_handler, metrics_handler};
pub use websocket::{broker_websocket_handler, client_websocket_handler};
