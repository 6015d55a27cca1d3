pub mod client;
pub mod config;
pub mod engine;
pub mod monitoring;
pub mod peer;
pub mod room;
pub mod signaling;
pub mod types;
pub mod utils;

// Re-export main types for convenience
pub use config::ServerConfig;
pub use room::{Room, RoomRegistry};
pub use signaling::SignalingServer;
