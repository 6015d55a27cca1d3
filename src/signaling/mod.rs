pub mod messages;
pub mod server;

pub use messages::{ClientMessage, ServerMessage};
pub use server::{Connection, SignalingServer, WsConnection};
