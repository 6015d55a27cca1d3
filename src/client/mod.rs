pub mod controller;
pub mod devices;
pub mod session;
pub mod state;
pub mod transport;

pub use controller::{RoomClient, RoomClientOptions};
pub use state::{AppState, ClientState, StateEvent};
pub use transport::{SignalingTransport, WsSignalingTransport};
