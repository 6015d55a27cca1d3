pub mod coordinator;
pub mod registry;

pub use coordinator::{compute_max_bitrate, Room};
pub use registry::RoomRegistry;
