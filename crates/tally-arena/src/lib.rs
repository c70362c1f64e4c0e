pub mod engine;
pub mod registry;

pub use engine::{ArenaConfig, ArenaEngine, DisconnectOutcome, MoveOutcome};
pub use registry::{RoomEvent, RoomRegistry};
