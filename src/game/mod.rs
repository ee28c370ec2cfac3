//! Game simulation modules

pub mod actions;
pub mod combat;
pub mod grenades;
pub mod map;
pub mod r#match;
pub mod movement;
pub mod physics;
pub mod player;
pub mod runner;
pub mod snapshot;
pub mod timers;

pub use map::MapDefinition;
pub use r#match::{MatchServer, ProtocolError};
pub use player::PlayerSlot;
pub use runner::{GameMatch, MatchCommand, MatchHandle};

use crate::ws::protocol::ClientMsg;
use uuid::Uuid;

/// Player message received from a bound WebSocket connection
#[derive(Debug, Clone)]
pub struct PlayerInput {
    pub slot: PlayerSlot,
    pub connection_id: Uuid,
    pub msg: ClientMsg,
    pub received_at: u64,
}
