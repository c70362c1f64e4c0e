use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use tally_types::{AccountId, Amount, Move, Outcome, RoomId};

/// Events buffered per live room before slow subscribers start losing them.
const ROOM_EVENT_BUFFER: usize = 64;

/// State changes fanned out to every connection registered on a room.
/// Before settlement only the fact that a participant moved is broadcast,
/// never the move itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RoomEvent {
    OpponentJoined {
        room: RoomId,
        opponent: AccountId,
        #[serde(with = "chrono::serde::ts_seconds")]
        timestamp: DateTime<Utc>,
    },

    MoveReceived {
        room: RoomId,
        participant: AccountId,
        #[serde(with = "chrono::serde::ts_seconds")]
        timestamp: DateTime<Utc>,
    },

    Settled {
        room: RoomId,
        creator_move: Move,
        opponent_move: Move,
        outcome: Outcome,
        /// Per-winner payout; on a draw, the refund each side received.
        payout: Amount,
        #[serde(with = "chrono::serde::ts_seconds")]
        timestamp: DateTime<Utc>,
    },

    Forfeited {
        room: RoomId,
        winner: AccountId,
        payout: Amount,
        #[serde(with = "chrono::serde::ts_seconds")]
        timestamp: DateTime<Utc>,
    },

    RoomCancelled {
        room: RoomId,
        reason: String,
        #[serde(with = "chrono::serde::ts_seconds")]
        timestamp: DateTime<Utc>,
    },
}

/// Process-scoped fan-out hub. Channels exist only while a room is live and
/// are rebuilt from nothing on restart; only the room rows themselves are
/// durable.
pub struct RoomRegistry {
    channels: RwLock<HashMap<RoomId, broadcast::Sender<RoomEvent>>>,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Attach a connection to a room, creating the channel on first use.
    pub async fn register(&self, room: RoomId) -> broadcast::Receiver<RoomEvent> {
        let mut channels = self.channels.write().await;
        channels
            .entry(room)
            .or_insert_with(|| broadcast::channel(ROOM_EVENT_BUFFER).0)
            .subscribe()
    }

    /// Fan an event out to everyone on the room. A room nobody is watching
    /// drops the event; that is expected, not an error.
    pub async fn broadcast(&self, room: RoomId, event: RoomEvent) {
        let channels = self.channels.read().await;
        let Some(sender) = channels.get(&room) else {
            debug!(room = %room, "No channel for room, event dropped");
            return;
        };
        match sender.send(event) {
            Ok(subscribers) => {
                debug!(room = %room, subscribers, "Room event broadcast");
            }
            Err(_) => {
                debug!(room = %room, "Room event broadcast but no subscribers listening");
            }
        }
    }

    /// Tear down the channel once the room is terminal. Receivers drain what
    /// was already sent and then observe the stream closing.
    pub async fn close(&self, room: RoomId) {
        let mut channels = self.channels.write().await;
        channels.remove(&room);
    }

    pub async fn live_channels(&self) -> usize {
        self.channels.read().await.len()
    }
}
