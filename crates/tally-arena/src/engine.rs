use crate::registry::{RoomEvent, RoomRegistry};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

use tally_ledger::{EntryKind, IdSpace, Ledger, LedgerStorage};
use tally_types::{
    AccountId, Amount, GameRoom, Move, Notifier, Outcome, Result, RoomId, RoomStatus, TallyError,
};

#[derive(Debug, Clone)]
pub struct ArenaConfig {
    pub min_bet: Amount,
    /// Share of the pot withheld at settlement. Withheld value is burned,
    /// matching the gift fee model.
    pub fee_percent: f64,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            min_bet: Amount::from_value(10.0),
            fee_percent: 0.10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Recorded,
    Settled(Outcome),
    /// Duplicate move message or a move on an already-settled room.
    AlreadyProcessed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    CreatorRefunded,
    Forfeited { winner: AccountId, payout: Amount },
    /// Terminal room, unknown room, or a bystander: nothing to do.
    Ignored,
}

/// The wagered-match state machine. Live rooms are held in memory and
/// mirrored to storage on every transition; settlement happens under the
/// room-table write lock, so exactly one transition observes both moves and
/// pays out.
pub struct ArenaEngine {
    ledger: Arc<Ledger>,
    storage: Arc<dyn LedgerStorage>,
    registry: Arc<RoomRegistry>,
    notifier: Arc<dyn Notifier>,
    config: ArenaConfig,
    rooms: RwLock<HashMap<RoomId, GameRoom>>,
}

impl ArenaEngine {
    /// Restores non-terminal rooms from storage. Connection lists are not
    /// restored; they are process-scoped.
    pub async fn new(
        ledger: Arc<Ledger>,
        registry: Arc<RoomRegistry>,
        notifier: Arc<dyn Notifier>,
        config: ArenaConfig,
    ) -> Result<Self> {
        let storage = ledger.storage();
        let mut rooms = HashMap::new();
        for room in storage.list_rooms().await.map_err(TallyError::storage)? {
            if !room.status.is_terminal() {
                rooms.insert(room.id, room);
            }
        }
        if !rooms.is_empty() {
            info!(open_rooms = rooms.len(), "🎲 Arena restored open rooms");
        }
        Ok(Self {
            ledger,
            storage,
            registry,
            notifier,
            config,
            rooms: RwLock::new(rooms),
        })
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// Open a room, escrowing the creator's bet.
    pub async fn create(&self, creator: AccountId, bet: Amount) -> Result<GameRoom> {
        if bet < self.config.min_bet {
            return Err(TallyError::InvalidRequest(format!(
                "minimum bet is {}",
                self.config.min_bet
            )));
        }

        let id = RoomId::new(
            self.storage
                .allocate_id(IdSpace::Room)
                .await
                .map_err(TallyError::storage)?,
        );

        self.ledger
            .with_accounts(&[creator], |set| {
                set.require_active(creator)?;
                set.debit(creator, bet, EntryKind::BetEscrowed)
            })
            .await?;

        let room = GameRoom::new(id, creator, bet);

        self.storage
            .put_room(room.clone())
            .await
            .map_err(TallyError::storage)?;
        self.rooms.write().await.insert(id, room.clone());

        info!(room = %id, creator = %creator, bet = bet.to_value(), "🎲 Room created");
        Ok(room)
    }

    /// Join a pending room, escrowing the opponent's bet and activating the
    /// match.
    pub async fn join(&self, opponent: AccountId, room_id: RoomId) -> Result<GameRoom> {
        let mut rooms = self.rooms.write().await;
        let room = match rooms.get_mut(&room_id) {
            Some(room) => room,
            None => {
                return Err(TallyError::RoomNotAvailable(
                    room_id,
                    self.unavailable_reason(room_id).await?,
                ))
            }
        };

        if room.status != RoomStatus::Pending {
            return Err(TallyError::RoomNotAvailable(
                room_id,
                "room is not open for joining".into(),
            ));
        }
        if room.creator == opponent {
            return Err(TallyError::InvalidRequest(
                "cannot join your own room".into(),
            ));
        }

        let bet = room.bet;
        self.ledger
            .with_accounts(&[opponent], |set| {
                set.require_active(opponent)?;
                set.debit(opponent, bet, EntryKind::BetEscrowed)
            })
            .await?;

        room.opponent = Some(opponent);
        room.status = RoomStatus::Active;
        self.storage
            .put_room(room.clone())
            .await
            .map_err(TallyError::storage)?;

        let creator = room.creator;
        let snapshot = room.clone();
        drop(rooms);

        self.registry
            .broadcast(
                room_id,
                RoomEvent::OpponentJoined {
                    room: room_id,
                    opponent,
                    timestamp: Utc::now(),
                },
            )
            .await;
        self.notifier
            .notify(creator, "An opponent joined your room, make your move")
            .await;
        self.notifier
            .notify(opponent, "You joined the room, make your move")
            .await;

        info!(room = %room_id, opponent = %opponent, "🎲 Room active");
        Ok(snapshot)
    }

    /// Record a move. The transition that observes both moves settles the
    /// match; a duplicate move, or a move on a terminal room, is a benign
    /// no-op.
    pub async fn submit_move(
        &self,
        participant: AccountId,
        room_id: RoomId,
        mv: Move,
    ) -> Result<MoveOutcome> {
        let mut rooms = self.rooms.write().await;
        let room = match rooms.get_mut(&room_id) {
            Some(room) => room,
            None => {
                // Terminal rooms leave the live table; duplicates against
                // them are no-ops, anything else is unavailable.
                return if self.terminal_room(room_id).await?.is_some() {
                    Ok(MoveOutcome::AlreadyProcessed)
                } else {
                    Err(TallyError::RoomNotAvailable(room_id, "no such room".into()))
                };
            }
        };

        if room.status != RoomStatus::Active {
            return Err(TallyError::RoomNotAvailable(
                room_id,
                "room is not in play".into(),
            ));
        }
        if !room.is_participant(participant) {
            return Err(TallyError::InvalidRequest(
                "not a participant of this room".into(),
            ));
        }
        if room.move_of(participant).is_some() {
            return Ok(MoveOutcome::AlreadyProcessed);
        }

        room.set_move(participant, mv);
        self.registry
            .broadcast(
                room_id,
                RoomEvent::MoveReceived {
                    room: room_id,
                    participant,
                    timestamp: Utc::now(),
                },
            )
            .await;

        if !room.both_moved() {
            self.storage
                .put_room(room.clone())
                .await
                .map_err(TallyError::storage)?;
            return Ok(MoveOutcome::Recorded);
        }

        let outcome = self.settle(room).await?;
        rooms.remove(&room_id);
        Ok(MoveOutcome::Settled(outcome))
    }

    /// Connection loss is a defined transition, not an error: a pending
    /// room's creator gets refunded, an active match forfeits to the side
    /// that stayed, a terminal room ignores it.
    pub async fn disconnect(
        &self,
        participant: AccountId,
        room_id: RoomId,
    ) -> Result<DisconnectOutcome> {
        let mut rooms = self.rooms.write().await;
        let room = match rooms.get_mut(&room_id) {
            Some(room) => room,
            None => return Ok(DisconnectOutcome::Ignored),
        };
        if !room.is_participant(participant) {
            return Ok(DisconnectOutcome::Ignored);
        }

        match room.status {
            RoomStatus::Pending => {
                if participant != room.creator {
                    return Ok(DisconnectOutcome::Ignored);
                }
                let bet = room.bet;
                let creator = room.creator;
                room.status = RoomStatus::Cancelled;
                self.storage
                    .put_room(room.clone())
                    .await
                    .map_err(TallyError::storage)?;
                self.ledger
                    .credit(creator, bet, EntryKind::BetRefunded)
                    .await?;
                rooms.remove(&room_id);
                drop(rooms);

                self.registry
                    .broadcast(
                        room_id,
                        RoomEvent::RoomCancelled {
                            room: room_id,
                            reason: "creator left before an opponent joined".into(),
                            timestamp: Utc::now(),
                        },
                    )
                    .await;
                self.registry.close(room_id).await;
                info!(room = %room_id, creator = %creator, "🎲 Pending room cancelled, bet refunded");
                Ok(DisconnectOutcome::CreatorRefunded)
            }
            RoomStatus::Active => {
                let winner = match room.opponent_of(participant) {
                    Some(winner) => winner,
                    None => return Ok(DisconnectOutcome::Ignored),
                };
                let payout = self.payout_for(room.bet);
                room.status = RoomStatus::Cancelled;
                room.outcome = Some(Outcome::Winner(winner));
                self.storage
                    .put_room(room.clone())
                    .await
                    .map_err(TallyError::storage)?;
                self.ledger
                    .credit(winner, payout, EntryKind::BetPayout)
                    .await?;
                rooms.remove(&room_id);
                drop(rooms);

                self.registry
                    .broadcast(
                        room_id,
                        RoomEvent::Forfeited {
                            room: room_id,
                            winner,
                            payout,
                            timestamp: Utc::now(),
                        },
                    )
                    .await;
                self.registry.close(room_id).await;
                self.notifier
                    .notify(winner, &format!("Your opponent left, you win {payout}"))
                    .await;
                info!(room = %room_id, winner = %winner, payout = payout.to_value(), "🎲 Match forfeited");
                Ok(DisconnectOutcome::Forfeited { winner, payout })
            }
            RoomStatus::Finished | RoomStatus::Cancelled => Ok(DisconnectOutcome::Ignored),
        }
    }

    /// Attach a connection to a live room's event stream. Terminal and
    /// unknown rooms are refused; reconnection is not supported.
    pub async fn subscribe(&self, room_id: RoomId) -> Result<broadcast::Receiver<RoomEvent>> {
        let rooms = self.rooms.read().await;
        if !rooms.contains_key(&room_id) {
            return Err(TallyError::RoomNotAvailable(
                room_id,
                self.unavailable_reason(room_id).await?,
            ));
        }
        drop(rooms);
        Ok(self.registry.register(room_id).await)
    }

    /// Current room state, live or settled.
    pub async fn room(&self, room_id: RoomId) -> Result<GameRoom> {
        if let Some(room) = self.rooms.read().await.get(&room_id) {
            return Ok(room.clone());
        }
        self.storage
            .get_room(room_id)
            .await
            .map_err(TallyError::storage)?
            .ok_or_else(|| TallyError::RoomNotAvailable(room_id, "no such room".into()))
    }

    pub async fn open_rooms(&self) -> Vec<GameRoom> {
        let rooms = self.rooms.read().await;
        rooms
            .values()
            .filter(|r| r.status == RoomStatus::Pending)
            .cloned()
            .collect()
    }

    fn payout_for(&self, bet: Amount) -> Amount {
        let pot = bet.saturating_add(bet);
        pot.percent_of(1.0 - self.config.fee_percent)
    }

    async fn settle(&self, room: &mut GameRoom) -> Result<Outcome> {
        let (Some(creator_move), Some(opponent_move), Some(opponent)) =
            (room.creator_move, room.opponent_move, room.opponent)
        else {
            return Err(TallyError::RoomNotAvailable(
                room.id,
                "room is not ready to settle".into(),
            ));
        };
        let creator = room.creator;
        let bet = room.bet;

        let (outcome, payout) = if creator_move == opponent_move {
            (Outcome::Draw, bet)
        } else {
            let winner = if creator_move.beats(opponent_move) {
                creator
            } else {
                opponent
            };
            (Outcome::Winner(winner), self.payout_for(bet))
        };

        // The terminal row must be durable before any payout. A fault
        // between the two loses at most one payout; it can never leave a
        // live room behind that settles again after a restart.
        room.status = RoomStatus::Finished;
        room.outcome = Some(outcome);
        self.storage
            .put_room(room.clone())
            .await
            .map_err(TallyError::storage)?;

        match outcome {
            // Draw: both bets come straight back, nothing is burned.
            Outcome::Draw => {
                self.ledger
                    .with_accounts(&[creator, opponent], |set| {
                        set.credit(creator, bet, EntryKind::BetRefunded)?;
                        set.credit(opponent, bet, EntryKind::BetRefunded)
                    })
                    .await?;
            }
            Outcome::Winner(winner) => {
                self.ledger
                    .credit(winner, payout, EntryKind::BetPayout)
                    .await?;
            }
        }

        self.registry
            .broadcast(
                room.id,
                RoomEvent::Settled {
                    room: room.id,
                    creator_move,
                    opponent_move,
                    outcome,
                    payout,
                    timestamp: Utc::now(),
                },
            )
            .await;
        self.registry.close(room.id).await;

        for (me, my_move, their_move) in [
            (creator, creator_move, opponent_move),
            (opponent, opponent_move, creator_move),
        ] {
            let message = match outcome {
                Outcome::Draw => format!(
                    "Draw: you both played {:?}. Your bet of {bet} was refunded",
                    my_move
                ),
                Outcome::Winner(winner) if winner == me => format!(
                    "You played {:?}, your opponent played {:?}: you win {payout}",
                    my_move, their_move
                ),
                Outcome::Winner(_) => format!(
                    "You played {:?}, your opponent played {:?}: you lose your bet of {bet}",
                    my_move, their_move
                ),
            };
            self.notifier.notify(me, &message).await;
        }

        info!(
            room = %room.id,
            outcome = ?outcome,
            payout = payout.to_value(),
            "🎲 Match settled"
        );
        Ok(outcome)
    }

    async fn terminal_room(&self, room_id: RoomId) -> Result<Option<GameRoom>> {
        let room = self
            .storage
            .get_room(room_id)
            .await
            .map_err(TallyError::storage)?;
        Ok(room.filter(|r| r.status.is_terminal()))
    }

    async fn unavailable_reason(&self, room_id: RoomId) -> Result<String> {
        Ok(if self.terminal_room(room_id).await?.is_some() {
            "room is no longer active".into()
        } else {
            "no such room".into()
        })
    }
}
