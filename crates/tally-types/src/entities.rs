use crate::{AccountId, Amount, RoomId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Banned,
    Restricted {
        #[serde(with = "chrono::serde::ts_seconds")]
        until: DateTime<Utc>,
    },
}

/// One row per user. The row is the sole owner of its balance; every
/// mutation holds the per-account lock for the full read-validate-commit
/// span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub balance: Amount,
    pub gift_tickets: u32,
    pub status: AccountStatus,
    pub referrer: Option<AccountId>,
    pub referral_count: u32,
    pub successful_referrals: u32,
    pub tasks_completed: u32,
    pub completed_tasks: HashSet<TaskId>,
    pub claimed_milestones: HashSet<u32>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: AccountId, referrer: Option<AccountId>) -> Self {
        Self {
            id,
            balance: Amount::ZERO,
            gift_tickets: 0,
            status: AccountStatus::Active,
            referrer,
            referral_count: 0,
            successful_referrals: 0,
            tasks_completed: 0,
            completed_tasks: HashSet::new(),
            claimed_milestones: HashSet::new(),
            created_at: Utc::now(),
        }
    }

    /// Lazy restriction expiry: an expired restriction reverts to active on
    /// the access that observes it. Returns true if the status changed.
    pub fn refresh_status(&mut self, now: DateTime<Utc>) -> bool {
        match self.status {
            AccountStatus::Restricted { until } if until <= now => {
                self.status = AccountStatus::Active;
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, AccountStatus::Active)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub link: String,
    pub reward: Amount,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Approved,
    Rejected,
}

/// Proof of task completion. Transitions exactly once from pending to a
/// terminal state; re-processing a terminal submission is a benign no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub id: u64,
    pub account: AccountId,
    pub task: TaskId,
    pub text_proof: String,
    /// Opaque blob reference (the bot stored base64 photo payloads).
    pub photo_proof: Option<String>,
    pub status: SubmissionStatus,
    pub reject_reason: Option<String>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Approved,
    Rejected,
}

/// The requested amount is debited at submission time. Rejection refunds
/// that debit; approval has no further ledger effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: u64,
    pub account: AccountId,
    pub amount: Amount,
    pub fee: Amount,
    pub method: String,
    pub details: String,
    pub status: WithdrawalStatus,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeemCode {
    pub code: String,
    pub reward: Amount,
    /// `None` means unlimited uses.
    pub uses_left: Option<u32>,
}

impl RedeemCode {
    pub fn is_exhausted(&self) -> bool {
        matches!(self.uses_left, Some(0))
    }

    pub fn consume_use(&mut self) {
        if let Some(uses) = self.uses_left.as_mut() {
            *uses = uses.saturating_sub(1);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Move {
    Rock,
    Paper,
    Scissors,
}

impl Move {
    pub fn beats(self, other: Move) -> bool {
        matches!(
            (self, other),
            (Move::Rock, Move::Scissors)
                | (Move::Scissors, Move::Paper)
                | (Move::Paper, Move::Rock)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Pending,
    Active,
    Finished,
    Cancelled,
}

impl RoomStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoomStatus::Finished | RoomStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Winner(AccountId),
    Draw,
}

/// A two-player wagered match. The bet is escrowed from the creator at
/// creation and from the opponent at join; only the transition that observes
/// both moves (or a disconnect) settles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameRoom {
    pub id: RoomId,
    pub bet: Amount,
    pub creator: AccountId,
    pub opponent: Option<AccountId>,
    pub status: RoomStatus,
    pub creator_move: Option<Move>,
    pub opponent_move: Option<Move>,
    pub outcome: Option<Outcome>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
}

impl GameRoom {
    pub fn new(id: RoomId, creator: AccountId, bet: Amount) -> Self {
        Self {
            id,
            bet,
            creator,
            opponent: None,
            status: RoomStatus::Pending,
            creator_move: None,
            opponent_move: None,
            outcome: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_participant(&self, account: AccountId) -> bool {
        self.creator == account || self.opponent == Some(account)
    }

    /// The other side of the table, if both seats are filled.
    pub fn opponent_of(&self, account: AccountId) -> Option<AccountId> {
        let opponent = self.opponent?;
        if account == self.creator {
            Some(opponent)
        } else if account == opponent {
            Some(self.creator)
        } else {
            None
        }
    }

    pub fn move_of(&self, account: AccountId) -> Option<Move> {
        if account == self.creator {
            self.creator_move
        } else if self.opponent == Some(account) {
            self.opponent_move
        } else {
            None
        }
    }

    pub fn set_move(&mut self, account: AccountId, mv: Move) {
        if account == self.creator {
            self.creator_move = Some(mv);
        } else if self.opponent == Some(account) {
            self.opponent_move = Some(mv);
        }
    }

    pub fn both_moved(&self) -> bool {
        self.creator_move.is_some() && self.opponent_move.is_some()
    }
}
