pub mod amount;
pub mod entities;
pub mod error;
pub mod id;
pub mod notify;

pub use amount::{Amount, TALLY_BASE_UNIT, TALLY_DECIMALS};
pub use entities::{
    Account, AccountStatus, GameRoom, Move, Outcome, RedeemCode, RoomStatus, SubmissionStatus,
    Task, TaskSubmission, Withdrawal, WithdrawalStatus,
};
pub use error::{Result, TallyError};
pub use id::{AccountId, RoomId, TaskId};
pub use notify::{LogNotifier, NoopNotifier, Notifier};
