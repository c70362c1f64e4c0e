use crate::{AccountId, Amount, RoomId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TallyError {
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("account {0} is not active")]
    AccountNotActive(AccountId),

    #[error("insufficient funds for account {account}: has {has}, needs {needs}")]
    InsufficientFunds {
        account: AccountId,
        has: Amount,
        needs: Amount,
    },

    #[error("account {account} has {has} gift tickets, needs {needs}")]
    InsufficientTickets {
        account: AccountId,
        has: u32,
        needs: u32,
    },

    #[error("invalid or exhausted code: {0}")]
    InvalidOrExhaustedCode(String),

    #[error("room {0} is not available: {1}")]
    RoomNotAvailable(RoomId, String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl TallyError {
    /// Backends report `anyhow::Error`; engines fold it into the taxonomy
    /// without leaking backend detail into callers.
    pub fn storage(e: anyhow::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TallyError>;
