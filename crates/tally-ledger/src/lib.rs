pub mod ledger;
pub mod locks;
pub mod storage;

pub use ledger::{AccountSet, Ledger};
pub use locks::LockTable;
pub use storage::{EntryKind, IdSpace, LedgerEntry, LedgerStorage, MemoryStorage};

#[cfg(feature = "rocksdb")]
pub use storage::RocksDbStorage;
