use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use tally_types::{
    Account, AccountId, Amount, GameRoom, RedeemCode, RoomId, Task, TaskId, TaskSubmission,
    Withdrawal,
};

/// Why a balance moved. Every committed mutation appends one entry per
/// affected account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    TaskReward,
    MilestoneBonus,
    InviteReward,
    GiftSent,
    GiftReceived,
    CodeRedeemed,
    BetEscrowed,
    BetPayout,
    BetRefunded,
    WithdrawalDebit,
    WithdrawalRefund,
    ManualAdjust,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub account: AccountId,
    pub counterparty: Option<AccountId>,
    pub amount: Amount,
    pub kind: EntryKind,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
}

/// Identifier spaces handed out by the store. Allocation is monotonic and
/// survives restarts on durable backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdSpace {
    Task,
    Submission,
    Withdrawal,
    Room,
}

/// Durable state surface for the whole reward economy. Account writes go
/// through `put_accounts`, which must apply the batch atomically; this is
/// what makes multi-account operations all-or-nothing.
#[async_trait]
pub trait LedgerStorage: Send + Sync {
    async fn get_account(&self, id: AccountId) -> Result<Option<Account>>;
    async fn put_accounts(&self, accounts: Vec<Account>) -> Result<()>;
    async fn list_accounts(&self) -> Result<Vec<AccountId>>;

    async fn get_code(&self, code: &str) -> Result<Option<RedeemCode>>;
    async fn put_code(&self, code: RedeemCode) -> Result<()>;

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>>;
    async fn put_task(&self, task: Task) -> Result<()>;
    async fn remove_task(&self, id: TaskId) -> Result<()>;
    async fn list_tasks(&self) -> Result<Vec<Task>>;

    async fn get_submission(&self, id: u64) -> Result<Option<TaskSubmission>>;
    async fn put_submission(&self, submission: TaskSubmission) -> Result<()>;

    async fn get_withdrawal(&self, id: u64) -> Result<Option<Withdrawal>>;
    async fn put_withdrawal(&self, withdrawal: Withdrawal) -> Result<()>;

    async fn get_room(&self, id: RoomId) -> Result<Option<GameRoom>>;
    async fn put_room(&self, room: GameRoom) -> Result<()>;
    async fn list_rooms(&self) -> Result<Vec<GameRoom>>;

    async fn append_entries(&self, entries: Vec<LedgerEntry>) -> Result<()>;
    async fn entries_for(&self, account: AccountId) -> Result<Vec<LedgerEntry>>;

    async fn allocate_id(&self, space: IdSpace) -> Result<u64>;
}

type AccountMap = HashMap<AccountId, Account>;

pub struct MemoryStorage {
    accounts: Arc<RwLock<AccountMap>>,
    codes: Arc<RwLock<HashMap<String, RedeemCode>>>,
    tasks: Arc<RwLock<HashMap<TaskId, Task>>>,
    submissions: Arc<RwLock<HashMap<u64, TaskSubmission>>>,
    withdrawals: Arc<RwLock<HashMap<u64, Withdrawal>>>,
    rooms: Arc<RwLock<HashMap<RoomId, GameRoom>>>,
    entries: Arc<RwLock<Vec<LedgerEntry>>>,
    counters: Arc<RwLock<HashMap<IdSpace, u64>>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            accounts: Arc::new(RwLock::new(HashMap::new())),
            codes: Arc::new(RwLock::new(HashMap::new())),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            submissions: Arc::new(RwLock::new(HashMap::new())),
            withdrawals: Arc::new(RwLock::new(HashMap::new())),
            rooms: Arc::new(RwLock::new(HashMap::new())),
            entries: Arc::new(RwLock::new(Vec::new())),
            counters: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl LedgerStorage for MemoryStorage {
    async fn get_account(&self, id: AccountId) -> Result<Option<Account>> {
        let accounts = self.accounts.read().await;
        Ok(accounts.get(&id).cloned())
    }

    async fn put_accounts(&self, batch: Vec<Account>) -> Result<()> {
        let mut accounts = self.accounts.write().await;
        for account in batch {
            info!(
                account = %account.id,
                balance = account.balance.to_value(),
                storage_type = "memory",
                "💾 Account stored"
            );
            accounts.insert(account.id, account);
        }
        Ok(())
    }

    async fn list_accounts(&self) -> Result<Vec<AccountId>> {
        let accounts = self.accounts.read().await;
        Ok(accounts.keys().copied().collect())
    }

    async fn get_code(&self, code: &str) -> Result<Option<RedeemCode>> {
        let codes = self.codes.read().await;
        Ok(codes.get(code).cloned())
    }

    async fn put_code(&self, code: RedeemCode) -> Result<()> {
        let mut codes = self.codes.write().await;
        codes.insert(code.code.clone(), code);
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let tasks = self.tasks.read().await;
        Ok(tasks.get(&id).cloned())
    }

    async fn put_task(&self, task: Task) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        tasks.insert(task.id, task);
        Ok(())
    }

    async fn remove_task(&self, id: TaskId) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        tasks.remove(&id);
        Ok(())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut all: Vec<Task> = tasks.values().cloned().collect();
        all.sort_by_key(|t| t.id);
        Ok(all)
    }

    async fn get_submission(&self, id: u64) -> Result<Option<TaskSubmission>> {
        let submissions = self.submissions.read().await;
        Ok(submissions.get(&id).cloned())
    }

    async fn put_submission(&self, submission: TaskSubmission) -> Result<()> {
        let mut submissions = self.submissions.write().await;
        submissions.insert(submission.id, submission);
        Ok(())
    }

    async fn get_withdrawal(&self, id: u64) -> Result<Option<Withdrawal>> {
        let withdrawals = self.withdrawals.read().await;
        Ok(withdrawals.get(&id).cloned())
    }

    async fn put_withdrawal(&self, withdrawal: Withdrawal) -> Result<()> {
        let mut withdrawals = self.withdrawals.write().await;
        withdrawals.insert(withdrawal.id, withdrawal);
        Ok(())
    }

    async fn get_room(&self, id: RoomId) -> Result<Option<GameRoom>> {
        let rooms = self.rooms.read().await;
        Ok(rooms.get(&id).cloned())
    }

    async fn put_room(&self, room: GameRoom) -> Result<()> {
        let mut rooms = self.rooms.write().await;
        rooms.insert(room.id, room);
        Ok(())
    }

    async fn list_rooms(&self) -> Result<Vec<GameRoom>> {
        let rooms = self.rooms.read().await;
        Ok(rooms.values().cloned().collect())
    }

    async fn append_entries(&self, mut batch: Vec<LedgerEntry>) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.append(&mut batch);
        Ok(())
    }

    async fn entries_for(&self, account: AccountId) -> Result<Vec<LedgerEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| e.account == account || e.counterparty == Some(account))
            .cloned()
            .collect())
    }

    async fn allocate_id(&self, space: IdSpace) -> Result<u64> {
        let mut counters = self.counters.write().await;
        let next = counters.entry(space).or_insert(0);
        *next += 1;
        Ok(*next)
    }
}

#[cfg(feature = "rocksdb")]
pub use self::rocks::RocksDbStorage;

#[cfg(feature = "rocksdb")]
mod rocks {
    use super::*;
    use rocksdb::{IteratorMode, Options, WriteBatch, DB};

    const CF_ACCOUNTS: &str = "accounts";
    const CF_CODES: &str = "codes";
    const CF_TASKS: &str = "tasks";
    const CF_SUBMISSIONS: &str = "submissions";
    const CF_WITHDRAWALS: &str = "withdrawals";
    const CF_ROOMS: &str = "rooms";
    const CF_ENTRIES: &str = "entries";
    const CF_META: &str = "meta";

    /// Durable backend. Values are JSON rows keyed by their identifier;
    /// account batches and the id counters go through `WriteBatch` so a
    /// multi-account commit is atomic on disk as well.
    pub struct RocksDbStorage {
        db: Arc<DB>,
        // Entry keys need a total order; serialized under this lock.
        entry_seq: tokio::sync::Mutex<u64>,
    }

    impl RocksDbStorage {
        pub fn new(path: &str) -> Result<Self> {
            let mut opts = Options::default();
            opts.create_if_missing(true);
            opts.create_missing_column_families(true);

            let cf_names = vec![
                CF_ACCOUNTS,
                CF_CODES,
                CF_TASKS,
                CF_SUBMISSIONS,
                CF_WITHDRAWALS,
                CF_ROOMS,
                CF_ENTRIES,
                CF_META,
            ];

            let db = DB::open_cf(&opts, path, &cf_names)?;

            let entry_seq = {
                let cf = db
                    .cf_handle(CF_META)
                    .ok_or_else(|| anyhow::anyhow!("column family not found: {}", CF_META))?;
                match db.get_cf(cf, b"entry_seq")? {
                    Some(bytes) => u64::from_be_bytes(bytes.as_slice().try_into()?),
                    None => 0,
                }
            };

            Ok(Self {
                db: Arc::new(db),
                entry_seq: tokio::sync::Mutex::new(entry_seq),
            })
        }

        fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
            self.db
                .cf_handle(name)
                .ok_or_else(|| anyhow::anyhow!("column family not found: {}", name))
        }

        fn get_json<T: serde::de::DeserializeOwned>(
            &self,
            cf_name: &str,
            key: &[u8],
        ) -> Result<Option<T>> {
            let cf = self.cf(cf_name)?;
            match self.db.get_cf(cf, key)? {
                Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
                None => Ok(None),
            }
        }

        fn put_json<T: Serialize>(&self, cf_name: &str, key: &[u8], value: &T) -> Result<()> {
            let cf = self.cf(cf_name)?;
            self.db.put_cf(cf, key, serde_json::to_vec(value)?)?;
            Ok(())
        }

        fn scan_json<T: serde::de::DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
            let cf = self.cf(cf_name)?;
            let mut rows = Vec::new();
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (_, value) = item?;
                rows.push(serde_json::from_slice(&value)?);
            }
            Ok(rows)
        }
    }

    #[async_trait]
    impl LedgerStorage for RocksDbStorage {
        async fn get_account(&self, id: AccountId) -> Result<Option<Account>> {
            self.get_json(CF_ACCOUNTS, &id.as_u64().to_be_bytes())
        }

        async fn put_accounts(&self, batch: Vec<Account>) -> Result<()> {
            let cf = self.cf(CF_ACCOUNTS)?;
            let mut write = WriteBatch::default();
            for account in &batch {
                write.put_cf(
                    cf,
                    account.id.as_u64().to_be_bytes(),
                    serde_json::to_vec(account)?,
                );
            }
            self.db.write(write)?;
            Ok(())
        }

        async fn list_accounts(&self) -> Result<Vec<AccountId>> {
            let accounts: Vec<Account> = self.scan_json(CF_ACCOUNTS)?;
            Ok(accounts.into_iter().map(|a| a.id).collect())
        }

        async fn get_code(&self, code: &str) -> Result<Option<RedeemCode>> {
            self.get_json(CF_CODES, code.as_bytes())
        }

        async fn put_code(&self, code: RedeemCode) -> Result<()> {
            self.put_json(CF_CODES, code.code.as_bytes(), &code)
        }

        async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
            self.get_json(CF_TASKS, &id.as_u64().to_be_bytes())
        }

        async fn put_task(&self, task: Task) -> Result<()> {
            self.put_json(CF_TASKS, &task.id.as_u64().to_be_bytes(), &task)
        }

        async fn remove_task(&self, id: TaskId) -> Result<()> {
            let cf = self.cf(CF_TASKS)?;
            self.db.delete_cf(cf, id.as_u64().to_be_bytes())?;
            Ok(())
        }

        async fn list_tasks(&self) -> Result<Vec<Task>> {
            let mut tasks: Vec<Task> = self.scan_json(CF_TASKS)?;
            tasks.sort_by_key(|t| t.id);
            Ok(tasks)
        }

        async fn get_submission(&self, id: u64) -> Result<Option<TaskSubmission>> {
            self.get_json(CF_SUBMISSIONS, &id.to_be_bytes())
        }

        async fn put_submission(&self, submission: TaskSubmission) -> Result<()> {
            self.put_json(CF_SUBMISSIONS, &submission.id.to_be_bytes(), &submission)
        }

        async fn get_withdrawal(&self, id: u64) -> Result<Option<Withdrawal>> {
            self.get_json(CF_WITHDRAWALS, &id.to_be_bytes())
        }

        async fn put_withdrawal(&self, withdrawal: Withdrawal) -> Result<()> {
            self.put_json(CF_WITHDRAWALS, &withdrawal.id.to_be_bytes(), &withdrawal)
        }

        async fn get_room(&self, id: RoomId) -> Result<Option<GameRoom>> {
            self.get_json(CF_ROOMS, &id.as_u64().to_be_bytes())
        }

        async fn put_room(&self, room: GameRoom) -> Result<()> {
            self.put_json(CF_ROOMS, &room.id.as_u64().to_be_bytes(), &room)
        }

        async fn list_rooms(&self) -> Result<Vec<GameRoom>> {
            self.scan_json(CF_ROOMS)
        }

        async fn append_entries(&self, batch: Vec<LedgerEntry>) -> Result<()> {
            let mut seq = self.entry_seq.lock().await;
            let cf = self.cf(CF_ENTRIES)?;
            let meta = self.cf(CF_META)?;
            let mut write = WriteBatch::default();
            for entry in &batch {
                *seq += 1;
                write.put_cf(cf, seq.to_be_bytes(), serde_json::to_vec(entry)?);
            }
            write.put_cf(meta, b"entry_seq", seq.to_be_bytes());
            self.db.write(write)?;
            Ok(())
        }

        async fn entries_for(&self, account: AccountId) -> Result<Vec<LedgerEntry>> {
            let entries: Vec<LedgerEntry> = self.scan_json(CF_ENTRIES)?;
            Ok(entries
                .into_iter()
                .filter(|e| e.account == account || e.counterparty == Some(account))
                .collect())
        }

        async fn allocate_id(&self, space: IdSpace) -> Result<u64> {
            // Reuses the meta lock so concurrent bumps cannot hand out the
            // same id.
            let _guard = self.entry_seq.lock().await;
            let meta = self.cf(CF_META)?;
            let key = format!("id_seq:{}", serde_json::to_string(&space)?);
            let next = match self.db.get_cf(meta, key.as_bytes())? {
                Some(bytes) => u64::from_be_bytes(bytes.as_slice().try_into()?) + 1,
                None => 1,
            };
            self.db.put_cf(meta, key.as_bytes(), next.to_be_bytes())?;
            Ok(next)
        }
    }
}
