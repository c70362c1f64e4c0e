use crate::locks::LockTable;
use crate::storage::{EntryKind, LedgerEntry, LedgerStorage};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use tally_types::{Account, AccountId, Amount, RedeemCode, Result, TallyError};

/// The account rows loaded for one atomic mutation. The closure passed to
/// [`Ledger::with_accounts`] mutates these in-memory copies; nothing reaches
/// storage unless the closure returns `Ok`.
pub struct AccountSet {
    accounts: BTreeMap<AccountId, Account>,
    entries: Vec<LedgerEntry>,
}

impl AccountSet {
    pub fn get(&self, id: AccountId) -> Result<&Account> {
        self.accounts
            .get(&id)
            .ok_or(TallyError::AccountNotFound(id))
    }

    pub fn get_mut(&mut self, id: AccountId) -> Result<&mut Account> {
        self.accounts
            .get_mut(&id)
            .ok_or(TallyError::AccountNotFound(id))
    }

    /// Precondition gate for user-initiated mutations.
    pub fn require_active(&self, id: AccountId) -> Result<()> {
        if self.get(id)?.is_active() {
            Ok(())
        } else {
            Err(TallyError::AccountNotActive(id))
        }
    }

    pub fn credit(&mut self, id: AccountId, amount: Amount, kind: EntryKind) -> Result<()> {
        let account = self.get_mut(id)?;
        let before = account.balance;
        account.balance = before
            .checked_add(amount)
            .ok_or_else(|| TallyError::InvalidRequest("balance overflow".into()))?;
        info!(
            account = %id,
            amount = amount.to_value(),
            balance_before = before.to_value(),
            balance_after = account.balance.to_value(),
            kind = ?kind,
            "💰 Balance credited"
        );
        self.record(id, None, amount, kind);
        Ok(())
    }

    pub fn debit(&mut self, id: AccountId, amount: Amount, kind: EntryKind) -> Result<()> {
        let account = self.get_mut(id)?;
        let before = account.balance;
        account.balance = before
            .checked_sub(amount)
            .ok_or(TallyError::InsufficientFunds {
                account: id,
                has: before,
                needs: amount,
            })?;
        info!(
            account = %id,
            amount = amount.to_value(),
            balance_before = before.to_value(),
            balance_after = account.balance.to_value(),
            kind = ?kind,
            "💸 Balance debited"
        );
        self.record(id, None, amount, kind);
        Ok(())
    }

    pub fn record(
        &mut self,
        account: AccountId,
        counterparty: Option<AccountId>,
        amount: Amount,
        kind: EntryKind,
    ) {
        self.entries.push(LedgerEntry {
            account,
            counterparty,
            amount,
            kind,
            timestamp: Utc::now(),
        });
    }
}

/// Escrow transaction executor: every balance-affecting mutation in the
/// system runs through [`Ledger::with_accounts`], which enforces the lock
/// ordering and all-or-nothing commit the correctness argument rests on.
pub struct Ledger {
    storage: Arc<dyn LedgerStorage>,
    account_locks: LockTable<AccountId>,
    code_locks: LockTable<String>,
}

impl Ledger {
    pub fn new(storage: Arc<dyn LedgerStorage>) -> Self {
        Self {
            storage,
            account_locks: LockTable::new(),
            code_locks: LockTable::new(),
        }
    }

    pub fn storage(&self) -> Arc<dyn LedgerStorage> {
        self.storage.clone()
    }

    /// Run `f` holding exclusive locks on every listed account, acquired in
    /// ascending id order. The closure works on loaded copies; on `Ok` all
    /// rows are persisted as one atomic batch together with the recorded
    /// ledger entries, on `Err` nothing is written.
    pub async fn with_accounts<T>(
        &self,
        ids: &[AccountId],
        f: impl FnOnce(&mut AccountSet) -> Result<T>,
    ) -> Result<T> {
        let _guards = self.account_locks.acquire_ordered(ids).await;

        let mut set = AccountSet {
            accounts: BTreeMap::new(),
            entries: Vec::new(),
        };
        let now = Utc::now();
        for id in ids {
            if set.accounts.contains_key(id) {
                continue;
            }
            let mut account = self
                .storage
                .get_account(*id)
                .await
                .map_err(TallyError::storage)?
                .ok_or(TallyError::AccountNotFound(*id))?;
            if account.refresh_status(now) {
                info!(account = %id, "⏳ Restriction expired, account active again");
            }
            set.accounts.insert(*id, account);
        }

        let out = f(&mut set)?;

        self.storage
            .put_accounts(set.accounts.into_values().collect())
            .await
            .map_err(TallyError::storage)?;
        if !set.entries.is_empty() {
            self.storage
                .append_entries(set.entries)
                .await
                .map_err(TallyError::storage)?;
        }
        Ok(out)
    }

    /// Provisioning hook for the external onboarding flow. Idempotent: an
    /// existing row is returned untouched. A recorded referrer bumps the
    /// referrer's raw referral counter (the paid "successful" counter moves
    /// only through the approval cascade).
    pub async fn open_account(
        &self,
        id: AccountId,
        referrer: Option<AccountId>,
    ) -> Result<Account> {
        let guard = self.account_locks.acquire(&id).await;

        if let Some(existing) = self
            .storage
            .get_account(id)
            .await
            .map_err(TallyError::storage)?
        {
            return Ok(existing);
        }

        // Self-referrals are dropped rather than rejected; onboarding links
        // are attacker-controlled input.
        let referrer = referrer.filter(|r| *r != id);
        let account = Account::new(id, referrer);
        self.storage
            .put_accounts(vec![account.clone()])
            .await
            .map_err(TallyError::storage)?;

        // Release before touching the referrer row: holding both would break
        // the ascending-order lock discipline.
        drop(guard);

        if let Some(referrer_id) = referrer {
            let _referrer_guard = self.account_locks.acquire(&referrer_id).await;
            match self
                .storage
                .get_account(referrer_id)
                .await
                .map_err(TallyError::storage)?
            {
                Some(mut referrer_row) => {
                    referrer_row.referral_count += 1;
                    self.storage
                        .put_accounts(vec![referrer_row])
                        .await
                        .map_err(TallyError::storage)?;
                }
                None => {
                    warn!(account = %id, referrer = %referrer_id, "Referrer does not exist, link kept unpaid");
                }
            }
        }

        info!(account = %id, referrer = ?referrer, "👤 Account opened");
        Ok(account)
    }

    /// Read one account, applying (and persisting) lazy restriction expiry.
    pub async fn account(&self, id: AccountId) -> Result<Account> {
        let _guard = self.account_locks.acquire(&id).await;
        let mut account = self
            .storage
            .get_account(id)
            .await
            .map_err(TallyError::storage)?
            .ok_or(TallyError::AccountNotFound(id))?;
        if account.refresh_status(Utc::now()) {
            info!(account = %id, "⏳ Restriction expired, account active again");
            self.storage
                .put_accounts(vec![account.clone()])
                .await
                .map_err(TallyError::storage)?;
        }
        Ok(account)
    }

    pub async fn require_active(&self, id: AccountId) -> Result<Account> {
        let account = self.account(id).await?;
        if account.is_active() {
            Ok(account)
        } else {
            Err(TallyError::AccountNotActive(id))
        }
    }

    pub async fn credit(&self, id: AccountId, amount: Amount, kind: EntryKind) -> Result<()> {
        if amount.is_zero() {
            return Ok(());
        }
        self.with_accounts(&[id], |set| set.credit(id, amount, kind))
            .await
    }

    pub async fn debit(&self, id: AccountId, amount: Amount, kind: EntryKind) -> Result<()> {
        if amount.is_zero() {
            return Ok(());
        }
        self.with_accounts(&[id], |set| set.debit(id, amount, kind))
            .await
    }

    /// Gift between users. The payer covers `amount + fee`; the payee
    /// receives `amount`; the fee is burned (never credited anywhere, kept
    /// for compatibility with the system this replaces).
    pub async fn transfer_with_fee(
        &self,
        payer: AccountId,
        payee: AccountId,
        amount: Amount,
        fee_percent: f64,
    ) -> Result<Amount> {
        if payer == payee {
            return Err(TallyError::InvalidRequest(
                "cannot gift to the same account".into(),
            ));
        }
        if amount.is_zero() {
            return Err(TallyError::InvalidRequest("gift amount is zero".into()));
        }

        let fee = amount.percent_of(fee_percent);
        let total = amount
            .checked_add(fee)
            .ok_or_else(|| TallyError::InvalidRequest("gift amount overflow".into()))?;

        self.with_accounts(&[payer, payee], |set| {
            set.require_active(payer)?;
            let payer_balance = set.get(payer)?.balance;
            if payer_balance < total {
                return Err(TallyError::InsufficientFunds {
                    account: payer,
                    has: payer_balance,
                    needs: total,
                });
            }
            set.debit(payer, total, EntryKind::GiftSent)?;
            set.credit(payee, amount, EntryKind::GiftReceived)?;
            Ok(())
        })
        .await?;

        info!(
            payer = %payer,
            payee = %payee,
            amount = amount.to_value(),
            fee_burned = fee.to_value(),
            "🎁 Gift transferred"
        );
        Ok(fee)
    }

    /// Redeem a code. The whole operation holds the per-code lock, so a code
    /// with one use left succeeds exactly once under concurrent attempts.
    pub async fn redeem(&self, id: AccountId, code: &str) -> Result<Amount> {
        let _code_guard = self.code_locks.acquire(&code.to_string()).await;

        let mut row = self
            .storage
            .get_code(code)
            .await
            .map_err(TallyError::storage)?
            .ok_or_else(|| TallyError::InvalidOrExhaustedCode(code.to_string()))?;
        if row.is_exhausted() {
            return Err(TallyError::InvalidOrExhaustedCode(code.to_string()));
        }

        let reward = row.reward;
        self.with_accounts(&[id], |set| {
            set.require_active(id)?;
            set.credit(id, reward, EntryKind::CodeRedeemed)
        })
        .await?;

        row.consume_use();
        self.storage
            .put_code(row)
            .await
            .map_err(TallyError::storage)?;

        info!(account = %id, code, reward = reward.to_value(), "🎟️ Code redeemed");
        Ok(reward)
    }

    pub async fn create_code(&self, code: RedeemCode) -> Result<()> {
        let _code_guard = self.code_locks.acquire(&code.code).await;
        if self
            .storage
            .get_code(&code.code)
            .await
            .map_err(TallyError::storage)?
            .is_some()
        {
            return Err(TallyError::InvalidRequest(format!(
                "code already exists: {}",
                code.code
            )));
        }
        self.storage
            .put_code(code)
            .await
            .map_err(TallyError::storage)
    }

    /// Secondary currency: gift tickets. Counter semantics only, no balance
    /// interaction.
    pub async fn grant_tickets(&self, id: AccountId, count: u32) -> Result<()> {
        self.with_accounts(&[id], |set| {
            let account = set.get_mut(id)?;
            account.gift_tickets = account.gift_tickets.saturating_add(count);
            Ok(())
        })
        .await
    }

    pub async fn spend_tickets(&self, id: AccountId, count: u32) -> Result<()> {
        self.with_accounts(&[id], |set| {
            set.require_active(id)?;
            let account = set.get_mut(id)?;
            if account.gift_tickets < count {
                return Err(TallyError::InsufficientTickets {
                    account: id,
                    has: account.gift_tickets,
                    needs: count,
                });
            }
            account.gift_tickets -= count;
            Ok(())
        })
        .await
    }

    /// Administrative status change (ban / restrict / reinstate).
    pub async fn set_status(&self, id: AccountId, status: tally_types::AccountStatus) -> Result<()> {
        self.with_accounts(&[id], |set| {
            let account = set.get_mut(id)?;
            account.status = status;
            Ok(())
        })
        .await
    }

    pub async fn history(&self, id: AccountId) -> Result<Vec<LedgerEntry>> {
        self.storage
            .entries_for(id)
            .await
            .map_err(TallyError::storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use tally_types::AccountStatus;

    async fn fresh_ledger() -> Ledger {
        Ledger::new(Arc::new(MemoryStorage::new()))
    }

    #[tokio::test]
    async fn credit_debit_roundtrip() {
        let ledger = fresh_ledger().await;
        let id = AccountId::new(1);
        ledger.open_account(id, None).await.unwrap();

        ledger
            .credit(id, Amount::from_value(100.0), EntryKind::ManualAdjust)
            .await
            .unwrap();
        ledger
            .debit(id, Amount::from_value(40.0), EntryKind::ManualAdjust)
            .await
            .unwrap();

        assert_eq!(
            ledger.account(id).await.unwrap().balance,
            Amount::from_value(60.0)
        );
        assert_eq!(ledger.history(id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn debit_rejects_overdraft_without_mutation() {
        let ledger = fresh_ledger().await;
        let id = AccountId::new(1);
        ledger.open_account(id, None).await.unwrap();
        ledger
            .credit(id, Amount::from_value(30.0), EntryKind::ManualAdjust)
            .await
            .unwrap();

        let err = ledger
            .debit(id, Amount::from_value(31.0), EntryKind::ManualAdjust)
            .await
            .unwrap_err();
        assert!(matches!(err, TallyError::InsufficientFunds { .. }));
        assert_eq!(
            ledger.account(id).await.unwrap().balance,
            Amount::from_value(30.0)
        );
    }

    #[tokio::test]
    async fn gift_burns_the_fee() {
        let ledger = fresh_ledger().await;
        let payer = AccountId::new(1);
        let payee = AccountId::new(2);
        ledger.open_account(payer, None).await.unwrap();
        ledger.open_account(payee, None).await.unwrap();
        ledger
            .credit(payer, Amount::from_value(110.0), EntryKind::ManualAdjust)
            .await
            .unwrap();

        let fee = ledger
            .transfer_with_fee(payer, payee, Amount::from_value(100.0), 0.10)
            .await
            .unwrap();

        assert_eq!(fee, Amount::from_value(10.0));
        assert_eq!(ledger.account(payer).await.unwrap().balance, Amount::ZERO);
        assert_eq!(
            ledger.account(payee).await.unwrap().balance,
            Amount::from_value(100.0)
        );
    }

    #[tokio::test]
    async fn gift_requires_amount_plus_fee() {
        let ledger = fresh_ledger().await;
        let payer = AccountId::new(1);
        let payee = AccountId::new(2);
        ledger.open_account(payer, None).await.unwrap();
        ledger.open_account(payee, None).await.unwrap();
        ledger
            .credit(payer, Amount::from_value(100.0), EntryKind::ManualAdjust)
            .await
            .unwrap();

        // 100 is enough for the amount but not the 10% fee
        let err = ledger
            .transfer_with_fee(payer, payee, Amount::from_value(100.0), 0.10)
            .await
            .unwrap_err();
        assert!(matches!(err, TallyError::InsufficientFunds { .. }));
        // Neither side moved
        assert_eq!(
            ledger.account(payer).await.unwrap().balance,
            Amount::from_value(100.0)
        );
        assert_eq!(ledger.account(payee).await.unwrap().balance, Amount::ZERO);
    }

    #[tokio::test]
    async fn redeem_decrements_uses() {
        let ledger = fresh_ledger().await;
        let id = AccountId::new(1);
        ledger.open_account(id, None).await.unwrap();
        ledger
            .create_code(RedeemCode {
                code: "BONUS".into(),
                reward: Amount::from_value(25.0),
                uses_left: Some(2),
            })
            .await
            .unwrap();

        ledger.redeem(id, "BONUS").await.unwrap();
        ledger.redeem(id, "BONUS").await.unwrap();
        let err = ledger.redeem(id, "BONUS").await.unwrap_err();
        assert!(matches!(err, TallyError::InvalidOrExhaustedCode(_)));
        assert_eq!(
            ledger.account(id).await.unwrap().balance,
            Amount::from_value(50.0)
        );
    }

    #[tokio::test]
    async fn unknown_code_is_rejected() {
        let ledger = fresh_ledger().await;
        let id = AccountId::new(1);
        ledger.open_account(id, None).await.unwrap();
        let err = ledger.redeem(id, "NOPE").await.unwrap_err();
        assert!(matches!(err, TallyError::InvalidOrExhaustedCode(_)));
    }

    #[tokio::test]
    async fn banned_account_cannot_spend() {
        let ledger = fresh_ledger().await;
        let payer = AccountId::new(1);
        let payee = AccountId::new(2);
        ledger.open_account(payer, None).await.unwrap();
        ledger.open_account(payee, None).await.unwrap();
        ledger
            .credit(payer, Amount::from_value(100.0), EntryKind::ManualAdjust)
            .await
            .unwrap();
        ledger
            .set_status(payer, AccountStatus::Banned)
            .await
            .unwrap();

        let err = ledger
            .transfer_with_fee(payer, payee, Amount::from_value(10.0), 0.10)
            .await
            .unwrap_err();
        assert!(matches!(err, TallyError::AccountNotActive(_)));
        // Credits still land on banned accounts
        ledger
            .credit(payer, Amount::from_value(1.0), EntryKind::ManualAdjust)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn restriction_reverts_on_access() {
        let ledger = fresh_ledger().await;
        let id = AccountId::new(1);
        ledger.open_account(id, None).await.unwrap();
        ledger
            .set_status(
                id,
                AccountStatus::Restricted {
                    until: Utc::now() - chrono::Duration::minutes(1),
                },
            )
            .await
            .unwrap();

        let account = ledger.account(id).await.unwrap();
        assert!(account.is_active());
        // The revert was persisted, not just computed
        let raw = ledger
            .storage()
            .get_account(id)
            .await
            .unwrap()
            .unwrap();
        assert!(raw.is_active());
    }

    #[tokio::test]
    async fn open_account_is_idempotent_and_counts_referrals() {
        let ledger = fresh_ledger().await;
        let referrer = AccountId::new(1);
        let invitee = AccountId::new(2);
        ledger.open_account(referrer, None).await.unwrap();
        ledger.open_account(invitee, Some(referrer)).await.unwrap();
        // Second open does not double-count
        ledger.open_account(invitee, Some(referrer)).await.unwrap();

        assert_eq!(ledger.account(referrer).await.unwrap().referral_count, 1);
        assert_eq!(
            ledger.account(invitee).await.unwrap().referrer,
            Some(referrer)
        );
    }

    #[tokio::test]
    async fn self_referral_is_dropped() {
        let ledger = fresh_ledger().await;
        let id = AccountId::new(1);
        let account = ledger.open_account(id, Some(id)).await.unwrap();
        assert_eq!(account.referrer, None);
    }

    #[tokio::test]
    async fn tickets_never_go_negative() {
        let ledger = fresh_ledger().await;
        let id = AccountId::new(1);
        ledger.open_account(id, None).await.unwrap();
        ledger.grant_tickets(id, 3).await.unwrap();
        ledger.spend_tickets(id, 2).await.unwrap();

        let err = ledger.spend_tickets(id, 2).await.unwrap_err();
        assert!(matches!(err, TallyError::InsufficientTickets { .. }));
        assert_eq!(ledger.account(id).await.unwrap().gift_tickets, 1);
    }

    #[tokio::test]
    async fn failed_multi_account_op_writes_nothing() {
        let ledger = fresh_ledger().await;
        let a = AccountId::new(1);
        let b = AccountId::new(2);
        ledger.open_account(a, None).await.unwrap();
        ledger.open_account(b, None).await.unwrap();
        ledger
            .credit(a, Amount::from_value(10.0), EntryKind::ManualAdjust)
            .await
            .unwrap();

        let result = ledger
            .with_accounts(&[a, b], |set| {
                set.credit(b, Amount::from_value(5.0), EntryKind::ManualAdjust)?;
                set.debit(a, Amount::from_value(100.0), EntryKind::ManualAdjust)
            })
            .await;

        assert!(result.is_err());
        // The credit to b made inside the failed unit never committed
        assert_eq!(ledger.account(b).await.unwrap().balance, Amount::ZERO);
        assert_eq!(ledger.history(b).await.unwrap().len(), 0);
    }
}
