use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use tally_ledger::{EntryKind, IdSpace, Ledger, LedgerStorage, LockTable};
use tally_types::{
    AccountId, Amount, Notifier, Result, SubmissionStatus, TallyError, Task, TaskId,
    TaskSubmission, Withdrawal, WithdrawalStatus,
};

#[derive(Debug, Clone)]
pub struct Milestone {
    pub threshold: u32,
    pub bonus: Amount,
}

#[derive(Debug, Clone)]
pub struct RewardsConfig {
    pub invite_reward: Amount,
    pub milestones: Vec<Milestone>,
    pub min_withdrawal: Amount,
    pub withdrawal_fee_percent: f64,
}

impl Default for RewardsConfig {
    fn default() -> Self {
        Self {
            invite_reward: Amount::from_value(77.0),
            milestones: vec![
                Milestone {
                    threshold: 10,
                    bonus: Amount::from_value(100.0),
                },
                Milestone {
                    threshold: 20,
                    bonus: Amount::from_value(250.0),
                },
                Milestone {
                    threshold: 30,
                    bonus: Amount::from_value(500.0),
                },
            ],
            min_withdrawal: Amount::from_value(500.0),
            withdrawal_fee_percent: 0.05,
        }
    }
}

/// What an approval actually paid out. `AlreadyProcessed` is the benign
/// duplicate-click outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved {
        task_reward: Amount,
        milestone_bonuses: Vec<(u32, Amount)>,
        referral_bonus: Option<(AccountId, Amount)>,
    },
    AlreadyProcessed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Done,
    AlreadyProcessed,
}

/// Turns one admin decision into the dependent ledger mutations it implies
/// (task reward → milestone bonus → referral bonus), all-or-nothing.
pub struct RewardsEngine {
    ledger: Arc<Ledger>,
    storage: Arc<dyn LedgerStorage>,
    notifier: Arc<dyn Notifier>,
    config: RewardsConfig,
    // Serializes reviews of the same withdrawal; the refund credit must not
    // race the pending check.
    withdrawal_locks: LockTable<u64>,
}

impl RewardsEngine {
    pub fn new(ledger: Arc<Ledger>, notifier: Arc<dyn Notifier>, config: RewardsConfig) -> Self {
        let storage = ledger.storage();
        Self {
            ledger,
            storage,
            notifier,
            config,
            withdrawal_locks: LockTable::new(),
        }
    }

    pub fn config(&self) -> &RewardsConfig {
        &self.config
    }

    // --- task catalog ---

    pub async fn create_task(
        &self,
        description: String,
        link: String,
        reward: Amount,
    ) -> Result<Task> {
        let id = TaskId::new(
            self.storage
                .allocate_id(IdSpace::Task)
                .await
                .map_err(TallyError::storage)?,
        );
        let task = Task {
            id,
            description,
            link,
            reward,
            active: true,
        };
        self.storage
            .put_task(task.clone())
            .await
            .map_err(TallyError::storage)?;
        info!(task = %id, reward = reward.to_value(), "📋 Task created");
        Ok(task)
    }

    pub async fn set_task_active(&self, id: TaskId, active: bool) -> Result<()> {
        let mut task = self
            .storage
            .get_task(id)
            .await
            .map_err(TallyError::storage)?
            .ok_or_else(|| TallyError::InvalidRequest(format!("unknown task: {id}")))?;
        task.active = active;
        self.storage
            .put_task(task)
            .await
            .map_err(TallyError::storage)
    }

    pub async fn remove_task(&self, id: TaskId) -> Result<()> {
        self.storage
            .remove_task(id)
            .await
            .map_err(TallyError::storage)
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.storage.list_tasks().await.map_err(TallyError::storage)
    }

    // --- submissions ---

    pub async fn submit_proof(
        &self,
        account: AccountId,
        task_id: TaskId,
        text_proof: String,
        photo_proof: Option<String>,
    ) -> Result<TaskSubmission> {
        let account_row = self.ledger.require_active(account).await?;

        let task = self
            .storage
            .get_task(task_id)
            .await
            .map_err(TallyError::storage)?
            .ok_or_else(|| TallyError::InvalidRequest(format!("unknown task: {task_id}")))?;
        if !task.active {
            return Err(TallyError::InvalidRequest(format!(
                "task is no longer active: {task_id}"
            )));
        }
        if account_row.completed_tasks.contains(&task_id) {
            return Err(TallyError::InvalidRequest(format!(
                "task already completed: {task_id}"
            )));
        }

        let submission = TaskSubmission {
            id: self
                .storage
                .allocate_id(IdSpace::Submission)
                .await
                .map_err(TallyError::storage)?,
            account,
            task: task_id,
            text_proof,
            photo_proof,
            status: SubmissionStatus::Pending,
            reject_reason: None,
            created_at: Utc::now(),
        };
        self.storage
            .put_submission(submission.clone())
            .await
            .map_err(TallyError::storage)?;

        info!(
            submission = submission.id,
            account = %account,
            task = %task_id,
            "📬 Proof submitted"
        );
        Ok(submission)
    }

    /// The approval cascade. One exclusive hold on the submitting account
    /// (and the referrer when the invite bonus can fire) covers the reward
    /// credit, the milestone sweep and the referral bonus; either all of it
    /// commits or none of it does.
    pub async fn approve_submission(&self, submission_id: u64) -> Result<ApprovalOutcome> {
        let mut submission = self
            .storage
            .get_submission(submission_id)
            .await
            .map_err(TallyError::storage)?
            .ok_or_else(|| {
                TallyError::InvalidRequest(format!("unknown submission: {submission_id}"))
            })?;

        if submission.status != SubmissionStatus::Pending {
            info!(
                submission = submission_id,
                status = ?submission.status,
                "Submission already processed, ignoring"
            );
            return Ok(ApprovalOutcome::AlreadyProcessed);
        }

        let task = self
            .storage
            .get_task(submission.task)
            .await
            .map_err(TallyError::storage)?
            .ok_or_else(|| {
                TallyError::InvalidRequest(format!("unknown task: {}", submission.task))
            })?;

        // Referral linkage is immutable, so it is safe to read outside the
        // exclusive hold to decide the lock set.
        let referrer = self.ledger.account(submission.account).await?.referrer;
        let mut lock_ids = vec![submission.account];
        if let Some(referrer_id) = referrer {
            lock_ids.push(referrer_id);
        }

        let account = submission.account;
        let task_id = task.id;
        let task_reward = task.reward;
        let invite_reward = self.config.invite_reward;
        let milestones = self.config.milestones.clone();

        let outcome = self
            .ledger
            .with_accounts(&lock_ids, move |set| {
                let mut milestone_bonuses = Vec::new();
                let mut referral_bonus = None;

                // The completed-task set is the authoritative duplicate
                // guard; the status fast-path above races with itself.
                let row = set.get_mut(account)?;
                if row.completed_tasks.contains(&task_id) {
                    return Ok(ApprovalOutcome::AlreadyProcessed);
                }
                row.completed_tasks.insert(task_id);
                row.tasks_completed += 1;
                set.credit(account, task_reward, EntryKind::TaskReward)?;

                // Milestones use at-least semantics and are evaluated
                // independently, so a non-monotone configuration still pays
                // every crossed threshold exactly once.
                let completed = set.get(account)?.tasks_completed;
                for milestone in &milestones {
                    let claimed = set
                        .get(account)?
                        .claimed_milestones
                        .contains(&milestone.threshold);
                    if completed >= milestone.threshold && !claimed {
                        set.get_mut(account)?
                            .claimed_milestones
                            .insert(milestone.threshold);
                        set.credit(account, milestone.bonus, EntryKind::MilestoneBonus)?;
                        milestone_bonuses.push((milestone.threshold, milestone.bonus));
                    }
                }

                // The invite bonus fires exactly once: on the approval that
                // takes the account's completed count to one.
                if completed == 1 {
                    if let Some(referrer_id) = referrer {
                        set.credit(referrer_id, invite_reward, EntryKind::InviteReward)?;
                        set.get_mut(referrer_id)?.successful_referrals += 1;
                        referral_bonus = Some((referrer_id, invite_reward));
                    }
                }

                Ok(ApprovalOutcome::Approved {
                    task_reward,
                    milestone_bonuses,
                    referral_bonus,
                })
            })
            .await?;

        submission.status = SubmissionStatus::Approved;
        self.storage
            .put_submission(submission)
            .await
            .map_err(TallyError::storage)?;

        if let ApprovalOutcome::Approved {
            task_reward,
            ref milestone_bonuses,
            referral_bonus,
        } = outcome
        {
            info!(
                submission = submission_id,
                account = %account,
                task_reward = task_reward.to_value(),
                milestones = milestone_bonuses.len(),
                referral = referral_bonus.is_some(),
                "✅ Submission approved"
            );
            self.notifier
                .notify(
                    account,
                    &format!("Your task submission was approved: +{task_reward}"),
                )
                .await;
            if let Some((referrer_id, bonus)) = referral_bonus {
                self.notifier
                    .notify(
                        referrer_id,
                        &format!("Your invitee completed their first task: +{bonus}"),
                    )
                    .await;
            }
        }

        Ok(outcome)
    }

    pub async fn reject_submission(&self, submission_id: u64, reason: String) -> Result<Applied> {
        let mut submission = self
            .storage
            .get_submission(submission_id)
            .await
            .map_err(TallyError::storage)?
            .ok_or_else(|| {
                TallyError::InvalidRequest(format!("unknown submission: {submission_id}"))
            })?;

        if submission.status != SubmissionStatus::Pending {
            return Ok(Applied::AlreadyProcessed);
        }

        submission.status = SubmissionStatus::Rejected;
        submission.reject_reason = Some(reason.clone());
        let account = submission.account;
        self.storage
            .put_submission(submission)
            .await
            .map_err(TallyError::storage)?;

        info!(submission = submission_id, account = %account, reason, "🚫 Submission rejected");
        self.notifier
            .notify(account, &format!("Your task submission was rejected: {reason}"))
            .await;
        Ok(Applied::Done)
    }

    // --- withdrawals ---

    pub async fn request_withdrawal(
        &self,
        account: AccountId,
        amount: Amount,
        method: String,
        details: String,
    ) -> Result<Withdrawal> {
        if amount < self.config.min_withdrawal {
            return Err(TallyError::InvalidRequest(format!(
                "minimum withdrawal is {}",
                self.config.min_withdrawal
            )));
        }

        let fee = amount.percent_of(self.config.withdrawal_fee_percent);

        // Debit happens at request time; rejection refunds it later.
        self.ledger
            .with_accounts(&[account], |set| {
                set.require_active(account)?;
                set.debit(account, amount, EntryKind::WithdrawalDebit)
            })
            .await?;

        let withdrawal = Withdrawal {
            id: self
                .storage
                .allocate_id(IdSpace::Withdrawal)
                .await
                .map_err(TallyError::storage)?,
            account,
            amount,
            fee,
            method,
            details,
            status: WithdrawalStatus::Pending,
            created_at: Utc::now(),
        };
        self.storage
            .put_withdrawal(withdrawal.clone())
            .await
            .map_err(TallyError::storage)?;

        info!(
            withdrawal = withdrawal.id,
            account = %account,
            amount = amount.to_value(),
            fee = fee.to_value(),
            "🏧 Withdrawal requested"
        );
        Ok(withdrawal)
    }

    pub async fn review_withdrawal(&self, withdrawal_id: u64, approve: bool) -> Result<Applied> {
        // Held across read, refund and status flip: concurrent duplicate
        // reviews of one withdrawal serialize here, so exactly one of them
        // observes Pending and refunds.
        let _guard = self.withdrawal_locks.acquire(&withdrawal_id).await;

        let mut withdrawal = self
            .storage
            .get_withdrawal(withdrawal_id)
            .await
            .map_err(TallyError::storage)?
            .ok_or_else(|| {
                TallyError::InvalidRequest(format!("unknown withdrawal: {withdrawal_id}"))
            })?;

        if withdrawal.status != WithdrawalStatus::Pending {
            return Ok(Applied::AlreadyProcessed);
        }

        // The terminal row goes down before the refund: a fault between the
        // two loses at most one refund, it can never refund twice.
        withdrawal.status = if approve {
            // The debit already happened at request time; approval only
            // flips the record for the manual payout queue.
            WithdrawalStatus::Approved
        } else {
            WithdrawalStatus::Rejected
        };

        let account = withdrawal.account;
        let amount = withdrawal.amount;
        let status = withdrawal.status;
        self.storage
            .put_withdrawal(withdrawal)
            .await
            .map_err(TallyError::storage)?;

        if !approve {
            self.ledger
                .credit(account, amount, EntryKind::WithdrawalRefund)
                .await?;
        }

        info!(
            withdrawal = withdrawal_id,
            account = %account,
            status = ?status,
            "🏧 Withdrawal reviewed"
        );
        let message = if approve {
            format!("Your withdrawal of {amount} was approved")
        } else {
            format!("Your withdrawal of {amount} was rejected and refunded")
        };
        self.notifier.notify(account, &message).await;
        Ok(Applied::Done)
    }
}
