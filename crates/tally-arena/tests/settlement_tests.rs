use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tally_arena::{ArenaConfig, ArenaEngine, DisconnectOutcome, MoveOutcome, RoomEvent};
use tally_ledger::{EntryKind, IdSpace, Ledger, LedgerEntry, LedgerStorage, MemoryStorage};
use tally_types::{
    Account, AccountId, Amount, GameRoom, Move, NoopNotifier, Outcome, RedeemCode, RoomId, Task,
    TaskId, TaskSubmission, TallyError, Withdrawal,
};

const ALICE: AccountId = AccountId::new(1);
const BOB: AccountId = AccountId::new(2);

async fn setup(config: ArenaConfig) -> (Arc<Ledger>, ArenaEngine) {
    let ledger = Arc::new(Ledger::new(Arc::new(MemoryStorage::new())));
    for id in [ALICE, BOB] {
        ledger.open_account(id, None).await.unwrap();
        ledger
            .credit(id, Amount::from_value(1_000.0), EntryKind::ManualAdjust)
            .await
            .unwrap();
    }
    let engine = ArenaEngine::new(
        ledger.clone(),
        Arc::new(tally_arena::RoomRegistry::new()),
        Arc::new(NoopNotifier),
        config,
    )
    .await
    .unwrap();
    (ledger, engine)
}

async fn balance(ledger: &Ledger, id: AccountId) -> Amount {
    ledger.account(id).await.unwrap().balance
}

#[tokio::test]
async fn win_pays_pot_minus_fee_and_loser_stake_is_gone() {
    let (ledger, engine) = setup(ArenaConfig::default()).await;
    let room = engine.create(ALICE, Amount::from_value(100.0)).await.unwrap();
    engine.join(BOB, room.id).await.unwrap();

    assert_eq!(balance(&ledger, ALICE).await, Amount::from_value(900.0));
    assert_eq!(balance(&ledger, BOB).await, Amount::from_value(900.0));

    assert_eq!(
        engine.submit_move(ALICE, room.id, Move::Rock).await.unwrap(),
        MoveOutcome::Recorded
    );
    let outcome = engine
        .submit_move(BOB, room.id, Move::Scissors)
        .await
        .unwrap();
    assert_eq!(outcome, MoveOutcome::Settled(Outcome::Winner(ALICE)));

    // Pot 200.00, 10% burned: the winner receives 180.00
    assert_eq!(balance(&ledger, ALICE).await, Amount::from_value(1_080.0));
    assert_eq!(balance(&ledger, BOB).await, Amount::from_value(900.0));
}

#[tokio::test]
async fn draw_refunds_both_bets_with_no_fee() {
    let (ledger, engine) = setup(ArenaConfig::default()).await;
    let room = engine.create(ALICE, Amount::from_value(50.0)).await.unwrap();
    engine.join(BOB, room.id).await.unwrap();

    engine.submit_move(ALICE, room.id, Move::Paper).await.unwrap();
    assert_eq!(
        engine.submit_move(BOB, room.id, Move::Paper).await.unwrap(),
        MoveOutcome::Settled(Outcome::Draw)
    );

    assert_eq!(balance(&ledger, ALICE).await, Amount::from_value(1_000.0));
    assert_eq!(balance(&ledger, BOB).await, Amount::from_value(1_000.0));
}

#[tokio::test]
async fn post_settlement_messages_are_noops() {
    let (ledger, engine) = setup(ArenaConfig::default()).await;
    let room = engine.create(ALICE, Amount::from_value(100.0)).await.unwrap();
    engine.join(BOB, room.id).await.unwrap();
    engine.submit_move(ALICE, room.id, Move::Rock).await.unwrap();
    engine
        .submit_move(BOB, room.id, Move::Scissors)
        .await
        .unwrap();

    let settled_alice = balance(&ledger, ALICE).await;
    let settled_bob = balance(&ledger, BOB).await;

    // A stale move and a stale disconnect both land after settlement
    assert_eq!(
        engine.submit_move(BOB, room.id, Move::Rock).await.unwrap(),
        MoveOutcome::AlreadyProcessed
    );
    assert_eq!(
        engine.disconnect(ALICE, room.id).await.unwrap(),
        DisconnectOutcome::Ignored
    );

    assert_eq!(balance(&ledger, ALICE).await, settled_alice);
    assert_eq!(balance(&ledger, BOB).await, settled_bob);
}

#[tokio::test]
async fn duplicate_move_is_a_noop() {
    let (_ledger, engine) = setup(ArenaConfig::default()).await;
    let room = engine.create(ALICE, Amount::from_value(20.0)).await.unwrap();
    engine.join(BOB, room.id).await.unwrap();

    engine.submit_move(ALICE, room.id, Move::Rock).await.unwrap();
    assert_eq!(
        engine.submit_move(ALICE, room.id, Move::Paper).await.unwrap(),
        MoveOutcome::AlreadyProcessed
    );
    // The first move stands
    assert_eq!(
        engine.submit_move(BOB, room.id, Move::Scissors).await.unwrap(),
        MoveOutcome::Settled(Outcome::Winner(ALICE))
    );
}

#[tokio::test]
async fn creator_disconnect_while_pending_refunds_the_bet() {
    let (ledger, engine) = setup(ArenaConfig::default()).await;
    let room = engine.create(ALICE, Amount::from_value(75.0)).await.unwrap();
    assert_eq!(balance(&ledger, ALICE).await, Amount::from_value(925.0));

    assert_eq!(
        engine.disconnect(ALICE, room.id).await.unwrap(),
        DisconnectOutcome::CreatorRefunded
    );
    assert_eq!(balance(&ledger, ALICE).await, Amount::from_value(1_000.0));

    // The room is gone for everyone after the refund
    let err = engine.join(BOB, room.id).await.unwrap_err();
    assert!(matches!(err, TallyError::RoomNotAvailable(_, _)));
}

#[tokio::test]
async fn disconnect_during_active_match_forfeits_to_the_other_side() {
    let (ledger, engine) = setup(ArenaConfig::default()).await;
    let room = engine.create(ALICE, Amount::from_value(100.0)).await.unwrap();
    engine.join(BOB, room.id).await.unwrap();
    engine.submit_move(BOB, room.id, Move::Rock).await.unwrap();

    let outcome = engine.disconnect(ALICE, room.id).await.unwrap();
    assert_eq!(
        outcome,
        DisconnectOutcome::Forfeited {
            winner: BOB,
            payout: Amount::from_value(180.0)
        }
    );
    assert_eq!(balance(&ledger, ALICE).await, Amount::from_value(900.0));
    assert_eq!(balance(&ledger, BOB).await, Amount::from_value(1_080.0));

    // The forfeit already settled things; a second leave changes nothing
    assert_eq!(
        engine.disconnect(BOB, room.id).await.unwrap(),
        DisconnectOutcome::Ignored
    );
}

#[tokio::test]
async fn join_validations() {
    let (ledger, engine) = setup(ArenaConfig::default()).await;
    let room = engine.create(ALICE, Amount::from_value(100.0)).await.unwrap();

    // Creator cannot take the second seat
    assert!(matches!(
        engine.join(ALICE, room.id).await.unwrap_err(),
        TallyError::InvalidRequest(_)
    ));

    // A broke opponent cannot escrow; the room stays open
    let carol = AccountId::new(3);
    ledger.open_account(carol, None).await.unwrap();
    assert!(matches!(
        engine.join(carol, room.id).await.unwrap_err(),
        TallyError::InsufficientFunds { .. }
    ));

    engine.join(BOB, room.id).await.unwrap();

    // Already active: a third player is turned away
    ledger
        .credit(carol, Amount::from_value(500.0), EntryKind::ManualAdjust)
        .await
        .unwrap();
    assert!(matches!(
        engine.join(carol, room.id).await.unwrap_err(),
        TallyError::RoomNotAvailable(_, _)
    ));
}

#[tokio::test]
async fn bets_below_the_minimum_are_rejected() {
    let (ledger, engine) = setup(ArenaConfig::default()).await;
    let err = engine
        .create(ALICE, Amount::from_value(9.99))
        .await
        .unwrap_err();
    assert!(matches!(err, TallyError::InvalidRequest(_)));
    assert_eq!(balance(&ledger, ALICE).await, Amount::from_value(1_000.0));
}

#[tokio::test]
async fn subscribers_see_the_match_lifecycle_and_terminal_rooms_refuse_new_ones() {
    let (_ledger, engine) = setup(ArenaConfig::default()).await;
    let room = engine.create(ALICE, Amount::from_value(100.0)).await.unwrap();
    let mut rx = engine.subscribe(room.id).await.unwrap();

    engine.join(BOB, room.id).await.unwrap();
    engine.submit_move(ALICE, room.id, Move::Paper).await.unwrap();
    engine.submit_move(BOB, room.id, Move::Rock).await.unwrap();

    assert!(matches!(
        rx.recv().await.unwrap(),
        RoomEvent::OpponentJoined { opponent: BOB, .. }
    ));
    assert!(matches!(
        rx.recv().await.unwrap(),
        RoomEvent::MoveReceived { participant: ALICE, .. }
    ));
    assert!(matches!(
        rx.recv().await.unwrap(),
        RoomEvent::MoveReceived { participant: BOB, .. }
    ));
    match rx.recv().await.unwrap() {
        RoomEvent::Settled {
            outcome, payout, ..
        } => {
            assert_eq!(outcome, Outcome::Winner(ALICE));
            assert_eq!(payout, Amount::from_value(180.0));
        }
        other => panic!("expected settlement, got {other:?}"),
    }

    // Channel closes once the room is terminal, and late subscribers are refused
    assert!(rx.recv().await.is_err());
    assert!(matches!(
        engine.subscribe(room.id).await.unwrap_err(),
        TallyError::RoomNotAvailable(_, _)
    ));
}

/// Memory storage whose account writes can be switched off, standing in for
/// a disk fault at payout time.
struct FaultyStorage {
    inner: MemoryStorage,
    fail_account_writes: AtomicBool,
}

impl FaultyStorage {
    fn new() -> Self {
        Self {
            inner: MemoryStorage::new(),
            fail_account_writes: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl LedgerStorage for FaultyStorage {
    async fn get_account(&self, id: AccountId) -> anyhow::Result<Option<Account>> {
        self.inner.get_account(id).await
    }
    async fn put_accounts(&self, batch: Vec<Account>) -> anyhow::Result<()> {
        if self.fail_account_writes.load(Ordering::SeqCst) {
            anyhow::bail!("account column is unavailable");
        }
        self.inner.put_accounts(batch).await
    }
    async fn list_accounts(&self) -> anyhow::Result<Vec<AccountId>> {
        self.inner.list_accounts().await
    }
    async fn get_code(&self, code: &str) -> anyhow::Result<Option<RedeemCode>> {
        self.inner.get_code(code).await
    }
    async fn put_code(&self, code: RedeemCode) -> anyhow::Result<()> {
        self.inner.put_code(code).await
    }
    async fn get_task(&self, id: TaskId) -> anyhow::Result<Option<Task>> {
        self.inner.get_task(id).await
    }
    async fn put_task(&self, task: Task) -> anyhow::Result<()> {
        self.inner.put_task(task).await
    }
    async fn remove_task(&self, id: TaskId) -> anyhow::Result<()> {
        self.inner.remove_task(id).await
    }
    async fn list_tasks(&self) -> anyhow::Result<Vec<Task>> {
        self.inner.list_tasks().await
    }
    async fn get_submission(&self, id: u64) -> anyhow::Result<Option<TaskSubmission>> {
        self.inner.get_submission(id).await
    }
    async fn put_submission(&self, submission: TaskSubmission) -> anyhow::Result<()> {
        self.inner.put_submission(submission).await
    }
    async fn get_withdrawal(&self, id: u64) -> anyhow::Result<Option<Withdrawal>> {
        self.inner.get_withdrawal(id).await
    }
    async fn put_withdrawal(&self, withdrawal: Withdrawal) -> anyhow::Result<()> {
        self.inner.put_withdrawal(withdrawal).await
    }
    async fn get_room(&self, id: RoomId) -> anyhow::Result<Option<GameRoom>> {
        self.inner.get_room(id).await
    }
    async fn put_room(&self, room: GameRoom) -> anyhow::Result<()> {
        self.inner.put_room(room).await
    }
    async fn list_rooms(&self) -> anyhow::Result<Vec<GameRoom>> {
        self.inner.list_rooms().await
    }
    async fn append_entries(&self, entries: Vec<LedgerEntry>) -> anyhow::Result<()> {
        self.inner.append_entries(entries).await
    }
    async fn entries_for(&self, account: AccountId) -> anyhow::Result<Vec<LedgerEntry>> {
        self.inner.entries_for(account).await
    }
    async fn allocate_id(&self, space: IdSpace) -> anyhow::Result<u64> {
        self.inner.allocate_id(space).await
    }
}

#[tokio::test]
async fn payout_fault_cannot_replay_a_settled_match() {
    let storage = Arc::new(FaultyStorage::new());
    let ledger = Arc::new(Ledger::new(storage.clone()));
    for id in [ALICE, BOB] {
        ledger.open_account(id, None).await.unwrap();
        ledger
            .credit(id, Amount::from_value(1_000.0), EntryKind::ManualAdjust)
            .await
            .unwrap();
    }
    let engine = ArenaEngine::new(
        ledger.clone(),
        Arc::new(tally_arena::RoomRegistry::new()),
        Arc::new(NoopNotifier),
        ArenaConfig::default(),
    )
    .await
    .unwrap();
    let room = engine.create(ALICE, Amount::from_value(100.0)).await.unwrap();
    engine.join(BOB, room.id).await.unwrap();
    engine.submit_move(ALICE, room.id, Move::Rock).await.unwrap();

    // The payout write dies after the room row has gone terminal
    storage.fail_account_writes.store(true, Ordering::SeqCst);
    let err = engine
        .submit_move(BOB, room.id, Move::Scissors)
        .await
        .unwrap_err();
    assert!(matches!(err, TallyError::Storage(_)));
    storage.fail_account_writes.store(false, Ordering::SeqCst);

    // The durable row already carries both moves and the outcome
    let stored = storage.get_room(room.id).await.unwrap().unwrap();
    assert!(stored.status.is_terminal());
    assert_eq!(stored.outcome, Some(Outcome::Winner(ALICE)));
    assert!(stored.creator_move.is_some() && stored.opponent_move.is_some());

    // A fresh process skips the terminal room, so the match can never be
    // brought back and settled a second time
    let revived = ArenaEngine::new(
        ledger.clone(),
        Arc::new(tally_arena::RoomRegistry::new()),
        Arc::new(NoopNotifier),
        ArenaConfig::default(),
    )
    .await
    .unwrap();
    assert!(revived.open_rooms().await.is_empty());
    assert_eq!(
        revived
            .submit_move(BOB, room.id, Move::Scissors)
            .await
            .unwrap(),
        MoveOutcome::AlreadyProcessed
    );

    // Only the escrow debits are visible; no payout was duplicated
    assert_eq!(balance(&ledger, ALICE).await, Amount::from_value(900.0));
    assert_eq!(balance(&ledger, BOB).await, Amount::from_value(900.0));
}

#[tokio::test]
async fn open_rooms_survive_a_restart() {
    let storage = Arc::new(MemoryStorage::new());
    let ledger = Arc::new(Ledger::new(storage.clone()));
    for id in [ALICE, BOB] {
        ledger.open_account(id, None).await.unwrap();
        ledger
            .credit(id, Amount::from_value(1_000.0), EntryKind::ManualAdjust)
            .await
            .unwrap();
    }
    let engine = ArenaEngine::new(
        ledger.clone(),
        Arc::new(tally_arena::RoomRegistry::new()),
        Arc::new(NoopNotifier),
        ArenaConfig::default(),
    )
    .await
    .unwrap();
    let room = engine.create(ALICE, Amount::from_value(100.0)).await.unwrap();
    drop(engine);

    // Same storage, fresh process
    let revived = ArenaEngine::new(
        ledger.clone(),
        Arc::new(tally_arena::RoomRegistry::new()),
        Arc::new(NoopNotifier),
        ArenaConfig::default(),
    )
    .await
    .unwrap();
    assert_eq!(revived.open_rooms().await.len(), 1);
    revived.join(BOB, room.id).await.unwrap();
    revived.submit_move(ALICE, room.id, Move::Rock).await.unwrap();
    assert_eq!(
        revived
            .submit_move(BOB, room.id, Move::Scissors)
            .await
            .unwrap(),
        MoveOutcome::Settled(Outcome::Winner(ALICE))
    );
    assert_eq!(
        ledger.account(ALICE).await.unwrap().balance,
        Amount::from_value(1_080.0)
    );
}
