use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::config::NodeConfig;
use tally_arena::{ArenaEngine, RoomRegistry};
use tally_ledger::{Ledger, LedgerStorage, MemoryStorage};
use tally_rewards::RewardsEngine;
use tally_types::{LogNotifier, Notifier};

/// The assembled service: one storage backend, one ledger, and the two
/// engines sharing it.
pub struct TallyNode {
    config: NodeConfig,
    ledger: Arc<Ledger>,
    rewards: Arc<RewardsEngine>,
    arena: Arc<ArenaEngine>,
    registry: Arc<RoomRegistry>,
}

impl TallyNode {
    pub async fn new(config: NodeConfig) -> Result<Self> {
        info!(
            name = %config.node.name,
            backend = %config.storage.backend,
            "🚀 Starting node"
        );

        let storage = build_storage(&config)?;
        let ledger = Arc::new(Ledger::new(storage));
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
        let registry = Arc::new(RoomRegistry::new());

        let rewards = Arc::new(RewardsEngine::new(
            ledger.clone(),
            notifier.clone(),
            config.rewards.clone().into(),
        ));
        let arena = Arc::new(
            ArenaEngine::new(
                ledger.clone(),
                registry.clone(),
                notifier.clone(),
                config.arena.clone().into(),
            )
            .await
            .context("failed to restore arena state")?,
        );

        info!("✅ Node ready");
        Ok(Self {
            config,
            ledger,
            rewards,
            arena,
            registry,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn ledger(&self) -> Arc<Ledger> {
        self.ledger.clone()
    }

    pub fn rewards(&self) -> Arc<RewardsEngine> {
        self.rewards.clone()
    }

    pub fn arena(&self) -> Arc<ArenaEngine> {
        self.arena.clone()
    }

    pub fn registry(&self) -> Arc<RoomRegistry> {
        self.registry.clone()
    }
}

fn build_storage(config: &NodeConfig) -> Result<Arc<dyn LedgerStorage>> {
    match config.storage.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryStorage::new())),
        #[cfg(feature = "rocksdb")]
        "rocksdb" => {
            let path = config.node.data_dir.join("ledger");
            std::fs::create_dir_all(&path)
                .with_context(|| format!("creating data dir {}", path.display()))?;
            let storage = tally_ledger::RocksDbStorage::new(&path.to_string_lossy())?;
            Ok(Arc::new(storage))
        }
        #[cfg(not(feature = "rocksdb"))]
        "rocksdb" => bail!("storage backend 'rocksdb' requires building with the `rocksdb` feature"),
        other => bail!("unknown storage backend '{}'", other),
    }
}
