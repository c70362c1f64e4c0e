use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use tally_arena::ArenaConfig;
use tally_rewards::{Milestone, RewardsConfig};
use tally_types::Amount;

/// Whole-node configuration, one section per subsystem. Monetary values are
/// written in display units ("77.0" meaning 77.00 TLY) and converted to
/// fixed-point on the way in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSettings,
    pub storage: StorageSettings,
    pub ledger: LedgerSettings,
    pub rewards: RewardsSettings,
    pub arena: ArenaSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub data_dir: PathBuf,
    pub name: String,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            name: "tally-node".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// "memory" or "rocksdb" (the latter requires the `rocksdb` feature).
    pub backend: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    /// Share of every gift burned as a fee.
    pub gift_fee_percent: f64,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            gift_fee_percent: 0.10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardsSettings {
    pub invite_reward: f64,
    pub milestones: Vec<MilestoneSettings>,
    pub min_withdrawal: f64,
    pub withdrawal_fee_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneSettings {
    pub threshold: u32,
    pub bonus: f64,
}

impl Default for RewardsSettings {
    fn default() -> Self {
        let defaults = RewardsConfig::default();
        Self {
            invite_reward: defaults.invite_reward.to_value(),
            milestones: defaults
                .milestones
                .iter()
                .map(|m| MilestoneSettings {
                    threshold: m.threshold,
                    bonus: m.bonus.to_value(),
                })
                .collect(),
            min_withdrawal: defaults.min_withdrawal.to_value(),
            withdrawal_fee_percent: defaults.withdrawal_fee_percent,
        }
    }
}

impl From<RewardsSettings> for RewardsConfig {
    fn from(settings: RewardsSettings) -> Self {
        RewardsConfig {
            invite_reward: Amount::from_value(settings.invite_reward),
            milestones: settings
                .milestones
                .into_iter()
                .map(|m| Milestone {
                    threshold: m.threshold,
                    bonus: Amount::from_value(m.bonus),
                })
                .collect(),
            min_withdrawal: Amount::from_value(settings.min_withdrawal),
            withdrawal_fee_percent: settings.withdrawal_fee_percent,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaSettings {
    pub min_bet: f64,
    pub fee_percent: f64,
}

impl Default for ArenaSettings {
    fn default() -> Self {
        let defaults = ArenaConfig::default();
        Self {
            min_bet: defaults.min_bet.to_value(),
            fee_percent: defaults.fee_percent,
        }
    }
}

impl From<ArenaSettings> for ArenaConfig {
    fn from(settings: ArenaSettings) -> Self {
        ArenaConfig {
            min_bet: Amount::from_value(settings.min_bet),
            fee_percent: settings.fee_percent,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty", "compact" or "json".
    pub format: String,
    pub file_output: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_output: None,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSettings::default(),
            storage: StorageSettings::default(),
            ledger: LedgerSettings::default(),
            rewards: RewardsSettings::default(),
            arena: ArenaSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Environment variables take precedence over file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(data_dir) = env::var("TALLY_DATA_DIR") {
            self.node.data_dir = PathBuf::from(data_dir);
        }
        if let Ok(backend) = env::var("TALLY_STORAGE_BACKEND") {
            self.storage.backend = backend;
        }
        if let Ok(level) = env::var("TALLY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = env::var("TALLY_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}
