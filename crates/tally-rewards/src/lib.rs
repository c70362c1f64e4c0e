pub mod engine;

pub use engine::{Applied, ApprovalOutcome, Milestone, RewardsConfig, RewardsEngine};
