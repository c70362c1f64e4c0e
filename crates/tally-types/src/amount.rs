use serde::{Deserialize, Serialize};
use std::fmt;

pub const TALLY_DECIMALS: u32 = 2;
pub const TALLY_BASE_UNIT: u64 = 100; // 10^2

/// Fixed-point currency amount. Never negative by construction.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Self = Self(0);

    pub fn from_value(value: f64) -> Self {
        Self((value * TALLY_BASE_UNIT as f64).round() as u64)
    }

    pub fn from_base_units(units: u64) -> Self {
        Self(units)
    }

    pub fn to_value(&self) -> f64 {
        self.0 as f64 / TALLY_BASE_UNIT as f64
    }

    pub fn to_base_units(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(&self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(&self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn saturating_add(&self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(&self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Fractional share of this amount, rounded to the nearest base unit.
    /// Used for fee math (`percent` is a ratio, e.g. 0.10 for 10%).
    pub fn percent_of(&self, percent: f64) -> Self {
        Self((self.0 as f64 * percent).round() as u64)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} TLY", self.to_value())
    }
}
