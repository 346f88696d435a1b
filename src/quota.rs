//! Daily publish quota per identity tier.
//!
//! The counter lives in the shared [`KeyValueStore`] as a single
//! [`QuotaState`]. Updates are read-modify-write; two processes incrementing
//! at the same instant can lose one update. That race is bounded by the
//! number of concurrent user actions and is accepted rather than locked
//! around, since the store offers no atomic update.

use std::{fmt, str::FromStr, sync::Arc};

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::store::{KeyValueStoreExt, SharedStore, StoreError};

const TIER_KEY: &str = "user_tier";
const STATE_KEY: &str = "quota_state";

/// Subscription tier of the publishing identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Basic,
    Premium,
    Advanced,
}

impl Tier {
    pub fn limit(self) -> Limit {
        match self {
            Tier::Basic => Limit::Bounded(3),
            Tier::Premium => Limit::Bounded(25),
            Tier::Advanced => Limit::Unbounded,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Basic => "basic",
            Tier::Premium => "premium",
            Tier::Advanced => "advanced",
        })
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(Tier::Basic),
            "premium" => Ok(Tier::Premium),
            "advanced" => Ok(Tier::Advanced),
            other => Err(format!("unknown tier {other:?}")),
        }
    }
}

/// Daily ceiling of a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Limit {
    Bounded(u32),
    Unbounded,
}

/// Publishes left today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Remaining {
    Count(u32),
    Unbounded,
}

impl fmt::Display for Remaining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Remaining::Count(n) => write!(f, "{n}"),
            Remaining::Unbounded => f.write_str("unbounded"),
        }
    }
}

/// Persisted usage counter for one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    pub date_key: String,
    pub used: u32,
}

/// Snapshot for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaInfo {
    pub tier: Tier,
    pub limit: Limit,
    pub used: u32,
    pub remaining: Remaining,
    pub can_publish: bool,
}

/// Source of the current calendar day.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Local wall-clock calendar day.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Admission check and usage accounting.
#[derive(Clone)]
pub struct QuotaGate {
    store: SharedStore,
    clock: Arc<dyn Clock>,
}

impl QuotaGate {
    pub fn new(store: SharedStore) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: SharedStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Tier stored for the current identity, `basic` when unset.
    pub fn current_tier(&self) -> Result<Tier, StoreError> {
        Ok(self.store.get_as::<Tier>(TIER_KEY)?.unwrap_or_default())
    }

    pub fn set_tier(&self, tier: Tier) -> Result<(), StoreError> {
        self.store.set_as(TIER_KEY, &tier)?;
        info!(%tier, "tier updated");
        Ok(())
    }

    /// Usage for today, applying the daily rollover first.
    pub fn used_today(&self) -> Result<u32, StoreError> {
        Ok(self.load_today()?.used)
    }

    pub fn can_publish(&self, tier: Tier) -> Result<bool, StoreError> {
        match tier.limit() {
            Limit::Unbounded => Ok(true),
            Limit::Bounded(limit) => Ok(self.used_today()? < limit),
        }
    }

    /// Count one successful publish and return the new total for today.
    pub fn record_usage(&self, tier: Tier) -> Result<u32, StoreError> {
        let mut state = self.load_today()?;
        state.used = state.used.saturating_add(1);
        self.store.set_as(STATE_KEY, &state)?;
        debug!(%tier, used = state.used, date = %state.date_key, "usage recorded");
        Ok(state.used)
    }

    pub fn remaining(&self, tier: Tier) -> Result<Remaining, StoreError> {
        match tier.limit() {
            Limit::Unbounded => Ok(Remaining::Unbounded),
            Limit::Bounded(limit) => Ok(Remaining::Count(limit.saturating_sub(self.used_today()?))),
        }
    }

    pub fn info(&self) -> Result<QuotaInfo, StoreError> {
        let tier = self.current_tier()?;
        Ok(QuotaInfo {
            tier,
            limit: tier.limit(),
            used: self.used_today()?,
            remaining: self.remaining(tier)?,
            can_publish: self.can_publish(tier)?,
        })
    }

    /// Load the stored state, resetting it when it belongs to another day.
    /// A reset is persisted immediately.
    fn load_today(&self) -> Result<QuotaState, StoreError> {
        let today = self.clock.today().format("%Y-%m-%d").to_string();
        match self.store.get_as::<QuotaState>(STATE_KEY)? {
            Some(state) if state.date_key == today => Ok(state),
            stale => {
                let fresh = QuotaState {
                    date_key: today,
                    used: 0,
                };
                if stale.is_some() {
                    debug!(date = %fresh.date_key, "quota rolled over");
                }
                self.store.set_as(STATE_KEY, &fresh)?;
                Ok(fresh)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use parking_lot::Mutex;

    /// Clock whose day can be moved forward by tests.
    pub struct FixedClock(pub Mutex<NaiveDate>);

    impl FixedClock {
        pub fn new(y: i32, m: u32, d: u32) -> Arc<Self> {
            Arc::new(Self(Mutex::new(NaiveDate::from_ymd_opt(y, m, d).unwrap())))
        }

        pub fn advance_day(&self) {
            let mut day = self.0.lock();
            *day = day.succ_opt().unwrap();
        }
    }

    impl Clock for FixedClock {
        fn today(&self) -> NaiveDate {
            *self.0.lock()
        }
    }

    fn gate() -> (QuotaGate, Arc<FixedClock>, SharedStore) {
        let clock = FixedClock::new(2024, 3, 1);
        let store: SharedStore = Arc::new(MemoryStore::new());
        (QuotaGate::with_clock(store.clone(), clock.clone()), clock, store)
    }

    #[test]
    fn basic_tier_exhausts_after_three() {
        let (gate, _, _) = gate();
        assert!(gate.can_publish(Tier::Basic).unwrap());
        for expected in 1..=3 {
            assert_eq!(gate.record_usage(Tier::Basic).unwrap(), expected);
        }
        assert_eq!(gate.remaining(Tier::Basic).unwrap(), Remaining::Count(0));
        assert!(!gate.can_publish(Tier::Basic).unwrap());
    }

    #[test]
    fn day_boundary_resets_usage() {
        let (gate, clock, _) = gate();
        for _ in 0..3 {
            gate.record_usage(Tier::Basic).unwrap();
        }
        assert!(!gate.can_publish(Tier::Basic).unwrap());
        clock.advance_day();
        assert_eq!(gate.used_today().unwrap(), 0);
        assert!(gate.can_publish(Tier::Basic).unwrap());
        assert_eq!(gate.remaining(Tier::Basic).unwrap(), Remaining::Count(3));
    }

    #[test]
    fn rollover_applies_before_increment() {
        let (gate, clock, store) = gate();
        store
            .set(
                STATE_KEY,
                serde_json::json!({"date_key": "1999-01-01", "used": 40}),
            )
            .unwrap();
        assert_eq!(gate.record_usage(Tier::Premium).unwrap(), 1);
        clock.advance_day();
        assert_eq!(gate.record_usage(Tier::Premium).unwrap(), 1);
    }

    #[test]
    fn unbounded_tier_always_admits() {
        let (gate, _, _) = gate();
        for _ in 0..50 {
            gate.record_usage(Tier::Advanced).unwrap();
        }
        assert!(gate.can_publish(Tier::Advanced).unwrap());
        assert_eq!(gate.remaining(Tier::Advanced).unwrap(), Remaining::Unbounded);
    }

    #[test]
    fn remaining_never_negative() {
        let (gate, _, store) = gate();
        store
            .set(
                STATE_KEY,
                serde_json::json!({"date_key": "2024-03-01", "used": 10}),
            )
            .unwrap();
        assert_eq!(gate.remaining(Tier::Basic).unwrap(), Remaining::Count(0));
    }

    #[test]
    fn tier_defaults_to_basic_and_persists() {
        let (gate, _, _) = gate();
        assert_eq!(gate.current_tier().unwrap(), Tier::Basic);
        gate.set_tier(Tier::Premium).unwrap();
        assert_eq!(gate.current_tier().unwrap(), Tier::Premium);
        let info = gate.info().unwrap();
        assert_eq!(info.limit, Limit::Bounded(25));
        assert_eq!(info.remaining, Remaining::Count(25));
        assert!(info.can_publish);
    }

    #[test]
    fn tier_parsing() {
        assert_eq!("Premium".parse::<Tier>().unwrap(), Tier::Premium);
        assert!("gold".parse::<Tier>().is_err());
        assert_eq!(Tier::Advanced.to_string(), "advanced");
    }
}
