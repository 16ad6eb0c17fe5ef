//! Trust engine: per-action-class autonomy levels earned through outcomes.
//!
//! Every action class accumulates success/failure counters.  The level is a
//! composite of success rate, volume, and recency; destructive classes are
//! hard-capped at "propose and wait" no matter how good the record looks.
//! Weekly decay halves the counters so trust keeps having to be re-earned.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use vigil_store::Store;

/// KV key the counters persist under.
pub const TRUST_KEY: &str = "trust-counters";

/// Action classes that may not run unattended regardless of history.
const DESTRUCTIVE_CLASSES: &[&str] = &["delete", "rollback", "restart"];

const DAY_MS: i64 = 86_400_000;
/// A failure this recent caps the class at level 1.
const RECENT_FAILURE_MS: i64 = 3 * DAY_MS;
/// No outcomes for this long caps the class at level 1.
const STALENESS_MS: i64 = 30 * DAY_MS;

/// Autonomy ladder.  Levels 2 and 3 act without waiting; 0 and 1 block on
/// the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AutonomyLevel {
    /// 0: always confirm with the user first.
    AlwaysConfirm,
    /// 1: propose the action and wait.
    ProposeAndWait,
    /// 2: execute, then tell the user.
    ExecuteAndInform,
    /// 3: execute silently.
    ExecuteSilently,
}

impl AutonomyLevel {
    pub fn as_u8(&self) -> u8 {
        match self {
            AutonomyLevel::AlwaysConfirm => 0,
            AutonomyLevel::ProposeAndWait => 1,
            AutonomyLevel::ExecuteAndInform => 2,
            AutonomyLevel::ExecuteSilently => 3,
        }
    }

    fn from_u8(level: u8) -> Self {
        match level {
            0 => AutonomyLevel::AlwaysConfirm,
            1 => AutonomyLevel::ProposeAndWait,
            2 => AutonomyLevel::ExecuteAndInform,
            _ => AutonomyLevel::ExecuteSilently,
        }
    }

    pub fn may_auto_execute(&self) -> bool {
        *self >= AutonomyLevel::ExecuteAndInform
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ClassRecord {
    successes: u64,
    failures: u64,
    last_outcome_at: Option<i64>,
    last_failure_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustEngine {
    classes: HashMap<String, ClassRecord>,
}

impl TrustEngine {
    pub fn load(store: &Store) -> Self {
        store
            .kv_get(TRUST_KEY)
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    pub fn persist(&self, store: &Store) {
        if let Err(err) = store.kv_set(TRUST_KEY, self) {
            tracing::warn!(%err, "failed to persist trust counters");
        }
    }

    pub fn record_outcome(&mut self, class: &str, success: bool, now_ms: i64) {
        let record = self.classes.entry(class.to_string()).or_default();
        if success {
            record.successes += 1;
        } else {
            record.failures += 1;
            record.last_failure_at = Some(now_ms);
        }
        record.last_outcome_at = Some(now_ms);
        debug!(
            class,
            success,
            successes = record.successes,
            failures = record.failures,
            "trust outcome recorded"
        );
    }

    /// Current autonomy level for an action class.
    pub fn autonomy_level(&self, class: &str, now_ms: i64) -> AutonomyLevel {
        let level = self.earned_level(class, now_ms);
        if DESTRUCTIVE_CLASSES.contains(&class) {
            AutonomyLevel::from_u8(level.as_u8().min(1))
        } else {
            level
        }
    }

    fn earned_level(&self, class: &str, now_ms: i64) -> AutonomyLevel {
        let Some(record) = self.classes.get(class) else {
            return AutonomyLevel::AlwaysConfirm;
        };
        let volume = record.successes + record.failures;
        if volume < 5 {
            return AutonomyLevel::AlwaysConfirm;
        }

        let rate = record.successes as f64 / volume as f64;
        let mut level = if rate >= 0.95 && record.successes >= 20 {
            3
        } else if rate >= 0.85 && record.successes >= 10 {
            2
        } else if rate >= 0.70 {
            1
        } else {
            0
        };

        // Recency gates: a fresh failure or a long silence drops auto-execute.
        if record
            .last_failure_at
            .is_some_and(|at| now_ms - at < RECENT_FAILURE_MS)
        {
            level = level.min(1);
        }
        if record
            .last_outcome_at
            .is_some_and(|at| now_ms - at > STALENESS_MS)
        {
            level = level.min(1);
        }

        AutonomyLevel::from_u8(level)
    }

    /// Weekly decay: halve every counter so levels drift toward zero unless
    /// fresh successes keep arriving.
    pub fn apply_weekly_decay(&mut self) {
        for (class, record) in &mut self.classes {
            record.successes /= 2;
            record.failures /= 2;
            debug!(
                class,
                successes = record.successes,
                failures = record.failures,
                "trust decay applied"
            );
        }
        info!(classes = self.classes.len(), "weekly trust decay complete");
    }

    pub fn snapshot(&self) -> Vec<(String, u64, u64)> {
        self.classes
            .iter()
            .map(|(class, r)| (class.clone(), r.successes, r.failures))
            .collect()
    }
}
