//! Per-signal-key suppression windows.
//!
//! Low-urgency observations repeat slowly, medium ones hourly, and anything
//! high or critical is never suppressed; regardless of whether the signal
//! came from a core detector or a module.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::signal::{Signal, Urgency};

/// KV key the cooldown map is persisted under.
pub const COOLDOWN_KEY: &str = "signal-cooldowns";

#[derive(Debug, Clone, Copy)]
pub struct CooldownPolicy {
    pub low_ms: i64,
    pub medium_ms: i64,
}

impl CooldownPolicy {
    pub fn from_minutes(low_minutes: i64, medium_minutes: i64) -> Self {
        Self {
            low_ms: low_minutes * 60_000,
            medium_ms: medium_minutes * 60_000,
        }
    }

    pub fn window_ms(&self, urgency: Urgency) -> i64 {
        match urgency {
            Urgency::Low => self.low_ms,
            Urgency::Medium => self.medium_ms,
            Urgency::High | Urgency::Critical => 0,
        }
    }
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self::from_minutes(180, 60)
    }
}

/// `signal key → last fired at` map, persisted as one KV blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CooldownMap {
    #[serde(flatten)]
    last_fired: HashMap<String, i64>,
}

impl CooldownMap {
    pub fn is_suppressed(&self, signal: &Signal, policy: &CooldownPolicy, now_ms: i64) -> bool {
        let window = policy.window_ms(signal.urgency);
        if window == 0 {
            return false;
        }
        self.last_fired
            .get(&signal.key())
            .is_some_and(|&fired| now_ms - fired < window)
    }

    pub fn mark_fired(&mut self, signal: &Signal, now_ms: i64) {
        self.last_fired.insert(signal.key(), now_ms);
    }

    /// Drop entries idle past the longest window so the blob stays small.
    pub fn prune(&mut self, policy: &CooldownPolicy, now_ms: i64) {
        let horizon = policy.low_ms.max(policy.medium_ms);
        self.last_fired
            .retain(|_, &mut fired| now_ms - fired < horizon);
    }

    pub fn len(&self) -> usize {
        self.last_fired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_fired.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn low(topic: &str) -> Signal {
        Signal::new("followup_due", Urgency::Low, "x").with_data("topic", topic)
    }

    #[test]
    fn second_firing_inside_window_is_suppressed() {
        let policy = CooldownPolicy::default();
        let mut map = CooldownMap::default();
        let signal = low("taxes");

        assert!(!map.is_suppressed(&signal, &policy, 1_000));
        map.mark_fired(&signal, 1_000);
        assert!(map.is_suppressed(&signal, &policy, 1_000 + 60_000));
        assert!(!map.is_suppressed(&signal, &policy, 1_000 + policy.low_ms + 1));
    }

    #[test]
    fn high_urgency_never_cools_down() {
        let policy = CooldownPolicy::default();
        let mut map = CooldownMap::default();
        let signal = Signal::new("cron_failure", Urgency::High, "x").with_data("cron_id", "c1");

        map.mark_fired(&signal, 1_000);
        assert!(!map.is_suppressed(&signal, &policy, 1_001));
    }

    #[test]
    fn distinct_keys_do_not_interfere() {
        let policy = CooldownPolicy::default();
        let mut map = CooldownMap::default();
        map.mark_fired(&low("taxes"), 1_000);
        assert!(!map.is_suppressed(&low("gym"), &policy, 1_001));
    }

    #[test]
    fn prune_drops_stale_entries() {
        let policy = CooldownPolicy::default();
        let mut map = CooldownMap::default();
        map.mark_fired(&low("old"), 0);
        map.mark_fired(&low("fresh"), policy.low_ms);
        map.prune(&policy, policy.low_ms + 1);
        assert_eq!(map.len(), 1);
    }
}
