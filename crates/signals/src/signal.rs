//! The signal record and its identity rules.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordered urgency ladder.  Ordering is load-bearing: the picker sorts on it
/// and the cooldown policy keys off it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Medium => "medium",
            Urgency::High => "high",
            Urgency::Critical => "critical",
        }
    }
}

/// A structured observation produced by a detector, candidate for attention
/// this cycle.  Synthesized fresh every tick; consumed exactly once when
/// picked, discarded otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// Open-ended type tag ("followup_due", "cron_due", module-defined, ...).
    pub kind: String,
    pub urgency: Urgency,
    pub summary: String,
    /// Opaque payload; key fields for identity live here.
    #[serde(default)]
    pub data: serde_json::Map<String, Value>,
    /// When the underlying obligation came due (drives age escalation).
    pub due_at: Option<i64>,
    pub created_at: Option<i64>,
}

impl Signal {
    pub fn new(kind: impl Into<String>, urgency: Urgency, summary: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            urgency,
            summary: summary.into(),
            data: serde_json::Map::new(),
            due_at: None,
            created_at: None,
        }
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn with_due_at(mut self, ts: i64) -> Self {
        self.due_at = Some(ts);
        self
    }

    pub fn with_created_at(mut self, ts: i64) -> Self {
        self.created_at = Some(ts);
        self
    }

    fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Cooldown identity: the type plus its type-specific key fields.  Two
    /// signals with the same key are the same obligation resurfacing.
    pub fn key(&self) -> String {
        let discriminator = match self.kind.as_str() {
            "followup_due" => self.data_str("topic"),
            "cron_due" | "cron_failure" => self.data_str("cron_id"),
            "goal_stale" | "goal_work" => self.data_str("goal_id"),
            "capability_gap" => self.data_str("gap_id"),
            "experiment_concluded" => self.data_str("experiment_id"),
            "memory_pressure" => self.data_str("tier"),
            _ => None,
        };
        match discriminator {
            Some(field) => format!("{}:{}", self.kind, field),
            None => self.kind.clone(),
        }
    }

    /// The instant age escalation measures from.
    pub fn reference_ts(&self) -> Option<i64> {
        self.due_at.or(self.created_at)
    }
}

// ─── followups ───────────────────────────────────────────────────────────────

/// KV key holding the pending followup list.
pub const FOLLOWUPS_KEY: &str = "pending-followups";

/// A topic the agent promised itself to revisit.  Created by the LLM via a
/// `followup` tag, surfaces as a `followup_due` signal, consumed on action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Followup {
    pub topic: String,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urgency_orders_low_to_critical() {
        assert!(Urgency::Low < Urgency::Medium);
        assert!(Urgency::Medium < Urgency::High);
        assert!(Urgency::High < Urgency::Critical);
    }

    #[test]
    fn key_includes_type_specific_fields() {
        let a = Signal::new("followup_due", Urgency::Low, "x").with_data("topic", "taxes");
        let b = Signal::new("followup_due", Urgency::Low, "y").with_data("topic", "gym");
        assert_eq!(a.key(), "followup_due:taxes");
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn unknown_types_key_on_kind_alone() {
        let s = Signal::new("module_custom", Urgency::Medium, "x").with_data("foo", "bar");
        assert_eq!(s.key(), "module_custom");
    }
}
