//! Cheap-by-default model selection.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use vigil_signals::{Signal, Urgency};

/// Tokens in a signal's text that smell like code or build work, which the
/// cheap model handles poorly.
fn code_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\b(create|build|implement|write|add|refactor|fix|hook|module|\.js|endpoint|function|handler|parser|schema)\b",
        )
        .expect("static regex compiles")
    })
}

#[derive(Debug, Clone)]
pub struct ModelPolicy {
    pub cheap: String,
    pub expensive: String,
    /// Signal types modules have flagged as needing the expensive model.
    pub expensive_signal_types: HashSet<String>,
}

impl ModelPolicy {
    pub fn new(cheap: impl Into<String>, expensive: impl Into<String>) -> Self {
        Self {
            cheap: cheap.into(),
            expensive: expensive.into(),
            expensive_signal_types: HashSet::new(),
        }
    }

    pub fn with_expensive_types(mut self, types: impl IntoIterator<Item = String>) -> Self {
        self.expensive_signal_types.extend(types);
        self
    }

    /// Whether one signal on its own justifies the expensive model.
    pub fn is_expensive_signal(&self, signal: &Signal) -> bool {
        self.expensive_signal_types.contains(&signal.kind)
            || signal.urgency >= Urgency::High
            || code_token_re().is_match(&signal.summary)
    }

    /// Pick the model for a cycle given its picked signals.
    pub fn select<'a>(&'a self, picked: &[Signal]) -> &'a str {
        if picked.iter().any(|s| self.is_expensive_signal(s)) {
            &self.expensive
        } else {
            &self.cheap
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ModelPolicy {
        ModelPolicy::new("cheap-model", "big-model")
            .with_expensive_types(["code_task".to_string()])
    }

    #[test]
    fn default_choice_is_cheap() {
        let picked = vec![Signal::new("followup_due", Urgency::Low, "call mom")];
        assert_eq!(policy().select(&picked), "cheap-model");
    }

    #[test]
    fn code_ish_summary_forces_expensive() {
        let picked = vec![Signal::new(
            "goal_work",
            Urgency::Low,
            "refactor whatsapp.js into modules",
        )];
        assert_eq!(policy().select(&picked), "big-model");
    }

    #[test]
    fn high_urgency_forces_expensive() {
        let picked = vec![Signal::new("cron_failure", Urgency::High, "job broke")];
        assert_eq!(policy().select(&picked), "big-model");
    }

    #[test]
    fn module_flagged_type_forces_expensive() {
        let picked = vec![Signal::new("code_task", Urgency::Low, "tidy the garden")];
        assert_eq!(policy().select(&picked), "big-model");
    }

    #[test]
    fn empty_pick_stays_cheap() {
        assert_eq!(policy().select(&[]), "cheap-model");
    }
}
