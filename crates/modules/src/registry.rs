//! The registry core code talks to instead of modules.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;

use tracing::{error, info, warn};

use vigil_signals::Signal;

use crate::manifest::ModuleManifest;
use crate::{ContextProvider, DashboardPage, Module, ModuleRoute, StateView};

/// Crashes within this window before a module is shut off.
const FAILURE_WINDOW_MS: i64 = 3_600_000;
const FAILURE_LIMIT: usize = 3;

#[derive(Default)]
struct FailureLog {
    /// Recent crash timestamps per module.
    crashes: HashMap<String, Vec<i64>>,
    /// Modules switched off for this process lifetime.
    disabled: HashSet<String>,
}

#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Box<dyn Module>>,
    manifests: BTreeMap<String, ModuleManifest>,
    failures: Mutex<FailureLog>,
}

impl ModuleRegistry {
    pub fn with_manifests(manifests: BTreeMap<String, ModuleManifest>) -> Self {
        Self {
            modules: Vec::new(),
            manifests,
            failures: Mutex::new(FailureLog::default()),
        }
    }

    /// Register a module unless its manifest disables it.  Modules without a
    /// manifest are enabled by default.
    pub fn register(&mut self, module: Box<dyn Module>) {
        let name = module.name().to_string();
        let enabled = self
            .manifests
            .get(&name)
            .map(|m| m.enabled)
            .unwrap_or(true);
        if !enabled {
            info!(module = %name, "module disabled by manifest");
            return;
        }
        info!(module = %name, "module registered");
        self.modules.push(module);
    }

    pub fn settings_for(&self, name: &str) -> Option<&toml::Table> {
        self.manifests.get(name).map(|m| &m.settings)
    }

    pub fn names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Run every module detector.  A panicking detector is logged and
    /// contributes nothing; three crashes inside an hour switch the module
    /// off for the rest of this process's lifetime.
    pub fn detect_all(&self, state: &StateView) -> Vec<Signal> {
        let mut signals = Vec::new();
        for module in &self.modules {
            let name = module.name();
            if self.is_disabled(name) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| module.detect_signals(state))) {
                Ok(found) => signals.extend(found),
                Err(_) => {
                    warn!(module = %name, "module detector panicked — treated as empty");
                    self.record_failure(name, state.now_ms);
                }
            }
        }
        signals
    }

    pub fn disabled_modules(&self) -> Vec<String> {
        self.failures
            .lock()
            .map(|log| log.disabled.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn is_disabled(&self, name: &str) -> bool {
        self.failures
            .lock()
            .map(|log| log.disabled.contains(name))
            .unwrap_or(false)
    }

    fn record_failure(&self, name: &str, now_ms: i64) {
        let Ok(mut log) = self.failures.lock() else {
            return;
        };
        let crashes = log.crashes.entry(name.to_string()).or_default();
        crashes.push(now_ms);
        crashes.retain(|&ts| now_ms - ts < FAILURE_WINDOW_MS);
        if crashes.len() >= FAILURE_LIMIT {
            error!(module = %name, crashes = crashes.len(), "module disabled for this process lifetime");
            log.disabled.insert(name.to_string());
        }
    }

    /// First registered module that briefs this signal's type wins.
    pub fn brief_for(&self, signal: &Signal) -> Option<String> {
        self.modules
            .iter()
            .filter(|m| m.brief_types().iter().any(|t| t == &signal.kind))
            .find_map(|m| m.brief(signal))
    }

    /// Every module's context-provider outputs, in registration order.
    pub fn context_blocks(&self) -> Vec<String> {
        self.modules
            .iter()
            .flat_map(|m| m.context_providers())
            .map(|provider| provider())
            .filter(|block| !block.trim().is_empty())
            .collect()
    }

    pub fn providers(&self) -> Vec<ContextProvider> {
        self.modules
            .iter()
            .flat_map(|m| m.context_providers())
            .collect()
    }

    pub fn expensive_signal_types(&self) -> HashSet<String> {
        self.modules
            .iter()
            .flat_map(|m| m.expensive_signal_types())
            .collect()
    }

    /// State keys of every registered module, for snapshot preparation.
    pub fn state_keys(&self) -> Vec<String> {
        self.modules
            .iter()
            .filter_map(|m| m.state_key())
            .collect()
    }

    /// Writeback targets for a dispatched signal: `(state_key, field)` pairs
    /// to stamp with the handling timestamp.
    pub fn writeback_targets(&self, signal: &Signal) -> Vec<(String, String)> {
        self.modules
            .iter()
            .filter_map(|m| {
                let key = m.state_key()?;
                let field = m.state_key_map().remove(&signal.kind)?;
                Some((key, field))
            })
            .collect()
    }

    pub fn api_routes(&self) -> Vec<(String, ModuleRoute)> {
        self.modules
            .iter()
            .flat_map(|m| {
                let name = m.name().to_string();
                m.api_routes().into_iter().map(move |r| (name.clone(), r))
            })
            .collect()
    }

    pub fn dashboard_pages(&self) -> Vec<DashboardPage> {
        self.modules
            .iter()
            .flat_map(|m| m.dashboard_pages())
            .collect()
    }

    pub fn message_categories(&self) -> HashMap<String, String> {
        let mut categories = HashMap::new();
        for module in &self.modules {
            categories.extend(module.message_categories());
        }
        categories
    }

    pub fn any_urgent_work(&self, state: &StateView) -> bool {
        self.modules.iter().any(|m| m.has_urgent_work(state))
    }
}

#[cfg(test)]
mod tests {
    use vigil_signals::Urgency;

    use super::*;

    struct Habits;

    impl Module for Habits {
        fn name(&self) -> &str {
            "habits"
        }

        fn detect_signals(&self, state: &StateView) -> Vec<Signal> {
            if state.quiet_hours {
                Vec::new()
            } else {
                vec![Signal::new("habit_due", Urgency::Low, "morning stretch")]
            }
        }

        fn brief_types(&self) -> Vec<String> {
            vec!["habit_due".to_string()]
        }

        fn brief(&self, signal: &Signal) -> Option<String> {
            Some(format!("HABIT: {}", signal.summary))
        }

        fn state_key(&self) -> Option<String> {
            Some("habits-state".to_string())
        }

        fn state_key_map(&self) -> HashMap<String, String> {
            HashMap::from([("habit_due".to_string(), "last_reminded_at".to_string())])
        }

        fn has_urgent_work(&self, _state: &StateView) -> bool {
            false
        }
    }

    struct Panicky;

    impl Module for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        fn detect_signals(&self, _state: &StateView) -> Vec<Signal> {
            panic!("bug in module");
        }
    }

    #[test]
    fn empty_registry_returns_empty_collections() {
        let registry = ModuleRegistry::default();
        assert!(registry.detect_all(&StateView::default()).is_empty());
        assert!(registry.context_blocks().is_empty());
        assert!(registry.expensive_signal_types().is_empty());
        assert!(!registry.any_urgent_work(&StateView::default()));
    }

    #[test]
    fn panicking_detector_is_contained() {
        let mut registry = ModuleRegistry::default();
        registry.register(Box::new(Panicky));
        registry.register(Box::new(Habits));

        let signals = registry.detect_all(&StateView::default());
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, "habit_due");
    }

    #[test]
    fn three_crashes_in_an_hour_disable_the_module() {
        let mut registry = ModuleRegistry::default();
        registry.register(Box::new(Panicky));

        for i in 0..3 {
            let state = StateView {
                now_ms: i * 60_000,
                ..Default::default()
            };
            registry.detect_all(&state);
        }
        assert_eq!(registry.disabled_modules(), vec!["panicky".to_string()]);

        // Crashes spread wider than the window never trip the limit.
        let mut slow = ModuleRegistry::default();
        slow.register(Box::new(Panicky));
        for i in 0..3 {
            let state = StateView {
                now_ms: i * 2 * 3_600_000,
                ..Default::default()
            };
            slow.detect_all(&state);
        }
        assert!(slow.disabled_modules().is_empty());
    }

    #[test]
    fn brief_builder_matches_by_type() {
        let mut registry = ModuleRegistry::default();
        registry.register(Box::new(Habits));

        let signal = Signal::new("habit_due", Urgency::Low, "morning stretch");
        assert_eq!(
            registry.brief_for(&signal),
            Some("HABIT: morning stretch".to_string())
        );
        let other = Signal::new("unrelated", Urgency::Low, "x");
        assert_eq!(registry.brief_for(&other), None);
    }

    #[test]
    fn writeback_targets_follow_the_state_key_map() {
        let mut registry = ModuleRegistry::default();
        registry.register(Box::new(Habits));

        let signal = Signal::new("habit_due", Urgency::Low, "x");
        let targets = registry.writeback_targets(&signal);
        assert_eq!(
            targets,
            vec![("habits-state".to_string(), "last_reminded_at".to_string())]
        );
    }

    #[test]
    fn manifest_can_disable_a_module() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("habits.toml"),
            "module = \"habits\"\nenabled = false\n",
        )
        .unwrap();
        let manifests = crate::load_manifests(dir.path());

        let mut registry = ModuleRegistry::with_manifests(manifests);
        registry.register(Box::new(Habits));
        assert!(registry.is_empty());
    }
}
