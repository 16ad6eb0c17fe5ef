//! Pluggable modules: optional detectors, brief builders, context providers,
//! urgent-work gates, and operator-surface contributions.
//!
//! Core code never imports a module directly; everything goes through the
//! [`ModuleRegistry`], whose accessors return empty collections when nothing
//! is registered.  Manifests on disk enable, disable, and configure modules
//! by name; their shape is validated loosely so newer manifests keep loading
//! on older builds.

mod manifest;
mod registry;

use std::collections::HashMap;
use std::sync::Arc;

use vigil_signals::Signal;

pub use manifest::{ModuleManifest, load_manifests};
pub use registry::ModuleRegistry;

/// Read-only state snapshot handed to module detectors each tick.  Prepared
/// by the orchestrator so detectors stay cheap: no I/O, no network.
#[derive(Debug, Clone, Default)]
pub struct StateView {
    pub now_ms: i64,
    pub quiet_hours: bool,
    /// Each registered module's state blob, keyed by its `state_key`.
    pub module_state: HashMap<String, serde_json::Value>,
}

/// A function contributing background text to every cycle's prompt.
pub type ContextProvider = Arc<dyn Fn() -> String + Send + Sync>;

/// A module-contributed operator route, mounted by the runtime under
/// `/modules/<module>/<path>`.
#[derive(Clone)]
pub struct ModuleRoute {
    pub method: &'static str,
    pub path: String,
    pub handler: Arc<dyn Fn(serde_json::Value) -> anyhow::Result<serde_json::Value> + Send + Sync>,
}

#[derive(Debug, Clone)]
pub struct DashboardPage {
    pub slug: String,
    pub title: String,
}

/// The manifest contract.  Every method is optional; a module implements the
/// subset it cares about and inherits empty defaults for the rest.
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    /// Cheap, synchronous detection over the prepared snapshot.
    fn detect_signals(&self, _state: &StateView) -> Vec<Signal> {
        Vec::new()
    }

    /// Signal types this module can brief.
    fn brief_types(&self) -> Vec<String> {
        Vec::new()
    }

    /// Build the prompt fragment for one of this module's signals.
    fn brief(&self, _signal: &Signal) -> Option<String> {
        None
    }

    fn context_providers(&self) -> Vec<ContextProvider> {
        Vec::new()
    }

    /// Signal types that should force the expensive model.
    fn expensive_signal_types(&self) -> Vec<String> {
        Vec::new()
    }

    /// KV key holding this module's state blob, if it keeps one.
    fn state_key(&self) -> Option<String> {
        None
    }

    /// `signal type → state field` writeback targets for last-handled-at
    /// stamps after a signal of that type is dispatched.
    fn state_key_map(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    fn api_routes(&self) -> Vec<ModuleRoute> {
        Vec::new()
    }

    fn dashboard_pages(&self) -> Vec<DashboardPage> {
        Vec::new()
    }

    /// `message prefix → category` hints merged into the router's tables.
    fn message_categories(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Bypasses the quiet-hours interval extension when `true`.
    fn has_urgent_work(&self, _state: &StateView) -> bool {
        false
    }
}
