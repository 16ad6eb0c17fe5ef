//! On-disk module manifests.
//!
//! A manifest is a small TOML file naming a module and whether it is enabled,
//! plus free-form settings the module interprets itself.  Unknown fields are
//! logged and kept, never rejected, so manifests written for newer builds
//! still load.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

const KNOWN_FIELDS: &[&str] = &["module", "enabled", "settings"];

#[derive(Debug, Clone, Deserialize)]
pub struct ModuleManifest {
    pub module: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub settings: toml::Table,
}

fn default_enabled() -> bool {
    true
}

/// Scan `dir` for `*.toml` manifests.  A missing directory means no modules;
/// an unparseable manifest is skipped with a warning.  Returns manifests
/// keyed by module name (later files win on duplicates, with a warning).
pub fn load_manifests(dir: impl AsRef<Path>) -> BTreeMap<String, ModuleManifest> {
    let dir = dir.as_ref();
    let mut manifests = BTreeMap::new();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => {
            debug!(dir = %dir.display(), "no module manifest directory");
            return manifests;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            continue;
        }
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(path = %path.display(), %err, "unreadable module manifest skipped");
                continue;
            }
        };

        // Shape validation: parse loosely first so extra fields can be
        // reported without failing the load.
        let loose: toml::Table = match raw.parse() {
            Ok(table) => table,
            Err(err) => {
                warn!(path = %path.display(), %err, "unparseable module manifest skipped");
                continue;
            }
        };
        for key in loose.keys() {
            if !KNOWN_FIELDS.contains(&key.as_str()) {
                warn!(path = %path.display(), field = %key, "unknown manifest field kept for forward compatibility");
            }
        }

        let manifest: ModuleManifest = match toml::from_str(&raw) {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(path = %path.display(), %err, "manifest missing required fields — skipped");
                continue;
            }
        };

        if manifests.contains_key(&manifest.module) {
            warn!(module = %manifest.module, path = %path.display(), "duplicate manifest — later file wins");
        }
        debug!(module = %manifest.module, enabled = manifest.enabled, "module manifest loaded");
        manifests.insert(manifest.module.clone(), manifest);
    }

    manifests
}
