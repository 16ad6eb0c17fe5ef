//! Memory guardian: graduated RSS-pressure tiers, a bounded snapshot ring,
//! chronic-pressure detection, and the deterministic cache shedder.
//!
//! The guardian is read-only to everything except itself: it samples the
//! process, persists its own ring, and at SHED and above evicts cache
//! keys from the KV store.  It never dials the LLM and never talks to the
//! user directly; alerts go through the out-of-band notifier.

mod shed;
mod snapshot;
mod tiers;

use sysinfo::{Pid, ProcessRefreshKind, System};
use tracing::{info, warn};

use vigil_signals::{Signal, Urgency};
use vigil_store::Store;
use vigil_transport::Notifier;

pub use shed::{MEMORY_TIERS_KEY, MemoryTierEntry, TierLevel, fingerprint};
pub use snapshot::{HeapSnapshot, SNAPSHOTS_KEY, SnapshotRing, Trend};
pub use tiers::PressureTier;

const MINUTE_MS: i64 = 60_000;

/// One sampled reading of the process.
#[derive(Debug, Clone, Copy)]
pub struct MemSample {
    pub rss_mb: f64,
    pub heap_used_mb: f64,
}

type Sampler = Box<dyn Fn() -> MemSample + Send>;

/// What one guardian tick decided.
#[derive(Debug, Clone, Default)]
pub struct GuardVerdict {
    pub signal: Option<Signal>,
    pub shed_ran: bool,
    pub notified: bool,
    /// Set at RESTART tier or on chronic pressure; the runtime turns this
    /// into a graceful restart (exit code 3).
    pub restart_recommended: bool,
}

pub struct MemoryGuardian {
    limit_mb: f64,
    chronic_window_ms: i64,
    chronic_threshold: f64,
    shed_cooldown_ms: i64,
    alert_cooldown_ms: i64,
    protected_keys: Vec<String>,
    max_tracked_tiers: usize,
    ring: SnapshotRing,
    last_shed_at: Option<i64>,
    last_alert_at: Option<i64>,
    sampler: Sampler,
}

impl MemoryGuardian {
    pub fn new(config: &vigil_config::MemoryConfig) -> Self {
        Self::with_sampler(config, Box::new(sysinfo_sampler()))
    }

    pub fn with_sampler(config: &vigil_config::MemoryConfig, sampler: Sampler) -> Self {
        Self {
            limit_mb: config.limit_mb as f64,
            chronic_window_ms: config.chronic_window_minutes * MINUTE_MS,
            chronic_threshold: config.chronic_threshold,
            shed_cooldown_ms: config.shed_cooldown_minutes * MINUTE_MS,
            alert_cooldown_ms: config.alert_cooldown_minutes * MINUTE_MS,
            protected_keys: config.protected_keys.clone(),
            max_tracked_tiers: config.max_tracked_tiers,
            ring: SnapshotRing::default(),
            last_shed_at: None,
            last_alert_at: None,
            sampler,
        }
    }

    /// Restore the snapshot ring from the store at startup.
    pub fn load_ring(&mut self, store: &Store) {
        if let Ok(Some(ring)) = store.kv_get::<SnapshotRing>(SNAPSHOTS_KEY) {
            self.ring = ring;
        }
    }

    pub fn ring(&self) -> &SnapshotRing {
        &self.ring
    }

    pub fn trend(&self) -> Trend {
        self.ring.trend()
    }

    /// One guardian pass, driven by the agent loop every tick.
    pub fn tick(&mut self, store: &Store, notifier: &Notifier, now_ms: i64) -> GuardVerdict {
        let sample = (self.sampler)();
        let heap_pct = if self.limit_mb > 0.0 {
            (sample.rss_mb / self.limit_mb) * 100.0
        } else {
            0.0
        };
        let tier = PressureTier::for_pct(heap_pct);

        self.ring.push(HeapSnapshot {
            ts: now_ms,
            heap_pct,
            heap_used_mb: sample.heap_used_mb,
            rss_mb: sample.rss_mb,
            tier,
        });
        if let Err(err) = store.kv_set(SNAPSHOTS_KEY, &self.ring) {
            warn!(%err, "failed to persist heap snapshot ring");
        }

        let chronic = self.ring.is_chronic(
            now_ms,
            self.chronic_window_ms,
            self.chronic_threshold,
            PressureTier::Warn.max_pct(),
        );

        let mut verdict = GuardVerdict::default();

        if tier >= PressureTier::Shed {
            let cooled = self
                .last_shed_at
                .is_some_and(|at| now_ms - at < self.shed_cooldown_ms);
            if !cooled {
                let freed = self.shed_cache(store);
                self.last_shed_at = Some(now_ms);
                verdict.shed_ran = true;
                info!(freed, heap_pct, "cache shed executed");
            }
        }

        if tier >= PressureTier::Critical {
            let cooled = self
                .last_alert_at
                .is_some_and(|at| now_ms - at < self.alert_cooldown_ms);
            if !cooled {
                notifier.notify(&format!(
                    "CRITICAL memory pressure: RSS {:.0}MB is {heap_pct:.0}% of the {:.0}MB limit (tier {})",
                    sample.rss_mb,
                    self.limit_mb,
                    tier.as_str(),
                ));
                self.last_alert_at = Some(now_ms);
                verdict.notified = true;
            }
        }

        verdict.restart_recommended = tier == PressureTier::Restart || chronic;
        if verdict.restart_recommended {
            warn!(heap_pct, chronic, "graceful restart recommended");
        }

        verdict.signal = pressure_signal(tier, heap_pct, chronic);
        verdict
    }

    pub fn last_pct(&self) -> Option<f64> {
        self.ring.latest().map(|s| s.heap_pct)
    }
}

/// Tier → urgency mapping for the `memory_pressure` signal.  NORMAL stays
/// silent; chronic pressure escalates whatever the tier says.
fn pressure_signal(tier: PressureTier, heap_pct: f64, chronic: bool) -> Option<Signal> {
    let urgency = match tier {
        PressureTier::Normal => return None,
        PressureTier::Warn => Urgency::Low,
        PressureTier::Shed => Urgency::Medium,
        PressureTier::Critical => Urgency::High,
        PressureTier::Restart => Urgency::Critical,
    };
    let urgency = if chronic && urgency < Urgency::Critical {
        Urgency::Critical
    } else {
        urgency
    };
    Some(
        Signal::new(
            "memory_pressure",
            urgency,
            format!("Memory at {heap_pct:.0}% of limit ({})", tier.as_str()),
        )
        .with_data("tier", tier.as_str())
        .with_data("heap_pct", (heap_pct * 10.0).round() / 10.0)
        .with_data("chronic", chronic),
    )
}

fn sysinfo_sampler() -> impl Fn() -> MemSample + Send {
    let pid = Pid::from_u32(std::process::id());
    move || {
        let mut system = System::new();
        system.refresh_process_specifics(pid, ProcessRefreshKind::new().with_memory());
        let (rss, virt) = system
            .process(pid)
            .map(|p| (p.memory(), p.virtual_memory()))
            .unwrap_or((0, 0));
        MemSample {
            rss_mb: rss as f64 / (1024.0 * 1024.0),
            heap_used_mb: virt.min(rss) as f64 / (1024.0 * 1024.0),
        }
    }
}
