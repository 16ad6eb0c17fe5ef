//! The bounded snapshot ring and its trend computation.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::tiers::PressureTier;

/// KV key the ring persists under.
pub const SNAPSHOTS_KEY: &str = "heap-snapshots";

const RING_CAPACITY: usize = 100;
/// Snapshots consulted for the trend.
const TREND_WINDOW: usize = 10;
/// Mean delta below this is noise.
const TREND_DELTA_PCT: f64 = 3.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeapSnapshot {
    pub ts: i64,
    /// RSS as a percentage of the configured limit.
    pub heap_pct: f64,
    pub heap_used_mb: f64,
    pub rss_mb: f64,
    pub tier: PressureTier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Rising,
    Falling,
    Stable,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotRing {
    snapshots: VecDeque<HeapSnapshot>,
}

impl SnapshotRing {
    /// Append, dropping the oldest entry past capacity.  Out-of-order pushes
    /// are ignored to keep the persisted ring monotonic in `ts`.
    pub fn push(&mut self, snapshot: HeapSnapshot) {
        if self
            .snapshots
            .back()
            .is_some_and(|last| snapshot.ts < last.ts)
        {
            return;
        }
        if self.snapshots.len() >= RING_CAPACITY {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(snapshot);
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn latest(&self) -> Option<&HeapSnapshot> {
        self.snapshots.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeapSnapshot> {
        self.snapshots.iter()
    }

    /// Chronic pressure: at least `threshold` (fraction) of the snapshots in
    /// the trailing window sit above the WARN percentage.  An empty window is
    /// never chronic.
    pub fn is_chronic(
        &self,
        now_ms: i64,
        window_ms: i64,
        threshold: f64,
        warn_pct: f64,
    ) -> bool {
        let in_window: Vec<_> = self
            .snapshots
            .iter()
            .filter(|s| now_ms - s.ts <= window_ms)
            .collect();
        if in_window.len() < 3 {
            return false;
        }
        let hot = in_window.iter().filter(|s| s.heap_pct > warn_pct).count();
        (hot as f64 / in_window.len() as f64) >= threshold
    }

    /// Compare the mean heap% of the first vs second half of the last ten
    /// snapshots; a delta under 3% reads as stable.
    pub fn trend(&self) -> Trend {
        let n = self.snapshots.len().min(TREND_WINDOW);
        if n < 4 {
            return Trend::Stable;
        }
        let recent: Vec<f64> = self
            .snapshots
            .iter()
            .skip(self.snapshots.len() - n)
            .map(|s| s.heap_pct)
            .collect();
        let half = n / 2;
        let first: f64 = recent[..half].iter().sum::<f64>() / half as f64;
        let second: f64 = recent[half..].iter().sum::<f64>() / (n - half) as f64;
        let delta = second - first;
        if delta > TREND_DELTA_PCT {
            Trend::Rising
        } else if delta < -TREND_DELTA_PCT {
            Trend::Falling
        } else {
            Trend::Stable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(ts: i64, pct: f64) -> HeapSnapshot {
        HeapSnapshot {
            ts,
            heap_pct: pct,
            heap_used_mb: pct,
            rss_mb: pct,
            tier: PressureTier::for_pct(pct),
        }
    }

    #[test]
    fn ring_caps_at_one_hundred() {
        let mut ring = SnapshotRing::default();
        for i in 0..150 {
            ring.push(snap(i, 50.0));
        }
        assert_eq!(ring.len(), 100);
        assert_eq!(ring.iter().next().unwrap().ts, 50);
    }

    #[test]
    fn out_of_order_push_is_dropped() {
        let mut ring = SnapshotRing::default();
        ring.push(snap(10, 50.0));
        ring.push(snap(5, 50.0));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn rising_trend_needs_three_percent_delta() {
        let mut ring = SnapshotRing::default();
        for i in 0..5 {
            ring.push(snap(i, 60.0));
        }
        for i in 5..10 {
            ring.push(snap(i, 70.0));
        }
        assert_eq!(ring.trend(), Trend::Rising);

        let mut flat = SnapshotRing::default();
        for i in 0..10 {
            flat.push(snap(i, 60.0 + (i % 2) as f64));
        }
        assert_eq!(flat.trend(), Trend::Stable);
    }

    #[test]
    fn chronic_requires_eighty_percent_hot() {
        let mut ring = SnapshotRing::default();
        // 9 of 10 above WARN within the window.
        for i in 0..9 {
            ring.push(snap(i * 1000, 85.0));
        }
        ring.push(snap(9_000, 60.0));
        assert!(ring.is_chronic(9_000, 15 * 60_000, 0.8, 80.0));

        // Half hot is not chronic.
        let mut mixed = SnapshotRing::default();
        for i in 0..10 {
            mixed.push(snap(i * 1000, if i % 2 == 0 { 85.0 } else { 60.0 }));
        }
        assert!(!mixed.is_chronic(9_000, 15 * 60_000, 0.8, 80.0));
    }
}
