//! RSS-pressure tiers.

use serde::{Deserialize, Serialize};

/// Graduated pressure ladder over RSS as a percentage of the configured
/// process limit.  Each tier's `max_pct` is inclusive: 70% is still NORMAL,
/// 71% is WARN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PressureTier {
    Normal,
    Warn,
    Shed,
    Critical,
    Restart,
}

impl PressureTier {
    pub fn for_pct(heap_pct: f64) -> Self {
        if heap_pct <= 70.0 {
            PressureTier::Normal
        } else if heap_pct <= 80.0 {
            PressureTier::Warn
        } else if heap_pct <= 90.0 {
            PressureTier::Shed
        } else if heap_pct <= 96.0 {
            PressureTier::Critical
        } else {
            PressureTier::Restart
        }
    }

    pub fn max_pct(&self) -> f64 {
        match self {
            PressureTier::Normal => 70.0,
            PressureTier::Warn => 80.0,
            PressureTier::Shed => 90.0,
            PressureTier::Critical => 96.0,
            PressureTier::Restart => 100.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PressureTier::Normal => "NORMAL",
            PressureTier::Warn => "WARN",
            PressureTier::Shed => "SHED",
            PressureTier::Critical => "CRITICAL",
            PressureTier::Restart => "RESTART",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_boundaries() {
        assert_eq!(PressureTier::for_pct(70.0), PressureTier::Normal);
        assert_eq!(PressureTier::for_pct(71.0), PressureTier::Warn);
        assert_eq!(PressureTier::for_pct(81.0), PressureTier::Shed);
        assert_eq!(PressureTier::for_pct(91.0), PressureTier::Critical);
        assert_eq!(PressureTier::for_pct(97.0), PressureTier::Restart);
    }

    #[test]
    fn tiers_are_ordered() {
        assert!(PressureTier::Normal < PressureTier::Warn);
        assert!(PressureTier::Critical < PressureTier::Restart);
    }
}
