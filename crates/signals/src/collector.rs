//! Escalation, cooldown filtering, ranking, and the final pick.

use tracing::debug;

use crate::cooldown::{CooldownMap, CooldownPolicy};
use crate::signal::{Signal, Urgency};

const DAY_MS: i64 = 86_400_000;

/// Overdue this long, low becomes medium.
const ESCALATE_MEDIUM_MS: i64 = 4 * DAY_MS;
/// Overdue this long, medium becomes high.
const ESCALATE_HIGH_MS: i64 = 14 * DAY_MS;

/// At most this many signals get attention per cycle.
const MAX_PICKED: usize = 2;

/// Result of one collection pass.
#[derive(Debug, Clone)]
pub struct PickOutcome {
    pub picked: Vec<Signal>,
    /// Signals that survived cooldowns but lost the ranking.  Discarded; a
    /// detector will re-synthesize them next cycle if they still matter.
    pub passed_over: usize,
    pub suppressed: usize,
    pub any_critical: bool,
}

/// Full pipeline over already-detected signals: escalate by age, drop the
/// cooled-down ones, rank, pick.  Marks picked signals as fired in `cooldowns`
/// (the caller persists the map).
pub fn collect(
    mut signals: Vec<Signal>,
    cooldowns: &mut CooldownMap,
    policy: &CooldownPolicy,
    now_ms: i64,
    is_expensive: impl Fn(&Signal) -> bool,
) -> PickOutcome {
    for signal in &mut signals {
        escalate_by_age(signal, now_ms);
    }

    let before = signals.len();
    let survivors: Vec<Signal> = signals
        .into_iter()
        .filter(|s| !cooldowns.is_suppressed(s, policy, now_ms))
        .collect();
    let suppressed = before - survivors.len();
    let any_critical = survivors.iter().any(|s| s.urgency == Urgency::Critical);

    let total = survivors.len();
    let picked = pick_signals(survivors, now_ms, is_expensive);
    for signal in &picked {
        cooldowns.mark_fired(signal, now_ms);
    }

    debug!(
        total,
        suppressed,
        picked = picked.len(),
        "signal collection pass complete"
    );

    PickOutcome {
        passed_over: total - picked.len(),
        suppressed,
        any_critical,
        picked,
    }
}

/// Urgency climbs as the obligation ages: low → medium at 4 days overdue,
/// medium → high at 14.  Critical is never synthesized by aging.
fn escalate_by_age(signal: &mut Signal, now_ms: i64) {
    let Some(reference) = signal.reference_ts() else {
        return;
    };
    let overdue = now_ms - reference;
    if overdue >= ESCALATE_HIGH_MS && signal.urgency <= Urgency::Medium {
        signal.urgency = Urgency::High;
    } else if overdue >= ESCALATE_MEDIUM_MS && signal.urgency == Urgency::Low {
        signal.urgency = Urgency::Medium;
    }
}

/// Sort by urgency then by age (older first) and keep up to two, with at most
/// one expensive-model signal in the pick.  Two low-tier signals are allowed
/// to ride together; they fold into a single briefing downstream.
pub fn pick_signals(
    mut signals: Vec<Signal>,
    now_ms: i64,
    is_expensive: impl Fn(&Signal) -> bool,
) -> Vec<Signal> {
    signals.sort_by(|a, b| {
        b.urgency.cmp(&a.urgency).then_with(|| {
            let age_a = now_ms - a.reference_ts().unwrap_or(now_ms);
            let age_b = now_ms - b.reference_ts().unwrap_or(now_ms);
            age_b.cmp(&age_a)
        })
    });

    let mut picked: Vec<Signal> = Vec::new();
    let mut expensive_taken = false;
    for signal in signals {
        if picked.len() >= MAX_PICKED {
            break;
        }
        let expensive = is_expensive(&signal);
        if expensive && expensive_taken {
            continue;
        }
        expensive_taken |= expensive;
        picked.push(signal);
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(kind: &str, urgency: Urgency) -> Signal {
        Signal::new(kind, urgency, format!("{kind} happened"))
    }

    #[test]
    fn five_day_old_low_signal_escalates_to_medium() {
        let now = 20 * DAY_MS;
        let mut s = signal("followup_due", Urgency::Low).with_created_at(now - 5 * DAY_MS);
        escalate_by_age(&mut s, now);
        assert_eq!(s.urgency, Urgency::Medium);
    }

    #[test]
    fn fifteen_day_old_signal_escalates_to_high() {
        let now = 20 * DAY_MS;
        let mut s = signal("followup_due", Urgency::Low).with_created_at(now - 15 * DAY_MS);
        escalate_by_age(&mut s, now);
        assert_eq!(s.urgency, Urgency::High);
    }

    #[test]
    fn pick_caps_at_two() {
        let signals = vec![
            signal("a", Urgency::Low),
            signal("b", Urgency::Medium),
            signal("c", Urgency::High),
        ];
        let picked = pick_signals(signals, 0, |_| false);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].urgency, Urgency::High);
        assert_eq!(picked[1].urgency, Urgency::Medium);
    }

    #[test]
    fn at_most_one_expensive_signal_per_pick() {
        let signals = vec![
            signal("goal_work", Urgency::High),
            signal("code_review", Urgency::High),
            signal("followup_due", Urgency::Low),
        ];
        let picked = pick_signals(signals, 0, |s| s.urgency >= Urgency::High);
        assert_eq!(picked.len(), 2);
        let expensive = picked.iter().filter(|s| s.urgency >= Urgency::High).count();
        assert_eq!(expensive, 1);
    }

    #[test]
    fn older_signal_wins_within_the_same_urgency() {
        let now = 30 * DAY_MS;
        let signals = vec![
            signal("fresh", Urgency::Medium).with_created_at(now - DAY_MS),
            signal("aged", Urgency::Medium).with_created_at(now - 3 * DAY_MS),
        ];
        let picked = pick_signals(signals, now, |_| false);
        assert_eq!(picked[0].kind, "aged");
    }

    #[test]
    fn cooldown_filter_yields_a_valid_subset() {
        let policy = CooldownPolicy::default();
        let mut map = CooldownMap::default();
        let now = 10 * DAY_MS;

        let first = collect(
            vec![signal("a", Urgency::Low), signal("b", Urgency::Low)],
            &mut map,
            &policy,
            now,
            |_| false,
        );
        assert_eq!(first.picked.len(), 2);

        // Same detections immediately after: both are inside the window.
        let second = collect(
            vec![signal("a", Urgency::Low), signal("b", Urgency::Low)],
            &mut map,
            &policy,
            now + 1,
            |_| false,
        );
        assert!(second.picked.is_empty());
        assert_eq!(second.suppressed, 2);
    }

    #[test]
    fn critical_flag_reported_even_when_not_picked_first() {
        let policy = CooldownPolicy::default();
        let mut map = CooldownMap::default();
        let outcome = collect(
            vec![signal("mem", Urgency::Critical)],
            &mut map,
            &policy,
            0,
            |_| false,
        );
        assert!(outcome.any_critical);
    }
}
