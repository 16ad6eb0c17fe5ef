//! Learning writeback: links each cycle's signals to the actions they
//! produced, opens hypotheses, and files reflections.

use tracing::warn;
use uuid::Uuid;

use vigil_signals::Signal;
use vigil_store::{ReasoningEntry, ReasoningKind, Store};

use crate::parser::ParsedActions;

/// Journal the signal → action linkage for one cycle, plus any hypothesis or
/// reflection tags the reply carried.  Outcomes arrive later through reply
/// outcomes and experiment checks, closing the loop.
pub fn record_cycle_learning(
    store: &Store,
    picked: &[Signal],
    actions: &ParsedActions,
    now_ms: i64,
) {
    if !picked.is_empty() && !actions.actions_taken.is_empty() {
        let signal_keys = picked
            .iter()
            .map(|s| s.key())
            .collect::<Vec<_>>()
            .join(", ");
        let acted = actions.actions_taken.join("; ");
        insert(
            store,
            ReasoningKind::Evidence,
            format!("signals [{signal_keys}] led to: {acted}"),
            0.5,
            "closed",
            None,
            now_ms,
        );
    }

    for hypothesis in &actions.hypotheses {
        insert(
            store,
            ReasoningKind::Hypothesis,
            hypothesis.clone(),
            0.5,
            "open",
            None,
            now_ms,
        );
    }

    for reflection in &actions.reflections {
        insert(
            store,
            ReasoningKind::Conclusion,
            reflection.clone(),
            0.6,
            "closed",
            None,
            now_ms,
        );
    }
}

fn insert(
    store: &Store,
    kind: ReasoningKind,
    content: String,
    confidence: f64,
    status: &str,
    related_id: Option<String>,
    now_ms: i64,
) {
    let entry = ReasoningEntry {
        id: Uuid::new_v4().to_string(),
        kind,
        content,
        confidence,
        status: status.to_string(),
        related_id,
        ts: now_ms,
    };
    if let Err(err) = store.insert_reasoning(&entry) {
        warn!(%err, "failed to write learning journal entry");
    }
}

#[cfg(test)]
mod tests {
    use vigil_clock::Clock;
    use vigil_signals::Urgency;

    use crate::parser::parse_response;

    use super::*;

    #[test]
    fn cycle_learning_links_signals_to_actions() {
        let store = Store::open_in_memory(Clock::default()).unwrap();
        let picked = vec![
            Signal::new("followup_due", Urgency::Medium, "x").with_data("topic", "taxes"),
        ];
        let actions = parse_response(
            "<action_taken>sent tax reminder</action_taken>\
             <hypothesis>user responds faster in the morning</hypothesis>",
        );

        record_cycle_learning(&store, &picked, &actions, 1_000);

        let hypotheses = store.open_hypotheses(10).unwrap();
        assert_eq!(hypotheses.len(), 1);
        assert!(hypotheses[0].content.contains("morning"));
    }

    #[test]
    fn no_actions_means_no_evidence_entry() {
        let store = Store::open_in_memory(Clock::default()).unwrap();
        record_cycle_learning(&store, &[], &ParsedActions::default(), 1_000);
        assert!(store.open_hypotheses(10).unwrap().is_empty());
        assert!(store.top_rules(10).unwrap().is_empty());
    }
}
