//! Centralized prompt assembly for the proactive cycle's LLM call.
//!
//! Callers gather everything beforehand (briefs, provider outputs, goals,
//! journal entries) and hand it over as [`PromptInputs`]; assembly itself is
//! purely synchronous and deterministic given its inputs, so the exact block
//! layout is unit-testable without a store or an LLM.

use chrono::DateTime;
use chrono_tz::Tz;

use vigil_store::{Goal, ReasoningEntry};

/// All pre-computed data needed to assemble the cycle prompt.
pub struct PromptInputs<'a> {
    pub now: DateTime<Tz>,
    pub quiet_hours: bool,
    /// One brief per picked signal, in pick order.
    pub briefs: &'a [String],
    /// Module context-provider outputs, in registration order.
    pub context_blocks: &'a [String],
    /// Most recent actions-taken strings, newest last.
    pub recent_actions: &'a [String],
    pub goals: &'a [Goal],
    /// Learned rules, highest confidence first.
    pub rules: &'a [ReasoningEntry],
    pub hypotheses: &'a [ReasoningEntry],
    /// Present only when an error_spike signal was picked.
    pub error_analytics: Option<&'a str>,
    /// Per-block character cap.
    pub max_block_chars: usize,
    /// Total prompt character budget.
    pub max_chars: usize,
}

/// Recent-actions entries surfaced per cycle.
pub const RECENT_ACTIONS_SHOWN: usize = 10;

/// Assemble the full cycle context block, sections in their fixed order.
/// On overflow the lowest-priority sections go first: learned rules, then
/// open hypotheses, then the oldest recent actions.
pub fn build_cycle_prompt(inputs: &PromptInputs<'_>) -> String {
    let cap = |text: &str| truncate_for_prompt(text, inputs.max_block_chars);

    let now_block = format!(
        "<now date=\"{}\" quiet_hours=\"{}\"/>",
        inputs.now.format("%Y-%m-%d %H:%M %Z"),
        inputs.quiet_hours,
    );

    let briefs_block = if inputs.briefs.is_empty() {
        String::new()
    } else {
        let items = inputs
            .briefs
            .iter()
            .map(|b| cap(b))
            .collect::<Vec<_>>()
            .join("\n\n");
        format!("\n\nSIGNALS THIS CYCLE:\n{items}")
    };

    let context_block = if inputs.context_blocks.is_empty() {
        String::new()
    } else {
        let items = inputs
            .context_blocks
            .iter()
            .map(|b| cap(b))
            .collect::<Vec<_>>()
            .join("\n");
        format!("\n\nBACKGROUND CONTEXT:\n{items}")
    };

    let actions: Vec<&String> = inputs
        .recent_actions
        .iter()
        .rev()
        .take(RECENT_ACTIONS_SHOWN)
        .collect();
    let goals_block = build_goals_block(inputs.goals);

    // Droppable sections, cheapest-to-lose last in this list.
    let rules_block = build_journal_block("WHAT I HAVE LEARNED", inputs.rules, true);
    let hypotheses_block = build_journal_block("OPEN HYPOTHESES", inputs.hypotheses, false);
    let errors_block = inputs
        .error_analytics
        .map(|analytics| format!("\n\nERROR ANALYTICS:\n{}", cap(analytics)))
        .unwrap_or_default();

    let assemble = |rules: &str, hypotheses: &str, actions: &[&String]| {
        let actions_block = if actions.is_empty() {
            String::new()
        } else {
            let items = actions
                .iter()
                .rev()
                .map(|a| format!("- {}", truncate_for_prompt(a, 200)))
                .collect::<Vec<_>>()
                .join("\n");
            format!("\n\nRECENT ACTIONS:\n{items}")
        };
        format!(
            "{now_block}{briefs_block}{context_block}{actions_block}{goals_block}{rules}{hypotheses}{errors_block}"
        )
    };

    // Overflow policy: rules first, then hypotheses, then age out actions.
    let mut prompt = assemble(&rules_block, &hypotheses_block, &actions);
    if prompt.chars().count() > inputs.max_chars {
        prompt = assemble("", &hypotheses_block, &actions);
    }
    if prompt.chars().count() > inputs.max_chars {
        prompt = assemble("", "", &actions);
    }
    let mut kept = actions.len();
    while prompt.chars().count() > inputs.max_chars && kept > 0 {
        kept -= 1;
        prompt = assemble("", "", &actions[..kept]);
    }
    if prompt.chars().count() > inputs.max_chars {
        prompt = truncate_for_prompt(&prompt, inputs.max_chars);
    }
    prompt
}

fn build_goals_block(goals: &[Goal]) -> String {
    if goals.is_empty() {
        return String::new();
    }
    let items = goals
        .iter()
        .map(|g| {
            format!(
                "- [{}] {} ({}, {}%)",
                g.id,
                g.title,
                g.status.as_str(),
                g.progress
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!("\n\nACTIVE GOALS:\n{items}")
}

fn build_journal_block(header: &str, entries: &[ReasoningEntry], with_confidence: bool) -> String {
    if entries.is_empty() {
        return String::new();
    }
    let items = entries
        .iter()
        .map(|e| {
            if with_confidence {
                format!(
                    "- {} (confidence {:.2})",
                    truncate_for_prompt(&e.content, 240),
                    e.confidence
                )
            } else {
                format!("- {}", truncate_for_prompt(&e.content, 240))
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!("\n\n{header}:\n{items}")
}

/// Truncate `text` to at most `max_chars` characters, appending `…` when cut.
pub fn truncate_for_prompt(text: &str, max_chars: usize) -> String {
    let chars = text.chars().collect::<Vec<_>>();
    if chars.len() <= max_chars {
        return text.to_string();
    }
    let truncated: String = chars.into_iter().take(max_chars).collect();
    format!("{truncated}…")
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use vigil_store::{GoalStatus, ReasoningKind};

    use super::*;

    fn now() -> DateTime<Tz> {
        chrono_tz::UTC.with_ymd_and_hms(2024, 6, 15, 9, 30, 0).unwrap()
    }

    fn rule(content: &str, confidence: f64) -> ReasoningEntry {
        ReasoningEntry {
            id: "r".into(),
            kind: ReasoningKind::Rule,
            content: content.into(),
            confidence,
            status: "open".into(),
            related_id: None,
            ts: 0,
        }
    }

    fn inputs<'a>(
        briefs: &'a [String],
        actions: &'a [String],
        rules: &'a [ReasoningEntry],
    ) -> PromptInputs<'a> {
        PromptInputs {
            now: now(),
            quiet_hours: false,
            briefs,
            context_blocks: &[],
            recent_actions: actions,
            goals: &[],
            rules,
            hypotheses: &[],
            error_analytics: None,
            max_block_chars: 4_000,
            max_chars: 24_000,
        }
    }

    #[test]
    fn sections_appear_in_fixed_order() {
        let briefs = vec!["FOLLOWUP: call mom".to_string()];
        let actions = vec!["sent morning briefing".to_string()];
        let rules = vec![rule("short messages land better", 0.8)];
        let mut goal = Goal::new("g1", "learn rust", 0);
        goal.status = GoalStatus::Active;
        goal.progress = 40;

        let mut i = inputs(&briefs, &actions, &rules);
        let goals = vec![goal];
        i.goals = &goals;
        let prompt = build_cycle_prompt(&i);

        let now_pos = prompt.find("<now").unwrap();
        let briefs_pos = prompt.find("SIGNALS THIS CYCLE").unwrap();
        let actions_pos = prompt.find("RECENT ACTIONS").unwrap();
        let goals_pos = prompt.find("ACTIVE GOALS").unwrap();
        let rules_pos = prompt.find("WHAT I HAVE LEARNED").unwrap();
        assert!(now_pos < briefs_pos);
        assert!(briefs_pos < actions_pos);
        assert!(actions_pos < goals_pos);
        assert!(goals_pos < rules_pos);
        assert!(prompt.contains("confidence 0.80"));
        assert!(prompt.contains("(active, 40%)"));
    }

    #[test]
    fn assembly_is_deterministic() {
        let briefs = vec!["BRIEF".to_string()];
        let actions = vec!["acted".to_string()];
        let rules = vec![rule("r1", 0.5)];
        let a = build_cycle_prompt(&inputs(&briefs, &actions, &rules));
        let b = build_cycle_prompt(&inputs(&briefs, &actions, &rules));
        assert_eq!(a, b);
    }

    #[test]
    fn overflow_drops_rules_before_actions() {
        let briefs = vec!["BRIEF".to_string()];
        let actions = vec!["important recent action".to_string()];
        let rules = vec![rule(&"r".repeat(500), 0.5)];

        let mut i = inputs(&briefs, &actions, &rules);
        i.max_chars = 300;
        let prompt = build_cycle_prompt(&i);

        assert!(!prompt.contains("WHAT I HAVE LEARNED"));
        assert!(prompt.contains("RECENT ACTIONS"));
        assert!(prompt.chars().count() <= 300);
    }

    #[test]
    fn only_last_ten_actions_are_shown() {
        let briefs: Vec<String> = vec![];
        let actions: Vec<String> = (0..15).map(|i| format!("action {i}")).collect();
        let rules: Vec<ReasoningEntry> = vec![];

        let prompt = build_cycle_prompt(&inputs(&briefs, &actions, &rules));
        assert!(!prompt.contains("action 4"));
        assert!(prompt.contains("action 5"));
        assert!(prompt.contains("action 14"));
    }

    #[test]
    fn quiet_flag_lands_in_the_now_tag() {
        let briefs: Vec<String> = vec![];
        let actions: Vec<String> = vec![];
        let rules: Vec<ReasoningEntry> = vec![];
        let mut i = inputs(&briefs, &actions, &rules);
        i.quiet_hours = true;
        let prompt = build_cycle_prompt(&i);
        assert!(prompt.contains("quiet_hours=\"true\""));
    }
}
