//! Structured action tags extracted from LLM reply text.
//!
//! The scanner is a tolerant start-tag / text / end-tag walk: attributes may
//! come in any order, unknown and unbalanced tags are skipped, and nothing in
//! here can fail the cycle.  Tags recognised: `wa_message`, `followup`,
//! `next_cycle_minutes`, `action_taken`, `goal_create`, `goal_update`,
//! `milestone_complete`, `hypothesis`, `reflection`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalCreateTag {
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalUpdateTag {
    pub id: String,
    pub status: Option<String>,
    pub progress: Option<u8>,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilestoneTag {
    pub goal: String,
    pub milestone: String,
    pub evidence: String,
}

/// Everything one reply asked the agent to do, in document order per kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedActions {
    pub wa_messages: Vec<String>,
    pub followups: Vec<String>,
    pub next_cycle_minutes: Option<u32>,
    pub actions_taken: Vec<String>,
    pub goal_creates: Vec<GoalCreateTag>,
    pub goal_updates: Vec<GoalUpdateTag>,
    pub milestone_completes: Vec<MilestoneTag>,
    pub hypotheses: Vec<String>,
    pub reflections: Vec<String>,
}

impl ParsedActions {
    pub fn is_empty(&self) -> bool {
        self.wa_messages.is_empty()
            && self.followups.is_empty()
            && self.next_cycle_minutes.is_none()
            && self.actions_taken.is_empty()
            && self.goal_creates.is_empty()
            && self.goal_updates.is_empty()
            && self.milestone_completes.is_empty()
            && self.hypotheses.is_empty()
            && self.reflections.is_empty()
    }
}

const KNOWN_TAGS: &[&str] = &[
    "wa_message",
    "followup",
    "next_cycle_minutes",
    "action_taken",
    "goal_create",
    "goal_update",
    "milestone_complete",
    "hypothesis",
    "reflection",
];

/// One scanned tag occurrence.
struct RawTag {
    name: String,
    attrs: HashMap<String, String>,
    payload: String,
}

pub fn parse_response(text: &str) -> ParsedActions {
    let mut actions = ParsedActions::default();

    for tag in scan_tags(text) {
        let payload = tag.payload.trim().to_string();
        match tag.name.as_str() {
            "wa_message" if !payload.is_empty() => actions.wa_messages.push(payload),
            "followup" if !payload.is_empty() => actions.followups.push(payload),
            "action_taken" if !payload.is_empty() => actions.actions_taken.push(payload),
            "next_cycle_minutes" => {
                // Clamp window [5, 120]; anything outside is ignored wholesale.
                if let Ok(minutes) = payload.parse::<u32>() {
                    if (5..=120).contains(&minutes) {
                        actions.next_cycle_minutes = Some(minutes);
                    }
                }
            }
            "goal_create" => {
                if let Some(title) = tag.attrs.get("title").filter(|t| !t.is_empty()) {
                    actions.goal_creates.push(GoalCreateTag {
                        title: title.clone(),
                        description: payload,
                    });
                }
            }
            "goal_update" => {
                if let Some(id) = tag.attrs.get("id").filter(|i| !i.is_empty()) {
                    actions.goal_updates.push(GoalUpdateTag {
                        id: id.clone(),
                        status: tag.attrs.get("status").cloned(),
                        progress: tag
                            .attrs
                            .get("progress")
                            .and_then(|p| p.parse::<u8>().ok())
                            .filter(|p| *p <= 100),
                        note: payload,
                    });
                }
            }
            "milestone_complete" => {
                if let (Some(goal), Some(milestone)) =
                    (tag.attrs.get("goal"), tag.attrs.get("milestone"))
                {
                    actions.milestone_completes.push(MilestoneTag {
                        goal: goal.clone(),
                        milestone: milestone.clone(),
                        evidence: payload,
                    });
                }
            }
            "hypothesis" if !payload.is_empty() => actions.hypotheses.push(payload),
            "reflection" if !payload.is_empty() => actions.reflections.push(payload),
            _ => {}
        }
    }

    actions
}

/// Walk the text emitting known, balanced tags.  Self-closing tags carry an
/// empty payload.
fn scan_tags(text: &str) -> Vec<RawTag> {
    let mut tags = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find('<') {
        let after = &rest[open + 1..];

        // Closing tag or garbage at this position: move past the '<'.
        let Some((name, after_name)) = read_tag_name(after) else {
            rest = after;
            continue;
        };
        if !KNOWN_TAGS.contains(&name.as_str()) {
            rest = after;
            continue;
        }

        let Some((attrs, body_start, self_closing)) = read_attrs(after_name) else {
            // Unterminated open tag; nothing balanced can follow.
            break;
        };

        if self_closing {
            tags.push(RawTag {
                name,
                attrs,
                payload: String::new(),
            });
            rest = &after_name[body_start..];
            continue;
        }

        let body_and_beyond = &after_name[body_start..];
        let close_marker = format!("</{name}>");
        let Some(close) = body_and_beyond.find(&close_marker) else {
            // Unbalanced: skip this open tag entirely.
            rest = after_name;
            continue;
        };

        tags.push(RawTag {
            name,
            attrs,
            payload: body_and_beyond[..close].to_string(),
        });
        rest = &body_and_beyond[close + close_marker.len()..];
    }

    tags
}

/// Read an identifier right after `<`.  Returns the name and the remainder.
fn read_tag_name(text: &str) -> Option<(String, &str)> {
    let end = text
        .char_indices()
        .find(|(_, c)| !c.is_ascii_alphanumeric() && *c != '_')
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    if end == 0 {
        return None;
    }
    Some((text[..end].to_string(), &text[end..]))
}

/// Parse `key="value"` pairs until `>` or `/>`.  Returns the attributes, the
/// byte offset just past the closer, and whether the tag self-closed.
fn read_attrs(text: &str) -> Option<(HashMap<String, String>, usize, bool)> {
    let mut attrs = HashMap::new();
    let bytes = text.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'>' => return Some((attrs, i + 1, false)),
            b'/' if bytes.get(i + 1) == Some(&b'>') => return Some((attrs, i + 2, true)),
            b' ' | b'\t' | b'\n' | b'\r' => i += 1,
            _ => {
                // key="value"
                let key_start = i;
                while i < bytes.len()
                    && !matches!(bytes[i], b'=' | b'>' | b'/' | b' ' | b'\t' | b'\n' | b'\r')
                {
                    i += 1;
                }
                let key = text[key_start..i].trim().to_string();
                if bytes.get(i) != Some(&b'=') || bytes.get(i + 1) != Some(&b'"') {
                    // Bare attribute or malformed pair: advance so the scan
                    // always makes progress, unless the closer handles it.
                    match bytes.get(i) {
                        Some(&b'>') => {}
                        Some(&b'/') if bytes.get(i + 1) == Some(&b'>') => {}
                        _ => i += 1,
                    }
                    continue;
                }
                i += 2;
                let value_start = i;
                while i < bytes.len() && bytes[i] != b'"' {
                    i += 1;
                }
                if i >= bytes.len() {
                    return None;
                }
                attrs.insert(key, text[value_start..i].to_string());
                i += 1;
            }
        }
    }
    None
}

/// Canonical rendering of parsed actions back into tag text.  Exists for the
/// parse∘serialize identity checks and for journaling what a reply asked.
pub fn render_actions(actions: &ParsedActions) -> String {
    let mut out = String::new();
    for action in &actions.actions_taken {
        out.push_str(&format!("<action_taken>{action}</action_taken>\n"));
    }
    for goal in &actions.goal_creates {
        out.push_str(&format!(
            "<goal_create title=\"{}\">{}</goal_create>\n",
            goal.title, goal.description
        ));
    }
    for update in &actions.goal_updates {
        let mut attrs = format!("id=\"{}\"", update.id);
        if let Some(status) = &update.status {
            attrs.push_str(&format!(" status=\"{status}\""));
        }
        if let Some(progress) = update.progress {
            attrs.push_str(&format!(" progress=\"{progress}\""));
        }
        out.push_str(&format!("<goal_update {attrs}>{}</goal_update>\n", update.note));
    }
    for milestone in &actions.milestone_completes {
        out.push_str(&format!(
            "<milestone_complete goal=\"{}\" milestone=\"{}\">{}</milestone_complete>\n",
            milestone.goal, milestone.milestone, milestone.evidence
        ));
    }
    for followup in &actions.followups {
        out.push_str(&format!("<followup>{followup}</followup>\n"));
    }
    for message in &actions.wa_messages {
        out.push_str(&format!("<wa_message>{message}</wa_message>\n"));
    }
    if let Some(minutes) = actions.next_cycle_minutes {
        out.push_str(&format!(
            "<next_cycle_minutes>{minutes}</next_cycle_minutes>\n"
        ));
    }
    for hypothesis in &actions.hypotheses {
        out.push_str(&format!("<hypothesis>{hypothesis}</hypothesis>\n"));
    }
    for reflection in &actions.reflections {
        out.push_str(&format!("<reflection>{reflection}</reflection>\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_message_and_followup() {
        let reply = "Thinking done.\n<wa_message>Your train leaves at 9.</wa_message>\n\
                     <followup>check ticket refund</followup>";
        let actions = parse_response(reply);
        assert_eq!(actions.wa_messages, vec!["Your train leaves at 9."]);
        assert_eq!(actions.followups, vec!["check ticket refund"]);
    }

    #[test]
    fn attributes_work_in_any_order() {
        let a = parse_response(r#"<goal_update id="g1" status="blocked">stuck</goal_update>"#);
        let b = parse_response(r#"<goal_update status="blocked" id="g1">stuck</goal_update>"#);
        assert_eq!(a.goal_updates, b.goal_updates);
        assert_eq!(a.goal_updates[0].status.as_deref(), Some("blocked"));
    }

    #[test]
    fn next_cycle_minutes_boundaries() {
        for (input, expected) in [("4", None), ("5", Some(5)), ("120", Some(120)), ("121", None)] {
            let actions =
                parse_response(&format!("<next_cycle_minutes>{input}</next_cycle_minutes>"));
            assert_eq!(actions.next_cycle_minutes, expected, "input {input}");
        }
    }

    #[test]
    fn empty_payloads_are_dropped() {
        let actions = parse_response(
            "<wa_message>  </wa_message><followup></followup><action_taken>\n</action_taken>",
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn unknown_and_unbalanced_tags_are_ignored() {
        let reply = "<mystery>ooh</mystery> <wa_message>hello <b>there</b></wa_message> \
                     <followup>never closed";
        let actions = parse_response(reply);
        assert_eq!(actions.wa_messages, vec!["hello <b>there</b>"]);
        assert!(actions.followups.is_empty());
    }

    #[test]
    fn milestone_tag_needs_both_attrs() {
        let ok = parse_response(
            r#"<milestone_complete goal="g1" milestone="m2">shipped the draft</milestone_complete>"#,
        );
        assert_eq!(ok.milestone_completes.len(), 1);
        assert_eq!(ok.milestone_completes[0].evidence, "shipped the draft");

        let missing = parse_response(r#"<milestone_complete goal="g1">no</milestone_complete>"#);
        assert!(missing.milestone_completes.is_empty());
    }

    #[test]
    fn self_closing_goal_update_parses() {
        let actions = parse_response(r#"<goal_update id="g1" progress="50"/>"#);
        assert_eq!(actions.goal_updates.len(), 1);
        assert_eq!(actions.goal_updates[0].progress, Some(50));
        assert!(actions.goal_updates[0].note.is_empty());
    }

    #[test]
    fn parse_then_render_then_parse_is_identity() {
        let reply = r#"<action_taken>checked calendar</action_taken>
<goal_create title="run a 10k">train three times a week</goal_create>
<goal_update id="g1" status="in_progress" progress="30">moving</goal_update>
<milestone_complete goal="g1" milestone="m1">did it</milestone_complete>
<followup>water the plants</followup>
<wa_message>All set for tomorrow.</wa_message>
<next_cycle_minutes>45</next_cycle_minutes>
<hypothesis>user prefers evening briefings</hypothesis>
<reflection>kept it short today</reflection>"#;

        let parsed = parse_response(reply);
        let rendered = render_actions(&parsed);
        let reparsed = parse_response(&rendered);
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn progress_over_100_is_ignored() {
        let actions = parse_response(r#"<goal_update id="g1" progress="150">x</goal_update>"#);
        assert_eq!(actions.goal_updates[0].progress, None);
    }
}
