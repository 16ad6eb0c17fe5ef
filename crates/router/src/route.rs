//! Tiered inbound-message classification.
//!
//! Pure by contract: no I/O, no state, deterministic for any `(text, sender)`
//! pair, so every branch is testable with literal inputs.  Pipeline: slash
//! commands, then bilingual pattern intents, then the acknowledgment
//! detector, then the cost-tier classifier.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    /// A known command with a local handler; no LLM involved.
    Action,
    /// A bare acknowledgment; reply (if at all) without the LLM.
    Ack,
    /// Hand the text to the LLM at the given tier.
    Claude,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    #[serde(rename = "type")]
    pub kind: RouteKind,
    pub tier: u8,
    pub action: Option<String>,
    pub params: Option<serde_json::Value>,
}

impl RoutingDecision {
    fn action(action: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            kind: RouteKind::Action,
            tier: 0,
            action: Some(action.to_string()),
            params,
        }
    }

    fn ack(positive: bool) -> Self {
        Self {
            kind: RouteKind::Ack,
            tier: 0,
            action: None,
            params: Some(serde_json::json!({ "positive": positive })),
        }
    }

    fn claude(tier: u8) -> Self {
        Self {
            kind: RouteKind::Claude,
            tier,
            action: None,
            params: None,
        }
    }
}

/// Message length past which everything rides the expensive tier.
const LONG_MESSAGE_CHARS: usize = 500;
/// At or under this many words a message counts as short/simple.
const SHORT_MESSAGE_WORDS: usize = 7;
/// Minimum confidence for a pattern-intent match to short-circuit the LLM.
const INTENT_CONFIDENCE_THRESHOLD: f64 = 0.75;

/// Single entry point.  `sender` is accepted for interface parity (per-user
/// context hooks) but never consulted; determinism holds regardless.
pub fn route_message(text: &str, _sender: &str) -> RoutingDecision {
    let trimmed = text.trim();

    // 1. Slash commands.
    if let Some(decision) = route_slash_command(trimmed) {
        return decision;
    }

    // 2. Natural-language intents (English + Spanish, pattern-based).
    if let Some(decision) = route_intent(trimmed) {
        return decision;
    }

    // 3. Bare acknowledgments.
    if let Some(positive) = detect_ack(trimmed) {
        return RoutingDecision::ack(positive);
    }

    // 4. Cost tier.
    RoutingDecision::claude(tier_for(trimmed))
}

/// Tier-only view used by tests and by the reactive driver's bookkeeping.
pub fn classify_tier(text: &str) -> u8 {
    let trimmed = text.trim();
    if detect_ack(trimmed).is_some() {
        return 0;
    }
    tier_for(trimmed)
}

fn route_slash_command(text: &str) -> Option<RoutingDecision> {
    if !text.starts_with('/') {
        return None;
    }
    let mut parts = text.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default().trim_start_matches('/');
    let rest = parts.next().unwrap_or("").trim();

    let action = match command {
        "clear" => "clear",
        "help" | "start" => "help",
        "status" => "status",
        "goals" => "goals",
        "memory" => "memory",
        "experiments" => "experiments",
        "errors" => "errors",
        "costs" => "costs",
        _ => return Some(RoutingDecision::claude(1)),
    };
    let params = if rest.is_empty() {
        None
    } else {
        Some(serde_json::json!({ "args": rest }))
    };
    Some(RoutingDecision::action(action, params))
}

struct Intent {
    action: &'static str,
    patterns: &'static [&'static str],
}

/// Bilingual intent table.  Patterns are whole-message regexes, case
/// insensitive; both languages funnel to the same action names.
fn intents() -> &'static [Intent] {
    &[
        Intent { action: "status", patterns: &[r"^(how are (you|things)|everything ok\??|are you (there|alive|up))[?!.]*$", r"^(cómo estás|como estas|todo bien\??|estás ahí|estas ahi)[?!.]*$"] },
        Intent { action: "help", patterns: &[r"^(what can you do|show (me )?commands|help me)[?!.]*$", r"^(qué puedes hacer|que puedes hacer|ayuda|ayúdame|ayudame)[?!.]*$"] },
        Intent { action: "goals", patterns: &[r"^(show|list|what are) (my )?goals[?!.]*$", r"^(muestra|lista|cuáles son|cuales son) (mis )?(metas|objetivos)[?!.]*$"] },
        Intent { action: "goal_progress", patterns: &[r"^how (is|are) my goals? (going|doing)[?!.]*$", r"^cómo van mis (metas|objetivos)[?!.]*$"] },
        Intent { action: "remind", patterns: &[r"^remind me (to|about) .{1,120}$", r"^recuérdame .{1,120}$", r"^recuerdame .{1,120}$"] },
        Intent { action: "reminders", patterns: &[r"^(show|list|what are) (my )?(reminders|followups|follow-ups)[?!.]*$", r"^(muestra|lista) (mis )?recordatorios[?!.]*$"] },
        Intent { action: "forget", patterns: &[r"^(forget|drop|cancel) (that|the last|it)[?!.]*$", r"^(olvida|olvídalo|olvidalo|cancela) (eso|lo último|lo ultimo)?[?!.]*$"] },
        Intent { action: "memory", patterns: &[r"^what do you (know|remember) about me[?!.]*$", r"^qué (sabes|recuerdas) de mí[?!.]*$", r"^que (sabes|recuerdas) de mi[?!.]*$"] },
        Intent { action: "costs", patterns: &[r"^(how much|what) (have you|did you) (spent|spend|cost)( today| this week)?[?!.]*$", r"^cuánto (has gastado|gastaste)( hoy| esta semana)?[?!.]*$"] },
        Intent { action: "experiments", patterns: &[r"^(show|list) (running )?experiments[?!.]*$", r"^(muestra|lista) (los )?experimentos[?!.]*$"] },
        Intent { action: "errors", patterns: &[r"^(any|show|recent) errors[?!.]*$", r"^(hay|muestra) errores( recientes)?[?!.]*$"] },
        Intent { action: "pause", patterns: &[r"^(pause|stop|be quiet|mute)( for a (bit|while))?[?!.]*$", r"^(pausa|para|silencio|cállate|callate)[?!.]*$"] },
        Intent { action: "resume", patterns: &[r"^(resume|unmute|you can talk again)[?!.]*$", r"^(reanuda|continúa|continua|ya puedes hablar)[?!.]*$"] },
        Intent { action: "schedule", patterns: &[r"^what('?s| is) (on )?(my schedule|planned) (for )?(today|tomorrow)[?!.]*$", r"^qué (hay|tengo) (para )?(hoy|mañana)[?!.]*$"] },
        Intent { action: "note", patterns: &[r"^(note|write( this)? down)[: ].{1,200}$", r"^(anota|apunta)[: ].{1,200}$"] },
        Intent { action: "search_messages", patterns: &[r"^(find|search) (our|my|the) (chat|messages?) (for|about) .{1,80}$", r"^busca en (el chat|los mensajes) .{1,80}$"] },
        Intent { action: "goodnight", patterns: &[r"^(good ?night|going to (bed|sleep))[?!.]*$", r"^(buenas noches|me voy a dormir)[?!.]*$"] },
        Intent { action: "goodmorning", patterns: &[r"^good ?morning[?!.]*$", r"^buenos días[?!.]*$", r"^buenos dias[?!.]*$"] },
        Intent { action: "ping", patterns: &[r"^(ping|are you awake)[?!.]*$", r"^(estás despierto|estas despierto)[?!.]*$"] },
        Intent { action: "version", patterns: &[r"^(what version|which model) (are you|is this)[?!.]*$", r"^qué (versión|modelo) eres[?!.]*$"] },
    ]
}

fn intent_regexes() -> &'static Vec<(usize, Regex)> {
    static COMPILED: OnceLock<Vec<(usize, Regex)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        intents()
            .iter()
            .enumerate()
            .flat_map(|(index, intent)| {
                intent.patterns.iter().filter_map(move |pattern| {
                    Regex::new(&format!("(?i){pattern}")).ok().map(|re| (index, re))
                })
            })
            .collect()
    })
}

fn route_intent(text: &str) -> Option<RoutingDecision> {
    if text.is_empty() || text.len() > 200 {
        return None;
    }
    for (index, regex) in intent_regexes() {
        if let Some(found) = regex.find(text) {
            // Whole-message anchored patterns give high confidence; partial
            // coverage decays it below the threshold.
            let confidence = found.len() as f64 / text.len() as f64;
            if confidence >= INTENT_CONFIDENCE_THRESHOLD {
                let intent = &intents()[*index];
                return Some(RoutingDecision::action(
                    intent.action,
                    Some(serde_json::json!({ "text": text, "confidence": confidence })),
                ));
            }
        }
    }
    None
}

const POSITIVE_ACKS: &[&str] = &[
    "ok", "okay", "k", "kk", "yes", "yep", "yeah", "sure", "thanks", "thank you", "thx", "ty",
    "nice", "great", "cool", "perfect", "awesome", "love it", "sounds good", "will do", "done",
    "si", "sí", "vale", "gracias", "genial", "perfecto", "claro", "dale", "bueno", "listo",
    "👍", "🙏", "❤️", "💯",
];
const NEGATIVE_ACKS: &[&str] = &[
    "no", "nope", "nah", "not now", "later", "stop", "don't", "meh", "wrong", "bad",
    "no gracias", "ahora no", "luego", "después", "despues", "mal", "👎",
];

/// Short positive/negative tokens.  Anything longer than a few words is a
/// real message, not an acknowledgment.
fn detect_ack(text: &str) -> Option<bool> {
    let normalized = text
        .trim()
        .trim_end_matches(['!', '.', '?'])
        .to_lowercase();
    if normalized.is_empty() || normalized.split_whitespace().count() > 3 {
        return None;
    }
    if POSITIVE_ACKS.contains(&normalized.as_str()) {
        return Some(true);
    }
    if NEGATIVE_ACKS.contains(&normalized.as_str()) {
        return Some(false);
    }
    None
}

fn code_cue_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(code|debug|deploy|refactor|compile|build fail|stack ?trace|exception|bug|error log|endpoint|function|git|merge|branch|docker|server down|\.js|\.rs|\.py|sql)\b",
        )
        .expect("static regex compiles")
    })
}

fn tier_for(text: &str) -> u8 {
    if text.chars().count() > LONG_MESSAGE_CHARS || code_cue_re().is_match(text) {
        return 3;
    }
    if text.split_whitespace().count() <= SHORT_MESSAGE_WORDS {
        return 1;
    }
    2
}
