//! Row types shared across the store's query modules.
//!
//! All timestamps are Unix milliseconds.  Enums serialize as snake_case
//! strings both in SQLite columns and in JSON blobs.

use serde::{Deserialize, Serialize};

// ─── severity / sentiment ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Negative => "negative",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "positive" => Some(Sentiment::Positive),
            "negative" => Some(Sentiment::Negative),
            _ => None,
        }
    }
}

// ─── append tables ───────────────────────────────────────────────────────────

/// One LLM call's bookkeeping.  The per-day spend total can always be
/// reconstructed from this table alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEntry {
    #[serde(default)]
    pub id: i64,
    /// Which path issued the call: "proactive", "reactive", "cron", "tool".
    pub kind: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read: i64,
    pub cost_usd: f64,
    pub duration_ms: i64,
    pub session_id: Option<String>,
    pub cron_id: Option<String>,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    #[serde(default)]
    pub id: i64,
    pub severity: Severity,
    pub module: String,
    pub message: String,
    pub stack: Option<String>,
    pub context: Option<String>,
    pub resolved: bool,
    pub ts: i64,
}

/// Closes the loop from bot output back to user reaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyOutcome {
    #[serde(default)]
    pub id: i64,
    pub bot_msg_id: String,
    pub signal: Option<String>,
    pub sentiment: Option<Sentiment>,
    pub classification: Option<String>,
    pub user_response: Option<String>,
    pub window_ms: Option<i64>,
    pub ts: i64,
}

// ─── goals ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Proposed,
    Active,
    InProgress,
    Blocked,
    Completed,
    Abandoned,
}

impl GoalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalStatus::Proposed => "proposed",
            GoalStatus::Active => "active",
            GoalStatus::InProgress => "in_progress",
            GoalStatus::Blocked => "blocked",
            GoalStatus::Completed => "completed",
            GoalStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "proposed" => Some(GoalStatus::Proposed),
            "active" => Some(GoalStatus::Active),
            "in_progress" => Some(GoalStatus::InProgress),
            "blocked" => Some(GoalStatus::Blocked),
            "completed" => Some(GoalStatus::Completed),
            "abandoned" => Some(GoalStatus::Abandoned),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, GoalStatus::Completed | GoalStatus::Abandoned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub id: String,
    pub title: String,
    pub status: MilestoneStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: GoalStatus,
    pub priority: i64,
    /// 0..100.  Derived from milestones when any exist, manual otherwise.
    pub progress: u8,
    pub milestones: Vec<Milestone>,
    pub log: Vec<String>,
    pub linked_topics: Vec<String>,
    pub category: Option<String>,
    pub parent_goal_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
    pub deadline: Option<i64>,
}

impl Goal {
    pub fn new(id: impl Into<String>, title: impl Into<String>, now_ms: i64) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: GoalStatus::Proposed,
            priority: 0,
            progress: 0,
            milestones: Vec::new(),
            log: Vec::new(),
            linked_topics: Vec::new(),
            category: None,
            parent_goal_id: None,
            created_at: now_ms,
            updated_at: now_ms,
            completed_at: None,
            deadline: None,
        }
    }

    /// Recompute `progress` from milestones.  No-op for milestone-less goals,
    /// whose progress stays manual.
    pub fn recompute_progress(&mut self) {
        if self.milestones.is_empty() {
            return;
        }
        let done = self
            .milestones
            .iter()
            .filter(|m| m.status == MilestoneStatus::Completed)
            .count();
        let total = self.milestones.len();
        self.progress = ((done as f64 / total as f64) * 100.0).round() as u8;
    }

    pub fn all_milestones_done(&self) -> bool {
        !self.milestones.is_empty()
            && self
                .milestones
                .iter()
                .all(|m| m.status == MilestoneStatus::Completed)
    }
}

// ─── crons ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronState {
    pub last_run: Option<i64>,
    pub next_run: Option<i64>,
    pub consecutive_errors: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub schedule: String,
    pub tz: String,
    pub prompt: String,
    pub delivery: String,
    pub model: Option<String>,
    #[serde(default)]
    pub state: CronState,
}

// ─── experiments ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentMetric {
    PositiveRate,
    ResponseTime,
    Cost,
}

impl ExperimentMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentMetric::PositiveRate => "positive_rate",
            ExperimentMetric::ResponseTime => "response_time",
            ExperimentMetric::Cost => "cost",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "positive_rate" => Some(ExperimentMetric::PositiveRate),
            "response_time" => Some(ExperimentMetric::ResponseTime),
            "cost" => Some(ExperimentMetric::Cost),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Pending,
    Running,
    Concluded,
    Reverted,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Pending => "pending",
            ExperimentStatus::Running => "running",
            ExperimentStatus::Concluded => "concluded",
            ExperimentStatus::Reverted => "reverted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExperimentStatus::Pending),
            "running" => Some(ExperimentStatus::Running),
            "concluded" => Some(ExperimentStatus::Concluded),
            "reverted" => Some(ExperimentStatus::Reverted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExperimentStatus::Concluded | ExperimentStatus::Reverted)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub hypothesis: String,
    pub metric: ExperimentMetric,
    pub baseline_value: Option<f64>,
    pub current_value: Option<f64>,
    pub duration_hours: f64,
    /// Revert when `current < baseline × revert_threshold`.
    pub revert_threshold: f64,
    pub status: ExperimentStatus,
    pub change_description: String,
    pub revert_action: Option<String>,
    pub conclusion: Option<String>,
    pub reasoning_id: Option<String>,
    pub started_at: Option<i64>,
    pub concluded_at: Option<i64>,
}

// ─── reasoning journal ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningKind {
    Hypothesis,
    Rule,
    Evidence,
    Conclusion,
    Outcome,
}

impl ReasoningKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningKind::Hypothesis => "hypothesis",
            ReasoningKind::Rule => "rule",
            ReasoningKind::Evidence => "evidence",
            ReasoningKind::Conclusion => "conclusion",
            ReasoningKind::Outcome => "outcome",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hypothesis" => Some(ReasoningKind::Hypothesis),
            "rule" => Some(ReasoningKind::Rule),
            "evidence" => Some(ReasoningKind::Evidence),
            "conclusion" => Some(ReasoningKind::Conclusion),
            "outcome" => Some(ReasoningKind::Outcome),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningEntry {
    pub id: String,
    pub kind: ReasoningKind,
    pub content: String,
    pub confidence: f64,
    /// "open" or "closed".
    pub status: String,
    pub related_id: Option<String>,
    pub ts: i64,
}

// ─── capability gaps ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapStatus {
    Detected,
    Proposed,
    Resolved,
    Dismissed,
}

impl GapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GapStatus::Detected => "detected",
            GapStatus::Proposed => "proposed",
            GapStatus::Resolved => "resolved",
            GapStatus::Dismissed => "dismissed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "detected" => Some(GapStatus::Detected),
            "proposed" => Some(GapStatus::Proposed),
            "resolved" => Some(GapStatus::Resolved),
            "dismissed" => Some(GapStatus::Dismissed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityGap {
    pub id: String,
    pub description: String,
    pub topic: String,
    pub occurrences: i64,
    pub first_seen: i64,
    pub last_seen: i64,
    pub status: GapStatus,
    pub skill_slug: Option<String>,
}

// ─── messages & notes ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    In,
    Out,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDirection::In => "in",
            MessageDirection::Out => "out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in" => Some(MessageDirection::In),
            "out" => Some(MessageDirection::Out),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRow {
    #[serde(default)]
    pub id: i64,
    pub direction: MessageDirection,
    pub chat_id: String,
    pub body: String,
    pub bot_msg_id: Option<String>,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserNote {
    pub id: String,
    pub topic: String,
    pub content: String,
    pub ts: i64,
}
