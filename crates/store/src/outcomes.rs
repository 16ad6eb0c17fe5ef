//! Reply outcomes; the feedback loop from bot output to user reaction.

use rusqlite::params;

use crate::records::{ReplyOutcome, Sentiment};
use crate::{Result, Store};

/// Aggregated view over a reply-outcome window, consumed by the experiment
/// metric reader.
#[derive(Debug, Clone, Default)]
pub struct OutcomeWindow {
    pub total: i64,
    pub positives: i64,
    pub negatives: i64,
    pub avg_window_ms: Option<f64>,
}

impl OutcomeWindow {
    /// `positives / total`, or `None` when the window is empty (no signal).
    pub fn positive_rate(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.positives as f64 / self.total as f64)
        }
    }
}

impl Store {
    pub fn log_reply_outcome(&self, outcome: &ReplyOutcome) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO reply_outcomes
                     (bot_msg_id, signal, sentiment, classification, user_response, window_ms, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    outcome.bot_msg_id,
                    outcome.signal,
                    outcome.sentiment.map(|s| s.as_str()),
                    outcome.classification,
                    outcome.user_response,
                    outcome.window_ms,
                    outcome.ts,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn reply_outcomes_since(&self, since_ms: i64) -> Result<Vec<ReplyOutcome>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, bot_msg_id, signal, sentiment, classification, user_response,
                        window_ms, ts
                 FROM reply_outcomes WHERE ts >= ?1 ORDER BY ts ASC",
            )?;
            let rows = stmt
                .query_map(params![since_ms], row_to_outcome)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn outcome_window_since(&self, since_ms: i64) -> Result<OutcomeWindow> {
        self.with_conn(|conn| {
            let window = conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(sentiment = 'positive'), 0),
                        COALESCE(SUM(sentiment = 'negative'), 0),
                        AVG(window_ms)
                 FROM reply_outcomes WHERE ts >= ?1",
                params![since_ms],
                |row| {
                    Ok(OutcomeWindow {
                        total: row.get(0)?,
                        positives: row.get(1)?,
                        negatives: row.get(2)?,
                        avg_window_ms: row.get(3)?,
                    })
                },
            )?;
            Ok(window)
        })
    }

    /// The most recent outbound bot message without a recorded outcome, used
    /// by the sentiment-capture path to correlate a user reaction.
    pub fn latest_unanswered_bot_msg(&self) -> Result<Option<(String, i64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.bot_msg_id, m.ts FROM messages m
                 WHERE m.direction = 'out' AND m.bot_msg_id IS NOT NULL
                   AND NOT EXISTS (
                       SELECT 1 FROM reply_outcomes o WHERE o.bot_msg_id = m.bot_msg_id
                   )
                 ORDER BY m.ts DESC LIMIT 1",
            )?;
            let row = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .next()
                .transpose()?;
            Ok(row)
        })
    }
}

fn row_to_outcome(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReplyOutcome> {
    let sentiment: Option<String> = row.get(3)?;
    Ok(ReplyOutcome {
        id: row.get(0)?,
        bot_msg_id: row.get(1)?,
        signal: row.get(2)?,
        sentiment: sentiment.as_deref().and_then(Sentiment::parse),
        classification: row.get(4)?,
        user_response: row.get(5)?,
        window_ms: row.get(6)?,
        ts: row.get(7)?,
    })
}
