use rusqlite::Connection;

use crate::Result;

// Schema version (increment when changing table definitions)
pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS kv_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS costs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            model TEXT NOT NULL,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            cache_read INTEGER NOT NULL DEFAULT 0,
            cost_usd REAL NOT NULL DEFAULT 0,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            session_id TEXT,
            cron_id TEXT,
            ts INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS errors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            severity TEXT NOT NULL,
            module TEXT NOT NULL,
            message TEXT NOT NULL,
            stack TEXT,
            context TEXT,
            resolved INTEGER NOT NULL DEFAULT 0,
            ts INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS reply_outcomes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            bot_msg_id TEXT NOT NULL,
            signal TEXT,
            sentiment TEXT,
            classification TEXT,
            user_response TEXT,
            window_ms INTEGER,
            ts INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS goals (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            progress INTEGER NOT NULL DEFAULT 0,
            milestones TEXT NOT NULL DEFAULT '[]',
            log TEXT NOT NULL DEFAULT '[]',
            linked_topics TEXT NOT NULL DEFAULT '[]',
            category TEXT,
            parent_goal_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            completed_at INTEGER,
            deadline INTEGER
        );

        CREATE TABLE IF NOT EXISTS crons (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            schedule TEXT NOT NULL,
            tz TEXT NOT NULL DEFAULT 'UTC',
            prompt TEXT NOT NULL,
            delivery TEXT NOT NULL DEFAULT 'message',
            model TEXT,
            last_run INTEGER,
            next_run INTEGER,
            consecutive_errors INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS experiments (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            hypothesis TEXT NOT NULL DEFAULT '',
            metric TEXT NOT NULL,
            baseline_value REAL,
            current_value REAL,
            duration_hours REAL NOT NULL,
            revert_threshold REAL NOT NULL,
            status TEXT NOT NULL,
            change_description TEXT NOT NULL DEFAULT '',
            revert_action TEXT,
            conclusion TEXT,
            reasoning_id TEXT,
            started_at INTEGER,
            concluded_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS reasoning_journal (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            content TEXT NOT NULL,
            confidence REAL NOT NULL DEFAULT 0.5,
            status TEXT NOT NULL DEFAULT 'open',
            related_id TEXT,
            ts INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS capability_gaps (
            id TEXT PRIMARY KEY,
            description TEXT NOT NULL,
            topic TEXT NOT NULL,
            occurrences INTEGER NOT NULL DEFAULT 1,
            first_seen INTEGER NOT NULL,
            last_seen INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'detected',
            skill_slug TEXT
        );

        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            direction TEXT NOT NULL,
            chat_id TEXT NOT NULL,
            body TEXT NOT NULL,
            bot_msg_id TEXT,
            ts INTEGER NOT NULL
        );

        CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
            body,
            content='messages',
            content_rowid='id'
        );

        CREATE TRIGGER IF NOT EXISTS messages_ai AFTER INSERT ON messages BEGIN
            INSERT INTO messages_fts(rowid, body) VALUES (new.id, new.body);
        END;

        CREATE TRIGGER IF NOT EXISTS messages_ad AFTER DELETE ON messages BEGIN
            INSERT INTO messages_fts(messages_fts, rowid, body)
            VALUES ('delete', old.id, old.body);
        END;

        CREATE TABLE IF NOT EXISTS user_notes (
            id TEXT PRIMARY KEY,
            topic TEXT NOT NULL,
            content TEXT NOT NULL,
            ts INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_costs_ts ON costs(ts);
        CREATE INDEX IF NOT EXISTS idx_errors_ts ON errors(ts);
        CREATE INDEX IF NOT EXISTS idx_errors_resolved ON errors(resolved, ts);
        CREATE INDEX IF NOT EXISTS idx_outcomes_ts ON reply_outcomes(ts);
        CREATE INDEX IF NOT EXISTS idx_goals_status ON goals(status);
        CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages(ts);
        CREATE INDEX IF NOT EXISTS idx_journal_kind ON reasoning_journal(kind, status);
        "#,
    )?;

    conn.execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;
    Ok(())
}
