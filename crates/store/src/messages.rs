//! Message log with full-text search, plus free-form user notes.

use rusqlite::params;

use crate::records::{MessageDirection, MessageRow, UserNote};
use crate::{Result, Store};

impl Store {
    pub fn log_message(&self, msg: &MessageRow) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (direction, chat_id, body, bot_msg_id, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    msg.direction.as_str(),
                    msg.chat_id,
                    msg.body,
                    msg.bot_msg_id,
                    msg.ts,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn recent_messages(&self, chat_id: &str, limit: usize) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, direction, chat_id, body, bot_msg_id, ts FROM messages
                 WHERE chat_id = ?1 ORDER BY ts DESC LIMIT ?2",
            )?;
            let mut rows = stmt
                .query_map(params![chat_id, limit as i64], row_to_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.reverse();
            Ok(rows)
        })
    }

    /// FTS5 match over message bodies, newest first.
    pub fn search_messages(&self, query: &str, limit: usize) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.direction, m.chat_id, m.body, m.bot_msg_id, m.ts
                 FROM messages_fts f JOIN messages m ON m.id = f.rowid
                 WHERE messages_fts MATCH ?1 ORDER BY m.ts DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![query, limit as i64], row_to_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn insert_user_note(&self, note: &UserNote) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO user_notes (id, topic, content, ts) VALUES (?1, ?2, ?3, ?4)",
                params![note.id, note.topic, note.content, note.ts],
            )?;
            Ok(())
        })
    }

    pub fn notes_for_topic(&self, topic: &str) -> Result<Vec<UserNote>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, topic, content, ts FROM user_notes WHERE topic = ?1 ORDER BY ts ASC",
            )?;
            let rows = stmt
                .query_map(params![topic], |row| {
                    Ok(UserNote {
                        id: row.get(0)?,
                        topic: row.get(1)?,
                        content: row.get(2)?,
                        ts: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    let direction: String = row.get(1)?;
    Ok(MessageRow {
        id: row.get(0)?,
        direction: MessageDirection::parse(&direction).unwrap_or(MessageDirection::In),
        chat_id: row.get(2)?,
        body: row.get(3)?,
        bot_msg_id: row.get(4)?,
        ts: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::records::{MessageDirection, MessageRow};
    use crate::test_store;

    fn msg(body: &str, ts: i64) -> MessageRow {
        MessageRow {
            id: 0,
            direction: MessageDirection::In,
            chat_id: "user".into(),
            body: body.into(),
            bot_msg_id: None,
            ts,
        }
    }

    #[test]
    fn fts_finds_message_bodies() {
        let store = test_store();
        store.log_message(&msg("remind me about the dentist", 1)).unwrap();
        store.log_message(&msg("what's for dinner", 2)).unwrap();

        let hits = store.search_messages("dentist", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].body.contains("dentist"));
    }

    #[test]
    fn recent_messages_come_back_in_order() {
        let store = test_store();
        for i in 0..5 {
            store.log_message(&msg(&format!("m{i}"), i)).unwrap();
        }
        let recent = store.recent_messages("user", 3).unwrap();
        let bodies: Vec<_> = recent.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["m2", "m3", "m4"]);
    }
}
