//! JSON-blob key-value state.
//!
//! Values are structured records serialized as JSON strings.  A failed decode
//! is treated as absent (logged, never fatal), so one corrupted row can
//! never take a cycle down.

use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::{Result, Store};

impl Store {
    /// Raw fetch; `None` for missing keys.
    pub fn kv_get_raw(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM kv_state WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(value)
        })
    }

    /// Typed fetch.  Corrupted rows return `None` with a logged warning.
    pub fn kv_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.kv_get_raw(key)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                warn!(key, %err, "undecodable kv blob treated as absent");
                Ok(None)
            }
        }
    }

    /// Upsert with a monotonic `updated_at`.
    pub fn kv_set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)
            .map_err(|err| crate::StoreError::Policy(format!("unserializable value: {err}")))?;
        let now = self.now_ms();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                     value = excluded.value,
                     updated_at = MAX(excluded.updated_at, kv_state.updated_at + 1)",
                params![key, raw, now],
            )?;
            Ok(())
        })
    }

    pub fn kv_delete(&self, key: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM kv_state WHERE key = ?1", params![key])?;
            Ok(n > 0)
        })
    }

    pub fn kv_delete_prefix(&self, prefix: &str) -> Result<usize> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM kv_state WHERE key LIKE ?1 ESCAPE '\\'",
                params![pattern],
            )?;
            Ok(n)
        })
    }

    /// All keys with their stored byte sizes, largest first.  The cache
    /// shedder uses this to find oversized blobs.
    pub fn kv_sizes(&self) -> Result<Vec<(String, usize)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, LENGTH(value) FROM kv_state ORDER BY LENGTH(value) DESC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Keys matching a prefix, oldest update first.  Used to age out
    /// scheduled-briefing cache entries in order.
    pub fn kv_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key FROM kv_state WHERE key LIKE ?1 ESCAPE '\\' ORDER BY updated_at ASC",
            )?;
            let rows = stmt
                .query_map(params![pattern], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use crate::test_store;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Blob {
        count: u32,
        label: String,
    }

    #[test]
    fn set_get_round_trips() {
        let store = test_store();
        let blob = Blob {
            count: 7,
            label: "seven".into(),
        };
        store.kv_set("test-blob", &blob).unwrap();
        assert_eq!(store.kv_get::<Blob>("test-blob").unwrap(), Some(blob));
    }

    #[test]
    fn missing_key_is_none() {
        let store = test_store();
        assert_eq!(store.kv_get::<Blob>("absent").unwrap(), None);
    }

    #[test]
    fn corrupted_blob_is_absent_not_fatal() {
        let store = test_store();
        store.kv_set("raw", &"not a blob").unwrap();
        assert_eq!(store.kv_get::<Blob>("raw").unwrap(), None);
    }

    #[test]
    fn delete_prefix_spares_other_keys() {
        let store = test_store();
        store.kv_set("briefing-cache:a", &1).unwrap();
        store.kv_set("briefing-cache:b", &2).unwrap();
        store.kv_set("agent-state", &3).unwrap();
        let removed = store.kv_delete_prefix("briefing-cache:").unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.kv_get::<i32>("agent-state").unwrap(), Some(3));
    }

    #[test]
    fn updated_at_is_monotonic() {
        let store = test_store();
        store.kv_set("k", &1).unwrap();
        let first: i64 = store
            .with_conn(|c| {
                Ok(c.query_row("SELECT updated_at FROM kv_state WHERE key='k'", [], |r| {
                    r.get(0)
                })?)
            })
            .unwrap();
        store.kv_set("k", &2).unwrap();
        let second: i64 = store
            .with_conn(|c| {
                Ok(c.query_row("SELECT updated_at FROM kv_state WHERE key='k'", [], |r| {
                    r.get(0)
                })?)
            })
            .unwrap();
        assert!(second > first);
    }
}
