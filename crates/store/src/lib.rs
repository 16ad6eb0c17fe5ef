//! Persistent store; the single owner of all durable state.
//!
//! Everything the agent remembers lives here: a transactional JSON-blob KV
//! (`kv_state`), append-only bookkeeping tables (costs, errors, reply
//! outcomes), and row tables for goals, crons, experiments, the reasoning
//! journal, capability gaps, messages (with an FTS5 companion), and user
//! notes.  Other components hold no long-lived pointers into the store;
//! relations are by id.
//!
//! Calendar-day aggregation always goes through the configured timezone's
//! local day string; never UTC division of the millisecond timestamp.

mod costs;
mod crons;
mod error;
mod errors;
mod experiments;
mod gaps;
mod goals;
mod journal;
mod kv;
mod messages;
mod outcomes;
mod records;
mod retention;
mod schema;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

use vigil_clock::Clock;

pub use error::{Result, StoreError};
pub use outcomes::OutcomeWindow;
pub use records::{
    CapabilityGap, CostEntry, CronJob, CronState, ErrorEntry, Experiment, ExperimentMetric,
    ExperimentStatus, GapStatus, Goal, GoalStatus, MessageDirection, MessageRow, Milestone,
    MilestoneStatus, ReasoningEntry, ReasoningKind, ReplyOutcome, Sentiment, Severity, UserNote,
};
pub use retention::RetentionReport;

/// Handle over the single SQLite database.
///
/// The connection sits behind a `std::sync::Mutex`: every store call is a
/// short, non-suspending operation, so the lock is never held across an await
/// point.  WAL mode gives readers-don't-block-writers semantics on disk.
pub struct Store {
    conn: Mutex<Connection>,
    clock: Clock,
}

impl Store {
    pub fn open(path: impl AsRef<Path>, clock: Clock) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let store = Self {
            conn: Mutex::new(conn),
            clock,
        };
        store.with_conn(schema::init_schema)?;
        Ok(store)
    }

    pub fn open_in_memory(clock: Clock) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            clock,
        };
        store.with_conn(schema::init_schema)?;
        Ok(store)
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// Run `f` with the connection locked.  Internal building block for all
    /// query modules; poisoned locks are unwrapped into a store error rather
    /// than a panic.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Closed("connection lock poisoned".into()))?;
        f(&conn)
    }

    pub fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

#[cfg(test)]
pub(crate) fn test_store() -> Store {
    Store::open_in_memory(Clock::default()).expect("in-memory store")
}
