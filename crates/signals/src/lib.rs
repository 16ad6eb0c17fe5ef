//! Signal model and the per-tick collection pipeline: detect, age-escalate,
//! cooldown-filter, rank, pick.
//!
//! The collector itself performs no network and no LLM calls; it only reads
//! state handed to it and returns the short list of signals that deserve this
//! cycle's attention.

mod collector;
mod cooldown;
mod detect;
mod signal;

pub use collector::{PickOutcome, collect, pick_signals};
pub use cooldown::{CooldownMap, CooldownPolicy, COOLDOWN_KEY};
pub use detect::{ANNOUNCED_EXPERIMENTS_KEY, DetectorCx, next_run_after, run_core_detectors};
pub use signal::{Followup, Signal, Urgency, FOLLOWUPS_KEY};
