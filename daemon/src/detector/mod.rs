//! The activity-detection core.
//!
//! A scan is a pure function of the tagged-session snapshot, the optional
//! activity prefilter, the carried per-session state, and the wall clock.
//! Multiplexer I/O enters only through the capability traits in
//! `collector::tmux`.

pub mod classify;
pub mod fresh;
pub mod hysteresis;
pub mod state;

use self::state::SessionState;
use std::collections::{BTreeSet, HashMap};

/// Result of one scan: the active-workspace set and the state map to carry
/// into the next scan. Hosts commit `states` only when the scan succeeded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub active_workspaces: BTreeSet<String>,
    pub states: HashMap<String, SessionState>,
}
