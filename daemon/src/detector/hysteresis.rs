//! Screen-delta hysteresis over pane-capture hashes.
//!
//! The `+2/-1` scoring asymmetry means a previously known session needs two
//! consecutive deltas to cross the activity threshold, while single-frame
//! redraws are absorbed. A hold timer keeps a session active for a short
//! grace period after its last threshold crossing.

use crate::collector::tmux::PaneCapture;
use crate::config::DetectorConfig;
use crate::detector::classify;
use crate::detector::state::{Digest, SessionState};
use crate::detector::ScanOutcome;
use crate::models::session::{SessionInfo, TaggedSession};
use sha2::{Digest as _, Sha256};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Default pane-content digest: the leading 128 bits of SHA-256.
pub fn content_digest(content: &str) -> Digest {
    let digest = Sha256::digest(content.as_bytes());
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

/// Run the delta-hysteresis engine over the fallback candidates.
///
/// `states` is the working copy carried from the previous scan; `seen` may be
/// pre-populated with sessions the classifier short-circuited so that
/// cross-scan decay does not reset them. Every entry of `states` whose
/// session was not seen this scan is reset, so a session that drops out of
/// the fetch output cannot trip on its stored hash when it reappears.
pub async fn active_workspace_ids_with_hysteresis<F>(
    info_by_session: &HashMap<String, SessionInfo>,
    candidates: &[TaggedSession],
    mut states: HashMap<String, SessionState>,
    mut seen: HashSet<String>,
    now: i64,
    config: &DetectorConfig,
    capture: &dyn PaneCapture,
    hash_fn: &F,
) -> ScanOutcome
where
    F: Fn(&str) -> Digest + Send + Sync,
{
    let mut active = BTreeSet::new();

    for snapshot in candidates {
        let name = snapshot.name();
        seen.insert(name.to_string());

        let info = info_by_session.get(name);
        if !classify::is_chat_session(&snapshot.session, info) {
            continue;
        }

        let state = states.entry(name.to_string()).or_default();
        match capture.capture_tail(name, config.capture_tail_lines).await {
            Some(content) => {
                let digest = hash_fn(&content);
                if !state.initialized {
                    // First observation is credited immediately, but without
                    // a hold timer: one unchanged scan decays it below the
                    // threshold again.
                    state.last_hash = digest;
                    state.initialized = true;
                    state.score = config.score_threshold;
                } else if digest != state.last_hash {
                    state.score = (state.score + 2).min(config.score_max);
                    state.last_hash = digest;
                    if state.score >= config.score_threshold {
                        state.last_active_at = now;
                    }
                } else {
                    state.decay();
                }
            }
            None => state.decay(),
        }

        if state.is_active(now, config) {
            let workspace = classify::workspace_id_for_session(&snapshot.session, info);
            if !workspace.is_empty() {
                active.insert(workspace);
            }
        }
    }

    for (name, state) in states.iter_mut() {
        if !seen.contains(name) {
            state.reset();
        }
    }

    ScanOutcome {
        active_workspaces: active,
        states,
    }
}
