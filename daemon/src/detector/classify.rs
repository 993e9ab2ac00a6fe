//! Per-scan classification of tagged sessions.
//!
//! Routes each candidate between the fresh-tag path (trusted only with a
//! visible pane delta), the stale-tag fallback (gated by the activity
//! prefilter), and the two suppression buckets for user echo and recent
//! input. Suppression wraps the capture function rather than branching
//! inside the hysteresis engine, which stays oblivious to it.

use crate::collector::tmux::PaneCapture;
use crate::config::DetectorConfig;
use crate::detector::fresh;
use crate::detector::hysteresis;
use crate::detector::state::{prepare_stale_tag_fallback, Digest, SessionState};
use crate::detector::ScanOutcome;
use crate::models::session::{SessionActivity, SessionInfo, TaggedSession};
use crate::parsers::tags;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Resolve the workspace a session belongs to. First non-empty wins: host
/// info, the workspace tag, then legacy extraction from an `amux-` name.
pub fn workspace_id_for_session(session: &SessionActivity, info: Option<&SessionInfo>) -> String {
    if let Some(info) = info {
        if !info.workspace_id.is_empty() {
            return info.workspace_id.clone();
        }
    }
    if !session.workspace_id.is_empty() {
        return session.workspace_id.clone();
    }
    legacy_workspace_id(&session.name)
}

fn legacy_workspace_id(name: &str) -> String {
    match name.strip_prefix(tags::LEGACY_NAME_PREFIX) {
        Some(rest) => rest.split('-').next().unwrap_or("").to_string(),
        None => String::new(),
    }
}

/// Whether a session hosts an AI agent chat.
///
/// A host-known chat flag wins over a contradicting tag; otherwise an
/// explicit type tag decides; untyped known sessions fall back to host info.
/// Name-prefix inference is deliberately absent.
pub fn is_chat_session(session: &SessionActivity, info: Option<&SessionInfo>) -> bool {
    if let Some(info) = info {
        if info.is_chat {
            return true;
        }
    }
    if !session.session_type.is_empty() {
        return session.session_type == "agent";
    }
    info.map(|i| i.is_chat).unwrap_or(false)
}

/// Output that follows input within the echo window is the terminal echoing
/// the user's keystrokes, not agent work.
pub fn is_likely_user_echo(snapshot: &TaggedSession, config: &DetectorConfig) -> bool {
    let (Some(output_at), Some(input_at)) = (snapshot.last_output_at, snapshot.last_input_at)
    else {
        return false;
    };
    output_at >= input_at && output_at - input_at <= config.input_echo_window_ms as i64
}

/// Whether the user typed recently enough to suppress fallback capture.
pub fn has_recent_user_input(snapshot: &TaggedSession, now: i64, config: &DetectorConfig) -> bool {
    let Some(input_at) = snapshot.last_input_at else {
        return false;
    };
    let age = now - input_at;
    0 <= age && age <= config.input_suppress_window_ms as i64
}

/// Stale-tag gating: capture only when the prefilter is unavailable (be
/// permissive) or reports recent window activity for this session.
pub fn should_fallback_for_stale_tag(name: &str, recent: Option<&HashSet<String>>) -> bool {
    match recent {
        None => true,
        Some(set) => set.contains(name),
    }
}

/// Capture wrapper that answers "failed" for suppressed sessions, letting
/// the engine decay them without spending a capture.
struct SuppressedCapture<'a> {
    inner: &'a dyn PaneCapture,
    suppressed: &'a HashSet<String>,
}

#[async_trait]
impl PaneCapture for SuppressedCapture<'_> {
    async fn capture_tail(&self, session: &str, lines: u32) -> Option<String> {
        if self.suppressed.contains(session) {
            return None;
        }
        self.inner.capture_tail(session, lines).await
    }
}

/// Classify every tagged session and produce the scan's active-workspace set
/// plus the state map for the next scan.
pub async fn active_workspace_ids_from_tags<F>(
    info_by_session: &HashMap<String, SessionInfo>,
    tagged: &[TaggedSession],
    recent_activity: Option<&HashSet<String>>,
    mut states: HashMap<String, SessionState>,
    now: i64,
    config: &DetectorConfig,
    capture: &dyn PaneCapture,
    hash_fn: &F,
) -> ScanOutcome
where
    F: Fn(&str) -> Digest + Send + Sync,
{
    let mut active: BTreeSet<String> = BTreeSet::new();
    let mut fallback: Vec<TaggedSession> = Vec::new();
    let mut suppressed: HashSet<String> = HashSet::new();
    let mut seen: HashSet<String> = HashSet::new();

    for snapshot in tagged {
        let name = snapshot.name();
        let info = info_by_session.get(name);
        if !is_chat_session(&snapshot.session, info) {
            continue;
        }

        let Some(last_output_at) = snapshot.last_output_at else {
            // No tag data at all; rely on delta hysteresis.
            if has_recent_user_input(snapshot, now, config) {
                suppressed.insert(name.to_string());
            }
            fallback.push(snapshot.clone());
            continue;
        };

        let age = now - last_output_at;
        if age < 0 {
            // Future-dated tag: suspicious clock or stale writer.
            if let Some(state) = states.get_mut(name) {
                prepare_stale_tag_fallback(state, config);
            }
            fallback.push(snapshot.clone());
            continue;
        }

        if age <= config.output_window_ms as i64 {
            if is_likely_user_echo(snapshot, config) {
                // Echo decays the score rather than holding it.
                if let Some(state) = states.get_mut(name) {
                    prepare_stale_tag_fallback(state, config);
                }
                suppressed.insert(name.to_string());
                fallback.push(snapshot.clone());
                continue;
            }

            let state = states.entry(name.to_string()).or_default();
            if fresh::fresh_tag_visible_activity(state, name, now, config, capture, hash_fn).await
            {
                let workspace = workspace_id_for_session(&snapshot.session, info);
                if !workspace.is_empty() {
                    active.insert(workspace);
                }
            }
            seen.insert(name.to_string());
            continue;
        }

        // Stale tag: whatever happens next, it must not ride a fresh-tag
        // score or hold timer.
        if let Some(state) = states.get_mut(name) {
            prepare_stale_tag_fallback(state, config);
        }
        if has_recent_user_input(snapshot, now, config) {
            suppressed.insert(name.to_string());
            fallback.push(snapshot.clone());
            continue;
        }
        if info.is_some() {
            // Known tabs may be detached and fail to refresh their output
            // tag while still producing work.
            fallback.push(snapshot.clone());
            continue;
        }
        if should_fallback_for_stale_tag(name, recent_activity) {
            fallback.push(snapshot.clone());
        }
        // Otherwise skipped entirely: no capture for long-idle sessions, and
        // cross-scan decay resets their state.
    }

    let wrapped = SuppressedCapture {
        inner: capture,
        suppressed: &suppressed,
    };
    let mut outcome = hysteresis::active_workspace_ids_with_hysteresis(
        info_by_session,
        &fallback,
        states,
        seen,
        now,
        config,
        &wrapped,
        hash_fn,
    )
    .await;

    outcome.active_workspaces.extend(active);
    outcome
}
