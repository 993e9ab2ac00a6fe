//! Fresh-tag visible-activity validation.
//!
//! A fresh output tag alone is not proof of agent work: terminal refresh
//! animations, sponsor banners, and similar redraws refresh the tag without
//! meaningful output. This path demands a visible pane delta before letting
//! a fresh tag keep a session active.

use crate::collector::tmux::PaneCapture;
use crate::config::DetectorConfig;
use crate::detector::state::{Digest, SessionState};

/// Seed the comparison baseline for a session first seen on the fresh-tag
/// path. Score stays at zero and no hold timer starts: the tag is trusted
/// for this scan only, and the next scan compares against real content.
pub fn seed_fresh_tag_baseline(state: &mut SessionState, digest: Digest) {
    state.last_hash = digest;
    state.initialized = true;
    state.score = 0;
    state.last_active_at = 0;
}

/// Decide whether a fresh output tag counts as activity.
///
/// Unknown sessions are baseline-seeded and trusted for this scan. Known
/// sessions must show a pane delta; unchanged content clamps and decays the
/// score and clears the hold, so a tag that keeps refreshing over a static
/// pane goes quiet after one scan. A capture failure trusts the tag without
/// touching state.
pub async fn fresh_tag_visible_activity<F>(
    state: &mut SessionState,
    name: &str,
    now: i64,
    config: &DetectorConfig,
    capture: &dyn PaneCapture,
    hash_fn: &F,
) -> bool
where
    F: Fn(&str) -> Digest + Send + Sync,
{
    if !state.initialized {
        if let Some(content) = capture.capture_tail(name, config.capture_tail_lines).await {
            seed_fresh_tag_baseline(state, hash_fn(&content));
        }
        return true;
    }

    match capture.capture_tail(name, config.capture_tail_lines).await {
        Some(content) => {
            let digest = hash_fn(&content);
            if digest != state.last_hash {
                state.last_hash = digest;
                // Keep the score at threshold so a later fallback pass for
                // this session does not restart from zero.
                if state.score < config.score_threshold {
                    state.score = config.score_threshold;
                }
                state.last_active_at = now;
                true
            } else {
                if state.score > config.score_threshold {
                    state.score = config.score_threshold;
                }
                state.decay();
                state.last_active_at = 0;
                false
            }
        }
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::hysteresis::content_digest;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedCapture {
        content: Mutex<Option<String>>,
        calls: Mutex<u32>,
    }

    impl ScriptedCapture {
        fn new(content: Option<&str>) -> Self {
            Self {
                content: Mutex::new(content.map(str::to_string)),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl PaneCapture for ScriptedCapture {
        async fn capture_tail(&self, _session: &str, _lines: u32) -> Option<String> {
            *self.calls.lock().unwrap() += 1;
            self.content.lock().unwrap().clone()
        }
    }

    fn config() -> DetectorConfig {
        DetectorConfig::default()
    }

    #[tokio::test]
    async fn unknown_session_is_seeded_and_trusted() {
        let config = config();
        let capture = ScriptedCapture::new(Some("hello"));
        let mut state = SessionState::default();

        let active =
            fresh_tag_visible_activity(&mut state, "s", 1_000, &config, &capture, &content_digest)
                .await;

        assert!(active);
        assert!(state.initialized);
        assert_eq!(state.score, 0);
        assert_eq!(state.last_active_at, 0, "no hold timer on seed");
        assert_eq!(state.last_hash, content_digest("hello"));
    }

    #[tokio::test]
    async fn seed_capture_failure_trusts_tag_without_baseline() {
        let config = config();
        let capture = ScriptedCapture::new(None);
        let mut state = SessionState::default();

        let active =
            fresh_tag_visible_activity(&mut state, "s", 1_000, &config, &capture, &content_digest)
                .await;

        assert!(active);
        assert!(!state.initialized, "baseline retried next scan");
    }

    #[tokio::test]
    async fn delta_raises_score_and_starts_hold() {
        let config = config();
        let capture = ScriptedCapture::new(Some("new content"));
        let mut state = SessionState {
            initialized: true,
            last_hash: content_digest("old content"),
            score: 0,
            last_active_at: 0,
        };

        let active =
            fresh_tag_visible_activity(&mut state, "s", 5_000, &config, &capture, &content_digest)
                .await;

        assert!(active);
        assert_eq!(state.score, config.score_threshold);
        assert_eq!(state.last_active_at, 5_000);
        assert_eq!(state.last_hash, content_digest("new content"));
    }

    #[tokio::test]
    async fn delta_does_not_lower_a_higher_score() {
        let config = config();
        let capture = ScriptedCapture::new(Some("new"));
        let mut state = SessionState {
            initialized: true,
            last_hash: content_digest("old"),
            score: config.score_max,
            last_active_at: 0,
        };

        assert!(
            fresh_tag_visible_activity(&mut state, "s", 5_000, &config, &capture, &content_digest)
                .await
        );
        assert_eq!(state.score, config.score_max);
    }

    #[tokio::test]
    async fn unchanged_content_is_not_activity() {
        let config = config();
        let capture = ScriptedCapture::new(Some("static"));
        let mut state = SessionState {
            initialized: true,
            last_hash: content_digest("static"),
            score: config.score_max,
            last_active_at: 4_000,
        };

        let active =
            fresh_tag_visible_activity(&mut state, "s", 5_000, &config, &capture, &content_digest)
                .await;

        assert!(!active, "fresh tag over a static pane is not activity");
        assert_eq!(state.score, config.score_threshold - 1);
        assert_eq!(state.last_active_at, 0);
    }

    #[tokio::test]
    async fn unchanged_decay_floors_at_zero() {
        let config = config();
        let capture = ScriptedCapture::new(Some("static"));
        let mut state = SessionState {
            initialized: true,
            last_hash: content_digest("static"),
            score: 0,
            last_active_at: 0,
        };

        assert!(
            !fresh_tag_visible_activity(&mut state, "s", 5_000, &config, &capture, &content_digest)
                .await
        );
        assert_eq!(state.score, 0);
    }

    #[tokio::test]
    async fn capture_failure_on_known_session_trusts_tag() {
        let config = config();
        let capture = ScriptedCapture::new(None);
        let mut state = SessionState {
            initialized: true,
            last_hash: content_digest("old"),
            score: 2,
            last_active_at: 123,
        };
        let before = state.clone();

        let active =
            fresh_tag_visible_activity(&mut state, "s", 5_000, &config, &capture, &content_digest)
                .await;

        assert!(active);
        assert_eq!(state, before, "capture failure mutates nothing");
        assert_eq!(capture.calls(), 1);
    }
}
