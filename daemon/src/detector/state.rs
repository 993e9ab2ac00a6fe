use crate::config::DetectorConfig;

/// Pane-content digest. 128 bits of a non-cryptographic-strength hash are
/// plenty: a collision causes missed activity, never spurious activity.
pub type Digest = [u8; 16];

/// The "no baseline" digest value.
pub const ZERO_DIGEST: Digest = [0u8; 16];

/// Per-session hysteresis state, owned exclusively by the detector.
///
/// Created on first classification of a session, mutated by at most one scan
/// at a time, and reset by cross-scan decay when the session disappears from
/// a scan's fetch output.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionState {
    pub last_hash: Digest,
    /// Activity score, clamped to `[0, score_max]` by every mutation.
    pub score: u32,
    /// Hold timer: unix millis of the last score-threshold crossing.
    /// Zero means the hold is cleared.
    pub last_active_at: i64,
    pub initialized: bool,
}

impl SessionState {
    /// Reset to the uninitialized default. Applied to sessions that were not
    /// seen this scan so that a stored hash cannot trip a +2 delta when the
    /// session reappears later.
    pub fn reset(&mut self) {
        *self = SessionState::default();
    }

    /// Whether the session counts as active at `now`.
    pub fn is_active(&self, now: i64, config: &DetectorConfig) -> bool {
        if self.score >= config.score_threshold {
            return true;
        }
        self.last_active_at != 0 && now - self.last_active_at < config.hold_duration_ms as i64
    }

    /// Decay one step, never below zero. Used both for unchanged content and
    /// for capture failures so a chronic failure cannot hold a session active.
    pub fn decay(&mut self) {
        self.score = self.score.saturating_sub(1);
    }
}

/// Clamp carryover before a session enters the stale-tag fallback path.
///
/// Caps the score at the activity threshold and clears the hold timer, so the
/// fallback path cannot ride a recent fresh-tag score or hold for up to the
/// hold duration after output ceased. Idempotent.
pub fn prepare_stale_tag_fallback(state: &mut SessionState, config: &DetectorConfig) {
    if state.score > config.score_threshold {
        state.score = config.score_threshold;
    }
    state.last_active_at = 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DetectorConfig {
        DetectorConfig::default()
    }

    #[test]
    fn default_state_is_uninitialized() {
        let state = SessionState::default();
        assert!(!state.initialized);
        assert_eq!(state.last_hash, ZERO_DIGEST);
        assert_eq!(state.score, 0);
        assert_eq!(state.last_active_at, 0);
    }

    #[test]
    fn active_at_threshold_score() {
        let config = config();
        let state = SessionState {
            score: config.score_threshold,
            ..Default::default()
        };
        assert!(state.is_active(1_000, &config));
    }

    #[test]
    fn inactive_below_threshold_without_hold() {
        let config = config();
        let state = SessionState {
            score: config.score_threshold - 1,
            ..Default::default()
        };
        assert!(!state.is_active(1_000, &config));
    }

    #[test]
    fn hold_timer_keeps_session_active() {
        let config = config();
        let state = SessionState {
            score: 0,
            last_active_at: 10_000,
            initialized: true,
            ..Default::default()
        };
        assert!(state.is_active(10_000 + config.hold_duration_ms as i64 - 1, &config));
        assert!(!state.is_active(10_000 + config.hold_duration_ms as i64, &config));
    }

    #[test]
    fn cleared_hold_does_not_activate() {
        let config = config();
        let state = SessionState {
            score: 0,
            last_active_at: 0,
            initialized: true,
            ..Default::default()
        };
        assert!(!state.is_active(1, &config));
    }

    #[test]
    fn decay_floors_at_zero() {
        let mut state = SessionState::default();
        state.decay();
        assert_eq!(state.score, 0);
        state.score = 2;
        state.decay();
        assert_eq!(state.score, 1);
    }

    #[test]
    fn stale_fallback_clamps_score_and_clears_hold() {
        let config = config();
        let mut state = SessionState {
            score: config.score_max,
            last_active_at: 500,
            initialized: true,
            last_hash: [7u8; 16],
        };
        prepare_stale_tag_fallback(&mut state, &config);
        assert_eq!(state.score, config.score_threshold);
        assert_eq!(state.last_active_at, 0);
        assert!(state.initialized, "baseline survives the trim");
        assert_eq!(state.last_hash, [7u8; 16]);
    }

    #[test]
    fn stale_fallback_is_idempotent() {
        let config = config();
        let mut state = SessionState {
            score: config.score_max,
            last_active_at: 500,
            initialized: true,
            last_hash: [7u8; 16],
        };
        prepare_stale_tag_fallback(&mut state, &config);
        let once = state.clone();
        prepare_stale_tag_fallback(&mut state, &config);
        assert_eq!(state, once);
    }

    #[test]
    fn stale_fallback_leaves_low_scores_alone() {
        let config = config();
        let mut state = SessionState {
            score: 1,
            initialized: true,
            ..Default::default()
        };
        prepare_stale_tag_fallback(&mut state, &config);
        assert_eq!(state.score, 1);
    }

    #[test]
    fn reset_clears_everything() {
        let mut state = SessionState {
            score: 4,
            last_active_at: 99,
            initialized: true,
            last_hash: [1u8; 16],
        };
        state.reset();
        assert_eq!(state, SessionState::default());
    }
}
