//! Reserved session-tag keys and tag-value parsing.
//!
//! Writers outside this daemon set these tags on multiplexer sessions; the
//! exact strings are wire-level compatibility and must not change.

/// Truthy marker that a session is managed; `"0"` and empty are falsy.
pub const TAG_MANAGED: &str = "@amux";
/// Workspace ID.
pub const TAG_WORKSPACE: &str = "@amux_workspace";
/// Tab ID within the workspace.
pub const TAG_TAB: &str = "@amux_tab";
/// `"agent"` means AI-agent session; other values mean non-agent.
pub const TAG_TYPE: &str = "@amux_type";
/// Last agent-output timestamp.
pub const TAG_LAST_OUTPUT_AT: &str = "@amux_last_output_at";
/// Last user-input timestamp.
pub const TAG_LAST_INPUT_AT: &str = "@amux_last_input_at";
/// Compatibility fallback: writers refresh this on either input or output.
pub const TAG_SESSION_LEASE_AT: &str = "@amux_session_lease_at";

/// Every tag key a scan reads, in the order they are requested.
pub const SCAN_TAG_KEYS: &[&str] = &[
    TAG_MANAGED,
    TAG_WORKSPACE,
    TAG_TAB,
    TAG_TYPE,
    TAG_LAST_OUTPUT_AT,
    TAG_LAST_INPUT_AT,
    TAG_SESSION_LEASE_AT,
];

/// Reserved session-name prefix for legacy workspace-ID extraction.
pub const LEGACY_NAME_PREFIX: &str = "amux-";

const MILLIS_CUTOFF: i64 = 1_000_000_000_000;
const NANOS_CUTOFF: i64 = 1_000_000_000_000_000;

/// Parse a unix-time tag value into milliseconds since the epoch.
///
/// Writers disagree on the unit, so the magnitude decides: values below
/// 10^12 are seconds, below 10^15 milliseconds, anything larger nanoseconds.
/// The cutoffs keep any post-2001 wall-clock in the right branch even when a
/// writer stored the wrong unit. Empty, non-numeric, and non-positive values
/// parse to `None`.
pub fn parse_unix_time_tag(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value = trimmed.parse::<i64>().ok()?;
    if value <= 0 {
        return None;
    }
    if value < MILLIS_CUTOFF {
        Some(value * 1000)
    } else if value < NANOS_CUTOFF {
        Some(value)
    } else {
        Some(value / 1_000_000)
    }
}

/// Whether a managed-marker tag value counts as set.
pub fn tag_is_truthy(raw: &str) -> bool {
    let trimmed = raw.trim();
    !trimmed.is_empty() && trimmed != "0"
}
