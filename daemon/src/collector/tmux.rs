//! Multiplexer capability surface and its tmux implementation.
//!
//! The detection core never shells out directly; it sees two narrow traits.
//! [`SessionFetcher`] lists sessions with their tags, [`PaneCapture`] reads a
//! pane tail. "Multiplexer unavailable" is an absent handle (`Option`), not a
//! null smuggled through the trait.

use crate::command::{CommandCategory, CommandRunner, CommandSpec};
use crate::metrics::{Timer, METRICS};
use crate::models::session::{SessionActivity, SessionInfo, TaggedSession};
use crate::parsers::tags;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug)]
pub enum FetchError {
    /// The capability handle is absent; the multiplexer is not configured or
    /// not reachable at all. Hosts keep their previous state on this.
    MultiplexerUnavailable,
    /// A transient invocation failure; state must be preserved.
    Command(crate::command::CommandError),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::MultiplexerUnavailable => write!(f, "multiplexer not available"),
            FetchError::Command(e) => write!(f, "multiplexer command failed: {e}"),
        }
    }
}

impl std::error::Error for FetchError {}

/// One session row from the multiplexer: name plus requested tag values.
/// Missing tags surface as empty strings, not absent keys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagRow {
    pub name: String,
    pub tags: HashMap<String, String>,
}

impl TagRow {
    pub fn tag(&self, key: &str) -> &str {
        self.tags.get(key).map(String::as_str).unwrap_or("")
    }
}

/// Lists live sessions and their tag values.
#[async_trait]
pub trait SessionFetcher: Send + Sync {
    /// Return every live session with the requested tag keys. When `matches`
    /// is non-empty, only sessions whose tags equal all required values are
    /// returned.
    async fn sessions_with_tags(
        &self,
        matches: &HashMap<String, String>,
        keys: &[&str],
    ) -> Result<Vec<TagRow>, FetchError>;

    /// Return the sessions with multiplexer-level window activity within
    /// `window`.
    async fn sessions_active_within(
        &self,
        window: Duration,
    ) -> Result<Vec<SessionActivity>, FetchError>;
}

/// Captures the trailing lines of a session's pane.
///
/// `None` covers every failure mode: missing session, timeout, permission.
/// Callers treat a failure as score decay, never as an error.
#[async_trait]
pub trait PaneCapture: Send + Sync {
    async fn capture_tail(&self, session: &str, lines: u32) -> Option<String>;
}

/// Assemble the scan's candidate list from the multiplexer.
///
/// A row is kept iff its managed-marker tag is truthy or the host already
/// knows the session by name. The last-output instant prefers the dedicated
/// tag and falls back to the session lease, which writers refresh on both
/// input and output.
pub async fn fetch_tagged_sessions(
    fetcher: Option<&dyn SessionFetcher>,
    info_by_session: &HashMap<String, SessionInfo>,
) -> Result<Vec<TaggedSession>, FetchError> {
    let fetcher = fetcher.ok_or(FetchError::MultiplexerUnavailable)?;
    let _timer = Timer::new(&METRICS.tag_fetch);

    let rows = fetcher
        .sessions_with_tags(&HashMap::new(), tags::SCAN_TAG_KEYS)
        .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let name = row.name.trim();
        if name.is_empty() {
            continue;
        }
        let managed = tags::tag_is_truthy(row.tag(tags::TAG_MANAGED));
        if !managed && !info_by_session.contains_key(name) {
            continue;
        }

        let last_output_at = tags::parse_unix_time_tag(row.tag(tags::TAG_LAST_OUTPUT_AT))
            .or_else(|| tags::parse_unix_time_tag(row.tag(tags::TAG_SESSION_LEASE_AT)));
        let last_input_at = tags::parse_unix_time_tag(row.tag(tags::TAG_LAST_INPUT_AT));

        out.push(TaggedSession {
            session: SessionActivity {
                name: name.to_string(),
                workspace_id: row.tag(tags::TAG_WORKSPACE).to_string(),
                tab_id: row.tag(tags::TAG_TAB).to_string(),
                session_type: row.tag(tags::TAG_TYPE).to_string(),
                tagged: managed,
            },
            last_output_at,
            last_input_at,
        });
    }
    Ok(out)
}

/// The multiplexer-level activity prefilter, reduced to session names.
///
/// Callers distinguish a failed fetch (prefilter unavailable, be permissive)
/// from an empty set (nothing recently active); the service maps an `Err`
/// here to "no prefilter" rather than aborting the scan.
pub async fn fetch_recently_active_by_window(
    fetcher: Option<&dyn SessionFetcher>,
    window: Duration,
) -> Result<HashSet<String>, FetchError> {
    let fetcher = fetcher.ok_or(FetchError::MultiplexerUnavailable)?;
    let sessions = fetcher.sessions_active_within(window).await?;
    Ok(sessions.into_iter().map(|s| s.name).collect())
}

/// Field separator for `list-sessions` format strings. Session names cannot
/// contain it because tmux rejects control characters in names.
const FIELD_SEP: char = '\t';

/// The real tmux-backed fetcher.
pub struct TmuxFetcher {
    runner: Arc<CommandRunner>,
}

impl TmuxFetcher {
    pub fn new(runner: Arc<CommandRunner>) -> Self {
        Self { runner }
    }

    fn format_for_keys(keys: &[&str]) -> String {
        let mut format = String::from("#{session_name}");
        for key in keys {
            format.push(FIELD_SEP);
            format.push_str("#{");
            format.push_str(key);
            format.push('}');
        }
        format
    }
}

#[async_trait]
impl SessionFetcher for TmuxFetcher {
    async fn sessions_with_tags(
        &self,
        matches: &HashMap<String, String>,
        keys: &[&str],
    ) -> Result<Vec<TagRow>, FetchError> {
        let format = Self::format_for_keys(keys);
        let spec = CommandSpec::tmux(
            vec![
                "list-sessions".to_string(),
                "-F".to_string(),
                format,
            ],
            CommandCategory::TmuxQuery,
        );
        let output = self.runner.run(spec).await.map_err(FetchError::Command)?;
        if !output.status.success() {
            // No server running means no sessions, not a failure.
            return Ok(Vec::new());
        }

        let text = output.stdout_text();
        let mut rows = parse_tag_rows(&text, keys);
        if !matches.is_empty() {
            rows.retain(|row| matches.iter().all(|(key, want)| row.tag(key) == want));
        }
        Ok(rows)
    }

    async fn sessions_active_within(
        &self,
        window: Duration,
    ) -> Result<Vec<SessionActivity>, FetchError> {
        let activity_keys = [
            tags::TAG_WORKSPACE,
            tags::TAG_TAB,
            tags::TAG_TYPE,
            tags::TAG_MANAGED,
        ];
        let mut format = format!("#{{session_activity}}{FIELD_SEP}#{{session_name}}");
        for key in activity_keys {
            format.push(FIELD_SEP);
            format.push_str("#{");
            format.push_str(key);
            format.push('}');
        }
        let spec = CommandSpec::tmux(
            vec!["list-sessions".to_string(), "-F".to_string(), format],
            CommandCategory::TmuxQuery,
        );
        let output = self.runner.run(spec).await.map_err(FetchError::Command)?;
        if !output.status.success() {
            return Ok(Vec::new());
        }

        let now_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let window_secs = window.as_secs() as i64;

        let text = output.stdout_text();
        let mut recent = Vec::new();
        for line in text.lines() {
            let mut fields = line.split(FIELD_SEP);
            let activity = fields.next().unwrap_or("").trim();
            let name = fields.next().unwrap_or("").trim();
            if name.is_empty() {
                continue;
            }
            let Ok(activity_secs) = activity.parse::<i64>() else {
                continue;
            };
            if now_secs.saturating_sub(activity_secs) > window_secs {
                continue;
            }
            let workspace_id = fields.next().unwrap_or("").to_string();
            let tab_id = fields.next().unwrap_or("").to_string();
            let session_type = fields.next().unwrap_or("").to_string();
            let tagged = tags::tag_is_truthy(fields.next().unwrap_or(""));
            recent.push(SessionActivity {
                name: name.to_string(),
                workspace_id,
                tab_id,
                session_type,
                tagged,
            });
        }
        Ok(recent)
    }
}

fn parse_tag_rows(output: &str, keys: &[&str]) -> Vec<TagRow> {
    let mut rows = Vec::new();
    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split(FIELD_SEP);
        let name = fields.next().unwrap_or("").trim().to_string();
        if name.is_empty() {
            continue;
        }
        let mut tag_map = HashMap::with_capacity(keys.len());
        for key in keys {
            let value = fields.next().unwrap_or("");
            tag_map.insert((*key).to_string(), value.to_string());
        }
        rows.push(TagRow {
            name,
            tags: tag_map,
        });
    }
    rows
}

/// The real tmux-backed pane capture.
pub struct TmuxCapture {
    runner: Arc<CommandRunner>,
}

impl TmuxCapture {
    pub fn new(runner: Arc<CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl PaneCapture for TmuxCapture {
    async fn capture_tail(&self, session: &str, lines: u32) -> Option<String> {
        let _timer = Timer::new(&METRICS.pane_capture);
        let spec = CommandSpec::tmux(
            vec![
                "capture-pane".to_string(),
                "-p".to_string(),
                "-t".to_string(),
                session.to_string(),
                "-S".to_string(),
                format!("-{lines}"),
            ],
            CommandCategory::TmuxCapture,
        );
        let output = self.runner.run(spec).await.ok()?;
        if !output.status.success() {
            return None;
        }
        Some(tail_lines(&output.stdout_text(), lines as usize))
    }
}

/// Keep the last `lines` non-trailing-blank lines of a capture. Trailing
/// blank rows vary with pane height and would destabilize the content hash.
fn tail_lines(content: &str, lines: usize) -> String {
    let trimmed = content.trim_end_matches(['\n', ' ', '\t']);
    let all: Vec<&str> = trimmed.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
