use serde::{Deserialize, Serialize};

/// Host-known metadata about a workspace tab, keyed by session name.
///
/// When present, this record is authoritative for chat classification;
/// the daemon treats the map it receives as read-only within a scan.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionInfo {
    pub status: String,
    pub workspace_id: String,
    pub assistant: String,
    pub is_chat: bool,
}

/// Session identity and its multiplexer tags at scan time.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionActivity {
    /// Non-empty, trimmed session name.
    pub name: String,
    pub workspace_id: String,
    pub tab_id: String,
    /// Value of the session-type tag; "agent" marks an AI-agent session.
    pub session_type: String,
    /// Whether the managed-session marker tag was truthy.
    pub tagged: bool,
}

/// A session snapshot paired with its parsed output/input timestamps.
///
/// Timestamps are absolute unix instants in milliseconds. `None` means the
/// tag was absent or unparseable.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaggedSession {
    pub session: SessionActivity,
    pub last_output_at: Option<i64>,
    pub last_input_at: Option<i64>,
}

impl TaggedSession {
    pub fn new(session: SessionActivity) -> Self {
        Self {
            session,
            last_output_at: None,
            last_input_at: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.session.name
    }
}
