//! Scan scheduling and service lifecycle.
//!
//! A single cooperative loop drives detection: one scan at a time operates on
//! the state map, and the map is committed only when the scan succeeds, so a
//! failed fetch never advances state. Between scans the last published
//! active-set is stable for readers.

use crate::bus::{ActivityChange, EventBus};
use crate::collector::tmux::{
    fetch_recently_active_by_window, fetch_tagged_sessions, FetchError, PaneCapture,
    SessionFetcher,
};
use crate::config::TrackerConfig;
use crate::detector::classify::active_workspace_ids_from_tags;
use crate::detector::hysteresis::content_digest;
use crate::detector::state::SessionState;
use crate::metrics::{Timer, METRICS};
use crate::models::session::SessionInfo;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Consecutive fetch failures before the loop slows to the degraded cadence.
const DEGRADED_AFTER_FAILURES: u32 = 3;

#[derive(Debug)]
pub struct ScanError {
    pub fetch: FetchError,
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scan failed: {}", self.fetch)
    }
}

impl std::error::Error for ScanError {}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub active_workspaces: BTreeSet<String>,
    pub sessions_scanned: usize,
    /// Whether the active set differs from the previous scan.
    pub changed: bool,
}

/// The detector host: owns the hysteresis state, drives scans, publishes
/// active-set changes on the bus.
pub struct WatchService {
    config: TrackerConfig,
    fetcher: Option<Arc<dyn SessionFetcher>>,
    capture: Arc<dyn PaneCapture>,
    bus: Arc<EventBus>,
    states: HashMap<String, SessionState>,
    info_by_session: HashMap<String, SessionInfo>,
    last_active: BTreeSet<String>,
    failure_count: u32,
}

impl WatchService {
    pub fn new(
        config: TrackerConfig,
        fetcher: Option<Arc<dyn SessionFetcher>>,
        capture: Arc<dyn PaneCapture>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            fetcher,
            capture,
            bus,
            states: HashMap::new(),
            info_by_session: HashMap::new(),
            last_active: BTreeSet::new(),
            failure_count: 0,
        }
    }

    /// Replace the host-supplied session metadata. Read-only within a scan.
    pub fn set_session_info(&mut self, info: HashMap<String, SessionInfo>) {
        self.info_by_session = info;
    }

    pub fn active_workspaces(&self) -> &BTreeSet<String> {
        &self.last_active
    }

    pub fn is_degraded(&self) -> bool {
        self.failure_count >= DEGRADED_AFTER_FAILURES
    }

    /// Run one scan at `now`.
    ///
    /// On a fetch error the state map is untouched and the previous active
    /// set stands; capture failures inside the scan are absorbed as decay.
    pub async fn scan_once(&mut self, now: i64) -> Result<ScanSummary, ScanError> {
        let _timer = Timer::new(&METRICS.scan_cycle);

        let tagged =
            match fetch_tagged_sessions(self.fetcher.as_deref(), &self.info_by_session).await {
                Ok(tagged) => tagged,
                Err(fetch) => {
                    self.failure_count = self.failure_count.saturating_add(1);
                    return Err(ScanError { fetch });
                }
            };

        let prefilter_window = Duration::from_secs(self.config.polling.prefilter_window_secs);
        let recent_activity =
            match fetch_recently_active_by_window(self.fetcher.as_deref(), prefilter_window).await
            {
                Ok(set) => Some(set),
                Err(e) => {
                    debug!(error = %e, "activity prefilter unavailable, being permissive");
                    None
                }
            };

        let states = std::mem::take(&mut self.states);
        let outcome = active_workspace_ids_from_tags(
            &self.info_by_session,
            &tagged,
            recent_activity.as_ref(),
            states,
            now,
            &self.config.detector,
            self.capture.as_ref(),
            &content_digest,
        )
        .await;

        self.failure_count = 0;
        self.states = outcome.states;
        let changed = outcome.active_workspaces != self.last_active;
        if changed {
            self.last_active = outcome.active_workspaces.clone();
            self.bus.publish(ActivityChange {
                active_workspaces: self.last_active.clone(),
                observed_at: now,
            });
        }

        Ok(ScanSummary {
            active_workspaces: self.last_active.clone(),
            sessions_scanned: tagged.len(),
            changed,
        })
    }

    /// Drive scans until a shutdown notification arrives.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.config.polling.scan_interval_ms,
            "scan loop started"
        );
        loop {
            let interval_ms = if self.is_degraded() {
                self.config.polling.degraded_interval_ms
            } else {
                self.config.polling.scan_interval_ms
            };
            let tick = tokio::time::sleep(Duration::from_millis(interval_ms.max(10)));

            tokio::select! {
                _ = tick => {}
                _ = shutdown.recv() => {
                    info!("scan loop stopping");
                    break;
                }
            }

            match self.scan_once(now_ms()).await {
                Ok(summary) => {
                    if summary.changed {
                        debug!(
                            active = summary.active_workspaces.len(),
                            sessions = summary.sessions_scanned,
                            "active set changed"
                        );
                    }
                }
                Err(e) => {
                    warn!(error = %e, failures = self.failure_count, "scan failed, keeping previous state");
                }
            }
        }

        let stats = METRICS.scan_cycle.stats();
        info!(
            scans = stats.count,
            avg_us = stats.avg_us,
            max_us = stats.max_us,
            "scan loop finished"
        );
    }
}

/// Wait for SIGTERM/SIGINT (or ctrl-c elsewhere) and fan the shutdown out to
/// every subscriber.
pub async fn wait_for_shutdown(shutdown_tx: broadcast::Sender<()>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "no SIGTERM handler, falling back to ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
                let _ = shutdown_tx.send(());
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            r = tokio::signal::ctrl_c() => {
                if let Err(e) = r {
                    warn!(error = %e, "ctrl-c handler failed");
                }
                info!("received interrupt");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    let _ = shutdown_tx.send(());
}

/// Single-instance lock: an exclusively flocked pid file in the data
/// directory. The lock dies with the process, so stale pid files from a
/// crash never block a restart.
pub struct InstanceGuard {
    pid_path: PathBuf,
    #[cfg(unix)]
    _lock_file: std::fs::File,
}

impl InstanceGuard {
    pub fn acquire(data_dir: &std::path::Path) -> Result<Self, String> {
        std::fs::create_dir_all(data_dir).map_err(|e| format!("create {}: {e}", data_dir.display()))?;
        let pid_path = data_dir.join("daemon.pid");

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let lock_file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(data_dir.join("daemon.lock"))
                .map_err(|e| format!("open lock file: {e}"))?;
            let rc = unsafe { libc::flock(lock_file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc != 0 {
                return Err(match std::fs::read_to_string(&pid_path) {
                    Ok(pid) => format!("another instance is running (pid {})", pid.trim()),
                    Err(_) => "another instance is running".to_string(),
                });
            }
            std::fs::write(&pid_path, format!("{}\n", std::process::id()))
                .map_err(|e| format!("write pid file: {e}"))?;
            Ok(Self {
                pid_path,
                _lock_file: lock_file,
            })
        }

        #[cfg(not(unix))]
        {
            std::fs::write(&pid_path, format!("{}\n", std::process::id()))
                .map_err(|e| format!("write pid file: {e}"))?;
            Ok(Self { pid_path })
        }
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.pid_path);
    }
}

/// Data directory for the pid/lock files.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("XDG_STATE_HOME") {
        PathBuf::from(dir).join("amux-tracker")
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".local/state/amux-tracker")
    } else {
        std::env::temp_dir().join("amux-tracker")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::tmux::TagRow;
    use crate::parsers::tags;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedFetcher {
        rows: Mutex<Vec<TagRow>>,
        fail: Mutex<bool>,
    }

    impl ScriptedFetcher {
        fn new(rows: Vec<TagRow>) -> Self {
            Self {
                rows: Mutex::new(rows),
                fail: Mutex::new(false),
            }
        }

        fn set_fail(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }
    }

    #[async_trait]
    impl SessionFetcher for ScriptedFetcher {
        async fn sessions_with_tags(
            &self,
            _matches: &HashMap<String, String>,
            _keys: &[&str],
        ) -> Result<Vec<TagRow>, FetchError> {
            if *self.fail.lock().unwrap() {
                return Err(FetchError::MultiplexerUnavailable);
            }
            Ok(self.rows.lock().unwrap().clone())
        }

        async fn sessions_active_within(
            &self,
            _window: Duration,
        ) -> Result<Vec<crate::models::session::SessionActivity>, FetchError> {
            Ok(Vec::new())
        }
    }

    struct StaticCapture {
        content: Mutex<String>,
    }

    #[async_trait]
    impl PaneCapture for StaticCapture {
        async fn capture_tail(&self, _session: &str, _lines: u32) -> Option<String> {
            Some(self.content.lock().unwrap().clone())
        }
    }

    fn agent_row(name: &str, workspace: &str, output_at_ms: i64) -> TagRow {
        let mut tag_map = HashMap::new();
        tag_map.insert(tags::TAG_MANAGED.to_string(), "1".to_string());
        tag_map.insert(tags::TAG_TYPE.to_string(), "agent".to_string());
        tag_map.insert(tags::TAG_WORKSPACE.to_string(), workspace.to_string());
        tag_map.insert(
            tags::TAG_LAST_OUTPUT_AT.to_string(),
            output_at_ms.to_string(),
        );
        TagRow {
            name: name.to_string(),
            tags: tag_map,
        }
    }

    fn service(fetcher: Arc<ScriptedFetcher>, capture: Arc<StaticCapture>) -> WatchService {
        WatchService::new(
            TrackerConfig::default(),
            Some(fetcher),
            capture,
            Arc::new(EventBus::new(8)),
        )
    }

    #[tokio::test]
    async fn missing_fetcher_fails_scan_and_preserves_state() {
        let capture = Arc::new(StaticCapture {
            content: Mutex::new("x".to_string()),
        });
        let mut svc = WatchService::new(
            TrackerConfig::default(),
            None,
            capture,
            Arc::new(EventBus::new(8)),
        );
        svc.states.insert("s".to_string(), SessionState::default());

        let err = svc.scan_once(1_000).await.unwrap_err();
        assert!(matches!(err.fetch, FetchError::MultiplexerUnavailable));
        assert!(svc.states.contains_key("s"), "state not advanced");
        assert_eq!(svc.failure_count, 1);
    }

    #[tokio::test]
    async fn scan_publishes_only_changes() {
        let now = 1_700_000_000_000i64;
        let fetcher = Arc::new(ScriptedFetcher::new(vec![agent_row("s", "ws1", now - 500)]));
        let capture = Arc::new(StaticCapture {
            content: Mutex::new("hello".to_string()),
        });
        let mut svc = service(fetcher.clone(), capture);
        let mut rx = svc.bus.subscribe();

        // Fresh tag, unknown session: seeded and active.
        let summary = svc.scan_once(now).await.expect("scan");
        assert!(summary.changed);
        assert!(summary.active_workspaces.contains("ws1"));
        let change = rx.recv().await.expect("published");
        assert_eq!(change.observed_at, now);

        // Static pane, fresh tag again: goes quiet, publishes the empty set.
        fetcher.rows.lock().unwrap()[0] = agent_row("s", "ws1", now);
        let summary = svc.scan_once(now + 500).await.expect("scan");
        assert!(summary.changed);
        assert!(summary.active_workspaces.is_empty());

        // No further change, nothing published.
        fetcher.rows.lock().unwrap()[0] = agent_row("s", "ws1", now + 500);
        let summary = svc.scan_once(now + 1_000).await.expect("scan");
        assert!(!summary.changed);
        assert_eq!(svc.bus.metrics().sent, 2);
    }

    #[tokio::test]
    async fn degraded_after_repeated_failures_and_recovers() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![]));
        let capture = Arc::new(StaticCapture {
            content: Mutex::new(String::new()),
        });
        let mut svc = service(fetcher.clone(), capture);

        fetcher.set_fail(true);
        for _ in 0..DEGRADED_AFTER_FAILURES {
            let _ = svc.scan_once(1_000).await;
        }
        assert!(svc.is_degraded());

        fetcher.set_fail(false);
        svc.scan_once(2_000).await.expect("scan");
        assert!(!svc.is_degraded());
    }

    #[test]
    fn instance_guard_writes_and_removes_pid_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pid_path = dir.path().join("daemon.pid");
        {
            let _guard = InstanceGuard::acquire(dir.path()).expect("acquire");
            let pid = std::fs::read_to_string(&pid_path).expect("pid file");
            assert_eq!(pid.trim(), std::process::id().to_string());
        }
        assert!(!pid_path.exists(), "pid file removed on drop");
    }
}
