use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Detection thresholds and windows. All times are milliseconds.
///
/// The defaults are empirically tuned; they are exposed here rather than
/// baked in so hosts can adjust them without a rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DetectorConfig {
    /// Score at or above this marks a session active.
    pub score_threshold: u32,
    /// Upper clamp preventing runaway accumulation.
    pub score_max: u32,
    /// Output-tag age bound for the fresh-tag path.
    pub output_window_ms: u64,
    /// Output this close after input is treated as local echo.
    pub input_echo_window_ms: u64,
    /// User input within this window suppresses fallback capture.
    pub input_suppress_window_ms: u64,
    /// Depth of the pane tail capture, in lines.
    pub capture_tail_lines: u32,
    /// Grace period after the last score-threshold crossing.
    pub hold_duration_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            score_threshold: 3,
            score_max: 6,
            output_window_ms: 2_000,
            input_echo_window_ms: 400,
            input_suppress_window_ms: 2_000,
            capture_tail_lines: 50,
            hold_duration_ms: 6_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PollingConfig {
    /// Scan cadence while the multiplexer is reachable.
    pub scan_interval_ms: u64,
    /// Scan cadence after repeated fetch failures.
    pub degraded_interval_ms: u64,
    /// Window for the multiplexer-level activity prefilter, in seconds.
    pub prefilter_window_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: 1_000,
            degraded_interval_ms: 5_000,
            prefilter_window_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MultiplexerConfig {
    /// Per-call deadline for multiplexer invocations.
    pub command_timeout_ms: u64,
    /// Concurrent multiplexer subprocess cap.
    pub max_concurrent: usize,
    /// Output cap per invocation, in KiB.
    pub max_output_kb: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 5_000,
            max_concurrent: 4,
            max_output_kb: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    pub level: String,
    /// Log file path; stdout when unset.
    pub file: Option<PathBuf>,
    /// Output format: "json" or "text".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TrackerConfig {
    pub detector: DetectorConfig,
    pub polling: PollingConfig,
    pub multiplexer: MultiplexerConfig,
    pub logging: LoggingConfig,
}

/// Loaded configuration plus where it came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigManager {
    config: TrackerConfig,
    path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration from the filesystem.
    ///
    /// Resolution order: the explicit override, `$AMUX_TRACKER_CONFIG`, then
    /// `$XDG_CONFIG_HOME/amux-tracker/config.toml` (or the `~/.config`
    /// equivalent). A missing discovered file yields defaults; an explicit
    /// override that does not exist is an error.
    pub fn load_from_fs(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(ConfigError::new(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            return Self::load_file(&path);
        }

        if let Some(raw) = env::var_os("AMUX_TRACKER_CONFIG") {
            let path = PathBuf::from(raw);
            if path.exists() {
                return Self::load_file(&path);
            }
        }

        let discovered = default_config_path();
        if let Some(path) = discovered {
            if path.exists() {
                return Self::load_file(&path);
            }
        }

        Ok(Self::default())
    }

    fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| ConfigError::new(format!("read {}: {e}", path.display())))?;
        let config: TrackerConfig = toml::from_str(&raw)
            .map_err(|e| ConfigError::new(format!("parse {}: {e}", path.display())))?;
        Ok(Self {
            config,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut TrackerConfig {
        &mut self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn default_config_path() -> Option<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(dir).join("amux-tracker/config.toml"));
    }
    env::var_os("HOME").map(|home| PathBuf::from(home).join(".config/amux-tracker/config.toml"))
}
