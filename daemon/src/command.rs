//! Bounded external-command execution.
//!
//! Every multiplexer invocation goes through [`CommandRunner`]: a per-call
//! deadline, a concurrency cap, an output-size cap, and a short backoff when
//! a category fails repeatedly (a wedged tmux server should not be hammered
//! once per scan).

use crate::config::MultiplexerConfig;
use crate::metrics::{Timer, METRICS};
use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{Mutex, Semaphore};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandCategory {
    TmuxQuery,
    TmuxCapture,
}

#[derive(Clone, Debug)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub category: CommandCategory,
}

impl CommandSpec {
    pub fn tmux(args: Vec<String>, category: CommandCategory) -> Self {
        Self {
            program: "tmux".to_string(),
            args,
            category,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CommandOutput {
    pub status: std::process::ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

#[derive(Debug)]
pub enum CommandError {
    Spawn(std::io::Error),
    Io(std::io::Error),
    Timeout,
    OutputTooLarge,
    Backoff,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Spawn(e) => write!(f, "spawn failed: {e}"),
            CommandError::Io(e) => write!(f, "io failed: {e}"),
            CommandError::Timeout => write!(f, "command timed out"),
            CommandError::OutputTooLarge => write!(f, "command output exceeded cap"),
            CommandError::Backoff => write!(f, "category is backing off after repeated failures"),
        }
    }
}

impl std::error::Error for CommandError {}

const BACKOFF_AFTER_FAILURES: u32 = 5;
const BACKOFF_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct FailureState {
    consecutive: u32,
    backoff_until: Option<Instant>,
}

#[derive(Debug)]
pub struct CommandRunner {
    timeout: Duration,
    max_output_bytes: usize,
    semaphore: Semaphore,
    failures: Mutex<HashMap<CommandCategory, FailureState>>,
}

impl CommandRunner {
    pub fn new(config: &MultiplexerConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.command_timeout_ms.max(1)),
            max_output_bytes: config.max_output_kb.max(1) * 1024,
            semaphore: Semaphore::new(config.max_concurrent.max(1)),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Run a command to completion, collecting stdout and stderr.
    ///
    /// A non-zero exit is not an error here; callers inspect `status` because
    /// tmux exits non-zero for ordinary conditions like "no server running".
    pub async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, CommandError> {
        self.check_backoff(spec.category).await?;

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| CommandError::Backoff)?;
        let _timer = Timer::new(&METRICS.command);

        let result = tokio::time::timeout(self.timeout, self.execute(&spec)).await;
        let outcome = match result {
            Ok(inner) => inner,
            Err(_) => Err(CommandError::Timeout),
        };

        match &outcome {
            Ok(_) => self.record_success(spec.category).await,
            Err(_) => self.record_failure(spec.category).await,
        }
        outcome
    }

    async fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(CommandError::Spawn)?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let cap = self.max_output_bytes;

        let stdout_task = async {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                read_capped(pipe, &mut buf, cap).await?;
            }
            Ok::<_, CommandError>(buf)
        };
        let stderr_task = async {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                read_capped(pipe, &mut buf, cap).await?;
            }
            Ok::<_, CommandError>(buf)
        };

        let (stdout, stderr) = tokio::try_join!(stdout_task, stderr_task)?;
        let status = child.wait().await.map_err(CommandError::Io)?;

        Ok(CommandOutput {
            status,
            stdout,
            stderr,
        })
    }

    async fn check_backoff(&self, category: CommandCategory) -> Result<(), CommandError> {
        let mut failures = self.failures.lock().await;
        let state = failures.entry(category).or_default();
        if let Some(until) = state.backoff_until {
            if Instant::now() < until {
                return Err(CommandError::Backoff);
            }
            state.backoff_until = None;
        }
        Ok(())
    }

    async fn record_success(&self, category: CommandCategory) {
        let mut failures = self.failures.lock().await;
        if let Some(state) = failures.get_mut(&category) {
            state.consecutive = 0;
            state.backoff_until = None;
        }
    }

    async fn record_failure(&self, category: CommandCategory) {
        let mut failures = self.failures.lock().await;
        let state = failures.entry(category).or_default();
        state.consecutive = state.consecutive.saturating_add(1);
        if state.consecutive >= BACKOFF_AFTER_FAILURES {
            state.backoff_until = Some(Instant::now() + BACKOFF_WINDOW);
        }
    }
}

async fn read_capped<R>(pipe: &mut R, buf: &mut Vec<u8>, cap: usize) -> Result<(), CommandError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        let n = pipe.read(&mut chunk).await.map_err(CommandError::Io)?;
        if n == 0 {
            return Ok(());
        }
        if buf.len() + n > cap {
            return Err(CommandError::OutputTooLarge);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> CommandRunner {
        CommandRunner::new(&MultiplexerConfig::default())
    }

    fn spec(program: &str, args: &[&str]) -> CommandSpec {
        CommandSpec {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            category: CommandCategory::TmuxQuery,
        }
    }

    #[tokio::test]
    async fn captures_stdout() {
        let output = runner()
            .run(spec("echo", &["hello"]))
            .await
            .expect("echo runs");
        assert!(output.status.success());
        assert_eq!(output.stdout_text().trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let output = runner()
            .run(spec("sh", &["-c", "exit 3"]))
            .await
            .expect("sh runs");
        assert!(!output.status.success());
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let err = runner()
            .run(spec("/nonexistent/amux-tracker-test-binary", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn(_)));
    }

    #[tokio::test]
    async fn output_cap_is_enforced() {
        let config = MultiplexerConfig {
            max_output_kb: 1,
            ..Default::default()
        };
        let runner = CommandRunner::new(&config);
        let err = runner
            .run(spec("sh", &["-c", "head -c 4096 /dev/zero"]))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::OutputTooLarge));
    }

    #[tokio::test]
    async fn timeout_kills_slow_commands() {
        let config = MultiplexerConfig {
            command_timeout_ms: 50,
            ..Default::default()
        };
        let runner = CommandRunner::new(&config);
        let err = runner.run(spec("sleep", &["5"])).await.unwrap_err();
        assert!(matches!(err, CommandError::Timeout));
    }

    #[tokio::test]
    async fn repeated_failures_open_backoff() {
        let config = MultiplexerConfig {
            command_timeout_ms: 1_000,
            ..Default::default()
        };
        let runner = CommandRunner::new(&config);
        for _ in 0..BACKOFF_AFTER_FAILURES {
            let _ = runner
                .run(spec("/nonexistent/amux-tracker-test-binary", &[]))
                .await;
        }
        let err = runner.run(spec("echo", &["hi"])).await.unwrap_err();
        assert!(matches!(err, CommandError::Backoff));
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let runner = runner();
        for _ in 0..(BACKOFF_AFTER_FAILURES - 1) {
            let _ = runner
                .run(spec("/nonexistent/amux-tracker-test-binary", &[]))
                .await;
        }
        runner.run(spec("echo", &["ok"])).await.expect("echo runs");
        // Another burst short of the limit stays open.
        for _ in 0..(BACKOFF_AFTER_FAILURES - 1) {
            let _ = runner
                .run(spec("/nonexistent/amux-tracker-test-binary", &[]))
                .await;
        }
        runner.run(spec("echo", &["ok"])).await.expect("still open");
    }
}
