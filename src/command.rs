//! Running external commands (git, docker compose) for a deployment.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::critical;
use crate::notify::Notifier;

/// Maximum size for captured output before truncation (1MB)
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// How long to keep draining pipes after the child is gone. A grandchild can
/// hold them open indefinitely.
const READER_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureMode {
    /// stdout and stderr are captured independently.
    #[default]
    Separate,
    /// stderr is folded into stdout. Lines from the two streams are
    /// interleaved roughly as they arrive, not in strict write order.
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunOptions {
    pub capture: CaptureMode,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub stdout: String,
    /// Always empty with [`CaptureMode::Merged`].
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("exited with status {}", describe_code(.code))]
    NonZeroExit { code: Option<i32>, output: String },

    #[error("timed out after {after:?}")]
    Timeout { after: Duration, output: String },

    #[error("could not be started: {message}")]
    Launch { message: String },
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "unknown (killed by signal)".to_string(),
    }
}

impl CommandError {
    pub fn kind(&self) -> &'static str {
        match self {
            CommandError::NonZeroExit { .. } => "NonZeroExit",
            CommandError::Timeout { .. } => "Timeout",
            CommandError::Launch { .. } => "LaunchError",
        }
    }

    /// Captured output (or launch message) explaining the failure.
    pub fn diagnostic(&self) -> &str {
        match self {
            CommandError::NonZeroExit { output, .. } | CommandError::Timeout { output, .. } => {
                output
            }
            CommandError::Launch { message } => message,
        }
    }
}

/// Executes commands on the host. Implemented by [`CommandRunner`]; the seam
/// exists so the deployment pipeline can be driven without real processes.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(
        &self,
        command: &[String],
        working_directory: &Path,
        options: RunOptions,
    ) -> Result<CommandOutput, CommandError>;
}

/// Runs commands as child processes and reports every run to the log and
/// the notifier.
#[derive(Clone)]
pub struct CommandRunner {
    notifier: Notifier,
}

impl CommandRunner {
    pub fn new(notifier: Notifier) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl CommandExecutor for CommandRunner {
    async fn run(
        &self,
        command: &[String],
        working_directory: &Path,
        options: RunOptions,
    ) -> Result<CommandOutput, CommandError> {
        let command_line = command.join(" ");
        let cwd = working_directory.display();

        info!("Running (cwd = '{}'): {}", cwd, command_line);
        self.notifier
            .info(format!(
                "Running command `{}` in directory {}",
                command_line, cwd
            ))
            .await;

        let result = execute(command, working_directory, options).await;

        match &result {
            Ok(output) => {
                debug!("`{}` stdout:\n{}", command_line, output.stdout);
                if !output.stderr.is_empty() {
                    debug!("`{}` stderr:\n{}", command_line, output.stderr);
                }
                info!("`{}` finished successfully in {}", command_line, cwd);
                self.notifier
                    .success(format!("`{}` finished successfully in {}", command_line, cwd))
                    .await;
            }
            Err(e) => {
                critical!(
                    kind = e.kind(),
                    "`{}` in {} {}. Error: {}",
                    command_line,
                    cwd,
                    e,
                    e.diagnostic()
                );
                self.notifier
                    .failure(format!(
                        "`{}` in {} {}.\n{}",
                        command_line,
                        cwd,
                        e,
                        e.diagnostic()
                    ))
                    .await;
            }
        }

        result
    }
}

async fn execute(
    command: &[String],
    working_directory: &Path,
    options: RunOptions,
) -> Result<CommandOutput, CommandError> {
    let (program, args) = command.split_first().ok_or_else(|| CommandError::Launch {
        message: "empty command".to_string(),
    })?;

    let mut child = Command::new(program)
        .args(args)
        .current_dir(working_directory)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CommandError::Launch {
            message: format!(
                "failed to start `{}` in {}: {}",
                program,
                working_directory.display(),
                e
            ),
        })?;

    let stdout_buf = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf = match options.capture {
        CaptureMode::Separate => Arc::new(Mutex::new(Vec::new())),
        CaptureMode::Merged => Arc::clone(&stdout_buf),
    };

    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(drain(stdout, Arc::clone(&stdout_buf))));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(drain(stderr, Arc::clone(&stderr_buf))));
    }

    let waited = match options.timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait())
            .await
            .map_err(|_| limit),
        None => Ok(child.wait().await),
    };

    let status = match waited {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            join_readers(readers).await;
            return Err(CommandError::Launch {
                message: format!("failed to wait for `{}`: {}", program, e),
            });
        }
        Err(limit) => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill timed out `{}`: {}", program, e);
            }
            join_readers(readers).await;
            let mut output = take_text(&stdout_buf);
            if options.capture == CaptureMode::Separate {
                output.push_str(&take_text(&stderr_buf));
            }
            return Err(CommandError::Timeout {
                after: limit,
                output,
            });
        }
    };

    join_readers(readers).await;
    let stdout = take_text(&stdout_buf);
    let stderr = match options.capture {
        CaptureMode::Separate => take_text(&stderr_buf),
        CaptureMode::Merged => String::new(),
    };

    if status.success() {
        Ok(CommandOutput { stdout, stderr })
    } else {
        let output = if stderr.is_empty() { stdout } else { stderr };
        Err(CommandError::NonZeroExit {
            code: status.code(),
            output,
        })
    }
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R, sink: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut buf) = sink.lock() {
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
}

async fn join_readers(readers: Vec<JoinHandle<()>>) {
    for mut reader in readers {
        if tokio::time::timeout(READER_GRACE, &mut reader).await.is_err() {
            reader.abort();
        }
    }
}

fn take_text(buf: &Mutex<Vec<u8>>) -> String {
    let bytes = match buf.lock() {
        Ok(mut guard) => std::mem::take(&mut *guard),
        Err(_) => return String::new(),
    };

    if bytes.len() > MAX_OUTPUT_SIZE {
        let mut text = String::from_utf8_lossy(&bytes[..MAX_OUTPUT_SIZE]).into_owned();
        text.push_str("\n... (output truncated)");
        text
    } else {
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::notify::NotificationLevel;
    use crate::notify::testing::RecordingService;
    use std::time::Instant;
    use tempfile::tempdir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn recording_runner() -> (CommandRunner, Arc<RecordingService>) {
        let recorder = Arc::new(RecordingService::default());
        let notifier = Notifier::new(NotificationLevel::Info).with_service(recorder.clone());
        (CommandRunner::new(notifier), recorder)
    }

    #[tokio::test]
    async fn captures_streams_separately() {
        let dir = tempdir().unwrap();
        let (runner, _) = recording_runner();

        let output = runner
            .run(&sh("echo out; echo err >&2"), dir.path(), RunOptions::default())
            .await
            .unwrap();

        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[tokio::test]
    async fn merged_mode_folds_stderr_into_stdout() {
        let dir = tempdir().unwrap();
        let (runner, _) = recording_runner();
        let options = RunOptions {
            capture: CaptureMode::Merged,
            timeout: Some(Duration::from_secs(10)),
        };

        let output = runner
            .run(&sh("echo out; sleep 0.1; echo err >&2"), dir.path(), options)
            .await
            .unwrap();

        assert_eq!(output.stdout, "out\nerr\n");
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn runs_in_working_directory() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let (runner, _) = recording_runner();

        let output = runner
            .run(&sh("cat marker.txt"), dir.path(), RunOptions::default())
            .await
            .unwrap();

        assert_eq!(output.stdout, "here");
    }

    #[tokio::test]
    async fn success_notifies_info_then_success() {
        let dir = tempdir().unwrap();
        let (runner, recorder) = recording_runner();

        runner
            .run(&sh("true"), dir.path(), RunOptions::default())
            .await
            .unwrap();

        assert_eq!(
            recorder.levels(),
            vec![NotificationLevel::Info, NotificationLevel::Success]
        );
        assert!(recorder.received()[0].body.contains("sh -c true"));
    }

    #[tokio::test]
    async fn nonzero_exit_reports_code_and_stderr() {
        let dir = tempdir().unwrap();
        let (runner, recorder) = recording_runner();

        let err = runner
            .run(&sh("echo boom >&2; exit 3"), dir.path(), RunOptions::default())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            CommandError::NonZeroExit {
                code: Some(3),
                output: "boom\n".to_string()
            }
        );
        assert_eq!(
            recorder.levels(),
            vec![NotificationLevel::Info, NotificationLevel::Failure]
        );
        assert!(recorder.received()[1].body.contains("boom"));
    }

    #[tokio::test]
    async fn nonzero_exit_falls_back_to_stdout() {
        let dir = tempdir().unwrap();
        let (runner, _) = recording_runner();

        let err = runner
            .run(&sh("echo only-stdout; exit 1"), dir.path(), RunOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.diagnostic(), "only-stdout\n");
    }

    #[tokio::test]
    async fn timeout_kills_child_and_keeps_partial_output() {
        let dir = tempdir().unwrap();
        let (runner, recorder) = recording_runner();
        let options = RunOptions {
            capture: CaptureMode::Merged,
            timeout: Some(Duration::from_millis(300)),
        };

        let started = Instant::now();
        let err = runner
            .run(&sh("echo started; exec sleep 30"), dir.path(), options)
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(5));
        match err {
            CommandError::Timeout { after, output } => {
                assert_eq!(after, Duration::from_millis(300));
                assert_eq!(output, "started\n");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(
            recorder.levels(),
            vec![NotificationLevel::Info, NotificationLevel::Failure]
        );
    }

    #[tokio::test]
    async fn missing_binary_is_a_launch_error() {
        let dir = tempdir().unwrap();
        let (runner, recorder) = recording_runner();

        let err = runner
            .run(
                &["definitely-not-a-real-binary-4242".to_string()],
                dir.path(),
                RunOptions::default(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "LaunchError");
        assert_eq!(recorder.levels().last(), Some(&NotificationLevel::Failure));
    }

    #[tokio::test]
    async fn missing_working_directory_is_a_launch_error() {
        let dir = tempdir().unwrap();
        let (runner, _) = recording_runner();

        let err = runner
            .run(&sh("true"), &dir.path().join("gone"), RunOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::Launch { .. }));
    }

    #[tokio::test]
    async fn empty_command_is_a_launch_error() {
        let dir = tempdir().unwrap();
        let (runner, _) = recording_runner();

        let err = runner
            .run(&[], dir.path(), RunOptions::default())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            CommandError::Launch {
                message: "empty command".to_string()
            }
        );
    }

    #[test]
    fn oversized_output_is_truncated() {
        let buf = Mutex::new(vec![b'a'; MAX_OUTPUT_SIZE + 10]);
        let text = take_text(&buf);
        assert!(text.ends_with("... (output truncated)"));
        assert!(text.len() < MAX_OUTPUT_SIZE + 64);
    }
}
