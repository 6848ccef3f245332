use crate::command::BuiltCommand;
use crate::output::LineKind;
use crate::{DeckError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a cancelled run waits for its output readers. A grandchild that
/// inherited the pipes can keep them open after the child is killed.
const CANCEL_DRAIN: Duration = Duration::from_millis(500);

/// Receives output lines as the child produces them.
pub trait OutputListener: Send + Sync {
    fn on_line(&self, line: &str, kind: LineKind);
}

/// Everything a successful run printed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `command` to completion or until `cancel` fires. Errors are
    /// returned as they happened; nothing is retried.
    async fn execute(
        &self,
        command: &BuiltCommand,
        listener: Arc<dyn OutputListener>,
        cancel: CancellationToken,
    ) -> Result<RunOutput>;
}

/// Runs commands as child processes.
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for ProcessRunner {
    async fn execute(
        &self,
        command: &BuiltCommand,
        listener: Arc<dyn OutputListener>,
        cancel: CancellationToken,
    ) -> Result<RunOutput> {
        info!("Running: {}", command.display);

        let mut process = Command::new(&command.program);
        process
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // the password only ever travels through the environment
        if let Some((key, value)) = command.credential() {
            process.env(key, value);
        }

        let mut child = process.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DeckError::ToolNotInstalled,
            _ => DeckError::SpawnFailure(format!("{}: {}", command.program.display(), e)),
        })?;
        debug!("Spawned pid {:?}", child.id());

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeckError::SpawnFailure("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DeckError::SpawnFailure("stderr was not captured".to_string()))?;

        let mut stdout_task = tokio::spawn(pump(stdout, LineKind::Normal, listener.clone()));
        let mut stderr_task = tokio::spawn(pump(stderr, LineKind::Error, listener));

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let status = match waited {
            Some(status) => status.map_err(|e| DeckError::SpawnFailure(e.to_string()))?,
            None => {
                info!("Cancelling: {}", command.display);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill cancelled process: {}", e);
                }
                // let the readers flush what the child already wrote
                let drain = async {
                    let _ = (&mut stdout_task).await;
                    let _ = (&mut stderr_task).await;
                };
                if tokio::time::timeout(CANCEL_DRAIN, drain).await.is_err() {
                    debug!("Output still open after cancel, dropping readers");
                    stdout_task.abort();
                    stderr_task.abort();
                }
                return Err(DeckError::Cancelled);
            }
        };

        let stdout = stdout_task
            .await
            .map_err(|e| DeckError::SpawnFailure(format!("stdout reader failed: {}", e)))?;
        let stderr = stderr_task
            .await
            .map_err(|e| DeckError::SpawnFailure(format!("stderr reader failed: {}", e)))?;

        if status.success() {
            debug!("Command finished: {}", command.display);
            Ok(RunOutput { stdout, stderr })
        } else {
            // killed by a signal has no code
            let code = status.code().unwrap_or(-1);
            warn!("Command exited with status {}: {}", code, command.display);
            Err(DeckError::NonZeroExit {
                code,
                output: format!("{}{}", stdout, stderr),
            })
        }
    }
}

async fn pump<R>(reader: R, kind: LineKind, listener: Arc<dyn OutputListener>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut captured = String::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\n', '\r']);
                listener.on_line(line, kind);
                captured.push_str(line);
                captured.push('\n');
            }
            Err(e) => {
                warn!("Stopped reading process output: {}", e);
                break;
            }
        }
    }

    captured
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::secret::Secret;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect {
        lines: Mutex<Vec<(String, LineKind)>>,
    }

    impl OutputListener for Collect {
        fn on_line(&self, line: &str, kind: LineKind) {
            self.lines.lock().unwrap().push((line.to_string(), kind));
        }
    }

    fn script(body: &str) -> BuiltCommand {
        BuiltCommand::plain("sh", vec!["-c".to_string(), body.to_string()])
    }

    #[tokio::test]
    async fn test_success_captures_both_streams() {
        let listener = Arc::new(Collect::default());
        let output = ProcessRunner::new()
            .execute(
                &script("echo one; echo two >&2; echo three"),
                listener.clone(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(output.stdout, "one\nthree\n");
        assert_eq!(output.stderr, "two\n");

        let lines = listener.lines.lock().unwrap();
        assert_eq!(lines.len(), 3);
        assert!(lines.contains(&("two".to_string(), LineKind::Error)));
        assert!(lines.contains(&("one".to_string(), LineKind::Normal)));
    }

    #[tokio::test]
    async fn test_non_zero_exit_carries_output() {
        let listener = Arc::new(Collect::default());
        let err = ProcessRunner::new()
            .execute(
                &script("echo working; echo 'Fatal: boom' >&2; exit 3"),
                listener,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            DeckError::NonZeroExit { code, output } => {
                assert_eq!(code, 3);
                assert!(output.contains("working"));
                assert!(output.contains("Fatal: boom"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_secret_is_passed_through_environment() {
        let mut command = script("printf '%s\\n' \"$RESTIC_PASSWORD\"; echo \"$EXTRA\"");
        command.secret = Some(Secret::new("secret1"));
        command.env.push(("EXTRA".to_string(), "value".to_string()));

        let output = ProcessRunner::new()
            .execute(&command, Arc::new(Collect::default()), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.stdout, "secret1\nvalue\n");
        assert!(!command.args.iter().any(|a| a.contains("secret1")));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let command = BuiltCommand::plain("/nonexistent/restic", Vec::new());
        let err = ProcessRunner::new()
            .execute(&command, Arc::new(Collect::default()), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeckError::ToolNotInstalled));
    }

    #[tokio::test]
    async fn test_cancel_kills_child_and_keeps_output() {
        let listener = Arc::new(Collect::default());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let err = ProcessRunner::new()
            .execute(&script("echo started; exec sleep 30"), listener.clone(), cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, DeckError::Cancelled));
        let lines = listener.lines.lock().unwrap();
        assert_eq!(lines.first().map(|(l, _)| l.as_str()), Some("started"));
    }

    #[tokio::test]
    async fn test_cancel_does_not_wait_for_inherited_pipes() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        // the background sleep keeps stdout open after its parent is killed
        let runner = ProcessRunner::new();
        let cmd = script("sleep 20 & echo started; exec sleep 30");
        let run = runner.execute(
            &cmd,
            Arc::new(Collect::default()),
            cancel,
        );
        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("cancel should not hang on open pipes");
        assert!(matches!(result, Err(DeckError::Cancelled)));
    }
}
