//! Command-backed tool handlers.
//!
//! The configured program receives the arguments object as JSON on stdin
//! and must print a JSON object on stdout. Translation and transcription
//! back-ends stay outside this process this way.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use crate::handler::{Arguments, HandlerError, Payload, ToolHandler};

/// Default per-call bound for external commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum output size (1MB).
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Runs an external program per call.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    timeout: Duration,
    reentrant: bool,
}

impl CommandHandler {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            reentrant: true,
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn reentrant(mut self, reentrant: bool) -> Self {
        self.reentrant = reentrant;
        self
    }

    async fn run(&self, input: Vec<u8>) -> Result<Finished, HandlerError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HandlerError::new(format!("failed to start `{}`: {e}", self.program)))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&input).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let collect = async {
            let out = read_capped(stdout).await;
            if matches!(&out, Ok(bytes) if bytes.len() > MAX_OUTPUT_SIZE) {
                // Unblocks the stderr reader and a writer stuck on a full pipe.
                let _ = child.start_kill();
            }
            out
        };

        let (fed, stdout, stderr) = tokio::join!(feed, collect, read_capped(stderr));
        if let Err(e) = fed {
            debug!(program = %self.program, error = %e, "command did not read all input");
        }

        let failed = |e: std::io::Error| HandlerError::new(format!("`{}` failed: {e}", self.program));
        let stdout = stdout.map_err(failed)?;
        if stdout.len() > MAX_OUTPUT_SIZE {
            return Err(HandlerError::new(format!(
                "`{}` printed more than {MAX_OUTPUT_SIZE} bytes",
                self.program
            )));
        }
        let stderr = stderr.map_err(failed)?;
        let status = child.wait().await.map_err(failed)?;

        Ok(Finished {
            status,
            stdout,
            stderr,
        })
    }
}

struct Finished {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// Read at most one byte past [`MAX_OUTPUT_SIZE`].
async fn read_capped<R>(stream: Option<R>) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    if let Some(stream) = stream {
        stream
            .take(MAX_OUTPUT_SIZE as u64 + 1)
            .read_to_end(&mut bytes)
            .await?;
    }
    Ok(bytes)
}

#[async_trait]
impl ToolHandler for CommandHandler {
    async fn call(&self, arguments: Arguments) -> Result<Payload, HandlerError> {
        let input = serde_json::to_vec(&arguments)
            .map_err(|e| HandlerError::new(format!("failed to encode arguments: {e}")))?;

        let output = tokio::time::timeout(self.timeout, self.run(input))
            .await
            .map_err(|_| {
                HandlerError::new(format!(
                    "`{}` timed out after {}s",
                    self.program,
                    self.timeout.as_secs_f32()
                ))
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HandlerError::new(format!(
                "`{}` exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        match serde_json::from_slice::<Value>(&output.stdout) {
            Ok(Value::Object(payload)) => Ok(payload),
            Ok(_) => Err(HandlerError::new(format!(
                "`{}` did not print a JSON object",
                self.program
            ))),
            Err(e) => Err(HandlerError::new(format!(
                "`{}` printed invalid JSON: {e}",
                self.program
            ))),
        }
    }

    fn reentrant(&self) -> bool {
        self.reentrant
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    fn sh(script: &str) -> CommandHandler {
        CommandHandler::new("sh").args(["-c", script])
    }

    fn args(value: Value) -> Arguments {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn passes_arguments_on_stdin() {
        let payload = sh("cat").call(args(json!({"text": "hello"}))).await.unwrap();
        assert_eq!(payload["text"], "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_reports_stderr() {
        let err = sh("echo 'model missing' >&2; exit 3")
            .call(Arguments::new())
            .await
            .unwrap_err();
        assert!(err.0.contains("model missing"), "{err}");
    }

    #[tokio::test]
    async fn non_object_output_is_a_fault() {
        let err = sh("echo 42").call(Arguments::new()).await.unwrap_err();
        assert!(err.0.contains("JSON object"), "{err}");

        let err = sh("echo nope").call(Arguments::new()).await.unwrap_err();
        assert!(err.0.contains("invalid JSON"), "{err}");
    }

    #[tokio::test]
    async fn endless_output_is_cut_off_at_the_cap() {
        let err = sh("yes")
            .timeout(Duration::from_secs(10))
            .call(Arguments::new())
            .await
            .unwrap_err();
        assert!(err.0.contains("more than"), "{err}");
    }

    #[tokio::test]
    async fn slow_commands_time_out() {
        let err = sh("sleep 5")
            .timeout(Duration::from_millis(100))
            .call(Arguments::new())
            .await
            .unwrap_err();
        assert!(err.0.contains("timed out"), "{err}");
    }

    #[tokio::test]
    async fn missing_program_is_a_fault() {
        let err = CommandHandler::new("definitely-not-a-real-program-xyz")
            .call(Arguments::new())
            .await
            .unwrap_err();
        assert!(err.0.contains("failed to start"), "{err}");
    }
}
