use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use loom_core::backend::{AgentBackend, BackendChunk, BackendError, ChunkStream, TurnRequest};

const READ_BUF: usize = 4096;
const STDERR_TAIL: usize = 2048;

/// Runs an external agent program once per turn.
///
/// The prompt is written to stdin, which is then closed. Every read from
/// stdout becomes one chunk. A zero exit status completes the turn; anything
/// else fails it with the tail of stderr. Cancelling kills the process.
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
}

impl CommandBackend {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl AgentBackend for CommandBackend {
    fn name(&self) -> &str {
        &self.program
    }

    async fn start(&self, request: TurnRequest) -> Result<ChunkStream, BackendError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("LOOM_SESSION_ID", request.session_id.as_str())
            .env("LOOM_PROMPT_ID", request.prompt_id.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if Path::new(&request.workspace_ref).is_dir() {
            cmd.current_dir(&request.workspace_ref);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| BackendError::Spawn(format!("{}: {e}", self.program)))?;
        debug!(program = %self.program, pid = ?child.id(), prompt_id = %request.prompt_id, "agent spawned");

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Io("stdin unavailable".into()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Io("stdout unavailable".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackendError::Io("stderr unavailable".into()))?;

        let text = request.text.clone();
        tokio::spawn(async move {
            // A program that never reads stdin closes the pipe; not an error.
            let _ = stdin.write_all(text.as_bytes()).await;
            let _ = stdin.shutdown().await;
        });

        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            let start = buf.len().saturating_sub(STDERR_TAIL);
            String::from_utf8_lossy(&buf[start..]).trim().to_string()
        });

        let (tx, rx) = mpsc::channel(32);
        let cancel = request.cancel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUF];
            loop {
                let read = tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Err(e) = child.kill().await {
                            warn!(error = %e, "failed to kill cancelled agent");
                        }
                        return;
                    }
                    read = stdout.read(&mut buf) => read,
                };
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                        if tx.send(Ok(BackendChunk::Text(chunk))).await.is_err() {
                            let _ = child.kill().await;
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(BackendError::Io(e.to_string()))).await;
                        let _ = child.kill().await;
                        return;
                    }
                }
            }

            let status = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return;
                }
                status = child.wait() => status,
            };
            let item = match status {
                Ok(s) if s.success() => Ok(BackendChunk::Done),
                Ok(s) => Err(BackendError::Exited {
                    code: s.code(),
                    stderr: stderr_task.await.unwrap_or_default(),
                }),
                Err(e) => Err(BackendError::Io(e.to_string())),
            };
            let _ = tx.send(item).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use futures::StreamExt;
    use loom_core::{PromptId, SessionId};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn request(text: &str) -> TurnRequest {
        TurnRequest {
            session_id: SessionId::new(),
            prompt_id: PromptId::new(),
            text: text.into(),
            workspace_ref: "/nonexistent/workspace".into(),
            cancel: CancellationToken::new(),
        }
    }

    fn sh(script: &str) -> CommandBackend {
        CommandBackend::new("sh", vec!["-c".into(), script.into()])
    }

    #[tokio::test]
    async fn streams_stdout_and_completes() {
        let backend = CommandBackend::new("cat", vec![]);
        let items: Vec<_> = backend.start(request("hello agent")).await.unwrap().collect().await;

        let text: String = items
            .iter()
            .filter_map(|i| match i {
                Ok(BackendChunk::Text(t)) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "hello agent");
        assert!(matches!(items.last(), Some(Ok(BackendChunk::Done))));
    }

    #[tokio::test]
    async fn nonzero_exit_fails_with_stderr() {
        let items: Vec<_> = sh("echo broken >&2; exit 3")
            .start(request("x"))
            .await
            .unwrap()
            .collect()
            .await;
        match items.last() {
            Some(Err(BackendError::Exited { code, stderr })) => {
                assert_eq!(*code, Some(3));
                assert_eq!(stderr, "broken");
            }
            other => panic!("expected exit failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let backend = CommandBackend::new("loom-definitely-not-a-program", vec![]);
        assert!(matches!(backend.start(request("x")).await, Err(BackendError::Spawn(_))));
    }

    #[tokio::test]
    async fn cancel_kills_process() {
        let req = request("x");
        let cancel = req.cancel.clone();
        let mut stream = sh("echo started; sleep 30").start(req).await.unwrap();
        assert!(matches!(stream.next().await, Some(Ok(BackendChunk::Text(_)))));

        cancel.cancel();
        let end = tokio::time::timeout(Duration::from_secs(5), stream.next()).await.unwrap();
        assert!(end.is_none());
    }
}
