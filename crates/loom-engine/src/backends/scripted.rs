use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;

use loom_core::backend::{AgentBackend, BackendChunk, BackendError, ChunkStream, TurnRequest};
use loom_core::PromptId;

/// Released by a test to let a gated turn finish.
#[derive(Clone, Default)]
pub struct Gate(Arc<Notify>);

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let the waiting turn complete. A call made before the turn reaches the
    /// gate is remembered.
    pub fn open(&self) {
        self.0.notify_one();
    }

    async fn wait(&self) {
        self.0.notified().await;
    }
}

/// Pre-programmed behaviour for one turn.
pub enum ScriptedTurn {
    /// Yield the chunks, then complete.
    Reply(Vec<String>),
    /// Yield the chunks, then wait for the gate before completing.
    Gated { chunks: Vec<String>, gate: Gate },
    /// Yield the chunks, then stall until cancelled.
    Hang(Vec<String>),
    /// Fail before producing anything.
    FailToStart(BackendError),
    /// Yield the chunks, then fail.
    FailMidway(Vec<String>, BackendError),
    /// Wait, then behave like the inner turn.
    Delay(Duration, Box<ScriptedTurn>),
}

impl ScriptedTurn {
    pub fn reply(chunks: &[&str]) -> Self {
        Self::Reply(chunks.iter().map(|c| c.to_string()).collect())
    }

    pub fn gated(chunks: &[&str], gate: &Gate) -> Self {
        Self::Gated {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            gate: gate.clone(),
        }
    }

    pub fn hang(chunks: &[&str]) -> Self {
        Self::Hang(chunks.iter().map(|c| c.to_string()).collect())
    }

    pub fn delayed(delay: Duration, inner: ScriptedTurn) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

enum Ending {
    Done,
    Gate(Gate),
    Hang,
    Fail(BackendError),
}

/// Backend that plays back scripted turns in order. Once the script is
/// exhausted every prompt is answered with `echo: <prompt>`.
#[derive(Default)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<ScriptedTurn>>,
    prompts: Mutex<Vec<(PromptId, String)>>,
    cancelled: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            script: Mutex::new(turns.into()),
            ..Self::default()
        }
    }

    pub fn echo() -> Self {
        Self::default()
    }

    pub fn push(&self, turn: ScriptedTurn) {
        self.script.lock().push_back(turn);
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<(PromptId, String)> {
        self.prompts.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().len()
    }

    /// Turns that observed their cancellation token.
    pub fn cancelled_count(&self) -> usize {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn start(&self, request: TurnRequest) -> Result<ChunkStream, BackendError> {
        self.prompts
            .lock()
            .push((request.prompt_id.clone(), request.text.clone()));

        let mut turn = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| ScriptedTurn::Reply(vec![format!("echo: {}", request.text)]));

        let (chunks, ending) = loop {
            match turn {
                ScriptedTurn::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    turn = *inner;
                }
                ScriptedTurn::FailToStart(e) => return Err(e),
                ScriptedTurn::Reply(chunks) => break (chunks, Ending::Done),
                ScriptedTurn::Gated { chunks, gate } => break (chunks, Ending::Gate(gate)),
                ScriptedTurn::Hang(chunks) => break (chunks, Ending::Hang),
                ScriptedTurn::FailMidway(chunks, e) => break (chunks, Ending::Fail(e)),
            }
        };

        let (tx, rx) = mpsc::channel(16);
        let cancel = request.cancel.clone();
        let cancelled = self.cancelled.clone();
        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(Ok(BackendChunk::Text(chunk))).await.is_err() {
                    return;
                }
            }
            match ending {
                Ending::Done => {
                    let _ = tx.send(Ok(BackendChunk::Done)).await;
                }
                Ending::Gate(gate) => {
                    tokio::select! {
                        _ = gate.wait() => {
                            let _ = tx.send(Ok(BackendChunk::Done)).await;
                        }
                        _ = cancel.cancelled() => {
                            cancelled.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                Ending::Hang => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            cancelled.fetch_add(1, Ordering::Relaxed);
                        }
                        _ = tx.closed() => {}
                    }
                }
                Ending::Fail(e) => {
                    let _ = tx.send(Err(e)).await;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
