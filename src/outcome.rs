//! Observed outcomes and the queue that feeds them back into the engine.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::phi::is_unit_interval;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ObservedOutcome {
    Binary(bool),
    /// Degree of success in `[0, 1]`.
    Graded(f64),
}

impl ObservedOutcome {
    pub fn value(self) -> f64 {
        match self {
            Self::Binary(true) => 1.0,
            Self::Binary(false) => 0.0,
            Self::Graded(v) => v,
        }
    }

    pub fn is_valid(self) -> bool {
        match self {
            Self::Binary(_) => true,
            Self::Graded(v) => is_unit_interval(v),
        }
    }

    /// Parse `true`/`false`/`yes`/`no` or a number in `[0, 1]`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "success" => Some(Self::Binary(true)),
            "false" | "no" | "failure" => Some(Self::Binary(false)),
            other => other
                .parse::<f64>()
                .ok()
                .map(Self::Graded)
                .filter(|o| o.is_valid()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub judgment_id: String,
    pub observed: ObservedOutcome,
    pub observed_at: i64,
}

/// Processes queued outcomes one at a time.
#[async_trait::async_trait]
pub trait OutcomeHandler: Send + Sync {
    async fn handle(&self, outcome: Outcome);
}

enum OutcomeMessage {
    Report(Outcome),
    Flush(oneshot::Sender<()>),
}

/// Sending half of the outcome queue.
#[derive(Clone)]
pub struct OutcomeQueue {
    sender: mpsc::UnboundedSender<OutcomeMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("outcome queue closed")]
pub struct QueueClosed;

impl OutcomeQueue {
    pub fn report(&self, outcome: Outcome) -> Result<(), QueueClosed> {
        self.sender
            .send(OutcomeMessage::Report(outcome))
            .map_err(|_| QueueClosed)
    }

    /// Resolves once every outcome reported before this call is processed.
    pub async fn flush(&self) -> Result<(), QueueClosed> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(OutcomeMessage::Flush(tx))
            .map_err(|_| QueueClosed)?;
        rx.await.map_err(|_| QueueClosed)
    }
}

pub struct OutcomeWorker {
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl OutcomeWorker {
    /// Wait for the worker to drain; it stops once every queue handle is dropped.
    pub async fn join(mut self) -> Result<(), String> {
        match self.handle.take() {
            Some(handle) => handle.await.map_err(|e| e.to_string()),
            None => Ok(()),
        }
    }

    pub fn abort(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

/// Spawn the single consumer. Must be called inside a tokio runtime.
pub fn spawn_outcome_worker(handler: Arc<dyn OutcomeHandler>) -> (OutcomeQueue, OutcomeWorker) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let handle = tokio::spawn(outcome_loop(handler, receiver));
    (
        OutcomeQueue { sender },
        OutcomeWorker {
            handle: Some(handle),
        },
    )
}

async fn outcome_loop(
    handler: Arc<dyn OutcomeHandler>,
    mut receiver: mpsc::UnboundedReceiver<OutcomeMessage>,
) {
    while let Some(message) = receiver.recv().await {
        match message {
            OutcomeMessage::Report(outcome) => handler.handle(outcome).await,
            OutcomeMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
