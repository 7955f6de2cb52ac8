//! Outbound engine events and their sinks.

use std::collections::BTreeMap;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{mpsc, Mutex};

use serde::{Deserialize, Serialize};

use crate::agent::Verdict;
use crate::dimensions::Dimension;
use crate::dissensus::EscalationRequest;
use crate::governance::DimensionProposal;
use crate::judgment::Resolution;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    JudgmentCreated {
        judgment_id: String,
        item_ref: String,
        verdict: Verdict,
        confidence: f64,
        resolution: Resolution,
        registry_version: u64,
    },
    EscalationRequested {
        request: EscalationRequest,
    },
    DimensionProposed {
        proposal: DimensionProposal,
    },
    DimensionApproved {
        proposal_id: String,
        dimension: Dimension,
    },
    DimensionRejected {
        proposal_id: String,
        proposed_formula: String,
    },
    RecalibrationNeeded {
        ece: f64,
        samples: usize,
    },
    /// An agent kept failing and is skipped until its cooldown ends.
    AgentCircuitOpened {
        agent_id: String,
        consecutive_failures: u32,
        retry_at_ms: i64,
    },
    AgentCircuitClosed {
        agent_id: String,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JudgmentCreated { .. } => "judgment_created",
            Self::EscalationRequested { .. } => "escalation_requested",
            Self::DimensionProposed { .. } => "dimension_proposed",
            Self::DimensionApproved { .. } => "dimension_approved",
            Self::DimensionRejected { .. } => "dimension_rejected",
            Self::RecalibrationNeeded { .. } => "recalibration_needed",
            Self::AgentCircuitOpened { .. } => "agent_circuit_opened",
            Self::AgentCircuitClosed { .. } => "agent_circuit_closed",
        }
    }

    /// Events an operator has to act on.
    pub fn needs_attention(&self) -> bool {
        matches!(
            self,
            Self::EscalationRequested { .. }
                | Self::RecalibrationNeeded { .. }
                | Self::DimensionProposed { .. }
                | Self::AgentCircuitOpened { .. }
        )
    }
}

/// One delivered event with its engine timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub at_ms: i64,
    #[serde(flatten)]
    pub event: EngineEvent,
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("event channel closed")]
    Closed,
    #[error("event worker failed: {0}")]
    Join(String),
}

pub trait EventSink: Send + Sync {
    fn record(&self, record: EventRecord) -> Result<(), EventError>;
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn record(&self, _record: EventRecord) -> Result<(), EventError> {
        Ok(())
    }
}

/// Keeps events in memory, in delivery order.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    records: Mutex<Vec<EventRecord>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.records
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.records().into_iter().map(|r| r.event).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.records().iter().filter(|r| r.event.kind() == kind).count()
    }
}

impl EventSink for MemoryEventSink {
    fn record(&self, record: EventRecord) -> Result<(), EventError> {
        self.records
            .lock()
            .map_err(|_| EventError::Closed)?
            .push(record);
        Ok(())
    }
}

/// Per-kind tally reported when the JSONL worker stops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventLogSummary {
    pub written: u64,
    /// Events that asked for operator attention.
    pub attention: u64,
    pub by_kind: BTreeMap<&'static str, u64>,
}

/// Appends events to a JSONL file from a background thread.
///
/// Lines are buffered while events keep arriving. The buffer is flushed as
/// soon as the queue goes idle, and immediately after any event for which
/// [`EngineEvent::needs_attention`] holds.
#[derive(Clone)]
pub struct JsonlEventSink {
    sender: mpsc::Sender<EventRecord>,
}

pub struct EventWorker {
    handle: std::thread::JoinHandle<Result<EventLogSummary, EventError>>,
}

impl EventWorker {
    /// Wait for the log to drain. Every sink clone must be dropped first.
    pub fn join(self) -> Result<EventLogSummary, EventError> {
        self.handle
            .join()
            .map_err(|_| EventError::Join("event worker panicked".to_string()))?
    }
}

impl JsonlEventSink {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, EventWorker), EventError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let (sender, receiver) = mpsc::channel::<EventRecord>();
        let handle = std::thread::spawn(move || EventLog::new(file).run(receiver));
        Ok((Self { sender }, EventWorker { handle }))
    }
}

impl EventSink for JsonlEventSink {
    fn record(&self, record: EventRecord) -> Result<(), EventError> {
        self.sender.send(record).map_err(|_| EventError::Closed)
    }
}

struct EventLog {
    writer: BufWriter<std::fs::File>,
    summary: EventLogSummary,
}

impl EventLog {
    fn new(file: std::fs::File) -> Self {
        Self {
            writer: BufWriter::new(file),
            summary: EventLogSummary::default(),
        }
    }

    fn run(mut self, receiver: mpsc::Receiver<EventRecord>) -> Result<EventLogSummary, EventError> {
        loop {
            let record = match receiver.try_recv() {
                Ok(record) => record,
                Err(mpsc::TryRecvError::Empty) => {
                    self.writer.flush()?;
                    match receiver.recv() {
                        Ok(record) => record,
                        Err(_) => break,
                    }
                }
                Err(mpsc::TryRecvError::Disconnected) => break,
            };
            self.append(&record)?;
        }
        self.writer.flush()?;
        Ok(self.summary)
    }

    fn append(&mut self, record: &EventRecord) -> Result<(), EventError> {
        let line = serde_json::to_string(record).map_err(|e| EventError::Serde(e.to_string()))?;
        writeln!(self.writer, "{line}")?;
        let kind = record.event.kind();
        self.summary.written += 1;
        *self.summary.by_kind.entry(kind).or_default() += 1;
        if record.event.needs_attention() {
            self.summary.attention += 1;
            self.writer.flush()?;
        }
        Ok(())
    }
}
