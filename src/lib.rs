#![forbid(unsafe_code)]

//! # judgment-engine
//!
//! A panel of evaluator agents votes on an item; votes are aggregated with
//! calibrated weights into a verdict whose confidence never exceeds φ⁻¹.
//!
//! Disagreement is treated as information: splits, deadlocks and vetoes
//! escalate instead of averaging away, and the engine fails closed when the
//! escalation budget runs out. Observed outcomes flow back to recalibrate
//! agents, and persistent unexplained residuals propose new evaluation
//! dimensions for the panel to vote into the registry.

pub mod agent;
pub mod breaker;
pub mod calibration;
pub mod config;
pub mod consensus;
pub mod dimensions;
pub mod dissensus;
pub mod engine;
pub mod error;
pub mod evaluation;
pub mod events;
pub mod governance;
pub mod judgment;
pub mod outcome;
pub mod phi;
pub mod residual;
pub mod scoring;
pub mod selection;
pub mod store;

pub use agent::{EvaluatorAgent, Position, ScoringAgent, Verdict, Vote};
pub use breaker::CircuitState;
pub use calibration::{AgentProfile, CalibrationTracker};
pub use config::{ConfigError, EngineConfig};
pub use consensus::{aggregate, Aggregation, AggregationError};
pub use dimensions::{Axiom, Dimension, DimensionDef, DimensionRegistry, DimensionSnapshot, RegistryError};
pub use dissensus::{DissensusTrigger, EscalationRequest, VetoMode};
pub use engine::{
    Clock, EngineBuilder, EscalationDecision, FixedClock, JudgmentEngine, Submission, SystemClock,
};
pub use error::EngineError;
pub use events::{
    EngineEvent, EventLogSummary, EventRecord, EventSink, JsonlEventSink, MemoryEventSink,
};
pub use governance::{DimensionProposal, ProposalStatus};
pub use judgment::{Judgment, Resolution};
pub use outcome::{ObservedOutcome, Outcome};
pub use scoring::{Context, Item, Scorer};
pub use residual::ResidualPoint;
pub use store::{EngineStore, SqliteEngineStore, StoredEscalation};
