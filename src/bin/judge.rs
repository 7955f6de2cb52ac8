#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use judgment_engine::evaluation::run_synthetic_suite;
use judgment_engine::{
    Context, EngineBuilder, EngineConfig, EngineError, EngineStore, EscalationDecision,
    EventSink, Item, JsonlEventSink, JudgmentEngine, ObservedOutcome, Position,
    SqliteEngineStore,
};

#[derive(Parser)]
#[command(name = "judge", version, about = "Multi-agent judgment engine CLI")]
struct Cli {
    /// Engine config (JSON). Defaults apply to anything missing.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// SQLite state file. Overrides the config and JUDGE_STORE_PATH.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Append engine events to this JSONL file
    #[arg(long, global = true)]
    events: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Judge items from a JSON or JSONL file
    Submit {
        #[arg(long)]
        items: PathBuf,
        /// Context JSON shared by every item
        #[arg(long)]
        context: Option<PathBuf>,
        /// Write submissions as JSONL here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },
    /// Report the observed outcome of a judgment
    Outcome {
        #[arg(long)]
        judgment: String,
        /// `true`, `false`, or a graded value in [0, 1]
        #[arg(long)]
        observed: String,
    },
    /// Decide a deferred escalation
    Resolve {
        #[arg(long)]
        escalation: String,
        /// Verdict: strong_yes, yes, no, strong_no. Omit to expire (fail closed).
        #[arg(long)]
        verdict: Option<String>,
        #[arg(long, default_value = "operator")]
        decided_by: String,
    },
    /// Cast a panel vote on a dimension proposal
    Vote {
        #[arg(long)]
        proposal: String,
        #[arg(long)]
        agent: String,
        #[arg(long, conflicts_with = "reject")]
        approve: bool,
        #[arg(long)]
        reject: bool,
    },
    /// List dimension proposals
    Proposals,
    /// List registered dimensions
    Dimensions,
    /// Re-weight a dimension
    SetWeight {
        #[arg(long)]
        dimension: String,
        #[arg(long)]
        weight: f64,
    },
    /// List agent calibration profiles
    Profiles,
    /// Reset one agent's calibration profile
    ResetProfile {
        #[arg(long)]
        agent: String,
    },
    /// Export stored judgments to JSONL
    Export {
        #[arg(long)]
        out: PathBuf,
    },
    /// Run synthetic evaluation suite
    Eval {
        #[arg(long)]
        case: Option<String>,
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_path(path)?,
        None => EngineConfig::default(),
    };
    let db_path = cli.db.clone().unwrap_or_else(|| config.store_path());

    match cli.command {
        Commands::Eval { case, out } => {
            let results = run_synthetic_suite(case.as_deref()).await?;
            write_jsonl(Some(&out), &results)?;
            return Ok(());
        }
        Commands::Export { out } => {
            let store = SqliteEngineStore::new(&db_path)?;
            let count = store.export_jsonl(&out).await?;
            eprintln!("exported {count} judgments to {}", out.display());
            return Ok(());
        }
        _ => {}
    }

    let store = Arc::new(SqliteEngineStore::new(&db_path)?);
    let _lock = store.lock_exclusive()?;
    let (sink, event_worker) = match &cli.events {
        Some(path) => {
            let (sink, worker) = JsonlEventSink::new(path)?;
            (Some(sink), Some(worker))
        }
        None => (None, None),
    };
    let mut builder = EngineBuilder::new().config(config);
    if let Some(sink) = &sink {
        builder = builder.events(Arc::new(sink.clone()) as Arc<dyn EventSink>);
    }
    let engine = builder.restore(store.clone() as Arc<dyn EngineStore>).await?;

    let result = run_command(&engine, cli.command).await;
    engine.shutdown().await?;
    drop(sink);
    if let Some(worker) = event_worker {
        let summary = worker.join()?;
        tracing::debug!(
            written = summary.written,
            attention = summary.attention,
            "Event log closed"
        );
    }
    result
}

async fn run_command(engine: &JudgmentEngine, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Submit {
            items,
            context,
            out,
            concurrency,
        } => {
            let items = read_items(&items)?;
            let context: Context = match context {
                Some(path) => serde_json::from_reader(BufReader::new(File::open(path)?))?,
                None => Context::default(),
            };
            let cancel = Arc::new(AtomicBool::new(false));
            let watcher = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        cancel.store(true, Ordering::Relaxed);
                    }
                })
            };

            let outcomes: Vec<Result<_, EngineError>> = stream::iter(items.iter())
                .map(|item| {
                    let context = &context;
                    let cancel = &cancel;
                    async move { engine.submit_with_cancel(item, context, cancel).await }
                })
                .buffered(concurrency.max(1))
                .collect()
                .await;
            watcher.abort();

            let mut submissions = Vec::with_capacity(outcomes.len());
            for (item, outcome) in items.iter().zip(outcomes) {
                match outcome {
                    Ok(submission) => submissions.push(submission),
                    Err(EngineError::Cancelled) => return Err(EngineError::Cancelled.into()),
                    Err(e) => {
                        tracing::warn!(item = %item.id, error = %e, "Submission failed");
                        eprintln!("{}: {e}", item.id);
                    }
                }
            }
            write_jsonl(out.as_deref(), &submissions)?;
        }
        Commands::Outcome { judgment, observed } => {
            let observed = ObservedOutcome::parse(&observed)
                .ok_or_else(|| format!("cannot parse observed outcome {observed:?}"))?;
            if engine.judgment(&judgment).is_none() {
                return Err(EngineError::UnknownJudgment(judgment).into());
            }
            engine.report_outcome(&judgment, observed)?;
            engine.flush().await?;
        }
        Commands::Resolve {
            escalation,
            verdict,
            decided_by,
        } => {
            let decision = match verdict {
                Some(raw) => EscalationDecision::Decide {
                    verdict: Position::parse(&raw).ok_or_else(|| format!("unknown verdict {raw:?}"))?,
                    decided_by,
                },
                None => EscalationDecision::Expire,
            };
            let judgment = engine.resolve_escalation(&escalation, decision).await?;
            write_jsonl(None, &[judgment])?;
        }
        Commands::Vote {
            proposal,
            agent,
            approve,
            reject,
        } => {
            if approve == reject {
                return Err("pass exactly one of --approve or --reject".into());
            }
            let proposal = engine.dimension_vote(&proposal, &agent, approve).await?;
            write_jsonl(None, &[proposal])?;
        }
        Commands::Proposals => write_jsonl(None, &engine.proposals())?,
        Commands::Dimensions => {
            let snapshot = engine.snapshot().await?;
            let dims: Vec<_> = snapshot.iter().collect();
            write_jsonl(None, &dims)?;
        }
        Commands::SetWeight { dimension, weight } => {
            let dimension = engine.set_dimension_weight(&dimension, weight).await?;
            write_jsonl(None, &[dimension])?;
        }
        Commands::Profiles => write_jsonl(None, &engine.profiles())?,
        Commands::ResetProfile { agent } => {
            let profile = engine.reset_profile(&agent).await?;
            write_jsonl(None, &[profile])?;
        }
        Commands::Export { .. } | Commands::Eval { .. } => {}
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("JUDGE_LOG")
        .unwrap_or_else(|_| EnvFilter::new("judgment_engine=info,judge=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true)
        .init();
}

/// Items from a JSON array, a single JSON object, or JSONL.
fn read_items(path: &Path) -> Result<Vec<Item>, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    let trimmed = raw.trim_start();
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }
    if let Ok(item) = serde_json::from_str::<Item>(trimmed) {
        return Ok(vec![item]);
    }
    let mut items = Vec::new();
    for line in BufReader::new(raw.as_bytes()).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        items.push(serde_json::from_str(&line)?);
    }
    Ok(items)
}

fn write_jsonl<T: Serialize>(out: Option<&Path>, rows: &[T]) -> Result<(), Box<dyn std::error::Error>> {
    let mut writer: Box<dyn Write> = match out {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(io::stdout().lock()),
    };
    for row in rows {
        writeln!(writer, "{}", serde_json::to_string(row)?)?;
    }
    writer.flush()?;
    Ok(())
}
