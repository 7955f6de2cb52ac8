//! SQLite persistence for engine state.
//!
//! Judgments, outcomes and residual history are append-only. Profiles,
//! dimensions and proposals are upserted as they change; deferred
//! escalations live here until they are resolved. Everything read back is
//! range checked; a row that fails is a [`StoreError::Invalid`], not a
//! silent clamp.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fs2::FileExt;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::agent::vote::Vote;
use crate::calibration::AgentProfile;
use crate::consensus::Aggregation;
use crate::dimensions::{Axiom, Dimension};
use crate::dissensus::EscalationRequest;
use crate::governance::{DimensionProposal, ProposalStatus};
use crate::judgment::Judgment;
use crate::outcome::{ObservedOutcome, Outcome};
use crate::phi::{is_unit_interval, MAX_CONFIDENCE};
use crate::residual::ResidualPoint;
use crate::scoring::Item;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("invalid stored {table} row {key}: {reason}")]
    Invalid {
        table: &'static str,
        key: String,
        reason: String,
    },
}

fn invalid(table: &'static str, key: impl Into<String>, reason: impl Into<String>) -> StoreError {
    StoreError::Invalid {
        table,
        key: key.into(),
        reason: reason.into(),
    }
}

/// A judgment plus the inputs outcome processing needs later.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredJudgment {
    pub judgment: Judgment,
    pub features: BTreeMap<String, f64>,
    pub contested_axiom: Option<Axiom>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredOutcome {
    pub outcome: Outcome,
    /// Calibration has absorbed this outcome.
    pub applied: bool,
    /// Every processing step finished.
    pub archived: bool,
}

/// A judgment waiting on an external decision, with everything needed to
/// finalize it later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEscalation {
    pub request: EscalationRequest,
    pub item: Item,
    pub votes: Vec<Vote>,
    pub abstentions: Vec<String>,
    pub aggregation: Option<Aggregation>,
    pub registry_version: u64,
    pub contested_axiom: Option<Axiom>,
}

#[async_trait]
pub trait EngineStore: Send + Sync {
    /// Append a judgment. Returns `false` if the id was already stored.
    async fn put_judgment(&self, entry: &StoredJudgment) -> Result<bool, StoreError>;
    async fn judgments(&self) -> Result<Vec<StoredJudgment>, StoreError>;
    async fn judgment(&self, id: &str) -> Result<Option<StoredJudgment>, StoreError>;

    async fn put_profiles(&self, profiles: &[AgentProfile]) -> Result<(), StoreError>;
    async fn profiles(&self) -> Result<Vec<AgentProfile>, StoreError>;

    async fn put_dimensions(&self, version: u64, dimensions: &[Dimension]) -> Result<(), StoreError>;
    /// Registry version and dimensions in ordinal order; `None` if never saved.
    async fn dimensions(&self) -> Result<Option<(u64, Vec<Dimension>)>, StoreError>;

    /// Record an outcome as applied together with the profiles it updated,
    /// in one transaction. Returns `false`, writing nothing, if the outcome
    /// was already applied.
    async fn apply_outcome(&self, outcome: &Outcome, profiles: &[AgentProfile]) -> Result<bool, StoreError>;
    async fn archive_outcome(&self, judgment_id: &str) -> Result<(), StoreError>;
    async fn outcomes(&self) -> Result<Vec<StoredOutcome>, StoreError>;

    async fn put_proposal(&self, proposal: &DimensionProposal) -> Result<(), StoreError>;
    async fn proposals(&self) -> Result<Vec<DimensionProposal>, StoreError>;

    async fn put_escalation(&self, escalation: &StoredEscalation) -> Result<(), StoreError>;
    /// Returns `false` if no such escalation was stored.
    async fn remove_escalation(&self, escalation_id: &str) -> Result<bool, StoreError>;
    async fn escalations(&self) -> Result<Vec<StoredEscalation>, StoreError>;

    async fn put_residual(&self, point: &ResidualPoint) -> Result<(), StoreError>;
    /// The most recent `limit` points, oldest first.
    async fn residual_history(&self, limit: usize) -> Result<Vec<ResidualPoint>, StoreError>;
}

#[derive(Clone)]
pub struct SqliteEngineStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEngineStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; \
             PRAGMA synchronous=NORMAL; \
             CREATE TABLE IF NOT EXISTS judgments ( \
               id TEXT PRIMARY KEY, \
               item_ref TEXT NOT NULL, \
               verdict TEXT NOT NULL, \
               confidence REAL NOT NULL, \
               activation REAL NOT NULL, \
               registry_version INTEGER NOT NULL, \
               body TEXT NOT NULL, \
               created_at INTEGER NOT NULL \
             ); \
             CREATE TABLE IF NOT EXISTS agent_profiles ( \
               agent_id TEXT PRIMARY KEY, \
               rolling_accuracy REAL NOT NULL, \
               voting_weight REAL NOT NULL, \
               vote_count INTEGER NOT NULL, \
               updated_at INTEGER NOT NULL \
             ); \
             CREATE TABLE IF NOT EXISTS dimensions ( \
               id TEXT PRIMARY KEY, \
               ordinal INTEGER NOT NULL, \
               axiom TEXT NOT NULL, \
               weight REAL NOT NULL, \
               scoring_fn_ref TEXT NOT NULL, \
               description TEXT NOT NULL, \
               discovered_at INTEGER, \
               locked INTEGER NOT NULL, \
               confirmations INTEGER NOT NULL, \
               informed_at INTEGER \
             ); \
             CREATE TABLE IF NOT EXISTS registry_meta ( \
               key TEXT PRIMARY KEY, \
               value INTEGER NOT NULL \
             ); \
             CREATE TABLE IF NOT EXISTS outcomes ( \
               judgment_id TEXT PRIMARY KEY, \
               observed TEXT NOT NULL, \
               observed_at INTEGER NOT NULL, \
               archived INTEGER NOT NULL DEFAULT 0 \
             ); \
             CREATE TABLE IF NOT EXISTS proposals ( \
               id TEXT PRIMARY KEY, \
               status TEXT NOT NULL, \
               body TEXT NOT NULL, \
               created_at INTEGER NOT NULL \
             ); \
             CREATE TABLE IF NOT EXISTS pending_escalations ( \
               id TEXT PRIMARY KEY, \
               judgment_id TEXT NOT NULL, \
               body TEXT NOT NULL, \
               created_at INTEGER NOT NULL \
             ); \
             CREATE TABLE IF NOT EXISTS residual_history ( \
               seq INTEGER PRIMARY KEY AUTOINCREMENT, \
               judgment_id TEXT NOT NULL, \
               residual REAL NOT NULL, \
               features TEXT NOT NULL, \
               observed_at INTEGER NOT NULL \
             );",
        )?;
        ensure_column(&conn, "judgments", "features", "TEXT NOT NULL DEFAULT '{}'")?;
        ensure_column(&conn, "judgments", "contested_axiom", "TEXT")?;
        ensure_column(&conn, "outcomes", "applied", "INTEGER NOT NULL DEFAULT 0")?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Exclusive advisory lock for multi-process CLI use.
    pub fn lock_exclusive(&self) -> Result<StoreLock, StoreError> {
        StoreLock::new(&self.path)
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError>,
    {
        let mut guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&mut *guard)
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn ensure_column(conn: &Connection, table: &str, name: &str, decl: &str) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let col_name: String = row.get(1)?;
        if col_name == name {
            return Ok(());
        }
    }
    let sql = format!("ALTER TABLE {table} ADD COLUMN {name} {decl}");
    conn.execute(&sql, [])?;
    Ok(())
}

fn upsert_profile(conn: &Connection, p: &AgentProfile, now: i64) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO agent_profiles (agent_id, rolling_accuracy, voting_weight, vote_count, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(agent_id) DO UPDATE SET \
            rolling_accuracy = excluded.rolling_accuracy, \
            voting_weight = excluded.voting_weight, \
            vote_count = excluded.vote_count, \
            updated_at = excluded.updated_at",
        params![p.agent_id, p.rolling_accuracy, p.voting_weight, p.vote_count as i64, now],
    )?;
    Ok(())
}

fn to_json<T: Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serde(e.to_string()))
}

fn stored_judgment(row: &rusqlite::Row<'_>) -> Result<StoredJudgment, StoreError> {
    let id: String = row.get(0)?;
    let body: String = row.get(1)?;
    let features: String = row.get(2)?;
    let axiom: Option<String> = row.get(3)?;
    let judgment: Judgment = serde_json::from_str(&body)
        .map_err(|e| invalid("judgments", id.as_str(), e.to_string()))?;
    let features: BTreeMap<String, f64> = serde_json::from_str(&features)
        .map_err(|e| invalid("judgments", id.as_str(), e.to_string()))?;
    if let Some((name, value)) = features.iter().find(|(_, v)| !is_unit_interval(**v)) {
        return Err(invalid("judgments", id, format!("feature {name} = {value}")));
    }
    let contested_axiom = match axiom {
        Some(raw) => Some(
            Axiom::parse(&raw).ok_or_else(|| invalid("judgments", id.as_str(), format!("axiom {raw:?}")))?,
        ),
        None => None,
    };
    Ok(StoredJudgment {
        judgment,
        features,
        contested_axiom,
    })
}

#[async_trait]
impl EngineStore for SqliteEngineStore {
    async fn put_judgment(&self, entry: &StoredJudgment) -> Result<bool, StoreError> {
        let body = to_json(&entry.judgment)?;
        let features = to_json(&entry.features)?;
        let entry = entry.clone();
        self.blocking(move |conn| {
            let judgment = &entry.judgment;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO judgments ( \
                    id, item_ref, verdict, confidence, activation, registry_version, body, \
                    features, contested_axiom, created_at \
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    judgment.id(),
                    judgment.item_ref(),
                    judgment.verdict().as_str(),
                    judgment.confidence(),
                    judgment.activation(),
                    judgment.registry_version() as i64,
                    body,
                    features,
                    entry.contested_axiom.map(Axiom::as_str),
                    judgment.created_at(),
                ],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn judgments(&self) -> Result<Vec<StoredJudgment>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, body, features, contested_axiom FROM judgments ORDER BY created_at, rowid",
            )?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(stored_judgment(row)?);
            }
            Ok(out)
        })
        .await
    }

    async fn judgment(&self, id: &str) -> Result<Option<StoredJudgment>, StoreError> {
        let id = id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, body, features, contested_axiom FROM judgments WHERE id = ?1",
            )?;
            let mut rows = stmt.query(params![id])?;
            let entry = match rows.next()? {
                Some(row) => Some(stored_judgment(row)?),
                None => None,
            };
            Ok(entry)
        })
        .await
    }

    async fn put_profiles(&self, profiles: &[AgentProfile]) -> Result<(), StoreError> {
        let profiles = profiles.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let now = now_epoch_ms();
            for p in &profiles {
                upsert_profile(&tx, p, now)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn profiles(&self) -> Result<Vec<AgentProfile>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT agent_id, rolling_accuracy, voting_weight, vote_count \
                 FROM agent_profiles ORDER BY agent_id",
            )?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let profile = AgentProfile {
                    agent_id: row.get(0)?,
                    rolling_accuracy: row.get(1)?,
                    voting_weight: row.get(2)?,
                    vote_count: row.get::<_, i64>(3)?.max(0) as u64,
                };
                if !profile.is_valid() {
                    return Err(invalid(
                        "agent_profiles",
                        profile.agent_id,
                        "accuracy or weight outside [0, 1]",
                    ));
                }
                out.push(profile);
            }
            Ok(out)
        })
        .await
    }

    async fn put_dimensions(&self, version: u64, dimensions: &[Dimension]) -> Result<(), StoreError> {
        let dimensions = dimensions.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            for d in &dimensions {
                tx.execute(
                    "INSERT INTO dimensions ( \
                        id, ordinal, axiom, weight, scoring_fn_ref, description, \
                        discovered_at, locked, confirmations, informed_at \
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                     ON CONFLICT(id) DO UPDATE SET \
                        weight = excluded.weight, \
                        locked = excluded.locked, \
                        confirmations = excluded.confirmations, \
                        informed_at = excluded.informed_at",
                    params![
                        d.id,
                        d.ordinal as i64,
                        d.axiom.as_str(),
                        d.weight,
                        d.scoring_fn_ref,
                        d.description,
                        d.discovered_at,
                        if d.locked { 1 } else { 0 },
                        d.confirmations as i64,
                        d.informed_at,
                    ],
                )?;
            }
            tx.execute(
                "INSERT INTO registry_meta (key, value) VALUES ('registry_version', ?1) \
                 ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)",
                params![version as i64],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn dimensions(&self) -> Result<Option<(u64, Vec<Dimension>)>, StoreError> {
        self.blocking(|conn| {
            let version: Option<i64> = conn
                .query_row(
                    "SELECT value FROM registry_meta WHERE key = 'registry_version'",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(version) = version else {
                return Ok(None);
            };
            let mut stmt = conn.prepare(
                "SELECT id, ordinal, axiom, weight, scoring_fn_ref, description, \
                        discovered_at, locked, confirmations, informed_at \
                 FROM dimensions ORDER BY ordinal",
            )?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let id: String = row.get(0)?;
                let axiom_raw: String = row.get(2)?;
                let axiom = Axiom::parse(&axiom_raw)
                    .ok_or_else(|| invalid("dimensions", id.clone(), format!("axiom {axiom_raw:?}")))?;
                let weight: f64 = row.get(3)?;
                if !is_unit_interval(weight) {
                    return Err(invalid("dimensions", id, format!("weight {weight}")));
                }
                out.push(Dimension {
                    id,
                    axiom,
                    weight,
                    ordinal: row.get::<_, i64>(1)?.max(0) as usize,
                    scoring_fn_ref: row.get(4)?,
                    description: row.get(5)?,
                    discovered_at: row.get(6)?,
                    locked: row.get::<_, i64>(7)? != 0,
                    confirmations: row.get::<_, i64>(8)?.clamp(0, u32::MAX as i64) as u32,
                    informed_at: row.get(9)?,
                });
            }
            Ok(Some((version.max(1) as u64, out)))
        })
        .await
    }

    async fn apply_outcome(&self, outcome: &Outcome, profiles: &[AgentProfile]) -> Result<bool, StoreError> {
        let observed = to_json(&outcome.observed)?;
        let judgment_id = outcome.judgment_id.clone();
        let observed_at = outcome.observed_at;
        let profiles = profiles.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let marked = tx.execute(
                "INSERT INTO outcomes (judgment_id, observed, observed_at, archived, applied) \
                 VALUES (?1, ?2, ?3, 0, 1) \
                 ON CONFLICT(judgment_id) DO UPDATE SET applied = 1 \
                 WHERE outcomes.applied = 0 AND outcomes.archived = 0",
                params![judgment_id, observed, observed_at],
            )?;
            if marked == 0 {
                return Ok(false);
            }
            let now = now_epoch_ms();
            for p in &profiles {
                upsert_profile(&tx, p, now)?;
            }
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn archive_outcome(&self, judgment_id: &str) -> Result<(), StoreError> {
        let judgment_id = judgment_id.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE outcomes SET archived = 1 WHERE judgment_id = ?1",
                params![judgment_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn outcomes(&self) -> Result<Vec<StoredOutcome>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT judgment_id, observed, observed_at, archived, applied \
                 FROM outcomes ORDER BY observed_at, rowid",
            )?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let judgment_id: String = row.get(0)?;
                let raw: String = row.get(1)?;
                let observed: ObservedOutcome = serde_json::from_str(&raw)
                    .map_err(|e| invalid("outcomes", judgment_id.clone(), e.to_string()))?;
                if !observed.is_valid() {
                    return Err(invalid("outcomes", judgment_id, "observed value outside [0, 1]"));
                }
                let archived = row.get::<_, i64>(3)? != 0;
                out.push(StoredOutcome {
                    outcome: Outcome {
                        judgment_id,
                        observed,
                        observed_at: row.get(2)?,
                    },
                    // Rows archived before the applied column existed were applied.
                    applied: archived || row.get::<_, i64>(4)? != 0,
                    archived,
                });
            }
            Ok(out)
        })
        .await
    }

    async fn put_proposal(&self, proposal: &DimensionProposal) -> Result<(), StoreError> {
        let body = to_json(proposal)?;
        let id = proposal.id.clone();
        let status = proposal.status.as_str();
        let created_at = proposal.created_at;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO proposals (id, status, body, created_at) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(id) DO UPDATE SET status = excluded.status, body = excluded.body",
                params![id, status, body, created_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn proposals(&self) -> Result<Vec<DimensionProposal>, StoreError> {
        self.blocking(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, status, body FROM proposals ORDER BY created_at, rowid")?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let id: String = row.get(0)?;
                let status: String = row.get(1)?;
                let body: String = row.get(2)?;
                let proposal: DimensionProposal = serde_json::from_str(&body)
                    .map_err(|e| invalid("proposals", id.clone(), e.to_string()))?;
                if ProposalStatus::parse(&status) != Some(proposal.status) {
                    return Err(invalid("proposals", id, format!("status column {status:?} disagrees with body")));
                }
                if !is_unit_interval(proposal.statistical_significance) {
                    return Err(invalid("proposals", id, "p-value outside [0, 1]"));
                }
                out.push(proposal);
            }
            Ok(out)
        })
        .await
    }

    async fn put_escalation(&self, escalation: &StoredEscalation) -> Result<(), StoreError> {
        let body = to_json(escalation)?;
        let id = escalation.request.id.clone();
        let judgment_id = escalation.request.judgment_id.clone();
        let created_at = escalation.request.created_at;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO pending_escalations (id, judgment_id, body, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, judgment_id, body, created_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove_escalation(&self, escalation_id: &str) -> Result<bool, StoreError> {
        let id = escalation_id.to_string();
        self.blocking(move |conn| {
            let removed = conn.execute("DELETE FROM pending_escalations WHERE id = ?1", params![id])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn escalations(&self) -> Result<Vec<StoredEscalation>, StoreError> {
        self.blocking(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, body FROM pending_escalations ORDER BY created_at, rowid")?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let id: String = row.get(0)?;
                let body: String = row.get(1)?;
                let escalation: StoredEscalation = serde_json::from_str(&body)
                    .map_err(|e| invalid("pending_escalations", id.clone(), e.to_string()))?;
                if escalation.request.id != id {
                    return Err(invalid("pending_escalations", id, "id column disagrees with body"));
                }
                if let Some(agg) = &escalation.aggregation {
                    if !(0.0..=MAX_CONFIDENCE).contains(&agg.collective_confidence) {
                        return Err(invalid(
                            "pending_escalations",
                            id,
                            format!("collective confidence {}", agg.collective_confidence),
                        ));
                    }
                }
                out.push(escalation);
            }
            Ok(out)
        })
        .await
    }

    async fn put_residual(&self, point: &ResidualPoint) -> Result<(), StoreError> {
        let features = to_json(&point.features)?;
        let point = point.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO residual_history (judgment_id, residual, features, observed_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![point.judgment_id, point.residual, features, point.observed_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn residual_history(&self, limit: usize) -> Result<Vec<ResidualPoint>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT judgment_id, residual, features, observed_at FROM residual_history \
                 ORDER BY seq DESC LIMIT ?1",
            )?;
            let mut rows = stmt.query(params![limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let judgment_id: String = row.get(0)?;
                let residual: f64 = row.get(1)?;
                if !(-1.0..=1.0).contains(&residual) {
                    return Err(invalid("residual_history", judgment_id, format!("residual {residual}")));
                }
                let raw: String = row.get(2)?;
                let features: BTreeMap<String, f64> = serde_json::from_str(&raw)
                    .map_err(|e| invalid("residual_history", judgment_id.clone(), e.to_string()))?;
                out.push(ResidualPoint {
                    judgment_id,
                    residual,
                    features,
                    observed_at: row.get(3)?,
                });
            }
            out.reverse();
            Ok(out)
        })
        .await
    }
}

#[derive(Debug)]
pub struct StoreLock {
    _file: std::fs::File,
}

impl StoreLock {
    fn new(db_path: &Path) -> Result<Self, StoreError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

impl SqliteEngineStore {
    /// Write every judgment as one JSON line, oldest first. Returns the count.
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, StoreError> {
        let path = path.as_ref().to_path_buf();
        self.blocking(move |conn| {
            use std::io::Write;
            let mut stmt = conn.prepare("SELECT body FROM judgments ORDER BY created_at, rowid")?;
            let mut rows = stmt.query([])?;
            let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
            let mut count = 0;
            while let Some(row) = rows.next()? {
                let body: String = row.get(0)?;
                writeln!(file, "{body}")?;
                count += 1;
            }
            file.flush()?;
            Ok(count)
        })
        .await
    }
}

pub fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
