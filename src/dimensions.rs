//! Dimension registry: the five axioms, their scoring dimensions, and the
//! versioned snapshots judgments are evaluated against.
//!
//! ## Axiom structure
//!
//! - **Fidelity** (truthfulness of the item): accuracy, candor, congruence
//! - **Proportion** (shape and balance): coherence, simplicity, completeness
//! - **Verification** (checkability): provenance, reproducibility, transparency
//! - **Culture** (fit with its surroundings): relevance, novelty, alignment
//! - **Economy** (cost versus value): utility, efficiency, sustainability
//!
//! The set is append-only. New dimensions arrive at runtime through residual
//! discovery and governance approval; a dimension is disabled by setting its
//! weight to zero, never by removal. Readers take a cheap `Arc` snapshot, and a
//! single writer builds the next version inside a [`DimensionTransaction`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockWriteGuard, TryLockError};

use serde::{Deserialize, Serialize};

use crate::phi::{is_unit_interval, PHI_INV, PHI_INV_2};
use crate::scoring::ScoringFormula;

/// Confirmations after which a discovered dimension locks.
pub const LOCK_CONFIRMATIONS: u32 = 5;

// =============================================================================
// Axioms
// =============================================================================

/// Top-level evaluation category. Declaration order is the canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axiom {
    Fidelity,
    Proportion,
    Verification,
    Culture,
    Economy,
}

impl Axiom {
    pub const ALL: [Axiom; 5] = [
        Axiom::Fidelity,
        Axiom::Proportion,
        Axiom::Verification,
        Axiom::Culture,
        Axiom::Economy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fidelity => "fidelity",
            Self::Proportion => "proportion",
            Self::Verification => "verification",
            Self::Culture => "culture",
            Self::Economy => "economy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fidelity" => Some(Self::Fidelity),
            "proportion" => Some(Self::Proportion),
            "verification" => Some(Self::Verification),
            "culture" => Some(Self::Culture),
            "economy" => Some(Self::Economy),
            _ => None,
        }
    }
}

impl fmt::Display for Axiom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Dimensions
// =============================================================================

/// A registered scoring criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub id: String,
    pub axiom: Axiom,
    /// Relative weight within its axiom, normalized at evaluation time.
    pub weight: f64,
    /// Custom scorer name or formula (see [`ScoringFormula`]).
    pub scoring_fn_ref: String,
    pub description: String,
    /// Epoch ms at which residual discovery introduced this dimension.
    pub discovered_at: Option<i64>,
    pub locked: bool,
    pub confirmations: u32,
    /// Epoch ms of the last outcome this dimension correctly anticipated.
    pub informed_at: Option<i64>,
    /// Insertion position; ties in every ordering break on this.
    pub ordinal: usize,
}

impl Dimension {
    pub fn is_active(&self) -> bool {
        self.weight > 0.0
    }

    pub fn is_discovered(&self) -> bool {
        self.discovered_at.is_some()
    }
}

/// Input to [`DimensionRegistry::register_dimension`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionDef {
    pub id: String,
    pub axiom: Axiom,
    pub weight: f64,
    pub scoring_fn_ref: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub discovered_at: Option<i64>,
}

impl DimensionDef {
    pub fn new(
        id: impl Into<String>,
        axiom: Axiom,
        weight: f64,
        scoring_fn_ref: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            axiom,
            weight,
            scoring_fn_ref: scoring_fn_ref.into(),
            description: String::new(),
            discovered_at: None,
        }
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("dimension already registered: {0}")]
    Duplicate(String),
    #[error("unknown dimension: {0}")]
    Unknown(String),
    #[error("dimension registry is locked by a write transaction")]
    Locked,
    #[error("dimension {id} has invalid weight {weight}")]
    InvalidWeight { id: String, weight: f64 },
    #[error("dimension {0} is locked and cannot be disabled")]
    DimensionLocked(String),
    #[error("invalid dimension definition: {0}")]
    InvalidDefinition(String),
    #[error("dimension registry lock poisoned")]
    Poisoned,
}

// =============================================================================
// Snapshot
// =============================================================================

/// Immutable, versioned view of the registry.
#[derive(Debug, Clone, Default)]
pub struct DimensionSet {
    version: u64,
    dimensions: Vec<Dimension>,
    index: HashMap<String, usize>,
}

/// Shared handle to one registry version.
pub type DimensionSnapshot = Arc<DimensionSet>;

impl DimensionSet {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.dimensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Dimension> {
        self.index.get(id).map(|&i| &self.dimensions[i])
    }

    /// All dimensions in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Dimension> {
        self.dimensions.iter()
    }

    /// Dimensions of one axiom in insertion order.
    pub fn by_axiom(&self, axiom: Axiom) -> impl Iterator<Item = &Dimension> {
        self.dimensions.iter().filter(move |d| d.axiom == axiom)
    }

    /// Dimensions with non-zero weight, insertion order.
    pub fn active(&self) -> impl Iterator<Item = &Dimension> {
        self.dimensions.iter().filter(|d| d.is_active())
    }

    /// True when some dimension's formula already reads `feature`.
    pub fn covers_feature(&self, feature: &str) -> bool {
        self.dimensions.iter().any(|d| {
            ScoringFormula::parse(&d.scoring_fn_ref)
                .map(|f| f.feature() == Some(feature))
                .unwrap_or(false)
        })
    }

    /// True when an identical scoring reference is already registered.
    pub fn has_scoring_ref(&self, scoring_fn_ref: &str) -> bool {
        self.dimensions
            .iter()
            .any(|d| d.scoring_fn_ref == scoring_fn_ref)
    }

    fn insert(&mut self, def: DimensionDef) -> Result<Dimension, RegistryError> {
        validate_def(&def)?;
        if self.index.contains_key(&def.id) {
            return Err(RegistryError::Duplicate(def.id));
        }
        let ordinal = self.dimensions.len();
        let dimension = Dimension {
            id: def.id,
            axiom: def.axiom,
            weight: def.weight,
            scoring_fn_ref: def.scoring_fn_ref,
            description: def.description,
            discovered_at: def.discovered_at,
            locked: false,
            confirmations: 0,
            informed_at: None,
            ordinal,
        };
        self.index.insert(dimension.id.clone(), ordinal);
        self.dimensions.push(dimension.clone());
        Ok(dimension)
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Dimension, RegistryError> {
        match self.index.get(id) {
            Some(&i) => Ok(&mut self.dimensions[i]),
            None => Err(RegistryError::Unknown(id.to_string())),
        }
    }
}

fn validate_def(def: &DimensionDef) -> Result<(), RegistryError> {
    if def.id.trim().is_empty() {
        return Err(RegistryError::InvalidDefinition(
            "dimension id must not be empty".into(),
        ));
    }
    if def.scoring_fn_ref.trim().is_empty() {
        return Err(RegistryError::InvalidDefinition(format!(
            "dimension {} has an empty scoring_fn_ref",
            def.id
        )));
    }
    if !is_unit_interval(def.weight) {
        return Err(RegistryError::InvalidWeight {
            id: def.id.clone(),
            weight: def.weight,
        });
    }
    Ok(())
}

// =============================================================================
// Registry
// =============================================================================

/// Read-mostly registry: many concurrent snapshot readers, one writer.
#[derive(Debug)]
pub struct DimensionRegistry {
    current: RwLock<DimensionSnapshot>,
}

impl DimensionRegistry {
    pub fn new(defs: Vec<DimensionDef>) -> Result<Self, RegistryError> {
        let mut set = DimensionSet::default();
        for def in defs {
            set.insert(def)?;
        }
        set.version = 1;
        Ok(Self {
            current: RwLock::new(Arc::new(set)),
        })
    }

    /// Registry holding the bootstrap set.
    pub fn bootstrap() -> Self {
        let mut set = DimensionSet::default();
        for def in bootstrap_dimensions() {
            let inserted = set.insert(def);
            debug_assert!(inserted.is_ok(), "bootstrap dimension rejected: {inserted:?}");
        }
        set.version = 1;
        Self {
            current: RwLock::new(Arc::new(set)),
        }
    }

    /// Rebuild from persisted dimensions (ordered by ordinal).
    pub fn restore(mut dimensions: Vec<Dimension>, version: u64) -> Result<Self, RegistryError> {
        dimensions.sort_by_key(|d| d.ordinal);
        let mut set = DimensionSet::default();
        for (ordinal, mut dim) in dimensions.into_iter().enumerate() {
            if !is_unit_interval(dim.weight) {
                return Err(RegistryError::InvalidWeight {
                    id: dim.id,
                    weight: dim.weight,
                });
            }
            if set.index.contains_key(&dim.id) {
                return Err(RegistryError::Duplicate(dim.id));
            }
            dim.ordinal = ordinal;
            set.index.insert(dim.id.clone(), ordinal);
            set.dimensions.push(dim);
        }
        set.version = version.max(1);
        Ok(Self {
            current: RwLock::new(Arc::new(set)),
        })
    }

    /// Capture the current version.
    ///
    /// Fails with [`RegistryError::Locked`] while a write transaction is open;
    /// callers retry with backoff rather than reuse an older snapshot.
    pub fn snapshot(&self) -> Result<DimensionSnapshot, RegistryError> {
        match self.current.try_read() {
            Ok(guard) => Ok(Arc::clone(&guard)),
            Err(TryLockError::WouldBlock) => Err(RegistryError::Locked),
            Err(TryLockError::Poisoned(_)) => Err(RegistryError::Poisoned),
        }
    }

    /// Open the single write transaction.
    pub fn transaction(&self) -> Result<DimensionTransaction<'_>, RegistryError> {
        let guard = match self.current.try_write() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(RegistryError::Locked),
            Err(TryLockError::Poisoned(_)) => return Err(RegistryError::Poisoned),
        };
        let working = (**guard).clone();
        Ok(DimensionTransaction {
            guard,
            working,
            dirty: false,
        })
    }

    pub fn register_dimension(&self, def: DimensionDef) -> Result<Dimension, RegistryError> {
        let mut tx = self.transaction()?;
        let dimension = tx.register(def)?;
        tx.commit();
        Ok(dimension)
    }

    pub fn set_weight(&self, id: &str, weight: f64) -> Result<Dimension, RegistryError> {
        let mut tx = self.transaction()?;
        let dimension = tx.set_weight(id, weight)?;
        tx.commit();
        Ok(dimension)
    }

    /// Count one statistical confirmation; returns the updated dimension.
    pub fn record_confirmation(&self, id: &str, at_ms: i64) -> Result<Dimension, RegistryError> {
        let mut tx = self.transaction()?;
        let dimension = tx.record_confirmation(id, at_ms)?;
        tx.commit();
        Ok(dimension)
    }
}

/// Exclusive edit of the registry. Dropping without [`commit`](Self::commit)
/// discards every change.
pub struct DimensionTransaction<'a> {
    guard: RwLockWriteGuard<'a, DimensionSnapshot>,
    working: DimensionSet,
    dirty: bool,
}

impl DimensionTransaction<'_> {
    pub fn register(&mut self, def: DimensionDef) -> Result<Dimension, RegistryError> {
        let dimension = self.working.insert(def)?;
        self.dirty = true;
        Ok(dimension)
    }

    pub fn set_weight(&mut self, id: &str, weight: f64) -> Result<Dimension, RegistryError> {
        if !is_unit_interval(weight) {
            return Err(RegistryError::InvalidWeight {
                id: id.to_string(),
                weight,
            });
        }
        let dim = self.working.get_mut(id)?;
        if dim.locked && weight == 0.0 {
            return Err(RegistryError::DimensionLocked(id.to_string()));
        }
        dim.weight = weight;
        self.dirty = true;
        Ok(dim.clone())
    }

    pub fn record_confirmation(&mut self, id: &str, at_ms: i64) -> Result<Dimension, RegistryError> {
        let dim = self.working.get_mut(id)?;
        dim.confirmations = dim.confirmations.saturating_add(1);
        dim.informed_at = Some(at_ms);
        if dim.confirmations >= LOCK_CONFIRMATIONS {
            dim.locked = true;
        }
        self.dirty = true;
        Ok(dim.clone())
    }

    /// Working view including uncommitted changes.
    pub fn view(&self) -> &DimensionSet {
        &self.working
    }

    /// Publish the working set as the next version.
    pub fn commit(mut self) -> u64 {
        if !self.dirty {
            return self.working.version;
        }
        self.working.version = self.working.version.saturating_add(1);
        let version = self.working.version;
        let next = std::mem::take(&mut self.working);
        *self.guard = Arc::new(next);
        version
    }
}

// =============================================================================
// Bootstrap set
// =============================================================================

/// The fixed initial dimension set: three per axiom, fifteen in total.
///
/// Every bootstrap dimension reads an item feature of the same name, so a
/// caller supplies `features: {"accuracy": 0.8, ...}` on the item. Missing
/// features score zero (distrust by default).
pub fn bootstrap_dimensions() -> Vec<DimensionDef> {
    let mut defs = Vec::with_capacity(15);
    defs.extend(fidelity_dimensions());
    defs.extend(proportion_dimensions());
    defs.extend(verification_dimensions());
    defs.extend(culture_dimensions());
    defs.extend(economy_dimensions());
    defs
}

fn feature_dim(id: &str, axiom: Axiom, weight: f64, description: &str) -> DimensionDef {
    DimensionDef::new(id, axiom, weight, format!("feature({id})")).described(description)
}

fn fidelity_dimensions() -> Vec<DimensionDef> {
    vec![
        feature_dim(
            "accuracy",
            Axiom::Fidelity,
            1.0,
            "Claims and computations in the item are correct when checked.",
        ),
        feature_dim(
            "candor",
            Axiom::Fidelity,
            PHI_INV,
            "The item states its limitations instead of omitting them.",
        ),
        feature_dim(
            "congruence",
            Axiom::Fidelity,
            PHI_INV,
            "Stated intent matches what the item actually does.",
        ),
    ]
}

fn proportion_dimensions() -> Vec<DimensionDef> {
    vec![
        feature_dim(
            "coherence",
            Axiom::Proportion,
            1.0,
            "Parts are logically consistent with one another.",
        ),
        feature_dim(
            "simplicity",
            Axiom::Proportion,
            PHI_INV,
            "No more structure than the problem requires.",
        ),
        feature_dim(
            "completeness",
            Axiom::Proportion,
            PHI_INV_2,
            "Nothing essential is missing.",
        ),
    ]
}

fn verification_dimensions() -> Vec<DimensionDef> {
    vec![
        feature_dim(
            "provenance",
            Axiom::Verification,
            1.0,
            "Origin of every substantive claim is traceable.",
        ),
        feature_dim(
            "reproducibility",
            Axiom::Verification,
            PHI_INV,
            "The same inputs give the same results when re-run.",
        ),
        feature_dim(
            "transparency",
            Axiom::Verification,
            PHI_INV_2,
            "Process and reasoning are visible to a reviewer.",
        ),
    ]
}

fn culture_dimensions() -> Vec<DimensionDef> {
    vec![
        feature_dim(
            "relevance",
            Axiom::Culture,
            1.0,
            "Addresses a problem that matters in its context now.",
        ),
        feature_dim(
            "novelty",
            Axiom::Culture,
            PHI_INV_2,
            "Brings something the context did not already have.",
        ),
        feature_dim(
            "alignment",
            Axiom::Culture,
            PHI_INV,
            "Respects existing conventions and constraints.",
        ),
    ]
}

fn economy_dimensions() -> Vec<DimensionDef> {
    vec![
        feature_dim(
            "utility",
            Axiom::Economy,
            1.0,
            "Serves a clear, demonstrable purpose.",
        ),
        feature_dim(
            "efficiency",
            Axiom::Economy,
            PHI_INV,
            "Minimal waste of compute, money, or attention.",
        ),
        feature_dim(
            "sustainability",
            Axiom::Economy,
            PHI_INV_2,
            "Can be maintained without collapse.",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_has_three_dimensions_per_axiom() {
        let registry = DimensionRegistry::bootstrap();
        let snap = registry.snapshot().unwrap();
        assert_eq!(snap.len(), 15);
        for axiom in Axiom::ALL {
            assert_eq!(snap.by_axiom(axiom).count(), 3);
        }
        assert!(snap.covers_feature("accuracy"));
        assert!(!snap.covers_feature("latency"));
    }

    #[test]
    fn bootstrap_defs_pass_validation() {
        let checked = DimensionRegistry::new(bootstrap_dimensions()).unwrap();
        let bootstrap = DimensionRegistry::bootstrap();
        assert_eq!(
            checked.snapshot().unwrap().len(),
            bootstrap.snapshot().unwrap().len()
        );
    }

    #[test]
    fn transaction_blocks_snapshots_until_dropped() {
        let registry = DimensionRegistry::bootstrap();
        let tx = registry.transaction().unwrap();
        assert_eq!(registry.snapshot().unwrap_err(), RegistryError::Locked);
        assert_eq!(
            registry
                .register_dimension(DimensionDef::new("x", Axiom::Economy, 0.5, "feature(x)"))
                .unwrap_err(),
            RegistryError::Locked
        );
        drop(tx);
        assert_eq!(registry.snapshot().unwrap().len(), 15);
    }

    #[test]
    fn uncommitted_changes_are_discarded() {
        let registry = DimensionRegistry::bootstrap();
        {
            let mut tx = registry.transaction().unwrap();
            tx.register(DimensionDef::new("x", Axiom::Economy, 0.5, "feature(x)"))
                .unwrap();
            assert_eq!(tx.view().len(), 16);
        }
        let snap = registry.snapshot().unwrap();
        assert_eq!(snap.len(), 15);
        assert_eq!(snap.version(), 1);
    }
}
