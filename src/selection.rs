//! Sparse dimension navigation.
//!
//! Agents need not score every registered dimension on every vote. A selector
//! picks a bounded subset per context; the agent falls back to the full active
//! set when the subset leaves its axiom scores too far apart.

use std::cmp::Ordering;
use std::fmt;

use crate::dimensions::{Dimension, DimensionSet};
use crate::scoring::Context;

pub trait DimensionSelector: Send + Sync + fmt::Debug {
    /// Dimensions to score, returned in insertion order.
    fn select<'a>(&self, snapshot: &'a DimensionSet, context: &Context) -> Vec<&'a Dimension>;

    /// True when the selector may omit active dimensions.
    fn is_sparse(&self) -> bool {
        false
    }
}

/// Every active dimension.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllDimensions;

impl DimensionSelector for AllDimensions {
    fn select<'a>(&self, snapshot: &'a DimensionSet, _context: &Context) -> Vec<&'a Dimension> {
        snapshot.active().collect()
    }
}

/// The `k` most recently informative active dimensions.
///
/// Ranking: context focus axioms first, then most recent `informed_at`
/// (never-informed last), then higher weight, then insertion order.
#[derive(Debug, Clone, Copy)]
pub struct TopKSelector {
    pub k: usize,
}

impl TopKSelector {
    pub fn new(k: usize) -> Self {
        Self { k: k.max(1) }
    }
}

impl DimensionSelector for TopKSelector {
    fn select<'a>(&self, snapshot: &'a DimensionSet, context: &Context) -> Vec<&'a Dimension> {
        let mut ranked: Vec<&Dimension> = snapshot.active().collect();
        ranked.sort_by(|a, b| {
            let fa = context.focus.contains(&a.axiom);
            let fb = context.focus.contains(&b.axiom);
            fb.cmp(&fa)
                .then_with(|| b.informed_at.cmp(&a.informed_at))
                .then_with(|| b.weight.partial_cmp(&a.weight).unwrap_or(Ordering::Equal))
                .then_with(|| a.ordinal.cmp(&b.ordinal))
        });
        ranked.truncate(self.k);
        ranked.sort_by_key(|d| d.ordinal);
        ranked
    }

    fn is_sparse(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimensions::{Axiom, DimensionRegistry};

    #[test]
    fn top_k_prefers_focus_then_weight_and_keeps_insertion_order() {
        let registry = DimensionRegistry::bootstrap();
        let snap = registry.snapshot().unwrap();
        let mut ctx = Context::new("code");
        ctx.focus = vec![Axiom::Economy];

        let picked = TopKSelector::new(4).select(&snap, &ctx);
        let ids: Vec<&str> = picked.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids.len(), 4);
        // All three economy dimensions plus the earliest weight-1.0 dimension.
        assert_eq!(ids, vec!["accuracy", "utility", "efficiency", "sustainability"]);
    }

    #[test]
    fn recently_informed_dimension_outranks_weight() {
        let registry = DimensionRegistry::bootstrap();
        registry.record_confirmation("novelty", 1_000).unwrap();
        let snap = registry.snapshot().unwrap();
        let picked = TopKSelector::new(1).select(&snap, &Context::default());
        assert_eq!(picked[0].id, "novelty");
    }
}
