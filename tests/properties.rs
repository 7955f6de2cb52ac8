mod common;

use std::sync::Arc;

use judgment_engine::calibration::CalibrationTracker;
use judgment_engine::config::CalibrationConfig;
use judgment_engine::consensus::aggregate;
use judgment_engine::dimensions::DimensionRegistry;
use judgment_engine::judgment::{Judgment, JudgmentParts};
use judgment_engine::phi::{PHI_INV, PHI_INV_2};
use judgment_engine::{Context, Position, Resolution, Scorer, ScoringAgent};
use proptest::prelude::*;

fn position() -> impl Strategy<Value = Position> {
    prop_oneof![
        Just(Position::StrongYes),
        Just(Position::Yes),
        Just(Position::No),
        Just(Position::StrongNo),
    ]
}

fn parts(verdict: Position, confidence: f64, resolution: Resolution) -> JudgmentParts {
    JudgmentParts {
        id: "j".into(),
        item_ref: "item".into(),
        verdict,
        confidence,
        activation: 0.0,
        votes: Vec::new(),
        abstentions: Vec::new(),
        registry_version: 1,
        resolution,
        created_at: 0,
    }
}

proptest! {
    #[test]
    fn aggregated_confidence_never_exceeds_phi_inverse(
        ballots in prop::collection::vec((position(), 0.0..=PHI_INV, 0.0..=1.0f64), 1..40)
    ) {
        let votes: Vec<_> = ballots
            .iter()
            .enumerate()
            .map(|(i, (p, c, _))| common::vote(&format!("a{i}"), *p, *c))
            .collect();
        let weights: Vec<f64> = ballots.iter().map(|(_, _, w)| *w).collect();
        if let Ok(agg) = aggregate(&votes, &weights) {
            prop_assert!(agg.collective_confidence <= PHI_INV);
            prop_assert!((-1.0..=1.0).contains(&agg.activation));
            prop_assert!((agg.approving_share + agg.rejecting_share - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn agent_votes_stay_within_bounds(values in prop::collection::vec(0.0..=1.0f64, 15)) {
        let registry = DimensionRegistry::bootstrap();
        let snapshot = registry.snapshot().unwrap();
        let names: Vec<String> = snapshot.iter().map(|d| d.id.clone()).collect();
        let item = names
            .iter()
            .zip(&values)
            .fold(judgment_engine::Item::new("x", ""), |item, (n, v)| item.with_feature(n.clone(), *v));
        let agent = ScoringAgent::new("auditor", Arc::new(Scorer::new()));
        let eval = agent.evaluate(&item, &Context::default(), &snapshot);
        prop_assert!((0.0..=1.0).contains(&eval.raw_score));
        prop_assert!(eval.faults.is_empty());
        prop_assert_eq!(eval.dimension_scores.len(), 15);
    }

    #[test]
    fn judgments_refuse_confidence_above_the_ceiling(confidence in 0.0..=1.0f64, verdict in position()) {
        let result = Judgment::new(parts(verdict, confidence, Resolution::Consensus));
        if confidence > PHI_INV {
            prop_assert!(result.is_err());
        } else {
            let judgment = result.unwrap();
            prop_assert!(judgment.confidence() <= PHI_INV);
        }
    }

    #[test]
    fn forced_rejections_are_capped(confidence in 0.0..=PHI_INV) {
        let judgment = Judgment::new(parts(
            Position::StrongNo,
            confidence,
            Resolution::FailClosed { reason: "test".into() },
        ))
        .unwrap();
        prop_assert!(judgment.confidence() <= PHI_INV_2);
    }

    #[test]
    fn calibration_profiles_stay_valid(
        history in prop::collection::vec((position(), 0.0..=1.0f64), 1..60)
    ) {
        let mut tracker = CalibrationTracker::new(CalibrationConfig::default());
        for (p, observed) in history {
            let votes = vec![common::vote("a", p, 0.5)];
            let updated = tracker.record_votes(&votes, observed);
            let profile = &updated[0];
            prop_assert!(profile.is_valid());
            prop_assert!((profile.voting_weight - profile.rolling_accuracy.powi(2)).abs() < 1e-12);
            tracker.record_prediction(0.5, observed);
        }
        if let Some(ece) = tracker.ece() {
            prop_assert!((0.0..=1.0).contains(&ece));
        }
    }
}
