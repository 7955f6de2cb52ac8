mod common;

use judgment_engine::consensus::{aggregate, AggregationError};
use judgment_engine::dissensus::{aggregate_triggers, assess, find_veto, Assessment};
use judgment_engine::config::DissensusConfig;
use judgment_engine::phi::PHI_INV;
use judgment_engine::Position::{self, No, StrongNo, StrongYes, Yes};

use common::vote;

fn eleven_votes() -> Vec<judgment_engine::Vote> {
    let positions = [Yes, Yes, Yes, StrongYes, Yes, StrongYes, Yes, Yes, No, Yes, Yes];
    let confidences = [0.58, 0.52, 0.61, 0.48, 0.59, 0.61, 0.54, 0.56, 0.42, 0.57, 0.55];
    positions
        .iter()
        .zip(confidences)
        .enumerate()
        .map(|(i, (&p, c))| vote(&format!("agent-{i}"), p, c))
        .collect()
}

#[test]
fn eleven_vote_example_is_strong_yes_at_the_ceiling() {
    let votes = eleven_votes();
    let agg = aggregate(&votes, &[1.0; 11]).unwrap();

    assert!((agg.total_weight - 6.03).abs() < 1e-9);
    assert!((agg.activation - 3.14 / 6.03).abs() < 1e-9);
    assert!((agg.activation - 0.521).abs() < 1e-3);
    assert_eq!(agg.collective_confidence, PHI_INV);
    assert_eq!(agg.verdict, StrongYes);
    assert!(aggregate_triggers(&DissensusConfig::default(), &agg).is_empty());
}

#[test]
fn aggregation_is_order_stable() {
    let votes = eleven_votes();
    let a = aggregate(&votes, &[1.0; 11]).unwrap();
    let b = aggregate(&votes, &[1.0; 11]).unwrap();
    assert_eq!(a.activation.to_bits(), b.activation.to_bits());
}

#[test]
fn zero_total_weight_is_no_quorum() {
    let votes = vec![vote("a", Yes, 0.0), vote("b", StrongNo, 0.0)];
    assert_eq!(aggregate(&votes, &[1.0, 1.0]), Err(AggregationError::NoQuorum));

    let votes = vec![vote("a", Yes, 0.5)];
    assert_eq!(aggregate(&votes, &[0.0]), Err(AggregationError::NoQuorum));
}

#[test]
fn verdict_thresholds() {
    let cases = [
        (vec![vote("a", Yes, 0.5), vote("b", No, 0.3)], Position::Yes),
        (vec![vote("a", No, 0.5)], Position::StrongNo),
        (vec![vote("a", Yes, 0.5), vote("b", No, 0.6)], Position::No),
    ];
    for (votes, expected) in cases {
        let weights = vec![1.0; votes.len()];
        assert_eq!(aggregate(&votes, &weights).unwrap().verdict, expected);
    }
}

#[test]
fn veto_overrides_ten_strong_yes_votes() {
    let mut votes: Vec<_> = (0..10)
        .map(|i| vote(&format!("agent-{i}"), StrongYes, 0.6))
        .collect();
    votes.push(vote("sentinel", StrongNo, 0.6));
    let agg = aggregate(&votes, &[1.0; 11]).unwrap();
    // The weighted average alone would approve.
    assert!(agg.verdict.is_approving());

    let veto = find_veto(&votes, |id| id == "sentinel").unwrap();
    assert_eq!(veto.agent_id(), "sentinel");
    assert_eq!(
        assess(&DissensusConfig::default(), &votes, &agg, |id| id == "sentinel"),
        Assessment::Veto {
            agent_id: "sentinel".into()
        }
    );
    // Without veto capability the same vote is just one voice.
    assert_eq!(
        assess(&DissensusConfig::default(), &votes, &agg, |_| false),
        Assessment::Consensus
    );
}

#[test]
fn even_split_is_dissensus() {
    let votes = vec![vote("a", Yes, 0.5), vote("b", No, 0.5)];
    let agg = aggregate(&votes, &[1.0, 1.0]).unwrap();
    match assess(&DissensusConfig::default(), &votes, &agg, |_| false) {
        Assessment::Dissensus(triggers) => assert_eq!(triggers.len(), 2),
        other => panic!("expected dissensus, got {other:?}"),
    }
}
