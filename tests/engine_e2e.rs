mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use judgment_engine::config::{EngineConfig, RetryConfig};
use judgment_engine::dissensus::{EscalationAction, VetoMode};
use judgment_engine::phi::{PHI_INV, PHI_INV_2};
use judgment_engine::residual::FixedPValue;
use judgment_engine::{
    CircuitState, Context, EngineError, EngineEvent, EscalationDecision, FixedClock, Item,
    JudgmentEngine, MemoryEventSink, ObservedOutcome, Position, ProposalStatus, Resolution,
    Submission,
};

use common::{failing, fixed, slow, uniform_item, veto};

fn fixed_clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::new(1_700_000_000_000))
}

#[tokio::test]
async fn identical_inputs_give_byte_identical_judgments() {
    let item = uniform_item("item-1", 0.8);
    let context = Context::new("code");

    let mut rendered = Vec::new();
    for _ in 0..2 {
        let engine = JudgmentEngine::builder()
            .clock(fixed_clock())
            .build()
            .unwrap();
        let submission = engine.submit_for_judgment(&item, &context).await.unwrap();
        let judgment = submission.judgment().unwrap().clone();
        assert!(judgment.confidence() <= PHI_INV);
        rendered.push(serde_json::to_string(&judgment).unwrap());

        // Resubmitting returns the recorded judgment.
        let again = engine.submit_for_judgment(&item, &context).await.unwrap();
        assert_eq!(again.judgment(), Some(&judgment));
        assert_eq!(engine.judgments().len(), 1);
        engine.shutdown().await.unwrap();
    }
    assert_eq!(rendered[0], rendered[1]);
}

#[tokio::test]
async fn slow_agent_abstains_after_timeout() {
    let mut config = EngineConfig::default();
    config.voting.vote_timeout_ms = 50;
    let engine = JudgmentEngine::builder()
        .config(config)
        .panel(vec![
            fixed("a", Position::Yes, 0.5),
            fixed("b", Position::Yes, 0.5),
            slow("c", Duration::from_secs(30)),
        ])
        .reserve(vec![])
        .build()
        .unwrap();

    let submission = engine
        .submit_for_judgment(&Item::new("x", ""), &Context::default())
        .await
        .unwrap();
    let judgment = submission.judgment().unwrap();
    assert_eq!(judgment.abstentions(), ["c".to_string()]);
    assert_eq!(judgment.votes().len(), 2);
    assert_eq!(judgment.verdict(), Position::StrongYes);
}

#[tokio::test]
async fn cancelled_judgment_discards_partial_votes() {
    let engine = JudgmentEngine::builder()
        .panel(vec![
            fixed("a", Position::Yes, 0.5),
            slow("b", Duration::from_secs(30)),
        ])
        .build()
        .unwrap();
    let cancel = AtomicBool::new(true);

    let result = engine
        .submit_with_cancel(&Item::new("x", ""), &Context::default(), &cancel)
        .await;
    assert!(matches!(result, Err(EngineError::Cancelled)));
    assert!(engine.judgments().is_empty());
}

#[tokio::test]
async fn all_zero_confidence_is_no_quorum() {
    let engine = JudgmentEngine::builder()
        .panel(vec![fixed("a", Position::Yes, 0.0), fixed("b", Position::No, 0.0)])
        .build()
        .unwrap();
    let err = engine
        .submit_for_judgment(&Item::new("x", ""), &Context::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoQuorum));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn veto_forces_rejection_over_ten_strong_yes() {
    let events = Arc::new(MemoryEventSink::new());
    let mut panel: Vec<_> = (0..10)
        .map(|i| fixed(&format!("agent-{i}"), Position::StrongYes, 0.6))
        .collect();
    panel.insert(0, veto("sentinel", Position::StrongNo, 0.6));
    let engine = JudgmentEngine::builder()
        .panel(panel)
        .events(events.clone())
        .build()
        .unwrap();

    let submission = engine
        .submit_for_judgment(&Item::new("x", ""), &Context::default())
        .await
        .unwrap();
    let judgment = submission.judgment().unwrap();
    assert_eq!(judgment.verdict(), Position::StrongNo);
    assert_eq!(
        judgment.resolution(),
        &Resolution::Veto {
            agent_id: "sentinel".into()
        }
    );
    assert!(judgment.confidence() <= PHI_INV_2);
    assert_eq!(events.count("judgment_created"), 1);
}

#[tokio::test]
async fn escalate_veto_mode_defers_to_external_decision() {
    let mut config = EngineConfig::default();
    config.dissensus.veto_mode = VetoMode::Escalate;
    let events = Arc::new(MemoryEventSink::new());
    let engine = JudgmentEngine::builder()
        .config(config)
        .panel(vec![
            veto("sentinel", Position::StrongNo, 0.6),
            fixed("a", Position::StrongYes, 0.6),
        ])
        .events(events.clone())
        .build()
        .unwrap();

    let submission = engine
        .submit_for_judgment(&Item::new("x", ""), &Context::default())
        .await
        .unwrap();
    let request = submission.escalation().unwrap().clone();
    assert_eq!(request.action, EscalationAction::DeferExternal);
    assert_eq!(engine.pending_escalations().len(), 1);

    let judgment = engine
        .resolve_escalation(
            &request.id,
            EscalationDecision::Decide {
                verdict: Position::Yes,
                decided_by: "reviewer".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(judgment.verdict(), Position::Yes);
    assert!(judgment.confidence() <= PHI_INV);
    assert!(engine.pending_escalations().is_empty());
    assert!(matches!(
        engine
            .resolve_escalation(&request.id, EscalationDecision::Expire)
            .await,
        Err(EngineError::UnknownEscalation(_))
    ));
    assert_eq!(events.count("escalation_requested"), 1);
    assert_eq!(events.count("judgment_created"), 1);
}

#[tokio::test]
async fn exhausted_escalation_fails_closed() {
    let events = Arc::new(MemoryEventSink::new());
    let engine = JudgmentEngine::builder()
        .panel(vec![fixed("a", Position::Yes, 0.5), fixed("b", Position::No, 0.5)])
        .reserve(vec![fixed("r1", Position::No, 0.5), fixed("r2", Position::Yes, 0.5)])
        .events(events.clone())
        .build()
        .unwrap();

    let submission = engine
        .submit_for_judgment(&Item::new("x", ""), &Context::default())
        .await
        .unwrap();
    let judgment = submission.judgment().unwrap();
    assert_eq!(judgment.verdict(), Position::StrongNo);
    assert!(matches!(judgment.resolution(), Resolution::FailClosed { .. }));
    assert!(judgment.confidence() <= PHI_INV_2);
    assert_eq!(judgment.votes().len(), 4);
    assert_eq!(events.count("escalation_requested"), 2);
}

#[tokio::test]
async fn reserve_votes_can_resolve_a_split() {
    let engine = JudgmentEngine::builder()
        .panel(vec![fixed("a", Position::Yes, 0.5), fixed("b", Position::No, 0.5)])
        .reserve(vec![
            fixed("r1", Position::StrongYes, 0.5),
            fixed("r2", Position::StrongYes, 0.5),
            fixed("r3", Position::StrongYes, 0.5),
        ])
        .build()
        .unwrap();

    let submission = engine
        .submit_for_judgment(&Item::new("x", ""), &Context::default())
        .await
        .unwrap();
    let judgment = submission.judgment().unwrap();
    assert_eq!(judgment.resolution(), &Resolution::Escalated { rounds: 1 });
    assert_eq!(judgment.verdict(), Position::StrongYes);
    assert_eq!(judgment.votes().len(), 4);
}

#[tokio::test]
async fn deferred_escalation_expires_closed() {
    let mut config = EngineConfig::default();
    config.escalation.defer_external = true;
    let engine = JudgmentEngine::builder()
        .config(config)
        .panel(vec![fixed("a", Position::Yes, 0.5), fixed("b", Position::No, 0.5)])
        .reserve(vec![])
        .build()
        .unwrap();

    let submission = engine
        .submit_for_judgment(&Item::new("x", ""), &Context::default())
        .await
        .unwrap();
    let request = match submission {
        Submission::Escalation(request) => request,
        other => panic!("expected escalation, got {other:?}"),
    };
    assert_eq!(request.fallback_verdict, Position::StrongNo);
    assert!(!request.triggers.is_empty());

    let judgment = engine
        .resolve_escalation(&request.id, EscalationDecision::Expire)
        .await
        .unwrap();
    assert_eq!(judgment.verdict(), Position::StrongNo);
    assert!(matches!(judgment.resolution(), Resolution::FailClosed { .. }));
}

#[tokio::test]
async fn small_residual_stays_idle_and_large_one_proposes() {
    let events = Arc::new(MemoryEventSink::new());
    let engine = JudgmentEngine::builder()
        .panel(vec![fixed("a", Position::Yes, 0.5), fixed("b", Position::Yes, 0.5)])
        .events(events.clone())
        .significance_test(Box::new(FixedPValue(0.01)))
        .build()
        .unwrap();
    let context = Context::default();

    // Both judgments carry the ceiling confidence.
    let first = engine
        .submit_for_judgment(&Item::new("one", "").with_feature("humor", 0.9), &context)
        .await
        .unwrap();
    let first = first.judgment().unwrap().clone();
    assert_eq!(first.confidence(), PHI_INV);
    engine
        .report_outcome(first.id(), ObservedOutcome::Graded(PHI_INV - 0.30))
        .unwrap();
    engine.flush().await.unwrap();
    assert_eq!(engine.residual_stats().material, 0);
    assert_eq!(events.count("dimension_proposed"), 0);

    let second = engine
        .submit_for_judgment(&Item::new("two", "").with_feature("humor", 0.9), &context)
        .await
        .unwrap();
    let second = second.judgment().unwrap().clone();
    engine
        .report_outcome(second.id(), ObservedOutcome::Graded(PHI_INV - 0.45))
        .unwrap();
    engine.flush().await.unwrap();
    assert_eq!(engine.residual_stats().material, 1);
    assert_eq!(events.count("dimension_proposed"), 1);

    let proposal = engine.proposals().pop().unwrap();
    assert_eq!(proposal.proposed_formula, "inverse(humor)");
    assert_eq!(proposal.status, ProposalStatus::Pending);
    assert_eq!(proposal.source_judgment, second.id());
}

#[tokio::test]
async fn discovered_dimension_is_voted_into_the_registry() {
    let events = Arc::new(MemoryEventSink::new());
    let engine = JudgmentEngine::builder()
        .clock(fixed_clock())
        .events(events.clone())
        .significance_test(Box::new(FixedPValue(0.01)))
        .build()
        .unwrap();
    let item = uniform_item("item", 0.9).with_feature("humor", 0.9);
    let submission = engine
        .submit_for_judgment(&item, &Context::default())
        .await
        .unwrap();
    let judgment = submission.judgment().unwrap().clone();
    assert_eq!(judgment.verdict(), Position::StrongYes);

    engine
        .report_outcome(judgment.id(), ObservedOutcome::Binary(false))
        .unwrap();
    engine.flush().await.unwrap();
    let proposal = engine.proposals().pop().expect("a proposal was opened");
    assert_eq!(proposal.proposed_formula, "inverse(humor)");
    let version_before = engine.snapshot().await.unwrap().version();

    let panel = engine.panel_ids();
    assert!(matches!(
        engine.dimension_vote(&proposal.id, "stranger", true).await,
        Err(EngineError::UnknownAgent(_))
    ));
    for (i, agent) in panel.iter().take(7).enumerate() {
        let updated = engine.dimension_vote(&proposal.id, agent, true).await.unwrap();
        let expected = if i < 6 {
            ProposalStatus::Pending
        } else {
            ProposalStatus::Approved
        };
        assert_eq!(updated.status, expected);
    }
    assert!(matches!(
        engine.dimension_vote(&proposal.id, &panel[7], true).await,
        Err(EngineError::ProposalClosed(_))
    ));

    let snapshot = engine.snapshot().await.unwrap();
    assert_eq!(snapshot.version(), version_before + 1);
    let dim = snapshot.get("low_humor").expect("registered");
    assert_eq!(dim.weight, PHI_INV_2);
    assert!(dim.is_discovered());
    assert!(!dim.locked);
    let approved = events
        .events()
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::DimensionApproved { .. }))
        .count();
    assert_eq!(approved, 1);

    // New judgments read the new dimension; earlier ones keep their version.
    let next = engine
        .submit_for_judgment(&item.clone().with_feature("accuracy", 0.85), &Context::default())
        .await
        .unwrap();
    let next = next.judgment().unwrap();
    assert_eq!(next.registry_version(), snapshot.version());
    assert!(next.dimension_scores().contains_key("low_humor"));
    assert_eq!(judgment.registry_version(), version_before);
}

#[tokio::test]
async fn duplicate_outcome_updates_profiles_once() {
    let engine = JudgmentEngine::builder()
        .panel(vec![fixed("a", Position::Yes, 0.5), fixed("b", Position::Yes, 0.5)])
        .build()
        .unwrap();
    let judgment = engine
        .submit_for_judgment(&Item::new("x", ""), &Context::default())
        .await
        .unwrap()
        .judgment()
        .unwrap()
        .clone();

    engine
        .report_outcome(judgment.id(), ObservedOutcome::Binary(true))
        .unwrap();
    engine
        .report_outcome(judgment.id(), ObservedOutcome::Binary(true))
        .unwrap();
    engine.flush().await.unwrap();

    let profile = engine.profile("a").unwrap();
    assert_eq!(profile.vote_count, 1);
    assert!(engine.is_outcome_consumed(judgment.id()));

    // Unknown judgments are dropped without touching profiles.
    engine
        .report_outcome("missing", ObservedOutcome::Binary(false))
        .unwrap();
    engine.flush().await.unwrap();
    assert_eq!(engine.profile("a").unwrap().vote_count, 1);
    assert!(engine
        .report_outcome(judgment.id(), ObservedOutcome::Graded(1.5))
        .is_err());
}

#[tokio::test]
async fn recalibrated_panel_judges_a_resubmitted_item_afresh() {
    let engine = JudgmentEngine::builder()
        .panel(vec![fixed("a", Position::Yes, 0.5), fixed("b", Position::Yes, 0.5)])
        .build()
        .unwrap();
    let item = Item::new("x", "");
    let first = engine
        .submit_for_judgment(&item, &Context::default())
        .await
        .unwrap()
        .judgment()
        .unwrap()
        .clone();
    engine
        .report_outcome(first.id(), ObservedOutcome::Binary(false))
        .unwrap();
    engine.flush().await.unwrap();
    assert!(engine.profile("a").unwrap().voting_weight < PHI_INV_2);

    let second = engine
        .submit_for_judgment(&item, &Context::default())
        .await
        .unwrap()
        .judgment()
        .unwrap()
        .clone();
    assert_ne!(second.id(), first.id());
    assert_eq!(engine.judgments().len(), 2);
    assert!(!engine.is_outcome_consumed(second.id()));
}

#[tokio::test]
async fn concurrent_identical_submissions_vote_once() {
    let events = Arc::new(MemoryEventSink::new());
    let engine = JudgmentEngine::builder()
        .panel(vec![
            slow("a", Duration::from_millis(50)),
            slow("b", Duration::from_millis(50)),
        ])
        .events(events.clone())
        .build()
        .unwrap();
    let item = Item::new("x", "");
    let context = Context::default();

    let (first, second) = tokio::join!(
        engine.submit_for_judgment(&item, &context),
        engine.submit_for_judgment(&item, &context),
    );
    let first = first.unwrap();
    assert_eq!(first, second.unwrap());
    assert_eq!(engine.judgments().len(), 1);
    assert_eq!(events.count("judgment_created"), 1);
}

#[tokio::test]
async fn failed_registration_reopens_the_approved_proposal() {
    let mut config = EngineConfig::default();
    config.retry = RetryConfig {
        max_attempts: 2,
        base_delay_ms: 1,
    };
    let engine = JudgmentEngine::builder()
        .config(config)
        .clock(fixed_clock())
        .significance_test(Box::new(FixedPValue(0.01)))
        .build()
        .unwrap();
    let item = uniform_item("item", 0.9).with_feature("humor", 0.9);
    let judgment = engine
        .submit_for_judgment(&item, &Context::default())
        .await
        .unwrap()
        .judgment()
        .unwrap()
        .clone();
    engine
        .report_outcome(judgment.id(), ObservedOutcome::Binary(false))
        .unwrap();
    engine.flush().await.unwrap();
    let proposal = engine.proposals().pop().expect("a proposal was opened");
    let panel = engine.panel_ids();
    for agent in panel.iter().take(6) {
        engine.dimension_vote(&proposal.id, agent, true).await.unwrap();
    }

    let held = engine.registry().transaction().unwrap();
    let err = engine
        .dimension_vote(&proposal.id, &panel[6], true)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DimensionRegistryLocked));
    drop(held);

    let reverted = engine.proposals().pop().unwrap();
    assert_eq!(reverted.status, ProposalStatus::Pending);
    assert_eq!(reverted.approvals.len(), 6);
    assert!(engine.snapshot().await.unwrap().get("low_humor").is_none());

    let approved = engine
        .dimension_vote(&proposal.id, &panel[6], true)
        .await
        .unwrap();
    assert_eq!(approved.status, ProposalStatus::Approved);
    assert!(engine.snapshot().await.unwrap().get("low_humor").is_some());
}

#[tokio::test]
async fn failing_agent_is_skipped_until_its_cooldown_passes() {
    let clock = fixed_clock();
    let events = Arc::new(MemoryEventSink::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = JudgmentEngine::builder()
        .clock(clock.clone())
        .panel(vec![
            fixed("a", Position::Yes, 0.5),
            fixed("b", Position::Yes, 0.5),
            failing("c", calls.clone()),
        ])
        .reserve(vec![])
        .events(events.clone())
        .build()
        .unwrap();
    let cooldown = engine.config().breaker.cooldown_ms as i64;
    let threshold = engine.config().breaker.failure_threshold as usize;

    let mut submit = {
        let mut n = 0;
        move || {
            n += 1;
            Item::new(format!("x{n}"), "")
        }
    };
    for _ in 0..threshold {
        let submission = engine
            .submit_for_judgment(&submit(), &Context::default())
            .await
            .unwrap();
        assert_eq!(submission.judgment().unwrap().abstentions(), ["c".to_string()]);
    }
    assert_eq!(calls.load(Ordering::SeqCst), threshold);
    assert_eq!(engine.circuit_state("c"), CircuitState::Open);
    assert_eq!(events.count("agent_circuit_opened"), 1);

    // Open circuit: the agent abstains without being called.
    let submission = engine
        .submit_for_judgment(&submit(), &Context::default())
        .await
        .unwrap();
    assert_eq!(submission.judgment().unwrap().abstentions(), ["c".to_string()]);
    assert_eq!(calls.load(Ordering::SeqCst), threshold);

    // After the cooldown one trial call goes through; it fails and reopens.
    clock.advance(cooldown);
    engine
        .submit_for_judgment(&submit(), &Context::default())
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), threshold + 1);
    assert_eq!(engine.circuit_state("c"), CircuitState::Open);
    assert_eq!(events.count("agent_circuit_opened"), 2);
}
