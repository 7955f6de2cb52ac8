use judgment_engine::evaluation::{run_synthetic_suite, synthetic_cases};
use judgment_engine::phi::PHI_INV;

fn assert_prob(x: f64) {
    assert!(
        x.is_finite() && (0.0..=1.0).contains(&x),
        "expected probability in [0,1], got {x}"
    );
}

#[tokio::test]
async fn synthetic_suite_filter_selects_exact_name() {
    let all = synthetic_cases();
    assert!(all.iter().any(|c| c.name == "aligned_panel_34"));

    let selected = run_synthetic_suite(Some("aligned_panel_34")).await.unwrap();
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].case_name, "aligned_panel_34");
    assert!(run_synthetic_suite(Some("no_such_case")).await.unwrap().is_empty());
}

#[tokio::test]
async fn aligned_panel_is_accurate_and_bounded() {
    let result = run_synthetic_suite(Some("aligned_panel_34")).await.unwrap();
    let metrics = &result[0].metrics;

    assert_eq!(metrics.judgments, 34);
    assert_prob(metrics.verdict_accuracy);
    assert!(metrics.verdict_accuracy >= 0.6);
    assert!(metrics.max_confidence <= PHI_INV);
    assert_prob(metrics.mean_confidence);
    if let Some(ece) = metrics.ece {
        assert_prob(ece);
    }
    // Every feature the outcome depends on is already read.
    assert_eq!(metrics.proposals_opened, 0);
    assert!(metrics.dimensions_added.is_empty());
}

#[tokio::test]
async fn hidden_feature_is_proposed() {
    let result = run_synthetic_suite(Some("hidden_feature_55")).await.unwrap();
    let metrics = &result[0].metrics;

    assert!(metrics.proposals_opened >= 1);
    assert!(metrics.max_confidence <= PHI_INV);
    assert!(metrics
        .dimensions_added
        .iter()
        .all(|id| id.starts_with("humor")));
}

#[tokio::test]
async fn suite_is_reproducible() {
    let a = run_synthetic_suite(Some("noisy_binary_55")).await.unwrap();
    let b = run_synthetic_suite(Some("noisy_binary_55")).await.unwrap();
    let (a, b) = (&a[0].metrics, &b[0].metrics);
    assert_eq!(a.judgments, b.judgments);
    assert_eq!(a.verdict_accuracy, b.verdict_accuracy);
    assert_eq!(a.mean_confidence, b.mean_confidence);
    assert_eq!(a.escalation_requests, b.escalation_requests);
    assert_eq!(a.fail_closed, b.fail_closed);
}
