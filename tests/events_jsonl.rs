use std::sync::Arc;

use judgment_engine::events::EventSink;
use judgment_engine::{
    Context, EngineEvent, EventRecord, FixedClock, Item, JsonlEventSink, JudgmentEngine,
};
use tempfile::tempdir;

#[test]
fn jsonl_sink_writes_one_tagged_record_per_line() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    let (sink, worker) = JsonlEventSink::new(&path).unwrap();

    sink.record(EventRecord {
        at_ms: 1,
        event: EngineEvent::RecalibrationNeeded {
            ece: 0.12,
            samples: 34,
        },
    })
    .unwrap();
    sink.record(EventRecord {
        at_ms: 2,
        event: EngineEvent::DimensionRejected {
            proposal_id: "prop-1".into(),
            proposed_formula: "feature(humor)".into(),
        },
    })
    .unwrap();
    drop(sink);
    let summary = worker.join().unwrap();
    assert_eq!(summary.written, 2);
    assert_eq!(summary.attention, 1);
    assert_eq!(summary.by_kind.get("dimension_rejected"), Some(&1));

    let raw = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 2);
    let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first["event"], "recalibration_needed");
    assert_eq!(first["at_ms"], 1);
    let second: EventRecord = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(second.event.kind(), "dimension_rejected");
}

#[test]
fn attention_events_are_flushed_while_the_sink_is_open() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    let (sink, worker) = JsonlEventSink::new(&path).unwrap();

    sink.record(EventRecord {
        at_ms: 7,
        event: EngineEvent::AgentCircuitOpened {
            agent_id: "flaky".into(),
            consecutive_failures: 5,
            retry_at_ms: 22_925,
        },
    })
    .unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    let mut raw = String::new();
    while std::time::Instant::now() < deadline {
        raw = std::fs::read_to_string(&path).unwrap();
        if !raw.is_empty() {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    let record: EventRecord = serde_json::from_str(raw.trim()).unwrap();
    assert_eq!(record.event.kind(), "agent_circuit_opened");

    drop(sink);
    assert_eq!(worker.join().unwrap().attention, 1);
}

#[tokio::test]
async fn engine_events_reach_the_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    let (sink, worker) = JsonlEventSink::new(&path).unwrap();

    let engine = JudgmentEngine::builder()
        .clock(Arc::new(FixedClock::new(42)))
        .events(Arc::new(sink))
        .build()
        .unwrap();
    engine
        .submit_for_judgment(&Item::new("x", "").with_feature("accuracy", 0.7), &Context::default())
        .await
        .unwrap();
    engine.shutdown().await.unwrap();
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let records: Vec<EventRecord> = raw
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert!(!records.is_empty());
    assert!(records.iter().all(|r| r.at_ms == 42));
    assert!(matches!(
        records.last().unwrap().event,
        EngineEvent::JudgmentCreated { .. }
    ));
}
