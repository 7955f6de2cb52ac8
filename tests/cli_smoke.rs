use std::path::Path;
use std::process::{Command, Output};

use tempfile::tempdir;

fn judge(db: &Path, args: &[&str]) -> Output {
    let output = Command::new(env!("CARGO_BIN_EXE_judge"))
        .arg("--db")
        .arg(db)
        .args(args)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "judge {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    output
}

fn json_lines(output: &Output) -> Vec<serde_json::Value> {
    String::from_utf8(output.stdout.clone())
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[test]
fn submit_then_report_outcome() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("state.sqlite");
    let items = dir.path().join("items.jsonl");
    let features = [
        "accuracy",
        "candor",
        "congruence",
        "coherence",
        "simplicity",
        "completeness",
        "provenance",
        "reproducibility",
        "transparency",
        "relevance",
        "novelty",
        "alignment",
        "utility",
        "efficiency",
        "sustainability",
    ];
    let mut body = String::new();
    for (id, value) in [("good", 0.9), ("poor", 0.2)] {
        let feats: serde_json::Map<String, serde_json::Value> = features
            .iter()
            .map(|f| (f.to_string(), serde_json::json!(value)))
            .collect();
        body.push_str(&serde_json::json!({ "id": id, "features": feats }).to_string());
        body.push('\n');
    }
    std::fs::write(&items, body).unwrap();

    let submitted = json_lines(&judge(&db, &["submit", "--items", items.to_str().unwrap()]));
    assert_eq!(submitted.len(), 2);
    assert_eq!(submitted[0]["kind"], "judgment");
    let good = &submitted[0]["value"];
    assert_eq!(good["item_ref"], "good");
    assert_eq!(good["verdict"], "STRONG_YES");
    assert!(good["confidence"].as_f64().unwrap() <= 0.6181);
    assert_eq!(submitted[1]["value"]["verdict"], "STRONG_NO");

    let id = good["id"].as_str().unwrap();
    judge(&db, &["outcome", "--judgment", id, "--observed", "true"]);

    let profiles = json_lines(&judge(&db, &["profiles"]));
    assert_eq!(profiles.len(), 11);
    assert!(profiles.iter().all(|p| p["vote_count"] == 1));

    let dimensions = json_lines(&judge(&db, &["dimensions"]));
    assert_eq!(dimensions.len(), 15);

    let out = dir.path().join("export.jsonl");
    judge(&db, &["export", "--out", out.to_str().unwrap()]);
    assert_eq!(std::fs::read_to_string(&out).unwrap().lines().count(), 2);
}

#[test]
fn eval_writes_jsonl() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("eval.jsonl");
    judge(
        &dir.path().join("unused.sqlite"),
        &["eval", "--case", "aligned_panel_34", "--out", out.to_str().unwrap()],
    );
    let raw = std::fs::read_to_string(&out).unwrap();
    let first: serde_json::Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
    assert_eq!(first["case_name"], "aligned_panel_34");
    assert_eq!(first["metrics"]["judgments"], 34);
}

#[test]
fn unknown_judgment_outcome_fails() {
    let dir = tempdir().unwrap();
    let status = Command::new(env!("CARGO_BIN_EXE_judge"))
        .arg("--db")
        .arg(dir.path().join("state.sqlite"))
        .args(["outcome", "--judgment", "nope", "--observed", "0.4"])
        .status()
        .unwrap();
    assert!(!status.success());
}
