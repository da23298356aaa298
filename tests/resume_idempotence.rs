//! Interrupted and repeated runs: artifacts already on disk are adopted,
//! and a run with nothing to do leaves the registry untouched.

mod common;

use common::TestHarness;
use serde_json::json;
use transcriptforge::orchestrator::RunOptions;
use transcriptforge::registry::{PhaseOutcome, Stage};
use transcriptforge_common::{ArtifactKind, Phase, UnitState};

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let h = TestHarness::demo(3, true);
    h.fake.no_subs.lock().insert(2);

    let first = h.orchestrator().run("demo", &RunOptions::default()).await.unwrap();
    assert!(first.is_stable());
    assert!(first.collections[0].verification.as_ref().unwrap().passed);

    let bytes = h.registry_bytes();
    let calls = h.fake.calls.lock().len();

    let second = h.orchestrator().run("demo", &RunOptions::default()).await.unwrap();
    assert!(second.is_stable());
    let demo = &second.collections[0];
    assert_eq!(demo.advanced + demo.resumed + demo.retried, 0);

    assert_eq!(h.fake.calls.lock().len(), calls);
    assert_eq!(h.registry_bytes(), bytes);
}

#[tokio::test]
async fn test_artifacts_on_disk_are_resumed_without_calls() {
    let h = TestHarness::demo(3, false);
    h.seed(1, ArtifactKind::Subtitle, r#"{"events":[]}"#);
    h.seed(
        1,
        ArtifactKind::Extracted,
        &json!({ "summary": "done earlier", "metadata": { "item_id": "vid1" } }).to_string(),
    );
    h.seed(2, ArtifactKind::Subtitle, r#"{"events":[]}"#);

    let summary = h.orchestrator().run("demo", &RunOptions::default()).await.unwrap();
    assert!(summary.is_stable());

    assert_eq!(h.fake.calls_to("subtitle"), vec![3]);
    assert_eq!(h.fake.calls_to("extract"), vec![2, 3]);

    let demo = &summary.collections[0];
    assert_eq!(demo.resumed, 3);
    assert!(demo.verification.as_ref().unwrap().passed);

    let record = h.registry().record(&h.name()).unwrap().unwrap();
    let resumed: Vec<Phase> = record
        .history_for(1)
        .filter(|r| r.outcome == PhaseOutcome::Resumed)
        .map(|r| r.phase)
        .collect();
    assert_eq!(resumed, vec![Phase::Downloaded, Phase::AiExtracted]);
}

#[tokio::test]
async fn test_leftover_staging_file_is_not_an_artifact() {
    let h = TestHarness::demo(1, false);
    let target = h.locator().artifact_path(&h.name(), 1, "Lesson 1", ArtifactKind::Subtitle, None);
    let partial = transcriptforge::locator::staging_path(&target);
    std::fs::create_dir_all(partial.parent().unwrap()).unwrap();
    std::fs::write(&partial, "half a download").unwrap();

    h.orchestrator().run("demo", &RunOptions::default()).await.unwrap();

    assert_eq!(h.fake.calls_to("subtitle"), vec![1]);
    assert!(!partial.exists());
    assert!(std::fs::read_to_string(&target).unwrap().contains("Lesson 1"));
    assert_eq!(h.unit(1).state, UnitState::Active(Phase::Verified));
}

#[tokio::test]
async fn test_limited_runs_converge() {
    let h = TestHarness::demo(2, false);
    let limited = RunOptions {
        limit: Some(1),
        ..Default::default()
    };

    let first = h.orchestrator().run("demo", &limited).await.unwrap();
    assert!(!first.is_stable());
    assert_eq!(first.collections[0].advanced, 1);
    assert_eq!(first.collections[0].remaining, 2);
    assert!(first.collections[0].verification.is_none());
    assert_eq!(h.unit(1).state, UnitState::Active(Phase::Downloaded));
    assert!(h.registry().unit(&h.name(), 2).unwrap().is_none());

    let mut last = h.unit(1).phase();
    loop {
        let summary = h.orchestrator().run("demo", &limited).await.unwrap();
        let phase = h.unit(1).phase();
        assert!(phase >= last, "unit 1 regressed from {last} to {phase}");
        last = phase;
        if summary.is_stable() {
            break;
        }
    }

    assert_eq!(h.fake.calls_to("subtitle"), vec![1, 2]);
    assert_eq!(h.fake.calls_to("extract"), vec![1, 2]);
    let record = h.registry().record(&h.name()).unwrap().unwrap();
    assert_eq!(record.phase, Stage::Cleanup);
}

#[tokio::test]
async fn test_cancelled_run_writes_nothing() {
    let h = TestHarness::demo(2, false);
    h.cancel.cancel();

    let summary = h.orchestrator().run("demo", &RunOptions::default()).await.unwrap();

    assert!(summary.cancelled);
    assert!(!summary.is_stable());
    assert!(h.fake.calls.lock().is_empty());
    assert!(!h.config.storage.registry_path().exists());
}
