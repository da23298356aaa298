//! The verification gate must never let cleanup delete audio whose
//! transcript or extracted content is missing, unreadable or mismatched.

mod common;

use assert_matches::assert_matches;
use common::TestHarness;
use serde_json::json;
use transcriptforge::config::IdentityPolicy;
use transcriptforge::orchestrator::RunOptions;
use transcriptforge_common::{ArtifactKind, Error};

/// Two audio-route units run to the dry-run cleanup, so their audio is still on disk.
async fn processed() -> TestHarness {
    let h = TestHarness::demo(2, true);
    h.fake.no_subs.lock().extend([1, 2]);
    let summary = h.orchestrator().run("demo", &RunOptions::default()).await.unwrap();
    assert!(summary.collections[0].verification.as_ref().unwrap().passed);
    h
}

fn extracted_path(h: &TestHarness, index: u32) -> std::path::PathBuf {
    h.locator()
        .locate(&h.name(), index, ArtifactKind::Extracted)
        .unwrap()
        .unwrap()
        .path
}

fn audio_count(h: &TestHarness) -> usize {
    h.locator().scan(&h.name(), ArtifactKind::Audio).unwrap().len()
}

#[tokio::test]
async fn test_malformed_extracted_blocks_cleanup() {
    let h = processed().await;
    std::fs::write(extracted_path(&h, 2), "{ \"summary\": ").unwrap();

    let result = h.orchestrator().verify(h.collection()).unwrap();
    assert!(!result.passed);
    assert!(result.issues[0].starts_with("unit 002 (vid2)"));
    assert!(result.issues[0].contains("is not valid JSON"));
    assert!(!h.registry().record(&h.name()).unwrap().unwrap().stats.verified);

    let err = h.orchestrator().cleanup(h.collection(), true).unwrap_err();
    assert_matches!(err, Error::VerificationFailed { ref collection, .. } if collection == "demo");
    assert_eq!(audio_count(&h), 2);
}

#[tokio::test]
async fn test_missing_extracted_blocks_cleanup() {
    let h = processed().await;
    std::fs::remove_file(extracted_path(&h, 1)).unwrap();

    let result = h.orchestrator().verify(h.collection()).unwrap();
    assert!(!result.passed);
    assert!(result.issues.iter().any(|i| i.contains("unit 001 (vid1): no extracted-content artifact")));
    // Its audio is no longer covered by a sound unit either
    assert!(result.issues.iter().any(|i| i.contains("does not belong to a verified unit")));

    assert!(h.orchestrator().cleanup(h.collection(), true).is_err());
    assert_eq!(audio_count(&h), 2);
}

#[tokio::test]
async fn test_missing_required_field_is_reported() {
    let h = processed().await;
    std::fs::write(
        extracted_path(&h, 1),
        json!({ "summary": "no metadata here" }).to_string(),
    )
    .unwrap();

    let result = h.orchestrator().verify(h.collection()).unwrap();
    assert!(result.issues[0].contains("lacks required field 'metadata'"));
}

#[tokio::test]
async fn test_stale_item_id_is_a_mismatch() {
    let h = processed().await;
    std::fs::write(
        extracted_path(&h, 1),
        json!({ "summary": "old", "metadata": { "item_id": "stale" } }).to_string(),
    )
    .unwrap();

    let result = h.orchestrator().verify(h.collection()).unwrap();
    assert!(!result.passed);
    assert!(result.issues[0].contains("records item stale but the unit is item vid1"));
}

#[tokio::test]
async fn test_index_prefix_policy_ignores_recorded_id() {
    let mut h = processed().await;
    h.config.verification.identity = IdentityPolicy::IndexPrefix;
    std::fs::write(
        extracted_path(&h, 1),
        json!({ "summary": "old", "metadata": { "item_id": "stale" } }).to_string(),
    )
    .unwrap();

    let result = h.orchestrator().verify(h.collection()).unwrap();
    assert!(result.passed, "{:?}", result.issues);
}

#[tokio::test]
async fn test_stray_audio_blocks_cleanup() {
    let h = processed().await;
    let stray = h
        .locator()
        .artifact_path(&h.name(), 9, "Stray", ArtifactKind::Audio, None);
    std::fs::write(&stray, b"noise").unwrap();

    let result = h.orchestrator().verify(h.collection()).unwrap();
    assert_eq!(result.issues.len(), 1, "{:?}", result.issues);
    assert!(result.issues[0].contains("009_Stray.mp3"));
    assert!(stray.exists());
}

#[tokio::test]
async fn test_absent_units_pass_only_when_allowed() {
    let mut h = TestHarness::demo(2, false);
    h.fake.no_subs.lock().insert(2);
    h.orchestrator().run("demo", &RunOptions::default()).await.unwrap();

    let strict = h.orchestrator().verify(h.collection()).unwrap();
    assert!(!strict.passed);
    assert!(strict.issues.iter().all(|i| i.starts_with("unit 002")));

    h.config.verification.allow_absent = true;
    let lenient = h.orchestrator().verify(h.collection()).unwrap();
    assert!(lenient.passed, "{:?}", lenient.issues);

    let report = h.orchestrator().cleanup(h.collection(), true).unwrap();
    assert!(report.is_complete());
    assert_eq!(report.cleaned_units, 1);
}

#[tokio::test]
async fn test_unprocessed_units_fail_the_gate() {
    let h = TestHarness::demo(3, false);

    let result = h.orchestrator().verify(h.collection()).unwrap();
    assert!(!result.passed);
    assert_eq!(
        result.issues,
        vec![
            "unit 001: not processed yet",
            "unit 002: not processed yet",
            "unit 003: not processed yet",
        ]
    );
}
