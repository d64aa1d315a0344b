// Tests for the externally consumed differences report.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use syncnorris::config::{SyncMode, SyncOptions};
use syncnorris::fs::LocalBackend;
use syncnorris::sync::{DiffReason, DifferencesReport, ResolutionPolicy, SyncEngine};

fn write(root: &Path, rel: &str, contents: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

async fn dry_run_report(policy: ResolutionPolicy) -> DifferencesReport {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    write(src.path(), "added.txt", b"a");
    write(src.path(), "conflicted.txt", b"source side");
    write(dst.path(), "conflicted.txt", b"dst");
    write(dst.path(), "extra.txt", b"e");

    let options = SyncOptions {
        mode: SyncMode::Bidirectional,
        conflict_policy: policy,
        dry_run: true,
        stateful: true,
        state_dir: Some(state.path().to_path_buf()),
        ..SyncOptions::default()
    };
    let engine = SyncEngine::new(
        Arc::new(LocalBackend::new(src.path())),
        Arc::new(LocalBackend::new(dst.path())),
        options,
    )
    .unwrap();
    let report = engine.run().await.unwrap();
    DifferencesReport::from_report(&report)
}

#[tokio::test]
async fn differences_round_trip_through_json() {
    let differences = dry_run_report(ResolutionPolicy::Ask).await;
    assert!(differences.dry_run);
    assert_eq!(differences.conflict_count, 1);
    assert!(differences.total_count >= 2);

    let json = differences.to_json().unwrap();
    let parsed: DifferencesReport = serde_json::from_str(&json).unwrap();

    assert_eq!(parsed.total_count, differences.total_count);
    assert_eq!(parsed.conflict_count, differences.conflict_count);
    assert_eq!(parsed.differences, differences.differences);
    assert_eq!(parsed.conflicts[0].path, differences.conflicts[0].path);
    assert_eq!(parsed.conflicts[0].kind, differences.conflicts[0].kind);
}

#[tokio::test]
async fn reason_tags_use_wire_names() {
    let differences = dry_run_report(ResolutionPolicy::Ask).await;
    let json = differences.to_json().unwrap();

    assert!(json.contains("\"only_in_source\""));
    assert!(json.contains("\"mode\": \"bidirectional\""));

    let added = differences
        .differences
        .iter()
        .find(|d| d.relative_path == "added.txt")
        .unwrap();
    assert_eq!(added.reason, DiffReason::OnlyInSource);

    let extra = differences
        .differences
        .iter()
        .find(|d| d.relative_path == "extra.txt")
        .unwrap();
    assert_eq!(extra.reason, DiffReason::OnlyInDest);
}

#[tokio::test]
async fn text_rendering_lists_every_difference() {
    let differences = dry_run_report(ResolutionPolicy::Ask).await;
    let text = differences.to_text();

    assert!(text.contains("added.txt"));
    assert!(text.contains("extra.txt"));
    assert!(text.contains("conflicted.txt"));
    assert!(text.contains("[only_in_source]"));
}
