// End-to-end tests for one-way sync over local directories.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use syncnorris::config::{SyncMode, SyncOptions};
use syncnorris::fs::LocalBackend;
use syncnorris::sync::{DiffReason, RunStatus, SyncEngine, SyncReport};

fn write(root: &Path, rel: &str, contents: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

fn read(root: &Path, rel: &str) -> Vec<u8> {
    fs::read(root.join(rel)).unwrap()
}

fn one_way_options() -> SyncOptions {
    SyncOptions {
        mode: SyncMode::OneWay,
        max_workers: 2,
        ..SyncOptions::default()
    }
}

async fn run(src: &Path, dst: &Path, options: SyncOptions) -> SyncReport {
    let engine = SyncEngine::new(
        Arc::new(LocalBackend::new(src)),
        Arc::new(LocalBackend::new(dst)),
        options,
    )
    .unwrap();
    engine.run().await.unwrap()
}

#[tokio::test]
async fn fresh_copy_replicates_the_tree() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write(src.path(), "a.txt", b"hello");
    write(src.path(), "dir/b.txt", b"world");

    let report = run(src.path(), dst.path(), one_way_options()).await;

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.stats.files_copied, 2);
    assert_eq!(report.stats.files_scanned, 2);
    assert_eq!(read(dst.path(), "a.txt"), b"hello");
    assert_eq!(read(dst.path(), "dir/b.txt"), b"world");
}

#[tokio::test]
async fn identical_files_synchronize_without_transfer() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write(src.path(), "x.txt", b"same");
    write(dst.path(), "x.txt", b"same");

    let report = run(src.path(), dst.path(), one_way_options()).await;

    assert_eq!(report.stats.files_synchronized, 1);
    assert_eq!(report.stats.files_copied, 0);
    assert_eq!(report.stats.bytes_transferred, 0);
}

#[tokio::test]
async fn stale_destination_is_updated() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write(src.path(), "m.txt", b"new");
    write(dst.path(), "m.txt", b"old");

    let report = run(src.path(), dst.path(), one_way_options()).await;

    assert_eq!(report.stats.files_updated, 1);
    assert_eq!(report.stats.files_copied, 0);
    assert_eq!(read(dst.path(), "m.txt"), b"new");
}

#[tokio::test]
async fn excluded_files_are_skipped() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write(src.path(), "keep.txt", b"k");
    write(src.path(), "drop.tmp", b"d");

    let options = SyncOptions {
        exclude_patterns: vec!["*.tmp".into()],
        ..one_way_options()
    };
    let report = run(src.path(), dst.path(), options).await;

    assert_eq!(report.stats.files_scanned, 2);
    assert_eq!(report.stats.files_copied, 1);
    assert_eq!(report.stats.files_skipped, 1);
    assert!(dst.path().join("keep.txt").exists());
    assert!(!dst.path().join("drop.tmp").exists());
}

#[tokio::test]
async fn orphans_are_deleted_when_enabled() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write(src.path(), "a.txt", b"keep me");
    write(dst.path(), "a.txt", b"keep me");
    write(dst.path(), "stale.txt", b"gone");
    fs::create_dir_all(dst.path().join("dead/dir")).unwrap();
    write(dst.path(), "dead/dir/old.log", b"x");

    let options = SyncOptions {
        delete_orphans: true,
        ..one_way_options()
    };
    let report = run(src.path(), dst.path(), options).await;

    assert_eq!(report.status, RunStatus::Success);
    assert!(dst.path().join("a.txt").exists());
    assert!(!dst.path().join("stale.txt").exists());
    assert!(!dst.path().join("dead").exists(), "orphan dirs removed deepest-first");
    assert_eq!(report.stats.files_deleted, 2);
    assert_eq!(report.stats.dirs_deleted, 2);
    assert!(report
        .differences
        .iter()
        .any(|d| d.relative_path == "stale.txt" && d.reason == DiffReason::Deleted));
}

#[tokio::test]
async fn dry_run_projects_without_mutating() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write(src.path(), "new.txt", b"n");
    write(src.path(), "changed.txt", b"after");
    write(dst.path(), "changed.txt", b"prior");
    write(dst.path(), "orphan.txt", b"o");

    let options = SyncOptions {
        dry_run: true,
        delete_orphans: true,
        ..one_way_options()
    };
    let report = run(src.path(), dst.path(), options).await;

    assert!(report.dry_run);
    assert_eq!(report.stats.files_copied, 1);
    assert_eq!(report.stats.files_updated, 1);
    assert_eq!(report.stats.files_deleted, 1);
    assert_eq!(report.stats.bytes_transferred, 0);

    // Nothing actually moved.
    assert!(!dst.path().join("new.txt").exists());
    assert_eq!(read(dst.path(), "changed.txt"), b"prior");
    assert!(dst.path().join("orphan.txt").exists());

    assert!(report
        .differences
        .iter()
        .any(|d| d.relative_path == "new.txt" && d.reason == DiffReason::OnlyInSource));
}

#[tokio::test]
async fn second_run_is_idempotent() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write(src.path(), "a.txt", b"alpha");
    write(src.path(), "deep/nested/b.txt", b"beta");

    let first = run(src.path(), dst.path(), one_way_options()).await;
    assert_eq!(first.stats.files_copied, 2);

    let second = run(src.path(), dst.path(), one_way_options()).await;
    assert_eq!(second.stats.files_copied, 0);
    assert_eq!(second.stats.files_updated, 0);
    assert_eq!(second.stats.files_synchronized, 2);
}

#[tokio::test]
async fn unwritable_target_yields_partial_status() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write(src.path(), "good.txt", b"fine");
    write(src.path(), "blocked", b"payload");
    // A directory squatting on the target path makes the write fail.
    fs::create_dir_all(dst.path().join("blocked/inner")).unwrap();
    write(dst.path(), "blocked/inner/x.txt", b"x");

    let report = run(src.path(), dst.path(), one_way_options()).await;

    assert_eq!(report.status, RunStatus::Partial);
    assert_eq!(report.stats.files_copied, 1);
    assert_eq!(report.stats.files_errored, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].path, "blocked");
    assert!(report
        .differences
        .iter()
        .any(|d| d.relative_path == "blocked" && d.reason == DiffReason::CopyError));
}

#[tokio::test]
async fn preexisting_cancellation_short_circuits_the_run() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write(src.path(), "a.txt", b"untouched");

    let cancel = CancellationToken::new();
    cancel.cancel();

    let engine = SyncEngine::new(
        Arc::new(LocalBackend::new(src.path())),
        Arc::new(LocalBackend::new(dst.path())),
        one_way_options(),
    )
    .unwrap()
    .with_cancellation(cancel);

    let report = engine.run().await.unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.status.exit_code(), 3);
    assert!(!dst.path().join("a.txt").exists());
}

#[tokio::test]
async fn copies_preserve_mod_times() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write(src.path(), "t.txt", b"timed");
    filetime::set_file_mtime(
        src.path().join("t.txt"),
        filetime::FileTime::from_unix_time(1_600_000_000, 0),
    )
    .unwrap();

    run(src.path(), dst.path(), one_way_options()).await;

    let copied = fs::metadata(dst.path().join("t.txt")).unwrap();
    let mtime = filetime::FileTime::from_last_modification_time(&copied);
    assert_eq!(mtime.unix_seconds(), 1_600_000_000);
}
