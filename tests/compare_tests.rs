// Integration tests for the comparator over local backends.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use syncnorris::fs::{LocalBackend, StorageBackend};
use syncnorris::sync::{Comparator, ComparisonMethod, DifferenceReason, Verdict};

fn write(root: &Path, rel: &str, contents: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

fn set_mtime(root: &Path, rel: &str, secs: i64) {
    filetime::set_file_mtime(
        root.join(rel),
        filetime::FileTime::from_unix_time(secs, 0),
    )
    .unwrap();
}

async fn verdict(
    method: ComparisonMethod,
    src_root: &Path,
    dst_root: &Path,
    rel: &str,
) -> Verdict {
    let source = LocalBackend::new(src_root);
    let dest = LocalBackend::new(dst_root);
    let src_rec = source.stat(rel).await.unwrap().unwrap();
    let dst_rec = dest.stat(rel).await.unwrap().unwrap();

    Comparator::new(method, 4096)
        .compare(&source, &dest, &src_rec, &dst_rec, &CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn size_mismatch_short_circuits_every_method() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write(src.path(), "f.txt", b"longer content");
    write(dst.path(), "f.txt", b"short");

    for method in [
        ComparisonMethod::NameSize,
        ComparisonMethod::Timestamp,
        ComparisonMethod::Binary,
        ComparisonMethod::Hash,
        ComparisonMethod::Md5,
    ] {
        let v = verdict(method, src.path(), dst.path(), "f.txt").await;
        assert_eq!(v, Verdict::Different(DifferenceReason::Size), "{method:?}");
    }
}

#[tokio::test]
async fn name_size_ignores_content() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write(src.path(), "f.txt", b"aaaa");
    write(dst.path(), "f.txt", b"bbbb");

    let v = verdict(ComparisonMethod::NameSize, src.path(), dst.path(), "f.txt").await;
    assert_eq!(v, Verdict::Same);
}

#[tokio::test]
async fn timestamp_flags_stale_mtime() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write(src.path(), "f.txt", b"same");
    write(dst.path(), "f.txt", b"same");
    set_mtime(src.path(), "f.txt", 1_700_000_010);
    set_mtime(dst.path(), "f.txt", 1_700_000_000);

    let v = verdict(ComparisonMethod::Timestamp, src.path(), dst.path(), "f.txt").await;
    assert_eq!(v, Verdict::Different(DifferenceReason::ModTime));

    // Inside the one-second window the files count as equal.
    set_mtime(dst.path(), "f.txt", 1_700_000_010);
    let v = verdict(ComparisonMethod::Timestamp, src.path(), dst.path(), "f.txt").await;
    assert_eq!(v, Verdict::Same);
}

#[tokio::test]
async fn binary_finds_first_mismatch() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write(src.path(), "f.bin", &[0u8; 8192]);
    let mut altered = vec![0u8; 8192];
    altered[8000] = 1;
    write(dst.path(), "f.bin", &altered);

    let v = verdict(ComparisonMethod::Binary, src.path(), dst.path(), "f.bin").await;
    assert_eq!(v, Verdict::Different(DifferenceReason::Content));
}

#[tokio::test]
async fn hash_judges_equal_content_same() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let body = vec![42u8; 100_000];
    write(src.path(), "big.bin", &body);
    write(dst.path(), "big.bin", &body);

    for method in [ComparisonMethod::Hash, ComparisonMethod::Md5] {
        let v = verdict(method, src.path(), dst.path(), "big.bin").await;
        assert_eq!(v, Verdict::Same, "{method:?}");
    }
}

#[tokio::test]
async fn hash_flags_divergent_content() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write(src.path(), "f.txt", b"abcd");
    write(dst.path(), "f.txt", b"abce");

    let v = verdict(ComparisonMethod::Hash, src.path(), dst.path(), "f.txt").await;
    assert_eq!(v, Verdict::Different(DifferenceReason::Hash));
}

#[tokio::test]
async fn comparison_progress_reaches_the_callback() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let body = vec![7u8; 32_768];
    write(src.path(), "f.bin", &body);
    write(dst.path(), "f.bin", &body);

    let source = LocalBackend::new(src.path());
    let dest = LocalBackend::new(dst.path());
    let src_rec = source.stat("f.bin").await.unwrap().unwrap();
    let dst_rec = dest.stat("f.bin").await.unwrap().unwrap();

    let seen = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let seen_in_cb = Arc::clone(&seen);
    let comparator = Comparator::new(ComparisonMethod::Hash, 4096).with_progress(Arc::new(
        move |_path, done, _total| {
            seen_in_cb.store(done, std::sync::atomic::Ordering::Relaxed);
        },
    ));

    let v = comparator
        .compare(&source, &dest, &src_rec, &dst_rec, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(v, Verdict::Same);
    // Both sides streamed: the last callback covers all bytes of both files.
    assert_eq!(seen.load(std::sync::atomic::Ordering::Relaxed), 2 * 32_768);
}
