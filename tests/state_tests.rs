// Integration tests for the persisted sync-state store.

use chrono::{TimeZone, Utc};
use std::fs;

use syncnorris::sync::state::{state_path_under, StateStore, SyncState};

#[test]
fn missing_file_yields_fresh_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = state_path_under(dir.path(), "/src", "/dst");

    let store = StateStore::open_at(path, "/src", "/dst").unwrap();
    assert!(store.state.files.is_empty());
    assert_eq!(store.state.source_path, "/src");
    assert_eq!(store.state.dest_path, "/dst");
}

#[test]
fn save_then_load_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = state_path_under(dir.path(), "/src", "/dst");
    let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

    let mut store = StateStore::open_at(path.clone(), "/src", "/dst").unwrap();
    store.update_file("a.txt", 11, t0, Some("deadbeef".into()), true, true, false);
    store.update_file("sub/b.txt", 22, t0, None, true, false, false);
    store.mark_sync_complete();
    store.save().unwrap();

    let reloaded = StateStore::open_at(path, "/src", "/dst").unwrap();
    assert_eq!(reloaded.state, store.state);

    let entry = &reloaded.state.files["a.txt"];
    assert_eq!(entry.size, 11);
    assert_eq!(entry.hash.as_deref(), Some("deadbeef"));
    assert!(entry.exists_in_source && entry.exists_in_dest);
}

#[test]
fn save_leaves_no_temp_sibling() {
    let dir = tempfile::tempdir().unwrap();
    let path = state_path_under(dir.path(), "/src", "/dst");

    let store = StateStore::open_at(path.clone(), "/src", "/dst").unwrap();
    store.save().unwrap();

    assert!(path.exists());
    let siblings: Vec<_> = fs::read_dir(path.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(siblings.len(), 1, "temp file left behind: {siblings:?}");
}

#[test]
fn stale_temp_file_does_not_break_reload() {
    // A crash between temp write and rename leaves a .tmp sibling; the
    // prior state must still load.
    let dir = tempfile::tempdir().unwrap();
    let path = state_path_under(dir.path(), "/src", "/dst");
    let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

    let mut store = StateStore::open_at(path.clone(), "/src", "/dst").unwrap();
    store.update_file("kept.txt", 5, t0, None, true, true, false);
    store.save().unwrap();

    fs::write(path.with_extension("json.tmp"), b"{ truncated garbage").unwrap();

    let reloaded = StateStore::open_at(path, "/src", "/dst").unwrap();
    assert!(reloaded.state.files.contains_key("kept.txt"));
}

#[test]
fn corrupt_state_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = state_path_under(dir.path(), "/src", "/dst");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, b"not json at all").unwrap();

    assert!(StateStore::open_at(path, "/src", "/dst").is_err());
}

#[test]
fn future_version_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = state_path_under(dir.path(), "/src", "/dst");
    fs::create_dir_all(path.parent().unwrap()).unwrap();

    let mut state = SyncState::new("/src", "/dst");
    state.version = 99;
    fs::write(&path, serde_json::to_vec(&state).unwrap()).unwrap();

    let err = StateStore::open_at(path, "/src", "/dst").unwrap_err();
    assert!(err.to_string().contains("version"));
}

#[test]
fn pair_hash_distinguishes_direction() {
    let dir = tempfile::tempdir().unwrap();
    let forward = state_path_under(dir.path(), "/a", "/b");
    let reverse = state_path_under(dir.path(), "/b", "/a");
    assert_ne!(forward, reverse);

    // Trailing separators do not change the identity.
    assert_eq!(forward, state_path_under(dir.path(), "/a/", "/b/"));
}
