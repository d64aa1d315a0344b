//! Two-sided change analysis for bidirectional sync.
//!
//! The analyzer is pure: it consumes the two scan maps plus the prior state
//! and emits an action list and a conflict list. All side effects live in
//! the executor, which keeps this logic testable with table-driven inputs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

use crate::fs::backend::FileRecord;
use crate::sync::compare::MODTIME_TOLERANCE_SECS;
use crate::sync::conflict::{Conflict, ConflictType};
use crate::sync::report::EntryInfo;
use crate::sync::state::{ChangeType, Side, StateStore};

/// Which way a change flows. For deletes the direction names the flow of
/// the change, so `SourceToDest` deletes the destination copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    SourceToDest,
    DestToSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Copy,
    Delete,
    Mkdir,
}

/// One executable step of a bidirectional plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncAction {
    pub kind: ActionKind,
    pub direction: Direction,
    pub path: String,
    /// Conflict copies land under a different name on the receiving side.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub is_dir: bool,
    pub size: u64,
    /// Whether a conflict resolution produced this action.
    pub from_conflict: bool,
}

impl SyncAction {
    fn new(kind: ActionKind, direction: Direction, path: &str, is_dir: bool, size: u64) -> Self {
        Self {
            kind,
            direction,
            path: path.to_string(),
            target: None,
            is_dir,
            size,
            from_conflict: false,
        }
    }
}

/// A path left untouched, with enough fingerprint to seed the state store.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedPath {
    pub path: String,
    pub size: u64,
    pub mod_time: Option<DateTime<Utc>>,
}

/// Analyzer output: what to do, what conflicts, what to forget.
#[derive(Debug, Default)]
pub struct Analysis {
    pub actions: Vec<SyncAction>,
    pub conflicts: Vec<Conflict>,
    pub skips: Vec<SkippedPath>,
    /// Stale state entries whose path is gone from both sides.
    pub state_removals: Vec<String>,
}

/// Order actions for execution: directories first, then paths ascending.
pub fn sort_actions(actions: &mut [SyncAction]) {
    actions.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.path.cmp(&b.path)));
}

fn within_tolerance(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => (a - b).num_seconds().abs() <= MODTIME_TOLERANCE_SECS,
        _ => false,
    }
}

/// Analyze the union of both scans and the prior state.
pub fn analyze(
    source_files: &HashMap<String, FileRecord>,
    dest_files: &HashMap<String, FileRecord>,
    state: &StateStore,
) -> Analysis {
    let mut analysis = Analysis::default();

    // Sorted union keeps the plan deterministic run to run.
    let paths: BTreeSet<&String> = source_files
        .keys()
        .chain(dest_files.keys())
        .chain(state.state.files.keys())
        .collect();

    for path in paths {
        let src = source_files.get(path);
        let dst = dest_files.get(path);

        if src.map(|r| r.is_dir).unwrap_or(false) || dst.map(|r| r.is_dir).unwrap_or(false) {
            analyze_dir(path, src, dst, state, &mut analysis);
        } else {
            analyze_file(path, src, dst, state, &mut analysis);
        }
    }

    analysis
}

fn analyze_dir(
    path: &str,
    src: Option<&FileRecord>,
    dst: Option<&FileRecord>,
    state: &StateStore,
    analysis: &mut Analysis,
) {
    let prior = state.state.files.get(path);
    match (src, dst) {
        (Some(_), None) => {
            // Recreate only if the destination never had it; a recorded
            // presence means it was deleted there on purpose.
            if !prior.map(|p| p.exists_in_dest).unwrap_or(false) {
                analysis.actions.push(SyncAction::new(
                    ActionKind::Mkdir,
                    Direction::SourceToDest,
                    path,
                    true,
                    0,
                ));
            }
        }
        (None, Some(_)) => {
            if !prior.map(|p| p.exists_in_source).unwrap_or(false) {
                analysis.actions.push(SyncAction::new(
                    ActionKind::Mkdir,
                    Direction::DestToSource,
                    path,
                    true,
                    0,
                ));
            }
        }
        (Some(_), Some(_)) => {}
        (None, None) => analysis.state_removals.push(path.to_string()),
    }
}

fn analyze_file(
    path: &str,
    src: Option<&FileRecord>,
    dst: Option<&FileRecord>,
    state: &StateStore,
    analysis: &mut Analysis,
) {
    let prior = state.state.files.get(path);

    if prior.is_none() {
        return first_sync(path, src, dst, analysis);
    }

    let src_change = state.detect_change(
        path,
        src.map(|r| r.size).unwrap_or(0),
        src.and_then(|r| r.modified),
        src.is_some(),
        Side::Source,
    );
    let dst_change = state.detect_change(
        path,
        dst.map(|r| r.size).unwrap_or(0),
        dst.and_then(|r| r.modified),
        dst.is_some(),
        Side::Dest,
    );

    match (src_change.is_change(), dst_change.is_change()) {
        (false, false) => {
            if src.is_none() && dst.is_none() {
                analysis.state_removals.push(path.to_string());
            }
        }
        (true, false) => push_one_sided(path, src, src_change, Direction::SourceToDest, analysis),
        (false, true) => push_one_sided(path, dst, dst_change, Direction::DestToSource, analysis),
        (true, true) => both_changed(path, src, dst, src_change, dst_change, analysis),
    }
}

fn first_sync(
    path: &str,
    src: Option<&FileRecord>,
    dst: Option<&FileRecord>,
    analysis: &mut Analysis,
) {
    match (src, dst) {
        (Some(record), None) => analysis.actions.push(SyncAction::new(
            ActionKind::Copy,
            Direction::SourceToDest,
            path,
            false,
            record.size,
        )),
        (None, Some(record)) => analysis.actions.push(SyncAction::new(
            ActionKind::Copy,
            Direction::DestToSource,
            path,
            false,
            record.size,
        )),
        (Some(s), Some(d)) => {
            if s.size == d.size && within_tolerance(s.modified, d.modified) {
                analysis.skips.push(SkippedPath {
                    path: path.to_string(),
                    size: s.size,
                    mod_time: s.modified,
                });
            } else {
                analysis.conflicts.push(Conflict::new(
                    path,
                    ConflictType::CreateCreate,
                    Some(EntryInfo::from(s)),
                    Some(EntryInfo::from(d)),
                ));
            }
        }
        (None, None) => {}
    }
}

fn push_one_sided(
    path: &str,
    changed: Option<&FileRecord>,
    change: ChangeType,
    direction: Direction,
    analysis: &mut Analysis,
) {
    match change {
        ChangeType::Created | ChangeType::Modified => {
            let record = changed.expect("created/modified side has a record");
            analysis.actions.push(SyncAction::new(
                ActionKind::Copy,
                direction,
                path,
                false,
                record.size,
            ));
        }
        ChangeType::Deleted => {
            analysis
                .actions
                .push(SyncAction::new(ActionKind::Delete, direction, path, false, 0));
        }
        ChangeType::None => {}
    }
}

fn both_changed(
    path: &str,
    src: Option<&FileRecord>,
    dst: Option<&FileRecord>,
    src_change: ChangeType,
    dst_change: ChangeType,
    analysis: &mut Analysis,
) {
    // Both sides dropped the file; there is nothing left to reconcile.
    if src_change == ChangeType::Deleted && dst_change == ChangeType::Deleted {
        analysis.state_removals.push(path.to_string());
        return;
    }

    // Safety net against state drift: both present and indistinguishable by
    // fingerprint is treated as already in sync.
    if let (Some(s), Some(d)) = (src, dst) {
        if s.size == d.size && within_tolerance(s.modified, d.modified) {
            analysis.skips.push(SkippedPath {
                path: path.to_string(),
                size: s.size,
                mod_time: s.modified,
            });
            return;
        }
    }

    let kind = match (src_change, dst_change) {
        (ChangeType::Deleted, ChangeType::Modified) => ConflictType::DeleteModify,
        (ChangeType::Modified, ChangeType::Deleted) => ConflictType::ModifyDelete,
        (ChangeType::Created, ChangeType::Created) => ConflictType::CreateCreate,
        _ => ConflictType::ModifyModify,
    };

    analysis.conflicts.push(Conflict::new(
        path,
        kind,
        src.map(EntryInfo::from),
        dst.map(EntryInfo::from),
    ));
}
