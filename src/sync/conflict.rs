//! Conflict classification and resolution for bidirectional sync.
//!
//! The analyzer creates [`Conflict`]s; the resolver mutates each exactly
//! once, turning it into zero or more executable actions according to the
//! configured policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sync::analyze::{ActionKind, Direction, SyncAction};
use crate::sync::report::EntryInfo;

/// How the two sides diverged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Changed on both sides.
    ModifyModify,
    /// Deleted in source, modified in destination.
    DeleteModify,
    /// Modified in source, deleted in destination.
    ModifyDelete,
    /// Created independently on both sides with differing content.
    CreateCreate,
}

/// Policy applied to every conflict in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    /// Source side always wins.
    SourceWins,
    /// Destination side always wins.
    DestWins,
    /// Strictly later mod-time wins; ties go to the destination. For
    /// delete/modify pairs the surviving (modified) side wins.
    #[default]
    Newer,
    /// Keep both: each side's content lands on the other side under a
    /// conflict-copy name, originals untouched.
    Both,
    /// Defer to an interactive driver; without one the conflict is skipped.
    Ask,
}

/// Which side's content prevailed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Source,
    Dest,
    Both,
}

/// A path that diverged on both sides since the last recorded state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub path: String,
    pub kind: ConflictType,
    pub source: Option<EntryInfo>,
    pub dest: Option<EntryInfo>,
    pub detected_at: DateTime<Utc>,
    /// Policy recorded at resolution time; `None` while unresolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<Winner>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    /// Extra files created by the `Both` policy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflict_copies: Vec<String>,
}

impl Conflict {
    pub fn new(
        path: impl Into<String>,
        kind: ConflictType,
        source: Option<EntryInfo>,
        dest: Option<EntryInfo>,
    ) -> Self {
        Self {
            path: path.into(),
            kind,
            source,
            dest,
            detected_at: Utc::now(),
            resolution: None,
            resolved_action: None,
            resolved_at: None,
            winner: None,
            outcome: None,
            conflict_copies: Vec::new(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Build a conflict-copy name: `dir/c.txt` + `source-conflict` becomes
/// `dir/c.source-conflict.txt`; extensionless names get the suffix appended.
pub fn conflict_copy_name(path: &str, suffix: &str) -> String {
    let (parent, name) = match path.rsplit_once('/') {
        Some((parent, name)) => (Some(parent), name),
        None => (None, path),
    };

    let renamed = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}.{suffix}.{ext}"),
        _ => format!("{name}.{suffix}"),
    };

    match parent {
        Some(parent) => format!("{parent}/{renamed}"),
        None => renamed,
    }
}

/// Applies one policy across a run's conflicts.
pub struct ConflictResolver {
    policy: ResolutionPolicy,
}

impl ConflictResolver {
    pub fn new(policy: ResolutionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ResolutionPolicy {
        self.policy
    }

    /// Resolve in place, returning the actions that realize the decision.
    /// `Ask` without an interactive driver leaves the conflict unresolved
    /// and returns nothing.
    pub fn resolve(&self, conflict: &mut Conflict) -> Vec<SyncAction> {
        let actions = match self.policy {
            ResolutionPolicy::SourceWins => self.take_side(conflict, Winner::Source),
            ResolutionPolicy::DestWins => self.take_side(conflict, Winner::Dest),
            ResolutionPolicy::Newer => {
                let winner = newer_side(conflict);
                self.take_side(conflict, winner)
            }
            ResolutionPolicy::Both => self.keep_both(conflict),
            ResolutionPolicy::Ask => {
                conflict.outcome = Some("unresolved: ask policy without interactive driver".into());
                return Vec::new();
            }
        };

        conflict.resolution = Some(self.policy);
        conflict.resolved_at = Some(Utc::now());
        actions
    }

    fn take_side(&self, conflict: &mut Conflict, winner: Winner) -> Vec<SyncAction> {
        let (entry, direction) = match winner {
            Winner::Source => (&conflict.source, Direction::SourceToDest),
            Winner::Dest => (&conflict.dest, Direction::DestToSource),
            Winner::Both => unreachable!("take_side is single-winner"),
        };

        conflict.winner = Some(winner);
        match entry {
            Some(info) => {
                conflict.resolved_action =
                    Some(format!("copy {:?} version over the other side", winner));
                conflict.outcome = Some(format!("kept {winner:?} content"));
                vec![SyncAction {
                    kind: ActionKind::Copy,
                    direction,
                    path: conflict.path.clone(),
                    target: None,
                    is_dir: false,
                    size: info.size,
                    from_conflict: true,
                }]
            }
            None => {
                // Winning side deleted the file; propagate the deletion.
                conflict.resolved_action = Some(format!("propagate {winner:?} deletion"));
                conflict.outcome = Some(format!("deleted per {winner:?} side"));
                vec![SyncAction {
                    kind: ActionKind::Delete,
                    direction,
                    path: conflict.path.clone(),
                    target: None,
                    is_dir: false,
                    size: 0,
                    from_conflict: true,
                }]
            }
        }
    }

    fn keep_both(&self, conflict: &mut Conflict) -> Vec<SyncAction> {
        let (Some(source), Some(dest)) = (conflict.source.clone(), conflict.dest.clone()) else {
            // Only one side survives a delete/modify pair; keep it.
            let winner = newer_side(conflict);
            return self.take_side(conflict, winner);
        };

        let into_dest = conflict_copy_name(&conflict.path, "source-conflict");
        let into_source = conflict_copy_name(&conflict.path, "dest-conflict");

        conflict.winner = Some(Winner::Both);
        conflict.resolved_action = Some("kept both versions as conflict copies".into());
        conflict.outcome = Some(format!("wrote {into_dest} and {into_source}"));
        conflict.conflict_copies = vec![into_dest.clone(), into_source.clone()];

        vec![
            SyncAction {
                kind: ActionKind::Copy,
                direction: Direction::SourceToDest,
                path: conflict.path.clone(),
                target: Some(into_dest),
                is_dir: false,
                size: source.size,
                from_conflict: true,
            },
            SyncAction {
                kind: ActionKind::Copy,
                direction: Direction::DestToSource,
                path: conflict.path.clone(),
                target: Some(into_source),
                is_dir: false,
                size: dest.size,
                from_conflict: true,
            },
        ]
    }
}

/// Pick the surviving or strictly-newer side; ties go to the destination.
fn newer_side(conflict: &Conflict) -> Winner {
    match (&conflict.source, &conflict.dest) {
        (Some(_), None) => Winner::Source,
        (None, Some(_)) => Winner::Dest,
        (Some(src), Some(dst)) => match (src.mod_time, dst.mod_time) {
            (Some(a), Some(b)) if a > b => Winner::Source,
            (Some(_), None) => Winner::Source,
            _ => Winner::Dest,
        },
        (None, None) => Winner::Dest,
    }
}
