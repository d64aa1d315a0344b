//! Sync core: comparison, change analysis, conflict resolution, and the
//! one-way and bidirectional execution paths.

pub mod analyze;
pub mod compare;
pub mod conflict;
pub mod engine;
pub mod exclude;
pub mod pipeline;
pub mod progress;
pub mod report;
pub mod state;
pub mod throttle;

pub use analyze::{analyze, Analysis, ActionKind, Direction, SyncAction};
pub use compare::{Comparator, ComparisonMethod, DifferenceReason, Verdict};
pub use conflict::{Conflict, ConflictResolver, ConflictType, ResolutionPolicy, Winner};
pub use engine::SyncEngine;
pub use exclude::ExcludeMatcher;
pub use progress::{ChannelSink, NullSink, ProgressEvent, ProgressSink};
pub use report::{
    Collector, DiffReason, DifferencesReport, FileDifference, FileTask, RunStatus, Statistics,
    StatsSnapshot, SyncReport, TaskResult,
};
pub use state::{ChangeType, FileState, Side, StateStore, SyncState};
pub use throttle::RateLimiter;
