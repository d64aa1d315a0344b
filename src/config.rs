//! Engine configuration and validation.
//!
//! External loaders (CLI flags, config files) populate [`SyncOptions`]; the
//! engine validates once before a run starts and never re-checks.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::SyncError;
use crate::sync::compare::ComparisonMethod;
use crate::sync::conflict::ResolutionPolicy;

/// Smallest accepted transfer buffer.
pub const MIN_BUFFER_SIZE: usize = 1024;

/// Floor for the one-way task queue.
pub const MIN_QUEUE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncMode {
    #[default]
    #[serde(rename = "oneway")]
    OneWay,
    #[serde(rename = "bidirectional")]
    Bidirectional,
}

/// Everything the core needs to run one sync.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub mode: SyncMode,
    pub comparison: ComparisonMethod,
    pub conflict_policy: ResolutionPolicy,
    pub exclude_patterns: Vec<String>,
    pub dry_run: bool,
    /// One-way only: remove destination files absent from the source.
    pub delete_orphans: bool,
    pub max_workers: usize,
    /// Bytes per second; 0 means unlimited.
    pub bandwidth_limit: u64,
    pub buffer_size: usize,
    pub queue_size: usize,
    /// Bidirectional only: persist per-pair state between runs.
    pub stateful: bool,
    /// Override for the state directory; defaults to the user config dir.
    pub state_dir: Option<PathBuf>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            mode: SyncMode::OneWay,
            comparison: ComparisonMethod::Hash,
            conflict_policy: ResolutionPolicy::Newer,
            exclude_patterns: Vec::new(),
            dry_run: false,
            delete_orphans: false,
            max_workers: num_cpus::get().max(1),
            bandwidth_limit: 0,
            buffer_size: 256 * 1024,
            queue_size: 1000,
            stateful: true,
            state_dir: None,
        }
    }
}

impl SyncOptions {
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.max_workers < 1 {
            return Err(SyncError::validation(
                "max_workers",
                "must be at least 1",
            ));
        }
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(SyncError::validation(
                "buffer_size",
                format!("must be at least {MIN_BUFFER_SIZE} bytes"),
            ));
        }
        Ok(())
    }

    /// Queue capacity with the floor applied.
    pub fn effective_queue_size(&self) -> usize {
        self.queue_size.max(MIN_QUEUE_SIZE)
    }

    pub fn effective_workers(&self) -> usize {
        self.max_workers.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        SyncOptions::default().validate().unwrap();
    }

    #[test]
    fn zero_workers_rejected() {
        let options = SyncOptions {
            max_workers: 0,
            ..SyncOptions::default()
        };
        let err = options.validate().unwrap_err();
        assert!(matches!(err, SyncError::Validation { field: "max_workers", .. }));
    }

    #[test]
    fn tiny_buffer_rejected() {
        let options = SyncOptions {
            buffer_size: 512,
            ..SyncOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn queue_size_has_a_floor() {
        let options = SyncOptions {
            queue_size: 5,
            ..SyncOptions::default()
        };
        assert_eq!(options.effective_queue_size(), MIN_QUEUE_SIZE);
    }

    #[test]
    fn mode_serializes_to_wire_names() {
        assert_eq!(serde_json::to_string(&SyncMode::OneWay).unwrap(), "\"oneway\"");
        assert_eq!(
            serde_json::to_string(&SyncMode::Bidirectional).unwrap(),
            "\"bidirectional\""
        );
    }
}
