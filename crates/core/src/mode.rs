//! Execution modes and per-launch options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Largest slice the engine accepts in chunked mode.
pub const MAX_CHUNK_SIZE: usize = 2000;

/// How the engine runs a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// The whole input is handed to the unit in one invocation.
    SingleShot,
    /// The input is split into slices of `chunk_size` records.
    Chunked,
    /// One firing of a recurring schedule; runs like `SingleShot`.
    Recurring,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::SingleShot => "single_shot",
            ExecutionMode::Chunked => "chunked",
            ExecutionMode::Recurring => "recurring",
        }
    }
}

impl core::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options recognized by the engine for a single launch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Records per slice (chunked mode only). `None` uses the engine default.
    pub chunk_size: Option<usize>,
    /// Wall-clock budget checked at slice boundaries.
    pub timeout_seconds: Option<u64>,
    /// Whether the unit may call out to external systems.
    pub allow_external_calls: bool,
}

impl LaunchConfig {
    pub fn chunked(chunk_size: usize) -> Self {
        Self {
            chunk_size: Some(chunk_size),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = Some(timeout.as_secs().max(1));
        self
    }

    pub fn allowing_external_calls(mut self) -> Self {
        self.allow_external_calls = true;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }

    /// Slice size the engine should use for `mode`.
    pub fn slice_size(&self, mode: ExecutionMode, engine_default: usize) -> usize {
        match mode {
            ExecutionMode::Chunked => self.chunk_size.unwrap_or(engine_default),
            ExecutionMode::SingleShot | ExecutionMode::Recurring => usize::MAX,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if let Some(size) = self.chunk_size {
            if size == 0 {
                return Err(DomainError::validation("chunk_size must be at least 1"));
            }
            if size > MAX_CHUNK_SIZE {
                return Err(DomainError::validation(format!(
                    "chunk_size {size} exceeds the maximum of {MAX_CHUNK_SIZE}"
                )));
            }
        }
        if self.timeout_seconds == Some(0) {
            return Err(DomainError::validation("timeout_seconds must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_size_only_applies_to_chunked_mode() {
        let config = LaunchConfig::chunked(50);
        assert_eq!(config.slice_size(ExecutionMode::Chunked, 200), 50);
        assert_eq!(config.slice_size(ExecutionMode::SingleShot, 200), usize::MAX);
        assert_eq!(LaunchConfig::default().slice_size(ExecutionMode::Chunked, 200), 200);
    }

    #[test]
    fn chunk_size_bounds_are_enforced() {
        assert!(LaunchConfig::chunked(0).validate().is_err());
        assert!(LaunchConfig::chunked(MAX_CHUNK_SIZE + 1).validate().is_err());
        assert!(LaunchConfig::chunked(MAX_CHUNK_SIZE).validate().is_ok());
    }
}
