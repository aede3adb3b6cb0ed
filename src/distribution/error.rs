//! Error types for the region-tree subsystem.
//!
//! # Layers
//!
//! Errors are raised at two layers:
//!
//! - [`CoordinationError`]: failures of the coordination store itself. `NotFound`
//!   is kept apart from transient failures so callers can tell "never existed"
//!   from "could not be read right now".
//! - [`RegionError`]: the domain error every public partitioner, syncer and
//!   allocator operation returns. Store errors are wrapped into it via `#[from]`
//!   before they reach the partitioner layer.
//!
//! # Benign errors
//!
//! A [`RegionError::ConcurrentModification`] means another actor already
//! performed the compare-and-swap transition. Callers usually log it at `debug`
//! and continue; see [`RegionError::is_benign`].

use std::time::Duration;

use thiserror::Error;

use crate::hyperrectangle::GeometryError;

use super::region::{RegionId, RegionState};

/// Result alias for coordination store calls.
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Result alias for region-tree operations.
pub type RegionResult<T> = Result<T, RegionError>;

/// Errors raised by a [`CoordinationStore`](super::coordination::CoordinationStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinationError {
    #[error("Node {0} not found")]
    NotFound(String),

    #[error("Node {0} already exists")]
    NodeExists(String),

    #[error("Invalid path '{0}'")]
    InvalidPath(String),

    #[error("Coordination store unavailable: {0}")]
    Unavailable(String),

    #[error("Coordination store is closed")]
    Closed,
}

impl CoordinationError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoordinationError::NotFound(_))
    }

    /// Transient failures that a retry may resolve.
    pub fn is_retriable(&self) -> bool {
        matches!(self, CoordinationError::Unavailable(_))
    }
}

/// Errors returned by region-tree operations.
#[derive(Debug, Error)]
pub enum RegionError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Coordination store error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Unable to allocate {required} systems ({available} eligible): {reason}")]
    ResourceAllocation {
        required: usize,
        available: usize,
        reason: String,
    },

    #[error("Operation '{operation}' is not supported by the {partitioner} partitioner")]
    Unsupported {
        partitioner: &'static str,
        operation: &'static str,
    },

    #[error("Concurrent modification of {path}: expected state {expected}")]
    ConcurrentModification {
        path: String,
        expected: RegionState,
    },

    #[error("Region {region} is in state {actual}, expected {expected}")]
    InvalidState {
        region: RegionId,
        actual: RegionState,
        expected: String,
    },

    #[error("Region {0} not found")]
    RegionNotFound(RegionId),

    #[error("Distribution group {0} not found")]
    GroupNotFound(String),

    #[error("Distribution group {0} already exists")]
    GroupExists(String),

    #[error("Timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },

    #[error("Unable to determine split point: {0}")]
    SplitPoint(String),

    #[error("Geometry error: {0}")]
    Geometry(#[from] GeometryError),

    #[error("Malformed data at {path}: {reason}")]
    MalformedData { path: String, reason: String },

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Partitioner for group {0} has been shut down")]
    Shutdown(String),
}

impl RegionError {
    pub fn configuration(message: impl Into<String>) -> Self {
        RegionError::Configuration(message.into())
    }

    pub fn malformed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        RegionError::MalformedData {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Errors a caller can retry without changing its input.
    pub fn is_retriable(&self) -> bool {
        match self {
            RegionError::Coordination(e) => e.is_retriable(),
            RegionError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Missing regions, groups or store nodes.
    pub fn is_not_found(&self) -> bool {
        match self {
            RegionError::Coordination(e) => e.is_not_found(),
            RegionError::RegionNotFound(_) | RegionError::GroupNotFound(_) => true,
            _ => false,
        }
    }

    /// Another actor already performed the transition; not a failure.
    pub fn is_benign(&self) -> bool {
        matches!(self, RegionError::ConcurrentModification { .. })
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, RegionError::Unsupported { .. })
    }

    pub fn is_resource_allocation(&self) -> bool {
        matches!(self, RegionError::ResourceAllocation { .. })
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RegionError::Configuration(_) => "configuration",
            RegionError::Coordination(_) => "coordination",
            RegionError::ResourceAllocation { .. } => "resource_allocation",
            RegionError::Unsupported { .. } => "unsupported",
            RegionError::ConcurrentModification { .. } => "concurrent_modification",
            RegionError::InvalidState { .. } => "invalid_state",
            RegionError::RegionNotFound(_) => "region_not_found",
            RegionError::GroupNotFound(_) => "group_not_found",
            RegionError::GroupExists(_) => "group_exists",
            RegionError::Timeout { .. } => "timeout",
            RegionError::SplitPoint(_) => "split_point",
            RegionError::Geometry(_) => "geometry",
            RegionError::MalformedData { .. } => "malformed_data",
            RegionError::Serde(_) => "serde",
            RegionError::Shutdown(_) => "shutdown",
        }
    }
}
