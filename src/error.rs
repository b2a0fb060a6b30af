//! Error types for the engine control plane
//!
//! Provides structured error types for the rank registry, engine handles,
//! fanout coordinator, subsystem managers and the cluster layer.

use crate::domain::{EngineState, FailureKind, Rank};
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the control plane
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Request Validation Errors
    // =========================================================================
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid rank set '{input}': {reason}")]
    InvalidRankSet { input: String, reason: String },

    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Destructive operation {operation} requires confirmation or dry-run")]
    ConfirmationRequired { operation: String },

    // =========================================================================
    // Rank Errors
    // =========================================================================
    #[error("Rank not found: {rank}")]
    RankNotFound { rank: Rank },

    #[error("Rank already registered: {rank}")]
    RankAlreadyRegistered { rank: Rank },

    #[error("Rank {rank} busy: operation already in progress")]
    RankBusy { rank: Rank },

    #[error("Rank {rank}: {operation} not permitted from state {state}")]
    InvalidTransition {
        rank: Rank,
        operation: String,
        state: EngineState,
    },

    #[error("Engine failure on rank {rank}: {reason}")]
    EngineFailure { rank: Rank, reason: String },

    #[error("Operation {operation} timed out after {elapsed:?}")]
    Timeout { operation: String, elapsed: Duration },

    // =========================================================================
    // Device Errors
    // =========================================================================
    #[error("Device not found: {device}")]
    DeviceNotFound { device: String },

    #[error("Device {device} busy: operation already in progress")]
    DeviceBusy { device: String },

    #[error("Device failure on {device}: {reason}")]
    DeviceFailure { device: String, reason: String },

    #[error("NVMe command failed: {command} - {reason}")]
    NvmeCommand { command: String, reason: String },

    #[error("Hardware discovery failed: {0}")]
    HardwareDiscovery(String),

    // =========================================================================
    // Cluster Errors
    // =========================================================================
    #[error("Host {host} unreachable: {reason}")]
    TransportFailure { host: String, reason: String },

    #[error("Not the leader; current leader is {leader}")]
    NotLeader { leader: String },

    #[error("Host not found in membership: {host}")]
    HostNotFound { host: String },

    #[error("Pool not found: {pool}")]
    PoolNotFound { pool: String },

    #[error("Pool already exists: {pool}")]
    PoolExists { pool: String },

    #[error("Container not found: {container} in pool {pool}")]
    ContainerNotFound { pool: String, container: String },

    #[error("System operation refused: {0}")]
    SystemRefused(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Map a target-scoped error onto the outcome kind recorded in a fanout result
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::RankNotFound { .. }
            | Error::DeviceNotFound { .. }
            | Error::HostNotFound { .. }
            | Error::PoolNotFound { .. }
            | Error::ContainerNotFound { .. } => FailureKind::NotFound,

            Error::RankBusy { .. } | Error::DeviceBusy { .. } => FailureKind::Busy,

            Error::Timeout { .. } => FailureKind::Timeout,

            Error::InvalidTransition { .. } => FailureKind::InvalidState,

            Error::DeviceFailure { .. }
            | Error::NvmeCommand { .. }
            | Error::HardwareDiscovery(_) => FailureKind::DeviceFailure,

            Error::TransportFailure { .. } | Error::Http(_) => FailureKind::TransportFailure,

            _ => FailureKind::EngineFailure,
        }
    }

    /// True when the whole call was rejected before any dispatch
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidRequest(_)
                | Error::InvalidRankSet { .. }
                | Error::MissingParameter(_)
                | Error::ConfirmationRequired { .. }
        )
    }

    /// Check if the caller may retry this error.
    ///
    /// Retrying is only ever done by the caller; the control plane never
    /// re-issues destructive operations on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RankBusy { .. }
                | Error::DeviceBusy { .. }
                | Error::Timeout { .. }
                | Error::TransportFailure { .. }
                | Error::Http(_)
                | Error::NotLeader { .. }
        )
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::RankBusy { .. }
                | Error::DeviceBusy { .. }
                | Error::TransportFailure { .. }
                | Error::Http(_)
        )
    }
}

/// Result type alias for the control plane
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_mapping() {
        let err = Error::RankBusy { rank: Rank(3) };
        assert_eq!(err.failure_kind(), FailureKind::Busy);

        let err = Error::Timeout {
            operation: "stop".into(),
            elapsed: Duration::from_secs(1),
        };
        assert_eq!(err.failure_kind(), FailureKind::Timeout);

        let err = Error::InvalidTransition {
            rank: Rank(1),
            operation: "prep_shutdown".into(),
            state: EngineState::Stopped,
        };
        assert_eq!(err.failure_kind(), FailureKind::InvalidState);

        let err = Error::EngineFailure {
            rank: Rank(2),
            reason: "exit status 1".into(),
        };
        assert_eq!(err.failure_kind(), FailureKind::EngineFailure);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::TransportFailure {
            host: "host-b".into(),
            reason: "connection refused".into(),
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let destructive = Error::DeviceFailure {
            device: "0000:81:00.0".into(),
            reason: "format failed".into(),
        };
        assert!(!destructive.is_retryable());

        let malformed = Error::MissingParameter("masks".into());
        assert!(malformed.is_request_error());
        assert!(!malformed.is_retryable());
    }
}
