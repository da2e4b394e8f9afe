//! Error types for tenantstore

use crate::tenant::TenantState;
use std::fmt;
use std::path::PathBuf;

/// Result type alias for tenantstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for tenantstore
#[derive(Debug)]
pub enum Error {
    /// Object store errors
    ObjectStore(object_store::Error),
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// Block directory or meta.json could not be read
    BlockMeta { dir: PathBuf, reason: String },
    /// Block directory is missing a required file
    InvalidBlock { dir: PathBuf, reason: String },
    /// Remote existence check failed; the sync pass was abandoned
    ExistenceCheck(Box<Error>),
    /// One or more block uploads failed during a sync pass. `shipped` blocks
    /// made it anyway and were recorded.
    ShipFailures { shipped: usize, failed: usize },
    /// Operation was cancelled before it finished
    Cancelled,
    /// Append attempted during a forced head compaction
    ForcedCompactionInProgress,
    /// Append attempted while the tenant TSDB is closing
    TenantClosing,
    /// Append attempted while the tenant TSDB is not in an appendable state
    TenantNotActive,
    /// Forced compaction requested while the tenant was not active
    CompactionConflict(TenantState),
    /// Process-wide in-memory series limit reached
    MaxInMemorySeriesReached { limit: u64 },
    /// Per-tenant series limit reached
    MaxSeriesPerUser { tenant_id: String, limit: u64 },
    /// Per-metric-name series limit reached
    MaxSeriesPerMetric {
        tenant_id: String,
        metric: String,
        limit: u64,
    },
    /// Label set without a metric name
    MissingMetricName,
    /// Internal error
    Internal(String),
}

/// A rejected compare-and-swap on the tenant state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateConflict {
    pub from: TenantState,
    pub to: TenantState,
    pub actual: TenantState,
}

impl fmt::Display for StateConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot transition from {} to {}: state is {}",
            self.from, self.to, self.actual
        )
    }
}

impl Error {
    /// Whether the caller should retry the operation on a later cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ShipFailures { .. }
                | Error::ExistenceCheck(_)
                | Error::ObjectStore(_)
                | Error::Io(_)
                | Error::BlockMeta { .. }
                | Error::ForcedCompactionInProgress
                | Error::CompactionConflict(_)
        )
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ObjectStore(e) => Some(e),
            Error::Io(e) => Some(e),
            Error::ExistenceCheck(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ObjectStore(e) => write!(f, "Object store error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::BlockMeta { dir, reason } => {
                write!(f, "read metadata for block {}: {}", dir.display(), reason)
            }
            Error::InvalidBlock { dir, reason } => {
                write!(f, "invalid block {}: {}", dir.display(), reason)
            }
            Error::ExistenceCheck(e) => write!(f, "check exists: {}", e),
            Error::ShipFailures { failed, .. } => write!(f, "failed to sync {} blocks", failed),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::ForcedCompactionInProgress => write!(f, "forced compaction in progress"),
            Error::TenantClosing => write!(f, "TSDB is closing"),
            Error::TenantNotActive => write!(f, "TSDB is not active"),
            Error::CompactionConflict(state) => write!(
                f,
                "TSDB head cannot be compacted because it is not in active state (state: {}; possibly being closed or blocks shipping in progress)",
                state
            ),
            Error::MaxInMemorySeriesReached { limit } => write!(
                f,
                "the write has been rejected because the instance reached the limit of {} in-memory series",
                limit
            ),
            Error::MaxSeriesPerUser { tenant_id, limit } => write!(
                f,
                "per-user series limit of {} exceeded for tenant {}",
                limit, tenant_id
            ),
            Error::MaxSeriesPerMetric {
                tenant_id,
                metric,
                limit,
            } => write!(
                f,
                "per-metric series limit of {} exceeded for tenant {} and metric {}",
                limit, tenant_id, metric
            ),
            Error::MissingMetricName => write!(f, "Missing metric name"),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        Error::ObjectStore(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ship_failures_message_names_count() {
        let err = Error::ShipFailures {
            shipped: 2,
            failed: 1,
        };
        assert_eq!(err.to_string(), "failed to sync 1 blocks");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_append_rejections_are_descriptive() {
        assert_eq!(
            Error::ForcedCompactionInProgress.to_string(),
            "forced compaction in progress"
        );
        assert_eq!(Error::TenantClosing.to_string(), "TSDB is closing");
        assert_eq!(Error::TenantNotActive.to_string(), "TSDB is not active");
    }

    #[test]
    fn test_compaction_conflict_names_state() {
        let err = Error::CompactionConflict(TenantState::ActiveShipping);
        assert!(err.to_string().contains("active_shipping"));
    }
}
