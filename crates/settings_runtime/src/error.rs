//! Error taxonomy of the settings core.

use settings_host::BackendError;
use thiserror::Error;

use crate::keys::BackendKind;

#[derive(Debug, Clone, PartialEq, Error)]
/// Failure surfaced by a settings operation.
pub enum SettingsError {
    /// A backend rejected a write for size reasons.
    #[error("{backend} storage quota exceeded ({requested_bytes} of {quota_bytes} bytes)")]
    QuotaExceeded {
        /// Backend that rejected the write.
        backend: BackendKind,
        /// Bytes the backend would have held after the write.
        requested_bytes: u64,
        /// Backend quota.
        quota_bytes: u64,
    },
    /// A backend could not be reached. Not retried internally.
    #[error("{backend} storage unavailable: {message}")]
    BackendUnavailable {
        /// Backend that failed.
        backend: BackendKind,
        /// Host error text.
        message: String,
    },
    /// A write spanning both backends failed on at least one of them.
    #[error(
        "write failed on {}; persisted on {}",
        describe_failures(.failures),
        describe_backends(.persisted)
    )]
    PartialWrite {
        /// Backends whose share of the write was persisted.
        persisted: Vec<BackendKind>,
        /// Backend-scoped failures.
        failures: Vec<SettingsError>,
    },
    /// A migration step or write failed; the schema version was not bumped.
    #[error("migration to {target} failed: {reason}")]
    MigrationFailed {
        /// Version the migration was heading to.
        target: String,
        /// Failure description.
        reason: String,
    },
    /// An import document failed validation; nothing was written.
    #[error("malformed import document: {0}")]
    MalformedImport(String),
    /// Persisted or imported data comes from an unsupported schema.
    #[error("schema version {found} is not compatible with {supported}")]
    IncompatibleVersion {
        /// Version found in storage or in the document.
        found: String,
        /// Version this runtime writes.
        supported: String,
    },
    /// A persisted value could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl SettingsError {
    /// Maps a host error onto the backend-scoped variants.
    pub fn from_backend(backend: BackendKind, err: BackendError) -> Self {
        match err {
            BackendError::QuotaExceeded {
                requested_bytes,
                quota_bytes,
            } => Self::QuotaExceeded {
                backend,
                requested_bytes,
                quota_bytes,
            },
            BackendError::Unavailable(message) => Self::BackendUnavailable { backend, message },
        }
    }

    /// Backends this error reports as failed.
    pub fn failed_backends(&self) -> Vec<BackendKind> {
        match self {
            Self::QuotaExceeded { backend, .. } | Self::BackendUnavailable { backend, .. } => {
                vec![*backend]
            }
            Self::PartialWrite { failures, .. } => failures
                .iter()
                .flat_map(SettingsError::failed_backends)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Whether any part of the failure is a quota rejection.
    pub fn is_quota_exceeded(&self) -> bool {
        match self {
            Self::QuotaExceeded { .. } => true,
            Self::PartialWrite { failures, .. } => failures.iter().any(Self::is_quota_exceeded),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SettingsError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

fn describe_backends(backends: &[BackendKind]) -> String {
    if backends.is_empty() {
        return "none".to_string();
    }
    backends
        .iter()
        .map(|backend| backend.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_failures(failures: &[SettingsError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
