//! Settings synchronization and background rotation for the new-tab page.
//!
//! One [`SettingsRuntime`] runs per open view. It owns:
//!
//! - a [`PartitionedStore`] routing each key to the replicated or the local backend,
//! - a [`ChangeBroadcaster`] merging the broadcast-slot hint with both backend change feeds,
//! - a [`QuotaMonitor`] raising one warning per high-water crossing,
//! - a [`MigrationManager`] that backs up before it mutates,
//! - a [`RotationEngine`] advancing the active background on an owned interval.
//!
//! All host access goes through [`settings_host::SettingsHost`], so the same runtime runs in the
//! browser and against the in-memory installation used by the tests.

#![warn(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod broadcast;
pub mod config;
pub mod error;
pub mod keys;
pub mod migration;
pub mod quota;
pub mod rotation;
pub mod runtime;
pub mod store;
pub mod transfer;

pub use broadcast::{ChangeBroadcaster, ChangeRecord, ChangeSource, SettingChange};
pub use config::{ConfigError, RuntimeConfig};
pub use error::SettingsError;
pub use keys::{AssignmentRule, BackendAssignment, BackendKind, KeyPattern, PayloadClass};
pub use migration::{
    BackupRecord, DefaultsStep, LegacyBackgroundsStep, MigrationManager, MigrationOutcome,
    MigrationStep, ParseVersionError, SchemaVersion, CURRENT_SCHEMA_VERSION,
    INITIAL_SCHEMA_VERSION,
};
pub use quota::{BackendUsage, QuotaMonitor, QuotaStatus, QuotaWarning};
pub use rotation::{
    next_index, ActiveBackground, BackgroundEntry, BackgroundLibrary, BackgroundType,
    IndexSampler, MediaKind, RngIndexSampler, RotationEngine, RotationMode, RotationPolicy,
    RotationSettings, RotationState,
};
pub use runtime::SettingsRuntime;
pub use store::PartitionedStore;
pub use transfer::{parse_import, validate_import, ExportDocument, ImportPlan};
