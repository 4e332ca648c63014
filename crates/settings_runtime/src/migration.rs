//! Schema version tracking, backup-before-mutate migrations, and restore.

use std::{fmt, rc::Rc, str::FromStr};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use settings_host::{Clock, StorageMap};
use thiserror::Error;

use crate::{
    error::SettingsError,
    keys::{BACKGROUND_ENTRIES_KEY, LEGACY_BACKGROUNDS_KEY, MIGRATION_BACKUP_KEY, SCHEMA_VERSION_KEY},
    rotation::BackgroundEntry,
    store::PartitionedStore,
};

/// Version assumed when none has been persisted.
pub const INITIAL_SCHEMA_VERSION: SchemaVersion = SchemaVersion::new(1, 0, 0);
/// Version written by this runtime.
pub const CURRENT_SCHEMA_VERSION: SchemaVersion = SchemaVersion::new(2, 0, 0);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid schema version `{0}`")]
/// A version string that is not `major[.minor[.patch]]`.
pub struct ParseVersionError(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
/// Dotted `major.minor.patch` schema version, ordered numerically.
pub struct SchemaVersion {
    /// Incompatible layout changes.
    pub major: u32,
    /// Additive changes.
    pub minor: u32,
    /// Fixes.
    pub patch: u32,
}

impl SchemaVersion {
    /// Creates a version.
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Whether data written at `self` can be read by a runtime writing `supported`.
    pub fn is_compatible_with(&self, supported: &SchemaVersion) -> bool {
        self.major >= 1 && self.major <= supported.major
    }
}

impl FromStr for SchemaVersion {
    type Err = ParseVersionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseVersionError(raw.to_string());
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid());
        }
        let mut parts = [0u32; 3];
        let mut count = 0;
        for part in trimmed.split('.') {
            if count == parts.len() {
                return Err(invalid());
            }
            parts[count] = part.parse().map_err(|_| invalid())?;
            count += 1;
        }
        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl TryFrom<String> for SchemaVersion {
    type Error = ParseVersionError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<SchemaVersion> for String {
    fn from(version: SchemaVersion) -> Self {
        version.to_string()
    }
}

/// One idempotent upgrade applied to the merged settings snapshot.
pub trait MigrationStep {
    /// Stable step name for logs and errors.
    fn name(&self) -> &str;

    /// Version that includes this step.
    fn target(&self) -> SchemaVersion;

    /// Upgrades `settings` in place. Must never overwrite a key the user has set.
    ///
    /// # Errors
    ///
    /// Returns a description of why the step could not be applied.
    fn apply(&self, settings: &mut StorageMap) -> Result<(), String>;
}

/// Adds default values for keys that are absent.
pub struct DefaultsStep {
    name: String,
    target: SchemaVersion,
    defaults: StorageMap,
}

impl DefaultsStep {
    /// Creates a defaults step.
    pub fn new(name: impl Into<String>, target: SchemaVersion, defaults: StorageMap) -> Self {
        Self {
            name: name.into(),
            target,
            defaults,
        }
    }

    /// Defaults introduced by schema 2.0.0.
    pub fn v2_defaults() -> Self {
        let mut defaults = StorageMap::new();
        defaults.insert("searchEngine".into(), json!("google"));
        defaults.insert("weatherApiKey".into(), json!(""));
        defaults.insert("unsplashApiKey".into(), json!(""));
        defaults.insert("darkMode".into(), json!(false));
        defaults.insert("keyboardShortcutsEnabled".into(), json!(true));
        Self::new("v2-defaults", CURRENT_SCHEMA_VERSION, defaults)
    }
}

impl MigrationStep for DefaultsStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn target(&self) -> SchemaVersion {
        self.target
    }

    fn apply(&self, settings: &mut StorageMap) -> Result<(), String> {
        for (key, value) in &self.defaults {
            if !settings.contains_key(key) {
                settings.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }
}

/// Converts the 1.x `backgrounds` list (`{id, url, type}`) into the entry list.
///
/// Runs only when the entry list is absent. The legacy key is left in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyBackgroundsStep;

impl MigrationStep for LegacyBackgroundsStep {
    fn name(&self) -> &str {
        "legacy-backgrounds"
    }

    fn target(&self) -> SchemaVersion {
        CURRENT_SCHEMA_VERSION
    }

    fn apply(&self, settings: &mut StorageMap) -> Result<(), String> {
        if settings.contains_key(BACKGROUND_ENTRIES_KEY) {
            return Ok(());
        }
        let Some(legacy) = settings.get(LEGACY_BACKGROUNDS_KEY) else {
            return Ok(());
        };
        let Value::Array(items) = legacy else {
            return Err(format!("`{LEGACY_BACKGROUNDS_KEY}` is not a list"));
        };
        let entries: Vec<BackgroundEntry> = items
            .iter()
            .filter_map(|item| match serde_json::from_value(item.clone()) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    tracing::warn!(error = %err, "dropping unreadable legacy background");
                    None
                }
            })
            .collect();
        let encoded = serde_json::to_value(entries).map_err(|err| err.to_string())?;
        settings.insert(BACKGROUND_ENTRIES_KEY.to_string(), encoded);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Snapshot of both backends taken before a migration mutates anything.
pub struct BackupRecord {
    /// Unix milliseconds at snapshot time.
    pub timestamp: u64,
    /// RFC 3339 rendering of `timestamp`.
    pub backup_date: String,
    /// Schema version the snapshot was taken at.
    pub prior_version: SchemaVersion,
    /// Every replicated key.
    pub replicated_snapshot: StorageMap,
    /// Every local key except earlier backups.
    pub local_snapshot: StorageMap,
}

#[derive(Debug, Clone, PartialEq)]
/// Result of [`MigrationManager::run_if_needed`].
pub enum MigrationOutcome {
    /// Persisted version already matches; nothing was touched.
    Current(SchemaVersion),
    /// Migration ran.
    Migrated {
        /// Version before.
        from: SchemaVersion,
        /// Version after.
        to: SchemaVersion,
        /// Names of the applied steps.
        steps: Vec<String>,
    },
}

/// Runs schema migrations against a [`PartitionedStore`].
pub struct MigrationManager {
    store: Rc<PartitionedStore>,
    clock: Rc<dyn Clock>,
    expected: SchemaVersion,
    steps: Vec<Box<dyn MigrationStep>>,
}

impl fmt::Debug for MigrationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationManager")
            .field("expected", &self.expected)
            .field(
                "steps",
                &self.steps.iter().map(|step| step.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Renders unix milliseconds as an RFC 3339 UTC timestamp.
pub fn rfc3339_from_millis(millis: u64) -> String {
    i64::try_from(millis)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl MigrationManager {
    /// Creates a manager with the built-in upgrade steps.
    pub fn new(store: Rc<PartitionedStore>, clock: Rc<dyn Clock>, expected: SchemaVersion) -> Self {
        Self::with_steps(
            store,
            clock,
            expected,
            vec![
                Box::new(DefaultsStep::v2_defaults()),
                Box::new(LegacyBackgroundsStep),
            ],
        )
    }

    /// Creates a manager with a custom ordered step list.
    pub fn with_steps(
        store: Rc<PartitionedStore>,
        clock: Rc<dyn Clock>,
        expected: SchemaVersion,
        steps: Vec<Box<dyn MigrationStep>>,
    ) -> Self {
        Self {
            store,
            clock,
            expected,
            steps,
        }
    }

    /// Version this manager migrates to.
    pub fn expected_version(&self) -> SchemaVersion {
        self.expected
    }

    /// Reads the persisted schema version. Missing or unreadable versions count as `1.0.0`.
    ///
    /// # Errors
    ///
    /// Returns a backend-scoped error when the local backend cannot be read.
    pub async fn persisted_version(&self) -> Result<SchemaVersion, SettingsError> {
        let raw = self.store.get_one(SCHEMA_VERSION_KEY).await?;
        Ok(match raw {
            Some(Value::String(raw)) => raw.parse().unwrap_or_else(|err| {
                tracing::warn!(error = %err, "unreadable schema version; assuming initial");
                INITIAL_SCHEMA_VERSION
            }),
            Some(other) => {
                tracing::warn!(value = %other, "schema version is not a string; assuming initial");
                INITIAL_SCHEMA_VERSION
            }
            None => INITIAL_SCHEMA_VERSION,
        })
    }

    /// Migrates persisted data to the expected version when it is stale.
    ///
    /// Order: snapshot both backends, apply steps to an in-memory copy, persist the backup,
    /// write changed keys, then record the new version. Nothing is written when a step fails,
    /// and the version is never bumped after a failed write.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::IncompatibleVersion`] when the persisted major version is newer
    /// than the expected one, and [`SettingsError::MigrationFailed`] for step or write failures.
    pub async fn run_if_needed(&self) -> Result<MigrationOutcome, SettingsError> {
        let persisted = self.persisted_version().await?;
        if persisted.major > self.expected.major {
            return Err(SettingsError::IncompatibleVersion {
                found: persisted.to_string(),
                supported: self.expected.to_string(),
            });
        }
        if persisted >= self.expected {
            tracing::debug!(version = %persisted, "schema is current");
            return Ok(MigrationOutcome::Current(persisted));
        }

        tracing::info!(from = %persisted, to = %self.expected, "migrating settings schema");
        let target = self.expected.to_string();
        let failed = |reason: String| SettingsError::MigrationFailed {
            target: target.clone(),
            reason,
        };

        let (replicated, mut local) = self
            .store
            .get_all_by_backend()
            .await
            .map_err(|err| failed(err.to_string()))?;
        local.remove(MIGRATION_BACKUP_KEY);

        let mut original = replicated.clone();
        original.extend(local.clone());
        let mut upgraded = original.clone();
        let mut applied = Vec::new();
        for step in &self.steps {
            if step.target() <= persisted || step.target() > self.expected {
                continue;
            }
            step.apply(&mut upgraded)
                .map_err(|reason| failed(format!("step `{}`: {reason}", step.name())))?;
            applied.push(step.name().to_string());
        }

        let timestamp = self.clock.now_ms();
        let backup = BackupRecord {
            timestamp,
            backup_date: rfc3339_from_millis(timestamp),
            prior_version: persisted,
            replicated_snapshot: replicated,
            local_snapshot: local,
        };
        let encoded = serde_json::to_value(&backup).map_err(|err| failed(err.to_string()))?;
        self.store
            .set_one(MIGRATION_BACKUP_KEY, encoded)
            .await
            .map_err(|err| failed(format!("backup: {err}")))?;

        let changed: StorageMap = upgraded
            .into_iter()
            .filter(|(key, value)| original.get(key) != Some(value))
            .collect();
        self.store
            .set(changed)
            .await
            .map_err(|err| failed(format!("write: {err}")))?;
        self.store
            .set_one(SCHEMA_VERSION_KEY, Value::String(target.clone()))
            .await
            .map_err(|err| failed(format!("version: {err}")))?;

        tracing::info!(from = %persisted, to = %self.expected, steps = ?applied, "migration complete");
        Ok(MigrationOutcome::Migrated {
            from: persisted,
            to: self.expected,
            steps: applied,
        })
    }

    /// Loads the stored backup record, if any.
    ///
    /// # Errors
    ///
    /// Returns a backend-scoped error on read failure and [`SettingsError::Serialization`] when
    /// the record cannot be decoded.
    pub async fn latest_backup(&self) -> Result<Option<BackupRecord>, SettingsError> {
        match self.store.get_one(MIGRATION_BACKUP_KEY).await? {
            Some(raw) => Ok(Some(serde_json::from_value(raw)?)),
            None => Ok(None),
        }
    }

    /// Writes every captured pair of the stored backup back through the store.
    ///
    /// The schema version is not rolled back, so it stays monotonic; keys created after the
    /// backup are left alone. Returns `false` when there is no backup.
    ///
    /// # Errors
    ///
    /// Propagates read, decode, and write failures.
    pub async fn restore_from_backup(&self) -> Result<bool, SettingsError> {
        let Some(backup) = self.latest_backup().await? else {
            return Ok(false);
        };
        let mut replicated = backup.replicated_snapshot;
        let mut local = backup.local_snapshot;
        for share in [&mut replicated, &mut local] {
            share.remove(SCHEMA_VERSION_KEY);
            share.remove(MIGRATION_BACKUP_KEY);
        }
        tracing::info!(
            prior_version = %backup.prior_version,
            replicated_keys = replicated.len(),
            local_keys = local.len(),
            "restoring settings from backup"
        );
        self.store.set_shares(replicated, local).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use pretty_assertions::assert_eq;
    use settings_host::{MemoryInstallation, MemoryStorageBackend, StorageBackend};

    use super::*;
    use crate::keys::BackendAssignment;

    fn manager_for(installation: &MemoryInstallation) -> (Rc<PartitionedStore>, MigrationManager) {
        let host = installation.view_host();
        let store = Rc::new(PartitionedStore::new(
            &host,
            Rc::new(BackendAssignment::default()),
        ));
        let manager = MigrationManager::new(store.clone(), host.clock.clone(), CURRENT_SCHEMA_VERSION);
        (store, manager)
    }

    fn map(value: Value) -> StorageMap {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    struct FailingStep;

    impl MigrationStep for FailingStep {
        fn name(&self) -> &str {
            "failing"
        }

        fn target(&self) -> SchemaVersion {
            CURRENT_SCHEMA_VERSION
        }

        fn apply(&self, settings: &mut StorageMap) -> Result<(), String> {
            settings.insert("searchEngine".into(), json!("clobbered"));
            Err("boom".to_string())
        }
    }

    #[test]
    fn schema_versions_parse_and_order_numerically() {
        let parsed: SchemaVersion = "1.5.0".parse().expect("parse");
        assert_eq!(parsed, SchemaVersion::new(1, 5, 0));
        assert_eq!("2".parse::<SchemaVersion>(), Ok(SchemaVersion::new(2, 0, 0)));
        assert!("1.10.0".parse::<SchemaVersion>().expect("parse") > parsed);
        assert!("1.2.3.4".parse::<SchemaVersion>().is_err());
        assert!("v2".parse::<SchemaVersion>().is_err());
        assert_eq!(
            serde_json::to_value(CURRENT_SCHEMA_VERSION).expect("encode"),
            json!("2.0.0")
        );
        assert!(!SchemaVersion::new(3, 0, 0).is_compatible_with(&CURRENT_SCHEMA_VERSION));
        assert!(!SchemaVersion::new(0, 9, 0).is_compatible_with(&CURRENT_SCHEMA_VERSION));
    }

    #[test]
    fn stale_schema_migrates_once_without_clobbering_user_values() {
        let installation = MemoryInstallation::new();
        let (store, manager) = manager_for(&installation);
        block_on(store.set(map(json!({
            "version": "1.5.0",
            "searchEngine": "bing",
        }))))
        .expect("seed");

        let outcome = block_on(manager.run_if_needed()).expect("migrate");
        assert_eq!(
            outcome,
            MigrationOutcome::Migrated {
                from: SchemaVersion::new(1, 5, 0),
                to: CURRENT_SCHEMA_VERSION,
                steps: vec!["v2-defaults".into(), "legacy-backgrounds".into()],
            }
        );
        let replicated = installation.replicated.snapshot();
        assert_eq!(replicated["searchEngine"], json!("bing"));
        assert_eq!(replicated["darkMode"], json!(false));
        assert_eq!(replicated["keyboardShortcutsEnabled"], json!(true));
        assert_eq!(installation.local.snapshot()["version"], json!("2.0.0"));

        let backup = block_on(manager.latest_backup())
            .expect("read backup")
            .expect("backup present");
        assert_eq!(backup.prior_version, SchemaVersion::new(1, 5, 0));
        assert_eq!(
            backup.replicated_snapshot,
            map(json!({"searchEngine": "bing"}))
        );

        let before = installation.local.snapshot();
        assert_eq!(
            block_on(manager.run_if_needed()).expect("second run"),
            MigrationOutcome::Current(CURRENT_SCHEMA_VERSION)
        );
        assert_eq!(installation.local.snapshot(), before);
    }

    #[test]
    fn missing_version_counts_as_initial() {
        let installation = MemoryInstallation::new();
        let (_store, manager) = manager_for(&installation);
        assert_eq!(
            block_on(manager.persisted_version()).expect("version"),
            INITIAL_SCHEMA_VERSION
        );
        assert!(matches!(
            block_on(manager.run_if_needed()).expect("migrate"),
            MigrationOutcome::Migrated { .. }
        ));
    }

    #[test]
    fn newer_major_version_is_incompatible() {
        let installation = MemoryInstallation::new();
        let (store, manager) = manager_for(&installation);
        block_on(store.set_one(SCHEMA_VERSION_KEY, json!("3.1.0"))).expect("seed");
        assert_eq!(
            block_on(manager.run_if_needed()),
            Err(SettingsError::IncompatibleVersion {
                found: "3.1.0".into(),
                supported: "2.0.0".into()
            })
        );
    }

    #[test]
    fn failing_step_leaves_persisted_data_untouched() {
        let installation = MemoryInstallation::new();
        let host = installation.view_host();
        let store = Rc::new(PartitionedStore::new(
            &host,
            Rc::new(BackendAssignment::default()),
        ));
        block_on(store.set(map(json!({"version": "1.0.0", "searchEngine": "bing"}))))
            .expect("seed");
        let replicated_before = installation.replicated.snapshot();
        let local_before = installation.local.snapshot();

        let manager = MigrationManager::with_steps(
            store,
            host.clock.clone(),
            CURRENT_SCHEMA_VERSION,
            vec![Box::new(DefaultsStep::v2_defaults()), Box::new(FailingStep)],
        );
        let err = block_on(manager.run_if_needed()).expect_err("step fails");
        assert!(matches!(err, SettingsError::MigrationFailed { .. }));
        assert_eq!(installation.replicated.snapshot(), replicated_before);
        assert_eq!(installation.local.snapshot(), local_before);
    }

    #[test]
    fn failed_write_does_not_bump_version() {
        let installation = MemoryInstallation::with_backends(
            MemoryStorageBackend::with_quota(60),
            MemoryStorageBackend::local(),
        );
        let (store, manager) = manager_for(&installation);
        block_on(store.set_one(SCHEMA_VERSION_KEY, json!("1.0.0"))).expect("seed");

        let err = block_on(manager.run_if_needed()).expect_err("defaults exceed tiny quota");
        assert!(matches!(err, SettingsError::MigrationFailed { .. }));
        assert_eq!(installation.local.snapshot()["version"], json!("1.0.0"));
        assert!(block_on(manager.latest_backup()).expect("read").is_some());
    }

    #[test]
    fn legacy_backgrounds_become_entries() {
        let installation = MemoryInstallation::new();
        let (store, manager) = manager_for(&installation);
        block_on(store.set(map(json!({
            "version": "1.0.0",
            "backgrounds": [
                {"id": "1", "url": "data:image/png;base64,AA", "type": "gif"},
                {"id": "2", "url": "data:video/mp4;base64,BB", "type": "video"},
                {"nonsense": true},
            ],
        }))))
        .expect("seed");

        block_on(manager.run_if_needed()).expect("migrate");
        let local = installation.local.snapshot();
        assert_eq!(
            local[BACKGROUND_ENTRIES_KEY],
            json!([
                {"id": "1", "payloadRef": "data:image/png;base64,AA", "mediaKind": "image"},
                {"id": "2", "payloadRef": "data:video/mp4;base64,BB", "mediaKind": "video"},
            ])
        );
        assert!(local.contains_key(LEGACY_BACKGROUNDS_KEY));
    }

    #[test]
    fn restore_writes_back_captured_values_but_keeps_version() {
        let installation = MemoryInstallation::new();
        let (store, manager) = manager_for(&installation);
        assert!(!block_on(manager.restore_from_backup()).expect("no backup"));

        block_on(store.set(map(json!({"version": "1.0.0", "backgroundColor": "#111"}))))
            .expect("seed");
        block_on(manager.run_if_needed()).expect("migrate");
        block_on(store.set_one("backgroundColor", json!("#999"))).expect("regression");

        assert!(block_on(manager.restore_from_backup()).expect("restore"));
        assert_eq!(
            installation.replicated.snapshot()["backgroundColor"],
            json!("#111")
        );
        assert_eq!(installation.local.snapshot()["version"], json!("2.0.0"));
    }

    #[test]
    fn restore_puts_each_snapshot_back_into_its_own_backend() {
        let installation = MemoryInstallation::new();
        let (store, manager) = manager_for(&installation);
        block_on(store.set(map(json!({"version": "1.0.0", "backgroundColor": "#111"}))))
            .expect("seed");
        block_on(installation.local.set(map(json!({"backgroundColor": "#local"}))))
            .expect("stray local copy");
        block_on(manager.run_if_needed()).expect("migrate");
        block_on(store.set_one("backgroundColor", json!("#999"))).expect("regression");

        assert!(block_on(manager.restore_from_backup()).expect("restore"));
        assert_eq!(
            installation.replicated.snapshot()["backgroundColor"],
            json!("#111")
        );
        assert_eq!(
            installation.local.snapshot()["backgroundColor"],
            json!("#local")
        );
    }

    #[test]
    fn backup_dates_render_as_rfc3339() {
        assert_eq!(rfc3339_from_millis(0), "1970-01-01T00:00:00.000Z");
        assert_eq!(
            rfc3339_from_millis(1_700_000_000_123),
            "2023-11-14T22:13:20.123Z"
        );
    }
}
