//! Collaborator-facing facade: one [`SettingsRuntime`] per open view.

use std::{cell::Cell, fmt, rc::Rc};

use serde_json::Value;
use settings_host::{Listener, SettingsHost, StorageMap, SubscriptionId};

use crate::{
    broadcast::{ChangeBroadcaster, SettingChange},
    config::{ConfigError, RuntimeConfig},
    error::SettingsError,
    keys::{BackendAssignment, BackendKind, BACKGROUND_ENTRIES_KEY, CURRENT_BACKGROUND_INDEX_KEY},
    migration::{MigrationManager, MigrationOutcome},
    quota::{QuotaMonitor, QuotaStatus, QuotaWarning},
    rotation::{
        decode_entries, ActiveBackground, BackgroundEntry, BackgroundType, IndexSampler,
        MediaKind, RngIndexSampler, RotationEngine, RotationSettings, RotationState,
    },
    store::PartitionedStore,
    transfer::{parse_import, validate_import, ExportDocument, ImportPlan},
};

/// Settings core of one view: store, broadcaster, quota monitor, migrations, and rotation.
///
/// Call [`SettingsRuntime::start`] once before reading settings. Dropping the runtime (or
/// calling [`SettingsRuntime::teardown`]) clears both timers and detaches every listener.
pub struct SettingsRuntime {
    host: SettingsHost,
    config: RuntimeConfig,
    store: Rc<PartitionedStore>,
    broadcaster: Rc<ChangeBroadcaster>,
    quota: Rc<QuotaMonitor>,
    migration: MigrationManager,
    rotation: Rc<RotationEngine>,
    rotation_feed: Cell<Option<SubscriptionId>>,
    started: Cell<bool>,
}

impl fmt::Debug for SettingsRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsRuntime")
            .field("config", &self.config)
            .field("started", &self.started.get())
            .field("broadcaster", &self.broadcaster)
            .field("quota", &self.quota)
            .field("rotation", &self.rotation)
            .finish_non_exhaustive()
    }
}

impl SettingsRuntime {
    /// Builds a view runtime with a clock-seeded random sampler.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `config` fails validation.
    pub fn new(host: SettingsHost, config: RuntimeConfig) -> Result<Self, ConfigError> {
        let sampler = RngIndexSampler::seeded(host.clock.now_ms());
        Self::new_with_sampler(host, config, Box::new(sampler))
    }

    /// Builds a view runtime with an injected random-mode sampler.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `config` fails validation.
    pub fn new_with_sampler(
        host: SettingsHost,
        config: RuntimeConfig,
        sampler: Box<dyn IndexSampler>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let assignment = Rc::new(BackendAssignment::default());
        let broadcaster = ChangeBroadcaster::attach(&host, assignment.clone());
        let store = Rc::new(
            PartitionedStore::new(&host, assignment).with_broadcaster(broadcaster.clone()),
        );
        let quota = QuotaMonitor::new(
            store.clone(),
            host.timers.clone(),
            host.spawner.clone(),
            config.quota_check_period(),
            config.quota_high_water_ratio,
        );
        let migration =
            MigrationManager::new(store.clone(), host.clock.clone(), config.expected_schema_version);
        let rotation =
            RotationEngine::new(store.clone(), &host, sampler, config.rotation_policy());

        let weak = Rc::downgrade(&rotation);
        let rotation_feed = broadcaster.subscribe(Rc::new(move |change: &SettingChange| {
            if let Some(engine) = weak.upgrade() {
                engine.handle_setting_change(change);
            }
        }));

        Ok(Self {
            host,
            config,
            store,
            broadcaster,
            quota,
            migration,
            rotation,
            rotation_feed: Cell::new(Some(rotation_feed)),
            started: Cell::new(false),
        })
    }

    /// Runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Underlying partitioned store.
    pub fn store(&self) -> &Rc<PartitionedStore> {
        &self.store
    }

    /// Whether [`SettingsRuntime::start`] completed.
    pub fn is_started(&self) -> bool {
        self.started.get()
    }

    /// Runs a pending migration, loads rotation state, steps to the next background when
    /// configured to advance on open, and starts the quota monitor.
    ///
    /// # Errors
    ///
    /// Migration and load failures are returned and leave the runtime unstarted. A failed
    /// advance on open is only logged.
    pub async fn start(&self) -> Result<MigrationOutcome, SettingsError> {
        let outcome = self.migration.run_if_needed().await?;
        self.rotation.load().await?;
        if let Err(err) = self.rotation.advance_on_open().await {
            tracing::warn!(error = %err, "advance on open failed");
        }
        self.quota.start();
        self.started.set(true);
        tracing::info!(?outcome, "settings runtime started");
        Ok(outcome)
    }

    /// Clears the rotation and quota timers and detaches from both change channels. Idempotent.
    pub fn teardown(&self) {
        self.quota.stop();
        self.rotation.teardown();
        if let Some(id) = self.rotation_feed.take() {
            self.broadcaster.unsubscribe(id);
        }
        self.broadcaster.detach();
        if self.started.replace(false) {
            tracing::debug!("settings runtime torn down");
        }
    }

    /// Reads `keys` wherever they live.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn read_settings(&self, keys: &[String]) -> Result<StorageMap, SettingsError> {
        self.store.get(keys).await
    }

    /// Writes `items`. The entry list and index are routed through the rotation engine so they
    /// land in one compound write with a clamped index.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Serialization`] for an undecodable entry list or index, and
    /// propagates store failures.
    pub async fn write_settings(&self, mut items: StorageMap) -> Result<(), SettingsError> {
        let entries = items
            .remove(BACKGROUND_ENTRIES_KEY)
            .map(serde_json::from_value::<Vec<BackgroundEntry>>)
            .transpose()?;
        let index = items
            .remove(CURRENT_BACKGROUND_INDEX_KEY)
            .map(|value| decode_write_index(&value))
            .transpose()?;

        self.store.set(items).await?;
        match (entries, index) {
            (Some(entries), index) => self.rotation.set_entries(entries, index).await,
            (None, Some(index)) => self.rotation.select(index).await.map(|_| ()),
            (None, None) => Ok(()),
        }
    }

    /// Registers a listener for changes arriving on either channel.
    pub fn subscribe(&self, listener: Listener<SettingChange>) -> SubscriptionId {
        self.broadcaster.subscribe(listener)
    }

    /// Removes a change listener.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.broadcaster.unsubscribe(id);
    }

    /// Measures both backends now.
    ///
    /// # Errors
    ///
    /// Propagates measurement failures.
    pub async fn quota_status(&self) -> Result<QuotaStatus, SettingsError> {
        self.quota.measure().await
    }

    /// Status recorded by the last periodic check.
    pub fn last_quota_status(&self) -> Option<QuotaStatus> {
        self.quota.last_status()
    }

    /// Registers a quota warning listener.
    pub fn on_quota_warning(&self, listener: Listener<QuotaWarning>) -> SubscriptionId {
        self.quota.on_warning(listener)
    }

    /// Removes a quota warning listener.
    pub fn off_quota_warning(&self, id: SubscriptionId) {
        self.quota.off_warning(id);
    }

    /// Background to display.
    pub fn active_background(&self) -> ActiveBackground {
        self.rotation.active_background()
    }

    /// Registers an active-background listener.
    pub fn on_background_changed(&self, listener: Listener<ActiveBackground>) -> SubscriptionId {
        self.rotation.on_background_changed(listener)
    }

    /// Removes an active-background listener.
    pub fn off_background_changed(&self, id: SubscriptionId) {
        self.rotation.off_background_changed(id);
    }

    /// Snapshot of rotation state.
    pub fn rotation_state(&self) -> RotationState {
        self.rotation.state()
    }

    /// Appends a background entry.
    ///
    /// # Errors
    ///
    /// See [`RotationEngine::add_entry`].
    pub async fn add_background(
        &self,
        payload_ref: impl Into<String>,
        media_kind: MediaKind,
    ) -> Result<BackgroundEntry, SettingsError> {
        self.rotation.add_entry(payload_ref, media_kind).await
    }

    /// Removes a background entry.
    ///
    /// # Errors
    ///
    /// See [`RotationEngine::remove_entry`].
    pub async fn remove_background(&self, id: &str) -> Result<bool, SettingsError> {
        self.rotation.remove_entry(id).await
    }

    /// Manual "next background".
    ///
    /// # Errors
    ///
    /// See [`RotationEngine::advance`].
    pub async fn next_background(&self) -> Result<Option<usize>, SettingsError> {
        self.rotation.next().await
    }

    /// Jumps to the entry at `index`.
    ///
    /// # Errors
    ///
    /// See [`RotationEngine::select`].
    pub async fn select_background(
        &self,
        index: usize,
    ) -> Result<Option<BackgroundEntry>, SettingsError> {
        self.rotation.select(index).await
    }

    /// Updates rotation settings.
    ///
    /// # Errors
    ///
    /// See [`RotationEngine::set_rotation_settings`].
    pub async fn set_rotation_settings(
        &self,
        settings: RotationSettings,
    ) -> Result<RotationSettings, SettingsError> {
        self.rotation.set_rotation_settings(settings).await
    }

    /// Chooses the background type explicitly.
    ///
    /// # Errors
    ///
    /// See [`RotationEngine::set_background_type`].
    pub async fn set_background_type(
        &self,
        background_type: BackgroundType,
    ) -> Result<(), SettingsError> {
        self.rotation.set_background_type(background_type).await
    }

    /// Runs a pending migration.
    ///
    /// # Errors
    ///
    /// See [`MigrationManager::run_if_needed`].
    pub async fn run_migration_if_needed(&self) -> Result<MigrationOutcome, SettingsError> {
        self.migration.run_if_needed().await
    }

    /// Restores the migration backup and reloads rotation state. Returns `false` without a
    /// backup.
    ///
    /// # Errors
    ///
    /// See [`MigrationManager::restore_from_backup`].
    pub async fn restore_from_backup(&self) -> Result<bool, SettingsError> {
        let restored = self.migration.restore_from_backup().await?;
        if restored {
            self.rotation.load().await?;
        }
        Ok(restored)
    }

    /// Builds an export document of the replicated settings and the entry list.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn export_settings(&self) -> Result<ExportDocument, SettingsError> {
        let settings = self.store.get_all_from(BackendKind::Replicated).await?;
        let entries = self.store.get_one(BACKGROUND_ENTRIES_KEY).await?;
        Ok(ExportDocument::new(
            self.config.expected_schema_version,
            self.host.clock.now_ms(),
            settings,
            decode_entries(entries.as_ref()),
        ))
    }

    /// Export document as pretty JSON.
    ///
    /// # Errors
    ///
    /// See [`SettingsRuntime::export_settings`].
    pub async fn export_settings_json(&self) -> Result<String, SettingsError> {
        self.export_settings().await?.to_json_pretty()
    }

    /// Validates and applies an import document given as JSON text.
    ///
    /// Validation completes before anything is written.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::MalformedImport`] or [`SettingsError::IncompatibleVersion`]
    /// without writing, and propagates store failures from the apply phase.
    pub async fn import_settings(&self, raw: &str) -> Result<(), SettingsError> {
        let plan = parse_import(raw, self.config.expected_schema_version)?;
        self.apply_import(plan).await
    }

    /// Same as [`SettingsRuntime::import_settings`] for an already parsed document.
    ///
    /// # Errors
    ///
    /// See [`SettingsRuntime::import_settings`].
    pub async fn import_document(&self, document: &Value) -> Result<(), SettingsError> {
        let plan = validate_import(document, self.config.expected_schema_version)?;
        self.apply_import(plan).await
    }

    async fn apply_import(&self, plan: ImportPlan) -> Result<(), SettingsError> {
        tracing::info!(
            version = %plan.version,
            keys = plan.settings.len(),
            backgrounds = plan.backgrounds.as_ref().map_or(0, Vec::len),
            "importing settings"
        );
        self.store.set(plan.settings).await?;
        if let Some(backgrounds) = plan.backgrounds {
            self.rotation.set_entries(backgrounds, None).await?;
        }
        Ok(())
    }

    /// Clears both backends and resets rotation to first-run defaults.
    ///
    /// # Errors
    ///
    /// Propagates store failures; rotation state is reset only after the clear succeeded.
    pub async fn reset_all(&self) -> Result<(), SettingsError> {
        self.store.clear().await?;
        self.rotation.reset();
        tracing::info!("all settings reset");
        Ok(())
    }
}

impl Drop for SettingsRuntime {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn decode_write_index(value: &Value) -> Result<usize, SettingsError> {
    value
        .as_u64()
        .and_then(|index| usize::try_from(index).ok())
        .ok_or_else(|| {
            SettingsError::Serialization(format!(
                "{CURRENT_BACKGROUND_INDEX_KEY} must be a non-negative integer, got {value}"
            ))
        })
}
