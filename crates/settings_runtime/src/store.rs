//! Key/value store partitioned over the replicated and local backends.

use std::{fmt, rc::Rc};

use futures::future::join;
use settings_host::{BackendError, SettingsHost, StorageBackend, StorageMap};

use crate::{
    broadcast::ChangeBroadcaster,
    error::SettingsError,
    keys::{BackendAssignment, BackendKind},
};

/// Store that routes every key to the backend the [`BackendAssignment`] names.
///
/// Each backend receives one atomic write for its share of a mapping. The two shares are
/// independent: when one backend fails, the other share is still persisted and the failure is
/// reported as [`SettingsError::PartialWrite`].
pub struct PartitionedStore {
    replicated: Rc<dyn StorageBackend>,
    local: Rc<dyn StorageBackend>,
    assignment: Rc<BackendAssignment>,
    broadcaster: Option<Rc<ChangeBroadcaster>>,
}

impl fmt::Debug for PartitionedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionedStore")
            .field("assignment", &self.assignment)
            .field("broadcasts", &self.broadcaster.is_some())
            .finish_non_exhaustive()
    }
}

impl PartitionedStore {
    /// Creates a store over the host's two backends without hint publishing.
    pub fn new(host: &SettingsHost, assignment: Rc<BackendAssignment>) -> Self {
        Self {
            replicated: host.replicated.clone(),
            local: host.local.clone(),
            assignment,
            broadcaster: None,
        }
    }

    /// Publishes a change record through `broadcaster` after every successful write.
    pub fn with_broadcaster(mut self, broadcaster: Rc<ChangeBroadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Assignment table in use.
    pub fn assignment(&self) -> &BackendAssignment {
        &self.assignment
    }

    /// Backend of the given kind.
    pub fn backend(&self, kind: BackendKind) -> &Rc<dyn StorageBackend> {
        match kind {
            BackendKind::Replicated => &self.replicated,
            BackendKind::Local => &self.local,
        }
    }

    /// Reads `keys` from whichever backend owns each of them. Absent keys are omitted.
    ///
    /// # Errors
    ///
    /// Returns a backend-scoped error when a backend that owns one of the keys fails.
    pub async fn get(&self, keys: &[String]) -> Result<StorageMap, SettingsError> {
        let (replicated_keys, local_keys) = self.assignment.split_keys(keys);
        let (replicated, local) = join(
            self.read_keys(BackendKind::Replicated, &replicated_keys),
            self.read_keys(BackendKind::Local, &local_keys),
        )
        .await;
        let mut merged = replicated?;
        merged.extend(local?);
        Ok(merged)
    }

    /// Reads a single key.
    ///
    /// # Errors
    ///
    /// See [`PartitionedStore::get`].
    pub async fn get_one(&self, key: &str) -> Result<Option<serde_json::Value>, SettingsError> {
        let mut values = self.get(&[key.to_string()]).await?;
        Ok(values.remove(key))
    }

    /// Reads every key of one backend.
    ///
    /// # Errors
    ///
    /// Returns a backend-scoped error when the backend fails.
    pub async fn get_all_from(&self, kind: BackendKind) -> Result<StorageMap, SettingsError> {
        self.backend(kind)
            .get_all()
            .await
            .map_err(|err| SettingsError::from_backend(kind, err))
    }

    /// Reads every key of both backends, keeping them apart.
    ///
    /// # Errors
    ///
    /// Returns a backend-scoped error when either backend fails.
    pub async fn get_all_by_backend(&self) -> Result<(StorageMap, StorageMap), SettingsError> {
        let (replicated, local) = join(
            self.get_all_from(BackendKind::Replicated),
            self.get_all_from(BackendKind::Local),
        )
        .await;
        Ok((replicated?, local?))
    }

    /// Writes `items`, each key to its own backend, then announces every written key.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::QuotaExceeded`] or [`SettingsError::BackendUnavailable`] when
    /// the only involved backend fails, and [`SettingsError::PartialWrite`] when a write spanning
    /// both backends fails on either of them.
    pub async fn set(&self, items: StorageMap) -> Result<(), SettingsError> {
        if items.is_empty() {
            return Ok(());
        }
        let (replicated, local) = self.assignment.split_items(items);
        self.set_shares(replicated, local).await
    }

    /// Writes each share to its own backend as given, without routing keys. Used to put
    /// per-backend snapshots back where they were taken.
    ///
    /// # Errors
    ///
    /// See [`PartitionedStore::set`].
    pub async fn set_shares(
        &self,
        replicated: StorageMap,
        local: StorageMap,
    ) -> Result<(), SettingsError> {
        let announced_replicated = replicated.clone();
        let announced_local = local.clone();

        let (replicated_result, local_result) = join(
            self.write_share(BackendKind::Replicated, replicated),
            self.write_share(BackendKind::Local, local),
        )
        .await;

        if matches!(replicated_result, Some(Ok(()))) {
            self.announce(&announced_replicated);
        }
        if matches!(local_result, Some(Ok(()))) {
            self.announce(&announced_local);
        }
        settle([
            (BackendKind::Replicated, replicated_result),
            (BackendKind::Local, local_result),
        ])
    }

    /// Writes a single key.
    ///
    /// # Errors
    ///
    /// See [`PartitionedStore::set`].
    pub async fn set_one(
        &self,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), SettingsError> {
        let mut items = StorageMap::new();
        items.insert(key.to_string(), value);
        self.set(items).await
    }

    /// Removes `keys` from their owning backends.
    ///
    /// # Errors
    ///
    /// Same shape as [`PartitionedStore::set`].
    pub async fn remove(&self, keys: &[String]) -> Result<(), SettingsError> {
        let (replicated_keys, local_keys) = self.assignment.split_keys(keys);
        let (replicated_result, local_result) = join(
            self.remove_share(BackendKind::Replicated, &replicated_keys),
            self.remove_share(BackendKind::Local, &local_keys),
        )
        .await;
        settle([
            (BackendKind::Replicated, replicated_result),
            (BackendKind::Local, local_result),
        ])
    }

    /// Clears both backends.
    ///
    /// # Errors
    ///
    /// Same shape as [`PartitionedStore::set`].
    pub async fn clear(&self) -> Result<(), SettingsError> {
        let (replicated_result, local_result) =
            join(self.replicated.clear(), self.local.clear()).await;
        settle([
            (BackendKind::Replicated, Some(replicated_result)),
            (BackendKind::Local, Some(local_result)),
        ])
    }

    /// Bytes currently held by one backend.
    ///
    /// # Errors
    ///
    /// Returns a backend-scoped error when the measurement fails.
    pub async fn bytes_in_use(&self, kind: BackendKind) -> Result<u64, SettingsError> {
        self.backend(kind)
            .bytes_in_use()
            .await
            .map_err(|err| SettingsError::from_backend(kind, err))
    }

    async fn read_keys(
        &self,
        kind: BackendKind,
        keys: &[String],
    ) -> Result<StorageMap, SettingsError> {
        if keys.is_empty() {
            return Ok(StorageMap::new());
        }
        self.backend(kind)
            .get(keys)
            .await
            .map_err(|err| SettingsError::from_backend(kind, err))
    }

    async fn write_share(
        &self,
        kind: BackendKind,
        items: StorageMap,
    ) -> Option<Result<(), BackendError>> {
        if items.is_empty() {
            return None;
        }
        let key_count = items.len();
        let result = self.backend(kind).set(items).await;
        match &result {
            Ok(()) => tracing::debug!(backend = %kind, keys = key_count, "settings persisted"),
            Err(err) => tracing::warn!(backend = %kind, error = %err, "settings write rejected"),
        }
        Some(result)
    }

    async fn remove_share(
        &self,
        kind: BackendKind,
        keys: &[String],
    ) -> Option<Result<(), BackendError>> {
        if keys.is_empty() {
            return None;
        }
        Some(self.backend(kind).remove(keys).await)
    }

    fn announce(&self, items: &StorageMap) {
        if let Some(broadcaster) = &self.broadcaster {
            for (key, value) in items {
                broadcaster.publish(key, value);
            }
        }
    }
}

/// Folds per-backend outcomes (`None` = backend not involved) into one result.
fn settle(
    outcomes: [(BackendKind, Option<Result<(), BackendError>>); 2],
) -> Result<(), SettingsError> {
    let mut persisted = Vec::new();
    let mut failures = Vec::new();
    let mut involved = 0;
    for (kind, outcome) in outcomes {
        match outcome {
            None => {}
            Some(Ok(())) => {
                involved += 1;
                persisted.push(kind);
            }
            Some(Err(err)) => {
                involved += 1;
                failures.push(SettingsError::from_backend(kind, err));
            }
        }
    }
    match (failures.len(), involved) {
        (0, _) => Ok(()),
        (1, 1) => Err(failures.remove(0)),
        _ => Err(SettingsError::PartialWrite {
            persisted,
            failures,
        }),
    }
}
