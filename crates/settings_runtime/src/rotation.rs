//! Background rotation: entry library, rotation settings, and the timer-driven engine.
//!
//! The entry list and the current index are one compound value. Every write that touches
//! either goes out as a single store `set` covering both keys, so no view can observe a new
//! list with a stale, out-of-range index.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
    time::Duration,
};

use futures::{lock::Mutex, FutureExt};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use settings_host::{
    Clock, IntervalHandle, Listener, ListenerRegistry, SettingsHost, StorageMap, SubscriptionId,
    TaskSpawner, TimerService,
};

use crate::{
    broadcast::SettingChange,
    error::SettingsError,
    keys::{
        BACKGROUND_ENTRIES_KEY, BACKGROUND_IMAGE_KEY, BACKGROUND_TYPE_KEY, BACKGROUND_VIDEO_KEY,
        CURRENT_BACKGROUND_INDEX_KEY, CYCLING_ENABLED_KEY, CYCLING_INTERVAL_KEY, CYCLING_MODE_KEY,
    },
    store::PartitionedStore,
};

/// Every key the engine reads on load.
pub const ROTATION_KEYS: [&str; 6] = [
    BACKGROUND_ENTRIES_KEY,
    CURRENT_BACKGROUND_INDEX_KEY,
    CYCLING_ENABLED_KEY,
    CYCLING_INTERVAL_KEY,
    CYCLING_MODE_KEY,
    BACKGROUND_TYPE_KEY,
];

const MAX_RESAMPLES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Media kind of a background entry.
pub enum MediaKind {
    /// Still or animated image. `gif` is accepted as an alias.
    #[serde(alias = "gif")]
    Image,
    /// Video.
    Video,
}

impl MediaKind {
    /// Background type that displays this kind.
    pub const fn background_type(self) -> BackgroundType {
        match self {
            Self::Image => BackgroundType::Image,
            Self::Video => BackgroundType::Video,
        }
    }

    /// Key holding the active payload of this kind.
    pub const fn media_key(self) -> &'static str {
        match self {
            Self::Image => BACKGROUND_IMAGE_KEY,
            Self::Video => BACKGROUND_VIDEO_KEY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// One uploaded or selected background.
pub struct BackgroundEntry {
    /// Stable id assigned at creation.
    pub id: String,
    /// Payload reference (data URL or remote URL).
    #[serde(alias = "url")]
    pub payload_ref: String,
    /// Media kind.
    #[serde(alias = "type")]
    pub media_kind: MediaKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// How the next index is chosen.
pub enum RotationMode {
    /// `(current + 1) mod n`.
    #[default]
    Sequential,
    /// Uniform over every index except the current one.
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Kind of background the page shows.
pub enum BackgroundType {
    /// Solid color.
    Color,
    /// Gradient.
    #[default]
    Gradient,
    /// Randomly generated pattern.
    Random,
    /// Image entry.
    Image,
    /// Video entry.
    Video,
}

impl BackgroundType {
    /// Whether this type displays library entries and therefore follows rotation.
    pub const fn rotates(self) -> bool {
        matches!(self, Self::Image | Self::Video)
    }

    /// Persisted token.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Color => "color",
            Self::Gradient => "gradient",
            Self::Random => "random",
            Self::Image => "image",
            Self::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// User-controlled rotation settings.
pub struct RotationSettings {
    /// Whether the timer runs.
    pub enabled: bool,
    /// Timer period in seconds.
    pub interval_seconds: u32,
    /// Index selection mode.
    pub mode: RotationMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// What the presentation layer should display.
pub enum ActiveBackground {
    /// A non-entry background type.
    Static(BackgroundType),
    /// The library entry at `index`.
    Entry {
        /// Index in the library.
        index: usize,
        /// The entry.
        entry: BackgroundEntry,
    },
}

/// Clamps `index` into `[0, len)`; `0` for an empty list.
pub fn clamp_index(index: usize, len: usize) -> usize {
    if len == 0 {
        0
    } else {
        index.min(len - 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Result of removing an entry from a [`BackgroundLibrary`].
pub struct Removal {
    /// Index the entry had.
    pub index: usize,
    /// The removed entry.
    pub entry: BackgroundEntry,
    /// Whether it was the current entry.
    pub was_current: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Ordered entries (the arena) plus the current index into them.
///
/// `current_index < len` whenever the list is non-empty.
pub struct BackgroundLibrary {
    entries: Vec<BackgroundEntry>,
    current_index: usize,
}

impl BackgroundLibrary {
    /// Builds a library, clamping `current_index` into range.
    pub fn new(entries: Vec<BackgroundEntry>, current_index: usize) -> Self {
        let current_index = clamp_index(current_index, entries.len());
        Self {
            entries,
            current_index,
        }
    }

    /// Entries in order.
    pub fn entries(&self) -> &[BackgroundEntry] {
        &self.entries
    }

    /// Current index.
    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// Current entry.
    pub fn current(&self) -> Option<&BackgroundEntry> {
        self.entries.get(self.current_index)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the library is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether an entry with `id` exists.
    pub fn contains_id(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    /// Index of the entry with `id`.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id == id)
    }

    /// Appends an entry and returns its index.
    pub fn push(&mut self, entry: BackgroundEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    /// Removes the entry with `id`.
    ///
    /// Removing the current entry resets the index to `0`; removing an earlier entry shifts the
    /// index down so it keeps pointing at the same entry.
    pub fn remove(&mut self, id: &str) -> Option<Removal> {
        let index = self.position(id)?;
        let entry = self.entries.remove(index);
        let was_current = index == self.current_index;
        if was_current {
            self.current_index = 0;
        } else if index < self.current_index {
            self.current_index -= 1;
        }
        self.current_index = clamp_index(self.current_index, self.entries.len());
        Some(Removal {
            index,
            entry,
            was_current,
        })
    }

    /// Points at `index`, clamped. Returns the effective index.
    pub fn select(&mut self, index: usize) -> usize {
        self.current_index = clamp_index(index, self.entries.len());
        self.current_index
    }

    /// Points at the entry with `id`. Returns `false` when absent.
    pub fn select_id(&mut self, id: &str) -> bool {
        match self.position(id) {
            Some(index) => {
                self.current_index = index;
                true
            }
            None => false,
        }
    }

    /// Replaces the entry list, keeping the index clamped.
    pub fn replace_entries(&mut self, entries: Vec<BackgroundEntry>) {
        self.entries = entries;
        self.current_index = clamp_index(self.current_index, self.entries.len());
    }

    /// Entry ids in order.
    pub fn entry_ids(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.id.clone()).collect()
    }

    /// Both persisted keys, for one compound write.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Serialization`] when the entries cannot be encoded.
    pub fn to_items(&self) -> Result<StorageMap, SettingsError> {
        let mut items = StorageMap::new();
        items.insert(
            BACKGROUND_ENTRIES_KEY.to_string(),
            serde_json::to_value(&self.entries)?,
        );
        items.insert(
            CURRENT_BACKGROUND_INDEX_KEY.to_string(),
            json!(self.current_index),
        );
        Ok(items)
    }
}

/// Source of uniform indices in `[0, len)`.
pub trait IndexSampler {
    /// Returns an index in `[0, len)`. Only called with `len > 1`.
    fn sample(&self, len: usize) -> usize;
}

/// Sampler backed by a seeded [`StdRng`].
pub struct RngIndexSampler {
    rng: RefCell<StdRng>,
}

impl fmt::Debug for RngIndexSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RngIndexSampler").finish_non_exhaustive()
    }
}

impl RngIndexSampler {
    /// Creates a deterministic sampler.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl IndexSampler for RngIndexSampler {
    fn sample(&self, len: usize) -> usize {
        self.rng.borrow_mut().random_range(0..len)
    }
}

/// Computes the index an advance moves to, or `None` when there is nothing to rotate.
///
/// Random mode resamples until the result differs from `current`. A sampler that keeps
/// returning `current` falls back to the sequential successor.
pub fn next_index(
    mode: RotationMode,
    current: usize,
    len: usize,
    sampler: &dyn IndexSampler,
) -> Option<usize> {
    if len <= 1 {
        return None;
    }
    let current = clamp_index(current, len);
    match mode {
        RotationMode::Sequential => Some((current + 1) % len),
        RotationMode::Random => {
            for _ in 0..MAX_RESAMPLES {
                let candidate = sampler.sample(len) % len;
                if candidate != current {
                    return Some(candidate);
                }
            }
            Some((current + 1) % len)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// Rotation defaults and policy knobs.
pub struct RotationPolicy {
    /// Interval used when none is persisted.
    pub default_interval_secs: u32,
    /// Lower bound applied to every interval.
    pub min_interval_secs: u32,
    /// Enable rotation automatically once two entries exist.
    pub auto_enable: bool,
    /// Static type shown when the last entry is removed.
    pub fallback_type: BackgroundType,
    /// Step to the next entry when a view opens with rotation enabled.
    pub advance_on_open: bool,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            default_interval_secs: 30,
            min_interval_secs: 5,
            auto_enable: true,
            fallback_type: BackgroundType::Gradient,
            advance_on_open: true,
        }
    }
}

impl RotationPolicy {
    fn clamp_interval(&self, seconds: u32) -> u32 {
        seconds.max(self.min_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq)]
/// In-memory rotation state of one view.
pub struct RotationState {
    /// Entries and current index.
    pub library: BackgroundLibrary,
    /// Rotation settings.
    pub settings: RotationSettings,
    /// Active background type.
    pub background_type: BackgroundType,
}

impl RotationState {
    /// First-run state.
    pub fn defaults(policy: &RotationPolicy) -> Self {
        Self {
            library: BackgroundLibrary::default(),
            settings: RotationSettings {
                enabled: false,
                interval_seconds: policy.default_interval_secs,
                mode: RotationMode::Sequential,
            },
            background_type: policy.fallback_type,
        }
    }

    /// Decodes persisted values, falling back to defaults for missing or invalid ones.
    ///
    /// The second value is `true` when a persisted index was out of range and got clamped.
    pub fn from_items(items: &StorageMap, policy: &RotationPolicy) -> (Self, bool) {
        let defaults = Self::defaults(policy);
        let entries = decode_entries(items.get(BACKGROUND_ENTRIES_KEY));
        let persisted_index = items
            .get(CURRENT_BACKGROUND_INDEX_KEY)
            .map(|value| decode_index(Some(value)));
        let library = BackgroundLibrary::new(entries, persisted_index.unwrap_or(0));
        let healed = persisted_index.is_some_and(|index| index != library.current_index());
        let state = Self {
            library,
            settings: RotationSettings {
                enabled: items
                    .get(CYCLING_ENABLED_KEY)
                    .and_then(Value::as_bool)
                    .unwrap_or(defaults.settings.enabled),
                interval_seconds: decode_interval(items.get(CYCLING_INTERVAL_KEY), policy),
                mode: decode_or(items.get(CYCLING_MODE_KEY), defaults.settings.mode),
            },
            background_type: decode_or(items.get(BACKGROUND_TYPE_KEY), defaults.background_type),
        };
        (state, healed)
    }

    /// Background the presentation layer should show.
    pub fn active(&self) -> ActiveBackground {
        match self.library.current() {
            Some(entry) if self.background_type.rotates() => ActiveBackground::Entry {
                index: self.library.current_index(),
                entry: entry.clone(),
            },
            _ => ActiveBackground::Static(self.background_type),
        }
    }

    fn timer_key(&self) -> Option<TimerKey> {
        (self.settings.enabled && self.library.len() > 1).then(|| TimerKey {
            interval_secs: self.settings.interval_seconds,
            mode: self.settings.mode,
            entry_ids: self.library.entry_ids(),
        })
    }
}

pub(crate) fn decode_entries(value: Option<&Value>) -> Vec<BackgroundEntry> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| serde_json::from_value(item.clone()).ok())
        .collect()
}

pub(crate) fn decode_index(value: Option<&Value>) -> usize {
    value
        .and_then(Value::as_u64)
        .and_then(|index| usize::try_from(index).ok())
        .unwrap_or(0)
}

fn decode_interval(value: Option<&Value>, policy: &RotationPolicy) -> u32 {
    let seconds = value
        .and_then(Value::as_u64)
        .and_then(|seconds| u32::try_from(seconds).ok())
        .unwrap_or(policy.default_interval_secs);
    policy.clamp_interval(seconds)
}

fn decode_or<T: serde::de::DeserializeOwned>(value: Option<&Value>, fallback: T) -> T {
    value
        .and_then(|value| serde_json::from_value(value.clone()).ok())
        .unwrap_or(fallback)
}

/// Items that make `entry` the displayed background.
fn activation_items(entry: &BackgroundEntry) -> StorageMap {
    let mut items = StorageMap::new();
    items.insert(
        BACKGROUND_TYPE_KEY.to_string(),
        json!(entry.media_kind.background_type().as_str()),
    );
    items.insert(
        entry.media_kind.media_key().to_string(),
        json!(entry.payload_ref),
    );
    items
}

#[derive(Debug, Clone, PartialEq)]
struct TimerKey {
    interval_secs: u32,
    mode: RotationMode,
    entry_ids: Vec<String>,
}

struct ArmedTimer {
    key: TimerKey,
    _handle: IntervalHandle,
}

/// Timer-driven rotation automaton of one view.
///
/// The interval is an owned resource: it exists only while rotation is enabled with more than
/// one entry, and is replaced whenever the interval, mode, or entry list changes.
///
/// Persisting operations run one at a time: each reads the state, writes it, and applies it
/// before the next one starts.
pub struct RotationEngine {
    store: Rc<PartitionedStore>,
    timers: Rc<dyn TimerService>,
    spawner: Rc<dyn TaskSpawner>,
    clock: Rc<dyn Clock>,
    sampler: Box<dyn IndexSampler>,
    policy: RotationPolicy,
    state: RefCell<RotationState>,
    timer: RefCell<Option<ArmedTimer>>,
    mutation: Mutex<()>,
    torn_down: Cell<bool>,
    last_id_stamp: Cell<u64>,
    listeners: ListenerRegistry<ActiveBackground>,
    weak_self: Weak<Self>,
}

impl fmt::Debug for RotationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotationEngine")
            .field("state", &self.state.borrow())
            .field("timer_armed", &self.is_timer_armed())
            .field("torn_down", &self.torn_down.get())
            .field("policy", &self.policy)
            .finish()
    }
}

impl RotationEngine {
    /// Creates an engine with default state; call [`RotationEngine::load`] to read storage.
    pub fn new(
        store: Rc<PartitionedStore>,
        host: &SettingsHost,
        sampler: Box<dyn IndexSampler>,
        policy: RotationPolicy,
    ) -> Rc<Self> {
        Rc::new_cyclic(|weak_self| Self {
            store,
            timers: host.timers.clone(),
            spawner: host.spawner.clone(),
            clock: host.clock.clone(),
            sampler,
            policy,
            state: RefCell::new(RotationState::defaults(&policy)),
            timer: RefCell::new(None),
            mutation: Mutex::new(()),
            torn_down: Cell::new(false),
            last_id_stamp: Cell::new(0),
            listeners: ListenerRegistry::default(),
            weak_self: weak_self.clone(),
        })
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> RotationState {
        self.state.borrow().clone()
    }

    /// Background the presentation layer should show.
    pub fn active_background(&self) -> ActiveBackground {
        self.state.borrow().active()
    }

    /// Registers a listener for active-background changes.
    pub fn on_background_changed(&self, listener: Listener<ActiveBackground>) -> SubscriptionId {
        self.listeners.add(listener)
    }

    /// Removes an active-background listener.
    pub fn off_background_changed(&self, id: SubscriptionId) {
        self.listeners.remove(id);
    }

    /// Whether the rotation interval is currently armed.
    pub fn is_timer_armed(&self) -> bool {
        self.timer.borrow().is_some()
    }

    /// Reads rotation state from storage. An out-of-range index is clamped and written back.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn load(&self) -> Result<(), SettingsError> {
        let _guard = self.mutation.lock().await;
        let keys: Vec<String> = ROTATION_KEYS.iter().map(|key| key.to_string()).collect();
        let items = self.store.get(&keys).await?;
        let (state, healed) = RotationState::from_items(&items, &self.policy);
        let index = state.library.current_index();
        self.update(|current| *current = state);
        if healed {
            tracing::info!(index, "clamped out-of-range background index");
            self.store
                .set_one(CURRENT_BACKGROUND_INDEX_KEY, json!(index))
                .await?;
        }
        Ok(())
    }

    /// Moves to the next entry and persists it. Returns the new index, or `None` when the
    /// advance is a no-op (fewer than two entries, or a non-rotating background type selected).
    ///
    /// # Errors
    ///
    /// Propagates store failures; in-memory state is unchanged on failure.
    pub async fn advance(&self) -> Result<Option<usize>, SettingsError> {
        let _guard = self.mutation.lock().await;
        let (next, entry) = {
            let state = self.state.borrow();
            if !state.background_type.rotates() {
                tracing::debug!(background_type = state.background_type.as_str(), "rotation paused by manual type");
                return Ok(None);
            }
            let Some(next) = next_index(
                state.settings.mode,
                state.library.current_index(),
                state.library.len(),
                self.sampler.as_ref(),
            ) else {
                return Ok(None);
            };
            let Some(entry) = state.library.entries().get(next).cloned() else {
                return Ok(None);
            };
            (next, entry)
        };

        let mut items = activation_items(&entry);
        items.insert(CURRENT_BACKGROUND_INDEX_KEY.to_string(), json!(next));
        self.store.set(items).await?;

        self.update(|state| {
            if state.library.select_id(&entry.id) {
                state.background_type = entry.media_kind.background_type();
            }
        });
        tracing::info!(index = next, id = %entry.id, "background advanced");
        Ok(Some(next))
    }

    /// Manual "next". Same as [`RotationEngine::advance`].
    ///
    /// # Errors
    ///
    /// See [`RotationEngine::advance`].
    pub async fn next(&self) -> Result<Option<usize>, SettingsError> {
        self.advance().await
    }

    /// Advance performed when a view opens: only with rotation enabled and the policy's
    /// `advance_on_open` set.
    ///
    /// # Errors
    ///
    /// See [`RotationEngine::advance`].
    pub async fn advance_on_open(&self) -> Result<Option<usize>, SettingsError> {
        if !self.policy.advance_on_open || !self.state.borrow().settings.enabled {
            return Ok(None);
        }
        self.advance().await
    }

    /// Appends a new entry. The first entry becomes active immediately; reaching two entries
    /// enables rotation when the policy allows it.
    ///
    /// # Errors
    ///
    /// Propagates store failures (for example a local quota rejection of a large payload).
    pub async fn add_entry(
        &self,
        payload_ref: impl Into<String>,
        media_kind: MediaKind,
    ) -> Result<BackgroundEntry, SettingsError> {
        let _guard = self.mutation.lock().await;
        let (library, entry, activate, enable) = {
            let state = self.state.borrow();
            let mut library = state.library.clone();
            let entry = BackgroundEntry {
                id: self.fresh_id(&library),
                payload_ref: payload_ref.into(),
                media_kind,
            };
            let activate = library.is_empty();
            library.push(entry.clone());
            let enable = self.policy.auto_enable && !state.settings.enabled && library.len() >= 2;
            (library, entry, activate, enable)
        };

        let mut items = library.to_items()?;
        if activate {
            items.extend(activation_items(&entry));
        }
        if enable {
            items.insert(CYCLING_ENABLED_KEY.to_string(), json!(true));
        }
        self.store.set(items).await?;

        self.update(|state| {
            state.library = library;
            if activate {
                state.background_type = media_kind.background_type();
            }
            if enable {
                state.settings.enabled = true;
            }
        });
        tracing::info!(id = %entry.id, kind = ?media_kind, "background entry added");
        Ok(entry)
    }

    /// Removes the entry with `id`. Returns `false` when it does not exist.
    ///
    /// When the removed entry was displayed, index 0 of the remaining entries is activated, or
    /// the fallback type when none remain.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn remove_entry(&self, id: &str) -> Result<bool, SettingsError> {
        let _guard = self.mutation.lock().await;
        let (library, removal, background_type) = {
            let state = self.state.borrow();
            let mut library = state.library.clone();
            let Some(removal) = library.remove(id) else {
                return Ok(false);
            };
            (library, removal, state.background_type)
        };

        let mut items = library.to_items()?;
        let mut new_type = None;
        if removal.was_current && background_type.rotates() {
            match library.current() {
                Some(entry) => {
                    items.extend(activation_items(entry));
                    new_type = Some(entry.media_kind.background_type());
                }
                None => {
                    items.insert(
                        BACKGROUND_TYPE_KEY.to_string(),
                        json!(self.policy.fallback_type.as_str()),
                    );
                    new_type = Some(self.policy.fallback_type);
                }
            }
        }
        self.store.set(items).await?;

        self.update(|state| {
            state.library = library;
            if let Some(background_type) = new_type {
                state.background_type = background_type;
            }
        });
        tracing::info!(id, index = removal.index, "background entry removed");
        Ok(true)
    }

    /// Replaces the whole entry list (import, collaborator writes). `index` defaults to the
    /// current index; either way it is clamped and written together with the list.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn set_entries(
        &self,
        entries: Vec<BackgroundEntry>,
        index: Option<usize>,
    ) -> Result<(), SettingsError> {
        let _guard = self.mutation.lock().await;
        let (library, background_type) = {
            let state = self.state.borrow();
            let index = index.unwrap_or(state.library.current_index());
            (BackgroundLibrary::new(entries, index), state.background_type)
        };
        let mut items = library.to_items()?;
        if background_type.rotates() {
            if let Some(entry) = library.current() {
                items.extend(activation_items(entry));
            }
        }
        self.store.set(items).await?;
        self.update(|state| state.library = library);
        Ok(())
    }

    /// Persists rotation settings, clamping the interval to the policy minimum.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn set_rotation_settings(
        &self,
        settings: RotationSettings,
    ) -> Result<RotationSettings, SettingsError> {
        let _guard = self.mutation.lock().await;
        let settings = RotationSettings {
            interval_seconds: self.policy.clamp_interval(settings.interval_seconds),
            ..settings
        };
        let mut items = StorageMap::new();
        items.insert(CYCLING_ENABLED_KEY.to_string(), json!(settings.enabled));
        items.insert(
            CYCLING_INTERVAL_KEY.to_string(),
            json!(settings.interval_seconds),
        );
        items.insert(CYCLING_MODE_KEY.to_string(), serde_json::to_value(settings.mode)?);
        self.store.set(items).await?;
        self.update(|state| state.settings = settings);
        Ok(settings)
    }

    /// Persists an explicit background type choice.
    ///
    /// Choosing a non-rotating type pauses rotation without tearing the timer down. Choosing
    /// an entry type re-activates the current entry.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn set_background_type(
        &self,
        background_type: BackgroundType,
    ) -> Result<(), SettingsError> {
        let _guard = self.mutation.lock().await;
        let current = self.state.borrow().library.current().cloned();
        let (items, effective) = match current {
            Some(entry) if background_type.rotates() => (
                activation_items(&entry),
                entry.media_kind.background_type(),
            ),
            _ => {
                let mut items = StorageMap::new();
                items.insert(
                    BACKGROUND_TYPE_KEY.to_string(),
                    json!(background_type.as_str()),
                );
                (items, background_type)
            }
        };
        self.store.set(items).await?;
        self.update(|state| state.background_type = effective);
        Ok(())
    }

    /// Activates the entry at `index` (clamped). Returns `None` for an empty library.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn select(&self, index: usize) -> Result<Option<BackgroundEntry>, SettingsError> {
        let _guard = self.mutation.lock().await;
        let target = {
            let state = self.state.borrow();
            let index = clamp_index(index, state.library.len());
            state
                .library
                .entries()
                .get(index)
                .cloned()
                .map(|entry| (index, entry))
        };
        let Some((index, entry)) = target else {
            return Ok(None);
        };
        let mut items = activation_items(&entry);
        items.insert(CURRENT_BACKGROUND_INDEX_KEY.to_string(), json!(index));
        self.store.set(items).await?;
        self.update(|state| {
            if state.library.select_id(&entry.id) {
                state.background_type = entry.media_kind.background_type();
            }
        });
        Ok(Some(entry))
    }

    /// Applies a change observed on the broadcaster (this or another view's write).
    pub fn handle_setting_change(&self, change: &SettingChange) {
        let value = change.new_value.as_ref();
        match change.key.as_str() {
            BACKGROUND_ENTRIES_KEY => {
                let entries = decode_entries(value);
                self.update(|state| state.library.replace_entries(entries));
            }
            CURRENT_BACKGROUND_INDEX_KEY => {
                let index = decode_index(value);
                self.update(|state| {
                    state.library.select(index);
                });
            }
            CYCLING_ENABLED_KEY => {
                let enabled = value.and_then(Value::as_bool).unwrap_or(false);
                self.update(|state| state.settings.enabled = enabled);
            }
            CYCLING_INTERVAL_KEY => {
                let seconds = decode_interval(value, &self.policy);
                self.update(|state| state.settings.interval_seconds = seconds);
            }
            CYCLING_MODE_KEY => {
                let mode = decode_or(value, RotationMode::default());
                self.update(|state| state.settings.mode = mode);
            }
            BACKGROUND_TYPE_KEY => {
                let background_type = decode_or(value, self.policy.fallback_type);
                self.update(|state| state.background_type = background_type);
            }
            _ => {}
        }
    }

    /// Resets in-memory state to first-run defaults and tears the timer down.
    pub fn reset(&self) {
        let defaults = RotationState::defaults(&self.policy);
        self.update(|state| *state = defaults);
    }

    /// Cancels the rotation timer for good. Later state changes, including advances already
    /// queued by a tick, no longer arm it.
    pub fn teardown(&self) {
        self.torn_down.set(true);
        let armed = self.timer.borrow_mut().take();
        drop(armed);
    }

    /// Millisecond stamp, strictly increasing per engine and unused in `library`.
    fn fresh_id(&self, library: &BackgroundLibrary) -> String {
        let mut stamp = self
            .clock
            .now_ms()
            .max(self.last_id_stamp.get().saturating_add(1));
        while library.contains_id(&stamp.to_string()) {
            stamp += 1;
        }
        self.last_id_stamp.set(stamp);
        stamp.to_string()
    }

    /// Single mutation path: re-arms the timer and announces the active background on change.
    fn update(&self, mutate: impl FnOnce(&mut RotationState)) {
        let (before, after, timer_key) = {
            let mut state = self.state.borrow_mut();
            let before = state.active();
            mutate(&mut state);
            (before, state.active(), state.timer_key())
        };
        self.rearm(timer_key);
        if before != after {
            self.listeners.emit(&after);
        }
    }

    fn rearm(&self, key: Option<TimerKey>) {
        let key = key.filter(|_| !self.torn_down.get());
        let previous = {
            let mut timer = self.timer.borrow_mut();
            match key {
                None => timer.take(),
                Some(key) => {
                    if timer.as_ref().is_some_and(|armed| armed.key == key) {
                        return;
                    }
                    let weak = self.weak_self.clone();
                    let handle = self.timers.set_interval(
                        Duration::from_secs(u64::from(key.interval_secs)),
                        Rc::new(move || {
                            if let Some(engine) = weak.upgrade() {
                                engine.spawn_advance();
                            }
                        }),
                    );
                    tracing::debug!(interval_secs = key.interval_secs, mode = ?key.mode, "rotation timer armed");
                    timer.replace(ArmedTimer {
                        key,
                        _handle: handle,
                    })
                }
            }
        };
        drop(previous);
    }

    fn spawn_advance(&self) {
        if self.torn_down.get() {
            return;
        }
        let Some(engine) = self.weak_self.upgrade() else {
            return;
        };
        self.spawner.spawn_local(
            async move {
                if engine.torn_down.get() {
                    return;
                }
                if let Err(err) = engine.advance().await {
                    tracing::warn!(error = %err, "scheduled background advance failed");
                }
            }
            .boxed_local(),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::Cell,
        future::Future,
        pin::Pin,
        task::{Context, Poll},
    };

    use futures::future::join;
    use pretty_assertions::assert_eq;
    use settings_host::{
        BackendError, BackendFuture, ChangeListener, MemoryInstallation, MemoryStorageBackend,
        StorageBackend,
    };

    use super::*;
    use crate::keys::BackendAssignment;

    /// Pending once, then ready; lets a concurrent future run in between.
    struct YieldOnce(bool);

    impl Future for YieldOnce {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.0 {
                return Poll::Ready(());
            }
            self.0 = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }

    /// Memory backend whose writes suspend once before they land.
    struct YieldingBackend(MemoryStorageBackend);

    impl StorageBackend for YieldingBackend {
        fn get<'a>(
            &'a self,
            keys: &'a [String],
        ) -> BackendFuture<'a, Result<StorageMap, BackendError>> {
            self.0.get(keys)
        }

        fn get_all<'a>(&'a self) -> BackendFuture<'a, Result<StorageMap, BackendError>> {
            self.0.get_all()
        }

        fn set<'a>(&'a self, items: StorageMap) -> BackendFuture<'a, Result<(), BackendError>> {
            Box::pin(async move {
                YieldOnce(false).await;
                self.0.set(items).await
            })
        }

        fn remove<'a>(&'a self, keys: &'a [String]) -> BackendFuture<'a, Result<(), BackendError>> {
            self.0.remove(keys)
        }

        fn clear<'a>(&'a self) -> BackendFuture<'a, Result<(), BackendError>> {
            self.0.clear()
        }

        fn bytes_in_use<'a>(&'a self) -> BackendFuture<'a, Result<u64, BackendError>> {
            self.0.bytes_in_use()
        }

        fn quota_bytes(&self) -> u64 {
            self.0.quota_bytes()
        }

        fn subscribe(&self, listener: ChangeListener) -> SubscriptionId {
            self.0.subscribe(listener)
        }

        fn unsubscribe(&self, id: SubscriptionId) {
            self.0.unsubscribe(id);
        }
    }

    struct ScriptedSampler {
        script: Vec<usize>,
        cursor: Cell<usize>,
    }

    impl ScriptedSampler {
        fn new(script: Vec<usize>) -> Self {
            Self {
                script,
                cursor: Cell::new(0),
            }
        }
    }

    impl IndexSampler for ScriptedSampler {
        fn sample(&self, _len: usize) -> usize {
            let at = self.cursor.get();
            self.cursor.set(at + 1);
            self.script[at % self.script.len()]
        }
    }

    fn entry(id: &str) -> BackgroundEntry {
        BackgroundEntry {
            id: id.to_string(),
            payload_ref: format!("data:image/png;base64,{id}"),
            media_kind: MediaKind::Image,
        }
    }

    fn engine_for(installation: &MemoryInstallation) -> Rc<RotationEngine> {
        engine_on(installation.view_host())
    }

    fn yielding_engine_for(installation: &MemoryInstallation) -> Rc<RotationEngine> {
        let mut host = installation.view_host();
        host.replicated = Rc::new(YieldingBackend(installation.replicated.clone()));
        host.local = Rc::new(YieldingBackend(installation.local.clone()));
        engine_on(host)
    }

    fn engine_on(host: SettingsHost) -> Rc<RotationEngine> {
        let store = Rc::new(PartitionedStore::new(
            &host,
            Rc::new(BackendAssignment::default()),
        ));
        RotationEngine::new(
            store,
            &host,
            Box::new(RngIndexSampler::seeded(7)),
            RotationPolicy::default(),
        )
    }

    #[test]
    fn sequential_next_index_wraps() {
        let sampler = RngIndexSampler::seeded(1);
        assert_eq!(next_index(RotationMode::Sequential, 0, 3, &sampler), Some(1));
        assert_eq!(next_index(RotationMode::Sequential, 2, 3, &sampler), Some(0));
        assert_eq!(next_index(RotationMode::Sequential, 0, 1, &sampler), None);
        assert_eq!(next_index(RotationMode::Random, 0, 0, &sampler), None);
    }

    #[test]
    fn random_next_index_never_repeats_current() {
        let sampler = RngIndexSampler::seeded(42);
        for len in 2..6 {
            let mut current = 0;
            for _ in 0..500 {
                let next = next_index(RotationMode::Random, current, len, &sampler)
                    .expect("rotates with more than one entry");
                assert_ne!(next, current);
                assert!(next < len);
                current = next;
            }
        }
    }

    #[test]
    fn random_mode_resamples_until_different() {
        let sampler = ScriptedSampler::new(vec![1, 1, 1, 2]);
        assert_eq!(next_index(RotationMode::Random, 1, 3, &sampler), Some(2));

        let stuck = ScriptedSampler::new(vec![0]);
        assert_eq!(next_index(RotationMode::Random, 0, 2, &stuck), Some(1));
    }

    #[test]
    fn library_removal_keeps_index_on_same_entry() {
        let mut library = BackgroundLibrary::new(vec![entry("a"), entry("b"), entry("c")], 2);
        let removal = library.remove("a").expect("present");
        assert!(!removal.was_current);
        assert_eq!(library.current().map(|e| e.id.as_str()), Some("c"));

        let mut library = BackgroundLibrary::new(vec![entry("a"), entry("b"), entry("c")], 1);
        let removal = library.remove("b").expect("present");
        assert!(removal.was_current);
        assert_eq!(library.current_index(), 0);
        assert_eq!(library.entry_ids(), vec!["a".to_string(), "c".to_string()]);

        assert_eq!(library.remove("zzz"), None);
        assert_eq!(BackgroundLibrary::new(vec![entry("a")], 9).current_index(), 0);
    }

    #[test]
    fn entries_decode_legacy_gif_and_url_fields() {
        let decoded: BackgroundEntry = serde_json::from_value(json!({
            "id": "1700000000000",
            "url": "data:image/gif;base64,R0lG",
            "type": "gif",
        }))
        .expect("decode legacy entry");
        assert_eq!(decoded.media_kind, MediaKind::Image);
        assert_eq!(decoded.payload_ref, "data:image/gif;base64,R0lG");
    }

    #[test]
    fn load_clamps_and_persists_out_of_range_index() {
        let installation = MemoryInstallation::new();
        let engine = engine_for(&installation);
        let mut seed = BackgroundLibrary::new(vec![entry("a"), entry("b")], 0)
            .to_items()
            .expect("encode");
        seed.insert(CURRENT_BACKGROUND_INDEX_KEY.into(), json!(7));
        installation
            .block_on(engine.store.set(seed))
            .expect("seed");

        installation.block_on(engine.load()).expect("load");
        assert_eq!(engine.state().library.current_index(), 1);
        assert_eq!(
            installation.local.snapshot()[CURRENT_BACKGROUND_INDEX_KEY],
            json!(1)
        );
    }

    #[test]
    fn first_entry_activates_and_second_enables_rotation() {
        let installation = MemoryInstallation::new();
        let engine = engine_for(&installation);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        engine.on_background_changed(Rc::new(move |active: &ActiveBackground| {
            sink.borrow_mut().push(active.clone())
        }));

        let first = installation
            .block_on(engine.add_entry("data:image/png;base64,AA", MediaKind::Image))
            .expect("add first");
        assert_eq!(
            engine.active_background(),
            ActiveBackground::Entry {
                index: 0,
                entry: first.clone()
            }
        );
        assert!(!engine.is_timer_armed());
        assert_eq!(
            installation.replicated.snapshot()[BACKGROUND_TYPE_KEY],
            json!("image")
        );

        installation.clock.advance_ms(1);
        let second = installation
            .block_on(engine.add_entry("data:video/mp4;base64,BB", MediaKind::Video))
            .expect("add second");
        assert_ne!(first.id, second.id);
        assert!(engine.state().settings.enabled);
        assert!(engine.is_timer_armed());
        assert_eq!(
            installation.replicated.snapshot()[CYCLING_ENABLED_KEY],
            json!(true)
        );
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn timer_advances_sequentially_and_persists() {
        let installation = MemoryInstallation::new();
        let engine = engine_for(&installation);
        for payload in ["a", "b", "c"] {
            installation
                .block_on(engine.add_entry(payload, MediaKind::Image))
                .expect("add");
        }
        assert_eq!(
            installation.timers.active_periods(),
            vec![Duration::from_secs(30)]
        );

        installation.advance(Duration::from_secs(30));
        assert_eq!(engine.state().library.current_index(), 1);
        installation.advance(Duration::from_secs(60));
        assert_eq!(engine.state().library.current_index(), 0);
        let local = installation.local.snapshot();
        assert_eq!(local[CURRENT_BACKGROUND_INDEX_KEY], json!(0));
        assert_eq!(local[BACKGROUND_IMAGE_KEY], json!("a"));
    }

    #[test]
    fn manual_type_override_pauses_advance_but_keeps_timer() {
        let installation = MemoryInstallation::new();
        let engine = engine_for(&installation);
        installation
            .block_on(engine.add_entry("a", MediaKind::Image))
            .expect("add");
        installation
            .block_on(engine.add_entry("b", MediaKind::Image))
            .expect("add");
        installation
            .block_on(engine.set_background_type(BackgroundType::Color))
            .expect("override");

        assert_eq!(installation.block_on(engine.advance()).expect("advance"), None);
        assert!(engine.is_timer_armed());
        assert_eq!(
            engine.active_background(),
            ActiveBackground::Static(BackgroundType::Color)
        );

        installation
            .block_on(engine.set_background_type(BackgroundType::Image))
            .expect("back to image");
        assert_eq!(installation.block_on(engine.advance()).expect("advance"), Some(1));
    }

    #[test]
    fn removing_active_middle_entry_reactivates_first() {
        let installation = MemoryInstallation::new();
        let engine = engine_for(&installation);
        let ids: Vec<String> = ["A", "B", "C"]
            .into_iter()
            .map(|payload| {
                installation.clock.advance_ms(1);
                installation
                    .block_on(engine.add_entry(payload, MediaKind::Image))
                    .expect("add")
                    .id
            })
            .collect();
        installation.block_on(engine.select(1)).expect("select B");

        assert!(installation
            .block_on(engine.remove_entry(&ids[1]))
            .expect("remove"));
        let state = engine.state();
        assert_eq!(
            state
                .library
                .entries()
                .iter()
                .map(|entry| entry.payload_ref.as_str())
                .collect::<Vec<_>>(),
            vec!["A", "C"]
        );
        assert_eq!(state.library.current_index(), 0);
        assert_eq!(
            installation.local.snapshot()[BACKGROUND_IMAGE_KEY],
            json!("A")
        );
    }

    #[test]
    fn removing_last_entry_falls_back_and_tears_timer_down() {
        let installation = MemoryInstallation::new();
        let engine = engine_for(&installation);
        let a = installation
            .block_on(engine.add_entry("a", MediaKind::Image))
            .expect("add");
        installation.clock.advance_ms(1);
        let b = installation
            .block_on(engine.add_entry("b", MediaKind::Image))
            .expect("add");
        assert!(engine.is_timer_armed());

        installation.block_on(engine.remove_entry(&b.id)).expect("remove b");
        assert!(!engine.is_timer_armed());
        installation.block_on(engine.remove_entry(&a.id)).expect("remove a");
        assert_eq!(
            engine.active_background(),
            ActiveBackground::Static(BackgroundType::Gradient)
        );
        assert_eq!(installation.timers.active_intervals(), 0);
    }

    #[test]
    fn rotation_settings_clamp_interval_and_rearm() {
        let installation = MemoryInstallation::new();
        let engine = engine_for(&installation);
        installation
            .block_on(engine.set_entries(vec![entry("a"), entry("b"), entry("c")], Some(0)))
            .expect("entries");
        let applied = installation
            .block_on(engine.set_rotation_settings(RotationSettings {
                enabled: true,
                interval_seconds: 1,
                mode: RotationMode::Random,
            }))
            .expect("settings");
        assert_eq!(applied.interval_seconds, 5);
        assert_eq!(
            installation.timers.active_periods(),
            vec![Duration::from_secs(5)]
        );

        installation
            .block_on(engine.set_rotation_settings(RotationSettings {
                enabled: false,
                ..applied
            }))
            .expect("disable");
        assert_eq!(installation.timers.active_intervals(), 0);
    }

    #[test]
    fn remote_changes_update_state_and_clamp_index() {
        let installation = MemoryInstallation::new();
        let engine = engine_for(&installation);
        installation
            .block_on(engine.set_entries(vec![entry("a"), entry("b"), entry("c")], Some(2)))
            .expect("entries");

        engine.handle_setting_change(&SettingChange {
            key: BACKGROUND_ENTRIES_KEY.into(),
            new_value: Some(json!([entry("a")])),
            source: crate::broadcast::ChangeSource::Hint,
        });
        assert_eq!(engine.state().library.current_index(), 0);

        engine.handle_setting_change(&SettingChange {
            key: CYCLING_INTERVAL_KEY.into(),
            new_value: Some(json!(2)),
            source: crate::broadcast::ChangeSource::Hint,
        });
        assert_eq!(engine.state().settings.interval_seconds, 5);
    }

    #[test]
    fn reset_releases_the_timer() {
        let installation = MemoryInstallation::new();
        let engine = engine_for(&installation);
        for payload in ["a", "b"] {
            installation
                .block_on(engine.add_entry(payload, MediaKind::Image))
                .expect("add");
        }
        assert!(engine.is_timer_armed());

        engine.reset();
        assert!(!engine.is_timer_armed());
        assert_eq!(engine.state(), RotationState::defaults(&RotationPolicy::default()));
    }

    #[test]
    fn teardown_keeps_the_timer_down_for_later_changes() {
        let installation = MemoryInstallation::new();
        let engine = engine_for(&installation);
        for payload in ["a", "b"] {
            installation
                .block_on(engine.add_entry(payload, MediaKind::Image))
                .expect("add");
        }
        engine.teardown();
        assert_eq!(installation.timers.active_intervals(), 0);

        installation
            .block_on(engine.add_entry("c", MediaKind::Image))
            .expect("add");
        assert!(!engine.is_timer_armed());
        assert_eq!(installation.timers.active_intervals(), 0);
    }

    #[test]
    fn tick_queued_before_teardown_neither_advances_nor_rearms() {
        let installation = MemoryInstallation::new();
        let engine = engine_for(&installation);
        for payload in ["a", "b"] {
            installation
                .block_on(engine.add_entry(payload, MediaKind::Image))
                .expect("add");
        }

        installation.timers.advance(Duration::from_secs(30));
        engine.teardown();
        installation.run_until_stalled();

        assert_eq!(installation.timers.active_intervals(), 0);
        assert_eq!(engine.state().library.current_index(), 0);
        assert_eq!(
            installation.local.snapshot()[CURRENT_BACKGROUND_INDEX_KEY],
            json!(0)
        );
    }

    #[test]
    fn overlapping_remove_and_advance_keep_index_in_range() {
        let installation = MemoryInstallation::new();
        let engine = yielding_engine_for(&installation);
        installation
            .block_on(engine.set_entries(vec![entry("a"), entry("b"), entry("c")], Some(1)))
            .expect("entries");
        installation
            .block_on(engine.set_background_type(BackgroundType::Image))
            .expect("show entries");

        let (removed, advanced) =
            installation.block_on(join(engine.remove_entry("c"), engine.advance()));

        assert!(removed.expect("remove"));
        assert_eq!(advanced.expect("advance"), Some(0));
        let local = installation.local.snapshot();
        let entries = decode_entries(local.get(BACKGROUND_ENTRIES_KEY));
        let index = decode_index(local.get(CURRENT_BACKGROUND_INDEX_KEY));
        assert_eq!(entries, vec![entry("a"), entry("b")]);
        assert_eq!(index, 0);
        assert_eq!(local[BACKGROUND_IMAGE_KEY], json!(entry("a").payload_ref));
        assert_eq!(
            engine.active_background(),
            ActiveBackground::Entry {
                index: 0,
                entry: entry("a")
            }
        );
    }

    #[test]
    fn overlapping_adds_keep_both_entries_with_distinct_ids() {
        let installation = MemoryInstallation::new();
        let engine = yielding_engine_for(&installation);

        let (x, y) = installation.block_on(join(
            engine.add_entry("x", MediaKind::Image),
            engine.add_entry("y", MediaKind::Image),
        ));
        let (x, y) = (x.expect("add x"), y.expect("add y"));

        assert_ne!(x.id, y.id);
        let persisted = decode_entries(installation.local.snapshot().get(BACKGROUND_ENTRIES_KEY));
        assert_eq!(persisted, vec![x, y]);
        assert_eq!(engine.state().library.len(), 2);
    }

    #[test]
    fn ids_stay_unique_within_one_millisecond() {
        let installation = MemoryInstallation::new();
        let engine = engine_for(&installation);
        let first = installation
            .block_on(engine.add_entry("a", MediaKind::Image))
            .expect("add");
        installation
            .block_on(engine.remove_entry(&first.id))
            .expect("remove");
        let second = installation
            .block_on(engine.add_entry("b", MediaKind::Image))
            .expect("add");

        assert_ne!(first.id, second.id);
    }

    #[test]
    fn advance_on_open_needs_rotation_enabled_and_policy() {
        let installation = MemoryInstallation::new();
        let engine = engine_for(&installation);
        installation
            .block_on(engine.set_entries(vec![entry("a"), entry("b"), entry("c")], Some(0)))
            .expect("entries");
        installation
            .block_on(engine.set_background_type(BackgroundType::Image))
            .expect("show entries");
        assert_eq!(
            installation.block_on(engine.advance_on_open()).expect("disabled"),
            None
        );

        let settings = engine.state().settings;
        installation
            .block_on(engine.set_rotation_settings(RotationSettings {
                enabled: true,
                ..settings
            }))
            .expect("enable");
        assert_eq!(
            installation.block_on(engine.advance_on_open()).expect("open"),
            Some(1)
        );
    }
}
