//! Persisted key names and the key-to-backend assignment table.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use settings_host::StorageMap;

/// Active background kind (`color`, `gradient`, `random`, `image`, `video`).
pub const BACKGROUND_TYPE_KEY: &str = "backgroundType";
/// Solid background color.
pub const BACKGROUND_COLOR_KEY: &str = "backgroundColor";
/// Active image payload (usually a data URL).
pub const BACKGROUND_IMAGE_KEY: &str = "backgroundImage";
/// Active video payload.
pub const BACKGROUND_VIDEO_KEY: &str = "backgroundVideo";
/// Gradient stop colors.
pub const GRADIENT_COLORS_KEY: &str = "gradientColors";
/// Gradient direction.
pub const GRADIENT_DIRECTION_KEY: &str = "gradientDirection";
/// Ordered background entry list.
pub const BACKGROUND_ENTRIES_KEY: &str = "backgroundEntries";
/// Index of the active entry in [`BACKGROUND_ENTRIES_KEY`].
pub const CURRENT_BACKGROUND_INDEX_KEY: &str = "currentBackgroundIndex";
/// Rotation enabled flag.
pub const CYCLING_ENABLED_KEY: &str = "cyclingEnabled";
/// Rotation interval in seconds.
pub const CYCLING_INTERVAL_KEY: &str = "cyclingInterval";
/// Rotation mode (`sequential` or `random`).
pub const CYCLING_MODE_KEY: &str = "cyclingMode";
/// Last applied schema version.
pub const SCHEMA_VERSION_KEY: &str = "version";
/// Pre-migration backup record.
pub const MIGRATION_BACKUP_KEY: &str = "migration_backup";
/// Background list written by schema 1.x installations.
pub const LEGACY_BACKGROUNDS_KEY: &str = "backgrounds";
/// Error log ring.
pub const ERROR_LOG_KEY: &str = "errorLogs";
/// Usage analytics buffer.
pub const ANALYTICS_KEY: &str = "analytics";
/// Prefix of per-feature cache keys.
pub const CACHE_KEY_PREFIX: &str = "cache:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Storage backend a key is assigned to.
pub enum BackendKind {
    /// Small-quota area mirrored to the user's other browsers.
    Replicated,
    /// Large-quota, device-only area.
    Local,
}

impl BackendKind {
    /// Both backends in routing order.
    pub const ALL: [BackendKind; 2] = [BackendKind::Replicated, BackendKind::Local];

    /// Stable lowercase token.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Replicated => "replicated",
            Self::Local => "local",
        }
    }

    /// Name shown to users in quota warnings.
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Replicated => "Sync",
            Self::Local => "Local",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Payload class of a setting.
pub enum PayloadClass {
    /// String, number, boolean, or null.
    Scalar,
    /// Nested object or array.
    Structured,
    /// Large opaque media payload.
    Media,
}

impl PayloadClass {
    /// Infers scalar vs. structured from the value shape.
    pub fn of_value(value: &Value) -> Self {
        match value {
            Value::Object(_) | Value::Array(_) => Self::Structured,
            _ => Self::Scalar,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Key matcher used by an [`AssignmentRule`].
pub enum KeyPattern {
    /// Exactly this key.
    Exact(&'static str),
    /// Any key starting with this prefix.
    Prefix(&'static str),
}

impl KeyPattern {
    /// Returns whether `key` matches.
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(exact) => key == *exact,
            Self::Prefix(prefix) => key.starts_with(prefix),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// One row of the assignment table.
pub struct AssignmentRule {
    /// Keys the rule covers.
    pub pattern: KeyPattern,
    /// Payload class of the covered keys.
    pub class: PayloadClass,
    /// Backend the covered keys live in.
    pub backend: BackendKind,
    /// Whether writes are announced on the broadcast slot.
    pub broadcast: bool,
}

const fn rule(
    pattern: KeyPattern,
    class: PayloadClass,
    backend: BackendKind,
    broadcast: bool,
) -> AssignmentRule {
    AssignmentRule {
        pattern,
        class,
        backend,
        broadcast,
    }
}

/// Keys that are not replicated. Anything not listed is a replicated setting.
pub const DEFAULT_RULES: &[AssignmentRule] = &[
    rule(
        KeyPattern::Exact(BACKGROUND_IMAGE_KEY),
        PayloadClass::Media,
        BackendKind::Local,
        true,
    ),
    rule(
        KeyPattern::Exact(BACKGROUND_VIDEO_KEY),
        PayloadClass::Media,
        BackendKind::Local,
        true,
    ),
    rule(
        KeyPattern::Exact(BACKGROUND_ENTRIES_KEY),
        PayloadClass::Structured,
        BackendKind::Local,
        true,
    ),
    rule(
        KeyPattern::Exact(CURRENT_BACKGROUND_INDEX_KEY),
        PayloadClass::Scalar,
        BackendKind::Local,
        true,
    ),
    rule(
        KeyPattern::Exact(LEGACY_BACKGROUNDS_KEY),
        PayloadClass::Structured,
        BackendKind::Local,
        false,
    ),
    rule(
        KeyPattern::Exact(SCHEMA_VERSION_KEY),
        PayloadClass::Scalar,
        BackendKind::Local,
        false,
    ),
    rule(
        KeyPattern::Exact(MIGRATION_BACKUP_KEY),
        PayloadClass::Structured,
        BackendKind::Local,
        false,
    ),
    rule(
        KeyPattern::Exact(ERROR_LOG_KEY),
        PayloadClass::Structured,
        BackendKind::Local,
        false,
    ),
    rule(
        KeyPattern::Exact(ANALYTICS_KEY),
        PayloadClass::Structured,
        BackendKind::Local,
        false,
    ),
    rule(
        KeyPattern::Prefix(CACHE_KEY_PREFIX),
        PayloadClass::Structured,
        BackendKind::Local,
        false,
    ),
];

#[derive(Debug, Clone, PartialEq)]
/// Pure `key -> backend` function driven by an ordered rule table. First match wins.
pub struct BackendAssignment {
    rules: Vec<AssignmentRule>,
}

impl Default for BackendAssignment {
    fn default() -> Self {
        Self::with_rules(DEFAULT_RULES.to_vec())
    }
}

impl BackendAssignment {
    /// Builds an assignment from a custom rule table.
    pub fn with_rules(rules: Vec<AssignmentRule>) -> Self {
        Self { rules }
    }

    /// Rule covering `key`, if any.
    pub fn rule_for(&self, key: &str) -> Option<&AssignmentRule> {
        self.rules.iter().find(|rule| rule.pattern.matches(key))
    }

    /// Backend owning `key`.
    pub fn backend_for(&self, key: &str) -> BackendKind {
        self.rule_for(key)
            .map_or(BackendKind::Replicated, |rule| rule.backend)
    }

    /// Payload class of `key` holding `value`.
    pub fn payload_class(&self, key: &str, value: &Value) -> PayloadClass {
        self.rule_for(key)
            .map_or_else(|| PayloadClass::of_value(value), |rule| rule.class)
    }

    /// Whether writes to `key` are announced on the broadcast slot.
    pub fn broadcasts(&self, key: &str) -> bool {
        self.rule_for(key).map_or(true, |rule| rule.broadcast)
    }

    /// Splits a write into its replicated and local halves.
    pub fn split_items(&self, items: StorageMap) -> (StorageMap, StorageMap) {
        let mut replicated = StorageMap::new();
        let mut local = StorageMap::new();
        for (key, value) in items {
            match self.backend_for(&key) {
                BackendKind::Replicated => replicated.insert(key, value),
                BackendKind::Local => local.insert(key, value),
            };
        }
        (replicated, local)
    }

    /// Splits a key list into its replicated and local halves.
    pub fn split_keys(&self, keys: &[String]) -> (Vec<String>, Vec<String>) {
        keys.iter()
            .cloned()
            .partition(|key| self.backend_for(key) == BackendKind::Replicated)
    }
}
