//! Settings export documents and all-or-nothing import validation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use settings_host::StorageMap;

use crate::{
    error::SettingsError,
    keys::{
        BACKGROUND_ENTRIES_KEY, CURRENT_BACKGROUND_INDEX_KEY, MIGRATION_BACKUP_KEY,
        SCHEMA_VERSION_KEY,
    },
    migration::{rfc3339_from_millis, SchemaVersion},
    rotation::BackgroundEntry,
};

/// Keys an import never writes directly.
pub const RESERVED_IMPORT_KEYS: [&str; 4] = [
    SCHEMA_VERSION_KEY,
    MIGRATION_BACKUP_KEY,
    BACKGROUND_ENTRIES_KEY,
    CURRENT_BACKGROUND_INDEX_KEY,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Transportable snapshot of replicated settings plus the background entry list.
pub struct ExportDocument {
    /// Schema version of the exporting runtime.
    pub version: String,
    /// RFC 3339 export time.
    pub export_date: String,
    /// Full replicated mapping.
    pub settings: StorageMap,
    /// Background entries in order.
    pub backgrounds: Vec<BackgroundEntry>,
}

impl ExportDocument {
    /// Builds a document stamped with `now_ms`.
    pub fn new(
        version: SchemaVersion,
        now_ms: u64,
        settings: StorageMap,
        backgrounds: Vec<BackgroundEntry>,
    ) -> Self {
        Self {
            version: version.to_string(),
            export_date: rfc3339_from_millis(now_ms),
            settings,
            backgrounds,
        }
    }

    /// Pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Serialization`] if encoding fails.
    pub fn to_json_pretty(&self) -> Result<String, SettingsError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A validated import, ready to be written.
pub struct ImportPlan {
    /// Version the document was exported at.
    pub version: SchemaVersion,
    /// Settings to write, reserved keys removed.
    pub settings: StorageMap,
    /// Entry list to install, when the document carries one.
    pub backgrounds: Option<Vec<BackgroundEntry>>,
}

/// Parses and validates JSON text. See [`validate_import`].
///
/// # Errors
///
/// Returns [`SettingsError::MalformedImport`] for text that is not JSON.
pub fn parse_import(raw: &str, supported: SchemaVersion) -> Result<ImportPlan, SettingsError> {
    let document: Value = serde_json::from_str(raw)
        .map_err(|err| SettingsError::MalformedImport(format!("not valid JSON: {err}")))?;
    validate_import(&document, supported)
}

/// Validates an import document without writing anything.
///
/// # Errors
///
/// Returns [`SettingsError::MalformedImport`] when a shape marker is missing or wrong, and
/// [`SettingsError::IncompatibleVersion`] when the version's major is unsupported.
pub fn validate_import(
    document: &Value,
    supported: SchemaVersion,
) -> Result<ImportPlan, SettingsError> {
    let Value::Object(fields) = document else {
        return Err(malformed("document is not an object"));
    };

    let raw_version = match fields.get("version") {
        Some(Value::String(raw)) if !raw.trim().is_empty() => raw.trim(),
        Some(_) => return Err(malformed("`version` must be a non-empty string")),
        None => return Err(malformed("missing `version` marker")),
    };
    let version: SchemaVersion = raw_version
        .parse()
        .map_err(|err| malformed(format!("`version`: {err}")))?;
    if !version.is_compatible_with(&supported) {
        return Err(SettingsError::IncompatibleVersion {
            found: version.to_string(),
            supported: supported.to_string(),
        });
    }

    let mut settings = match fields.get("settings") {
        Some(Value::Object(settings)) => settings.clone(),
        Some(_) => return Err(malformed("`settings` must be an object")),
        None => return Err(malformed("missing `settings`")),
    };
    for key in RESERVED_IMPORT_KEYS {
        settings.remove(key);
    }

    let backgrounds = match fields.get("backgrounds") {
        None | Some(Value::Null) => None,
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .enumerate()
                .map(|(index, item)| {
                    serde_json::from_value::<BackgroundEntry>(item.clone())
                        .map_err(|err| malformed(format!("`backgrounds[{index}]`: {err}")))
                })
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Some(_) => return Err(malformed("`backgrounds` must be a list")),
    };

    Ok(ImportPlan {
        version,
        settings,
        backgrounds,
    })
}

fn malformed(reason: impl Into<String>) -> SettingsError {
    SettingsError::MalformedImport(reason.into())
}
