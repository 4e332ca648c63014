//! Backend-native change feed payloads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::listeners::Listener;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
/// Old and new value of one key, as reported by a backend change feed.
///
/// `None` means the key was absent before (for `old_value`) or has been removed (for
/// `new_value`).
pub struct StorageChange {
    /// Value before the write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    /// Value after the write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

/// One change batch keyed by storage key. A batch corresponds to one backend operation.
pub type StorageChanges = BTreeMap<String, StorageChange>;

/// Listener attached to a backend change feed.
pub type ChangeListener = Listener<StorageChanges>;

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn storage_change_uses_browser_field_names() {
        let change: StorageChange =
            serde_json::from_value(json!({"oldValue": 1, "newValue": 2})).expect("decode");
        assert_eq!(change.old_value, Some(json!(1)));
        assert_eq!(change.new_value, Some(json!(2)));

        let removed = StorageChange {
            old_value: Some(json!("x")),
            new_value: None,
        };
        assert_eq!(
            serde_json::to_value(&removed).expect("encode"),
            json!({"oldValue": "x"})
        );
    }
}
