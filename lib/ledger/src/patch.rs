//! Tri-state fields for partial updates.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A field in a partial update.
///
/// When deserialized with `#[serde(default)]`, a missing key becomes
/// `Unset`, an explicit `null` becomes `SetNull` and any other value becomes
/// `Set`.
#[derive(Debug, Clone, PartialEq)]
pub enum Patch<T> {
    /// Leave the stored value unchanged.
    Unset,
    /// Clear the stored value.
    SetNull,
    /// Replace the stored value.
    Set(T),
}

impl<T> Default for Patch<T> {
    fn default() -> Self {
        Self::Unset
    }
}

impl<T> Patch<T> {
    /// Returns true if the field was not supplied.
    #[must_use]
    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }

    /// Applies the patch to a nullable stored value.
    #[must_use]
    pub fn apply(self, current: Option<T>) -> Option<T> {
        match self {
            Self::Unset => current,
            Self::SetNull => None,
            Self::Set(value) => Some(value),
        }
    }

    /// Maps the carried value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Patch<U> {
        match self {
            Self::Unset => Patch::Unset,
            Self::SetNull => Patch::SetNull,
            Self::Set(value) => Patch::Set(f(value)),
        }
    }
}

impl<T> From<Option<T>> for Patch<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Self::Set(value),
            None => Self::SetNull,
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Patch<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<T>::deserialize(deserializer).map(Self::from)
    }
}

impl<T: Serialize> Serialize for Patch<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Set(value) => serializer.serialize_some(value),
            Self::Unset | Self::SetNull => serializer.serialize_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, Serialize)]
    struct Changes {
        #[serde(default, skip_serializing_if = "Patch::is_unset")]
        notes: Patch<String>,
    }

    #[test]
    fn missing_key_is_unset() {
        let changes: Changes = serde_json::from_value(json!({})).unwrap();
        assert_eq!(changes.notes, Patch::Unset);
    }

    #[test]
    fn explicit_null_is_set_null() {
        let changes: Changes = serde_json::from_value(json!({ "notes": null })).unwrap();
        assert_eq!(changes.notes, Patch::SetNull);
    }

    #[test]
    fn value_is_set() {
        let changes: Changes = serde_json::from_value(json!({ "notes": "split" })).unwrap();
        assert_eq!(changes.notes, Patch::Set("split".to_string()));
    }

    #[test]
    fn unset_is_skipped_when_serializing() {
        let changes = Changes {
            notes: Patch::Unset,
        };
        assert_eq!(serde_json::to_value(&changes).unwrap(), json!({}));

        let cleared = Changes {
            notes: Patch::SetNull,
        };
        assert_eq!(
            serde_json::to_value(&cleared).unwrap(),
            json!({ "notes": null })
        );
    }

    #[test]
    fn apply_respects_each_state() {
        let stored = Some("old".to_string());
        assert_eq!(Patch::Unset.apply(stored.clone()), stored);
        assert_eq!(Patch::<String>::SetNull.apply(stored.clone()), None);
        assert_eq!(
            Patch::Set("new".to_string()).apply(stored),
            Some("new".to_string())
        );
    }
}
