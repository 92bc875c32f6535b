use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FlowError, Result};

/// Length of the hex fingerprint used as a workspace directory name.
pub const FINGERPRINT_LEN: usize = 32;

/// Immutable parameter combination identifying one job.
///
/// Keys are kept sorted so the canonical JSON form, and therefore the
/// fingerprint, does not depend on declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatePoint(BTreeMap<String, Value>);

impl StatePoint {
    pub fn new(fields: BTreeMap<String, Value>) -> Self {
        Self(fields)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical serialized form: compact JSON with sorted keys.
    pub fn canonical_json(&self) -> String {
        // A map of JSON values always serializes.
        serde_json::to_string(&self.0).unwrap_or_default()
    }

    /// Stable content hash of the canonical form, truncated to [`FINGERPRINT_LEN`] hex digits.
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(self.canonical_json().as_bytes());
        hash.to_hex().as_str()[..FINGERPRINT_LEN].to_string()
    }

    /// Deserializes the state point into a typed record.
    ///
    /// Field-name mistakes surface here as a configuration error instead of
    /// as a lookup miss deep inside an operation.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T> {
        let value = Value::Object(self.0.clone().into_iter().collect());
        serde_json::from_value(value).map_err(|e| {
            FlowError::Configuration(format!("state point {}: {e}", self.fingerprint()))
        })
    }
}

impl FromIterator<(String, Value)> for StatePoint {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sp(pairs: &[(&str, Value)]) -> StatePoint {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn fingerprint_ignores_insertion_order() {
        let a = sp(&[("x", json!(1)), ("y", json!(10))]);
        let b = sp(&[("y", json!(10)), ("x", json!(1))]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), FINGERPRINT_LEN);
    }

    #[test]
    fn fingerprint_distinguishes_values() {
        let a = sp(&[("x", json!(1))]);
        let b = sp(&[("x", json!(2))]);
        let c = sp(&[("x", json!("1"))]);
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn canonical_json_is_sorted_and_compact() {
        let point = sp(&[("b", json!([1, 2])), ("a", json!(null))]);
        assert_eq!(point.canonical_json(), r#"{"a":null,"b":[1,2]}"#);
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Typed {
        x: i64,
        #[serde(default)]
        label: Option<String>,
    }

    #[test]
    fn typed_view_rejects_unknown_fields() {
        let ok: Typed = sp(&[("x", json!(3))]).to_typed().unwrap();
        assert_eq!(ok.x, 3);
        assert!(ok.label.is_none());

        let err = sp(&[("x", json!(3)), ("tempreature", json!(300))])
            .to_typed::<Typed>()
            .unwrap_err();
        assert!(matches!(err, FlowError::Configuration(_)));
    }
}
