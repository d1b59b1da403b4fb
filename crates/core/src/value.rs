//! Job-argument value model.
//!
//! `ArgValue` is the value domain accepted by job arguments and by batch
//! properties. It serializes to JSON; the domain reference types are encoded
//! as tagged objects so they survive a round trip through storage:
//!
//! ```json
//! {"_convoy": "batch", "id": "0191..."}
//! {"_convoy": "job", "id": "0191..."}
//! {"_convoy": "timestamp", "value": "2024-08-01T14:33:43.123Z"}
//! {"_convoy": "float", "value": "1000000000000000"}
//! ```
//!
//! Whole floats are tagged too: jsonb renders `1e15` as an integer literal,
//! which would otherwise read back as `Int` (or not at all past `i64`).
//! A user map must not contain the reserved key, and floats must be finite.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Number, Value as JsonValue};

use crate::error::{BatchError, BatchResult};
use crate::id::{BatchId, JobId};

/// Key that marks a JSON object as an encoded reference value.
pub const RESERVED_KEY: &str = "_convoy";

const TAG_TIMESTAMP: &str = "timestamp";
const TAG_BATCH: &str = "batch";
const TAG_JOB: &str = "job";
const TAG_FLOAT: &str = "float";

/// A value that can be passed as a job argument or stored as a batch property.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<ArgValue>),
    Map(BTreeMap<String, ArgValue>),
    Timestamp(DateTime<Utc>),
    Batch(BatchId),
    Job(JobId),
}

impl ArgValue {
    /// Build a map value from key/value pairs.
    pub fn map<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<ArgValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Short name of the variant, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ArgValue::Null => "null",
            ArgValue::Bool(_) => "bool",
            ArgValue::Int(_) => "int",
            ArgValue::Float(_) => "float",
            ArgValue::String(_) => "string",
            ArgValue::List(_) => "list",
            ArgValue::Map(_) => "map",
            ArgValue::Timestamp(_) => "timestamp",
            ArgValue::Batch(_) => "batch",
            ArgValue::Job(_) => "job",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ArgValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ArgValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ArgValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ArgValue::Float(f) => Some(*f),
            ArgValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, ArgValue>> {
        match self {
            ArgValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_batch_id(&self) -> Option<BatchId> {
        match self {
            ArgValue::Batch(id) => Some(*id),
            _ => None,
        }
    }

    /// Look up a key when this value is a map.
    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Encode into the stored JSON form.
    pub fn to_json(&self) -> BatchResult<JsonValue> {
        Ok(match self {
            ArgValue::Null => JsonValue::Null,
            ArgValue::Bool(b) => JsonValue::Bool(*b),
            ArgValue::Int(i) => JsonValue::from(*i),
            ArgValue::Float(f) if !f.is_finite() => {
                return Err(BatchError::serialization(format!("non-finite float {f}")));
            }
            ArgValue::Float(f) if f.fract() == 0.0 => tagged(TAG_FLOAT, "value", f.to_string()),
            ArgValue::Float(f) => Number::from_f64(*f)
                .map(JsonValue::Number)
                .ok_or_else(|| BatchError::serialization(format!("non-finite float {f}")))?,
            ArgValue::String(s) => JsonValue::String(s.clone()),
            ArgValue::List(items) => JsonValue::Array(
                items
                    .iter()
                    .map(ArgValue::to_json)
                    .collect::<BatchResult<Vec<_>>>()?,
            ),
            ArgValue::Map(entries) => {
                if entries.contains_key(RESERVED_KEY) {
                    return Err(BatchError::serialization(format!(
                        "map contains reserved key '{RESERVED_KEY}'"
                    )));
                }
                let mut object = JsonMap::with_capacity(entries.len());
                for (key, value) in entries {
                    object.insert(key.clone(), value.to_json()?);
                }
                JsonValue::Object(object)
            }
            ArgValue::Timestamp(at) => tagged(
                TAG_TIMESTAMP,
                "value",
                at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            ),
            ArgValue::Batch(id) => tagged(TAG_BATCH, "id", id.to_string()),
            ArgValue::Job(id) => tagged(TAG_JOB, "id", id.to_string()),
        })
    }

    /// Decode from the stored JSON form.
    pub fn from_json(value: &JsonValue) -> BatchResult<Self> {
        Ok(match value {
            JsonValue::Null => ArgValue::Null,
            JsonValue::Bool(b) => ArgValue::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ArgValue::Int(i)
                } else if n.is_u64() {
                    return Err(BatchError::serialization(format!(
                        "integer {n} is out of range"
                    )));
                } else {
                    let f = n
                        .as_f64()
                        .ok_or_else(|| BatchError::serialization(format!("bad number {n}")))?;
                    ArgValue::Float(f)
                }
            }
            JsonValue::String(s) => ArgValue::String(s.clone()),
            JsonValue::Array(items) => ArgValue::List(
                items
                    .iter()
                    .map(ArgValue::from_json)
                    .collect::<BatchResult<Vec<_>>>()?,
            ),
            JsonValue::Object(object) => match object.get(RESERVED_KEY) {
                Some(tag) => decode_reference(tag, object)?,
                None => {
                    let mut entries = BTreeMap::new();
                    for (key, value) in object {
                        entries.insert(key.clone(), ArgValue::from_json(value)?);
                    }
                    ArgValue::Map(entries)
                }
            },
        })
    }
}

fn tagged(tag: &str, field: &str, payload: String) -> JsonValue {
    let mut object = JsonMap::with_capacity(2);
    object.insert(RESERVED_KEY.to_string(), JsonValue::String(tag.to_string()));
    object.insert(field.to_string(), JsonValue::String(payload));
    JsonValue::Object(object)
}

fn decode_reference(tag: &JsonValue, object: &JsonMap<String, JsonValue>) -> BatchResult<ArgValue> {
    let field = |name: &str| -> BatchResult<&str> {
        object
            .get(name)
            .and_then(JsonValue::as_str)
            .ok_or_else(|| BatchError::serialization(format!("reference is missing '{name}'")))
    };

    match tag.as_str() {
        Some(TAG_TIMESTAMP) => {
            let raw = field("value")?;
            let at = DateTime::parse_from_rfc3339(raw)
                .map_err(|e| BatchError::serialization(format!("timestamp '{raw}': {e}")))?;
            Ok(ArgValue::Timestamp(at.with_timezone(&Utc)))
        }
        Some(TAG_FLOAT) => {
            let raw = field("value")?;
            match raw.parse::<f64>() {
                Ok(f) if f.is_finite() => Ok(ArgValue::Float(f)),
                _ => Err(BatchError::serialization(format!("bad float '{raw}'"))),
            }
        }
        Some(TAG_BATCH) => Ok(ArgValue::Batch(
            field("id")?
                .parse()
                .map_err(|e: BatchError| BatchError::serialization(e.to_string()))?,
        )),
        Some(TAG_JOB) => Ok(ArgValue::Job(
            field("id")?
                .parse()
                .map_err(|e: BatchError| BatchError::serialization(e.to_string()))?,
        )),
        _ => Err(BatchError::serialization(format!(
            "unknown reference tag {tag}"
        ))),
    }
}

impl Serialize for ArgValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_json()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ArgValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = JsonValue::deserialize(deserializer)?;
        ArgValue::from_json(&value).map_err(serde::de::Error::custom)
    }
}

impl Default for ArgValue {
    fn default() -> Self {
        ArgValue::Null
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        ArgValue::Bool(value)
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        ArgValue::Int(value)
    }
}

impl From<i32> for ArgValue {
    fn from(value: i32) -> Self {
        ArgValue::Int(value.into())
    }
}

impl From<f64> for ArgValue {
    fn from(value: f64) -> Self {
        ArgValue::Float(value)
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::String(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        ArgValue::String(value)
    }
}

impl From<DateTime<Utc>> for ArgValue {
    fn from(value: DateTime<Utc>) -> Self {
        ArgValue::Timestamp(value)
    }
}

impl From<BatchId> for ArgValue {
    fn from(value: BatchId) -> Self {
        ArgValue::Batch(value)
    }
}

impl From<JobId> for ArgValue {
    fn from(value: JobId) -> Self {
        ArgValue::Job(value)
    }
}

impl<T: Into<ArgValue>> From<Vec<T>> for ArgValue {
    fn from(value: Vec<T>) -> Self {
        ArgValue::List(value.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<ArgValue>> From<Option<T>> for ArgValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(ArgValue::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn references_encode_as_tagged_objects() {
        let batch = BatchId::new();
        let encoded = ArgValue::Batch(batch).to_json().unwrap();
        assert_eq!(encoded, json!({"_convoy": "batch", "id": batch.to_string()}));
    }

    #[test]
    fn nested_references_survive_storage() {
        let at = DateTime::parse_from_rfc3339("2024-08-01T14:33:43.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        let job = JobId::new();
        let value = ArgValue::map([
            ("when", ArgValue::Timestamp(at)),
            ("jobs", ArgValue::from(vec![job])),
            ("retries", ArgValue::Int(3)),
        ]);

        let stored = serde_json::to_string(&value).unwrap();
        let loaded: ArgValue = serde_json::from_str(&stored).unwrap();
        assert_eq!(loaded, value);
        assert_eq!(loaded.get("when"), Some(&ArgValue::Timestamp(at)));
    }

    #[test]
    fn reserved_key_in_user_map_is_rejected() {
        let value = ArgValue::map([(RESERVED_KEY, "sneaky")]);
        assert!(matches!(value.to_json(), Err(BatchError::Serialization(_))));
    }

    #[test]
    fn non_finite_floats_are_rejected() {
        assert!(ArgValue::Float(f64::NAN).to_json().is_err());
        assert!(ArgValue::Float(f64::INFINITY).to_json().is_err());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = ArgValue::from_json(&json!({"_convoy": "module", "id": "x"})).unwrap_err();
        assert!(matches!(err, BatchError::Serialization(_)));
    }

    #[test]
    fn oversized_unsigned_integer_is_rejected() {
        let err = ArgValue::from_json(&json!(u64::MAX)).unwrap_err();
        assert!(matches!(err, BatchError::Serialization(_)));
    }

    #[test]
    fn whole_floats_stay_floats() {
        let loaded = ArgValue::from_json(&ArgValue::Float(2.0).to_json().unwrap()).unwrap();
        assert_eq!(loaded, ArgValue::Float(2.0));
    }

    #[test]
    fn whole_floats_survive_integer_rendering() {
        for f in [1e15, -0.0, 1e19, 9.5e300] {
            let stored = ArgValue::Float(f).to_json().unwrap();
            assert!(stored.get(RESERVED_KEY).is_some(), "{f} should be tagged");
            // Storage may re-render numbers; the tagged string is left alone.
            let rendered: JsonValue = serde_json::from_str(&stored.to_string()).unwrap();
            assert_eq!(ArgValue::from_json(&rendered).unwrap(), ArgValue::Float(f));
        }
        assert_eq!(
            ArgValue::Float(0.25).to_json().unwrap(),
            json!(0.25),
            "fractional floats stay plain numbers"
        );
    }

    #[test]
    fn tagged_float_must_parse() {
        for raw in ["abc", "inf", "NaN"] {
            let err = ArgValue::from_json(&json!({"_convoy": "float", "value": raw})).unwrap_err();
            assert!(matches!(err, BatchError::Serialization(_)));
        }
    }

    fn arb_value() -> impl Strategy<Value = ArgValue> {
        let leaf = prop_oneof![
            Just(ArgValue::Null),
            any::<bool>().prop_map(ArgValue::Bool),
            any::<i64>().prop_map(ArgValue::Int),
            (-1_000_000i32..1_000_000).prop_map(|n| ArgValue::Float(f64::from(n) / 4.0)),
            "[a-z]{0,8}".prop_map(ArgValue::String),
            any::<u128>().prop_map(|n| ArgValue::Batch(BatchId::from_uuid(uuid::Uuid::from_u128(n)))),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(ArgValue::List),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4).prop_map(ArgValue::Map),
            ]
        })
    }

    proptest! {
        #[test]
        fn stored_form_decodes_to_the_same_value(value in arb_value()) {
            let stored = value.to_json().unwrap();
            prop_assert_eq!(ArgValue::from_json(&stored).unwrap(), value);
        }
    }
}
