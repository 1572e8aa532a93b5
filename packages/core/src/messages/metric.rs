//! Ad-hoc metric records emitted by components.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MetricError;

/// Metric kind. Variant names match the wire strings exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
pub enum MetricType {
    COUNTER,
    GAUGE,
    TIMER,
}

impl MetricType {
    /// Parses the wire name. Unknown names yield `None`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "COUNTER" => Some(Self::COUNTER),
            "GAUGE" => Some(Self::GAUGE),
            "TIMER" => Some(Self::TIMER),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::COUNTER => "COUNTER",
            Self::GAUGE => "GAUGE",
            Self::TIMER => "TIMER",
        }
    }
}

/// One metric observation.
///
/// TIMER values are milliseconds; the aggregator converts them to seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub key: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub value: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl MetricRecord {
    #[must_use]
    pub fn new(metric_type: MetricType, key: impl Into<String>, value: f64) -> Self {
        Self {
            key: key.into(),
            metric_type,
            value,
            tags: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn counter(key: impl Into<String>, value: f64) -> Self {
        Self::new(MetricType::COUNTER, key, value)
    }

    #[must_use]
    pub fn gauge(key: impl Into<String>, value: f64) -> Self {
        Self::new(MetricType::GAUGE, key, value)
    }

    /// A TIMER record; `millis` is the elapsed time in milliseconds.
    #[must_use]
    pub fn timer(key: impl Into<String>, millis: f64) -> Self {
        Self::new(MetricType::TIMER, key, millis)
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Checks the invariants serde cannot express: a non-empty key, a finite
    /// value, and a non-negative duration for timers. `index` is the record's
    /// position in its batch.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self, index: usize) -> Result<(), MetricError> {
        if self.key.is_empty() {
            return Err(MetricError::MissingKey { index });
        }
        if !self.value.is_finite() {
            return Err(MetricError::NonFiniteValue {
                key: self.key.clone(),
            });
        }
        if self.metric_type == MetricType::TIMER && self.value < 0.0 {
            return Err(MetricError::NegativeTimer {
                key: self.key.clone(),
            });
        }
        Ok(())
    }

    /// Strictly parses one record from an untyped JSON document.
    ///
    /// Tag values may be strings, numbers or booleans; non-string scalars are
    /// stringified.
    ///
    /// # Errors
    ///
    /// Returns a [`MetricError`] describing the first problem found.
    pub fn from_value(index: usize, value: &Value) -> Result<Self, MetricError> {
        let Value::Object(obj) = value else {
            return Err(MetricError::NotAnObject { index });
        };
        let metric_type = match obj.get("type") {
            Some(Value::String(s)) => {
                MetricType::parse(s).ok_or_else(|| MetricError::UnknownType {
                    index,
                    found: s.clone(),
                })?
            }
            Some(other) => {
                return Err(MetricError::UnknownType {
                    index,
                    found: other.to_string(),
                })
            }
            None => {
                return Err(MetricError::UnknownType {
                    index,
                    found: String::new(),
                })
            }
        };
        let key = match obj.get("key") {
            Some(Value::String(k)) => k.clone(),
            _ => return Err(MetricError::MissingKey { index }),
        };
        let value = obj
            .get("value")
            .and_then(Value::as_f64)
            .ok_or(MetricError::MissingValue { index })?;
        let tags = match obj.get("tags") {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| match v {
                    Value::String(s) => Ok((k.clone(), s.clone())),
                    Value::Number(_) | Value::Bool(_) => Ok((k.clone(), v.to_string())),
                    _ => Err(MetricError::InvalidTags { index }),
                })
                .collect::<Result<_, _>>()?,
            Some(_) => return Err(MetricError::InvalidTags { index }),
        };
        let record = Self {
            key,
            metric_type,
            value,
            tags,
        };
        record.validate(index)?;
        Ok(record)
    }

    /// Parses a JSON list of records, failing on the first bad one.
    ///
    /// # Errors
    ///
    /// Returns `MetricError::NotAList` for a non-array document, otherwise the
    /// error of the first invalid record.
    pub fn parse_list(value: &Value) -> Result<Vec<Self>, MetricError> {
        let Value::Array(items) = value else {
            return Err(MetricError::NotAList);
        };
        items
            .iter()
            .enumerate()
            .map(|(i, v)| Self::from_value(i, v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_all_three_types() {
        let list = json!([
            {"type": "COUNTER", "key": "c", "value": 1},
            {"type": "GAUGE", "key": "g", "value": 2.5, "tags": {"a": "b"}},
            {"type": "TIMER", "key": "t", "value": 20.2}
        ]);
        let records = MetricRecord::parse_list(&list).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], MetricRecord::counter("c", 1.0));
        assert_eq!(records[1], MetricRecord::gauge("g", 2.5).with_tag("a", "b"));
        assert_eq!(records[2].metric_type, MetricType::TIMER);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = MetricRecord::parse_list(&json!([{"type": "BAD", "key": "x", "value": 1}]))
            .unwrap_err();
        assert_eq!(
            err,
            MetricError::UnknownType {
                index: 0,
                found: "BAD".into()
            }
        );
    }

    #[test]
    fn missing_key_and_value_are_rejected() {
        let no_key = json!([{"type": "COUNTER", "value": 1}]);
        assert_eq!(
            MetricRecord::parse_list(&no_key).unwrap_err(),
            MetricError::MissingKey { index: 0 }
        );
        let no_value = json!([{"type": "COUNTER", "key": "x"}, {"type": "GAUGE", "key": "y"}]);
        assert_eq!(
            MetricRecord::parse_list(&no_value).unwrap_err(),
            MetricError::MissingValue { index: 0 }
        );
        let bad_value = json!([{"type": "GAUGE", "key": "y", "value": "1"}]);
        assert!(MetricRecord::parse_list(&bad_value).is_err());
    }

    #[test]
    fn empty_key_is_rejected() {
        let empty = json!([{"type": "COUNTER", "key": "", "value": 1}]);
        assert_eq!(
            MetricRecord::parse_list(&empty).unwrap_err(),
            MetricError::MissingKey { index: 0 }
        );
    }

    #[test]
    fn scalar_tags_are_stringified() {
        let list = json!([{"type": "COUNTER", "key": "c", "value": 1, "tags": {"n": 3, "b": true}}]);
        let rec = &MetricRecord::parse_list(&list).unwrap()[0];
        assert_eq!(rec.tags["n"], "3");
        assert_eq!(rec.tags["b"], "true");
        let nested = json!([{"type": "COUNTER", "key": "c", "value": 1, "tags": {"n": [1]}}]);
        assert_eq!(
            MetricRecord::parse_list(&nested).unwrap_err(),
            MetricError::InvalidTags { index: 0 }
        );
    }

    #[test]
    fn not_a_list() {
        assert_eq!(
            MetricRecord::parse_list(&json!({"type": "COUNTER"})).unwrap_err(),
            MetricError::NotAList
        );
    }

    #[test]
    fn validate_catches_non_finite() {
        let rec = MetricRecord::gauge("g", f64::NAN);
        assert!(matches!(
            rec.validate(0),
            Err(MetricError::NonFiniteValue { .. })
        ));
    }

    #[test]
    fn negative_timer_is_rejected() {
        let list = json!([{"type": "TIMER", "key": "t", "value": -3}]);
        assert_eq!(
            MetricRecord::parse_list(&list).unwrap_err(),
            MetricError::NegativeTimer { key: "t".into() }
        );
        assert!(MetricRecord::timer("t", 0.0).validate(0).is_ok());
        assert!(MetricRecord::gauge("g", -3.0).validate(0).is_ok());
    }

    #[test]
    fn serde_uses_type_field() {
        let rec = MetricRecord::timer("t", 1.5);
        assert_eq!(
            serde_json::to_value(&rec).unwrap(),
            json!({"key": "t", "type": "TIMER", "value": 1.5})
        );
    }
}
