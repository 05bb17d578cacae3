use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Arbitrary-precision integer identifier of a spatial feature or geometry.
///
/// Stored as its canonical decimal text so values beyond `i64`/`f64` range
/// survive every hop. Numbers, strings and native integers holding the same
/// value compare equal and serialize identically (as a JSON string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeatureId(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeatureIdError {
    #[error("feature id is empty")]
    Empty,
    #[error("feature id '{0}' is not an integer")]
    NotInteger(String),
}

impl FeatureId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Lenient conversion used on rows coming back from the stores: empty or
    /// malformed input normalizes to `None`.
    pub fn normalize(value: Option<&str>) -> Option<Self> {
        value.and_then(|raw| raw.parse().ok())
    }

    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(raw) => raw.parse().ok(),
            serde_json::Value::Number(number) => {
                if let Some(int) = number.as_i64() {
                    Some(Self::from(int))
                } else if let Some(uint) = number.as_u64() {
                    Some(Self::from(uint))
                } else {
                    number.as_f64().and_then(Self::from_f64)
                }
            }
            _ => None,
        }
    }

    fn from_f64(value: f64) -> Option<Self> {
        if value.is_finite() && value.fract() == 0.0 {
            format!("{value:.0}").parse().ok()
        } else {
            None
        }
    }
}

impl FromStr for FeatureId {
    type Err = FeatureIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(FeatureIdError::Empty);
        }

        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(FeatureIdError::NotInteger(trimmed.to_owned()));
        }

        let significant = digits.trim_start_matches('0');
        if significant.is_empty() {
            return Ok(Self("0".to_owned()));
        }
        if negative {
            Ok(Self(format!("-{significant}")))
        } else {
            Ok(Self(significant.to_owned()))
        }
    }
}

impl From<i64> for FeatureId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl From<u64> for FeatureId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl From<i128> for FeatureId {
    fn from(value: i128) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for FeatureId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for FeatureId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(FeatureIdVisitor)
    }
}

struct FeatureIdVisitor;

impl Visitor<'_> for FeatureIdVisitor {
    type Value = FeatureId;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("an integer or a decimal integer string")
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<FeatureId, E> {
        Ok(FeatureId::from(value))
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<FeatureId, E> {
        Ok(FeatureId::from(value))
    }

    fn visit_i128<E: de::Error>(self, value: i128) -> Result<FeatureId, E> {
        Ok(FeatureId::from(value))
    }

    fn visit_f64<E: de::Error>(self, value: f64) -> Result<FeatureId, E> {
        FeatureId::from_f64(value)
            .ok_or_else(|| E::custom(format!("feature id {value} is not an integer")))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<FeatureId, E> {
        value.parse().map_err(E::custom)
    }
}
