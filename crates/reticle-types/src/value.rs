use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::convert::TryFrom;
use std::fmt;
use std::hash::{Hash, Hasher};

const I64_LOWER: f64 = -9_223_372_036_854_775_808.0;
const I64_UPPER: f64 = 9_223_372_036_854_775_808.0;

/// A single field value carried by a fact, an accumulate result or an async message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FactValue {
    /// String value
    String(String),
    /// Integer value
    Integer(i64),
    /// Floating point value
    Float(f64),
    /// Boolean value
    Boolean(bool),
    /// Ordered list of values (the result of a `collect` accumulation, for instance)
    List(Vec<FactValue>),
    /// Absent value
    Null,
}

impl PartialEq for FactValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Null, Self::Null) => true,
            _ => false,
        }
    }
}

// NaN equals NaN above, so `Eq` holds for the hashing use in join indexes.
impl Eq for FactValue {}

impl Hash for FactValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::String(s) => {
                0u8.hash(state);
                s.hash(state);
            }
            Self::Integer(i) => {
                1u8.hash(state);
                i.hash(state);
            }
            Self::Float(f) => {
                2u8.hash(state);
                canonical_bits(*f).hash(state);
            }
            Self::Boolean(b) => {
                3u8.hash(state);
                b.hash(state);
            }
            Self::List(items) => {
                4u8.hash(state);
                items.hash(state);
            }
            Self::Null => 5u8.hash(state),
        }
    }
}

fn canonical_bits(f: f64) -> u64 {
    if f.is_nan() {
        f64::NAN.to_bits()
    } else if f == 0.0 {
        0.0f64.to_bits()
    } else {
        f.to_bits()
    }
}

impl PartialOrd for FactValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        use FactValue::{Boolean, Float, Integer, Null, String};
        match (self, other) {
            (String(a), String(b)) => a.partial_cmp(b),
            (Integer(a), Integer(b)) => a.partial_cmp(b),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (Boolean(a), Boolean(b)) => a.partial_cmp(b),
            (Null, Null) => Some(Ordering::Equal),
            #[allow(clippy::cast_precision_loss)]
            (Integer(a), Float(b)) => (*a as f64).partial_cmp(b),
            #[allow(clippy::cast_precision_loss)]
            (Float(a), Integer(b)) => a.partial_cmp(&(*b as f64)),
            _ => None,
        }
    }
}

impl fmt::Display for FactValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(fl) => write!(f, "{fl}"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Null => write!(f, "null"),
        }
    }
}

impl FactValue {
    /// Key used by equality join indexes.
    ///
    /// An integral float collapses onto the integer it is exactly equal to,
    /// so `Integer(4)` and `Float(4.0)` land in the same index bucket. Join
    /// equality between integers and floats is exact as well, so a bucket
    /// never holds values the condition would tell apart.
    #[must_use]
    pub fn index_key(&self) -> Self {
        match self {
            Self::Float(f) => Self::exact_integer(*f).map_or(Self::Float(*f), Self::Integer),
            other => other.clone(),
        }
    }

    /// The integer a float is exactly equal to, if any
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn exact_integer(f: f64) -> Option<i64> {
        // i64::MIN is exactly -2^63; i64::MAX rounds up to 2^63 as a float
        if f.fract() == 0.0 && (I64_LOWER..I64_UPPER).contains(&f) {
            Some(f as i64)
        } else {
            None
        }
    }

    /// Numeric view of the value, `None` for non-numeric variants
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Integer view of the value; floats truncate
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            #[allow(clippy::cast_possible_truncation)]
            Self::Float(f) => Some(*f as i64),
            Self::Boolean(b) => Some(i64::from(*b)),
            Self::String(s) => s.parse::<i64>().ok(),
            Self::List(_) | Self::Null => None,
        }
    }

    /// Borrow the string payload
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean payload
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Borrow the list payload
    #[must_use]
    pub fn as_list(&self) -> Option<&[Self]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Whether the value counts as true in a conditional context
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Boolean(b) => *b,
            Self::Integer(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::String(s) => !s.is_empty(),
            Self::List(items) => !items.is_empty(),
            Self::Null => false,
        }
    }

    /// Variant name, used in error messages
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Boolean(_) => "boolean",
            Self::List(_) => "list",
            Self::Null => "null",
        }
    }

    /// Whether this is `Null`
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<i64> for FactValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for FactValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for FactValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for FactValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<&str> for FactValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for FactValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<Self>> for FactValue {
    fn from(value: Vec<Self>) -> Self {
        Self::List(value)
    }
}

impl From<&FactValue> for serde_json::Value {
    fn from(value: &FactValue) -> Self {
        match value {
            FactValue::String(s) => Self::String(s.clone()),
            FactValue::Integer(i) => Self::Number(serde_json::Number::from(*i)),
            FactValue::Float(f) => {
                serde_json::Number::from_f64(*f).map_or(Self::Null, Self::Number)
            }
            FactValue::Boolean(b) => Self::Bool(*b),
            FactValue::List(items) => Self::Array(items.iter().map(Into::into).collect()),
            FactValue::Null => Self::Null,
        }
    }
}

impl TryFrom<&serde_json::Value> for FactValue {
    type Error = anyhow::Error;

    fn try_from(value: &serde_json::Value) -> Result<Self, Self::Error> {
        Ok(match value {
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    Self::Float(f)
                } else {
                    return Err(anyhow!("Unsupported number value: {n}"));
                }
            }
            serde_json::Value::Bool(b) => Self::Boolean(*b),
            serde_json::Value::Array(items) => {
                Self::List(items.iter().map(Self::try_from).collect::<Result<Vec<_>>>()?)
            }
            serde_json::Value::Object(_) => {
                return Err(anyhow!("Nested objects cannot be stored as a fact value"));
            }
            serde_json::Value::Null => Self::Null,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(value: &FactValue) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_float_zero_signs_hash_alike() {
        let pos = FactValue::Float(0.0);
        let neg = FactValue::Float(-0.0);
        assert_eq!(pos, neg);
        assert_eq!(hash_of(&pos), hash_of(&neg));
    }

    #[test]
    fn test_index_key_collapses_integral_floats() {
        assert_eq!(FactValue::Float(4.0).index_key(), FactValue::Integer(4));
        assert_eq!(FactValue::Float(4.5).index_key(), FactValue::Float(4.5));
        assert_eq!(FactValue::from("x").index_key(), FactValue::from("x"));
    }

    #[test]
    fn test_index_key_is_exact_for_large_values() {
        let limit = 1i64 << 53;
        // 2^53 + 1 has no f64 of its own and rounds to 2^53
        assert_eq!(FactValue::Float(9_007_199_254_740_992.0).index_key(), FactValue::Integer(limit));
        assert_ne!(FactValue::Integer(limit + 1).index_key(), FactValue::Float(9_007_199_254_740_992.0).index_key());
        assert_eq!(FactValue::Float(9_007_199_254_740_994.0).index_key(), FactValue::Integer(limit + 2));

        assert_eq!(FactValue::exact_integer(-9_223_372_036_854_775_808.0), Some(i64::MIN));
        assert_eq!(FactValue::exact_integer(9_223_372_036_854_775_808.0), None);
        assert_eq!(FactValue::Float(1e300).index_key(), FactValue::Float(1e300));
        assert!(FactValue::Float(f64::NAN).index_key().as_f64().is_some_and(f64::is_nan));
    }

    #[test]
    fn test_cross_numeric_ordering() {
        assert!(FactValue::Integer(3) < FactValue::Float(3.5));
        assert!(FactValue::Float(7.1) > FactValue::Integer(7));
        assert_eq!(FactValue::from("a").partial_cmp(&FactValue::Integer(1)), None);
    }

    #[test]
    fn test_json_round_trip_rejects_objects() {
        let json = serde_json::json!({"nested": 1});
        assert!(FactValue::try_from(&json).is_err());

        let json = serde_json::json!([1, 2.5, "x", null]);
        let value = FactValue::try_from(&json).unwrap();
        assert_eq!(
            value,
            FactValue::List(vec![
                FactValue::Integer(1),
                FactValue::Float(2.5),
                FactValue::from("x"),
                FactValue::Null,
            ])
        );
        assert_eq!(serde_json::Value::from(&value), json);
    }

    #[test]
    fn test_display() {
        let list = FactValue::List(vec![FactValue::Integer(5), FactValue::from("b")]);
        assert_eq!(list.to_string(), "[5, b]");
        assert_eq!(FactValue::Null.to_string(), "null");
    }
}
