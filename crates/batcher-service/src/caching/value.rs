use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Number;

/// A value that can be memoized by the [`Scheduler`](super::Scheduler).
///
/// Every value can be held in memory. Only values that report themselves as serializable are
/// written to the cache snapshot and can survive a restart.
pub trait CacheValue: 'static + Send + Sync + Clone {
    /// Tells whether this value can be written to the cache snapshot and read back without loss.
    ///
    /// The [`Scheduler`](super::Scheduler) probes this once, when the value is first cached.
    fn is_serializable(&self) -> bool;

    /// Converts the value into the JSON form stored in the cache snapshot.
    ///
    /// Returns `None` for values that are not serializable.
    fn to_persisted(&self) -> Option<serde_json::Value>;

    /// Restores a value from the cache snapshot.
    ///
    /// Returns `None` if the persisted data does not describe a valid value.
    fn from_persisted(value: serde_json::Value) -> Option<Self>;
}

/// A cacheable value.
///
/// All variants except [`Opaque`](Self::Opaque) form a closed union of primitives, lists and maps
/// which can be persisted. Floats are only serializable when they are finite, as JSON has no
/// representation for `NaN` or infinities.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// An in-memory only value, such as a client handle.
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl Value {
    /// Wraps an arbitrary value that is only ever kept in memory.
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        Self::Opaque(Arc::new(value))
    }

    /// Returns a reference to the wrapped value if this is an [`Opaque`](Self::Opaque) of type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Self::Opaque(value) => value.downcast_ref(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl CacheValue for Value {
    fn is_serializable(&self) -> bool {
        match self {
            Self::Null | Self::Bool(_) | Self::Int(_) | Self::String(_) => true,
            Self::Float(f) => f.is_finite(),
            Self::List(items) => items.iter().all(Self::is_serializable),
            Self::Map(map) => map.values().all(Self::is_serializable),
            Self::Opaque(_) => false,
        }
    }

    fn to_persisted(&self) -> Option<serde_json::Value> {
        Some(match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::Number((*i).into()),
            Self::Float(f) => serde_json::Value::Number(Number::from_f64(*f)?),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::List(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(Self::to_persisted)
                    .collect::<Option<_>>()?,
            ),
            Self::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| Some((k.clone(), v.to_persisted()?)))
                    .collect::<Option<_>>()?,
            ),
            Self::Opaque(_) => return None,
        })
    }

    fn from_persisted(value: serde_json::Value) -> Option<Self> {
        Some(match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                // floats, and integers beyond the `i64` range
                None => Self::Float(n.as_f64()?),
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => Self::List(
                items
                    .into_iter()
                    .map(Self::from_persisted)
                    .collect::<Option<_>>()?,
            ),
            serde_json::Value::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| Some((k, Self::from_persisted(v)?)))
                    .collect::<Option<_>>()?,
            ),
        })
    }
}

/// Plain JSON values are always serializable.
impl CacheValue for serde_json::Value {
    fn is_serializable(&self) -> bool {
        true
    }

    fn to_persisted(&self) -> Option<serde_json::Value> {
        Some(self.clone())
    }

    fn from_persisted(value: serde_json::Value) -> Option<Self> {
        Some(value)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Self::Int(i) => f.debug_tuple("Int").field(i).finish(),
            Self::Float(x) => f.debug_tuple("Float").field(x).finish(),
            Self::String(s) => f.debug_tuple("String").field(s).finish(),
            Self::List(items) => f.debug_tuple("List").field(items).finish(),
            Self::Map(map) => f.debug_tuple("Map").field(map).finish(),
            Self::Opaque(_) => f.write_str("Opaque(..)"),
        }
    }
}

/// Opaque values are only equal to themselves.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Opaque(a), Self::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}
