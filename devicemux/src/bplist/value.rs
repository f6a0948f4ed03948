//! Property list value model shared by the binary codec and the XML
//! collaborator.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::DeviceMuxError;

/// Seconds between the Unix epoch and 2001-01-01T00:00:00Z, the reference
/// date binary plists count from.
pub(crate) const APPLE_EPOCH_OFFSET: f64 = 978_307_200.0;

/// A property list value.
///
/// Dates are kept as seconds relative to the Apple epoch. Strings are one
/// variant regardless of wire encoding; the binary encoder picks the
/// ASCII or UTF-16 record form by content.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Date(f64),
    Data(Vec<u8>),
    String(String),
    Array(Vec<Value>),
    Dictionary(Dictionary),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_signed_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            Value::Data(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<&Dictionary> {
        match self {
            Value::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_dictionary(self) -> Option<Dictionary> {
        match self {
            Value::Dictionary(d) => Some(d),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i.into())
    }
}

impl From<u16> for Value {
    fn from(i: u16) -> Self {
        Value::Integer(i.into())
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Integer(i.into())
    }
}

impl From<f64> for Value {
    fn from(r: f64) -> Self {
        Value::Real(r)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(d: Vec<u8>) -> Self {
        Value::Data(d)
    }
}

impl From<Vec<Value>> for Value {
    fn from(a: Vec<Value>) -> Self {
        Value::Array(a)
    }
}

impl From<Dictionary> for Value {
    fn from(d: Dictionary) -> Self {
        Value::Dictionary(d)
    }
}

/// An insertion-ordered string-keyed map.
///
/// Iteration order is the order keys were first inserted, which is
/// observable in the binary encoding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dictionary {
    entries: Vec<(String, Value)>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a key/value pair. Re-inserting an existing key replaces the
    /// value in place without changing the key's position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let at = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(at).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, Value)> for Dictionary {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        let mut dict = Dictionary::new();
        for (k, v) in iter {
            dict.insert(k, v);
        }
        dict
    }
}

pub(crate) fn apple_to_system_time(secs: f64) -> SystemTime {
    let unix = secs + APPLE_EPOCH_OFFSET;
    if unix >= 0.0 {
        UNIX_EPOCH + Duration::from_secs_f64(unix)
    } else {
        UNIX_EPOCH - Duration::from_secs_f64(-unix)
    }
}

pub(crate) fn system_time_to_apple(time: SystemTime) -> f64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64() - APPLE_EPOCH_OFFSET,
        Err(e) => -e.duration().as_secs_f64() - APPLE_EPOCH_OFFSET,
    }
}

impl TryFrom<plist::Value> for Value {
    type Error = DeviceMuxError;

    fn try_from(value: plist::Value) -> Result<Self, Self::Error> {
        Ok(match value {
            plist::Value::Boolean(b) => Value::Boolean(b),
            plist::Value::Integer(i) => match i.as_signed() {
                Some(s) => Value::Integer(s),
                // Beyond i64: keep the two's-complement bit pattern, the
                // same policy the binary codec applies to width-8 records.
                None => Value::Integer(i.as_unsigned().unwrap_or_default() as i64),
            },
            plist::Value::Real(r) => Value::Real(r),
            plist::Value::Date(d) => Value::Date(system_time_to_apple(d.into())),
            plist::Value::Data(d) => Value::Data(d),
            plist::Value::String(s) => Value::String(s),
            plist::Value::Uid(u) => Value::Integer(u.get() as i64),
            plist::Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(Value::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            plist::Value::Dictionary(entries) => {
                let mut dict = Dictionary::new();
                for (key, value) in entries {
                    dict.insert(key, Value::try_from(value)?);
                }
                Value::Dictionary(dict)
            }
            _ => return Err(DeviceMuxError::UnexpectedResponse),
        })
    }
}

impl TryFrom<&Value> for plist::Value {
    type Error = DeviceMuxError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        Ok(match value {
            Value::Null => return Err(DeviceMuxError::NotXmlRepresentable),
            Value::Boolean(b) => plist::Value::Boolean(*b),
            Value::Integer(i) => plist::Value::Integer((*i).into()),
            Value::Real(r) => plist::Value::Real(*r),
            Value::Date(d) => {
                if !d.is_finite() {
                    return Err(DeviceMuxError::DateOutOfRange);
                }
                plist::Value::Date(plist::Date::from(apple_to_system_time(*d)))
            }
            Value::Data(d) => plist::Value::Data(d.clone()),
            Value::String(s) => plist::Value::String(s.clone()),
            Value::Array(items) => plist::Value::Array(
                items
                    .iter()
                    .map(plist::Value::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            Value::Dictionary(dict) => {
                let mut entries = plist::Dictionary::new();
                for (key, value) in dict.iter() {
                    entries.insert(key.to_string(), plist::Value::try_from(value)?);
                }
                plist::Value::Dictionary(entries)
            }
        })
    }
}
