//! Immutable, typed service metadata.
//!
//! A [`Properties`] value is a snapshot: every modification produces a new
//! snapshot and existing ones are never changed, so a snapshot handed to an
//! in-flight event or a tracker stays stable for as long as it is held.
//!
//! ```rust
//! use musubi::properties::{Properties, SERVICE_RANKING};
//!
//! let props = Properties::builder()
//!     .set("lang", "en")
//!     .set(SERVICE_RANKING, 10)
//!     .build();
//! let updated = props.with("lang", "ja");
//!
//! assert_eq!(props.get_as_string("lang").as_deref(), Some("en"));
//! assert_eq!(updated.get_as_string("lang").as_deref(), Some("ja"));
//! assert_eq!(updated.get_as_long(SERVICE_RANKING), Some(10));
//! ```

use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::version::Version;

/// Name of the service interface; stamped by the registry.
pub const SERVICE_NAME: &str = "objectClass";
/// Registry assigned service id, read-only.
pub const SERVICE_ID: &str = "service.id";
/// Ranking used to pick among matches, default `0`.
pub const SERVICE_RANKING: &str = "service.ranking";
pub const SERVICE_VERSION: &str = "service.version";
/// Id of the bundle owning the registration; stamped by the registry.
pub const SERVICE_BUNDLE_ID: &str = "service.bundleid";

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    String(String),
    Long(i64),
    Double(f64),
    Bool(bool),
    Version(Version),
}

impl PropertyValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::String(_) => "string",
            PropertyValue::Long(_) => "long",
            PropertyValue::Double(_) => "double",
            PropertyValue::Bool(_) => "bool",
            PropertyValue::Version(_) => "version",
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::String(s) => write!(f, "{}", s),
            PropertyValue::Long(l) => write!(f, "{}", l),
            PropertyValue::Double(d) => write!(f, "{}", d),
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Version(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Long(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Long(value as i64)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Double(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<Version> for PropertyValue {
    fn from(value: Version) -> Self {
        PropertyValue::Version(value)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    entries: Arc<BTreeMap<String, PropertyValue>>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> PropertiesBuilder {
        PropertiesBuilder::default()
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// New snapshot with `key` set to `value`.
    pub fn with<K: Into<String>, V: Into<PropertyValue>>(&self, key: K, value: V) -> Self {
        let mut entries = (*self.entries).clone();
        entries.insert(key.into(), value.into());
        Self {
            entries: Arc::new(entries),
        }
    }

    /// New snapshot without `key`.
    pub fn without(&self, key: &str) -> Self {
        if !self.contains(key) {
            return self.clone();
        }
        let mut entries = (*self.entries).clone();
        entries.remove(key);
        Self {
            entries: Arc::new(entries),
        }
    }

    /// New snapshot containing `other`'s entries on top of these.
    pub fn merged(&self, other: &Properties) -> Self {
        let mut entries = (*self.entries).clone();
        for (k, v) in other.iter() {
            entries.insert(k.to_string(), v.clone());
        }
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Whether both values share the same underlying snapshot.
    pub fn same_snapshot(&self, other: &Properties) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries)
    }

    pub fn get_as_string(&self, key: &str) -> Option<String> {
        self.get(key).map(|v| v.to_string())
    }

    pub fn get_as_long(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            PropertyValue::Long(l) => Some(*l),
            PropertyValue::Double(d) => Some(*d as i64),
            PropertyValue::String(s) => s.trim().parse().ok(),
            PropertyValue::Bool(_) | PropertyValue::Version(_) => None,
        }
    }

    pub fn get_as_double(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            PropertyValue::Double(d) => Some(*d),
            PropertyValue::Long(l) => Some(*l as f64),
            PropertyValue::String(s) => s.trim().parse().ok(),
            PropertyValue::Bool(_) | PropertyValue::Version(_) => None,
        }
    }

    pub fn get_as_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            PropertyValue::Bool(b) => Some(*b),
            PropertyValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn get_as_version(&self, key: &str) -> Option<Version> {
        match self.get(key)? {
            PropertyValue::Version(v) => Some(v.clone()),
            PropertyValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        write!(f, "}}")
    }
}

impl<K: Into<String>, V: Into<PropertyValue>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: Arc::new(
                iter.into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Default)]
pub struct PropertiesBuilder {
    entries: BTreeMap<String, PropertyValue>,
}

impl PropertiesBuilder {
    pub fn set<K: Into<String>, V: Into<PropertyValue>>(mut self, key: K, value: V) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Properties {
        Properties {
            entries: Arc::new(self.entries),
        }
    }
}
