#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Process-wide key/value parameter store.
//!
//! Keys are path-like strings (`"nav/max_speed"`); last write wins and entries
//! live for as long as the store does. Reads never fail: a missing key or a
//! value stored with a different type yields the caller's default.

/// Typed parameter values.
pub mod value;

use std::{collections::BTreeMap, fmt, fs, path::Path, sync::Arc};

use parking_lot::RwLock;
use thiserror::Error;

pub use value::{ParamType, ParamValue};

/// Errors raised while seeding the store from a file.
#[derive(Debug, Error)]
pub enum ParamError {
    /// File could not be read.
    #[error("reading parameters from {path}: {source}")]
    Io {
        /// File being read.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// File is not valid TOML.
    #[error("parsing parameters: {0}")]
    Parse(#[from] toml::de::Error),
    /// Value kind has no scalar parameter representation.
    #[error("parameter `{key}` has unsupported {kind} value")]
    UnsupportedValue {
        /// Flattened key.
        key: String,
        /// TOML value kind.
        kind: &'static str,
    },
}

/// Thread-safe parameter registry.
///
/// Cloning is cheap and every clone shares the same entries.
#[derive(Clone, Default)]
pub struct ParameterStore {
    entries: Arc<RwLock<BTreeMap<String, ParamValue>>>,
}

impl fmt::Debug for ParameterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterStore")
            .field("len", &self.len())
            .finish()
    }
}

impl ParameterStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, returning the value it replaced.
    pub fn set(&self, key: impl Into<String>, value: impl Into<ParamValue>) -> Option<ParamValue> {
        let key = key.into();
        let value = value.into();
        tracing::debug!(key = %key, value = %value, "parameter set");
        self.entries.write().insert(key, value)
    }

    /// Returns the stored value as `T`, or `default` when the key is absent or
    /// holds a different type.
    #[must_use]
    pub fn get<T: ParamType>(&self, key: &str, default: T) -> T {
        let entries = self.entries.read();
        match entries.get(key) {
            Some(value) => T::from_param(value).unwrap_or_else(|| {
                tracing::debug!(key, stored = value.kind(), "parameter type mismatch, using default");
                default
            }),
            None => default,
        }
    }

    /// Raw stored value.
    #[must_use]
    pub fn get_value(&self, key: &str) -> Option<ParamValue> {
        self.entries.read().get(key).cloned()
    }

    /// Whether `key` holds a value.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Removes `key`. Returns false when it was not present.
    pub fn delete(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// All keys, sorted.
    #[must_use]
    pub fn list_keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Copy of every entry.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, ParamValue> {
        self.entries.read().clone()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Seeds the store from a TOML file. See [`Self::load_toml_str`].
    pub fn load_toml(&self, path: impl AsRef<Path>) -> Result<usize, ParamError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ParamError::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.load_toml_str(&raw)
    }

    /// Seeds the store from a TOML document, flattening nested tables into
    /// `/`-separated keys. Nothing is written unless the whole document is valid.
    pub fn load_toml_str(&self, raw: &str) -> Result<usize, ParamError> {
        let table: toml::Table = raw.parse()?;
        self.load_table(&table, "")
    }

    /// Seeds the store from an already parsed table, prefixing every key with
    /// `prefix` (pass `""` for none).
    pub fn load_table(&self, table: &toml::Table, prefix: &str) -> Result<usize, ParamError> {
        let mut flat = Vec::new();
        flatten(table, prefix, &mut flat)?;
        let count = flat.len();
        let mut entries = self.entries.write();
        for (key, value) in flat {
            entries.insert(key, value);
        }
        drop(entries);
        tracing::debug!(count, "parameters loaded");
        Ok(count)
    }
}

fn flatten(
    table: &toml::Table,
    prefix: &str,
    out: &mut Vec<(String, ParamValue)>,
) -> Result<(), ParamError> {
    for (name, value) in table {
        let key = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}/{name}", prefix.trim_end_matches('/'))
        };
        let param = match value {
            toml::Value::Table(inner) => {
                flatten(inner, &key, out)?;
                continue;
            }
            toml::Value::Boolean(b) => ParamValue::Bool(*b),
            toml::Value::Integer(i) => ParamValue::Int(*i),
            toml::Value::Float(f) => ParamValue::Float(*f),
            toml::Value::String(s) => ParamValue::Text(s.clone()),
            toml::Value::Datetime(dt) => ParamValue::Text(dt.to_string()),
            toml::Value::Array(_) => {
                return Err(ParamError::UnsupportedValue { key, kind: "array" });
            }
        };
        out.push((key, param));
    }
    Ok(())
}
