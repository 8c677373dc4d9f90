//! JSON-file-backed settings store with signal-on-change.
//!
//! A flat map of string keys to [`Value`]s, persisted to `settings.json`
//! under the data root. Mutations write through to disk (atomic temp +
//! rename) and publish a [`SettingChanged`] on a broadcast channel so
//! engines can react without polling.
//!
//! Keys whose values must never leave the device (API keys, passwords, the
//! TOTP secret) are listed in [`SENSITIVE_KEYS`] and are excluded from
//! [`SettingsStore::export_json`], which is what the backup engine embeds
//! in archives.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;

use tokio::sync::broadcast;

use crate::value::Value;

/// Keys excluded from backup export.
pub const SENSITIVE_KEYS: &[&str] = &[
    "visualizerPassword",
    "aiApiKey",
    "mqttPassword",
    "totpSecret",
    "sessionSigningKey",
];

/// Published on the change channel after a mutation commits.
#[derive(Debug, Clone)]
pub struct SettingChanged {
    /// The key that changed. Empty when a bulk import replaced the map.
    pub key: String,
}

/// Errors from loading or persisting the settings file.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// Filesystem failure.
    #[error("settings io: {0}")]
    Io(#[from] std::io::Error),
    /// The file exists but does not parse as a JSON object.
    #[error("settings parse: {0}")]
    Parse(#[from] serde_json::Error),
}

/// The store. Cheap to share behind an `Arc`.
pub struct SettingsStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, Value>>,
    changed_tx: broadcast::Sender<SettingChanged>,
}

impl SettingsStore {
    /// Load the store from `path`, starting empty if the file is absent.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let mut entries = BTreeMap::new();

        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let json: serde_json::Value = serde_json::from_str(&text)?;
                if let Some(object) = json.as_object() {
                    for (key, value) in object {
                        if let Some(value) = Value::from_json(value) {
                            entries.insert(key.clone(), value);
                        }
                    }
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
        }

        tracing::debug!(path = %path.display(), keys = entries.len(), "settings loaded");
        let (changed_tx, _) = broadcast::channel(64);
        Ok(Self { path, entries: RwLock::new(entries), changed_tx })
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SettingChanged> {
        self.changed_tx.subscribe()
    }

    /// Get a value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().ok().and_then(|map| map.get(key).cloned())
    }

    /// Boolean accessor with default.
    #[must_use]
    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.get(key).map_or(default, |v| v.bool_or(default))
    }

    /// Integer accessor with default.
    #[must_use]
    pub fn int_or(&self, key: &str, default: i64) -> i64 {
        self.get(key).map_or(default, |v| v.int_or(default))
    }

    /// Float accessor with default.
    #[must_use]
    pub fn float_or(&self, key: &str, default: f64) -> f64 {
        self.get(key).map_or(default, |v| v.float_or(default))
    }

    /// String accessor with default.
    #[must_use]
    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.get(key).map_or_else(|| default.to_string(), |v| v.str_or(default).to_string())
    }

    /// Set a value, persist, and notify.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<(), SettingsError> {
        let value = value.into();
        {
            let mut map = match self.entries.write() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };
            let unchanged = map.get(key) == Some(&value);
            if unchanged {
                return Ok(());
            }
            map.insert(key.to_string(), value);
        }
        self.persist()?;
        let _ = self.changed_tx.send(SettingChanged { key: key.to_string() });
        Ok(())
    }

    /// Remove a key, persist, and notify. A missing key is a no-op.
    pub fn remove(&self, key: &str) -> Result<(), SettingsError> {
        let removed = {
            let mut map = match self.entries.write() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };
            map.remove(key).is_some()
        };
        if removed {
            self.persist()?;
            let _ = self.changed_tx.send(SettingChanged { key: key.to_string() });
        }
        Ok(())
    }

    /// All keys with the given prefix, in sorted order.
    #[must_use]
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .read()
            .map(|map| {
                map.keys().filter(|k| k.starts_with(prefix)).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Export the store as a JSON object.
    ///
    /// With `include_sensitive = false` the [`SENSITIVE_KEYS`] are dropped;
    /// this is the form embedded in backup archives.
    #[must_use]
    pub fn export_json(&self, include_sensitive: bool) -> serde_json::Value {
        let map = match self.entries.read() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        let object: serde_json::Map<String, serde_json::Value> = map
            .iter()
            .filter(|(key, _)| include_sensitive || !SENSITIVE_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect();
        serde_json::Value::Object(object)
    }

    /// Replace or merge the store from an imported JSON object (restore).
    ///
    /// With `merge = true` existing keys not present in `imported` are kept;
    /// otherwise the map is replaced wholesale. Sensitive keys already in
    /// the store survive either way, since exports never contain them.
    pub fn import_json(
        &self,
        imported: &serde_json::Value,
        merge: bool,
    ) -> Result<(), SettingsError> {
        let Some(object) = imported.as_object() else {
            return Ok(());
        };
        {
            let mut map = match self.entries.write() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !merge {
                let preserved: Vec<(String, Value)> = SENSITIVE_KEYS
                    .iter()
                    .filter_map(|k| map.get(*k).map(|v| ((*k).to_string(), v.clone())))
                    .collect();
                map.clear();
                map.extend(preserved);
            }
            for (key, value) in object {
                if let Some(value) = Value::from_json(value) {
                    map.insert(key.clone(), value);
                }
            }
        }
        self.persist()?;
        let _ = self.changed_tx.send(SettingChanged { key: String::new() });
        Ok(())
    }

    /// Write the store to disk atomically (temp file + rename).
    fn persist(&self) -> Result<(), SettingsError> {
        let json = self.export_json(true);
        let text = serde_json::to_string_pretty(&json)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
