//! Conversation persistence and index.
//!
//! Conversations live in the settings store under `ai_conversations/<key>`
//! as maps carrying the index metadata (bean, profile, timestamp, context
//! label) alongside the serialized messages. Listing reads only the
//! metadata fields, so the index stays cheap even when conversations grow
//! long. The backup engine exports the same entries into the archive's
//! `settings.json` as the `ai_conversations` array.

use std::collections::BTreeMap;
use std::sync::Arc;

use decenza_core::{SettingsStore, Value};
use serde::{Deserialize, Serialize};

use crate::conversation::{Conversation, Message};

/// Key prefix for conversation entries in the settings store.
pub const KEY_PREFIX: &str = "ai_conversations/";

/// Index metadata for one saved conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationIndexEntry {
    /// Stable key under which the conversation persists.
    pub key: String,
    /// Bean brand at save time.
    pub bean_brand: String,
    /// Bean type at save time.
    pub bean_type: String,
    /// Profile name at save time.
    pub profile_name: String,
    /// Unix seconds of the last save.
    pub timestamp: i64,
    /// Human label for the dialing context.
    pub context_label: String,
}

/// Errors from conversation persistence.
#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    /// Underlying settings store failure.
    #[error(transparent)]
    Settings(#[from] decenza_core::SettingsError),
    /// The stored entry does not decode as a conversation.
    #[error("conversation decode: {0}")]
    Decode(String),
}

/// Conversation store over the settings key/value store.
#[derive(Clone)]
pub struct ConversationStore {
    settings: Arc<SettingsStore>,
}

impl ConversationStore {
    /// Wrap a settings store.
    #[must_use]
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self { settings }
    }

    /// Persist a conversation with its index metadata.
    pub fn save(
        &self,
        entry: &ConversationIndexEntry,
        conversation: &Conversation,
    ) -> Result<(), ConversationError> {
        let messages = serde_json::to_value(&conversation.messages)
            .map_err(|e| ConversationError::Decode(e.to_string()))?;

        let mut map = BTreeMap::new();
        map.insert("key".to_string(), Value::Str(entry.key.clone()));
        map.insert("beanBrand".to_string(), Value::Str(entry.bean_brand.clone()));
        map.insert("beanType".to_string(), Value::Str(entry.bean_type.clone()));
        map.insert("profileName".to_string(), Value::Str(entry.profile_name.clone()));
        map.insert("timestamp".to_string(), Value::Int(entry.timestamp));
        map.insert("contextLabel".to_string(), Value::Str(entry.context_label.clone()));
        map.insert(
            "systemPrompt".to_string(),
            Value::Str(conversation.system_prompt.clone()),
        );
        if let Some(messages) = Value::from_json(&messages) {
            map.insert("messages".to_string(), messages);
        }

        self.settings.set(&format!("{KEY_PREFIX}{}", entry.key), Value::Map(map))?;
        Ok(())
    }

    /// List index entries, newest first, without decoding message bodies.
    #[must_use]
    pub fn list(&self) -> Vec<ConversationIndexEntry> {
        let mut entries: Vec<ConversationIndexEntry> = self
            .settings
            .keys_with_prefix(KEY_PREFIX)
            .into_iter()
            .filter_map(|key| {
                let value = self.settings.get(&key)?;
                let map = value.map()?.clone();
                Some(ConversationIndexEntry {
                    key: key.strip_prefix(KEY_PREFIX).unwrap_or(&key).to_string(),
                    bean_brand: map.get("beanBrand").map_or_else(String::new, |v| v.str_or("").to_string()),
                    bean_type: map.get("beanType").map_or_else(String::new, |v| v.str_or("").to_string()),
                    profile_name: map
                        .get("profileName")
                        .map_or_else(String::new, |v| v.str_or("").to_string()),
                    timestamp: map.get("timestamp").map_or(0, |v| v.int_or(0)),
                    context_label: map
                        .get("contextLabel")
                        .map_or_else(String::new, |v| v.str_or("").to_string()),
                })
            })
            .collect();
        entries.sort_by_key(|e| std::cmp::Reverse(e.timestamp));
        entries
    }

    /// Load one conversation by key.
    pub fn load(&self, key: &str) -> Result<Option<Conversation>, ConversationError> {
        let Some(value) = self.settings.get(&format!("{KEY_PREFIX}{key}")) else {
            return Ok(None);
        };
        let Some(map) = value.map() else {
            return Err(ConversationError::Decode("entry is not a map".to_string()));
        };

        let system_prompt =
            map.get("systemPrompt").map_or_else(String::new, |v| v.str_or("").to_string());
        let messages: Vec<Message> = match map.get("messages") {
            Some(value) => serde_json::from_value(value.to_json())
                .map_err(|e| ConversationError::Decode(e.to_string()))?,
            None => Vec::new(),
        };
        Ok(Some(Conversation { system_prompt, messages }))
    }

    /// Delete one conversation. Missing keys are a no-op.
    pub fn delete(&self, key: &str) -> Result<(), ConversationError> {
        self.settings.remove(&format!("{KEY_PREFIX}{key}"))?;
        Ok(())
    }

    /// Export all conversations as the backup `ai_conversations` array.
    #[must_use]
    pub fn export_all(&self) -> serde_json::Value {
        let items: Vec<serde_json::Value> = self
            .settings
            .keys_with_prefix(KEY_PREFIX)
            .into_iter()
            .filter_map(|key| self.settings.get(&key).map(|v| v.to_json()))
            .collect();
        serde_json::Value::Array(items)
    }

    /// Import conversations from a backup `ai_conversations` array.
    ///
    /// With `merge = true` existing keys win; otherwise imported entries
    /// overwrite.
    pub fn import_all(
        &self,
        array: &serde_json::Value,
        merge: bool,
    ) -> Result<usize, ConversationError> {
        let Some(items) = array.as_array() else { return Ok(0) };
        let mut imported = 0usize;
        for item in items {
            let Some(key) = item.get("key").and_then(|k| k.as_str()) else {
                continue;
            };
            let full_key = format!("{KEY_PREFIX}{key}");
            if merge && self.settings.get(&full_key).is_some() {
                continue;
            }
            if let Some(value) = Value::from_json(item) {
                self.settings.set(&full_key, value)?;
                imported += 1;
            }
        }
        Ok(imported)
    }
}
