//! Credential storage for tokenrelay clients

use base64::Engine;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{RelayError, Result};

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const USERNAME_KEY: &str = "username";

/// Persistent key-value storage for session credentials
pub trait TokenStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;

    /// Remove several keys at once; every key is attempted even if one fails
    fn remove_all(&self, keys: &[&str]) -> Result<()> {
        keys.iter()
            .map(|key| self.remove(key))
            .collect::<Vec<_>>()
            .into_iter()
            .collect()
    }
}

/// Process-local storage, lost on exit
#[derive(Debug, Default)]
pub struct MemoryTokenStorage {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryTokenStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TokenStorage for MemoryTokenStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries().remove(key);
        Ok(())
    }
}

/// File storage configuration
#[derive(Debug, Clone)]
pub struct FileStorageConfig {
    pub storage_path: PathBuf,
    pub encryption_key: Option<String>,
}

/// JSON file storage, optionally obfuscated with a configured key
#[derive(Debug)]
pub struct FileTokenStorage {
    config: FileStorageConfig,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileTokenStorage {
    pub fn new(mut config: FileStorageConfig) -> Result<Self> {
        config.encryption_key = config.encryption_key.filter(|k| !k.is_empty());
        let entries = Self::load_entries(&config)?;
        Ok(Self {
            config,
            entries: Mutex::new(entries),
        })
    }

    pub fn storage_path(&self) -> &Path {
        &self.config.storage_path
    }

    fn load_entries(config: &FileStorageConfig) -> Result<BTreeMap<String, String>> {
        let path = &config.storage_path;

        if !path.exists() {
            return Ok(BTreeMap::new());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| RelayError::storage(format!("Failed to read token storage: {}", e)))?;

        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        let decrypted_content = match &config.encryption_key {
            Some(key) => decrypt_content(content.trim(), key)?,
            None => content,
        };

        serde_json::from_str(&decrypted_content)
            .map_err(|e| RelayError::storage(format!("Failed to parse token storage: {}", e)))
    }

    fn save_entries(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let path = &self.config.storage_path;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                RelayError::storage(format!("Failed to create storage directory: {}", e))
            })?;
        }

        let content = serde_json::to_string_pretty(entries)
            .map_err(|e| RelayError::storage(format!("Failed to serialize tokens: {}", e)))?;

        let final_content = match &self.config.encryption_key {
            Some(key) => encrypt_content(&content, key),
            None => content,
        };

        fs::write(path, final_content)
            .map_err(|e| RelayError::storage(format!("Failed to write token storage: {}", e)))?;

        Ok(())
    }

    /// Apply `f` to a copy of the entries and keep it only once it is on disk
    fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut updated = entries.clone();
        f(&mut updated);
        self.save_entries(&updated)?;
        *entries = updated;
        Ok(())
    }
}

impl TokenStorage for FileTokenStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.update(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.update(|entries| {
            entries.remove(key);
        })
    }

    fn remove_all(&self, keys: &[&str]) -> Result<()> {
        self.update(|entries| {
            for key in keys {
                entries.remove(*key);
            }
        })
    }
}

fn encrypt_content(content: &str, key: &str) -> String {
    let key_bytes = key.as_bytes();
    let encrypted: Vec<u8> = content
        .as_bytes()
        .iter()
        .enumerate()
        .map(|(i, &byte)| byte ^ key_bytes[i % key_bytes.len()])
        .collect();

    base64::engine::general_purpose::STANDARD.encode(encrypted)
}

fn decrypt_content(encrypted_content: &str, key: &str) -> Result<String> {
    let encrypted_bytes = base64::engine::general_purpose::STANDARD
        .decode(encrypted_content)
        .map_err(|e| RelayError::storage(format!("Failed to decode encrypted content: {}", e)))?;

    let key_bytes = key.as_bytes();
    let decrypted: Vec<u8> = encrypted_bytes
        .iter()
        .enumerate()
        .map(|(i, &byte)| byte ^ key_bytes[i % key_bytes.len()])
        .collect();

    String::from_utf8(decrypted)
        .map_err(|e| RelayError::storage(format!("Failed to decode decrypted content: {}", e)))
}

/// Typed view over a [`TokenStorage`] holding one session's credentials
#[derive(Clone)]
pub struct CredentialStore {
    storage: Arc<dyn TokenStorage>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("has_access_token", &self.access_token().is_some())
            .field("has_refresh_token", &self.refresh_token().is_some())
            .finish()
    }
}

impl CredentialStore {
    pub fn new(storage: Arc<dyn TokenStorage>) -> Self {
        Self { storage }
    }

    pub fn access_token(&self) -> Option<String> {
        self.storage.get(ACCESS_TOKEN_KEY).filter(|t| !t.is_empty())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.storage.get(REFRESH_TOKEN_KEY).filter(|t| !t.is_empty())
    }

    pub fn username(&self) -> Option<String> {
        self.storage.get(USERNAME_KEY)
    }

    pub fn has_tokens(&self) -> bool {
        self.access_token().is_some()
    }

    /// Replace the access token, and the refresh token when the server rotated it
    pub fn save_pair(&self, access_token: &str, refresh_token: Option<&str>) -> Result<()> {
        self.storage.set(ACCESS_TOKEN_KEY, access_token)?;
        if let Some(refresh_token) = refresh_token {
            self.storage.set(REFRESH_TOKEN_KEY, refresh_token)?;
        }
        Ok(())
    }

    pub fn save_login(
        &self,
        access_token: &str,
        refresh_token: &str,
        username: Option<&str>,
    ) -> Result<()> {
        self.save_pair(access_token, Some(refresh_token))?;
        match username {
            Some(username) => self.storage.set(USERNAME_KEY, username),
            None => self.storage.remove(USERNAME_KEY),
        }
    }

    /// Remove every session key together
    pub fn clear(&self) -> Result<()> {
        self.storage
            .remove_all(&[ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USERNAME_KEY])
    }
}
