//! Persisted operator preferences.
//!
//! A small file-backed JSON key/value store holding state that must survive
//! restarts: the stable client identifier the server uses to reassociate
//! session state across reconnects, and the sound preferences. Writes go
//! through a temp file + rename so a crash mid-write never corrupts the
//! store.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

/// Key under which the stable client identifier is stored.
const CLIENT_ID_KEY: &str = "client_id";

/// Errors from preference store operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PrefsError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for PrefsError {
    fn from(err: std::io::Error) -> Self {
        PrefsError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PrefsError {
    fn from(err: serde_json::Error) -> Self {
        PrefsError::Serialization(err.to_string())
    }
}

/// File-backed JSON preference store.
pub struct PrefsStore {
    path: PathBuf,
    values: RwLock<HashMap<String, Value>>,
}

impl PrefsStore {
    /// Open (or create) the store at `path`. A missing file yields an empty
    /// store; an unreadable one is an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PrefsError> {
        let path = path.into();
        let values = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    /// Typed read of one key. Missing keys and type mismatches both yield
    /// `None` (a mismatch is logged).
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let values = self.values.read();
        let value = values.get(key)?;
        match serde_json::from_value(value.clone()) {
            Ok(typed) => Some(typed),
            Err(error) => {
                warn!(target: "prefs", key, %error, "stored value has unexpected shape");
                None
            }
        }
    }

    /// Typed write of one key, persisted immediately.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), PrefsError> {
        let json = serde_json::to_value(value)?;
        {
            let mut values = self.values.write();
            values.insert(key.to_string(), json);
        }
        self.save()
    }

    /// The stable client identifier, generated and persisted on first use.
    pub fn client_id(&self) -> String {
        if let Some(id) = self.get::<String>(CLIENT_ID_KEY) {
            return id;
        }
        let id = Uuid::new_v4().to_string();
        if let Err(error) = self.set(CLIENT_ID_KEY, &id) {
            warn!(target: "prefs", %error, "failed to persist client id");
        } else {
            debug!(target: "prefs", client_id = %id, "generated new client id");
        }
        id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<(), PrefsError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let serialized = {
            let values = self.values.read();
            serde_json::to_string_pretty(&*values)?
        };
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serialized)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
