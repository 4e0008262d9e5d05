//! Session-scoped key/value persistence for the origination workflow.
//!
//! The backend holds raw strings per key; [`SessionStateStore`] owns the JSON
//! encoding and treats anything it cannot decode as absent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// Logical slots persisted for a workflow session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKey {
    EligibilityResult,
    RetainedProfileForMatching,
    MatchResults,
}

impl SessionKey {
    pub const fn workflow_keys() -> [Self; 3] {
        [
            Self::EligibilityResult,
            Self::RetainedProfileForMatching,
            Self::MatchResults,
        ]
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EligibilityResult => "eligibilityResult",
            Self::RetainedProfileForMatching => "retainedProfileForMatching",
            Self::MatchResults => "matchResults",
        }
    }
}

/// Raw storage medium scoped to one browsing session.
pub trait SessionBackend: Send + Sync {
    fn read(&self, key: &str) -> Option<String>;
    fn write(&self, key: &str, value: String);
    fn delete(&self, key: &str);

    /// Must remove every key or none.
    fn delete_all(&self, keys: &[&str]) {
        for key in keys {
            self.delete(key);
        }
    }
}

/// Shared in-memory backend. Clones observe the same entries, which is how a
/// page reload is modelled: a fresh controller over a clone of the backend.
#[derive(Debug, Default, Clone)]
pub struct MemorySessionBackend {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemorySessionBackend {
    pub fn raw(&self, key: &str) -> Option<String> {
        self.read(key)
    }

    pub fn insert_raw(&self, key: &str, value: impl Into<String>) {
        self.write(key, value.into());
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("session mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionBackend for MemorySessionBackend {
    fn read(&self, key: &str) -> Option<String> {
        let guard = self.entries.lock().expect("session mutex poisoned");
        guard.get(key).cloned()
    }

    fn write(&self, key: &str, value: String) {
        let mut guard = self.entries.lock().expect("session mutex poisoned");
        guard.insert(key.to_string(), value);
    }

    fn delete(&self, key: &str) {
        let mut guard = self.entries.lock().expect("session mutex poisoned");
        guard.remove(key);
    }

    fn delete_all(&self, keys: &[&str]) {
        let mut guard = self.entries.lock().expect("session mutex poisoned");
        for key in keys {
            guard.remove(*key);
        }
    }
}

/// Persisted value that failed to decode.
#[derive(Debug, thiserror::Error)]
#[error("session value for '{key}' is corrupted: {source}")]
pub struct StateCorruption {
    pub key: &'static str,
    #[source]
    pub source: serde_json::Error,
}

#[derive(Debug, thiserror::Error)]
#[error("failed to encode session value for '{key}': {source}")]
pub struct SessionWriteError {
    pub key: &'static str,
    #[source]
    pub source: serde_json::Error,
}

/// Typed facade over a [`SessionBackend`].
pub struct SessionStateStore<B> {
    backend: B,
}

impl<B: SessionBackend> SessionStateStore<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns `None` for a missing key and for a corrupted one; the latter is removed.
    pub fn get<T: DeserializeOwned>(&self, key: SessionKey) -> Option<T> {
        match self.decode(key) {
            Ok(value) => value,
            Err(corruption) => {
                warn!(key = corruption.key, error = %corruption.source, "discarding corrupted session value");
                self.backend.delete(key.as_str());
                None
            }
        }
    }

    fn decode<T: DeserializeOwned>(&self, key: SessionKey) -> Result<Option<T>, StateCorruption> {
        let Some(raw) = self.backend.read(key.as_str()) else {
            return Ok(None);
        };

        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StateCorruption {
                key: key.as_str(),
                source,
            })
    }

    /// Overwrites the whole value stored under `key`.
    pub fn set<T: Serialize>(&self, key: SessionKey, value: &T) -> Result<(), SessionWriteError> {
        let encoded = serde_json::to_string(value).map_err(|source| SessionWriteError {
            key: key.as_str(),
            source,
        })?;
        self.backend.write(key.as_str(), encoded);
        Ok(())
    }

    pub fn contains(&self, key: SessionKey) -> bool {
        self.backend.read(key.as_str()).is_some()
    }

    pub fn remove(&self, key: SessionKey) {
        self.backend.delete(key.as_str());
    }

    pub fn clear_all(&self, keys: &[SessionKey]) {
        let names: Vec<&str> = keys.iter().map(|key| key.as_str()).collect();
        self.backend.delete_all(&names);
    }
}
