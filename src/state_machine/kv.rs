//! Key-value store state machine.
//!
//! State-changing operations travel through the replicated log as
//! serialized [`Op`] values; reads go straight to the local store via
//! `get()`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{ApplyResult, Snapshotable, StateMachine};

/// A state-changing operation on the store. Serialized to bytes before it
/// enters the log; the consensus layer never looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Put { key: String, value: String },
    Delete { key: String },
}

impl Op {
    /// Serialize for submission to the log.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("encode kv op")
    }
}

/// Simple in-memory key-value store.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KeyValueStore {
    data: HashMap<String, String>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        KeyValueStore {
            data: HashMap::new(),
        }
    }

    /// Read a value locally, bypassing the log.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    /// All key-value pairs, for test assertions.
    pub fn all(&self) -> HashMap<String, String> {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl StateMachine for KeyValueStore {
    fn apply(&mut self, command: &[u8]) -> ApplyResult {
        let op: Op =
            serde_json::from_slice(command).map_err(|e| format!("unknown command: {}", e))?;
        match op {
            Op::Put { key, value } => {
                self.data.insert(key, value);
                Ok(String::new())
            }
            Op::Delete { key } => {
                if self.data.remove(&key).is_some() {
                    Ok(String::new())
                } else {
                    Err("NOT_FOUND".to_string())
                }
            }
        }
    }
}

impl Snapshotable for KeyValueStore {
    fn snapshot(&self) -> Result<Vec<u8>, String> {
        serde_json::to_vec(&self.data).map_err(|e| format!("snapshot serialization: {}", e))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), String> {
        self.data = serde_json::from_slice(data)
            .map_err(|e| format!("snapshot deserialization: {}", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &str, value: &str) -> Vec<u8> {
        Op::Put {
            key: key.to_string(),
            value: value.to_string(),
        }
        .encode()
    }

    fn delete(key: &str) -> Vec<u8> {
        Op::Delete {
            key: key.to_string(),
        }
        .encode()
    }

    #[test]
    fn test_put_and_get() {
        let mut kv = KeyValueStore::new();
        kv.apply(&put("foo", "bar")).unwrap();
        assert_eq!(kv.get("foo"), Some("bar".to_string()));
        assert_eq!(kv.get("missing"), None);
    }

    #[test]
    fn test_overwrite() {
        let mut kv = KeyValueStore::new();
        kv.apply(&put("key", "v1")).unwrap();
        kv.apply(&put("key", "v2")).unwrap();
        assert_eq!(kv.get("key"), Some("v2".to_string()));
    }

    #[test]
    fn test_delete() {
        let mut kv = KeyValueStore::new();
        kv.apply(&put("foo", "bar")).unwrap();
        kv.apply(&delete("foo")).unwrap();
        assert_eq!(kv.get("foo"), None);
    }

    #[test]
    fn test_delete_missing() {
        let mut kv = KeyValueStore::new();
        assert_eq!(kv.apply(&delete("ghost")), Err("NOT_FOUND".to_string()));
    }

    #[test]
    fn test_garbage_command_rejected() {
        let mut kv = KeyValueStore::new();
        let result = kv.apply(b"not json at all");
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("unknown command"));
    }

    #[test]
    fn test_snapshot_and_restore() {
        let mut kv1 = KeyValueStore::new();
        kv1.apply(&put("k1", "v1")).unwrap();
        kv1.apply(&put("k2", "v2")).unwrap();

        let blob = kv1.snapshot().unwrap();

        let mut kv2 = KeyValueStore::new();
        kv2.apply(&put("stale", "data")).unwrap();
        kv2.restore(&blob).unwrap();

        assert_eq!(kv2.get("k1"), Some("v1".to_string()));
        assert_eq!(kv2.get("k2"), Some("v2".to_string()));
        assert_eq!(kv2.get("stale"), None);
    }

    #[test]
    fn test_restore_invalid_data() {
        let mut kv = KeyValueStore::new();
        assert!(kv.restore(b"junk").is_err());
    }
}
