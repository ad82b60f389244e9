//! Registry of live calls
//!
//! Holds metadata only. Executors stay inside their connection tasks, so a
//! slow call never blocks the registry.

use crate::{Result, ServerError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Metadata for one connected call
#[derive(Debug, Clone, Serialize)]
pub struct CallEntry {
    pub connection_id: String,
    /// Set once the call has been initialized
    pub session_id: Option<String>,
    pub caller_id: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub turns: u64,
}

pub struct CallRegistry {
    calls: DashMap<String, CallEntry>,
    max_calls: usize,
    total_connected: AtomicU64,
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl CallRegistry {
    pub fn new(max_calls: usize) -> Self {
        Self {
            calls: DashMap::new(),
            max_calls,
            total_connected: AtomicU64::new(0),
        }
    }

    /// Register a new connection and return its id
    pub fn connect(&self) -> Result<String> {
        if self.calls.len() >= self.max_calls {
            return Err(ServerError::CallLimit(self.max_calls));
        }

        let connection_id = Uuid::new_v4().to_string();
        self.calls.insert(
            connection_id.clone(),
            CallEntry {
                connection_id: connection_id.clone(),
                session_id: None,
                caller_id: None,
                connected_at: Utc::now(),
                turns: 0,
            },
        );
        self.total_connected.fetch_add(1, Ordering::Relaxed);
        Ok(connection_id)
    }

    /// Record the session created for a connection
    pub fn attach(&self, connection_id: &str, session_id: &str, caller_id: &str) {
        if let Some(mut entry) = self.calls.get_mut(connection_id) {
            entry.session_id = Some(session_id.to_string());
            entry.caller_id = Some(caller_id.to_string());
        }
    }

    /// Count one processed utterance; returns the new total
    pub fn record_turn(&self, connection_id: &str) -> u64 {
        match self.calls.get_mut(connection_id) {
            Some(mut entry) => {
                entry.turns += 1;
                entry.turns
            }
            None => 0,
        }
    }

    pub fn disconnect(&self, connection_id: &str) -> Option<CallEntry> {
        self.calls.remove(connection_id).map(|(_, entry)| entry)
    }

    pub fn get(&self, connection_id: &str) -> Option<CallEntry> {
        self.calls.get(connection_id).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn total_connected(&self) -> u64 {
        self.total_connected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_and_disconnect() {
        let registry = CallRegistry::default();
        let id = registry.connect().unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&id).unwrap().session_id.is_none());

        let entry = registry.disconnect(&id).unwrap();
        assert_eq!(entry.connection_id, id);
        assert!(registry.is_empty());
        assert!(registry.disconnect(&id).is_none());
        assert_eq!(registry.total_connected(), 1);
    }

    #[test]
    fn test_call_limit() {
        let registry = CallRegistry::new(2);
        let first = registry.connect().unwrap();
        registry.connect().unwrap();
        assert!(matches!(registry.connect(), Err(ServerError::CallLimit(2))));

        registry.disconnect(&first);
        assert!(registry.connect().is_ok());
        assert_eq!(registry.total_connected(), 3);
    }

    #[test]
    fn test_attach_and_turns() {
        let registry = CallRegistry::default();
        let id = registry.connect().unwrap();
        registry.attach(&id, "session-1", "+15550100");
        assert_eq!(registry.record_turn(&id), 1);
        assert_eq!(registry.record_turn(&id), 2);
        assert_eq!(registry.record_turn("unknown"), 0);

        let entry = registry.get(&id).unwrap();
        assert_eq!(entry.session_id.as_deref(), Some("session-1"));
        assert_eq!(entry.caller_id.as_deref(), Some("+15550100"));
        assert_eq!(entry.turns, 2);
    }
}
