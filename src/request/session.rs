//! Session registry collaborator boundary.
//!
//! The processor only decides whether to mint, reuse or invalidate a
//! session cookie; validity and id generation live behind this trait.

use std::time::Instant;

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

pub trait SessionRegistry: Send + Sync {
    fn is_session_valid(&self, id: &str) -> bool;
    fn new_unique_id(&self) -> String;
}

/// In-memory registry. At capacity the oldest entry is evicted so minting
/// never fails; the narrow trait interface stays unchanged.
pub struct MemorySessionRegistry {
    sessions: DashMap<String, Instant>,
    capacity: usize,
}

impl MemorySessionRegistry {
    pub fn new(capacity: usize) -> MemorySessionRegistry {
        MemorySessionRegistry {
            sessions: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn invalidate(&self, id: &str) {
        self.sessions.remove(id);
    }

    fn evict_oldest(&self) {
        let oldest = self
            .sessions
            .iter()
            .min_by_key(|entry| *entry.value())
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            debug!(session = %key, "session registry at capacity, evicting oldest");
            self.sessions.remove(&key);
        }
    }
}

impl SessionRegistry for MemorySessionRegistry {
    fn is_session_valid(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    fn new_unique_id(&self) -> String {
        if self.sessions.len() >= self.capacity {
            self.evict_oldest();
        }
        let id = Uuid::new_v4().simple().to_string().to_uppercase();
        self.sessions.insert(id.clone(), Instant::now());
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_are_valid_and_unique() {
        let registry = MemorySessionRegistry::new(16);
        let a = registry.new_unique_id();
        let b = registry.new_unique_id();
        assert_ne!(a, b);
        assert!(registry.is_session_valid(&a));
        assert!(registry.is_session_valid(&b));
        assert!(!registry.is_session_valid("nope"));
    }

    #[test]
    fn invalidate_removes() {
        let registry = MemorySessionRegistry::new(16);
        let id = registry.new_unique_id();
        registry.invalidate(&id);
        assert!(!registry.is_session_valid(&id));
    }

    #[test]
    fn capacity_evicts_oldest() {
        let registry = MemorySessionRegistry::new(2);
        let first = registry.new_unique_id();
        let _second = registry.new_unique_id();
        let _third = registry.new_unique_id();
        assert_eq!(registry.len(), 2);
        assert!(!registry.is_session_valid(&first));
    }
}
