//! Replay Protection
//!
//! Remembers recently seen handshake salts so a recorded connection cannot be
//! replayed against the server.

use std::collections::HashSet;
use std::sync::Mutex;

/// Reports whether a handshake salt has been used before.
pub trait ReplayGuard: Send + Sync + 'static {
    /// Record `salt`. Returns `false` if it was already seen.
    fn add(&self, salt: &[u8]) -> bool;
}

#[derive(Debug, Default)]
struct Generations {
    active: HashSet<Vec<u8>>,
    archive: HashSet<Vec<u8>>,
}

/// Bounded salt history kept in two generations. When the active generation
/// fills up it becomes the archive and the old archive is dropped, so between
/// `capacity` and `2 * capacity` recent salts are remembered.
#[derive(Debug)]
pub struct ReplayCache {
    capacity: usize,
    inner: Mutex<Generations>,
}

impl ReplayCache {
    /// A capacity of zero disables the check.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Generations::default()),
        }
    }
}

impl ReplayGuard for ReplayCache {
    fn add(&self, salt: &[u8]) -> bool {
        if self.capacity == 0 {
            return true;
        }
        let mut generations = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if generations.active.contains(salt) || generations.archive.contains(salt) {
            return false;
        }
        if generations.active.len() >= self.capacity {
            generations.archive = std::mem::take(&mut generations.active);
        }
        generations.active.insert(salt.to_vec());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_rejected() {
        let cache = ReplayCache::new(4);
        assert!(cache.add(b"salt-1"));
        assert!(!cache.add(b"salt-1"));
        assert!(cache.add(b"salt-2"));
    }

    #[test]
    fn test_disabled_accepts_everything() {
        let cache = ReplayCache::new(0);
        assert!(cache.add(b"salt"));
        assert!(cache.add(b"salt"));
    }

    #[test]
    fn test_archive_generation_still_rejects() {
        let cache = ReplayCache::new(2);
        assert!(cache.add(b"a"));
        assert!(cache.add(b"b"));
        // Rotates: {a, b} becomes the archive.
        assert!(cache.add(b"c"));
        assert!(!cache.add(b"a"));
        assert!(cache.add(b"d"));
        // Rotates again: {a, b} is forgotten.
        assert!(cache.add(b"e"));
        assert!(cache.add(b"a"));
    }
}
