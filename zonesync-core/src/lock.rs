//! Hierarchical resource locks
//!
//! Resources are `/`-separated paths (`/acme`, `/acme/s1/example.com`).
//! Holding a path conflicts with another owner holding the same path, any
//! ancestor, or any descendant. An owner never conflicts with itself, so a
//! holder of `/acme` may also take `/acme/s1`.

use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct LockHolder {
    owner: String,
    acquired_at: Instant,
}

/// In-process lock table shared by sessions and operations
#[derive(Debug, Clone, Default)]
pub struct LockManager {
    held: Arc<Mutex<HashMap<String, LockHolder>>>,
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Whether `ancestor` is a strict prefix of `path` on a segment boundary
fn is_ancestor(ancestor: &str, path: &str) -> bool {
    ancestor == "/"
        || (path.len() > ancestor.len()
            && path.starts_with(ancestor)
            && path.as_bytes()[ancestor.len()] == b'/')
}

fn overlaps(a: &str, b: &str) -> bool {
    a == b || is_ancestor(a, b) || is_ancestor(b, a)
}

impl LockManager {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `path` for `owner` if no other owner holds an overlapping path
    pub fn try_acquire(&self, path: &str, owner: &str) -> bool {
        let path = normalize(path);
        let mut held = self.held.lock();

        let conflict = held
            .iter()
            .any(|(p, h)| h.owner != owner && overlaps(p, &path));
        if conflict {
            return false;
        }

        held.entry(path).or_insert_with(|| LockHolder {
            owner: owner.to_string(),
            acquired_at: Instant::now(),
        });
        true
    }

    /// Retry [`try_acquire`](Self::try_acquire) up to `retries` extra times
    pub async fn acquire(&self, path: &str, owner: &str, retries: u32, delay: Duration) -> Result<()> {
        for attempt in 0..=retries {
            if self.try_acquire(path, owner) {
                return Ok(());
            }
            if attempt < retries {
                tokio::time::sleep(delay).await;
            }
        }
        tracing::warn!("{} could not lock {} after {} retries", owner, path, retries);
        Err(Error::lock(format!(
            "resource {} is locked by {}",
            path,
            self.holder(path).unwrap_or_else(|| "another owner".to_string())
        )))
    }

    /// Release one path regardless of owner; returns whether it was held
    pub fn release(&self, path: &str) -> bool {
        self.held.lock().remove(&normalize(path)).is_some()
    }

    /// Release every path held by `owner`; returns how many were freed
    pub fn release_all(&self, owner: &str) -> usize {
        let mut held = self.held.lock();
        let before = held.len();
        held.retain(|_, h| h.owner != owner);
        before - held.len()
    }

    /// Owner of the lock covering `path`, if any
    pub fn holder(&self, path: &str) -> Option<String> {
        let path = normalize(path);
        self.held
            .lock()
            .iter()
            .find(|(p, _)| overlaps(p, &path))
            .map(|(_, h)| h.owner.clone())
    }

    /// Paths currently held by `owner` with how long each has been held
    pub fn held_by(&self, owner: &str) -> Vec<(String, Duration)> {
        let mut out: Vec<_> = self
            .held
            .lock()
            .iter()
            .filter(|(_, h)| h.owner == owner)
            .map(|(p, h)| (p.clone(), h.acquired_at.elapsed()))
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_blocks_child_and_back() {
        let locks = LockManager::new();
        assert!(locks.try_acquire("/acme", "a"));
        assert!(!locks.try_acquire("/acme/s1", "b"));
        assert!(!locks.try_acquire("/acme", "b"));

        let locks = LockManager::new();
        assert!(locks.try_acquire("/acme/s1/example.com", "a"));
        assert!(!locks.try_acquire("/acme", "b"));
        assert!(locks.try_acquire("/acme/s2", "b"));
    }

    #[test]
    fn test_sibling_prefix_is_not_ancestor() {
        let locks = LockManager::new();
        assert!(locks.try_acquire("/acme", "a"));
        assert!(locks.try_acquire("/acme-corp", "b"));
    }

    #[test]
    fn test_same_owner_reacquires() {
        let locks = LockManager::new();
        assert!(locks.try_acquire("/acme", "a"));
        assert!(locks.try_acquire("/acme", "a"));
        assert!(locks.try_acquire("/acme/s1", "a"));
        assert_eq!(locks.held_by("a").len(), 2);
    }

    #[test]
    fn test_release_all() {
        let locks = LockManager::new();
        assert!(locks.try_acquire("/acme", "a"));
        assert!(locks.try_acquire("/acme/s1", "a"));
        assert!(locks.try_acquire("/other", "b"));

        assert_eq!(locks.release_all("a"), 2);
        assert!(locks.try_acquire("/acme/s1", "c"));
        assert_eq!(locks.holder("/other/x"), Some("b".to_string()));
    }

    #[test]
    fn test_release_single_path() {
        let locks = LockManager::new();
        assert!(locks.try_acquire("acme/", "a"));
        assert!(locks.release("/acme"));
        assert!(!locks.release("/acme"));
        assert!(locks.holder("/acme").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_gives_up_after_retries() {
        let locks = LockManager::new();
        assert!(locks.try_acquire("/acme", "a"));

        let err = locks
            .acquire("/acme/s1", "b", 3, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Lock(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_succeeds_once_released() {
        let locks = LockManager::new();
        assert!(locks.try_acquire("/acme", "a"));

        let other = locks.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            other.release_all("a");
        });

        locks
            .acquire("/acme", "b", 5, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(locks.holder("/acme"), Some("b".to_string()));
    }
}
