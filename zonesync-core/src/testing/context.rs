//! TestContext - isolated store directories for tests
//!
//! Each context owns a temporary directory and at most one LMDB environment
//! inside it. LMDB refuses to open the same path twice in one process, so the
//! store is opened lazily once and handed out as clones.

use crate::action::ActionRegistry;
use crate::journal::Journal;
use crate::lock::LockManager;
use crate::session::{SessionConfig, SessionManager};
use crate::state_hash::NoopStateHash;
use crate::store::Store;
use crate::Result;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Map size for test environments (64 MiB)
pub const TEST_MAP_SIZE: usize = 64 * 1024 * 1024;

/// Node name used by [`TestContext::session_manager`]
pub const TEST_NODE_NAME: &str = "test-node";

/// Context for managing test resources and lifecycle
///
/// The temporary directory is removed when the context is dropped.
///
/// # Example
///
/// ```rust,no_run
/// use zonesync_core::testing::TestContext;
///
/// let ctx = TestContext::new();
/// let store = ctx.open_store().unwrap();
/// assert!(store.get_arenas().unwrap().is_empty());
/// ```
pub struct TestContext {
    // Declared first so the environment closes before the directory goes
    store: Mutex<Option<Store>>,
    temp_dir: TempDir,
}

impl TestContext {
    /// Create a new TestContext with a unique temporary directory
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory");
        Self {
            store: Mutex::new(None),
            temp_dir,
        }
    }

    /// Path of the temporary directory
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// The context's store, opened on first use
    pub fn open_store(&self) -> Result<Store> {
        let mut slot = self.store.lock();
        if let Some(store) = slot.as_ref() {
            return Ok(store.clone());
        }
        let store = Store::with_map_size(self.temp_dir.path().join("db"), TEST_MAP_SIZE)?;
        *slot = Some(store.clone());
        Ok(store)
    }

    /// Session manager over the context's store with default settings
    pub fn session_manager(&self) -> Result<SessionManager> {
        self.session_manager_with(SessionConfig::default(), LockManager::new())
    }

    /// Session manager with explicit tuning and lock table
    pub fn session_manager_with(&self, config: SessionConfig, locks: LockManager) -> Result<SessionManager> {
        let store = self.open_store()?;
        let journal = Journal::new(store.clone(), TEST_NODE_NAME);
        SessionManager::new(
            store,
            journal,
            Arc::new(ActionRegistry::standard()),
            locks,
            config,
            Arc::new(NoopStateHash),
        )
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_creates_directory() {
        let ctx = TestContext::new();
        assert!(ctx.path().is_dir());
    }

    #[test]
    fn test_store_is_opened_once() {
        let ctx = TestContext::new();
        let a = ctx.open_store().unwrap();
        let b = ctx.open_store().unwrap();
        assert_eq!(a.path(), b.path());
        assert!(ctx.path().join("db").is_dir());
    }

    #[test]
    fn test_context_cleanup_on_drop() {
        let path = {
            let ctx = TestContext::new();
            ctx.open_store().unwrap();
            ctx.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
