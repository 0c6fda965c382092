//! Testing infrastructure for zonesync core
//!
//! Centralized helpers so unit and integration tests get isolated LMDB
//! environments that are cleaned up automatically.
//!
//! # Usage
//!
//! ```rust,no_run
//! use zonesync_core::testing::TestContext;
//!
//! #[tokio::test]
//! async fn my_test() {
//!     let ctx = TestContext::new();
//!     let sessions = ctx.session_manager().unwrap();
//!     let id = sessions.begin_session("acme").await.unwrap();
//!     sessions.commit(id).await.unwrap();
//! }
//! ```

mod context;

pub use context::{TEST_MAP_SIZE, TEST_NODE_NAME, TestContext};
