//! Change notifications for state-hash caches

/// Receives the resource paths touched by each commit.
///
/// Called after the transaction is durable; implementations must not block
/// and their outcome is ignored.
pub trait StateHashSink: Send + Sync {
    /// `paths` are the resource paths (`/arena/segment/zone`) changed by one commit
    fn invalidate(&self, paths: &[String]);
}

/// Sink that drops every notification
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStateHash;

impl StateHashSink for NoopStateHash {
    fn invalidate(&self, _paths: &[String]) {}
}

/// Sink that logs changed paths at debug level
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingStateHash;

impl StateHashSink for LoggingStateHash {
    fn invalidate(&self, paths: &[String]) {
        for path in paths {
            tracing::debug!("State hash invalidated for {}", path);
        }
    }
}
