//! Zone operations: lock, open a session, apply, commit
//!
//! Every operation locks the resource path it touches under the owner of a
//! fresh session, derives its `(do, undo)` pairs from the current store
//! state, and commits. Any failure rolls the session back. Locks are
//! released on every exit path.

use crate::action::Action;
use crate::record::Record;
use crate::session::{SessionId, SessionManager, session_owner};
use crate::store::Store;
use crate::{Error, Result};

/// High-level mutations used by API front-ends
#[derive(Clone)]
pub struct ZoneOperations {
    sessions: SessionManager,
}

fn check_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.chars().any(char::is_whitespace) {
        return Err(Error::action(format!("invalid {} name {:?}", kind, name)));
    }
    Ok(())
}

impl ZoneOperations {
    /// Create the operations layer on top of a session manager
    pub fn new(sessions: SessionManager) -> Self {
        Self { sessions }
    }

    fn store(&self) -> &Store {
        self.sessions.store()
    }

    /// Create an arena
    pub async fn create_arena(&self, arena: &str) -> Result<Vec<u64>> {
        check_name("arena", arena)?;
        let action = Action::CreateArena {
            arena: arena.to_string(),
        };
        self.run(arena, format!("/{}", arena), move |_| Ok(vec![action]))
            .await
    }

    /// Delete an arena; it must have no segments left
    pub async fn delete_arena(&self, arena: &str) -> Result<Vec<u64>> {
        check_name("arena", arena)?;
        let action = Action::DeleteArena {
            arena: arena.to_string(),
        };
        self.run(arena, format!("/{}", arena), move |_| Ok(vec![action]))
            .await
    }

    /// Create a segment in an existing arena
    pub async fn create_segment(&self, arena: &str, segment: &str) -> Result<Vec<u64>> {
        check_name("arena", arena)?;
        check_name("segment", segment)?;
        let action = Action::CreateSegment {
            arena: arena.to_string(),
            segment: segment.to_string(),
        };
        self.run(arena, format!("/{}/{}", arena, segment), move |_| {
            Ok(vec![action])
        })
        .await
    }

    /// Delete a segment; it must have no zones left
    pub async fn delete_segment(&self, arena: &str, segment: &str) -> Result<Vec<u64>> {
        check_name("arena", arena)?;
        check_name("segment", segment)?;
        let action = Action::DeleteSegment {
            arena: arena.to_string(),
            segment: segment.to_string(),
        };
        self.run(arena, format!("/{}/{}", arena, segment), move |_| {
            Ok(vec![action])
        })
        .await
    }

    /// Create a zone
    pub async fn create_zone(&self, arena: &str, segment: &str, zone: &str) -> Result<Vec<u64>> {
        check_name("arena", arena)?;
        check_name("segment", segment)?;
        check_name("zone", zone)?;
        let action = Action::AddZone {
            arena: arena.to_string(),
            segment: segment.to_string(),
            zone: zone.to_string(),
        };
        self.run(arena, format!("/{}/{}/{}", arena, segment, zone), move |_| {
            Ok(vec![action])
        })
        .await
    }

    /// Delete a zone together with all of its records
    pub async fn delete_zone(&self, arena: &str, segment: &str, zone: &str) -> Result<Vec<u64>> {
        check_name("arena", arena)?;
        check_name("segment", segment)?;
        check_name("zone", zone)?;
        let (a, s, z) = (arena.to_string(), segment.to_string(), zone.to_string());
        self.run(arena, format!("/{}/{}/{}", arena, segment, zone), move |store| {
            let mut actions: Vec<Action> = store
                .get_records(&z)?
                .into_iter()
                .map(|record| Action::DelRecord {
                    arena: a.clone(),
                    segment: s.clone(),
                    zone: z.clone(),
                    record,
                })
                .collect();
            actions.push(Action::DelZone {
                arena: a,
                segment: s,
                zone: z,
            });
            Ok(actions)
        })
        .await
    }

    /// Add a record to a zone
    pub async fn add_record(&self, arena: &str, segment: &str, zone: &str, record: Record) -> Result<Vec<u64>> {
        let action = Action::AddRecord {
            arena: arena.to_string(),
            segment: segment.to_string(),
            zone: zone.to_string(),
            record,
        };
        self.run(arena, format!("/{}/{}/{}", arena, segment, zone), move |_| {
            Ok(vec![action])
        })
        .await
    }

    /// Remove a record from a zone
    pub async fn delete_record(&self, arena: &str, segment: &str, zone: &str, record: Record) -> Result<Vec<u64>> {
        let action = Action::DelRecord {
            arena: arena.to_string(),
            segment: segment.to_string(),
            zone: zone.to_string(),
            record,
        };
        self.run(arena, format!("/{}/{}/{}", arena, segment, zone), move |_| {
            Ok(vec![action])
        })
        .await
    }

    /// Lock `path`, apply the actions `build` derives, commit.
    ///
    /// Returns the journal positions assigned to the actions.
    async fn run<F>(&self, arena: &str, path: String, build: F) -> Result<Vec<u64>>
    where
        F: FnOnce(&Store) -> Result<Vec<Action>> + Send + 'static,
    {
        let id = self.sessions.begin_session(arena).await?;
        let owner = session_owner(id);
        let config = self.sessions.config().clone();

        let result: Result<Vec<u64>> = async {
            self.sessions
                .locks()
                .acquire(&path, &owner, config.lock_retries, config.lock_retry_delay)
                .await?;

            let store = self.store().clone();
            let actions = tokio::task::spawn_blocking(move || build(&store)).await??;
            self.apply_all(id, actions).await?;
            self.sessions.commit(id).await
        }
        .await;

        if let Err(e) = &result {
            tracing::debug!("Operation on {} failed: {}", path, e);
            if let Err(rollback_err) = self.sessions.rollback(id).await {
                tracing::error!("Rollback of session {} failed: {}", id, rollback_err);
            }
        }
        self.sessions.locks().release_all(&owner);
        result
    }

    async fn apply_all(&self, id: SessionId, actions: Vec<Action>) -> Result<()> {
        for action in actions {
            let undo = action.invert();
            self.sessions.apply_action(id, action, undo).await?;
        }
        Ok(())
    }
}
