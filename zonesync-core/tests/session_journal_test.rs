//! Sessions, journal and zone operations through the public API

use std::time::Duration;
use zonesync_core::action::Action;
use zonesync_core::journal::PullResult;
use zonesync_core::lock::LockManager;
use zonesync_core::ops::ZoneOperations;
use zonesync_core::record::{Record, RecordType};
use zonesync_core::session::{SessionConfig, SessionOutcome};
use zonesync_core::testing::{TEST_NODE_NAME, TestContext};
use zonesync_core::Error;

fn add_zone(zone: &str) -> Action {
    Action::AddZone {
        arena: "acme".into(),
        segment: "s1".into(),
        zone: zone.into(),
    }
}

async fn setup(ops: &ZoneOperations) {
    ops.create_arena("acme").await.unwrap();
    ops.create_segment("acme", "s1").await.unwrap();
}

#[tokio::test]
async fn test_commit_journals_add_zone() {
    let ctx = TestContext::new();
    let sessions = ctx.session_manager().unwrap();
    setup(&ZoneOperations::new(sessions.clone())).await;
    let before = sessions.journal().tail().unwrap();

    let id = sessions.begin_session("acme").await.unwrap();
    let action = add_zone("example.com");
    sessions
        .apply_action(id, action.clone(), action.invert())
        .await
        .unwrap();
    let positions = sessions.commit(id).await.unwrap();

    assert_eq!(positions, vec![before + 1]);
    let entries = sessions.journal().entries_after(before, 10).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, action.dump().unwrap());
    assert_eq!(entries[0].origin, TEST_NODE_NAME);
    assert_eq!(
        sessions.store().get_zones("acme").unwrap(),
        vec!["example.com".to_string()]
    );
    assert_eq!(sessions.outcome(id).unwrap(), Some(SessionOutcome::Committed));
}

#[tokio::test]
async fn test_rollback_leaves_no_trace() {
    let ctx = TestContext::new();
    let sessions = ctx.session_manager().unwrap();
    setup(&ZoneOperations::new(sessions.clone())).await;
    let before = sessions.journal().tail().unwrap();

    let id = sessions.begin_session("acme").await.unwrap();
    for zone in ["a.example", "b.example"] {
        let action = add_zone(zone);
        sessions
            .apply_action(id, action.clone(), action.invert())
            .await
            .unwrap();
    }
    assert_eq!(sessions.store().get_zones("acme").unwrap().len(), 2);

    assert_eq!(sessions.rollback(id).await.unwrap(), 2);
    assert!(sessions.store().get_zones("acme").unwrap().is_empty());
    assert_eq!(sessions.journal().tail().unwrap(), before);

    let err = sessions.commit(id).await.unwrap_err();
    assert!(matches!(err, Error::Session(_)));
}

#[tokio::test]
async fn test_server_side_pull_examples() {
    let ctx = TestContext::new();
    let sessions = ctx.session_manager().unwrap();
    let ops = ZoneOperations::new(sessions.clone());
    for arena in ["a", "b", "c", "d", "e"] {
        ops.create_arena(arena).await.unwrap();
    }
    let journal = sessions.journal();
    assert_eq!(journal.tail().unwrap(), 5);

    match journal.pull(2, 50).unwrap() {
        PullResult::Entries(entries) => {
            let positions: Vec<u64> = entries.iter().map(|e| e.position).collect();
            assert_eq!(positions, vec![3, 4, 5]);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(journal.pull(10, 50).unwrap(), PullResult::NoPosition);
    assert_eq!(journal.pull(5, 50).unwrap(), PullResult::Wait);
}

#[tokio::test]
async fn test_operations_cascade_and_locks() {
    let ctx = TestContext::new();
    let locks = LockManager::new();
    let config = SessionConfig {
        lock_retries: 2,
        lock_retry_delay: Duration::from_millis(10),
        ..SessionConfig::default()
    };
    let sessions = ctx.session_manager_with(config, locks.clone()).unwrap();
    let ops = ZoneOperations::new(sessions.clone());
    setup(&ops).await;
    ops.create_zone("acme", "s1", "example.com").await.unwrap();
    for (name, data) in [("www", "192.0.2.1"), ("mail", "192.0.2.2")] {
        ops.add_record(
            "acme",
            "s1",
            "example.com",
            Record::new(name, RecordType::A, 300, data),
        )
        .await
        .unwrap();
    }

    // A foreign owner holding the arena blocks the operation
    assert!(locks.try_acquire("/acme", "api"));
    let err = ops.delete_zone("acme", "s1", "example.com").await.unwrap_err();
    assert!(matches!(err, Error::Lock(_)));
    assert_eq!(sessions.store().get_records("example.com").unwrap().len(), 2);
    assert!(locks.release("/acme"));

    // Two record deletions, then the zone itself
    let positions = ops.delete_zone("acme", "s1", "example.com").await.unwrap();
    assert_eq!(positions.len(), 3);
    assert!(sessions.store().zone_location("example.com").unwrap().is_none());
    assert!(locks.try_acquire("/acme", "api"));
}
