mod common;

use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use common::{seed, store, store_with, total, visible, ALICE, BOB};
use rowguard::database::{as_service_role, with_user_context, DatabaseError, NewRecord, Session, Storage};
use rowguard::filter::FilterData;
use rowguard::memory::MemoryOptions;
use rowguard::policy::sql::CURRENT_USER_SETTING;
use rowguard::types::Principal;

// Principal binding across units of work and pooled connections.

fn single_connection() -> MemoryOptions {
    MemoryOptions {
        max_connections: 1,
        acquire_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

#[tokio::test]
async fn set_then_read_returns_the_exact_id() -> Result<()> {
    let store = store().await?;
    let odd = "  user id with spaces and ünïcode \u{1F600} ";
    let principal = with_user_context(&store, Some(odd), |s| Box::pin(async move { s.current_principal().await })).await?;
    assert_eq!(principal, Principal::Authenticated(odd.to_string()));
    Ok(())
}

#[tokio::test]
async fn clearing_twice_stays_anonymous() -> Result<()> {
    let store = store().await?;
    let mut session = store.begin().await?;
    session.set_user_context(ALICE).await?;
    session.clear_user_context().await?;
    assert_eq!(session.current_principal().await?, Principal::Anonymous);
    session.clear_user_context().await?;
    assert_eq!(session.current_principal().await?, Principal::Anonymous);
    session.commit().await?;
    Ok(())
}

#[tokio::test]
async fn rebinding_replaces_the_principal() -> Result<()> {
    let store = store().await?;
    seed(&store, "reminders", Some(BOB), json!({})).await?;

    let mut session = store.begin().await?;
    session.set_user_context(ALICE).await?;
    assert!(session.find_many("reminders", FilterData::default()).await?.is_empty());
    session.set_user_context(BOB).await?;
    assert_eq!(session.find_many("reminders", FilterData::default()).await?.len(), 1);
    session.rollback().await?;
    Ok(())
}

#[tokio::test]
async fn reborrowed_connection_carries_no_stale_principal() -> Result<()> {
    let store = store_with(single_connection()).await?;
    seed(&store, "reminders", Some(ALICE), json!({})).await?;

    // transaction-local binding
    let first_id = {
        let mut session = store.begin_memory().await?;
        session.set_user_context(ALICE).await?;
        let id = session.connection_id();
        Box::new(session).commit().await?;
        id
    };

    // session-level binding, the leak-prone form
    {
        let mut session = store.begin_memory().await?;
        assert_eq!(session.connection_id(), first_id, "pool of one must hand back the same connection");
        session.set_config(CURRENT_USER_SETTING, ALICE, false);
        assert_eq!(session.current_principal().await?, Principal::Authenticated(ALICE.to_string()));
        Box::new(session).commit().await?;
    }

    let mut session = store.begin_memory().await?;
    assert_eq!(session.connection_id(), first_id);
    assert_eq!(session.current_setting(CURRENT_USER_SETTING), None);
    assert_eq!(session.current_principal().await?, Principal::Anonymous);
    assert!(session.find_many("reminders", FilterData::default()).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn failed_operation_rolls_back_and_releases_clean() -> Result<()> {
    let store = store_with(single_connection()).await?;

    let result: Result<(), DatabaseError> = with_user_context(&store, Some(ALICE), |s| {
        Box::pin(async move {
            s.create("reminders", NewRecord::owned_by(ALICE, json!({ "n": 1 }))).await?;
            Err(DatabaseError::QueryError("boom".into()))
        })
    })
    .await;
    assert!(matches!(result, Err(DatabaseError::QueryError(ref m)) if m == "boom"), "original error returned");
    assert_eq!(total(&store, "reminders").await?, 0, "write rolled back");

    // the only connection is free again and anonymous
    let principal = with_user_context(&store, None, |s| Box::pin(async move { s.current_principal().await })).await?;
    assert_eq!(principal, Principal::Anonymous);
    Ok(())
}

#[tokio::test]
async fn cancelled_unit_of_work_releases_its_connection() -> Result<()> {
    let store = store_with(single_connection()).await?;

    let stuck = with_user_context(&store, Some(ALICE), |s| {
        Box::pin(async move {
            s.create("reminders", NewRecord::owned_by(ALICE, json!({}))).await?;
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, DatabaseError>(())
        })
    });
    assert!(tokio::time::timeout(Duration::from_millis(50), stuck).await.is_err());

    assert_eq!(store.pool().idle_count(), 1, "connection returned to the pool");
    assert_eq!(total(&store, "reminders").await?, 0, "dropped unit of work rolled back");
    assert!(visible(&store, None, "reminders").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn service_role_never_touches_the_pool() -> Result<()> {
    let store = store_with(single_connection()).await?;

    // hold the only pooled connection
    let mut held = store.begin_memory().await?;
    held.set_user_context(ALICE).await?;

    let count = as_service_role(&store, |s| {
        Box::pin(async move {
            s.create("feedback", NewRecord::anonymous(json!({}))).await?;
            s.count("feedback", FilterData::default()).await
        })
    })
    .await?;
    assert_eq!(count, 1);
    assert_eq!(store.pool().available(), 0, "service role did not borrow a pooled connection");
    assert_eq!(held.current_principal().await?, Principal::Authenticated(ALICE.to_string()));
    Ok(())
}

#[tokio::test]
async fn concurrent_principals_stay_isolated() -> Result<()> {
    let store = Arc::new(store_with(MemoryOptions { max_connections: 4, ..Default::default() }).await?);
    let users: Vec<String> = (0..16).map(|i| format!("u-{}", i)).collect();

    let mut tasks = Vec::new();
    for user in users.clone() {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            for n in 0..5 {
                let owner = user.clone();
                with_user_context(store.as_ref(), Some(user.as_str()), move |s| {
                    Box::pin(async move { s.create("reminders", NewRecord::owned_by(owner, json!({ "n": n }))).await })
                })
                .await?;
                tokio::task::yield_now().await;
                let rows = with_user_context(store.as_ref(), Some(user.as_str()), |s| {
                    Box::pin(async move { s.find_many("reminders", FilterData::default()).await })
                })
                .await?;
                if rows.iter().any(|r| r.owner_id.as_deref() != Some(user.as_str())) {
                    anyhow::bail!("{} saw another principal's rows", user);
                }
            }
            Ok::<_, anyhow::Error>(())
        }));
    }
    for task in tasks {
        task.await??;
    }

    for user in &users {
        assert_eq!(visible(store.as_ref(), Some(user.as_str()), "reminders").await?.len(), 5);
    }
    assert_eq!(total(store.as_ref(), "reminders").await?, 80);
    Ok(())
}

#[tokio::test]
async fn racing_foreign_writes_always_affect_zero_rows() -> Result<()> {
    let store = Arc::new(store().await?);
    let target = seed(store.as_ref(), "reminders", Some(BOB), json!({ "v": 0 })).await?;

    let mut tasks = Vec::new();
    for i in 0..20 {
        let store = store.clone();
        let id = target.id;
        tasks.push(tokio::spawn(async move {
            with_user_context(store.as_ref(), Some(ALICE), move |s| {
                Box::pin(async move {
                    let updated = s.update("reminders", id, json!({ "v": i })).await?;
                    let deleted = s.delete("reminders", id).await?;
                    Ok::<_, DatabaseError>(updated + deleted)
                })
            })
            .await
        }));
    }
    for task in tasks {
        assert_eq!(task.await??, 0);
    }

    let rows = visible(store.as_ref(), Some(BOB), "reminders").await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].data, json!({ "v": 0 }));
    Ok(())
}
