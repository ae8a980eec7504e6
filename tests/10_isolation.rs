mod common;

use anyhow::Result;
use serde_json::json;

use common::{owners, seed, store, total, visible, ADMIN_EMAIL, ADMIN_ID, ALICE, BOB};
use rowguard::config::AppConfig;
use rowguard::database::{as_service_role, with_user_context, DatabaseError, NewRecord, Storage};
use rowguard::filter::FilterData;
use rowguard::memory::MemoryStore;
use rowguard::policy::PolicyStore;

// Row predicates: who sees what, and what fails silently.

#[tokio::test]
async fn each_principal_sees_only_their_reminders() -> Result<()> {
    let store = store().await?;
    for owner in [ALICE, ALICE, BOB, BOB] {
        seed(&store, "reminders", Some(owner), json!({ "text": "x" })).await?;
    }

    let rows = visible(&store, Some(ALICE), "reminders").await?;
    assert_eq!(rows.len(), 2, "alice should see exactly her two reminders");
    assert!(owners(&rows).iter().all(|o| *o == Some(ALICE)), "leaked rows: {:?}", owners(&rows));

    let rows = visible(&store, Some(BOB), "reminders").await?;
    assert_eq!(owners(&rows), vec![Some(BOB), Some(BOB)]);
    Ok(())
}

#[tokio::test]
async fn foreign_rows_cannot_be_read_updated_or_deleted() -> Result<()> {
    let store = store().await?;
    let bobs = seed(&store, "reminders", Some(BOB), json!({ "text": "bob's" })).await?;

    let id = bobs.id;
    let (found, updated, deleted) = with_user_context(&store, Some(ALICE), move |s| {
        Box::pin(async move {
            let found = s.find_unique("reminders", id).await?;
            let updated = s.update("reminders", id, json!({ "text": "mine now" })).await?;
            let deleted = s.delete("reminders", id).await?;
            Ok::<_, DatabaseError>((found, updated, deleted))
        })
    })
    .await?;
    assert!(found.is_none(), "alice must not read bob's reminder");
    assert_eq!(updated, 0);
    assert_eq!(deleted, 0);

    // service role sees bob's row untouched
    let row = as_service_role(&store, move |s| Box::pin(async move { s.find_unique("reminders", id).await }))
        .await?
        .expect("bob's reminder still exists");
    assert_eq!(row.data, json!({ "text": "bob's" }));
    assert_eq!(row.updated_at, bobs.updated_at);
    Ok(())
}

#[tokio::test]
async fn principal_cannot_insert_rows_it_could_not_see() -> Result<()> {
    let store = store().await?;
    let created = with_user_context(&store, Some(ALICE), |s| {
        Box::pin(async move { s.create("reminders", NewRecord::owned_by(BOB, json!({}))).await })
    })
    .await?;
    assert!(created.is_none());
    assert_eq!(total(&store, "reminders").await?, 0);
    Ok(())
}

#[tokio::test]
async fn anonymous_sees_nothing_and_gets_no_error() -> Result<()> {
    let store = store().await?;
    for policy in store.policies().tables() {
        seed(&store, &policy.table, Some(ALICE), json!({})).await?;
    }
    seed(&store, "feedback", None, json!({ "rating": 5 })).await?;

    for policy in store.policies().tables() {
        let rows = visible(&store, None, &policy.table).await?;
        assert!(rows.is_empty(), "anonymous read {} rows from {}", rows.len(), policy.table);
    }
    Ok(())
}

#[tokio::test]
async fn ownerless_rows_are_visible_to_admins_only() -> Result<()> {
    let store = store().await?;
    seed(&store, "feedback", Some(BOB), json!({ "rating": 4 })).await?;
    seed(&store, "feedback", None, json!({ "rating": 1 })).await?;
    seed(&store, "flow_responses", None, json!({ "step": 2 })).await?;

    let admin_rows = visible(&store, Some(ADMIN_ID), "feedback").await?;
    assert_eq!(admin_rows.len(), 2, "admin sees owned and anonymous feedback");
    assert!(owners(&admin_rows).contains(&None));

    let user_rows = visible(&store, Some(BOB), "feedback").await?;
    assert_eq!(owners(&user_rows), vec![Some(BOB)], "user sees only own feedback, no anonymous rows");

    assert!(visible(&store, Some(ALICE), "flow_responses").await?.is_empty());
    assert_eq!(visible(&store, Some(ADMIN_ID), "flow_responses").await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn admin_reads_and_writes_every_table() -> Result<()> {
    let store = store().await?;
    let mut ids = Vec::new();
    for policy in store.policies().tables() {
        ids.push((policy.table.clone(), seed(&store, &policy.table, Some(ALICE), json!({})).await?.id));
    }

    let outcome = with_user_context(&store, Some(ADMIN_ID), move |s| {
        Box::pin(async move {
            let mut outcome = Vec::new();
            for (table, id) in ids {
                let seen = s.find_unique(&table, id).await?.is_some();
                let updated = s.update(&table, id, json!({ "by": "admin" })).await?;
                let deleted = s.delete(&table, id).await?;
                outcome.push((table, seen, updated, deleted));
            }
            Ok::<_, DatabaseError>(outcome)
        })
    })
    .await?;

    for (table, seen, updated, deleted) in outcome {
        assert!(seen, "admin could not read {}", table);
        assert_eq!((updated, deleted), (1, 1), "admin could not write {}", table);
    }
    Ok(())
}

#[tokio::test]
async fn admin_creates_on_behalf_of_another_owner() -> Result<()> {
    let store = store().await?;
    let created = with_user_context(&store, Some(ADMIN_ID), |s| {
        Box::pin(async move { s.create("reminders", NewRecord::owned_by(ALICE, json!({ "text": "from support" }))).await })
    })
    .await?
    .expect("admin insert for another owner succeeds");

    let rows = visible(&store, Some(ALICE), "reminders").await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, created.id);
    Ok(())
}

#[tokio::test]
async fn service_role_is_never_filtered() -> Result<()> {
    let store = store().await?;
    seed(&store, "feedback", None, json!({})).await?;
    seed(&store, "feedback", Some(ALICE), json!({})).await?;
    seed(&store, "feedback", Some("someone-unregistered"), json!({})).await?;

    let rows = as_service_role(&store, |s| {
        Box::pin(async move { s.find_many("feedback", FilterData::default()).await })
    })
    .await?;
    assert_eq!(rows.len(), 3);

    // and its writes are immediately visible to ordinary sessions
    assert_eq!(visible(&store, Some(ALICE), "feedback").await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn injection_shaped_principal_behaves_like_unknown_id() -> Result<()> {
    let store = store().await?;
    seed(&store, "reminders", Some(ALICE), json!({})).await?;

    let hostile = "'; DROP TABLE reminders; --";
    let (principal, rows) = with_user_context(&store, Some(hostile), |s| {
        Box::pin(async move {
            let principal = s.current_principal().await?;
            let rows = s.find_many("reminders", FilterData::default()).await?;
            Ok::<_, DatabaseError>((principal, rows))
        })
    })
    .await?;
    assert_eq!(principal.user_id(), Some(hostile), "principal is stored verbatim");
    assert!(rows.is_empty());
    assert!(visible(&store, Some("no-such-user"), "reminders").await?.is_empty());

    assert_eq!(total(&store, "reminders").await?, 1, "schema and data untouched");
    Ok(())
}

#[tokio::test]
async fn filters_narrow_but_never_widen_visibility() -> Result<()> {
    let store = store().await?;
    seed(&store, "reminders", Some(ALICE), json!({})).await?;
    seed(&store, "reminders", Some(BOB), json!({})).await?;

    // asking for bob's rows explicitly still returns nothing to alice
    let rows = with_user_context(&store, Some(ALICE), |s| {
        Box::pin(async move {
            let filter = FilterData {
                where_clause: Some(json!({ "$or": [{ "user_id": BOB }, { "user_id": { "$ne": ALICE } }] })),
                ..Default::default()
            };
            s.find_many("reminders", filter).await
        })
    })
    .await?;
    assert!(rows.is_empty());
    Ok(())
}

#[tokio::test]
async fn disable_enable_cycle_keeps_every_row() -> Result<()> {
    let store = store().await?;
    for owner in [ALICE, ALICE, BOB] {
        seed(&store, "reminders", Some(owner), json!({})).await?;
    }
    let before = total(&store, "reminders").await?;

    store.set_enforcement(false).await?;
    assert!(store.enforcement_status().await?.iter().all(|s| !s.enabled));
    assert_eq!(visible(&store, Some(ALICE), "reminders").await?.len(), 3, "disabled: everyone sees all rows");
    assert_eq!(visible(&store, None, "reminders").await?.len(), 3);
    assert_eq!(total(&store, "reminders").await?, before);

    store.set_enforcement(true).await?;
    assert_eq!(visible(&store, Some(ALICE), "reminders").await?.len(), 2, "re-enabled: predicate restored");
    assert_eq!(visible(&store, Some(BOB), "reminders").await?.len(), 1);
    assert_eq!(total(&store, "reminders").await?, before);
    Ok(())
}

#[tokio::test]
async fn enable_flag_from_config_drives_enforcement() -> Result<()> {
    let config = AppConfig::from_source(|key| match key {
        "RLS_ENABLED" => Some("false".to_string()),
        "ADMIN_EMAILS" => Some(ADMIN_EMAIL.to_string()),
        _ => None,
    });
    let store = MemoryStore::from_config(&config, PolicyStore::reminders_app());
    for owner in [ALICE, ALICE, BOB] {
        seed(&store, "reminders", Some(owner), json!({})).await?;
    }
    assert_eq!(visible(&store, Some(ALICE), "reminders").await?.len(), 3, "flag off: filtering is off");

    // a toggle left behind by an operator is undone by the flag
    assert!(store.reconcile_enforcement(true).await?);
    assert!(!store.reconcile_enforcement(true).await?, "already matching");
    assert_eq!(visible(&store, Some(ALICE), "reminders").await?.len(), 2);
    assert_eq!(visible(&store, Some(BOB), "reminders").await?.len(), 1);

    assert!(store.reconcile_enforcement(config.rls.enabled).await?);
    assert_eq!(visible(&store, Some(BOB), "reminders").await?.len(), 3);
    assert_eq!(total(&store, "reminders").await?, 3);
    Ok(())
}

#[tokio::test]
async fn unknown_tables_are_errors_not_empty_results() -> Result<()> {
    let store = store().await?;
    let err = visible(&store, Some(ALICE), "users").await.unwrap_err();
    assert!(err.to_string().contains("Unknown table"), "unexpected error: {}", err);
    Ok(())
}
