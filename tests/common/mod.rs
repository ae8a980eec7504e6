#![allow(dead_code)]

use anyhow::Result;
use serde_json::Value;

use rowguard::admin::AdminSet;
use rowguard::database::{as_service_role, with_user_context, NewRecord, Record, Storage};
use rowguard::filter::FilterData;
use rowguard::memory::{MemoryOptions, MemoryStore};
use rowguard::policy::PolicyStore;

pub const ADMIN_ID: &str = "u-admin";
pub const ADMIN_EMAIL: &str = "admin@x.com";
pub const ALICE: &str = "u-alice";
pub const BOB: &str = "u-bob";
pub const USER_EMAIL: &str = "user@x.com";

/// Memory store with the reminders tables, one admin and two users registered.
pub async fn store() -> Result<MemoryStore> {
    store_with(MemoryOptions::default()).await
}

pub async fn store_with(options: MemoryOptions) -> Result<MemoryStore> {
    let store = MemoryStore::with_options(PolicyStore::reminders_app(), AdminSet::parse(ADMIN_EMAIL), options);
    store.register_user(ADMIN_ID, ADMIN_EMAIL).await?;
    store.register_user(ALICE, "alice@x.com").await?;
    store.register_user(BOB, USER_EMAIL).await?;
    Ok(store)
}

/// Insert through the service role, bypassing every predicate.
pub async fn seed(storage: &dyn Storage, table: &str, owner: Option<&str>, data: Value) -> Result<Record> {
    let table = table.to_string();
    let record = NewRecord {
        owner_id: owner.map(str::to_string),
        data,
    };
    let created = as_service_role(storage, move |s| Box::pin(async move { s.create(&table, record).await })).await?;
    created.ok_or_else(|| anyhow::anyhow!("service role insert was rejected"))
}

/// Everything `user` can see in `table`.
pub async fn visible(storage: &dyn Storage, user: Option<&str>, table: &str) -> Result<Vec<Record>> {
    let table = table.to_string();
    let rows = with_user_context(storage, user, move |s| {
        Box::pin(async move { s.find_many(&table, FilterData::default()).await })
    })
    .await?;
    Ok(rows)
}

/// Unfiltered row count.
pub async fn total(storage: &dyn Storage, table: &str) -> Result<i64> {
    let table = table.to_string();
    let count = as_service_role(storage, move |s| {
        Box::pin(async move { s.count(&table, FilterData::default()).await })
    })
    .await?;
    Ok(count)
}

pub fn owners(rows: &[Record]) -> Vec<Option<&str>> {
    rows.iter().map(|r| r.owner_id.as_deref()).collect()
}
