pub mod admin;
pub mod config;
pub mod policies;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::database::{DatabaseManager, PolicyInstaller};
use crate::policy::PolicyStore;

/// Service-role installer for the configured database.
pub(crate) async fn installer(config: &AppConfig) -> anyhow::Result<(DatabaseManager, PolicyInstaller)> {
    let manager = DatabaseManager::connect(&config.database).await?;
    let pool = manager.service_pool().await?;
    Ok((manager, PolicyInstaller::new(pool, Arc::new(PolicyStore::reminders_app()))))
}
