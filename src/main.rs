use axum::http::HeaderValue;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::EnvFilter;

use rowguard::config::{config, SecurityConfig};
use rowguard::database::{DatabaseManager, PgStorage, PolicyInstaller, Storage};
use rowguard::handlers::{router, AppState};
use rowguard::is_production;
use rowguard::policy::PolicyStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present so cargo run picks up DATABASE_URL, ADMIN_EMAILS, etc.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Initialize configuration (this loads the config singleton)
    let config = config();
    tracing::info!("Starting rowguard in {:?} mode", config.environment);

    let report = config.validate();
    for warning in &report.warnings {
        tracing::warn!("{}", warning);
    }
    for error in &report.errors {
        tracing::error!("{}", error);
    }
    if !report.valid && is_production!() {
        anyhow::bail!("refusing to start with invalid configuration");
    }
    if !config.rls.enabled {
        tracing::warn!("RLS_ENABLED=false: row-level enforcement is in emergency rollback mode");
    }

    let manager = Arc::new(DatabaseManager::connect(&config.database).await?);
    let policies = Arc::new(PolicyStore::reminders_app());

    // Keep the database copy of the admin set identical to ours
    match manager.service_pool().await {
        Ok(pool) => {
            let installer = PolicyInstaller::new(pool, policies.clone());
            let synced = installer.sync_admin_identities(&config.rls.admins).await;
            installer.close().await;
            match synced {
                Ok(count) => tracing::info!("Admin set synced ({} identities)", count),
                Err(e) => tracing::error!("Admin set sync failed: {}", e),
            }
        }
        Err(e) => tracing::error!("Admin set sync skipped, no service-role connection: {}", e),
    }

    let storage: Arc<dyn Storage> = Arc::new(PgStorage::new(manager.clone(), policies));

    // RLS_ENABLED is authoritative; a toggle made through the CLI does not outlive a restart
    match storage.reconcile_enforcement(config.rls.enabled).await {
        Ok(true) => tracing::warn!("Row-level enforcement reset to RLS_ENABLED={}", config.rls.enabled),
        Ok(false) => tracing::info!("Row-level enforcement matches RLS_ENABLED={}", config.rls.enabled),
        Err(e) => {
            tracing::error!("Could not apply RLS_ENABLED={}: {}", config.rls.enabled, e);
            if config.rls.enabled && is_production!() {
                anyhow::bail!("refusing to start without confirmed row-level enforcement");
            }
        }
    }

    let state = AppState::new(storage, config.security.jwt_secret.clone());

    let app = router(state)
        .layer(cors_layer(&config.security))
        .layer(TraceLayer::new_for_http());

    // Allow tests or deployments to override port via env
    let port = std::env::var("ROWGUARD_PORT")
        .ok()
        .or_else(|| std::env::var("PORT").ok())
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(3000);

    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("rowguard listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;
    manager.close().await;
    Ok(())
}

fn cors_layer(security: &SecurityConfig) -> CorsLayer {
    if !security.enable_cors {
        return CorsLayer::new();
    }
    let origins: Vec<HeaderValue> = security
        .cors_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    if origins.is_empty() {
        CorsLayer::permissive()
    } else {
        CorsLayer::new().allow_origin(origins)
    }
}
