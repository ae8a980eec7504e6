use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::DatabaseConfig;
use crate::filter::FilterError;
use crate::policy::sql::CURRENT_USER_SETTING;
use crate::policy::PolicyError;

/// Errors from the storage layer.
///
/// Authorization misses are not errors: they surface as empty results,
/// `None` or zero affected rows.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Missing configuration: {0}")]
    ConfigMissing(&'static str),

    #[error("Invalid database URL")]
    InvalidDatabaseUrl,

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Owns the filtered connection pool and knows how to open service-role connections.
///
/// The pool never hands out a connection carrying a previous borrower's
/// principal: every release resets the context setting, and a connection
/// whose reset fails is discarded.
pub struct DatabaseManager {
    pool: PgPool,
    service_url: Option<String>,
    connection_timeout: Duration,
}

impl DatabaseManager {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let url = config
            .url
            .clone()
            .ok_or(DatabaseError::ConfigMissing("DATABASE_URL"))?;
        url::Url::parse(&url).map_err(|_| DatabaseError::InvalidDatabaseUrl)?;

        let connection_timeout = Duration::from_secs(config.connection_timeout);
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(connection_timeout)
            .after_release(|conn, _meta| {
                Box::pin(async move {
                    let reset = sqlx::query("SELECT set_config($1, '', false)")
                        .bind(CURRENT_USER_SETTING)
                        .execute(&mut *conn)
                        .await;
                    match reset {
                        Ok(_) => Ok(true),
                        Err(e) => {
                            warn!("Discarding pooled connection after failed context reset: {}", e);
                            Ok(false)
                        }
                    }
                })
            })
            .connect(&url)
            .await?;

        info!("Created filtered database pool (max {} connections)", config.max_connections);

        Ok(Self {
            pool,
            service_url: Self::build_service_url(config).ok(),
            connection_timeout,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Open a dedicated single-connection pool for the service role.
    ///
    /// Never shared with the filtered pool; callers close it when done.
    pub async fn service_pool(&self) -> Result<PgPool, DatabaseError> {
        let url = self
            .service_url
            .as_deref()
            .ok_or(DatabaseError::ConfigMissing("SERVICE_DATABASE_URL or SERVICE_ROLE_USER"))?;
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .min_connections(0)
            .acquire_timeout(self.connection_timeout)
            .connect(url)
            .await?;
        Ok(pool)
    }

    /// `SERVICE_DATABASE_URL` if set, otherwise `DATABASE_URL` with the
    /// service-role credentials swapped in.
    pub fn build_service_url(config: &DatabaseConfig) -> Result<String, DatabaseError> {
        if let Some(url) = &config.service_url {
            url::Url::parse(url).map_err(|_| DatabaseError::InvalidDatabaseUrl)?;
            return Ok(url.clone());
        }

        let user = config
            .service_user
            .as_deref()
            .ok_or(DatabaseError::ConfigMissing("SERVICE_DATABASE_URL or SERVICE_ROLE_USER"))?;
        let base = config
            .url
            .as_deref()
            .ok_or(DatabaseError::ConfigMissing("DATABASE_URL"))?;

        let mut url = url::Url::parse(base).map_err(|_| DatabaseError::InvalidDatabaseUrl)?;
        url.set_username(user).map_err(|_| DatabaseError::InvalidDatabaseUrl)?;
        url.set_password(config.service_password.as_deref())
            .map_err(|_| DatabaseError::InvalidDatabaseUrl)?;
        Ok(url.into())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Closed filtered database pool");
    }
}
