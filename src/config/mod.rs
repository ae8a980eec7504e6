use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;

use crate::admin::AdminSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub rls: RlsConfig,
    pub database: DatabaseConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlsConfig {
    /// Enforcement flag. Off is the emergency rollback mode.
    pub enabled: bool,
    pub admins: AdminSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub service_url: Option<String>,
    pub service_user: Option<String>,
    pub service_password: Option<String>,
    pub max_connections: u32,
    pub connection_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub jwt_secret: String,
    pub jwt_expiry_hours: u64,
    pub enable_cors: bool,
    pub cors_origins: Vec<String>,
}

/// Outcome of [`AppConfig::validate`]. Never thrown; callers decide fatality.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_source(|key| env::var(key).ok())
    }

    /// Build configuration from any key lookup (environment, a map in tests).
    pub fn from_source<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = match lookup("APP_ENV").as_deref() {
            Some("production") | Some("prod") => Environment::Production,
            Some("staging") | Some("stage") => Environment::Staging,
            _ => Environment::Development,
        };

        // Set defaults based on environment, then override with specific env vars
        match environment {
            Environment::Production => Self::production(),
            Environment::Staging => Self::staging(),
            Environment::Development => Self::development(),
        }
        .with_overrides(lookup)
    }

    fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        // Row-level security
        if let Some(v) = lookup("RLS_ENABLED") {
            self.rls.enabled = parse_flag(&v).unwrap_or(self.rls.enabled);
        }
        if let Some(v) = lookup("ADMIN_EMAILS") {
            self.rls.admins = AdminSet::parse(&v);
        }

        // Database
        self.database.url = lookup("DATABASE_URL").filter(|s| !s.trim().is_empty());
        self.database.service_url = lookup("SERVICE_DATABASE_URL").filter(|s| !s.trim().is_empty());
        self.database.service_user = lookup("SERVICE_ROLE_USER").filter(|s| !s.trim().is_empty());
        self.database.service_password = lookup("SERVICE_ROLE_PASSWORD");
        if let Some(v) = lookup("DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = v.parse().unwrap_or(self.database.max_connections);
        }
        if let Some(v) = lookup("DATABASE_CONNECTION_TIMEOUT") {
            self.database.connection_timeout = v.parse().unwrap_or(self.database.connection_timeout);
        }

        // Security
        if let Some(v) = lookup("JWT_SECRET") {
            self.security.jwt_secret = v;
        }
        if let Some(v) = lookup("JWT_EXPIRY_HOURS") {
            self.security.jwt_expiry_hours = v.parse().unwrap_or(self.security.jwt_expiry_hours);
        }
        if let Some(v) = lookup("SECURITY_ENABLE_CORS") {
            self.security.enable_cors = parse_flag(&v).unwrap_or(self.security.enable_cors);
        }
        if let Some(v) = lookup("SECURITY_CORS_ORIGINS") {
            self.security.cors_origins = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        self
    }

    /// Startup validation. Problems are reported, not raised.
    pub fn validate(&self) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        for entry in self.rls.admins.malformed_entries() {
            warnings.push(format!("ADMIN_EMAILS entry '{}' is not a valid email address", entry));
        }

        if self.rls.enabled {
            if self.database.url.is_none() {
                errors.push("DATABASE_URL is required when RLS_ENABLED=true".to_string());
            }
            if self.rls.admins.is_empty() {
                errors.push("ADMIN_EMAILS must contain at least one entry when RLS_ENABLED=true".to_string());
            }
        }

        if self.database.service_url.is_none() && self.database.service_user.is_none() {
            warnings.push(
                "no SERVICE_DATABASE_URL or SERVICE_ROLE_USER configured; service-role operations will fail"
                    .to_string(),
            );
        }

        if self.security.jwt_secret.is_empty() {
            warnings.push("JWT_SECRET is empty; every request resolves to the anonymous principal".to_string());
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    fn development() -> Self {
        Self {
            environment: Environment::Development,
            rls: RlsConfig {
                enabled: true,
                admins: AdminSet::default(),
            },
            database: DatabaseConfig {
                url: None,
                service_url: None,
                service_user: None,
                service_password: None,
                max_connections: 10,
                connection_timeout: 30,
            },
            security: SecurityConfig {
                jwt_secret: String::new(),
                jwt_expiry_hours: 24 * 7, // 1 week
                enable_cors: true,
                cors_origins: vec!["http://localhost:3000".to_string()],
            },
        }
    }

    fn staging() -> Self {
        Self {
            environment: Environment::Staging,
            rls: RlsConfig {
                enabled: true,
                admins: AdminSet::default(),
            },
            database: DatabaseConfig {
                url: None,
                service_url: None,
                service_user: None,
                service_password: None,
                max_connections: 20,
                connection_timeout: 10,
            },
            security: SecurityConfig {
                jwt_secret: String::new(),
                jwt_expiry_hours: 24,
                enable_cors: true,
                cors_origins: vec!["https://staging.example.com".to_string()],
            },
        }
    }

    fn production() -> Self {
        Self {
            environment: Environment::Production,
            rls: RlsConfig {
                enabled: true,
                admins: AdminSet::default(),
            },
            database: DatabaseConfig {
                url: None,
                service_url: None,
                service_user: None,
                service_password: None,
                max_connections: 50,
                connection_timeout: 5,
            },
            security: SecurityConfig {
                jwt_secret: String::new(),
                jwt_expiry_hours: 4,
                enable_cors: true,
                cors_origins: vec!["https://app.example.com".to_string()],
            },
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

// Global singleton config - initialized once at startup, never reloaded
pub static CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::from_env);

// Convenience function for accessing config
pub fn config() -> &'static AppConfig {
    &CONFIG
}

#[macro_export]
macro_rules! is_production {
    () => {
        matches!($crate::config::CONFIG.environment, $crate::config::Environment::Production)
    };
}
