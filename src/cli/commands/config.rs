use clap::Subcommand;
use serde_json::json;

use crate::cli::utils::{output_error, output_success, output_table};
use crate::cli::OutputFormat;
use crate::config::config;

#[derive(Subcommand)]
pub enum ConfigCommands {
    #[command(about = "Validate configuration from the environment")]
    Check,

    #[command(about = "Show effective configuration (secrets redacted)")]
    Show,
}

pub async fn handle(cmd: ConfigCommands, output_format: OutputFormat) -> anyhow::Result<()> {
    let config = config();

    match cmd {
        ConfigCommands::Check => {
            let report = config.validate();
            for warning in &report.warnings {
                tracing::warn!("{}", warning);
            }
            if report.valid {
                output_success(
                    &output_format,
                    "Configuration is valid",
                    Some(json!({ "warnings": report.warnings })),
                )
            } else {
                for error in &report.errors {
                    output_error(&output_format, error, Some("CONFIG_INVALID"))?;
                }
                anyhow::bail!("configuration invalid ({} errors)", report.errors.len())
            }
        }
        ConfigCommands::Show => {
            let rows = vec![
                ("environment".to_string(), format!("{:?}", config.environment)),
                ("rls.enabled".to_string(), config.rls.enabled.to_string()),
                ("rls.admins".to_string(), config.rls.admins.len().to_string()),
                ("database.url".to_string(), redacted(config.database.url.is_some())),
                ("database.service".to_string(), redacted(
                    config.database.service_url.is_some() || config.database.service_user.is_some(),
                )),
                ("database.max_connections".to_string(), config.database.max_connections.to_string()),
                ("security.jwt_expiry_hours".to_string(), config.security.jwt_expiry_hours.to_string()),
            ];
            let data = json!({
                "environment": format!("{:?}", config.environment),
                "rls": { "enabled": config.rls.enabled, "admins": config.rls.admins.len() },
                "database": {
                    "url_set": config.database.url.is_some(),
                    "max_connections": config.database.max_connections,
                    "connection_timeout": config.database.connection_timeout,
                },
            });
            output_table(&output_format, &rows, data)
        }
    }
}

fn redacted(set: bool) -> String {
    if set { "(set)".to_string() } else { "(unset)".to_string() }
}
