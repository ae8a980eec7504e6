use clap::Subcommand;
use serde_json::json;

use super::installer;
use crate::cli::utils::{output_success, output_table};
use crate::cli::OutputFormat;
use crate::config::{config, AppConfig};

#[derive(Subcommand)]
pub enum PolicyCommands {
    #[command(about = "Create helper functions, tables and row policies")]
    Install {
        #[arg(long, help = "Install with enforcement off (default follows RLS_ENABLED)")]
        disabled: bool,

        #[arg(long, help = "Application role to grant table access (defaults to the DATABASE_URL user)")]
        grant: Option<String>,
    },

    #[command(about = "Turn row-level enforcement on for every protected table")]
    Enable,

    #[command(about = "Emergency rollback: turn enforcement off, keep policies and data")]
    Disable,

    #[command(about = "Show enforcement per protected table")]
    Status,
}

pub async fn handle(cmd: PolicyCommands, output_format: OutputFormat) -> anyhow::Result<()> {
    let config = config();
    let (manager, installer) = installer(config).await?;

    let result = match cmd {
        PolicyCommands::Install { disabled, grant } => {
            let enabled = install_enforcement(config, disabled);
            installer.install(enabled).await?;
            if let Some(role) = grant.or_else(|| app_role(config)) {
                installer.grant(&role).await?;
            }
            let synced = installer.sync_admin_identities(&config.rls.admins).await?;
            output_success(
                &output_format,
                &format!("Policies installed, {} admin identities synced", synced),
                Some(json!({ "enforcement": enabled, "admins": synced })),
            )
        }
        PolicyCommands::Enable => {
            installer.set_enforcement(true).await?;
            output_success(&output_format, "Row-level enforcement enabled", None)
        }
        PolicyCommands::Disable => {
            tracing::warn!("disabling row-level enforcement on every protected table");
            installer.set_enforcement(false).await?;
            output_success(&output_format, "Row-level enforcement disabled", None)
        }
        PolicyCommands::Status => {
            let status = installer.status().await?;
            let rows = status
                .iter()
                .map(|s| {
                    let state = match (s.enabled, s.policy_installed) {
                        (true, true) => "enforced",
                        (false, true) => "DISABLED",
                        (_, false) => "no policy",
                    };
                    (s.table.clone(), state.to_string())
                })
                .collect::<Vec<_>>();
            output_table(&output_format, &rows, json!({ "tables": status }))
        }
    };

    installer.close().await;
    manager.close().await;
    result
}

/// `--disabled` forces enforcement off; otherwise the enable flag decides.
fn install_enforcement(config: &AppConfig, disabled: bool) -> bool {
    !disabled && config.rls.enabled
}

/// Username of the filtered pool's connection string.
fn app_role(config: &AppConfig) -> Option<String> {
    let url = url::Url::parse(config.database.url.as_deref()?).ok()?;
    Some(url.username().to_string()).filter(|u| !u.is_empty())
}
