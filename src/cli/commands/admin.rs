use clap::Subcommand;
use serde_json::json;

use super::installer;
use crate::admin::is_user_admin;
use crate::cli::utils::output_success;
use crate::cli::OutputFormat;
use crate::config::config;

#[derive(Subcommand)]
pub enum AdminCommands {
    #[command(about = "Check whether an identity is in the admin set")]
    Check {
        #[arg(help = "Identity (email) to check")]
        identity: String,
    },

    #[command(about = "Copy the admin set into the database predicate's table")]
    Sync,

    #[command(about = "Map a principal id to its identity in the users directory")]
    Register {
        #[arg(help = "Principal id")]
        user_id: String,
        #[arg(help = "Identity (email)")]
        identity: String,
    },
}

pub async fn handle(cmd: AdminCommands, output_format: OutputFormat) -> anyhow::Result<()> {
    match cmd {
        AdminCommands::Check { identity } => {
            let admin = is_user_admin(&identity);
            let message = if admin {
                format!("{} is an admin", identity)
            } else {
                format!("{} is not an admin", identity)
            };
            output_success(&output_format, &message, Some(json!({ "identity": identity, "admin": admin })))
        }
        AdminCommands::Sync => {
            let config = config();
            if config.rls.admins.is_empty() {
                tracing::warn!("ADMIN_EMAILS has no well-formed entries; sync will revoke every admin");
            }
            let (manager, installer) = installer(config).await?;
            let result = installer.sync_admin_identities(&config.rls.admins).await;
            installer.close().await;
            manager.close().await;
            let synced = result?;
            output_success(
                &output_format,
                &format!("Synced {} admin identities", synced),
                Some(json!({ "synced": synced })),
            )
        }
        AdminCommands::Register { user_id, identity } => {
            let (manager, installer) = installer(config()).await?;
            let result = installer.register_user(&user_id, &identity).await;
            installer.close().await;
            manager.close().await;
            result?;
            output_success(&output_format, &format!("Registered {}", user_id), None)
        }
    }
}
