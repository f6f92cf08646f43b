use crate::api::{self, ServerConfig};
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::path::PathBuf;
use tracing::info;
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub directory_dsn: String,
    pub registry_path: PathBuf,
    pub private_key_path: PathBuf,
    pub public_key_path: PathBuf,
    pub webhook_url: String,
    pub admin_user: String,
    pub admin_password_hash: SecretString,
}

/// Execute the server action.
/// # Errors
/// Returns an error if a DSN is malformed or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    // Fail on malformed DSNs here instead of deep inside the pool.
    Url::parse(&args.dsn).context("invalid broker DSN")?;
    Url::parse(&args.directory_dsn).context("invalid directory DSN")?;

    log_startup_args(&args);

    api::new(ServerConfig {
        port: args.port,
        dsn: args.dsn,
        directory_dsn: args.directory_dsn,
        registry_path: args.registry_path,
        private_key_path: args.private_key_path,
        public_key_path: args.public_key_path,
        webhook_url: args.webhook_url,
        admin_user: args.admin_user,
        admin_password_hash: args.admin_password_hash,
    })
    .await
}

fn log_startup_args(args: &Args) {
    info!(
        port = args.port,
        registry = %args.registry_path.display(),
        admin_user = args.admin_user,
        "Starting server"
    );
}
