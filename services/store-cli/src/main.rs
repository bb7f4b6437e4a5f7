//! StoreManager command-line client
//!
//! Drives the authenticated API client from a terminal:
//! 1. Loads `store-cli.toml` (or `--config` / CONFIG_PATH)
//! 2. Opens the credential file shared by every invocation
//! 3. Runs one command through the client, refreshing the session as needed
//!
//! Commands are defined in `cli`; `store-cli --help` lists them.

mod cli;
mod config;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use store_auth::FileCredentialStore;
use store_client::{AuthService, AuthenticatedHttpClient, ClientConfig, SessionState};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::{MultipartPart, ReqwestTransport};

use crate::cli::{Cli, Command};
use crate::config::Config;

/// MIME type sent with an import file, from its extension.
fn import_mime_type(file: &Path) -> &'static str {
    match file
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("csv") => "text/csv",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("xls") => "application/vnd.ms-excel",
        _ => "application/octet-stream",
    }
}

fn init_tracing() {
    // LOG_LEVEL / RUST_LOG filter; logs go to stderr so stdout stays parseable
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(command: Command, config: &Config, client: AuthenticatedHttpClient) -> Result<()> {
    let auth = AuthService::new(client.clone());

    match command {
        Command::Status => match client.bootstrap().await {
            SessionState::Authenticated { user } => println!(
                "signed in as {} <{}> ({})",
                user.user_name,
                user.email_address,
                user.user_role.label()
            ),
            SessionState::Anonymous => println!("not signed in"),
        },
        Command::Login { email } => {
            let email = email
                .or_else(|| config.login.email.clone())
                .context("no email given and none configured under [login]")?;
            let password = config
                .login
                .password
                .as_ref()
                .context("no password: set STORE_PASSWORD or [login].password_file")?;
            let user = auth.login(&email, password).await.context("login failed")?;
            println!("signed in as {} ({})", user.user_name, user.user_role.label());
        }
        Command::Logout => {
            auth.logout().await.context("logout failed")?;
            println!("signed out");
        }
        Command::LogoutAll => {
            auth.logout_all().await.context("logout failed")?;
            println!("signed out of every device");
        }
        Command::Profile => {
            let user = auth.profile().await.context("failed to fetch profile")?;
            print_json(&serde_json::to_value(&user)?)?;
        }
        Command::Get { path, query } => {
            let query: Vec<(&str, &str)> = query
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            let body: serde_json::Value = client
                .get_with_query(&path, &query)
                .await
                .with_context(|| format!("GET {path} failed"))?;
            print_json(&body)?;
        }
        Command::Import {
            path,
            file,
            mappings,
        } => {
            let file_path = file.as_path();
            let bytes = tokio::fs::read(file_path)
                .await
                .with_context(|| format!("failed to read {}", file_path.display()))?;
            let file_name = file_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("upload")
                .to_string();

            let mut parts = vec![MultipartPart::file(
                "file",
                file_name,
                import_mime_type(file_path),
                bytes,
            )];
            if let Some(mappings) = mappings {
                serde_json::from_str::<serde_json::Value>(&mappings)
                    .context("mappings must be a JSON object")?;
                parts.push(MultipartPart::text("mappings", mappings));
            }

            let body: serde_json::Value = client
                .post_multipart(&path, parts)
                .await
                .with_context(|| format!("import to {path} failed"))?;
            print_json(&body)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config_path = cli.config;
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    info!(
        path = %config_path.display(),
        base_url = %config.api.base_url,
        timeout_secs = config.api.timeout_secs,
        "configuration loaded"
    );

    let store = FileCredentialStore::load(config.storage.credentials_path.clone())
        .await
        .with_context(|| {
            format!(
                "failed to open credentials at {}",
                config.storage.credentials_path.display()
            )
        })?;
    let transport = ReqwestTransport::new(config.api.base_url.clone(), config.api.timeout());
    let client = AuthenticatedHttpClient::with_config(
        Arc::new(transport),
        Arc::new(store),
        ClientConfig {
            refresh_wait_timeout: config.api.refresh_wait_timeout(),
        },
    );

    if let Err(e) = run(cli.command, &config, client).await {
        let session_gone = e
            .chain()
            .filter_map(|cause| cause.downcast_ref::<store_client::Error>())
            .any(store_client::Error::is_terminal);
        if session_gone {
            error!(error = %e, "session expired, run `store-cli login` again");
        } else {
            error!(error = %e, "command failed");
        }
        return Err(e);
    }
    Ok(())
}
