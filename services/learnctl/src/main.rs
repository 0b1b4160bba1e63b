//! learnctl
//!
//! Operator CLI for the learning platform API:
//! 1. Loads config and the persisted credential pair
//! 2. Runs one command through the authenticated client
//! 3. Reports a session teardown if the refresh token was rejected

mod commands;
mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use learn_auth::FileCredentialStore;
use learn_client::{Accounts, ApiClient, ClientOptions, SessionEvent, TerminationReason};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::Command;
use crate::config::Config;

fn init_tracing() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f == "json") {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (cli_config_path, rest) = commands::split_config_flag(&args)?;
    let command = Command::parse(&rest)?;

    let config_path = Config::resolve_path(cli_config_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    info!(
        base_url = %config.api.base_url,
        credentials = %config.storage.credentials_path.display(),
        "configuration loaded"
    );

    let store = FileCredentialStore::load(config.storage.credentials_path.clone())
        .with_context(|| {
            format!(
                "failed to open credential store {}",
                config.storage.credentials_path.display()
            )
        })?;
    let client = ApiClient::new(
        ClientOptions {
            base_url: config.api.base_url.clone(),
            timeout: config.timeout(),
        },
        Arc::new(store),
    )
    .context("failed to build API client")?;
    let mut events = client.subscribe();
    let accounts = Accounts::new(client);

    let outcome = commands::run(command, &accounts).await;

    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Terminated {
            reason: TerminationReason::RefreshFailed,
        } = event
        {
            warn!("session expired and stored credentials were removed");
        }
    }

    outcome
}
