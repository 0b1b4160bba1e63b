//! Command parsing and execution

use anyhow::{Result, anyhow, bail};
use learn_client::{Accounts, ApiError};
use tracing::info;

use crate::config;

pub const USAGE: &str = "usage: learnctl [--config <path>] <command>

commands:
  login <username>   log in (password from LEARN_PASSWORD)
  whoami             show the current user, refreshing the session if needed
  get <path>         GET an API path, e.g. /assessment/my-history/
  logout             forget the stored credentials";

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Login { username: String },
    Whoami,
    Get { path: String },
    Logout,
}

impl Command {
    /// Parse the positional arguments that follow the global flags.
    pub fn parse(args: &[String]) -> Result<Self> {
        let mut args = args.iter().map(String::as_str);
        let command = match (args.next(), args.next()) {
            (Some("login"), Some(username)) => Command::Login {
                username: username.to_string(),
            },
            (Some("whoami"), None) => Command::Whoami,
            (Some("get"), Some(path)) => Command::Get {
                path: path.to_string(),
            },
            (Some("logout"), None) => Command::Logout,
            _ => bail!("{USAGE}"),
        };
        if args.next().is_some() {
            bail!("{USAGE}");
        }
        Ok(command)
    }
}

/// Split `--config <path>` out of the argument list.
pub fn split_config_flag(args: &[String]) -> Result<(Option<&str>, Vec<String>)> {
    let mut config = None;
    let mut rest = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let path = iter
                .next()
                .ok_or_else(|| anyhow!("--config requires a path"))?;
            config = Some(path.as_str());
        } else {
            rest.push(arg.clone());
        }
    }
    Ok((config, rest))
}

pub async fn run(command: Command, accounts: &Accounts) -> Result<()> {
    match command {
        Command::Login { username } => {
            let password = config::password_from_env()?;
            let identity = accounts
                .login(&username, password.expose())
                .await
                .map_err(explain)?;
            println!(
                "logged in as {} ({})",
                identity.display_name(),
                identity.role.as_deref().unwrap_or("unknown role")
            );
        }
        Command::Whoami => match accounts.restore().await.map_err(explain)? {
            Some(identity) => println!("{}", serde_json::to_string_pretty(&identity)?),
            None => println!("not logged in"),
        },
        Command::Get { path } => {
            let response = accounts.client().get(&path).await.map_err(explain)?;
            match response.json::<serde_json::Value>() {
                Ok(body) => println!("{}", serde_json::to_string_pretty(&body)?),
                Err(_) => println!("{}", response.text()),
            }
        }
        Command::Logout => {
            if accounts.logout() {
                println!("logged out");
            } else {
                println!("already logged out");
            }
        }
    }
    Ok(())
}

/// Render an API error with the backend's explanation, if it gave one.
fn explain(err: ApiError) -> anyhow::Error {
    if err.is_session_ended() {
        info!("session ended");
        return anyhow!("{err}; log in again with `learnctl login <username>`");
    }

    let mut message = err.to_string();
    if let Some(detail) = err.detail() {
        message.push_str(&format!(": {detail}"));
    }
    for (field, error) in err.field_errors() {
        message.push_str(&format!("\n  {field}: {error}"));
    }
    anyhow!(message)
}
