//! keyport - command-line client for the keyport API.
//!
//! Logs in, keeps the session credential fresh, and makes authenticated
//! calls from the terminal.

use std::io;

use anyhow::{bail, Context, Result};
use keyport_core::api::Method;
use keyport_core::auth::expiry;
use keyport_core::{ApiClient, Config, SessionEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable holding the login password (skips the prompt)
const PASSWORD_ENV: &str = "KEYPORT_PASSWORD";

const USAGE: &str = "\
Usage: keyport <command> [args]

Commands:
  login [email]              Log in (password from KEYPORT_PASSWORD or prompt)
  register <name> <email>    Create an account
  logout                     End the session
  status                     Show whether a credential is held and when it expires
  profile                    Show the logged-in user's profile
  get <path>                 Authenticated GET, prints the response body
  watch                      Keep the session fresh and print session events";

/// Initialize the tracing subscriber for logging
fn init_tracing() -> WorkerGuard {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let (writer, guard) = tracing_appender::non_blocking(io::stderr());

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer))
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{}", USAGE);
        return Ok(());
    };

    let mut config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Failed to load config, using defaults");
            let mut config = Config::default();
            config.apply_env();
            config
        }
    };
    let store = config.open_store().context("Failed to open credential store")?;
    let api = ApiClient::new(&config, store)?;

    match (command, &args[1..]) {
        ("login", rest) => login(&api, &mut config, rest.first().cloned()).await,
        ("register", [name, email]) => register(&api, name, email).await,
        ("logout", []) => {
            api.logout();
            println!("Logged out");
            Ok(())
        }
        ("status", []) => {
            status(&api);
            Ok(())
        }
        ("profile", []) => {
            let profile = api.profile().await?;
            println!("Name:    {}", profile.display_name());
            println!("Email:   {}", profile.email);
            println!("Balance: {}", profile.saldo);
            if profile.is_staff {
                println!("Role:    staff");
            }
            Ok(())
        }
        ("get", [path]) => {
            let response = api.send(api.request(Method::GET, path)).await?;
            let status = response.status();
            let body = response.text().await.context("Failed to read response body")?;
            println!("{}", body);
            if !status.is_success() {
                bail!("Request failed with status {}", status);
            }
            Ok(())
        }
        ("watch", []) => watch(&api, &config).await,
        _ => {
            eprintln!("{}", USAGE);
            bail!("Unknown command or wrong arguments: {}", args.join(" "))
        }
    }
}

fn read_password() -> Result<String> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(password);
    }
    let password = rpassword::prompt_password("Password: ")?;
    Ok(password)
}

async fn login(api: &ApiClient, config: &mut Config, email: Option<String>) -> Result<()> {
    let email = email
        .or_else(|| config.last_email.clone())
        .ok_or_else(|| anyhow::anyhow!("Email required: keyport login <email>"))?;
    let password = read_password()?;

    if email.is_empty() || password.is_empty() {
        bail!("Email and password required");
    }

    api.login(&email, &password).await?;
    info!("Login successful");

    config.last_email = Some(email.clone());
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }
    println!("Logged in as {}", email);
    Ok(())
}

async fn register(api: &ApiClient, name: &str, email: &str) -> Result<()> {
    let password = read_password()?;
    if api.register(name, email, &password).await? {
        println!("Account created, logged in as {}", email);
    } else {
        println!("Account created, log in with: keyport login {}", email);
    }
    Ok(())
}

fn status(api: &ApiClient) {
    let Some(credential) = api.session().credential() else {
        println!("Not logged in");
        return;
    };

    match expiry::time_until_expiry(&credential) {
        Some(remaining) if remaining.num_seconds() > 0 => {
            println!("Logged in, credential expires in {} minutes", remaining.num_minutes());
        }
        Some(_) => println!("Logged in, credential expired (will refresh on next call)"),
        None => println!("Logged in, credential expiry unknown"),
    }
    if api.session().refresh_credential().is_some() {
        println!("Refresh credential held");
    }
}

async fn watch(api: &ApiClient, config: &Config) -> Result<()> {
    if !api.session().is_authenticated() {
        bail!("Not logged in");
    }

    let mut events = api.session().subscribe();
    let handle = api
        .scheduler()
        .with_threshold(config.refresh_threshold())
        .start(config.check_interval());
    // Starting to watch counts as coming to the foreground
    handle.notify_foreground();
    println!("Watching session (Ctrl-C to stop)");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SessionEvent::CredentialUpdated(_)) => println!("Credential refreshed"),
                Ok(SessionEvent::SessionTerminated) => {
                    println!("Session ended, log in again with: keyport login");
                    break;
                }
                Err(RecvError::Lagged(missed)) => warn!(missed, "Missed session events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    handle.shutdown();
    Ok(())
}
