//! quillpost - command-line client for the blog API.
//!
//! Keeps a login session between runs and lets you call API endpoints with
//! it. Tokens are refreshed automatically as they near expiry.

use std::io::{self, BufRead, Write};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use quillpost_core::{ApiClient, ApiError, Config};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_FILE: &str = "quillpost.log";

const USAGE: &str = "\
Usage: quillpost <command>

Commands:
  login [username]   Log in and save the session
  register           Create an account
  logout             Forget the saved session
  status             Show the current session
  get <path>         GET an API path and print the JSON response
";

/// Initialize the tracing subscriber for logging.
/// Warnings go to stderr; everything the filter allows also goes to a log
/// file in the data directory.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match config.data_dir() {
        Ok(dir) if std::fs::create_dir_all(&dir).is_ok() => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let mut config = Config::load()?;
    let _log_guard = init_tracing(&config);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprint!("{}", USAGE);
        return Ok(());
    };

    let client = ApiClient::new(&config)?;
    client.restore()?;

    let result = match command.as_str() {
        "login" => login(&client, &mut config, args.get(1).cloned()).await,
        "register" => register(&client).await,
        "logout" => {
            client.logout();
            println!("Logged out.");
            Ok(())
        }
        "status" => {
            status(&client);
            Ok(())
        }
        "get" => match args.get(1) {
            Some(path) => get(&client, path).await,
            None => bail!("Usage: quillpost get <path>"),
        },
        other => {
            eprint!("Unknown command: {}\n\n{}", other, USAGE);
            Ok(())
        }
    };

    if let Err(ref e) = result {
        if let Some(ApiError::Unauthorized) = e.downcast_ref::<ApiError>() {
            eprintln!("Session expired or not logged in. Run `quillpost login`.");
        }
    }
    result
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

async fn login(client: &ApiClient, config: &mut Config, username: Option<String>) -> Result<()> {
    let username = match username.or_else(|| config.last_username.clone()) {
        Some(name) => name,
        None => prompt("Username: ")?,
    };
    let password = rpassword::prompt_password(format!("Password for {}: ", username))
        .context("Failed to read password")?;

    let session = client.login(&username, &password).await?;
    info!(user_id = session.user_id, "Login complete");

    config.last_username = Some(username.clone());
    config.save()?;

    println!(
        "Logged in as {} (token valid for {} more minutes).",
        username,
        session.minutes_until_expiry()
    );
    Ok(())
}

async fn register(client: &ApiClient) -> Result<()> {
    let username = prompt("Username: ")?;
    let email = prompt("Email: ")?;
    let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;
    let confirm = rpassword::prompt_password("Confirm password: ").context("Failed to read password")?;
    if password != confirm {
        bail!("Passwords do not match");
    }

    let response = client.register(&username, &email, &password).await?;
    if response.message.is_empty() {
        println!("Account created. Run `quillpost login {}`.", username);
    } else {
        println!("{}", response.message);
    }
    Ok(())
}

fn status(client: &ApiClient) {
    let Some(session) = client.session().current() else {
        println!("Not logged in.");
        return;
    };

    let age = Utc::now() - session.last_login_time;
    println!("Logged in as {} (user {})", session.username, session.user_id);
    println!("Logged in {} hours ago", age.num_hours());
    if session.is_expired() {
        println!("Access token expired; it will be refreshed on the next request.");
    } else {
        println!("Access token expires in {} minutes", session.minutes_until_expiry());
    }
    if client.session().is_admin() {
        println!("Admin account");
    }
}

async fn get(client: &ApiClient, path: &str) -> Result<()> {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    // A background refresh would be cut off when the process exits
    if client.session().needs_proactive_refresh() {
        client.session().refresh().await;
    }
    let body: serde_json::Value = client.get(&path).await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
