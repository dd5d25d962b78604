//! Reseller portal CLI - a terminal client for the portal API.
//!
//! Signs in, keeps the session between runs and issues API calls through
//! the same retry and refresh pipeline the dashboard uses.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use portal_core::api::{ApiRequest, Method};
use portal_core::auth::{GateState, RouteDecision, TracingNavigator, SIGN_IN_ROUTE};
use portal_core::{ApiClient, Config};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "portal", version, about = "Reseller portal API client")]
struct Cli {
    /// API base URL (overrides config and PORTAL_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sign in and store the session
    Login {
        #[arg(long)]
        email: Option<String>,
    },
    /// End the session
    Logout,
    /// Show who is signed in
    Status,
    /// Send a request through the retry and refresh pipeline
    Request {
        /// HTTP method, e.g. GET or POST
        method: String,
        /// Path relative to the API base URL, e.g. /client/balance
        path: String,
        /// JSON request body
        #[arg(long)]
        data: Option<String>,
    },
    /// Change the password (lifts a forced password change)
    ChangePassword,
    /// Show where a dashboard route would lead for the current session
    Guard { route: String },
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("Invalid log file path: {}", path.display()))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_file.as_deref())?;
    info!("Portal CLI starting");

    let mut config = Config::load()?;
    config.apply_env()?;
    if let Some(ref url) = cli.api_url {
        config.api_base_url = url.clone();
    }

    let navigator = Arc::new(TracingNavigator::new());
    let client = ApiClient::connect(&config, navigator.clone()).await?;

    let result = run(cli.command, &client, &mut config).await;

    if navigator.last_route().as_deref() == Some(SIGN_IN_ROUTE) {
        eprintln!("Session ended. Run `portal login` to sign in again.");
    }
    result
}

async fn run(command: Command, client: &ApiClient, config: &mut Config) -> Result<()> {
    match command {
        Command::Login { email } => login(client, config, email).await,
        Command::Logout => {
            client.logout().await;
            Ok(())
        }
        Command::Status => status(client).await,
        Command::Request { method, path, data } => request(client, &method, &path, data).await,
        Command::ChangePassword => change_password(client).await,
        Command::Guard { route } => {
            match client.session().guard(&route).await {
                RouteDecision::Allow => println!("allow {}", route),
                RouteDecision::Redirect(target) => println!("redirect {} -> {}", route, target),
            }
            Ok(())
        }
    }
}

async fn login(client: &ApiClient, config: &mut Config, email: Option<String>) -> Result<()> {
    let email = match email.or_else(|| config.last_email.clone()) {
        Some(email) => email,
        None => prompt("Email: ")?,
    };
    let password = rpassword::prompt_password(format!("Password for {}: ", email))
        .context("Failed to read password")?;

    let identity = client.login(&email, &password).await?;
    println!("Signed in as {} ({})", identity.display(), identity.role);

    if client.session().gate_state().await == GateState::Gated {
        println!("A password change is required. Run `portal change-password`.");
    }

    config.last_email = Some(email);
    config.save()?;
    Ok(())
}

async fn status(client: &ApiClient) -> Result<()> {
    let session = client.session();
    let authenticated = session.check_auth().await;
    match session.identity().await {
        Some(identity) if authenticated => {
            println!("Signed in as {} <{}>", identity.display(), identity.email);
            println!("Role: {}", identity.role);
            if session.gate_state().await == GateState::Gated {
                println!("Password change required");
            }
        }
        _ => println!("Not signed in"),
    }
    Ok(())
}

async fn request(client: &ApiClient, method: &str, path: &str, data: Option<String>) -> Result<()> {
    let method: Method = method
        .to_ascii_uppercase()
        .parse()
        .with_context(|| format!("Invalid HTTP method: {}", method))?;
    let mut request = ApiRequest::new(method, path);
    if let Some(data) = data {
        let body: serde_json::Value =
            serde_json::from_str(&data).context("Request body is not valid JSON")?;
        request = request.json(&body)?;
    }

    let response = client.execute(&request).await?;
    match serde_json::from_str::<serde_json::Value>(&response.body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", response.body),
    }
    Ok(())
}

async fn change_password(client: &ApiClient) -> Result<()> {
    let current = rpassword::prompt_password("Current password: ")?;
    let new = rpassword::prompt_password("New password: ")?;
    let confirm = rpassword::prompt_password("Confirm new password: ")?;
    if new != confirm {
        anyhow::bail!("Passwords do not match");
    }

    client.change_password(&current, &new).await?;
    println!("Password changed");
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    use std::io::Write;

    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let value = line.trim().to_string();
    if value.is_empty() {
        anyhow::bail!("No value entered");
    }
    Ok(value)
}
