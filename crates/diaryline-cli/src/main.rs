//! diaryline - command line client for the diary backend.
//!
//! Signs in, keeps the access token in the OS keychain, and follows the AI
//! analysis of a diary entry until it completes.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use diaryline_core::api::ApiRequest;
use diaryline_core::auth::{KeyringCredentialStore, MemoryCredentialStore};
use diaryline_core::{
    ApiClient, AuthError, AuthSession, Config, CredentialStore, PollEventKind, SessionPhase,
    StatusPoller,
};

/// Log file name prefix inside the cache directory
const LOG_FILE_PREFIX: &str = "diaryline.log";

/// Environment variable holding the password for non-interactive sign-in
const PASSWORD_ENV: &str = "DIARYLINE_PASSWORD";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Backend base URL (overrides config and DIARYLINE_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Keep the token in memory only instead of the OS keychain
    #[arg(long, global = true)]
    ephemeral: bool,

    /// Write logs to a daily file in the cache directory instead of stderr
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in with an email address or login id
    Login {
        /// Email or login id (defaults to the last one used)
        identifier: Option<String>,
    },
    /// Sign out and forget the stored token
    Logout,
    /// Show the signed-in user
    Whoami,
    /// Authenticated GET of an API path, printing the response body
    Get {
        /// Path relative to the base URL, e.g. /api/diaries
        path: String,
    },
    /// Follow the AI analysis of a diary until it completes or fails
    Watch {
        diary_id: String,

        /// Poll interval in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,
    },
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_to_file: bool) -> Result<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (writer, guard) = if log_to_file {
        let dir = Config::cache_dir()?;
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX))
    } else {
        tracing_appender::non_blocking(io::stderr())
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(!log_to_file))
        .with(filter)
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_file)?;

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(ref url) = cli.base_url {
        config.apply_overrides(Some(url.clone()), None)?;
    }
    info!(base_url = %config.base_url, "diaryline starting");

    let store: Arc<dyn CredentialStore> = if cli.ephemeral {
        Arc::new(MemoryCredentialStore::new())
    } else {
        Arc::new(KeyringCredentialStore::with_service(&config.keyring_service))
    };
    let api = ApiClient::new(&config.base_url)?.with_refresh_provider(&config.refresh_provider);
    let session = AuthSession::new(api, store);
    session.bootstrap().await;

    match cli.command {
        Command::Login { identifier } => login(&session, &mut config, identifier).await,
        Command::Logout => {
            session.sign_out();
            println!("Signed out.");
            Ok(())
        }
        Command::Whoami => {
            match session.user() {
                Some(user) => {
                    println!("{}", user.display_name());
                    if let Some(ref email) = user.email {
                        let verified = if user.email_verified { "verified" } else { "unverified" };
                        println!("  email: {} ({})", email, verified);
                    }
                    if let Some(ref login_id) = user.login_id {
                        println!("  login id: {}", login_id);
                    }
                }
                None => println!("Not signed in."),
            }
            Ok(())
        }
        Command::Get { path } => get(&session, &path).await,
        Command::Watch {
            diary_id,
            interval_ms,
        } => {
            let interval = interval_ms
                .map(std::time::Duration::from_millis)
                .unwrap_or_else(|| config.poll_interval());
            watch(&session, &diary_id, interval).await
        }
    }
}

/// User-facing message on top, technical detail as the cause.
fn fail(e: AuthError) -> anyhow::Error {
    let message = e.user_message();
    anyhow::Error::new(e).context(message)
}

fn require_session(session: &AuthSession) -> Result<()> {
    if session.phase() != SessionPhase::SignedIn {
        anyhow::bail!("Not signed in. Run `diaryline login` first.");
    }
    Ok(())
}

async fn login(session: &AuthSession, config: &mut Config, identifier: Option<String>) -> Result<()> {
    let identifier = match identifier.or_else(|| config.last_identifier.clone()) {
        Some(id) => id,
        None => prompt("Email or login id: ")?,
    };
    let password = match std::env::var(PASSWORD_ENV) {
        Ok(p) if !p.is_empty() => p,
        _ => rpassword::prompt_password("Password: ")?,
    };

    let user = session.sign_in(&identifier, &password).await.map_err(fail)?;

    config.last_identifier = Some(identifier.trim().to_string());
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }

    println!("Signed in as {}.", user.display_name());
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

async fn get(session: &AuthSession, path: &str) -> Result<()> {
    require_session(session)?;

    let url = session.api().url(path);
    let response = session
        .authenticated_fetch(ApiRequest::get(url))
        .await
        .map_err(fail)?;

    eprintln!("HTTP {}", response.status);
    match response.json::<serde_json::Value>() {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{}", response.text()),
    }

    if session.phase() == SessionPhase::SignedOut {
        anyhow::bail!("Your session has expired. Please sign in again.");
    }
    Ok(())
}

async fn watch(session: &AuthSession, diary_id: &str, interval: std::time::Duration) -> Result<()> {
    require_session(session)?;

    let mut poller = StatusPoller::new(session.clone()).with_interval(interval);
    let mut handle = poller.monitor(diary_id);
    println!("Watching analysis of diary {} (Ctrl-C to stop)...", diary_id);

    loop {
        let event = tokio::select! {
            event = handle.next() => event,
            _ = tokio::signal::ctrl_c() => {
                poller.disconnect();
                println!("Stopped.");
                return Ok(());
            }
        };

        let Some(event) = event else {
            anyhow::bail!("Stopped watching before the analysis finished.");
        };

        let time = event.received_at.format("%H:%M:%S");
        match event.kind {
            PollEventKind::Update(report) => {
                println!("[{}] {}", time, report.status.as_deref().unwrap_or("?"));
            }
            PollEventKind::Complete(report) => {
                println!("[{}] COMPLETED", time);
                for emotion in &report.emotions {
                    let category = emotion.category.as_deref().unwrap_or("(unnamed)");
                    match emotion.intensity {
                        Some(i) => println!("  {:<12} {:.2}", category, i),
                        None => println!("  {}", category),
                    }
                }
                if let Some(ref coaching) = report.coaching {
                    println!("\n{}", coaching);
                }
                return Ok(());
            }
            PollEventKind::Failed(report) => {
                anyhow::bail!(
                    "Analysis failed: {}",
                    report.error_message.as_deref().unwrap_or("no reason given")
                );
            }
            PollEventKind::Error(message) => {
                eprintln!("[{}] {}", time, message);
            }
        }
    }
}
