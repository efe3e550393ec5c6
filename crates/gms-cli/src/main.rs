//! GMS terminal client - sign in, inspect the session and keep it alive.
//!
//! `gms watch` hosts the session lifecycle interactively: every line typed
//! counts as activity, and the idle or expiry prompt is shown in the
//! terminal.

mod surface;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use gms_core::auth::{claims, CredentialStore};
use gms_core::storage::SessionCipher;
use gms_core::{
    ApiClient, CacheManager, Config, FileStore, LocationNameCache, SessionEvent,
    SessionLifecycle, SessionState,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use surface::TerminalSurface;

/// Log file written by `gms watch`, inside the cache directory
const LOG_FILE: &str = "gms-watch.log";

const USAGE: &str = "\
Usage: gms <command>

Commands:
  login [email]    Sign in and start a session
  status           Show the current session
  verify           Ask the backend whether the session token is still valid
  logout           End the session
  watch            Keep the session open; type to stay active, 'q' to quit
  location <id>    Resolve a pickup location id to its name";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Login(Option<String>),
    Status,
    Verify,
    Logout,
    Watch,
    Location(String),
    Help,
}

fn parse_args(args: &[String]) -> Result<Command> {
    let command = match args.first().map(String::as_str) {
        None | Some("help") | Some("-h") | Some("--help") => Command::Help,
        Some("login") => Command::Login(args.get(1).cloned()),
        Some("status") => Command::Status,
        Some("verify") => Command::Verify,
        Some("logout") => Command::Logout,
        Some("watch") => Command::Watch,
        Some("location") => match args.get(1) {
            Some(id) => Command::Location(id.clone()),
            None => bail!("location requires an id\n\n{}", USAGE),
        },
        Some(other) => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    };
    Ok(command)
}

/// Initialize the tracing subscriber. With `log_dir`, events are also
/// written to a log file; keep the returned guard alive to flush it.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // RUST_LOG controls the level (e.g. RUST_LOG=gms_core=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr = fmt::layer().with_writer(io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(stderr).with(filter).init();
            None
        }
    }
}

/// Everything a command needs, built from the loaded configuration.
struct Client {
    config: Config,
    cache_dir: PathBuf,
    lifecycle: SessionLifecycle,
    api: ApiClient,
}

impl Client {
    fn open(config: Config, cache_dir: PathBuf) -> Result<Self> {
        let cipher = if config.encrypt_session {
            match CredentialStore::storage_key() {
                Ok(key) => Some(SessionCipher::new(&key)),
                Err(e) => {
                    warn!(error = %e, "Keychain unavailable, storing session unencrypted");
                    None
                }
            }
        } else {
            None
        };
        let store = Arc::new(FileStore::open(&cache_dir, cipher)?);
        let lifecycle = SessionLifecycle::from_config(store, &config);
        let api = ApiClient::from_config(&config)?;

        Ok(Self {
            config,
            cache_dir,
            lifecycle,
            api,
        })
    }

    /// API client carrying the current session token, if any.
    fn authed_api(&self) -> ApiClient {
        match self.lifecycle.token() {
            Some(token) => self.api.with_token(token),
            None => self.api.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;
    if command == Command::Help {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = Config::load().context("Failed to load config")?;
    let cache_dir = config.cache_dir()?;
    std::fs::create_dir_all(&cache_dir)
        .with_context(|| format!("Failed to create {}", cache_dir.display()))?;

    let log_dir = matches!(command, Command::Watch).then_some(cache_dir.as_path());
    let _log_guard = init_tracing(log_dir);
    info!(base_url = %config.base_url, ?command, "GMS client starting");

    let mut client = Client::open(config, cache_dir)?;
    match command {
        Command::Login(email) => login(&mut client, email).await,
        Command::Status => status(&client),
        Command::Verify => verify(&client).await,
        Command::Logout => logout(&client),
        Command::Watch => watch(&client).await,
        Command::Location(id) => location(&client, &id).await,
        Command::Help => Ok(()),
    }
}

// ===== Commands =====

async fn login(client: &mut Client, email: Option<String>) -> Result<()> {
    let email = match email {
        Some(email) => email,
        None => prompt_email(client.config.last_email.as_deref())?,
    };
    if email.is_empty() {
        bail!("Email is required");
    }
    let password = rpassword::prompt_password("Password: ")?;
    if password.is_empty() {
        bail!("Password is required");
    }

    let response = client
        .api
        .login(&email, &password)
        .await?
        .into_accepted(client.config.required_role.as_deref())
        .map_err(anyhow::Error::msg)?;

    let lifecycle = &client.lifecycle;
    lifecycle.login(&response.token);
    if lifecycle.user_id().is_none() && !response.user_id.is_empty() {
        lifecycle.save_user_id(&response.user_id);
    }
    if !response.role.is_empty() {
        lifecycle.save_user_type(&response.role);
    }

    client.config.last_email = Some(email.clone());
    if let Err(e) = client.config.save() {
        warn!(error = %e, "Failed to save config");
    }

    println!("Signed in as {}", email);
    if let Some(session) = lifecycle.session() {
        println!(
            "Session expires in {} minutes",
            session.minutes_until_expiry()
        );
    }
    Ok(())
}

fn status(client: &Client) -> Result<()> {
    let lifecycle = &client.lifecycle;
    if !lifecycle.restore() {
        println!("Not signed in");
        return Ok(());
    }
    let Some(session) = lifecycle.session() else {
        println!("Not signed in");
        return Ok(());
    };

    println!("Signed in");
    println!("  User id:    {}", session.user_id.as_deref().unwrap_or("-"));
    let user_type = session
        .user_type
        .clone()
        .or_else(|| claims::extract_role(&session.token));
    println!("  User type:  {}", user_type.as_deref().unwrap_or("-"));
    println!(
        "  Email:      {}",
        lifecycle.user_email().as_deref().unwrap_or("-")
    );
    println!("  Expires in: {} minutes", session.minutes_until_expiry());
    if let Some(last) = session.last_activity_at {
        println!("  Last active: {}", last.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!(
        "  Idle timeout: {} minutes",
        lifecycle.settings().idle_timeout.as_secs() / 60
    );
    Ok(())
}

async fn verify(client: &Client) -> Result<()> {
    let lifecycle = &client.lifecycle;
    if !lifecycle.restore() {
        println!("Not signed in");
        return Ok(());
    }

    let status = lifecycle.verify_remote(&client.api).await;
    if status.is_valid() {
        println!("Session is valid");
    } else {
        println!("Session is no longer valid; signed out");
    }
    Ok(())
}

fn logout(client: &Client) -> Result<()> {
    client.lifecycle.logout();
    println!("Signed out");
    Ok(())
}

async fn watch(client: &Client) -> Result<()> {
    let lifecycle = &client.lifecycle;
    let mut events = lifecycle.subscribe();
    if !lifecycle.restore() {
        bail!("Not signed in. Run `gms login` first.");
    }
    if !lifecycle.verify_remote(&client.api).await.is_valid() {
        bail!("Session was rejected by the server. Run `gms login` again.");
    }

    lifecycle.set_active_surface(Some(Arc::new(TerminalSurface)));
    println!(
        "Watching session (idle timeout {} minutes). Type anything to stay active, 'q' to quit.",
        lifecycle.settings().idle_timeout.as_secs() / 60
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    debug!("stdin closed");
                    break;
                };
                match (lifecycle.state(), line.trim()) {
                    (SessionState::IdleWarned(_), _) => lifecycle.logout(),
                    (_, "q") => break,
                    _ => lifecycle.touch_activity(),
                }
            }
            event = events.recv() => match event {
                Ok(SessionEvent::LoggedOut { forced }) => {
                    if forced {
                        println!("Session ended.");
                    }
                    println!("Signed out. Run `gms login` to start a new session.");
                    break;
                }
                Ok(SessionEvent::PromptRelogin(reason)) => {
                    info!(?reason, "Re-login prompt raised");
                }
                Ok(SessionEvent::LoggedIn { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed session events");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    lifecycle.set_active_surface(None);
    Ok(())
}

async fn location(client: &Client, id: &str) -> Result<()> {
    client.lifecycle.restore();
    let disk = CacheManager::new(client.cache_dir.join("cache"))?;
    let names = LocationNameCache::new(client.authed_api()).with_disk_cache(disk);

    if names.warm_from_disk().await == 0 {
        names.prefetch().await;
    }
    println!("{}", names.name_for(id).await);
    Ok(())
}

fn prompt_email(last_email: Option<&str>) -> Result<String> {
    match last_email {
        Some(last) => print!("Email [{}]: ", last),
        None => print!("Email: "),
    }
    io::stdout().flush()?;

    let mut email = String::new();
    io::stdin().read_line(&mut email)?;
    let email = email.trim();
    Ok(match (email.is_empty(), last_email) {
        (true, Some(last)) => last.to_string(),
        _ => email.to_string(),
    })
}
