//! bw-launcher - interactive vault search on top of the Bitwarden CLI
//!
//! Usage:
//!   bw-launcher [OPTIONS]
//!
//! Options:
//!   -c, --config <PATH>  Path to config file
//!   -v, --verbose        Increase log verbosity
//!   --json-logs          Output logs as JSON
//!
//! Reads one line at a time from stdin: plain text searches the vault,
//! `:help` lists the commands. API keys may be supplied through
//! `BW_CLIENTID` / `BW_CLIENTSECRET`.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use clap::Parser;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bw_launcher::api::HttpHelperApi;
use bw_launcher::backend::BwCli;
use bw_launcher::cache::ItemCache;
use bw_launcher::clock::{Clock, SystemClock};
use bw_launcher::config::{Config, Preferences};
use bw_launcher::credentials::MemoryCredentialStore;
use bw_launcher::icons::{IconFetcher, IconResolver, NoopResolver};
use bw_launcher::notify::{LogNotifier, Notifier, PreferenceGate};
use bw_launcher::orchestrator::{QueryOrchestrator, QueryResponse};
use bw_launcher::session::VaultSession;
use bw_launcher::shell::ShellCommand;
use bw_launcher::supervisor::{Supervisor, SystemProcessTable};

#[derive(Parser, Debug)]
#[command(name = "bw-launcher")]
#[command(author, version, about = "Interactive Bitwarden vault search", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "BW_LAUNCHER_CONFIG")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output logs as JSON
    #[arg(long)]
    json_logs: bool,
}

struct App {
    session: Arc<VaultSession>,
    orchestrator: Arc<QueryOrchestrator>,
    preferences: Arc<RwLock<Preferences>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout is the interactive surface
    let log_level = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("bw_launcher={log_level},warn")));

    if args.json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting bw-launcher");

    let config = Config::load(args.config.as_ref())?;
    tracing::debug!(config = ?config, "loaded configuration");

    let app = build(&config)?;
    let auto_lock = app.session.spawn_auto_lock();

    if !app.session.is_installed().await {
        println!("bw CLI not found ({}); install it and restart", config.cli.binary.display());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };

        let command = match line.parse::<ShellCommand>() {
            Ok(command) => command,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        if matches!(command, ShellCommand::Quit) {
            break;
        }
        // A signal abandons the running command; its CLI children die with it
        let Some(outcome) = interruptible(shutdown.as_mut(), execute(&app, command, &mut lines)).await else {
            break;
        };
        if let Err(e) = outcome {
            tracing::error!(error = %e, kind = ?e.kind(), "command failed");
            println!("error: {e}");
        }
    }

    tracing::info!("shutting down");

    auto_lock.abort();
    app.orchestrator.cancel_pending();
    app.session.shutdown().await;

    let stats = app.orchestrator.cache().stats();
    tracing::info!(
        cache_entries = stats.entries,
        cache_hits = stats.hits,
        cache_misses = stats.misses,
        cache_hit_ratio = format!("{:.2}%", stats.hit_ratio * 100.0),
        "final statistics"
    );

    Ok(())
}

fn build(config: &Config) -> anyhow::Result<App> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let preferences = Arc::new(RwLock::new(config.preferences.clone()));
    let notifier: Arc<dyn Notifier> = Arc::new(PreferenceGate::new(Arc::new(LogNotifier), preferences.clone()));

    let cli = Arc::new(BwCli::new(&config.cli));
    let api = Arc::new(HttpHelperApi::new(
        config.server_url(),
        Duration::from_secs(config.server.request_timeout_secs),
    )?);
    let supervisor = Arc::new(Supervisor::new(
        config.server.clone(),
        cli.clone(),
        api.clone(),
        Arc::new(SystemProcessTable::new()),
    ));

    let session = Arc::new(VaultSession::new(
        config,
        cli,
        api,
        supervisor,
        Arc::new(MemoryCredentialStore::from_env()),
        notifier.clone(),
        clock.clone(),
    ));

    let cache = Arc::new(ItemCache::open(config.item_cache_path(), config.item_ttl(), clock.clone()));
    let icons: Arc<dyn IconResolver> = if config.icons.enabled {
        Arc::new(IconFetcher::from_config(config, clock)?)
    } else {
        Arc::new(NoopResolver)
    };

    let orchestrator = Arc::new(QueryOrchestrator::new(
        config,
        session.clone(),
        cache,
        icons,
        notifier,
        preferences.clone(),
    ));

    Ok(App {
        session,
        orchestrator,
        preferences,
    })
}

async fn execute(app: &App, command: ShellCommand, lines: &mut Lines<BufReader<Stdin>>) -> bw_launcher::Result<()> {
    match command {
        ShellCommand::Query(text) => print_response(app.orchestrator.query(&text).await),
        ShellCommand::Unlock => {
            println!("master password:");
            let Some(password) = lines.next_line().await? else {
                return Ok(());
            };
            let password = SecretString::from(password);
            if app.session.unlock(&password).await? {
                println!("unlocked");
            } else {
                println!("unlock failed");
            }
        }
        ShellCommand::Lock => {
            app.session.lock().await;
            println!("locked");
        }
        ShellCommand::Sync => {
            let report = app.orchestrator.sync().await?;
            println!("{}", report.summary());
        }
        ShellCommand::Login => {
            if app.session.login().await? {
                println!("logged in");
            } else {
                println!("login failed");
            }
        }
        ShellCommand::Logout => {
            app.session.logout().await?;
            println!("logged out");
        }
        ShellCommand::Status => {
            let status = app.session.cli_status().await?;
            println!("vault:      {:?}", status.status);
            println!("user:       {}", status.user_email.as_deref().unwrap_or("-"));
            println!("server:     {}", status.server_url.as_deref().unwrap_or("default"));
            if let Some(last_sync) = status.last_sync {
                println!("last sync:  {last_sync}");
            }
            println!("session:    {:?}", app.session.lock_state());
            match app.session.supervisor().info().await {
                Some(info) => println!(
                    "helper:     pid {} on port {} ({})",
                    info.pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into()),
                    info.port,
                    if info.running { "running" } else { "exited" }
                ),
                None => println!("helper:     not running"),
            }
        }
        ShellCommand::Restart => {
            app.session.restart_helper().await;
            println!("helper restarted; unlock again");
        }
        ShellCommand::Server(url) => {
            if app.session.configure_server(&url).await? {
                println!("server set to {url}");
            } else {
                println!("bw rejected the server url");
            }
        }
        ShellCommand::ApiKey {
            client_id,
            client_secret,
        } => {
            app.session.save_api_key(&client_id, client_secret)?;
            println!("api key saved");
        }
        ShellCommand::Password(id) => {
            let password = app.orchestrator.password(&id).await?;
            println!("{}", password.expose_secret());
        }
        ShellCommand::Username(id) => {
            let username = app.orchestrator.username(&id).await?;
            println!("{}", username.as_deref().unwrap_or("(no username)"));
        }
        ShellCommand::Totp(id) => {
            let code = app.orchestrator.totp(&id).await?;
            println!("{}", code.expose_secret());
        }
        ShellCommand::Toggle { toggle, value } => {
            if let Ok(mut preferences) = app.preferences.write() {
                preferences.set(toggle, value);
            }
            println!("{} = {}", toggle.key(), if value { "on" } else { "off" });
        }
        ShellCommand::Stats => {
            let stats = app.orchestrator.cache().stats();
            println!(
                "{} cached items, {} hits, {} misses ({:.0}% hit ratio)",
                stats.entries,
                stats.hits,
                stats.misses,
                stats.hit_ratio * 100.0
            );
        }
        ShellCommand::Help => println!("{HELP}"),
        ShellCommand::Quit => {}
    }
    Ok(())
}

fn print_response(response: QueryResponse) {
    match response {
        QueryResponse::NotInstalled => println!("bw CLI not found; install it first"),
        QueryResponse::NeedsSetup => println!("no API key configured; use :apikey <client_id> <secret>"),
        QueryResponse::Locked => println!("vault is locked; use :unlock"),
        QueryResponse::Superseded => {}
        QueryResponse::Failed { message, kind } => println!("search failed ({kind:?}): {message}"),
        QueryResponse::Items(items) if items.is_empty() => println!("no matches"),
        QueryResponse::Items(items) => {
            for item in items {
                let totp = if item.has_totp { " [totp]" } else { "" };
                println!(
                    "{:<36}  {}  {}{}",
                    item.id,
                    item.name,
                    item.username.as_deref().unwrap_or(""),
                    totp
                );
            }
        }
    }
}

const HELP: &str = "\
<text>                        search the vault
:unlock | :lock | :sync       session and cache
:login | :logout | :status    CLI account
:restart                      kill the helper (requires a new unlock)
:server <url>                 use a self-hosted server
:apikey <client_id> <secret>  store the API key
:password | :username | :totp <id>
:toggle <key> <on|off>        notify_on_auto_lock, notify_on_sync, show_icons
:stats | :help | :quit";

/// Run `command` to completion unless `shutdown` fires first.
async fn interruptible<S, F>(shutdown: Pin<&mut S>, command: F) -> Option<F::Output>
where
    S: Future<Output = ()>,
    F: Future,
{
    tokio::select! {
        _ = shutdown => None,
        output = command => Some(output),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM");
        }
    }
}
