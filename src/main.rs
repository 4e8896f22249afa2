//! dnsgate - command line entry point.
//!
//! `run` keeps the gateway alive until Ctrl-C, optionally inside a schedule.
//! The other commands edit the persisted state and exit.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::NaiveTime;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dnsgate::blocklist::{DomainStore, FileBlocklist};
use dnsgate::config::Config;
use dnsgate::gateway::Gateway;
use dnsgate::network::SystemBackend;
use dnsgate::schedule::{ScheduleEngine, SchedulePhase, SystemClock};
use dnsgate::security::SecurityGate;
use dnsgate::state::runtime::RuntimeStateFile;
use dnsgate::state::schedule::{ScheduleStateFile, hhmm};

const DEFAULT_CONFIG_PATH: &str = "dnsgate.toml";

type SystemGateway = Gateway<SystemBackend, FileBlocklist>;

#[derive(Debug, Parser)]
#[command(name = "dnsgate", version, about = "Local DNS blocking gateway")]
struct Cli {
    /// Configuration file (TOML).
    #[arg(long, short, env = "DNSGATE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the gateway until interrupted.
    Run {
        /// Block only inside this daily window, e.g. `22:00-07:00`.
        #[arg(long, value_parser = parse_window, conflicts_with = "duration")]
        interval: Option<Window>,

        /// Block for this many minutes, then stop.
        #[arg(long, value_parser = clap::value_parser!(i64).range(1..))]
        duration: Option<i64>,

        /// Operator password, needed to replace an armed schedule, to clean
        /// up a leftover override, or to stop with Ctrl-C while blocking.
        #[arg(long, env = "DNSGATE_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Inspect or edit the blocklist.
    Domains {
        #[command(subcommand)]
        action: DomainsCommand,
    },
    /// Manage the operator password.
    Password {
        #[command(subcommand)]
        action: PasswordCommand,
    },
    /// Print the persisted state.
    Status,
    /// Return the host to automatic DNS and disable the gateway.
    Restore {
        #[arg(long, env = "DNSGATE_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum DomainsCommand {
    List,
    Add {
        domain: String,
    },
    Remove {
        domain: String,
        #[arg(long, env = "DNSGATE_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum PasswordCommand {
    Change {
        #[arg(long)]
        current: String,
        #[arg(long)]
        new: String,
    },
}

#[derive(Debug, Clone, Copy)]
struct Window {
    start: NaiveTime,
    end: NaiveTime,
}

fn parse_window(value: &str) -> std::result::Result<Window, String> {
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| format!("expected HH:MM-HH:MM, got {value:?}"))?;
    let parse = |part: &str| hhmm::parse(part).map_err(|err| format!("{part:?}: {err}"));
    Ok(Window {
        start: parse(start)?,
        end: parse(end)?,
    })
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            Config::load(DEFAULT_CONFIG_PATH).context("Failed to load configuration")
        }
        None => Ok(Config::default()),
    }
}

fn security_gate(config: &Config) -> SecurityGate {
    SecurityGate::new(config.credentials_path(), config.audit_log_path())
}

fn system_gateway(config: &Config) -> SystemGateway {
    Gateway::new(
        config.clone(),
        SystemBackend::new(),
        FileBlocklist::new(config.domains_path()),
    )
}

/// Missing passwords are checked too, so the refusal is audited.
fn authorize(gate: &SecurityGate, password: Option<&str>) -> bool {
    gate.authorize(password.unwrap_or_default())
}

async fn run_daemon(
    config: Config,
    interval: Option<Window>,
    duration: Option<i64>,
    password: Option<String>,
) -> Result<()> {
    dnsgate::metrics::init(&config.metrics).context("Failed to initialize metrics")?;
    if config.metrics.enabled {
        info!("Metrics enabled on {}", config.metrics.listen);
    }

    let authorized = password.is_some() && authorize(&security_gate(&config), password.as_deref());
    if password.is_some() && !authorized {
        warn!("password rejected, continuing without authorization");
    }

    let gateway = Arc::new(system_gateway(&config));
    let result = serve(&config, Arc::clone(&gateway), interval, duration, authorized).await;

    if let Err(err) = gateway.suspend().await {
        error!("Failed to restore DNS on exit: {err}");
    }
    info!("Shutdown complete.");
    result
}

async fn serve(
    config: &Config,
    gateway: Arc<SystemGateway>,
    interval: Option<Window>,
    duration: Option<i64>,
    authorized: bool,
) -> Result<()> {
    // A persisted schedule decides first, so an interval outside its window
    // clears the enabled flag before the runtime redrive looks at it.
    let schedule = ScheduleEngine::new(
        Arc::clone(&gateway),
        Arc::new(SystemClock),
        ScheduleStateFile::new(config.schedule_state_path()),
    );
    match schedule.recover().await {
        Ok(SchedulePhase::Idle) => {}
        Ok(phase) => info!(?phase, "persisted schedule resumed"),
        Err(err) => error!("Failed to resume persisted schedule: {err}"),
    }

    let recovery = gateway
        .recover(authorized)
        .await
        .context("Startup recovery failed")?;
    info!(?recovery, "startup recovery finished");

    if let Some(window) = interval {
        schedule
            .arm_interval(window.start, window.end, authorized)
            .await
            .context("Failed to arm interval schedule")?;
    } else if let Some(minutes) = duration {
        schedule
            .arm_duration(minutes, authorized)
            .await
            .context("Failed to arm duration schedule")?;
    } else if schedule.phase() == SchedulePhase::Idle {
        gateway.start().await.context("Failed to start gateway")?;
    }

    let mut countdown = schedule.countdown();
    let reporter = tokio::spawn(async move {
        let mut last_edge = None;
        while countdown.changed().await.is_ok() {
            let Some(next) = *countdown.borrow_and_update() else {
                continue;
            };
            if last_edge != Some((next.edge, next.at)) {
                info!(edge = ?next.edge, at = %next.at.format("%Y-%m-%d %H:%M"), "next schedule edge");
                last_edge = Some((next.edge, next.at));
            }
        }
    });

    loop {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        if gateway.may_suspend(authorized).await {
            break;
        }
        warn!(
            "Ctrl-C ignored while blocking is active; run with --password or use `dnsgate restore --password`"
        );
    }
    info!("Ctrl-C received, shutting down...");
    reporter.abort();
    Ok(())
}

fn domains(config: &Config, action: DomainsCommand) -> Result<()> {
    let store = DomainStore::new(config.domains_path());
    match action {
        DomainsCommand::List => {
            for domain in store.list().iter() {
                println!("{domain}");
            }
        }
        DomainsCommand::Add { domain } => {
            if store.add(&domain).context("Failed to update blocklist")? {
                println!("added {domain}");
            } else {
                println!("{domain} is already blocked");
            }
        }
        DomainsCommand::Remove { domain, password } => {
            let authorized = authorize(&security_gate(config), password.as_deref());
            if store
                .remove(&domain, authorized)
                .context("Failed to update blocklist")?
            {
                println!("removed {domain}");
            } else {
                println!("{domain} was not blocked");
            }
        }
    }
    Ok(())
}

fn change_password(config: &Config, current: &str, new: &str) -> Result<()> {
    if !security_gate(config).change_credential(current, new) {
        bail!("Password change refused");
    }
    println!("password changed");
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let runtime = RuntimeStateFile::new(config.runtime_state_path()).load();
    println!("enabled: {}", runtime.enabled);

    match ScheduleStateFile::new(config.schedule_state_path()).load() {
        Some(schedule) => println!(
            "schedule: {}",
            serde_json::to_string(&schedule).context("Failed to encode schedule")?
        ),
        None => println!("schedule: none"),
    }

    match system_gateway(config).snapshot() {
        Some(snapshot) => println!(
            "snapshot: {}",
            serde_json::to_string(&snapshot).context("Failed to encode snapshot")?
        ),
        None => println!("snapshot: none"),
    }
    Ok(())
}

async fn restore(config: &Config, password: Option<&str>) -> Result<()> {
    let authorized = authorize(&security_gate(config), password);
    system_gateway(config)
        .emergency_restore(authorized)
        .await
        .context("Failed to restore DNS")?;
    println!("DNS restored, gateway disabled");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run {
            interval,
            duration,
            password,
        } => run_daemon(config, interval, duration, password).await,
        Command::Domains { action } => domains(&config, action),
        Command::Password {
            action: PasswordCommand::Change { current, new },
        } => change_password(&config, &current, &new),
        Command::Status => status(&config),
        Command::Restore { password } => restore(&config, password.as_deref()).await,
    }
}
