//! fleetd: the FleetGrid daemon.
//!
//! Assembles the state store and the scheduler service, loads a scenario
//! of nodes and jobs, drives it to a settled state, and reports where
//! everything was placed.
//!
//! # Usage
//!
//! ```text
//! fleetd run --config fleet.toml --scenario scenario.toml
//! fleetd run --scenario scenario.toml --in-memory --json
//! fleetd config --config fleet.toml
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fleetgrid_scheduler::{FleetConfig, Service};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod report;
mod scenario;

use report::Report;
use scenario::Scenario;

#[derive(Parser)]
#[command(name = "fleetd", about = "FleetGrid scheduler daemon", version)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a scenario, schedule it to completion, and print the placements.
    Run {
        #[command(flatten)]
        overrides: Overrides,

        /// Scenario file with nodes, jobs, and events.
        #[arg(long)]
        scenario: PathBuf,

        /// Seconds to wait for the scheduler to go idle after each step.
        #[arg(long, default_value = "30")]
        timeout_secs: u64,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,

        /// Include stopped and terminal allocations in the report.
        #[arg(long)]
        all: bool,

        /// Keep the scheduler running until interrupted.
        #[arg(long)]
        serve: bool,
    },
    /// Print the effective configuration.
    Config {
        #[command(flatten)]
        overrides: Overrides,
    },
}

#[derive(clap::Args)]
struct Overrides {
    /// fleet.toml; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of scheduler workers.
    #[arg(long)]
    workers: Option<usize>,

    /// Data directory for persistent state.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Keep all state in memory.
    #[arg(long)]
    in_memory: bool,
}

impl Overrides {
    fn load(&self) -> anyhow::Result<FleetConfig> {
        let mut config = match &self.config {
            Some(path) => FleetConfig::from_file(path)
                .with_context(|| format!("load config {}", path.display()))?,
            None => FleetConfig::default(),
        };
        if let Some(workers) = self.workers {
            config.scheduler.num_workers = workers;
        }
        if let Some(dir) = &self.data_dir {
            config.store.data_dir = dir.clone();
        }
        if self.in_memory {
            config.store.in_memory = true;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fleetd=debug,fleetgrid=debug"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match cli.command {
        Command::Run {
            overrides,
            scenario,
            timeout_secs,
            json,
            all,
            serve,
        } => {
            let config = overrides.load()?;
            let options = RunOptions {
                timeout: Duration::from_secs(timeout_secs),
                json,
                all,
                serve,
            };
            run(config, &scenario, options).await
        }
        Command::Config { overrides } => {
            let config = overrides.load()?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

struct RunOptions {
    timeout: Duration,
    json: bool,
    all: bool,
    serve: bool,
}

async fn run(config: FleetConfig, scenario_path: &Path, options: RunOptions) -> anyhow::Result<()> {
    info!("FleetGrid daemon starting");
    let scenario = Scenario::from_file(scenario_path)?;

    // ── Initialize subsystems ──────────────────────────────────

    let store = config.store.open()?;
    info!(
        in_memory = config.store.in_memory,
        data_dir = ?config.store.data_dir,
        "state store opened"
    );

    let service = Service::start(store, config).await?;
    info!("scheduler service started");

    // ── Drive the scenario ─────────────────────────────────────

    scenario.load(&service).await?;
    let stats = service.wait_idle(options.timeout).await?;
    info!(blocked = stats.blocked.total, "initial placement settled");

    for event in &scenario.events {
        let evals = event.apply(&service).await?;
        let stats = service.wait_idle(options.timeout).await?;
        info!(evals = evals.len(), blocked = stats.blocked.total, "event settled");
    }

    let report = Report::collect(&service, options.all).await?;
    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{report}");
    }

    // ── Serve until interrupted ────────────────────────────────

    if options.serve {
        info!("serving; press ctrl-c to stop");
        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
    }

    service.shutdown().await;
    info!("FleetGrid daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides(config: Option<PathBuf>) -> Overrides {
        Overrides {
            config,
            workers: None,
            data_dir: None,
            in_memory: false,
        }
    }

    #[test]
    fn defaults_without_config_file() {
        assert_eq!(overrides(None).load().unwrap(), FleetConfig::default());
    }

    #[test]
    fn flags_override_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(
            &path,
            "[scheduler]\nnum_workers = 8\nupdate_policy = \"task_change\"\n",
        )
        .unwrap();

        let mut flags = overrides(Some(path));
        flags.workers = Some(3);
        flags.data_dir = Some(dir.path().join("state"));
        flags.in_memory = true;
        let config = flags.load().unwrap();

        assert_eq!(config.scheduler.num_workers, 3);
        assert_eq!(config.scheduler.update_policy, "task_change");
        assert_eq!(config.store.data_dir, dir.path().join("state"));
        assert!(config.store.in_memory);
    }

    #[test]
    fn missing_config_file_names_the_path() {
        let err = overrides(Some(PathBuf::from("/nonexistent/fleet.toml"))).load().unwrap_err();
        assert!(err.to_string().contains("/nonexistent/fleet.toml"));
    }

    #[test]
    fn effective_config_round_trips_through_toml() {
        let rendered = toml::to_string_pretty(&FleetConfig::default()).unwrap();
        assert_eq!(FleetConfig::from_toml_str(&rendered).unwrap(), FleetConfig::default());
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "fleetd",
            "run",
            "--scenario",
            "s.toml",
            "--in-memory",
            "--workers",
            "4",
            "--json",
        ])
        .unwrap();
        let Command::Run {
            overrides,
            scenario,
            json,
            serve,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(scenario, PathBuf::from("s.toml"));
        assert_eq!(overrides.workers, Some(4));
        assert!(overrides.in_memory);
        assert!(json);
        assert!(!serve);
    }
}
