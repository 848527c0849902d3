//! scenariodb - operator CLI for per-scenario planning databases.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use scenariodb::db::models::ScenarioStatus;
use scenariodb::db::repos::{access, scenarios as scenario_repo};
use scenariodb::engine::lifecycle::CopyOptions;
use scenariodb::engine::migrate::{all_succeeded, ScenarioOutcome};
use scenariodb::engine::schema::planning_steps;
use scenariodb::engine::Engine;
use scenariodb::{logging, AppConfig, AppError};

/// scenariodb - scenario registry, router and migration orchestrator
#[derive(Parser, Debug)]
#[command(name = "scenariodb")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "scenariodb.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply the planning schema to production and every in-use scenario
    Migrate {
        /// Migrate only this scenario
        #[arg(long)]
        database: Option<String>,
    },

    /// List registered scenarios
    #[command(alias = "ls")]
    List {
        /// Only scenarios in this status (free, in_use, busy)
        #[arg(long)]
        status: Option<ScenarioStatus>,
        /// Print the registry rows as JSON
        #[arg(long)]
        json: bool,
    },

    /// Register a new free scenario
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },

    /// Copy a scenario's schema and data into another scenario
    Copy {
        source: String,
        dest: String,
        #[arg(long)]
        description: Option<String>,
        /// Grant this user access to the destination
        #[arg(long)]
        user: Option<String>,
        /// Overwrite a destination that is in use
        #[arg(long)]
        force: bool,
    },

    /// Reset a scenario's data and return it to free
    Release { name: String },

    /// Make a scenario the production database
    Promote { name: String },

    /// Drop a free scenario and its database
    Delete { name: String },

    /// Set a scenario's description
    Describe { name: String, text: String },

    /// Grant a user access to a scenario
    Grant { user: String, name: String },

    /// Revoke a user's access to a scenario
    Revoke { user: String, name: String },

    /// Make a granted scenario the user's primary scenario
    Primary { user: String, name: String },

    /// Show the scenarios a user can access, primary first
    Access { user: String },

    /// Show the users granted a scenario
    Users { name: String },

    /// Resolve a scenario to its database and check it is reachable
    Resolve { name: String },

    /// Report scenarios stuck in busy
    Check,

    /// Operator recovery of a busy scenario
    Recover {
        name: String,
        /// Target status (free or in-use)
        #[arg(long)]
        status: ScenarioStatus,
    },
}

fn main() -> ExitCode {
    // Returns a no-op guard when SENTRY_DSN is absent
    let _sentry_guard = sentry::init(sentry_options());

    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.json_logs);

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Command failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn sentry_options() -> sentry::ClientOptions {
    let dsn = std::env::var("SENTRY_DSN")
        .ok()
        .or_else(|| option_env!("SENTRY_DSN").map(String::from));
    sentry::ClientOptions {
        dsn: dsn.and_then(|s| s.parse().ok()),
        release: Some(env!("CARGO_PKG_VERSION").into()),
        traces_sample_rate: 0.0,
        send_default_pii: false,
        ..Default::default()
    }
}

/// Run one command. `Ok(false)` means the command completed but reported a
/// failure the operator must act on.
fn run(cli: Cli) -> Result<bool> {
    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    let engine = Arc::new(Engine::open(config).context("opening control database")?);
    let control = engine.control();

    match cli.command {
        Commands::Migrate { database } => {
            let runtime = tokio::runtime::Runtime::new().context("starting runtime")?;
            return runtime.block_on(migrate(engine.clone(), database));
        }
        Commands::List { status, json } => {
            let rows = scenario_repo::list(control, status)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
                return Ok(true);
            }
            for s in rows {
                let marker = if s.is_production { "*" } else { " " };
                println!("{marker} {:<24} {:<8} {}", s.name, s.status, s.tag());
            }
        }
        Commands::Create { name, description } => {
            let s = engine.lifecycle.create(&name, description.as_deref())?;
            println!("created {} ({})", s.name, s.status);
        }
        Commands::Copy {
            source,
            dest,
            description,
            user,
            force,
        } => {
            let opts = CopyOptions {
                description,
                user,
                force,
            };
            let s = engine.lifecycle.copy(&source, &dest, &opts)?;
            println!("copied {source} -> {} ({})", s.name, s.status);
        }
        Commands::Release { name } => {
            let s = engine.lifecycle.release(&name)?;
            println!("released {} ({})", s.name, s.status);
        }
        Commands::Promote { name } => {
            engine.lifecycle.promote(&name)?;
            println!("promoted {name} to {}", engine.config().production_name);
        }
        Commands::Delete { name } => {
            engine.lifecycle.delete(&name)?;
            println!("deleted {name}");
        }
        Commands::Describe { name, text } => {
            let s = engine.lifecycle.update_description(&name, Some(&text))?;
            println!("{}: {}", s.name, s.tag());
        }
        Commands::Grant { user, name } => {
            let g = access::grant(control, &user, &name)?;
            println!("granted {} -> {} (position {})", g.username, g.scenario, g.position);
        }
        Commands::Revoke { user, name } => {
            if access::revoke(control, &user, &name)? {
                println!("revoked {user} -> {name}");
            } else {
                println!("{user} had no access to {name}");
            }
        }
        Commands::Primary { user, name } => {
            access::set_primary(control, &user, &name)?;
            println!("{name} is now the primary scenario of {user}");
        }
        Commands::Access { user } => {
            for s in access::list_for(control, &user)? {
                println!("{:<24} {:<8} {}", s.name, s.status, s.tag());
            }
        }
        Commands::Users { name } => {
            scenario_repo::get(control, &name)?;
            for user in access::users_of(control, &name)? {
                println!("{user}");
            }
        }
        Commands::Resolve { name } => {
            let handle = engine.pools.resolve(&name)?;
            let path = engine.config().storage_path(handle.storage());
            let healthy = engine.pools.healthcheck(&name);
            println!(
                "{} -> {} [{}]",
                handle.scenario(),
                path.display(),
                if healthy { "ok" } else { "unreachable" }
            );
            return Ok(healthy);
        }
        Commands::Check => {
            let orphans = engine.lifecycle.check_orphans()?;
            for s in &orphans {
                println!("{} busy since {}", s.name, s.last_modified);
            }
            if orphans.is_empty() {
                println!("no orphaned scenarios");
            }
            return Ok(orphans.is_empty());
        }
        Commands::Recover { name, status } => {
            let s = engine.lifecycle.recover(&name, status)?;
            println!("recovered {} ({})", s.name, s.status);
        }
    }
    Ok(true)
}

/// Run the migration on a blocking thread; Ctrl-C stops it after the
/// scenario in progress.
async fn migrate(engine: Arc<Engine>, database: Option<String>) -> Result<bool> {
    let cancel = CancellationToken::new();

    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, stopping after the current scenario");
                cancel.cancel();
            }
        })
    };

    let task = {
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ScenarioOutcome>, AppError> {
            let steps = planning_steps(engine.dialect.as_ref())?;
            match database {
                Some(name) => Ok(vec![engine.migrations.run_one(&name, &steps)]),
                None => engine
                    .migrations
                    .run_all(&steps, ScenarioStatus::InUse, &cancel),
            }
        })
    };

    let outcomes = task.await.context("migration task panicked")??;
    watcher.abort();

    for outcome in &outcomes {
        println!("{outcome}");
    }
    Ok(all_succeeded(&outcomes))
}
