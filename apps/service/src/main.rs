use std::net::SocketAddr;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, info, warn};

mod cli;
mod config;
mod database;
mod error;
mod events;
mod http;
mod monitoring;
mod pool;

use cli::{CheckCommand, Cli, Command, DeviceCommand};
use config::Config;
use database::DatabaseImpl;
use error::AppError;
use events::EventHub;
use logger::{LogFormat, init_tracing};
use monitoring::{CheckerRegistry, MonitoringExecutor, MonitoringScheduler, Status};

/// Exit status of `probe` when the target is down
const PROBE_DOWN_EXIT: u8 = 2;

#[actix_web::main]
async fn main() -> Result<ExitCode, AppError> {
    let cli = Cli::parse();
    let config = Config::from_config(cli.config.as_deref())?;

    match config.log.format.parse::<LogFormat>() {
        Ok(format) => init_tracing(format),
        Err(error) => {
            init_tracing(LogFormat::default());
            warn!("Ignoring log.format: {error}");
        }
    }
    debug!("{config}");

    let db_path = cli.db.clone().unwrap_or_else(|| config.database.path.clone());

    match cli.command {
        Command::Probe(args) => {
            let executor = build_executor(&config)?;
            let outcome = cli::probe(&executor, args).await?;
            if outcome.status == Status::Down {
                return Ok(ExitCode::from(PROBE_DOWN_EXIT));
            }
        }
        Command::InitDb => {
            open(&config, &db_path).await?;
            println!("Database ready at {}", db_path.display());
        }
        Command::Device(command) => {
            let db = open(&config, &db_path).await?;
            match command {
                DeviceCommand::Add(args) => {
                    cli::add_device(&db, args).await?;
                }
                DeviceCommand::List => cli::list_devices(&db).await?,
                DeviceCommand::Enable { id } => cli::set_device_enabled(&db, id, true).await?,
                DeviceCommand::Disable { id } => cli::set_device_enabled(&db, id, false).await?,
            }
        }
        Command::Check(command) => {
            let db = open(&config, &db_path).await?;
            match command {
                CheckCommand::Add(args) => {
                    let registry = CheckerRegistry::with_builtin(config.checks.degraded_threshold())?;
                    cli::add_check(&db, args, &registry.kinds()).await?;
                }
                CheckCommand::List { device } => cli::list_checks(&db, device).await?,
                CheckCommand::Remove { id } => cli::remove_check(&db, id).await?,
            }
        }
        Command::Status { limit } => {
            let db = open(&config, &db_path).await?;
            cli::show_status(&db, limit).await?;
        }
        Command::Incidents { state, limit } => {
            let db = open(&config, &db_path).await?;
            cli::show_incidents(&db, state, limit).await?;
        }
        Command::Run => {
            let db = open(&config, &db_path).await?;
            run(&config, Arc::new(db)).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn open(config: &Config, path: &Path) -> Result<DatabaseImpl, AppError> {
    Ok(database::open_database(path, config.database.pool_size).await?)
}

fn build_executor(config: &Config) -> Result<MonitoringExecutor, AppError> {
    let registry = CheckerRegistry::with_builtin(config.checks.degraded_threshold())?;
    Ok(MonitoringExecutor::new(registry, config.scheduler.executor_grace()))
}

/// Serve until Ctrl-C, then stop loops before closing the event stream
async fn run(config: &Config, db: Arc<DatabaseImpl>) -> Result<(), AppError> {
    let executor = Arc::new(build_executor(config)?);
    let hub = EventHub::new(config.hub.subscriber_capacity);
    let scheduler = MonitoringScheduler::new(
        db.clone(),
        db.clone(),
        db,
        executor,
        hub.clone(),
        config.scheduler.settings(),
    );

    let server = if config.http.enabled {
        let addr = SocketAddr::new(config.http.bind.parse()?, config.http.port);
        let server = http::build_server(addr, hub.clone())?;
        let handle = server.handle();
        actix_web::rt::spawn(server);
        info!(%addr, "HTTP server listening");
        Some(handle)
    } else {
        None
    };

    scheduler.start().await?;
    let waited = wait_for_shutdown(&scheduler).await;

    scheduler.stop().await;
    hub.close();
    if let Some(handle) = server {
        handle.stop(true).await;
    }
    info!("Shut down cleanly");
    waited
}

#[cfg(unix)]
async fn wait_for_shutdown(scheduler: &MonitoringScheduler) -> Result<(), AppError> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Shutdown requested");
                return Ok(());
            }
            _ = hangup.recv() => match scheduler.reload().await {
                Ok(checks) => info!(checks, "Check set reloaded"),
                Err(e) => warn!(error = %e, "Reload failed, send SIGHUP again to retry"),
            },
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_scheduler: &MonitoringScheduler) -> Result<(), AppError> {
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    Ok(())
}
