/*
 * BMS Equipment Control Orchestrator
 * Licensed under the GNU General Public License, version 3 or later.
 */

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use env_logger::Logger;
use log::{error, info, warn, LevelFilter, Log, Metadata, Record, SetLoggerError};
use nix::sys::signal::{self, SigHandler, Signal};
use systemd_journal_logger::{connected_to_journal, JournalLog};
use tokio::time::{interval, sleep, Duration};

mod algorithms;
mod api;
mod config;
mod control;
mod equipment;
mod error;
mod gateway;
mod leadlag;
mod metrics;
mod orchestrator;
mod pid;
mod state_store;
mod ui_commands;

use config::Config;
use gateway::documents::DocumentStore;
use gateway::timeseries::TimeSeriesGateway;
use leadlag::GroupManager;
use orchestrator::ControlContext;
use state_store::{InMemorySharedCache, StateStore};
use ui_commands::UiCommandQueue;

const VERSION: Option<&str> = option_env!("CARGO_PKG_VERSION");
const LOG_ENV: &str = "BMS_ORCHESTRATOR_LOG";
const API_PORT: u16 = 9187;

/// Control plane for HVAC equipment across multiple BMS-connected sites.
#[derive(Parser, Debug)]
#[clap(author, about, long_about = None)]
struct Args {
    /// Enable debug output.
    #[clap(long)]
    debug: bool,

    /// Print version info and exit.
    #[clap(long, short)]
    version: bool,

    /// Validate the configuration file and exit.
    #[clap(long)]
    config: bool,

    /// Run a single orchestrator tick immediately and exit.
    #[clap(long)]
    once: bool,
}

static TERM_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_term_signal(_: i32) {
    TERM_REQUESTED.store(true, Ordering::Relaxed);
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args)?;
    info!("Initializing...");
    setup_term_signals()?;

    let config = Config::load_config_file().await?;
    config.validate()?;
    if args.config {
        info!("configuration is valid");
        return Ok(());
    }
    config.save_config_file().await?;

    let documents = Arc::new(DocumentStore::new(config.document_store_config()));
    let timeseries = Arc::new(TimeSeriesGateway::new(config.gateway_config()));
    let shared_cache = Arc::new(InMemorySharedCache::new());
    let state = Arc::new(StateStore::new(shared_cache));
    let groups = Arc::new(GroupManager::new(
        Arc::clone(&documents),
        Arc::clone(&timeseries),
        Arc::clone(&state),
    ));
    let settings = config.orchestrator_settings();
    let tick_interval = settings.tick_interval;
    let ctx = ControlContext {
        documents,
        timeseries: Arc::clone(&timeseries),
        state: Arc::clone(&state),
        groups,
        settings,
    };

    if args.once {
        let report = orchestrator::tick(&ctx).await;
        info!(
            "single tick complete: {} immediate, {} queued, success={}",
            report.immediate_count, report.queued_count, report.success
        );
        return Ok(());
    }

    let ui_queue = Arc::new(UiCommandQueue::start(Arc::clone(&timeseries), Arc::clone(&state)));
    let app_state = api::AppState::new(ctx.clone(), ui_queue);
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), API_PORT);
    let server_state = app_state.clone();
    tokio::spawn(async move {
        if let Err(err) = api::start_server(server_state, addr).await {
            error!("Command API server stopped: {err}");
        }
    });

    info!("BMS orchestrator initialized, tick interval {tick_interval:?}");
    run_tick_loop(ctx, app_state).await;
    Ok(())
}

/// Drives `orchestrator::tick` on `tick_interval` until a termination signal
/// arrives, mirroring the teacher's scheduler-plus-term-flag main loop
/// (§A.1, §7 "aggregate per-tick report").
async fn run_tick_loop(ctx: ControlContext, app_state: api::AppState) {
    let mut ticker = interval(ctx.settings.tick_interval);
    while !TERM_REQUESTED.load(Ordering::Relaxed) {
        ticker.tick().await;
        let report = orchestrator::tick(&ctx).await;
        if report.success {
            info!(
                "tick complete: {} immediate, {} queued, {}ms elapsed",
                report.immediate_count, report.queued_count, report.elapsed_ms
            );
        } else {
            warn!("tick failed to build a working set this cycle");
        }
        for status in &report.per_equipment {
            if status.status != "ok" {
                warn!(
                    "equipment {} finished with status {} ({:?})",
                    status.id, status.status, status.error
                );
            }
        }
        app_state.record_tick(report).await;
    }
    sleep(Duration::from_millis(200)).await;
    info!("shutdown signal received, exiting");
}

fn setup_logging(args: &Args) -> Result<()> {
    let version = VERSION.unwrap_or("unknown");
    let log_level = if args.debug {
        LevelFilter::Debug
    } else if let Ok(level) = std::env::var(LOG_ENV) {
        LevelFilter::from_str(&level).unwrap_or(LevelFilter::Info)
    } else {
        LevelFilter::Info
    };
    OrchestratorLogger::new(log_level)?.init()?;
    info!("bms-orchestratord v{version}, log level {log_level}");
    if args.version {
        std::process::exit(0);
    }
    Ok(())
}

fn setup_term_signals() -> Result<()> {
    unsafe {
        signal::signal(Signal::SIGTERM, SigHandler::Handler(handle_term_signal))
            .map_err(|e| anyhow!("failed to register SIGTERM handler: {e}"))?;
        signal::signal(Signal::SIGINT, SigHandler::Handler(handle_term_signal))
            .map_err(|e| anyhow!("failed to register SIGINT handler: {e}"))?;
    }
    Ok(())
}

/// Dual-target logger matching the teacher's `CCLogger`: human-readable lines
/// under a terminal, structured journal fields under systemd, with
/// third-party crate chatter (`hyper`, `tower`, `h2`) silenced one level
/// above the configured verbosity (§A.2).
struct OrchestratorLogger {
    filter: Logger,
    sink: Box<dyn Log>,
}

impl OrchestratorLogger {
    fn new(max_level: LevelFilter) -> Result<Self, SetLoggerError> {
        let lib_level = if max_level >= LevelFilter::Debug {
            LevelFilter::Info
        } else {
            LevelFilter::Warn
        };
        let filter = env_logger::Builder::from_env(LOG_ENV)
            .filter_level(max_level)
            .filter_module("hyper", lib_level)
            .filter_module("tower", lib_level)
            .filter_module("h2", lib_level)
            .build();
        let sink: Box<dyn Log> = if connected_to_journal() {
            Box::new(JournalLog::new()?.with_extra_fields(vec![("VERSION", VERSION.unwrap_or("unknown"))]))
        } else {
            Box::new(
                env_logger::Builder::new()
                    .filter_level(max_level)
                    .format_timestamp(Some(env_logger::fmt::TimestampPrecision::Seconds))
                    .build(),
            )
        };
        Ok(OrchestratorLogger { filter, sink })
    }

    fn init(self) -> Result<(), SetLoggerError> {
        log::set_max_level(self.filter.filter());
        log::set_boxed_logger(Box::new(self))
    }
}

impl Log for OrchestratorLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.filter.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if self.filter.matches(record) {
            self.sink.log(record);
        }
    }

    fn flush(&self) {}
}
