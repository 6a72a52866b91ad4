use std::sync::Arc;

use anyhow::Context;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use pickline_infra::config::WorkerConfig;
use pickline_infra::db;
use pickline_infra::imports::CsvImportParser;
use pickline_infra::inventory_store::PostgresInventoryStore;
use pickline_infra::jobs::{JobScheduler, PostgresJobStore, RunOutcome, SchedulerError};
use pickline_infra::wiring::{HandlerDeps, standard_registry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pickline_observability::init();

    let config = WorkerConfig::from_env().context("loading worker configuration")?;
    let pool = db::connect(&config.database_url, config.max_connections)
        .await
        .context("connecting to postgres")?;

    let registry = standard_registry(HandlerDeps {
        export_dir: config.export_dir.clone(),
        throttle: config.throttle(),
        parser: CsvImportParser::new(),
        attendance: None,
    });
    let scheduler = JobScheduler::new(
        Arc::new(PostgresJobStore::new(pool.clone())),
        PostgresInventoryStore::new(pool),
        registry,
        config.scheduler().with_name("pickline-worker"),
    );
    for job_type in scheduler.registry().missing() {
        warn!(job_type = %job_type, "no handler registered; jobs of this type will fail");
    }

    info!(
        poll_interval_secs = config.poll_interval.as_secs(),
        job_timeout_secs = config.job_timeout.as_secs(),
        export_dir = %config.export_dir.display(),
        "worker started"
    );

    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => match scheduler.run_once().await {
                Ok(RunOutcome::Idle) | Ok(RunOutcome::Busy) => {}
                Ok(outcome) => debug!(?outcome, "tick finished"),
                // The database may come back; keep polling.
                Err(err @ SchedulerError::FatalSetup { .. }) => error!(error = %err, "job could not start"),
                Err(err) => error!(error = %err, "job table unavailable"),
            },
            signal = &mut shutdown => {
                if let Err(err) = signal {
                    error!(error = %err, "failed to listen for ctrl-c");
                }
                info!("worker shutting down");
                break;
            }
        }
    }
    Ok(())
}
