use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};

use jobworker::adapter::{StdoutAdapter, load_jobs};
use jobworker::aggregation::{Aggregator, EXTERNAL_API, ExternalApiSource};
use jobworker::cli::{Cli, Command};
use jobworker::config::WorkerConfig;
use jobworker::handlers::{
    ExternalFetchHandler, FETCH_TASK_TYPE, FRANCHISE_TASK_TYPE, FranchiseDataHandler,
};
use jobworker::http::ReqwestTransport;
use jobworker::logging;
use jobworker::stores::MemoryCache;
use jobworker::worker::Worker;

const RECORDS_ENDPOINT: &str = "records";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = WorkerConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Command::CheckConfig => {
            println!("{}", toml::to_string_pretty(&config.redacted())?);
        }
        Command::Run { jobs } => run(&config, &jobs).await?,
    }
    Ok(())
}

async fn run(config: &WorkerConfig, jobs: &Path) -> Result<()> {
    let envelopes = load_jobs(jobs).with_context(|| format!("reading {}", jobs.display()))?;
    let worker = build_worker(config)?;
    info!(jobs = envelopes.len(), handlers = ?worker.task_types(), "starting batch");

    let reports = worker.run_batch(envelopes).await;
    let undelivered = reports.iter().filter(|r| !r.delivered).count();
    let completed = reports.iter().filter(|r| r.outcome == "COMPLETED").count();
    info!(total = reports.len(), completed, undelivered, "batch finished");

    if undelivered > 0 {
        bail!("{undelivered} outcome(s) could not be reported");
    }
    Ok(())
}

fn build_worker(config: &WorkerConfig) -> Result<Worker> {
    let mut worker =
        Worker::new(Arc::new(StdoutAdapter)).with_max_jobs_active(config.worker.max_jobs_active);

    let franchise = config.handler(FRANCHISE_TASK_TYPE);
    let mut aggregator = Aggregator::new(
        Arc::new(MemoryCache::new()),
        config.worker.cache_namespace.clone(),
        franchise.cache_ttl(),
    );
    match franchise.endpoint(EXTERNAL_API) {
        Some(endpoint) => {
            let transport = Arc::new(ReqwestTransport::new(franchise.api_key())?);
            aggregator = aggregator.with_source(Arc::new(ExternalApiSource::new(
                transport,
                endpoint,
                franchise.retry_policy(),
            )));
        }
        None => warn!(
            task_type = FRANCHISE_TASK_TYPE,
            "no external_api endpoint configured; aggregation will skip it"
        ),
    }
    worker.register(FranchiseDataHandler::new(
        Arc::new(aggregator),
        franchise.settings(),
    ))?;

    let fetch = config.handler(FETCH_TASK_TYPE);
    match fetch.endpoint(RECORDS_ENDPOINT) {
        Some(endpoint) => {
            let transport = Arc::new(ReqwestTransport::new(fetch.api_key())?);
            worker.register(ExternalFetchHandler::new(
                transport,
                endpoint,
                fetch.retry_policy(),
                fetch.settings(),
            )?)?;
        }
        None => warn!(
            task_type = FETCH_TASK_TYPE,
            "no records endpoint configured; handler not registered"
        ),
    }

    Ok(worker)
}
