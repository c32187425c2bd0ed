//! Bulk loader for time-series stores.
//!
//! Reads a pre-generated point corpus from stdin and drives it into one or more targets as fast as they will accept
//! it, reporting throughput and the time spent backing off.

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser as _;
use reqwest::Client;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tsdb_ingest::{
    driver::{HttpTargetProbe, TransportWriters, DEFAULT_PROBE_LIMIT},
    registry::FieldOrderRegistry,
    Driver, LoadSettings,
};

mod config;
use self::config::Cli;

mod report;
use self::report::{local_hostname, InfluxReporter, ReportParams, ReportSink as _};

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(cli.log_level().into())
                .from_env_lossy(),
        )
        .with_ansi(true)
        .with_target(true)
        .init();

    match run(cli) {
        Ok(()) => info!("bulk-load stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    info!("bulk-load starting...");

    let settings = cli.load_settings()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cli.cores)
        .enable_all()
        .build()
        .context("Failed to build async runtime.")?;

    runtime.block_on(load(cli, settings))
}

async fn load(cli: Cli, settings: LoadSettings) -> anyhow::Result<()> {
    info!(
        endpoints = ?settings.endpoints.iter().map(ToString::to_string).collect::<Vec<_>>(),
        transport = %settings.transport,
        workers = settings.workers,
        batch_size = settings.batch_size,
        do_load = settings.do_load,
        "Starting load."
    );

    let report_params = match &cli.report_host {
        Some(host) => {
            let params = ReportParams {
                hostname: local_hostname()?,
                destination: settings.endpoints[0].to_string(),
                workers: settings.workers,
                batch_size: settings.batch_size,
                gzip: true,
                tags: cli.report_tags()?,
            };
            info!(destination = %host, database = %cli.report_database, hostname = %params.hostname, "Results will be reported.");
            Some(params)
        }
        None => None,
    };

    let client = Client::builder().build().context("Failed to build HTTP client.")?;
    let registry = Arc::new(FieldOrderRegistry::new());

    let probe = HttpTargetProbe::new(client.clone(), settings.endpoints[0].clone(), DEFAULT_PROBE_LIMIT);
    let writers = TransportWriters::new(&settings, client.clone(), registry);
    let driver = Driver::new(settings, probe, writers)?;

    let summary = driver.run(tokio::io::stdin()).await?;
    println!("{}", summary);

    if let (Some(host), Some(params)) = (&cli.report_host, report_params) {
        let reporter = InfluxReporter::new(
            client,
            host,
            cli.report_database.clone(),
            cli.report_user.clone(),
            cli.report_password.clone(),
        );
        reporter
            .report(&params, &summary)
            .await
            .context("Failed to report load result.")?;
    }

    Ok(())
}
