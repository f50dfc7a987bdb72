//! Personal data scanner.
//!
//! Samples a data store through the pdscan engine and prints the report.
//!
//! # Security Guarantees
//! - Read-only source access only
//! - No credentials stored or logged
//! - Matched values printed only with `--show-data`

use anyhow::Context;
use clap::Parser;
use pdscan::{Cli, EXIT_FATAL, OutputFormat, render_text};
use pdscan_core::logging::{LogFormat, init_logging_with_format};
use pdscan_core::{
    DefaultAdapterFactory, FanoutSink, JsonlSink, LocalTaskQueue, Report, RuleSet, ScanEventSink,
    ScanOrchestrator, TracingSink, create_adapter, redact_database_url,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let format = if cli.global.log_json {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    if let Err(e) = init_logging_with_format(cli.global.verbose, cli.global.quiet, format) {
        eprintln!("Error: {}", e);
        std::process::exit(EXIT_FATAL);
    }

    let code = match run(&cli).await {
        Ok(report) => match print_report(&report, cli.format) {
            Ok(()) => report.exit_code(),
            Err(e) => {
                error!("{:#}", e);
                EXIT_FATAL
            }
        },
        Err(e) => {
            error!("Scan failed: {:#}", e);
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}

async fn run(cli: &Cli) -> anyhow::Result<Report> {
    info!("Target: {}", redact_database_url(&cli.url));

    let config = cli.adapter_config();
    let options = cli.scan_options();
    let rules = Arc::new(RuleSet::builtin()?);
    let adapter = create_adapter(config).context("Failed to create source adapter")?;
    info!("Created {} adapter", adapter.source_type());

    let mut sinks: Vec<Arc<dyn ScanEventSink>> = vec![Arc::new(TracingSink)];
    if cli.events {
        sinks.push(Arc::new(JsonlSink::new(std::io::stderr())));
    }

    let mut orchestrator = ScanOrchestrator::new(adapter, Arc::clone(&rules))
        .with_event_sink(Arc::new(FanoutSink::new(sinks)));
    if cli.distributed {
        let workers = usize::try_from(options.processes).unwrap_or(1);
        let queue = LocalTaskQueue::new(Arc::new(DefaultAdapterFactory), rules, workers);
        orchestrator =
            orchestrator.with_task_queue(Arc::new(queue), Duration::from_secs(cli.task_timeout));
    }

    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling scan");
            cancel.cancel();
        }
    });

    let report = orchestrator.scan(&options).await?;
    info!(
        "Scan finished: {} matches, {} units scanned, {} failed",
        report.matches.len(),
        report.units_scanned.len(),
        report.units_failed.len()
    );
    Ok(report)
}

fn print_report(report: &Report, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            let json =
                serde_json::to_string_pretty(report).context("Failed to serialize report")?;
            println!("{}", json);
        }
        OutputFormat::Text => print!("{}", render_text(report)),
    }
    Ok(())
}
