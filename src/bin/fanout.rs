use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use metrics_fanout::{
    actors::DispatchHandle,
    config::read_config_file,
    dispatcher::{DispatchOptions, Dispatcher},
    record::MetricRecord,
    registry::{DefaultFactory, Registry},
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,

    /// Newline-delimited JSON records ("-" or absent for stdin)
    #[arg(short)]
    input: Option<String>,

    /// Log everything down to trace level
    #[arg(short, long)]
    verbose: bool,
}

fn init(verbose: bool) {
    let level = if verbose {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };
    let filter = filter::Targets::new()
        .with_targets(vec![("metrics_fanout", level), ("fanout", level)]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init(args.verbose);
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)
        .with_context(|| format!("failed to load configuration from {}", args.file))?;

    let registry = match Registry::build(&config.backends, &DefaultFactory).await {
        Ok(registry) => registry,
        Err(e) => {
            error!("{e}");
            return Err(e.into());
        }
    };
    for backend in registry.info() {
        debug!("{} ({}) -> {}", backend.id, backend.kind, backend.endpoint);
    }

    let dispatcher = Dispatcher::new(
        Arc::new(registry),
        DispatchOptions::from(&config.dispatch),
    );
    let handle = DispatchHandle::spawn(dispatcher, &config.dispatch);

    let submitted = match args.input.as_deref() {
        None | Some("-") => submit_lines(BufReader::new(tokio::io::stdin()), &handle).await,
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open {path}"))?;
            submit_lines(BufReader::new(file), &handle).await
        }
    };

    if let Some(outcome) = handle.flush().await? {
        debug!(
            "final batch: {} succeeded, {} failed",
            outcome.succeeded(),
            outcome.failed()
        );
    }

    let stats = handle.stats().await;
    handle.shutdown().await?;

    let submitted = submitted?;
    if let Some(stats) = stats {
        info!(
            "{} records submitted, {} batches dispatched, {} failed on every backend",
            submitted, stats.batches_dispatched, stats.total_failures
        );
        for (backend, failures) in &stats.backend_failures {
            warn!("{backend}: {failures} failed batches");
        }
    }

    Ok(())
}

/// Submit every parseable line, one record per line
async fn submit_lines<R>(reader: R, handle: &DispatchHandle) -> anyhow::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut submitted = 0;
    let mut line_no = 0;

    while let Some(line) = lines.next_line().await.context("failed to read input")? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<MetricRecord>(line) {
            Ok(record) => {
                handle.submit(vec![record]).await?;
                submitted += 1;
            }
            Err(e) => warn!("line {line_no}: not a metric record: {e}"),
        }
    }

    Ok(submitted)
}
