use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use proxy_sieve::sieve::{HandshakeProber, HttpFetcher};
use proxy_sieve::{Config, Pipeline};

#[derive(Parser, Debug)]
#[command(name = "proxy-sieve", version)]
#[command(about = "Collect proxy subscriptions, drop duplicates, keep the reachable nodes")]
struct Args {
    /// Config file (default: ~/.proxy-sieve/config.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Extra source location. Repeatable; added to the configured sources.
    #[arg(short, long = "source")]
    sources: Vec<String>,

    /// Location whose body lists further sources.
    #[arg(long)]
    aggregate_source: Option<String>,

    /// Maximum probes in flight.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Global time budget in minutes.
    #[arg(long)]
    time_budget: Option<u64>,

    /// Per-node probe timeout in seconds.
    #[arg(long)]
    probe_timeout: Option<u64>,

    #[arg(short, long)]
    output_dir: Option<String>,

    /// Also write base64 companions of both lists.
    #[arg(long)]
    base64: bool,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(self, config: &mut Config) {
        config.sources.extend(self.sources);
        if let Some(aggregate) = self.aggregate_source {
            config.aggregate_source = Some(aggregate);
        }
        if let Some(c) = self.concurrency {
            config.concurrency = c;
        }
        if let Some(m) = self.time_budget {
            config.time_budget_minutes = m;
        }
        if let Some(t) = self.probe_timeout {
            config.probe_timeout_secs = t;
        }
        if let Some(dir) = self.output_dir {
            config.output_dir = dir;
        }
        if self.base64 {
            config.write_base64 = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    args.apply(&mut config);
    config.validate()?;

    let fetcher = HttpFetcher::new(config.fetch_timeout())?;
    let prober = Arc::new(HandshakeProber::new()?);
    let pipeline = Pipeline::new(config.pipeline_config());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, finishing with what has been validated");
            on_signal.cancel();
        }
    });

    let report = pipeline.run(&fetcher, prober, cancel).await;

    let summary =
        serde_json::to_string_pretty(&report.summary).context("failed to render summary")?;
    println!("{summary}");

    Ok(if report.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
