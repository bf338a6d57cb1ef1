//! One collection pass: fetch, parse, dedup, write raw, validate, write
//! filtered.
//!
//! The pipeline owns no global state. Everything it needs comes in through
//! [`PipelineConfig`] and the injected fetcher/prober, and everything it
//! learned goes out through [`RunReport`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::sieve::{
    dedup, fetch_all, parse_blob, resolve_sources, OutputConfig, Prober, ResultWriter,
    SourceFetcher, ValidatorConfig, ValidatorPool,
};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub sources: Vec<String>,
    pub aggregate_source: Option<String>,
    /// Wall-clock budget for the whole run, measured from `run()`.
    pub time_budget: Duration,
    pub fetch_concurrency: usize,
    pub validator: ValidatorConfig,
    pub output: OutputConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            aggregate_source: None,
            time_budget: Duration::from_secs(10 * 60),
            fetch_concurrency: 16,
            validator: ValidatorConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Fetching,
    Parsing,
    Deduplicating,
    Validating,
    Writing,
    Done,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Parsing => "parsing",
            Self::Deduplicating => "deduplicating",
            Self::Validating => "validating",
            Self::Writing => "writing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub sources_total: usize,
    pub sources_failed: usize,
    pub parsed: usize,
    pub skipped: usize,
    pub duplicates: usize,
    pub unique: usize,
    pub reachable: usize,
    pub unreachable: usize,
    pub probe_errors: usize,
    pub deadline_hit: bool,
    #[serde(serialize_with = "as_secs_f64")]
    pub elapsed: Duration,
    pub finished_at: DateTime<Utc>,
}

fn as_secs_f64<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64((d.as_secs_f64() * 1000.0).round() / 1000.0)
}

#[derive(Debug)]
pub struct RunReport {
    pub state: PipelineState,
    pub summary: Summary,
    pub failures: Vec<PipelineError>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.state == PipelineState::Done
    }
}

pub struct Pipeline {
    config: PipelineConfig,
}

/// Stand-in deadline for budgets too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline_after(start: Instant, budget: Duration) -> Instant {
    start
        .checked_add(budget)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

/// Mutable bookkeeping of a run in progress.
struct Run {
    state: PipelineState,
    started: Instant,
    summary: Summary,
    failures: Vec<PipelineError>,
}

impl Run {
    fn new() -> Self {
        Self {
            state: PipelineState::Idle,
            started: Instant::now(),
            summary: Summary::default(),
            failures: Vec::new(),
        }
    }

    fn enter(&mut self, next: PipelineState) {
        tracing::info!("pipeline: {} -> {}", self.state, next);
        self.state = next;
    }

    fn fail(mut self, error: PipelineError) -> RunReport {
        tracing::error!("pipeline failed while {}: {error}", self.state);
        self.failures.push(error);
        self.enter(PipelineState::Failed);
        self.finish()
    }

    fn finish(mut self) -> RunReport {
        self.summary.elapsed = self.started.elapsed();
        self.summary.finished_at = Utc::now();
        match serde_json::to_string(&self.summary) {
            Ok(line) => tracing::info!("run summary: {line}"),
            Err(e) => tracing::warn!("failed to serialize run summary: {e}"),
        }
        RunReport {
            state: self.state,
            summary: self.summary,
            failures: self.failures,
        }
    }
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one pass. Never panics on node-level problems; the returned
    /// report is `Done` unless sources or output files failed.
    pub async fn run(
        &self,
        fetcher: &dyn SourceFetcher,
        prober: Arc<dyn Prober>,
        cancel: CancellationToken,
    ) -> RunReport {
        let mut run = Run::new();
        let deadline = deadline_after(run.started, self.config.time_budget);

        // Fetching
        run.enter(PipelineState::Fetching);
        let sources = resolve_sources(
            fetcher,
            &self.config.sources,
            self.config.aggregate_source.as_deref(),
            deadline,
            &cancel,
        )
        .await;
        if sources.is_empty() {
            return run.fail(PipelineError::NoSources);
        }
        run.summary.sources_total = sources.len();

        let fetched = fetch_all(
            fetcher,
            &sources,
            self.config.fetch_concurrency,
            deadline,
            &cancel,
        )
        .await;

        let mut bodies = Vec::with_capacity(fetched.len());
        for (source, result) in fetched {
            match result {
                Ok(body) => bodies.push((source, body)),
                Err(_) => run.summary.sources_failed += 1,
            }
        }
        if bodies.is_empty() {
            return run.fail(PipelineError::AllSourcesFailed {
                attempted: sources.len(),
            });
        }

        // Parsing
        run.enter(PipelineState::Parsing);
        let mut nodes = Vec::new();
        for (source, body) in &bodies {
            let mut descriptors = parse_blob(body);
            let before = nodes.len();
            nodes.extend(descriptors.by_ref());
            tracing::debug!(
                "{source}: {} nodes, {} lines skipped",
                nodes.len() - before,
                descriptors.skipped()
            );
            run.summary.skipped += descriptors.skipped();
        }
        run.summary.parsed = nodes.len();

        // Deduplicating, then persist the raw set before any probing.
        run.enter(PipelineState::Deduplicating);
        let deduped = dedup(nodes);
        run.summary.duplicates = deduped.duplicates;
        run.summary.unique = deduped.nodes.len();

        let writer = ResultWriter::new(self.config.output.clone());
        if let Err(e) = writer.write_raw(&deduped.nodes).await {
            run.failures.push(e);
        }

        // Validating
        run.enter(PipelineState::Validating);
        let pool = ValidatorPool::new(prober, self.config.validator.clone());
        let validated = pool.validate(deduped.nodes, deadline, &cancel).await;
        run.summary.reachable = validated.stats.reachable;
        run.summary.unreachable = validated.stats.unreachable();
        run.summary.probe_errors = validated.stats.probe_errors;
        run.summary.deadline_hit = validated.deadline_hit;

        // Writing
        run.enter(PipelineState::Writing);
        if let Err(e) = writer.write_filtered(&validated.nodes).await {
            run.failures.push(e);
        }

        if run.failures.is_empty() {
            run.enter(PipelineState::Done);
        } else {
            for failure in &run.failures {
                tracing::error!("{failure}");
            }
            run.enter(PipelineState::Failed);
        }
        run.finish()
    }
}
