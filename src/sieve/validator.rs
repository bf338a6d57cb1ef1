//! Bounded-concurrency validator pool.
//!
//! Every node gets its own task; a semaphore caps how many probes are in
//! flight. Each task writes exactly one verdict into a shared map keyed by
//! fingerprint. A child cancellation token, cancelled at the global
//! deadline or by the caller, stops queued and in-flight probes. Tasks that
//! do not wind down within the grace period are aborted. Nodes without a
//! verdict are finalized `Unreachable`.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::node::{Node, NodeStatus};
use super::probe::{ProbeOutcome, Prober};

/// Default per-node probe timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Time cancelled tasks get to finish before they are aborted.
pub const DEFAULT_GRACE: Duration = Duration::from_millis(500);

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Maximum probes in flight, clamped to `1..=Semaphore::MAX_PERMITS`.
    pub concurrency: usize,
    pub probe_timeout: Duration,
    /// Reachable nodes slower than this are dropped as unreachable.
    pub max_latency: Option<Duration>,
    pub grace: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            concurrency: 100,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            max_latency: Some(Duration::from_millis(1000)),
            grace: DEFAULT_GRACE,
        }
    }
}

/// Per-cause counters. Timeouts and rejections share the `Unreachable`
/// status but are counted apart.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ValidationStats {
    pub reachable: usize,
    pub rejected: usize,
    pub timed_out: usize,
    pub too_slow: usize,
    pub cancelled: usize,
    pub probe_errors: usize,
}

impl ValidationStats {
    pub fn unreachable(&self) -> usize {
        self.rejected + self.timed_out + self.too_slow + self.cancelled
    }

    fn record(&mut self, verdict: &Verdict) {
        match verdict {
            Verdict::Reachable(_) => self.reachable += 1,
            Verdict::Rejected(_) => self.rejected += 1,
            Verdict::TimedOut => self.timed_out += 1,
            Verdict::TooSlow(_) => self.too_slow += 1,
            Verdict::Cancelled => self.cancelled += 1,
            Verdict::Failed(_) => self.probe_errors += 1,
        }
    }
}

/// Validated nodes (input order, every node finalized) and counters.
#[derive(Debug)]
pub struct Validated {
    pub nodes: Vec<Node>,
    pub stats: ValidationStats,
    /// True when the global deadline cut validation short.
    pub deadline_hit: bool,
}

#[derive(Debug, Clone)]
enum Verdict {
    Reachable(Duration),
    Rejected(String),
    TimedOut,
    TooSlow(Duration),
    Cancelled,
    Failed(String),
}

impl Verdict {
    fn status(&self) -> (NodeStatus, Option<Duration>) {
        match self {
            Self::Reachable(latency) => (NodeStatus::Reachable, Some(*latency)),
            Self::Failed(_) => (NodeStatus::ProbeError, None),
            _ => (NodeStatus::Unreachable, None),
        }
    }
}

/// Fixed-size prober pool.
pub struct ValidatorPool {
    prober: Arc<dyn Prober>,
    config: ValidatorConfig,
}

impl ValidatorPool {
    pub fn new(prober: Arc<dyn Prober>, config: ValidatorConfig) -> Self {
        Self { prober, config }
    }

    /// Probe every node and finalize its status.
    ///
    /// Always returns with every node in a terminal status: by the time
    /// `deadline` passes (plus the grace period) or `cancel` fires, any
    /// node without a verdict is marked `Unreachable`.
    pub async fn validate(
        &self,
        mut nodes: Vec<Node>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Validated {
        let total = nodes.len();
        let concurrency = self.config.concurrency.clamp(1, Semaphore::MAX_PERMITS);
        tracing::info!(
            "validating {total} nodes (concurrency {concurrency}, probe timeout {:?})",
            self.config.probe_timeout
        );

        let token = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let results: Arc<Mutex<HashMap<String, Verdict>>> =
            Arc::new(Mutex::new(HashMap::with_capacity(total)));

        let mut tasks = JoinSet::new();
        for node in &nodes {
            let node = node.clone();
            let prober = Arc::clone(&self.prober);
            let semaphore = Arc::clone(&semaphore);
            let results = Arc::clone(&results);
            let token = token.clone();
            let config = self.config.clone();
            tasks.spawn(async move {
                let verdict = tokio::select! {
                    biased;
                    _ = token.cancelled() => Verdict::Cancelled,
                    v = probe_one(prober.as_ref(), &node, &semaphore, &config) => v,
                };
                results.lock().insert(node.fingerprint().to_string(), verdict);
            });
        }

        let deadline_sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(deadline_sleep);
        let mut deadline_hit = false;

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Err(e)) if e.is_panic() => {
                        tracing::error!("validator task panicked outside its probe: {e}");
                    }
                    Some(_) => {}
                },
                _ = &mut deadline_sleep => {
                    deadline_hit = true;
                    tracing::warn!(
                        "validation deadline reached with {} probes unfinished; cancelling",
                        tasks.len()
                    );
                    token.cancel();
                    break;
                }
                _ = token.cancelled() => {
                    tracing::warn!("validation cancelled with {} probes unfinished", tasks.len());
                    break;
                }
            }
        }

        if !tasks.is_empty() {
            let drain = async { while tasks.join_next().await.is_some() {} };
            if tokio::time::timeout(self.config.grace, drain).await.is_err() {
                tracing::warn!("aborting {} probes after grace period", tasks.len());
                tasks.shutdown().await;
            }
        }

        let results = std::mem::take(&mut *results.lock());
        let mut stats = ValidationStats::default();
        for node in &mut nodes {
            let verdict = results
                .get(node.fingerprint())
                .cloned()
                .unwrap_or(Verdict::Cancelled);
            log_verdict(node, &verdict);
            stats.record(&verdict);
            let (status, latency) = verdict.status();
            node.finalize(status, latency);
        }

        tracing::info!(
            "validation finished: {} reachable, {} unreachable ({} timed out, {} rejected, {} too slow, {} cancelled), {} probe errors",
            stats.reachable,
            stats.unreachable(),
            stats.timed_out,
            stats.rejected,
            stats.too_slow,
            stats.cancelled,
            stats.probe_errors
        );

        Validated {
            nodes,
            stats,
            deadline_hit,
        }
    }
}

/// Wait for a permit, run one probe under the per-node timeout, and turn
/// whatever happens (including a panic) into a verdict.
async fn probe_one(
    prober: &dyn Prober,
    node: &Node,
    semaphore: &Semaphore,
    config: &ValidatorConfig,
) -> Verdict {
    let Ok(_permit) = semaphore.acquire().await else {
        return Verdict::Cancelled;
    };

    let probe = tokio::time::timeout(
        config.probe_timeout,
        prober.probe(node, config.probe_timeout),
    );
    match AssertUnwindSafe(probe).catch_unwind().await {
        Err(_) => Verdict::Failed("probe panicked".into()),
        Ok(Err(_elapsed)) => Verdict::TimedOut,
        Ok(Ok(Err(e))) => Verdict::Failed(format!("{e:#}")),
        Ok(Ok(Ok(ProbeOutcome::Unreachable { reason }))) => Verdict::Rejected(reason),
        Ok(Ok(Ok(ProbeOutcome::TimedOut))) => Verdict::TimedOut,
        Ok(Ok(Ok(ProbeOutcome::Reachable { latency }))) => match config.max_latency {
            Some(max) if latency > max => Verdict::TooSlow(latency),
            _ => Verdict::Reachable(latency),
        },
    }
}

fn log_verdict(node: &Node, verdict: &Verdict) {
    let endpoint = node.endpoint();
    let protocol = node.protocol();
    match verdict {
        Verdict::Reachable(latency) => {
            tracing::debug!("{protocol} {endpoint} reachable in {} ms", latency.as_millis());
        }
        Verdict::Rejected(reason) => {
            tracing::debug!("{protocol} {endpoint} unreachable: {reason}");
        }
        Verdict::TimedOut => tracing::debug!("{protocol} {endpoint} timed out"),
        Verdict::TooSlow(latency) => {
            tracing::debug!("{protocol} {endpoint} too slow ({} ms)", latency.as_millis());
        }
        Verdict::Cancelled => tracing::debug!("{protocol} {endpoint} cancelled before a verdict"),
        Verdict::Failed(err) => tracing::warn!("{protocol} {endpoint} probe error: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sieve::node::{Protocol, Transport};
    use crate::sieve::probe::HandshakeProber;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn nodes(hosts: &[&str]) -> Vec<Node> {
        hosts
            .iter()
            .map(|h| {
                Node::new(
                    Protocol::Vless,
                    *h,
                    443,
                    "id",
                    Transport::tcp(),
                    *h,
                    format!("vless://id@{h}:443"),
                )
            })
            .collect()
    }

    fn config(concurrency: usize) -> ValidatorConfig {
        ValidatorConfig {
            concurrency,
            probe_timeout: Duration::from_secs(2),
            max_latency: None,
            grace: Duration::from_millis(100),
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    /// Behaviour keyed by host name: `ok-<ms>`, `down`, `err`, `panic`,
    /// `hang`.
    struct ScriptedProber;

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, node: &Node, _timeout: Duration) -> anyhow::Result<ProbeOutcome> {
            let host = node.host();
            if let Some(ms) = host.strip_prefix("ok-") {
                let ms: u64 = ms.parse().unwrap();
                return Ok(ProbeOutcome::Reachable {
                    latency: Duration::from_millis(ms),
                });
            }
            match host {
                "down" => Ok(ProbeOutcome::unreachable("connection refused")),
                "err" => anyhow::bail!("prober exploded"),
                "panic" => panic!("prober panicked"),
                "hang" => std::future::pending().await,
                other => panic!("unexpected host {other}"),
            }
        }
    }

    #[tokio::test]
    async fn statuses_follow_probe_outcomes() {
        let pool = ValidatorPool::new(Arc::new(ScriptedProber), config(4));
        let out = pool
            .validate(
                nodes(&["ok-10", "down", "err", "ok-20"]),
                far_deadline(),
                &CancellationToken::new(),
            )
            .await;

        let statuses: Vec<NodeStatus> = out.nodes.iter().map(Node::status).collect();
        assert_eq!(
            statuses,
            vec![
                NodeStatus::Reachable,
                NodeStatus::Unreachable,
                NodeStatus::ProbeError,
                NodeStatus::Reachable
            ]
        );
        assert_eq!(out.nodes[0].latency(), Some(Duration::from_millis(10)));
        assert_eq!(out.nodes[1].latency(), None);
        assert_eq!(out.stats.reachable, 2);
        assert_eq!(out.stats.rejected, 1);
        assert_eq!(out.stats.probe_errors, 1);
        assert!(!out.deadline_hit);
    }

    #[tokio::test]
    async fn panicking_probe_is_isolated() {
        let pool = ValidatorPool::new(Arc::new(ScriptedProber), config(2));
        let out = pool
            .validate(
                nodes(&["ok-1", "ok-2", "panic", "ok-3", "ok-4"]),
                far_deadline(),
                &CancellationToken::new(),
            )
            .await;

        for node in &out.nodes {
            if node.host() == "panic" {
                assert_eq!(node.status(), NodeStatus::ProbeError);
            } else {
                assert_eq!(node.status(), NodeStatus::Reachable, "{}", node.host());
            }
        }
        assert_eq!(out.stats.probe_errors, 1);
    }

    #[tokio::test]
    async fn per_node_timeout_is_unreachable() {
        let mut cfg = config(2);
        cfg.probe_timeout = Duration::from_millis(50);
        let pool = ValidatorPool::new(Arc::new(ScriptedProber), cfg);
        let out = pool
            .validate(nodes(&["hang", "ok-5"]), far_deadline(), &CancellationToken::new())
            .await;

        assert_eq!(out.nodes[0].status(), NodeStatus::Unreachable);
        assert_eq!(out.nodes[1].status(), NodeStatus::Reachable);
        assert_eq!(out.stats.timed_out, 1);
        assert!(!out.deadline_hit);
    }

    #[tokio::test]
    async fn global_deadline_finalizes_hanging_probes() {
        let mut cfg = config(1);
        cfg.probe_timeout = Duration::from_secs(60);
        let pool = ValidatorPool::new(Arc::new(ScriptedProber), cfg);

        let started = std::time::Instant::now();
        let out = pool
            .validate(
                nodes(&["hang", "ok-1", "ok-2"]),
                Instant::now() + Duration::from_millis(200),
                &CancellationToken::new(),
            )
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(out.deadline_hit);
        // The hanging probe holds the only permit, so nothing else ran.
        for node in &out.nodes {
            assert_eq!(node.status(), NodeStatus::Unreachable, "{}", node.host());
        }
        assert_eq!(out.stats.cancelled, 3);
    }

    #[tokio::test]
    async fn external_cancel_stops_the_pool() {
        let pool = ValidatorPool::new(Arc::new(ScriptedProber), config(4));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = pool
            .validate(nodes(&["hang", "hang2"]), far_deadline(), &cancel)
            .await;
        assert!(out.nodes.iter().all(|n| n.status() == NodeStatus::Unreachable));
        assert_eq!(out.stats.cancelled, 2);
    }

    #[tokio::test]
    async fn max_latency_drops_slow_nodes() {
        let mut cfg = config(2);
        cfg.max_latency = Some(Duration::from_millis(1000));
        let pool = ValidatorPool::new(Arc::new(ScriptedProber), cfg);
        let out = pool
            .validate(nodes(&["ok-1500", "ok-999"]), far_deadline(), &CancellationToken::new())
            .await;
        assert_eq!(out.nodes[0].status(), NodeStatus::Unreachable);
        assert_eq!(out.nodes[1].status(), NodeStatus::Reachable);
        assert_eq!(out.stats.too_slow, 1);
    }

    struct CountingProber {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Prober for CountingProber {
        async fn probe(&self, _node: &Node, _timeout: Duration) -> anyhow::Result<ProbeOutcome> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(ProbeOutcome::Reachable {
                latency: Duration::from_millis(20),
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_concurrency_limit() {
        let prober = Arc::new(CountingProber {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let pool = ValidatorPool::new(prober.clone(), config(3));
        let hosts: Vec<String> = (0..30).map(|i| format!("n{i}.example.com")).collect();
        let host_refs: Vec<&str> = hosts.iter().map(String::as_str).collect();

        let out = pool
            .validate(nodes(&host_refs), far_deadline(), &CancellationToken::new())
            .await;

        let peak = prober.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {peak} exceeded limit");
        assert!(peak >= 1);
        assert_eq!(out.stats.reachable, 30);
    }

    #[tokio::test]
    async fn empty_input_returns_immediately() {
        let pool = ValidatorPool::new(Arc::new(ScriptedProber), config(4));
        let out = pool
            .validate(Vec::new(), far_deadline(), &CancellationToken::new())
            .await;
        assert!(out.nodes.is_empty());
        assert_eq!(out.stats, ValidationStats::default());
    }

    #[tokio::test]
    async fn huge_concurrency_is_clamped() {
        let pool = ValidatorPool::new(Arc::new(ScriptedProber), config(usize::MAX));
        let out = pool
            .validate(nodes(&["ok-1", "down"]), far_deadline(), &CancellationToken::new())
            .await;
        assert_eq!(out.stats.reachable, 1);
        assert_eq!(out.stats.rejected, 1);
    }

    #[tokio::test]
    async fn silent_peer_counts_as_timed_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let socks = Node::new(
            Protocol::Socks,
            "127.0.0.1",
            port,
            "",
            Transport::tcp(),
            "",
            format!("socks://127.0.0.1:{port}"),
        );
        let mut cfg = config(1);
        cfg.probe_timeout = Duration::from_millis(300);
        let pool = ValidatorPool::new(Arc::new(HandshakeProber::new().unwrap()), cfg);

        let out = pool
            .validate(vec![socks], far_deadline(), &CancellationToken::new())
            .await;

        assert_eq!(out.nodes[0].status(), NodeStatus::Unreachable);
        assert_eq!(out.stats.timed_out, 1);
        assert_eq!(out.stats.rejected, 0);
    }
}
