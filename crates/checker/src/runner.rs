//! # Control Loop
//!
//! One tick, start to finish:
//!
//! ```text
//! ┌──────────────┐   join_all    ┌──────────────┐   claims   ┌────────┐
//! │ every node   │ ────────────▶ │ info + users │ ─────────▶ │ quorum │
//! └──────────────┘               └──────────────┘            └───┬────┘
//!                                                                │ canonical
//!                                                                ▼
//! ┌──────────────┐   join_all    ┌──────────────┐  sequential ┌──────────┐
//! │ weight write │ ◀──────────── │ weight read  │ ◀────────── │ classify │
//! └──────────────┘               └──────────────┘   decide    └──────────┘
//! ```
//!
//! ## Pacing
//!
//! Ticks never overlap. Each tick starts at `previous start + interval`;
//! a tick that overruns is followed immediately by the next one. A failed
//! tick is logged and the loop resumes after `tick_error_delay`.
//!
//! ## Supervision
//!
//! [`supervise`] runs discovery plus the loop in a spawned task and starts
//! over after `restart_delay` when bootstrap fails, the loop errors or the
//! task panics. The shutdown signal stops it between ticks.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::check::{CheckFailure, CheckResult, Checker, TableSample};
use crate::config::CheckerConfig;
use crate::error::{CheckerError, RpcError, StoreError};
use crate::hysteresis::{HysteresisPolicy, NodeLedger, Verdict, WeightAction, WeightTargets};
use crate::node::{parse_weight, store_timeout, Node};
use crate::quorum::{canonical_block, CanonicalBlock};
use crate::rpc::{ChainInfoSnapshot, NodeRpc};
use crate::store::WeightStore;

/// Opens the RPC client of a discovered node.
pub type Connect = dyn Fn(&Node) -> Result<Arc<dyn NodeRpc>, RpcError> + Send + Sync;

/// A node together with the client used to check it.
#[derive(Clone)]
pub struct MonitoredNode {
    pub node: Node,
    pub rpc: Arc<dyn NodeRpc>,
}

impl MonitoredNode {
    pub fn new(node: Node, rpc: Arc<dyn NodeRpc>) -> Self {
        Self { node, rpc }
    }
}

/// What one tick decided, by server key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub canonical: Option<CanonicalBlock>,
    pub valid: Vec<String>,
    pub lagging: Vec<String>,
    pub invalid: Vec<String>,
    pub set_full: Vec<String>,
    pub set_zero: Vec<String>,
}

struct NodeOutcome {
    info: CheckResult<ChainInfoSnapshot>,
    users: CheckResult<TableSample>,
}

struct Classified {
    verdict: Verdict,
    reasons: Vec<String>,
    /// Some check could not reach the node at all.
    rejected: bool,
}

// ════════════════════════════════════════════════════════════════════════════
// RUNNER
// ════════════════════════════════════════════════════════════════════════════

/// Owns the fleet and the ledger, and drives ticks.
pub struct Runner {
    checker: Checker,
    store: Arc<dyn WeightStore>,
    nodes: Vec<MonitoredNode>,
    ledger: NodeLedger,
    policy: HysteresisPolicy,
    targets: WeightTargets,
    request_timeout: Duration,
    check_interval: Duration,
    tick_error_delay: Duration,
}

impl Runner {
    pub fn new(config: &CheckerConfig, store: Arc<dyn WeightStore>, nodes: Vec<MonitoredNode>) -> Self {
        let ledger = NodeLedger::new(nodes.iter().map(|m| m.node.server_key.clone()));
        Self {
            checker: Checker::from_config(config),
            store,
            nodes,
            ledger,
            policy: HysteresisPolicy::from_config(config),
            targets: WeightTargets::from_config(config),
            request_timeout: config.request_timeout,
            check_interval: config.check_interval,
            tick_error_delay: config.tick_error_delay,
        }
    }

    /// Discovers the fleet from the store and opens a client per node.
    pub async fn discover(
        config: &CheckerConfig,
        store: Arc<dyn WeightStore>,
        connect: &Connect,
    ) -> Result<Self, CheckerError> {
        let servers = store_timeout(config.request_timeout, store.get_servers()).await?;
        let fleet = Node::fleet_from_servers(&servers, config.request_timeout);
        if fleet.is_empty() {
            return Err(CheckerError::EmptyFleet(config.server_prefix.clone()));
        }

        let nodes = fleet
            .into_iter()
            .map(|node| {
                let rpc = connect(&node).map_err(|e| {
                    CheckerError::UnexpectedTick(format!("cannot open client for {node}: {e}"))
                })?;
                Ok(MonitoredNode::new(node, rpc))
            })
            .collect::<Result<Vec<_>, CheckerError>>()?;

        for monitored in &nodes {
            debug!(server = %monitored.node.server_key, url = %monitored.node.url, "monitoring node");
        }
        info!(nodes = nodes.len(), prefix = %config.server_prefix, "fleet discovered");

        Ok(Self::new(config, store, nodes))
    }

    pub fn nodes(&self) -> &[MonitoredNode] {
        &self.nodes
    }

    pub fn ledger(&self) -> &NodeLedger {
        &self.ledger
    }

    /// Runs one full check-and-update cycle over the fleet.
    ///
    /// Every node is processed even when some store calls fail; the
    /// failures are returned together afterwards. A tick without a
    /// canonical block only records check failures and writes nothing.
    pub async fn tick(&mut self) -> Result<TickReport, CheckerError> {
        let checker = &self.checker;
        let outcomes: Vec<NodeOutcome> = join_all(self.nodes.iter().map(|m| async move {
            let rpc = m.rpc.as_ref();
            let (users, info) = tokio::join!(checker.check_users(&m.node, rpc), checker.check_info(&m.node, rpc));
            NodeOutcome { info, users }
        }))
        .await;

        let canonical = canonical_block(outcomes.iter().filter_map(|outcome| {
            match (&outcome.info, &outcome.users) {
                (CheckResult::Passed(info), CheckResult::Passed(_)) => Some((
                    info.last_irreversible_block_num,
                    info.last_irreversible_block_id.as_str(),
                )),
                _ => None,
            }
        }));

        let mut report = TickReport {
            canonical: canonical.clone(),
            ..TickReport::default()
        };

        let mut classified = Vec::with_capacity(self.nodes.len());
        for (monitored, outcome) in self.nodes.iter().zip(&outcomes) {
            let key = monitored.node.server_key.as_str();
            let entry = classify(
                &self.checker,
                &mut self.ledger,
                &self.policy,
                key,
                outcome,
                canonical.as_ref(),
            )?;
            match entry.verdict {
                Verdict::Valid => report.valid.push(key.to_string()),
                Verdict::Lagging => report.lagging.push(key.to_string()),
                Verdict::Invalid => report.invalid.push(key.to_string()),
            }
            classified.push(entry);
        }

        debug!(
            valid = report.valid.len(),
            lagging = report.lagging.len(),
            invalid = report.invalid.len(),
            canonical = %canonical.as_ref().map(ToString::to_string).unwrap_or_else(|| "none".to_string()),
            "tick checks finished"
        );

        // Without agreement there is nothing to judge the fleet against.
        if canonical.is_none() {
            warn!(
                invalid = report.invalid.len(),
                "no node passed freshness and consistency, weights left untouched"
            );
            return Ok(report);
        }

        let mut failures: Vec<(String, StoreError)> = Vec::new();

        let store = self.store.as_ref();
        let timeout = self.request_timeout;
        let current = join_all(
            self.nodes
                .iter()
                .map(|m| store_timeout(timeout, store.get_weight(&m.node))),
        )
        .await;

        let mut writes: Vec<(usize, u64)> = Vec::new();
        for (idx, read) in current.into_iter().enumerate() {
            let key = self.nodes[idx].node.server_key.as_str();
            let raw = match read {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(server = %key, error = %err, "weight read failed");
                    failures.push((key.to_string(), err));
                    continue;
                }
            };
            let weight = raw.as_deref().and_then(parse_weight);
            let action = self
                .ledger
                .decide_weight(key, classified[idx].verdict, weight, &self.targets, &self.policy);
            match action {
                WeightAction::Keep => {}
                WeightAction::SetFull => writes.push((idx, self.targets.full)),
                WeightAction::SetZero => writes.push((idx, self.targets.zero)),
            }
        }

        let written = join_all(writes.iter().map(|&(idx, weight)| {
            let node = &self.nodes[idx].node;
            async move { (idx, weight, store_timeout(timeout, store.set_weight(node, weight)).await) }
        }))
        .await;

        for (idx, weight, result) in written {
            let node = &self.nodes[idx].node;
            if let Err(err) = result {
                warn!(server = %node.server_key, weight, error = %err, "weight write failed");
                failures.push((node.server_key.clone(), err));
                continue;
            }

            if weight == self.targets.full {
                info!(server = %node.server_key, url = %node.url, weight, "node weight set to full");
                report.set_full.push(node.server_key.clone());
            } else {
                let entry = &classified[idx];
                info!(
                    server = %node.server_key,
                    url = %node.url,
                    weight,
                    reason = %entry.reasons.join("; "),
                    rejected = entry.rejected,
                    "node weight set to zero"
                );
                report.set_zero.push(node.server_key.clone());
            }
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(CheckerError::WeightStore(failures))
        }
    }

    /// Ticks until `shutdown` turns true or its sender is dropped.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), CheckerError> {
        info!(
            nodes = self.nodes.len(),
            interval_ms = self.check_interval.as_millis() as u64,
            "checker loop started"
        );

        while !*shutdown.borrow() {
            let started = Instant::now();
            let next = match self.tick().await {
                Ok(_) => started + self.check_interval,
                Err(err) => {
                    error!(error = %err, "tick failed");
                    Instant::now() + self.tick_error_delay
                }
            };

            if wait_or_shutdown(next, &mut shutdown).await {
                break;
            }
        }

        info!("checker loop stopped");
        Ok(())
    }
}

/// Classifies one node for this tick and collects the reasons of its failed checks.
fn classify(
    checker: &Checker,
    ledger: &mut NodeLedger,
    policy: &HysteresisPolicy,
    key: &str,
    outcome: &NodeOutcome,
    canonical: Option<&CanonicalBlock>,
) -> Result<Classified, CheckerError> {
    let mut reasons: Vec<String> = [outcome.info.reason(), outcome.users.reason()]
        .into_iter()
        .flatten()
        .collect();
    let rejected = [outcome.info.failure(), outcome.users.failure()]
        .into_iter()
        .flatten()
        .any(CheckFailure::is_rejected);

    let info = match (&outcome.info, &outcome.users) {
        (CheckResult::Passed(info), CheckResult::Passed(_)) => info,
        _ => {
            let verdict = ledger.record_check_failures(
                key,
                outcome.info.is_failed(),
                outcome.users.is_failed(),
            );
            return Ok(Classified {
                verdict,
                reasons,
                rejected,
            });
        }
    };

    let canonical = canonical.ok_or_else(|| {
        CheckerError::UnexpectedTick(format!("{key} passed its checks but no canonical block was chosen"))
    })?;
    let result = checker.check_irreversible(info, canonical);
    reasons.extend(result.reason());
    let verdict = ledger.apply_irreversibility(key, &result, policy);

    Ok(Classified {
        verdict,
        reasons,
        rejected,
    })
}

/// Sleeps until `deadline`. Returns `true` when shutdown was requested.
async fn wait_or_shutdown(deadline: Instant, shutdown: &mut watch::Receiver<bool>) -> bool {
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return true;
                }
            }
            _ = sleep_until(deadline) => return false,
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// SUPERVISOR
// ════════════════════════════════════════════════════════════════════════════

/// Keeps the checker running until shutdown, rediscovering the fleet after
/// every failure.
pub async fn supervise(
    config: CheckerConfig,
    store: Arc<dyn WeightStore>,
    connect: Arc<Connect>,
    mut shutdown: watch::Receiver<bool>,
) {
    let restart_delay = config.restart_delay;
    let config = Arc::new(config);

    while !*shutdown.borrow() {
        let task = tokio::spawn({
            let config = Arc::clone(&config);
            let store = Arc::clone(&store);
            let connect = Arc::clone(&connect);
            let shutdown = shutdown.clone();
            async move {
                let mut runner = Runner::discover(&config, store, connect.as_ref()).await?;
                runner.run(shutdown).await
            }
        });

        match task.await {
            Ok(Ok(())) => break,
            Ok(Err(err)) => {
                error!(error = %err, delay_ms = restart_delay.as_millis() as u64, "checker failed, restarting");
            }
            Err(err) => {
                error!(error = %err, delay_ms = restart_delay.as_millis() as u64, "checker task aborted, restarting");
            }
        }

        if wait_or_shutdown(Instant::now() + restart_delay, &mut shutdown).await {
            break;
        }
    }

    info!("supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::MockNodeRpc;
    use crate::store::MemoryWeightStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    const PREFIX: &str = "/servers/";

    fn config() -> CheckerConfig {
        CheckerConfig {
            server_prefix: PREFIX.to_string(),
            ..CheckerConfig::default()
        }
    }

    fn fleet(
        config: &CheckerConfig,
        store: &Arc<MemoryWeightStore>,
        members: &[(&str, &Arc<MockNodeRpc>, u64)],
    ) -> Runner {
        let nodes = members
            .iter()
            .map(|(key, rpc, weight)| {
                let url = format!("http://{key}:8888");
                store.register_server(key, &url, Some(*weight));
                let rpc: Arc<dyn NodeRpc> = Arc::clone(*rpc) as Arc<dyn NodeRpc>;
                MonitoredNode::new(Node::new(*key, url, config.request_timeout), rpc)
            })
            .collect();
        Runner::new(config, Arc::clone(store) as Arc<dyn WeightStore>, nodes)
    }

    #[tokio::test]
    async fn test_tick_zeroes_stale_node_and_keeps_healthy() {
        let config = config();
        let store = Arc::new(MemoryWeightStore::new(PREFIX));
        let a = Arc::new(MockNodeRpc::healthy(100, "A"));
        let b = Arc::new(MockNodeRpc::healthy(100, "A"));
        b.set_head_lag(Duration::from_secs(3));
        let mut runner = fleet(&config, &store, &[("a", &a, 100), ("b", &b, 100)]);

        let report = runner.tick().await.expect("tick");

        assert_eq!(report.valid, vec!["a".to_string()]);
        assert_eq!(report.invalid, vec!["b".to_string()]);
        assert_eq!(report.set_zero, vec!["b".to_string()]);
        assert!(report.set_full.is_empty());
        assert_eq!(store.writes(), vec![("b".to_string(), 0)]);
        assert_eq!(runner.ledger().get("b").map(|r| r.fail.invalid_info), Some(1));
    }

    #[tokio::test]
    async fn test_no_canonical_block_leaves_weights_untouched() {
        let config = config();
        let store = Arc::new(MemoryWeightStore::new(PREFIX));
        let mut members = Vec::new();
        for _ in 0..3 {
            let rpc = Arc::new(MockNodeRpc::healthy(100, "A"));
            rpc.set_info_error(Some(RpcError::Transport("refused".to_string())));
            members.push(rpc);
        }
        let mut runner = fleet(
            &config,
            &store,
            &[("s1", &members[0], 100), ("s2", &members[1], 100), ("s3", &members[2], 100)],
        );
        // The weight phase must not run at all.
        store.set_unavailable(true);

        let report = runner.tick().await.expect("tick");

        assert_eq!(report.canonical, None);
        assert_eq!(report.invalid.len(), 3);
        assert!(report.set_zero.is_empty());
        assert!(store.writes().is_empty());
        store.set_unavailable(false);
        for key in ["s1", "s2", "s3"] {
            assert_eq!(store.weight_of(key).as_deref(), Some("100"));
            assert_eq!(runner.ledger().get(key).map(|r| r.fail.invalid_info), Some(1));
        }
    }

    #[test]
    fn test_classify_marks_unreachable_nodes_rejected() {
        let checker = Checker::from_config(&config());
        let policy = HysteresisPolicy::from_config(&config());
        let mut ledger = NodeLedger::new(["a"]);
        let short_page = CheckFailure::ShortPage {
            actual: 5,
            expected: 100,
            position: 1,
        };
        let refused = CheckFailure::NetworkOrTimeout(RpcError::Transport("refused".to_string()));

        let outcome = NodeOutcome {
            info: CheckResult::Failed(refused),
            users: CheckResult::Failed(short_page.clone()),
        };
        let entry = classify(&checker, &mut ledger, &policy, "a", &outcome, None).expect("classified");
        assert_eq!(entry.verdict, Verdict::Invalid);
        assert!(entry.rejected);
        assert_eq!(entry.reasons.len(), 2);

        let outcome = NodeOutcome {
            info: CheckResult::Failed(CheckFailure::IrreversibleTooFarBehind {
                head: 1_000,
                irreversible: 1,
                max: 500,
            }),
            users: CheckResult::Failed(short_page),
        };
        let entry = classify(&checker, &mut ledger, &policy, "a", &outcome, None).expect("classified");
        assert!(!entry.rejected);
    }

    #[tokio::test]
    async fn test_lagging_node_at_zero_is_promoted() {
        let config = config();
        let store = Arc::new(MemoryWeightStore::new(PREFIX));
        let a = Arc::new(MockNodeRpc::healthy(100, "A"));
        let b = Arc::new(MockNodeRpc::healthy(100, "A"));
        let c = Arc::new(MockNodeRpc::healthy(101, "X"));
        let mut runner = fleet(&config, &store, &[("a", &a, 100), ("b", &b, 100), ("c", &c, 0)]);

        let report = runner.tick().await.expect("tick");

        assert_eq!(report.lagging, vec!["c".to_string()]);
        assert_eq!(report.set_full, vec!["c".to_string()]);
        assert_eq!(store.writes(), vec![("c".to_string(), 100)]);
        assert_eq!(runner.ledger().get("c").map(|r| r.fail.irreversible_greater), Some(1));
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_after_all_nodes() {
        let config = config();
        let store = Arc::new(MemoryWeightStore::new(PREFIX));
        let a = Arc::new(MockNodeRpc::healthy(100, "A"));
        let b = Arc::new(MockNodeRpc::healthy(100, "A"));
        let mut runner = fleet(&config, &store, &[("a", &a, 0), ("b", &b, 0)]);
        store.set_unavailable(true);

        match runner.tick().await {
            Err(CheckerError::WeightStore(failures)) => {
                let servers: Vec<&str> = failures.iter().map(|(s, _)| s.as_str()).collect();
                assert_eq!(servers, vec!["a", "b"]);
            }
            other => panic!("expected WeightStore error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_discover_builds_fleet_from_store() {
        let config = config();
        let store = Arc::new(MemoryWeightStore::new(PREFIX));
        store.register_server("s1", "http://s1:8888", Some(100));
        store.register_server("s2", "http://s2:8888", None);
        store.insert(format!("{PREFIX}s3/weight"), "100");

        let connect: Box<Connect> = Box::new(|_node: &Node| {
            Ok::<_, RpcError>(Arc::new(MockNodeRpc::healthy(1, "x")) as Arc<dyn NodeRpc>)
        });
        let runner = Runner::discover(&config, store as Arc<dyn WeightStore>, connect.as_ref())
            .await
            .expect("discovered");

        let keys: Vec<&str> = runner.nodes().iter().map(|m| m.node.server_key.as_str()).collect();
        assert_eq!(keys, vec!["s1", "s2"]);
        assert_eq!(runner.nodes()[0].node.weight, Some(100));
        assert!(runner.ledger().get("s1").is_some());
        assert!(runner.ledger().get("s2").is_some());
        assert!(runner.ledger().get("s3").is_none());
    }

    #[tokio::test]
    async fn test_discover_empty_fleet() {
        let config = config();
        let store = Arc::new(MemoryWeightStore::new(PREFIX));
        let connect: Box<Connect> = Box::new(|_node: &Node| {
            Ok::<_, RpcError>(Arc::new(MockNodeRpc::healthy(1, "x")) as Arc<dyn NodeRpc>)
        });
        let result = Runner::discover(&config, store as Arc<dyn WeightStore>, connect.as_ref()).await;
        assert!(matches!(result, Err(CheckerError::EmptyFleet(prefix)) if prefix == PREFIX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_paces_ticks_and_stops_on_shutdown() {
        let config = config();
        let store = Arc::new(MemoryWeightStore::new(PREFIX));
        let a = Arc::new(MockNodeRpc::healthy(100, "A"));
        let mut runner = fleet(&config, &store, &[("a", &a, 100)]);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { runner.run(rx).await });

        // Ticks at 0s, 15s, 30s and 45s.
        tokio::time::sleep(Duration::from_secs(46)).await;
        assert_eq!(a.info_calls(), 4);

        tx.send(true).expect("runner listening");
        handle.await.expect("joined").expect("clean stop");
        assert_eq!(a.info_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_tick_is_not_overlapped() {
        let config = CheckerConfig {
            request_timeout: Duration::from_secs(60),
            ..config()
        };
        let store = Arc::new(MemoryWeightStore::new(PREFIX));
        let a = Arc::new(MockNodeRpc::healthy(100, "A"));
        // Platform state then page: each tick takes 20s against a 15s interval.
        a.set_delay(Duration::from_secs(10));
        let mut runner = fleet(&config, &store, &[("a", &a, 100)]);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { runner.run(rx).await });

        // Ticks start at 0s, 20s and 40s.
        tokio::time::sleep(Duration::from_secs(41)).await;
        assert_eq!(a.info_calls(), 3);

        drop(tx);
        handle.await.expect("joined").expect("clean stop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervise_restarts_after_failed_discovery() {
        let config = config();
        let store = Arc::new(MemoryWeightStore::new(PREFIX));
        store.set_unavailable(true);

        let attempts = Arc::new(AtomicU32::new(0));
        let node_rpc = Arc::new(MockNodeRpc::healthy(100, "A"));
        let connect: Arc<Connect> = {
            let attempts = Arc::clone(&attempts);
            let node_rpc = Arc::clone(&node_rpc);
            Arc::new(move |_node: &Node| {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RpcError>(Arc::clone(&node_rpc) as Arc<dyn NodeRpc>)
            })
        };
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(supervise(
            config,
            Arc::clone(&store) as Arc<dyn WeightStore>,
            connect,
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 0);

        store.register_server("a", "http://a:8888", Some(100));
        store.set_unavailable(false);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(node_rpc.info_calls() >= 1);

        tx.send(true).expect("supervisor listening");
        handle.await.expect("joined");
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervise_restarts_after_task_panic() {
        let config = config();
        let store = Arc::new(MemoryWeightStore::new(PREFIX));
        store.register_server("a", "http://a:8888", Some(100));

        let attempts = Arc::new(AtomicU32::new(0));
        let node_rpc = Arc::new(MockNodeRpc::healthy(100, "A"));
        let connect: Arc<Connect> = {
            let attempts = Arc::clone(&attempts);
            let node_rpc = Arc::clone(&node_rpc);
            Arc::new(move |_node: &Node| {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("client construction blew up");
                }
                Ok::<_, RpcError>(Arc::clone(&node_rpc) as Arc<dyn NodeRpc>)
            })
        };
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(supervise(
            config,
            Arc::clone(&store) as Arc<dyn WeightStore>,
            connect,
            rx,
        ));

        // First attempt panics at 0s, the restart follows after 1s.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(node_rpc.info_calls(), 0);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(node_rpc.info_calls() >= 1);

        tx.send(true).expect("supervisor listening");
        handle.await.expect("supervisor survives the panic");
    }
}
