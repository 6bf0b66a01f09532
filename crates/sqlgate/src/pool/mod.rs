//! The cluster pool: a priority-ordered node list, weighted selection, and
//! three background workers that keep the live set at its target size.
//!
//! Workers communicate through one-slot signals: `dead_signal` wakes the
//! reconnect worker, `pending_signal` wakes the promote worker when the pool
//! is under target, `live_signal` wakes the drain worker when it may be over.

pub(crate) mod node;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::classify::is_reconnect_error;
use crate::config::NodeConfig;
use crate::context::Context;
use crate::driver::{Driver, DriverError, PoolLimits};
use crate::error::{Error, Result};
use crate::signal::Signal;

pub(crate) use node::Node;
pub use node::NodeStatus;

/// Scales the active-request count before dividing by the node weight, so
/// small counts do not all truncate to zero.
const REQ_MULTIPLIER: i64 = 10_000;

const PING_INTERVAL: Duration = Duration::from_secs(1);
const DRAIN_WAIT_INTERVAL: Duration = Duration::from_secs(1);
const RECONNECT_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Point-in-time view of one pool slot.
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub addr: String,
    pub priority: u32,
    pub weight: u32,
    pub status: NodeStatus,
    pub active_requests: i32,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub active_current: i32,
    pub active_target: i32,
    pub nodes: Vec<NodeStats>,
}

/// Holds a node selected for one call: the active-request count stays
/// elevated until the hold is dropped, which keeps the drain worker from
/// closing the handle underneath the caller.
pub(crate) struct NodeHold {
    node: Arc<Node>,
}

impl NodeHold {
    pub(crate) fn new(node: Arc<Node>) -> Self {
        node.add_active_req();
        node.touch_last_use();
        Self { node }
    }

    pub(crate) fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

impl Drop for NodeHold {
    fn drop(&mut self) {
        self.node.sub_active_req();
    }
}

struct Shared {
    nodes: RwLock<Vec<Arc<Node>>>,

    active_target: i32,
    active_current: AtomicI32,
    use_lower_priority: bool,

    pending_lock: tokio::sync::Mutex<()>,
    dead_signal: Signal,
    live_signal: Signal,
    pending_signal: Signal,

    limits: RwLock<PoolLimits>,
}

pub(crate) struct ClusterPool {
    shared: Arc<Shared>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl ClusterPool {
    /// Builds the node list grouped by ascending priority, eagerly connects
    /// nodes in order until the live target is met (any failure here fails
    /// construction), then starts the background workers.
    pub(crate) async fn new(
        driver: Arc<dyn Driver>,
        configs: Vec<NodeConfig>,
        active_count: u32,
        use_lower_priority: bool,
    ) -> Result<Self> {
        if configs.is_empty() {
            return Err(Error::InvalidConfig("empty addr".to_string()));
        }

        let mut by_priority: BTreeMap<u32, Vec<NodeConfig>> = BTreeMap::new();
        for config in configs {
            by_priority
                .entry(config.priority.max(1))
                .or_default()
                .push(config);
        }

        let shared = Arc::new(Shared {
            nodes: RwLock::new(Vec::new()),
            active_target: active_count.max(1) as i32,
            active_current: AtomicI32::new(0),
            use_lower_priority,
            pending_lock: tokio::sync::Mutex::new(()),
            dead_signal: Signal::new(),
            live_signal: Signal::new(),
            pending_signal: Signal::new(),
            limits: RwLock::new(PoolLimits::default()),
        });

        for (_, group) in by_priority {
            for config in group {
                let node = Arc::new(Node::new(driver.clone(), Arc::new(config)));

                if shared.load_active_current() < shared.active_target {
                    tracing::debug!(addr = %node.host_addr(), "connecting node");
                    node.connect(&shared.limits_snapshot()).await?;
                    shared.set_live(&node);
                }

                shared.nodes_write().push(node);
            }
        }

        let shutdown = CancellationToken::new();
        let workers = vec![
            tokio::spawn(reconnect_worker(shared.clone(), shutdown.clone())),
            tokio::spawn(promote_worker(shared.clone(), shutdown.clone())),
            tokio::spawn(drain_worker(shared.clone(), shutdown.clone())),
        ];

        Ok(Self {
            shared,
            workers: StdMutex::new(workers),
            shutdown,
        })
    }

    /// Picks a live node (least weighted load, then oldest last use, within
    /// the lowest priority tier that has one) and holds it for the caller.
    ///
    /// When no node is live, exactly one caller at a time gets to promote a
    /// pending node; the rest wait on the same lock and re-check the live set
    /// first, so a herd of callers cannot all connect the same endpoint.
    pub(crate) async fn next(&self, ctx: &Context) -> Result<NodeHold> {
        ctx.err()?;

        loop {
            let Some(node) = self.shared.next_by_status(NodeStatus::Live) else {
                break;
            };

            let hold = NodeHold::new(node.clone());

            // The status may have flipped between selection and the hold;
            // re-check before handing it out.
            if node.load_status() != NodeStatus::Live {
                drop(hold);
                continue;
            }

            return Ok(hold);
        }

        let _promote = self.shared.pending_lock.lock().await;

        if let Some(node) = self.shared.next_by_status(NodeStatus::Live) {
            return Ok(NodeHold::new(node));
        }

        loop {
            let Some(node) = self.shared.next_by_status(NodeStatus::Pending) else {
                return Err(Error::NoAvailableClients);
            };

            match node.connect(&self.shared.limits_snapshot()).await {
                Ok(()) => {
                    self.shared.set_live(&node);
                    return Ok(NodeHold::new(node));
                }
                Err(err) => {
                    tracing::error!(addr = %node.host_addr(), error = %err, "connect pending node failed");
                    self.shared.set_dead(&node);
                }
            }
        }
    }

    /// Runs `f` on a selected node. A lost-transport failure demotes the node
    /// and transparently retries on another one; every other outcome is
    /// returned as-is. An error the reconnect hook already rewrote to the
    /// retry sentinel is considered handled and goes straight up.
    pub(crate) async fn do_query<T, F, Fut>(&self, ctx: &Context, mut f: F) -> Result<T>
    where
        F: FnMut(Context, Arc<Node>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        loop {
            let hold = self.next(ctx).await?;
            let node = hold.node().clone();
            let node_ctx = ctx.with_node(node.meta());

            let result = f(node_ctx, node.clone()).await;
            drop(hold);

            match result {
                Err(err) if !err.is_can_retry() && is_reconnect_error(&err) => {
                    tracing::error!(
                        addr = %node.host_addr(),
                        error = %err,
                        "node failed, selecting another",
                    );
                    self.shared.set_dead(&node);
                }
                other => return other,
            }
        }
    }

    /// Re-establishes the driver handle of the node serving `ctx`; installed
    /// as the reconnect hook's late-bound function.
    pub(crate) async fn reconnect_node(&self, ctx: &Context) -> Result<()> {
        let Some(meta) = ctx.node_meta() else {
            return Err(Error::from(DriverError::other(
                "no node bound to the call context",
            )));
        };

        let node = self
            .shared
            .nodes_read()
            .iter()
            .find(|n| n.host_addr() == meta.addr)
            .cloned();

        match node {
            Some(node) => node.reconnect(&self.shared.limits_snapshot()).await,
            None => Err(Error::from(DriverError::other(format!(
                "unknown node {}",
                meta.addr,
            )))),
        }
    }

    pub(crate) fn set_limits(&self, update: impl FnOnce(&mut PoolLimits)) {
        let limits = {
            let mut guard = self
                .shared
                .limits
                .write()
                .unwrap_or_else(|e| e.into_inner());
            update(&mut guard);
            *guard
        };

        for node in self.shared.nodes_read().iter() {
            node.apply_limits(&limits);
        }
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let nodes = self
            .shared
            .nodes_read()
            .iter()
            .map(|n| NodeStats {
                addr: n.host_addr().to_string(),
                priority: n.priority(),
                weight: n.weight(),
                status: n.load_status(),
                active_requests: n.load_active_requests(),
            })
            .collect();

        PoolStats {
            active_current: self.shared.load_active_current(),
            active_target: self.shared.active_target,
            nodes,
        }
    }

    /// Stops the workers, then closes every node.
    pub(crate) async fn close(&self) -> Result<()> {
        self.shutdown.cancel();

        let workers: Vec<_> = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for worker in workers {
            let _ = worker.await;
        }

        let nodes: Vec<_> = self.shared.nodes_read().clone();
        for node in nodes {
            self.shared.set_pending(&node);
            if let Err(err) = node.close().await {
                tracing::error!(addr = %node.host_addr(), error = %err, "close node failed");
            }
        }

        Ok(())
    }

    #[cfg(test)]
    fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Shared {
    fn nodes_read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<Node>>> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn nodes_write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<Node>>> {
        self.nodes.write().unwrap_or_else(|e| e.into_inner())
    }

    fn limits_snapshot(&self) -> PoolLimits {
        *self.limits.read().unwrap_or_else(|e| e.into_inner())
    }

    fn len(&self) -> usize {
        self.nodes_read().len()
    }

    fn get_node(&self, i: usize) -> Option<Arc<Node>> {
        self.nodes_read().get(i).cloned()
    }

    fn load_active_current(&self) -> i32 {
        self.active_current.load(Ordering::Acquire)
    }

    /// Weighted selection among nodes with the given status, in priority
    /// order. Within a tier the node with the smallest
    /// `active_requests * 10_000 / weight` wins, ties broken by the oldest
    /// last use. Lower tiers are only considered when configured, and then
    /// only until `active_target` candidates have been examined.
    fn next_by_status(&self, status: NodeStatus) -> Option<Arc<Node>> {
        let nodes = self.nodes_read();

        let mut best: Option<&Arc<Node>> = None;
        let mut min_weight = i64::MAX;
        let mut min_time = i64::MAX;
        let mut checked: i32 = 0;
        let mut priority_changed = false;

        for node in nodes.iter() {
            if node.load_status() != status {
                continue;
            }

            if !priority_changed
                && best.is_some_and(|b| b.priority() != node.priority())
            {
                priority_changed = true;

                if !self.use_lower_priority {
                    break;
                }
            }

            if priority_changed && self.use_lower_priority && checked >= self.active_target {
                break;
            }

            checked += 1;

            let weight =
                node.load_active_requests() as i64 * REQ_MULTIPLIER / node.weight() as i64;
            let use_time = node.load_last_use_time();

            if weight < min_weight || (weight == min_weight && use_time < min_time) {
                best = Some(node);
                min_weight = weight;
                min_time = use_time;
            }
        }

        best.cloned()
    }

    /// Status transitions adjust `active_current` based on the previous
    /// status, so the counter always equals the number of live nodes. All
    /// status writes go through these helpers.
    fn set_live(&self, node: &Node) {
        if node.swap_status(NodeStatus::Live) != NodeStatus::Live {
            let active = self.active_current.fetch_add(1, Ordering::AcqRel) + 1;
            tracing::debug!(addr = %node.host_addr(), active, "node live");
        }

        self.live_signal.send();
    }

    fn set_dead(&self, node: &Node) {
        if node.swap_status(NodeStatus::Dead) == NodeStatus::Live {
            self.active_current.fetch_sub(1, Ordering::AcqRel);
        }

        self.dead_signal.send();
        self.pending_signal.send();
    }

    fn set_pending(&self, node: &Node) {
        if node.swap_status(NodeStatus::Pending) == NodeStatus::Live {
            self.active_current.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Swaps slot `i` for a fresh pending copy and detaches the old node.
    /// Existing callers keep the detached instance through their holds; the
    /// caller is responsible for closing it once its counter drains.
    fn drain_slot(&self, i: usize) -> Option<Arc<Node>> {
        let old = {
            let mut nodes = self.nodes_write();
            let old = nodes.get(i)?.clone();

            if old.load_status() != NodeStatus::Live {
                return None;
            }

            nodes[i] = Arc::new(old.copy_without_db());
            old
        };

        // The detached node leaves the pool: account for its live status and
        // park it in pending so close() is legal once it drains.
        if old.swap_status(NodeStatus::Pending) == NodeStatus::Live {
            self.active_current.fetch_sub(1, Ordering::AcqRel);
        }

        Some(old)
    }
}

/// Reconnects dead nodes, sleeping on `dead_signal` while there are none.
/// After a failed attempt it waits for the ping interval or the next dead
/// pulse, whichever comes first; failures are logged at most once a minute.
async fn reconnect_worker(shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut last_log: Option<Instant> = None;

    loop {
        let Some(node) = shared.next_by_status(NodeStatus::Dead) else {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = shared.dead_signal.recv() => {}
            }
            continue;
        };

        match node.connect(&shared.limits_snapshot()).await {
            Ok(()) => {
                shared.set_live(&node);
            }
            Err(err) => {
                if last_log.map_or(true, |t| t.elapsed() >= RECONNECT_LOG_INTERVAL) {
                    last_log = Some(Instant::now());
                    tracing::error!(addr = %node.host_addr(), error = %err, "dead node reconnect failed");
                }

                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(PING_INTERVAL) => {}
                    _ = shared.dead_signal.recv() => {}
                }
            }
        }
    }
}

/// On every pending pulse, walks the list in priority order and connects
/// pending nodes while the pool is under its live target.
async fn promote_worker(shared: Arc<Shared>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = shared.pending_signal.recv() => {}
        }

        for i in 0..shared.len() {
            if shared.load_active_current() >= shared.active_target {
                break;
            }

            let Some(node) = shared.get_node(i) else {
                continue;
            };
            if node.load_status() != NodeStatus::Pending {
                continue;
            }

            match node.connect(&shared.limits_snapshot()).await {
                Ok(()) => shared.set_live(&node),
                Err(err) => {
                    tracing::error!(addr = %node.host_addr(), error = %err, "pending to live failed");
                    shared.set_dead(&node);
                }
            }
        }
    }
}

/// On every live pulse, walks the list from the lowest priority end and
/// drains excess live nodes: the slot is swapped for a pending copy and the
/// detached instance is closed once its in-flight requests finish.
async fn drain_worker(shared: Arc<Shared>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = shared.live_signal.recv() => {}
        }

        for i in (0..shared.len()).rev() {
            if shared.load_active_current() <= shared.active_target {
                break;
            }

            let Some(detached) = shared.drain_slot(i) else {
                continue;
            };

            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    if detached.load_active_requests() == 0 {
                        break;
                    }

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(DRAIN_WAIT_INTERVAL) => {}
                    }
                }

                if let Err(err) = detached.close().await {
                    tracing::error!(
                        addr = %detached.host_addr(),
                        error = %err,
                        "close drained node failed",
                    );
                }
            });
        }
    }
}
