//! One database endpoint: status, in-flight counter, last-use stamp and the
//! (possibly absent) driver handle.

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::{Duration, Instant};

use crate::config::NodeConfig;
use crate::context::NodeMeta;
use crate::driver::{
    Connection, Driver, DriverError, DriverTx, ExecResult, PoolLimits, Rows, TxOptions, Value,
};
use crate::error::{Error, Result};

pub(crate) const PING_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending = 0,
    Dead = 1,
    Live = 2,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Dead => "dead",
            NodeStatus::Live => "live",
        }
    }

    fn from_u8(v: u8) -> NodeStatus {
        match v {
            2 => NodeStatus::Live,
            1 => NodeStatus::Dead,
            _ => NodeStatus::Pending,
        }
    }
}

fn monotonic_nanos() -> i64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as i64
}

pub(crate) struct Node {
    config: Arc<NodeConfig>,
    driver: Arc<dyn Driver>,
    dsn: String,
    priority: u32,
    weight: u32,

    status: AtomicU8,
    active_requests: AtomicI32,
    last_use_time: AtomicI64,

    handle: RwLock<Option<Arc<dyn Connection>>>,
    meta: RwLock<Arc<NodeMeta>>,
}

impl Node {
    pub(crate) fn new(driver: Arc<dyn Driver>, config: Arc<NodeConfig>) -> Self {
        let meta = Arc::new(NodeMeta {
            addr: config.addr.clone(),
            db_type: config.db_type.to_string(),
            database: config.database.clone(),
            user: config.user.clone(),
            instance: None,
        });

        Self {
            dsn: config.dsn(),
            priority: config.priority.max(1),
            weight: config.weight.max(1),
            driver,
            config,
            status: AtomicU8::new(NodeStatus::Pending as u8),
            active_requests: AtomicI32::new(0),
            last_use_time: AtomicI64::new(0),
            handle: RwLock::new(None),
            meta: RwLock::new(meta),
        }
    }

    pub(crate) fn config(&self) -> &Arc<NodeConfig> {
        &self.config
    }

    /// Host address for logs and labels (not the DSN, which may carry
    /// credentials).
    pub(crate) fn host_addr(&self) -> &str {
        &self.config.addr
    }

    pub(crate) fn priority(&self) -> u32 {
        self.priority
    }

    pub(crate) fn weight(&self) -> u32 {
        self.weight
    }

    pub(crate) fn meta(&self) -> Arc<NodeMeta> {
        self.meta
            .read()
            .map(|m| m.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Opens the driver handle and pings it under a fresh 3-second deadline
    /// (never the caller's context). Does not change the node status; the
    /// pool owns status transitions.
    pub(crate) async fn connect(&self, limits: &PoolLimits) -> Result<()> {
        self.touch_last_use();

        let conn = self.driver.open(&self.dsn).await?;

        match tokio::time::timeout(PING_TIMEOUT, conn.ping()).await {
            Ok(res) => res?,
            Err(_) => {
                let _ = conn.close().await;
                return Err(Error::from(DriverError::connection(format!(
                    "ping {}: deadline exceeded",
                    self.config.addr,
                ))));
            }
        }

        conn.apply_limits(limits);

        let instance = conn.instance_id().await;
        if instance.is_some() {
            let current = self.meta();
            self.store_meta(Arc::new(NodeMeta {
                instance,
                ..(*current).clone()
            }));
        }

        if let Ok(mut handle) = self.handle.write() {
            *handle = Some(conn);
        }

        Ok(())
    }

    /// Replaces the driver handle in place; used by the reconnect hook while
    /// the node stays live. The old handle is closed in the background once
    /// swapped out.
    pub(crate) async fn reconnect(&self, limits: &PoolLimits) -> Result<()> {
        let conn = self.driver.open(&self.dsn).await?;

        match tokio::time::timeout(PING_TIMEOUT, conn.ping()).await {
            Ok(res) => res?,
            Err(_) => {
                let _ = conn.close().await;
                return Err(Error::from(DriverError::connection(format!(
                    "ping {}: deadline exceeded",
                    self.config.addr,
                ))));
            }
        }

        conn.apply_limits(limits);

        let old = match self.handle.write() {
            Ok(mut handle) => handle.replace(conn),
            Err(_) => None,
        };

        if let Some(old) = old {
            tokio::spawn(async move {
                let _ = old.close().await;
            });
        }

        Ok(())
    }

    /// Legal only while pending or dead; closing twice is fine.
    pub(crate) async fn close(&self) -> Result<()> {
        let status = self.load_status();
        if status != NodeStatus::Pending && status != NodeStatus::Dead {
            return Err(Error::NotPending);
        }

        let handle = match self.handle.write() {
            Ok(mut handle) => handle.take(),
            Err(_) => None,
        };

        if let Some(conn) = handle {
            conn.close().await?;
        }

        Ok(())
    }

    /// A fresh pending node with the same identity and no handle; the drain
    /// path swaps this into the pool slot instead of mutating the original.
    pub(crate) fn copy_without_db(&self) -> Node {
        Node::new(self.driver.clone(), self.config.clone())
    }

    pub(crate) fn load_status(&self) -> NodeStatus {
        NodeStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Stores the new status and returns the previous one.
    pub(crate) fn swap_status(&self, status: NodeStatus) -> NodeStatus {
        NodeStatus::from_u8(self.status.swap(status as u8, Ordering::AcqRel))
    }

    pub(crate) fn load_active_requests(&self) -> i32 {
        self.active_requests.load(Ordering::Acquire)
    }

    pub(crate) fn add_active_req(&self) {
        self.active_requests.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn sub_active_req(&self) {
        self.active_requests.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn load_last_use_time(&self) -> i64 {
        self.last_use_time.load(Ordering::Acquire)
    }

    pub(crate) fn touch_last_use(&self) {
        self.last_use_time.store(monotonic_nanos(), Ordering::Release);
    }

    pub(crate) fn apply_limits(&self, limits: &PoolLimits) {
        let guard = self.handle.read().unwrap_or_else(|e| e.into_inner());
        if let Some(conn) = guard.as_ref() {
            conn.apply_limits(limits);
        }
    }

    fn store_meta(&self, meta: Arc<NodeMeta>) {
        if let Ok(mut slot) = self.meta.write() {
            *slot = meta;
        }
    }

    fn handle(&self) -> Result<Arc<dyn Connection>> {
        let guard = self
            .handle
            .read()
            .unwrap_or_else(|e| e.into_inner());

        guard.clone().ok_or_else(|| {
            // The phrasing matters: a missing handle means a drained or dead
            // slot, and the caller should try another node.
            Error::from(DriverError::connection(
                "node handle is closed, try another node",
            ))
        })
    }

    /// RAII in-flight marker: increments on entry, stamps last-use,
    /// decrements on every exit path.
    fn track(&self) -> ActiveGuard<'_> {
        self.add_active_req();
        self.touch_last_use();
        ActiveGuard { node: self }
    }

    pub(crate) async fn ping(&self) -> Result<()> {
        let _guard = self.track();
        let handle = self.handle()?;

        handle.ping().await?;
        Ok(())
    }

    pub(crate) async fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult> {
        let _guard = self.track();
        let handle = self.handle()?;

        Ok(handle.exec(query, args).await?)
    }

    pub(crate) async fn query(&self, query: &str, args: &[Value]) -> Result<Rows> {
        let _guard = self.track();
        let handle = self.handle()?;

        Ok(handle.query(query, args).await?)
    }

    pub(crate) async fn prepare(&self, query: &str) -> Result<()> {
        let _guard = self.track();
        let handle = self.handle()?;

        handle.prepare(query).await?;
        Ok(())
    }

    pub(crate) async fn begin(&self, opts: &TxOptions) -> Result<Box<dyn DriverTx>> {
        let _guard = self.track();
        let handle = self.handle()?;

        Ok(handle.begin(opts).await?)
    }
}

struct ActiveGuard<'a> {
    node: &'a Node,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.node.sub_active_req();
    }
}
