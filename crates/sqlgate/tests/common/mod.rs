//! Scripted in-memory driver for cluster behavior tests: per-address connect
//! refusal and queued call errors, plus a log of which node served what.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlgate::driver::{
    Connection, Driver, DriverError, DriverTx, ExecResult, Rows, TxOptions, Value,
};

#[derive(Default)]
pub struct MockState {
    refuse_connect: Mutex<HashSet<String>>,
    call_errors: Mutex<HashMap<String, VecDeque<DriverError>>>,
    served: Mutex<Vec<String>>,
    tx_counter: std::sync::atomic::AtomicU64,
    tx_statements: Mutex<Vec<(u64, String)>>,
}

impl MockState {
    pub fn refuse(&self, addr: &str) {
        self.refuse_connect.lock().unwrap().insert(addr.to_string());
    }

    #[allow(dead_code)]
    pub fn allow(&self, addr: &str) {
        self.refuse_connect.lock().unwrap().remove(addr);
    }

    pub fn push_error(&self, addr: &str, err: DriverError) {
        self.call_errors
            .lock()
            .unwrap()
            .entry(addr.to_string())
            .or_default()
            .push_back(err);
    }

    pub fn served(&self) -> Vec<String> {
        self.served.lock().unwrap().clone()
    }

    /// `(transaction id, node address)` per statement run inside a
    /// transaction.
    #[allow(dead_code)]
    pub fn tx_statements(&self) -> Vec<(u64, String)> {
        self.tx_statements.lock().unwrap().clone()
    }
}

pub struct MockDriver {
    pub state: Arc<MockState>,
}

impl MockDriver {
    pub fn new() -> (Arc<Self>, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        (
            Arc::new(Self {
                state: state.clone(),
            }),
            state,
        )
    }
}

fn addr_of(dsn: &str) -> String {
    // postgres://user@host:port/db?... -> host:port
    dsn.split('@')
        .nth(1)
        .and_then(|s| s.split('/').next())
        .unwrap_or(dsn)
        .to_string()
}

#[async_trait]
impl Driver for MockDriver {
    async fn open(&self, dsn: &str) -> Result<Arc<dyn Connection>, DriverError> {
        let addr = addr_of(dsn);

        if self.state.refuse_connect.lock().unwrap().contains(&addr) {
            return Err(DriverError::connection(format!(
                "dial tcp {addr}: connection refused",
            )));
        }

        Ok(Arc::new(MockConnection {
            addr,
            state: self.state.clone(),
        }))
    }
}

struct MockConnection {
    addr: String,
    state: Arc<MockState>,
}

impl MockConnection {
    fn next_error(&self) -> Option<DriverError> {
        self.state
            .call_errors
            .lock()
            .unwrap()
            .get_mut(&self.addr)
            .and_then(|q| q.pop_front())
    }

    fn serve(&self) -> Result<(), DriverError> {
        self.state.served.lock().unwrap().push(self.addr.clone());
        match self.next_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn ping(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn exec(&self, _query: &str, _args: &[Value]) -> Result<ExecResult, DriverError> {
        self.serve()?;
        Ok(ExecResult::default())
    }

    async fn query(&self, _query: &str, _args: &[Value]) -> Result<Rows, DriverError> {
        self.serve()?;
        Ok(Rows::default())
    }

    async fn prepare(&self, _query: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn begin(&self, _opts: &TxOptions) -> Result<Box<dyn DriverTx>, DriverError> {
        let id = self
            .state
            .tx_counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        Ok(Box::new(MockTx {
            id,
            addr: self.addr.clone(),
            state: self.state.clone(),
        }))
    }

    async fn close(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

struct MockTx {
    id: u64,
    addr: String,
    state: Arc<MockState>,
}

impl MockTx {
    fn record(&self) {
        self.state
            .tx_statements
            .lock()
            .unwrap()
            .push((self.id, self.addr.clone()));
    }
}

#[async_trait]
impl DriverTx for MockTx {
    async fn exec(&self, _query: &str, _args: &[Value]) -> Result<ExecResult, DriverError> {
        self.record();
        Ok(ExecResult::default())
    }

    async fn query(&self, _query: &str, _args: &[Value]) -> Result<Rows, DriverError> {
        self.record();
        Ok(Rows::default())
    }

    async fn commit(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn rollback(&self) -> Result<(), DriverError> {
        Ok(())
    }
}
