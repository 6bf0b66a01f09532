//! Cluster configuration: database types, per-node config, DSN building and
//! the address-list grammar
//! (`host:port?priority=N&weight=M&read_timeout=T&write_timeout=T`, comma
//! separated for cluster-capable engines).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    #[default]
    Postgres,
    Cockroach,
    Clickhouse,
    Sqlite,
}

impl DbType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbType::Postgres => "postgres",
            DbType::Cockroach => "cockroach",
            DbType::Clickhouse => "clickhouse",
            DbType::Sqlite => "sqlite",
        }
    }

    /// Wire-protocol driver family; CockroachDB speaks postgres.
    pub fn driver_name(&self) -> &'static str {
        match self {
            DbType::Postgres | DbType::Cockroach => "postgres",
            DbType::Clickhouse => "clickhouse",
            DbType::Sqlite => "sqlite",
        }
    }

    /// Only CockroachDB accepts a comma-separated address list.
    pub fn supports_cluster(&self) -> bool {
        matches!(self, DbType::Cockroach)
    }

    pub(crate) fn bind_var(&self) -> crate::driver::BindVar {
        match self {
            DbType::Postgres | DbType::Cockroach => crate::driver::BindVar::Dollar,
            DbType::Clickhouse | DbType::Sqlite => crate::driver::BindVar::Question,
        }
    }
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate cluster configuration handed to `DB::new`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `host:port[?priority=N&weight=M&read_timeout=T&write_timeout=T]`,
    /// comma separated for cluster-capable types. Empty for SQLite, which
    /// connects to `database` directly.
    pub addr: String,
    pub user: String,
    pub database: String,
    pub cert_path: Option<String>,
    pub db_type: DbType,
    pub read_timeout: Option<String>,
    pub write_timeout: Option<String>,
    /// Extra DSN params merged into every node's connection string.
    pub params: BTreeMap<String, String>,

    /// Minimum number of live nodes the pool keeps connected; 0 means 1.
    pub active_count: u32,
    /// Whether selection may cross priority tiers once higher tiers are
    /// exhausted.
    pub use_lower_priority: bool,
}

/// Per-node identity and connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub addr: String,
    pub user: String,
    pub database: String,
    pub cert_path: Option<String>,
    pub db_type: DbType,
    pub read_timeout: Option<String>,
    pub write_timeout: Option<String>,
    /// Lower is preferred; 0 normalizes to 1.
    pub priority: u32,
    /// Selection weight within a priority tier; 0 normalizes to 1.
    pub weight: u32,
    pub params: BTreeMap<String, String>,
}

impl NodeConfig {
    /// Builds the driver connection string. Query-string keys are sorted, so
    /// the same config always produces the same DSN.
    pub fn dsn(&self) -> String {
        match self.db_type {
            DbType::Postgres | DbType::Cockroach => self.postgres_dsn(),
            DbType::Clickhouse => self.clickhouse_dsn(),
            DbType::Sqlite => self.sqlite_dsn(),
        }
    }

    fn postgres_dsn(&self) -> String {
        let mut params = self.params.clone();

        match &self.cert_path {
            Some(cert_path) => {
                params.insert("sslmode".to_string(), "verify-full".to_string());
                params.insert(
                    "sslcert".to_string(),
                    format!("{cert_path}/client.{}.crt", self.user),
                );
                params.insert(
                    "sslkey".to_string(),
                    format!("{cert_path}/client.{}.key", self.user),
                );
                params.insert("sslrootcert".to_string(), format!("{cert_path}/ca.crt"));
            }
            None => {
                params.insert("sslmode".to_string(), "disable".to_string());
            }
        }

        format!(
            "postgres://{}@{}/{}?{}",
            self.user,
            self.addr,
            self.database,
            encode_params(&params),
        )
    }

    fn clickhouse_dsn(&self) -> String {
        let mut params = self.params.clone();
        params.insert("username".to_string(), self.user.clone());

        if let Some(t) = &self.read_timeout {
            params.insert("read_timeout".to_string(), t.clone());
        }
        if let Some(t) = &self.write_timeout {
            params.insert("write_timeout".to_string(), t.clone());
        }

        format!(
            "clickhouse://{}/{}?{}",
            self.addr,
            self.database,
            encode_params(&params),
        )
    }

    fn sqlite_dsn(&self) -> String {
        if self.params.is_empty() {
            return self.database.clone();
        }

        format!("{}?{}", self.database, encode_params(&self.params))
    }
}

/// Encodes a params map as a query string with keys in lexicographic order.
pub fn encode_params(params: &BTreeMap<String, String>) -> String {
    let mut out = String::new();

    for (k, v) in params {
        if !out.is_empty() {
            out.push('&');
        }
        out.push_str(k);
        out.push('=');
        out.push_str(v);
    }

    out
}

/// Inverse of [`encode_params`]; re-encoding the result is byte-identical.
pub fn decode_params(query: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();

    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }

        match pair.split_once('=') {
            Some((k, v)) => out.insert(k.to_string(), v.to_string()),
            None => out.insert(pair.to_string(), String::new()),
        };
    }

    out
}

impl Config {
    /// Splits the address list into per-node configs, validating the whole
    /// aggregate. Fails on missing user/database, non-cluster types with
    /// multiple addresses, malformed priority/weight values, and duplicate
    /// addresses (case-insensitive).
    pub fn build_node_configs(&self) -> Result<Vec<NodeConfig>> {
        if self.db_type == DbType::Sqlite {
            return self.build_sqlite_config();
        }

        if self.user.is_empty() {
            return Err(Error::InvalidConfig("required user".to_string()));
        }
        if self.addr.trim().is_empty() {
            return Err(Error::InvalidConfig("required addr".to_string()));
        }

        let addrs: Vec<&str> = self
            .addr
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .collect();

        if addrs.len() > 1 && !self.db_type.supports_cluster() {
            return Err(Error::InvalidConfig(format!(
                "multiple databases not supported for {}",
                self.db_type,
            )));
        }

        let mut configs: Vec<NodeConfig> = Vec::with_capacity(addrs.len());

        for addr in addrs {
            let config = self.parse_addr(addr)?;

            if configs
                .iter()
                .any(|c| c.addr.eq_ignore_ascii_case(&config.addr))
            {
                return Err(Error::AddrAlreadyExists(config.addr));
            }

            configs.push(config);
        }

        Ok(configs)
    }

    fn build_sqlite_config(&self) -> Result<Vec<NodeConfig>> {
        if self.database.is_empty() {
            return Err(Error::InvalidConfig("required database".to_string()));
        }

        Ok(vec![NodeConfig {
            addr: self.database.clone(),
            user: self.user.clone(),
            database: self.database.clone(),
            cert_path: None,
            db_type: DbType::Sqlite,
            read_timeout: self.read_timeout.clone(),
            write_timeout: self.write_timeout.clone(),
            priority: 1,
            weight: 1,
            params: self.params.clone(),
        }])
    }

    fn parse_addr(&self, addr: &str) -> Result<NodeConfig> {
        let (host, query) = match addr.split_once('?') {
            Some((host, query)) => (host, query),
            None => (addr, ""),
        };

        let mut extra = decode_params(query);

        let priority = take_uint(&mut extra, "priority")?;
        let weight = take_uint(&mut extra, "weight")?;
        let read_timeout = extra.remove("read_timeout").or_else(|| self.read_timeout.clone());
        let write_timeout = extra.remove("write_timeout").or_else(|| self.write_timeout.clone());

        // Unrecognized fragment keys become DSN params for this node.
        let mut params = self.params.clone();
        params.extend(extra);

        Ok(NodeConfig {
            addr: host.to_string(),
            user: self.user.clone(),
            database: self.database.clone(),
            cert_path: self.cert_path.clone(),
            db_type: self.db_type,
            read_timeout,
            write_timeout,
            priority: priority.max(1),
            weight: weight.max(1),
            params,
        })
    }

    /// DSN of the first configured node.
    pub fn dsn(&self) -> Result<String> {
        let configs = self.build_node_configs()?;

        match configs.first() {
            Some(config) => Ok(config.dsn()),
            None => Err(Error::InvalidConfig("empty addr".to_string())),
        }
    }
}

fn take_uint(params: &mut BTreeMap<String, String>, key: &str) -> Result<u32> {
    let Some(raw) = params.remove(key) else {
        return Ok(0);
    };

    raw.parse::<u32>()
        .map_err(|e| Error::InvalidConfig(format!("parse {key} value '{raw}': {e}")))
}
