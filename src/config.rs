//! Configuration: file plus environment overrides, deserialized into plain
//! structs with defaults that work out of the box.

use std::collections::HashMap;
use std::net::SocketAddr;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{RpcError, RpcResult};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Listen address for the server, `host:port`.
    pub listen: String,
    /// Number of I/O worker reactors.
    pub io_threads: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:12345".to_owned(),
            io_threads: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `rpcio=debug`.
    pub level: String,
    /// Directory for rolling log files; empty logs to stdout only.
    pub dir: String,
    pub file_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            dir: String::new(),
            file_prefix: "rpcio".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub network: NetworkConfig,
    pub log: LogConfig,
    /// Named peers, route name to `host:port`.
    pub routes: HashMap<String, String>,
}

impl RpcConfig {
    /// Load from a config file (extension inferred), then apply environment
    /// overrides of the form `RPCIO_NETWORK__LISTEN`.
    pub fn from_file(path: &str) -> RpcResult<Self> {
        let cfg = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("RPCIO").separator("__"))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    /// Parse the configured routes into a resolvable table.
    pub fn route_table(&self) -> RpcResult<RouteTable> {
        let mut table = RouteTable::default();
        for (name, addr) in &self.routes {
            let addr: SocketAddr = addr
                .parse()
                .map_err(|_| RpcError::InvalidAddress(format!("{} -> {}", name, addr)))?;
            table.insert(name.clone(), addr);
        }
        Ok(table)
    }
}

/// Maps peer names to socket addresses. A peer string that parses as a
/// literal `host:port` resolves without a table entry.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: HashMap<String, SocketAddr>,
}

impl RouteTable {
    pub fn insert(&mut self, name: impl Into<String>, addr: SocketAddr) {
        self.routes.insert(name.into(), addr);
    }

    pub fn resolve(&self, peer: &str) -> RpcResult<SocketAddr> {
        if let Ok(addr) = peer.parse() {
            return Ok(addr);
        }
        self.routes
            .get(peer)
            .copied()
            .ok_or_else(|| RpcError::InvalidAddress(peer.to_owned()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = RpcConfig::default();
        assert_eq!(cfg.network.listen, "127.0.0.1:12345");
        assert_eq!(cfg.network.io_threads, 2);
        assert_eq!(cfg.log.level, "info");
        assert!(cfg.routes.is_empty());
    }

    #[test]
    fn test_route_table_resolution() {
        let mut cfg = RpcConfig::default();
        cfg.routes
            .insert("order".to_owned(), "127.0.0.1:9000".to_owned());
        let table = cfg.route_table().unwrap();
        assert_eq!(
            table.resolve("order").unwrap(),
            "127.0.0.1:9000".parse().unwrap()
        );
        // literal addresses bypass the table
        assert_eq!(
            table.resolve("10.0.0.1:80").unwrap(),
            "10.0.0.1:80".parse().unwrap()
        );
        assert!(table.resolve("missing").is_err());
    }

    #[test]
    fn test_bad_route_entry_rejected() {
        let mut cfg = RpcConfig::default();
        cfg.routes
            .insert("broken".to_owned(), "not-an-addr".to_owned());
        assert!(cfg.route_table().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join("rpcio-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("rpcio.toml");
        std::fs::write(
            &path,
            "[network]\nlisten = \"0.0.0.0:7000\"\nio_threads = 4\n\n[routes]\norder = \"127.0.0.1:7001\"\n",
        )
        .unwrap();
        let cfg = RpcConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.network.listen, "0.0.0.0:7000");
        assert_eq!(cfg.network.io_threads, 4);
        assert_eq!(cfg.routes["order"], "127.0.0.1:7001");
        assert_eq!(cfg.log.level, "info");
    }
}
