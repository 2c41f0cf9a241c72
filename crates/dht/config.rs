use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

/// Tunables for a node. `Default` matches the protocol's standard
/// parameters; the `with_*` methods override individual knobs.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Bucket width and lookup result width.
    pub k: usize,
    /// Per-round lookup concurrency.
    pub alpha: usize,
    /// Per-RPC deadline inside a lookup round.
    pub round_timeout: Duration,
    /// Local UDP bind address.
    pub host: IpAddr,
    pub port: u16,
    /// Retention for buffered node/value/store replies.
    pub node_reply_expiry: Duration,
    /// Retention for expected ping replies.
    pub ping_reply_expiry: Duration,
    /// Request-handler concurrency.
    pub worker_pool_size: usize,
    /// Cadence of the background routing-table refresh lookups. The first
    /// refresh runs as soon as the node starts.
    pub refresh_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            round_timeout: Duration::from_secs(3),
            host: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 5000,
            node_reply_expiry: Duration::from_secs(60),
            ping_reply_expiry: Duration::from_secs(5),
            worker_pool_size: 10,
            refresh_interval: Duration::from_secs(30 * 60),
        }
    }
}

impl NodeConfig {
    pub fn with_host(self, host: IpAddr) -> Self {
        Self { host, ..self }
    }

    /// Port 0 binds an ephemeral port; the node reports the real one after
    /// start.
    pub fn with_port(self, port: u16) -> Self {
        Self { port, ..self }
    }

    pub fn with_k(self, k: usize) -> Self {
        Self { k, ..self }
    }

    pub fn with_alpha(self, alpha: usize) -> Self {
        Self { alpha, ..self }
    }

    pub fn with_round_timeout(self, round_timeout: Duration) -> Self {
        Self {
            round_timeout,
            ..self
        }
    }

    pub fn with_worker_pool_size(self, worker_pool_size: usize) -> Self {
        Self {
            worker_pool_size,
            ..self
        }
    }

    pub fn with_node_reply_expiry(self, node_reply_expiry: Duration) -> Self {
        Self {
            node_reply_expiry,
            ..self
        }
    }

    pub fn with_ping_reply_expiry(self, ping_reply_expiry: Duration) -> Self {
        Self {
            ping_reply_expiry,
            ..self
        }
    }

    pub fn with_refresh_interval(self, refresh_interval: Duration) -> Self {
        Self {
            refresh_interval,
            ..self
        }
    }
}
