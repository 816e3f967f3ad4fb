use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Sockets (and TCP listeners) to open. Zero means one per core.
    #[serde(default)]
    pub sockets_per_transport: usize,
    #[serde(default = "default_workers_per_socket")]
    pub workers_per_socket: usize,
    /// Per-query deadline before a SERVFAIL is synthesized.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    /// How long shutdown waits for workers to drain.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_max_tcp_per_ip")]
    pub max_tcp_connections_per_ip: usize,
    #[serde(default = "default_max_tcp_queries")]
    pub max_queries_per_tcp_conn: usize,
    #[serde(default = "default_tcp_read_timeout_ms")]
    pub tcp_read_timeout_ms: u64,
    #[serde(default = "default_tcp_idle_timeout_ms")]
    pub tcp_idle_timeout_ms: u64,
    /// JSONL query log destination; empty disables query logging.
    #[serde(default)]
    pub query_log_path: String,
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    53
}
fn default_workers_per_socket() -> usize {
    1024
}
fn default_query_timeout_ms() -> u64 {
    4000
}
fn default_shutdown_grace_ms() -> u64 {
    5000
}
fn default_max_tcp_per_ip() -> usize {
    10
}
fn default_max_tcp_queries() -> usize {
    100
}
fn default_tcp_read_timeout_ms() -> u64 {
    10_000
}
fn default_tcp_idle_timeout_ms() -> u64 {
    30_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

impl ServerConfig {
    /// Effective socket/listener count.
    pub fn socket_count(&self) -> usize {
        if self.sockets_per_transport > 0 {
            self.sockets_per_transport
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}
