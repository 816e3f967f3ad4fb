//! UDP and TCP serving layers plus the query handler bridging sockets to
//! the resolver chain.

pub mod config;
pub mod handler;
pub mod logging;
pub mod tcp;
pub mod udp;

pub use config::ServerConfig;
pub use handler::{HandleResult, QueryHandler, Transport};
pub use logging::QueryLogger;
pub use tcp::TcpServer;
pub use udp::UdpServer;
