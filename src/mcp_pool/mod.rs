// ABOUTME: MCP server pooling for sharing MCP servers across sessions
//
// One supervised process per MCP server, shared by every client session.
// Stdio servers are multiplexed over a Unix domain socket by a SocketProxy;
// HTTP servers are only supervised, since clients reach their URL directly.
//
// Key components:
// - status: lifecycle state machine shared by proxies and HTTP servers
// - process_supervisor: spawn, process-group signalling and exit observation
// - request_router: JSON-RPC id correlation between clients and the server
// - client_manager: client sessions with a connection cap
// - socket_proxy: one stdio server exposed on a Unix socket
// - discovery: socket naming, liveness dials and sockets owned by other instances
// - restart_policy: rate limiting and permanent-failure fencing
// - pool / health: named socket proxies with a periodic health sweep
// - http_server / http_pool: the HTTP-transport counterparts
// - bridge: reconnecting stdio <-> socket client
// - events: aggregated high-frequency client events

pub mod bridge;
pub mod client_manager;
pub mod config;
pub mod discovery;
pub mod events;
pub mod health;
pub mod http_pool;
pub mod http_server;
pub mod pool;
pub mod process_supervisor;
pub mod request_router;
pub mod restart_policy;
pub mod socket_proxy;
pub mod status;

pub use bridge::{BridgeError, BridgeExit, BridgeOptions, SocketBridge};
pub use config::PoolConfig;
pub use discovery::{DiscoveredSocket, SocketDiscovery};
pub use events::{EventAggregator, EventSink};
pub use health::HealthReport;
pub use http_pool::{HttpPool, HttpServerInfo};
pub use http_server::{HttpServer, HttpServerError, HttpServerSpec};
pub use pool::{Availability, PoolError, PoolResult, ProxyInfo, SocketPool};
pub use process_supervisor::LaunchSpec;
pub use restart_policy::{RestartPolicy, RestartStats};
pub use socket_proxy::{ProxyContext, ProxyError, SocketProxy};
pub use status::ServerStatus;
