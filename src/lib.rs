pub mod body;
pub mod buffers;
pub mod builder;
pub mod config;
pub mod connection;
pub mod dialer;
pub mod error;
pub mod logging;
pub mod outbound;
pub mod pool;
pub mod proxy_env;
pub mod reverse_proxy;
pub mod transport;
pub mod upgrade;
pub mod wire;

pub use builder::ProxyBuilder;
pub use config::{EngineConfig, TransportSettings};
pub use error::ProxyError;
pub use outbound::{RemoteAddr, SuppressForwardedFor};
pub use pool::{ConnectionPool, DialFn, PoolStats};
pub use reverse_proxy::ReverseProxy;
