//! Hands out [`ReverseProxy`] values backed by shared, cached connection pools.

use crate::buffers::BufferPool;
use crate::config::TransportSettings;
use crate::dialer::{Dialer, DialerConfig};
use crate::error::ProxyError;
use crate::outbound::RewriteOptions;
use crate::pool::{ConnectionPool, DEFAULT_MAX_RESPONSE_HEADER_BYTES};
use crate::proxy_env::ProxyResolver;
use crate::reverse_proxy::ReverseProxy;
use crate::transport::TransportManager;
use hyper::header::HeaderValue;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use url::Url;

/// Pool plus what request writers need to know about how it dials.
struct TargetEntry {
    pool: Arc<ConnectionPool>,
    absolute_form: bool,
    proxy_authorization: Option<HeaderValue>,
}

type PoolsByTarget = HashMap<String, Arc<TargetEntry>>;

pub struct ProxyBuilder {
    debug: bool,
    transport_manager: Arc<dyn TransportManager>,
    proxy_resolver: Arc<dyn ProxyResolver>,
    buffers: Arc<BufferPool>,
    max_response_header_bytes: usize,
    configs: RwLock<HashMap<String, TransportSettings>>,
    pools: RwLock<HashMap<String, PoolsByTarget>>,
}

/// `scheme://host:port`; TLS and plain connections to one host never share a pool.
fn pool_key(target: &Url) -> Result<String, ProxyError> {
    let host = target
        .host_str()
        .ok_or_else(|| ProxyError::Config(format!("target has no host: {}", target)))?;
    let port = target
        .port_or_known_default()
        .ok_or_else(|| ProxyError::Config(format!("target has no port: {}", target)))?;
    Ok(format!("{}://{}:{}", target.scheme(), host, port))
}

fn target_tls(target: &Url) -> Result<bool, ProxyError> {
    match target.scheme() {
        "http" | "ws" => Ok(false),
        "https" | "wss" => Ok(true),
        other => Err(ProxyError::Config(format!("unsupported target scheme: {}", other))),
    }
}

fn close_all(name: &str, pools: PoolsByTarget) {
    for (target, entry) in pools {
        debug!("closing pool {} for transport '{}'", target, name);
        entry.pool.close();
    }
}

impl ProxyBuilder {
    pub fn new(
        transport_manager: Arc<dyn TransportManager>,
        proxy_resolver: Arc<dyn ProxyResolver>,
        debug: bool,
    ) -> Self {
        Self {
            debug,
            transport_manager,
            proxy_resolver,
            buffers: Arc::new(BufferPool::default()),
            max_response_header_bytes: DEFAULT_MAX_RESPONSE_HEADER_BYTES,
            configs: RwLock::new(HashMap::new()),
            pools: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_max_response_header_bytes(mut self, max: usize) -> Self {
        self.max_response_header_bytes = max;
        self
    }

    /// Installs a new settings snapshot. Pools of transports that disappeared
    /// or whose settings changed are closed; everything else stays warm.
    pub fn update(&self, new_configs: &HashMap<String, TransportSettings>) {
        let (Ok(mut configs), Ok(mut pools)) = (self.configs.write(), self.pools.write()) else {
            return;
        };

        let stale: Vec<String> = pools
            .keys()
            .filter(|name| match (configs.get(*name), new_configs.get(*name)) {
                (_, None) => true,
                (Some(old), Some(new)) => old != new,
                (None, Some(_)) => false,
            })
            .cloned()
            .collect();

        for name in stale {
            if let Some(group) = pools.remove(&name) {
                info!("transport '{}' changed, dropping {} pool(s)", name, group.len());
                close_all(&name, group);
            }
        }

        *configs = new_configs.clone();
    }

    /// Number of live pools for a transport.
    pub fn pool_count(&self, config_name: &str) -> usize {
        self.pools
            .read()
            .ok()
            .and_then(|pools| pools.get(config_name).map(HashMap::len))
            .unwrap_or(0)
    }

    pub fn build(
        &self,
        config_name: &str,
        target: &Url,
        pass_host_header: bool,
        preserve_path: bool,
    ) -> Result<ReverseProxy, ProxyError> {
        let settings = self.transport_manager.get(config_name)?;
        let entry = self.target_entry(config_name, target, &settings)?;

        let rewrite = RewriteOptions {
            target: target.clone(),
            pass_host_header: pass_host_header || settings.pass_host_header,
            preserve_path: preserve_path || settings.preserve_path,
            debug: self.debug,
            disable_upgrade: settings.disable_upgrade,
            proxy_authorization: entry.proxy_authorization.clone(),
        };

        Ok(ReverseProxy::new(Arc::clone(&entry.pool), rewrite)
            .with_absolute_form(entry.absolute_form)
            .with_response_header_timeout(settings.response_header_timeout())
            .with_max_replays(settings.max_replays)
            .with_buffers(Arc::clone(&self.buffers)))
    }

    fn target_entry(
        &self,
        config_name: &str,
        target: &Url,
        settings: &TransportSettings,
    ) -> Result<Arc<TargetEntry>, ProxyError> {
        let key = pool_key(target)?;
        if let Some(entry) = self
            .pools
            .read()
            .ok()
            .and_then(|pools| pools.get(config_name).and_then(|g| g.get(&key)).cloned())
        {
            return Ok(entry);
        }

        let mut pools = self
            .pools
            .write()
            .map_err(|_| ProxyError::Config("pool registry lock poisoned".to_string()))?;
        let group = pools.entry(config_name.to_string()).or_default();
        if let Some(entry) = group.get(&key) {
            return Ok(Arc::clone(entry));
        }

        let entry = Arc::new(self.new_target_entry(config_name, target, &key, settings)?);
        group.insert(key, Arc::clone(&entry));
        Ok(entry)
    }

    fn new_target_entry(
        &self,
        config_name: &str,
        target: &Url,
        key: &str,
        settings: &TransportSettings,
    ) -> Result<TargetEntry, ProxyError> {
        let target_tls = target_tls(target)?;
        let proxy = self.proxy_resolver.proxy_for(target);
        let needs_tls = target_tls || proxy.as_ref().is_some_and(|p| p.scheme() == "https");

        let mut config = DialerConfig::new(
            target.host_str().unwrap_or_default(),
            target.port_or_known_default().unwrap_or(80),
        );
        config.dial_timeout = settings.dial_timeout();
        config.keep_alive = settings.keep_alive();
        config.target_tls = target_tls;
        config.server_name = settings.server_name.clone();
        config.proxy = proxy;
        if needs_tls {
            config.tls_config = Some(self.transport_manager.get_tls_config(config_name)?);
        }

        let dialer = Dialer::new(config)?;
        let absolute_form = dialer.uses_absolute_form();
        let proxy_authorization = dialer.proxy_authorization();
        debug!("new pool {} for transport '{}' ({:?})", key, config_name, dialer.mode());

        let pool = ConnectionPool::with_max_header_bytes(
            key,
            dialer.into_dial_fn(),
            settings.max_idle_conns_per_host,
            settings.idle_timeout(),
            self.max_response_header_bytes,
        );

        Ok(TargetEntry {
            pool: Arc::new(pool),
            absolute_form,
            proxy_authorization,
        })
    }
}

impl Drop for ProxyBuilder {
    fn drop(&mut self) {
        if let Ok(mut pools) = self.pools.write() {
            for (name, group) in pools.drain() {
                close_all(&name, group);
            }
        }
    }
}
