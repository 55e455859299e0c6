use crate::config::TransportSettings;
use crate::error::ProxyError;
use rustls::{ClientConfig, RootCertStore};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, RwLock};

/// Source of named transport settings and the TLS client configs that go with them.
pub trait TransportManager: Send + Sync {
    fn get(&self, name: &str) -> Result<TransportSettings, ProxyError>;

    fn get_tls_config(&self, name: &str) -> Result<Arc<ClientConfig>, ProxyError>;
}

/// Web PKI roots plus, optionally, the certificates from a PEM bundle.
pub fn client_config(root_ca_file: Option<&Path>) -> Result<ClientConfig, ProxyError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = root_ca_file {
        let file = File::open(path)
            .map_err(|e| ProxyError::Tls(format!("Failed to open root CA file {}: {}", path.display(), e)))?;
        let mut reader = BufReader::new(file);
        let mut added = 0;
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| ProxyError::Tls(format!("Failed to parse certificate: {}", e)))?;
            roots
                .add(cert)
                .map_err(|e| ProxyError::Tls(format!("Invalid root certificate: {}", e)))?;
            added += 1;
        }
        if added == 0 {
            return Err(ProxyError::Tls(format!("No certificates found in {}", path.display())));
        }
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Settings held in memory, typically loaded from the engine config file.
pub struct StaticTransportManager {
    settings: RwLock<HashMap<String, TransportSettings>>,
    tls_cache: RwLock<HashMap<String, Arc<ClientConfig>>>,
}

impl StaticTransportManager {
    pub fn new(settings: HashMap<String, TransportSettings>) -> Self {
        Self {
            settings: RwLock::new(settings),
            tls_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Replaces all settings and forgets cached TLS configs.
    pub fn replace(&self, settings: HashMap<String, TransportSettings>) {
        if let Ok(mut current) = self.settings.write() {
            *current = settings;
        }
        if let Ok(mut cache) = self.tls_cache.write() {
            cache.clear();
        }
    }

    pub fn snapshot(&self) -> HashMap<String, TransportSettings> {
        self.settings.read().map(|s| s.clone()).unwrap_or_default()
    }
}

impl TransportManager for StaticTransportManager {
    fn get(&self, name: &str) -> Result<TransportSettings, ProxyError> {
        let settings = self
            .settings
            .read()
            .map_err(|_| ProxyError::Config("transport settings lock poisoned".to_string()))?;
        settings
            .get(name)
            .cloned()
            .ok_or_else(|| ProxyError::Config(format!("unknown transport: {}", name)))
    }

    fn get_tls_config(&self, name: &str) -> Result<Arc<ClientConfig>, ProxyError> {
        if let Some(config) = self.tls_cache.read().ok().and_then(|c| c.get(name).cloned()) {
            return Ok(config);
        }

        let settings = self.get(name)?;
        let config = Arc::new(client_config(settings.root_ca_file.as_deref())?);
        if let Ok(mut cache) = self.tls_cache.write() {
            cache.insert(name.to_string(), Arc::clone(&config));
        }
        Ok(config)
    }
}
