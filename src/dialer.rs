//! Opens raw connections to an upstream, directly or through a forward proxy.
//!
//! | target | proxy            | connection                                |
//! |--------|------------------|-------------------------------------------|
//! | any    | none             | TCP, then TLS for https targets           |
//! | http   | http             | TCP to the proxy, absolute-form requests  |
//! | https  | http / https     | CONNECT tunnel, then TLS to the target    |
//! | http   | https            | TLS to the proxy, CONNECT tunnel          |
//! | any    | socks5 / socks5h | SOCKS5 handshake, then TLS for https      |

use crate::connection::BoxedIo;
use crate::error::ProxyError;
use crate::pool::{DialFn, DialFuture};
use crate::proxy_env::basic_auth;
use crate::wire;
use bytes::BytesMut;
use hyper::header::HeaderValue;
use hyper::StatusCode;
use log::{debug, trace};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::Socks5Stream;
use url::Url;

/// Upper bound for reading the proxy's answer to CONNECT.
const CONNECT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_RESPONSE_MAX_BYTES: usize = 64 * 1024;
const DEFAULT_SOCKS_PORT: u16 = 1080;

#[derive(Clone)]
pub struct DialerConfig {
    pub host: String,
    pub port: u16,
    pub dial_timeout: Duration,
    pub keep_alive: Option<Duration>,
    /// Whether the target leg speaks TLS.
    pub target_tls: bool,
    /// Used for the target leg and for `https://` proxies.
    pub tls_config: Option<Arc<ClientConfig>>,
    /// SNI override for the target leg.
    pub server_name: Option<String>,
    pub proxy: Option<Url>,
}

impl DialerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            dial_timeout: Duration::from_secs(30),
            keep_alive: Some(Duration::from_secs(15)),
            target_tls: false,
            tls_config: None,
            server_name: None,
            proxy: None,
        }
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialMode {
    Direct,
    /// Plain HTTP forward proxy; requests carry absolute-form targets.
    HttpProxy(Url),
    Connect(Url),
    Socks5(Url),
}

pub struct Dialer {
    config: DialerConfig,
    mode: DialMode,
}

fn host_port(url: &Url, default_port: u16) -> io::Result<(String, u16)> {
    let host = url
        .host_str()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "proxy URL has no host"))?;
    Ok((host.to_string(), url.port_or_known_default().unwrap_or(default_port)))
}

fn unbracket(host: &str) -> &str {
    host.trim_start_matches('[').trim_end_matches(']')
}

async fn tcp_connect(host: &str, port: u16, keep_alive: Option<Duration>) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(format!("{}:{}", host, port)).await?;
    stream.set_nodelay(true)?;
    if let Some(interval) = keep_alive {
        let keepalive = TcpKeepalive::new().with_time(interval).with_interval(interval);
        SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
    }
    Ok(stream)
}

async fn tls_connect<S>(config: Arc<ClientConfig>, server_name: &str, stream: S) -> io::Result<BoxedIo>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let name = ServerName::try_from(unbracket(server_name).to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid server name {}: {}", server_name, e)))?;
    let tls = TlsConnector::from(config).connect(name, stream).await?;
    Ok(Box::new(tls))
}

fn socks_error(e: tokio_socks::Error) -> io::Error {
    match e {
        tokio_socks::Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::ConnectionRefused, other.to_string()),
    }
}

/// Issues `CONNECT authority` on `stream` and waits for a 200.
///
/// A non-success answer fails with its reason phrase; the response body is
/// never read.
pub async fn connect_tunnel<S>(stream: &mut S, authority: &str, auth: Option<&HeaderValue>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority).into_bytes();
    if let Some(auth) = auth {
        request.extend_from_slice(b"Proxy-Authorization: ");
        request.extend_from_slice(auth.as_bytes());
        request.extend_from_slice(b"\r\n");
    }
    request.extend_from_slice(b"\r\n");
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(1024);
    let head = tokio::time::timeout(
        CONNECT_RESPONSE_TIMEOUT,
        wire::read_response_head(stream, &mut buf, CONNECT_RESPONSE_MAX_BYTES),
    )
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "timed out waiting for CONNECT response"))??;

    if head.status != StatusCode::OK {
        let message = if head.reason.is_empty() {
            "unknown status code".to_string()
        } else {
            head.reason
        };
        return Err(io::Error::other(message));
    }
    Ok(())
}

impl Dialer {
    pub fn new(config: DialerConfig) -> Result<Self, ProxyError> {
        let mode = match &config.proxy {
            None => DialMode::Direct,
            Some(proxy) => match proxy.scheme() {
                "http" if !config.target_tls => DialMode::HttpProxy(proxy.clone()),
                "http" | "https" => DialMode::Connect(proxy.clone()),
                "socks5" | "socks5h" => DialMode::Socks5(proxy.clone()),
                other => {
                    return Err(ProxyError::Config(format!("unsupported proxy scheme: {}", other)));
                }
            },
        };

        let proxy_tls = matches!(&mode, DialMode::Connect(p) if p.scheme() == "https");
        if (config.target_tls || proxy_tls) && config.tls_config.is_none() {
            return Err(ProxyError::Config(format!(
                "TLS configuration required to reach {}",
                config.authority()
            )));
        }

        Ok(Self { config, mode })
    }

    pub fn mode(&self) -> &DialMode {
        &self.mode
    }

    /// Credentials the request writer must add in [`DialMode::HttpProxy`].
    pub fn proxy_authorization(&self) -> Option<HeaderValue> {
        match &self.mode {
            DialMode::HttpProxy(proxy) => basic_auth(proxy),
            _ => None,
        }
    }

    pub fn uses_absolute_form(&self) -> bool {
        matches!(self.mode, DialMode::HttpProxy(_))
    }

    pub async fn dial(&self) -> Result<BoxedIo, ProxyError> {
        let authority = self.config.authority();
        match tokio::time::timeout(self.config.dial_timeout, self.dial_inner()).await {
            Ok(Ok(io)) => Ok(io),
            Ok(Err(e)) => Err(ProxyError::dial(authority, e)),
            Err(_) => Err(ProxyError::dial(
                authority,
                io::Error::new(io::ErrorKind::TimedOut, "dial timeout"),
            )),
        }
    }

    pub fn into_dial_fn(self) -> DialFn {
        let dialer = Arc::new(self);
        Arc::new(move || -> DialFuture {
            let dialer = Arc::clone(&dialer);
            Box::pin(async move { dialer.dial().await })
        })
    }

    fn target_server_name(&self) -> &str {
        self.config.server_name.as_deref().unwrap_or(&self.config.host)
    }

    async fn secure_target<S>(&self, stream: S) -> io::Result<BoxedIo>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        match (&self.config.tls_config, self.config.target_tls) {
            (Some(tls), true) => tls_connect(Arc::clone(tls), self.target_server_name(), stream).await,
            _ => Ok(Box::new(stream)),
        }
    }

    async fn dial_inner(&self) -> io::Result<BoxedIo> {
        let config = &self.config;
        match &self.mode {
            DialMode::Direct => {
                let stream = tcp_connect(&config.host, config.port, config.keep_alive).await?;
                self.secure_target(stream).await
            }
            DialMode::HttpProxy(proxy) => {
                let (host, port) = host_port(proxy, 80)?;
                trace!("dialing {} via http proxy {}:{}", config.authority(), host, port);
                let stream = tcp_connect(&host, port, config.keep_alive).await?;
                Ok(Box::new(stream))
            }
            DialMode::Connect(proxy) => {
                let (host, port) = host_port(proxy, 80)?;
                trace!("dialing {} via CONNECT to {}:{}", config.authority(), host, port);
                let stream = tcp_connect(&host, port, config.keep_alive).await?;
                let mut stream: BoxedIo = match (&config.tls_config, proxy.scheme()) {
                    (Some(tls), "https") => tls_connect(Arc::clone(tls), &host, stream).await?,
                    _ => Box::new(stream),
                };
                connect_tunnel(&mut stream, &config.authority(), basic_auth(proxy).as_ref()).await?;
                debug!("CONNECT tunnel to {} established", config.authority());
                self.secure_target(stream).await
            }
            DialMode::Socks5(proxy) => {
                let (host, port) = host_port(proxy, DEFAULT_SOCKS_PORT)?;
                trace!("dialing {} via socks5 {}:{}", config.authority(), host, port);
                let socket = tcp_connect(&host, port, config.keep_alive).await?;
                let target = (unbracket(&config.host), config.port);
                let stream = if proxy.username().is_empty() {
                    Socks5Stream::connect_with_socket(socket, target).await
                } else {
                    let user = percent_encoding::percent_decode_str(proxy.username()).decode_utf8_lossy();
                    let password = proxy
                        .password()
                        .map(|p| percent_encoding::percent_decode_str(p).decode_utf8_lossy().into_owned())
                        .unwrap_or_default();
                    Socks5Stream::connect_with_password_and_socket(socket, target, &user, &password).await
                }
                .map_err(socks_error)?;
                self.secure_target(stream).await
            }
        }
    }
}
