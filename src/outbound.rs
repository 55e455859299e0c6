//! Turns an inbound request head into the head sent upstream.

use crate::error::ProxyError;
use crate::wire::header_has_token;
use hyper::header::{HeaderName, HeaderValue, CONNECTION, HOST, PROXY_AUTHORIZATION, TE, UPGRADE};
use hyper::http::request::Parts;
use hyper::{HeaderMap, Method};
use percent_encoding::percent_decode_str;
use url::Url;

/// Added to every outbound request when the builder runs in debug mode.
pub const DEBUG_HEADER: &str = "x-bifrost-fast-proxy";

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Connection-scoped headers never forwarded upstream.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Peer address of the inbound connection, set as a request extension by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddr(pub String);

/// Request extension that stops the proxy from writing `X-Forwarded-For`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SuppressForwardedFor;

#[derive(Debug, Clone)]
pub struct RewriteOptions {
    pub target: Url,
    pub pass_host_header: bool,
    pub preserve_path: bool,
    pub debug: bool,
    /// Forward upgrade requests as ordinary requests.
    pub disable_upgrade: bool,
    /// Sent when the upstream is reached through a plain HTTP forward proxy.
    pub proxy_authorization: Option<HeaderValue>,
}

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub scheme: String,
    /// `host[:port]` of the target.
    pub authority: String,
    /// Decoded path.
    pub path: String,
    /// Path as written on the wire.
    pub raw_path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    /// Protocol the client asked to switch to.
    pub upgrade: Option<String>,
}

impl OutboundRequest {
    /// Origin form (`/path?query`) or, for plain forward proxies, absolute form.
    pub fn request_target(&self, absolute_form: bool) -> String {
        let mut target = String::new();
        if absolute_form {
            target.push_str(&self.scheme);
            target.push_str("://");
            target.push_str(&self.authority);
        }
        if self.raw_path.is_empty() {
            target.push('/');
        } else {
            target.push_str(&self.raw_path);
        }
        if let Some(query) = &self.query {
            target.push('?');
            target.push_str(query);
        }
        target
    }

    pub fn is_websocket(&self) -> bool {
        self.upgrade
            .as_deref()
            .is_some_and(|p| p.eq_ignore_ascii_case("websocket"))
    }
}

/// Joins two URL paths with exactly one slash between them.
pub fn join_url_path(a: &str, b: &str) -> String {
    if a.is_empty() {
        return b.to_string();
    }
    if b.is_empty() {
        return a.to_string();
    }
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{}/{}", a, b),
        _ => format!("{}{}", a, b),
    }
}

/// `host:port` -> `host`, also unwrapping bracketed IPv6 literals.
pub fn split_host_port(addr: &str) -> Option<&str> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, port) = rest.split_once("]:")?;
        return (!port.is_empty()).then_some(host);
    }
    let (host, port) = addr.rsplit_once(':')?;
    if host.contains(':') || port.is_empty() {
        return None;
    }
    Some(host)
}

/// Protocol named by `Upgrade` when `Connection` carries the `upgrade` token.
pub fn requested_upgrade(headers: &HeaderMap) -> Result<Option<String>, ProxyError> {
    if !header_has_token(headers, &CONNECTION, "upgrade") {
        return Ok(None);
    }
    let Some(value) = headers.get(UPGRADE) else {
        return Ok(None);
    };
    let bytes = value.as_bytes();
    if bytes.is_empty() || !bytes.iter().all(|b| (0x20..=0x7e).contains(b)) {
        return Err(ProxyError::protocol(format!(
            "client tried to switch to invalid protocol {:?}",
            String::from_utf8_lossy(bytes)
        )));
    }
    Ok(Some(String::from_utf8_lossy(bytes).into_owned()))
}

/// Removes headers named in `Connection`, then the fixed hop-by-hop set.
pub fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|t| HeaderName::from_bytes(t.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn target_authority(target: &Url) -> String {
    let host = target.host_str().unwrap_or("");
    match target.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

fn inbound_host(parts: &Parts) -> Option<HeaderValue> {
    parts.headers.get(HOST).cloned().or_else(|| {
        parts
            .uri
            .authority()
            .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
    })
}

fn decode_path(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

pub fn build_outbound(parts: &Parts, opts: &RewriteOptions) -> Result<OutboundRequest, ProxyError> {
    let upgrade = if opts.disable_upgrade {
        None
    } else {
        requested_upgrade(&parts.headers)?
    };

    let mut headers = parts.headers.clone();
    remove_hop_by_hop(&mut headers);
    if header_has_token(&parts.headers, &TE, "trailers") {
        headers.insert(TE, HeaderValue::from_static("trailers"));
    }

    if let Some(auth) = &opts.proxy_authorization {
        headers.insert(PROXY_AUTHORIZATION, auth.clone());
    }
    if opts.debug {
        headers.insert(DEBUG_HEADER, HeaderValue::from_static("true"));
    }
    if let Some(protocol) = &upgrade {
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        if let Ok(value) = HeaderValue::from_str(protocol) {
            headers.insert(UPGRADE, value);
        }
    }

    let inbound_raw = parts.uri.path();
    let (path, raw_path) = if opts.preserve_path {
        let target_raw = opts.target.path();
        (
            join_url_path(&decode_path(target_raw), &decode_path(inbound_raw)),
            join_url_path(target_raw, inbound_raw),
        )
    } else {
        (decode_path(inbound_raw), inbound_raw.to_string())
    };
    let query = parts.uri.query().map(|q| q.replace(';', "&"));

    if parts.extensions.get::<SuppressForwardedFor>().is_none() {
        if let Some(client_ip) = parts
            .extensions
            .get::<RemoteAddr>()
            .and_then(|addr| split_host_port(&addr.0))
        {
            let prior: Vec<&str> = headers
                .get_all(X_FORWARDED_FOR)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect();
            let value = if prior.is_empty() {
                client_ip.to_string()
            } else {
                format!("{}, {}", prior.join(", "), client_ip)
            };
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }
    }

    let authority = target_authority(&opts.target);
    let host = if opts.pass_host_header {
        inbound_host(parts)
    } else {
        HeaderValue::from_str(&authority).ok()
    };
    match host {
        Some(host) => {
            headers.insert(HOST, host);
        }
        None => {
            return Err(ProxyError::Http("request has no host".to_string()));
        }
    }

    let scheme = match opts.target.scheme() {
        "wss" => "https",
        "ws" => "http",
        other => other,
    };

    Ok(OutboundRequest {
        method: parts.method.clone(),
        scheme: scheme.to_string(),
        authority,
        path,
        raw_path,
        query,
        headers,
        upgrade,
    })
}
