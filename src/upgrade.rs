//! Protocol switches (`101 Switching Protocols`), e.g. WebSocket.
//!
//! Once the upstream agrees to switch, the 101 head is returned to the inbound
//! server and a background task splices the two raw streams together as soon
//! as the client side of the upgrade completes.

use crate::body::{empty, ProxyBody};
use crate::connection::BackendStream;
use crate::error::ProxyError;
use crate::wire::ResponseHead;
use hyper::header::UPGRADE;
use hyper::upgrade::OnUpgrade;
use hyper::{HeaderMap, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, trace};
use std::io::Cursor;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// Request extension carrying headers an outer layer wants on the 101 response.
#[derive(Debug, Clone, Default)]
pub struct UpgradeResponseHeaders(pub HeaderMap);

/// Token the upstream confirmed in its `Upgrade` header.
pub fn response_protocol(head: &ResponseHead) -> String {
    head.headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Accepts a 101 only if it confirms the protocol that was requested.
pub fn check_switch(requested: Option<&str>, head: &ResponseHead) -> Result<(), ProxyError> {
    let requested = requested.unwrap_or("");
    let confirmed = response_protocol(head);
    if !requested.eq_ignore_ascii_case(&confirmed) {
        return Err(ProxyError::protocol(format!(
            "backend tried to switch protocol {:?} when {:?} was requested",
            confirmed, requested
        )));
    }
    Ok(())
}

/// Bridges an accepted protocol switch.
pub struct UpgradeHandler {
    head: ResponseHead,
    backend: BackendStream,
    on_upgrade: OnUpgrade,
    cancel: CancellationToken,
}

impl UpgradeHandler {
    pub fn new(
        head: ResponseHead,
        backend: BackendStream,
        on_upgrade: OnUpgrade,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            head,
            backend,
            on_upgrade,
            cancel,
        }
    }

    /// Builds the 101 for the inbound server and starts the splice in the
    /// background. Headers already present in `extra` (set by layers wrapping
    /// the proxy) are merged over the upstream's.
    pub fn start(self, extra: Option<&HeaderMap>) -> Response<ProxyBody> {
        let mut headers = self.head.headers;
        if let Some(extra) = extra {
            for (name, value) in extra {
                headers.insert(name.clone(), value.clone());
            }
        }

        let mut response = Response::new(empty());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        *response.headers_mut() = headers;

        let backend = self.backend;
        let on_upgrade = self.on_upgrade;
        let cancel = self.cancel;
        tokio::spawn(async move {
            let upgraded = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("upgrade canceled before the client switched");
                    return;
                }
                upgraded = on_upgrade => upgraded,
            };
            match upgraded {
                Ok(upgraded) => splice(TokioIo::new(upgraded), backend, cancel).await,
                Err(e) => debug!("client upgrade failed: {}", e),
            }
        });

        response
    }
}

/// Copies bytes both ways until either direction finishes or `cancel` fires,
/// then drops both streams.
async fn splice<C>(client: C, backend: BackendStream, cancel: CancellationToken)
where
    C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let BackendStream {
        reader,
        buffered,
        mut writer,
    } = backend;
    let mut backend_read = Cursor::new(buffered.freeze()).chain(reader);

    tokio::select! {
        _ = cancel.cancelled() => trace!("upgraded connection canceled"),
        result = tokio::io::copy(&mut client_read, &mut writer) => match result {
            Ok(n) => trace!("client -> backend finished after {} bytes", n),
            Err(e) => debug!("client -> backend copy failed: {}", e),
        },
        result = tokio::io::copy(&mut backend_read, &mut client_write) => match result {
            Ok(n) => trace!("backend -> client finished after {} bytes", n),
            Err(e) => debug!("backend -> client copy failed: {}", e),
        },
    }
}
