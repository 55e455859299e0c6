use crate::error::{status_text, ProxyError};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Body, Frame, SizeHint};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response the engine hands back to the inbound server.
pub type ProxyBody = BoxBody<Bytes, BoxError>;

pub fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Response body fed frame by frame by a connection's response loop.
pub struct UpstreamBody {
    rx: mpsc::Receiver<Result<Frame<Bytes>, ProxyError>>,
    size_hint: SizeHint,
}

impl UpstreamBody {
    pub fn new(rx: mpsc::Receiver<Result<Frame<Bytes>, ProxyError>>, length: Option<u64>) -> Self {
        let size_hint = match length {
            Some(length) => SizeHint::with_exact(length),
            None => SizeHint::default(),
        };
        Self { rx, size_hint }
    }

    pub fn into_proxy_body(self) -> ProxyBody {
        self.map_err(|e| Box::new(e) as BoxError).boxed()
    }
}

impl Body for UpstreamBody {
    type Data = Bytes;
    type Error = ProxyError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.rx.poll_recv(cx)
    }

    fn size_hint(&self) -> SizeHint {
        self.size_hint.clone()
    }
}

pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Plain-text response whose body is the status reason phrase.
    pub fn status(status: StatusCode) -> Response<ProxyBody> {
        let mut response = Response::new(full(status_text(status)));
        *response.status_mut() = status;
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }

    /// Classifies `err` and renders it without leaking any detail.
    pub fn from_error(err: &ProxyError) -> Response<ProxyBody> {
        let status = err.status_code();
        if err.is_canceled() {
            log::debug!("request canceled by client: {}", err);
        } else {
            log::warn!("proxy error ({}): {}", status.as_u16(), err);
        }
        Self::status(status)
    }
}
