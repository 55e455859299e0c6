//! HTTP/1.1 framing for the upstream leg.
//!
//! Request heads are serialized by hand so header casing and the request-target
//! form stay under our control; response heads are parsed with `httparse`.

use crate::body::BoxError;
use crate::error::ProxyError;
use bytes::{Buf, Bytes, BytesMut};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use hyper::body::Frame;
use hyper::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use hyper::{HeaderMap, Method, StatusCode, Version};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Request body as written to the upstream.
pub type RequestBody = UnsyncBoxBody<Bytes, BoxError>;

const MAX_HEADERS: usize = 128;
const MAX_LINE_BYTES: usize = 8 * 1024;
const READ_CHUNK: usize = 8 * 1024;

/// Header names whose canonical form is not plain title case.
const WEBSOCKET_HEADERS: [(&str, &str); 5] = [
    ("sec-websocket-key", "Sec-WebSocket-Key"),
    ("sec-websocket-extensions", "Sec-WebSocket-Extensions"),
    ("sec-websocket-accept", "Sec-WebSocket-Accept"),
    ("sec-websocket-protocol", "Sec-WebSocket-Protocol"),
    ("sec-websocket-version", "Sec-WebSocket-Version"),
];

/// `x-forwarded-for` -> `X-Forwarded-For`.
pub fn canonical_header_name(name: &str, websocket: bool) -> String {
    if websocket {
        if let Some((_, canonical)) = WEBSOCKET_HEADERS.iter().find(|(lower, _)| *lower == name) {
            return canonical.to_string();
        }
    }

    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c.to_ascii_lowercase());
        }
        upper = c == '-';
    }
    out
}

/// How the request body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestFraming {
    None,
    Length(u64),
    Chunked,
}

/// Serializes `METHOD target HTTP/1.1` plus headers into `buf`. Host goes first.
pub fn encode_request_head(
    buf: &mut BytesMut,
    method: &Method,
    target: &str,
    headers: &HeaderMap,
    websocket: bool,
) {
    buf.extend_from_slice(method.as_str().as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(target.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");

    if let Some(host) = headers.get(HOST) {
        buf.extend_from_slice(b"Host: ");
        buf.extend_from_slice(host.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    for (name, value) in headers.iter() {
        if name == HOST {
            continue;
        }
        buf.extend_from_slice(canonical_header_name(name.as_str(), websocket).as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
}

/// Like `write_all`, but keeps `written` current so the caller knows whether
/// anything reached the socket when a write fails.
pub async fn write_counted<W>(io: &mut W, mut data: &[u8], written: &mut usize) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    while !data.is_empty() {
        let n = io.write(data).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "failed to write request"));
        }
        *written += n;
        data = &data[n..];
    }
    Ok(())
}

/// Writes head and body in one pass. The body is not polled before the head
/// has been fully written, so a failed head write leaves it untouched.
pub async fn write_request<W>(
    io: &mut W,
    head: &[u8],
    body: &mut RequestBody,
    framing: RequestFraming,
    written: &mut usize,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_counted(io, head, written).await?;

    if framing != RequestFraming::None {
        let mut trailers: Option<HeaderMap> = None;
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(io::Error::other)?;
            match frame.into_data() {
                Ok(data) => {
                    if data.is_empty() {
                        continue;
                    }
                    if framing == RequestFraming::Chunked {
                        let size = format!("{:x}\r\n", data.len());
                        write_counted(io, size.as_bytes(), written).await?;
                        write_counted(io, &data, written).await?;
                        write_counted(io, b"\r\n", written).await?;
                    } else {
                        write_counted(io, &data, written).await?;
                    }
                }
                Err(frame) => {
                    if let Ok(map) = frame.into_trailers() {
                        trailers.get_or_insert_with(HeaderMap::new).extend(map);
                    }
                }
            }
        }

        if framing == RequestFraming::Chunked {
            let mut tail = BytesMut::from(&b"0\r\n"[..]);
            for (name, value) in trailers.iter().flatten() {
                tail.extend_from_slice(canonical_header_name(name.as_str(), false).as_bytes());
                tail.extend_from_slice(b": ");
                tail.extend_from_slice(value.as_bytes());
                tail.extend_from_slice(b"\r\n");
            }
            tail.extend_from_slice(b"\r\n");
            write_counted(io, &tail, written).await?;
        }
    }

    io.flush().await
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub reason: String,
    pub headers: HeaderMap,
}

fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn closed_early() -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "connection closed before message completed",
    )
}

async fn read_more<R>(reader: &mut R, buf: &mut BytesMut) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    buf.reserve(READ_CHUNK);
    reader.read_buf(buf).await
}

/// Reads one response head. Bytes past the head stay in `buf`.
pub async fn read_response_head<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_bytes: usize,
) -> io::Result<ResponseHead>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        if !buf.is_empty() {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut response = httparse::Response::new(&mut headers);
            match response.parse(buf) {
                Ok(httparse::Status::Complete(len)) => {
                    let head = head_from_httparse(&response)?;
                    buf.advance(len);
                    return Ok(head);
                }
                Ok(httparse::Status::Partial) => {
                    if buf.len() >= max_bytes {
                        return Err(invalid_data("response head too large"));
                    }
                }
                Err(e) => return Err(invalid_data(format!("malformed response head: {}", e))),
            }
        }

        if read_more(reader, buf).await? == 0 {
            return Err(closed_early());
        }
    }
}

fn head_from_httparse(response: &httparse::Response<'_, '_>) -> io::Result<ResponseHead> {
    let code = response.code.ok_or_else(|| invalid_data("missing status code"))?;
    let status = StatusCode::from_u16(code).map_err(|e| invalid_data(e.to_string()))?;
    let version = match response.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut headers = HeaderMap::with_capacity(response.headers.len());
    for h in response.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| invalid_data(format!("invalid header name '{}': {}", h.name, e)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|e| invalid_data(format!("invalid value for '{}': {}", h.name, e)))?;
        headers.append(name, value);
    }

    Ok(ResponseHead {
        status,
        version,
        reason: response.reason.unwrap_or("").to_string(),
        headers,
    })
}

/// True when any comma-separated token of any `name` header equals `token`.
pub fn header_has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    })
}

/// Whether the upstream is willing to keep the connection open after this response.
pub fn keep_alive(head: &ResponseHead) -> bool {
    if header_has_token(&head.headers, &CONNECTION, "close") {
        return false;
    }
    head.version != Version::HTTP_10 || header_has_token(&head.headers, &CONNECTION, "keep-alive")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    Empty,
    Known(u64),
    Chunked,
    UntilClose,
}

impl BodyLength {
    pub fn exact(&self) -> Option<u64> {
        match self {
            BodyLength::Empty => Some(0),
            BodyLength::Known(n) => Some(*n),
            _ => None,
        }
    }
}

pub fn response_body_length(request_method: &Method, head: &ResponseHead) -> io::Result<BodyLength> {
    let status = head.status;
    if request_method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyLength::Empty);
    }

    if head.headers.contains_key(TRANSFER_ENCODING) {
        let last = head
            .headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .last();
        return Ok(match last {
            Some(coding) if coding.eq_ignore_ascii_case("chunked") => BodyLength::Chunked,
            _ => BodyLength::UntilClose,
        });
    }

    let mut length: Option<u64> = None;
    for value in head.headers.get_all(CONTENT_LENGTH) {
        for part in value.to_str().map_err(|_| invalid_data("invalid content-length"))?.split(',') {
            let n: u64 = part
                .trim()
                .parse()
                .map_err(|_| invalid_data("invalid content-length"))?;
            if length.is_some_and(|prev| prev != n) {
                return Err(invalid_data("conflicting content-length values"));
            }
            length = Some(n);
        }
    }

    Ok(match length {
        Some(0) => BodyLength::Empty,
        Some(n) => BodyLength::Known(n),
        None => BodyLength::UntilClose,
    })
}

/// Result of relaying a response body to the inbound side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyOutcome {
    Complete,
    /// The inbound side stopped reading.
    ReceiverGone,
    /// The upstream failed mid-body; the error was forwarded.
    Failed,
}

type FrameSender = mpsc::Sender<Result<Frame<Bytes>, ProxyError>>;

enum RelayError {
    Gone,
    Upstream(io::Error),
}

impl From<io::Error> for RelayError {
    fn from(e: io::Error) -> Self {
        RelayError::Upstream(e)
    }
}

async fn send_frame(tx: &FrameSender, frame: Frame<Bytes>) -> Result<(), RelayError> {
    tx.send(Ok(frame)).await.map_err(|_| RelayError::Gone)
}

async fn relay_exact<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    mut remaining: u64,
    tx: &FrameSender,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    while remaining > 0 {
        if buf.is_empty() && read_more(reader, buf).await? == 0 {
            return Err(closed_early().into());
        }
        let take = remaining.min(buf.len() as u64) as usize;
        let chunk = buf.split_to(take).freeze();
        remaining -= take as u64;
        send_frame(tx, Frame::data(chunk)).await?;
    }
    Ok(())
}

async fn read_line<R>(reader: &mut R, buf: &mut BytesMut) -> io::Result<Bytes>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let mut line = buf.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            return Ok(line.freeze());
        }
        if buf.len() > MAX_LINE_BYTES {
            return Err(invalid_data("line too long"));
        }
        if read_more(reader, buf).await? == 0 {
            return Err(closed_early());
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let line = std::str::from_utf8(line).map_err(|_| invalid_data("invalid chunk size"))?;
    let size = line.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size, 16).map_err(|_| invalid_data(format!("invalid chunk size: {:?}", size)))
}

async fn relay_chunked<R>(reader: &mut R, buf: &mut BytesMut, tx: &FrameSender) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        let size = parse_chunk_size(&read_line(reader, buf).await?)?;
        if size == 0 {
            break;
        }
        relay_exact(reader, buf, size, tx).await?;
        if !read_line(reader, buf).await?.is_empty() {
            return Err(invalid_data("missing chunk terminator").into());
        }
    }

    let mut trailers = HeaderMap::new();
    loop {
        let line = read_line(reader, buf).await?;
        if line.is_empty() {
            break;
        }
        let Some(colon) = line.iter().position(|b| *b == b':') else {
            return Err(invalid_data("malformed trailer").into());
        };
        let name = HeaderName::from_bytes(line[..colon].trim_ascii())
            .map_err(|_| invalid_data("malformed trailer name"))?;
        let value = HeaderValue::from_bytes(line[colon + 1..].trim_ascii())
            .map_err(|_| invalid_data("malformed trailer value"))?;
        trailers.append(name, value);
    }
    if !trailers.is_empty() {
        send_frame(tx, Frame::trailers(trailers)).await?;
    }
    Ok(())
}

async fn relay_until_close<R>(reader: &mut R, buf: &mut BytesMut, tx: &FrameSender) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        if !buf.is_empty() {
            let chunk = buf.split().freeze();
            send_frame(tx, Frame::data(chunk)).await?;
        }
        if read_more(reader, buf).await? == 0 {
            return Ok(());
        }
    }
}

/// Decodes the response body per `length` and pushes it to `tx` frame by frame.
pub async fn relay_body<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    length: BodyLength,
    tx: &FrameSender,
) -> BodyOutcome
where
    R: AsyncRead + Unpin + ?Sized,
{
    let result = match length {
        BodyLength::Empty => Ok(()),
        BodyLength::Known(n) => relay_exact(reader, buf, n, tx).await,
        BodyLength::Chunked => relay_chunked(reader, buf, tx).await,
        BodyLength::UntilClose => relay_until_close(reader, buf, tx).await,
    };

    match result {
        Ok(()) => BodyOutcome::Complete,
        Err(RelayError::Gone) => BodyOutcome::ReceiverGone,
        Err(RelayError::Upstream(e)) => {
            let _ = tx.send(Err(ProxyError::RoundTrip(e))).await;
            BodyOutcome::Failed
        }
    }
}
