use hyper::StatusCode;
use std::io;
use thiserror::Error;

/// Non-standard status used when the caller goes away before the upstream answers.
pub const STATUS_CLIENT_CLOSED_REQUEST: u16 = 499;

/// Body text sent along with [`STATUS_CLIENT_CLOSED_REQUEST`].
pub const CLIENT_CLOSED_REQUEST_TEXT: &str = "Client Closed Request";

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The connection to the upstream (or to a forward proxy in front of it)
    /// could not be established.
    #[error("dial {0}: {1}")]
    Dial(String, #[source] io::Error),

    /// The outbound request could not be written in full.
    #[error("write request ({written} bytes sent): {source}")]
    Write {
        written: usize,
        #[source]
        source: io::Error,
    },

    /// Failure while waiting for or reading the upstream response.
    #[error("round trip: {0}")]
    RoundTrip(#[source] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("request canceled")]
    Canceled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl ProxyError {
    pub fn dial(addr: impl Into<String>, source: io::Error) -> Self {
        ProxyError::Dial(addr.into(), source)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        ProxyError::Protocol(message.into())
    }

    /// Error raised when the upstream closes the connection mid-message.
    pub fn closed_early() -> Self {
        ProxyError::RoundTrip(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before message completed",
        ))
    }

    fn io_source(&self) -> Option<&io::Error> {
        match self {
            ProxyError::Io(e) | ProxyError::Dial(_, e) | ProxyError::RoundTrip(e) => Some(e),
            ProxyError::Write { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, ProxyError::Canceled)
    }

    pub fn is_eof(&self) -> bool {
        self.io_source()
            .is_some_and(|e| e.kind() == io::ErrorKind::UnexpectedEof)
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            ProxyError::Timeout(_) => true,
            other => other
                .io_source()
                .is_some_and(|e| e.kind() == io::ErrorKind::TimedOut),
        }
    }

    /// Errors that originate on the network leg to the upstream.
    pub fn is_network(&self) -> bool {
        self.io_source().is_some()
    }

    /// Maps a terminal error to the status written back to the caller.
    pub fn status_code(&self) -> StatusCode {
        if self.is_eof() {
            StatusCode::BAD_GATEWAY
        } else if self.is_canceled() {
            client_closed_request()
        } else if self.is_timeout() {
            StatusCode::GATEWAY_TIMEOUT
        } else if self.is_network() {
            StatusCode::BAD_GATEWAY
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub fn client_closed_request() -> StatusCode {
    // Any code in 100..=999 is accepted.
    StatusCode::from_u16(STATUS_CLIENT_CLOSED_REQUEST).expect("499 is a valid status code")
}

/// Plain-text body for an error status: the reason phrase, nothing else.
pub fn status_text(status: StatusCode) -> &'static str {
    if status.as_u16() == STATUS_CLIENT_CLOSED_REQUEST {
        return CLIENT_CLOSED_REQUEST_TEXT;
    }
    status.canonical_reason().unwrap_or("Internal Server Error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifier() {
        let eof = ProxyError::closed_early();
        assert_eq!(eof.status_code(), StatusCode::BAD_GATEWAY);

        assert_eq!(ProxyError::Canceled.status_code().as_u16(), 499);

        let timed_out = ProxyError::dial(
            "10.0.0.1:80",
            io::Error::new(io::ErrorKind::TimedOut, "dial timeout"),
        );
        assert_eq!(timed_out.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ProxyError::Timeout("response header".to_string()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );

        let refused = ProxyError::dial(
            "10.0.0.1:80",
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert_eq!(refused.status_code(), StatusCode::BAD_GATEWAY);

        let write = ProxyError::Write {
            written: 0,
            source: io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"),
        };
        assert_eq!(write.status_code(), StatusCode::BAD_GATEWAY);

        assert_eq!(
            ProxyError::protocol("client tried to switch to invalid protocol").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_status_text() {
        assert_eq!(client_closed_request().as_u16(), STATUS_CLIENT_CLOSED_REQUEST);
        assert_eq!(status_text(client_closed_request()), "Client Closed Request");
        assert_eq!(status_text(StatusCode::BAD_GATEWAY), "Bad Gateway");
        assert_eq!(status_text(StatusCode::GATEWAY_TIMEOUT), "Gateway Timeout");
    }
}
