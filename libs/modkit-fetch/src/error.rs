use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Boxed error used for failures coming from the HTTP/TLS stack.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Classification of URL resolution failures.
///
/// Provides programmatic matching for different failure modes without
/// relying on unstable error message strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidUrlKind {
    /// URL could not be parsed (malformed syntax)
    ParseError,
    /// URL has neither a host nor a base URL to resolve against
    MissingHost,
    /// URL scheme is not http/https
    UnsupportedScheme,
}

/// Errors produced while building or executing a fetch request.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FetchError {
    /// More than one config passed to a top-level helper
    #[error("too many arguments: expected at most one config, got {given}")]
    TooManyArguments { given: usize },

    /// Method name outside the supported set
    #[error("invalid method: {0}")]
    InvalidMethod(String),

    /// GET/HEAD helper called with a body
    #[error("{method} request must not carry a body")]
    BodyNotAllowed { method: http::Method },

    /// Base URL, target URL or proxy URL could not be resolved
    ///
    /// The `reason` field is for logging only; match on `kind` instead.
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl {
        url: String,
        kind: InvalidUrlKind,
        reason: String,
    },

    /// The request object could not be assembled
    #[error("cannot create request: {0}")]
    CannotCreateRequest(#[from] http::Error),

    #[error("invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    #[error("invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// JSON body could not be serialized
    #[error("invalid json body: {0}")]
    InvalidJsonBody(#[source] serde_json::Error),

    /// Body is not a flat string map while the content type is form-urlencoded
    #[error("invalid url form encoded body: {0}")]
    InvalidUrlFormEncodedBody(String),

    /// Body shape does not fit multipart/form-data
    #[error("invalid multipart body: {0}")]
    InvalidBodyMultipart(String),

    /// Body shape does not fit the raw/octet-stream encoders
    #[error("invalid body: {0}")]
    InvalidBody(String),

    /// A request-side reader failed while the body was being encoded
    #[error("failed to read request body stream: {0}")]
    ReadingBodyStream(#[source] std::io::Error),

    /// Gzip compression of the request body failed
    #[error("failed to compress request body: {0}")]
    CompressRequest(#[source] std::io::Error),

    /// Proxy scheme outside http/https/socks5/socks5h
    #[error("unsupported proxy: {0}")]
    UnsupportedProxy(String),

    /// Both a proxy and a Unix domain socket were configured
    #[error("proxy and unix domain socket cannot be combined")]
    ConflictingTransport,

    /// TLS material referenced by path could not be read
    #[error("failed to read TLS material from {}: {source}", path.display())]
    TlsMaterial {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TLS configuration error (PEM parsing, key pair, protocol setup)
    #[error("TLS error: {0}")]
    Tls(#[source] BoxError),

    /// Network-level failure (DNS, connect, handshake, protocol)
    #[error("failed to send request: {0}")]
    SendingRequest(#[source] BoxError),

    /// Deadline for the round trip elapsed
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Caller cancelled the request
    #[error("request cancelled")]
    Cancelled,

    /// Draining or decompressing the response body failed
    #[error("failed to read response: {0}")]
    ReadingResponse(#[source] BoxError),

    /// Creating or writing the download file failed
    #[error("failed to download into {}: {source}", path.display())]
    Download {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Empty key passed to the cookie setter
    #[error("cookie key must not be empty")]
    EmptyCookieKey,

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing failed: {0}")]
    Yaml(#[source] BoxError),

    #[error("response body is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// Response body is not available in the buffered shape
    #[error("response body is not buffered (stream or download response)")]
    NotBuffered,

    /// Non-2xx status surfaced through `error_for_status`
    #[error("[{status}] {body_preview}")]
    HttpStatus {
        status: http::StatusCode,
        body_preview: String,
    },
}

impl FetchError {
    /// True for failures of the send stage: network errors, timeouts and cancellation.
    #[must_use]
    pub fn is_send_failure(&self) -> bool {
        matches!(
            self,
            Self::SendingRequest(_) | Self::Timeout(_) | Self::Cancelled
        )
    }

    pub(crate) fn invalid_url(
        url: impl Into<String>,
        kind: InvalidUrlKind,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            kind,
            reason: reason.to_string(),
        }
    }
}

impl From<hyper_util::client::legacy::Error> for FetchError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        FetchError::SendingRequest(Box::new(err))
    }
}
