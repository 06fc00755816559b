use crate::config::Config;
use crate::error::FetchError;
use crate::transport::ResponseBody;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http::{HeaderMap, StatusCode, header};
use http_body::Body;
use http_body_util::BodyExt;
use pin_project_lite::pin_project;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::OnceLock;
use std::task::{Context, Poll, ready};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

/// Maximum number of body characters carried by `HttpStatus` errors.
const ERROR_BODY_PREVIEW_LIMIT: usize = 256;

/// What happened to the response body.
#[derive(Debug)]
pub enum BodyShape {
    /// Fully read into memory
    Buffered(Bytes),
    /// Live body, not yet drained
    Stream(ResponseStream),
    /// Written to a file
    Downloaded { path: PathBuf, bytes: u64 },
}

/// Result of one executed request.
///
/// The buffered body is parsed as JSON at most once, on first access through
/// [`Response::value`] or [`Response::get`]; the parsed document is cached.
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: BodyShape,
    request: Config,
    parsed: OnceLock<Value>,
    #[cfg(test)]
    parse_count: std::sync::atomic::AtomicUsize,
}

impl Response {
    pub(crate) fn new(status: StatusCode, headers: HeaderMap, body: BodyShape, request: Config) -> Self {
        Self {
            status,
            headers,
            body,
            request,
            parsed: OnceLock::new(),
            #[cfg(test)]
            parse_count: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    /// Canonical reason phrase, empty for unknown codes.
    #[must_use]
    pub fn status_text(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or_default()
    }

    /// True for 2xx statuses.
    #[must_use]
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Case-insensitive header lookup; non-UTF-8 values read as absent.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header(header::CONTENT_TYPE.as_str())
    }

    #[must_use]
    pub fn location(&self) -> Option<&str> {
        self.header(header::LOCATION.as_str())
    }

    /// `Content-Length` value, 0 when missing or invalid.
    #[must_use]
    pub fn content_length(&self) -> u64 {
        self.header(header::CONTENT_LENGTH.as_str())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    #[must_use]
    pub fn content_encoding(&self) -> Option<&str> {
        self.header(header::CONTENT_ENCODING.as_str())
    }

    #[must_use]
    pub fn transfer_encoding(&self) -> Option<&str> {
        self.header(header::TRANSFER_ENCODING.as_str())
    }

    #[must_use]
    pub fn content_language(&self) -> Option<&str> {
        self.header(header::CONTENT_LANGUAGE.as_str())
    }

    #[must_use]
    pub fn x_powered_by(&self) -> Option<&str> {
        self.header("x-powered-by")
    }

    #[must_use]
    pub fn x_request_id(&self) -> Option<&str> {
        self.header("x-request-id")
    }

    #[must_use]
    pub fn accept_ranges(&self) -> Option<&str> {
        self.header(header::ACCEPT_RANGES.as_str())
    }

    /// All `Set-Cookie` values in arrival order.
    #[must_use]
    pub fn set_cookie(&self) -> Vec<&str> {
        self.headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    /// Resolved configuration the request was sent with.
    #[must_use]
    pub fn request(&self) -> &Config {
        &self.request
    }

    #[must_use]
    pub fn shape(&self) -> &BodyShape {
        &self.body
    }

    /// Buffered body bytes.
    ///
    /// # Errors
    ///
    /// Returns `FetchError::NotBuffered` for stream and download responses.
    pub fn bytes(&self) -> Result<&Bytes, FetchError> {
        match &self.body {
            BodyShape::Buffered(bytes) => Ok(bytes),
            BodyShape::Stream(_) | BodyShape::Downloaded { .. } => Err(FetchError::NotBuffered),
        }
    }

    /// Buffered body as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns `FetchError::NotBuffered` for unbuffered responses and
    /// `FetchError::Utf8` for invalid UTF-8.
    pub fn text(&self) -> Result<&str, FetchError> {
        Ok(std::str::from_utf8(self.bytes()?)?)
    }

    /// Parsed JSON document; `Null` when the body is not valid JSON or not buffered.
    #[must_use]
    pub fn value(&self) -> &Value {
        self.parsed.get_or_init(|| {
            #[cfg(test)]
            self.parse_count
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

            match &self.body {
                BodyShape::Buffered(bytes) => serde_json::from_slice(bytes).unwrap_or(Value::Null),
                BodyShape::Stream(_) | BodyShape::Downloaded { .. } => Value::Null,
            }
        })
    }

    /// Path query against the parsed body, e.g. `"data.items.0.name"`.
    #[must_use]
    pub fn get(&self, path: &str) -> Lookup<'_> {
        Lookup::root(self.value()).get(path)
    }

    /// Parsed body re-serialized with indentation.
    ///
    /// # Errors
    ///
    /// Returns `FetchError::Json` if serialization fails.
    pub fn to_pretty_json(&self) -> Result<String, FetchError> {
        Ok(serde_json::to_string_pretty(self.value())?)
    }

    /// Decode the buffered body as JSON into `T`.
    ///
    /// # Errors
    ///
    /// Returns `FetchError::NotBuffered` or `FetchError::Json`.
    pub fn unmarshal_json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        Ok(serde_json::from_slice(self.bytes()?)?)
    }

    /// Decode the buffered body as YAML into `T`.
    ///
    /// # Errors
    ///
    /// Returns `FetchError::NotBuffered`, `FetchError::Utf8` or `FetchError::Yaml`.
    pub fn unmarshal_yaml<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_saphyr::from_str(self.text()?).map_err(|e| FetchError::Yaml(Box::new(e)))
    }

    /// Turn a non-2xx response into `FetchError::HttpStatus`.
    ///
    /// The error carries a preview of the buffered body, if any.
    ///
    /// # Errors
    ///
    /// Returns `FetchError::HttpStatus` if the status is not 2xx.
    pub fn error_for_status(self) -> Result<Self, FetchError> {
        if self.ok() {
            return Ok(self);
        }
        let body_preview = match &self.body {
            BodyShape::Buffered(bytes) => String::from_utf8_lossy(bytes)
                .chars()
                .take(ERROR_BODY_PREVIEW_LIMIT)
                .collect(),
            BodyShape::Stream(_) | BodyShape::Downloaded { .. } => String::new(),
        };
        Err(FetchError::HttpStatus {
            status: self.status,
            body_preview,
        })
    }

    /// Live body of a stream response; the caller owns closing it.
    #[must_use]
    pub fn into_stream(self) -> Option<ResponseStream> {
        match self.body {
            BodyShape::Stream(stream) => Some(stream),
            BodyShape::Buffered(_) | BodyShape::Downloaded { .. } => None,
        }
    }

    /// Destination of a download response.
    #[must_use]
    pub fn download_path(&self) -> Option<&Path> {
        match &self.body {
            BodyShape::Downloaded { path, .. } => Some(path),
            BodyShape::Buffered(_) | BodyShape::Stream(_) => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn parse_count(&self) -> usize {
        self.parse_count.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

/// Result of a path query on a parsed document.
#[derive(Debug, Clone, Copy)]
pub struct Lookup<'a> {
    value: Option<&'a Value>,
}

impl<'a> Lookup<'a> {
    fn root(value: &'a Value) -> Self {
        Self { value: Some(value) }
    }

    /// Nested query relative to this result.
    ///
    /// Segments are separated by `.` (escape a literal dot as `\.`);
    /// numeric segments index arrays. An empty path returns `self`.
    #[must_use]
    pub fn get(&self, path: &str) -> Lookup<'a> {
        let mut current = self.value;
        for segment in split_path(path) {
            current = current.and_then(|v| match v {
                Value::Object(map) => map.get(&segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            });
        }
        Lookup { value: current }
    }

    /// True when the path is present, even if its value is `null`.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.value.is_some()
    }

    #[must_use]
    pub fn value(&self) -> Option<&'a Value> {
        self.value
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&'a str> {
        self.value.and_then(Value::as_str)
    }

    /// Strings as-is, other values as compact JSON, missing as empty.
    #[must_use]
    pub fn string(&self) -> String {
        match self.value {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }

    /// Integer view: numbers truncate, numeric strings parse, booleans are 1/0.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn int(&self) -> i64 {
        match self.value {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
                .unwrap_or_default(),
            Some(Value::String(s)) => s.trim().parse().unwrap_or_default(),
            Some(Value::Bool(b)) => i64::from(*b),
            _ => 0,
        }
    }

    #[must_use]
    pub fn float(&self) -> f64 {
        match self.value {
            Some(Value::Number(n)) => n.as_f64().unwrap_or_default(),
            Some(Value::String(s)) => s.trim().parse().unwrap_or_default(),
            Some(Value::Bool(b)) => f64::from(u8::from(*b)),
            _ => 0.0,
        }
    }

    /// `true`, `"true"`/`"1"` and non-zero numbers are true.
    #[must_use]
    pub fn bool(&self) -> bool {
        match self.value {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.trim(), "true" | "1"),
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            _ => false,
        }
    }

    /// Elements of an array result; empty for anything else.
    #[must_use]
    pub fn array(&self) -> Vec<Lookup<'a>> {
        match self.value {
            Some(Value::Array(items)) => items.iter().map(Lookup::root).collect(),
            _ => Vec::new(),
        }
    }
}

fn split_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '.' => segments.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    if !path.is_empty() {
        segments.push(current);
    }
    segments
}

pin_project! {
    /// Live response body.
    ///
    /// Dropping it closes the underlying connection.
    pub struct ResponseStream {
        #[pin]
        body: ResponseBody,
    }
}

impl ResponseStream {
    pub(crate) fn new(body: ResponseBody) -> Self {
        Self { body }
    }

    /// Next data chunk, `None` at the end of the body.
    ///
    /// # Errors
    ///
    /// Returns `FetchError::ReadingResponse` if the connection fails mid-body.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, FetchError> {
        while let Some(frame) = self.body.frame().await {
            let frame = frame.map_err(FetchError::ReadingResponse)?;
            if let Ok(data) = frame.into_data() {
                return Ok(Some(data));
            }
        }
        Ok(None)
    }

    /// Drain the rest of the body into memory.
    ///
    /// # Errors
    ///
    /// Returns `FetchError::ReadingResponse` if the connection fails mid-body.
    pub async fn bytes(self) -> Result<Bytes, FetchError> {
        Ok(self
            .body
            .collect()
            .await
            .map_err(FetchError::ReadingResponse)?
            .to_bytes())
    }

    /// Adapt the stream to [`tokio::io::AsyncRead`].
    pub fn into_async_read(self) -> impl AsyncRead + Send + Sync + Unpin {
        StreamReader::new(self.map_err(std::io::Error::other))
    }
}

impl futures_core::Stream for ResponseStream {
    type Item = Result<Bytes, FetchError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut body = self.project().body;
        loop {
            match ready!(body.as_mut().poll_frame(cx)) {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        return Poll::Ready(Some(Ok(data)));
                    }
                }
                Some(Err(e)) => return Poll::Ready(Some(Err(FetchError::ReadingResponse(e)))),
                None => return Poll::Ready(None),
            }
        }
    }
}

impl fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStream")
            .field("is_end_stream", &self.body.is_end_stream())
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http::HeaderValue;
    use http_body_util::Full;
    use serde_json::json;

    fn buffered(body: &str) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Response::new(
            StatusCode::OK,
            headers,
            BodyShape::Buffered(Bytes::from(body.to_owned())),
            Config::default(),
        )
    }

    #[test]
    fn test_get_parses_once() {
        let resp = buffered(r#"{"user":{"name":"zero","tags":["a","b"]}}"#);

        assert_eq!(resp.parse_count(), 0);
        let first = resp.get("user.name").string();
        let second = resp.get("user.name").string();
        let tag = resp.get("user.tags.1").string();

        assert_eq!(first, "zero");
        assert_eq!(first, second);
        assert_eq!(tag, "b");
        assert_eq!(resp.parse_count(), 1);
    }

    #[test]
    fn test_lookup_typed_views() {
        let resp = buffered(
            r#"{"n":42,"f":1.5,"s":"7","t":true,"obj":{"a.b":1},"arr":[1,2,3],"nil":null}"#,
        );

        assert_eq!(resp.get("n").int(), 42);
        assert_eq!(resp.get("f").int(), 1);
        assert!((resp.get("f").float() - 1.5).abs() < f64::EPSILON);
        assert_eq!(resp.get("s").int(), 7);
        assert!(resp.get("t").bool());
        assert_eq!(resp.get(r"obj.a\.b").int(), 1);
        assert_eq!(resp.get("obj").string(), r#"{"a.b":1}"#);
        assert_eq!(resp.get("arr").array().len(), 3);
        assert!(resp.get("nil").exists());
        assert_eq!(resp.get("nil").value(), Some(&Value::Null));
        assert!(!resp.get("absent").exists());
        assert!(!resp.get("missing.deeper").exists());
        assert_eq!(resp.get("missing").string(), "");
    }

    #[test]
    fn test_invalid_json_reads_as_missing() {
        let resp = buffered("not json");
        assert!(!resp.get("a").exists());
        assert_eq!(resp.value(), &Value::Null);
        assert_eq!(resp.text().unwrap(), "not json");
    }

    #[test]
    fn test_unmarshal_json_and_yaml() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct User {
            name: String,
            age: u32,
        }

        let resp = buffered(r#"{"name":"zero","age":2}"#);
        let user: User = resp.unmarshal_json().unwrap();
        assert_eq!(user, User { name: "zero".to_owned(), age: 2 });

        let resp = buffered("name: zero\nage: 2\n");
        let user: User = resp.unmarshal_yaml().unwrap();
        assert_eq!(user.name, "zero");
    }

    #[test]
    fn test_pretty_json() {
        let resp = buffered(r#"{"a":"b"}"#);
        assert_eq!(resp.to_pretty_json().unwrap(), "{\n  \"a\": \"b\"\n}");
    }

    #[test]
    fn test_header_accessors() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        headers.insert("x-request-id", HeaderValue::from_static("req-1"));
        headers.append(header::SET_COOKIE, HeaderValue::from_static("a=1; Path=/"));
        headers.append(header::SET_COOKIE, HeaderValue::from_static("b=2"));
        let resp = Response::new(
            StatusCode::CREATED,
            headers,
            BodyShape::Buffered(Bytes::new()),
            Config::default(),
        );

        assert!(resp.ok());
        assert_eq!(resp.status_code(), 201);
        assert_eq!(resp.status_text(), "Created");
        assert_eq!(resp.content_length(), 12);
        assert_eq!(resp.x_request_id(), Some("req-1"));
        assert_eq!(resp.set_cookie(), vec!["a=1; Path=/", "b=2"]);
        assert!(resp.location().is_none());
    }

    #[test]
    fn test_content_length_invalid_is_zero() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("abc"));
        let resp = Response::new(
            StatusCode::OK,
            headers,
            BodyShape::Buffered(Bytes::new()),
            Config::default(),
        );
        assert_eq!(resp.content_length(), 0);
    }

    #[test]
    fn test_error_for_status() {
        let resp = Response::new(
            StatusCode::BAD_GATEWAY,
            HeaderMap::new(),
            BodyShape::Buffered(Bytes::from_static(b"upstream down")),
            Config::default(),
        );
        let err = resp.error_for_status().unwrap_err();
        assert_eq!(err.to_string(), "[502 Bad Gateway] upstream down");
    }

    #[tokio::test]
    async fn test_stream_shape() {
        let body: ResponseBody = Full::new(Bytes::from_static(b"streamed"))
            .map_err(|never| match never {})
            .boxed();
        let resp = Response::new(
            StatusCode::OK,
            HeaderMap::new(),
            BodyShape::Stream(ResponseStream::new(body)),
            Config::default(),
        );

        assert!(matches!(resp.bytes(), Err(FetchError::NotBuffered)));
        assert!(!resp.get("a").exists());

        let mut stream = resp.into_stream().unwrap();
        assert_eq!(stream.chunk().await.unwrap(), Some(Bytes::from_static(b"streamed")));
        assert_eq!(stream.chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stream_as_async_read() {
        use tokio::io::AsyncReadExt;

        let body: ResponseBody = Full::new(Bytes::from_static(b"line one\nline two"))
            .map_err(|never| match never {})
            .boxed();
        let mut reader = ResponseStream::new(body).into_async_read();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "line one\nline two");
    }

    #[test]
    fn test_value_of_json_body() {
        let resp = buffered(r#"{"a":[{"b":1}]}"#);
        assert_eq!(resp.value(), &json!({"a": [{"b": 1}]}));
        assert_eq!(resp.get("a.0.b").int(), 1);
    }
}
