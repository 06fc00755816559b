//! Per-request configuration and its merge rules.
//!
//! A [`Config`] is accumulated by the [`Fetch`](crate::Fetch) builder and
//! layered with [`Defaults`](crate::Defaults) before execution. Merging only
//! ever fills gaps: populated scalars and existing map keys are never
//! overwritten, so the most specific layer wins.

use crate::error::FetchError;
use crate::progress::Progress;
use bytes::Bytes;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

/// HTTP methods accepted by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Head,
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl Method {
    pub const ALL: [Method; 6] = [
        Method::Head,
        Method::Get,
        Method::Post,
        Method::Put,
        Method::Delete,
        Method::Patch,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Head => "HEAD",
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| FetchError::InvalidMethod(s.to_owned()))
    }
}

impl From<Method> for http::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Head => http::Method::HEAD,
            Method::Get => http::Method::GET,
            Method::Post => http::Method::POST,
            Method::Put => http::Method::PUT,
            Method::Delete => http::Method::DELETE,
            Method::Patch => http::Method::PATCH,
        }
    }
}

/// Request headers.
///
/// Storage preserves the key as given, lookups ignore ASCII case.
/// [`Headers::set`] normalizes the key to lower case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Headers(IndexMap<String, String>);

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Case-insensitive lookup.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.keys().any(|k| k.eq_ignore_ascii_case(key))
    }

    /// Store `value` under the lower-cased `key`, replacing any spelling of it.
    pub fn set(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        let key = key.as_ref().to_ascii_lowercase();
        self.0.retain(|k, _| !k.eq_ignore_ascii_case(&key));
        self.0.insert(key, value.into());
    }

    /// Store `value` under `key` exactly as spelled.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let found = self.0.keys().position(|k| k.eq_ignore_ascii_case(key))?;
        self.0.shift_remove_index(found).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy entries whose key (compared without case) is absent here.
    pub fn merge(&mut self, other: &Headers) {
        for (k, v) in &other.0 {
            if !self.contains(k) {
                self.0.insert(k.clone(), v.clone());
            }
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Ordered, case-sensitive string map used for query and path parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct KeyValues(IndexMap<String, String>);

impl KeyValues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.shift_remove(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy entries whose key is absent here.
    pub fn merge(&mut self, other: &KeyValues) {
        for (k, v) in &other.0 {
            if !self.0.contains_key(k) {
                self.0.insert(k.clone(), v.clone());
            }
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for KeyValues {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

type DynRead = Box<dyn AsyncRead + Send + Unpin>;

/// Named, take-once async byte source.
///
/// Clones share the underlying reader: the first execution that encodes the
/// body consumes it, later attempts see it as already consumed.
#[derive(Clone)]
pub struct BodyReader {
    name: Option<String>,
    inner: Arc<Mutex<Option<DynRead>>>,
}

impl BodyReader {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            name: None,
            inner: Arc::new(Mutex::new(Some(Box::new(reader)))),
        }
    }

    /// Reader carrying a name; multipart uses it as the part's filename.
    pub fn named(name: impl Into<String>, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(reader)
        }
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self::new(std::io::Cursor::new(bytes.into()))
    }

    /// Open `path` for reading, naming the reader after the file name.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file cannot be opened.
    pub async fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await?;
        let name = path
            .file_name()
            .map_or_else(|| path.to_string_lossy(), |n| n.to_string_lossy())
            .into_owned();
        Ok(Self::named(name, file))
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// True once the reader has been handed out.
    #[must_use]
    pub fn is_consumed(&self) -> bool {
        self.inner.lock().is_none()
    }

    pub(crate) fn take(&self) -> Result<DynRead, FetchError> {
        self.inner
            .lock()
            .take()
            .ok_or_else(|| FetchError::InvalidBody("body stream already consumed".to_owned()))
    }

    pub(crate) async fn read_all(&self) -> Result<Vec<u8>, FetchError> {
        let mut reader = self.take()?;
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(FetchError::ReadingBodyStream)?;
        Ok(buf)
    }
}

impl fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyReader")
            .field("name", &self.name)
            .field("consumed", &self.is_consumed())
            .finish_non_exhaustive()
    }
}

/// Value inside a structured body.
#[derive(Debug, Clone)]
pub enum BodyValue {
    Json(serde_json::Value),
    Stream(BodyReader),
}

impl BodyValue {
    fn describe(&self) -> serde_json::Value {
        match self {
            BodyValue::Json(v) => v.clone(),
            BodyValue::Stream(r) => {
                serde_json::Value::String(format!("<stream {}>", r.name().unwrap_or("unnamed")))
            }
        }
    }
}

impl Serialize for BodyValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            BodyValue::Json(v) => v.serialize(serializer),
            BodyValue::Stream(_) => Err(serde::ser::Error::custom(
                "stream values cannot be encoded as JSON",
            )),
        }
    }
}

impl From<serde_json::Value> for BodyValue {
    fn from(value: serde_json::Value) -> Self {
        BodyValue::Json(value)
    }
}

impl From<&str> for BodyValue {
    fn from(value: &str) -> Self {
        BodyValue::Json(serde_json::Value::String(value.to_owned()))
    }
}

impl From<String> for BodyValue {
    fn from(value: String) -> Self {
        BodyValue::Json(serde_json::Value::String(value))
    }
}

impl From<BodyReader> for BodyValue {
    fn from(reader: BodyReader) -> Self {
        BodyValue::Stream(reader)
    }
}

/// Request payload.
#[derive(Debug, Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Raw(String),
    Flat(IndexMap<String, String>),
    Structured(IndexMap<String, BodyValue>),
    Stream(BodyReader),
}

impl Body {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    /// Structured body from any value that serializes to a JSON object.
    ///
    /// # Errors
    ///
    /// Returns `FetchError::InvalidJsonBody` if `value` fails to serialize
    /// or is not an object.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, FetchError> {
        match serde_json::to_value(value).map_err(FetchError::InvalidJsonBody)? {
            serde_json::Value::Object(map) => Ok(Body::Structured(
                map.into_iter().map(|(k, v)| (k, BodyValue::Json(v))).collect(),
            )),
            other => Err(FetchError::InvalidJsonBody(serde::ser::Error::custom(
                format!("expected a JSON object, got {other}"),
            ))),
        }
    }

    /// Flat string map body.
    pub fn flat<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Body::Flat(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Structured body from key/value pairs.
    pub fn structured<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<BodyValue>,
    {
        Body::Structured(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Printable view used by the debug dump; streams become placeholders.
    pub(crate) fn describe(&self) -> serde_json::Value {
        match self {
            Body::Empty => serde_json::Value::Null,
            Body::Raw(s) => serde_json::Value::String(s.clone()),
            Body::Flat(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect::<serde_json::Map<_, _>>()
                .into(),
            Body::Structured(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.describe()))
                .collect::<serde_json::Map<_, _>>()
                .into(),
            Body::Stream(r) => {
                serde_json::Value::String(format!("<stream {}>", r.name().unwrap_or("unnamed")))
            }
        }
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Raw(s)
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Body::Raw(s.to_owned())
    }
}

impl From<BodyReader> for Body {
    fn from(reader: BodyReader) -> Self {
        Body::Stream(reader)
    }
}

fn serialize_body<S: serde::Serializer>(body: &Body, serializer: S) -> Result<S::Ok, S::Error> {
    body.describe().serialize(serializer)
}

#[allow(clippy::ref_option)]
fn serialize_redacted<S: serde::Serializer>(
    value: &Option<Vec<u8>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    value.as_ref().map(|_| "<redacted>").serialize(serializer)
}

/// TLS material, inline or by path.
///
/// Inline bytes take precedence; paths are read at execution time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TlsConfig {
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "serialize_pem")]
    pub ca_cert: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "serialize_pem")]
    pub cert: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "serialize_redacted")]
    pub key: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
    pub insecure_skip_verify: bool,
}

#[allow(clippy::ref_option)]
fn serialize_pem<S: serde::Serializer>(
    value: &Option<Vec<u8>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    value
        .as_deref()
        .map(String::from_utf8_lossy)
        .serialize(serializer)
}

impl TlsConfig {
    pub fn merge(&mut self, other: &TlsConfig) {
        fill_option(&mut self.ca_cert, other.ca_cert.as_ref());
        fill_option(&mut self.ca_cert_file, other.ca_cert_file.as_ref());
        fill_option(&mut self.cert, other.cert.as_ref());
        fill_option(&mut self.cert_file, other.cert_file.as_ref());
        fill_option(&mut self.key, other.key.as_ref());
        fill_option(&mut self.key_file, other.key_file.as_ref());
        self.insecure_skip_verify |= other.insecure_skip_verify;
    }

    /// True when any TLS customization is requested.
    #[must_use]
    pub fn is_customized(&self) -> bool {
        self.ca_cert.is_some()
            || self.ca_cert_file.is_some()
            || self.cert.is_some()
            || self.cert_file.is_some()
            || self.key.is_some()
            || self.key_file.is_some()
            || self.insecure_skip_verify
    }
}

/// Credentials sent as an HTTP Basic `Authorization` header.
#[derive(Clone, Default, PartialEq, Eq, Serialize)]
pub struct BasicAuth {
    pub username: String,
    #[serde(skip)]
    pub password: String,
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Callback invoked while a download is written to disk.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Complete settings for one request.
#[derive(Clone, Default, Serialize)]
pub struct Config {
    pub url: String,
    pub method: Option<Method>,
    pub base_url: String,
    pub headers: Headers,
    pub query: KeyValues,
    pub params: KeyValues,
    #[serde(serialize_with = "serialize_body")]
    pub body: Body,
    /// `None` leaves the deadline to the defaults; zero disables it.
    pub timeout: Option<Duration>,
    pub proxy: String,
    pub tls: TlsConfig,
    pub unix_domain_socket: String,
    pub download_file_path: Option<PathBuf>,
    pub is_stream: bool,
    pub is_session: bool,
    pub compress_request: bool,
    pub basic_auth: Option<BasicAuth>,
    pub username: String,
    #[serde(skip)]
    pub password: String,
    #[serde(skip)]
    pub on_progress: Option<ProgressCallback>,
    #[serde(skip)]
    pub cancel: Option<CancellationToken>,
}

impl Config {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill the gaps of `self` from `other`.
    ///
    /// Empty strings, `None`, `false` and an empty body take `other`'s value;
    /// for headers, query and params only absent keys are copied.
    /// A `None` argument is a no-op.
    pub fn merge(&mut self, other: Option<&Config>) {
        let Some(other) = other else {
            return;
        };

        fill_string(&mut self.url, &other.url);
        fill_string(&mut self.base_url, &other.base_url);
        fill_string(&mut self.proxy, &other.proxy);
        fill_string(&mut self.unix_domain_socket, &other.unix_domain_socket);
        fill_string(&mut self.username, &other.username);
        fill_string(&mut self.password, &other.password);

        if self.method.is_none() {
            self.method = other.method;
        }
        if self.timeout.is_none() {
            self.timeout = other.timeout;
        }
        fill_option(&mut self.download_file_path, other.download_file_path.as_ref());
        fill_option(&mut self.basic_auth, other.basic_auth.as_ref());
        fill_option(&mut self.on_progress, other.on_progress.as_ref());
        fill_option(&mut self.cancel, other.cancel.as_ref());

        self.headers.merge(&other.headers);
        self.query.merge(&other.query);
        self.params.merge(&other.params);

        if self.body.is_empty() {
            self.body = other.body.clone();
        }

        self.tls.merge(&other.tls);
        self.is_stream |= other.is_stream;
        self.is_session |= other.is_session;
        self.compress_request |= other.compress_request;
    }

    /// Independent copy with `defaults` filling every unset field.
    #[must_use]
    pub fn clone_with(&self, defaults: &crate::Defaults) -> Config {
        let mut config = self.clone();
        config.merge(Some(&defaults.to_config()));
        config
    }

    /// Method to use on the wire, GET when unset.
    #[must_use]
    pub fn effective_method(&self) -> Method {
        self.method.unwrap_or(Method::Get)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("base_url", &self.base_url)
            .field("headers", &self.headers)
            .field("query", &self.query)
            .field("params", &self.params)
            .field("body", &self.body)
            .field("timeout", &self.timeout)
            .field("proxy", &self.proxy)
            .field("tls", &self.tls)
            .field("unix_domain_socket", &self.unix_domain_socket)
            .field("download_file_path", &self.download_file_path)
            .field("is_stream", &self.is_stream)
            .field("is_session", &self.is_session)
            .field("compress_request", &self.compress_request)
            .field("basic_auth", &self.basic_auth)
            .field("username", &self.username)
            .field("on_progress", &self.on_progress.is_some())
            .field("cancel", &self.cancel.is_some())
            .finish_non_exhaustive()
    }
}

fn fill_string(target: &mut String, source: &str) {
    if target.is_empty() && !source.is_empty() {
        source.clone_into(target);
    }
}

fn fill_option<T: Clone>(target: &mut Option<T>, source: Option<&T>) {
    if target.is_none() {
        *target = source.cloned();
    }
}
