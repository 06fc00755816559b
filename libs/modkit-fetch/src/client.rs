use crate::config::{BasicAuth, Body, BodyReader, Config, Headers, Method};
use crate::cookie::Cookie;
use crate::defaults::Defaults;
use crate::error::FetchError;
use crate::execute::execute;
use crate::progress::Progress;
use crate::response::Response;
use http::HeaderMap;
use http::header::SET_COOKIE;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Invalid builder input, replayed by every `execute()` call.
#[derive(Debug, Clone)]
enum BuildError {
    Method(String),
    EmptyCookieKey,
    Json(String),
}

impl BuildError {
    fn to_error(&self) -> FetchError {
        match self {
            BuildError::Method(method) => FetchError::InvalidMethod(method.clone()),
            BuildError::EmptyCookieKey => FetchError::EmptyCookieKey,
            BuildError::Json(msg) => FetchError::InvalidJsonBody(serde::ser::Error::custom(msg)),
        }
    }
}

/// Fluent HTTP request builder.
///
/// Builder methods accumulate into a [`Config`]; the first invalid input is
/// recorded and returned by [`execute()`](Fetch::execute) before any I/O.
/// Defaults are captured when the builder is created and fill only the
/// fields the caller left unset.
///
/// # Session mode
///
/// With [`session()`](Fetch::session), every execution copies the response's
/// `Set-Cookie` pairs into this builder's `cookie` header. That mutates the
/// builder, so concurrent executions need their own [`fork()`](Fetch::fork)
/// or external synchronization.
///
/// # Example
///
/// ```ignore
/// use modkit_fetch::Fetch;
///
/// let resp = Fetch::new()
///     .base_url("https://api.example.com")
///     .bearer_token("t0k3n")
///     .get("/users/{id}")
///     .param("id", "42")
///     .execute()
///     .await?;
///
/// let name = resp.get("data.name").string();
/// ```
#[must_use = "Fetch does nothing until .execute() is called"]
#[derive(Debug)]
pub struct Fetch {
    config: Config,
    defaults: Defaults,
    /// First error captured during building (deferred to `execute()`)
    error: Option<BuildError>,
}

impl Default for Fetch {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetch {
    /// Builder seeded with the process-wide [`Defaults`].
    pub fn new() -> Self {
        Self::with_defaults(Defaults::current())
    }

    pub fn with_defaults(defaults: Defaults) -> Self {
        Self {
            config: Config::default(),
            defaults,
            error: None,
        }
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config,
            ..Self::new()
        }
    }

    fn record(&mut self, err: BuildError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Accumulated configuration, or the first recorded builder error.
    ///
    /// # Errors
    ///
    /// Returns the deferred builder error, if any.
    pub fn config(&self) -> Result<&Config, FetchError> {
        match &self.error {
            Some(err) => Err(err.to_error()),
            None => Ok(&self.config),
        }
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.config.method = Some(method);
        self
    }

    /// Set the method by name; anything outside the supported set is
    /// recorded as `InvalidMethod`.
    pub fn method_str(mut self, method: &str) -> Self {
        match method.parse() {
            Ok(method) => self.config.method = Some(method),
            Err(_) => self.record(BuildError::Method(method.to_owned())),
        }
        self
    }

    /// Set a header, replacing any value stored under another spelling.
    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.config.headers.set(key, value);
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.query.set(key, value);
        self
    }

    /// Path parameter substituted into `{name}` and `:name` placeholders.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.params.set(key, value);
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.config.body = body.into();
        self
    }

    /// JSON body from any serializable object.
    pub fn json<T: serde::Serialize + ?Sized>(mut self, value: &T) -> Self {
        match Body::json(value) {
            Ok(body) => self.config.body = body,
            Err(e) => {
                let msg = if let FetchError::InvalidJsonBody(inner) = &e {
                    inner.to_string()
                } else {
                    e.to_string()
                };
                self.record(BuildError::Json(msg));
            }
        }
        self
    }

    /// Flat string fields; sent as JSON unless a form content type is set.
    pub fn form<K, V>(mut self, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.config.body = Body::flat(fields);
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = base_url.into();
        self
    }

    /// Round-trip deadline; zero disables it.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn user_agent(self, user_agent: impl Into<String>) -> Self {
        self.header("user-agent", user_agent)
    }

    pub fn content_type(self, content_type: impl Into<String>) -> Self {
        self.header("content-type", content_type)
    }

    pub fn accept(self, accept: impl Into<String>) -> Self {
        self.header("accept", accept)
    }

    pub fn authorization(self, value: impl Into<String>) -> Self {
        self.header("authorization", value)
    }

    pub fn bearer_token(self, token: &str) -> Self {
        self.authorization(format!("Bearer {token}"))
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.basic_auth = Some(BasicAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Add or replace one pair in the `cookie` header.
    ///
    /// An empty key is recorded as `EmptyCookieKey`.
    pub fn cookie(mut self, key: &str, value: impl Into<String>) -> Self {
        if set_cookie(&mut self.config.headers, key, value).is_err() {
            self.record(BuildError::EmptyCookieKey);
        }
        self
    }

    /// Proxy URL: `http`, `https`, `socks5` or `socks5h`.
    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.config.proxy = proxy.into();
        self
    }

    /// PEM CA bundle replacing the platform roots.
    pub fn tls_ca_cert(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.config.tls.ca_cert = Some(pem.into());
        self
    }

    pub fn tls_ca_cert_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tls.ca_cert_file = Some(path.into());
        self
    }

    /// PEM client certificate chain; used together with the key.
    pub fn tls_cert(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.config.tls.cert = Some(pem.into());
        self
    }

    pub fn tls_cert_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tls.cert_file = Some(path.into());
        self
    }

    pub fn tls_key(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.config.tls.key = Some(pem.into());
        self
    }

    pub fn tls_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tls.key_file = Some(path.into());
        self
    }

    /// Accept any server certificate. Test servers only.
    pub fn tls_insecure_skip_verify(mut self, skip: bool) -> Self {
        self.config.tls.insecure_skip_verify = skip;
        self
    }

    /// Connect through a Unix domain socket (`unix://` prefix optional).
    pub fn unix_domain_socket(mut self, path: impl Into<String>) -> Self {
        self.config.unix_domain_socket = path.into();
        self
    }

    pub fn download_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.download_file_path = Some(path.into());
        self
    }

    /// Expose the response body as a live stream.
    pub fn stream(mut self) -> Self {
        self.config.is_stream = true;
        self
    }

    /// Carry response cookies into later executions of this builder.
    pub fn session(mut self) -> Self {
        self.config.is_session = true;
        self
    }

    /// Gzip the request body.
    pub fn compress_request(mut self) -> Self {
        self.config.compress_request = true;
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(Progress) + Send + Sync + 'static) -> Self {
        self.config.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.config.cancel = Some(token);
        self
    }

    /// Merge a whole configuration, filling only unset fields.
    pub fn merge_config(mut self, config: &Config) -> Self {
        self.config.merge(Some(config));
        self
    }

    pub fn head(self, url: impl Into<String>) -> Self {
        self.method(Method::Head).url(url)
    }

    pub fn get(self, url: impl Into<String>) -> Self {
        self.method(Method::Get).url(url)
    }

    pub fn post(self, url: impl Into<String>) -> Self {
        self.method(Method::Post).url(url)
    }

    pub fn put(self, url: impl Into<String>) -> Self {
        self.method(Method::Put).url(url)
    }

    pub fn patch(self, url: impl Into<String>) -> Self {
        self.method(Method::Patch).url(url)
    }

    pub fn delete(self, url: impl Into<String>) -> Self {
        self.method(Method::Delete).url(url)
    }

    /// GET `url` straight into the file at `path`.
    pub fn download(self, url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.get(url).download_file_path(path)
    }

    /// POST `reader` as the multipart file field `file`.
    pub fn upload(self, url: impl Into<String>, reader: BodyReader) -> Self {
        self.post(url)
            .content_type("multipart/form-data")
            .body(Body::structured([("file", reader)]))
    }

    /// Stream the response of `url`; GET unless a method was already set.
    pub fn stream_from(mut self, url: impl Into<String>) -> Self {
        if self.config.method.is_none() {
            self.config.method = Some(Method::Get);
        }
        self.url(url).stream()
    }

    /// Independent builder starting from the defaults merged with this
    /// configuration. Recorded errors are not carried over.
    pub fn fork(&self) -> Self {
        Self {
            config: self.config.clone_with(&self.defaults),
            defaults: self.defaults.clone(),
            error: None,
        }
    }

    /// Send the request.
    ///
    /// A recorded builder error is returned by every call, before any I/O.
    /// In session mode the response cookies are stored as soon as the
    /// response head arrives, so they survive a failed download.
    ///
    /// # Errors
    ///
    /// Returns the first deferred builder error, or the failure of the stage
    /// that broke: URL resolution, TLS loading, transport setup, body
    /// encoding, sending, or reading the response.
    pub async fn execute(&mut self) -> Result<Response, FetchError> {
        if let Some(err) = &self.error {
            return Err(err.to_error());
        }

        let resolved = self.config.clone_with(&self.defaults);
        let session = resolved.is_session;
        let headers = &mut self.config.headers;
        execute(resolved, move |response_headers| {
            if session {
                capture_cookies(headers, response_headers);
            }
        })
        .await
    }

    /// Alias of [`execute()`](Fetch::execute).
    ///
    /// # Errors
    ///
    /// See [`execute()`](Fetch::execute).
    pub async fn send(&mut self) -> Result<Response, FetchError> {
        self.execute().await
    }

    /// Re-send a copy of this request after applying `mutate` to its
    /// configuration. Nothing is retried automatically.
    ///
    /// # Errors
    ///
    /// See [`execute()`](Fetch::execute).
    pub async fn retry(&self, mutate: impl FnOnce(&mut Config)) -> Result<Response, FetchError> {
        if let Some(err) = &self.error {
            return Err(err.to_error());
        }
        let mut attempt = self.fork();
        mutate(&mut attempt.config);
        attempt.execute().await
    }
}

/// Add or replace one pair in the `cookie` entry of `headers`.
fn set_cookie(headers: &mut Headers, key: &str, value: impl Into<String>) -> Result<(), FetchError> {
    let mut cookie = Cookie::parse(headers.get("cookie").unwrap_or_default());
    cookie.set(key, value)?;
    headers.set("cookie", cookie.to_string());
    Ok(())
}

/// Copy the `name=value` part of every `Set-Cookie` into `headers`.
fn capture_cookies(headers: &mut Headers, response: &HeaderMap) {
    for raw in response
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
    {
        let pair = raw.split(';').next().and_then(|p| p.split_once('='));
        let Some((name, value)) = pair else {
            tracing::warn!(cookie = raw, "ignoring unparsable Set-Cookie");
            continue;
        };
        if let Err(e) = set_cookie(headers, name.trim(), value.trim()) {
            tracing::warn!(cookie = raw, error = %e, "ignoring unparsable Set-Cookie");
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::config::Method;
    use httpmock::prelude::*;
    use serde_json::json;

    fn test_fetch() -> Fetch {
        Fetch::with_defaults(Defaults::default())
    }

    #[test]
    fn test_invalid_method_is_deferred() {
        let fetch = test_fetch().method_str("FETCH").method_str("BREW");
        match fetch.config() {
            Err(FetchError::InvalidMethod(m)) => assert_eq!(m, "FETCH"),
            other => panic!("expected InvalidMethod, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deferred_error_returned_before_io() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.path("/x");
            then.status(200);
        });

        let mut fetch = test_fetch().get(server.url("/x")).cookie("", "v");
        let err = fetch.execute().await.unwrap_err();

        assert!(matches!(err, FetchError::EmptyCookieKey));
        m.assert_hits(0);
    }

    #[tokio::test]
    async fn test_deferred_error_survives_repeated_execute() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.path("/x");
            then.status(200);
        });

        let mut fetch = test_fetch().url(server.url("/x")).method_str("BREW");
        for _ in 0..2 {
            match fetch.execute().await {
                Err(FetchError::InvalidMethod(m)) => assert_eq!(m, "BREW"),
                other => panic!("expected InvalidMethod, got {other:?}"),
            }
        }
        assert!(matches!(
            fetch.retry(|_| {}).await,
            Err(FetchError::InvalidMethod(_))
        ));
        assert!(fetch.config().is_err());
        m.assert_hits(0);
    }

    #[tokio::test]
    async fn test_invalid_json_body_error_is_replayed() {
        let mut fetch = test_fetch()
            .post("http://api.local/x")
            .json(&std::collections::HashMap::from([((1, 2), "v")]));

        assert!(matches!(
            fetch.execute().await,
            Err(FetchError::InvalidJsonBody(_))
        ));
        assert!(matches!(
            fetch.execute().await,
            Err(FetchError::InvalidJsonBody(_))
        ));
    }

    #[test]
    fn test_cookie_setter_updates_header() {
        let fetch = test_fetch()
            .header("Cookie", "a=1; b=2")
            .cookie("b", "3")
            .cookie("c", "4");
        let config = fetch.config().unwrap();
        assert_eq!(config.headers.get("cookie"), Some("a=1; b=3; c=4"));
    }

    #[test]
    fn test_header_helpers() {
        let fetch = test_fetch()
            .user_agent("fetch-test/1.0")
            .accept("application/json")
            .content_type("text/csv")
            .bearer_token("t0k3n");
        let headers = &fetch.config().unwrap().headers;
        assert_eq!(headers.get("User-Agent"), Some("fetch-test/1.0"));
        assert_eq!(headers.get("accept"), Some("application/json"));
        assert_eq!(headers.get("content-type"), Some("text/csv"));
        assert_eq!(headers.get("authorization"), Some("Bearer t0k3n"));
    }

    #[test]
    fn test_stream_from_keeps_explicit_method() {
        let fetch = test_fetch().method(Method::Post).stream_from("/events");
        let config = fetch.config().unwrap();
        assert_eq!(config.method, Some(Method::Post));
        assert!(config.is_stream);

        let fetch = test_fetch().stream_from("/events");
        assert_eq!(fetch.config().unwrap().method, Some(Method::Get));
    }

    #[test]
    fn test_fork_starts_from_defaults_and_drops_errors() {
        let defaults = Defaults::default().with_base_url("http://api.local");
        let fetch = Fetch::with_defaults(defaults)
            .header("x-trace", "1")
            .method_str("NOPE");
        let fork = fetch.fork();

        let config = fork.config().unwrap();
        assert_eq!(config.base_url, "http://api.local");
        assert_eq!(config.headers.get("x-trace"), Some("1"));
        assert!(fetch.config().is_err());
    }

    #[tokio::test]
    async fn test_session_replays_cookies() {
        let server = MockServer::start();
        let login = server.mock(|when, then| {
            when.method(POST).path("/login");
            then.status(200)
                .header("set-cookie", "sid=abc; Path=/; HttpOnly");
        });
        let me = server.mock(|when, then| {
            when.method(GET).path("/me").header("cookie", "sid=abc");
            then.status(200).json_body(json!({"user": "zero"}));
        });

        let mut fetch = test_fetch().session().post(server.url("/login"));
        fetch.execute().await.unwrap();
        login.assert();

        let mut fetch = fetch.get(server.url("/me"));
        let resp = fetch.execute().await.unwrap();
        me.assert();
        assert_eq!(resp.get("user").string(), "zero");
    }

    #[tokio::test]
    async fn test_session_keeps_cookies_when_download_fails() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.path("/report.csv");
            then.status(200)
                .header("set-cookie", "sid=abc; Path=/")
                .body("a,b\n");
        });

        let mut fetch = test_fetch()
            .session()
            .get(server.url("/report.csv"))
            .download_file_path("/nonexistent/modkit-fetch/report.csv");
        let err = fetch.execute().await.unwrap_err();

        assert!(matches!(err, FetchError::Download { .. }));
        assert_eq!(fetch.config().unwrap().headers.get("cookie"), Some("sid=abc"));
    }

    #[tokio::test]
    async fn test_without_session_cookies_are_not_kept() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.path("/login");
            then.status(200).header("set-cookie", "sid=abc");
        });

        let mut fetch = test_fetch().get(server.url("/login"));
        fetch.execute().await.unwrap();
        assert!(fetch.config().unwrap().headers.get("cookie").is_none());
    }

    #[tokio::test]
    async fn test_retry_applies_mutation() {
        let server = MockServer::start();
        let first = server.mock(|when, then| {
            when.path("/flaky").header_missing("x-attempt");
            then.status(503);
        });
        let second = server.mock(|when, then| {
            when.path("/flaky").header("x-attempt", "2");
            then.status(200);
        });

        let mut fetch = test_fetch().get(server.url("/flaky"));
        let resp = fetch.execute().await.unwrap();
        assert_eq!(resp.status_code(), 503);

        let resp = fetch
            .retry(|config| config.headers.set("x-attempt", "2"))
            .await
            .unwrap();
        assert!(resp.ok());
        first.assert_hits(1);
        second.assert_hits(1);
    }

    #[tokio::test]
    async fn test_upload_multipart() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/upload")
                .header_exists("content-type")
                .body_includes("name=\"file\"; filename=\"notes.txt\"")
                .body_includes("hello upload");
            then.status(200);
        });

        let reader = BodyReader::named("notes.txt", std::io::Cursor::new(b"hello upload".to_vec()));
        let mut fetch = test_fetch().upload(server.url("/upload"), reader);
        fetch.execute().await.unwrap();

        m.assert();
    }

    #[tokio::test]
    async fn test_form_fields_with_form_content_type() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/token")
                .header("content-type", "application/x-www-form-urlencoded")
                .body("grant_type=client_credentials&scope=read");
            then.status(200);
        });

        let mut fetch = test_fetch()
            .post(server.url("/token"))
            .content_type("application/x-www-form-urlencoded")
            .form([("grant_type", "client_credentials"), ("scope", "read")]);
        fetch.execute().await.unwrap();

        m.assert();
    }
}
