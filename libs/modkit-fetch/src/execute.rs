//! One HTTP round trip: resolve, encode, send, shape.
//!
//! The cancellation token is raced against the whole exchange. The timeout is
//! a deadline for sending plus buffering or downloading the body; stream
//! responses are only bounded up to the response head.

use crate::body::{Payload, encode_body, gzip};
use crate::config::{Body, Config, Method};
use crate::error::{FetchError, InvalidUrlKind};
use crate::progress::{Progress, ProgressTracker};
use crate::resolve::resolve_url;
use crate::response::{BodyShape, Response, ResponseStream};
use crate::tls;
use crate::transport::{RequestBody, ResponseBody, build_transport};
use base64::Engine;
use bytes::Bytes;
use http::header::{
    AUTHORIZATION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, PROXY_AUTHORIZATION,
};
use http::{HeaderMap, HeaderName, HeaderValue, Request, Uri};
use http_body_util::BodyExt;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tower::ServiceExt;
use url::Url;

/// Set to any non-empty value to log resolved requests and response bodies.
pub const DEBUG_ENV: &str = "MODKIT_FETCH_DEBUG";

const DEBUG_TARGET: &str = "modkit_fetch::debug";

#[derive(Debug, Clone, Copy)]
struct Deadline {
    timeout: Duration,
    at: Instant,
}

/// Execute an already resolved `config`.
///
/// `on_head` sees the response headers before the body is read, downloaded
/// or streamed.
pub(crate) async fn execute(
    mut resolved: Config,
    on_head: impl FnOnce(&HeaderMap),
) -> Result<Response, FetchError> {
    let method = resolved.effective_method();

    if method == Method::Get && !resolved.body.is_empty() {
        tracing::debug!("dropping body of GET request");
        resolved.body = Body::Empty;
    }

    if debug_enabled() {
        dump_request(&resolved);
    }

    let deadline = resolved
        .timeout
        .filter(|timeout| !timeout.is_zero())
        .map(|timeout| Deadline {
            timeout,
            at: Instant::now() + timeout,
        });

    match resolved.cancel.clone() {
        Some(token) => {
            tokio::select! {
                biased;
                () = token.cancelled() => {
                    tracing::debug!("request cancelled");
                    Err(FetchError::Cancelled)
                }
                result = exchange(resolved, method, deadline, on_head) => result,
            }
        }
        None => exchange(resolved, method, deadline, on_head).await,
    }
}

async fn exchange(
    config: Config,
    method: Method,
    deadline: Option<Deadline>,
    on_head: impl FnOnce(&HeaderMap),
) -> Result<Response, FetchError> {
    let url = resolve_url(&config)?;

    if config.tls.is_customized() {
        tracing::debug!("using custom TLS settings");
    }
    let material = tls::load_material(&config.tls).await?;
    let tls_config = tls::client_config(&material)?;
    let transport = build_transport(&config, tls_config)?;

    let request = build_request(&config, method, url, transport.proxy_authorization.as_ref()).await?;
    tracing::debug!(method = %method, uri = %request.uri(), "sending request");

    let response = within(deadline, transport.service.oneshot(request)).await?;
    let (parts, body) = response.into_parts();
    tracing::debug!(status = %parts.status, "received response");
    on_head(&parts.headers);

    let shape = if let Some(path) = config.download_file_path.clone() {
        let total = parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let bytes = within(
            deadline,
            download(body, &path, config.on_progress.as_deref(), total),
        )
        .await?;
        tracing::debug!(path = %path.display(), bytes, "download complete");
        BodyShape::Downloaded { path, bytes }
    } else if config.is_stream {
        BodyShape::Stream(ResponseStream::new(body))
    } else {
        BodyShape::Buffered(within(deadline, buffer(body)).await?)
    };

    let response = Response::new(parts.status, parts.headers, shape, config);
    if debug_enabled() {
        dump_response(&response);
    }
    Ok(response)
}

async fn build_request(
    config: &Config,
    method: Method,
    mut url: Url,
    proxy_authorization: Option<&HeaderValue>,
) -> Result<Request<RequestBody>, FetchError> {
    let userinfo = take_userinfo(&mut url);
    let uri: Uri = url
        .as_str()
        .parse()
        .map_err(|e| FetchError::invalid_url(url.as_str(), InvalidUrlKind::ParseError, e))?;

    let mut headers = HeaderMap::with_capacity(config.headers.len());
    for (name, value) in config.headers.iter() {
        if value.is_empty() {
            continue;
        }
        headers.insert(
            HeaderName::from_bytes(name.as_bytes())?,
            HeaderValue::from_str(value)?,
        );
    }

    if !headers.contains_key(AUTHORIZATION)
        && let Some(value) = basic_authorization(config, userinfo)
    {
        headers.insert(AUTHORIZATION, value);
    }
    if let Some(value) = proxy_authorization
        && uri.scheme_str() == Some("http")
    {
        headers.insert(PROXY_AUTHORIZATION, value.clone());
    }

    let explicit_content_type = config.headers.get("content-type").filter(|v| !v.is_empty());
    let encoded = encode_body(&config.body, explicit_content_type).await?;
    if let Some(content_type) = &encoded.content_type {
        headers.insert(CONTENT_TYPE, HeaderValue::from_str(content_type)?);
    }

    let payload = if config.compress_request {
        compress(encoded.payload, &mut headers).await?
    } else {
        encoded.payload
    };

    let body = match payload {
        Payload::Empty => RequestBody::empty(),
        Payload::Bytes(bytes) => {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
            RequestBody::full(bytes)
        }
        Payload::Stream(reader) => RequestBody::stream(reader.take()?),
    };

    let mut request = Request::builder()
        .method(http::Method::from(method))
        .uri(uri)
        .body(body)?;
    *request.headers_mut() = headers;
    Ok(request)
}

/// Strip `user:password@` from `url`, returning the decoded pair.
fn take_userinfo(url: &mut Url) -> Option<(String, String)> {
    if url.username().is_empty() && url.password().is_none() {
        return None;
    }
    let decode = |raw: &str| {
        urlencoding::decode(raw).map_or_else(|_| raw.to_owned(), std::borrow::Cow::into_owned)
    };
    let credentials = (decode(url.username()), decode(url.password().unwrap_or_default()));
    // Both setters only fail for URLs that cannot carry credentials.
    if url.set_username("").and(url.set_password(None)).is_err() {
        tracing::debug!(url = %url, "url cannot carry credentials");
    }
    Some(credentials)
}

/// `Basic` credentials from, in order: `basic_auth`, `username`/`password`,
/// URL userinfo.
fn basic_authorization(config: &Config, userinfo: Option<(String, String)>) -> Option<HeaderValue> {
    let (username, password) = if let Some(auth) = &config.basic_auth {
        (auth.username.clone(), auth.password.clone())
    } else if !config.username.is_empty() || !config.password.is_empty() {
        (config.username.clone(), config.password.clone())
    } else {
        userinfo?
    };
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
    let mut value = HeaderValue::from_str(&format!("Basic {encoded}")).ok()?;
    value.set_sensitive(true);
    Some(value)
}

async fn compress(payload: Payload, headers: &mut HeaderMap) -> Result<Payload, FetchError> {
    let raw = match payload {
        Payload::Empty => return Ok(Payload::Empty),
        Payload::Bytes(bytes) => bytes.to_vec(),
        Payload::Stream(reader) => reader.read_all().await?,
    };
    let compressed = gzip(&raw)?;
    tracing::trace!(
        original = raw.len(),
        compressed = compressed.len(),
        "compressed request body"
    );
    headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    Ok(Payload::Bytes(Bytes::from(compressed)))
}

async fn within<T>(
    deadline: Option<Deadline>,
    fut: impl Future<Output = Result<T, FetchError>>,
) -> Result<T, FetchError> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline.at, fut)
            .await
            .map_err(|_| FetchError::Timeout(deadline.timeout))?,
        None => fut.await,
    }
}

async fn buffer(body: ResponseBody) -> Result<Bytes, FetchError> {
    Ok(body
        .collect()
        .await
        .map_err(FetchError::ReadingResponse)?
        .to_bytes())
}

/// Copy `body` into `path`, returning the number of bytes written.
///
/// The file is created or truncated and closed on every return path.
async fn download(
    mut body: ResponseBody,
    path: &Path,
    on_progress: Option<&(dyn Fn(Progress) + Send + Sync)>,
    total: Option<u64>,
) -> Result<u64, FetchError> {
    let download_error = |source: std::io::Error| FetchError::Download {
        path: path.to_path_buf(),
        source,
    };

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await
        .map_err(download_error)?;

    let mut progress = ProgressTracker::new(on_progress, total);
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(FetchError::ReadingResponse)?;
        if let Ok(data) = frame.into_data() {
            file.write_all(&data).await.map_err(download_error)?;
            progress.advance(data.len());
        }
    }
    file.flush().await.map_err(download_error)?;

    Ok(progress.written())
}

fn debug_enabled() -> bool {
    std::env::var_os(DEBUG_ENV).is_some_and(|v| !v.is_empty())
}

fn dump_request(config: &Config) {
    match serde_json::to_string_pretty(config) {
        Ok(json) => tracing::info!(target: DEBUG_TARGET, config = %json, "request"),
        Err(e) => tracing::info!(target: DEBUG_TARGET, error = %e, "request config not serializable"),
    }
}

fn dump_response(response: &Response) {
    let body = match response.shape() {
        BodyShape::Buffered(bytes) => {
            let is_json = response
                .content_type()
                .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"));
            match response.to_pretty_json() {
                Ok(pretty) if is_json => pretty,
                _ => String::from_utf8_lossy(bytes).into_owned(),
            }
        }
        BodyShape::Stream(_) => "<stream>".to_owned(),
        BodyShape::Downloaded { path, bytes } => format!("<{bytes} bytes written to {}>", path.display()),
    };
    tracing::info!(
        target: DEBUG_TARGET,
        status = response.status_code(),
        body = %body,
        "response"
    );
}
