//! Outbound transport selection.
//!
//! Every execution builds its own hyper client on top of a [`Dialer`] that
//! knows how to reach the target: directly over TCP, through an HTTP(S)
//! proxy (absolute-form for `http` targets, `CONNECT` tunnel for `https`),
//! through a SOCKS5 proxy, or over a Unix domain socket. TLS to the target
//! is layered on top by `hyper-rustls`.

use crate::config::Config;
use crate::error::{BoxError, FetchError, InvalidUrlKind};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::HeaderValue;
use http::{Request, Response, Uri};
use http_body::{Body, Frame, SizeHint};
use http_body_util::combinators::{BoxBody, UnsyncBoxBody};
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::proxy::{SocksV5, Tunnel};
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::rt::{TokioExecutor, TokioIo};
use pin_project_lite::pin_project;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tower::util::BoxCloneService;
use tower::{ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;
use tower_http::follow_redirect::FollowRedirectLayer;

/// Decompressed response body.
pub type ResponseBody = BoxBody<Bytes, BoxError>;

/// Type-erased client service used by the execution engine.
pub(crate) type HttpService = BoxCloneService<Request<RequestBody>, Response<ResponseBody>, FetchError>;

const SOCKS_DEFAULT_PORT: u16 = 1080;

pin_project! {
    /// Outgoing request body: in-memory bytes or a streamed reader.
    pub(crate) struct RequestBody {
        #[pin]
        inner: UnsyncBoxBody<Bytes, BoxError>,
    }
}

impl RequestBody {
    pub(crate) fn empty() -> Self {
        Self {
            inner: Empty::new().map_err(|never| match never {}).boxed_unsync(),
        }
    }

    pub(crate) fn full(bytes: impl Into<Bytes>) -> Self {
        Self {
            inner: Full::new(bytes.into())
                .map_err(|never| match never {})
                .boxed_unsync(),
        }
    }

    /// Chunked body pulled from `reader` while the request is sent.
    pub(crate) fn stream(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        let frames = ReaderStream::new(reader)
            .map_ok(Frame::data)
            .map_err(|e| -> BoxError { Box::new(e) });
        Self {
            inner: StreamBody::new(frames).boxed_unsync(),
        }
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl Body for RequestBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.project().inner.poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Parsed proxy URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProxySpec {
    pub kind: ProxyKind,
    /// Proxy address without credentials
    pub uri: Uri,
    pub credentials: Option<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProxyKind {
    Http,
    /// `local_dns` is true for `socks5`, false for `socks5h`
    Socks5 { local_dns: bool },
}

impl ProxySpec {
    /// Basic credentials for `Proxy-Authorization`.
    pub(crate) fn authorization(&self) -> Option<HeaderValue> {
        let (user, pass) = self.credentials.as_ref()?;
        let encoded = STANDARD.encode(format!("{user}:{pass}"));
        HeaderValue::from_str(&format!("Basic {encoded}")).ok()
    }
}

/// Parse and validate a proxy URL.
pub(crate) fn parse_proxy(raw: &str) -> Result<ProxySpec, FetchError> {
    let url = url::Url::parse(raw)
        .map_err(|e| FetchError::invalid_url(raw, InvalidUrlKind::ParseError, e))?;

    let kind = match url.scheme() {
        "http" | "https" => ProxyKind::Http,
        "socks5" => ProxyKind::Socks5 { local_dns: true },
        "socks5h" => ProxyKind::Socks5 { local_dns: false },
        _ => return Err(FetchError::UnsupportedProxy(raw.to_owned())),
    };

    let Some(host) = url.host_str() else {
        return Err(FetchError::invalid_url(
            raw,
            InvalidUrlKind::MissingHost,
            "proxy url has no host",
        ));
    };
    let port = url.port_or_known_default().unwrap_or(SOCKS_DEFAULT_PORT);
    let uri: Uri = format!("{}://{host}:{port}", url.scheme())
        .parse()
        .map_err(|e| FetchError::invalid_url(raw, InvalidUrlKind::ParseError, e))?;

    let credentials = (!url.username().is_empty()).then(|| {
        (
            decode_userinfo(url.username()),
            decode_userinfo(url.password().unwrap_or_default()),
        )
    });

    Ok(ProxySpec {
        kind,
        uri,
        credentials,
    })
}

fn decode_userinfo(raw: &str) -> String {
    urlencoding::decode(raw).map_or_else(|_| raw.to_owned(), std::borrow::Cow::into_owned)
}

/// How the dialer reaches the target.
enum Route {
    Direct(HttpConnector),
    #[cfg(unix)]
    Unix(PathBuf),
    HttpProxy {
        proxy: Uri,
        connector: HttpsConnector<HttpConnector>,
        authorization: Option<HeaderValue>,
    },
    Socks {
        proxy: Uri,
        connector: HttpConnector,
        local_dns: bool,
        credentials: Option<(String, String)>,
    },
}

/// Connector service handed to `hyper-rustls`.
#[derive(Clone)]
pub(crate) struct Dialer {
    route: Arc<Route>,
}

impl Dialer {
    async fn connect(route: Arc<Route>, dst: Uri) -> Result<Conn, BoxError> {
        match &*route {
            Route::Direct(http) => {
                let io = http.clone().oneshot(dst).await?;
                Ok(Conn::new(io, false))
            }
            #[cfg(unix)]
            Route::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Conn::new(TokioIo::new(stream), false))
            }
            Route::HttpProxy {
                proxy,
                connector,
                authorization,
            } => {
                if dst.scheme() == Some(&http::uri::Scheme::HTTPS) {
                    let mut tunnel = Tunnel::new(proxy.clone(), connector.clone());
                    if let Some(auth) = authorization {
                        tunnel = tunnel.with_auth(auth.clone());
                    }
                    let io = tunnel.oneshot(dst).await?;
                    Ok(Conn::new(io, false))
                } else {
                    let io = connector.clone().oneshot(proxy.clone()).await?;
                    Ok(Conn::new(io, true))
                }
            }
            Route::Socks {
                proxy,
                connector,
                local_dns,
                credentials,
            } => {
                let mut socks = SocksV5::new(proxy.clone(), connector.clone()).local_dns(*local_dns);
                if let Some((user, pass)) = credentials {
                    socks = socks.with_auth(user.clone(), pass.clone());
                }
                let io = socks.oneshot(dst).await?;
                Ok(Conn::new(io, false))
            }
        }
    }
}

impl tower::Service<Uri> for Dialer {
    type Response = Conn;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Conn, BoxError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        Box::pin(Self::connect(self.route.clone(), dst))
    }
}

trait Io: hyper::rt::Read + hyper::rt::Write + Send + Unpin {}
impl<T: hyper::rt::Read + hyper::rt::Write + Send + Unpin> Io for T {}

/// Established connection, tagged with whether it speaks to a forward proxy.
pub(crate) struct Conn {
    io: Box<dyn Io>,
    forward_proxy: bool,
}

impl Conn {
    fn new(io: impl Io + 'static, forward_proxy: bool) -> Self {
        Self {
            io: Box::new(io),
            forward_proxy,
        }
    }
}

impl Connection for Conn {
    fn connected(&self) -> Connected {
        Connected::new().proxy(self.forward_proxy)
    }
}

impl hyper::rt::Read for Conn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.io).poll_read(cx, buf)
    }
}

impl hyper::rt::Write for Conn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut *self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.io).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.io).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut *self.io).poll_write_vectored(cx, bufs)
    }
}

/// Client plus what the request builder needs to know about the route.
pub(crate) struct Transport {
    pub service: HttpService,
    /// Set for HTTP proxies with credentials; sent on plain-http requests
    pub proxy_authorization: Option<HeaderValue>,
}

/// Build the transport for `config` with the given TLS settings.
///
/// Proxy validation happens here, before any I/O.
pub(crate) fn build_transport(
    config: &Config,
    tls: rustls::ClientConfig,
) -> Result<Transport, FetchError> {
    let proxy = if config.proxy.is_empty() {
        None
    } else {
        Some(parse_proxy(&config.proxy)?)
    };
    let unix_socket = config
        .unix_domain_socket
        .strip_prefix("unix://")
        .unwrap_or(&config.unix_domain_socket);

    if proxy.is_some() && !unix_socket.is_empty() {
        return Err(FetchError::ConflictingTransport);
    }

    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_nodelay(true);

    let mut proxy_authorization = None;
    let route = match proxy {
        Some(target) => {
            tracing::debug!(proxy = %target.uri, kind = ?target.kind, "using proxy");
            match target.kind {
                ProxyKind::Http => {
                    let connector = HttpsConnectorBuilder::new()
                        .with_tls_config(tls.clone())
                        .https_or_http()
                        .enable_http1()
                        .wrap_connector(http);
                    proxy_authorization = target.authorization();
                    Route::HttpProxy {
                        proxy: target.uri,
                        connector,
                        authorization: proxy_authorization.clone(),
                    }
                }
                ProxyKind::Socks5 { local_dns } => Route::Socks {
                    proxy: target.uri,
                    connector: http,
                    local_dns,
                    credentials: target.credentials,
                },
            }
        }
        None if !unix_socket.is_empty() => unix_route(unix_socket)?,
        None => Route::Direct(http),
    };

    let https = HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_all_versions()
        .wrap_connector(Dialer {
            route: Arc::new(route),
        });
    let client = Client::builder(TokioExecutor::new()).build::<_, RequestBody>(https);

    // Decompression sits outside redirects so every hop's final body is decoded once.
    let service = ServiceBuilder::new()
        .layer(DecompressionLayer::new())
        .layer(FollowRedirectLayer::new())
        .service(client)
        .map_response(map_decompression_response)
        .map_err(FetchError::from)
        .boxed_clone();

    Ok(Transport {
        service,
        proxy_authorization,
    })
}

#[cfg(unix)]
fn unix_route(path: &str) -> Result<Route, FetchError> {
    tracing::debug!(socket = path, "using unix domain socket");
    Ok(Route::Unix(PathBuf::from(path)))
}

#[cfg(not(unix))]
fn unix_route(path: &str) -> Result<Route, FetchError> {
    Err(FetchError::SendingRequest(
        format!("unix domain sockets are not supported on this platform: {path}").into(),
    ))
}

/// Box the decompression body into [`ResponseBody`].
fn map_decompression_response<B>(response: Response<B>) -> Response<ResponseBody>
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, body.map_err(Into::into).boxed())
}
