#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Fluent HTTP fetch client for `ModKit`
//!
//! This crate provides a builder-style HTTP client with:
//! - Layered configuration (process defaults, builder calls, whole `Config` values)
//! - URL resolution against a base URL with `{name}`/`:name` path parameters
//! - Content-type driven body encoding (JSON, form, multipart, raw, octet-stream)
//! - Optional gzip request compression
//! - HTTP/HTTPS/SOCKS5 proxies, custom TLS material and Unix domain sockets
//! - Buffered, streamed or downloaded-to-file responses with progress reporting
//! - **Transparent response decompression** (gzip, brotli, deflate)
//! - Redirect following
//!
//! Buffered responses are queryable by path (`resp.get("data.items.0.id")`)
//! and decode into any `serde` type as JSON or YAML.
//!
//! Set `MODKIT_FETCH_DEBUG` to any non-empty value to log each resolved
//! request and response body on the `modkit_fetch::debug` target.
//!
//! # Example
//!
//! ```ignore
//! use modkit_fetch::{Fetch, api};
//! use serde_json::json;
//!
//! // one-shot helper
//! let resp = api::get("https://api.example.com/health", None).await?;
//! assert!(resp.ok());
//!
//! // builder
//! let created: User = Fetch::new()
//!     .base_url("https://api.example.com")
//!     .post("/users")
//!     .json(&json!({"name": "zero"}))
//!     .execute()
//!     .await?
//!     .error_for_status()?
//!     .unmarshal_json()?;
//! ```

pub mod api;
mod body;
mod client;
mod config;
mod cookie;
pub mod defaults;
mod error;
mod execute;
mod progress;
mod resolve;
mod response;
mod sniff;
mod tls;
mod transport;

pub use client::Fetch;
pub use config::{
    BasicAuth, Body, BodyReader, BodyValue, Config, Headers, KeyValues, Method, ProgressCallback,
    TlsConfig,
};
pub use cookie::{Cookie, CookieItem};
pub use defaults::{DEFAULT_TIMEOUT, DEFAULT_USER_AGENT, Defaults};
pub use error::{BoxError, FetchError, InvalidUrlKind};
pub use execute::DEBUG_ENV;
pub use progress::Progress;
pub use response::{BodyShape, Lookup, Response, ResponseStream};
pub use transport::ResponseBody;
