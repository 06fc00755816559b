//! One-call helpers over [`Fetch`].
//!
//! Each helper accepts at most one [`Config`]; pass `None`, `[]` or
//! `Some(config)`. The config fills everything the helper itself does not set.

use crate::client::Fetch;
use crate::config::{BodyReader, Config, Method};
use crate::error::FetchError;
use crate::response::Response;
use std::path::PathBuf;

fn single_config(configs: impl IntoIterator<Item = Config>) -> Result<Config, FetchError> {
    let mut configs = configs.into_iter();
    let config = configs.next().unwrap_or_default();
    let extra = configs.count();
    if extra > 0 {
        return Err(FetchError::TooManyArguments { given: extra + 1 });
    }
    Ok(config)
}

fn bodyless_config(
    method: Method,
    configs: impl IntoIterator<Item = Config>,
) -> Result<Config, FetchError> {
    let config = single_config(configs)?;
    if !config.body.is_empty() {
        return Err(FetchError::BodyNotAllowed {
            method: method.into(),
        });
    }
    Ok(config)
}

/// # Errors
///
/// `BodyNotAllowed` if the config carries a body; otherwise see [`Fetch::execute`].
pub async fn head(
    url: impl Into<String>,
    configs: impl IntoIterator<Item = Config>,
) -> Result<Response, FetchError> {
    let config = bodyless_config(Method::Head, configs)?;
    Fetch::new().merge_config(&config).head(url).execute().await
}

/// # Errors
///
/// `BodyNotAllowed` if the config carries a body; otherwise see [`Fetch::execute`].
pub async fn get(
    url: impl Into<String>,
    configs: impl IntoIterator<Item = Config>,
) -> Result<Response, FetchError> {
    let config = bodyless_config(Method::Get, configs)?;
    Fetch::new().merge_config(&config).get(url).execute().await
}

/// # Errors
///
/// `TooManyArguments` for more than one config; otherwise see [`Fetch::execute`].
pub async fn post(
    url: impl Into<String>,
    configs: impl IntoIterator<Item = Config>,
) -> Result<Response, FetchError> {
    let config = single_config(configs)?;
    Fetch::new().merge_config(&config).post(url).execute().await
}

/// # Errors
///
/// `TooManyArguments` for more than one config; otherwise see [`Fetch::execute`].
pub async fn put(
    url: impl Into<String>,
    configs: impl IntoIterator<Item = Config>,
) -> Result<Response, FetchError> {
    let config = single_config(configs)?;
    Fetch::new().merge_config(&config).put(url).execute().await
}

/// # Errors
///
/// `TooManyArguments` for more than one config; otherwise see [`Fetch::execute`].
pub async fn patch(
    url: impl Into<String>,
    configs: impl IntoIterator<Item = Config>,
) -> Result<Response, FetchError> {
    let config = single_config(configs)?;
    Fetch::new().merge_config(&config).patch(url).execute().await
}

/// # Errors
///
/// `TooManyArguments` for more than one config; otherwise see [`Fetch::execute`].
pub async fn delete(
    url: impl Into<String>,
    configs: impl IntoIterator<Item = Config>,
) -> Result<Response, FetchError> {
    let config = single_config(configs)?;
    Fetch::new().merge_config(&config).delete(url).execute().await
}

/// GET `url` into the file at `path`.
///
/// # Errors
///
/// `TooManyArguments` for more than one config; otherwise see [`Fetch::execute`].
pub async fn download(
    url: impl Into<String>,
    path: impl Into<PathBuf>,
    configs: impl IntoIterator<Item = Config>,
) -> Result<Response, FetchError> {
    let config = single_config(configs)?;
    Fetch::new()
        .merge_config(&config)
        .download(url, path)
        .execute()
        .await
}

/// POST `reader` as the multipart file field `file`.
///
/// # Errors
///
/// `TooManyArguments` for more than one config; otherwise see [`Fetch::execute`].
pub async fn upload(
    url: impl Into<String>,
    reader: BodyReader,
    configs: impl IntoIterator<Item = Config>,
) -> Result<Response, FetchError> {
    let config = single_config(configs)?;
    Fetch::new()
        .upload(url, reader)
        .merge_config(&config)
        .execute()
        .await
}

/// Request `url` and return the live response stream.
///
/// # Errors
///
/// `TooManyArguments` for more than one config; otherwise see [`Fetch::execute`].
pub async fn stream(
    url: impl Into<String>,
    configs: impl IntoIterator<Item = Config>,
) -> Result<Response, FetchError> {
    let config = single_config(configs)?;
    Fetch::new()
        .merge_config(&config)
        .stream_from(url)
        .execute()
        .await
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::config::Body;
    use httpmock::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_too_many_configs() {
        let err = post("http://localhost/x", [Config::default(), Config::default()])
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TooManyArguments { given: 2 }));
    }

    #[tokio::test]
    async fn test_get_and_head_reject_body() {
        let config = Config {
            body: Body::from("payload"),
            ..Config::default()
        };
        let err = get("http://localhost/x", Some(config.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::BodyNotAllowed { ref method } if *method == http::Method::GET));

        let err = head("http://localhost/x", Some(config)).await.unwrap_err();
        assert!(matches!(err, FetchError::BodyNotAllowed { ref method } if *method == http::Method::HEAD));
    }

    #[tokio::test]
    async fn test_get_with_config() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(GET)
                .path("/items")
                .query_param("limit", "10")
                .header("x-client", "api-test");
            then.status(200).json_body(json!({"items": [1, 2, 3]}));
        });

        let mut config = Config::default();
        config.query.set("limit", "10");
        config.headers.set("x-client", "api-test");
        let resp = get(server.url("/items"), Some(config)).await.unwrap();

        m.assert();
        assert_eq!(resp.get("items").array().len(), 3);
    }

    #[tokio::test]
    async fn test_write_methods() {
        let server = MockServer::start();
        let post_m = server.mock(|when, then| {
            when.method(POST).path("/r");
            then.status(201);
        });
        let put_m = server.mock(|when, then| {
            when.method(PUT).path("/r");
            then.status(200);
        });
        let patch_m = server.mock(|when, then| {
            when.method(PATCH).path("/r");
            then.status(200);
        });
        let delete_m = server.mock(|when, then| {
            when.method(DELETE).path("/r");
            then.status(204);
        });

        assert_eq!(post(server.url("/r"), None).await.unwrap().status_code(), 201);
        assert!(put(server.url("/r"), None).await.unwrap().ok());
        assert!(patch(server.url("/r"), None).await.unwrap().ok());
        assert_eq!(delete(server.url("/r"), None).await.unwrap().status_code(), 204);

        post_m.assert();
        put_m.assert();
        patch_m.assert();
        delete_m.assert();
    }

    #[tokio::test]
    async fn test_download_helper() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(GET).path("/report.csv");
            then.status(200).body("a,b\n1,2\n");
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");
        let resp = download(server.url("/report.csv"), path.clone(), None).await.unwrap();

        assert_eq!(resp.download_path(), Some(path.as_path()));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a,b\n1,2\n");
    }

    #[tokio::test]
    async fn test_upload_helper() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/files")
                .body_includes("name=\"file\"; filename=\"file\"")
                .body_includes("bytes to send");
            then.status(200);
        });

        let reader = BodyReader::from_bytes("bytes to send");
        upload(server.url("/files"), reader, None).await.unwrap();

        m.assert();
    }

    #[tokio::test]
    async fn test_stream_helper() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(GET).path("/feed");
            then.status(200).body("line 1\nline 2\n");
        });

        let resp = stream(server.url("/feed"), None).await.unwrap();
        let body = resp.into_stream().unwrap().bytes().await.unwrap();
        assert_eq!(&body[..], b"line 1\nline 2\n");
    }
}
