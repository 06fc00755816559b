//! Request body encoding.
//!
//! The content type, explicit or inferred, selects the encoder by substring
//! match. Body shapes that do not fit the selected encoder are rejected here,
//! before any connection is opened.

use crate::config::{Body, BodyReader, BodyValue};
use crate::error::FetchError;
use crate::sniff::detect_content_type;
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use indexmap::IndexMap;
use rand::Rng;
use std::io::Write;

pub(crate) const APPLICATION_JSON: &str = "application/json";
pub(crate) const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
pub(crate) const MULTIPART_FORM_DATA: &str = "multipart/form-data";
pub(crate) const OCTET_STREAM: &str = "application/octet-stream";
pub(crate) const TEXT_PLAIN: &str = "text/plain";

/// Bytes or stream ready to be attached to the outgoing request.
#[derive(Debug)]
pub(crate) enum Payload {
    Empty,
    Bytes(Bytes),
    Stream(BodyReader),
}

#[derive(Debug)]
pub(crate) struct EncodedBody {
    /// Content type to send; `None` leaves the request headers untouched
    pub content_type: Option<String>,
    pub payload: Payload,
}

impl EncodedBody {
    fn new(content_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            content_type: Some(content_type.into()),
            payload,
        }
    }
}

/// Content type used when the caller did not set one.
pub(crate) fn inferred_content_type(body: &Body) -> Option<&'static str> {
    match body {
        Body::Empty => None,
        Body::Raw(_) => Some(TEXT_PLAIN),
        Body::Stream(_) => Some(OCTET_STREAM),
        Body::Flat(_) | Body::Structured(_) => Some(APPLICATION_JSON),
    }
}

/// Encode `body` for the given explicit content type.
pub(crate) async fn encode_body(
    body: &Body,
    explicit_content_type: Option<&str>,
) -> Result<EncodedBody, FetchError> {
    if body.is_empty() {
        if explicit_content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains(OCTET_STREAM)) {
            return Err(FetchError::InvalidBody(
                "octet-stream body is required".to_owned(),
            ));
        }
        return Ok(EncodedBody {
            content_type: None,
            payload: Payload::Empty,
        });
    }
    let Some(content_type) = explicit_content_type.or_else(|| inferred_content_type(body)) else {
        return Ok(EncodedBody {
            content_type: None,
            payload: Payload::Empty,
        });
    };
    let matcher = content_type.to_ascii_lowercase();

    let encoded = if matcher.contains(APPLICATION_JSON) {
        encode_json(body, content_type)?
    } else if matcher.contains(FORM_URLENCODED) {
        encode_form(body, content_type)?
    } else if matcher.contains(MULTIPART_FORM_DATA) {
        encode_multipart(body).await?
    } else if matcher.contains(OCTET_STREAM) {
        encode_octet_stream(body, content_type)?
    } else {
        encode_raw(body, content_type)?
    };

    tracing::trace!(
        content_type = encoded.content_type.as_deref().unwrap_or_default(),
        "encoded request body"
    );
    Ok(encoded)
}

fn encode_json(body: &Body, content_type: &str) -> Result<EncodedBody, FetchError> {
    let payload = match body {
        Body::Empty => Payload::Empty,
        Body::Raw(s) => Payload::Bytes(to_json(s)?),
        Body::Flat(map) => Payload::Bytes(to_json(map)?),
        Body::Structured(map) => Payload::Bytes(to_json(map)?),
        Body::Stream(reader) => Payload::Stream(reader.clone()),
    };
    Ok(EncodedBody::new(content_type, payload))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Bytes, FetchError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(FetchError::InvalidJsonBody)
}

fn encode_form(body: &Body, content_type: &str) -> Result<EncodedBody, FetchError> {
    let Body::Flat(map) = body else {
        return Err(FetchError::InvalidUrlFormEncodedBody(
            "body must be a flat string-to-string map".to_owned(),
        ));
    };
    let encoded = serde_urlencoded::to_string(map)
        .map_err(|e| FetchError::InvalidUrlFormEncodedBody(e.to_string()))?;
    Ok(EncodedBody::new(content_type, Payload::Bytes(encoded.into())))
}

async fn encode_multipart(body: &Body) -> Result<EncodedBody, FetchError> {
    let mut writer = MultipartWriter::new();
    match body {
        Body::Flat(map) => {
            for (name, value) in map {
                writer.field(name, value);
            }
        }
        Body::Structured(map) => write_structured_parts(&mut writer, map).await?,
        Body::Empty | Body::Raw(_) | Body::Stream(_) => {
            return Err(FetchError::InvalidBodyMultipart(
                "body must be a string map or a map of strings and streams".to_owned(),
            ));
        }
    }
    let (content_type, bytes) = writer.finish();
    Ok(EncodedBody::new(content_type, Payload::Bytes(bytes.into())))
}

async fn write_structured_parts(
    writer: &mut MultipartWriter,
    map: &IndexMap<String, BodyValue>,
) -> Result<(), FetchError> {
    for (name, value) in map {
        match value {
            BodyValue::Json(serde_json::Value::Null) => {}
            BodyValue::Json(serde_json::Value::String(text)) => writer.field(name, text),
            BodyValue::Json(other) => {
                return Err(FetchError::InvalidBodyMultipart(format!(
                    "field '{name}' must be a string or a stream, got {other}"
                )));
            }
            BodyValue::Stream(reader) => {
                let data = reader.read_all().await?;
                let filename = reader.name().unwrap_or(name);
                let mime = detect_content_type(&data);
                writer.file(name, filename, mime.as_ref(), &data);
            }
        }
    }
    Ok(())
}

fn encode_octet_stream(body: &Body, content_type: &str) -> Result<EncodedBody, FetchError> {
    match body {
        Body::Stream(reader) => Ok(EncodedBody::new(
            content_type,
            Payload::Stream(reader.clone()),
        )),
        Body::Empty | Body::Raw(_) | Body::Flat(_) | Body::Structured(_) => {
            Err(FetchError::InvalidBody(
                "octet-stream body must be a byte stream".to_owned(),
            ))
        }
    }
}

fn encode_raw(body: &Body, content_type: &str) -> Result<EncodedBody, FetchError> {
    let Body::Raw(s) = body else {
        return Err(FetchError::InvalidBody(format!(
            "body must be a string for content type '{content_type}'"
        )));
    };
    Ok(EncodedBody::new(
        content_type,
        Payload::Bytes(Bytes::from(s.clone())),
    ))
}

/// Gzip `data` for a compressed request body.
pub(crate) fn gzip(data: &[u8]) -> Result<Vec<u8>, FetchError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(FetchError::CompressRequest)?;
    encoder.finish().map_err(FetchError::CompressRequest)
}

/// In-memory `multipart/form-data` writer.
struct MultipartWriter {
    boundary: String,
    buf: Vec<u8>,
}

impl MultipartWriter {
    fn new() -> Self {
        let random: [u8; 16] = rand::rng().random();
        let boundary = random.iter().map(|b| format!("{b:02x}")).collect();
        Self {
            boundary,
            buf: Vec::new(),
        }
    }

    fn field(&mut self, name: &str, value: &str) {
        self.part_header(&format!(
            "Content-Disposition: form-data; name=\"{}\"",
            escape_quotes(name)
        ));
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    fn file(&mut self, name: &str, filename: &str, content_type: &str, data: &[u8]) {
        self.part_header(&format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {content_type}",
            escape_quotes(name),
            escape_quotes(filename),
        ));
        self.buf.extend_from_slice(data);
        self.buf.extend_from_slice(b"\r\n");
    }

    fn part_header(&mut self, headers: &str) {
        self.buf.extend_from_slice(b"--");
        self.buf.extend_from_slice(self.boundary.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
        self.buf.extend_from_slice(headers.as_bytes());
        self.buf.extend_from_slice(b"\r\n\r\n");
    }

    fn finish(mut self) -> (String, Vec<u8>) {
        self.buf.extend_from_slice(b"--");
        self.buf.extend_from_slice(self.boundary.as_bytes());
        self.buf.extend_from_slice(b"--\r\n");
        (
            format!("{MULTIPART_FORM_DATA}; boundary={}", self.boundary),
            self.buf,
        )
    }
}

fn escape_quotes(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;

    fn bytes_of(encoded: &EncodedBody) -> &[u8] {
        match &encoded.payload {
            Payload::Bytes(b) => b,
            other => panic!("expected bytes payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_default_json_encoding() {
        let body = Body::json(&json!({"a": "b"})).unwrap();
        let encoded = encode_body(&body, None).await.unwrap();

        assert_eq!(encoded.content_type.as_deref(), Some(APPLICATION_JSON));
        let decoded: serde_json::Value = serde_json::from_slice(bytes_of(&encoded)).unwrap();
        assert_eq!(decoded, json!({"a": "b"}));
    }

    #[tokio::test]
    async fn test_json_quotes_string_body() {
        let encoded = encode_body(&Body::from("hello"), Some("application/json; charset=utf-8"))
            .await
            .unwrap();
        assert_eq!(bytes_of(&encoded), b"\"hello\"");

        let encoded = encode_body(&Body::from("say \"hi\""), Some(APPLICATION_JSON))
            .await
            .unwrap();
        let decoded: String = serde_json::from_slice(bytes_of(&encoded)).unwrap();
        assert_eq!(decoded, "say \"hi\"");
    }

    #[tokio::test]
    async fn test_json_rejects_stream_values() {
        let body = Body::structured([("file", BodyReader::from_bytes("x"))]);
        let err = encode_body(&body, Some(APPLICATION_JSON)).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidJsonBody(_)));
    }

    #[tokio::test]
    async fn test_empty_body_keeps_headers() {
        let encoded = encode_body(&Body::Empty, Some(FORM_URLENCODED)).await.unwrap();
        assert!(encoded.content_type.is_none());
        assert!(matches!(encoded.payload, Payload::Empty));

        let err = encode_body(&Body::Empty, Some(OCTET_STREAM)).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidBody(_)));
    }

    #[tokio::test]
    async fn test_form_encoding() {
        let body = Body::flat([("name", "Zero Two"), ("lang", "rust")]);
        let encoded = encode_body(&body, Some(FORM_URLENCODED)).await.unwrap();
        assert_eq!(bytes_of(&encoded), b"name=Zero+Two&lang=rust");
        assert_eq!(encoded.content_type.as_deref(), Some(FORM_URLENCODED));
    }

    #[tokio::test]
    async fn test_form_rejects_nested_body() {
        let body = Body::json(&json!({"user": {"name": "zero"}})).unwrap();
        let err = encode_body(&body, Some("application/x-www-form-urlencoded; charset=utf-8"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrlFormEncodedBody(_)));
    }

    #[tokio::test]
    async fn test_multipart_fields_and_files() {
        let body = Body::structured([
            ("title", BodyValue::from("report")),
            ("skipped", BodyValue::Json(serde_json::Value::Null)),
            (
                "doc",
                BodyValue::from(BodyReader::named("my \"doc\".pdf", std::io::Cursor::new(
                    b"%PDF-1.4 data".to_vec(),
                ))),
            ),
            ("blob", BodyValue::from(BodyReader::from_bytes("plain text"))),
        ]);

        let encoded = encode_body(&body, Some(MULTIPART_FORM_DATA)).await.unwrap();
        let content_type = encoded.content_type.clone().unwrap();
        let boundary = content_type
            .strip_prefix("multipart/form-data; boundary=")
            .unwrap();
        let text = String::from_utf8(bytes_of(&encoded).to_vec()).unwrap();

        assert!(text.contains("name=\"title\"\r\n\r\nreport\r\n"));
        assert!(!text.contains("skipped"));
        assert!(text.contains(
            "name=\"doc\"; filename=\"my \\\"doc\\\".pdf\"\r\nContent-Type: application/pdf"
        ));
        assert!(text.contains("name=\"blob\"; filename=\"blob\"\r\nContent-Type: text/plain"));
        assert!(text.ends_with(&format!("--{boundary}--\r\n")));
    }

    #[tokio::test]
    async fn test_multipart_rejects_wrong_shapes() {
        let err = encode_body(&Body::from("text"), Some(MULTIPART_FORM_DATA))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidBodyMultipart(_)));

        let body = Body::structured([("n", BodyValue::from(json!(1)))]);
        let err = encode_body(&body, Some(MULTIPART_FORM_DATA)).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidBodyMultipart(_)));
    }

    #[tokio::test]
    async fn test_raw_string_defaults_to_text_plain() {
        let encoded = encode_body(&Body::from("hello"), None).await.unwrap();
        assert_eq!(encoded.content_type.as_deref(), Some(TEXT_PLAIN));
        assert_eq!(bytes_of(&encoded), b"hello");
    }

    #[tokio::test]
    async fn test_raw_content_type_requires_string() {
        let body = Body::flat([("a", "b")]);
        let err = encode_body(&body, Some("text/csv")).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidBody(_)));
    }

    #[tokio::test]
    async fn test_octet_stream_passes_reader_through() {
        let reader = BodyReader::from_bytes("binary");
        let encoded = encode_body(&Body::Stream(reader), None).await.unwrap();
        assert_eq!(encoded.content_type.as_deref(), Some(OCTET_STREAM));
        match encoded.payload {
            Payload::Stream(r) => assert_eq!(r.read_all().await.unwrap(), b"binary"),
            other => panic!("expected stream payload, got {other:?}"),
        }

        let body = Body::json(&json!({"a": 1})).unwrap();
        let err = encode_body(&body, Some(OCTET_STREAM)).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidBody(_)));
    }

    #[tokio::test]
    async fn test_octet_stream_rejects_string_body() {
        let err = encode_body(&Body::from("not a stream"), Some(OCTET_STREAM))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidBody(_)));
    }

    #[test]
    fn test_gzip_round_trip() {
        use flate2::read::GzDecoder;
        use std::io::Read;

        let compressed = gzip(b"compress me").unwrap();
        let mut out = String::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "compress me");
    }
}
