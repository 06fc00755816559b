//! Content sniffing for multipart file parts.
//!
//! Looks at no more than the first 512 bytes, like browsers do.

use mime::Mime;

const SNIFF_LEN: usize = 512;

struct Signature {
    magic: &'static [u8],
    offset: usize,
    mime: &'static str,
}

const SIGNATURES: &[Signature] = &[
    Signature { magic: b"\x89PNG\r\n\x1a\n", offset: 0, mime: "image/png" },
    Signature { magic: b"\xff\xd8\xff", offset: 0, mime: "image/jpeg" },
    Signature { magic: b"GIF87a", offset: 0, mime: "image/gif" },
    Signature { magic: b"GIF89a", offset: 0, mime: "image/gif" },
    Signature { magic: b"BM", offset: 0, mime: "image/bmp" },
    Signature { magic: b"WEBPVP", offset: 8, mime: "image/webp" },
    Signature { magic: b"\x00\x00\x01\x00", offset: 0, mime: "image/x-icon" },
    Signature { magic: b"%PDF-", offset: 0, mime: "application/pdf" },
    Signature { magic: b"%!PS-Adobe-", offset: 0, mime: "application/postscript" },
    Signature { magic: b"PK\x03\x04", offset: 0, mime: "application/zip" },
    Signature { magic: b"\x1f\x8b\x08", offset: 0, mime: "application/x-gzip" },
    Signature { magic: b"Rar!\x1a\x07", offset: 0, mime: "application/x-rar-compressed" },
    Signature { magic: b"\x00asm", offset: 0, mime: "application/wasm" },
    Signature { magic: b"ID3", offset: 0, mime: "audio/mpeg" },
    Signature { magic: b"OggS\x00", offset: 0, mime: "application/ogg" },
    Signature { magic: b"ftyp", offset: 4, mime: "video/mp4" },
    Signature { magic: b"\x1a\x45\xdf\xa3", offset: 0, mime: "video/webm" },
];

/// Best-effort content type of `data`.
pub(crate) fn detect_content_type(data: &[u8]) -> Mime {
    let data = &data[..data.len().min(SNIFF_LEN)];

    for sig in SIGNATURES {
        if data.get(sig.offset..).is_some_and(|d| d.starts_with(sig.magic)) {
            return sig.mime.parse().unwrap_or(mime::APPLICATION_OCTET_STREAM);
        }
    }
    if data.starts_with(b"RIFF") && data.get(8..12) == Some(b"WAVE".as_slice()) {
        return "audio/wave".parse().unwrap_or(mime::APPLICATION_OCTET_STREAM);
    }

    let text = data.trim_ascii_start();
    let lower: Vec<u8> = text.iter().take(16).map(u8::to_ascii_lowercase).collect();
    if lower.starts_with(b"<!doctype html") || lower.starts_with(b"<html") {
        return mime::TEXT_HTML_UTF_8;
    }
    if lower.starts_with(b"<?xml") {
        return mime::TEXT_XML;
    }

    if looks_binary(data) {
        mime::APPLICATION_OCTET_STREAM
    } else {
        mime::TEXT_PLAIN_UTF_8
    }
}

fn looks_binary(data: &[u8]) -> bool {
    data.iter()
        .any(|&b| matches!(b, 0x00..=0x08 | 0x0b | 0x0e..=0x1a | 0x1c..=0x1f))
}
