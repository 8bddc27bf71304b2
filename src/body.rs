//! Request body buffering and re-encoding for the forwarding step
//!
//! The gateway forwards the raw inbound bytes whenever it can. When body
//! parsing is enabled, JSON and form bodies are parsed into structured values
//! first. The original bytes are then gone, so they are rebuilt from the
//! structured value before forwarding. Either way `Content-Length` is
//! recomputed from the bytes that actually go on the wire.
//!
//! A body is only treated as parsed when rebuilding it loses nothing: JSON
//! must re-serialize to the same tokens, and every form component must
//! percent-decode to valid UTF-8. Anything else is forwarded raw.

use axum::http::{
    HeaderMap, HeaderValue,
    header::{CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING},
};
use bytes::Bytes;
use percent_encoding::percent_decode;
use serde_json::Value;
use tracing::debug;

use crate::{Error, Result};

/// Body kinds that can be parsed and re-encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// `application/json` and `application/*+json`
    Json,
    /// `application/x-www-form-urlencoded`
    Form,
}

impl BodyKind {
    /// Classify a `Content-Type` header value. Parameters such as `charset` are ignored.
    #[must_use]
    pub fn from_content_type(content_type: Option<&str>) -> Option<Self> {
        let essence = content_type?
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if essence == "application/json"
            || (essence.starts_with("application/") && essence.ends_with("+json"))
        {
            Some(Self::Json)
        } else if essence == "application/x-www-form-urlencoded" {
            Some(Self::Form)
        } else {
            None
        }
    }
}

/// A body that has been parsed into a structured value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedBody {
    /// Decoded JSON document
    Json(Value),
    /// Decoded form fields, in wire order
    Form(Vec<(String, String)>),
}

/// What the forwarding step holds for a request body.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferedBody {
    /// No body
    Empty,
    /// Original bytes, forwarded unchanged
    Raw(Bytes),
    /// Structured value; original bytes were consumed
    Parsed(ParsedBody),
}

/// Parse a buffered body when its content type is one we can rebuild.
///
/// Anything else (unknown types, empty bodies, payloads that fail to parse)
/// stays raw so it is forwarded byte-for-byte.
#[must_use]
pub fn parse_body(content_type: Option<&str>, bytes: Bytes) -> BufferedBody {
    if bytes.is_empty() {
        return BufferedBody::Empty;
    }

    let parsed = match BodyKind::from_content_type(content_type) {
        Some(BodyKind::Json) => parse_json(&bytes).map(ParsedBody::Json),
        Some(BodyKind::Form) => parse_form(&bytes).map(ParsedBody::Form),
        None => return BufferedBody::Raw(bytes),
    };

    match parsed {
        Ok(parsed) => BufferedBody::Parsed(parsed),
        Err(e) => {
            debug!(error = %e, "Body kept raw");
            BufferedBody::Raw(bytes)
        }
    }
}

fn parse_json(raw: &[u8]) -> std::result::Result<Value, String> {
    let value: Value = serde_json::from_slice(raw).map_err(|e| e.to_string())?;
    // Duplicate keys, escape spellings and number formats must survive re-encoding.
    let reencoded = serde_json::to_vec(&value).map_err(|e| e.to_string())?;
    if reencoded == compact_json(raw) {
        Ok(value)
    } else {
        Err("JSON does not re-encode to the same tokens".to_string())
    }
}

/// Drop whitespace outside string literals.
fn compact_json(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut in_string = false;
    let mut escaped = false;
    for &b in raw {
        if in_string {
            out.push(b);
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
        } else if !matches!(b, b' ' | b'\t' | b'\n' | b'\r') {
            in_string = b == b'"';
            out.push(b);
        }
    }
    out
}

fn parse_form(raw: &[u8]) -> std::result::Result<Vec<(String, String)>, String> {
    raw.split(|&b| b == b'&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let mut parts = pair.splitn(2, |&b| b == b'=');
            let name = decode_form_component(parts.next().unwrap_or_default())?;
            let value = decode_form_component(parts.next().unwrap_or_default())?;
            Ok((name, value))
        })
        .collect()
}

/// Strict `application/x-www-form-urlencoded` component decoding: invalid
/// UTF-8 is an error rather than U+FFFD.
fn decode_form_component(raw: &[u8]) -> std::result::Result<String, String> {
    let spaced: Vec<u8> = raw
        .iter()
        .map(|&b| if b == b'+' { b' ' } else { b })
        .collect();
    percent_decode(&spaced)
        .decode_utf8()
        .map(std::borrow::Cow::into_owned)
        .map_err(|e| format!("form component is not UTF-8: {e}"))
}

/// Serialize a parsed body back to bytes for its declared content type.
///
/// Returns `None` when the content type does not match the parsed value.
#[must_use]
pub fn reencode(content_type: Option<&str>, body: &ParsedBody) -> Option<Bytes> {
    match (BodyKind::from_content_type(content_type)?, body) {
        (BodyKind::Json, ParsedBody::Json(value)) => serde_json::to_vec(value).ok().map(Bytes::from),
        (BodyKind::Form, ParsedBody::Form(fields)) => {
            serde_urlencoded::to_string(fields).ok().map(Bytes::from)
        }
        _ => None,
    }
}

/// Produce the outbound body bytes and fix up the framing headers to match.
pub fn prepare_outbound(headers: &mut HeaderMap, body: BufferedBody) -> Result<Bytes> {
    headers.remove(TRANSFER_ENCODING);

    let bytes = match body {
        BufferedBody::Empty => {
            if headers.contains_key(CONTENT_LENGTH) {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(0_usize));
            }
            return Ok(Bytes::new());
        }
        BufferedBody::Raw(bytes) => bytes,
        BufferedBody::Parsed(parsed) => {
            let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
            reencode(content_type, &parsed).ok_or_else(|| {
                Error::BodyEncoding(format!(
                    "cannot re-encode parsed body as {}",
                    content_type.unwrap_or("<no content type>")
                ))
            })?
        }
    };

    headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
    Ok(bytes)
}
