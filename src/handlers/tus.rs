//! tus protocol headers and their wire encodings.

use crate::{errors::AppError, models::upload::Metadata};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use base64::{Engine as _, engine::general_purpose};

pub const TUS_VERSION: &str = "1.0.0";
pub const TUS_EXTENSIONS: &str =
    "creation,creation-with-upload,creation-defer-length,termination,concatenation";
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

pub const TUS_RESUMABLE: HeaderName = HeaderName::from_static("tus-resumable");
pub const TUS_VERSION_HEADER: HeaderName = HeaderName::from_static("tus-version");
pub const TUS_EXTENSION: HeaderName = HeaderName::from_static("tus-extension");
pub const TUS_MAX_SIZE: HeaderName = HeaderName::from_static("tus-max-size");
pub const UPLOAD_OFFSET: HeaderName = HeaderName::from_static("upload-offset");
pub const UPLOAD_LENGTH: HeaderName = HeaderName::from_static("upload-length");
pub const UPLOAD_DEFER_LENGTH: HeaderName = HeaderName::from_static("upload-defer-length");
pub const UPLOAD_METADATA: HeaderName = HeaderName::from_static("upload-metadata");
pub const UPLOAD_CONCAT: HeaderName = HeaderName::from_static("upload-concat");

/// Parsed `Upload-Concat` request header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Concat {
    Partial,
    Final(Vec<String>),
}

/// Reject requests that do not speak the supported protocol version.
pub fn require_tus_resumable(headers: &HeaderMap) -> Result<(), AppError> {
    match headers.get(&TUS_RESUMABLE).and_then(|v| v.to_str().ok()) {
        Some(TUS_VERSION) => Ok(()),
        Some(other) => Err(AppError::new(
            StatusCode::PRECONDITION_FAILED,
            format!("unsupported Tus-Resumable version `{other}`"),
        )),
        None => Err(AppError::new(
            StatusCode::PRECONDITION_FAILED,
            "missing Tus-Resumable header",
        )),
    }
}

/// Read an optional non-negative integer header.
pub fn header_u64(headers: &HeaderMap, name: &HeaderName) -> Result<Option<u64>, AppError> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .map(str::trim)
        .and_then(|v| v.parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| AppError::bad_request(format!("invalid {name} header")))
}

/// True when the request body is a tus chunk.
pub fn is_offset_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case(OFFSET_OCTET_STREAM))
        .unwrap_or(false)
}

/// Decode `Upload-Metadata`: comma separated `key base64(value)` pairs.
///
/// Pairs with an empty key or undecodable value are skipped.
pub fn parse_metadata(headers: &HeaderMap) -> Metadata {
    let mut metadata = Metadata::new();
    let Some(raw) = headers.get(&UPLOAD_METADATA).and_then(|v| v.to_str().ok()) else {
        return metadata;
    };

    for pair in raw.split(',') {
        let mut parts = pair.trim().splitn(2, ' ');
        let key = parts.next().unwrap_or_default().trim();
        if key.is_empty() {
            continue;
        }
        let value = match parts.next().map(str::trim) {
            None | Some("") => String::new(),
            Some(encoded) => match general_purpose::STANDARD
                .decode(encoded)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
            {
                Some(decoded) => decoded,
                None => continue,
            },
        };
        metadata.insert(key.to_string(), value);
    }
    metadata
}

pub fn encode_metadata(metadata: &Metadata) -> String {
    metadata
        .iter()
        .map(|(key, value)| {
            if value.is_empty() {
                key.clone()
            } else {
                format!("{} {}", key, general_purpose::STANDARD.encode(value))
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Decode `Upload-Concat`. Final uploads list partial upload URLs; only the
/// last path segment of each URL is kept as the id.
pub fn parse_concat(headers: &HeaderMap) -> Result<Option<Concat>, AppError> {
    let Some(raw) = headers.get(&UPLOAD_CONCAT) else {
        return Ok(None);
    };
    let raw = raw
        .to_str()
        .map_err(|_| AppError::bad_request("invalid Upload-Concat header"))?
        .trim();

    if raw == "partial" {
        return Ok(Some(Concat::Partial));
    }
    let Some(urls) = raw.strip_prefix("final;") else {
        return Err(AppError::bad_request("invalid Upload-Concat header"));
    };
    let ids = urls
        .split_whitespace()
        .filter_map(|url| url.trim_end_matches('/').rsplit('/').next())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();
    if ids.is_empty() {
        return Err(AppError::bad_request(
            "Upload-Concat final lists no partial uploads",
        ));
    }
    Ok(Some(Concat::Final(ids)))
}

pub fn encode_concat(partial: bool, partials: &[String], base_path: &str) -> Option<String> {
    if partial {
        return Some("partial".into());
    }
    if partials.is_empty() {
        return None;
    }
    let urls = partials
        .iter()
        .map(|id| format!("{base_path}{id}"))
        .collect::<Vec<_>>()
        .join(" ");
    Some(format!("final;{urls}"))
}

/// Absolute URL of an upload, built from the request's Host header when present.
pub fn upload_url(headers: &HeaderMap, base_path: &str, id: &str) -> String {
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .filter(|p| matches!(*p, "http" | "https"))
        .unwrap_or("http");
    match host {
        Some(host) => format!("{proto}://{host}{base_path}{id}"),
        None => format!("{base_path}{id}"),
    }
}

/// Insert a header, skipping values that are not valid header text.
pub fn set_header(headers: &mut HeaderMap, name: HeaderName, value: impl AsRef<str>) {
    if let Ok(value) = HeaderValue::from_str(value.as_ref()) {
        headers.insert(name, value);
    }
}
