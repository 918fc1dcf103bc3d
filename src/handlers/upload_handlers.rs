//! HTTP handlers for the tus upload resource.
//! Streams chunk bodies straight into the store and delegates every protocol
//! decision to `UploadService`.

use crate::{
    errors::AppError,
    handlers::{
        AppState,
        tus::{
            Concat, OFFSET_OCTET_STREAM, TUS_EXTENSION, TUS_EXTENSIONS, TUS_MAX_SIZE,
            TUS_RESUMABLE, TUS_VERSION, TUS_VERSION_HEADER, UPLOAD_CONCAT, UPLOAD_DEFER_LENGTH,
            UPLOAD_LENGTH, UPLOAD_METADATA, UPLOAD_OFFSET, encode_concat, encode_metadata,
            header_u64, is_offset_stream, parse_concat, parse_metadata, require_tus_resumable,
            set_header, upload_url,
        },
    },
    models::upload::{Metadata, Upload},
    services::store::{ByteStream, byte_stream},
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use std::io;
use tracing::debug;

/// Media types GET echoes from the `filetype` metadata. Anything else is
/// served as `application/octet-stream`.
const SERVED_CONTENT_TYPES: &[&str] = &[
    "application/gzip",
    "application/json",
    "application/pdf",
    "application/zip",
    "audio/mpeg",
    "audio/ogg",
    "audio/wav",
    "image/gif",
    "image/jpeg",
    "image/png",
    "image/webp",
    "text/csv",
    "text/plain",
    "video/mp4",
    "video/ogg",
    "video/webm",
];

fn served_content_type(metadata: &Metadata) -> HeaderValue {
    metadata
        .get("filetype")
        .and_then(|filetype| {
            let essence = filetype.split(';').next().unwrap_or_default().trim();
            SERVED_CONTENT_TYPES
                .iter()
                .find(|allowed| allowed.eq_ignore_ascii_case(essence))
                .copied()
        })
        .map(HeaderValue::from_static)
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"))
}

fn body_stream(body: Body) -> ByteStream {
    byte_stream(body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other)))
}

fn tus_response(status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    response
}

/// `OPTIONS /files/`: advertise protocol version and extensions.
pub async fn options_uploads(State(state): State<AppState>) -> Response {
    let mut response = tus_response(StatusCode::NO_CONTENT);
    let headers = response.headers_mut();
    headers.insert(TUS_VERSION_HEADER, HeaderValue::from_static(TUS_VERSION));
    headers.insert(TUS_EXTENSION, HeaderValue::from_static(TUS_EXTENSIONS));
    if let Some(max) = state.uploads.max_size() {
        set_header(headers, TUS_MAX_SIZE, max.to_string());
    }
    response
}

/// `POST /files/`: create an upload, optionally with its first chunk.
pub async fn create_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    require_tus_resumable(&headers)?;
    let metadata = parse_metadata(&headers);

    let is_partial = match parse_concat(&headers)? {
        Some(Concat::Final(partials)) => {
            let upload = state.uploads.concat(partials, metadata).await?;
            debug!(upload_id = %upload.id, "final upload assembled");
            let mut response = tus_response(StatusCode::CREATED);
            set_header(
                response.headers_mut(),
                header::LOCATION,
                upload_url(&headers, &state.base_path, &upload.id),
            );
            return Ok(response);
        }
        Some(Concat::Partial) => true,
        None => false,
    };

    let length = header_u64(&headers, &UPLOAD_LENGTH)?;
    let deferred = match headers.get(&UPLOAD_DEFER_LENGTH) {
        None => false,
        Some(value) if value == "1" => true,
        Some(_) => return Err(AppError::bad_request("Upload-Defer-Length must be 1")),
    };
    let size = match (length, deferred) {
        (Some(length), false) => Some(length),
        (None, true) => None,
        (Some(_), true) => {
            return Err(AppError::bad_request(
                "Upload-Length and Upload-Defer-Length are mutually exclusive",
            ));
        }
        (None, false) => {
            return Err(AppError::bad_request(
                "missing Upload-Length or Upload-Defer-Length header",
            ));
        }
    };

    let mut upload = state.uploads.create(size, metadata, is_partial).await?;
    let location = upload_url(&headers, &state.base_path, &upload.id);

    if is_offset_stream(&headers) && !upload.is_complete() {
        match state
            .uploads
            .patch(&upload.id, 0, None, body_stream(body))
            .await
        {
            Ok(updated) => upload = updated,
            Err(err) => {
                // The upload exists; let the client resume from Location.
                let mut response = AppError::from(err).into_response();
                set_header(response.headers_mut(), header::LOCATION, location);
                return Ok(response);
            }
        }
    }

    let mut response = tus_response(StatusCode::CREATED);
    let resp_headers = response.headers_mut();
    set_header(resp_headers, header::LOCATION, location);
    set_header(resp_headers, UPLOAD_OFFSET, upload.offset.to_string());
    Ok(response)
}

/// `HEAD /files/{id}`: current offset and length, no body.
pub async fn head_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    require_tus_resumable(&headers)?;
    let upload = state.uploads.head(&id).await?;

    let mut response = tus_response(StatusCode::OK);
    set_upload_headers(response.headers_mut(), &upload, &state.base_path);
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok(response)
}

/// `PATCH /files/{id}`: append the body at `Upload-Offset`.
pub async fn patch_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    require_tus_resumable(&headers)?;
    if !is_offset_stream(&headers) {
        return Err(AppError::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("Content-Type must be {OFFSET_OCTET_STREAM}"),
        ));
    }
    let offset = header_u64(&headers, &UPLOAD_OFFSET)?
        .ok_or_else(|| AppError::bad_request("missing Upload-Offset header"))?;
    let length = header_u64(&headers, &UPLOAD_LENGTH)?;

    let upload = state
        .uploads
        .patch(&id, offset, length, body_stream(body))
        .await?;

    let mut response = tus_response(StatusCode::NO_CONTENT);
    set_header(response.headers_mut(), UPLOAD_OFFSET, upload.offset.to_string());
    Ok(response)
}

/// `GET /files/{id}`: stream the bytes received so far.
pub async fn get_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let (upload, content) = state.uploads.get(&id).await?;

    let mut response = Response::new(Body::from_stream(content));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    set_header(headers, header::CONTENT_LENGTH, upload.offset.to_string());

    headers.insert(header::CONTENT_TYPE, served_content_type(&upload.metadata));

    if let Some(filename) = upload.metadata.get("filename") {
        let escaped = filename.replace('\\', "\\\\").replace('"', "\\\"");
        set_header(
            headers,
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{escaped}\""),
        );
    }
    Ok(response)
}

/// `DELETE /files/{id}`: terminate the upload.
pub async fn delete_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    require_tus_resumable(&headers)?;
    state.uploads.delete(&id).await?;
    Ok(tus_response(StatusCode::NO_CONTENT))
}

fn set_upload_headers(headers: &mut HeaderMap, upload: &Upload, base_path: &str) {
    set_header(headers, UPLOAD_OFFSET, upload.offset.to_string());
    match upload.size {
        Some(size) => set_header(headers, UPLOAD_LENGTH, size.to_string()),
        None => {
            headers.insert(UPLOAD_DEFER_LENGTH, HeaderValue::from_static("1"));
        }
    }
    if !upload.metadata.is_empty() {
        set_header(headers, UPLOAD_METADATA, encode_metadata(&upload.metadata));
    }
    if let Some(concat) = encode_concat(upload.is_partial, &upload.partial_uploads, base_path) {
        set_header(headers, UPLOAD_CONCAT, concat);
    }
}
