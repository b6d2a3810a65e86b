//! Media upload and serving.
//!
//! Uploads are content-addressed: the file lands in the media directory under
//! its SHA-256 hash and the returned URL is what clients pass through
//! `send_media`.  The chat core only ever relays the URL reference.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::Multipart;
use sha2::{Digest, Sha256};

use crate::dlog;
use crate::server::config::MAX_MEDIA_BYTES;
use crate::server::state::AppState;
use crate::server::utils::api_error;

/// Accepted content types and their on-disk extensions.
const MEDIA_TYPES: &[(&str, &str, &str)] = &[
    ("image/jpeg", "jpg", "image"),
    ("image/png", "png", "image"),
    ("image/gif", "gif", "image"),
    ("image/webp", "webp", "image"),
    ("video/mp4", "mp4", "video"),
    ("video/webm", "webm", "video"),
];

fn lookup_type(content_type: &str) -> Option<(&'static str, &'static str)> {
    MEDIA_TYPES
        .iter()
        .find(|(mime, _, _)| *mime == content_type)
        .map(|(_, ext, kind)| (*ext, *kind))
}

fn content_type_for_ext(ext: &str) -> Option<&'static str> {
    MEDIA_TYPES
        .iter()
        .find(|(_, e, _)| *e == ext)
        .map(|(mime, _, _)| *mime)
}

pub async fn upload_media_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Response {
    let mut file_data: Option<Vec<u8>> = None;
    let mut content_type: Option<String> = None;
    let mut filename: Option<String> = None;

    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or("").to_string();
        if name == "file" {
            content_type = field.content_type().map(|ct| ct.to_string());
            filename = field.file_name().map(|f| f.to_string());
            match field.bytes().await {
                Ok(bytes) => {
                    if bytes.len() as u64 > MAX_MEDIA_BYTES {
                        return api_error(
                            StatusCode::PAYLOAD_TOO_LARGE,
                            format!("media exceeds maximum size of {} bytes", MAX_MEDIA_BYTES),
                        );
                    }
                    file_data = Some(bytes.to_vec());
                }
                Err(e) => {
                    return api_error(StatusCode::BAD_REQUEST, format!("failed to read file: {e}"))
                }
            }
        }
    }

    let data = match file_data {
        Some(d) if !d.is_empty() => d,
        _ => return api_error(StatusCode::BAD_REQUEST, "no file provided"),
    };
    let Some((ext, kind)) = content_type.as_deref().and_then(lookup_type) else {
        return api_error(
            StatusCode::BAD_REQUEST,
            "unsupported media type; images and videos only",
        );
    };

    let digest = Sha256::digest(&data);
    let stored_name = format!("{}.{ext}", hex::encode(digest));
    let path = state.media_dir.join(&stored_name);
    let size = data.len() as u64;

    if let Err(e) = tokio::fs::write(&path, &data).await {
        dlog!("media: failed to store {stored_name}: {e}");
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to store media");
    }

    let body = serde_json::json!({
        "url": format!("/media/{stored_name}"),
        "kind": kind,
        "name": filename,
        "size": size,
    });
    (StatusCode::CREATED, axum::Json(body)).into_response()
}

pub async fn serve_media_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    // Names are hash.ext; anything else is not ours to serve
    let Some((stem, ext)) = name.split_once('.') else {
        return api_error(StatusCode::NOT_FOUND, "media not found");
    };
    if stem.is_empty() || !stem.chars().all(|c| c.is_ascii_hexdigit()) {
        return api_error(StatusCode::NOT_FOUND, "media not found");
    }
    let Some(content_type) = content_type_for_ext(ext) else {
        return api_error(StatusCode::NOT_FOUND, "media not found");
    };

    match tokio::fs::read(state.media_dir.join(&name)).await {
        Ok(data) => {
            let headers = [
                (header::CONTENT_TYPE, content_type.to_string()),
                (
                    header::CACHE_CONTROL,
                    "public, max-age=31536000, immutable".to_string(),
                ),
            ];
            (StatusCode::OK, headers, data).into_response()
        }
        Err(_) => api_error(StatusCode::NOT_FOUND, "media not found"),
    }
}
