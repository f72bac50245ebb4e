//! HTTP handlers for the `/file-v2` surface.
//! Uploads are read fully into memory so the batch can be validated before
//! anything is written; downloads stream from disk.

use crate::{
    errors::AppError,
    models::{
        file_record::FileView,
        upload::{RawFile, UploadBatchRequest, UploadResponse},
    },
    services::{file_service::FileService, sessions::SessionEvent},
};
use axum::{
    Json,
    body::Body,
    extract::{FromRequestParts, Multipart, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tracing::debug;

pub const OWNER_HEADER: &str = "x-owner-id";

/// Authenticated owner, taken from the `x-owner-id` header set by the
/// fronting gateway.
#[derive(Debug, Clone)]
pub struct OwnerId(pub String);

impl<S> FromRequestParts<S> for OwnerId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| OwnerId(v.to_string()))
            .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "missing owner identity"))
    }
}

#[derive(Debug, Deserialize)]
pub struct GetListRequest {
    pub list_server_file_name: Vec<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub list_server_file_name: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub status: bool,
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub server_filename: String,
}

/// `POST /file-v2/upload`
pub async fn upload(
    State(service): State<FileService>,
    OwnerId(owner_id): OwnerId,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut request = UploadBatchRequest {
        owner_id,
        ..Default::default()
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(format!("failed to read multipart: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "files" | "file" => {
                let client_filename = field.file_name().unwrap_or("upload").to_string();
                let mime_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let content = field.bytes().await.map_err(|e| {
                    AppError::bad_request(format!("failed to read file data: {}", e))
                })?;
                request.files.push(RawFile {
                    client_filename,
                    mime_type,
                    content,
                });
            }
            "ext" | "resize" | "scale" | "folder_type" | "group" => {
                let value = field.text().await.map_err(|e| {
                    AppError::bad_request(format!("invalid `{}` field: {}", name, e))
                })?;
                apply_text_field(&mut request, &name, &value);
            }
            other => debug!(field = other, "ignoring unknown multipart field"),
        }
    }

    Ok(Json(service.upload(request).await?))
}

fn apply_text_field(request: &mut UploadBatchRequest, name: &str, value: &str) {
    let value = value.trim();
    match name {
        "resize" => request.resize_options.extend(split_list(value)),
        "scale" => request.scale_options.extend(split_list(value)),
        _ if value.is_empty() => {}
        "ext" => request.extension_override = Some(value.to_string()),
        "folder_type" => request.folder_type = Some(value.to_string()),
        "group" => request.group = Some(value.to_string()),
        _ => {}
    }
}

fn split_list(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// `POST /file-v2/get-list`
///
/// Without `session_id` the records are returned directly. With one, they
/// are produced in the background onto that session and the response is
/// empty.
pub async fn get_list(
    State(service): State<FileService>,
    _owner: OwnerId,
    Json(body): Json<GetListRequest>,
) -> Result<Response, AppError> {
    match body.session_id.filter(|s| !s.is_empty()) {
        Some(session_id) => {
            service.start_stream(session_id, body.list_server_file_name);
            Ok(StatusCode::OK.into_response())
        }
        None => {
            let views: Vec<FileView> = service.get_list(&body.list_server_file_name).await?;
            Ok(Json(views).into_response())
        }
    }
}

/// `GET /file-v2/get-list/response?session_id=`
pub async fn get_list_response(
    State(service): State<FileService>,
    Query(q): Query<SessionQuery>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let events = service.subscribe(&q.session_id).map(|event| match event {
        SessionEvent::Record(view) => Event::default().event("file").json_data(&*view),
        SessionEvent::Complete => Ok(Event::default().event("complete").data("done")),
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

/// `GET /file-v2/download?server_filename=`
pub async fn download(
    State(service): State<FileService>,
    Query(q): Query<DownloadQuery>,
) -> Result<Response, AppError> {
    let (record, file) = service.download(&q.server_filename).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_download_headers(
        response.headers_mut(),
        &record.client_filename,
        record.size_bytes,
    );
    Ok(response)
}

fn set_download_headers(headers: &mut HeaderMap, client_filename: &str, size: i64) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    // Quoted ASCII fallback for old clients, exact UTF-8 name in `filename*`.
    let mut fallback: String = client_filename
        .chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .filter(|c| *c != '"' && *c != '\\')
        .collect();
    if fallback.trim().is_empty() {
        fallback = "download".to_string();
    }
    let disposition = format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(client_filename)
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Ok(value) = HeaderValue::from_str(&size.to_string()) {
        headers.insert(header::CONTENT_LENGTH, value);
    }
}

/// `POST /file-v2/delete`
pub async fn delete(
    State(service): State<FileService>,
    _owner: OwnerId,
    Json(body): Json<DeleteRequest>,
) -> Result<Json<DeleteResponse>, AppError> {
    service.delete(&body.list_server_file_name).await?;
    Ok(Json(DeleteResponse { status: true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_fields_accept_repeats_and_commas() {
        let mut request = UploadBatchRequest::default();
        apply_text_field(&mut request, "resize", "thumb, card");
        apply_text_field(&mut request, "resize", "banner");
        apply_text_field(&mut request, "scale", "");
        apply_text_field(&mut request, "group", "  ");
        apply_text_field(&mut request, "ext", "png");
        assert_eq!(request.resize_options, vec!["thumb", "card", "banner"]);
        assert!(request.scale_options.is_empty());
        assert_eq!(request.group, None);
        assert_eq!(request.extension_override.as_deref(), Some("png"));
    }

    #[test]
    fn download_headers_quote_a_sanitized_name() {
        let mut headers = HeaderMap::new();
        set_download_headers(&mut headers, "my \"report\".pdf", 12);
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"my report.pdf\"; filename*=UTF-8''my%20%22report%22.pdf"
        );
        assert_eq!(headers[header::CONTENT_LENGTH], "12");
        assert_eq!(headers[header::CONTENT_TYPE], "application/octet-stream");
    }

    #[test]
    fn download_headers_keep_non_ascii_names() {
        let mut headers = HeaderMap::new();
        set_download_headers(&mut headers, "ảnh.png", 3);
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"nh.png\"; filename*=UTF-8''%E1%BA%A3nh.png"
        );

        set_download_headers(&mut headers, "图片", 3);
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"download\"; filename*=UTF-8''%E5%9B%BE%E7%89%87"
        );
    }
}
