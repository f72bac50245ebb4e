//! Route table for the file service.
//!
//! ## Structure
//! - **Health endpoints** (root)
//!   - `GET  /healthz`
//!   - `GET  /readyz`
//!
//! - **File endpoints** (`/file-v2`)
//!   - `POST /upload`: multipart batch upload
//!   - `POST /get-list`: records by server filename, direct or streamed
//!   - `GET  /get-list/response`: SSE feed for a streamed `get-list`
//!   - `GET  /download`: raw bytes of one file
//!   - `POST /delete`: remove records and their files

use crate::{
    handlers::{
        file_handlers::{delete, download, get_list, get_list_response, upload},
        health_handlers::{healthz, readyz},
    },
    services::file_service::FileService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router. `body_limit` caps the size of a whole upload request.
pub fn routes(body_limit: usize) -> Router<FileService> {
    let files = Router::new()
        .route("/upload", post(upload))
        .route("/get-list", post(get_list))
        .route("/get-list/response", get(get_list_response))
        .route("/download", get(download))
        .route("/delete", post(delete))
        .layer(DefaultBodyLimit::max(body_limit));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .nest("/file-v2", files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::file_service::tests::{Fixture, fixture};
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;

    const BOUNDARY: &str = "pipeline-test-boundary";

    fn app(fx: &Fixture) -> Router {
        routes(1024 * 1024).with_state(fx.service.clone())
    }

    fn multipart(text: &[(&str, &str)], files: &[(&str, &str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in text {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                    BOUNDARY, name, value
                )
                .as_bytes(),
            );
        }
        for (filename, mime, content) in files {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"files\"; \
                     filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                    BOUNDARY, filename, mime
                )
                .as_bytes(),
            );
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn upload_request(owner: Option<&str>, body: Vec<u8>) -> Request<Body> {
        let mut builder = Request::post("/file-v2/upload").header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        );
        if let Some(owner) = owner {
            builder = builder.header("x-owner-id", owner);
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn json_request(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-owner-id", "owner-1")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_endpoints_respond() {
        let fx = fixture().await;
        let live = app(&fx)
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(live.status(), StatusCode::OK);

        let ready = app(&fx)
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ready.status(), StatusCode::OK);
        assert_eq!(json_body(ready).await["checks"]["presets"]["ok"], true);
    }

    #[tokio::test]
    async fn upload_requires_owner() {
        let fx = fixture().await;
        let body = multipart(&[], &[("a.txt", "text/plain", b"hi")]);
        let response = app(&fx).oneshot(upload_request(None, body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_preset_is_a_bad_request() {
        let fx = fixture().await;
        let body = multipart(&[("resize", "poster")], &[("a.txt", "text/plain", b"hi")]);
        let response = app(&fx)
            .oneshot(upload_request(Some("owner-1"), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error = json_body(response).await;
        assert!(error["error"].as_str().unwrap().contains("poster"));
    }

    #[tokio::test]
    async fn upload_list_download_delete_flow() {
        let fx = fixture().await;
        let body = multipart(
            &[("group", "reports"), ("resize", "thumb")],
            &[("notes.txt", "text/plain", b"hello")],
        );
        let response = app(&fx)
            .oneshot(upload_request(Some("owner-1"), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let uploaded = json_body(response).await;
        let name = uploaded["files"][0]["server_filename"]
            .as_str()
            .unwrap()
            .to_string();
        assert_eq!(uploaded["files"][0]["file_name"], "notes.txt");

        let listed = app(&fx)
            .oneshot(json_request(
                "/file-v2/get-list",
                json!({ "list_server_file_name": [&name, "unknown"] }),
            ))
            .await
            .unwrap();
        let listed = json_body(listed).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["group"], "reports");
        assert_eq!(listed[0]["view_type"], "file");

        let download = app(&fx)
            .oneshot(
                Request::get(format!("/file-v2/download?server_filename={}", name))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(download.status(), StatusCode::OK);
        assert_eq!(
            download.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"notes.txt\"; filename*=UTF-8''notes.txt"
        );
        let bytes = to_bytes(download.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"hello");

        let deleted = app(&fx)
            .oneshot(json_request(
                "/file-v2/delete",
                json!({ "list_server_file_name": [&name] }),
            ))
            .await
            .unwrap();
        assert_eq!(json_body(deleted).await, json!({ "status": true }));

        let gone = app(&fx)
            .oneshot(
                Request::get(format!("/file-v2/download?server_filename={}", name))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn streamed_list_arrives_over_sse() {
        let fx = fixture().await;
        let body = multipart(
            &[],
            &[
                ("a.txt", "text/plain", b"a"),
                ("b.txt", "text/plain", b"b"),
            ],
        );
        let uploaded = json_body(
            app(&fx)
                .oneshot(upload_request(Some("owner-1"), body))
                .await
                .unwrap(),
        )
        .await;
        let names: Vec<Value> = uploaded["files"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["server_filename"].clone())
            .collect();

        let feed = app(&fx)
            .oneshot(
                Request::get("/file-v2/get-list/response?session_id=s-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(feed.status(), StatusCode::OK);

        let trigger = app(&fx)
            .oneshot(json_request(
                "/file-v2/get-list",
                json!({ "list_server_file_name": names, "session_id": "s-42" }),
            ))
            .await
            .unwrap();
        assert_eq!(trigger.status(), StatusCode::OK);

        let raw = to_bytes(feed.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(raw.to_vec()).unwrap();
        assert_eq!(text.matches("event: file").count(), 2);
        assert!(text.contains("event: complete"));
    }
}
