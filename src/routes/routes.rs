//! Defines routes for the tus upload protocol.
//!
//! ## Structure (base path `/files/`)
//! - **Collection endpoints**
//!   - `POST    /files/`: create upload (creation, defer-length, concatenation)
//!   - `OPTIONS /files/`: protocol discovery
//!
//! - **Upload endpoints**
//!   - `HEAD    /files/{id}`: offset and length
//!   - `PATCH   /files/{id}`: append chunk at `Upload-Offset`
//!   - `GET     /files/{id}`: download received bytes
//!   - `DELETE  /files/{id}`: terminate upload

use crate::handlers::{
    AppState,
    health_handlers::{healthz, readyz},
    upload_handlers::{
        create_upload, delete_upload, get_upload, head_upload, options_uploads, patch_upload,
    },
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the router for health checks and the upload resource under `base_path`.
///
/// `base_path` must start and end with `/`.
pub fn routes(base_path: &str) -> Router<AppState> {
    let collection = base_path.trim_end_matches('/');

    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // `head` goes after `get` so it is not shadowed by the implicit HEAD of GET
        .route(
            &format!("{collection}/{{id}}"),
            get(get_upload)
                .head(head_upload)
                .patch(patch_upload)
                .delete(delete_upload)
                .options(options_uploads),
        )
        .route(
            &format!("{collection}/"),
            post(create_upload).options(options_uploads),
        );

    if collection.is_empty() {
        router
    } else {
        router.route(collection, post(create_upload).options(options_uploads))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handlers::tus::TUS_VERSION,
        services::{
            locker::MemoryLocker,
            memory_store::MemoryStore,
            notifier::{CompletedUpload, CompletionNotifier},
            upload_service::UploadService,
        },
    };
    use axum::{
        body::Body,
        http::{Method, Request, Response, StatusCode},
    };
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tokio::sync::mpsc::Receiver;
    use tower::ServiceExt;

    fn app_with(max_size: Option<u64>) -> (Router, Receiver<CompletedUpload>) {
        let (notifier, rx) = CompletionNotifier::channel(8);
        let uploads = UploadService::new(
            Arc::new(MemoryStore::new()),
            MemoryLocker::new(),
            notifier,
            max_size,
        );
        let state = AppState {
            uploads,
            base_path: "/files/".into(),
        };
        (routes("/files/").with_state(state), rx)
    }

    fn app() -> (Router, Receiver<CompletedUpload>) {
        app_with(None)
    }

    fn tus(method: Method, uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("tus-resumable", TUS_VERSION)
            .header("host", "localhost:3000")
    }

    fn header<'a>(res: &'a Response<Body>, name: &str) -> &'a str {
        res.headers()
            .get(name)
            .unwrap_or_else(|| panic!("missing header {name}"))
            .to_str()
            .unwrap()
    }

    async fn create(app: &Router, length: u64) -> String {
        let res = app
            .clone()
            .oneshot(
                tus(Method::POST, "/files/")
                    .header("upload-length", length.to_string())
                    .header("upload-metadata", "filename aGVsbG8udHh0,filetype dGV4dC9wbGFpbg==")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        let location = header(&res, "location");
        assert!(location.starts_with("http://localhost:3000/files/"));
        location.rsplit('/').next().unwrap().to_string()
    }

    async fn patch(app: &Router, id: &str, offset: u64, chunk: &'static [u8]) -> Response<Body> {
        app.clone()
            .oneshot(
                tus(Method::PATCH, &format!("/files/{id}"))
                    .header("content-type", "application/offset+octet-stream")
                    .header("upload-offset", offset.to_string())
                    .body(Body::from(chunk))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn head(app: &Router, id: &str) -> Response<Body> {
        app.clone()
            .oneshot(
                tus(Method::HEAD, &format!("/files/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn options_advertises_extensions() {
        let (app, _rx) = app_with(Some(1024));
        let res = app
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/files/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert_eq!(header(&res, "tus-version"), "1.0.0");
        assert_eq!(header(&res, "tus-max-size"), "1024");
        assert!(header(&res, "tus-extension").contains("creation-defer-length"));
    }

    #[tokio::test]
    async fn full_upload_flow() {
        let (app, mut rx) = app();
        let id = create(&app, 10).await;

        let res = patch(&app, &id, 0, b"hello ").await;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert_eq!(header(&res, "upload-offset"), "6");

        let res = head(&app, &id).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(header(&res, "upload-offset"), "6");
        assert_eq!(header(&res, "upload-length"), "10");
        assert_eq!(header(&res, "cache-control"), "no-store");
        assert_eq!(
            header(&res, "upload-metadata"),
            "filename aGVsbG8udHh0,filetype dGV4dC9wbGFpbg=="
        );

        let res = patch(&app, &id, 6, b"tus!").await;
        assert_eq!(header(&res, "upload-offset"), "10");
        assert_eq!(rx.recv().await.unwrap().id, id);

        let res = patch(&app, &id, 10, b"x").await;
        assert_eq!(res.status(), StatusCode::GONE);

        let res = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/files/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(header(&res, "content-type"), "text/plain");
        assert_eq!(
            header(&res, "content-disposition"),
            "attachment; filename=\"hello.txt\""
        );
        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello tus!");
    }

    #[tokio::test]
    async fn download_content_type_is_restricted() {
        let (app, _rx) = app();
        let mut ids = Vec::new();
        // text/html, then image/png with a parameter
        for metadata in ["filetype dGV4dC9odG1s", "filetype SU1BR0UvUE5HOyBxPTE="] {
            let res = app
                .clone()
                .oneshot(
                    tus(Method::POST, "/files/")
                        .header("upload-length", "0")
                        .header("upload-metadata", metadata)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::CREATED);
            ids.push(header(&res, "location").rsplit('/').next().unwrap().to_string());
        }

        let mut served = Vec::new();
        for id in &ids {
            let res = app
                .clone()
                .oneshot(
                    Request::builder()
                        .uri(format!("/files/{id}"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::OK);
            served.push(header(&res, "content-type").to_string());
        }
        assert_eq!(served, ["application/octet-stream", "image/png"]);
    }

    #[tokio::test]
    async fn stale_offset_is_conflict() {
        let (app, _rx) = app();
        let id = create(&app, 5).await;
        assert_eq!(patch(&app, &id, 0, b"abc").await.status(), StatusCode::NO_CONTENT);

        let res = patch(&app, &id, 0, b"abc").await;
        assert_eq!(res.status(), StatusCode::CONFLICT);
        assert_eq!(header(&res, "tus-resumable"), TUS_VERSION);
        assert_eq!(header(&head(&app, &id).await, "upload-offset"), "3");
    }

    #[tokio::test]
    async fn unknown_upload_is_not_found() {
        let (app, _rx) = app();
        assert_eq!(head(&app, "nope").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(patch(&app, "nope", 0, b"a").await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn patch_validates_headers() {
        let (app, _rx) = app();
        let id = create(&app, 5).await;

        let res = app
            .clone()
            .oneshot(
                tus(Method::PATCH, &format!("/files/{id}"))
                    .header("content-type", "text/plain")
                    .header("upload-offset", "0")
                    .body(Body::from("abc"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let res = app
            .clone()
            .oneshot(
                tus(Method::PATCH, &format!("/files/{id}"))
                    .header("content-type", "application/offset+octet-stream")
                    .body(Body::from("abc"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::PATCH)
                    .uri(format!("/files/{id}"))
                    .header("content-type", "application/offset+octet-stream")
                    .header("upload-offset", "0")
                    .body(Body::from("abc"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::PRECONDITION_FAILED);
    }

    #[tokio::test]
    async fn create_requires_a_length() {
        let (app, _rx) = app();
        let res = app
            .clone()
            .oneshot(tus(Method::POST, "/files/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = app
            .oneshot(
                tus(Method::POST, "/files/")
                    .header("upload-length", "-5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_over_max_size_is_rejected() {
        let (app, _rx) = app_with(Some(4));
        let res = app
            .oneshot(
                tus(Method::POST, "/files/")
                    .header("upload-length", "5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn deferred_length_declared_on_patch() {
        let (app, mut rx) = app();
        let res = app
            .clone()
            .oneshot(
                tus(Method::POST, "/files")
                    .header("upload-defer-length", "1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        let id = header(&res, "location").rsplit('/').next().unwrap().to_string();

        let res = head(&app, &id).await;
        assert_eq!(header(&res, "upload-defer-length"), "1");
        assert!(res.headers().get("upload-length").is_none());

        let res = app
            .clone()
            .oneshot(
                tus(Method::PATCH, &format!("/files/{id}"))
                    .header("content-type", "application/offset+octet-stream")
                    .header("upload-offset", "0")
                    .header("upload-length", "3")
                    .body(Body::from("abc"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert_eq!(header(&head(&app, &id).await, "upload-length"), "3");
        assert_eq!(rx.recv().await.unwrap().id, id);
    }

    #[tokio::test]
    async fn creation_with_upload_applies_first_chunk() {
        let (app, _rx) = app();
        let res = app
            .clone()
            .oneshot(
                tus(Method::POST, "/files/")
                    .header("upload-length", "8")
                    .header("content-type", "application/offset+octet-stream")
                    .body(Body::from("first"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(header(&res, "upload-offset"), "5");
    }

    #[tokio::test]
    async fn delete_terminates_upload() {
        let (app, _rx) = app();
        let id = create(&app, 5).await;
        let res = app
            .clone()
            .oneshot(
                tus(Method::DELETE, &format!("/files/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert_eq!(head(&app, &id).await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn concatenation_of_partials() {
        let (app, _rx) = app();
        let mut ids = Vec::new();
        for chunk in [&b"con"[..], b"cat"] {
            let res = app
                .clone()
                .oneshot(
                    tus(Method::POST, "/files/")
                        .header("upload-length", "3")
                        .header("upload-concat", "partial")
                        .header("content-type", "application/offset+octet-stream")
                        .body(Body::from(chunk))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::CREATED);
            ids.push(header(&res, "location").to_string());
        }

        let res = app
            .clone()
            .oneshot(
                tus(Method::POST, "/files/")
                    .header("upload-concat", format!("final;{} {}", ids[0], ids[1]))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        let id = header(&res, "location").rsplit('/').next().unwrap().to_string();

        let res = head(&app, &id).await;
        assert_eq!(header(&res, "upload-offset"), "6");
        assert!(header(&res, "upload-concat").starts_with("final;/files/"));

        assert_eq!(patch(&app, &id, 6, b"!").await.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn health_endpoints_respond() {
        let (app, _rx) = app();
        let res = app
            .clone()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = app
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = res.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["checks"]["memory"]["ok"], true);
        assert_eq!(json["active_leases"], 0);
    }
}
