use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use futures::{StreamExt, stream};
use http_body_util::BodyExt;
use media_store::{
    db,
    handlers::media_handlers::NEXT_CONTINUATION_TOKEN,
    models::digest::{Digest, DigestAlgorithm},
    routes::routes::routes,
    services::{blob_store::BlobStoreOptions, ingest::IngestLimits},
    state::AppState,
};
use serde_json::Value;
use std::{io, sync::Arc, time::Duration};
use tempfile::TempDir;
use tower::ServiceExt;

const BOUNDARY: &str = "media-store-test-boundary";

enum Part<'a> {
    Text(&'a str, &'a str),
    File {
        name: &'a str,
        content_type: Option<&'a str>,
        data: &'a [u8],
    },
}

fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
            Part::File {
                name,
                content_type,
                data,
            } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}.bin\"\r\n",
                        name, name
                    )
                    .as_bytes(),
                );
                if let Some(content_type) = content_type {
                    body.extend_from_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
                }
                body.extend_from_slice(b"\r\n");
                body.extend_from_slice(data);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

async fn app(dir: &TempDir) -> Router {
    app_with_idle(dir, Duration::from_secs(5)).await.0
}

async fn app_with_idle(dir: &TempDir, idle_timeout: Duration) -> (Router, AppState) {
    let db = Arc::new(db::connect_in_memory().await.unwrap());
    let limits = IngestLimits {
        max_upload_bytes: 1024,
        max_thumbnail_bytes: 256,
        idle_timeout,
    };
    let state = AppState::new(db, dir.path(), BlobStoreOptions::default(), limits);
    (routes(64 * 1024).with_state(state.clone()), state)
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn upload_request(parts: &[Part<'_>]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/media")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap()
}

/// An upload whose body sends `prefix` and then never sends another byte.
fn stalled_upload_request(prefix: Vec<u8>) -> Request<Body> {
    let body = stream::iter(vec![Ok::<_, io::Error>(Bytes::from(prefix))]).chain(stream::pending());
    Request::builder()
        .method("POST")
        .uri("/media")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from_stream(body))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn get_range(uri: &str, range: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::RANGE, range)
        .body(Body::empty())
        .unwrap()
}

/// Upload `data` and return the new id.
async fn upload(app: &Router, title: &str, uploader: &str, data: &[u8]) -> String {
    let response = send(
        app,
        upload_request(&[
            Part::Text("title", title),
            Part::Text("description", "a clip"),
            Part::Text("uploaderRef", uploader),
            Part::File {
                name: "file",
                content_type: Some("video/mp4"),
                data,
            },
        ]),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await["id"].as_str().unwrap().to_string()
}

fn header_str<'a>(response: &'a Response, name: header::HeaderName) -> &'a str {
    response.headers()[name].to_str().unwrap()
}

#[tokio::test]
async fn upload_then_stream_a_range() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;
    let id = upload(&app, "Clip", "alice@example.com", b"0123456789").await;

    let uri = format!("/media/{}/content", id);
    let response = send(&app, get_range(&uri, "bytes=2-5")).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header_str(&response, header::CONTENT_RANGE), "bytes 2-5/10");
    assert_eq!(header_str(&response, header::CONTENT_LENGTH), "4");
    assert_eq!(header_str(&response, header::CONTENT_TYPE), "video/mp4");
    assert_eq!(body_bytes(response).await, b"2345");

    let response = send(&app, get(&uri)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, header::ACCEPT_RANGES), "bytes");
    assert_eq!(header_str(&response, header::CONTENT_DISPOSITION), "inline");
    assert!(response.headers().contains_key(header::ETAG));
    assert_eq!(body_bytes(response).await, b"0123456789");

    let response = send(&app, get_range(&uri, "bytes=-3")).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(body_bytes(response).await, b"789");
}

#[tokio::test]
async fn range_past_the_end_is_416() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;
    let id = upload(&app, "Clip", "alice", b"0123456789").await;
    let uri = format!("/media/{}/content", id);

    for range in ["bytes=10-", "bytes=0-1,4-5", "pages=1-2"] {
        let response = send(&app, get_range(&uri, range)).await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE, "{range}");
        assert_eq!(header_str(&response, header::CONTENT_RANGE), "bytes */10");
        assert!(body_bytes(response).await.is_empty());
    }
}

#[tokio::test]
async fn head_returns_headers_only() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;
    let id = upload(&app, "Clip", "alice", b"0123456789").await;

    let request = Request::builder()
        .method("HEAD")
        .uri(format!("/media/{}/content", id))
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, header::CONTENT_LENGTH), "10");
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn unknown_id_is_404() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;

    for uri in [
        "/media/unknown-id",
        "/media/unknown-id/content",
        "/media/unknown-id/thumbnail",
    ] {
        let response = send(&app, get(uri)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        assert_eq!(body_json(response).await["error"], "NotFound");
    }
}

#[tokio::test]
async fn empty_or_missing_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;

    let response = send(
        &app,
        upload_request(&[
            Part::Text("title", "Empty"),
            Part::Text("uploaderRef", "alice"),
            Part::File {
                name: "file",
                content_type: Some("video/mp4"),
                data: b"",
            },
        ]),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "ValidationError");
    assert_eq!(body["status"], 400);

    let response = send(
        &app,
        upload_request(&[Part::Text("title", "No file"), Part::Text("uploaderRef", "alice")]),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(&app, get("/media")).await;
    assert_eq!(body_json(response).await, Value::Array(vec![]));
}

#[tokio::test]
async fn missing_title_is_rejected() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;

    let response = send(
        &app,
        upload_request(&[
            Part::Text("uploaderRef", "alice"),
            Part::File {
                name: "file",
                content_type: None,
                data: b"bytes",
            },
        ]),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "ValidationError");
}

#[tokio::test]
async fn oversized_upload_is_413() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;
    let data = vec![7u8; 2000];

    let response = send(
        &app,
        upload_request(&[
            Part::Text("title", "Big"),
            Part::Text("uploaderRef", "alice"),
            Part::File {
                name: "file",
                content_type: Some("video/mp4"),
                data: &data,
            },
        ]),
    )
    .await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body_json(response).await["error"], "PayloadTooLarge");
}

#[tokio::test]
async fn thumbnail_defaults_to_jpeg() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;

    let response = send(
        &app,
        upload_request(&[
            Part::Text("title", "With thumb"),
            Part::Text("uploaderRef", "alice"),
            Part::File {
                name: "file",
                content_type: Some("video/mp4"),
                data: b"payload",
            },
            Part::File {
                name: "thumbnail",
                content_type: None,
                data: b"tiny-jpeg",
            },
        ]),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let id = body_json(response).await["id"].as_str().unwrap().to_string();

    let response = send(&app, get(&format!("/media/{}/thumbnail", id))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, header::CONTENT_TYPE), "image/jpeg");
    assert_eq!(body_bytes(response).await, b"tiny-jpeg");

    let bare = upload(&app, "Bare", "alice", b"other").await;
    let response = send(&app, get(&format!("/media/{}/thumbnail", bare))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn listing_filters_and_paginates_in_creation_order() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;
    upload(&app, "a1", "alice", b"one").await;
    upload(&app, "b1", "bob", b"two").await;
    upload(&app, "a2", "alice", b"three").await;
    upload(&app, "a3", "alice", b"four").await;

    let titles = |body: &Value| -> Vec<String> {
        body.as_array()
            .unwrap()
            .iter()
            .map(|m| m["title"].as_str().unwrap().to_string())
            .collect()
    };

    let response = send(&app, get("/media?uploader=alice")).await;
    assert_eq!(titles(&body_json(response).await), ["a1", "a2", "a3"]);

    let response = send(&app, get("/media?limit=2")).await;
    let token = header_str(&response, NEXT_CONTINUATION_TOKEN.parse().unwrap()).to_string();
    assert_eq!(titles(&body_json(response).await), ["a1", "b1"]);

    let response = send(&app, get(&format!("/media?limit=2&continuation-token={}", token))).await;
    assert!(!response.headers().contains_key(NEXT_CONTINUATION_TOKEN));
    assert_eq!(titles(&body_json(response).await), ["a2", "a3"]);

    let response = send(&app, get("/media?continuation-token=%21%21")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn patch_then_delete() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;
    let id = upload(&app, "Before", "alice", b"0123456789").await;
    let uri = format!("/media/{}", id);

    let patch = |body: &'static str| {
        Request::builder()
            .method("PATCH")
            .uri(format!("/media/{}", id))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    };

    let response = send(&app, patch(r#"{"title":"After"}"#)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["title"], "After");
    assert_eq!(body["byte_length"], 10);

    let response = send(&app, patch(r#"{"title":"  "}"#)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(&app, get(&uri)).await;
    assert_eq!(body_json(response).await["title"], "After");

    let delete = Request::builder()
        .method("DELETE")
        .uri(&uri)
        .body(Body::empty())
        .unwrap();
    let response = send(&app, delete).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    assert_eq!(send(&app, get(&uri)).await.status(), StatusCode::NOT_FOUND);
    let response = send(&app, get(&format!("{}/content", uri))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn concurrent_identical_uploads_share_one_blob() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;

    let (a, b) = tokio::join!(
        upload(&app, "first", "alice", b"identical bytes"),
        upload(&app, "second", "bob", b"identical bytes"),
    );
    assert_ne!(a, b);

    let meta_a = body_json(send(&app, get(&format!("/media/{}", a))).await).await;
    let meta_b = body_json(send(&app, get(&format!("/media/{}", b))).await).await;
    assert_eq!(meta_a["digest"], meta_b["digest"]);

    for id in [a, b] {
        let response = send(&app, get(&format!("/media/{}/content", id))).await;
        assert_eq!(body_bytes(response).await, b"identical bytes");
    }
}

#[tokio::test]
async fn health_endpoints_report_ok() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;

    let response = send(&app, get("/healthz")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(&app, get("/readyz")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["checks"]["sqlite"]["ok"], true);
    assert_eq!(body["checks"]["blobs"]["ok"], true);
    assert_eq!(body["checks"]["staging"]["ok"], true);
    assert_eq!(body["open_readers"], 0);
}

#[tokio::test]
async fn unwritable_staging_is_not_ready() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;
    std::fs::write(dir.path().join(".staging"), b"not a directory").unwrap();

    let response = send(&app, get("/readyz")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["status"], "error");
    assert_eq!(body["checks"]["blobs"]["ok"], true);
    assert_eq!(body["checks"]["staging"]["ok"], false);
    assert!(body["checks"]["staging"]["error"].is_string());
}

#[tokio::test]
async fn upload_stalled_between_parts_times_out() {
    let dir = TempDir::new().unwrap();
    let (app, state) = app_with_idle(&dir, Duration::from_millis(50)).await;

    // A complete file part followed by the start of another part.
    let mut prefix = multipart_body(&[
        Part::Text("title", "stalled"),
        Part::File {
            name: "file",
            content_type: Some("video/mp4"),
            data: b"0123456789",
        },
    ]);
    prefix.truncate(prefix.len() - "--\r\n".len());
    prefix.extend_from_slice(b"\r\n");

    let response = tokio::time::timeout(
        Duration::from_secs(2),
        send(&app, stalled_upload_request(prefix)),
    )
    .await
    .expect("upload should time out instead of hanging");

    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    assert_eq!(body_json(response).await["error"], "Timeout");
    let digest = Digest::compute(DigestAlgorithm::Sha256, b"0123456789");
    assert!(!state.blobs.is_pinned(&digest));

    let listing = body_json(send(&app, get("/media")).await).await;
    assert_eq!(listing.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn upload_stalled_inside_a_text_field_times_out() {
    let dir = TempDir::new().unwrap();
    let (app, _state) = app_with_idle(&dir, Duration::from_millis(50)).await;

    let prefix = format!(
        "--{}\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nhal",
        BOUNDARY
    );

    let response = tokio::time::timeout(
        Duration::from_secs(2),
        send(&app, stalled_upload_request(prefix.into_bytes())),
    )
    .await
    .expect("upload should time out instead of hanging");

    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    assert_eq!(body_json(response).await["error"], "Timeout");
}
