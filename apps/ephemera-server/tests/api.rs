//! Router-level tests driving the full upload and download flows

use axum::{
    body::Bytes,
    http::{header, HeaderValue, StatusCode},
};
use axum_test::{TestRequest, TestResponse, TestServer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use ephemera_server::config::Config;
use ephemera_server::routes;
use ephemera_server::state::AppState;

const BOUNDARY: &str = "ephemera-test-boundary";

struct TestApp {
    _data: TempDir,
    _staging: TempDir,
    server: TestServer,
}

fn test_app() -> TestApp {
    let data = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();

    let mut config = Config::default();
    config.storage.data_path = data.path().to_path_buf();
    config.storage.staging_path = staging.path().to_path_buf();
    config.storage.sync_writes = false;
    config.rate_limit.requests = 10_000;

    let state = AppState::new(config).unwrap();
    TestApp {
        _data: data,
        _staging: staging,
        server: TestServer::new(routes::router(state)).unwrap(),
    }
}

enum Part<'a> {
    Text(&'a str, String),
    File(&'a str, &'a [u8]),
}

/// Multipart body with parts in the given order
fn multipart_body(parts: &[Part<'_>]) -> Bytes {
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
            Part::File(filename, content) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n",
                        filename
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(content);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    Bytes::from(body)
}

fn with_cookie(request: TestRequest, cookie: Option<&str>) -> TestRequest {
    match cookie {
        Some(cookie) => request.add_header(header::COOKIE, HeaderValue::from_str(cookie).unwrap()),
        None => request,
    }
}

fn with_token(request: TestRequest, token: Option<&str>) -> TestRequest {
    match token {
        Some(token) => request.add_header(
            header::HeaderName::from_static("x-chunk-token"),
            HeaderValue::from_str(token).unwrap(),
        ),
        None => request,
    }
}

async fn post_multipart(
    app: &TestApp,
    path: &str,
    cookie: Option<&str>,
    token: Option<&str>,
    body: Bytes,
) -> TestResponse {
    let request = app
        .server
        .post(path)
        .content_type(&format!("multipart/form-data; boundary={}", BOUNDARY))
        .bytes(body);
    with_token(with_cookie(request, cookie), token).await
}

/// Fetch a CSRF pair: (form token, cookie header value)
async fn csrf(app: &TestApp) -> (String, String) {
    let response = app.server.get("/csrf").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let cookie = response.cookie("csrf_token");
    let json: Value = response.json();
    (
        json["csrf_token"].as_str().unwrap().to_string(),
        format!("csrf_token={}", cookie.value()),
    )
}

fn hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

async fn download(app: &TestApp, id: &str) -> TestResponse {
    app.server
        .get(&format!("/file/{}", id))
        .add_query_param("dl", "true")
        .await
}

#[tokio::test]
async fn test_health() {
    let app = test_app();
    let response = app.server.get("/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>()["status"], "healthy");
    assert!(!response.header("x-request-id").is_empty());

    let response = app
        .server
        .get("/health")
        .add_header(
            header::HeaderName::from_static("x-request-id"),
            HeaderValue::from_static("trace-me-123"),
        )
        .await;
    assert_eq!(response.header("x-request-id"), "trace-me-123");
}

#[tokio::test]
async fn test_options_lists_expiry_choices() {
    let app = test_app();
    let response = app.server.get("/api/options").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let json: Value = response.json();
    let values: Vec<&str> = json["expiry_options"]
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o["value"].as_str().unwrap())
        .collect();
    assert_eq!(values, vec!["1h", "6h", "24h", "72h", "view"]);
}

#[tokio::test]
async fn test_single_upload_preview_and_download() {
    let app = test_app();
    let (token, cookie) = csrf(&app).await;
    let content = b"hello ephemeral world\n".repeat(50);

    let body = multipart_body(&[
        Part::Text("csrf_token", token),
        Part::Text("expiry", "24h".to_string()),
        Part::File("notes.txt", &content),
    ]);
    let response = post_multipart(&app, "/upload", Some(&cookie), None, body).await;
    assert_eq!(response.status_code(), StatusCode::OK, "{}", response.text());
    let json: Value = response.json();
    assert_eq!(json["filename"], "notes.txt");
    assert_eq!(json["expiry"], "24h");
    assert_eq!(json["size"], content.len() as u64);
    let id = json["file_id"].as_str().unwrap().to_string();

    let response = app.server.get(&format!("/file/{}", id)).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let preview: Value = response.json();
    assert_eq!(preview["mime_type"], "text/plain");
    assert_eq!(preview["view_once"], false);
    let share_url = preview["share_url"].as_str().unwrap();
    assert!(share_url.ends_with(&format!("/file/{}", id)));
    assert_eq!(preview["download_url"], format!("{}?dl=true", share_url));

    let response = download(&app, &id).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.as_bytes().as_ref(), content.as_slice());
    assert_eq!(response.header(header::CACHE_CONTROL), "no-store");

    // timed files survive a download
    assert_eq!(download(&app, &id).await.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn test_upload_without_csrf_is_forbidden() {
    let app = test_app();
    let body = multipart_body(&[Part::File("a.txt", b"data")]);

    let response = post_multipart(&app, "/upload", None, None, body).await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
    assert_eq!(response.json::<Value>()["status"], "error");
}

#[tokio::test]
async fn test_upload_with_mismatched_cookie_is_forbidden() {
    let app = test_app();
    let (token, _) = csrf(&app).await;
    let (_, other_cookie) = csrf(&app).await;

    let body = multipart_body(&[Part::Text("csrf_token", token), Part::File("a.txt", b"data")]);
    let response = post_multipart(&app, "/upload", Some(&other_cookie), None, body).await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_view_once_download_then_gone() {
    let app = test_app();
    let (token, cookie) = csrf(&app).await;

    let body = multipart_body(&[
        Part::Text("csrf_token", token),
        Part::Text("expiry", "view".to_string()),
        Part::File("secret.txt", b"burn after reading"),
    ]);
    let response = post_multipart(&app, "/upload", Some(&cookie), None, body).await;
    assert_eq!(response.status_code(), StatusCode::OK, "{}", response.text());
    let id = response.json::<Value>()["file_id"].as_str().unwrap().to_string();

    // preview does not consume the file
    let response = app.server.get(&format!("/file/{}", id)).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>()["view_once"], true);

    let response = download(&app, &id).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.as_bytes().as_ref(), b"burn after reading");

    assert_eq!(download(&app, &id).await.status_code(), StatusCode::NOT_FOUND);
}

struct ChunkedUpload<'a> {
    csrf_token: &'a str,
    cookie: &'a str,
    file_id: String,
    chunks: Vec<Vec<u8>>,
}

impl ChunkedUpload<'_> {
    async fn send(&self, app: &TestApp, index: usize, token: Option<&str>) -> TestResponse {
        let file_size: usize = self.chunks.iter().map(Vec::len).sum();
        let mut parts = vec![
            Part::Text("csrf_token", self.csrf_token.to_string()),
            Part::Text("file_id", self.file_id.clone()),
            Part::Text("chunk_index", index.to_string()),
            Part::Text("total_chunks", self.chunks.len().to_string()),
            Part::Text("file_size", file_size.to_string()),
            Part::Text("chunk_hash", hash(&self.chunks[index])),
        ];
        if index == 0 {
            parts.push(Part::Text("filename", "letters.txt".to_string()));
            parts.push(Part::Text("content_type", "text/plain".to_string()));
        }
        parts.push(Part::File("blob", &self.chunks[index]));

        post_multipart(app, "/upload/chunk", Some(self.cookie), token, multipart_body(&parts)).await
    }
}

#[tokio::test]
async fn test_chunked_upload_out_of_order() {
    let app = test_app();
    let (csrf_token, cookie) = csrf(&app).await;
    let upload = ChunkedUpload {
        csrf_token: &csrf_token,
        cookie: &cookie,
        file_id: uuid::Uuid::new_v4().to_string(),
        chunks: (0..3u8).map(|i| vec![b'a' + i; 1000]).collect(),
    };

    let response = upload.send(&app, 0, None).await;
    assert_eq!(response.status_code(), StatusCode::OK, "{}", response.text());
    let tokens = response.json::<Value>()["next_tokens"].clone();
    assert_eq!(tokens.as_object().unwrap().len(), 3);

    assert_eq!(
        upload.send(&app, 2, tokens["2"].as_str()).await.status_code(),
        StatusCode::OK
    );
    assert_eq!(
        upload.send(&app, 1, tokens["1"].as_str()).await.status_code(),
        StatusCode::OK
    );

    let response = with_token(
        with_cookie(app.server.post("/upload/finalize"), Some(&cookie)),
        tokens["3"].as_str(),
    )
    .json(&serde_json::json!({ "file_id": upload.file_id, "csrf_token": csrf_token }))
    .await;
    assert_eq!(response.status_code(), StatusCode::OK, "{}", response.text());
    let done: Value = response.json();
    assert_eq!(done["filename"], "letters.txt");
    assert_eq!(done["size"], 3000);

    let response = download(&app, &upload.file_id).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.as_bytes().as_ref(), upload.chunks.concat().as_slice());
}

#[tokio::test]
async fn test_chunk_retry_cannot_replace_staged_bytes() {
    let app = test_app();
    let (csrf_token, cookie) = csrf(&app).await;
    let mut upload = ChunkedUpload {
        csrf_token: &csrf_token,
        cookie: &cookie,
        file_id: uuid::Uuid::new_v4().to_string(),
        chunks: vec![b"AAAA".to_vec(), b"BBBB".to_vec()],
    };

    let response = upload.send(&app, 0, None).await;
    assert_eq!(response.status_code(), StatusCode::OK, "{}", response.text());
    let tokens = response.json::<Value>()["next_tokens"].clone();
    assert_eq!(upload.send(&app, 1, tokens["1"].as_str()).await.status_code(), StatusCode::OK);

    upload.chunks[1] = b"ZZZZ".to_vec();
    let response = upload.send(&app, 1, tokens["1"].as_str()).await;
    assert_eq!(response.status_code(), StatusCode::CONFLICT);

    let response = with_token(
        with_cookie(app.server.post("/upload/finalize"), Some(&cookie)),
        tokens["2"].as_str(),
    )
    .json(&serde_json::json!({ "file_id": upload.file_id, "csrf_token": csrf_token }))
    .await;
    assert_eq!(response.status_code(), StatusCode::OK, "{}", response.text());

    let response = download(&app, &upload.file_id).await;
    assert_eq!(response.as_bytes().as_ref(), b"AAAABBBB");
}

#[tokio::test]
async fn test_chunk_larger_than_declared_file_is_rejected() {
    let app = test_app();
    let (csrf_token, cookie) = csrf(&app).await;
    let upload = ChunkedUpload {
        csrf_token: &csrf_token,
        cookie: &cookie,
        file_id: uuid::Uuid::new_v4().to_string(),
        chunks: vec![vec![b'x'; 64 * 1024]],
    };

    let mut parts = vec![
        Part::Text("csrf_token", csrf_token.clone()),
        Part::Text("file_id", upload.file_id.clone()),
        Part::Text("chunk_index", "0".to_string()),
        Part::Text("total_chunks", "1".to_string()),
        Part::Text("file_size", "10".to_string()),
        Part::Text("chunk_hash", hash(&upload.chunks[0])),
        Part::Text("filename", "big.bin".to_string()),
    ];
    parts.push(Part::File("blob", &upload.chunks[0]));

    let response =
        post_multipart(&app, "/upload/chunk", Some(&cookie), None, multipart_body(&parts)).await;
    assert_eq!(response.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(response.json::<Value>()["error"], "too_large");
}

#[tokio::test]
async fn test_chunk_with_bad_token_is_rejected() {
    let app = test_app();
    let (csrf_token, cookie) = csrf(&app).await;
    let upload = ChunkedUpload {
        csrf_token: &csrf_token,
        cookie: &cookie,
        file_id: uuid::Uuid::new_v4().to_string(),
        chunks: vec![b"0123456789".to_vec(), b"abcdefghij".to_vec()],
    };

    assert_eq!(upload.send(&app, 0, None).await.status_code(), StatusCode::OK);

    let forged = "0".repeat(64);
    let response = upload.send(&app, 1, Some(&forged)).await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);

    let response = upload.send(&app, 1, None).await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_unknown_and_malformed_ids_are_not_found() {
    let app = test_app();

    let response = app
        .server
        .get(&format!("/file/{}", uuid::Uuid::new_v4()))
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);

    let response = download(&app, "not-a-uuid").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}
