//! Upload endpoints
//!
//! - `POST /upload` single-shot multipart upload
//! - `POST /upload/chunk` one chunk of a chunked upload
//! - `POST /upload/finalize` assemble a chunked upload
//!
//! Multipart text fields must precede the `file` part: the CSRF check and the
//! chunk metadata are evaluated before any file bytes are consumed.

use std::io;

use axum::{
    extract::{multipart::MultipartError, FromRequest, Multipart, Request, State},
    http::{header, HeaderMap, StatusCode},
    Form, Json,
};
use axum_extra::extract::cookie::CookieJar;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::io::StreamReader;
use uuid::Uuid;

use super::{public_base_url, verify_csrf};
use crate::csrf::CSRF_FORM_FIELD;
use crate::error::{AppError, Result};
use crate::models::FileRecord;
use crate::state::AppState;
use crate::upload::validation::{decode_sample, format_file_size, parse_expiry, parse_flag};
use crate::upload::{ChunkAccepted, ChunkSubmission, FirstChunkMeta, SingleUpload};

/// Header carrying the chunk or finalize token
pub const CHUNK_TOKEN_HEADER: &str = "x-chunk-token";

// ============================================================================
// Response Types
// ============================================================================

/// Response for a stored file
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub status: &'static str,
    pub file_id: Uuid,
    pub filename: String,
    pub size: u64,
    pub size_formatted: String,
    pub mime_type: String,
    pub expiry: &'static str,
    pub expiry_time: Option<DateTime<Utc>>,
    pub share_url: String,
    pub download_url: String,
}

impl UploadResponse {
    fn new(record: &FileRecord, base_url: &str) -> Self {
        let share_url = format!("{}/file/{}", base_url, record.id);
        Self {
            status: "success",
            file_id: record.id,
            filename: record.filename.clone(),
            size: record.size,
            size_formatted: format_file_size(record.size),
            mime_type: record.mime_type.clone(),
            expiry: record.expiry_policy.as_str(),
            expiry_time: record.expiry.time(),
            download_url: format!("{}?dl=true", share_url),
            share_url,
        }
    }
}

fn multipart_error(error: MultipartError) -> AppError {
    if error.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::TooLarge(error.body_text())
    } else {
        AppError::BadRequest(error.body_text())
    }
}

// ============================================================================
// Single-shot Upload
// ============================================================================

pub async fn upload_single(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>> {
    let mut csrf_token: Option<String> = None;
    let mut expiry = String::new();
    let mut encrypted = false;
    let mut encrypted_sample: Option<String> = None;
    let mut file = None;
    let mut csrf_checked = false;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                verify_csrf(&state, &jar, &headers, csrf_token.as_deref())?;
                csrf_checked = true;
                let filename = field.file_name().unwrap_or_default().to_string();
                let content = field.bytes().await.map_err(multipart_error)?;
                file = Some((filename, content));
            }
            CSRF_FORM_FIELD => csrf_token = Some(field.text().await.map_err(multipart_error)?),
            "expiry" => expiry = field.text().await.map_err(multipart_error)?,
            "encrypted" => encrypted = parse_flag(&field.text().await.map_err(multipart_error)?),
            "encrypted_sample" => {
                encrypted_sample = Some(field.text().await.map_err(multipart_error)?)
            }
            other => tracing::debug!(field = %other, "Ignoring unknown form field"),
        }
    }

    if !csrf_checked {
        verify_csrf(&state, &jar, &headers, csrf_token.as_deref())?;
    }
    let (filename, content) =
        file.ok_or_else(|| AppError::BadRequest("Missing file field".to_string()))?;

    let upload = SingleUpload {
        filename,
        content,
        expiry: parse_expiry(&expiry),
        is_encrypted: encrypted,
        encrypted_sample: encrypted_sample.as_deref().and_then(decode_sample),
    };
    let record = state.uploads().upload_single(upload).await?;

    Ok(Json(UploadResponse::new(&record, &public_base_url(&state, &headers))))
}

// ============================================================================
// Chunk Upload
// ============================================================================

/// Text fields of a chunk request
#[derive(Debug, Default)]
struct ChunkForm {
    file_id: Option<String>,
    chunk_index: Option<String>,
    total_chunks: Option<String>,
    file_size: Option<String>,
    chunk_hash: Option<String>,
    csrf_token: Option<String>,
    filename: Option<String>,
    content_type: Option<String>,
    encrypted: Option<String>,
    encrypted_sample: Option<String>,
    expiry: Option<String>,
}

impl ChunkForm {
    fn set(&mut self, name: &str, value: String) {
        let slot = match name {
            "file_id" => &mut self.file_id,
            "chunk_index" => &mut self.chunk_index,
            "total_chunks" => &mut self.total_chunks,
            "file_size" => &mut self.file_size,
            "chunk_hash" => &mut self.chunk_hash,
            CSRF_FORM_FIELD => &mut self.csrf_token,
            "filename" => &mut self.filename,
            "content_type" => &mut self.content_type,
            "encrypted" => &mut self.encrypted,
            "encrypted_sample" => &mut self.encrypted_sample,
            "expiry" => &mut self.expiry,
            other => {
                tracing::debug!(field = %other, "Ignoring unknown chunk field");
                return;
            }
        };
        *slot = Some(value);
    }

    fn into_submission(self, headers: &HeaderMap, part_filename: Option<&str>) -> Result<ChunkSubmission> {
        let file_id = required(self.file_id, "file_id")?
            .trim()
            .parse::<Uuid>()
            .map_err(|_| AppError::BadRequest("Invalid file_id".to_string()))?;
        let chunk_index: u32 = parse_number(self.chunk_index, "chunk_index")?;
        let total_chunks: u32 = parse_number(self.total_chunks, "total_chunks")?;
        let file_size: u64 = parse_number(self.file_size, "file_size")?;

        let chunk_hash = required(self.chunk_hash, "chunk_hash")?.trim().to_string();
        if chunk_hash.len() != 64 || !chunk_hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(AppError::BadRequest(
                "chunk_hash must be a hex SHA-256 digest".to_string(),
            ));
        }

        let first = (chunk_index == 0).then(|| FirstChunkMeta {
            filename: self
                .filename
                .or_else(|| part_filename.map(str::to_string))
                .unwrap_or_default(),
            content_type: self.content_type.unwrap_or_default(),
            is_encrypted: self.encrypted.as_deref().is_some_and(parse_flag),
            encrypted_sample: self.encrypted_sample.as_deref().and_then(decode_sample),
            expiry: parse_expiry(self.expiry.as_deref().unwrap_or_default()),
        });

        Ok(ChunkSubmission {
            file_id,
            chunk_index,
            total_chunks,
            file_size,
            chunk_hash,
            token: chunk_token(headers),
            first,
        })
    }
}

fn required(value: Option<String>, name: &str) -> Result<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest(format!("Missing field: {}", name)))
}

fn parse_number<T: std::str::FromStr>(value: Option<String>, name: &str) -> Result<T> {
    required(value, name)?
        .trim()
        .parse()
        .map_err(|_| AppError::BadRequest(format!("Invalid number in field: {}", name)))
}

fn chunk_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CHUNK_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub async fn upload_chunk(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<ChunkAccepted>> {
    let mut form = ChunkForm::default();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();

        if name == "file" {
            verify_csrf(&state, &jar, &headers, form.csrf_token.as_deref())?;
            let submission = form.into_submission(&headers, field.file_name())?;
            let body = StreamReader::new(field.map_err(io::Error::other));
            let accepted = state.uploads().submit_chunk(submission, body).await?;
            return Ok(Json(accepted));
        }

        let value = field.text().await.map_err(multipart_error)?;
        form.set(&name, value);
    }

    Err(AppError::BadRequest("Missing file field".to_string()))
}

// ============================================================================
// Finalize
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct FinalizeRequest {
    #[serde(default)]
    pub file_id: String,
    #[serde(default)]
    pub csrf_token: Option<String>,
}

async fn read_finalize_request(state: &AppState, request: Request) -> Result<FinalizeRequest> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("application/json") {
        let Json(body) = Json::<FinalizeRequest>::from_request(request, state)
            .await
            .map_err(|e| AppError::BadRequest(e.body_text()))?;
        return Ok(body);
    }

    if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(request, state)
            .await
            .map_err(|e| AppError::BadRequest(e.body_text()))?;
        let mut body = FinalizeRequest::default();
        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            let name = field.name().unwrap_or_default().to_string();
            let value = field.text().await.map_err(multipart_error)?;
            match name.as_str() {
                "file_id" => body.file_id = value,
                CSRF_FORM_FIELD => body.csrf_token = Some(value),
                _ => {}
            }
        }
        return Ok(body);
    }

    let Form(body) = Form::<FinalizeRequest>::from_request(request, state)
        .await
        .map_err(|e| AppError::BadRequest(e.body_text()))?;
    Ok(body)
}

pub async fn finalize(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    request: Request,
) -> Result<Json<UploadResponse>> {
    let body = read_finalize_request(&state, request).await?;
    verify_csrf(&state, &jar, &headers, body.csrf_token.as_deref())?;

    let file_id = body
        .file_id
        .trim()
        .parse::<Uuid>()
        .map_err(|_| AppError::BadRequest("Invalid file_id".to_string()))?;
    let token = chunk_token(&headers)
        .ok_or_else(|| AppError::Auth("Missing finalize token".to_string()))?;

    let record = state.uploads().finalize(file_id, &token).await?;

    Ok(Json(UploadResponse::new(&record, &public_base_url(&state, &headers))))
}
