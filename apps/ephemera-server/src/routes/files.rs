//! File retrieval endpoints
//!
//! `GET /file/:id` answers with preview metadata unless `dl` is set, in which
//! case the decompressed content is streamed. The copy runs on a blocking
//! thread and feeds the response body through a bounded channel.

use std::io::{self, BufWriter, Write};

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Method},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{public_base_url, run_blocking};
use crate::error::{AppError, Result};
use crate::models::{Expiry, FileRecord};
use crate::retrieval::{content_disposition, RetrievalError};
use crate::state::AppState;
use crate::upload::validation::{format_file_size, parse_flag};

const STREAM_BUFFER_SIZE: usize = 64 * 1024;
const STREAM_CHANNEL_DEPTH: usize = 4;

#[derive(Debug, Default, Deserialize)]
pub struct FileQuery {
    pub dl: Option<String>,
}

impl FileQuery {
    fn wants_download(&self) -> bool {
        self.dl.as_deref().is_some_and(parse_flag)
    }
}

/// Preview metadata for a stored file
#[derive(Debug, Serialize)]
pub struct FilePreview {
    pub file_id: Uuid,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub size_formatted: String,
    pub upload_time: DateTime<Utc>,
    pub expiry: &'static str,
    pub expiry_time: Option<DateTime<Utc>>,
    pub view_once: bool,
    pub is_encrypted: bool,
    pub has_sample: bool,
    pub is_image: bool,
    pub is_video: bool,
    pub is_audio: bool,
    pub is_previewable: bool,
    pub share_url: String,
    pub download_url: String,
    pub sample_url: Option<String>,
}

impl FilePreview {
    fn new(record: &FileRecord, base_url: &str) -> Self {
        let share_url = format!("{}/file/{}", base_url, record.id);
        Self {
            file_id: record.id,
            filename: record.filename.clone(),
            mime_type: record.mime_type.clone(),
            size: record.size,
            size_formatted: format_file_size(record.size),
            upload_time: record.upload_time,
            expiry: record.expiry_policy.as_str(),
            expiry_time: record.expiry.time(),
            view_once: record.expiry == Expiry::OnFirstView,
            is_encrypted: record.is_encrypted,
            has_sample: record.has_sample(),
            is_image: record.is_image(),
            is_video: record.is_video(),
            is_audio: record.is_audio(),
            is_previewable: record.is_previewable(),
            download_url: format!("{}?dl=true", share_url),
            sample_url: record.has_sample().then(|| format!("{}/sample", share_url)),
            share_url,
        }
    }
}

/// Unparseable ids are reported as missing files
fn parse_id(raw: &str) -> Result<Uuid> {
    raw.parse::<Uuid>()
        .map_err(|_| AppError::NotFound(format!("File not found: {}", raw)))
}

pub async fn get_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<FileQuery>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response> {
    let id = parse_id(&id)?;
    let files = state.files().clone();
    let record = run_blocking(move || files.resolve(id)).await?;

    if !query.wants_download() {
        let base_url = public_base_url(&state, &headers);
        return Ok(Json(FilePreview::new(&record, &base_url)).into_response());
    }

    let response_headers = download_headers(&record);

    // HEAD must not consume a view-once file
    if method == Method::HEAD {
        return Ok((response_headers, Body::empty()).into_response());
    }

    let files = state.files().clone();
    let handle = run_blocking(move || files.open_content(record)).await?;
    let file_id = handle.record().id;

    let (tx, mut rx) = mpsc::channel::<io::Result<Bytes>>(STREAM_CHANNEL_DEPTH);
    tokio::task::spawn_blocking(move || {
        let writer = ChannelWriter { tx: tx.clone() };
        let mut sink = BufWriter::with_capacity(STREAM_BUFFER_SIZE, writer);
        match handle.copy_to(&mut sink) {
            Ok(bytes) => tracing::debug!(file_id = %file_id, bytes, "File streamed"),
            Err(RetrievalError::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                tracing::info!(file_id = %file_id, "Client disconnected during download");
            }
            Err(e) => {
                tracing::error!(file_id = %file_id, error = %e, "Failed to stream file");
                let _ = tx.blocking_send(Err(io::Error::other(e.to_string())));
            }
        }
    });

    let body = Body::from_stream(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)));
    Ok((response_headers, body).into_response())
}

fn download_headers(record: &FileRecord) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let content_type = HeaderValue::from_str(&record.mime_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(record.size));
    if let Ok(disposition) = HeaderValue::from_str(&content_disposition(record)) {
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers
}

/// Blocking writer feeding a response body channel
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "response body dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub async fn get_sample(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let id = parse_id(&id)?;
    let files = state.files().clone();
    let sample = run_blocking(move || files.serve_sample(id)).await?;

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
        ],
        sample,
    )
        .into_response())
}
