//! Health check and upload options endpoints

use axum::{extract::State, Json};
use serde::Serialize;

use crate::models::{expiry_options, ExpiryOption};
use crate::state::AppState;
use crate::upload::validation::format_file_size;
use crate::upload::{MAX_CHUNK_SIZE, TOKEN_LOOKAHEAD};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub service: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        service: "ephemera-server",
    })
}

#[derive(Serialize)]
pub struct UploadOptions {
    pub max_upload_size: u64,
    pub max_upload_size_formatted: String,
    pub allowed_types: Vec<String>,
    pub max_chunk_size: u64,
    pub token_lookahead: u32,
    pub expiry_options: Vec<ExpiryOption>,
}

pub async fn upload_options(State(state): State<AppState>) -> Json<UploadOptions> {
    let upload = &state.config().upload;
    Json(UploadOptions {
        max_upload_size: upload.max_upload_size,
        max_upload_size_formatted: format_file_size(upload.max_upload_size),
        allowed_types: upload.allowed_types.clone(),
        max_chunk_size: MAX_CHUNK_SIZE,
        token_lookahead: TOKEN_LOOKAHEAD,
        expiry_options: expiry_options(),
    })
}
