//! Upload validation shared by the chunked and single-shot paths
//!
//! Filename sanitization, content sniffing, type allow/deny checks and parsing
//! of the optional form fields.

use base64::{engine::general_purpose, Engine as _};

use super::types::{UploadError, MAX_SAMPLE_SIZE};
use crate::models::ExpiryPolicy;

/// Bytes inspected when sniffing the content type
pub const SNIFF_LEN: usize = 512;

pub const MAX_FILENAME_LEN: usize = 255;

const DEFAULT_FILENAME: &str = "file";

/// Types rejected regardless of the configured allow-list
pub const DANGEROUS_TYPES: &[&str] = &[
    "application/x-msdownload",
    "application/x-executable",
    "application/x-dosexec",
    "application/x-msdos-program",
    "application/x-msi",
    "application/x-coredump",
];

// ============================================================================
// Filenames
// ============================================================================

/// Reduce a client-supplied name to a safe display name.
///
/// Strips `..` sequences and directory components, drops control characters,
/// truncates to 255 bytes on a char boundary and never returns an empty name.
pub fn sanitize_filename(filename: &str) -> String {
    let without_traversal = filename.replace("..", "");
    let base = without_traversal
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if c == '"' { '\'' } else { c })
        .collect();
    let cleaned = cleaned.trim();

    let mut end = cleaned.len().min(MAX_FILENAME_LEN);
    while !cleaned.is_char_boundary(end) {
        end -= 1;
    }
    let truncated = &cleaned[..end];

    if truncated.is_empty() || truncated == "." {
        DEFAULT_FILENAME.to_string()
    } else {
        truncated.to_string()
    }
}

// ============================================================================
// Content Types
// ============================================================================

/// Detect a MIME type from leading magic bytes
pub fn detect_mime_from_bytes(data: &[u8]) -> String {
    let data = &data[..data.len().min(SNIFF_LEN)];

    let detected = match data {
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => "image/png",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'A', b'V', b'E', ..] => "audio/wav",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'A', b'V', b'I', b' ', ..] => "video/avi",
        [b'B', b'M', ..] if data.len() >= 14 => "image/bmp",
        [0x00, 0x00, 0x01, 0x00, ..] => "image/x-icon",
        [b'%', b'P', b'D', b'F', b'-', ..] => "application/pdf",
        [b'P', b'K', 0x03, 0x04, ..] | [b'P', b'K', 0x05, 0x06, ..] | [b'P', b'K', 0x07, 0x08, ..] => {
            "application/zip"
        }
        [0x1F, 0x8B, 0x08, ..] => "application/x-gzip",
        [b'R', b'a', b'r', b'!', 0x1A, 0x07, ..] => "application/x-rar-compressed",
        [b'7', b'z', 0xBC, 0xAF, 0x27, 0x1C, ..] => "application/x-7z-compressed",
        [b'O', b'g', b'g', b'S', 0x00, ..] => "application/ogg",
        [b'f', b'L', b'a', b'C', ..] => "audio/flac",
        [0x00, 0x00, 0x00, _, b'f', b't', b'y', b'p', ..] => "video/mp4",
        [0x1A, 0x45, 0xDF, 0xA3, ..] => "video/webm",
        [b'I', b'D', b'3', ..] | [0xFF, 0xFB, ..] | [0xFF, 0xF3, ..] | [0xFF, 0xF2, ..] => "audio/mpeg",
        [0x7F, b'E', b'L', b'F', ..] => "application/x-executable",
        [b'M', b'Z', ..] => "application/x-msdownload",
        _ if looks_like_html(data) => "text/html",
        _ if is_likely_text(data) => "text/plain",
        _ => "application/octet-stream",
    };

    detected.to_string()
}

fn looks_like_html(data: &[u8]) -> bool {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    let head = &data[start..];
    ["<!doctype html", "<html", "<head", "<script", "<body"]
        .iter()
        .any(|tag| head.len() >= tag.len() && head[..tag.len()].eq_ignore_ascii_case(tag.as_bytes()))
}

fn is_likely_text(data: &[u8]) -> bool {
    if data.is_empty() {
        return true;
    }
    if data.contains(&0) {
        return false;
    }

    let text_chars = data
        .iter()
        .filter(|&&byte| {
            byte == b'\n' || byte == b'\r' || byte == b'\t' || (32..=126).contains(&byte) || byte >= 128
        })
        .count();

    text_chars as f64 / data.len() as f64 > 0.85
}

/// Check a content type against the deny-list, then the allow-list.
///
/// An empty allow-list, or one containing `*`, permits everything not denied.
pub fn validate_content_type(content_type: &str, allowed_types: &[String]) -> Result<(), UploadError> {
    let normalized = content_type.trim().to_ascii_lowercase();

    if DANGEROUS_TYPES.iter().any(|denied| normalized.starts_with(denied)) {
        tracing::warn!(content_type = %normalized, "Rejected dangerous content type");
        return Err(UploadError::InvalidFileType(normalized));
    }

    let allow_all = allowed_types.is_empty() || allowed_types.iter().any(|t| t.trim() == "*");
    if allow_all {
        return Ok(());
    }

    let allowed = allowed_types.iter().any(|prefix| {
        let prefix = prefix.trim().to_ascii_lowercase();
        !prefix.is_empty() && normalized.starts_with(&prefix)
    });

    if allowed {
        Ok(())
    } else {
        tracing::warn!(content_type = %normalized, "Content type not in allow-list");
        Err(UploadError::InvalidFileType(normalized))
    }
}

// ============================================================================
// Form Fields
// ============================================================================

/// Parse the `expiry` field, falling back to the default policy
pub fn parse_expiry(value: &str) -> ExpiryPolicy {
    let value = value.trim();
    if value.is_empty() {
        return ExpiryPolicy::default();
    }
    ExpiryPolicy::parse(value).unwrap_or_else(|| {
        tracing::warn!(expiry = %value, "Unknown expiry value, using default");
        ExpiryPolicy::default()
    })
}

/// Interpret checkbox-style boolean form values
pub fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "on" | "yes")
}

/// Decode the encrypted sample field.
///
/// Accepts standard or URL-safe alphabets, with or without padding. Empty,
/// undecodable or oversized samples are dropped.
pub fn decode_sample(encoded: &str) -> Option<Vec<u8>> {
    let normalized: String = encoded
        .trim()
        .chars()
        .filter(|c| *c != '=' && !c.is_whitespace())
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();

    if normalized.is_empty() {
        return None;
    }

    match general_purpose::STANDARD_NO_PAD.decode(normalized) {
        Ok(sample) if sample.len() > MAX_SAMPLE_SIZE => {
            tracing::warn!(size = sample.len(), max = MAX_SAMPLE_SIZE, "Encrypted sample too large, dropping");
            None
        }
        Ok(sample) if sample.is_empty() => None,
        Ok(sample) => Some(sample),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to decode encrypted sample");
            None
        }
    }
}

/// Human readable byte count, e.g. `1.5 MB`
pub fn format_file_size(size: u64) -> String {
    const UNIT: u64 = 1024;
    if size < UNIT {
        return format!("{} B", size);
    }

    let mut div = UNIT;
    let mut exp = 0;
    let mut n = size / UNIT;
    while n >= UNIT && exp < 5 {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }

    let unit = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1} {}B", size as f64 / div as f64, unit)
}
