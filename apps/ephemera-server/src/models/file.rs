//! File record model
//!
//! The persisted description of one upload. Content bytes live under their
//! own store key and never travel inside a [`FileRecord`].

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Expiry
// ============================================================================

/// Retention choice made by the uploader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExpiryPolicy {
    #[default]
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "24h")]
    OneDay,
    #[serde(rename = "72h")]
    ThreeDays,
    #[serde(rename = "view")]
    OnFirstView,
}

impl ExpiryPolicy {
    pub const ALL: [ExpiryPolicy; 5] = [
        ExpiryPolicy::OneHour,
        ExpiryPolicy::SixHours,
        ExpiryPolicy::OneDay,
        ExpiryPolicy::ThreeDays,
        ExpiryPolicy::OnFirstView,
    ];

    /// Wire value, as accepted in the `expiry` form field
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpiryPolicy::OneHour => "1h",
            ExpiryPolicy::SixHours => "6h",
            ExpiryPolicy::OneDay => "24h",
            ExpiryPolicy::ThreeDays => "72h",
            ExpiryPolicy::OnFirstView => "view",
        }
    }

    /// Parse a wire value. Unknown values yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "1h" => Some(ExpiryPolicy::OneHour),
            "6h" => Some(ExpiryPolicy::SixHours),
            "24h" | "1d" => Some(ExpiryPolicy::OneDay),
            "72h" | "3d" => Some(ExpiryPolicy::ThreeDays),
            "view" | "on-first-view" => Some(ExpiryPolicy::OnFirstView),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ExpiryPolicy::OneHour => "1 Hour",
            ExpiryPolicy::SixHours => "6 Hours",
            ExpiryPolicy::OneDay => "24 Hours",
            ExpiryPolicy::ThreeDays => "3 Days",
            ExpiryPolicy::OnFirstView => "On First View",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ExpiryPolicy::OneHour => "File will be deleted after 1 hour",
            ExpiryPolicy::SixHours => "File will be deleted after 6 hours",
            ExpiryPolicy::OneDay => "File will be deleted after 24 hours",
            ExpiryPolicy::ThreeDays => "File will be deleted after 3 days",
            ExpiryPolicy::OnFirstView => "File will be deleted after the first download",
        }
    }

    /// Lifetime for timed policies
    pub fn duration(&self) -> Option<Duration> {
        match self {
            ExpiryPolicy::OneHour => Some(Duration::hours(1)),
            ExpiryPolicy::SixHours => Some(Duration::hours(6)),
            ExpiryPolicy::OneDay => Some(Duration::hours(24)),
            ExpiryPolicy::ThreeDays => Some(Duration::hours(72)),
            ExpiryPolicy::OnFirstView => None,
        }
    }

    /// Concrete expiry for a record created at `created`
    pub fn expiry_from(&self, created: DateTime<Utc>) -> Expiry {
        match self.duration() {
            Some(lifetime) => Expiry::At(created + lifetime),
            None => Expiry::OnFirstView,
        }
    }
}

/// When a record stops being retrievable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    At(DateTime<Utc>),
    OnFirstView,
    /// Only produced for records stored without an expiry time
    Never,
}

impl Expiry {
    /// True when the record is logically dead at `now`
    pub fn is_past(&self, now: DateTime<Utc>) -> bool {
        matches!(self, Expiry::At(at) if *at < now)
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        match self {
            Expiry::At(at) => Some(*at),
            Expiry::OnFirstView | Expiry::Never => None,
        }
    }
}

/// Entry in the expiry choices offered to clients
#[derive(Debug, Clone, Serialize)]
pub struct ExpiryOption {
    pub value: &'static str,
    pub label: &'static str,
    pub description: &'static str,
}

impl From<ExpiryPolicy> for ExpiryOption {
    fn from(policy: ExpiryPolicy) -> Self {
        Self {
            value: policy.as_str(),
            label: policy.label(),
            description: policy.description(),
        }
    }
}

pub fn expiry_options() -> Vec<ExpiryOption> {
    ExpiryPolicy::ALL.into_iter().map(ExpiryOption::from).collect()
}

// ============================================================================
// File Record
// ============================================================================

/// Metadata for one stored upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "StoredRecord", try_from = "StoredRecord")]
pub struct FileRecord {
    pub id: Uuid,
    pub filename: String,
    pub mime_type: String,
    /// Original (uncompressed) content length
    pub size: u64,
    pub upload_time: DateTime<Utc>,
    pub expiry_policy: ExpiryPolicy,
    pub expiry: Expiry,
    pub is_encrypted: bool,
    pub encrypted_sample: Option<Vec<u8>>,
}

impl FileRecord {
    pub fn new(
        id: Uuid,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        size: u64,
        expiry_policy: ExpiryPolicy,
        upload_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            filename: filename.into(),
            mime_type: mime_type.into(),
            size,
            upload_time,
            expiry_policy,
            expiry: expiry_policy.expiry_from(upload_time),
            is_encrypted: false,
            encrypted_sample: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_past(now)
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    pub fn is_video(&self) -> bool {
        self.mime_type.starts_with("video/")
    }

    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }

    /// Media types rendered inline by browsers
    pub fn is_previewable(&self) -> bool {
        !self.is_encrypted && (self.is_image() || self.is_video() || self.is_audio())
    }

    pub fn has_sample(&self) -> bool {
        self.is_encrypted
            && self
                .encrypted_sample
                .as_ref()
                .is_some_and(|sample| !sample.is_empty())
    }
}

/// On-disk JSON shape of a [`FileRecord`]
#[derive(Serialize, Deserialize)]
struct StoredRecord {
    id: Uuid,
    filename: String,
    mime_type: String,
    size: u64,
    upload_time: DateTime<Utc>,
    expiry_policy: ExpiryPolicy,
    #[serde(default)]
    expiry_time: Option<DateTime<Utc>>,
    #[serde(default)]
    is_encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encrypted_sample: Option<String>,
}

impl From<FileRecord> for StoredRecord {
    fn from(record: FileRecord) -> Self {
        Self {
            id: record.id,
            filename: record.filename,
            mime_type: record.mime_type,
            size: record.size,
            upload_time: record.upload_time,
            expiry_policy: record.expiry_policy,
            expiry_time: record.expiry.time(),
            is_encrypted: record.is_encrypted,
            encrypted_sample: record
                .encrypted_sample
                .map(|sample| general_purpose::STANDARD.encode(sample)),
        }
    }
}

impl TryFrom<StoredRecord> for FileRecord {
    type Error = String;

    fn try_from(stored: StoredRecord) -> Result<Self, Self::Error> {
        let expiry = match (stored.expiry_policy, stored.expiry_time) {
            (ExpiryPolicy::OnFirstView, _) => Expiry::OnFirstView,
            (_, Some(at)) => Expiry::At(at),
            (_, None) => Expiry::Never,
        };

        let encrypted_sample = stored
            .encrypted_sample
            .map(|encoded| general_purpose::STANDARD.decode(encoded))
            .transpose()
            .map_err(|e| format!("invalid encrypted sample encoding: {}", e))?;

        Ok(Self {
            id: stored.id,
            filename: stored.filename,
            mime_type: stored.mime_type,
            size: stored.size,
            upload_time: stored.upload_time,
            expiry_policy: stored.expiry_policy,
            expiry,
            is_encrypted: stored.is_encrypted,
            encrypted_sample,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timed_policy_sets_expiry() {
        let now = Utc::now();
        let record = FileRecord::new(
            Uuid::new_v4(),
            "a.txt",
            "text/plain",
            3,
            ExpiryPolicy::SixHours,
            now,
        );
        assert_eq!(record.expiry, Expiry::At(now + Duration::hours(6)));
        assert!(!record.is_expired(now));
        assert!(record.is_expired(now + Duration::hours(7)));
    }

    #[test]
    fn test_on_first_view_never_time_expires() {
        let now = Utc::now();
        let record = FileRecord::new(
            Uuid::new_v4(),
            "a.txt",
            "text/plain",
            3,
            ExpiryPolicy::OnFirstView,
            now,
        );
        assert_eq!(record.expiry, Expiry::OnFirstView);
        assert!(!record.is_expired(now + Duration::days(365)));
    }

    #[test]
    fn test_json_keeps_expiry_and_sample() {
        let mut record = FileRecord::new(
            Uuid::new_v4(),
            "secret.bin",
            "application/octet-stream",
            1024,
            ExpiryPolicy::OneDay,
            Utc::now(),
        );
        record.is_encrypted = true;
        record.encrypted_sample = Some(vec![0, 1, 2, 250]);

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"expiry_policy\":\"24h\""));
        assert!(json.contains("\"expiry_time\""));

        let parsed: FileRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_legacy_record_without_expiry_time() {
        let json = format!(
            r#"{{"id":"{}","filename":"old.txt","mime_type":"text/plain","size":1,
               "upload_time":"2024-01-01T00:00:00Z","expiry_policy":"1h"}}"#,
            Uuid::new_v4()
        );
        let parsed: FileRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.expiry, Expiry::Never);
        assert!(!parsed.is_expired(Utc::now()));
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!(ExpiryPolicy::parse("6h"), Some(ExpiryPolicy::SixHours));
        assert_eq!(ExpiryPolicy::parse(" VIEW "), Some(ExpiryPolicy::OnFirstView));
        assert_eq!(ExpiryPolicy::parse("5m"), None);
        assert_eq!(expiry_options().len(), ExpiryPolicy::ALL.len());
    }
}
