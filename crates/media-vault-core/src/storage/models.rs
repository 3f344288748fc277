use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::access::ExternalHandle;
use crate::error::AccessErrorKind;
use crate::hasher::ContentHash;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.0.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value.as_str().map(|text| Self(text.to_string()))
            }
        }
    };
}

string_id!(
    /// Opaque media identifier, generated at import and never changed.
    MediaId
);

string_id!(
    /// Identifier supplied by the project layer; this crate never interprets it.
    ProjectId
);

/// Where a media item's bytes live. Exactly one per record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StorageBackend {
    HandleBacked { external_handle: ExternalHandle },
    ContentAddressed { hash: ContentHash },
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::HandleBacked { .. } => "handle",
            StorageBackend::ContentAddressed { .. } => "content",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Image,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Image => "image",
        }
    }
}

/// Decoded stream properties. Fields a given kind does not have stay `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaProperties {
    pub duration: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub audio_codec_supported: bool,
    pub bitrate: Option<u64>,
    pub channels: Option<u32>,
    pub sample_rate: Option<u32>,
}

impl Default for MediaProperties {
    fn default() -> Self {
        Self {
            duration: None,
            width: None,
            height: None,
            fps: None,
            video_codec: None,
            audio_codec: None,
            audio_codec_supported: true,
            bitrate: None,
            channels: None,
            sample_rate: None,
        }
    }
}

/// One imported media item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: MediaId,
    pub backend: StorageBackend,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub properties: MediaProperties,
    pub thumbnail_id: Option<String>,
    /// Set when the last access check failed; the record is kept.
    pub broken_reason: Option<AccessErrorKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MediaRecord {
    pub fn kind(&self) -> Option<MediaKind> {
        crate::mime::kind_of(&self.mime_type)
    }

    pub fn is_broken(&self) -> bool {
        self.broken_reason.is_some()
    }

    pub fn content_hash(&self) -> Option<&ContentHash> {
        match &self.backend {
            StorageBackend::ContentAddressed { hash } => Some(hash),
            StorageBackend::HandleBacked { .. } => None,
        }
    }

    pub fn external_handle(&self) -> Option<&ExternalHandle> {
        match &self.backend {
            StorageBackend::HandleBacked { external_handle } => Some(external_handle),
            StorageBackend::ContentAddressed { .. } => None,
        }
    }
}

/// Reference count for one piece of deduplicated content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRecord {
    pub hash: ContentHash,
    pub ref_count: i64,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    pub project_id: ProjectId,
    pub media_id: MediaId,
    pub added_at: DateTime<Utc>,
}

/// Encoded thumbnail image owned by exactly one media record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailRecord {
    pub id: String,
    pub media_id: MediaId,
    pub image: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LibraryStats {
    pub media_count: u64,
    pub handle_backed: u64,
    pub content_addressed: u64,
    pub broken: u64,
    pub project_count: u64,
    pub content_entries: u64,
    pub total_refs: u64,
    /// Bytes physically held in the content store.
    pub stored_bytes: u64,
    /// Bytes the content-addressed records would occupy without deduplication.
    pub logical_bytes: u64,
}

impl LibraryStats {
    pub fn dedup_savings(&self) -> u64 {
        self.logical_bytes.saturating_sub(self.stored_bytes)
    }
}
