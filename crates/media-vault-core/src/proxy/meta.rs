use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const META_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    Generating,
    Ready,
}

/// Contents of `proxies/{mediaId}/meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyMeta {
    pub width: u32,
    pub height: u32,
    pub source_width: u32,
    pub source_height: u32,
    pub status: ProxyStatus,
    pub created_at: DateTime<Utc>,
    pub schema_version: u32,
}

impl ProxyMeta {
    pub fn generating(width: u32, height: u32, source_width: u32, source_height: u32) -> Self {
        Self {
            width,
            height,
            source_width,
            source_height,
            status: ProxyStatus::Generating,
            created_at: Utc::now(),
            schema_version: META_SCHEMA_VERSION,
        }
    }

    pub fn into_ready(self, width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            status: ProxyStatus::Ready,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_json_field_names() {
        let meta = ProxyMeta::generating(1280, 720, 3840, 2160).into_ready(1280, 720);
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["sourceWidth"], 3840);
        assert_eq!(json["sourceHeight"], 2160);
        assert_eq!(json["status"], "ready");
        assert_eq!(json["schemaVersion"], 1);
        assert!(json["createdAt"].is_string());
    }
}
