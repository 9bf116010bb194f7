//! Connected tracker instance model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A configured tracker connection (one organization on one tracker).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TrackerInstance {
    /// Local database ID.
    pub id: i64,

    /// Display name for the connection.
    pub name: String,

    /// Tracker flavour (currently only `yandex`-style APIs).
    pub tracker_type: String,

    /// API base URL (e.g., `https://api.tracker.yandex.net`).
    pub base_url: String,

    /// Organization the token is scoped to, sent as `X-Org-ID`.
    pub org_id: Option<String>,

    /// OAuth token. Never serialized back to API consumers.
    #[serde(skip_serializing, default)]
    pub token: Option<String>,

    /// Inactive trackers are kept for history but not connected.
    pub is_active: bool,

    /// Unix timestamp of creation.
    pub created_at: i64,
}

/// Data required to connect a new tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTracker {
    pub name: String,

    #[serde(default = "default_tracker_type")]
    pub tracker_type: String,

    pub base_url: String,

    pub org_id: Option<String>,

    pub token: String,
}

fn default_tracker_type() -> String {
    "yandex".to_string()
}

impl TrackerInstance {
    /// Normalize the URL by removing trailing slashes.
    pub fn normalize_url(url: &str) -> String {
        url.trim_end_matches('/').to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url() {
        assert_eq!(
            TrackerInstance::normalize_url("https://api.tracker.yandex.net/"),
            "https://api.tracker.yandex.net"
        );
        assert_eq!(
            TrackerInstance::normalize_url("http://localhost:8080///"),
            "http://localhost:8080"
        );
    }

    #[test]
    fn test_token_is_not_serialized() {
        let tracker = TrackerInstance {
            id: 1,
            name: "Main".to_string(),
            tracker_type: "yandex".to_string(),
            base_url: "https://tracker.example".to_string(),
            org_id: Some("org-1".to_string()),
            token: Some("secret".to_string()),
            is_active: true,
            created_at: 0,
        };

        let json = serde_json::to_string(&tracker).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("\"orgId\":\"org-1\""));
    }

    #[test]
    fn test_new_tracker_defaults_type() {
        let new: NewTracker = serde_json::from_str(
            r#"{"name":"Main","baseUrl":"https://tracker.example","token":"t"}"#,
        )
        .unwrap();
        assert_eq!(new.tracker_type, "yandex");
        assert!(new.org_id.is_none());
    }
}
