// Client metadata persistence
// The {seed_id}.json cache of dynamic client registrations, one record per
// authorization server

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Result;

/// One cached registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientMetadataRecord {
    pub authorization_server_uri: String,
    pub client_metadata: serde_json::Value,
}

/// The cache file path for a seed id.
pub fn client_metadata_path(dir: &str, seed_id: &str) -> PathBuf {
    Path::new(dir).join(format!("{}.json", seed_id))
}

/// Load all cached registrations, tolerating a missing file.
pub fn load_client_metadata(path: &Path) -> Vec<ClientMetadataRecord> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(records) => records,
            Err(e) => {
                warn!(path = %path.display(), "discarding unreadable client metadata: {}", e);
                Vec::new()
            }
        },
        Err(_) => Vec::new(),
    }
}

/// Find the cached registration for one authorization server.
pub fn find_client_metadata(
    records: &[ClientMetadataRecord],
    authorization_server_uri: &str,
) -> Option<serde_json::Value> {
    records
        .iter()
        .find(|record| record.authorization_server_uri == authorization_server_uri)
        .map(|record| record.client_metadata.clone())
}

/// Insert or replace the registration for one authorization server and
/// rewrite the cache file, restricted to the owner.
pub fn save_client_metadata(
    path: &Path,
    mut records: Vec<ClientMetadataRecord>,
    record: ClientMetadataRecord,
) -> Result<()> {
    records.retain(|existing| existing.authorization_server_uri != record.authorization_server_uri);
    records.push(record);

    let contents = serde_json::to_string_pretty(&records)?;
    std::fs::write(path, contents)?;

    // client secrets live in this file
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    debug!(path = %path.display(), "saved client metadata");
    Ok(())
}

/// Whether a registration has passed its `client_secret_expires_at`.
///
/// A missing or zero value means the registration does not expire.
pub fn is_client_expired(client_metadata: &serde_json::Value) -> bool {
    match client_metadata["client_secret_expires_at"].as_u64() {
        Some(0) | None => false,
        Some(expires_at) => expires_at <= super::state::now_seconds(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = client_metadata_path(dir.path().to_str().unwrap(), "seed-1");

        assert!(load_client_metadata(&path).is_empty());

        let record = ClientMetadataRecord {
            authorization_server_uri: "https://auth.example.com".to_string(),
            client_metadata: json!({ "client_id": "abc", "client_secret": "shh" }),
        };
        save_client_metadata(&path, Vec::new(), record.clone()).unwrap();

        let records = load_client_metadata(&path);
        assert_eq!(records, vec![record]);
        assert_eq!(
            find_client_metadata(&records, "https://auth.example.com").unwrap()["client_id"],
            "abc"
        );
        assert!(find_client_metadata(&records, "https://other.example.com").is_none());
    }

    #[test]
    fn test_replaces_existing_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = client_metadata_path(dir.path().to_str().unwrap(), "seed-1");

        let original = ClientMetadataRecord {
            authorization_server_uri: "https://auth.example.com".to_string(),
            client_metadata: json!({ "client_id": "old" }),
        };
        save_client_metadata(&path, Vec::new(), original).unwrap();

        let replacement = ClientMetadataRecord {
            authorization_server_uri: "https://auth.example.com".to_string(),
            client_metadata: json!({ "client_id": "new" }),
        };
        save_client_metadata(&path, load_client_metadata(&path), replacement).unwrap();

        let records = load_client_metadata(&path);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].client_metadata["client_id"], "new");
    }

    #[cfg(unix)]
    #[test]
    fn test_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = client_metadata_path(dir.path().to_str().unwrap(), "seed-1");
        save_client_metadata(
            &path,
            Vec::new(),
            ClientMetadataRecord {
                authorization_server_uri: "https://auth.example.com".to_string(),
                client_metadata: json!({}),
            },
        )
        .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_client_expiry() {
        assert!(!is_client_expired(&json!({})));
        assert!(!is_client_expired(&json!({ "client_secret_expires_at": 0 })));
        assert!(is_client_expired(&json!({ "client_secret_expires_at": 1 })));
        let future = super::super::state::now_seconds() + 3600;
        assert!(!is_client_expired(&json!({ "client_secret_expires_at": future })));
    }
}
