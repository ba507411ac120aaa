use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Deterministic HAKeeper identity of a pod: the first 16 bytes of
/// `sha256("<pod>.<namespace>.svc")` rendered as a UUID.
///
/// The CN start script derives the same value with `sha256sum`.
pub fn store_uuid(pod_name: &str, namespace: &str) -> String {
    let digest = Sha256::digest(format!("{pod_name}.{namespace}.svc").as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    uuid::Uuid::from_bytes(bytes).to_string()
}

/// Short content hash of config map data, stable over key order
pub fn data_hash(data: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (k, v) in data {
        hasher.update(k.as_bytes());
        hasher.update([0]);
        hasher.update(v.as_bytes());
        hasher.update([0]);
    }
    hex::encode(hasher.finalize())[..10].to_string()
}

/// Label-safe hash of an S3 path
pub fn path_hash(path: &str) -> String {
    hex::encode(Sha256::digest(path.trim_matches('/').as_bytes()))[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_uuid_matches_start_script() {
        // printf 'matrixone-cn-0.default.svc' | sha256sum | cut -c1-32
        assert_eq!(
            store_uuid("matrixone-cn-0", "default"),
            "df029293-40f0-d6fa-90a5-d9a54a8a5981"
        );
    }

    #[test]
    fn data_hash_changes_with_content() {
        let mut data = BTreeMap::new();
        data.insert("config.toml".to_string(), "a = 1".to_string());
        let before = data_hash(&data);
        assert_eq!(before, data_hash(&data.clone()));
        data.insert("config.toml".to_string(), "a = 2".to_string());
        assert_ne!(before, data_hash(&data));
        assert_eq!(before.len(), 10);
    }

    #[test]
    fn path_hash_ignores_slashes() {
        assert_eq!(path_hash("test/bucket"), "7834c0913fbe7612");
        assert_eq!(path_hash("/test/bucket/"), path_hash("test/bucket"));
    }
}
