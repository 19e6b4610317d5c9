use crate::models::{AnalyticsBundle, AnalyticsFilters, RollupLevel};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Analytics snapshot with a SHA-256 checksum over its serialized bundle.
///
/// The checksum is stored next to the bundle text; a row whose checksum no longer
/// matches is treated as absent rather than served.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ValidatedSnapshot {
    /// Bundle serialized as JSON.
    pub data: String,
    /// SHA-256 checksum of `data` (hex encoded).
    pub checksum: String,
}

impl ValidatedSnapshot {
    /// Serializes the bundle and computes its checksum.
    pub fn new(bundle: &AnalyticsBundle) -> Result<Self, serde_json::Error> {
        let data = serde_json::to_string(bundle)?;
        let checksum = compute_checksum(&data);
        Ok(Self { data, checksum })
    }

    /// Returns true if the checksum matches, false if tampered
    pub fn is_valid(&self) -> bool {
        compute_checksum(&self.data) == self.checksum
    }

    /// Validates a stored snapshot and decodes its bundle.
    ///
    /// Returns None if the checksum does not match or the JSON does not decode.
    pub fn validate(data: &str, checksum: &str) -> Option<AnalyticsBundle> {
        if compute_checksum(data) != checksum {
            tracing::warn!(
                "Analytics snapshot failed validation: checksum mismatch. Expected: {}, Data length: {}",
                checksum,
                data.len()
            );
            return None;
        }
        serde_json::from_str(data).ok()
    }
}

/// Computes SHA-256 checksum of the data
pub fn compute_checksum(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// Stable hash of a filter set, used as part of the snapshot key.
pub fn filters_fingerprint(filters: &AnalyticsFilters) -> String {
    let mut normalized = filters.clone();
    normalized.country_codes.sort();
    normalized.country_codes.dedup();
    normalized.site_ids.sort();
    normalized.site_ids.dedup();
    compute_checksum(&serde_json::to_string(&normalized).unwrap_or_default())
}

/// In-process cache key for the latest snapshot of `(level, entity, filters)`.
pub fn snapshot_key(level: RollupLevel, entity_id: Uuid, filters_hash: &str) -> String {
    format!("{}:{}:{}", level, entity_id, filters_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_validation() {
        let snapshot = ValidatedSnapshot::new(&AnalyticsBundle::default()).unwrap();

        assert!(snapshot.is_valid());
        assert_eq!(
            ValidatedSnapshot::validate(&snapshot.data, &snapshot.checksum),
            Some(AnalyticsBundle::default())
        );
    }

    #[test]
    fn test_tampered_snapshot_rejected() {
        let snapshot = ValidatedSnapshot::new(&AnalyticsBundle::default()).unwrap();
        let tampered = snapshot.data.replace("\"overdue_count\":0", "\"overdue_count\":7");

        assert_ne!(tampered, snapshot.data);
        assert_eq!(ValidatedSnapshot::validate(&tampered, &snapshot.checksum), None);
    }

    #[test]
    fn test_checksum_consistency() {
        assert_eq!(compute_checksum("test data"), compute_checksum("test data"));
        assert_eq!(compute_checksum("test data").len(), 64);
    }

    #[test]
    fn test_filters_fingerprint_ignores_order() {
        let a = AnalyticsFilters {
            country_codes: vec!["US".to_string(), "DE".to_string()],
            ..Default::default()
        };
        let b = AnalyticsFilters {
            country_codes: vec!["DE".to_string(), "US".to_string(), "DE".to_string()],
            ..Default::default()
        };
        let c = AnalyticsFilters {
            country_codes: vec!["FR".to_string()],
            ..Default::default()
        };

        assert_eq!(filters_fingerprint(&a), filters_fingerprint(&b));
        assert_ne!(filters_fingerprint(&a), filters_fingerprint(&c));
    }

    #[test]
    fn test_snapshot_key_shape() {
        let key = snapshot_key(RollupLevel::Site, Uuid::nil(), "abc");
        assert_eq!(key, "site:00000000-0000-0000-0000-000000000000:abc");
    }
}
