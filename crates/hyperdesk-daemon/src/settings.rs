//! Transfer settings, persisted as preferences.

use hyperdesk_store::{Store, StoreError};
use hyperdesk_transfer::limiter::{RetryPolicy, parse_bandwidth};

const KEY_CHUNK_SIZE_MB: &str = "transfer.chunk_size_mb";
const KEY_MAX_BANDWIDTH: &str = "transfer.max_bandwidth";
const KEY_RETRY_POLICY: &str = "transfer.retry_policy";
const KEY_MAX_RETRIES: &str = "transfer.max_retries";
const KEY_ENCRYPTION: &str = "transfer.encryption";

/// User-tunable transfer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSettings {
    /// Chunk size in MiB
    pub chunk_size_mb: u32,
    /// Bandwidth ceiling string (`"unlimited"`, `"4 MB/s"`, ...)
    pub max_bandwidth: String,
    /// Retry policy for failed attempts
    pub retry_policy: RetryPolicy,
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    /// Bulk-payload encryption flag. Advertised but not implemented; saving
    /// `true` is rejected rather than silently accepted.
    pub encryption: bool,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size_mb: 8,
            max_bandwidth: "unlimited".to_string(),
            retry_policy: RetryPolicy::Exponential,
            max_retries: 3,
            encryption: false,
        }
    }
}

impl TransferSettings {
    /// Load settings from preferences, with defaults for missing keys.
    ///
    /// # Errors
    ///
    /// Returns an error when the preference rows cannot be read.
    pub fn load(store: &Store) -> Result<Self, StoreError> {
        let defaults = Self::default();
        Ok(Self {
            chunk_size_mb: store
                .get_preference_int(KEY_CHUNK_SIZE_MB, i64::from(defaults.chunk_size_mb))?
                .clamp(1, 1024) as u32,
            max_bandwidth: store.get_preference(KEY_MAX_BANDWIDTH, &defaults.max_bandwidth)?,
            retry_policy: RetryPolicy::parse(
                &store.get_preference(KEY_RETRY_POLICY, defaults.retry_policy.as_str())?,
            ),
            max_retries: store
                .get_preference_int(KEY_MAX_RETRIES, i64::from(defaults.max_retries))?
                .clamp(0, 100) as u32,
            encryption: store.get_preference_bool(KEY_ENCRYPTION, defaults.encryption)?,
        })
    }

    /// Persist the settings as preferences.
    ///
    /// # Errors
    ///
    /// Returns an error when a preference row cannot be written.
    pub fn save(&self, store: &Store) -> Result<(), StoreError> {
        store.set_preference(KEY_CHUNK_SIZE_MB, &self.chunk_size_mb.to_string())?;
        store.set_preference(KEY_MAX_BANDWIDTH, &self.max_bandwidth)?;
        store.set_preference(KEY_RETRY_POLICY, self.retry_policy.as_str())?;
        store.set_preference(KEY_MAX_RETRIES, &self.max_retries.to_string())?;
        store.set_preference(KEY_ENCRYPTION, if self.encryption { "true" } else { "false" })?;
        Ok(())
    }

    /// Chunk size in bytes.
    #[must_use]
    pub fn chunk_size_bytes(&self) -> usize {
        self.chunk_size_mb as usize * 1024 * 1024
    }

    /// Parsed bandwidth ceiling in bytes/second, `None` for unlimited.
    #[must_use]
    pub fn max_bandwidth_bytes(&self) -> Option<u64> {
        parse_bandwidth(&self.max_bandwidth)
    }

    /// Bandwidth ceiling in MB/s for display, `None` for unlimited.
    #[must_use]
    pub fn limit_mbps(&self) -> Option<f64> {
        self.max_bandwidth_bytes()
            .map(|bytes| bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_stored_preferences() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("hyperdesk.db")).unwrap();
        let settings = TransferSettings::load(&store).unwrap();
        assert_eq!(settings, TransferSettings::default());
        assert_eq!(settings.chunk_size_bytes(), 8 * 1024 * 1024);
        assert_eq!(settings.max_bandwidth_bytes(), None);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("hyperdesk.db")).unwrap();
        let settings = TransferSettings {
            chunk_size_mb: 4,
            max_bandwidth: "4 MB/s".to_string(),
            retry_policy: RetryPolicy::Linear,
            max_retries: 5,
            encryption: false,
        };
        settings.save(&store).unwrap();

        let loaded = TransferSettings::load(&store).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.max_bandwidth_bytes(), Some(4 * 1024 * 1024));
        assert_eq!(loaded.limit_mbps(), Some(4.0));
    }

    #[test]
    fn test_garbage_preferences_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("hyperdesk.db")).unwrap();
        store.set_preference("transfer.chunk_size_mb", "enormous").unwrap();
        store.set_preference("transfer.retry_policy", "psychic").unwrap();

        let settings = TransferSettings::load(&store).unwrap();
        assert_eq!(settings.chunk_size_mb, 8);
        assert_eq!(settings.retry_policy, RetryPolicy::Exponential);
    }
}
