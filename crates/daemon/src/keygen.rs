//! Object key generation with bounded uniqueness retries.

use crate::storage::{ObjectStore, StoreError};
use chrono::Local;
use rand::Rng;
use tracing::{debug, error, info, warn};

/// Length of the random part of a generated key.
pub const RANDOM_NAME_LENGTH: usize = 4;

/// Candidates tried before giving up.
pub const MAX_KEY_ATTEMPTS: u32 = 10;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Random lowercase alphanumeric string.
pub fn random_suffix(length: usize) -> String {
    let mut rng = rand::rng();
    (0..length)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Normalize an extension to lowercase with a leading dot.
fn normalize_extension(extension: &str) -> String {
    let ext = extension.to_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{}", ext)
    }
}

/// Build a candidate key: two-digit year, random suffix, extension.
pub fn candidate_key(extension: &str) -> String {
    format!(
        "{}{}{}",
        Local::now().format("%y"),
        random_suffix(RANDOM_NAME_LENGTH),
        normalize_extension(extension)
    )
}

/// Find a key that does not exist in `bucket` yet.
///
/// Tries up to [`MAX_KEY_ATTEMPTS`] candidates from `generate`, accepting the
/// first one the store reports as absent. A failed existence check aborts at
/// once; running out of attempts yields [`StoreError::NameSaturation`].
pub async fn allocate_unique_key<F>(
    store: &dyn ObjectStore,
    bucket: &str,
    job_id: &str,
    mut generate: F,
) -> Result<String, StoreError>
where
    F: FnMut() -> String,
{
    for attempt in 1..=MAX_KEY_ATTEMPTS {
        let candidate = generate();
        debug!(
            job_id = %job_id,
            "Checking object name (attempt {}/{}): {}",
            attempt, MAX_KEY_ATTEMPTS, candidate
        );

        match store.key_exists(bucket, &candidate).await {
            Ok(false) => {
                info!(job_id = %job_id, "Unique object name found: {}", candidate);
                return Ok(candidate);
            }
            Ok(true) => {
                warn!(job_id = %job_id, "Object name '{}' already exists", candidate);
            }
            Err(e) => {
                error!(job_id = %job_id, "Object name check failed: {}", e);
                return Err(e);
            }
        }
    }

    error!(
        job_id = %job_id,
        bucket = %bucket,
        "Key space saturated: no free object name after {} attempts", MAX_KEY_ATTEMPTS
    );
    Err(StoreError::NameSaturation {
        attempts: MAX_KEY_ATTEMPTS,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::Path;

    /// Store double that reports the first `taken` probes as existing.
    #[derive(Default)]
    pub struct ProbeStore {
        pub taken: usize,
        pub fail_probe: bool,
        pub fail_upload: bool,
        pub probes: Mutex<Vec<String>>,
        pub uploads: Mutex<Vec<(String, String, String)>>,
    }

    impl ProbeStore {
        pub fn with_taken(taken: usize) -> Self {
            Self {
                taken,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ObjectStore for ProbeStore {
        async fn key_exists(&self, _bucket: &str, key: &str) -> Result<bool, StoreError> {
            let mut probes = self.probes.lock();
            probes.push(key.to_string());
            if self.fail_probe {
                return Err(StoreError::Probe {
                    key: key.to_string(),
                    detail: "AccessDenied".to_string(),
                });
            }
            Ok(probes.len() <= self.taken)
        }

        async fn upload(
            &self,
            _local_path: &Path,
            bucket: &str,
            key: &str,
            content_type: &str,
        ) -> Result<(), StoreError> {
            if self.fail_upload {
                return Err(StoreError::Upload("connection reset".to_string()));
            }
            self.uploads.lock().push((
                bucket.to_string(),
                key.to_string(),
                content_type.to_string(),
            ));
            Ok(())
        }
    }
}
