use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::cache::ResolutionCache;
use crate::error::PipelineError;
use crate::metrics_consts::{CACHE_HITS, CACHE_MISSES};
use crate::storage::ReportStore;
use crate::types::{Fingerprint, ReportRecord};

/// Keeps a report from entering a batch when one with the same fingerprint
/// is stored or already on its way there.
///
/// A record that passes [`DuplicateFilter::is_duplicate`] holds a claim on its
/// fingerprint until its batch either commits ([`DuplicateFilter::remember`],
/// which moves it into the cache) or fails ([`DuplicateFilter::forget`], so the
/// re-queued copy can pass again). The cache is bounded, so a miss still falls
/// back to the store.
pub struct DuplicateFilter {
    store: Arc<dyn ReportStore>,
    cache: ResolutionCache<Fingerprint, ()>,
    in_flight: Mutex<HashSet<Fingerprint>>,
}

impl DuplicateFilter {
    pub fn new(store: Arc<dyn ReportStore>, cache_capacity: usize) -> Self {
        Self {
            store,
            cache: ResolutionCache::new("reports", cache_capacity),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Whether the record is a duplicate. When it is not, its fingerprint is
    /// claimed and every later record with that fingerprint is a duplicate.
    pub async fn is_duplicate(&self, record: &ReportRecord) -> Result<bool, PipelineError> {
        let fingerprint = record.fingerprint();
        if self.cache.get(&fingerprint).await.is_some() {
            metrics::counter!(CACHE_HITS, "cache" => self.cache.name()).increment(1);
            return Ok(true);
        }
        metrics::counter!(CACHE_MISSES, "cache" => self.cache.name()).increment(1);

        if self.in_flight.lock().await.contains(&fingerprint) {
            return Ok(true);
        }

        let stored = match self.store.report_exists(&fingerprint).await {
            Ok(exists) => exists,
            Err(error) if error.is_transient() => {
                return Err(PipelineError::TransientStoreError(error))
            }
            Err(error) => {
                // The write path still dedups, so admit rather than lose the report
                warn!("duplicate lookup failed, admitting record: {}", error);
                false
            }
        };
        if stored {
            return Ok(true);
        }

        // While the store was queried another worker may have claimed it, or
        // the batch holding it may have committed
        let mut in_flight = self.in_flight.lock().await;
        if self.cache.get(&fingerprint).await.is_some() {
            return Ok(true);
        }
        Ok(!in_flight.insert(fingerprint))
    }

    /// Records the fingerprints of a batch that has been committed.
    pub async fn remember(&self, fingerprints: impl IntoIterator<Item = Fingerprint>) {
        let fingerprints: Vec<Fingerprint> = fingerprints.into_iter().collect();
        let mut in_flight = self.in_flight.lock().await;
        self.cache
            .put_all(fingerprints.iter().map(|fingerprint| (*fingerprint, ())))
            .await;
        for fingerprint in &fingerprints {
            in_flight.remove(fingerprint);
        }
    }

    /// Releases the claims of a batch that failed to write.
    pub async fn forget(&self, fingerprints: impl IntoIterator<Item = Fingerprint>) {
        let mut in_flight = self.in_flight.lock().await;
        for fingerprint in fingerprints {
            in_flight.remove(&fingerprint);
        }
    }

    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}
