use std::sync::Arc;

use tracing::debug;

use crate::cache::ResolutionCache;
use crate::error::{PipelineError, StoreError};
use crate::metrics_consts::{CACHE_HITS, CACHE_MISSES, PLAYERS_CREATED};
use crate::storage::ReportStore;
use crate::types::Player;

/// Canonical form of a display name: lower case, `_` and `-` read as spaces,
/// surrounding whitespace removed.
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase().replace(['_', '-'], " ").trim().to_owned()
}

/// Maps display names to durable player identities, creating players on first sight.
pub struct PlayerResolver {
    store: Arc<dyn ReportStore>,
    cache: ResolutionCache<String, Player>,
}

impl PlayerResolver {
    pub fn new(store: Arc<dyn ReportStore>, cache_capacity: usize) -> Self {
        Self {
            store,
            cache: ResolutionCache::new("players", cache_capacity),
        }
    }

    pub async fn resolve(&self, display_name: &str) -> Result<Player, PipelineError> {
        let name = normalize_name(display_name);
        if name.is_empty() {
            return Err(PipelineError::IdentityResolutionFailure(format!(
                "{display_name:?} is not a player name"
            )));
        }

        if let Some(player) = self.cache.get(&name).await {
            metrics::counter!(CACHE_HITS, "cache" => self.cache.name()).increment(1);
            return Ok(player);
        }
        metrics::counter!(CACHE_MISSES, "cache" => self.cache.name()).increment(1);

        let player = match self.store.find_player(&name).await.map_err(resolution_error)? {
            Some(player) => player,
            None => {
                // Another worker may be creating the same player, the insert is a no-op then
                self.store
                    .insert_player(&name)
                    .await
                    .map_err(resolution_error)?;
                metrics::counter!(PLAYERS_CREATED).increment(1);
                debug!("created player {name:?}");

                self.store
                    .find_player(&name)
                    .await
                    .map_err(resolution_error)?
                    .ok_or_else(|| {
                        PipelineError::IdentityResolutionFailure(format!(
                            "player {name:?} missing after insert"
                        ))
                    })?
            }
        };

        self.cache.put(name, player.clone()).await;
        Ok(player)
    }

    pub async fn cached_players(&self) -> usize {
        self.cache.len().await
    }
}

fn resolution_error(error: StoreError) -> PipelineError {
    if error.is_transient() {
        PipelineError::TransientStoreError(error)
    } else {
        PipelineError::IdentityResolutionFailure(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryStore;

    #[test]
    fn normalization_folds_separators_and_case() {
        assert_eq!(normalize_name("Foo_Bar"), "foo bar");
        assert_eq!(normalize_name("Foo_Bar"), normalize_name("foo-bar "));
        assert_eq!(normalize_name("Foo_Bar"), normalize_name(" FOO BAR"));
        assert_eq!(normalize_name("  _- "), "");
    }

    #[test]
    fn normalization_is_idempotent() {
        for name in ["Cyborger1", "Shpinki", " A_b-C ", "zezima", "__x__"] {
            let once = normalize_name(name);
            assert_eq!(normalize_name(&once), once);
        }
    }

    #[tokio::test]
    async fn creates_then_reuses_identity() {
        let store = Arc::new(MemoryStore::default());
        let resolver = PlayerResolver::new(store.clone(), 10);

        let created = resolver.resolve("Foo_Bar").await.unwrap();
        assert_eq!(created.name, "foo bar");
        assert_eq!(store.player_count(), 1);

        let again = resolver.resolve(" FOO-BAR").await.unwrap();
        assert_eq!(again.id, created.id);
        assert_eq!(store.player_count(), 1);
    }

    #[tokio::test]
    async fn cache_hit_skips_the_store() {
        let store = Arc::new(MemoryStore::default());
        let resolver = PlayerResolver::new(store.clone(), 10);

        resolver.resolve("Shpinki").await.unwrap();
        let lookups = store.player_lookups();

        resolver.resolve("shpinki").await.unwrap();
        assert_eq!(store.player_lookups(), lookups);
        assert_eq!(resolver.cached_players().await, 1);
    }

    #[tokio::test]
    async fn finds_existing_players_without_inserting() {
        let store = Arc::new(MemoryStore::default());
        let existing = store.add_player("zezima");
        let resolver = PlayerResolver::new(store.clone(), 10);

        let player = resolver.resolve("Zezima").await.unwrap();
        assert_eq!(player.id, existing.id);
        assert_eq!(store.player_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_resolution_yields_one_identity() {
        let store = Arc::new(MemoryStore::default());
        let resolver = Arc::new(PlayerResolver::new(store.clone(), 10));

        let mut handles = Vec::new();
        for name in ["New_Player", "new player", "NEW-PLAYER", " new_player "] {
            let resolver = resolver.clone();
            handles.push(tokio::spawn(async move { resolver.resolve(name).await }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.player_count(), 1);
    }

    #[tokio::test]
    async fn empty_names_fail_resolution() {
        let store = Arc::new(MemoryStore::default());
        let resolver = PlayerResolver::new(store.clone(), 10);

        let err = resolver.resolve(" _ ").await.unwrap_err();
        assert!(matches!(err, PipelineError::IdentityResolutionFailure(_)));
        assert_eq!(store.player_count(), 0);
    }

    #[tokio::test]
    async fn transient_failures_are_retryable() {
        let store = Arc::new(MemoryStore::default());
        store.fail_lookups(1);
        let resolver = PlayerResolver::new(store.clone(), 10);

        let err = resolver.resolve("Cyborger1").await.unwrap_err();
        assert!(err.is_retryable());

        // Nothing was cached, the next attempt goes to the store again
        assert!(resolver.resolve("Cyborger1").await.is_ok());
    }
}
