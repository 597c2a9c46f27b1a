//! Submission and query services over the aggregation store.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::stats::{StatsBundle, StatsSubmission, COUNTRY_DIMENSION, USER_DIMENSION};
use crate::store::{AggregationStore, DimensionStats, StoreError};

/// Query failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("no dimensions requested")]
    EmptyDimensions,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Submission processing and dimension queries over a shared store.
///
/// Callers are expected to have verified the user id before submitting.
pub struct StatsHub<S> {
    store: Arc<S>,
}

impl<S> Clone for StatsHub<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: AggregationStore> StatsHub<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Merges a verified user's submission into the `user` dimension, and into
    /// the `country` dimension when the submission names a country.
    ///
    /// Returns the user's merged stats. The two upserts are independent.
    pub async fn submit(
        &self,
        user_id: i64,
        submission: &StatsSubmission,
    ) -> Result<StatsBundle, StoreError> {
        let entity = user_id.to_string();
        let merged = self
            .store
            .upsert(USER_DIMENSION, &entity, &submission.stats)
            .await?;

        if let Some(country) = submission.country() {
            self.store
                .upsert(COUNTRY_DIMENSION, &country, &submission.stats)
                .await?;
        }

        debug!(user_id, stats = submission.stats.len(), "merged submission");

        Ok(merged)
    }

    /// Current stats for one user, `None` if nothing was ever submitted.
    pub async fn query_user(&self, user_id: i64) -> Result<Option<StatsBundle>, StoreError> {
        self.store.get(USER_DIMENSION, &user_id.to_string()).await
    }

    /// Current entity mapping for each requested dimension.
    ///
    /// Each dimension is read independently. Unknown dimensions map to an
    /// empty set of entities.
    pub async fn query_dims(
        &self,
        dimensions: &[&str],
    ) -> Result<HashMap<String, DimensionStats>, QueryError> {
        if dimensions.is_empty() {
            return Err(QueryError::EmptyDimensions);
        }

        let mut result = HashMap::with_capacity(dimensions.len());
        for dim in dimensions {
            if result.contains_key(*dim) {
                continue;
            }
            let entities = self.store.list_dimension(dim).await?;
            result.insert((*dim).to_string(), entities);
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn hub() -> StatsHub<MemoryStore> {
        StatsHub::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_submit_counters_accumulate() {
        let hub = hub();
        hub.submit(42, &StatsBundle::new().with_counter("clicks", 3).into())
            .await
            .expect("submit");
        hub.submit(42, &StatsBundle::new().with_counter("clicks", 2).into())
            .await
            .expect("submit");

        let stats = hub.query_user(42).await.expect("query").expect("present");
        assert_eq!(stats.counter.get("clicks"), Some(&5));
    }

    #[tokio::test]
    async fn test_submit_gauge_last_write_wins() {
        let hub = hub();
        hub.submit(42, &StatsBundle::new().with_gauge("battery", 80).into())
            .await
            .expect("submit");
        hub.submit(42, &StatsBundle::new().with_gauge("battery", 60).into())
            .await
            .expect("submit");

        let dims = hub.query_dims(&["user"]).await.expect("query");
        assert_eq!(dims["user"]["42"].gauge.get("battery"), Some(&60));
    }

    #[tokio::test]
    async fn test_submit_with_country_aggregates_across_users() {
        let hub = hub();
        for (user_id, code) in [(1, "es"), (2, "ES"), (3, "fr")] {
            let submission = StatsSubmission {
                country_code: Some(code.to_string()),
                stats: StatsBundle::new().with_counter("clicks", 10),
            };
            hub.submit(user_id, &submission).await.expect("submit");
        }

        let dims = hub.query_dims(&["country", "user"]).await.expect("query");
        assert_eq!(dims["country"]["ES"].counter.get("clicks"), Some(&20));
        assert_eq!(dims["country"]["FR"].counter.get("clicks"), Some(&10));
        assert_eq!(dims["user"].len(), 3);
        assert_eq!(dims["user"]["2"].counter.get("clicks"), Some(&10));
    }

    #[tokio::test]
    async fn test_query_user_unknown_is_none() {
        assert_eq!(hub().query_user(7).await.expect("query"), None);
    }

    #[tokio::test]
    async fn test_query_dims_rejects_empty_set() {
        assert_eq!(
            hub().query_dims(&[]).await,
            Err(QueryError::EmptyDimensions)
        );
    }

    #[tokio::test]
    async fn test_query_dims_unknown_dimension_is_empty() {
        let hub = hub();
        hub.submit(1, &StatsBundle::new().with_counter("a", 1).into())
            .await
            .expect("submit");

        let dims = hub.query_dims(&["user", "country"]).await.expect("query");
        assert_eq!(dims.len(), 2);
        assert_eq!(dims["user"].len(), 1);
        assert!(dims["country"].is_empty());
    }

    #[tokio::test]
    async fn test_query_dims_deduplicates_names() {
        let dims = hub().query_dims(&["user", "user"]).await.expect("query");
        assert_eq!(dims.len(), 1);
    }
}
