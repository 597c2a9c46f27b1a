//! Live aggregation store.
//!
//! The store owns all mutable aggregate state, keyed by (dimension, entity).
//! Implementations must make [`AggregationStore::upsert`] atomic per entity so
//! concurrent submissions for the same entity never lose updates.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use crate::stats::StatsBundle;

/// Entity name to aggregated stats for a single dimension.
pub type DimensionStats = BTreeMap<String, StatsBundle>;

/// Errors surfaced by an aggregation store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached. Callers may retry later.
    #[error("aggregation store unavailable: {reason}")]
    Unavailable { reason: String },

    /// The store was reached but rejected the operation.
    #[error("aggregation store backend error: {0}")]
    Backend(String),
}

/// Key-value interface over live aggregated stats.
pub trait AggregationStore: Send + Sync {
    /// Merges `update` into the entity, creating it on first write.
    /// Returns the merged bundle as stored.
    fn upsert(
        &self,
        dimension: &str,
        entity: &str,
        update: &StatsBundle,
    ) -> impl std::future::Future<Output = Result<StatsBundle, StoreError>> + Send;

    /// Returns the entity's stats, or `None` if nothing was ever submitted.
    fn get(
        &self,
        dimension: &str,
        entity: &str,
    ) -> impl std::future::Future<Output = Result<Option<StatsBundle>, StoreError>> + Send;

    /// Returns every entity in the dimension. Unknown dimensions are empty.
    fn list_dimension(
        &self,
        dimension: &str,
    ) -> impl std::future::Future<Output = Result<DimensionStats, StoreError>> + Send;
}

/// In-process store backed by sharded concurrent maps.
///
/// Upserts hold the entity's shard lock for the whole read-modify-write, and
/// listing reads each entity under its shard lock, so no reader ever observes
/// a partially merged bundle.
#[derive(Default)]
pub struct MemoryStore {
    dimensions: DashMap<String, Arc<DashMap<String, StatsBundle>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entities currently held for a dimension.
    pub fn entity_count(&self, dimension: &str) -> usize {
        self.dimensions
            .get(dimension)
            .map(|dim| dim.len())
            .unwrap_or(0)
    }

    fn dimension(&self, name: &str) -> Arc<DashMap<String, StatsBundle>> {
        if let Some(dim) = self.dimensions.get(name) {
            return Arc::clone(dim.value());
        }
        let dim = self.dimensions.entry(name.to_string()).or_default();
        Arc::clone(dim.value())
    }
}

impl AggregationStore for MemoryStore {
    async fn upsert(
        &self,
        dimension: &str,
        entity: &str,
        update: &StatsBundle,
    ) -> Result<StatsBundle, StoreError> {
        let dim = self.dimension(dimension);
        let mut stored = dim.entry(entity.to_string()).or_default();
        stored.merge(update);
        Ok(stored.clone())
    }

    async fn get(&self, dimension: &str, entity: &str) -> Result<Option<StatsBundle>, StoreError> {
        let Some(dim) = self.dimensions.get(dimension).map(|d| Arc::clone(d.value())) else {
            return Ok(None);
        };
        let stats = dim.get(entity).map(|stats| stats.clone());
        Ok(stats)
    }

    async fn list_dimension(&self, dimension: &str) -> Result<DimensionStats, StoreError> {
        let Some(dim) = self.dimensions.get(dimension).map(|d| Arc::clone(d.value())) else {
            return Ok(DimensionStats::new());
        };

        let entities = dim
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        Ok(entities)
    }
}
