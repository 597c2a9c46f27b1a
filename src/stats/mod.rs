use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

/// Dimension that submissions are aggregated into, keyed by anonymized user id.
pub const USER_DIMENSION: &str = "user";

/// Dimension keyed by the submitting client's country code.
pub const COUNTRY_DIMENSION: &str = "country";

/// Stat name to value mapping. Ordered so rows and payloads are deterministic.
pub type StatMap = BTreeMap<String, i64>;

/// A bundle of stats for one entity.
///
/// - `counter` values accumulate across submissions.
/// - `gauge` values are replaced by the latest submission.
/// - `presence` values are replaced by the latest submission (e.g. 1 = online).
///
/// Missing or `null` mappings decode as empty, so a bundle never carries an
/// absent mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsBundle {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub counter: StatMap,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub gauge: StatMap,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub presence: StatMap,
}

impl StatsBundle {
    /// Creates a bundle with all three mappings empty.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a counter value, saturating at the i64 bounds.
    pub fn with_counter(mut self, name: &str, value: i64) -> Self {
        add_counter(&mut self.counter, name, value);
        self
    }

    /// Sets a gauge value.
    pub fn with_gauge(mut self, name: &str, value: i64) -> Self {
        self.gauge.insert(name.to_string(), value);
        self
    }

    /// Sets a presence value.
    pub fn with_presence(mut self, name: &str, value: i64) -> Self {
        self.presence.insert(name.to_string(), value);
        self
    }

    /// Total number of stats across all three mappings.
    pub fn len(&self) -> usize {
        self.counter.len() + self.gauge.len() + self.presence.len()
    }

    /// Whether the bundle holds no stats at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merges an update into this bundle.
    ///
    /// Counters are added (saturating), gauges and presence are overwritten.
    /// Stats absent from `update` are left untouched.
    pub fn merge(&mut self, update: &StatsBundle) {
        for (name, value) in &update.counter {
            add_counter(&mut self.counter, name, *value);
        }

        for (name, value) in &update.gauge {
            self.gauge.insert(name.clone(), *value);
        }

        for (name, value) in &update.presence {
            self.presence.insert(name.clone(), *value);
        }
    }
}

/// Request body of a stats submission: the bundle plus optional routing hints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StatsSubmission {
    /// ISO country code of the client. Also aggregates the bundle into the
    /// `country` dimension when present.
    #[serde(default, rename = "countryCode")]
    pub country_code: Option<String>,

    #[serde(flatten)]
    pub stats: StatsBundle,
}

impl StatsSubmission {
    /// Normalized country code, `None` when absent or blank.
    pub fn country(&self) -> Option<String> {
        let code = self.country_code.as_deref()?.trim();
        (!code.is_empty()).then(|| code.to_ascii_uppercase())
    }
}

impl From<StatsBundle> for StatsSubmission {
    fn from(stats: StatsBundle) -> Self {
        Self {
            country_code: None,
            stats,
        }
    }
}

fn add_counter(counter: &mut StatMap, name: &str, value: i64) {
    let slot = counter.entry(name.to_string()).or_insert(0);
    match slot.checked_add(value) {
        Some(sum) => *slot = sum,
        None => {
            debug!(stat = name, "counter saturated");
            *slot = slot.saturating_add(value);
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<StatMap, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<StatMap>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_merge_adds() {
        let mut stored = StatsBundle::new().with_counter("clicks", 3);
        stored.merge(&StatsBundle::new().with_counter("clicks", 2));
        assert_eq!(stored.counter.get("clicks"), Some(&5));
    }

    #[test]
    fn test_counter_merge_defaults_missing_to_zero() {
        let mut stored = StatsBundle::new();
        stored.merge(&StatsBundle::new().with_counter("views", 7));
        assert_eq!(stored.counter.get("views"), Some(&7));
    }

    #[test]
    fn test_counter_merge_order_independent() {
        let updates = [
            StatsBundle::new().with_counter("a", 1).with_counter("b", 10),
            StatsBundle::new().with_counter("a", -4),
            StatsBundle::new().with_counter("b", 5).with_counter("c", 2),
        ];

        let mut forward = StatsBundle::new();
        for u in &updates {
            forward.merge(u);
        }

        let mut reverse = StatsBundle::new();
        for u in updates.iter().rev() {
            reverse.merge(u);
        }

        assert_eq!(forward, reverse);
        assert_eq!(forward.counter.get("a"), Some(&-3));
        assert_eq!(forward.counter.get("b"), Some(&15));
        assert_eq!(forward.counter.get("c"), Some(&2));
    }

    #[test]
    fn test_counter_merge_saturates() {
        let mut stored = StatsBundle::new().with_counter("bytes", i64::MAX - 1);
        stored.merge(&StatsBundle::new().with_counter("bytes", 10));
        assert_eq!(stored.counter.get("bytes"), Some(&i64::MAX));

        let mut negative = StatsBundle::new().with_counter("delta", i64::MIN + 1);
        negative.merge(&StatsBundle::new().with_counter("delta", -10));
        assert_eq!(negative.counter.get("delta"), Some(&i64::MIN));
    }

    #[test]
    fn test_gauge_merge_last_write_wins() {
        let mut stored = StatsBundle::new().with_gauge("battery", 80);
        stored.merge(&StatsBundle::new().with_gauge("battery", 60));
        assert_eq!(stored.gauge.get("battery"), Some(&60));
    }

    #[test]
    fn test_presence_merge_last_write_wins() {
        let mut stored = StatsBundle::new().with_presence("online", 1);
        stored.merge(&StatsBundle::new().with_presence("online", 0));
        assert_eq!(stored.presence.get("online"), Some(&0));
    }

    #[test]
    fn test_merge_leaves_other_stats_untouched() {
        let mut stored = StatsBundle::new()
            .with_gauge("battery", 80)
            .with_gauge("signal", 3)
            .with_presence("online", 1);
        stored.merge(&StatsBundle::new().with_gauge("signal", 4));

        assert_eq!(stored.gauge.get("battery"), Some(&80));
        assert_eq!(stored.gauge.get("signal"), Some(&4));
        assert_eq!(stored.presence.get("online"), Some(&1));
    }

    #[test]
    fn test_deserialize_full_bundle() {
        let raw = r#"{"counter": {"mystat": 1, "myotherstat": 50}, "gauge": {"mygauge": 78}, "presence": {"online": 1}}"#;
        let bundle: StatsBundle = serde_json::from_str(raw).expect("decode");
        assert_eq!(bundle.counter.get("myotherstat"), Some(&50));
        assert_eq!(bundle.gauge.get("mygauge"), Some(&78));
        assert_eq!(bundle.presence.get("online"), Some(&1));
        assert_eq!(bundle.len(), 4);
    }

    #[test]
    fn test_deserialize_missing_and_null_mappings_are_empty() {
        let bundle: StatsBundle =
            serde_json::from_str(r#"{"counter": {"clicks": 3}, "gauge": null}"#).expect("decode");
        assert_eq!(bundle.counter.len(), 1);
        assert!(bundle.gauge.is_empty());
        assert!(bundle.presence.is_empty());
    }

    #[test]
    fn test_deserialize_rejects_non_integer_values() {
        let result = serde_json::from_str::<StatsBundle>(r#"{"counter": {"clicks": "three"}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_deserialize_submission_with_country() {
        let raw = r#"{"countryCode": "es", "counter": {"mystat": 1}, "gauge": {"mygauge": 78}}"#;
        let submission: StatsSubmission = serde_json::from_str(raw).expect("decode");
        assert_eq!(submission.country(), Some("ES".to_string()));
        assert_eq!(submission.stats.counter.get("mystat"), Some(&1));
        assert_eq!(submission.stats.gauge.get("mygauge"), Some(&78));
        assert!(submission.stats.presence.is_empty());
    }

    #[test]
    fn test_deserialize_submission_without_country() {
        let submission: StatsSubmission =
            serde_json::from_str(r#"{"presence": {"online": 1}}"#).expect("decode");
        assert_eq!(submission.country(), None);
        assert_eq!(submission.stats, StatsBundle::new().with_presence("online", 1));

        let blank: StatsSubmission =
            serde_json::from_str(r#"{"countryCode": "  "}"#).expect("decode");
        assert_eq!(blank.country(), None);
    }

    #[test]
    fn test_deserialize_submission_rejects_bad_values() {
        assert!(serde_json::from_str::<StatsSubmission>(r#"{"gauge": {"g": 1.5}}"#).is_err());
        assert!(serde_json::from_str::<StatsSubmission>("not json").is_err());
    }

    #[test]
    fn test_serialize_always_emits_all_mappings() {
        let json = serde_json::to_string(&StatsBundle::new()).expect("encode");
        assert_eq!(json, r#"{"counter":{},"gauge":{},"presence":{}}"#);
    }
}
