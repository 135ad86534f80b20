//! Change detection between successive aggregates, and the storage service built on it.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info};
use uuid::Uuid;
use vmsync_core::{AggregateData, CircuitAggregate, PeriodType, PruneCounts, UpsertOutcome};
use vmsync_storage::{AggregateStore, PipelineStore};

use crate::aggregate::rollups_for_period;

/// Relative change below which a numeric field counts as noise.
pub const SIGNIFICANCE_THRESHOLD: f64 = 0.01;

pub const DEFAULT_RETENTION_DAYS: i64 = 365;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub old: JsonValue,
    pub new: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AggregateComparison {
    pub has_changes: bool,
    pub changes: BTreeMap<String, FieldChange>,
    pub delta: BTreeMap<String, f64>,
}

fn numeric_fields(data: &AggregateData) -> [(&'static str, f64); 7] {
    [
        ("total_units", data.total_units as f64),
        ("total_linear_ft", data.total_linear_ft),
        ("total_acres", data.total_acres),
        ("total_trees", data.total_trees),
        ("units_approved", data.units_approved as f64),
        ("units_refused", data.units_refused as f64),
        ("units_pending", data.units_pending as f64),
    ]
}

fn json_fields(data: &AggregateData) -> [(&'static str, JsonValue); 5] {
    [
        ("unit_counts_by_type", to_json(&data.unit_counts_by_type)),
        ("linear_ft_by_type", to_json(&data.linear_ft_by_type)),
        ("acres_by_type", to_json(&data.acres_by_type)),
        ("trees_by_type", to_json(&data.trees_by_type)),
        ("planner_distribution", to_json(&data.planner_distribution)),
    ]
}

fn to_json<T: Serialize>(value: &T) -> JsonValue {
    serde_json::to_value(value).unwrap_or(JsonValue::Null)
}

/// Either side zero and different, or a relative change above one percent.
pub fn is_significant_change(old: f64, new: f64) -> bool {
    if old == new {
        return false;
    }
    if old == 0.0 || new == 0.0 {
        return true;
    }
    (new - old).abs() / old.abs().max(1.0) > SIGNIFICANCE_THRESHOLD
}

/// Recursively sorts object keys so equal maps compare equal regardless of insertion order.
pub fn canonicalize(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let sorted: BTreeMap<&String, JsonValue> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            JsonValue::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), v))
                    .collect(),
            )
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

pub fn compare(new: &AggregateData, existing: Option<&AggregateData>) -> AggregateComparison {
    let mut comparison = AggregateComparison::default();

    let Some(old) = existing else {
        for (name, value) in numeric_fields(new) {
            comparison.changes.insert(
                name.to_string(),
                FieldChange {
                    old: JsonValue::Null,
                    new: to_json(&value),
                },
            );
            comparison.delta.insert(name.to_string(), value);
        }
        for (name, value) in json_fields(new) {
            comparison.changes.insert(
                name.to_string(),
                FieldChange {
                    old: JsonValue::Null,
                    new: value,
                },
            );
        }
        comparison.has_changes = true;
        return comparison;
    };

    for ((name, new_value), (_, old_value)) in numeric_fields(new).into_iter().zip(numeric_fields(old)) {
        if is_significant_change(old_value, new_value) {
            comparison.changes.insert(
                name.to_string(),
                FieldChange {
                    old: to_json(&old_value),
                    new: to_json(&new_value),
                },
            );
            comparison.delta.insert(name.to_string(), new_value - old_value);
        }
    }
    for ((name, new_value), (_, old_value)) in json_fields(new).into_iter().zip(json_fields(old)) {
        if canonicalize(&new_value) != canonicalize(&old_value) {
            comparison.changes.insert(
                name.to_string(),
                FieldChange {
                    old: old_value,
                    new: new_value,
                },
            );
        }
    }
    comparison.has_changes = !comparison.changes.is_empty();
    comparison
}

#[derive(Debug, Clone, Default)]
pub struct BatchSaveReport {
    pub created: i64,
    pub updated: i64,
    pub changed: i64,
    pub comparisons: Vec<(Uuid, AggregateComparison)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollupCounts {
    pub planner: i64,
    pub regional: i64,
}

/// Upserts aggregates, records what changed, derives rollups, and prunes history.
pub struct AggregateStorage {
    store: Arc<dyn PipelineStore>,
}

impl AggregateStorage {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self { store }
    }

    /// Compares each aggregate with the stored row for the same key, then writes
    /// the whole batch in one transaction.
    pub async fn save_batch(&self, batch: &[CircuitAggregate]) -> Result<BatchSaveReport> {
        let mut report = BatchSaveReport::default();
        for aggregate in batch {
            let existing = self
                .store
                .circuit_aggregate(aggregate.circuit_id, aggregate.aggregate_date, aggregate.is_rollup)
                .await?;
            let comparison = compare(&aggregate.data, existing.as_ref().map(|e| &e.data));
            if comparison.has_changes {
                report.changed += 1;
                debug!(
                    circuit_id = %aggregate.circuit_id,
                    fields = ?comparison.changes.keys().collect::<Vec<_>>(),
                    "aggregate changed"
                );
            }
            report.comparisons.push((aggregate.circuit_id, comparison));
        }

        let outcomes = self
            .store
            .store_circuit_aggregates(batch)
            .await
            .context("storing circuit aggregate batch")?;
        for outcome in outcomes {
            match outcome {
                UpsertOutcome::Created => report.created += 1,
                UpsertOutcome::Updated => report.updated += 1,
            }
        }
        Ok(report)
    }

    /// Republishes the latest per-day aggregate in `[start, end]` as the rollup keyed at `end`.
    pub async fn create_rollup(
        &self,
        circuit_id: Uuid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Option<CircuitAggregate>> {
        let Some(latest) = self
            .store
            .latest_circuit_aggregate_in_range(circuit_id, start, end)
            .await?
        else {
            debug!(%circuit_id, %start, %end, "no aggregate in range; rollup skipped");
            return Ok(None);
        };

        let now = Utc::now();
        let rollup = CircuitAggregate {
            aggregate_date: end,
            is_rollup: true,
            created_at: now,
            updated_at: now,
            ..latest
        };
        self.store
            .store_circuit_aggregates(std::slice::from_ref(&rollup))
            .await
            .context("storing circuit rollup")?;
        Ok(Some(rollup))
    }

    /// Rebuilds daily and weekly planner/region rollups for the periods containing `date`.
    /// Planners or regions no longer present in the period lose their rows.
    pub async fn refresh_rollups(&self, date: NaiveDate) -> Result<RollupCounts> {
        let week_end = PeriodType::Weekly.period_date(date);
        let aggregates = self
            .store
            .circuit_aggregates_between(PeriodType::Weekly.period_start(week_end), week_end)
            .await?;

        let mut counts = RollupCounts::default();
        for period_type in [PeriodType::Daily, PeriodType::Weekly] {
            let period_date = period_type.period_date(date);
            let (planners, regions) = rollups_for_period(period_type, period_date, &aggregates);
            self.store
                .replace_period_rollups(period_type, period_date, &planners, &regions)
                .await
                .with_context(|| {
                    format!("storing {} rollups for {period_date}", period_type.as_str())
                })?;
            counts.planner += planners.len() as i64;
            counts.regional += regions.len() as i64;
        }
        Ok(counts)
    }

    /// Deletes aggregates dated strictly before `today - days_to_keep` from all three tables.
    pub async fn prune_old_aggregates(
        &self,
        days_to_keep: i64,
        today: NaiveDate,
    ) -> Result<PruneCounts> {
        let cutoff = today - Duration::days(days_to_keep.max(0));
        let counts = self
            .store
            .prune_aggregates_before(cutoff)
            .await
            .with_context(|| format!("pruning aggregates before {cutoff}"))?;
        info!(
            %cutoff,
            circuit = counts.circuit_aggregates,
            planner = counts.planner_aggregates,
            regional = counts.regional_aggregates,
            "pruned aggregate history"
        );
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmsync_core::{Circuit, PartialCircuit, PlannerAggregate, RegionalAggregate, RollupTotals};
    use vmsync_storage::{AggregateStore, CircuitStore, MemoryStore};

    fn data(total_linear_ft: f64) -> AggregateData {
        AggregateData {
            total_units: 10,
            total_linear_ft,
            units_approved: 4,
            unit_counts_by_type: BTreeMap::from([("SPM".to_string(), 10)]),
            ..Default::default()
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date")
    }

    #[test]
    fn half_percent_change_is_noise() {
        let result = compare(&data(100.5), Some(&data(100.0)));
        assert!(!result.has_changes);
        assert!(result.delta.is_empty());
    }

    #[test]
    fn two_percent_change_is_significant() {
        let result = compare(&data(102.0), Some(&data(100.0)));
        assert!(result.has_changes);
        assert_eq!(result.delta.get("total_linear_ft"), Some(&2.0));
        assert_eq!(result.changes.len(), 1);
    }

    #[test]
    fn zero_crossings_are_always_significant() {
        assert!(is_significant_change(0.0, 0.001));
        assert!(is_significant_change(3.0, 0.0));
        assert!(!is_significant_change(0.0, 0.0));
        // small magnitudes are measured against a floor of one
        assert!(!is_significant_change(0.5, 0.505));
    }

    #[test]
    fn missing_prior_reports_everything() {
        let result = compare(&data(50.0), None);
        assert!(result.has_changes);
        assert_eq!(result.delta.get("total_linear_ft"), Some(&50.0));
        assert_eq!(result.delta.get("total_units"), Some(&10.0));
        assert!(result.changes.contains_key("planner_distribution"));
    }

    #[test]
    fn json_breakdowns_compare_deeply() {
        let mut changed = data(100.0);
        changed.unit_counts_by_type.insert("HCB".into(), 1);
        let result = compare(&changed, Some(&data(100.0)));
        assert!(result.has_changes);
        assert!(result.changes.contains_key("unit_counts_by_type"));

        let a = serde_json::json!({"b": {"y": 1, "x": 2}, "a": [1, 2]});
        let b = serde_json::json!({"a": [1, 2], "b": {"x": 2, "y": 1}});
        assert_eq!(canonicalize(&a), canonicalize(&b));
    }

    async fn seeded_circuit(store: &MemoryStore) -> Circuit {
        store
            .upsert_circuit(
                &PartialCircuit {
                    job_guid: Some("{R}".into()),
                    work_order: Some("2026-0200".into()),
                    region_id: Some(1),
                    ..Default::default()
                },
                Utc::now(),
            )
            .await
            .expect("upsert")
            .expect("circuit")
            .circuit
    }

    #[tokio::test]
    async fn rerunning_a_batch_updates_in_place() {
        let store = Arc::new(MemoryStore::new());
        let circuit = seeded_circuit(&store).await;
        let storage = AggregateStorage::new(store.clone());
        let today = date(2026, 10, 19);

        let first = storage
            .save_batch(&[CircuitAggregate::daily(&circuit, today, data(100.0))])
            .await
            .expect("first");
        assert_eq!((first.created, first.updated, first.changed), (1, 0, 1));

        let second = storage
            .save_batch(&[CircuitAggregate::daily(&circuit, today, data(100.0))])
            .await
            .expect("second");
        assert_eq!((second.created, second.updated, second.changed), (0, 1, 0));
        assert_eq!(store.circuit_aggregate_count().await, 1);
    }

    #[tokio::test]
    async fn rollup_republishes_latest_day_in_range() {
        let store = Arc::new(MemoryStore::new());
        let circuit = seeded_circuit(&store).await;
        let storage = AggregateStorage::new(store.clone());
        storage
            .save_batch(&[
                CircuitAggregate::daily(&circuit, date(2026, 10, 12), data(10.0)),
                CircuitAggregate::daily(&circuit, date(2026, 10, 15), data(40.0)),
                CircuitAggregate::daily(&circuit, date(2026, 10, 20), data(90.0)),
            ])
            .await
            .expect("seed");

        let rollup = storage
            .create_rollup(circuit.id, date(2026, 10, 11), date(2026, 10, 17))
            .await
            .expect("rollup")
            .expect("some rollup");
        assert!(rollup.is_rollup);
        assert_eq!(rollup.aggregate_date, date(2026, 10, 17));
        assert_eq!(rollup.data.total_linear_ft, 40.0);

        let stored = store
            .circuit_aggregate(circuit.id, date(2026, 10, 17), true)
            .await
            .expect("read");
        assert!(stored.is_some());
        // the rollup never enters the per-day timeline
        let daily = store
            .circuit_aggregate(circuit.id, date(2026, 10, 17), false)
            .await
            .expect("read");
        assert!(daily.is_none());

        let empty = storage
            .create_rollup(circuit.id, date(2026, 9, 1), date(2026, 9, 30))
            .await
            .expect("rollup");
        assert!(empty.is_none());
    }

    #[tokio::test]
    async fn pruning_uses_strict_cutoff_across_tables() {
        let store = Arc::new(MemoryStore::new());
        let circuit = seeded_circuit(&store).await;
        let storage = AggregateStorage::new(store.clone());
        let today = date(2026, 10, 19);
        let cutoff = today - Duration::days(365);

        storage
            .save_batch(&[
                CircuitAggregate::daily(&circuit, cutoff - Duration::days(1), data(1.0)),
                CircuitAggregate::daily(&circuit, cutoff, data(2.0)),
                CircuitAggregate::daily(&circuit, today, data(3.0)),
            ])
            .await
            .expect("seed");
        store
            .upsert_planner_aggregates(&[PlannerAggregate {
                planner_id: "alice".into(),
                period_type: PeriodType::Daily,
                period_date: cutoff - Duration::days(30),
                totals: RollupTotals::default(),
                circuit_ids: vec![circuit.id],
            }])
            .await
            .expect("planner");
        store
            .upsert_regional_aggregates(&[RegionalAggregate {
                region_id: 1,
                period_type: PeriodType::Weekly,
                period_date: cutoff,
                totals: RollupTotals::default(),
                planner_count: 0,
                unit_counts_by_type: BTreeMap::new(),
            }])
            .await
            .expect("regional");

        let counts = storage
            .prune_old_aggregates(DEFAULT_RETENTION_DAYS, today)
            .await
            .expect("prune");

        assert_eq!(counts.circuit_aggregates, 1);
        assert_eq!(counts.planner_aggregates, 1);
        assert_eq!(counts.regional_aggregates, 0);
        assert_eq!(store.circuit_aggregate_count().await, 2);
    }

    #[tokio::test]
    async fn refresh_builds_daily_and_weekly_rollups() {
        let store = Arc::new(MemoryStore::new());
        let circuit = seeded_circuit(&store).await;
        let storage = AggregateStorage::new(store.clone());
        let today = date(2026, 10, 19);
        let mut today_data = data(100.0);
        today_data.planner_distribution.insert(
            "alice".into(),
            vmsync_core::PlannerShare {
                units: 10,
                linear_ft: 100.0,
                ..Default::default()
            },
        );
        storage
            .save_batch(&[CircuitAggregate::daily(&circuit, today, today_data)])
            .await
            .expect("seed");

        let counts = storage.refresh_rollups(today).await.expect("refresh");
        assert_eq!(counts, RollupCounts { planner: 2, regional: 2 });

        let weekly = store
            .planner_aggregate("alice", PeriodType::Weekly, date(2026, 10, 24))
            .await
            .expect("read")
            .expect("weekly planner row");
        assert_eq!(weekly.totals.total_units, 10);
        assert_eq!(weekly.totals.units_approved, 4);

        let daily_region = store
            .regional_aggregate(1, PeriodType::Daily, today)
            .await
            .expect("read")
            .expect("daily region row");
        assert_eq!(daily_region.totals.total_linear_ft, 100.0);
    }

    fn with_planner(name: &str, units: i64) -> AggregateData {
        let mut value = data(100.0);
        value.planner_distribution.insert(
            name.into(),
            vmsync_core::PlannerShare {
                units,
                linear_ft: 100.0,
                ..Default::default()
            },
        );
        value
    }

    #[tokio::test]
    async fn refresh_drops_planners_that_left_the_period() {
        let store = Arc::new(MemoryStore::new());
        let circuit = seeded_circuit(&store).await;
        let storage = AggregateStorage::new(store.clone());
        let today = date(2026, 10, 19);
        let yesterday = date(2026, 10, 18);

        storage
            .save_batch(&[CircuitAggregate::daily(&circuit, yesterday, with_planner("alice", 10))])
            .await
            .expect("yesterday");
        storage.refresh_rollups(yesterday).await.expect("refresh yesterday");
        storage
            .save_batch(&[CircuitAggregate::daily(&circuit, today, with_planner("alice", 10))])
            .await
            .expect("alice");
        storage.refresh_rollups(today).await.expect("first refresh");

        storage
            .save_batch(&[CircuitAggregate::daily(&circuit, today, with_planner("bob", 10))])
            .await
            .expect("bob");
        storage.refresh_rollups(today).await.expect("second refresh");

        let gone = store
            .planner_aggregate("alice", PeriodType::Daily, today)
            .await
            .expect("read");
        assert!(gone.is_none());
        let bob = store
            .planner_aggregate("bob", PeriodType::Daily, today)
            .await
            .expect("read")
            .expect("bob row");
        assert_eq!(bob.totals.total_units, 10);

        // other periods keep their rows
        assert!(store
            .planner_aggregate("alice", PeriodType::Daily, yesterday)
            .await
            .expect("read")
            .is_some());
        // the week rolls up the latest day per circuit, which is now bob
        let week = store
            .planner_aggregate("alice", PeriodType::Weekly, date(2026, 10, 24))
            .await
            .expect("read");
        assert!(week.is_none());
    }
}
