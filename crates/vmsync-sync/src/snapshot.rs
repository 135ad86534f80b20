//! Point-in-time planned-unit snapshots, deduplicated by content hash.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info};
use uuid::Uuid;
use vmsync_adapters::transform_planned_unit;
use vmsync_core::{
    is_qc_status, Circuit, CircuitUpsert, PartialPlannedUnit, PlannedUnitsSnapshot, Record,
    SnapshotDocument, SnapshotMeta, SnapshotSummary, SnapshotTrigger, SnapshotUnit,
};
use vmsync_storage::{sha256_hex, PipelineStore, SnapshotStore};

use crate::aggregate::{belongs_to_circuit, UNKNOWN_UNIT_TYPE};

/// Unit keys that change between captures without the work changing.
pub const VOLATILE_UNIT_FIELDS: &[&str] = &["captured_at", "synced_at"];

pub const QC_DEBOUNCE_HOURS: i64 = 24;

/// Builds the `{meta, summary, units}` document for the circuit's own units.
pub fn normalize_units(circuit: &Circuit, rows: &[Record], captured_at: DateTime<Utc>) -> SnapshotDocument {
    let units: Vec<PartialPlannedUnit> = rows
        .iter()
        .map(transform_planned_unit)
        .filter(|unit| belongs_to_circuit(circuit, unit))
        .collect();

    let mut summary = SnapshotSummary::default();
    for unit in &units {
        summary.total_units += 1;
        summary.total_linear_ft += unit.linear_ft.unwrap_or_default();
        summary.total_acres += unit.acres.unwrap_or_default();
        summary.total_trees += unit.trees.unwrap_or_default();
        *summary
            .by_permission
            .entry(unit.permission().as_str().to_string())
            .or_default() += 1;
        let code = unit.unit_code.as_deref().unwrap_or(UNKNOWN_UNIT_TYPE);
        *summary.by_type.entry(code.to_string()).or_default() += 1;
        if let Some(station) = &unit.station {
            *summary.by_station.entry(station.clone()).or_default() += 1;
        }
    }

    SnapshotDocument {
        meta: SnapshotMeta {
            job_guid: circuit.job_guid.clone(),
            work_order: circuit.work_order.clone(),
            extension: circuit.extension.clone(),
            title: circuit.title.clone(),
            status: circuit.status.clone(),
            percent_complete: circuit.percent_complete,
            region_id: circuit.region_id,
            cycle_type: circuit.cycle_type.clone(),
            contractor: circuit.contractor.clone(),
            captured_at,
        },
        summary,
        units: units.iter().map(snapshot_unit).collect(),
    }
}

/// Compact unit: absent and empty fields are dropped.
fn snapshot_unit(unit: &PartialPlannedUnit) -> SnapshotUnit {
    let mut out = SnapshotUnit::new();
    let text_fields = [
        ("id", &unit.unit_id),
        ("unit", &unit.unit_code),
        ("description", &unit.description),
        ("permission", &unit.permission_status),
        ("planner", &unit.planner),
        ("station", &unit.station),
        ("notes", &unit.notes),
    ];
    for (key, value) in text_fields {
        if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
            out.insert(key.to_string(), JsonValue::String(value.to_string()));
        }
    }
    for (key, value) in [
        ("linear_ft", unit.linear_ft),
        ("acres", unit.acres),
        ("trees", unit.trees),
    ] {
        if let Some(number) = value.and_then(serde_json::Number::from_f64) {
            out.insert(key.to_string(), JsonValue::Number(number));
        }
    }
    if let Some(assessed_at) = unit.assessed_at {
        out.insert(
            "assessed_at".to_string(),
            JsonValue::String(assessed_at.to_rfc3339()),
        );
    }
    out
}

/// SHA-256 over the units sorted by id, with volatile keys removed. Row order does not matter.
pub fn generate_hash(units: &[SnapshotUnit]) -> String {
    let mut keyed: Vec<(String, String)> = units
        .iter()
        .map(|unit| {
            let stable: BTreeMap<&str, &JsonValue> = unit
                .iter()
                .filter(|(key, _)| !VOLATILE_UNIT_FIELDS.contains(&key.as_str()))
                .map(|(key, value)| (key.as_str(), value))
                .collect();
            let id = unit
                .get("id")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string();
            let canonical = serde_json::to_string(&stable).unwrap_or_default();
            (id, canonical)
        })
        .collect();
    keyed.sort();

    let body = keyed
        .into_iter()
        .map(|(_, canonical)| canonical)
        .collect::<Vec<_>>()
        .join(",");
    sha256_hex(format!("[{body}]").as_bytes())
}

pub struct SnapshotEngine {
    store: Arc<dyn PipelineStore>,
    qc_debounce: Duration,
}

impl SnapshotEngine {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self {
            store,
            qc_debounce: Duration::hours(QC_DEBOUNCE_HOURS),
        }
    }

    /// Persists a snapshot unless it would be redundant. Manual triggers always persist.
    ///
    /// Only scheduled snapshots are deduplicated by content hash. Milestone and QC
    /// triggers are already limited by their own once-per-circuit and debounce
    /// checks, and the crossing they record cannot be observed again later.
    pub async fn create_snapshot(
        &self,
        circuit: &Circuit,
        rows: &[Record],
        trigger: SnapshotTrigger,
    ) -> Result<Option<PlannedUnitsSnapshot>> {
        let manual = trigger == SnapshotTrigger::Manual;
        if !manual && circuit.percent_complete <= 0.0 {
            debug!(circuit = %circuit.display_key(), "no progress yet; snapshot skipped");
            return Ok(None);
        }

        let document = normalize_units(circuit, rows, Utc::now());
        if !manual && document.units.is_empty() {
            debug!(circuit = %circuit.display_key(), "no planned units; snapshot skipped");
            return Ok(None);
        }

        let content_hash = generate_hash(&document.units);
        if trigger == SnapshotTrigger::Scheduled {
            let latest = self
                .store
                .latest_snapshot(circuit.id)
                .await
                .context("loading latest snapshot")?;
            if latest.is_some_and(|s| s.content_hash == content_hash) {
                debug!(circuit = %circuit.display_key(), "units unchanged; snapshot skipped");
                return Ok(None);
            }
        }

        let snapshot = PlannedUnitsSnapshot {
            id: Uuid::new_v4(),
            circuit_id: circuit.id,
            created_at: document.meta.captured_at,
            trigger,
            percent_complete: circuit.percent_complete,
            status: circuit.status.clone(),
            content_hash,
            unit_count: document.units.len() as i64,
            document,
        };
        self.store
            .insert_snapshot(&snapshot)
            .await
            .context("inserting planned units snapshot")?;
        info!(
            circuit = %circuit.display_key(),
            trigger = trigger.as_str(),
            units = snapshot.unit_count,
            "planned units snapshot created"
        );
        Ok(Some(snapshot))
    }

    /// True when this sync crossed the milestone and the circuit has never had one of that kind.
    /// An unknown previous percentage means the crossing was not observed.
    pub async fn should_create_milestone_snapshot(
        &self,
        circuit_id: Uuid,
        previous_percent: Option<f64>,
        current_percent: f64,
        milestone: SnapshotTrigger,
    ) -> Result<bool> {
        let Some(threshold) = milestone.milestone_threshold() else {
            return Ok(false);
        };
        let Some(previous) = previous_percent else {
            return Ok(false);
        };
        if !(previous < threshold && threshold <= current_percent) {
            return Ok(false);
        }
        let existing = self
            .store
            .latest_snapshot_with_trigger(circuit_id, milestone)
            .await?;
        Ok(existing.is_none())
    }

    pub async fn should_create_milestone50_snapshot(
        &self,
        circuit_id: Uuid,
        previous_percent: Option<f64>,
        current_percent: f64,
    ) -> Result<bool> {
        self.should_create_milestone_snapshot(
            circuit_id,
            previous_percent,
            current_percent,
            SnapshotTrigger::Milestone50,
        )
        .await
    }

    pub async fn should_create_milestone100_snapshot(
        &self,
        circuit_id: Uuid,
        previous_percent: Option<f64>,
        current_percent: f64,
    ) -> Result<bool> {
        self.should_create_milestone_snapshot(
            circuit_id,
            previous_percent,
            current_percent,
            SnapshotTrigger::Milestone100,
        )
        .await
    }

    /// Fires on a transition into QC, at most once per debounce window.
    pub async fn should_create_qc_snapshot(
        &self,
        circuit_id: Uuid,
        previous_status: Option<&str>,
        current_status: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if previous_status.is_none() || is_qc_status(previous_status) || !is_qc_status(current_status) {
            return Ok(false);
        }
        let recent = self
            .store
            .latest_snapshot_with_trigger(circuit_id, SnapshotTrigger::StatusQc)
            .await?;
        Ok(!recent.is_some_and(|s| now - s.created_at < self.qc_debounce))
    }

    /// QC transition, then 100%, then 50%, falling back to scheduled.
    pub async fn determine_trigger(
        &self,
        upsert: &CircuitUpsert,
        now: DateTime<Utc>,
    ) -> Result<SnapshotTrigger> {
        let circuit = &upsert.circuit;
        if self
            .should_create_qc_snapshot(
                circuit.id,
                upsert.previous_status.as_deref(),
                circuit.status.as_deref(),
                now,
            )
            .await?
        {
            return Ok(SnapshotTrigger::StatusQc);
        }
        if self
            .should_create_milestone100_snapshot(
                circuit.id,
                upsert.previous_percent_complete,
                circuit.percent_complete,
            )
            .await?
        {
            return Ok(SnapshotTrigger::Milestone100);
        }
        if self
            .should_create_milestone50_snapshot(
                circuit.id,
                upsert.previous_percent_complete,
                circuit.percent_complete,
            )
            .await?
        {
            return Ok(SnapshotTrigger::Milestone50);
        }
        Ok(SnapshotTrigger::Scheduled)
    }

    pub async fn history(&self, circuit_id: Uuid) -> Result<Vec<PlannedUnitsSnapshot>> {
        self.store.snapshots_for_circuit(circuit_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use vmsync_core::PartialCircuit;
    use vmsync_storage::{CircuitStore, MemoryStore};

    fn record(value: JsonValue) -> Record {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn unit_rows(count: usize) -> Vec<Record> {
        (0..count)
            .map(|i| {
                let permission = if i % 2 == 0 { "Approved" } else { "" };
                record(json!({
                    "UNITGUID": format!("{{U{i}}}"),
                    "UNIT": "SPM",
                    "PERMSTAT": permission,
                    "STATNAME": format!("{}", i * 10),
                    "LENGTHWRK": 100 + i,
                    "PARCELCOMMENTS": ""
                }))
            })
            .collect()
    }

    async fn sync_circuit(store: &MemoryStore, percent: f64, status: &str) -> CircuitUpsert {
        store
            .upsert_circuit(
                &PartialCircuit {
                    job_guid: Some("{JOB-S}".into()),
                    work_order: Some("2026-0300".into()),
                    percent_complete: Some(percent),
                    status: Some(status.into()),
                    ..Default::default()
                },
                Utc::now(),
            )
            .await
            .expect("upsert")
            .expect("circuit")
    }

    fn sample_unit(id: &str, code: &str, linear_ft: u32) -> SnapshotUnit {
        SnapshotUnit::from([
            ("id".to_string(), json!(id)),
            ("unit".to_string(), json!(code)),
            ("linear_ft".to_string(), json!(linear_ft)),
        ])
    }

    proptest! {
        #[test]
        fn hash_ignores_unit_order(
            (units, shuffled) in proptest::collection::vec(("[a-z]{1,6}", "[A-Z]{2,4}", 0u32..500), 1..12)
                .prop_flat_map(|units| (Just(units.clone()), Just(units).prop_shuffle()))
        ) {
            let build = |rows: &[(String, String, u32)]| -> Vec<SnapshotUnit> {
                rows.iter().map(|(id, code, lf)| sample_unit(id, code, *lf)).collect()
            };
            prop_assert_eq!(generate_hash(&build(&units)), generate_hash(&build(&shuffled)));
        }
    }

    #[test]
    fn hash_ignores_volatile_fields() {
        let plain = vec![sample_unit("a", "SPM", 10)];
        let mut stamped = plain.clone();
        stamped[0].insert("captured_at".into(), json!("2026-10-19T06:00:00Z"));
        assert_eq!(generate_hash(&plain), generate_hash(&stamped));

        let changed = vec![sample_unit("a", "SPM", 11)];
        assert_ne!(generate_hash(&plain), generate_hash(&changed));
    }

    #[tokio::test]
    async fn normalized_document_is_compact_and_summarized() {
        let store = MemoryStore::new();
        let upsert = sync_circuit(&store, 20.0, "ACTIV").await;
        let document = normalize_units(&upsert.circuit, &unit_rows(3), Utc::now());

        assert_eq!(document.meta.job_guid, "{JOB-S}");
        assert_eq!(document.units.len(), 3);
        assert!(!document.units[0].contains_key("notes"));
        assert!(!document.units[1].contains_key("permission"));
        assert_eq!(document.summary.total_units, 3);
        assert_eq!(document.summary.total_linear_ft, 303.0);
        assert_eq!(document.summary.by_permission.get("approved"), Some(&2));
        assert_eq!(document.summary.by_permission.get("pending"), Some(&1));
        assert_eq!(document.summary.by_type.get("SPM"), Some(&3));
        assert_eq!(document.summary.by_station.len(), 3);
    }

    #[tokio::test]
    async fn unchanged_units_are_not_persisted_twice() {
        let store = Arc::new(MemoryStore::new());
        let engine = SnapshotEngine::new(store.clone());
        let upsert = sync_circuit(&store, 20.0, "ACTIV").await;

        let first = engine
            .create_snapshot(&upsert.circuit, &unit_rows(2), SnapshotTrigger::Scheduled)
            .await
            .expect("first");
        assert!(first.is_some());

        let mut reordered = unit_rows(2);
        reordered.reverse();
        let second = engine
            .create_snapshot(&upsert.circuit, &reordered, SnapshotTrigger::Scheduled)
            .await
            .expect("second");
        assert!(second.is_none());

        let manual = engine
            .create_snapshot(&upsert.circuit, &reordered, SnapshotTrigger::Manual)
            .await
            .expect("manual");
        assert!(manual.is_some());
        assert_eq!(engine.history(upsert.circuit.id).await.expect("history").len(), 2);
    }

    #[tokio::test]
    async fn zero_progress_and_empty_units_skip_unless_manual() {
        let store = Arc::new(MemoryStore::new());
        let engine = SnapshotEngine::new(store.clone());
        let idle = sync_circuit(&store, 0.0, "ACTIV").await;

        let skipped = engine
            .create_snapshot(&idle.circuit, &unit_rows(2), SnapshotTrigger::Scheduled)
            .await
            .expect("scheduled");
        assert!(skipped.is_none());

        let manual = engine
            .create_snapshot(&idle.circuit, &[], SnapshotTrigger::Manual)
            .await
            .expect("manual")
            .expect("manual snapshot");
        assert_eq!(manual.unit_count, 0);

        let active = sync_circuit(&store, 30.0, "ACTIV").await;
        let empty = engine
            .create_snapshot(&active.circuit, &[], SnapshotTrigger::Scheduled)
            .await
            .expect("empty");
        assert!(empty.is_none());
    }

    #[tokio::test]
    async fn fifty_percent_milestone_fires_once() {
        let store = Arc::new(MemoryStore::new());
        let engine = SnapshotEngine::new(store.clone());
        let now = Utc::now();

        let first = sync_circuit(&store, 49.0, "ACTIV").await;
        assert_eq!(
            engine.determine_trigger(&first, now).await.expect("trigger"),
            SnapshotTrigger::Scheduled
        );
        engine
            .create_snapshot(&first.circuit, &unit_rows(4), SnapshotTrigger::Scheduled)
            .await
            .expect("baseline");

        let crossed = sync_circuit(&store, 51.0, "ACTIV").await;
        let trigger = engine.determine_trigger(&crossed, now).await.expect("trigger");
        assert_eq!(trigger, SnapshotTrigger::Milestone50);
        let created = engine
            .create_snapshot(&crossed.circuit, &unit_rows(5), trigger)
            .await
            .expect("milestone");
        assert!(created.is_some());

        let later = sync_circuit(&store, 55.0, "ACTIV").await;
        let trigger = engine.determine_trigger(&later, now).await.expect("trigger");
        assert_eq!(trigger, SnapshotTrigger::Scheduled);
        engine
            .create_snapshot(&later.circuit, &unit_rows(6), trigger)
            .await
            .expect("scheduled");

        let milestones = engine
            .history(crossed.circuit.id)
            .await
            .expect("history")
            .into_iter()
            .filter(|s| s.trigger == SnapshotTrigger::Milestone50)
            .count();
        assert_eq!(milestones, 1);
    }

    #[tokio::test]
    async fn qc_transition_outranks_milestones_and_is_debounced() {
        let store = Arc::new(MemoryStore::new());
        let engine = SnapshotEngine::new(store.clone());
        let now = Utc::now();

        sync_circuit(&store, 40.0, "ACTIV").await;
        let to_qc = sync_circuit(&store, 100.0, "QC").await;
        let trigger = engine.determine_trigger(&to_qc, now).await.expect("trigger");
        assert_eq!(trigger, SnapshotTrigger::StatusQc);
        engine
            .create_snapshot(&to_qc.circuit, &unit_rows(3), trigger)
            .await
            .expect("qc snapshot")
            .expect("persisted");

        // sustained QC is not a transition
        let still_qc = sync_circuit(&store, 100.0, "QC").await;
        assert!(!engine
            .should_create_qc_snapshot(still_qc.circuit.id, Some("QC"), Some("QC"), now)
            .await
            .expect("qc"));

        // flapping back into QC inside the window is ignored
        let id = still_qc.circuit.id;
        assert!(!engine
            .should_create_qc_snapshot(id, Some("REWRK"), Some("QC"), now + Duration::hours(2))
            .await
            .expect("qc"));
        assert!(engine
            .should_create_qc_snapshot(id, Some("REWRK"), Some("QC"), now + Duration::hours(25))
            .await
            .expect("qc"));
    }

    #[tokio::test]
    async fn milestone_persists_even_when_units_are_unchanged() {
        let store = Arc::new(MemoryStore::new());
        let engine = SnapshotEngine::new(store.clone());
        let now = Utc::now();

        let before = sync_circuit(&store, 49.0, "ACTIV").await;
        engine
            .create_snapshot(&before.circuit, &unit_rows(4), SnapshotTrigger::Scheduled)
            .await
            .expect("baseline")
            .expect("persisted");

        let crossed = sync_circuit(&store, 51.0, "ACTIV").await;
        let trigger = engine.determine_trigger(&crossed, now).await.expect("trigger");
        assert_eq!(trigger, SnapshotTrigger::Milestone50);
        let milestone = engine
            .create_snapshot(&crossed.circuit, &unit_rows(4), trigger)
            .await
            .expect("milestone")
            .expect("milestone persisted despite identical units");
        assert_eq!(milestone.trigger, SnapshotTrigger::Milestone50);

        // once recorded, the same units on a scheduled run are still deduplicated
        let again = sync_circuit(&store, 52.0, "ACTIV").await;
        assert_eq!(
            engine.determine_trigger(&again, now).await.expect("trigger"),
            SnapshotTrigger::Scheduled
        );
        assert!(engine
            .create_snapshot(&again.circuit, &unit_rows(4), SnapshotTrigger::Scheduled)
            .await
            .expect("scheduled")
            .is_none());
        assert_eq!(engine.history(crossed.circuit.id).await.expect("history").len(), 2);
    }
}
