//! In-memory implementation of the persistence traits for tests and dry runs.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;
use vmsync_core::{
    Circuit, CircuitAggregate, CircuitUpsert, PartialCircuit, PeriodType, PlannedUnitsSnapshot,
    PlannerAggregate, PruneCounts, Region, RegionalAggregate, SnapshotTrigger, SyncLog,
    UpsertOutcome,
};

use crate::store::{AggregateStore, CircuitStore, SnapshotStore, SyncLogStore};

#[derive(Debug, Default)]
struct MemoryState {
    regions: Vec<Region>,
    circuits: Vec<Circuit>,
    circuit_aggregates: Vec<CircuitAggregate>,
    planner_aggregates: Vec<PlannerAggregate>,
    regional_aggregates: Vec<RegionalAggregate>,
    snapshots: Vec<PlannedUnitsSnapshot>,
    sync_logs: Vec<SyncLog>,
}

/// Stores everything in `Vec`s behind one async `RwLock`, so a batch write is atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_regions(regions: Vec<Region>) -> Self {
        Self {
            state: RwLock::new(MemoryState {
                regions,
                ..MemoryState::default()
            }),
        }
    }

    pub async fn add_region(&self, region: Region) {
        self.state.write().await.regions.push(region);
    }

    /// Administrative soft-exclude, as done from the admin screens.
    pub async fn exclude_circuit(&self, job_guid: &str, reason: &str, actor: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let Some(circuit) = state.circuits.iter_mut().find(|c| c.job_guid == job_guid) else {
            bail!("no circuit with job guid {job_guid}");
        };
        circuit.is_excluded = true;
        circuit.exclusion_reason = Some(reason.to_string());
        circuit.excluded_by = Some(actor.to_string());
        circuit.excluded_at = Some(Utc::now());
        Ok(())
    }

    pub async fn circuit_aggregate_count(&self) -> usize {
        self.state.read().await.circuit_aggregates.len()
    }
}

#[async_trait]
impl CircuitStore for MemoryStore {
    async fn upsert_circuit(
        &self,
        partial: &PartialCircuit,
        synced_at: DateTime<Utc>,
    ) -> Result<Option<CircuitUpsert>> {
        let Some(job_guid) = partial.job_guid.as_deref() else {
            return Ok(None);
        };
        let mut state = self.state.write().await;

        if let Some(existing) = state.circuits.iter_mut().find(|c| c.job_guid == job_guid) {
            let previous_percent_complete = Some(existing.percent_complete);
            let previous_status = existing.status.clone();
            existing.apply_partial(partial, synced_at);
            return Ok(Some(CircuitUpsert {
                circuit: existing.clone(),
                created: false,
                previous_percent_complete,
                previous_status,
            }));
        }

        let Some(circuit) = Circuit::from_partial(partial, synced_at) else {
            return Ok(None);
        };
        state.circuits.push(circuit.clone());
        Ok(Some(CircuitUpsert {
            circuit,
            created: true,
            previous_percent_complete: None,
            previous_status: None,
        }))
    }

    async fn circuit_by_job_guid(&self, job_guid: &str) -> Result<Option<Circuit>> {
        let state = self.state.read().await;
        Ok(state.circuits.iter().find(|c| c.job_guid == job_guid).cloned())
    }

    async fn active_circuits(&self) -> Result<Vec<Circuit>> {
        let state = self.state.read().await;
        Ok(state
            .circuits
            .iter()
            .filter(|c| !c.is_excluded)
            .cloned()
            .collect())
    }

    async fn regions(&self) -> Result<Vec<Region>> {
        Ok(self.state.read().await.regions.clone())
    }
}

#[async_trait]
impl AggregateStore for MemoryStore {
    async fn circuit_aggregate(
        &self,
        circuit_id: Uuid,
        aggregate_date: NaiveDate,
        is_rollup: bool,
    ) -> Result<Option<CircuitAggregate>> {
        let state = self.state.read().await;
        Ok(state
            .circuit_aggregates
            .iter()
            .find(|a| {
                a.circuit_id == circuit_id
                    && a.aggregate_date == aggregate_date
                    && a.is_rollup == is_rollup
            })
            .cloned())
    }

    async fn store_circuit_aggregates(
        &self,
        batch: &[CircuitAggregate],
    ) -> Result<Vec<UpsertOutcome>> {
        let mut state = self.state.write().await;
        let mut outcomes = Vec::with_capacity(batch.len());
        for aggregate in batch {
            let existing = state.circuit_aggregates.iter_mut().find(|a| {
                a.circuit_id == aggregate.circuit_id
                    && a.aggregate_date == aggregate.aggregate_date
                    && a.is_rollup == aggregate.is_rollup
            });
            match existing {
                Some(row) => {
                    let created_at = row.created_at;
                    *row = aggregate.clone();
                    row.created_at = created_at;
                    outcomes.push(UpsertOutcome::Updated);
                }
                None => {
                    state.circuit_aggregates.push(aggregate.clone());
                    outcomes.push(UpsertOutcome::Created);
                }
            }
        }
        Ok(outcomes)
    }

    async fn latest_circuit_aggregate_in_range(
        &self,
        circuit_id: Uuid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Option<CircuitAggregate>> {
        let state = self.state.read().await;
        Ok(state
            .circuit_aggregates
            .iter()
            .filter(|a| {
                a.circuit_id == circuit_id
                    && !a.is_rollup
                    && a.aggregate_date >= start
                    && a.aggregate_date <= end
            })
            .max_by_key(|a| a.aggregate_date)
            .cloned())
    }

    async fn circuit_aggregates_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CircuitAggregate>> {
        let state = self.state.read().await;
        Ok(state
            .circuit_aggregates
            .iter()
            .filter(|a| !a.is_rollup && a.aggregate_date >= start && a.aggregate_date <= end)
            .cloned()
            .collect())
    }

    async fn upsert_planner_aggregates(
        &self,
        rows: &[PlannerAggregate],
    ) -> Result<Vec<UpsertOutcome>> {
        let mut state = self.state.write().await;
        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            let existing = state.planner_aggregates.iter_mut().find(|a| {
                a.planner_id == row.planner_id
                    && a.period_type == row.period_type
                    && a.period_date == row.period_date
            });
            match existing {
                Some(slot) => {
                    *slot = row.clone();
                    outcomes.push(UpsertOutcome::Updated);
                }
                None => {
                    state.planner_aggregates.push(row.clone());
                    outcomes.push(UpsertOutcome::Created);
                }
            }
        }
        Ok(outcomes)
    }

    async fn upsert_regional_aggregates(
        &self,
        rows: &[RegionalAggregate],
    ) -> Result<Vec<UpsertOutcome>> {
        let mut state = self.state.write().await;
        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            let existing = state.regional_aggregates.iter_mut().find(|a| {
                a.region_id == row.region_id
                    && a.period_type == row.period_type
                    && a.period_date == row.period_date
            });
            match existing {
                Some(slot) => {
                    *slot = row.clone();
                    outcomes.push(UpsertOutcome::Updated);
                }
                None => {
                    state.regional_aggregates.push(row.clone());
                    outcomes.push(UpsertOutcome::Created);
                }
            }
        }
        Ok(outcomes)
    }

    async fn replace_period_rollups(
        &self,
        period_type: PeriodType,
        period_date: NaiveDate,
        planners: &[PlannerAggregate],
        regions: &[RegionalAggregate],
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .planner_aggregates
            .retain(|a| !(a.period_type == period_type && a.period_date == period_date));
        state
            .regional_aggregates
            .retain(|a| !(a.period_type == period_type && a.period_date == period_date));
        state.planner_aggregates.extend_from_slice(planners);
        state.regional_aggregates.extend_from_slice(regions);
        Ok(())
    }

    async fn planner_aggregate(
        &self,
        planner_id: &str,
        period_type: PeriodType,
        period_date: NaiveDate,
    ) -> Result<Option<PlannerAggregate>> {
        let state = self.state.read().await;
        Ok(state
            .planner_aggregates
            .iter()
            .find(|a| {
                a.planner_id == planner_id
                    && a.period_type == period_type
                    && a.period_date == period_date
            })
            .cloned())
    }

    async fn regional_aggregate(
        &self,
        region_id: i64,
        period_type: PeriodType,
        period_date: NaiveDate,
    ) -> Result<Option<RegionalAggregate>> {
        let state = self.state.read().await;
        Ok(state
            .regional_aggregates
            .iter()
            .find(|a| {
                a.region_id == region_id
                    && a.period_type == period_type
                    && a.period_date == period_date
            })
            .cloned())
    }

    async fn prune_aggregates_before(&self, cutoff: NaiveDate) -> Result<PruneCounts> {
        let mut state = self.state.write().await;

        let before = state.circuit_aggregates.len();
        state.circuit_aggregates.retain(|a| a.aggregate_date >= cutoff);
        let circuit_aggregates = (before - state.circuit_aggregates.len()) as u64;

        let before = state.planner_aggregates.len();
        state.planner_aggregates.retain(|a| a.period_date >= cutoff);
        let planner_aggregates = (before - state.planner_aggregates.len()) as u64;

        let before = state.regional_aggregates.len();
        state.regional_aggregates.retain(|a| a.period_date >= cutoff);
        let regional_aggregates = (before - state.regional_aggregates.len()) as u64;

        Ok(PruneCounts {
            circuit_aggregates,
            planner_aggregates,
            regional_aggregates,
        })
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn latest_snapshot(&self, circuit_id: Uuid) -> Result<Option<PlannedUnitsSnapshot>> {
        let state = self.state.read().await;
        Ok(state
            .snapshots
            .iter()
            .filter(|s| s.circuit_id == circuit_id)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn latest_snapshot_with_trigger(
        &self,
        circuit_id: Uuid,
        trigger: SnapshotTrigger,
    ) -> Result<Option<PlannedUnitsSnapshot>> {
        let state = self.state.read().await;
        Ok(state
            .snapshots
            .iter()
            .filter(|s| s.circuit_id == circuit_id && s.trigger == trigger)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn insert_snapshot(&self, snapshot: &PlannedUnitsSnapshot) -> Result<()> {
        let mut state = self.state.write().await;
        if state
            .snapshots
            .iter()
            .any(|s| s.circuit_id == snapshot.circuit_id && s.created_at == snapshot.created_at)
        {
            bail!(
                "snapshot for circuit {} at {} already exists",
                snapshot.circuit_id,
                snapshot.created_at
            );
        }
        state.snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn snapshots_for_circuit(&self, circuit_id: Uuid) -> Result<Vec<PlannedUnitsSnapshot>> {
        let state = self.state.read().await;
        let mut snapshots: Vec<_> = state
            .snapshots
            .iter()
            .filter(|s| s.circuit_id == circuit_id)
            .cloned()
            .collect();
        snapshots.sort_by_key(|s| s.created_at);
        Ok(snapshots)
    }
}

#[async_trait]
impl SyncLogStore for MemoryStore {
    async fn create_sync_log(&self, log: &SyncLog) -> Result<()> {
        self.state.write().await.sync_logs.push(log.clone());
        Ok(())
    }

    async fn finish_sync_log(&self, log: &SyncLog) -> Result<()> {
        let mut state = self.state.write().await;
        let Some(row) = state.sync_logs.iter_mut().find(|l| l.id == log.id) else {
            bail!("sync log {} was never started", log.id);
        };
        *row = log.clone();
        Ok(())
    }

    async fn recent_sync_logs(&self, limit: usize) -> Result<Vec<SyncLog>> {
        let state = self.state.read().await;
        let mut logs = state.sync_logs.clone();
        logs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        logs.truncate(limit);
        Ok(logs)
    }
}
