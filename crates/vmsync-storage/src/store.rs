//! Persistence contracts for circuits, aggregates, snapshots, and sync logs.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;
use vmsync_core::{
    Circuit, CircuitAggregate, CircuitUpsert, PartialCircuit, PeriodType, PlannedUnitsSnapshot,
    PlannerAggregate, PruneCounts, Region, RegionalAggregate, SnapshotTrigger, SyncLog,
    UpsertOutcome,
};

#[async_trait]
pub trait CircuitStore: Send + Sync {
    /// Upserts by `job_guid`. Returns `None` when the row lacks `job_guid` or `work_order`.
    async fn upsert_circuit(
        &self,
        partial: &PartialCircuit,
        synced_at: DateTime<Utc>,
    ) -> Result<Option<CircuitUpsert>>;

    async fn circuit_by_job_guid(&self, job_guid: &str) -> Result<Option<Circuit>>;

    /// Circuits not excluded by an administrator.
    async fn active_circuits(&self) -> Result<Vec<Circuit>>;

    async fn regions(&self) -> Result<Vec<Region>>;
}

#[async_trait]
pub trait AggregateStore: Send + Sync {
    async fn circuit_aggregate(
        &self,
        circuit_id: Uuid,
        aggregate_date: NaiveDate,
        is_rollup: bool,
    ) -> Result<Option<CircuitAggregate>>;

    /// Upserts the whole batch keyed by `(circuit_id, aggregate_date, is_rollup)` in one transaction.
    async fn store_circuit_aggregates(
        &self,
        batch: &[CircuitAggregate],
    ) -> Result<Vec<UpsertOutcome>>;

    /// Most recent non-rollup aggregate for the circuit within `[start, end]`.
    async fn latest_circuit_aggregate_in_range(
        &self,
        circuit_id: Uuid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Option<CircuitAggregate>>;

    /// All non-rollup aggregates dated within `[start, end]`.
    async fn circuit_aggregates_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CircuitAggregate>>;

    async fn upsert_planner_aggregates(
        &self,
        rows: &[PlannerAggregate],
    ) -> Result<Vec<UpsertOutcome>>;

    async fn upsert_regional_aggregates(
        &self,
        rows: &[RegionalAggregate],
    ) -> Result<Vec<UpsertOutcome>>;

    /// Swaps every planner and regional row of one period for `planners` and
    /// `regions` in a single transaction, so keys absent from the new set disappear.
    async fn replace_period_rollups(
        &self,
        period_type: PeriodType,
        period_date: NaiveDate,
        planners: &[PlannerAggregate],
        regions: &[RegionalAggregate],
    ) -> Result<()>;

    async fn planner_aggregate(
        &self,
        planner_id: &str,
        period_type: PeriodType,
        period_date: NaiveDate,
    ) -> Result<Option<PlannerAggregate>>;

    async fn regional_aggregate(
        &self,
        region_id: i64,
        period_type: PeriodType,
        period_date: NaiveDate,
    ) -> Result<Option<RegionalAggregate>>;

    /// Deletes rows dated strictly before `cutoff` from all three aggregate tables in one transaction.
    async fn prune_aggregates_before(&self, cutoff: NaiveDate) -> Result<PruneCounts>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn latest_snapshot(&self, circuit_id: Uuid) -> Result<Option<PlannedUnitsSnapshot>>;

    async fn latest_snapshot_with_trigger(
        &self,
        circuit_id: Uuid,
        trigger: SnapshotTrigger,
    ) -> Result<Option<PlannedUnitsSnapshot>>;

    async fn insert_snapshot(&self, snapshot: &PlannedUnitsSnapshot) -> Result<()>;

    async fn snapshots_for_circuit(&self, circuit_id: Uuid) -> Result<Vec<PlannedUnitsSnapshot>>;
}

#[async_trait]
pub trait SyncLogStore: Send + Sync {
    async fn create_sync_log(&self, log: &SyncLog) -> Result<()>;

    /// Writes the terminal status, timing, and counters of a started log.
    async fn finish_sync_log(&self, log: &SyncLog) -> Result<()>;

    async fn recent_sync_logs(&self, limit: usize) -> Result<Vec<SyncLog>>;
}

/// Everything the pipeline persists through.
pub trait PipelineStore: CircuitStore + AggregateStore + SnapshotStore + SyncLogStore {}

impl<T> PipelineStore for T where T: CircuitStore + AggregateStore + SnapshotStore + SyncLogStore {}
