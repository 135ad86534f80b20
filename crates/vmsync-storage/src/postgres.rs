//! Postgres implementation of the persistence traits (sqlx, runtime-checked queries).

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;
use vmsync_core::{
    AggregateData, Circuit, CircuitAggregate, CircuitUpsert, PartialCircuit, PeriodType,
    PlannedUnitsSnapshot, PlannerAggregate, PlannerShare, PruneCounts, Region, RegionalAggregate,
    RollupTotals, SnapshotDocument, SnapshotTrigger, SyncCounters, SyncLog, UpsertOutcome,
};

use crate::store::{AggregateStore, CircuitStore, SnapshotStore, SyncLogStore};

const CIRCUIT_COLUMNS: &str = "id, job_guid, work_order, extension, title, region_id, cycle_type, \
     contractor, total_miles, planned_miles, percent_complete, status, remote_edited_at, \
     last_synced_at, is_excluded, exclusion_reason, excluded_by, excluded_at";

const CIRCUIT_AGGREGATE_COLUMNS: &str = "circuit_id, region_id, aggregate_date, is_rollup, \
     total_units, total_linear_ft, total_acres, total_trees, units_approved, units_refused, \
     units_pending, unit_counts_by_type, linear_ft_by_type, acres_by_type, trees_by_type, \
     planner_distribution, error, created_at, updated_at";

const ROLLUP_COLUMNS: &str = "period_type, period_date, circuits, total_units, total_linear_ft, \
     total_acres, total_trees, units_approved, units_refused, units_pending";

const SNAPSHOT_COLUMNS: &str = "id, circuit_id, created_at, trigger_reason, percent_complete, \
     status, content_hash, unit_count, document";

const SYNC_LOG_COLUMNS: &str = "id, trigger_type, status, status_filter, started_at, finished_at, \
     duration_ms, counters, error_message";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying migrations")?;
        info!("database migrations applied");
        Ok(())
    }

    async fn upsert_circuit_aggregate(
        tx: &mut Transaction<'_, Postgres>,
        aggregate: &CircuitAggregate,
    ) -> Result<UpsertOutcome> {
        let data = &aggregate.data;
        let row = sqlx::query(
            r#"
            INSERT INTO circuit_aggregates (
                circuit_id, region_id, aggregate_date, is_rollup,
                total_units, total_linear_ft, total_acres, total_trees,
                units_approved, units_refused, units_pending,
                unit_counts_by_type, linear_ft_by_type, acres_by_type, trees_by_type,
                planner_distribution, error, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (circuit_id, aggregate_date, is_rollup) DO UPDATE SET
                region_id = EXCLUDED.region_id,
                total_units = EXCLUDED.total_units,
                total_linear_ft = EXCLUDED.total_linear_ft,
                total_acres = EXCLUDED.total_acres,
                total_trees = EXCLUDED.total_trees,
                units_approved = EXCLUDED.units_approved,
                units_refused = EXCLUDED.units_refused,
                units_pending = EXCLUDED.units_pending,
                unit_counts_by_type = EXCLUDED.unit_counts_by_type,
                linear_ft_by_type = EXCLUDED.linear_ft_by_type,
                acres_by_type = EXCLUDED.acres_by_type,
                trees_by_type = EXCLUDED.trees_by_type,
                planner_distribution = EXCLUDED.planner_distribution,
                error = EXCLUDED.error,
                updated_at = EXCLUDED.updated_at
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(aggregate.circuit_id)
        .bind(aggregate.region_id)
        .bind(aggregate.aggregate_date)
        .bind(aggregate.is_rollup)
        .bind(data.total_units)
        .bind(data.total_linear_ft)
        .bind(data.total_acres)
        .bind(data.total_trees)
        .bind(data.units_approved)
        .bind(data.units_refused)
        .bind(data.units_pending)
        .bind(Json(&data.unit_counts_by_type))
        .bind(Json(&data.linear_ft_by_type))
        .bind(Json(&data.acres_by_type))
        .bind(Json(&data.trees_by_type))
        .bind(Json(&data.planner_distribution))
        .bind(data.error.as_deref())
        .bind(aggregate.created_at)
        .bind(aggregate.updated_at)
        .fetch_one(&mut **tx)
        .await
        .with_context(|| {
            format!(
                "upserting aggregate for circuit {} on {}",
                aggregate.circuit_id, aggregate.aggregate_date
            )
        })?;
        upsert_outcome(&row)
    }

    async fn upsert_planner_row(
        tx: &mut Transaction<'_, Postgres>,
        row: &PlannerAggregate,
    ) -> Result<UpsertOutcome> {
        let t = &row.totals;
        let result = sqlx::query(
            r#"
            INSERT INTO planner_aggregates (
                planner_id, period_type, period_date, circuits, total_units,
                total_linear_ft, total_acres, total_trees, units_approved,
                units_refused, units_pending, circuit_ids, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, now())
            ON CONFLICT (planner_id, period_type, period_date) DO UPDATE SET
                circuits = EXCLUDED.circuits,
                total_units = EXCLUDED.total_units,
                total_linear_ft = EXCLUDED.total_linear_ft,
                total_acres = EXCLUDED.total_acres,
                total_trees = EXCLUDED.total_trees,
                units_approved = EXCLUDED.units_approved,
                units_refused = EXCLUDED.units_refused,
                units_pending = EXCLUDED.units_pending,
                circuit_ids = EXCLUDED.circuit_ids,
                updated_at = now()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&row.planner_id)
        .bind(row.period_type.as_str())
        .bind(row.period_date)
        .bind(t.circuits)
        .bind(t.total_units)
        .bind(t.total_linear_ft)
        .bind(t.total_acres)
        .bind(t.total_trees)
        .bind(t.units_approved)
        .bind(t.units_refused)
        .bind(t.units_pending)
        .bind(Json(&row.circuit_ids))
        .fetch_one(&mut **tx)
        .await
        .with_context(|| format!("upserting planner aggregate for {}", row.planner_id))?;
        upsert_outcome(&result)
    }

    async fn upsert_regional_row(
        tx: &mut Transaction<'_, Postgres>,
        row: &RegionalAggregate,
    ) -> Result<UpsertOutcome> {
        let t = &row.totals;
        let result = sqlx::query(
            r#"
            INSERT INTO regional_aggregates (
                region_id, period_type, period_date, circuits, total_units,
                total_linear_ft, total_acres, total_trees, units_approved,
                units_refused, units_pending, planner_count, unit_counts_by_type, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, now())
            ON CONFLICT (region_id, period_type, period_date) DO UPDATE SET
                circuits = EXCLUDED.circuits,
                total_units = EXCLUDED.total_units,
                total_linear_ft = EXCLUDED.total_linear_ft,
                total_acres = EXCLUDED.total_acres,
                total_trees = EXCLUDED.total_trees,
                units_approved = EXCLUDED.units_approved,
                units_refused = EXCLUDED.units_refused,
                units_pending = EXCLUDED.units_pending,
                planner_count = EXCLUDED.planner_count,
                unit_counts_by_type = EXCLUDED.unit_counts_by_type,
                updated_at = now()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(row.region_id)
        .bind(row.period_type.as_str())
        .bind(row.period_date)
        .bind(t.circuits)
        .bind(t.total_units)
        .bind(t.total_linear_ft)
        .bind(t.total_acres)
        .bind(t.total_trees)
        .bind(t.units_approved)
        .bind(t.units_refused)
        .bind(t.units_pending)
        .bind(row.planner_count)
        .bind(Json(&row.unit_counts_by_type))
        .fetch_one(&mut **tx)
        .await
        .with_context(|| format!("upserting regional aggregate for region {}", row.region_id))?;
        upsert_outcome(&result)
    }
}

fn upsert_outcome(row: &PgRow) -> Result<UpsertOutcome> {
    let inserted: bool = row.try_get("inserted")?;
    Ok(if inserted {
        UpsertOutcome::Created
    } else {
        UpsertOutcome::Updated
    })
}

fn circuit_from_row(row: &PgRow) -> Result<Circuit> {
    Ok(Circuit {
        id: row.try_get("id")?,
        job_guid: row.try_get("job_guid")?,
        work_order: row.try_get("work_order")?,
        extension: row.try_get("extension")?,
        title: row.try_get("title")?,
        region_id: row.try_get("region_id")?,
        cycle_type: row.try_get("cycle_type")?,
        contractor: row.try_get("contractor")?,
        total_miles: row.try_get("total_miles")?,
        planned_miles: row.try_get("planned_miles")?,
        percent_complete: row.try_get("percent_complete")?,
        status: row.try_get("status")?,
        remote_edited_at: row.try_get("remote_edited_at")?,
        last_synced_at: row.try_get("last_synced_at")?,
        is_excluded: row.try_get("is_excluded")?,
        exclusion_reason: row.try_get("exclusion_reason")?,
        excluded_by: row.try_get("excluded_by")?,
        excluded_at: row.try_get("excluded_at")?,
    })
}

fn circuit_aggregate_from_row(row: &PgRow) -> Result<CircuitAggregate> {
    let unit_counts_by_type: Json<BTreeMap<String, i64>> = row.try_get("unit_counts_by_type")?;
    let linear_ft_by_type: Json<BTreeMap<String, f64>> = row.try_get("linear_ft_by_type")?;
    let acres_by_type: Json<BTreeMap<String, f64>> = row.try_get("acres_by_type")?;
    let trees_by_type: Json<BTreeMap<String, f64>> = row.try_get("trees_by_type")?;
    let planner_distribution: Json<BTreeMap<String, PlannerShare>> =
        row.try_get("planner_distribution")?;

    Ok(CircuitAggregate {
        circuit_id: row.try_get("circuit_id")?,
        region_id: row.try_get("region_id")?,
        aggregate_date: row.try_get("aggregate_date")?,
        is_rollup: row.try_get("is_rollup")?,
        data: AggregateData {
            total_units: row.try_get("total_units")?,
            total_linear_ft: row.try_get("total_linear_ft")?,
            total_acres: row.try_get("total_acres")?,
            total_trees: row.try_get("total_trees")?,
            units_approved: row.try_get("units_approved")?,
            units_refused: row.try_get("units_refused")?,
            units_pending: row.try_get("units_pending")?,
            unit_counts_by_type: unit_counts_by_type.0,
            linear_ft_by_type: linear_ft_by_type.0,
            acres_by_type: acres_by_type.0,
            trees_by_type: trees_by_type.0,
            planner_distribution: planner_distribution.0,
            error: row.try_get("error")?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn rollup_totals_from_row(row: &PgRow) -> Result<RollupTotals> {
    Ok(RollupTotals {
        circuits: row.try_get("circuits")?,
        total_units: row.try_get("total_units")?,
        total_linear_ft: row.try_get("total_linear_ft")?,
        total_acres: row.try_get("total_acres")?,
        total_trees: row.try_get("total_trees")?,
        units_approved: row.try_get("units_approved")?,
        units_refused: row.try_get("units_refused")?,
        units_pending: row.try_get("units_pending")?,
    })
}

fn period_type_from_row(row: &PgRow) -> Result<PeriodType> {
    let raw: String = row.try_get("period_type")?;
    Ok(raw.parse()?)
}

fn snapshot_from_row(row: &PgRow) -> Result<PlannedUnitsSnapshot> {
    let trigger: String = row.try_get("trigger_reason")?;
    let document: Json<SnapshotDocument> = row.try_get("document")?;
    Ok(PlannedUnitsSnapshot {
        id: row.try_get("id")?,
        circuit_id: row.try_get("circuit_id")?,
        created_at: row.try_get("created_at")?,
        trigger: trigger.parse()?,
        percent_complete: row.try_get("percent_complete")?,
        status: row.try_get("status")?,
        content_hash: row.try_get("content_hash")?,
        unit_count: row.try_get("unit_count")?,
        document: document.0,
    })
}

fn sync_log_from_row(row: &PgRow) -> Result<SyncLog> {
    let trigger: String = row.try_get("trigger_type")?;
    let status: String = row.try_get("status")?;
    let status_filter: Json<Vec<String>> = row.try_get("status_filter")?;
    let counters: Json<SyncCounters> = row.try_get("counters")?;
    Ok(SyncLog {
        id: row.try_get("id")?,
        trigger: trigger.parse()?,
        status: status.parse()?,
        status_filter: status_filter.0,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        duration_ms: row.try_get("duration_ms")?,
        counters: counters.0,
        error_message: row.try_get("error_message")?,
    })
}

#[async_trait]
impl CircuitStore for PgStore {
    async fn upsert_circuit(
        &self,
        partial: &PartialCircuit,
        synced_at: DateTime<Utc>,
    ) -> Result<Option<CircuitUpsert>> {
        let Some(job_guid) = partial.job_guid.as_deref() else {
            return Ok(None);
        };
        let mut tx = self.pool.begin().await.context("beginning circuit upsert")?;

        let existing = sqlx::query(&format!(
            "SELECT {CIRCUIT_COLUMNS} FROM circuits WHERE job_guid = $1 FOR UPDATE"
        ))
        .bind(job_guid)
        .fetch_optional(&mut *tx)
        .await
        .with_context(|| format!("loading circuit {job_guid}"))?;

        let upsert = match existing {
            Some(row) => {
                let mut circuit = circuit_from_row(&row)?;
                let previous_percent_complete = Some(circuit.percent_complete);
                let previous_status = circuit.status.clone();
                circuit.apply_partial(partial, synced_at);
                sqlx::query(
                    r#"
                    UPDATE circuits SET
                        work_order = $2, extension = $3, title = $4, region_id = $5,
                        cycle_type = $6, contractor = $7, total_miles = $8, planned_miles = $9,
                        percent_complete = $10, status = $11, remote_edited_at = $12,
                        last_synced_at = $13, updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(circuit.id)
                .bind(&circuit.work_order)
                .bind(&circuit.extension)
                .bind(circuit.title.as_deref())
                .bind(circuit.region_id)
                .bind(circuit.cycle_type.as_deref())
                .bind(circuit.contractor.as_deref())
                .bind(circuit.total_miles)
                .bind(circuit.planned_miles)
                .bind(circuit.percent_complete)
                .bind(circuit.status.as_deref())
                .bind(circuit.remote_edited_at)
                .bind(circuit.last_synced_at)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("updating circuit {job_guid}"))?;
                CircuitUpsert {
                    circuit,
                    created: false,
                    previous_percent_complete,
                    previous_status,
                }
            }
            None => {
                let Some(circuit) = Circuit::from_partial(partial, synced_at) else {
                    return Ok(None);
                };
                sqlx::query(
                    r#"
                    INSERT INTO circuits (
                        id, job_guid, work_order, extension, title, region_id, cycle_type,
                        contractor, total_miles, planned_miles, percent_complete, status,
                        remote_edited_at, last_synced_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                    "#,
                )
                .bind(circuit.id)
                .bind(&circuit.job_guid)
                .bind(&circuit.work_order)
                .bind(&circuit.extension)
                .bind(circuit.title.as_deref())
                .bind(circuit.region_id)
                .bind(circuit.cycle_type.as_deref())
                .bind(circuit.contractor.as_deref())
                .bind(circuit.total_miles)
                .bind(circuit.planned_miles)
                .bind(circuit.percent_complete)
                .bind(circuit.status.as_deref())
                .bind(circuit.remote_edited_at)
                .bind(circuit.last_synced_at)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("inserting circuit {job_guid}"))?;
                CircuitUpsert {
                    circuit,
                    created: true,
                    previous_percent_complete: None,
                    previous_status: None,
                }
            }
        };

        tx.commit().await.context("committing circuit upsert")?;
        Ok(Some(upsert))
    }

    async fn circuit_by_job_guid(&self, job_guid: &str) -> Result<Option<Circuit>> {
        let row = sqlx::query(&format!(
            "SELECT {CIRCUIT_COLUMNS} FROM circuits WHERE job_guid = $1"
        ))
        .bind(job_guid)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading circuit {job_guid}"))?;
        row.as_ref().map(circuit_from_row).transpose()
    }

    async fn active_circuits(&self) -> Result<Vec<Circuit>> {
        let rows = sqlx::query(&format!(
            "SELECT {CIRCUIT_COLUMNS} FROM circuits WHERE NOT is_excluded ORDER BY work_order, extension"
        ))
        .fetch_all(&self.pool)
        .await
        .context("loading active circuits")?;
        rows.iter().map(circuit_from_row).collect()
    }

    async fn regions(&self) -> Result<Vec<Region>> {
        let rows = sqlx::query("SELECT id, name FROM regions ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .context("loading regions")?;
        rows.iter()
            .map(|row| {
                Ok(Region {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl AggregateStore for PgStore {
    async fn circuit_aggregate(
        &self,
        circuit_id: Uuid,
        aggregate_date: NaiveDate,
        is_rollup: bool,
    ) -> Result<Option<CircuitAggregate>> {
        let row = sqlx::query(&format!(
            "SELECT {CIRCUIT_AGGREGATE_COLUMNS} FROM circuit_aggregates \
             WHERE circuit_id = $1 AND aggregate_date = $2 AND is_rollup = $3"
        ))
        .bind(circuit_id)
        .bind(aggregate_date)
        .bind(is_rollup)
        .fetch_optional(&self.pool)
        .await
        .context("loading circuit aggregate")?;
        row.as_ref().map(circuit_aggregate_from_row).transpose()
    }

    async fn store_circuit_aggregates(
        &self,
        batch: &[CircuitAggregate],
    ) -> Result<Vec<UpsertOutcome>> {
        let mut tx = self.pool.begin().await.context("beginning aggregate batch")?;
        let mut outcomes = Vec::with_capacity(batch.len());
        for aggregate in batch {
            outcomes.push(Self::upsert_circuit_aggregate(&mut tx, aggregate).await?);
        }
        tx.commit().await.context("committing aggregate batch")?;
        debug!(rows = batch.len(), "stored circuit aggregate batch");
        Ok(outcomes)
    }

    async fn latest_circuit_aggregate_in_range(
        &self,
        circuit_id: Uuid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Option<CircuitAggregate>> {
        let row = sqlx::query(&format!(
            "SELECT {CIRCUIT_AGGREGATE_COLUMNS} FROM circuit_aggregates \
             WHERE circuit_id = $1 AND NOT is_rollup AND aggregate_date BETWEEN $2 AND $3 \
             ORDER BY aggregate_date DESC LIMIT 1"
        ))
        .bind(circuit_id)
        .bind(start)
        .bind(end)
        .fetch_optional(&self.pool)
        .await
        .context("loading latest circuit aggregate in range")?;
        row.as_ref().map(circuit_aggregate_from_row).transpose()
    }

    async fn circuit_aggregates_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CircuitAggregate>> {
        let rows = sqlx::query(&format!(
            "SELECT {CIRCUIT_AGGREGATE_COLUMNS} FROM circuit_aggregates \
             WHERE NOT is_rollup AND aggregate_date BETWEEN $1 AND $2 \
             ORDER BY circuit_id, aggregate_date"
        ))
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .context("loading circuit aggregates in range")?;
        rows.iter().map(circuit_aggregate_from_row).collect()
    }

    async fn upsert_planner_aggregates(
        &self,
        rows: &[PlannerAggregate],
    ) -> Result<Vec<UpsertOutcome>> {
        let mut tx = self.pool.begin().await.context("beginning planner batch")?;
        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            outcomes.push(Self::upsert_planner_row(&mut tx, row).await?);
        }
        tx.commit().await.context("committing planner batch")?;
        Ok(outcomes)
    }

    async fn upsert_regional_aggregates(
        &self,
        rows: &[RegionalAggregate],
    ) -> Result<Vec<UpsertOutcome>> {
        let mut tx = self.pool.begin().await.context("beginning regional batch")?;
        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            outcomes.push(Self::upsert_regional_row(&mut tx, row).await?);
        }
        tx.commit().await.context("committing regional batch")?;
        Ok(outcomes)
    }

    async fn replace_period_rollups(
        &self,
        period_type: PeriodType,
        period_date: NaiveDate,
        planners: &[PlannerAggregate],
        regions: &[RegionalAggregate],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("beginning rollup refresh")?;
        let stale_planners = sqlx::query(
            "DELETE FROM planner_aggregates WHERE period_type = $1 AND period_date = $2",
        )
        .bind(period_type.as_str())
        .bind(period_date)
        .execute(&mut *tx)
        .await
        .context("clearing planner rollups")?
        .rows_affected();
        let stale_regions = sqlx::query(
            "DELETE FROM regional_aggregates WHERE period_type = $1 AND period_date = $2",
        )
        .bind(period_type.as_str())
        .bind(period_date)
        .execute(&mut *tx)
        .await
        .context("clearing regional rollups")?
        .rows_affected();
        for row in planners {
            Self::upsert_planner_row(&mut tx, row).await?;
        }
        for row in regions {
            Self::upsert_regional_row(&mut tx, row).await?;
        }
        tx.commit().await.context("committing rollup refresh")?;
        debug!(
            period_type = period_type.as_str(),
            %period_date,
            stale_planners,
            stale_regions,
            "replaced period rollups"
        );
        Ok(())
    }

    async fn planner_aggregate(
        &self,
        planner_id: &str,
        period_type: PeriodType,
        period_date: NaiveDate,
    ) -> Result<Option<PlannerAggregate>> {
        let row = sqlx::query(&format!(
            "SELECT planner_id, {ROLLUP_COLUMNS}, circuit_ids FROM planner_aggregates \
             WHERE planner_id = $1 AND period_type = $2 AND period_date = $3"
        ))
        .bind(planner_id)
        .bind(period_type.as_str())
        .bind(period_date)
        .fetch_optional(&self.pool)
        .await
        .context("loading planner aggregate")?;

        row.as_ref()
            .map(|row| {
                let circuit_ids: Json<Vec<Uuid>> = row.try_get("circuit_ids")?;
                Ok(PlannerAggregate {
                    planner_id: row.try_get("planner_id")?,
                    period_type: period_type_from_row(row)?,
                    period_date: row.try_get("period_date")?,
                    totals: rollup_totals_from_row(row)?,
                    circuit_ids: circuit_ids.0,
                })
            })
            .transpose()
    }

    async fn regional_aggregate(
        &self,
        region_id: i64,
        period_type: PeriodType,
        period_date: NaiveDate,
    ) -> Result<Option<RegionalAggregate>> {
        let row = sqlx::query(&format!(
            "SELECT region_id, {ROLLUP_COLUMNS}, planner_count, unit_counts_by_type \
             FROM regional_aggregates \
             WHERE region_id = $1 AND period_type = $2 AND period_date = $3"
        ))
        .bind(region_id)
        .bind(period_type.as_str())
        .bind(period_date)
        .fetch_optional(&self.pool)
        .await
        .context("loading regional aggregate")?;

        row.as_ref()
            .map(|row| {
                let unit_counts_by_type: Json<BTreeMap<String, i64>> =
                    row.try_get("unit_counts_by_type")?;
                Ok(RegionalAggregate {
                    region_id: row.try_get("region_id")?,
                    period_type: period_type_from_row(row)?,
                    period_date: row.try_get("period_date")?,
                    totals: rollup_totals_from_row(row)?,
                    planner_count: row.try_get("planner_count")?,
                    unit_counts_by_type: unit_counts_by_type.0,
                })
            })
            .transpose()
    }

    async fn prune_aggregates_before(&self, cutoff: NaiveDate) -> Result<PruneCounts> {
        let mut tx = self.pool.begin().await.context("beginning prune")?;
        let circuit_aggregates = sqlx::query("DELETE FROM circuit_aggregates WHERE aggregate_date < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .context("pruning circuit_aggregates")?
            .rows_affected();
        let planner_aggregates = sqlx::query("DELETE FROM planner_aggregates WHERE period_date < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .context("pruning planner_aggregates")?
            .rows_affected();
        let regional_aggregates =
            sqlx::query("DELETE FROM regional_aggregates WHERE period_date < $1")
                .bind(cutoff)
                .execute(&mut *tx)
                .await
                .context("pruning regional_aggregates")?
                .rows_affected();
        tx.commit().await.context("committing prune")?;
        Ok(PruneCounts {
            circuit_aggregates,
            planner_aggregates,
            regional_aggregates,
        })
    }
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn latest_snapshot(&self, circuit_id: Uuid) -> Result<Option<PlannedUnitsSnapshot>> {
        let row = sqlx::query(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM planned_units_snapshots \
             WHERE circuit_id = $1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(circuit_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading latest snapshot")?;
        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn latest_snapshot_with_trigger(
        &self,
        circuit_id: Uuid,
        trigger: SnapshotTrigger,
    ) -> Result<Option<PlannedUnitsSnapshot>> {
        let row = sqlx::query(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM planned_units_snapshots \
             WHERE circuit_id = $1 AND trigger_reason = $2 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(circuit_id)
        .bind(trigger.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("loading latest snapshot by trigger")?;
        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn insert_snapshot(&self, snapshot: &PlannedUnitsSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO planned_units_snapshots (
                id, circuit_id, created_at, trigger_reason, percent_complete,
                status, content_hash, unit_count, document
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(snapshot.id)
        .bind(snapshot.circuit_id)
        .bind(snapshot.created_at)
        .bind(snapshot.trigger.as_str())
        .bind(snapshot.percent_complete)
        .bind(snapshot.status.as_deref())
        .bind(&snapshot.content_hash)
        .bind(snapshot.unit_count)
        .bind(Json(&snapshot.document))
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting snapshot for circuit {}", snapshot.circuit_id))?;
        Ok(())
    }

    async fn snapshots_for_circuit(&self, circuit_id: Uuid) -> Result<Vec<PlannedUnitsSnapshot>> {
        let rows = sqlx::query(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM planned_units_snapshots \
             WHERE circuit_id = $1 ORDER BY created_at"
        ))
        .bind(circuit_id)
        .fetch_all(&self.pool)
        .await
        .context("loading snapshots")?;
        rows.iter().map(snapshot_from_row).collect()
    }
}

#[async_trait]
impl SyncLogStore for PgStore {
    async fn create_sync_log(&self, log: &SyncLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_logs (
                id, trigger_type, status, status_filter, started_at, finished_at,
                duration_ms, counters, error_message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(log.id)
        .bind(log.trigger.as_str())
        .bind(log.status.as_str())
        .bind(Json(&log.status_filter))
        .bind(log.started_at)
        .bind(log.finished_at)
        .bind(log.duration_ms)
        .bind(Json(&log.counters))
        .bind(log.error_message.as_deref())
        .execute(&self.pool)
        .await
        .context("creating sync log")?;
        Ok(())
    }

    async fn finish_sync_log(&self, log: &SyncLog) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_logs SET
                status = $2, finished_at = $3, duration_ms = $4, counters = $5, error_message = $6
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(log.id)
        .bind(log.status.as_str())
        .bind(log.finished_at)
        .bind(log.duration_ms)
        .bind(Json(&log.counters))
        .bind(log.error_message.as_deref())
        .execute(&self.pool)
        .await
        .context("finishing sync log")?;
        if result.rows_affected() == 0 {
            anyhow::bail!("sync log {} is not running", log.id);
        }
        Ok(())
    }

    async fn recent_sync_logs(&self, limit: usize) -> Result<Vec<SyncLog>> {
        let rows = sqlx::query(&format!(
            "SELECT {SYNC_LOG_COLUMNS} FROM sync_logs ORDER BY started_at DESC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("loading sync logs")?;
        rows.iter().map(sync_log_from_row).collect()
    }
}
