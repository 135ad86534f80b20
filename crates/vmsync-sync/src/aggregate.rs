//! Per-circuit aggregates from planned units, and planner/region rollups over stored aggregates.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;
use vmsync_adapters::{transform_planned_unit, UnitTypeTable};
use vmsync_core::{
    normalize_extension, AggregateData, Circuit, CircuitAggregate, MeasurementKind,
    PartialPlannedUnit, PeriodType, PermissionStatus, PlannerAggregate, Record,
    RegionalAggregate, RollupTotals,
};
use vmsync_storage::RemoteError;

use crate::sources::PlannedUnitSource;

/// Planner key for units that carry no planner.
pub const UNASSIGNED_PLANNER: &str = "unassigned";

/// Unit-type key for units that carry no unit code.
pub const UNKNOWN_UNIT_TYPE: &str = "UNKNOWN";

/// One circuit's calculation failed. `aborts_cycle` is set when the cause is
/// infrastructure (bad credentials, remote unreachable) rather than this circuit's data.
#[derive(Debug, Clone, Error)]
#[error("aggregate calculation failed for circuit {circuit_id}: {reason}")]
pub struct CircuitCalculationError {
    pub circuit_id: Uuid,
    pub reason: String,
    pub aborts_cycle: bool,
}

impl CircuitCalculationError {
    fn from_remote(circuit_id: Uuid, err: &RemoteError) -> Self {
        Self {
            circuit_id,
            reason: err.to_string(),
            aborts_cycle: matches!(
                err,
                RemoteError::Authentication { .. }
                    | RemoteError::ExhaustedRetries { .. }
                    | RemoteError::Credentials(_)
            ),
        }
    }
}

/// Aggregate plus the raw rows it was computed from, kept for snapshotting.
#[derive(Debug, Clone)]
pub struct CircuitCalculation {
    pub data: AggregateData,
    pub rows: Vec<Record>,
}

pub struct AggregateCalculator {
    units: Arc<dyn PlannedUnitSource>,
    unit_types: UnitTypeTable,
}

impl AggregateCalculator {
    pub fn new(units: Arc<dyn PlannedUnitSource>, unit_types: UnitTypeTable) -> Self {
        Self { units, unit_types }
    }

    pub fn unit_types(&self) -> &UnitTypeTable {
        &self.unit_types
    }

    pub async fn calculate_for_circuit(
        &self,
        circuit: &Circuit,
    ) -> Result<CircuitCalculation, CircuitCalculationError> {
        let rows = self
            .units
            .fetch_planned_units(&circuit.work_order)
            .await
            .map_err(|err| CircuitCalculationError::from_remote(circuit.id, &err))?;

        let (rows, units): (Vec<Record>, Vec<PartialPlannedUnit>) = rows
            .into_iter()
            .map(|row| {
                let unit = transform_planned_unit(&row);
                (row, unit)
            })
            .filter(|(_, unit)| belongs_to_circuit(circuit, unit))
            .unzip();
        let data = compute_aggregate(&units, &self.unit_types);
        debug!(
            circuit = %circuit.display_key(),
            units = data.total_units,
            "calculated circuit aggregate"
        );
        Ok(CircuitCalculation { data, rows })
    }
}

/// Units from another extension of the same work order are not this circuit's.
///
/// A unit with no extension is attributed to the circuit. When a work order is
/// split across several extensions, such a unit is therefore counted once in
/// every split circuit, and regional or planner rollups over those circuits
/// count it more than once.
pub fn belongs_to_circuit(circuit: &Circuit, unit: &PartialPlannedUnit) -> bool {
    if let Some(work_order) = unit.work_order.as_deref() {
        if !work_order.eq_ignore_ascii_case(&circuit.work_order) {
            return false;
        }
    }
    match unit.extension.as_deref() {
        None => true,
        Some(ext) => normalize_extension(Some(ext)) == circuit.extension,
    }
}

pub fn compute_aggregate(units: &[PartialPlannedUnit], unit_types: &UnitTypeTable) -> AggregateData {
    let mut data = AggregateData::default();
    for unit in units {
        data.total_units += 1;
        match unit.permission() {
            PermissionStatus::Approved => data.units_approved += 1,
            PermissionStatus::Refused => data.units_refused += 1,
            PermissionStatus::Pending => data.units_pending += 1,
        }

        let code = unit
            .unit_code
            .clone()
            .unwrap_or_else(|| UNKNOWN_UNIT_TYPE.to_string());
        *data.unit_counts_by_type.entry(code.clone()).or_default() += 1;

        let planner = unit
            .planner
            .clone()
            .unwrap_or_else(|| UNASSIGNED_PLANNER.to_string());
        let share = data.planner_distribution.entry(planner).or_default();
        share.units += 1;

        match unit_types.kind_for(&code) {
            MeasurementKind::LinearFt => {
                let value = unit.linear_ft.unwrap_or_default();
                data.total_linear_ft += value;
                *data.linear_ft_by_type.entry(code).or_default() += value;
                share.linear_ft += value;
            }
            MeasurementKind::Acres => {
                let value = unit.acres.unwrap_or_default();
                data.total_acres += value;
                *data.acres_by_type.entry(code).or_default() += value;
                share.acres += value;
            }
            MeasurementKind::TreeCount => {
                let value = unit.trees.unwrap_or_default();
                data.total_trees += value;
                *data.trees_by_type.entry(code).or_default() += value;
                share.trees += value;
            }
            MeasurementKind::None => {}
        }
    }
    data
}

/// Latest usable aggregate per circuit. Error-annotated rows are skipped so a
/// failed fetch does not mask an earlier good value in the same period.
pub fn latest_per_circuit(aggregates: &[CircuitAggregate]) -> Vec<&CircuitAggregate> {
    let mut latest: HashMap<Uuid, &CircuitAggregate> = HashMap::new();
    for aggregate in aggregates
        .iter()
        .filter(|a| !a.is_rollup && a.data.error.is_none())
    {
        latest
            .entry(aggregate.circuit_id)
            .and_modify(|current| {
                if aggregate.aggregate_date > current.aggregate_date {
                    *current = aggregate;
                }
            })
            .or_insert(aggregate);
    }
    let mut rows: Vec<_> = latest.into_values().collect();
    rows.sort_by_key(|a| a.circuit_id);
    rows
}

/// Planner rollup over stored circuit aggregates.
///
/// Permission counts are not recorded per planner, so each circuit's approved,
/// refused and pending counts are attributed in proportion to the planner's
/// share of that circuit's units. This is a heuristic with no accuracy bound;
/// the fractional shares are summed and rounded once at the end.
pub fn calculate_for_planner(
    planner_id: &str,
    period_type: PeriodType,
    period_date: NaiveDate,
    aggregates: &[&CircuitAggregate],
) -> Option<PlannerAggregate> {
    let mut totals = RollupTotals::default();
    let mut approved = 0.0_f64;
    let mut refused = 0.0_f64;
    let mut pending = 0.0_f64;
    let mut circuit_ids = Vec::new();

    for aggregate in aggregates {
        let Some(share) = aggregate.data.planner_distribution.get(planner_id) else {
            continue;
        };
        totals.circuits += 1;
        totals.total_units += share.units;
        totals.total_linear_ft += share.linear_ft;
        totals.total_acres += share.acres;
        totals.total_trees += share.trees;
        if aggregate.data.total_units > 0 {
            let fraction = share.units as f64 / aggregate.data.total_units as f64;
            approved += aggregate.data.units_approved as f64 * fraction;
            refused += aggregate.data.units_refused as f64 * fraction;
            pending += aggregate.data.units_pending as f64 * fraction;
        }
        circuit_ids.push(aggregate.circuit_id);
    }

    if circuit_ids.is_empty() {
        return None;
    }
    totals.units_approved = approved.round() as i64;
    totals.units_refused = refused.round() as i64;
    totals.units_pending = pending.round() as i64;

    Some(PlannerAggregate {
        planner_id: planner_id.to_string(),
        period_type,
        period_date,
        totals,
        circuit_ids,
    })
}

pub fn calculate_for_region(
    region_id: i64,
    period_type: PeriodType,
    period_date: NaiveDate,
    aggregates: &[&CircuitAggregate],
) -> Option<RegionalAggregate> {
    let mut totals = RollupTotals::default();
    let mut planners = BTreeSet::new();
    let mut unit_counts_by_type: BTreeMap<String, i64> = BTreeMap::new();

    for aggregate in aggregates
        .iter()
        .filter(|a| a.region_id == Some(region_id))
    {
        let data = &aggregate.data;
        totals.circuits += 1;
        totals.total_units += data.total_units;
        totals.total_linear_ft += data.total_linear_ft;
        totals.total_acres += data.total_acres;
        totals.total_trees += data.total_trees;
        totals.units_approved += data.units_approved;
        totals.units_refused += data.units_refused;
        totals.units_pending += data.units_pending;
        planners.extend(data.planner_distribution.keys().cloned());
        for (code, count) in &data.unit_counts_by_type {
            *unit_counts_by_type.entry(code.clone()).or_default() += count;
        }
    }

    if totals.circuits == 0 {
        return None;
    }
    Some(RegionalAggregate {
        region_id,
        period_type,
        period_date,
        totals,
        planner_count: planners.len() as i64,
        unit_counts_by_type,
    })
}

/// Every planner and region rollup for one period, from the aggregates dated inside it.
pub fn rollups_for_period(
    period_type: PeriodType,
    period_date: NaiveDate,
    aggregates: &[CircuitAggregate],
) -> (Vec<PlannerAggregate>, Vec<RegionalAggregate>) {
    let start = period_type.period_start(period_date);
    let in_period: Vec<CircuitAggregate> = aggregates
        .iter()
        .filter(|a| a.aggregate_date >= start && a.aggregate_date <= period_date)
        .cloned()
        .collect();
    let latest = latest_per_circuit(&in_period);

    let planner_ids: BTreeSet<&str> = latest
        .iter()
        .flat_map(|a| a.data.planner_distribution.keys().map(String::as_str))
        .collect();
    let region_ids: BTreeSet<i64> = latest.iter().filter_map(|a| a.region_id).collect();

    let unassigned_region = latest.iter().filter(|a| a.region_id.is_none()).count();
    if unassigned_region > 0 {
        warn!(
            circuits = unassigned_region,
            period = period_type.as_str(),
            "circuits without a region are left out of regional rollups"
        );
    }

    let planners = planner_ids
        .into_iter()
        .filter_map(|id| calculate_for_planner(id, period_type, period_date, &latest))
        .collect();
    let regions = region_ids
        .into_iter()
        .filter_map(|id| calculate_for_region(id, period_type, period_date, &latest))
        .collect();
    (planners, regions)
}
