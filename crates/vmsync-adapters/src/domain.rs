//! Field-name tables mapping remote rows onto circuit and planned-unit fields.

use serde_json::Value as JsonValue;
use vmsync_core::{PartialCircuit, PartialPlannedUnit, Record};

use crate::dates::parse_remote_date_value;
use crate::regions::RegionMap;

/// Remote field → internal circuit field.
pub const CIRCUIT_FIELD_MAP: &[(&str, &str)] = &[
    ("SS_JOBGUID", "job_guid"),
    ("SS_WO", "work_order"),
    ("SS_EXT", "extension"),
    ("WO_TITLE", "title"),
    ("REGION", "region_name"),
    ("VEGJOB_CYCLETYPE", "cycle_type"),
    ("VEGJOB_CONTRACTOR", "contractor"),
    ("VEGJOB_LENGTH", "total_miles"),
    ("VEGJOB_LENGTHCOMP", "planned_miles"),
    ("VEGJOB_PRCENT", "percent_complete"),
    ("WSREQ_STATUS", "status"),
    ("SS_EDITDATE", "remote_edited_at"),
];

/// Remote field → internal planned-unit field.
pub const PLANNED_UNIT_FIELD_MAP: &[(&str, &str)] = &[
    ("UNITGUID", "unit_id"),
    ("SS_WO", "work_order"),
    ("SS_EXT", "extension"),
    ("UNIT", "unit_code"),
    ("UNIT_DESC", "description"),
    ("PERMSTAT", "permission_status"),
    ("FORESTER", "planner"),
    ("STATNAME", "station"),
    ("LENGTHWRK", "linear_ft"),
    ("ACRES", "acres"),
    ("NUMTREES", "trees"),
    ("ASSDDATE", "assessed_at"),
    ("PARCELCOMMENTS", "notes"),
];

pub fn transform_circuit(row: &Record, regions: &RegionMap) -> PartialCircuit {
    let mut circuit = PartialCircuit::default();
    for (remote, internal) in CIRCUIT_FIELD_MAP {
        let Some(value) = lookup(row, remote) else {
            continue;
        };
        match *internal {
            "job_guid" => circuit.job_guid = text(value),
            "work_order" => circuit.work_order = text(value),
            "extension" => circuit.extension = text(value),
            "title" => circuit.title = text(value),
            "region_name" => circuit.region_name = text(value),
            "cycle_type" => circuit.cycle_type = text(value),
            "contractor" => circuit.contractor = text(value),
            "total_miles" => circuit.total_miles = Some(number(value)),
            "planned_miles" => circuit.planned_miles = Some(number(value)),
            "percent_complete" => circuit.percent_complete = Some(number(value)),
            "status" => circuit.status = text(value).map(|s| s.to_ascii_uppercase()),
            "remote_edited_at" => circuit.remote_edited_at = parse_remote_date_value(value),
            _ => {}
        }
    }
    circuit.region_id = circuit
        .region_name
        .as_deref()
        .and_then(|name| regions.resolve(name));
    circuit
}

pub fn transform_planned_unit(row: &Record) -> PartialPlannedUnit {
    let mut unit = PartialPlannedUnit::default();
    for (remote, internal) in PLANNED_UNIT_FIELD_MAP {
        let Some(value) = lookup(row, remote) else {
            continue;
        };
        match *internal {
            "unit_id" => unit.unit_id = text(value),
            "work_order" => unit.work_order = text(value),
            "extension" => unit.extension = text(value),
            "unit_code" => unit.unit_code = text(value).map(|s| s.to_ascii_uppercase()),
            "description" => unit.description = text(value),
            "permission_status" => unit.permission_status = text(value),
            "planner" => unit.planner = text(value),
            "station" => unit.station = text(value),
            "linear_ft" => unit.linear_ft = Some(number(value)),
            "acres" => unit.acres = Some(number(value)),
            "trees" => unit.trees = Some(number(value)),
            "assessed_at" => unit.assessed_at = parse_remote_date_value(value),
            "notes" => unit.notes = text(value),
            _ => {}
        }
    }
    unit
}

pub fn transform_planned_units(rows: &[Record]) -> Vec<PartialPlannedUnit> {
    rows.iter().map(transform_planned_unit).collect()
}

/// Exact key first, then a case-insensitive match. Nulls count as absent.
fn lookup<'a>(row: &'a Record, field: &str) -> Option<&'a JsonValue> {
    let value = row.get(field).or_else(|| {
        row.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(field))
            .map(|(_, v)| v)
    })?;
    (!value.is_null()).then_some(value)
}

fn text(value: &JsonValue) -> Option<String> {
    let raw = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!raw.is_empty()).then_some(raw)
}

/// Non-numeric values become zero rather than failing the row.
pub fn number(value: &JsonValue) -> f64 {
    match value {
        JsonValue::Number(n) => n.as_f64().unwrap_or_default(),
        JsonValue::String(s) => s
            .trim()
            .trim_end_matches('%')
            .replace(',', "")
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .unwrap_or_default(),
        JsonValue::Bool(b) => f64::from(u8::from(*b)),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vmsync_core::Region;

    fn record(value: JsonValue) -> Record {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn regions() -> RegionMap {
        RegionMap::from_regions(&[Region {
            id: 7,
            name: "Central".into(),
        }])
    }

    #[test]
    fn maps_circuit_fields_and_resolves_region() {
        let row = record(json!({
            "SS_JOBGUID": "{JOB-1}",
            "SS_WO": "2026-0001",
            "SS_EXT": "C",
            "REGION": "central",
            "VEGJOB_CYCLETYPE": "Cycle Maintenance",
            "VEGJOB_LENGTH": "12.5",
            "VEGJOB_PRCENT": 45,
            "WSREQ_STATUS": "activ",
            "SS_EDITDATE": "/Date(1700000000000)/",
            "UNMAPPED": "ignored"
        }));

        let circuit = transform_circuit(&row, &regions());

        assert_eq!(circuit.job_guid.as_deref(), Some("{JOB-1}"));
        assert_eq!(circuit.extension.as_deref(), Some("C"));
        assert_eq!(circuit.region_id, Some(7));
        assert_eq!(circuit.total_miles, Some(12.5));
        assert_eq!(circuit.percent_complete, Some(45.0));
        assert_eq!(circuit.status.as_deref(), Some("ACTIV"));
        assert!(circuit.remote_edited_at.is_some());
        assert_eq!(circuit.contractor, None);
        assert_eq!(circuit.planned_miles, None);
    }

    #[test]
    fn unknown_region_yields_null_reference() {
        let row = record(json!({"SS_JOBGUID": "{JOB-2}", "REGION": "Nowhere"}));
        let circuit = transform_circuit(&row, &regions());
        assert_eq!(circuit.region_name.as_deref(), Some("Nowhere"));
        assert_eq!(circuit.region_id, None);
    }

    #[test]
    fn non_numeric_values_default_to_zero() {
        let row = record(json!({"UNIT": "spm", "LENGTHWRK": "n/a", "ACRES": null, "NUMTREES": "3"}));
        let unit = transform_planned_unit(&row);
        assert_eq!(unit.unit_code.as_deref(), Some("SPM"));
        assert_eq!(unit.linear_ft, Some(0.0));
        assert_eq!(unit.acres, None);
        assert_eq!(unit.trees, Some(3.0));
    }

    #[test]
    fn maps_planned_unit_fields_case_insensitively() {
        let row = record(json!({
            "unitguid": "{U1}",
            "PermStat": "Approved",
            "FORESTER": "jdoe",
            "STATNAME": "10",
            "ASSDDATE": "/Date(1899-12-30)/",
            "PARCELCOMMENTS": "  "
        }));
        let unit = transform_planned_unit(&row);
        assert_eq!(unit.unit_id.as_deref(), Some("{U1}"));
        assert_eq!(unit.permission_status.as_deref(), Some("Approved"));
        assert_eq!(unit.planner.as_deref(), Some("jdoe"));
        assert_eq!(unit.station.as_deref(), Some("10"));
        assert_eq!(unit.assessed_at, None);
        assert_eq!(unit.notes, None);
    }

    #[test]
    fn number_handles_formatted_strings() {
        assert_eq!(number(&json!("1,250.5")), 1250.5);
        assert_eq!(number(&json!("75%")), 75.0);
        assert_eq!(number(&json!("NaN")), 0.0);
        assert_eq!(number(&json!([1])), 0.0);
    }
}
