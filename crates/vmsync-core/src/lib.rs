//! Core domain model for the vegetation-management sync pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "vmsync-core";

/// Weekly aggregates are always keyed by the Saturday that closes the week.
pub const WEEK_ENDING_WEEKDAY: Weekday = Weekday::Sat;

/// Remote status code that marks a circuit as handed to quality control.
pub const QC_STATUS: &str = "QC";

/// One raw row as returned by the remote system, keyed by remote field name.
pub type Record = serde_json::Map<String, JsonValue>;

/// A normalized planned unit inside a snapshot document.
pub type SnapshotUnit = BTreeMap<String, JsonValue>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} `{}`", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

/// Basic-auth credential set handed out by a credential provider.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub user_id: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("user_id", &self.user_id)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub id: i64,
    pub name: String,
}

/// Circuit fields as mapped from one remote row. Absent remote fields stay `None`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PartialCircuit {
    pub job_guid: Option<String>,
    pub work_order: Option<String>,
    pub extension: Option<String>,
    pub title: Option<String>,
    pub region_name: Option<String>,
    pub region_id: Option<i64>,
    pub cycle_type: Option<String>,
    pub contractor: Option<String>,
    pub total_miles: Option<f64>,
    pub planned_miles: Option<f64>,
    pub percent_complete: Option<f64>,
    pub status: Option<String>,
    pub remote_edited_at: Option<DateTime<Utc>>,
}

/// Persisted circuit. Exclusion fields belong to administrators and are never written by sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Circuit {
    pub id: Uuid,
    pub job_guid: String,
    pub work_order: String,
    pub extension: String,
    pub title: Option<String>,
    pub region_id: Option<i64>,
    pub cycle_type: Option<String>,
    pub contractor: Option<String>,
    pub total_miles: f64,
    pub planned_miles: f64,
    pub percent_complete: f64,
    pub status: Option<String>,
    pub remote_edited_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub is_excluded: bool,
    pub exclusion_reason: Option<String>,
    pub excluded_by: Option<String>,
    pub excluded_at: Option<DateTime<Utc>>,
}

impl Circuit {
    /// Builds a fresh circuit from a mapped row. Requires `job_guid` and `work_order`.
    pub fn from_partial(partial: &PartialCircuit, synced_at: DateTime<Utc>) -> Option<Self> {
        let job_guid = partial.job_guid.clone()?;
        let work_order = partial.work_order.clone()?;
        Some(Self {
            id: Uuid::new_v4(),
            job_guid,
            work_order,
            extension: normalize_extension(partial.extension.as_deref()),
            title: partial.title.clone(),
            region_id: partial.region_id,
            cycle_type: partial.cycle_type.clone(),
            contractor: partial.contractor.clone(),
            total_miles: partial.total_miles.unwrap_or_default(),
            planned_miles: partial.planned_miles.unwrap_or_default(),
            percent_complete: partial.percent_complete.unwrap_or_default(),
            status: partial.status.clone(),
            remote_edited_at: partial.remote_edited_at,
            last_synced_at: Some(synced_at),
            is_excluded: false,
            exclusion_reason: None,
            excluded_by: None,
            excluded_at: None,
        })
    }

    /// Overlays the present fields of `partial`; exclusion state is left untouched.
    pub fn apply_partial(&mut self, partial: &PartialCircuit, synced_at: DateTime<Utc>) {
        if let Some(work_order) = &partial.work_order {
            self.work_order = work_order.clone();
        }
        if partial.extension.is_some() {
            self.extension = normalize_extension(partial.extension.as_deref());
        }
        if partial.title.is_some() {
            self.title = partial.title.clone();
        }
        // A region name that no longer resolves clears the reference.
        if partial.region_name.is_some() || partial.region_id.is_some() {
            self.region_id = partial.region_id;
        }
        if partial.cycle_type.is_some() {
            self.cycle_type = partial.cycle_type.clone();
        }
        if partial.contractor.is_some() {
            self.contractor = partial.contractor.clone();
        }
        if let Some(miles) = partial.total_miles {
            self.total_miles = miles;
        }
        if let Some(miles) = partial.planned_miles {
            self.planned_miles = miles;
        }
        if let Some(percent) = partial.percent_complete {
            self.percent_complete = percent;
        }
        if partial.status.is_some() {
            self.status = partial.status.clone();
        }
        if partial.remote_edited_at.is_some() {
            self.remote_edited_at = partial.remote_edited_at;
        }
        self.last_synced_at = Some(synced_at);
    }

    pub fn display_key(&self) -> String {
        format!("{}-{}", self.work_order, self.extension)
    }

    pub fn is_in_qc(&self) -> bool {
        is_qc_status(self.status.as_deref())
    }
}

/// Outcome of upserting one circuit, with the values it had before this sync.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitUpsert {
    pub circuit: Circuit,
    pub created: bool,
    pub previous_percent_complete: Option<f64>,
    pub previous_status: Option<String>,
}

/// Extension code used when the remote row carries none.
pub const DEFAULT_EXTENSION: &str = "@";

pub fn normalize_extension(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(ext) if !ext.is_empty() => ext.to_string(),
        _ => DEFAULT_EXTENSION.to_string(),
    }
}

pub fn is_qc_status(status: Option<&str>) -> bool {
    status
        .map(|s| s.trim().eq_ignore_ascii_case(QC_STATUS))
        .unwrap_or(false)
}

/// Planned-unit fields as mapped from one remote row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PartialPlannedUnit {
    pub unit_id: Option<String>,
    pub work_order: Option<String>,
    pub extension: Option<String>,
    pub unit_code: Option<String>,
    pub description: Option<String>,
    pub permission_status: Option<String>,
    pub planner: Option<String>,
    pub station: Option<String>,
    pub linear_ft: Option<f64>,
    pub acres: Option<f64>,
    pub trees: Option<f64>,
    pub assessed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl PartialPlannedUnit {
    pub fn permission(&self) -> PermissionStatus {
        PermissionStatus::from_remote(self.permission_status.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Approved,
    Refused,
    Pending,
}

impl PermissionStatus {
    /// Anything that is not explicitly approved or refused counts as pending.
    pub fn from_remote(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("approved") => Self::Approved,
            Some("refused") => Self::Refused,
            _ => Self::Pending,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Refused => "refused",
            Self::Pending => "pending",
        }
    }
}

/// Which measurement a unit code contributes to. Each code maps to exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementKind {
    LinearFt,
    Acres,
    TreeCount,
    None,
}

impl MeasurementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LinearFt => "linear_ft",
            Self::Acres => "acres",
            Self::TreeCount => "tree_count",
            Self::None => "none",
        }
    }
}

/// Per-planner share of one circuit's work.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PlannerShare {
    pub units: i64,
    pub linear_ft: f64,
    pub acres: f64,
    pub trees: f64,
}

/// Measurements computed for one circuit from its planned units.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregateData {
    pub total_units: i64,
    pub total_linear_ft: f64,
    pub total_acres: f64,
    pub total_trees: f64,
    pub units_approved: i64,
    pub units_refused: i64,
    pub units_pending: i64,
    pub unit_counts_by_type: BTreeMap<String, i64>,
    pub linear_ft_by_type: BTreeMap<String, f64>,
    pub acres_by_type: BTreeMap<String, f64>,
    pub trees_by_type: BTreeMap<String, f64>,
    pub planner_distribution: BTreeMap<String, PlannerShare>,
    pub error: Option<String>,
}

impl AggregateData {
    /// Placeholder stored for a circuit whose calculation failed.
    pub fn empty_with_error(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitAggregate {
    pub circuit_id: Uuid,
    pub region_id: Option<i64>,
    pub aggregate_date: NaiveDate,
    pub is_rollup: bool,
    #[serde(flatten)]
    pub data: AggregateData,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CircuitAggregate {
    pub fn daily(circuit: &Circuit, aggregate_date: NaiveDate, data: AggregateData) -> Self {
        let now = Utc::now();
        Self {
            circuit_id: circuit.id,
            region_id: circuit.region_id,
            aggregate_date,
            is_rollup: false,
            data,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Whether an upsert inserted a new row or rewrote an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodType {
    Daily,
    Weekly,
}

impl PeriodType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
        }
    }

    /// Key date for the period containing `date`.
    pub fn period_date(self, date: NaiveDate) -> NaiveDate {
        match self {
            Self::Daily => date,
            Self::Weekly => week_ending(date),
        }
    }

    /// First calendar day covered by the period keyed at `period_date`.
    pub fn period_start(self, period_date: NaiveDate) -> NaiveDate {
        match self {
            Self::Daily => period_date,
            Self::Weekly => period_date - Duration::days(6),
        }
    }
}

impl FromStr for PeriodType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            other => Err(UnknownVariant {
                kind: "period type",
                value: other.to_string(),
            }),
        }
    }
}

/// The week-ending day on or after `date`.
pub fn week_ending(date: NaiveDate) -> NaiveDate {
    let current = date.weekday().num_days_from_sunday() as i64;
    let target = WEEK_ENDING_WEEKDAY.num_days_from_sunday() as i64;
    date + Duration::days((target - current).rem_euclid(7))
}

/// Measurement totals shared by planner and regional rollups.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RollupTotals {
    pub circuits: i64,
    pub total_units: i64,
    pub total_linear_ft: f64,
    pub total_acres: f64,
    pub total_trees: f64,
    pub units_approved: i64,
    pub units_refused: i64,
    pub units_pending: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerAggregate {
    pub planner_id: String,
    pub period_type: PeriodType,
    pub period_date: NaiveDate,
    #[serde(flatten)]
    pub totals: RollupTotals,
    pub circuit_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionalAggregate {
    pub region_id: i64,
    pub period_type: PeriodType,
    pub period_date: NaiveDate,
    #[serde(flatten)]
    pub totals: RollupTotals,
    pub planner_count: i64,
    pub unit_counts_by_type: BTreeMap<String, i64>,
}

/// Rows removed by one pruning pass, per aggregate table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PruneCounts {
    pub circuit_aggregates: u64,
    pub planner_aggregates: u64,
    pub regional_aggregates: u64,
}

impl PruneCounts {
    pub fn total(&self) -> u64 {
        self.circuit_aggregates + self.planner_aggregates + self.regional_aggregates
    }
}

/// Why a snapshot was taken. Ordered by precedence when several qualify at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTrigger {
    Scheduled,
    #[serde(rename = "milestone_50")]
    Milestone50,
    #[serde(rename = "milestone_100")]
    Milestone100,
    StatusQc,
    Manual,
}

impl SnapshotTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Milestone50 => "milestone_50",
            Self::Milestone100 => "milestone_100",
            Self::StatusQc => "status_qc",
            Self::Manual => "manual",
        }
    }

    /// Percent-complete threshold for milestone triggers.
    pub fn milestone_threshold(self) -> Option<f64> {
        match self {
            Self::Milestone50 => Some(50.0),
            Self::Milestone100 => Some(100.0),
            _ => None,
        }
    }
}

impl FromStr for SnapshotTrigger {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "milestone_50" => Ok(Self::Milestone50),
            "milestone_100" => Ok(Self::Milestone100),
            "status_qc" => Ok(Self::StatusQc),
            "manual" => Ok(Self::Manual),
            other => Err(UnknownVariant {
                kind: "snapshot trigger",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub job_guid: String,
    pub work_order: String,
    pub extension: String,
    pub title: Option<String>,
    pub status: Option<String>,
    pub percent_complete: f64,
    pub region_id: Option<i64>,
    pub cycle_type: Option<String>,
    pub contractor: Option<String>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub total_units: i64,
    pub total_linear_ft: f64,
    pub total_acres: f64,
    pub total_trees: f64,
    pub by_permission: BTreeMap<String, i64>,
    pub by_type: BTreeMap<String, i64>,
    pub by_station: BTreeMap<String, i64>,
}

/// Compact `{meta, summary, units}` document stored with every snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub meta: SnapshotMeta,
    pub summary: SnapshotSummary,
    pub units: Vec<SnapshotUnit>,
}

/// Immutable point-in-time capture of one circuit's planned units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedUnitsSnapshot {
    pub id: Uuid,
    pub circuit_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub trigger: SnapshotTrigger,
    pub percent_complete: f64,
    pub status: Option<String>,
    pub content_hash: String,
    pub unit_count: i64,
    pub document: SnapshotDocument,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Scheduled,
    Manual,
}

impl SyncTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for SyncTrigger {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "manual" => Ok(Self::Manual),
            other => Err(UnknownVariant {
                kind: "sync trigger",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Running,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownVariant {
                kind: "sync status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncCounters {
    pub circuits_processed: i64,
    pub circuits_created: i64,
    pub circuits_updated: i64,
    pub aggregates_created: i64,
    pub aggregates_updated: i64,
    pub aggregates_failed: i64,
    pub aggregates_changed: i64,
    pub snapshots_created: i64,
    pub planner_aggregates: i64,
    pub regional_aggregates: i64,
}

/// One pipeline invocation. Written once at start and once at finish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLog {
    pub id: Uuid,
    pub trigger: SyncTrigger,
    pub status: SyncStatus,
    pub status_filter: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub counters: SyncCounters,
    pub error_message: Option<String>,
}

impl SyncLog {
    pub fn start(trigger: SyncTrigger, status_filter: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger,
            status: SyncStatus::Running,
            status_filter,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            counters: SyncCounters::default(),
            error_message: None,
        }
    }

    pub fn complete(&mut self, counters: SyncCounters) {
        self.finish(SyncStatus::Completed, counters, None);
    }

    pub fn fail(&mut self, counters: SyncCounters, message: impl Into<String>) {
        self.finish(SyncStatus::Failed, counters, Some(message.into()));
    }

    fn finish(&mut self, status: SyncStatus, counters: SyncCounters, error: Option<String>) {
        let finished_at = Utc::now();
        self.status = status;
        self.counters = counters;
        self.finished_at = Some(finished_at);
        self.duration_ms = Some((finished_at - self.started_at).num_milliseconds());
        self.error_message = error;
    }
}
