//! Sync & aggregation pipeline: remote rows in, aggregates and snapshots out.

pub mod aggregate;
pub mod config;
pub mod diff;
mod pipeline;
pub mod queries;
pub mod snapshot;
pub mod sources;

pub use aggregate::{
    calculate_for_planner, calculate_for_region, compute_aggregate, AggregateCalculator,
    CircuitCalculation, CircuitCalculationError,
};
pub use config::SyncConfig;
pub use diff::{compare, AggregateComparison, AggregateStorage, BatchSaveReport};
pub use pipeline::{build_remote_client, load_unit_types, run_sync_once_from_env, SyncPipeline};
pub use queries::{RemoteQueries, WorkStudioQueries};
pub use snapshot::{generate_hash, normalize_units, SnapshotEngine};
pub use sources::{CircuitSource, PlannedUnitSource, RemoteSource};

pub const CRATE_NAME: &str = "vmsync-sync";
