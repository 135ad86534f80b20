//! Response and domain transformers turning remote payloads into vmsync records.

pub mod dates;
pub mod domain;
pub mod regions;
pub mod response;
pub mod unit_types;

pub use dates::{parse_remote_date, parse_remote_date_value};
pub use domain::{transform_circuit, transform_planned_unit, transform_planned_units};
pub use regions::{InMemoryRegionCache, RegionCache, RegionMap};
pub use response::{strip_control_chars, ResponseTransformer};
pub use unit_types::UnitTypeTable;

pub const CRATE_NAME: &str = "vmsync-adapters";
