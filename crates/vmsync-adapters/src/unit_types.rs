//! Unit-code → measurement-kind lookup, built in or loaded from YAML.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use vmsync_core::MeasurementKind;

const BUILTIN_UNIT_TYPES: &[(&str, MeasurementKind)] = &[
    ("SPM", MeasurementKind::LinearFt),
    ("SPB", MeasurementKind::LinearFt),
    ("MPM", MeasurementKind::LinearFt),
    ("MPB", MeasurementKind::LinearFt),
    ("SIDET", MeasurementKind::LinearFt),
    ("HCB", MeasurementKind::Acres),
    ("MOW", MeasurementKind::Acres),
    ("HERBA", MeasurementKind::Acres),
    ("BRUSH", MeasurementKind::Acres),
    ("REM612", MeasurementKind::TreeCount),
    ("REM1218", MeasurementKind::TreeCount),
    ("REM1824", MeasurementKind::TreeCount),
    ("REM2430", MeasurementKind::TreeCount),
    ("REM3036", MeasurementKind::TreeCount),
    ("VPS", MeasurementKind::TreeCount),
    ("TRIM", MeasurementKind::TreeCount),
    ("NW", MeasurementKind::None),
    ("NOT", MeasurementKind::None),
    ("SENSI", MeasurementKind::None),
];

#[derive(Debug, Clone, Deserialize)]
struct UnitTypesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    unit_types: Vec<UnitTypeRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct UnitTypeRule {
    code: String,
    kind: MeasurementKind,
    #[allow(dead_code)]
    #[serde(default)]
    description: Option<String>,
}

/// Each unit code belongs to exactly one measurement kind; unknown codes measure nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitTypeTable {
    kinds: HashMap<String, MeasurementKind>,
}

impl Default for UnitTypeTable {
    fn default() -> Self {
        Self {
            kinds: BUILTIN_UNIT_TYPES
                .iter()
                .map(|(code, kind)| (code.to_string(), *kind))
                .collect(),
        }
    }
}

impl UnitTypeTable {
    pub fn kind_for(&self, unit_code: &str) -> MeasurementKind {
        self.kinds
            .get(&unit_code.trim().to_ascii_uppercase())
            .copied()
            .unwrap_or(MeasurementKind::None)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: UnitTypesFile = serde_yaml::from_str(text).context("parsing unit types yaml")?;
        let mut kinds = HashMap::new();
        for rule in file.unit_types {
            let code = rule.code.trim().to_ascii_uppercase();
            if let Some(previous) = kinds.insert(code.clone(), rule.kind) {
                if previous != rule.kind {
                    bail!(
                        "unit code {code} mapped to both {} and {}",
                        previous.as_str(),
                        rule.kind.as_str()
                    );
                }
            }
        }
        Ok(Self { kinds })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}
