//! Region-name resolution behind an explicitly invalidated cache.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use vmsync_core::Region;

/// Region name → id, keyed case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionMap {
    by_name: HashMap<String, i64>,
}

impl RegionMap {
    pub fn from_regions(regions: &[Region]) -> Self {
        Self {
            by_name: regions
                .iter()
                .map(|r| (normalize_region_name(&r.name), r.id))
                .collect(),
        }
    }

    pub fn resolve(&self, name: &str) -> Option<i64> {
        self.by_name.get(&normalize_region_name(name)).copied()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

pub fn normalize_region_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase()
}

/// Holds the current region map until someone calls `invalidate`. There is no
/// time-based expiry; administrative region edits must invalidate explicitly.
pub trait RegionCache: Send + Sync {
    fn get(&self) -> Option<Arc<RegionMap>>;
    fn set(&self, regions: RegionMap) -> Arc<RegionMap>;
    fn invalidate(&self);
}

#[derive(Debug, Default)]
pub struct InMemoryRegionCache {
    slot: RwLock<Option<Arc<RegionMap>>>,
}

impl InMemoryRegionCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RegionCache for InMemoryRegionCache {
    fn get(&self) -> Option<Arc<RegionMap>> {
        self.slot.read().ok().and_then(|slot| slot.clone())
    }

    fn set(&self, regions: RegionMap) -> Arc<RegionMap> {
        let regions = Arc::new(regions);
        if let Ok(mut slot) = self.slot.write() {
            *slot = Some(regions.clone());
        }
        regions
    }

    fn invalidate(&self) {
        if let Ok(mut slot) = self.slot.write() {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regions() -> Vec<Region> {
        vec![
            Region {
                id: 1,
                name: "Central".into(),
            },
            Region {
                id: 2,
                name: "Lake  Shore".into(),
            },
        ]
    }

    #[test]
    fn resolves_names_ignoring_case_and_spacing() {
        let map = RegionMap::from_regions(&regions());
        assert_eq!(map.resolve("central"), Some(1));
        assert_eq!(map.resolve(" LAKE SHORE "), Some(2));
        assert_eq!(map.resolve("Harrisburg"), None);
    }

    #[test]
    fn cache_holds_until_invalidated() {
        let cache = InMemoryRegionCache::new();
        assert!(cache.get().is_none());

        cache.set(RegionMap::from_regions(&regions()));
        assert_eq!(cache.get().expect("cached").len(), 2);

        cache.invalidate();
        assert!(cache.get().is_none());
    }
}
