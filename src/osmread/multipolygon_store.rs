use std::sync::Mutex;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::elements::PackedLocation;

/// Way ids participating in any multipolygon relation. Built by the
/// single pass-1 indexer, read-only in pass 2.
pub struct MultipolygonWaySet {
    ids: FxHashSet<i64>,
}

impl MultipolygonWaySet {
    pub fn new() -> MultipolygonWaySet {
        MultipolygonWaySet {
            ids: FxHashSet::default(),
        }
    }

    pub fn add(&mut self, way_id: i64) {
        self.ids.insert(way_id);
    }

    pub fn contains(&self, way_id: i64) -> bool {
        self.ids.contains(&way_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

const GEOM_SHARDS: usize = 16;

/// `way_id -> node locations along the way`, populated concurrently by
/// pass-2 workers as they meet multipolygon ways, read once the
/// ways-done latch has opened. OSM carries each way once, so no two
/// workers put the same key.
pub struct MultipolygonWayGeometry {
    shards: Vec<Mutex<FxHashMap<i64, Vec<PackedLocation>>>>,
}

impl MultipolygonWayGeometry {
    pub fn new() -> MultipolygonWayGeometry {
        let mut shards = Vec::with_capacity(GEOM_SHARDS);
        for _ in 0..GEOM_SHARDS {
            shards.push(Mutex::new(FxHashMap::default()));
        }
        MultipolygonWayGeometry { shards: shards }
    }

    fn shard(&self, way_id: i64) -> &Mutex<FxHashMap<i64, Vec<PackedLocation>>> {
        &self.shards[(way_id as u64 as usize) & (GEOM_SHARDS - 1)]
    }

    pub fn put(&self, way_id: i64, locs: Vec<PackedLocation>) {
        let prev = self.shard(way_id).lock().unwrap().insert(way_id, locs);
        debug_assert!(prev.is_none(), "way {} materialized twice", way_id);
    }

    pub fn get(&self, way_id: i64) -> Option<Vec<PackedLocation>> {
        self.shard(way_id).lock().unwrap().get(&way_id).cloned()
    }

    pub fn has(&self, way_id: i64) -> bool {
        self.shard(way_id).lock().unwrap().contains_key(&way_id)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }
}
