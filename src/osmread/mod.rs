mod features;
mod location_store;
mod multipolygon_store;
mod pass1;
mod pass2;
mod profile;
mod relation_index;
mod source;

use std::io::{Error, ErrorKind, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub use features::{assemble_rings, SourceFeature};
pub use location_store::{NodeLocationStore, NODE_TILE_SHIFT, NODE_TILE_SIZE};
pub use multipolygon_store::{MultipolygonWayGeometry, MultipolygonWaySet};
pub use pass1::{Pass1Data, Pass1Indexer};
pub use pass2::{FeatureSink, Pass2Worker, WaysDoneLatch};
pub use profile::{FeatureRenderer, Profile, RelationInfo, RenderedFeature};
pub use relation_index::{RelationInfoTable, WayToRelationIndex};
pub use source::{ElementBlock, ElementSource, VecSource};

use crate::callback::{CallFinish, Callback, CallbackPool, CancelFlag, MergeTimings};
use crate::featuresort::ExternalMergeSort;
use crate::message;
use crate::utils::Checktime;

pub enum OtherData {
    Pass1Data(Box<Pass1Data>),
    FeatureSorter(Box<ExternalMergeSort>),
}

pub type Timings = crate::utils::Timings<OtherData>;

/// Shared element counters, observed by progress logging; never a
/// source of truth.
pub struct ReadStats {
    nodes: AtomicI64,
    ways: AtomicI64,
    relations: AtomicI64,
    nodes_processed: AtomicI64,
    ways_processed: AtomicI64,
    relations_processed: AtomicI64,
    features_written: AtomicI64,
    missing_nodes: AtomicI64,
    missing_ways: AtomicI64,
    dropped_rings: AtomicI64,
}

impl ReadStats {
    pub fn new() -> ReadStats {
        ReadStats {
            nodes: AtomicI64::new(0),
            ways: AtomicI64::new(0),
            relations: AtomicI64::new(0),
            nodes_processed: AtomicI64::new(0),
            ways_processed: AtomicI64::new(0),
            relations_processed: AtomicI64::new(0),
            features_written: AtomicI64::new(0),
            missing_nodes: AtomicI64::new(0),
            missing_ways: AtomicI64::new(0),
            dropped_rings: AtomicI64::new(0),
        }
    }

    pub fn add_node(&self) {
        self.nodes.fetch_add(1, Ordering::Relaxed);
    }
    pub fn add_way(&self) {
        self.ways.fetch_add(1, Ordering::Relaxed);
    }
    pub fn add_relation(&self) {
        self.relations.fetch_add(1, Ordering::Relaxed);
    }
    pub fn add_node_processed(&self) {
        self.nodes_processed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn add_way_processed(&self) {
        self.ways_processed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn add_relation_processed(&self) {
        self.relations_processed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn add_feature_written(&self) {
        self.features_written.fetch_add(1, Ordering::Relaxed);
    }
    pub fn add_missing_node(&self) {
        self.missing_nodes.fetch_add(1, Ordering::Relaxed);
    }
    pub fn add_missing_way(&self) {
        self.missing_ways.fetch_add(1, Ordering::Relaxed);
    }
    pub fn add_dropped_rings(&self, count: usize) {
        self.dropped_rings.fetch_add(count as i64, Ordering::Relaxed);
    }

    pub fn nodes(&self) -> i64 {
        self.nodes.load(Ordering::Relaxed)
    }
    pub fn ways(&self) -> i64 {
        self.ways.load(Ordering::Relaxed)
    }
    pub fn relations(&self) -> i64 {
        self.relations.load(Ordering::Relaxed)
    }
    pub fn nodes_processed(&self) -> i64 {
        self.nodes_processed.load(Ordering::Relaxed)
    }
    pub fn ways_processed(&self) -> i64 {
        self.ways_processed.load(Ordering::Relaxed)
    }
    pub fn relations_processed(&self) -> i64 {
        self.relations_processed.load(Ordering::Relaxed)
    }
    pub fn features_written(&self) -> i64 {
        self.features_written.load(Ordering::Relaxed)
    }
    pub fn missing_nodes(&self) -> i64 {
        self.missing_nodes.load(Ordering::Relaxed)
    }
    pub fn missing_ways(&self) -> i64 {
        self.missing_ways.load(Ordering::Relaxed)
    }
    pub fn dropped_rings(&self) -> i64 {
        self.dropped_rings.load(Ordering::Relaxed)
    }
}

/// The pass-1 indexes once sealed, shared read-only with pass-2 workers
/// (the multipolygon geometries are the one store still written during
/// pass 2, behind its own shard locks).
pub struct SealedIndexes {
    pub locs: Arc<NodeLocationStore>,
    pub way_rels: WayToRelationIndex,
    pub rel_info: RelationInfoTable,
    pub mp_ways: MultipolygonWaySet,
    pub mp_geoms: MultipolygonWayGeometry,
}

#[derive(Clone)]
pub struct ReaderConfig {
    pub temp_dir: PathBuf,
    pub process_threads: usize,
    pub queue_size: usize,
    pub way_relation_spill_bytes: usize,
}

impl ReaderConfig {
    pub fn new(temp_dir: &Path, process_threads: usize) -> ReaderConfig {
        ReaderConfig {
            temp_dir: PathBuf::from(temp_dir),
            process_threads: process_threads,
            queue_size: 32,
            way_relation_spill_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Digests an OSM extract in two passes: pass 1 builds the out-of-core
/// indexes, pass 2 reconstructs feature geometries, runs the Profile
/// and streams rendered features into the external sort.
pub struct OsmTwoPassReader<P: Profile> {
    profile: Arc<P>,
    config: ReaderConfig,
    stats: Arc<ReadStats>,
    locs: Arc<NodeLocationStore>,
    indexes: Option<Arc<SealedIndexes>>,
}

impl<P: Profile> OsmTwoPassReader<P> {
    pub fn new(profile: Arc<P>, config: ReaderConfig) -> Result<OsmTwoPassReader<P>> {
        if config.process_threads == 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "need at least one process thread",
            ));
        }
        std::fs::create_dir_all(&config.temp_dir)?;
        let locs = Arc::new(NodeLocationStore::new(
            &config.temp_dir.join("node-locs.dat"),
        )?);

        Ok(OsmTwoPassReader {
            profile: profile,
            config: config,
            stats: Arc::new(ReadStats::new()),
            locs: locs,
            indexes: None,
        })
    }

    pub fn stats(&self) -> Arc<ReadStats> {
        self.stats.clone()
    }

    pub fn pass1(&mut self, source: &mut dyn ElementSource) -> Result<()> {
        assert!(self.indexes.is_none(), "pass1 called twice");

        let cancel = CancelFlag::new();
        let way_rels = WayToRelationIndex::new(
            &self.config.temp_dir.join("way-rels.spill"),
            self.config.way_relation_spill_bytes,
        );
        let indexer = Pass1Indexer::new(
            self.profile.clone(),
            self.locs.clone(),
            self.stats.clone(),
            way_rels,
            cancel.clone(),
        );
        let mut cb = Callback::with_capacity(Box::new(indexer), self.config.queue_size);

        let drive_res = drive_source(source, &mut cb, &cancel, "osm pass 1");
        let t = cb.finish();
        drive_res?;
        let t = t?;

        let mut data: Option<Box<Pass1Data>> = None;
        for (_, o) in t.others {
            match o {
                OtherData::Pass1Data(d) => {
                    data = Some(d);
                }
                _ => {}
            }
        }
        let data = *data.expect("pass 1 returned no indexes");

        self.locs.seal()?;

        message!(
            "pass 1: {} nodes, {} ways, {} relations; {} way/relation refs, {} relation infos [{} bytes], {} multipolygon ways, node locations {} bytes on disk",
            self.stats.nodes(),
            self.stats.ways(),
            self.stats.relations(),
            data.way_rels.len(),
            data.rel_info.len(),
            data.rel_info.total_bytes(),
            data.mp_ways.len(),
            self.locs.file_bytes()
        );

        self.indexes = Some(Arc::new(SealedIndexes {
            locs: self.locs.clone(),
            way_rels: data.way_rels,
            rel_info: data.rel_info,
            mp_ways: data.mp_ways,
            mp_geoms: MultipolygonWayGeometry::new(),
        }));
        Ok(())
    }

    pub fn pass2(
        &mut self,
        source: &mut dyn ElementSource,
        renderer: Arc<dyn FeatureRenderer<P::Renderable>>,
        sorter: ExternalMergeSort,
    ) -> Result<ExternalMergeSort> {
        let indexes = self.indexes.clone().expect("pass2 before pass1");

        let cancel = CancelFlag::new();
        let latch = Arc::new(WaysDoneLatch::new(self.config.process_threads));

        let mut sink = Callback::with_capacity(
            Box::new(FeatureSink::new(sorter, self.stats.clone(), cancel.clone())),
            self.config.queue_size,
        );

        let mut workers: Vec<Box<dyn CallFinish<CallType = ElementBlock, ReturnType = Timings>>> =
            Vec::new();
        for _ in 0..self.config.process_threads {
            workers.push(Box::new(Pass2Worker::new(
                self.profile.clone(),
                renderer.clone(),
                indexes.clone(),
                latch.clone(),
                self.stats.clone(),
                sink.sink_handle(),
            )));
        }
        let mut pool = CallbackPool::with_cancel(
            workers,
            self.config.queue_size,
            Box::new(MergeTimings::new()),
            cancel.clone(),
        );

        let drive_res = drive_source(source, &mut pool, &cancel, "osm pass 2");
        let pool_res = pool.finish();
        let sink_res = sink.finish();

        drive_res?;
        // a sink failure cancels the pool, whose workers then report
        // Interrupted; surface the sink's own error in that case
        let t = match (pool_res, sink_res) {
            (Ok(t), Ok(t2)) => {
                let mut t = t;
                t.combine(t2);
                t
            }
            (Err(pe), Err(se)) => {
                if pe.kind() == ErrorKind::Interrupted {
                    return Err(se);
                }
                return Err(pe);
            }
            (Err(pe), Ok(_)) => {
                return Err(pe);
            }
            (Ok(_), Err(se)) => {
                return Err(se);
            }
        };

        let mut sorter: Option<Box<ExternalMergeSort>> = None;
        for (_, o) in t.others {
            match o {
                OtherData::FeatureSorter(s) => {
                    sorter = Some(s);
                }
                _ => {}
            }
        }
        let sorter = *sorter.expect("pass 2 returned no sorter");

        message!(
            "pass 2: {} nodes, {} ways, {} relations processed, {} features written [{} bytes]; {} missing nodes, {} missing ways, {} dropped rings",
            self.stats.nodes_processed(),
            self.stats.ways_processed(),
            self.stats.relations_processed(),
            self.stats.features_written(),
            sorter.storage_bytes(),
            self.stats.missing_nodes(),
            self.stats.missing_ways(),
            self.stats.dropped_rings()
        );

        Ok(sorter)
    }

    /// Releases the pass indexes and removes the reader's temp files.
    pub fn close(self) -> Result<()> {
        drop(self.indexes);
        self.locs.remove_file()?;
        let _ = std::fs::remove_dir(&self.config.temp_dir);
        Ok(())
    }
}

fn drive_source<T>(
    source: &mut dyn ElementSource,
    out: &mut T,
    cancel: &CancelFlag,
    msg: &str,
) -> Result<()>
where
    T: CallFinish<CallType = ElementBlock, ReturnType = Timings>,
{
    let total = source.total_bytes();
    let pg = if total > 0 {
        Some(crate::progress_bytes!(msg, total))
    } else {
        None
    };
    let mut ct = Checktime::new();

    loop {
        if cancel.is_cancelled() {
            break;
        }
        match source.next_block()? {
            Some(block) => {
                if let Some(pg) = &pg {
                    if ct.checktime().is_some() {
                        pg.progress_bytes(source.position_bytes());
                    }
                }
                out.call(block);
            }
            None => {
                break;
            }
        }
    }
    if let Some(pg) = pg {
        pg.finish();
    }
    Ok(())
}
