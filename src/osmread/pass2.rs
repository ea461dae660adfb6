use std::io::{Error, Result};
use std::sync::{Arc, Condvar, Mutex};

use crate::callback::{CallFinish, CancelFlag, SinkHandle};
use crate::elements::{encode_location, ReaderElement, Relation, Way, MISSING_LOCATION};
use crate::featuresort::ExternalMergeSort;
use crate::osmread::features::{assemble_rings, SourceFeature};
use crate::osmread::profile::{FeatureRenderer, Profile, RenderedFeature};
use crate::osmread::source::ElementBlock;
use crate::osmread::{OtherData, ReadStats, SealedIndexes, Timings};
use crate::utils::ThreadTimer;

/// One-shot latch holding relations back until every pass-2 worker has
/// finished its ways. A worker arrives when it dequeues its first
/// relation; a worker that never sees one departs on shutdown.
pub struct WaysDoneLatch {
    count: Mutex<usize>,
    cond: Condvar,
}

impl WaysDoneLatch {
    pub fn new(workers: usize) -> WaysDoneLatch {
        WaysDoneLatch {
            count: Mutex::new(workers),
            cond: Condvar::new(),
        }
    }

    pub fn arrive_and_wait(&self) {
        let mut count = self.count.lock().unwrap();
        assert!(*count > 0, "latch reused");
        *count -= 1;
        if *count == 0 {
            self.cond.notify_all();
        } else {
            while *count > 0 {
                count = self.cond.wait(count).unwrap();
            }
        }
    }

    pub fn depart(&self) {
        let mut count = self.count.lock().unwrap();
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.cond.notify_all();
            }
        }
    }
}

/// Pass-2 worker: reconstructs source features, runs the Profile and
/// renderer, and pushes rendered features to the sink.
pub struct Pass2Worker<P: Profile> {
    profile: Arc<P>,
    renderer: Arc<dyn FeatureRenderer<P::Renderable>>,
    indexes: Arc<SealedIndexes>,
    latch: Arc<WaysDoneLatch>,
    stats: Arc<ReadStats>,
    out: SinkHandle<Vec<RenderedFeature>>,
    seen_relation: bool,
    renderables: Vec<P::Renderable>,
    tm: f64,
}

impl<P: Profile> Pass2Worker<P> {
    pub fn new(
        profile: Arc<P>,
        renderer: Arc<dyn FeatureRenderer<P::Renderable>>,
        indexes: Arc<SealedIndexes>,
        latch: Arc<WaysDoneLatch>,
        stats: Arc<ReadStats>,
        out: SinkHandle<Vec<RenderedFeature>>,
    ) -> Pass2Worker<P> {
        Pass2Worker {
            profile: profile,
            renderer: renderer,
            indexes: indexes,
            latch: latch,
            stats: stats,
            out: out,
            seen_relation: false,
            renderables: Vec::new(),
            tm: 0.0,
        }
    }

    fn way_feature(&self, way: Way) -> Option<SourceFeature> {
        let mut geom = Vec::with_capacity(way.refs.len());
        for r in &way.refs {
            let loc = self.indexes.locs.get(*r);
            if loc == MISSING_LOCATION {
                self.stats.add_missing_node();
            } else {
                geom.push(loc);
            }
        }

        if self.indexes.mp_ways.contains(way.id) {
            self.indexes.mp_geoms.put(way.id, geom.clone());
        }

        if geom.len() < 2 {
            return None;
        }

        let mut relations = Vec::new();
        for rel_id in self.indexes.way_rels.get(way.id) {
            for info in self.indexes.rel_info.get(rel_id) {
                relations.push((rel_id, info.clone()));
            }
        }

        Some(SourceFeature::Way {
            id: way.id,
            tags: way.tags,
            geom: geom,
            relations: relations,
        })
    }

    fn relation_feature(&self, rel: Relation) -> Option<SourceFeature> {
        if !rel.is_multipolygon() {
            return None;
        }
        let mut parts = Vec::new();
        for m in rel.way_members() {
            match self.indexes.mp_geoms.get(m.mem_ref) {
                Some(locs) => {
                    parts.push(locs);
                }
                None => {
                    self.stats.add_missing_way();
                }
            }
        }
        let (rings, dropped) = assemble_rings(parts);
        self.stats.add_dropped_rings(dropped);
        if rings.is_empty() {
            return None;
        }
        Some(SourceFeature::Multipolygon {
            id: rel.id,
            tags: rel.tags,
            rings: rings,
        })
    }

    fn handle_block(&mut self, block: ElementBlock) {
        for element in block.elements {
            let feature = match element {
                ReaderElement::Node(node) => {
                    self.stats.add_node_processed();
                    Some(SourceFeature::Node {
                        id: node.id,
                        loc: encode_location(node.lon, node.lat),
                        tags: node.tags,
                    })
                }
                ReaderElement::Way(way) => {
                    self.stats.add_way_processed();
                    self.way_feature(way)
                }
                ReaderElement::Relation(rel) => {
                    if !self.seen_relation {
                        self.seen_relation = true;
                        self.latch.arrive_and_wait();
                    }
                    self.stats.add_relation_processed();
                    self.relation_feature(rel)
                }
            };

            if let Some(feature) = feature {
                self.renderables.clear();
                self.profile.process_feature(&feature, &mut self.renderables);

                let mut rendered = Vec::new();
                for renderable in self.renderables.drain(..) {
                    self.renderer.render(renderable, &mut rendered);
                }
                if !rendered.is_empty() {
                    self.out.call(rendered);
                }
            }
        }
    }
}

impl<P: Profile> CallFinish for Pass2Worker<P> {
    type CallType = ElementBlock;
    type ReturnType = Timings;

    fn call(&mut self, block: ElementBlock) {
        let tx = ThreadTimer::new();
        self.handle_block(block);
        self.tm += tx.since();
    }

    fn finish(&mut self) -> Result<Timings> {
        if !self.seen_relation {
            self.seen_relation = true;
            self.latch.depart();
        }
        self.out.finish()?;

        let mut t = Timings::new();
        t.add("pass2 process", self.tm);
        Ok(t)
    }
}

/// Single sink feeding the external sort; owns the sorter for the
/// duration of the pass and returns it on finish.
pub struct FeatureSink {
    sorter: Option<ExternalMergeSort>,
    cancel: CancelFlag,
    err: Option<Error>,
    stats: Arc<ReadStats>,
    tm: f64,
}

impl FeatureSink {
    pub fn new(sorter: ExternalMergeSort, stats: Arc<ReadStats>, cancel: CancelFlag) -> FeatureSink {
        FeatureSink {
            sorter: Some(sorter),
            cancel: cancel,
            err: None,
            stats: stats,
            tm: 0.0,
        }
    }
}

impl CallFinish for FeatureSink {
    type CallType = Vec<RenderedFeature>;
    type ReturnType = Timings;

    fn call(&mut self, features: Vec<RenderedFeature>) {
        if self.err.is_some() {
            return;
        }
        let tx = ThreadTimer::new();
        let sorter = self.sorter.as_mut().expect("sink already finished");
        for f in features {
            match sorter.add(f) {
                Ok(()) => {
                    self.stats.add_feature_written();
                }
                Err(e) => {
                    self.err = Some(e);
                    self.cancel.cancel();
                    break;
                }
            }
        }
        self.tm += tx.since();
    }

    fn finish(&mut self) -> Result<Timings> {
        if let Some(e) = self.err.take() {
            return Err(e);
        }
        let sorter = self.sorter.take().expect("sink already finished");

        let mut t = Timings::new();
        t.add("pass2 write", self.tm);
        t.add_other("sorter", OtherData::FeatureSorter(Box::new(sorter)));
        Ok(t)
    }
}

#[cfg(test)]
mod tests {
    use super::WaysDoneLatch;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_latch_opens_when_all_arrive() {
        let latch = Arc::new(WaysDoneLatch::new(3));
        let passed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let l = latch.clone();
            let p = passed.clone();
            handles.push(std::thread::spawn(move || {
                l.arrive_and_wait();
                p.fetch_add(1, Ordering::SeqCst);
            }));
        }

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(passed.load(Ordering::SeqCst), 0);

        // the third participant never sees a relation, departs instead
        latch.depart();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(passed.load(Ordering::SeqCst), 2);
    }
}
