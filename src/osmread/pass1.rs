use std::io::{Error, Result};
use std::sync::Arc;

use crate::callback::{CallFinish, CancelFlag};
use crate::elements::{encode_location, ReaderElement};
use crate::osmread::location_store::NodeLocationStore;
use crate::osmread::multipolygon_store::MultipolygonWaySet;
use crate::osmread::profile::Profile;
use crate::osmread::relation_index::{RelationInfoTable, WayToRelationIndex};
use crate::osmread::source::ElementBlock;
use crate::osmread::{OtherData, ReadStats, Timings};
use crate::utils::ThreadTimer;

/// The pass-1 indexes built under the single indexer worker, handed
/// back to the reader on finish.
pub struct Pass1Data {
    pub way_rels: WayToRelationIndex,
    pub rel_info: RelationInfoTable,
    pub mp_ways: MultipolygonWaySet,
}

/// Single pass-1 worker: counts elements, records node locations, and
/// builds the relation-side indexes from the Profile's preprocessing.
pub struct Pass1Indexer<P: Profile> {
    profile: Arc<P>,
    locs: Arc<NodeLocationStore>,
    stats: Arc<ReadStats>,
    data: Option<Pass1Data>,
    cancel: CancelFlag,
    err: Option<Error>,
    tm: f64,
}

impl<P: Profile> Pass1Indexer<P> {
    pub fn new(
        profile: Arc<P>,
        locs: Arc<NodeLocationStore>,
        stats: Arc<ReadStats>,
        way_rels: WayToRelationIndex,
        cancel: CancelFlag,
    ) -> Pass1Indexer<P> {
        Pass1Indexer {
            profile: profile,
            locs: locs,
            stats: stats,
            data: Some(Pass1Data {
                way_rels: way_rels,
                rel_info: RelationInfoTable::new(),
                mp_ways: MultipolygonWaySet::new(),
            }),
            cancel: cancel,
            err: None,
            tm: 0.0,
        }
    }

    fn handle_block(&mut self, block: ElementBlock) -> Result<()> {
        let data = self.data.as_mut().expect("indexer already finished");
        for element in block.elements {
            match element {
                ReaderElement::Node(node) => {
                    self.stats.add_node();
                    self.locs.put(node.id, encode_location(node.lon, node.lat))?;
                }
                ReaderElement::Way(_) => {
                    self.stats.add_way();
                }
                ReaderElement::Relation(rel) => {
                    self.stats.add_relation();
                    let infos = self.profile.preprocess_relation(&rel);
                    for info in infos {
                        for m in rel.way_members() {
                            data.way_rels.put(m.mem_ref, rel.id)?;
                        }
                        data.rel_info.put(rel.id, info);
                    }
                    if rel.is_multipolygon() {
                        for m in rel.way_members() {
                            data.mp_ways.add(m.mem_ref);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl<P: Profile> CallFinish for Pass1Indexer<P> {
    type CallType = ElementBlock;
    type ReturnType = Timings;

    fn call(&mut self, block: ElementBlock) {
        if self.err.is_some() {
            return;
        }
        let tx = ThreadTimer::new();
        match self.handle_block(block) {
            Ok(()) => {}
            Err(e) => {
                self.err = Some(e);
                self.cancel.cancel();
            }
        }
        self.tm += tx.since();
    }

    fn finish(&mut self) -> Result<Timings> {
        if let Some(e) = self.err.take() {
            return Err(e);
        }
        let mut data = self.data.take().expect("indexer already finished");
        data.way_rels.seal()?;

        let mut t = Timings::new();
        t.add("pass1 index", self.tm);
        t.add_other("pass1", OtherData::Pass1Data(Box::new(data)));
        Ok(t)
    }
}
