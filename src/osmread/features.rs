use std::sync::Arc;

use crate::elements::{PackedLocation, Tag};
use crate::osmread::profile::RelationInfo;

/// A reconstructed feature handed to the Profile; lives for one worker
/// loop iteration.
#[derive(Debug)]
pub enum SourceFeature {
    Node {
        id: i64,
        loc: PackedLocation,
        tags: Vec<Tag>,
    },
    Way {
        id: i64,
        tags: Vec<Tag>,
        geom: Vec<PackedLocation>,
        /// Relations this way is a member of, via the pass-1 index.
        relations: Vec<(i64, Arc<RelationInfo>)>,
    },
    Multipolygon {
        id: i64,
        tags: Vec<Tag>,
        rings: Vec<Vec<PackedLocation>>,
    },
}

impl SourceFeature {
    pub fn get_id(&self) -> i64 {
        match self {
            SourceFeature::Node { id, .. } => *id,
            SourceFeature::Way { id, .. } => *id,
            SourceFeature::Multipolygon { id, .. } => *id,
        }
    }
}

/// Stitches member way geometries into closed rings by matching
/// endpoints, reversing segments as needed. Rings are returned without
/// the repeated closing vertex. Segments that cannot be closed are
/// dropped; the count of abandoned rings is returned alongside.
pub fn assemble_rings(parts: Vec<Vec<PackedLocation>>) -> (Vec<Vec<PackedLocation>>, usize) {
    let mut rings = Vec::new();
    let mut dropped = 0;

    let mut remaining: Vec<Vec<PackedLocation>> = Vec::with_capacity(parts.len());
    for p in parts {
        if p.len() >= 2 {
            remaining.push(p);
        } else {
            dropped += 1;
        }
    }

    while let Some(mut ring) = remaining.pop() {
        loop {
            if ring.len() >= 4 && ring.first() == ring.last() {
                ring.pop();
                rings.push(ring);
                break;
            }
            let last = *ring.last().expect("?");
            match remaining
                .iter()
                .position(|p| *p.first().expect("?") == last || *p.last().expect("?") == last)
            {
                Some(i) => {
                    let mut p = remaining.swap_remove(i);
                    if *p.last().expect("?") == last {
                        p.reverse();
                    }
                    ring.extend_from_slice(&p[1..]);
                }
                None => {
                    dropped += 1;
                    break;
                }
            }
        }
    }

    (rings, dropped)
}
