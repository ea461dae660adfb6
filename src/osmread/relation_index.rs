use std::fs::File;
use std::io::{BufWriter, Error, ErrorKind, Read, Result, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use rustc_hash::FxHashMap;

use crate::binpack;
use crate::osmread::profile::RelationInfo;

const PAIR_BYTES: usize = 16;

/// `way_id -> relation ids` built append-only during pass 1, queried
/// read-only in pass 2. Pairs buffer in memory and spill to disk as
/// delta-packed zlib blocks above the configured threshold; sealing
/// loads everything back and keeps one sorted pair table for binary
/// search.
pub struct WayToRelationIndex {
    spill_path: PathBuf,
    spill_bytes: usize,
    spill_out: Option<BufWriter<File>>,
    spilled_pairs: usize,
    pending: Vec<(i64, i64)>,
    sorted: Option<Vec<(i64, i64)>>,
}

impl WayToRelationIndex {
    pub fn new(spill_path: &Path, spill_bytes: usize) -> WayToRelationIndex {
        WayToRelationIndex {
            spill_path: PathBuf::from(spill_path),
            spill_bytes: spill_bytes,
            spill_out: None,
            spilled_pairs: 0,
            pending: Vec::new(),
            sorted: None,
        }
    }

    pub fn put(&mut self, way_id: i64, relation_id: i64) -> Result<()> {
        assert!(self.sorted.is_none(), "put after seal");
        self.pending.push((way_id, relation_id));
        if self.pending.len() * PAIR_BYTES > self.spill_bytes {
            self.spill_pending()?;
        }
        Ok(())
    }

    fn spill_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut batch = std::mem::take(&mut self.pending);
        batch.sort_unstable();
        let block = pack_pair_block(&batch)?;

        if self.spill_out.is_none() {
            self.spill_out = Some(BufWriter::with_capacity(
                64 * 1024,
                File::create(&self.spill_path)?,
            ));
        }
        let out = self.spill_out.as_mut().expect("?");
        out.write_all(&(block.len() as u32).to_be_bytes())?;
        out.write_all(&block)?;
        self.spilled_pairs += batch.len();
        Ok(())
    }

    pub fn seal(&mut self) -> Result<()> {
        assert!(self.sorted.is_none(), "seal called twice");
        let mut all = std::mem::take(&mut self.pending);

        if let Some(mut out) = self.spill_out.take() {
            out.flush()?;
            drop(out);

            all.reserve(self.spilled_pairs);
            let mut data = Vec::new();
            File::open(&self.spill_path)?.read_to_end(&mut data)?;
            let mut pos = 0;
            while pos < data.len() {
                if pos + 4 > data.len() {
                    return Err(Error::new(
                        ErrorKind::UnexpectedEof,
                        "truncated spill block header",
                    ));
                }
                let len = u32::from_be_bytes(data[pos..pos + 4].try_into().expect("?")) as usize;
                pos += 4;
                if pos + len > data.len() {
                    return Err(Error::new(
                        ErrorKind::UnexpectedEof,
                        "truncated spill block",
                    ));
                }
                unpack_pair_block(&data[pos..pos + len], &mut all)?;
                pos += len;
            }
            std::fs::remove_file(&self.spill_path)?;
        }

        all.sort_unstable();
        self.sorted = Some(all);
        Ok(())
    }

    /// Relation ids for a way, in ascending order, duplicates kept.
    pub fn get(&self, way_id: i64) -> impl Iterator<Item = i64> + '_ {
        let sorted = self.sorted.as_ref().expect("get before seal");
        let start = sorted.partition_point(|(w, _)| *w < way_id);
        sorted[start..]
            .iter()
            .take_while(move |(w, _)| *w == way_id)
            .map(|(_, r)| *r)
    }

    pub fn len(&self) -> usize {
        match &self.sorted {
            Some(s) => s.len(),
            None => self.pending.len() + self.spilled_pairs,
        }
    }
}

fn pack_pair_block(pairs: &[(i64, i64)]) -> Result<Vec<u8>> {
    let ways = binpack::pack_delta_int(pairs.iter().map(|(w, _)| *w));
    let rels = binpack::pack_delta_int(pairs.iter().map(|(_, r)| *r));

    let mut raw = Vec::with_capacity(20 + ways.len() + rels.len());
    binpack::write_varint(&mut raw, pairs.len() as u64);
    binpack::write_varint(&mut raw, ways.len() as u64);
    raw.extend(ways);
    raw.extend(rels);

    let mut enc = ZlibEncoder::new(Vec::new(), flate2::Compression::new(6));
    enc.write_all(&raw)?;
    enc.finish()
}

fn unpack_pair_block(block: &[u8], out: &mut Vec<(i64, i64)>) -> Result<()> {
    let mut raw = Vec::new();
    ZlibDecoder::new(block).read_to_end(&mut raw)?;

    let (count, pos) = binpack::read_varint(&raw, 0)?;
    let (wlen, pos) = binpack::read_varint(&raw, pos)?;
    let wend = pos + (wlen as usize);
    if wend > raw.len() {
        return Err(Error::new(ErrorKind::InvalidData, "bad spill block lengths"));
    }
    let ways = binpack::read_delta_packed_int(&raw[pos..wend]);
    let rels = binpack::read_delta_packed_int(&raw[wend..]);
    if ways.len() != count as usize || rels.len() != count as usize {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!(
                "spill block holds {} ways / {} rels, expected {}",
                ways.len(),
                rels.len(),
                count
            ),
        ));
    }
    out.extend(ways.into_iter().zip(rels));
    Ok(())
}

/// `relation_id -> preprocessed relation summaries`, with a running
/// account of their retained bytes.
pub struct RelationInfoTable {
    infos: FxHashMap<i64, Vec<Arc<RelationInfo>>>,
    total_bytes: usize,
}

impl RelationInfoTable {
    pub fn new() -> RelationInfoTable {
        RelationInfoTable {
            infos: FxHashMap::default(),
            total_bytes: 0,
        }
    }

    pub fn put(&mut self, relation_id: i64, info: RelationInfo) {
        self.total_bytes += info.size_bytes();
        self.infos
            .entry(relation_id)
            .or_insert_with(Vec::new)
            .push(Arc::new(info));
    }

    pub fn get(&self, relation_id: i64) -> &[Arc<RelationInfo>] {
        match self.infos.get(&relation_id) {
            Some(v) => v,
            None => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_seal_get() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut idx = WayToRelationIndex::new(&dir.path().join("spill"), 1024 * 1024);
        idx.put(100, 1).unwrap();
        idx.put(200, 1).unwrap();
        idx.put(100, 2).unwrap();
        idx.put(100, 2).unwrap(); // duplicate edge kept
        idx.seal().unwrap();

        assert_eq!(idx.get(100).collect::<Vec<i64>>(), vec![1, 2, 2]);
        assert_eq!(idx.get(200).collect::<Vec<i64>>(), vec![1]);
        assert_eq!(idx.get(300).count(), 0);
    }

    #[test]
    fn test_spill_and_reload() {
        let dir = tempfile::TempDir::new().unwrap();
        let spill = dir.path().join("spill");
        // threshold forces a spill every four pairs
        let mut idx = WayToRelationIndex::new(&spill, 4 * PAIR_BYTES);
        for i in 0..1000i64 {
            idx.put(i % 37, i).unwrap();
        }
        assert!(spill.exists());
        idx.seal().unwrap();
        assert!(!spill.exists());

        assert_eq!(idx.len(), 1000);
        let rels: Vec<i64> = idx.get(0).collect();
        assert_eq!(rels.len(), (0..1000).filter(|i| i % 37 == 0).count());
        for w in rels.windows(2) {
            assert!(w[0] <= w[1]);
        }
        // stable across repeated queries
        assert_eq!(idx.get(0).collect::<Vec<i64>>(), rels);
    }

    #[test]
    #[should_panic(expected = "put after seal")]
    fn test_put_after_seal_panics() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut idx = WayToRelationIndex::new(&dir.path().join("spill"), 1024);
        idx.seal().unwrap();
        let _ = idx.put(1, 2);
    }

    #[test]
    fn test_relation_info_accounting() {
        let mut table = RelationInfoTable::new();
        table.put(10, RelationInfo::new(1, vec![0u8; 100]));
        table.put(10, RelationInfo::new(2, vec![0u8; 50]));
        table.put(11, RelationInfo::new(1, Vec::new()));

        assert_eq!(table.get(10).len(), 2);
        assert_eq!(table.get(11).len(), 1);
        assert!(table.get(12).is_empty());
        assert_eq!(table.len(), 2);
        let expect = RelationInfo::new(1, vec![0u8; 100]).size_bytes()
            + RelationInfo::new(2, vec![0u8; 50]).size_bytes()
            + RelationInfo::new(1, Vec::new()).size_bytes();
        assert_eq!(table.total_bytes(), expect);
    }
}
