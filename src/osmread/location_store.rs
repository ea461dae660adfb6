use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Result, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use memmap2::Mmap;
use rustc_hash::FxHashMap;

use crate::elements::{PackedLocation, MISSING_LOCATION};

pub const NODE_TILE_SHIFT: i64 = 20;
pub const NODE_TILE_SIZE: usize = 1 << NODE_TILE_SHIFT;
const NODE_TILE_MASK: i64 = (1 << NODE_TILE_SHIFT) - 1;

struct WriteState {
    out: BufWriter<File>,
    file_len: u64,
    tile_offsets: BTreeMap<i64, u64>,
    tile_idx: i64,
    tile: Vec<PackedLocation>,
    stragglers: FxHashMap<i64, PackedLocation>,
}

struct SealedLocs {
    map: Option<Mmap>,
    tile_offsets: BTreeMap<i64, u64>,
    stragglers: FxHashMap<i64, PackedLocation>,
}

/// Disk-backed `node_id -> PackedLocation`. The id space is paged into
/// tiles of 2^20 entries; only touched tiles occupy disk. OSM node ids
/// arrive roughly in order, so writes fill one in-memory tile which is
/// appended to the backing file when a put moves past it; the rare put
/// landing behind the open tile goes to a straggler map. After `seal`
/// the file is memory-mapped and `get` is lock-free.
pub struct NodeLocationStore {
    path: PathBuf,
    write: Mutex<Option<WriteState>>,
    sealed: OnceLock<SealedLocs>,
}

impl NodeLocationStore {
    pub fn new(path: &Path) -> Result<NodeLocationStore> {
        let out = BufWriter::with_capacity(1024 * 1024, File::create(path)?);
        Ok(NodeLocationStore {
            path: PathBuf::from(path),
            write: Mutex::new(Some(WriteState {
                out: out,
                file_len: 0,
                tile_offsets: BTreeMap::new(),
                tile_idx: -1,
                tile: vec![MISSING_LOCATION; NODE_TILE_SIZE],
                stragglers: FxHashMap::default(),
            })),
            sealed: OnceLock::new(),
        })
    }

    pub fn put(&self, id: i64, loc: PackedLocation) -> Result<()> {
        assert!(id >= 0, "negative node id {}", id);
        let mut guard = self.write.lock().unwrap();
        let st = guard.as_mut().expect("put after seal");

        let tile_idx = id >> NODE_TILE_SHIFT;
        let slot = (id & NODE_TILE_MASK) as usize;

        if st.tile_idx < 0 {
            st.tile_idx = tile_idx;
        }

        if tile_idx == st.tile_idx {
            st.tile[slot] = loc;
        } else if tile_idx > st.tile_idx && !st.tile_offsets.contains_key(&tile_idx) {
            flush_tile(st)?;
            st.tile_idx = tile_idx;
            st.tile[slot] = loc;
        } else {
            st.stragglers.insert(id, loc);
        }
        Ok(())
    }

    pub fn seal(&self) -> Result<()> {
        let mut guard = self.write.lock().unwrap();
        let mut st = guard.take().expect("seal called twice");
        flush_tile(&mut st)?;
        st.out.flush()?;
        drop(st.out);

        let map = if st.file_len > 0 {
            let f = File::open(&self.path)?;
            Some(unsafe { Mmap::map(&f)? })
        } else {
            None
        };

        let sealed = SealedLocs {
            map: map,
            tile_offsets: st.tile_offsets,
            stragglers: st.stragglers,
        };
        if self.sealed.set(sealed).is_err() {
            panic!("seal called twice");
        }
        Ok(())
    }

    pub fn get(&self, id: i64) -> PackedLocation {
        let s = self.sealed.get().expect("get before seal");

        if let Some(loc) = s.stragglers.get(&id) {
            return *loc;
        }

        let tile_idx = id >> NODE_TILE_SHIFT;
        match s.tile_offsets.get(&tile_idx) {
            None => MISSING_LOCATION,
            Some(off) => {
                let p = (*off as usize) + ((id & NODE_TILE_MASK) as usize) * 8;
                let map = s.map.as_ref().expect("tile directory without data");
                PackedLocation::from_le_bytes(map[p..p + 8].try_into().expect("?"))
            }
        }
    }

    pub fn file_bytes(&self) -> u64 {
        match self.sealed.get() {
            Some(s) => s.map.as_ref().map(|m| m.len() as u64).unwrap_or(0),
            None => match self.write.lock().unwrap().as_ref() {
                Some(st) => st.file_len,
                None => 0,
            },
        }
    }

    /// Removes the backing file; the store is unusable afterwards.
    pub fn remove_file(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

fn flush_tile(st: &mut WriteState) -> Result<()> {
    if st.tile_idx < 0 {
        return Ok(());
    }
    for v in &st.tile {
        st.out.write_all(&v.to_le_bytes())?;
    }
    st.tile_offsets.insert(st.tile_idx, st.file_len);
    st.file_len += (NODE_TILE_SIZE * 8) as u64;
    st.tile.fill(MISSING_LOCATION);
    Ok(())
}
