mod chunk;
mod external_sort;

pub use chunk::{read_chunk, write_chunk, Chunk, ChunkReader};
pub use external_sort::{
    default_chunk_size_limit, read_chunk_manifest, ExternalMergeSort, SortConfig,
    SortedIter, ENTRY_OVERHEAD_BYTES, MAX_CHUNK_SIZE,
};

/// One sortable feature: rendered payload bytes ordered by `sort_key`.
/// The payload's meaning belongs to the tile encoder.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct Entry {
    pub sort_key: i64,
    pub payload: Vec<u8>,
}

impl Entry {
    pub fn new(sort_key: i64, payload: Vec<u8>) -> Entry {
        Entry {
            sort_key: sort_key,
            payload: payload,
        }
    }
}
