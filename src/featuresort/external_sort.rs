use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, Error, ErrorKind, Result};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::callback::{CallFinish, CallbackPool, CancelFlag, MergeTimings};
use crate::featuresort::chunk::{read_chunk, write_chunk, Chunk, ChunkReader};
use crate::featuresort::Entry;
use crate::utils::ThreadTimer;
use crate::{message, progress_percent};

type Timings = crate::utils::Timings<()>;

pub const MAX_CHUNK_SIZE: u64 = 1024 * 1024 * 1024;

/// Modelled in-memory footprint of one entry in a materialized
/// `Vec<Entry>`: the inline struct (sort key plus the Vec header) and
/// the payload's heap allocation.
pub const ENTRY_OVERHEAD_BYTES: usize = 48;

/// Chunk sizing used when the caller does not choose one: as big as
/// fits `workers` concurrently sorted chunks in half the heap, capped
/// at 1 GiB.
pub fn default_chunk_size_limit(max_memory_bytes: u64, workers: usize) -> u64 {
    u64::min(MAX_CHUNK_SIZE, max_memory_bytes / 2 / (workers as u64))
}

#[derive(Clone)]
pub struct SortConfig {
    pub temp_dir: PathBuf,
    pub workers: usize,
    pub chunk_size_limit: u64,
    pub max_memory_bytes: u64,
    pub keep_temps: bool,
}

impl SortConfig {
    pub fn new(temp_dir: &Path, max_memory_bytes: u64, workers: usize) -> SortConfig {
        SortConfig {
            temp_dir: PathBuf::from(temp_dir),
            workers: workers,
            chunk_size_limit: default_chunk_size_limit(max_memory_bytes, workers),
            max_memory_bytes: max_memory_bytes,
            keep_temps: false,
        }
    }
}

#[derive(PartialEq, Eq, Debug)]
enum SortState {
    Building,
    Sorting,
    Reading,
}

/// Bounded-memory sort of (sort key, payload) entries: entries stream
/// straight to disk in chunk files while building, each chunk is sorted
/// in place by a worker pool, and reading merges the sorted chunks
/// through a priority queue.
pub struct ExternalMergeSort {
    config: SortConfig,
    chunks: Vec<Chunk>,
    state: SortState,
}

impl ExternalMergeSort {
    pub fn new(config: SortConfig) -> Result<ExternalMergeSort> {
        if config.workers == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "need at least one worker"));
        }
        if (config.workers as u64).saturating_mul(config.chunk_size_limit)
            > config.max_memory_bytes / 2
        {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "not enough memory for {} workers x {} byte chunks, have {}",
                    config.workers, config.chunk_size_limit, config.max_memory_bytes
                ),
            ));
        }

        if config.temp_dir.exists() {
            std::fs::remove_dir_all(&config.temp_dir)?;
        }
        std::fs::create_dir_all(&config.temp_dir)?;

        let mut res = ExternalMergeSort {
            config: config,
            chunks: Vec::new(),
            state: SortState::Building,
        };
        res.new_chunk()?;
        Ok(res)
    }

    fn new_chunk(&mut self) -> Result<()> {
        if let Some(c) = self.chunks.last_mut() {
            c.close()?;
        }
        let path = self
            .config
            .temp_dir
            .join(format!("chunk-{}", self.chunks.len()));
        self.chunks.push(Chunk::create(path)?);
        Ok(())
    }

    pub fn add(&mut self, entry: Entry) -> Result<()> {
        if self.state != SortState::Building {
            panic!("add after sort");
        }
        let chunk = self.chunks.last_mut().expect("no open chunk");
        chunk.add(&entry)?;
        if chunk.bytes_in_memory as u64 > self.config.chunk_size_limit {
            self.new_chunk()?;
        }
        Ok(())
    }

    pub fn item_count(&self) -> usize {
        self.chunks.iter().map(|c| c.item_count).sum()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.item_count > 0).count()
    }

    pub fn storage_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.file_bytes).sum()
    }

    pub fn sort(&mut self) -> Result<()> {
        if self.state != SortState::Building {
            panic!("sort called twice");
        }
        self.state = SortState::Sorting;
        if let Some(c) = self.chunks.last_mut() {
            c.close()?;
        }

        let jobs: Vec<ChunkSortJob> = self
            .chunks
            .iter()
            .filter(|c| c.item_count > 0)
            .map(|c| ChunkSortJob {
                path: c.path.clone(),
                item_count: c.item_count,
            })
            .collect();

        if !jobs.is_empty() {
            let cancel = CancelFlag::new();
            let mut workers: Vec<Box<dyn CallFinish<CallType = ChunkSortJob, ReturnType = Timings>>> =
                Vec::new();
            for _ in 0..self.config.workers {
                workers.push(Box::new(SortChunkWorker::new(cancel.clone())));
            }
            let mut pool =
                CallbackPool::with_cancel(workers, 1, Box::new(MergeTimings::new()), cancel);

            let njobs = jobs.len();
            let pg = progress_percent!(&format!(
                "sort {} chunks, workers={}",
                njobs, self.config.workers
            ));
            let pf = 100.0 / (njobs as f64);
            for (i, job) in jobs.into_iter().enumerate() {
                pg.progress_percent((i as f64) * pf);
                pool.call(job);
            }
            let t = pool.finish()?;
            pg.finish();
            message!("sorted {} chunks {}", njobs, t);
        }

        if self.config.keep_temps {
            write_chunk_manifest(&self.config.temp_dir, &self.chunks)?;
        }

        self.state = SortState::Reading;
        Ok(())
    }

    /// Single-pass merge over the sorted chunks; the first read error
    /// ends the iteration.
    pub fn iter(&self) -> Result<SortedIter> {
        if self.state != SortState::Reading {
            panic!("iter before sort");
        }
        let mut heap = BinaryHeap::new();
        for c in &self.chunks {
            if c.item_count > 0 {
                heap.push(c.reader()?);
            }
        }
        Ok(SortedIter {
            heap: heap,
            failed: false,
        })
    }

    fn cleanup(&mut self) -> Result<()> {
        self.chunks.clear();
        if self.config.temp_dir.exists() {
            std::fs::remove_dir_all(&self.config.temp_dir)?;
        }
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        if self.config.keep_temps {
            return Ok(());
        }
        self.cleanup()
    }
}

impl Drop for ExternalMergeSort {
    fn drop(&mut self) {
        if !self.config.keep_temps {
            let _ = self.cleanup();
        }
    }
}

struct ChunkSortJob {
    path: PathBuf,
    item_count: usize,
}

fn sort_one_chunk(job: &ChunkSortJob) -> Result<()> {
    let mut entries = read_chunk(&job.path, job.item_count)?;
    entries.sort_unstable_by_key(|e| e.sort_key);
    write_chunk(&job.path, &entries)
}

struct SortChunkWorker {
    cancel: CancelFlag,
    err: Option<Error>,
    tm: f64,
}

impl SortChunkWorker {
    fn new(cancel: CancelFlag) -> SortChunkWorker {
        SortChunkWorker {
            cancel: cancel,
            err: None,
            tm: 0.0,
        }
    }
}

impl CallFinish for SortChunkWorker {
    type CallType = ChunkSortJob;
    type ReturnType = Timings;

    fn call(&mut self, job: ChunkSortJob) {
        if self.err.is_some() {
            return;
        }
        let tx = ThreadTimer::new();
        match sort_one_chunk(&job) {
            Ok(()) => {}
            Err(e) => {
                self.err = Some(e);
                self.cancel.cancel();
            }
        }
        self.tm += tx.since();
    }

    fn finish(&mut self) -> Result<Timings> {
        match self.err.take() {
            Some(e) => Err(e),
            None => {
                let mut t = Timings::new();
                t.add("sort chunks", self.tm);
                Ok(t)
            }
        }
    }
}

pub struct SortedIter {
    heap: BinaryHeap<ChunkReader>,
    failed: bool,
}

impl Iterator for SortedIter {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Result<Entry>> {
        if self.failed {
            return None;
        }
        let mut reader = self.heap.pop()?;
        match reader.next_entry() {
            Ok(Some(e)) => {
                if reader.has_next() {
                    self.heap.push(reader);
                }
                Some(Ok(e))
            }
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ChunkManifestEntry {
    file: String,
    item_count: usize,
}

fn write_chunk_manifest(temp_dir: &Path, chunks: &[Chunk]) -> Result<()> {
    let mut entries = Vec::new();
    for c in chunks {
        if c.item_count > 0 {
            entries.push(ChunkManifestEntry {
                file: c.path.display().to_string(),
                item_count: c.item_count,
            });
        }
    }
    serde_json::to_writer(File::create(temp_dir.join("chunks.json"))?, &entries)?;
    Ok(())
}

pub fn read_chunk_manifest(temp_dir: &Path) -> Result<Vec<(PathBuf, usize)>> {
    let entries: Vec<ChunkManifestEntry> =
        serde_json::from_reader(BufReader::new(File::open(temp_dir.join("chunks.json"))?))?;
    Ok(entries
        .into_iter()
        .map(|e| (PathBuf::from(e.file), e.item_count))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &Path, chunk_size_limit: u64, workers: usize) -> SortConfig {
        SortConfig {
            temp_dir: PathBuf::from(dir),
            workers: workers,
            chunk_size_limit: chunk_size_limit,
            max_memory_bytes: 1024 * 1024,
            keep_temps: false,
        }
    }

    fn entry(k: i64) -> Entry {
        Entry::new(k, vec![(k & 0xff) as u8])
    }

    fn sorted_keys(sorter: &ExternalMergeSort) -> Vec<i64> {
        sorter
            .iter()
            .unwrap()
            .map(|e| e.unwrap().sort_key)
            .collect()
    }

    #[test]
    fn test_empty_input_yields_empty_iterator() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut sorter =
            ExternalMergeSort::new(test_config(&dir.path().join("sort"), 1000, 2)).unwrap();
        sorter.sort().unwrap();
        assert_eq!(sorted_keys(&sorter), Vec::<i64>::new());
    }

    #[test]
    fn test_out_of_order_keys_across_chunks() {
        let dir = tempfile::TempDir::new().unwrap();
        // 48 + 1 bytes accounted per entry; limit 80 rolls the chunk
        // after every second add, so five entries land in three chunks
        let mut sorter =
            ExternalMergeSort::new(test_config(&dir.path().join("sort"), 80, 2)).unwrap();
        for k in [5, 1, 9, 3, 1] {
            sorter.add(entry(k)).unwrap();
        }
        assert_eq!(sorter.chunk_count(), 3);
        sorter.sort().unwrap();
        assert_eq!(sorted_keys(&sorter), vec![1, 1, 3, 5, 9]);
    }

    #[test]
    fn test_multiset_preserved() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut sorter =
            ExternalMergeSort::new(test_config(&dir.path().join("sort"), 200, 3)).unwrap();
        let mut expect = Vec::new();
        // fixed pseudo-random sequence, many duplicate keys
        let mut x: i64 = 12345;
        for _ in 0..1000 {
            x = (x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407)) >> 17;
            let k = x % 64;
            expect.push(k);
            sorter.add(Entry::new(k, x.to_be_bytes().to_vec())).unwrap();
        }
        assert!(sorter.chunk_count() > 1);
        sorter.sort().unwrap();

        let got: Vec<i64> = sorted_keys(&sorter);
        expect.sort();
        assert_eq!(got, expect);
    }

    #[test]
    fn test_chunk_count_for_uniform_payloads() {
        let dir = tempfile::TempDir::new().unwrap();
        let limit = 500u64;
        let payload = 52usize; // accounted entry size 100
        let mut sorter =
            ExternalMergeSort::new(test_config(&dir.path().join("sort"), limit, 1)).unwrap();
        let n = 137usize;
        for i in 0..n {
            sorter.add(Entry::new(i as i64, vec![0u8; payload])).unwrap();
        }
        // a chunk closes once its accounting first exceeds the limit
        let per_entry = (ENTRY_OVERHEAD_BYTES + payload) as u64;
        let per_chunk = (limit / per_entry + 1) as usize;
        let expected = (n + per_chunk - 1) / per_chunk;
        assert_eq!(sorter.chunk_count(), expected);
    }

    #[test]
    fn test_payloads_follow_their_keys() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut sorter =
            ExternalMergeSort::new(test_config(&dir.path().join("sort"), 100, 2)).unwrap();
        sorter.add(Entry::new(42, vec![0xab])).unwrap();
        sorter.add(Entry::new(7, vec![0x01])).unwrap();
        sorter.sort().unwrap();

        let entries: Vec<Entry> = sorter.iter().unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(
            entries,
            vec![Entry::new(7, vec![0x01]), Entry::new(42, vec![0xab])]
        );
    }

    #[test]
    fn test_rejects_oversized_chunks() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = test_config(&dir.path().join("sort"), 1000, 4);
        config.max_memory_bytes = 4000; // 4 x 1000 > 4000 / 2
        assert!(ExternalMergeSort::new(config).is_err());
    }

    #[test]
    fn test_default_chunk_size_limit() {
        assert_eq!(default_chunk_size_limit(8 * 1024 * 1024, 4), 1024 * 1024);
        // capped at 1 GiB however much memory there is
        assert_eq!(default_chunk_size_limit(u64::MAX, 1), MAX_CHUNK_SIZE);
    }

    #[test]
    #[should_panic(expected = "add after sort")]
    fn test_add_after_sort_panics() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut sorter =
            ExternalMergeSort::new(test_config(&dir.path().join("sort"), 1000, 1)).unwrap();
        sorter.sort().unwrap();
        let _ = sorter.add(entry(1));
    }

    #[test]
    #[should_panic(expected = "iter before sort")]
    fn test_iter_before_sort_panics() {
        let dir = tempfile::TempDir::new().unwrap();
        let sorter =
            ExternalMergeSort::new(test_config(&dir.path().join("sort"), 1000, 1)).unwrap();
        let _ = sorter.iter();
    }

    #[test]
    #[should_panic(expected = "sort called twice")]
    fn test_double_sort_panics() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut sorter =
            ExternalMergeSort::new(test_config(&dir.path().join("sort"), 1000, 1)).unwrap();
        sorter.sort().unwrap();
        let _ = sorter.sort();
    }

    #[test]
    fn test_temp_files_removed_on_close() {
        let dir = tempfile::TempDir::new().unwrap();
        let sort_dir = dir.path().join("sort");
        let mut sorter = ExternalMergeSort::new(test_config(&sort_dir, 80, 1)).unwrap();
        for k in 0..10 {
            sorter.add(entry(k)).unwrap();
        }
        sorter.sort().unwrap();
        assert!(sort_dir.exists());
        sorter.close().unwrap();
        assert!(!sort_dir.exists());
    }

    #[test]
    fn test_keep_temps_writes_manifest() {
        let dir = tempfile::TempDir::new().unwrap();
        let sort_dir = dir.path().join("sort");
        let mut config = test_config(&sort_dir, 80, 1);
        config.keep_temps = true;
        let mut sorter = ExternalMergeSort::new(config).unwrap();
        for k in 0..10 {
            sorter.add(entry(k)).unwrap();
        }
        sorter.sort().unwrap();
        drop(sorter);

        assert!(sort_dir.exists());
        let manifest = read_chunk_manifest(&sort_dir).unwrap();
        assert_eq!(manifest.iter().map(|(_, n)| n).sum::<usize>(), 10);
        for (path, _) in &manifest {
            assert!(path.exists());
        }
    }
}
