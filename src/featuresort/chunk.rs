use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, BufWriter, Error, ErrorKind, Read, Result, Write};
use std::path::{Path, PathBuf};

use crate::featuresort::external_sort::ENTRY_OVERHEAD_BYTES;
use crate::featuresort::Entry;

// sort_key:i64_be ++ len:i32_be ++ payload
const FRAME_BYTES: usize = 12;

pub fn write_entry<W: Write>(out: &mut W, e: &Entry) -> Result<()> {
    out.write_all(&e.sort_key.to_be_bytes())?;
    out.write_all(&(e.payload.len() as i32).to_be_bytes())?;
    out.write_all(&e.payload)?;
    Ok(())
}

pub fn read_entry<R: Read>(inp: &mut R) -> Result<Entry> {
    let mut kb = [0u8; 8];
    inp.read_exact(&mut kb)?;
    let mut lb = [0u8; 4];
    inp.read_exact(&mut lb)?;
    let len = i32::from_be_bytes(lb);
    if len < 0 {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("negative payload length {}", len),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    inp.read_exact(&mut payload)?;
    Ok(Entry {
        sort_key: i64::from_be_bytes(kb),
        payload: payload,
    })
}

pub fn read_chunk(path: &Path, item_count: usize) -> Result<Vec<Entry>> {
    let mut inp = BufReader::with_capacity(50_000, File::open(path)?);
    let mut entries = Vec::with_capacity(item_count);
    for i in 0..item_count {
        match read_entry(&mut inp) {
            Ok(e) => entries.push(e),
            Err(e) => {
                return Err(Error::new(
                    ErrorKind::UnexpectedEof,
                    format!(
                        "expected {} entries in {}, got {}: {}",
                        item_count,
                        path.display(),
                        i,
                        e
                    ),
                ));
            }
        }
    }
    Ok(entries)
}

pub fn write_chunk(path: &Path, entries: &[Entry]) -> Result<()> {
    let mut out = BufWriter::with_capacity(50_000, File::create(path)?);
    for e in entries {
        write_entry(&mut out, e)?;
    }
    out.flush()
}

/// A bounded run of entries persisted to one file as it fills, sorted in
/// place later. Entries only exist in memory while a sort worker holds
/// the chunk.
pub struct Chunk {
    pub path: PathBuf,
    pub item_count: usize,
    pub bytes_in_memory: usize,
    pub file_bytes: u64,
    out: Option<BufWriter<File>>,
}

impl Chunk {
    pub fn create(path: PathBuf) -> Result<Chunk> {
        let out = BufWriter::with_capacity(50_000, File::create(&path)?);
        Ok(Chunk {
            path: path,
            item_count: 0,
            bytes_in_memory: 0,
            file_bytes: 0,
            out: Some(out),
        })
    }

    pub fn add(&mut self, e: &Entry) -> Result<()> {
        match &mut self.out {
            Some(out) => write_entry(out, e)?,
            None => {
                panic!("add to closed chunk");
            }
        }
        self.item_count += 1;
        self.bytes_in_memory += ENTRY_OVERHEAD_BYTES + e.payload.len();
        self.file_bytes += (FRAME_BYTES + e.payload.len()) as u64;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        match self.out.take() {
            Some(mut out) => out.flush(),
            None => Ok(()),
        }
    }

    pub fn reader(&self) -> Result<ChunkReader> {
        ChunkReader::open(&self.path, self.item_count)
    }
}

/// Buffers one entry ahead so the merge heap can order readers by their
/// next sort key.
pub struct ChunkReader {
    inp: BufReader<File>,
    count: usize,
    read: usize,
    next: Option<Entry>,
}

impl ChunkReader {
    pub fn open(path: &Path, count: usize) -> Result<ChunkReader> {
        let mut r = ChunkReader {
            inp: BufReader::with_capacity(50_000, File::open(path)?),
            count: count,
            read: 0,
            next: None,
        };
        r.advance()?;
        Ok(r)
    }

    fn advance(&mut self) -> Result<()> {
        if self.read < self.count {
            self.next = Some(read_entry(&mut self.inp)?);
            self.read += 1;
        } else {
            self.next = None;
        }
        Ok(())
    }

    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }

    pub fn peek_key(&self) -> i64 {
        match &self.next {
            Some(e) => e.sort_key,
            None => i64::MAX,
        }
    }

    /// Yields the buffered entry and reads the next one behind it.
    pub fn next_entry(&mut self) -> Result<Option<Entry>> {
        match self.next.take() {
            None => Ok(None),
            Some(e) => {
                self.advance()?;
                Ok(Some(e))
            }
        }
    }
}

// Reversed ordering: BinaryHeap is a max-heap and the merge wants the
// smallest peeked key on top.
impl Ord for ChunkReader {
    fn cmp(&self, other: &Self) -> Ordering {
        other.peek_key().cmp(&self.peek_key())
    }
}
impl PartialOrd for ChunkReader {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for ChunkReader {
    fn eq(&self, other: &Self) -> bool {
        self.peek_key() == other.peek_key()
    }
}
impl Eq for ChunkReader {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_framing_roundtrip() {
        let entries = vec![
            Entry::new(42, vec![0xab]),
            Entry::new(-7, Vec::new()),
            Entry::new(i64::MAX, vec![1, 2, 3, 4, 5]),
        ];
        let mut buf = Vec::new();
        for e in &entries {
            write_entry(&mut buf, e).unwrap();
        }
        // sort_key 42 big-endian, then length 1, then the payload byte
        assert_eq!(
            &buf[0..13],
            &[0, 0, 0, 0, 0, 0, 0, 42, 0, 0, 0, 1, 0xab]
        );

        let mut inp = std::io::Cursor::new(buf);
        for e in &entries {
            assert_eq!(&read_entry(&mut inp).unwrap(), e);
        }
        assert!(read_entry(&mut inp).is_err());
    }

    #[test]
    fn test_chunk_write_read() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("chunk-0");
        let mut chunk = Chunk::create(path.clone()).unwrap();
        for i in 0..5 {
            chunk.add(&Entry::new(5 - i, vec![i as u8])).unwrap();
        }
        chunk.close().unwrap();

        let entries = read_chunk(&path, 5).unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].sort_key, 5);

        // declaring more entries than the file holds is a hard error
        assert!(read_chunk(&path, 6).is_err());
    }
}
