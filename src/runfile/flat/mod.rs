//! Flat run format: compressed blocks behind a fixed-width index.
//!
//! A flat run is three files sharing one id:
//!
//! - `<id>.index` — an 8-byte little-endian entry count, then one 24-byte
//!   record per block: `(firstkeys_off: u64, firstkeys_len: u32,
//!   data_off: u64, data_len: u32)`, all little-endian.
//! - `<id>.firstkeys` — each block's smallest key, verbatim, back to back.
//! - `<id>.data` — per block: `varint(n_entries) varint(uncompressed_len)`
//!   followed by one zlib stream holding the block's records.
//!
//! Inside a block the first record stores only `varint(value_len) value`
//! (its key lives in the firstkeys file); every later record is
//! `varint(prefix_len) varint(suffix_len) suffix varint(value_len) value`,
//! the prefix shared with the preceding key. A block is closed once its
//! compressed payload reaches [`BLOCK_COMPRESSED_BUDGET`]; the stream is
//! sync-flushed so an incremental reader can stop at the exact byte, and
//! each block is an independent zlib stream.
//!
//! The split into three files keeps the index and firstkeys small enough
//! to mmap whole while data is streamed; point queries binary-search the
//! index by first key, then binary-search one inflated block, consulting a
//! small recency cache of inflated blocks.
//!
//! Files remain queryable while still being built (merge outputs are
//! consulted mid-merge); reads then go through the writer windows.

#[cfg(test)]
mod tests;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use tracing::trace;

use crate::encoding::{
    get_u32_le, get_u64_le, get_varint32, put_u32_le, put_u64_le, put_varint32, Cursor,
};
use crate::runfile::mmap::{MmapReader, MmapWriter};
use crate::runfile::{FeedOutcome, FileHints, RunFile, RunFileError, RunReader};

/// Extensions of the three backing files, scratch included (there is none).
pub const EXTENSIONS: &[&str] = &["index", "firstkeys", "data"];

const IDX: usize = 0;
const FK: usize = 1;
const DATA: usize = 2;
const N_FILES: usize = 3;

/// Bytes of the index-file header (the 64-bit entry count).
const INDEX_HEADER_SIZE: u64 = 8;

/// Bytes of one index record.
const INDEX_RECORD_SIZE: u64 = 24;

/// A block is closed once its compressed payload reaches this many bytes.
const BLOCK_COMPRESSED_BUDGET: usize = 16 * 1024;

/// zlib compression level for block payloads.
const COMPRESSION_LEVEL: u32 = 3;

/// Inflated blocks kept hot per file.
const MAX_CACHE_ENTRIES: usize = 24;

/// Serialized build-state length: phase byte, three offsets, entry count.
const BUILD_STATE_LEN: usize = 1 + 3 * 8 + 8;

/// Serialized in-progress reader-state length: mode byte, three block-start
/// offsets, record index.
const READER_STATE_LEN: usize = 1 + 3 * 8 + 4;

// ------------------------------------------------------------------------------------------------
// Index records
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct IndexRecord {
    firstkeys_offset: u64,
    firstkeys_len: u32,
    data_offset: u64,
    data_len: u32,
}

impl IndexRecord {
    fn encode(&self) -> [u8; INDEX_RECORD_SIZE as usize] {
        let mut buf = Vec::with_capacity(INDEX_RECORD_SIZE as usize);
        put_u64_le(self.firstkeys_offset, &mut buf);
        put_u32_le(self.firstkeys_len, &mut buf);
        put_u64_le(self.data_offset, &mut buf);
        put_u32_le(self.data_len, &mut buf);
        let mut out = [0u8; INDEX_RECORD_SIZE as usize];
        out.copy_from_slice(&buf);
        out
    }

    fn decode(buf: &[u8]) -> Result<Self, RunFileError> {
        Ok(Self {
            firstkeys_offset: get_u64_le(buf, 0)?,
            firstkeys_len: get_u32_le(buf, 8)?,
            data_offset: get_u64_le(buf, 12)?,
            data_len: get_u32_le(buf, 20)?,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Blocks
// ------------------------------------------------------------------------------------------------

/// One inflated block: fully materialized keys and values.
struct Block {
    records: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Inflates and parses one block given its first key (from the firstkeys
/// file) and its raw bytes from the data file.
fn decode_block(first_key: &[u8], raw: &[u8]) -> Result<Block, RunFileError> {
    let (n_entries, used0) = get_varint32(raw)?;
    let (uncompressed_len, used1) = get_varint32(&raw[used0..])?;
    let payload = &raw[used0 + used1..];

    let uncompressed = inflate_sync(payload, uncompressed_len as usize)?;

    let mut records: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(n_entries as usize);
    let mut at = 0usize;
    for i in 0..n_entries {
        let key: Vec<u8> = if i == 0 {
            first_key.to_vec()
        } else {
            let (prefix_len, n) = get_varint32(&uncompressed[at..])?;
            at += n;
            let (suffix_len, n) = get_varint32(&uncompressed[at..])?;
            at += n;
            let prefix_len = prefix_len as usize;
            let suffix_len = suffix_len as usize;
            let prev: &[u8] = &records[i as usize - 1].0;
            if prefix_len > prev.len() || at + suffix_len > uncompressed.len() {
                return Err(RunFileError::Corrupt(
                    "block key prefix exceeds previous key".into(),
                ));
            }
            let mut key = Vec::with_capacity(prefix_len + suffix_len);
            key.extend_from_slice(&prev[..prefix_len]);
            key.extend_from_slice(&uncompressed[at..at + suffix_len]);
            at += suffix_len;
            key
        };
        let (value_len, n) = get_varint32(&uncompressed[at..])?;
        at += n;
        let value_len = value_len as usize;
        if at + value_len > uncompressed.len() {
            return Err(RunFileError::Corrupt("block value overruns payload".into()));
        }
        let value = uncompressed[at..at + value_len].to_vec();
        at += value_len;
        records.push((key, value));
    }
    if at != uncompressed.len() {
        return Err(RunFileError::Corrupt(format!(
            "block payload has {} trailing bytes",
            uncompressed.len() - at
        )));
    }
    Ok(Block { records })
}

/// Inflates a sync-flushed zlib stream of known inflated size.
fn inflate_sync(compressed: &[u8], expected_len: usize) -> Result<Vec<u8>, RunFileError> {
    let mut out = Vec::with_capacity(expected_len);
    let mut inflater = Decompress::new(true);
    while out.len() < expected_len {
        let consumed = inflater.total_in() as usize;
        if consumed >= compressed.len() {
            return Err(RunFileError::Corrupt(
                "compressed block ended before expected length".into(),
            ));
        }
        let before_out = inflater.total_out();
        inflater
            .decompress_vec(&compressed[consumed..], &mut out, FlushDecompress::Sync)
            .map_err(|e| RunFileError::Corrupt(format!("inflate failed: {e}")))?;
        if inflater.total_out() == before_out {
            return Err(RunFileError::Corrupt("inflate made no progress".into()));
        }
    }
    if out.len() != expected_len {
        return Err(RunFileError::Corrupt(format!(
            "inflated length {} != expected {}",
            out.len(),
            expected_len
        )));
    }
    Ok(out)
}

// ------------------------------------------------------------------------------------------------
// Block cache
// ------------------------------------------------------------------------------------------------

/// Fixed-capacity cache of inflated blocks, keyed by block index and
/// evicting the least recently touched entry.
struct BlockCache {
    capacity: usize,
    tick: u64,
    entries: HashMap<u64, (Arc<Block>, u64)>,
}

impl BlockCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tick: 0,
            entries: HashMap::new(),
        }
    }

    fn get(&mut self, index: u64) -> Option<Arc<Block>> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(&index).map(|slot| {
            slot.1 = tick;
            Arc::clone(&slot.0)
        })
    }

    fn insert(&mut self, index: u64, block: Arc<Block>) {
        if self.entries.len() == self.capacity {
            if let Some(&coldest) = self
                .entries
                .iter()
                .min_by_key(|(_, slot)| slot.1)
                .map(|(k, _)| k)
            {
                self.entries.remove(&coldest);
            }
        }
        self.tick += 1;
        self.entries.insert(index, (block, self.tick));
    }
}

// ------------------------------------------------------------------------------------------------
// Builder
// ------------------------------------------------------------------------------------------------

struct Builder {
    writers: [MmapWriter; N_FILES],
    compressor: Compress,
    /// Per-entry staging for the non-value bytes before compression.
    scratch: Vec<u8>,
    compressed: Vec<u8>,
    first_key: Vec<u8>,
    last_key: Vec<u8>,
    /// True while the current block holds at least one entry.
    block_open: bool,
    n_block_entries: u32,
    uncompressed_len: u32,
}

impl Builder {
    fn new(writers: [MmapWriter; N_FILES]) -> Self {
        Self {
            writers,
            compressor: Compress::new(Compression::new(COMPRESSION_LEVEL), true),
            scratch: Vec::new(),
            compressed: Vec::new(),
            first_key: Vec::new(),
            last_key: Vec::new(),
            block_open: false,
            n_block_entries: 0,
            uncompressed_len: 0,
        }
    }

    fn compress_chunk(&mut self, data: &[u8]) -> Result<(), RunFileError> {
        self.uncompressed_len += data.len() as u32;
        let mut consumed = 0usize;
        while consumed < data.len() {
            if self.compressed.capacity() == self.compressed.len() {
                self.compressed.reserve((data.len() - consumed) / 2 + 64);
            }
            let before = self.compressor.total_in();
            self.compressor
                .compress_vec(&data[consumed..], &mut self.compressed, FlushCompress::None)
                .map_err(|e| RunFileError::Corrupt(format!("deflate failed: {e}")))?;
            consumed += (self.compressor.total_in() - before) as usize;
        }
        Ok(())
    }

    fn flush_compressor(&mut self) -> Result<(), RunFileError> {
        loop {
            if self.compressed.capacity() - self.compressed.len() < 16 {
                self.compressed.reserve(64);
            }
            self.compressor
                .compress_vec(&[], &mut self.compressed, FlushCompress::Sync)
                .map_err(|e| RunFileError::Corrupt(format!("deflate flush failed: {e}")))?;
            if self.compressed.len() < self.compressed.capacity() {
                return Ok(());
            }
        }
    }

    /// Closes the current block: sync-flushes the stream and appends the
    /// index record, first key, and framed payload to the three files.
    fn flush_block(&mut self) -> Result<(), RunFileError> {
        self.flush_compressor()?;

        let mut frame = Vec::with_capacity(10);
        put_varint32(self.n_block_entries, &mut frame);
        put_varint32(self.uncompressed_len, &mut frame);

        let record = IndexRecord {
            firstkeys_offset: self.writers[FK].offset(),
            firstkeys_len: self.first_key.len() as u32,
            data_offset: self.writers[DATA].offset(),
            data_len: (frame.len() + self.compressed.len()) as u32,
        };
        trace!(
            entries = self.n_block_entries,
            uncompressed = self.uncompressed_len,
            compressed = self.compressed.len(),
            "flat block closed"
        );
        self.writers[IDX].write(&record.encode())?;
        self.writers[FK].write(&self.first_key)?;
        self.writers[DATA].write(&frame)?;
        self.writers[DATA].write(&self.compressed)?;

        self.compressor.reset();
        self.compressed.clear();
        self.n_block_entries = 0;
        self.uncompressed_len = 0;
        self.block_open = false;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// FlatFile
// ------------------------------------------------------------------------------------------------

enum Backing {
    Building(Builder),
    Readable([MmapReader; N_FILES]),
    /// Transient state while `done_feeding` converts the builder; never
    /// observable through the public surface.
    Converting,
}

/// A flat run in any lifecycle state.
pub struct FlatFile {
    id: u64,
    entry_count: u64,
    paths: [PathBuf; N_FILES],
    backing: Backing,
    cache: BlockCache,
}

fn file_paths(dir: &Path, id: u64) -> [PathBuf; N_FILES] {
    [
        dir.join(format!("{id:016x}.{}", EXTENSIONS[IDX])),
        dir.join(format!("{id:016x}.{}", EXTENSIONS[FK])),
        dir.join(format!("{id:016x}.{}", EXTENSIONS[DATA])),
    ]
}

impl FlatFile {
    /// Begins writing a fresh run.
    pub fn create(dir: &Path, id: u64, _hints: &FileHints) -> Result<Self, RunFileError> {
        let paths = file_paths(dir, id);
        let mut writers = Vec::with_capacity(N_FILES);
        for path in &paths {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            writers.push(MmapWriter::create_at(file, 0)?);
        }
        let mut writers: [MmapWriter; N_FILES] = writers
            .try_into()
            .unwrap_or_else(|_| unreachable!("exactly three writers"));

        // Reserve the entry-count header; the real count lands at
        // done_feeding time.
        writers[IDX].write(&0u64.to_le_bytes())?;

        Ok(Self {
            id,
            entry_count: 0,
            paths,
            backing: Backing::Building(Builder::new(writers)),
            cache: BlockCache::new(MAX_CACHE_ENTRIES),
        })
    }

    /// Resumes a half-built run from serialized build state.
    pub fn open_building(dir: &Path, id: u64, state: &[u8]) -> Result<Self, RunFileError> {
        if state.len() != BUILD_STATE_LEN || state[0] != 0 {
            return Err(RunFileError::BadState(format!(
                "flat build state must be {BUILD_STATE_LEN} bytes, phase 0"
            )));
        }
        let paths = file_paths(dir, id);
        let mut cur = Cursor::new(state);
        cur.read_u8()?;
        let mut writers = Vec::with_capacity(N_FILES);
        for path in &paths {
            let offset = cur.read_u64_le()?;
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            writers.push(MmapWriter::create_at(file, offset)?);
        }
        let entry_count = cur.read_u64_le()?;
        let writers: [MmapWriter; N_FILES] = writers
            .try_into()
            .unwrap_or_else(|_| unreachable!("exactly three writers"));
        Ok(Self {
            id,
            entry_count,
            paths,
            backing: Backing::Building(Builder::new(writers)),
            cache: BlockCache::new(MAX_CACHE_ENTRIES),
        })
    }

    /// Opens a completed run read-only.
    pub fn open(dir: &Path, id: u64) -> Result<Self, RunFileError> {
        let paths = file_paths(dir, id);
        let mut readers = Vec::with_capacity(N_FILES);
        for path in &paths {
            readers.push(MmapReader::open(File::open(path)?)?);
        }
        let readers: [MmapReader; N_FILES] = readers
            .try_into()
            .unwrap_or_else(|_| unreachable!("exactly three readers"));

        let mut count_buf = [0u8; 8];
        readers[IDX].pread(0, &mut count_buf)?;
        let entry_count = u64::from_le_bytes(count_buf);

        Ok(Self {
            id,
            entry_count,
            paths,
            backing: Backing::Readable(readers),
            cache: BlockCache::new(MAX_CACHE_ENTRIES),
        })
    }

    fn n_blocks(&self) -> u64 {
        let index_len = match &self.backing {
            Backing::Building(b) => b.writers[IDX].offset(),
            Backing::Readable(r) => r[IDX].file_size(),
            Backing::Converting => unreachable!("converting state is transient"),
        };
        (index_len - INDEX_HEADER_SIZE) / INDEX_RECORD_SIZE
    }

    fn read_index_record(&self, block: u64) -> Result<IndexRecord, RunFileError> {
        let mut buf = [0u8; INDEX_RECORD_SIZE as usize];
        pread_at(
            &self.backing,
            IDX,
            INDEX_HEADER_SIZE + block * INDEX_RECORD_SIZE,
            &mut buf,
        )?;
        IndexRecord::decode(&buf)
    }

    fn read_first_key(&self, record: &IndexRecord) -> Result<Vec<u8>, RunFileError> {
        let mut key = vec![0u8; record.firstkeys_len as usize];
        pread_at(&self.backing, FK, record.firstkeys_offset, &mut key)?;
        Ok(key)
    }

    fn load_block(
        &mut self,
        block_index: u64,
        record: &IndexRecord,
        first_key: &[u8],
    ) -> Result<Arc<Block>, RunFileError> {
        if let Some(block) = self.cache.get(block_index) {
            return Ok(block);
        }
        let mut raw = vec![0u8; record.data_len as usize];
        pread_at(&self.backing, DATA, record.data_offset, &mut raw)?;
        let block = Arc::new(decode_block(first_key, &raw)?);
        self.cache.insert(block_index, Arc::clone(&block));
        Ok(block)
    }
}

fn pread_at(
    backing: &Backing,
    which: usize,
    offset: u64,
    out: &mut [u8],
) -> Result<(), RunFileError> {
    match backing {
        Backing::Building(b) => b.writers[which].pread(offset, out)?,
        Backing::Readable(r) => r[which].pread(offset, out)?,
        Backing::Converting => unreachable!("converting state is transient"),
    }
    Ok(())
}

impl RunFile for FlatFile {
    fn id(&self) -> u64 {
        self.id
    }

    fn entry_count(&self) -> u64 {
        self.entry_count
    }

    fn feed(&mut self, key: &[u8], value: &[u8]) -> Result<FeedOutcome, RunFileError> {
        let Backing::Building(builder) = &mut self.backing else {
            return Err(RunFileError::BadState("feed on a completed file".into()));
        };
        self.entry_count += 1;

        if builder.block_open {
            // Shared-prefix encode against the previous key.
            let max = key.len().min(builder.last_key.len());
            let mut prefix_len = 0;
            while prefix_len < max && key[prefix_len] == builder.last_key[prefix_len] {
                prefix_len += 1;
            }
            builder.scratch.clear();
            put_varint32(prefix_len as u32, &mut builder.scratch);
            put_varint32((key.len() - prefix_len) as u32, &mut builder.scratch);
            builder.scratch.extend_from_slice(&key[prefix_len..]);
        } else {
            // The first key of a block is stored verbatim in the
            // firstkeys file; only its value goes through the stream.
            builder.first_key.clear();
            builder.first_key.extend_from_slice(key);
            builder.scratch.clear();
        }
        builder.n_block_entries += 1;
        put_varint32(value.len() as u32, &mut builder.scratch);

        let staged = std::mem::take(&mut builder.scratch);
        builder.compress_chunk(&staged)?;
        builder.scratch = staged;
        builder.compress_chunk(value)?;

        if builder.compressed.len() >= BLOCK_COMPRESSED_BUDGET {
            builder.flush_block()?;
            Ok(FeedOutcome::BlockFlushed)
        } else {
            builder.block_open = true;
            builder.last_key.clear();
            builder.last_key.extend_from_slice(key);
            Ok(FeedOutcome::WantMore)
        }
    }

    fn done_feeding(&mut self) -> Result<bool, RunFileError> {
        let Backing::Building(builder) = &mut self.backing else {
            return Err(RunFileError::BadState(
                "done_feeding on a completed file".into(),
            ));
        };
        if builder.block_open {
            builder.flush_block()?;
        }

        // Trim the window padding, stamp the entry count, go readable.
        let builder = match std::mem::replace(&mut self.backing, Backing::Converting) {
            Backing::Building(b) => b,
            _ => unreachable!(),
        };
        let mut files = Vec::with_capacity(N_FILES);
        for writer in builder.writers {
            let (file, _len) = writer.finish()?;
            files.push(file);
        }
        {
            use std::os::unix::fs::FileExt;
            files[IDX].write_all_at(&self.entry_count.to_le_bytes(), 0)?;
        }
        let mut readers = Vec::with_capacity(N_FILES);
        for file in files {
            readers.push(MmapReader::open(file)?);
        }
        self.backing = Backing::Readable(
            readers
                .try_into()
                .unwrap_or_else(|_| unreachable!("exactly three readers")),
        );
        Ok(true)
    }

    fn build_step(&mut self) -> Result<bool, RunFileError> {
        // Flat files are fully built once feeding ends.
        Ok(true)
    }

    fn build_state(&self) -> Result<Vec<u8>, RunFileError> {
        let Backing::Building(builder) = &self.backing else {
            return Err(RunFileError::BadState(
                "build_state on a completed file".into(),
            ));
        };
        let mut state = Vec::with_capacity(BUILD_STATE_LEN);
        state.push(0); // phase; reserved for multi-phase formats
        for writer in &builder.writers {
            put_u64_le(writer.offset(), &mut state);
        }
        put_u64_le(self.entry_count, &mut state);
        Ok(state)
    }

    fn query(
        &mut self,
        cmp: &mut dyn FnMut(&[u8]) -> Ordering,
        value_out: &mut Vec<u8>,
    ) -> Result<bool, RunFileError> {
        let n_blocks = self.n_blocks();
        if n_blocks == 0 {
            return Ok(false);
        }

        // Biased binary search over block first keys: a target greater
        // than a block's first key may still live in that block, so the
        // lower bound stays inclusive.
        let mut first = 0u64;
        let mut n = n_blocks;
        let mut record = None;
        while n > 1 {
            let mid = first + n / 2;
            let mid_record = self.read_index_record(mid)?;
            let first_key = self.read_first_key(&mid_record)?;
            match cmp(&first_key) {
                Ordering::Less => {
                    n = mid - first;
                    record = None;
                }
                Ordering::Greater => {
                    n = first + n - mid;
                    first = mid;
                    record = Some(mid_record);
                }
                Ordering::Equal => {
                    // The target is exactly a block's first key, which is
                    // always that block's record 0.
                    let block = self.load_block(mid, &mid_record, &first_key)?;
                    value_out.clear();
                    value_out.extend_from_slice(&block.records[0].1);
                    return Ok(true);
                }
            }
        }

        let record = match record {
            Some(r) => r,
            None => self.read_index_record(first)?,
        };
        let first_key = self.read_first_key(&record)?;
        let block = self.load_block(first, &record, &first_key)?;

        let mut lo = 0usize;
        let mut n = block.records.len();
        while n > 1 {
            let mid = lo + n / 2;
            match cmp(&block.records[mid].0) {
                Ordering::Less => n = mid - lo,
                Ordering::Greater => {
                    n = lo + n - mid;
                    lo = mid;
                }
                Ordering::Equal => {
                    value_out.clear();
                    value_out.extend_from_slice(&block.records[mid].1);
                    return Ok(true);
                }
            }
        }
        if n == 1 && cmp(&block.records[lo].0) == Ordering::Equal {
            value_out.clear();
            value_out.extend_from_slice(&block.records[lo].1);
            return Ok(true);
        }
        Ok(false)
    }

    fn create_reader(&self) -> Result<Box<dyn RunReader>, RunFileError> {
        if matches!(self.backing, Backing::Building(_)) {
            return Err(RunFileError::BadState(
                "sequential reader on a file still being built".into(),
            ));
        }
        FlatReader::open(&self.paths, None)
    }

    fn recreate_reader(&self, state: &[u8]) -> Result<Box<dyn RunReader>, RunFileError> {
        if matches!(self.backing, Backing::Building(_)) {
            return Err(RunFileError::BadState(
                "sequential reader on a file still being built".into(),
            ));
        }
        FlatReader::open(&self.paths, Some(state))
    }

    fn destroy(self: Box<Self>, erase: bool) -> Result<(), RunFileError> {
        let paths = self.paths.clone();
        drop(self);
        if erase {
            for path in &paths {
                match fs::remove_file(path) {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Sequential reader
// ------------------------------------------------------------------------------------------------

/// Sequential block-at-a-time reader over the three files.
struct FlatReader {
    files: Option<[BufReader<File>; N_FILES]>,
    /// Byte positions the reader has consumed, per file.
    pos: [u64; N_FILES],
    /// Positions at the start of the currently loaded block.
    chunk_start: [u64; N_FILES],
    n_blocks: u64,
    next_block: u64,
    block: Option<Block>,
    record_index: usize,
    eof: bool,
}

impl FlatReader {
    fn open(
        paths: &[PathBuf; N_FILES],
        state: Option<&[u8]>,
    ) -> Result<Box<dyn RunReader>, RunFileError> {
        if let Some(state) = state {
            if state.is_empty() {
                return Err(RunFileError::BadState("empty flat reader state".into()));
            }
            if state[0] == 1 {
                if state.len() != 1 {
                    return Err(RunFileError::BadState(
                        "eof reader state carries no payload".into(),
                    ));
                }
                return Ok(Box::new(Self {
                    files: None,
                    pos: [0; N_FILES],
                    chunk_start: [0; N_FILES],
                    n_blocks: 0,
                    next_block: 0,
                    block: None,
                    record_index: 0,
                    eof: true,
                }));
            }
            if state[0] != 0 || state.len() != READER_STATE_LEN {
                return Err(RunFileError::BadState(format!(
                    "flat reader state must be 1 or {READER_STATE_LEN} bytes"
                )));
            }
        }

        let mut files = Vec::with_capacity(N_FILES);
        for path in paths {
            files.push(BufReader::new(File::open(path)?));
        }
        let index_len = files[IDX].get_ref().metadata()?.len();
        let n_blocks = (index_len - INDEX_HEADER_SIZE) / INDEX_RECORD_SIZE;

        let mut reader = Self {
            files: Some(
                files
                    .try_into()
                    .unwrap_or_else(|_| unreachable!("exactly three files")),
            ),
            pos: [0; N_FILES],
            chunk_start: [0; N_FILES],
            n_blocks,
            next_block: 0,
            block: None,
            record_index: 0,
            eof: false,
        };

        match state {
            None => {
                reader.seek_all([INDEX_HEADER_SIZE, 0, 0])?;
                reader.read_chunk()?;
                reader.record_index = 0;
            }
            Some(state) => {
                let mut cur = Cursor::new(state);
                cur.read_u8()?;
                let offsets = [cur.read_u64_le()?, cur.read_u64_le()?, cur.read_u64_le()?];
                let record_index = cur.read_u32_le()? as usize;
                if offsets[IDX] < INDEX_HEADER_SIZE
                    || (offsets[IDX] - INDEX_HEADER_SIZE) % INDEX_RECORD_SIZE != 0
                {
                    return Err(RunFileError::BadState(
                        "flat reader state has a misaligned index offset".into(),
                    ));
                }
                reader.next_block = (offsets[IDX] - INDEX_HEADER_SIZE) / INDEX_RECORD_SIZE;
                reader.seek_all(offsets)?;
                reader.read_chunk()?;
                match &reader.block {
                    Some(block) if record_index < block.records.len() => {
                        reader.record_index = record_index;
                    }
                    _ => {
                        return Err(RunFileError::BadState(
                            "flat reader state record index out of bounds".into(),
                        ));
                    }
                }
            }
        }
        Ok(Box::new(reader))
    }

    fn seek_all(&mut self, offsets: [u64; N_FILES]) -> Result<(), RunFileError> {
        let files = self.files.as_mut().expect("seek on eof reader");
        for (f, &offset) in files.iter_mut().zip(offsets.iter()) {
            f.seek(SeekFrom::Start(offset))?;
        }
        self.pos = offsets;
        Ok(())
    }

    fn read_from(&mut self, which: usize, out: &mut [u8]) -> Result<(), RunFileError> {
        let files = self.files.as_mut().expect("read on eof reader");
        files[which].read_exact(out)?;
        self.pos[which] += out.len() as u64;
        Ok(())
    }

    /// Loads the next block, or sets eof when all blocks are consumed.
    fn read_chunk(&mut self) -> Result<(), RunFileError> {
        self.block = None;
        if self.next_block == self.n_blocks {
            self.eof = true;
            return Ok(());
        }
        self.chunk_start = self.pos;

        let mut record_buf = [0u8; INDEX_RECORD_SIZE as usize];
        self.read_from(IDX, &mut record_buf)?;
        let record = IndexRecord::decode(&record_buf)?;

        let mut first_key = vec![0u8; record.firstkeys_len as usize];
        self.read_from(FK, &mut first_key)?;

        let mut raw = vec![0u8; record.data_len as usize];
        self.read_from(DATA, &mut raw)?;

        self.block = Some(decode_block(&first_key, &raw)?);
        self.next_block += 1;
        Ok(())
    }
}

impl RunReader for FlatReader {
    fn entry(&self) -> Option<(&[u8], &[u8])> {
        if self.eof {
            return None;
        }
        let block = self.block.as_ref()?;
        let (key, value) = &block.records[self.record_index];
        Some((key, value))
    }

    fn advance(&mut self) -> Result<(), RunFileError> {
        if self.eof {
            return Ok(());
        }
        let n = self.block.as_ref().map_or(0, |b| b.records.len());
        self.record_index += 1;
        if self.record_index >= n {
            self.read_chunk()?;
            self.record_index = 0;
        }
        Ok(())
    }

    fn save_state(&self) -> Vec<u8> {
        if self.eof {
            return vec![1];
        }
        let mut state = Vec::with_capacity(READER_STATE_LEN);
        state.push(0);
        for &offset in &self.chunk_start {
            put_u64_le(offset, &mut state);
        }
        put_u32_le(self.record_index as u32, &mut state);
        state
    }
}
