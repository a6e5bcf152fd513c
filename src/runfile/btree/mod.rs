//! B-tree run format: a multi-level prefix-compressed tree.
//!
//! The alternative to the flat format for read-dominated loads. A run is
//! three files sharing one id:
//!
//! - `<id>.btree` — a checksummed header followed by the tree's node
//!   levels, root level first in the header's table, leaves last.
//! - `<id>.value` — leaf values, back to back in key order.
//! - `<id>.buffer` — a transient build-time message queue, deleted once
//!   the tree is finished.
//!
//! Leaves and interiors share one node encoding: `n_entries: u16 LE`,
//! `payload_base: varint`, then per record `varint(prefix_len)
//! varint(suffix_len) suffix varint(payload_len)`. For a leaf the
//! payloads are value bytes at `payload_base` (absolute) in the value
//! file; for an interior they are child nodes at `payload_base`
//! (section-relative) in the next level down, each `payload_len` bytes
//! long. A node's separator is its first key.
//!
//! ## Bottom-up build
//!
//! The single streaming pass writes leaf nodes as entries arrive and
//! defers everything above them: each finished node emits a
//! `BranchValue(level, separator, child_len)` message to the buffer
//! queue, and `LevelEnded(level)` closes a level. After feeding ends,
//! each `build_step` call drains one level's messages into the nodes of
//! the level above, until a level is a single node — the root. The
//! queue is strictly FIFO, so messages stay grouped by level without any
//! sorting.
//!
//! Unlike the flat format, a half-built tree is not queryable and its
//! build state does not capture partial progress: a resumed build simply
//! starts over. Feeding therefore never reports a flushed block.


use std::cmp::Ordering;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32;
use tracing::{debug, trace};

use crate::encoding::{
    get_varint32, get_varint64, put_varint32, put_varint64, Cursor, EncodingError,
};
use crate::runfile::mmap::{MmapReader, MmapWriter};
use crate::runfile::{FeedOutcome, FileHints, RunFile, RunFileError, RunReader};

/// Extensions of the backing files; `buffer` is build-time scratch.
pub const EXTENSIONS: &[&str] = &["btree", "value", "buffer"];

/// First four bytes of the `.btree` header.
const BTREE_MAGIC: u32 = 0x4274_1e55;

/// Fixed header region: magic, height, flags, crc, entry count, then a
/// `(offset, len)` slot per possible level.
const MAX_LEVELS: usize = 16;
const HEADER_SIZE: usize = 4 + 4 + 4 + 4 + 8 + MAX_LEVELS * 16;

/// Entries per leaf node.
const VALUES_PER_LEAF: usize = 64;

/// Children per interior node.
const BRANCHES_PER_NODE: usize = 32;

/// Header flag bits; reserved for implicitly sized keys and values.
const FLAG_KEY_FIXED: u32 = 1 << 0;
const FLAG_VALUE_FIXED: u32 = 1 << 1;

// Build-queue message tags.
const MSG_BRANCH_VALUE: u8 = 1;
const MSG_LEVEL_ENDED: u8 = 2;

// ------------------------------------------------------------------------------------------------
// Header
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Header {
    height: u32,
    n_entries: u64,
    /// Per-level `(absolute offset, byte length)`, root first.
    levels: Vec<(u64, u64)>,
}

impl Header {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(&BTREE_MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.height.to_le_bytes());
        let flags = 0u32; // FLAG_KEY_FIXED / FLAG_VALUE_FIXED unused
        buf.extend_from_slice(&flags.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // crc slot
        buf.extend_from_slice(&self.n_entries.to_le_bytes());
        for level in 0..MAX_LEVELS {
            let (off, len) = self.levels.get(level).copied().unwrap_or((0, 0));
            buf.extend_from_slice(&off.to_le_bytes());
            buf.extend_from_slice(&len.to_le_bytes());
        }
        debug_assert_eq!(buf.len(), HEADER_SIZE);
        let mut hasher = Crc32::new();
        hasher.update(&buf);
        let crc = hasher.finalize();
        buf[12..16].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, RunFileError> {
        let mut cur = Cursor::new(buf);
        let magic = cur.read_u32_le()?;
        if magic != BTREE_MAGIC {
            return Err(RunFileError::Corrupt(format!(
                "bad btree magic {magic:#010x}"
            )));
        }
        let height = cur.read_u32_le()?;
        let flags = cur.read_u32_le()?;
        if flags & !(FLAG_KEY_FIXED | FLAG_VALUE_FIXED) != 0 {
            return Err(RunFileError::Corrupt(format!(
                "unknown btree flags {flags:#x}"
            )));
        }
        let stored_crc = cur.read_u32_le()?;
        let n_entries = cur.read_u64_le()?;
        if height as usize > MAX_LEVELS {
            return Err(RunFileError::Corrupt(format!(
                "btree height {height} exceeds the level table"
            )));
        }
        let mut levels = Vec::with_capacity(height as usize);
        for _ in 0..height {
            let off = cur.read_u64_le()?;
            let len = cur.read_u64_le()?;
            levels.push((off, len));
        }

        let mut zeroed = buf[..HEADER_SIZE].to_vec();
        zeroed[12..16].copy_from_slice(&0u32.to_le_bytes());
        let mut hasher = Crc32::new();
        hasher.update(&zeroed);
        if hasher.finalize() != stored_crc {
            return Err(RunFileError::Corrupt("btree header checksum mismatch".into()));
        }
        Ok(Self {
            height,
            n_entries,
            levels,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Node encoding
// ------------------------------------------------------------------------------------------------

struct NodeRecord {
    key: Vec<u8>,
    payload_len: u64,
}

struct Node {
    payload_base: u64,
    records: Vec<NodeRecord>,
    encoded_len: usize,
}

/// Decodes one node from the front of `buf`; `UnexpectedEof` means the
/// caller must supply more bytes.
fn decode_node(buf: &[u8]) -> Result<Node, EncodingError> {
    let mut cur = Cursor::new(buf);
    let n = u16::from_le_bytes([cur.read_u8()?, cur.read_u8()?]);
    let mut at = cur.position();
    let (payload_base, used) = get_varint64(&buf[at..]).map_err(rebase_eof(at, buf.len()))?;
    at += used;

    let mut records = Vec::with_capacity(n as usize);
    let mut last_key: Vec<u8> = Vec::new();
    for _ in 0..n {
        let (prefix_len, used) = get_varint32(&buf[at..]).map_err(rebase_eof(at, buf.len()))?;
        at += used;
        let (suffix_len, used) = get_varint32(&buf[at..]).map_err(rebase_eof(at, buf.len()))?;
        at += used;
        let (prefix_len, suffix_len) = (prefix_len as usize, suffix_len as usize);
        if prefix_len > last_key.len() {
            return Err(EncodingError::UnexpectedEof {
                needed: prefix_len,
                available: last_key.len(),
            });
        }
        if at + suffix_len > buf.len() {
            return Err(EncodingError::UnexpectedEof {
                needed: suffix_len,
                available: buf.len() - at,
            });
        }
        let mut key = Vec::with_capacity(prefix_len + suffix_len);
        key.extend_from_slice(&last_key[..prefix_len]);
        key.extend_from_slice(&buf[at..at + suffix_len]);
        at += suffix_len;
        let (payload_len, used) = get_varint64(&buf[at..]).map_err(rebase_eof(at, buf.len()))?;
        at += used;
        last_key = key.clone();
        records.push(NodeRecord { key, payload_len });
    }
    Ok(Node {
        payload_base,
        records,
        encoded_len: at,
    })
}

// Varint errors inside a node are reported against the whole buffer so
// that the grow-and-retry reader can tell truncation from corruption.
fn rebase_eof(at: usize, len: usize) -> impl Fn(EncodingError) -> EncodingError {
    move |e| match e {
        EncodingError::UnexpectedEof { needed, .. } => EncodingError::UnexpectedEof {
            needed: at + needed,
            available: len,
        },
        other => other,
    }
}

/// Accumulates one node's records during a build.
struct NodeBuilder {
    payload_base: u64,
    first_key: Vec<u8>,
    last_key: Vec<u8>,
    records: Vec<u8>,
    n: u16,
}

impl NodeBuilder {
    fn new(payload_base: u64) -> Self {
        Self {
            payload_base,
            first_key: Vec::new(),
            last_key: Vec::new(),
            records: Vec::new(),
            n: 0,
        }
    }

    fn push(&mut self, key: &[u8], payload_len: u64) {
        if self.n == 0 {
            self.first_key = key.to_vec();
        }
        let max = key.len().min(self.last_key.len());
        let mut prefix_len = 0;
        while prefix_len < max && key[prefix_len] == self.last_key[prefix_len] {
            prefix_len += 1;
        }
        put_varint32(prefix_len as u32, &mut self.records);
        put_varint32((key.len() - prefix_len) as u32, &mut self.records);
        self.records.extend_from_slice(&key[prefix_len..]);
        put_varint64(payload_len, &mut self.records);
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.n += 1;
    }

    fn finish(&mut self) -> (Vec<u8>, Vec<u8>) {
        let mut node = Vec::with_capacity(2 + 10 + self.records.len());
        node.extend_from_slice(&self.n.to_le_bytes());
        put_varint64(self.payload_base, &mut node);
        node.extend_from_slice(&self.records);
        let first_key = std::mem::take(&mut self.first_key);
        self.records.clear();
        self.last_key.clear();
        self.n = 0;
        (node, first_key)
    }
}

// ------------------------------------------------------------------------------------------------
// Build-time message queue
// ------------------------------------------------------------------------------------------------

/// FIFO of framed messages on the scratch file: `tag:1 len:4 payload`.
struct ScratchQueue {
    file: File,
    read_pos: u64,
    write_pos: u64,
}

impl ScratchQueue {
    fn create(path: &Path) -> Result<Self, io::Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file,
            read_pos: 0,
            write_pos: 0,
        })
    }

    fn push(&mut self, tag: u8, payload: &[u8]) -> Result<(), io::Error> {
        let mut frame = Vec::with_capacity(5 + payload.len());
        frame.push(tag);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        self.file.write_all_at(&frame, self.write_pos)?;
        self.write_pos += frame.len() as u64;
        Ok(())
    }

    fn pop(&mut self) -> Result<Option<(u8, Vec<u8>)>, io::Error> {
        if self.read_pos == self.write_pos {
            return Ok(None);
        }
        let mut head = [0u8; 5];
        self.file.read_exact_at(&mut head, self.read_pos)?;
        let len = u32::from_le_bytes([head[1], head[2], head[3], head[4]]) as usize;
        let mut payload = vec![0u8; len];
        self.file.read_exact_at(&mut payload, self.read_pos + 5)?;
        self.read_pos += 5 + len as u64;
        Ok(Some((head[0], payload)))
    }
}

fn branch_payload(level: u16, child_len: u64, key: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + 8 + key.len());
    payload.extend_from_slice(&level.to_le_bytes());
    payload.extend_from_slice(&child_len.to_le_bytes());
    payload.extend_from_slice(key);
    payload
}

// ------------------------------------------------------------------------------------------------
// BtreeFile
// ------------------------------------------------------------------------------------------------

struct Feeding {
    btree: MmapWriter,
    value: MmapWriter,
    queue: ScratchQueue,
    leaf: NodeBuilder,
    n_leaf_nodes: u64,
}

struct Building {
    btree: MmapWriter,
    value_file: File,
    queue: ScratchQueue,
    /// Levels finished so far, leaf level first.
    levels: Vec<(u64, u64)>,
    current_level: u16,
}

struct Readable {
    btree: MmapReader,
    value: MmapReader,
    header: Header,
}

enum Backing {
    Feeding(Feeding),
    Building(Building),
    Readable(Readable),
    Converting,
}

/// A B-tree run in any lifecycle state.
pub struct BtreeFile {
    id: u64,
    entry_count: u64,
    paths: [PathBuf; 3],
    backing: Backing,
}

fn file_paths(dir: &Path, id: u64) -> [PathBuf; 3] {
    [
        dir.join(format!("{id:016x}.{}", EXTENSIONS[0])),
        dir.join(format!("{id:016x}.{}", EXTENSIONS[1])),
        dir.join(format!("{id:016x}.{}", EXTENSIONS[2])),
    ]
}

impl BtreeFile {
    /// Begins writing a fresh run.
    pub fn create(dir: &Path, id: u64, _hints: &FileHints) -> Result<Self, RunFileError> {
        let paths = file_paths(dir, id);
        let open = |path: &Path| -> Result<File, RunFileError> {
            Ok(OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?)
        };
        let mut btree = MmapWriter::create_at(open(&paths[0])?, 0)?;
        let value = MmapWriter::create_at(open(&paths[1])?, 0)?;
        // Reserve the header region; the real header lands at finalize.
        btree.write(&[0u8; HEADER_SIZE])?;
        let queue = ScratchQueue::create(&paths[2])?;
        let value_base = value.offset();
        Ok(Self {
            id,
            entry_count: 0,
            paths,
            backing: Backing::Feeding(Feeding {
                btree,
                value,
                queue,
                leaf: NodeBuilder::new(value_base),
                n_leaf_nodes: 0,
            }),
        })
    }

    /// Resumes a build from serialized state.
    ///
    /// The build state deliberately captures no partial progress (see the
    /// module docs), so resuming restarts the tree from scratch.
    pub fn open_building(dir: &Path, id: u64, state: &[u8]) -> Result<Self, RunFileError> {
        if state != [0u8] {
            return Err(RunFileError::BadState(
                "btree build state must be the single phase byte".into(),
            ));
        }
        Self::create(dir, id, &FileHints::default())
    }

    /// Opens a completed run read-only.
    pub fn open(dir: &Path, id: u64) -> Result<Self, RunFileError> {
        let paths = file_paths(dir, id);
        let btree = MmapReader::open(File::open(&paths[0])?)?;
        let value = MmapReader::open(File::open(&paths[1])?)?;
        let mut header_buf = vec![0u8; HEADER_SIZE];
        btree.pread(0, &mut header_buf)?;
        let header = Header::decode(&header_buf)?;
        Ok(Self {
            id,
            entry_count: header.n_entries,
            paths,
            backing: Backing::Readable(Readable {
                btree,
                value,
                header,
            }),
        })
    }

    fn finish_leaf(feeding: &mut Feeding) -> Result<(), RunFileError> {
        let (node, first_key) = feeding.leaf.finish();
        feeding.btree.write(&node)?;
        feeding.n_leaf_nodes += 1;
        feeding
            .queue
            .push(
                MSG_BRANCH_VALUE,
                &branch_payload(1, node.len() as u64, &first_key),
            )?;
        feeding.leaf = NodeBuilder::new(feeding.value.offset());
        Ok(())
    }

    fn finalize(
        &mut self,
        btree: MmapWriter,
        value_file: File,
        levels: Vec<(u64, u64)>,
    ) -> Result<(), RunFileError> {
        if levels.len() > MAX_LEVELS {
            return Err(RunFileError::Corrupt(format!(
                "btree would need {} levels, more than the header holds",
                levels.len()
            )));
        }
        let (btree_file, _) = btree.finish()?;
        let header = Header {
            height: levels.len() as u32,
            n_entries: self.entry_count,
            // Built bottom-up, stored root-first.
            levels: levels.iter().rev().copied().collect(),
        };
        btree_file.write_all_at(&header.encode(), 0)?;

        if let Err(e) = fs::remove_file(&self.paths[2]) {
            if e.kind() != io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        debug!(
            id = self.id,
            height = header.height,
            entries = header.n_entries,
            "btree finalized"
        );
        self.backing = Backing::Readable(Readable {
            btree: MmapReader::open(btree_file)?,
            value: MmapReader::open(value_file)?,
            header,
        });
        Ok(())
    }
}

impl RunFile for BtreeFile {
    fn id(&self) -> u64 {
        self.id
    }

    fn entry_count(&self) -> u64 {
        self.entry_count
    }

    fn feed(&mut self, key: &[u8], value: &[u8]) -> Result<FeedOutcome, RunFileError> {
        let Backing::Feeding(feeding) = &mut self.backing else {
            return Err(RunFileError::BadState("feed outside the feed phase".into()));
        };
        feeding.value.write(value)?;
        feeding.leaf.push(key, value.len() as u64);
        self.entry_count += 1;
        if feeding.leaf.n as usize >= VALUES_PER_LEAF {
            Self::finish_leaf(feeding)?;
        }
        // Never a flushed block: a half-built tree is not resumable.
        Ok(FeedOutcome::WantMore)
    }

    fn done_feeding(&mut self) -> Result<bool, RunFileError> {
        let Backing::Feeding(feeding) = &mut self.backing else {
            return Err(RunFileError::BadState(
                "done_feeding outside the feed phase".into(),
            ));
        };
        if feeding.leaf.n > 0 {
            Self::finish_leaf(feeding)?;
        }
        feeding
            .queue
            .push(MSG_LEVEL_ENDED, &1u16.to_le_bytes())?;

        let Backing::Feeding(feeding) = std::mem::replace(&mut self.backing, Backing::Converting)
        else {
            unreachable!()
        };
        let Feeding {
            btree,
            value,
            queue,
            n_leaf_nodes,
            ..
        } = feeding;
        let leaf_section = (HEADER_SIZE as u64, btree.offset() - HEADER_SIZE as u64);
        let (value_file, _) = value.finish()?;

        if n_leaf_nodes <= 1 {
            // The lone leaf (or nothing at all) is already the root.
            let levels = if n_leaf_nodes == 0 {
                Vec::new()
            } else {
                vec![leaf_section]
            };
            self.finalize(btree, value_file, levels)?;
            Ok(true)
        } else {
            self.backing = Backing::Building(Building {
                btree,
                value_file,
                queue,
                levels: vec![leaf_section],
                current_level: 1,
            });
            Ok(false)
        }
    }

    fn build_step(&mut self) -> Result<bool, RunFileError> {
        let Backing::Building(building) = &mut self.backing else {
            // Formats that finished in `done_feeding` have nothing to do.
            return match &self.backing {
                Backing::Readable(_) => Ok(true),
                _ => Err(RunFileError::BadState(
                    "build_step outside the build phase".into(),
                )),
            };
        };

        let level = building.current_level;
        let section_start = building.btree.offset();
        let mut node = NodeBuilder::new(0);
        let mut child_cursor = 0u64;
        let mut nodes_written = 0u64;

        loop {
            let Some((tag, payload)) = building.queue.pop()? else {
                return Err(RunFileError::Corrupt(
                    "btree build queue ended without a level terminator".into(),
                ));
            };
            match tag {
                MSG_BRANCH_VALUE => {
                    let mut cur = Cursor::new(&payload);
                    let msg_level = u16::from_le_bytes([cur.read_u8()?, cur.read_u8()?]);
                    if msg_level != level {
                        return Err(RunFileError::Corrupt(format!(
                            "btree build queue out of order: level {msg_level} inside {level}"
                        )));
                    }
                    let child_len = cur.read_u64_le()?;
                    let key = cur.read_bytes(cur.remaining())?;
                    if node.n == 0 {
                        node.payload_base = child_cursor;
                    }
                    node.push(key, child_len);
                    child_cursor += child_len;
                    if node.n as usize >= BRANCHES_PER_NODE {
                        let (bytes, first_key) = node.finish();
                        building.btree.write(&bytes)?;
                        nodes_written += 1;
                        building.queue.push(
                            MSG_BRANCH_VALUE,
                            &branch_payload(level + 1, bytes.len() as u64, &first_key),
                        )?;
                    }
                }
                MSG_LEVEL_ENDED => {
                    let mut cur = Cursor::new(&payload);
                    let msg_level = u16::from_le_bytes([cur.read_u8()?, cur.read_u8()?]);
                    if msg_level != level {
                        return Err(RunFileError::Corrupt(format!(
                            "btree level terminator {msg_level} inside level {level}"
                        )));
                    }
                    if node.n > 0 {
                        let (bytes, first_key) = node.finish();
                        building.btree.write(&bytes)?;
                        nodes_written += 1;
                        building.queue.push(
                            MSG_BRANCH_VALUE,
                            &branch_payload(level + 1, bytes.len() as u64, &first_key),
                        )?;
                    }
                    break;
                }
                other => {
                    return Err(RunFileError::Corrupt(format!(
                        "unknown btree build message tag {other}"
                    )));
                }
            }
        }

        building
            .levels
            .push((section_start, building.btree.offset() - section_start));
        building
            .queue
            .push(MSG_LEVEL_ENDED, &(level + 1).to_le_bytes())?;
        trace!(level, nodes = nodes_written, "btree level built");

        if nodes_written == 1 {
            let Backing::Building(building) =
                std::mem::replace(&mut self.backing, Backing::Converting)
            else {
                unreachable!()
            };
            let Building {
                btree,
                value_file,
                levels,
                ..
            } = building;
            self.finalize(btree, value_file, levels)?;
            Ok(true)
        } else {
            building.current_level = level + 1;
            Ok(false)
        }
    }

    fn build_state(&self) -> Result<Vec<u8>, RunFileError> {
        match &self.backing {
            Backing::Feeding(_) | Backing::Building(_) => Ok(vec![0]),
            _ => Err(RunFileError::BadState(
                "build_state on a completed file".into(),
            )),
        }
    }

    fn query(
        &mut self,
        cmp: &mut dyn FnMut(&[u8]) -> Ordering,
        value_out: &mut Vec<u8>,
    ) -> Result<bool, RunFileError> {
        let Backing::Readable(readable) = &self.backing else {
            return Err(RunFileError::BadState(
                "query on a btree still being built".into(),
            ));
        };
        if readable.header.height == 0 {
            return Ok(false);
        }

        // Descend from the root, at each interior picking the last child
        // whose separator is at or before the target.
        let mut offset = readable.header.levels[0].0;
        let mut len = readable.header.levels[0].1;
        for depth in 0..readable.header.height as usize {
            let mut buf = vec![0u8; len as usize];
            readable.btree.pread(offset, &mut buf)?;
            let node =
                decode_node(&buf).map_err(|e| RunFileError::Corrupt(e.to_string()))?;

            let leaf = depth + 1 == readable.header.height as usize;
            if leaf {
                let mut value_offset = node.payload_base;
                for record in &node.records {
                    match cmp(&record.key) {
                        Ordering::Less => return Ok(false),
                        Ordering::Equal => {
                            value_out.clear();
                            value_out.resize(record.payload_len as usize, 0);
                            readable.value.pread(value_offset, value_out)?;
                            return Ok(true);
                        }
                        Ordering::Greater => value_offset += record.payload_len,
                    }
                }
                return Ok(false);
            }

            let mut chosen: Option<(u64, u64)> = None;
            let mut child_offset = node.payload_base;
            for record in &node.records {
                match cmp(&record.key) {
                    Ordering::Less => break,
                    _ => {
                        chosen = Some((child_offset, record.payload_len));
                        child_offset += record.payload_len;
                    }
                }
            }
            let Some((rel, child_len)) = chosen else {
                return Ok(false); // target sorts before every key
            };
            let section = readable.header.levels[depth + 1];
            offset = section.0 + rel;
            len = child_len;
        }
        unreachable!("descent always ends at a leaf");
    }

    fn create_reader(&self) -> Result<Box<dyn RunReader>, RunFileError> {
        let Backing::Readable(readable) = &self.backing else {
            return Err(RunFileError::BadState(
                "reader on a btree still being built".into(),
            ));
        };
        BtreeReader::open(&self.paths, &readable.header, None)
    }

    fn recreate_reader(&self, state: &[u8]) -> Result<Box<dyn RunReader>, RunFileError> {
        let Backing::Readable(readable) = &self.backing else {
            return Err(RunFileError::BadState(
                "reader on a btree still being built".into(),
            ));
        };
        BtreeReader::open(&self.paths, &readable.header, Some(state))
    }

    fn destroy(self: Box<Self>, erase: bool) -> Result<(), RunFileError> {
        let paths = self.paths.clone();
        drop(self);
        if erase {
            for path in &paths {
                if let Err(e) = fs::remove_file(path) {
                    if e.kind() != io::ErrorKind::NotFound {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Sequential reader
// ------------------------------------------------------------------------------------------------

/// One decoded leaf with absolute value positions.
struct LeafView {
    records: Vec<(Vec<u8>, u64, u64)>, // key, value offset, value len
    encoded_len: u64,
}

fn load_leaf(file: &File, offset: u64, section_end: u64) -> Result<LeafView, RunFileError> {
    let available = section_end - offset;
    let mut cap = (4096u64).min(available) as usize;
    loop {
        let mut buf = vec![0u8; cap];
        file.read_exact_at(&mut buf, offset)?;
        match decode_node(&buf) {
            Ok(node) => {
                let mut records = Vec::with_capacity(node.records.len());
                let mut value_offset = node.payload_base;
                for record in node.records {
                    records.push((record.key, value_offset, record.payload_len));
                    value_offset += record.payload_len;
                }
                return Ok(LeafView {
                    records,
                    encoded_len: node.encoded_len as u64,
                });
            }
            Err(EncodingError::UnexpectedEof { .. }) if (cap as u64) < available => {
                cap = ((cap as u64) * 2).min(available) as usize;
            }
            Err(e) => return Err(RunFileError::Corrupt(e.to_string())),
        }
    }
}

/// Sequential cursor over the leaf level plus the value file.
struct BtreeReader {
    btree: File,
    value: File,
    leaf_start: u64,
    leaf_end: u64,
    node_offset: u64,
    node: Option<LeafView>,
    record_index: usize,
    value_buf: Vec<u8>,
    eof: bool,
}

impl BtreeReader {
    fn open(
        paths: &[PathBuf; 3],
        header: &Header,
        state: Option<&[u8]>,
    ) -> Result<Box<dyn RunReader>, RunFileError> {
        let (leaf_start, leaf_end) = match header.levels.last() {
            Some(&(off, len)) => (off, off + len),
            None => (HEADER_SIZE as u64, HEADER_SIZE as u64),
        };

        if let Some(state) = state {
            if state == [1u8] {
                return Ok(Box::new(Self {
                    btree: File::open(&paths[0])?,
                    value: File::open(&paths[1])?,
                    leaf_start,
                    leaf_end,
                    node_offset: leaf_end,
                    node: None,
                    record_index: 0,
                    value_buf: Vec::new(),
                    eof: true,
                }));
            }
            if state.len() != 1 + 8 + 4 || state[0] != 0 {
                return Err(RunFileError::BadState(
                    "btree reader state must be 1 or 13 bytes".into(),
                ));
            }
        }

        let mut reader = Self {
            btree: File::open(&paths[0])?,
            value: File::open(&paths[1])?,
            leaf_start,
            leaf_end,
            node_offset: leaf_start,
            node: None,
            record_index: 0,
            value_buf: Vec::new(),
            eof: false,
        };

        match state {
            None => {
                reader.load_current_node()?;
                reader.position(0)?;
            }
            Some(state) => {
                let mut cur = Cursor::new(state);
                cur.read_u8()?;
                let node_offset = cur.read_u64_le()?;
                let record_index = cur.read_u32_le()? as usize;
                if node_offset < leaf_start || node_offset >= leaf_end {
                    return Err(RunFileError::BadState(
                        "btree reader state offset outside the leaf level".into(),
                    ));
                }
                reader.node_offset = node_offset;
                reader.load_current_node()?;
                let n = reader.node.as_ref().map_or(0, |n| n.records.len());
                if record_index >= n {
                    return Err(RunFileError::BadState(
                        "btree reader state record index out of bounds".into(),
                    ));
                }
                reader.position(record_index)?;
            }
        }
        Ok(Box::new(reader))
    }

    fn load_current_node(&mut self) -> Result<(), RunFileError> {
        if self.node_offset >= self.leaf_end {
            self.node = None;
            self.eof = true;
            return Ok(());
        }
        self.node = Some(load_leaf(&self.btree, self.node_offset, self.leaf_end)?);
        Ok(())
    }

    fn position(&mut self, record_index: usize) -> Result<(), RunFileError> {
        self.record_index = record_index;
        if let Some(node) = &self.node {
            let (_, value_offset, value_len) = &node.records[record_index];
            self.value_buf.resize(*value_len as usize, 0);
            self.value
                .read_exact_at(&mut self.value_buf, *value_offset)?;
        }
        Ok(())
    }
}

impl RunReader for BtreeReader {
    fn entry(&self) -> Option<(&[u8], &[u8])> {
        if self.eof {
            return None;
        }
        let node = self.node.as_ref()?;
        let (key, _, _) = &node.records[self.record_index];
        Some((key, &self.value_buf))
    }

    fn advance(&mut self) -> Result<(), RunFileError> {
        if self.eof {
            return Ok(());
        }
        let (n, encoded_len) = match &self.node {
            Some(node) => (node.records.len(), node.encoded_len),
            None => return Ok(()),
        };
        if self.record_index + 1 < n {
            self.position(self.record_index + 1)?;
            return Ok(());
        }
        self.node_offset += encoded_len;
        self.load_current_node()?;
        if !self.eof {
            self.position(0)?;
        }
        Ok(())
    }

    fn save_state(&self) -> Vec<u8> {
        if self.eof {
            return vec![1];
        }
        let mut state = Vec::with_capacity(13);
        state.push(0);
        state.extend_from_slice(&self.node_offset.to_le_bytes());
        state.extend_from_slice(&(self.record_index as u32).to_le_bytes());
        state
    }
}
