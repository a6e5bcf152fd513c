//! Sliding-window mmap writer and whole-file mmap reader.
//!
//! Run files are written append-only through a 512 KiB memory-mapped
//! window aligned on a 512 KiB boundary. Crossing the window unmaps it,
//! extends the file if the next window lies past EOF, and remaps; writes
//! larger than a window are copied whole windows at a time. Positioned
//! reads against a writer split into a conventional `pread` for bytes
//! below the window and a memcpy from the window for bytes still resident
//! in it, so a file can be queried while it is being built.
//!
//! Completed files under 1 MiB are read through one whole-file read-only
//! map; larger ones fall back to `pread`.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use memmap2::{Mmap, MmapMut, MmapOptions};
use thiserror::Error;

/// Size and alignment of a writer window. Must be a power of two and a
/// multiple of the page size.
pub const WRITER_WINDOW_SIZE: u64 = 512 * 1024;

/// Files at least this large are read with `pread` instead of one map.
pub const MAX_READ_MMAP: u64 = 1024 * 1024;

/// Errors from the mmap helpers.
#[derive(Debug, Error)]
pub enum MmapError {
    /// Underlying I/O failure (`mmap`, `ftruncate`, `pread`).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read ran past the written extent of the file.
    #[error("premature end of file (offset {offset}, length {length})")]
    PrematureEof {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        length: usize,
    },
}

fn window_base(offset: u64) -> u64 {
    offset & !(WRITER_WINDOW_SIZE - 1)
}

// ------------------------------------------------------------------------------------------------
// MmapWriter
// ------------------------------------------------------------------------------------------------

/// Append-only writer over a sliding mmap window.
pub struct MmapWriter {
    file: File,
    file_size: u64,
    window_offset: u64,
    window: MmapMut,
    cursor: usize,
}

impl MmapWriter {
    /// Opens a writer positioned at `offset` (0 for a fresh file, a saved
    /// offset when resuming a half-built file).
    ///
    /// The file is grown to cover the window; the padding past the logical
    /// end is trimmed again by [`MmapWriter::finish`].
    pub fn create_at(file: File, offset: u64) -> Result<Self, MmapError> {
        let window_offset = window_base(offset);
        let mut file_size = file.metadata()?.len();
        if window_offset + WRITER_WINDOW_SIZE > file_size {
            file.set_len(window_offset + WRITER_WINDOW_SIZE)?;
            file_size = window_offset + WRITER_WINDOW_SIZE;
        }
        let window = Self::map_window(&file, window_offset)?;
        Ok(Self {
            file,
            file_size,
            window_offset,
            window,
            cursor: (offset - window_offset) as usize,
        })
    }

    // Safety: the map covers a region this writer exclusively owns; run
    // files have a single writer and no other writable mapping exists.
    fn map_window(file: &File, offset: u64) -> Result<MmapMut, MmapError> {
        let window = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(WRITER_WINDOW_SIZE as usize)
                .map_mut(file)?
        };
        Ok(window)
    }

    /// Logical write position: bytes written so far.
    pub fn offset(&self) -> u64 {
        self.window_offset + self.cursor as u64
    }

    fn advance_window(&mut self) -> Result<(), MmapError> {
        self.window_offset += WRITER_WINDOW_SIZE;
        if self.window_offset + WRITER_WINDOW_SIZE > self.file_size {
            self.file.set_len(self.window_offset + WRITER_WINDOW_SIZE)?;
            self.file_size = self.window_offset + WRITER_WINDOW_SIZE;
        }
        self.cursor = 0;
        self.window = Self::map_window(&self.file, self.window_offset)?;
        Ok(())
    }

    /// Appends `data` at the current position.
    pub fn write(&mut self, data: &[u8]) -> Result<(), MmapError> {
        let len = data.len();
        if self.cursor + len < WRITER_WINDOW_SIZE as usize {
            self.window[self.cursor..self.cursor + len].copy_from_slice(data);
            self.cursor += len;
            return Ok(());
        }

        let mut written = WRITER_WINDOW_SIZE as usize - self.cursor;
        self.window[self.cursor..].copy_from_slice(&data[..written]);
        self.advance_window()?;

        while written + WRITER_WINDOW_SIZE as usize <= len {
            let end = written + WRITER_WINDOW_SIZE as usize;
            self.window.copy_from_slice(&data[written..end]);
            written = end;
            self.advance_window()?;
        }
        if written < len {
            let rest = len - written;
            self.window[..rest].copy_from_slice(&data[written..]);
            self.cursor = rest;
        }
        Ok(())
    }

    /// Positioned read of already-written bytes.
    ///
    /// Bytes below the window come from `pread`; bytes inside the window
    /// are copied from the mapping.
    pub fn pread(&self, offset: u64, out: &mut [u8]) -> Result<(), MmapError> {
        let length = out.len();
        debug_assert!(offset + length as u64 <= self.offset());
        if length == 0 {
            return Ok(());
        }
        if offset + length as u64 <= self.window_offset {
            self.read_exact_at(out, offset)
        } else if offset < self.window_offset {
            let below = (self.window_offset - offset) as usize;
            self.read_exact_at(&mut out[..below], offset)?;
            out[below..].copy_from_slice(&self.window[..length - below]);
            Ok(())
        } else {
            let start = (offset - self.window_offset) as usize;
            out.copy_from_slice(&self.window[start..start + length]);
            Ok(())
        }
    }

    fn read_exact_at(&self, out: &mut [u8], offset: u64) -> Result<(), MmapError> {
        self.file.read_exact_at(out, offset).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                MmapError::PrematureEof {
                    offset,
                    length: out.len(),
                }
            } else {
                MmapError::Io(e)
            }
        })
    }

    /// Unmaps the window, trims the file to the logical length, and hands
    /// the file back.
    pub fn finish(self) -> Result<(File, u64), MmapError> {
        let len = self.offset();
        let file = self.file;
        drop(self.window);
        file.set_len(len)?;
        Ok((file, len))
    }

}

// ------------------------------------------------------------------------------------------------
// MmapReader
// ------------------------------------------------------------------------------------------------

/// Random-access reader over a completed file.
pub struct MmapReader {
    file: File,
    file_size: u64,
    // None for empty files and files at or above `MAX_READ_MMAP`.
    map: Option<Mmap>,
}

impl MmapReader {
    /// Wraps `file`, mapping it whole when it is small enough.
    pub fn open(file: File) -> Result<Self, MmapError> {
        let file_size = file.metadata()?.len();
        let map = if file_size > 0 && file_size < MAX_READ_MMAP {
            // Safety: the file is immutable from here on; the mapping is
            // read-only and its bounds are checked before every slice.
            Some(unsafe { Mmap::map(&file)? })
        } else {
            None
        };
        Ok(Self {
            file,
            file_size,
            map,
        })
    }

    /// Size of the underlying file in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Positioned read; the range must lie within the file.
    pub fn pread(&self, offset: u64, out: &mut [u8]) -> Result<(), MmapError> {
        if out.is_empty() {
            return Ok(());
        }
        if offset + out.len() as u64 > self.file_size {
            return Err(MmapError::PrematureEof {
                offset,
                length: out.len(),
            });
        }
        match &self.map {
            Some(map) => {
                let start = offset as usize;
                out.copy_from_slice(&map[start..start + out.len()]);
                Ok(())
            }
            None => self.file.read_exact_at(out, offset).map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    MmapError::PrematureEof {
                        offset,
                        length: out.len(),
                    }
                } else {
                    MmapError::Io(e)
                }
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    #[test]
    fn writer_round_trips_across_windows() {
        let file = tempfile().unwrap();
        let mut writer = MmapWriter::create_at(file, 0).unwrap();

        // Three windows worth of patterned data, written in ragged pieces.
        let total = WRITER_WINDOW_SIZE as usize * 3 + 12345;
        let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        let mut at = 0;
        for piece in [7usize, 4096, 600_000, 1, total] {
            let end = (at + piece).min(total);
            writer.write(&data[at..end]).unwrap();
            at = end;
            if at == total {
                break;
            }
        }
        assert_eq!(writer.offset(), total as u64);

        // Read back spanning the pread/memcpy seam at the last window base.
        let mut out = vec![0u8; 60_000];
        let probe = WRITER_WINDOW_SIZE as usize * 3 - 50_000;
        writer.pread(probe as u64, &mut out).unwrap();
        assert_eq!(&out[..], &data[probe..probe + 60_000]);

        let (file, len) = writer.finish().unwrap();
        assert_eq!(len, total as u64);
        assert_eq!(file.metadata().unwrap().len(), total as u64);

        let reader = MmapReader::open(file).unwrap();
        let mut tail = vec![0u8; 12345];
        reader
            .pread((total - 12345) as u64, &mut tail)
            .unwrap();
        assert_eq!(&tail[..], &data[total - 12345..]);
    }

    #[test]
    fn writer_resumes_at_saved_offset() {
        let file = tempfile().unwrap();
        let mut writer = MmapWriter::create_at(file, 0).unwrap();
        writer.write(b"hello ").unwrap();
        let offset = writer.offset();
        let (file, _) = writer.finish().unwrap();

        let mut writer = MmapWriter::create_at(file, offset).unwrap();
        writer.write(b"world").unwrap();
        let (file, len) = writer.finish().unwrap();
        assert_eq!(len, 11);

        let reader = MmapReader::open(file).unwrap();
        let mut out = [0u8; 11];
        reader.pread(0, &mut out).unwrap();
        assert_eq!(&out, b"hello world");
    }

    #[test]
    fn empty_file_reader_rejects_reads() {
        let file = tempfile().unwrap();
        let reader = MmapReader::open(file).unwrap();
        assert_eq!(reader.file_size(), 0);
        let mut out = [0u8; 1];
        assert!(matches!(
            reader.pread(0, &mut out),
            Err(MmapError::PrematureEof { .. })
        ));
        reader.pread(0, &mut []).unwrap();
    }
}
