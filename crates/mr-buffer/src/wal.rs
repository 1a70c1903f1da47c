//! Single-file write-ahead log keyed by a monotonically increasing index.
//!
//! Frame layout (little endian):
//!
//! ```text
//! kind: u8 | index: u64 | len: u32 | checksum: [u8; 8] | payload: [u8; len]
//! ```
//!
//! `checksum` is the first eight bytes of SHA-256 over `kind | index | payload`.
//! An `Entry` frame stores one record. A `TruncateFront` frame records that
//! every entry below its index was discarded; the dead prefix is reclaimed by
//! rewriting the file once it outgrows the live entries.
//!
//! On open the file is scanned from the start. A short or mismatching frame at
//! the very end is treated as an interrupted append and cut off; any other
//! inconsistency fails with [`WalError::Corrupt`].

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::WalError;

const HEADER_LEN: u64 = 1 + 8 + 4 + 8;
const MAX_RECORD_LEN: usize = u32::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FrameKind {
    Entry = 1,
    TruncateFront = 2,
}

impl FrameKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(FrameKind::Entry),
            2 => Some(FrameKind::TruncateFront),
            _ => None,
        }
    }
}

/// Options for opening a log.
#[derive(Debug, Clone)]
pub struct WalOptions {
    /// fsync after every write and truncation.
    pub sync: bool,
    /// Minimum number of dead frames before the file is rewritten.
    pub compact_threshold: usize,
}

impl Default for WalOptions {
    fn default() -> Self {
        WalOptions {
            sync: true,
            compact_threshold: 1024,
        }
    }
}

impl WalOptions {
    pub fn without_sync(mut self) -> Self {
        self.sync = false;
        self
    }

    pub fn with_compact_threshold(mut self, frames: usize) -> Self {
        self.compact_threshold = frames;
        self
    }
}

/// An open write-ahead log.
#[derive(Debug)]
pub struct Wal {
    path: PathBuf,
    file: File,
    options: WalOptions,
    /// Index of the oldest live entry, 0 when the log holds none.
    first_index: u64,
    /// Index of the newest live entry, 0 when the log holds none.
    last_index: u64,
    /// File offsets of live entries; `offsets[i]` holds `first_index + i`.
    offsets: VecDeque<u64>,
    file_len: u64,
    /// Frames still in the file that no longer hold live entries.
    dead_frames: usize,
}

fn checksum(kind: FrameKind, index: u64, payload: &[u8]) -> [u8; 8] {
    let mut hasher = Sha256::new();
    hasher.update([kind as u8]);
    hasher.update(index.to_le_bytes());
    hasher.update(payload);
    let digest = hasher.finalize();
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

fn encode_frame(kind: FrameKind, index: u64, payload: &[u8]) -> Result<Vec<u8>, WalError> {
    if payload.len() > MAX_RECORD_LEN {
        return Err(WalError::TooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN as usize + payload.len());
    frame.push(kind as u8);
    frame.extend_from_slice(&index.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&checksum(kind, index, payload));
    frame.extend_from_slice(payload);
    Ok(frame)
}

struct Header {
    kind: u8,
    index: u64,
    len: u32,
    checksum: [u8; 8],
}

fn decode_header(buf: &[u8; HEADER_LEN as usize]) -> Header {
    let mut index = [0u8; 8];
    index.copy_from_slice(&buf[1..9]);
    let mut len = [0u8; 4];
    len.copy_from_slice(&buf[9..13]);
    let mut sum = [0u8; 8];
    sum.copy_from_slice(&buf[13..21]);
    Header {
        kind: buf[0],
        index: u64::from_le_bytes(index),
        len: u32::from_le_bytes(len),
        checksum: sum,
    }
}

fn ensure_parent_dir(path: &Path) -> Result<(), WalError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

impl Wal {
    /// Open or create the log at `path`.
    pub fn open(path: impl Into<PathBuf>, options: WalOptions) -> Result<Self, WalError> {
        let path = path.into();
        ensure_parent_dir(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut wal = Wal {
            path,
            file,
            options,
            first_index: 0,
            last_index: 0,
            offsets: VecDeque::new(),
            file_len: 0,
            dead_frames: 0,
        };
        wal.scan()?;
        debug!(
            path = %wal.path.display(),
            first = wal.first_index,
            last = wal.last_index,
            "opened write-ahead log"
        );
        Ok(wal)
    }

    fn corrupt(&self, offset: u64, reason: impl Into<String>) -> WalError {
        WalError::Corrupt {
            path: self.path.clone(),
            offset,
            reason: reason.into(),
        }
    }

    fn scan(&mut self) -> Result<(), WalError> {
        let file_len = self.file.metadata()?.len();
        let mut reader = BufReader::new(&self.file);
        reader.seek(SeekFrom::Start(0))?;

        let mut offset = 0u64;
        let mut torn = None;
        let mut first = 0u64;
        let mut last = 0u64;
        let mut offsets = VecDeque::new();
        let mut dead = 0usize;

        while offset < file_len {
            if file_len - offset < HEADER_LEN {
                torn = Some("short frame header");
                break;
            }
            let mut hbuf = [0u8; HEADER_LEN as usize];
            reader.read_exact(&mut hbuf)?;
            let header = decode_header(&hbuf);
            let frame_end = offset + HEADER_LEN + u64::from(header.len);
            if frame_end > file_len {
                torn = Some("short frame payload");
                break;
            }
            let mut payload = vec![0u8; header.len as usize];
            reader.read_exact(&mut payload)?;

            let kind = match FrameKind::from_byte(header.kind) {
                Some(kind) if checksum(kind, header.index, &payload) == header.checksum => kind,
                _ if frame_end == file_len => {
                    torn = Some("checksum mismatch in final frame");
                    break;
                }
                Some(_) => return Err(self.corrupt(offset, "checksum mismatch")),
                None => {
                    return Err(self.corrupt(
                        offset,
                        format!("unknown frame kind {}", header.kind),
                    ))
                }
            };

            match kind {
                FrameKind::Entry => {
                    if header.index == 0 || (last != 0 && header.index != last + 1) {
                        return Err(self.corrupt(
                            offset,
                            format!(
                                "entry index {} does not follow {}",
                                header.index, last
                            ),
                        ));
                    }
                    if first == 0 {
                        first = header.index;
                    }
                    last = header.index;
                    offsets.push_back(offset);
                }
                FrameKind::TruncateFront => {
                    if first == 0 || header.index < first || header.index > last {
                        return Err(self.corrupt(
                            offset,
                            format!(
                                "truncation to {} outside [{}, {}]",
                                header.index, first, last
                            ),
                        ));
                    }
                    let removed = (header.index - first) as usize;
                    offsets.drain(..removed);
                    first = header.index;
                    dead += removed + 1;
                }
            }
            offset = frame_end;
        }
        drop(reader);

        if let Some(reason) = torn {
            warn!(
                path = %self.path.display(),
                valid_len = offset,
                file_len,
                reason,
                "discarding incomplete tail of write-ahead log"
            );
            self.file.set_len(offset)?;
            self.file.sync_data()?;
        }

        self.first_index = first;
        self.last_index = last;
        self.offsets = offsets;
        self.file_len = offset;
        self.dead_frames = dead;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Index of the oldest live entry, 0 if the log holds none.
    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    /// Index of the newest entry, 0 if the log holds none.
    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Size of the log file in bytes.
    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    fn append_frame(&mut self, frame: &[u8]) -> Result<u64, WalError> {
        let at = self.file_len;
        let written = self.file.write_all(frame).and_then(|()| {
            if self.options.sync {
                self.file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(err) = written {
            self.discard_partial_frame();
            return Err(err.into());
        }
        self.file_len += frame.len() as u64;
        Ok(at)
    }

    /// Cut the file back to the end of the last complete frame, so a failed
    /// append leaves nothing behind for later frames to land after.
    fn discard_partial_frame(&mut self) {
        if let Err(err) = self.file.set_len(self.file_len) {
            warn!(
                path = %self.path.display(),
                valid_len = self.file_len,
                error = %err,
                "failed to roll back partial frame"
            );
        }
    }

    /// Append `data` at `index`, which must be `last_index() + 1`.
    pub fn write(&mut self, index: u64, data: &[u8]) -> Result<(), WalError> {
        let expected = self.last_index + 1;
        if index != expected {
            return Err(WalError::OutOfOrder {
                expected,
                got: index,
            });
        }
        let frame = encode_frame(FrameKind::Entry, index, data)?;
        let at = self.append_frame(&frame)?;
        if self.first_index == 0 {
            self.first_index = index;
        }
        self.last_index = index;
        self.offsets.push_back(at);
        Ok(())
    }

    /// Read the entry stored at `index`.
    pub fn read(&mut self, index: u64) -> Result<Vec<u8>, WalError> {
        let not_found = WalError::NotFound {
            index,
            first: self.first_index,
            last: self.last_index,
        };
        if self.first_index == 0 || index < self.first_index || index > self.last_index {
            return Err(not_found);
        }
        let offset = match self.offsets.get((index - self.first_index) as usize) {
            Some(offset) => *offset,
            None => return Err(not_found),
        };

        self.file.seek(SeekFrom::Start(offset))?;
        let mut hbuf = [0u8; HEADER_LEN as usize];
        self.file.read_exact(&mut hbuf)?;
        let header = decode_header(&hbuf);
        if header.kind != FrameKind::Entry as u8 || header.index != index {
            return Err(self.corrupt(offset, format!("expected entry {} at offset", index)));
        }
        let mut payload = vec![0u8; header.len as usize];
        self.file.read_exact(&mut payload)?;
        if checksum(FrameKind::Entry, index, &payload) != header.checksum {
            return Err(self.corrupt(offset, "checksum mismatch"));
        }
        Ok(payload)
    }

    /// Discard every entry below `index`. At least one entry always remains.
    pub fn truncate_front(&mut self, index: u64) -> Result<(), WalError> {
        if self.first_index == 0 || index < self.first_index || index > self.last_index {
            return Err(WalError::OutOfRange {
                index,
                first: self.first_index,
                last: self.last_index,
            });
        }
        if index == self.first_index {
            return Ok(());
        }

        let frame = encode_frame(FrameKind::TruncateFront, index, &[])?;
        self.append_frame(&frame)?;
        let removed = (index - self.first_index) as usize;
        self.offsets.drain(..removed);
        self.first_index = index;
        self.dead_frames += removed + 1;

        if self.dead_frames >= self.options.compact_threshold
            && self.dead_frames >= self.offsets.len()
        {
            self.compact()?;
        }
        Ok(())
    }

    /// Rewrite the file with live entries only.
    pub fn compact(&mut self) -> Result<(), WalError> {
        let temp_path = self.compaction_path();
        let mut new_offsets = VecDeque::with_capacity(self.offsets.len());
        {
            let temp = File::create(&temp_path)?;
            let mut writer = BufWriter::new(temp);
            let mut at = 0u64;
            if self.first_index != 0 {
                for index in self.first_index..=self.last_index {
                    let payload = self.read(index)?;
                    let frame = encode_frame(FrameKind::Entry, index, &payload)?;
                    writer.write_all(&frame)?;
                    new_offsets.push_back(at);
                    at += frame.len() as u64;
                }
            }
            let temp = writer.into_inner().map_err(|e| e.into_error())?;
            temp.sync_all()?;
        }

        fs::rename(&temp_path, &self.path)?;
        self.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        self.file_len = self.file.metadata()?.len();
        self.offsets = new_offsets;
        debug!(
            path = %self.path.display(),
            reclaimed_frames = self.dead_frames,
            "compacted write-ahead log"
        );
        self.dead_frames = 0;
        Ok(())
    }

    fn compaction_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".compact");
        self.path.with_file_name(name)
    }

    /// Flush and close the log.
    pub fn close(self) -> Result<(), WalError> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Delete the log file at `path` if it exists.
    pub fn remove(path: &Path) -> Result<(), WalError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
