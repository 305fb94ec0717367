//! Log-structured key/value engine
//!
//! Values are appended to numbered segment files and located through an
//! in-memory key directory that is rebuilt by replaying the segments on open.
//! Overwrites and deletes leave dead records behind until [`LogStore::merge`]
//! rewrites the live set into fresh segments.
//!
//! Record layout (little endian):
//!
//! ```text
//! checksum u32 | key_len u32 | value_len u32 | key | value
//! ```
//!
//! `value_len == u32::MAX` marks a tombstone with no value bytes. The checksum
//! is the first four bytes of SHA-256 over the two lengths, the key and the
//! value, and is verified on every read.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::error::{StoreError, StoreResult};

const HEADER_LEN: u64 = 12;
const TOMBSTONE: u32 = u32::MAX;
const MAX_KEY_LEN: u32 = 1024;
const SEGMENT_EXTENSION: &str = "log";

pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 256 * 1024 * 1024;

// ============================================================================
// Options and statistics
// ============================================================================

#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Largest accepted value, must be below the tombstone marker
    pub max_value_size: u32,
    /// Size after which the active segment is rotated
    pub max_segment_size: u64,
    /// Fsync after every append
    pub sync_writes: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            max_value_size: 64 * 1024 * 1024,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            sync_writes: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStats {
    pub keys: usize,
    pub segments: usize,
    pub total_bytes: u64,
    pub dead_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub live_keys: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub segments_removed: usize,
}

// ============================================================================
// Segments
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct EntryLocation {
    segment: u64,
    /// Offset of the record header within the segment
    offset: u64,
    key_len: u32,
    value_len: u32,
}

impl EntryLocation {
    fn record_len(&self) -> u64 {
        HEADER_LEN + self.key_len as u64 + self.value_len as u64
    }
}

/// Segment currently accepting appends
struct Segment {
    id: u64,
    path: PathBuf,
    file: File,
    len: u64,
}

impl Segment {
    fn create(dir: &Path, id: u64) -> io::Result<Self> {
        let path = segment_path(dir, id);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            id,
            path,
            file,
            len: 0,
        })
    }

    fn reopen(path: PathBuf, id: u64) -> io::Result<Self> {
        let file = OpenOptions::new().append(true).open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self { id, path, file, len })
    }

    /// Append one record and return its offset. A failed append is
    /// truncated away so the segment stays replayable.
    fn append(&mut self, key: &str, value: Option<&[u8]>, sync: bool) -> io::Result<u64> {
        let offset = self.len;
        let value_len = match value {
            Some(v) => v.len() as u32,
            None => TOMBSTONE,
        };
        let key_len = key.len() as u32;
        let checksum = record_checksum(key_len, value_len, key.as_bytes(), value);

        let mut head = Vec::with_capacity(HEADER_LEN as usize + key.len());
        head.extend_from_slice(&checksum.to_le_bytes());
        head.extend_from_slice(&key_len.to_le_bytes());
        head.extend_from_slice(&value_len.to_le_bytes());
        head.extend_from_slice(key.as_bytes());

        let written = self.file.write_all(&head).and_then(|_| match value {
            Some(v) => self.file.write_all(v),
            None => Ok(()),
        });
        let written = written.and_then(|_| if sync { self.file.sync_data() } else { Ok(()) });

        if let Err(e) = written {
            if let Err(truncate_err) = self.file.set_len(offset) {
                tracing::error!(
                    segment = self.id,
                    offset,
                    error = %truncate_err,
                    "Failed to truncate partial record"
                );
            }
            return Err(e);
        }

        self.len = offset + head.len() as u64 + value.map_or(0, |v| v.len() as u64);
        Ok(offset)
    }
}

fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:09}.{}", id, SEGMENT_EXTENSION))
}

fn record_checksum(key_len: u32, value_len: u32, key: &[u8], value: Option<&[u8]>) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(key_len.to_le_bytes());
    hasher.update(value_len.to_le_bytes());
    hasher.update(key);
    if let Some(value) = value {
        hasher.update(value);
    }
    let digest = hasher.finalize();
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

fn list_segments(dir: &Path) -> StoreResult<BTreeMap<u64, PathBuf>> {
    let mut segments = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXTENSION) {
            continue;
        }
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok());
        match id {
            Some(id) => {
                segments.insert(id, path);
            }
            None => tracing::warn!(path = %path.display(), "Ignoring unrecognized segment file"),
        }
    }
    Ok(segments)
}

// ============================================================================
// Replay
// ============================================================================

/// Outcome of scanning one segment
struct Replay {
    dead_bytes: u64,
    /// Offset of the first unreadable record, if the scan stopped early
    torn_at: Option<u64>,
}

/// Read the key directory entries out of one segment. Value bytes are skipped,
/// not read; checksums are verified lazily on `get`.
fn replay_segment(
    id: u64,
    path: &Path,
    keydir: &mut HashMap<String, EntryLocation>,
) -> StoreResult<Replay> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut offset = 0u64;
    let mut dead_bytes = 0u64;

    while offset < file_len {
        if file_len - offset < HEADER_LEN {
            return Ok(Replay {
                dead_bytes,
                torn_at: Some(offset),
            });
        }

        let mut header = [0u8; HEADER_LEN as usize];
        reader.read_exact(&mut header)?;
        let key_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let value_len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        let body_len = key_len as u64 + if value_len == TOMBSTONE { 0 } else { value_len as u64 };

        if key_len == 0 || key_len > MAX_KEY_LEN || offset + HEADER_LEN + body_len > file_len {
            return Ok(Replay {
                dead_bytes,
                torn_at: Some(offset),
            });
        }

        let mut key_bytes = vec![0u8; key_len as usize];
        reader.read_exact(&mut key_bytes)?;
        let Ok(key) = String::from_utf8(key_bytes) else {
            return Ok(Replay {
                dead_bytes,
                torn_at: Some(offset),
            });
        };

        if value_len == TOMBSTONE {
            if let Some(old) = keydir.remove(&key) {
                dead_bytes += old.record_len();
            }
            dead_bytes += HEADER_LEN + key_len as u64;
        } else {
            reader.seek_relative(value_len as i64)?;
            let location = EntryLocation {
                segment: id,
                offset,
                key_len,
                value_len,
            };
            if let Some(old) = keydir.insert(key, location) {
                dead_bytes += old.record_len();
            }
        }

        offset += HEADER_LEN + body_len;
    }

    Ok(Replay {
        dead_bytes,
        torn_at: None,
    })
}

// ============================================================================
// Log Store
// ============================================================================

/// Append-only key/value store over a directory of segment files.
///
/// Not internally synchronized; callers wrap it in a lock.
pub struct LogStore {
    dir: PathBuf,
    options: LogOptions,
    keydir: HashMap<String, EntryLocation>,
    segments: BTreeMap<u64, PathBuf>,
    active: Segment,
    dead_bytes: u64,
}

impl LogStore {
    /// Open (or create) a store in `dir`, replaying existing segments
    pub fn open(dir: impl AsRef<Path>, options: LogOptions) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        if options.max_value_size == TOMBSTONE {
            return Err(StoreError::Config(
                "max value size collides with the tombstone marker".to_string(),
            ));
        }

        fs::create_dir_all(&dir).map_err(|e| {
            StoreError::Config(format!(
                "failed to create data directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let mut segments = list_segments(&dir)?;
        let last_id = segments.keys().next_back().copied();
        let mut keydir = HashMap::new();
        let mut dead_bytes = 0u64;

        for (&id, path) in &segments {
            let replay = replay_segment(id, path, &mut keydir)?;
            dead_bytes += replay.dead_bytes;

            if let Some(torn_at) = replay.torn_at {
                if Some(id) == last_id {
                    tracing::warn!(
                        segment = id,
                        offset = torn_at,
                        "Truncating torn record at end of log"
                    );
                    OpenOptions::new().write(true).open(path)?.set_len(torn_at)?;
                } else {
                    tracing::warn!(
                        segment = id,
                        offset = torn_at,
                        "Unreadable record in sealed segment, ignoring remainder"
                    );
                }
            }
        }

        let active = match last_id {
            Some(id) => {
                let path = segment_path(&dir, id);
                let segment = Segment::reopen(path, id)?;
                if segment.len >= options.max_segment_size {
                    let next = Segment::create(&dir, id + 1)?;
                    segments.insert(next.id, next.path.clone());
                    next
                } else {
                    segment
                }
            }
            None => {
                let segment = Segment::create(&dir, 1)?;
                segments.insert(segment.id, segment.path.clone());
                segment
            }
        };

        tracing::debug!(
            path = %dir.display(),
            keys = keydir.len(),
            segments = segments.len(),
            dead_bytes,
            "Log store opened"
        );

        Ok(Self {
            dir,
            options,
            keydir,
            segments,
            active,
            dead_bytes,
        })
    }

    pub fn len(&self) -> usize {
        self.keydir.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keydir.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.keydir.contains_key(key)
    }

    pub fn max_value_size(&self) -> u32 {
        self.options.max_value_size
    }

    /// Read a value, verifying its checksum
    pub fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let Some(location) = self.keydir.get(key) else {
            return Ok(None);
        };
        let path = self.segments.get(&location.segment).ok_or_else(|| {
            StoreError::Corrupt(format!("segment {} missing for key {}", location.segment, key))
        })?;

        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(location.offset))?;

        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        let checksum = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let key_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let value_len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if key_len != location.key_len || value_len != location.value_len {
            return Err(StoreError::Corrupt(format!("record header mismatch for key {}", key)));
        }

        let mut stored_key = vec![0u8; key_len as usize];
        file.read_exact(&mut stored_key)?;
        if stored_key != key.as_bytes() {
            return Err(StoreError::Corrupt(format!("record key mismatch for key {}", key)));
        }

        let mut value = vec![0u8; value_len as usize];
        file.read_exact(&mut value)?;

        if record_checksum(key_len, value_len, &stored_key, Some(&value)) != checksum {
            return Err(StoreError::Corrupt(format!("checksum mismatch for key {}", key)));
        }

        Ok(Some(value))
    }

    pub fn put(&mut self, key: &str, value: &[u8]) -> StoreResult<()> {
        let value_len = u32::try_from(value.len())
            .ok()
            .filter(|len| *len <= self.options.max_value_size)
            .ok_or(StoreError::ValueTooLarge {
                size: value.len() as u64,
                max: self.options.max_value_size as u64,
            })?;
        let key_len = self.check_key(key)?;

        let record_len = HEADER_LEN + key_len as u64 + value_len as u64;
        self.rotate_if_needed(record_len)?;

        let offset = self.active.append(key, Some(value), self.options.sync_writes)?;
        let location = EntryLocation {
            segment: self.active.id,
            offset,
            key_len,
            value_len,
        };
        if let Some(old) = self.keydir.insert(key.to_string(), location) {
            self.dead_bytes += old.record_len();
        }
        Ok(())
    }

    /// Remove a key. Returns false when it was not present.
    pub fn delete(&mut self, key: &str) -> StoreResult<bool> {
        if !self.keydir.contains_key(key) {
            return Ok(false);
        }
        let key_len = self.check_key(key)?;
        self.rotate_if_needed(HEADER_LEN + key_len as u64)?;
        self.active.append(key, None, self.options.sync_writes)?;

        if let Some(old) = self.keydir.remove(key) {
            self.dead_bytes += old.record_len() + HEADER_LEN + key_len as u64;
        }
        Ok(true)
    }

    /// Live keys starting with `prefix`, sorted
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .keydir
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn sync(&mut self) -> StoreResult<()> {
        self.active.file.sync_all()?;
        Ok(())
    }

    pub fn stats(&self) -> LogStats {
        LogStats {
            keys: self.keydir.len(),
            segments: self.segments.len(),
            total_bytes: self.disk_size(),
            dead_bytes: self.dead_bytes,
        }
    }

    /// Rewrite every live entry into fresh segments and delete the old ones.
    ///
    /// The new segments are numbered above every existing one, so a crash at
    /// any point replays to the same logical contents.
    pub fn merge(&mut self) -> StoreResult<MergeStats> {
        let bytes_before = self.disk_size();
        let first_id = self.active.id + 1;

        let mut created: Vec<PathBuf> = Vec::new();
        let merged = self.write_merged(first_id, &mut created);
        let (new_keydir, new_segments, new_active) = match merged {
            Ok(parts) => parts,
            Err(e) => {
                for path in created {
                    if let Err(remove_err) = fs::remove_file(&path) {
                        tracing::warn!(
                            path = %path.display(),
                            error = %remove_err,
                            "Failed to remove partial merge segment"
                        );
                    }
                }
                return Err(e);
            }
        };

        let live_keys = new_keydir.len();
        let old_segments = std::mem::replace(&mut self.segments, new_segments);
        self.keydir = new_keydir;
        self.active = new_active;
        self.dead_bytes = 0;

        let segments_removed = old_segments.len();
        for (id, path) in old_segments {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(segment = id, error = %e, "Failed to remove merged segment");
            }
        }

        let stats = MergeStats {
            live_keys,
            bytes_before,
            bytes_after: self.disk_size(),
            segments_removed,
        };
        tracing::debug!(
            live_keys = stats.live_keys,
            bytes_before = stats.bytes_before,
            bytes_after = stats.bytes_after,
            "Log merge complete"
        );
        Ok(stats)
    }

    #[allow(clippy::type_complexity)]
    fn write_merged(
        &self,
        first_id: u64,
        created: &mut Vec<PathBuf>,
    ) -> StoreResult<(HashMap<String, EntryLocation>, BTreeMap<u64, PathBuf>, Segment)> {
        let mut keys: Vec<&String> = self.keydir.keys().collect();
        keys.sort();

        let mut writer = Segment::create(&self.dir, first_id)?;
        created.push(writer.path.clone());
        let mut keydir = HashMap::with_capacity(keys.len());
        let mut segments = BTreeMap::new();

        for key in keys {
            let value = self
                .get(key)?
                .ok_or_else(|| StoreError::Corrupt(format!("live key {} vanished", key)))?;
            let record_len = HEADER_LEN + key.len() as u64 + value.len() as u64;

            if writer.len > 0 && writer.len + record_len > self.options.max_segment_size {
                writer.file.sync_all()?;
                let next = Segment::create(&self.dir, writer.id + 1)?;
                created.push(next.path.clone());
                let sealed = std::mem::replace(&mut writer, next);
                segments.insert(sealed.id, sealed.path);
            }

            let offset = writer.append(key, Some(&value), false)?;
            keydir.insert(
                key.clone(),
                EntryLocation {
                    segment: writer.id,
                    offset,
                    key_len: key.len() as u32,
                    value_len: value.len() as u32,
                },
            );
        }

        writer.file.sync_all()?;
        segments.insert(writer.id, writer.path.clone());
        Ok((keydir, segments, writer))
    }

    fn check_key(&self, key: &str) -> StoreResult<u32> {
        match u32::try_from(key.len()) {
            Ok(len) if len > 0 && len <= MAX_KEY_LEN => Ok(len),
            _ => Err(StoreError::Config(format!("invalid key length {}", key.len()))),
        }
    }

    fn rotate_if_needed(&mut self, record_len: u64) -> StoreResult<()> {
        if self.active.len == 0 || self.active.len + record_len <= self.options.max_segment_size {
            return Ok(());
        }
        self.active.file.sync_all()?;
        let next = Segment::create(&self.dir, self.active.id + 1)?;
        self.segments.insert(next.id, next.path.clone());
        tracing::debug!(segment = next.id, "Rotated active segment");
        self.active = next;
        Ok(())
    }

    fn disk_size(&self) -> u64 {
        self.segments
            .values()
            .filter_map(|path| fs::metadata(path).ok())
            .map(|meta| meta.len())
            .sum()
    }
}
