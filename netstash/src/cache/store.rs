//! Bounded LRU cache of data/sidecar file pairs on local disk.
//!
//! Every entry is a 64-bit key mapping to two files in the cache
//! directory: `<key-in-hex>` with the resource bytes and `<key-in-hex>.i`
//! with the sidecar. A compact `index` file records `{key, size, time}`
//! triples in fixed 24-byte little-endian slots; `size == 0` marks a
//! tombstone whose slot is reused by later inserts. The index is the only
//! source of truth on open: the directory is never scanned.

use crate::cache::url_key::key_file_name;
use crate::util::clock::{Clock, SystemClock};
use crate::util::staged::append_suffix;
use log::warn;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Size of one index slot: `u64` key, `u64` size, `u64` time.
pub const RECORD_SIZE: u64 = 24;

/// LRU cache over files in a single directory, bounded to `max_size`
/// bytes (data plus sidecar). A `max_size` of zero disables eviction.
///
/// All methods assume exclusive access; the owner is expected to wrap the
/// cache in a `Mutex` and hold it across whole calls.
pub struct LruFileCache<C: Clock = SystemClock> {
    dir: PathBuf,
    max_size: u64,
    clock: C,
    state: Option<State>,
}

struct State {
    index: File,
    entries: HashMap<u64, Entry>,
    /// Access sequence → key. Ascending iteration yields least recently
    /// used entries first.
    order: BTreeMap<u64, u64>,
    free: Vec<u64>,
    size: u64,
    max_position: u64,
    next_seq: u64,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    offset: u64,
    size: u64,
    seq: u64,
}

impl LruFileCache<SystemClock> {
    pub fn open(dir: impl Into<PathBuf>, max_size: u64) -> io::Result<Self> {
        Self::with_clock(dir, max_size, SystemClock)
    }
}

impl<C: Clock> LruFileCache<C> {
    pub fn with_clock(dir: impl Into<PathBuf>, max_size: u64, clock: C) -> io::Result<Self> {
        let mut cache = Self {
            dir: dir.into(),
            max_size,
            clock,
            state: None,
        };
        cache.state = Some(cache.open_state()?);
        Ok(cache)
    }

    /// Path of the data file for `key`, resident or not.
    pub fn data_path(&self, key: u64) -> PathBuf {
        self.dir.join(key_file_name(key))
    }

    /// Path of the sidecar file for `key`.
    pub fn sidecar_path(&self, key: u64) -> PathBuf {
        append_suffix(&self.data_path(key), ".i")
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Number of live entries.
    pub fn entry_count(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.entries.len())
    }

    /// Sum of the live entries' sizes.
    pub fn total_size(&self) -> u64 {
        self.state.as_ref().map_or(0, |s| s.size)
    }

    /// Returns the data-file path for `key` and, when the key is
    /// resident, marks it most recently used and rewrites its slot's
    /// `time` with the current wall clock.
    pub fn get_file(&mut self, key: u64) -> io::Result<PathBuf> {
        let path = self.data_path(key);
        let now = self.clock.now_millis();
        let state = self.state_mut()?;
        if let Some(entry) = state.entries.get_mut(&key) {
            state.index.seek(SeekFrom::Start(entry.offset + 16))?;
            state.index.write_all(&now.to_le_bytes())?;
            state.order.remove(&entry.seq);
            entry.seq = state.next_seq;
            state.next_seq += 1;
            state.order.insert(entry.seq, key);
        }
        Ok(path)
    }

    /// Accounts (or re-accounts) the files of `key`, evicting least
    /// recently used entries until the total fits `max_size`.
    ///
    /// The recorded timestamp is the data file's mtime, so whoever wrote
    /// the file determines its age; a filesystem reporting wrong mtimes
    /// can reorder the LRU on reopen. A missing or empty data file turns
    /// the record into a tombstone.
    pub fn update(&mut self, key: u64, path: &Path) -> io::Result<()> {
        let data_meta = fs::metadata(path).ok();
        let sidecar_len = fs::metadata(append_suffix(path, ".i")).map_or(0, |m| m.len());
        let data_len = data_meta.as_ref().map_or(0, |m| m.len());
        let incoming = data_len + sidecar_len;
        let time = data_meta
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or_else(|| self.clock.now_millis(), |d| d.as_millis() as u64);
        let max_size = self.max_size;
        let dir = self.dir.clone();
        let state = self.state_mut()?;

        let existing = state.entries.remove(&key);
        if let Some(entry) = &existing {
            state.order.remove(&entry.seq);
            state.size -= entry.size;
        }

        if data_len == 0 {
            if let Some(entry) = existing {
                write_record(&mut state.index, entry.offset, key, 0, time)?;
                state.free.push(entry.offset);
            }
            return Ok(());
        }

        while max_size > 0 && state.size + incoming > max_size {
            let Some((&seq, &lru_key)) = state.order.iter().next() else {
                break;
            };
            state.order.remove(&seq);
            let entry = state
                .entries
                .remove(&lru_key)
                .expect("ordered key without entry");
            let stored_size = evict_slot(&mut state.index, entry.offset)?;
            state.free.push(entry.offset);
            state.size = state.size.saturating_sub(stored_size);
            remove_entry_files(&dir, lru_key);
        }

        let offset = match existing {
            Some(entry) => entry.offset,
            None => state.free.pop().unwrap_or_else(|| {
                let offset = state.max_position;
                state.max_position += RECORD_SIZE;
                offset
            }),
        };
        write_record(&mut state.index, offset, key, incoming, time)?;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.order.insert(seq, key);
        state.entries.insert(
            key,
            Entry {
                offset,
                size: incoming,
                seq,
            },
        );
        state.size += incoming;
        Ok(())
    }

    /// Flushes and closes the index, dropping all in-memory state. Later
    /// calls fail until the cache is reopened through [`Self::clear`].
    pub fn close(&mut self) -> io::Result<()> {
        if let Some(state) = self.state.take() {
            state.index.sync_all()?;
        }
        Ok(())
    }

    /// Closes the cache, deletes the whole directory, and reopens empty.
    pub fn clear(&mut self) -> io::Result<()> {
        self.close()?;
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        self.state = Some(self.open_state()?);
        Ok(())
    }

    fn open_state(&self) -> io::Result<State> {
        fs::create_dir_all(&self.dir)?;
        let mut index = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.dir.join("index"))?;

        let file_len = index.metadata()?.len();
        // A crash can leave a trailing partial record; it is treated as
        // free space past the end.
        let max_position = file_len - file_len % RECORD_SIZE;
        index.seek(SeekFrom::Start(0))?;
        let mut records = vec![0u8; max_position as usize];
        index.read_exact(&mut records)?;

        let mut live: Vec<(u64, u64, u64, u64)> = Vec::new();
        let mut free = Vec::new();
        for (slot, record) in records.chunks_exact(RECORD_SIZE as usize).enumerate() {
            let offset = slot as u64 * RECORD_SIZE;
            let key = u64::from_le_bytes(record[0..8].try_into().unwrap());
            let size = u64::from_le_bytes(record[8..16].try_into().unwrap());
            let time = u64::from_le_bytes(record[16..24].try_into().unwrap());
            if size > 0 {
                live.push((time, key, size, offset));
            } else {
                free.push(offset);
            }
        }
        live.sort_by_key(|&(time, key, _, _)| (time, key));

        let mut state = State {
            index,
            entries: HashMap::with_capacity(live.len()),
            order: BTreeMap::new(),
            free,
            size: 0,
            max_position,
            next_seq: 0,
        };
        for (_, key, size, offset) in live {
            let seq = state.next_seq;
            state.next_seq += 1;
            if let Some(previous) = state.entries.insert(key, Entry { offset, size, seq }) {
                // Duplicate live records should not occur; keep the later
                // slot and recycle the earlier one.
                state.order.remove(&previous.seq);
                state.size -= previous.size;
                state.free.push(previous.offset);
            }
            state.order.insert(seq, key);
            state.size += size;
        }
        Ok(state)
    }

    fn state_mut(&mut self) -> io::Result<&mut State> {
        self.state
            .as_mut()
            .ok_or_else(|| io::Error::other("cache is closed"))
    }

    #[cfg(test)]
    fn lru_keys(&self) -> Vec<u64> {
        self.state
            .as_ref()
            .map(|s| s.order.values().copied().collect())
            .unwrap_or_default()
    }
}

fn write_record(index: &mut File, offset: u64, key: u64, size: u64, time: u64) -> io::Result<()> {
    let mut record = [0u8; RECORD_SIZE as usize];
    record[0..8].copy_from_slice(&key.to_le_bytes());
    record[8..16].copy_from_slice(&size.to_le_bytes());
    record[16..24].copy_from_slice(&time.to_le_bytes());
    index.seek(SeekFrom::Start(offset))?;
    index.write_all(&record)
}

/// Reads the stored size of a slot and overwrites it with a tombstone.
fn evict_slot(index: &mut File, offset: u64) -> io::Result<u64> {
    let mut size_buf = [0u8; 8];
    index.seek(SeekFrom::Start(offset + 8))?;
    index.read_exact(&mut size_buf)?;
    index.seek(SeekFrom::Start(offset + 8))?;
    index.write_all(&[0u8; 8])?;
    Ok(u64::from_le_bytes(size_buf))
}

fn remove_entry_files(dir: &Path, key: u64) {
    let data_path = dir.join(key_file_name(key));
    for path in [append_suffix(&data_path, ".i"), data_path] {
        if let Err(err) = fs::remove_file(&path)
            && err.kind() != ErrorKind::NotFound
        {
            warn!("failed to delete evicted file {}: {err}", path.display());
        }
    }
}
