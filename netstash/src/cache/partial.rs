//! Partially cached files: sparse, block-granular caching of a single
//! URL with concurrent range readers.
//!
//! The data file grows in 16 KiB blocks; a bitmap in the sidecar records
//! which blocks hold valid bytes. A range read serves contiguous cached
//! runs straight from disk and downloads each missing run with a single
//! `Range` request, persisting blocks as their bytes arrive, so several
//! readers over the same URL converge on a fully cached file without
//! refetching each other's blocks.
//!
//! Instances are deduplicated per URL through [`PartialFileRegistry`]:
//! opening a URL twice yields two handles onto one shared state, and the
//! sidecar is written by at most one ref-counted entry at a time. Mixing
//! these range reads with a whole-file `download_file` of the same URL at
//! the same time is not supported; callers must use one access style per
//! URL at a time.

use crate::cache::sidecar::SidecarHeader;
use crate::cache::store::LruFileCache;
use crate::cache::url_key::url_key;
use crate::error::{Error, Result};
use crate::http::client::{Body, HttpClient, Response};
use log::{debug, warn};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use url::Url;

const BLOCK_SHIFT: u32 = 14;
/// Presence is tracked per 16 KiB block. Changing this breaks the sidecar
/// format.
pub const BLOCK_SIZE: u64 = 1 << BLOCK_SHIFT;

/// Process-wide table of partially cached files, one entry per URL.
///
/// The registry resolves file paths through the shared [`LruFileCache`]
/// and issues origin requests through the shared [`HttpClient`]. It holds
/// no global state: hosts create one registry and pass it to whoever
/// serves ranges.
pub struct PartialFileRegistry {
    client: Arc<HttpClient>,
    store: Arc<Mutex<LruFileCache>>,
    entries: Mutex<HashMap<String, Arc<UrlEntry>>>,
}

struct UrlEntry {
    url: String,
    key: u64,
    data_path: PathBuf,
    sidecar_path: PathBuf,
    state: Mutex<UrlState>,
}

#[derive(Default)]
struct UrlState {
    ref_count: usize,
    data_length: u64,
    block_count: usize,
    bitmap: Vec<u8>,
    bitmap_offset: u64,
    /// Bitmap byte modified in memory but not yet written back.
    pending_byte: Option<usize>,
    sidecar: Option<File>,
    headers: Vec<(String, String)>,
    /// Full-body response left over from an origin open, consumed by the
    /// first read that starts at offset zero.
    reusable: Option<Response>,
    /// Headers passed to `open`, replayed on every range request.
    request_headers: Vec<(String, String)>,
    /// Set when a reader wrote data; triggers cache re-accounting on the
    /// final release.
    dirty: bool,
}

impl PartialFileRegistry {
    pub fn new(client: Arc<HttpClient>, store: Arc<Mutex<LruFileCache>>) -> Self {
        Self {
            client,
            store,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Opens (or joins) the partially cached file for `url`.
    ///
    /// On the first open the sidecar is parsed; a missing, malformed, or
    /// colliding sidecar falls through to a full `GET` of the origin,
    /// whose response stream is kept for the first zero-offset read.
    /// `request_headers` are forwarded to every origin request made on
    /// behalf of this URL.
    pub fn open(
        self: &Arc<Self>,
        url: &str,
        request_headers: &[(String, String)],
    ) -> Result<PartialFile> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(url) {
            let entry = Arc::clone(entry);
            let mut state = entry.state.lock().unwrap();
            if state.ref_count == 0 {
                // The creator's initialization failed after this entry
                // became visible; discard it and start over.
                drop(state);
                entries.remove(url);
            } else {
                state.ref_count += 1;
                drop(state);
                drop(entries);
                return Ok(PartialFile::new(Arc::clone(self), entry));
            }
        }

        let key = url_key(url);
        let (data_path, sidecar_path) = {
            let mut store = self.store.lock().unwrap();
            (store.get_file(key)?, store.sidecar_path(key))
        };
        let entry = Arc::new(UrlEntry {
            url: url.to_string(),
            key,
            data_path,
            sidecar_path,
            state: Mutex::new(UrlState::default()),
        });
        entries.insert(url.to_string(), Arc::clone(&entry));
        // Holding the entry lock across initialization makes later opens
        // of the same URL wait for the result instead of racing it.
        let mut state = entry.state.lock().unwrap();
        drop(entries);

        match self.accrue(&entry, &mut state, request_headers) {
            Ok(()) => {
                state.ref_count = 1;
                drop(state);
                Ok(PartialFile::new(Arc::clone(self), entry))
            }
            Err(err) => {
                drop(state);
                self.entries.lock().unwrap().remove(url);
                Err(err)
            }
        }
    }

    /// Drops all idle table entries. Handles that are still open keep
    /// their shared state alive and detach on their final release.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    fn accrue(
        &self,
        entry: &UrlEntry,
        state: &mut UrlState,
        request_headers: &[(String, String)],
    ) -> Result<()> {
        state.request_headers = request_headers.to_vec();
        let mut sidecar = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&entry.sidecar_path)?;
        match parse_sidecar(entry, &mut sidecar) {
            Ok(parsed) => {
                state.data_length = parsed.data_length;
                state.block_count = parsed.block_count;
                state.bitmap = parsed.bitmap;
                state.bitmap_offset = parsed.bitmap_offset;
                state.headers = parsed.headers;
            }
            Err(err) => {
                debug!("reopening {} from origin: {err}", entry.url);
                self.open_from_origin(entry, state, &mut sidecar, request_headers)?;
            }
        }
        state.sidecar = Some(sidecar);
        Ok(())
    }

    fn open_from_origin(
        &self,
        entry: &UrlEntry,
        state: &mut UrlState,
        sidecar: &mut File,
        request_headers: &[(String, String)],
    ) -> Result<()> {
        let response = request_origin(&self.client, &entry.url, request_headers, None)?;
        let data_length = response
            .content_length()
            .filter(|&length| length > 0)
            .ok_or(Error::Http {
                status: response.status(),
                message: "response without usable content-length".to_string(),
            })?;
        let headers = response.captured_headers();

        let block_count = data_length.div_ceil(BLOCK_SIZE) as usize;
        let bitmap = vec![0u8; block_count.div_ceil(8)];
        let header_block = SidecarHeader::new(entry.url.clone(), headers.clone()).encode();
        sidecar.seek(SeekFrom::Start(0))?;
        sidecar.write_all(&header_block)?;
        sidecar.write_all(&bitmap)?;
        sidecar.set_len((header_block.len() + bitmap.len()) as u64)?;

        state.data_length = data_length;
        state.block_count = block_count;
        state.bitmap_offset = header_block.len() as u64;
        state.bitmap = bitmap;
        state.headers = headers;
        state.reusable = Some(response);
        Ok(())
    }

    fn release(&self, entry: &Arc<UrlEntry>) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let mut state = entry.state.lock().unwrap();
        state.ref_count -= 1;
        if state.ref_count > 0 {
            return Ok(());
        }

        let flushed = flush_pending(&mut state);
        state.sidecar = None;
        state.reusable = None;
        let dirty = std::mem::take(&mut state.dirty);
        if let Some(current) = entries.get(&entry.url)
            && Arc::ptr_eq(current, entry)
        {
            entries.remove(&entry.url);
        }
        drop(state);
        drop(entries);

        flushed?;
        if dirty {
            self.store.lock().unwrap().update(entry.key, &entry.data_path)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn entry_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

struct ParsedSidecar {
    data_length: u64,
    block_count: usize,
    bitmap: Vec<u8>,
    bitmap_offset: u64,
    headers: Vec<(String, String)>,
}

fn parse_sidecar(entry: &UrlEntry, sidecar: &mut File) -> Result<ParsedSidecar> {
    sidecar.seek(SeekFrom::Start(0))?;
    let (header, bitmap_offset) = SidecarHeader::read_from(sidecar)?;
    if header.url != entry.url {
        warn!(
            "cache key {:x} collision: sidecar holds {}, requested {}",
            entry.key, header.url, entry.url
        );
        return Err(Error::HashCollision {
            key: entry.key,
            stored: header.url,
            requested: entry.url.clone(),
        });
    }
    let data_length = header
        .content_length()
        .filter(|&length| length > 0)
        .ok_or(Error::MalformedSidecar("missing content length"))?;
    let block_count = data_length.div_ceil(BLOCK_SIZE) as usize;
    let mut bitmap = vec![0u8; block_count.div_ceil(8)];
    sidecar
        .read_exact(&mut bitmap)
        .map_err(|_| Error::MalformedSidecar("truncated block bitmap"))?;
    Ok(ParsedSidecar {
        data_length,
        block_count,
        bitmap,
        bitmap_offset: bitmap_offset as u64,
        headers: header.headers,
    })
}

fn request_origin(
    client: &HttpClient,
    url: &str,
    request_headers: &[(String, String)],
    range: Option<(u64, u64)>,
) -> Result<Response> {
    let parsed = Url::parse(url).map_err(|err| Error::Http {
        status: 0,
        message: format!("invalid URL {url}: {err}"),
    })?;
    let range_value = range.map(|(start, last)| format!("bytes={start}-{last}"));
    let mut headers: Vec<(&str, &str)> = request_headers
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_str()))
        .collect();
    if let Some(value) = &range_value {
        headers.push(("Range", value.as_str()));
    }
    let response = client.request("GET", &parsed, &headers, false)?;
    if !response.is_success() {
        return Err(Error::Http {
            status: response.status(),
            message: response.reason().to_string(),
        });
    }
    Ok(response)
}

fn bit(bitmap: &[u8], index: usize) -> bool {
    bitmap[index / 8] & (1 << (index % 8)) != 0
}

/// Marks a block present, writing back the previously dirtied bitmap byte
/// when the dirty byte changes. Under a sequential download this batches
/// one sidecar write per eight blocks.
fn set_block(state: &mut UrlState, index: usize) -> Result<()> {
    let byte = index / 8;
    state.bitmap[byte] |= 1 << (index % 8);
    match state.pending_byte {
        Some(pending) if pending != byte => {
            write_bitmap_byte(state, pending)?;
            state.pending_byte = Some(byte);
        }
        Some(_) => {}
        None => state.pending_byte = Some(byte),
    }
    Ok(())
}

fn flush_pending(state: &mut UrlState) -> Result<()> {
    if let Some(byte) = state.pending_byte.take() {
        write_bitmap_byte(state, byte)?;
    }
    Ok(())
}

fn write_bitmap_byte(state: &mut UrlState, byte: usize) -> Result<()> {
    let offset = state.bitmap_offset + byte as u64;
    let value = state.bitmap[byte];
    if let Some(sidecar) = state.sidecar.as_mut() {
        sidecar.seek(SeekFrom::Start(offset))?;
        sidecar.write_all(&[value])?;
    }
    Ok(())
}

/// One ref-counted handle onto the shared per-URL state.
pub struct PartialFile {
    registry: Arc<PartialFileRegistry>,
    entry: Arc<UrlEntry>,
    closed: Arc<AtomicBool>,
    released: AtomicBool,
}

impl PartialFile {
    fn new(registry: Arc<PartialFileRegistry>, entry: Arc<UrlEntry>) -> Self {
        Self {
            registry,
            entry,
            closed: Arc::new(AtomicBool::new(false)),
            released: AtomicBool::new(false),
        }
    }

    pub fn url(&self) -> &str {
        &self.entry.url
    }

    /// Total length of the resource as reported by the origin.
    pub fn len(&self) -> u64 {
        self.state().data_length
    }

    /// The response headers captured when the URL was first opened.
    pub fn response_headers(&self) -> Vec<(String, String)> {
        self.state().headers.clone()
    }

    /// True once every block of the resource is cached.
    pub fn is_full(&self) -> bool {
        let state = self.state();
        (0..state.block_count).all(|index| bit(&state.bitmap, index))
    }

    /// Returns a lazy chunk sequence covering exactly `[start, end)`
    /// (clamped to the resource length). Cached runs stream from disk,
    /// missing runs from the origin. The sequence ends early without an
    /// error when the handle is closed.
    pub fn read(&self, start: u64, end: u64) -> Result<RangeReader> {
        let state = self.state();
        let data_length = state.data_length;
        let block_count = state.block_count;
        drop(state);

        let end = end.min(data_length);
        let start = start.min(end);
        let block = (start >> BLOCK_SHIFT) as usize;
        let pos = (block as u64) << BLOCK_SHIFT;
        let mut data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.entry.data_path)?;
        data.seek(SeekFrom::Start(pos))?;

        Ok(RangeReader {
            entry: Arc::clone(&self.entry),
            client: Arc::clone(&self.registry.client),
            closed: Arc::clone(&self.closed),
            data,
            start,
            end,
            pos,
            block,
            block_count,
            data_length,
            phase: Phase::Scan,
            finished: false,
        })
    }

    /// Cancels this handle's readers and releases its reference; the last
    /// release flushes the bitmap, closes the sidecar, and re-accounts
    /// the entry in the cache when data was written.
    pub fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.registry.release(&self.entry)
    }

    fn state(&self) -> MutexGuard<'_, UrlState> {
        self.entry.state.lock().unwrap()
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("failed to release {}: {err}", self.entry.url);
        }
    }
}

enum Phase {
    /// Serving the contiguous cached run.
    Scan,
    /// Streaming a missing run from the origin.
    Fetch(Fetch),
}

struct Fetch {
    body: Body,
    stop_pos: u64,
    /// File position of the first byte of the block currently filling.
    block_base: u64,
}

/// Pull-based chunk sequence produced by [`PartialFile::read`].
pub struct RangeReader {
    entry: Arc<UrlEntry>,
    client: Arc<HttpClient>,
    closed: Arc<AtomicBool>,
    data: File,
    start: u64,
    end: u64,
    pos: u64,
    block: usize,
    block_count: usize,
    data_length: u64,
    phase: Phase,
    finished: bool,
}

impl RangeReader {
    /// Trims a chunk beginning at file position `chunk_start` to the
    /// requested `[start, end)` window.
    fn trim(&self, chunk: Vec<u8>, chunk_start: u64) -> Vec<u8> {
        let chunk_end = chunk_start + chunk.len() as u64;
        let lo = self.start.max(chunk_start) - chunk_start;
        let hi = self.end.min(chunk_end).saturating_sub(chunk_start);
        if hi <= lo {
            return Vec::new();
        }
        if lo == 0 && hi == chunk.len() as u64 {
            return chunk;
        }
        chunk[lo as usize..hi as usize].to_vec()
    }

    fn scan_step(&mut self) -> Result<Option<Vec<u8>>> {
        let cached = {
            let state = self.entry.state.lock().unwrap();
            self.block < self.block_count && bit(&state.bitmap, self.block)
        };
        if !cached {
            self.begin_fetch()?;
            return Ok(None);
        }
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        let n = read_fully(&mut self.data, &mut buf)?;
        if n == 0 {
            // A set bit without bytes on disk; refetch the block.
            self.begin_fetch()?;
            return Ok(None);
        }
        buf.truncate(n);
        let chunk_start = self.pos;
        self.pos += n as u64;
        self.block += 1;
        Ok(Some(self.trim(buf, chunk_start)))
    }

    fn begin_fetch(&mut self) -> Result<()> {
        let end_block = ((self.end - 1) >> BLOCK_SHIFT) as usize + 1;
        let (stop_pos, reusable, request_headers) = {
            let mut state = self.entry.state.lock().unwrap();
            let mut stop_block = self.block + 1;
            while stop_block < self.block_count && !bit(&state.bitmap, stop_block) {
                stop_block += 1;
            }
            let stop_block = stop_block.min(end_block);
            let stop_pos = ((stop_block as u64) << BLOCK_SHIFT).min(self.data_length);
            let reusable = if self.block == 0 {
                state.reusable.take()
            } else {
                None
            };
            (stop_pos, reusable, state.request_headers.clone())
        };

        let start_pos = (self.block as u64) << BLOCK_SHIFT;
        let body = match reusable {
            Some(response) => response.into_body(),
            None => request_origin(
                &self.client,
                &self.entry.url,
                &request_headers,
                Some((start_pos, stop_pos - 1)),
            )?
            .into_body(),
        };
        self.data.seek(SeekFrom::Start(start_pos))?;
        self.pos = start_pos;
        self.phase = Phase::Fetch(Fetch {
            body,
            stop_pos,
            block_base: start_pos,
        });
        Ok(())
    }

    fn fetch_step(&mut self) -> Result<Option<Vec<u8>>> {
        let Phase::Fetch(fetch) = &mut self.phase else {
            unreachable!("fetch_step outside fetch phase");
        };
        let stop_pos = fetch.stop_pos;
        let want = (stop_pos - self.pos).min(BLOCK_SIZE) as usize;
        let mut buf = vec![0u8; want];
        let n = fetch.body.read(&mut buf).map_err(Error::Io)?;
        if n == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "origin stream ended before the requested range",
            )));
        }
        buf.truncate(n);
        self.data.write_all(&buf)?;
        let chunk_start = self.pos;
        self.pos += n as u64;

        {
            let mut state = self.entry.state.lock().unwrap();
            state.dirty = true;
            // A block's bit is set only once all of its bytes are on disk.
            while self.block < self.block_count
                && self.pos >= (fetch.block_base + BLOCK_SIZE).min(self.data_length)
            {
                set_block(&mut state, self.block)?;
                self.block += 1;
                fetch.block_base += BLOCK_SIZE;
            }
            if self.pos >= stop_pos {
                flush_pending(&mut state)?;
            }
        }
        if self.pos >= stop_pos {
            self.phase = Phase::Scan;
        }
        Ok(Some(self.trim(buf, chunk_start)))
    }

    fn finish(&mut self) -> Option<Result<Vec<u8>>> {
        self.finished = true;
        self.phase = Phase::Scan;
        let mut state = self.entry.state.lock().unwrap();
        match flush_pending(&mut state) {
            Ok(()) => None,
            Err(err) => Some(Err(err)),
        }
    }

    /// A close cancels between cached chunks and while fetching the tail
    /// of the file. A fetch of an interior gap runs to completion once
    /// started, so the bitmap always gains whole runs.
    fn cancelled(&self) -> bool {
        if !self.closed.load(Ordering::SeqCst) {
            return false;
        }
        match &self.phase {
            Phase::Scan => true,
            Phase::Fetch(fetch) => fetch.stop_pos == self.data_length,
        }
    }
}

impl Iterator for RangeReader {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if self.pos >= self.end || self.cancelled() {
                return self.finish();
            }
            let step = if matches!(self.phase, Phase::Scan) {
                self.scan_step()
            } else {
                self.fetch_step()
            };
            match step {
                Ok(Some(chunk)) if chunk.is_empty() => continue,
                Ok(Some(chunk)) => return Some(Ok(chunk)),
                Ok(None) => continue,
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

fn read_fully(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
