//! Cached HTTP coordinator: whole-file fetches deduplicated per URL and
//! accounted in the shared [`LruFileCache`].
//!
//! At most one download runs per URL at any time: concurrent `get_file`
//! calls for the same URL share one per-URL lock, so the losers find the
//! winner's bytes on disk and return the same path. Whole-file downloads
//! and concurrent range reads of the same URL are not synchronized
//! against each other; callers must use one access style per URL at a
//! time.

use crate::cache::sidecar::SidecarHeader;
use crate::cache::store::LruFileCache;
use crate::cache::url_key::url_key;
use crate::codec::buffer::{BufferReader, BufferWriter};
use crate::codec::value::{JSON_MAGIC, Value};
use crate::error::{Error, Result};
use crate::http::client::{HttpClient, Response};
use crate::util::staged::{StagedFile, append_suffix};
use log::{debug, warn};
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use url::Url;

/// Default byte budget of the coordinator-owned cache.
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 200 * 1024 * 1024;

/// Download progress reported once per received chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub bytes_received: u64,
    /// Total size from `Content-Length`, when the origin sent one.
    pub expected_total: Option<u64>,
}

struct LoadingItem {
    key: u64,
    lock: Mutex<()>,
}

pub struct CachedHttp {
    store: Arc<Mutex<LruFileCache>>,
    client: Arc<HttpClient>,
    loading: Mutex<HashMap<String, Arc<LoadingItem>>>,
}

impl CachedHttp {
    /// Builds a coordinator whose cache lives at `<cache_dir>/http_cache`.
    /// The host constructs one of these at startup and hands it to every
    /// consumer; tests build private instances over temp directories.
    pub fn new(cache_dir: &Path, max_size: u64) -> Result<Self> {
        let store = LruFileCache::open(cache_dir.join("http_cache"), max_size)?;
        let client = HttpClient::system().map_err(|err| Error::Http {
            status: 0,
            message: format!("TLS setup failed: {err}"),
        })?;
        Ok(Self {
            store: Arc::new(Mutex::new(store)),
            client: Arc::new(client),
            loading: Mutex::new(HashMap::new()),
        })
    }

    /// Shared handle to the underlying file cache (used by the
    /// partial-content registry).
    pub fn store(&self) -> Arc<Mutex<LruFileCache>> {
        Arc::clone(&self.store)
    }

    /// Shared handle to the HTTP client.
    pub fn client(&self) -> Arc<HttpClient> {
        Arc::clone(&self.client)
    }

    /// Closes the cache, deletes its directory, and reopens it empty.
    pub fn clear(&self) -> Result<()> {
        Ok(self.store.lock().unwrap().clear()?)
    }

    /// Issues a single uncached request and returns the open response.
    pub fn open_url(
        &self,
        url: &str,
        method: &str,
        headers: &[(&str, &str)],
        auto_compress: bool,
    ) -> Result<Response> {
        let parsed = parse_url(url)?;
        Ok(self.client.request(method, &parsed, headers, auto_compress)?)
    }

    /// Streams `url` to `dest` through `<dest>.p`, reporting progress per
    /// chunk, renaming atomically on success, and then writing the
    /// response headers to a fresh `<dest>.i` sidecar. A non-2xx status
    /// is an error; on any failure the partial file is deleted and an
    /// existing `dest` is left untouched.
    pub fn download_file(
        &self,
        url: &str,
        dest: &Path,
        method: &str,
        headers: &[(&str, &str)],
        mut progress: Option<&mut dyn FnMut(Progress)>,
    ) -> Result<()> {
        let mut response = self.open_url(url, method, headers, false)?;
        if !response.is_success() {
            return Err(Error::Http {
                status: response.status(),
                message: response.reason().to_string(),
            });
        }
        let expected_total = response.content_length();
        let captured = response.captured_headers();

        let mut staged = StagedFile::create(dest)?;
        let mut received: u64 = 0;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = response.body_mut().read(&mut buf)?;
            if n == 0 {
                break;
            }
            staged.write_all(&buf[..n])?;
            received += n as u64;
            if let Some(callback) = progress.as_mut() {
                callback(Progress {
                    bytes_received: received,
                    expected_total,
                });
            }
        }
        if let Some(total) = expected_total
            && received < total
        {
            return Err(Error::Http {
                status: response.status(),
                message: format!("body ended after {received} of {total} bytes"),
            });
        }
        staged.commit()?;
        fs::write(
            append_suffix(dest, ".i"),
            SidecarHeader::new(url, captured).encode(),
        )?;
        debug!("downloaded {url} ({received} bytes)");
        Ok(())
    }

    /// Returns the local path of `url`, downloading it first unless a
    /// non-empty cached copy exists and `check_cache` (given the stored
    /// response headers) accepts it.
    pub fn get_file(
        &self,
        url: &str,
        method: Option<&str>,
        headers: &[(&str, &str)],
        check_cache: Option<&dyn Fn(&SidecarHeader) -> bool>,
    ) -> Result<PathBuf> {
        let item = {
            let mut loading = self.loading.lock().unwrap();
            Arc::clone(loading.entry(url.to_string()).or_insert_with(|| {
                Arc::new(LoadingItem {
                    key: url_key(url),
                    lock: Mutex::new(()),
                })
            }))
        };
        let path = self.store.lock().unwrap().get_file(item.key)?;

        let result = self.fetch_under_lock(url, &item, &path, method, headers, check_cache);

        let mut loading = self.loading.lock().unwrap();
        if let Some(current) = loading.get(url)
            && Arc::ptr_eq(current, &item)
        {
            loading.remove(url);
        }
        drop(loading);

        if result? {
            self.store.lock().unwrap().update(item.key, &path)?;
        }
        Ok(path)
    }

    /// The per-URL critical section of [`Self::get_file`]; returns
    /// whether a download happened.
    fn fetch_under_lock(
        &self,
        url: &str,
        item: &LoadingItem,
        path: &Path,
        method: Option<&str>,
        headers: &[(&str, &str)],
        check_cache: Option<&dyn Fn(&SidecarHeader) -> bool>,
    ) -> Result<bool> {
        let _guard = item.lock.lock().unwrap();
        if fs::metadata(path).is_ok_and(|meta| meta.len() > 0) {
            match self.read_checked_sidecar(url, item.key, path) {
                Ok(header) => {
                    if check_cache.is_none_or(|accept| accept(&header)) {
                        return Ok(false);
                    }
                }
                Err(err @ Error::HashCollision { .. }) => return Err(err),
                Err(err) => debug!("discarding cached copy of {url}: {err}"),
            }
        }
        self.download_file(url, path, method.unwrap_or("GET"), headers, None)?;
        if fs::metadata(path).is_ok_and(|meta| meta.len() == 0) {
            return Err(Error::EmptyCache(path.to_path_buf()));
        }
        Ok(true)
    }

    /// Reads the sidecar of a cached copy, invalidating the entry when
    /// the stored URL belongs to a different resource with the same key.
    fn read_checked_sidecar(&self, url: &str, key: u64, path: &Path) -> Result<SidecarHeader> {
        let bytes = fs::read(append_suffix(path, ".i"))?;
        let (header, _) = SidecarHeader::decode(&bytes)?;
        if header.url != url {
            warn!(
                "cache key {key:x} collision: sidecar holds {}, requested {url}",
                header.url
            );
            self.invalidate(key, path);
            return Err(Error::HashCollision {
                key,
                stored: header.url,
                requested: url.to_string(),
            });
        }
        Ok(header)
    }

    fn invalidate(&self, key: u64, path: &Path) {
        let _ = fs::remove_file(append_suffix(path, ".i"));
        let _ = fs::remove_file(path);
        if let Err(err) = self.store.lock().unwrap().update(key, path) {
            warn!("failed to drop invalidated entry {key:x}: {err}");
        }
    }

    /// Cached JSON fetch. The data file is normalized to the binary form
    /// (`magic || value`) on first fetch so later calls skip textual
    /// parsing entirely.
    pub fn get_as_json(&self, url: &str, headers: &[(&str, &str)]) -> Result<Value> {
        let path = self.get_file(url, None, headers, None)?;
        let bytes = fs::read(&path)?;
        if bytes.len() >= 4 && u32::from_le_bytes(bytes[..4].try_into().unwrap()) == JSON_MAGIC {
            let mut reader = BufferReader::new(&bytes);
            reader.get_u32()?;
            return Value::decode_from(&mut reader);
        }

        let parsed: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|err| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err)))?;
        let value = Value::from_json(&parsed);
        // Alignment inside the binary form is relative to the start of
        // the file, so the magic goes through the same writer.
        let mut writer = BufferWriter::new();
        writer.put_u32(JSON_MAGIC);
        value.encode_to(&mut writer);
        let mut staged = StagedFile::create(path.clone())?;
        staged.write_all(&writer.into_bytes())?;
        staged.commit()?;
        self.store.lock().unwrap().update(url_key(url), &path)?;
        Ok(value)
    }

    /// Peeks at the stored response headers of `url` without touching the
    /// network. Any I/O or parse problem, including a key collision,
    /// reads as "not cached".
    pub fn get_cached_response_headers(&self, url: &str) -> Option<Vec<(String, String)>> {
        let sidecar_path = {
            let store = self.store.lock().unwrap();
            store.sidecar_path(url_key(url))
        };
        let bytes = fs::read(sidecar_path).ok()?;
        let (header, _) = SidecarHeader::decode(&bytes).ok()?;
        if header.url != url {
            return None;
        }
        Some(header.headers)
    }
}

fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|err| Error::Http {
        status: 0,
        message: format!("invalid URL {url}: {err}"),
    })
}
