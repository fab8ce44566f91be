//! Loopback HTTP proxy exposing partially cached files as range-capable
//! local URLs.
//!
//! Media frameworks that expect a plain URL with `Range` support (video
//! players, progressive image decoders) point at
//! `http://127.0.0.1:<port>/<percent-encoded-url>`; each request opens
//! the partial file for the decoded URL, streams the requested byte
//! window, and releases it. Every connection is handled on its own
//! thread so one failing request cannot take down its siblings; failures
//! are logged and the connection is closed.

use crate::cache::partial::{PartialFile, PartialFileRegistry};
use crate::util::percent::{decode_component, encode_component};
use log::{debug, info, warn};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

pub struct RangeProxy {
    addr: SocketAddr,
    registry: Arc<PartialFileRegistry>,
    shutdown: Arc<AtomicBool>,
    accept_handle: Option<JoinHandle<()>>,
}

impl RangeProxy {
    /// Binds an ephemeral loopback port and starts serving.
    pub fn start(registry: Arc<PartialFileRegistry>) -> io::Result<Self> {
        Self::start_on(registry, SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    pub fn start_on(registry: Arc<PartialFileRegistry>, addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_handle = {
            let registry = Arc::clone(&registry);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    let Ok(stream) = stream else { break };
                    let registry = Arc::clone(&registry);
                    thread::spawn(move || {
                        if let Err(err) = serve_connection(stream, &registry) {
                            debug!("proxy request failed: {err}");
                        }
                    });
                }
            })
        };
        info!("range proxy listening on http://{addr}/");
        Ok(Self {
            addr,
            registry,
            shutdown,
            accept_handle: Some(accept_handle),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The local URL under which `url` is served.
    pub fn local_url(&self, url: &str) -> String {
        format!("http://{}/{}", self.addr, encode_component(url))
    }

    /// Stops accepting connections and drops all idle partial-file table
    /// entries. In-flight requests run to completion.
    pub fn stop(&mut self) {
        if let Some(handle) = self.accept_handle.take() {
            self.shutdown.store(true, Ordering::SeqCst);
            let _ = TcpStream::connect(self.addr);
            let _ = handle.join();
            self.registry.clear();
        }
    }
}

impl Drop for RangeProxy {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve_connection(stream: TcpStream, registry: &Arc<PartialFileRegistry>) -> io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let target = parts.next().unwrap_or("").to_string();

    let mut range_header = None;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        if line.trim().is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':')
            && name.trim().eq_ignore_ascii_case("range")
        {
            range_header = Some(value.trim().to_string());
        }
    }
    let mut stream = reader.into_inner();

    if method != "GET" {
        return respond_error(&mut stream, 405, "Method Not Allowed");
    }
    let Some(url) = decode_component(target.strip_prefix('/').unwrap_or(&target)) else {
        return respond_error(&mut stream, 400, "Bad Request");
    };

    let file = match registry.open(&url, &[]) {
        Ok(file) => file,
        Err(err) => {
            warn!("failed to open {url}: {err}");
            return respond_error(&mut stream, 502, "Bad Gateway");
        }
    };
    let result = serve_file(&mut stream, &file, range_header.as_deref());
    if let Err(err) = file.close() {
        warn!("failed to release {url}: {err}");
    }
    result
}

fn serve_file(
    stream: &mut TcpStream,
    file: &PartialFile,
    range_header: Option<&str>,
) -> io::Result<()> {
    let length = file.len();
    let (status, reason, start, end) = match range_header {
        None => (200, "OK", 0, length),
        Some(spec) => {
            let (start, end) = parse_range(spec, length);
            if start >= length {
                write!(stream, "HTTP/1.1 416 Range Not Satisfiable\r\n")?;
                write_upstream_headers(stream, file)?;
                write!(stream, "Content-Range: bytes 0-0/{length}\r\n")?;
                write!(stream, "Content-Length: 0\r\nConnection: close\r\n\r\n")?;
                return stream.flush();
            }
            (206, "Partial Content", start, end)
        }
    };

    write!(stream, "HTTP/1.1 {status} {reason}\r\n")?;
    write_upstream_headers(stream, file)?;
    write!(
        stream,
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        end - start
    )?;

    for chunk in file.read(start, end).map_err(io::Error::from)? {
        let chunk = chunk.map_err(io::Error::from)?;
        stream.write_all(&chunk)?;
    }
    stream.flush()
}

fn write_upstream_headers(stream: &mut TcpStream, file: &PartialFile) -> io::Result<()> {
    for (name, value) in file.response_headers() {
        if matches!(
            name.as_str(),
            "content-length" | "content-range" | "transfer-encoding" | "connection"
        ) {
            continue;
        }
        write!(stream, "{name}: {value}\r\n")?;
    }
    Ok(())
}

/// Lenient `Range` parsing: the `bytes=` prefix is optional and missing
/// endpoints default to the start and end of the resource. The returned
/// end is exclusive and clamped to `length`.
fn parse_range(spec: &str, length: u64) -> (u64, u64) {
    let spec = spec.strip_prefix("bytes=").unwrap_or(spec).trim();
    let (first, last) = spec.split_once('-').unwrap_or((spec, ""));
    let start = first.trim().parse().unwrap_or(0);
    let end = last
        .trim()
        .parse::<u64>()
        .map(|last| last.saturating_add(1))
        .unwrap_or(length)
        .min(length);
    (start, end.max(start))
}

fn respond_error(stream: &mut TcpStream, status: u16, reason: &str) -> io::Result<()> {
    write!(
        stream,
        "HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    )?;
    stream.flush()
}
