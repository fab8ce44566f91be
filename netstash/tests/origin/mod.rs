//! Loopback origin fixture: serves one payload for any number of
//! requests, honors `Range: bytes=a-b`, and counts requests.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub struct Origin {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    requests: Arc<AtomicUsize>,
    join_handle: Option<JoinHandle<()>>,
}

impl Origin {
    pub fn serve(payload: Vec<u8>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let requests = Arc::new(AtomicUsize::new(0));
        let join_handle = {
            let shutdown = Arc::clone(&shutdown);
            let requests = Arc::clone(&requests);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    let Ok(stream) = stream else { break };
                    requests.fetch_add(1, Ordering::SeqCst);
                    // A client may drop the stream mid-body; that is not
                    // the fixture's problem.
                    let _ = handle(stream, &payload);
                }
            })
        };
        Self {
            addr,
            shutdown,
            requests,
            join_handle: Some(join_handle),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}/resource", self.addr.ip(), self.addr.port())
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for Origin {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle(stream: TcpStream, payload: &[u8]) -> io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut range = None;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        if line.trim().is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':')
            && name.trim().eq_ignore_ascii_case("range")
        {
            range = Some(value.trim().to_string());
        }
    }

    let mut stream = reader.into_inner();
    match range {
        None => {
            write!(
                stream,
                "HTTP/1.1 200 OK\r\ncontent-type: application/octet-stream\r\ncontent-length: {}\r\n\r\n",
                payload.len()
            )?;
            stream.write_all(payload)?;
        }
        Some(range) => {
            let spec = range.strip_prefix("bytes=").unwrap_or(&range);
            let (start, end) = spec.split_once('-').unwrap();
            let start: usize = start.parse().unwrap();
            let end: usize = if end.is_empty() {
                payload.len() - 1
            } else {
                end.parse::<usize>().unwrap().min(payload.len() - 1)
            };
            let slice = &payload[start..=end];
            write!(
                stream,
                "HTTP/1.1 206 Partial Content\r\ncontent-type: application/octet-stream\r\ncontent-range: bytes {start}-{end}/{}\r\ncontent-length: {}\r\n\r\n",
                payload.len(),
                slice.len()
            )?;
            stream.write_all(slice)?;
        }
    }
    stream.flush()
}
