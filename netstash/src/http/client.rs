//! Minimal HTTP/1.1 client used for origin fetches.
//!
//! One connection per request with `Connection: close`, plain TCP or
//! rustls TLS. Response bodies are exposed as [`std::io::Read`] so
//! downloads stream through fixed-size buffers; fixed-length and chunked
//! transfer encodings are supported, plus optional transparent gzip
//! decompression for callers that opt in.

use crate::http::error::HttpClientError;
use flate2::read::GzDecoder;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, StreamOwned, crypto};
use rustls_platform_verifier::BuilderVerifierExt;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use url::Url;

const CRLF: &str = "\r\n";

type Result<T> = std::result::Result<T, HttpClientError>;

pub struct HttpClient {
    tls: Arc<ClientConfig>,
}

impl HttpClient {
    pub fn new(tls: Arc<ClientConfig>) -> Self {
        Self { tls }
    }

    /// Client that validates certificates through the operating system's
    /// verifier.
    pub fn system() -> std::result::Result<Self, rustls::Error> {
        let provider = Arc::new(crypto::aws_lc_rs::default_provider());
        let tls = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_platform_verifier()
            .with_no_client_auth();
        Ok(Self::new(Arc::new(tls)))
    }

    /// Issues a request and reads the response head. The body has not
    /// been consumed when this returns.
    ///
    /// `Host`, `Connection` and `User-Agent` are set automatically, and
    /// `Accept-Encoding` as well (to `gzip` when `auto_compress` is set,
    /// `identity` otherwise) unless `headers` carries its own value.
    pub fn request(
        &self,
        method: &str,
        url: &Url,
        headers: &[(&str, &str)],
        auto_compress: bool,
    ) -> Result<Response> {
        let target = Target::from_url(url)?;
        let mut writer = BufWriter::new(Stream::connect(&target, &self.tls)?);

        write!(writer, "{method} {}", url.path())?;
        if let Some(query) = url.query() {
            write!(writer, "?{query}")?;
        }
        write!(writer, " HTTP/1.1{CRLF}")?;
        write!(writer, "Host: {}{CRLF}", target.host)?;
        write!(writer, "Connection: close{CRLF}")?;
        write!(
            writer,
            "User-Agent: {}{CRLF}",
            concat!("netstash/", env!("CARGO_PKG_VERSION"))
        )?;
        if !headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("accept-encoding"))
        {
            let encoding = if auto_compress { "gzip" } else { "identity" };
            write!(writer, "Accept-Encoding: {encoding}{CRLF}")?;
        }
        for (name, value) in headers {
            write!(writer, "{name}: {value}{CRLF}")?;
        }
        write!(writer, "{CRLF}")?;
        writer.flush()?;

        let mut reader = BufReader::new(writer.into_inner().map_err(|err| err.into_error())?);
        let mut status_line = String::new();
        reader.read_line(&mut status_line)?;
        let (status, reason) = parse_status_line(&status_line)?;

        let mut response_headers: Vec<(String, String)> = Vec::new();
        let mut framing = Framing::Empty;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line)?;
            if line.trim().is_empty() {
                break;
            }
            let (name, value) = parse_header_line(&line)?;
            if name == "transfer-encoding" {
                if value.eq_ignore_ascii_case("chunked") {
                    framing = Framing::Chunked;
                } else {
                    return Err(HttpClientError::UnsupportedFeature("transfer encoding"));
                }
            } else if name == "content-length"
                && !matches!(framing, Framing::Chunked)
            {
                let size: u64 = value.parse().map_err(|_| {
                    HttpClientError::invalid_data("invalid Content-Length header value")
                })?;
                framing = Framing::Fixed(size);
            }
            response_headers.push((name, value));
        }

        let remaining = match framing {
            Framing::Fixed(size) => size,
            _ => 0,
        };
        let framed = FramedBody {
            reader,
            framing,
            remaining,
            is_eof: false,
        };
        let content_encoding = response_headers
            .iter()
            .find(|(name, _)| name == "content-encoding")
            .map(|(_, value)| value.as_str())
            .unwrap_or("identity");
        let body = match content_encoding {
            "identity" => Body(BodyInner::Plain(framed)),
            "gzip" if auto_compress => Body(BodyInner::Gzip(GzDecoder::new(framed))),
            _ => return Err(HttpClientError::UnsupportedFeature("content encoding")),
        };

        Ok(Response {
            status,
            reason,
            headers: response_headers,
            body,
        })
    }
}

/// Where a request goes: host, port, and whether the connection is
/// wrapped in TLS.
struct Target<'a> {
    host: &'a str,
    port: u16,
    tls: bool,
}

impl<'a> Target<'a> {
    fn from_url(url: &'a Url) -> Result<Self> {
        if !url.username().is_empty() || url.password().is_some() {
            return Err(HttpClientError::UnsupportedFeature("credentials in URL"));
        }
        let tls = match url.scheme() {
            "https" => true,
            "http" => false,
            other => return Err(HttpClientError::InvalidScheme(other.to_string())),
        };
        Ok(Self {
            host: url.host_str().ok_or(HttpClientError::MissingHost)?,
            port: url.port().unwrap_or(if tls { 443 } else { 80 }),
            tls,
        })
    }
}

enum Stream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Stream {
    fn connect(target: &Target<'_>, tls_config: &Arc<ClientConfig>) -> Result<Self> {
        let tcp = TcpStream::connect((target.host, target.port))?;
        if !target.tls {
            return Ok(Stream::Plain(tcp));
        }
        let server_name = ServerName::try_from(target.host.to_string())?;
        let session = ClientConnection::new(Arc::clone(tls_config), server_name)?;
        Ok(Stream::Tls(Box::new(StreamOwned::new(session, tcp))))
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(stream) => stream.read(buf),
            Stream::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(stream) => stream.write(buf),
            Stream::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(stream) => stream.flush(),
            Stream::Tls(stream) => stream.flush(),
        }
    }
}

fn parse_status_line(line: &str) -> Result<(u16, String)> {
    let rest = line
        .trim_end()
        .strip_prefix("HTTP/1.")
        .ok_or_else(|| HttpClientError::invalid_data("unsupported HTTP version"))?;
    let mut parts = rest.splitn(3, ' ');
    parts.next(); // minor version
    let code = parts
        .next()
        .ok_or_else(|| HttpClientError::invalid_data("malformed status line"))?;
    if code.len() != 3 || code.bytes().any(|c| !c.is_ascii_digit()) {
        return Err(HttpClientError::invalid_data("invalid HTTP status code"));
    }
    let status = code.parse().expect("three ASCII digits");
    Ok((status, parts.next().unwrap_or("").to_string()))
}

fn parse_header_line(line: &str) -> Result<(String, String)> {
    let (name, value) = line.split_once(':').ok_or_else(|| {
        HttpClientError::invalid_data("malformed header: missing colon separator")
    })?;
    Ok((
        name.trim().to_ascii_lowercase(),
        value.trim().to_string(),
    ))
}

#[derive(Debug, Clone, Copy)]
enum Framing {
    Empty,
    Fixed(u64),
    Chunked,
}

struct FramedBody {
    reader: BufReader<Stream>,
    framing: Framing,
    remaining: u64,
    is_eof: bool,
}

impl Read for FramedBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_eof {
            return Ok(0);
        }
        match self.framing {
            Framing::Empty => {
                self.is_eof = true;
                Ok(0)
            }
            Framing::Fixed(_) => {
                let max_n = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
                self.reader.read(&mut buf[..max_n]).inspect(|&n| {
                    self.remaining -= n as u64;
                    if self.remaining == 0 || n == 0 {
                        self.is_eof = true;
                    }
                })
            }
            Framing::Chunked => {
                if self.remaining == 0 {
                    let mut octets = String::new();
                    self.reader.read_line(&mut octets)?;
                    self.remaining =
                        u64::from_str_radix(octets.trim(), 16).map_err(|_| {
                            io::Error::new(
                                io::ErrorKind::InvalidData,
                                format!("invalid chunk size: {}", octets.trim()),
                            )
                        })?;
                    if self.remaining == 0 {
                        self.reader.read_exact([0; 2].as_mut())?; // trailing CRLF
                        self.is_eof = true;
                        return Ok(0);
                    }
                }
                let max_n = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
                let n = self.reader.read(&mut buf[..max_n]).inspect(|&n| {
                    self.remaining -= n as u64;
                })?;
                if self.remaining == 0 {
                    self.reader.read_exact([0; 2].as_mut())?; // trailing CRLF
                }
                Ok(n)
            }
        }
    }
}

enum BodyInner {
    Plain(FramedBody),
    Gzip(GzDecoder<FramedBody>),
}

/// Streaming response body.
pub struct Body(BodyInner);

impl Read for Body {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.0 {
            BodyInner::Plain(body) => body.read(buf),
            BodyInner::Gzip(body) => body.read(buf),
        }
    }
}

/// A response whose head has been read; the body streams on demand.
pub struct Response {
    status: u16,
    reason: String,
    headers: Vec<(String, String)>,
    body: Body,
}

impl Response {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// First value of the header with the given (lowercase) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.parse().ok()
    }

    /// All response headers, names lowercased, in wire order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Headers reduced to the first value per name, the form stored in
    /// sidecar files.
    pub fn captured_headers(&self) -> Vec<(String, String)> {
        let mut captured: Vec<(String, String)> = Vec::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            if !captured.iter().any(|(n, _)| n == name) {
                captured.push((name.clone(), value.clone()));
            }
        }
        captured
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    pub fn into_body(self) -> Body {
        self.body
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::BufRead;
    use std::net::{SocketAddr, TcpListener};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread::{self, JoinHandle};

    /// Serves a single canned response and returns the captured request
    /// head.
    pub(crate) struct TestServer {
        join_handle: JoinHandle<io::Result<String>>,
        base_url: Url,
    }

    impl TestServer {
        pub fn start(response: Vec<u8>) -> io::Result<Self> {
            let listener = TcpListener::bind("127.0.0.1:0")?;
            let addr = listener.local_addr()?;
            let base_url = Url::parse(&format!("http://{}:{}", addr.ip(), addr.port())).unwrap();
            let join_handle = thread::spawn(move || {
                let (stream, _) = listener.accept()?;
                let mut reader = BufReader::new(stream);
                let mut head = String::new();
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line)?;
                    if line.trim().is_empty() {
                        break;
                    }
                    head.push_str(&line);
                }
                reader.into_inner().write_all(&response)?;
                Ok(head)
            });
            Ok(Self {
                join_handle,
                base_url,
            })
        }

        pub fn base_url(&self) -> &Url {
            &self.base_url
        }

        /// Waits for the request and returns its head (request line and
        /// headers, CRLF separated).
        pub fn request_head(self) -> io::Result<String> {
            self.join_handle.join().unwrap()
        }
    }

    #[derive(Debug, Clone)]
    pub(crate) struct RecordedRequest {
        pub line: String,
        pub range: Option<String>,
    }

    /// A loopback origin serving one payload for any number of requests,
    /// with `Range: bytes=a-b` support and a request log.
    pub(crate) struct TestOrigin {
        addr: SocketAddr,
        shutdown: Arc<AtomicBool>,
        requests: Arc<Mutex<Vec<RecordedRequest>>>,
        join_handle: Option<JoinHandle<()>>,
    }

    impl TestOrigin {
        pub fn serve(payload: Vec<u8>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            let shutdown = Arc::new(AtomicBool::new(false));
            let requests = Arc::new(Mutex::new(Vec::new()));
            let join_handle = {
                let shutdown = Arc::clone(&shutdown);
                let requests = Arc::clone(&requests);
                thread::spawn(move || {
                    for stream in listener.incoming() {
                        if shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        let Ok(stream) = stream else { break };
                        let _ = Self::handle(stream, &payload, &requests);
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

        fn handle(
            stream: TcpStream,
            payload: &[u8],
            requests: &Mutex<Vec<RecordedRequest>>,
        ) -> io::Result<()> {
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line)?;
            let request_line = line.trim_end().to_string();
            let mut range = None;
            loop {
                let mut header = String::new();
                reader.read_line(&mut header)?;
                if header.trim().is_empty() {
                    break;
                }
                if let Some((name, value)) = header.split_once(':')
                    && name.trim().eq_ignore_ascii_case("range")
                {
                    range = Some(value.trim().to_string());
                }
            }
            requests.lock().unwrap().push(RecordedRequest {
                line: request_line,
                range: range.clone(),
            });

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

        pub fn url(&self) -> String {
            format!("http://{}:{}/file.bin", self.addr.ip(), self.addr.port())
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub fn requests(&self) -> Vec<RecordedRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl Drop for TestOrigin {
        fn drop(&mut self) {
            self.shutdown.store(true, Ordering::SeqCst);
            let _ = TcpStream::connect(self.addr);
            if let Some(handle) = self.join_handle.take() {
                let _ = handle.join();
            }
        }
    }

    #[test]
    fn test_request_head_formatting() {
        let server =
            TestServer::start(b"HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n".to_vec())
                .unwrap();
        let url = server.base_url().join("/path?q=1").unwrap();
        let host = url.host_str().unwrap().to_string();
        let port = url.port().unwrap();
        let response = HttpClient::system()
            .unwrap()
            .request("GET", &url, &[("Range", "bytes=0-99")], false)
            .unwrap();
        assert_eq!(response.status(), 204);

        assert_eq!(
            server.request_head().unwrap(),
            format!(
                "GET /path?q=1 HTTP/1.1\r\n\
                 Host: {host}\r\n\
                 Connection: close\r\n\
                 User-Agent: netstash/{}\r\n\
                 Accept-Encoding: identity\r\n\
                 Range: bytes=0-99\r\n",
                env!("CARGO_PKG_VERSION")
            ),
            "unexpected request head (port {port})"
        );
    }

    #[test]
    fn test_fixed_length_body() {
        let server = TestServer::start(
            b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\nX-Extra: 1\r\n\r\nHello!\r\n".to_vec(),
        )
        .unwrap();
        let url = server.base_url().join("/").unwrap();
        let mut response = HttpClient::system()
            .unwrap()
            .request("GET", &url, &[], false)
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.content_length(), Some(8));
        assert_eq!(response.header("x-extra"), Some("1"));
        let mut body = String::new();
        response.body_mut().read_to_string(&mut body).unwrap();
        assert_eq!(body, "Hello!\r\n");
    }

    #[test]
    fn test_chunked_body() {
        let server = TestServer::start(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
              a\r\nHello, wor\r\n5\r\nld!\r\n\r\n0\r\n\r\n"
                .to_vec(),
        )
        .unwrap();
        let url = server.base_url().join("/").unwrap();
        let mut response = HttpClient::system()
            .unwrap()
            .request("GET", &url, &[], false)
            .unwrap();
        let mut body = String::new();
        response.body_mut().read_to_string(&mut body).unwrap();
        assert_eq!(body, "Hello, world!\r\n");
    }

    #[test]
    fn test_gzip_body_is_decompressed_when_requested() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"compressed payload").unwrap();
        let compressed = encoder.finish().unwrap();
        let mut response_bytes = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            compressed.len()
        )
        .into_bytes();
        response_bytes.extend_from_slice(&compressed);

        let server = TestServer::start(response_bytes).unwrap();
        let url = server.base_url().join("/").unwrap();
        let mut response = HttpClient::system()
            .unwrap()
            .request("GET", &url, &[], true)
            .unwrap();
        let mut body = String::new();
        response.body_mut().read_to_string(&mut body).unwrap();
        assert_eq!(body, "compressed payload");
        assert!(
            server.request_head().unwrap().contains("Accept-Encoding: gzip"),
            "auto_compress should advertise gzip"
        );
    }

    #[test]
    fn test_unexpected_gzip_is_rejected() {
        let server = TestServer::start(
            b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: 2\r\n\r\nxx".to_vec(),
        )
        .unwrap();
        let url = server.base_url().join("/").unwrap();
        let result = HttpClient::system()
            .unwrap()
            .request("GET", &url, &[], false);
        assert!(matches!(
            result,
            Err(HttpClientError::UnsupportedFeature("content encoding"))
        ));
    }

    #[test]
    fn test_non_success_status_is_reported_not_raised() {
        let server = TestServer::start(
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec(),
        )
        .unwrap();
        let url = server.base_url().join("/missing").unwrap();
        let response = HttpClient::system()
            .unwrap()
            .request("GET", &url, &[], false)
            .unwrap();
        assert_eq!(response.status(), 404);
        assert_eq!(response.reason(), "Not Found");
        assert!(!response.is_success());
    }

    #[test]
    fn test_captured_headers_keep_first_value_per_name() {
        let server = TestServer::start(
            b"HTTP/1.1 200 OK\r\nSet-Thing: a\r\nSet-Thing: b\r\nContent-Length: 0\r\n\r\n"
                .to_vec(),
        )
        .unwrap();
        let url = server.base_url().join("/").unwrap();
        let response = HttpClient::system()
            .unwrap()
            .request("GET", &url, &[], false)
            .unwrap();
        assert_eq!(response.headers().len(), 3);
        let captured = response.captured_headers();
        assert_eq!(
            captured
                .iter()
                .find(|(n, _)| n == "set-thing")
                .map(|(_, v)| v.as_str()),
            Some("a")
        );
        assert_eq!(captured.len(), 2);
    }

    #[test]
    fn test_origin_fixture_serves_ranges() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let origin = TestOrigin::serve(payload.clone());
        let url = Url::parse(&origin.url()).unwrap();
        let client = HttpClient::system().unwrap();

        let mut full = Vec::new();
        client
            .request("GET", &url, &[], false)
            .unwrap()
            .body_mut()
            .read_to_end(&mut full)
            .unwrap();
        assert_eq!(full, payload);

        let mut partial = Vec::new();
        let mut response = client
            .request("GET", &url, &[("Range", "bytes=16-31")], false)
            .unwrap();
        assert_eq!(response.status(), 206);
        response.body_mut().read_to_end(&mut partial).unwrap();
        assert_eq!(partial, &payload[16..32]);
        assert_eq!(origin.request_count(), 2);
    }
}
