use anyhow::{Context, anyhow};
use clap::{Args, Parser, Subcommand};
use netstash::cache::partial::PartialFileRegistry;
use netstash::dirs::AppDirs;
use netstash::http::cached::{CachedHttp, Progress};
use netstash::proxy::RangeProxy;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Disk-backed HTTP resource cache.
///
/// Fetches web resources once, keeps them under a byte budget, and can
/// re-serve them on a loopback port with `Range` support for media
/// consumers.
#[derive(Parser)]
#[command(version)]
struct CliOpts {
    /// Subcommand to run.
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a URL through the cache and print its local path.
    Get {
        #[command(flatten)]
        cache: CacheOpts,

        /// URL to fetch.
        url: String,
    },

    /// Download a URL directly to a file, bypassing cache lookup.
    Download {
        #[command(flatten)]
        cache: CacheOpts,

        /// URL to download.
        url: String,

        /// Destination path.
        dest: PathBuf,
    },

    /// Fetch a JSON URL through the cache and print the decoded value.
    Json {
        #[command(flatten)]
        cache: CacheOpts,

        /// URL to fetch.
        url: String,
    },

    /// Serve cached URLs on a loopback port with Range support.
    Serve {
        #[command(flatten)]
        cache: CacheOpts,

        /// Port to bind (an ephemeral port when omitted).
        #[arg(short, long)]
        port: Option<u16>,

        /// URLs to print local addresses for.
        urls: Vec<String>,
    },

    /// Show cache statistics, or the stored response headers of one URL.
    Stat {
        #[command(flatten)]
        cache: CacheOpts,

        /// Show the cached response headers of this URL.
        #[arg(long)]
        url: Option<String>,
    },

    /// Delete the entire cache directory.
    Clear {
        #[command(flatten)]
        cache: CacheOpts,
    },
}

#[derive(Args)]
struct CacheOpts {
    /// Cache directory (defaults to the per-user cache location).
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Cache size budget, e.g. "200MiB"; "0" disables eviction.
    #[arg(long, default_value = "200MiB")]
    max_size: String,
}

impl CacheOpts {
    fn coordinator(&self) -> Result<CachedHttp, anyhow::Error> {
        let cache_dir = match &self.cache_dir {
            Some(dir) => dir.clone(),
            None => AppDirs::resolve("netstash")
                .context("could not resolve the cache directory")?
                .cache_dir,
        };
        let max_size = parse_size(&self.max_size)
            .map_err(|err| anyhow!("invalid --max-size {:?}: {err}", self.max_size))?;
        CachedHttp::new(&cache_dir, max_size)
            .with_context(|| format!("could not open cache at {}", cache_dir.display()))
    }
}

/// Parses a whole-number byte size like "512", "64KiB", or "2GB".
fn parse_size(input: &str) -> Result<u64, String> {
    let input = input.trim();
    let digits_end = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(digits_end);
    let value: u64 = digits
        .parse()
        .map_err(|_| "missing numeric value".to_string())?;
    let factor: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" => 1_000,
        "kib" => 1 << 10,
        "mb" => 1_000_000,
        "mib" => 1 << 20,
        "gb" => 1_000_000_000,
        "gib" => 1 << 30,
        other => return Err(format!("unknown unit {other:?}")),
    };
    value
        .checked_mul(factor)
        .ok_or_else(|| "size overflows".to_string())
}

fn print_progress(progress: Progress) {
    match progress.expected_total {
        Some(total) if total > 0 => eprint!(
            "\r{} / {} bytes ({}%)",
            progress.bytes_received,
            total,
            progress.bytes_received * 100 / total
        ),
        _ => eprint!("\r{} bytes", progress.bytes_received),
    }
}

fn main() -> Result<ExitCode, anyhow::Error> {
    env_logger::init();
    let cli_opts = CliOpts::parse();
    match cli_opts.command {
        Commands::Get { cache, url } => {
            let chc = cache.coordinator()?;
            let path = chc
                .get_file(&url, None, &[], None)
                .with_context(|| format!("could not fetch: {url}"))?;
            println!("{}", path.display());
        }
        Commands::Download { cache, url, dest } => {
            let chc = cache.coordinator()?;
            chc.download_file(&url, &dest, "GET", &[], Some(&mut print_progress))
                .with_context(|| format!("could not download: {url}"))?;
            eprintln!();
            println!("{}", dest.display());
        }
        Commands::Json { cache, url } => {
            let chc = cache.coordinator()?;
            let value = chc
                .get_as_json(&url, &[])
                .with_context(|| format!("could not fetch JSON: {url}"))?;
            println!("{}", serde_json_pretty(&value)?);
        }
        Commands::Serve { cache, port, urls } => {
            let chc = Arc::new(cache.coordinator()?);
            let registry = Arc::new(PartialFileRegistry::new(chc.client(), chc.store()));
            let proxy = match port {
                Some(port) => RangeProxy::start_on(registry, ([127, 0, 0, 1], port).into()),
                None => RangeProxy::start(registry),
            }
            .context("could not start the range proxy")?;
            println!("http://{}/", proxy.addr());
            for url in &urls {
                println!("{}", proxy.local_url(url));
            }
            loop {
                std::thread::park();
            }
        }
        Commands::Stat { cache, url } => {
            let chc = cache.coordinator()?;
            match url {
                Some(url) => match chc.get_cached_response_headers(&url) {
                    Some(headers) => {
                        for (name, value) in headers {
                            println!("{name}: {value}");
                        }
                    }
                    None => {
                        eprintln!("not cached: {url}");
                        return Ok(ExitCode::from(2));
                    }
                },
                None => {
                    let store = chc.store();
                    let store = store.lock().unwrap();
                    println!("entries: {}", store.entry_count());
                    println!("bytes: {} of {}", store.total_size(), store.max_size());
                }
            }
        }
        Commands::Clear { cache } => {
            let chc = cache.coordinator()?;
            chc.clear().context("could not clear the cache")?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn serde_json_pretty(value: &netstash::codec::value::Value) -> Result<String, anyhow::Error> {
    Ok(serde_json::to_string_pretty(&value.to_json())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use netstash::http::cached::DEFAULT_MAX_CACHE_SIZE;

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("0"), Ok(0));
        assert_eq!(parse_size("512"), Ok(512));
        assert_eq!(parse_size("512B"), Ok(512));
        assert_eq!(parse_size("4KiB"), Ok(4096));
        assert_eq!(parse_size("200MiB"), Ok(200 * 1024 * 1024));
        assert_eq!(parse_size("2GB"), Ok(2_000_000_000));
        assert_eq!(parse_size(" 1kb "), Ok(1_000));
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("MiB").is_err());
        assert!(parse_size("12parsecs").is_err());
    }

    #[test]
    fn test_default_budget_matches_flag_default() {
        assert_eq!(parse_size("200MiB"), Ok(DEFAULT_MAX_CACHE_SIZE));
    }
}
