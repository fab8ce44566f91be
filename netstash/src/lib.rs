//! `netstash` is a caching HTTP layer for applications that render
//! remote resources: images, JSON documents, and streamable media.
//!
//! It is built from three cooperating pieces:
//!
//! - **Cache**: [`cache::store::LruFileCache`] keeps downloaded files
//!   under a byte budget, keyed by a 64-bit URL hash, with a compact
//!   index that survives restarts. [`cache::partial::PartialFileRegistry`]
//!   layers sparse, block-granular caching on top for range access.
//! - **HTTP**: [`http::client::HttpClient`] is a small synchronous
//!   client; [`http::cached::CachedHttp`] coordinates whole-file fetches
//!   so each URL downloads at most once at a time.
//! - **Proxy**: [`proxy::RangeProxy`] re-serves cached URLs on a
//!   loopback port with `Range` support for media consumers.
//!
//! Hosts construct one [`http::cached::CachedHttp`] (and, when range
//! access is needed, one registry and proxy) at startup and pass the
//! handles down; nothing in the crate is a global.

pub mod cache;
pub mod codec;
pub mod dirs;
pub mod error;
pub mod http;
pub mod persist;
pub mod proxy;

pub mod util {
    //! Small building blocks shared across the crate.

    pub mod clock;
    pub mod percent;
    pub mod staged;
}

pub use error::{Error, Result};
