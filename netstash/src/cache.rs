//! Disk caching: the bounded LRU store, per-URL keys, sidecar files, and
//! partially cached files.

pub mod partial;
pub mod sidecar;
pub mod store;
pub mod url_key;
