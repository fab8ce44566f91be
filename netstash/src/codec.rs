//! Binary encoding shared by the sidecar header block, cached JSON data
//! files, and the persisted settings file.

pub mod buffer;
pub mod value;
