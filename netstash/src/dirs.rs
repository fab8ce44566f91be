//! Resolution of the OS-provided directories the cache lives under.
//!
//! Hosts usually call [`AppDirs::resolve`] once at startup and pass the
//! result down; tests use [`AppDirs::under`] with a temp directory.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDirs {
    /// Root for regenerable data: the LRU cache directory.
    pub cache_dir: PathBuf,
    /// Root for durable data: the persisted settings file.
    pub documents_dir: PathBuf,
}

impl AppDirs {
    /// Resolves per-user directories for `app_name` from the environment
    /// (`XDG_CACHE_HOME`/`XDG_DATA_HOME`, falling back to the usual
    /// locations under `HOME`), creating them if missing.
    pub fn resolve(app_name: &str) -> io::Result<Self> {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .ok_or_else(|| io::Error::other("HOME is not set"))?;
        let cache_base = env::var_os("XDG_CACHE_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(".cache"));
        let data_base = env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(".local/share"));
        let dirs = Self {
            cache_dir: cache_base.join(app_name),
            documents_dir: data_base.join(app_name),
        };
        dirs.create()?;
        Ok(dirs)
    }

    /// Places both directories under `root`.
    pub fn under(root: &Path) -> io::Result<Self> {
        let dirs = Self {
            cache_dir: root.join("cache"),
            documents_dir: root.join("documents"),
        };
        dirs.create()?;
        Ok(dirs)
    }

    fn create(&self) -> io::Result<()> {
        fs::create_dir_all(&self.cache_dir)?;
        fs::create_dir_all(&self.documents_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_under_creates_both_directories() {
        let tmp = tempdir().unwrap();
        let dirs = AppDirs::under(tmp.path()).unwrap();
        assert!(dirs.cache_dir.is_dir());
        assert!(dirs.documents_dir.is_dir());
        assert_ne!(dirs.cache_dir, dirs.documents_dir);
    }
}
