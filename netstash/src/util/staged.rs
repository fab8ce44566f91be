use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// A file written to `<target>.p` and atomically renamed to `target` on
/// [`StagedFile::commit`]. Dropping an uncommitted instance deletes the
/// partial file, so an aborted download never leaves a truncated data
/// file in the cache directory.
pub struct StagedFile {
    file: File,
    partial_path: PathBuf,
    target_path: PathBuf,
    committed: bool,
}

/// Appends `suffix` to the last path component without replacing its
/// extension.
pub fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

impl StagedFile {
    pub fn create(target_path: impl Into<PathBuf>) -> io::Result<Self> {
        let target_path = target_path.into();
        let partial_path = append_suffix(&target_path, ".p");
        let file = File::create(&partial_path)?;
        Ok(Self {
            file,
            partial_path,
            target_path,
            committed: false,
        })
    }

    pub fn commit(mut self) -> io::Result<()> {
        self.file.flush()?;
        self.committed = true;
        fs::rename(&self.partial_path, &self.target_path)
    }
}

impl Write for StagedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.partial_path);
        }
    }
}
