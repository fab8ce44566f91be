//! Durable key/value settings stored as one codec-encoded map.
//!
//! The file `<documents>/_persist_values` holds a single map of string
//! keys to arbitrary values in the same binary form as cached JSON data
//! files, so either side can be inspected with the same tooling. Values
//! are kept in memory; every mutation rewrites the file atomically.

use crate::codec::buffer::{BufferReader, BufferWriter};
use crate::codec::value::Value;
use crate::error::{Error, Result};
use crate::util::staged::StagedFile;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

pub const PERSIST_FILE_NAME: &str = "_persist_values";

pub struct PersistedValues {
    path: PathBuf,
    values: Vec<(String, Value)>,
}

impl PersistedValues {
    /// Loads the settings map from `documents_dir`, starting empty when
    /// the file does not exist yet.
    pub fn open(documents_dir: &Path) -> Result<Self> {
        let path = documents_dir.join(PERSIST_FILE_NAME);
        let values = match fs::read(&path) {
            Ok(bytes) => decode_map(&bytes)?,
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, values })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    /// Inserts or replaces a value and rewrites the file.
    pub fn set(&mut self, key: &str, value: Value) -> Result<()> {
        match self.values.iter_mut().find(|(name, _)| name == key) {
            Some((_, slot)) => *slot = value,
            None => self.values.push((key.to_string(), value)),
        }
        self.save()
    }

    /// Removes a value; rewrites the file only when the key was present.
    pub fn remove(&mut self, key: &str) -> Result<()> {
        let before = self.values.len();
        self.values.retain(|(name, _)| name != key);
        if self.values.len() == before {
            return Ok(());
        }
        self.save()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn save(&self) -> Result<()> {
        let map = Value::Map(
            self.values
                .iter()
                .map(|(name, value)| (Value::String(name.clone()), value.clone()))
                .collect(),
        );
        let mut writer = BufferWriter::new();
        map.encode_to(&mut writer);
        let mut staged = StagedFile::create(&self.path)?;
        staged.write_all(&writer.into_bytes())?;
        Ok(staged.commit()?)
    }
}

fn decode_map(bytes: &[u8]) -> Result<Vec<(String, Value)>> {
    let mut reader = BufferReader::new(bytes);
    let Value::Map(entries) = Value::decode_from(&mut reader)? else {
        return Err(Error::MalformedSidecar("settings file is not a map"));
    };
    entries
        .into_iter()
        .map(|(key, value)| match key {
            Value::String(name) => Ok((name, value)),
            _ => Err(Error::MalformedSidecar("non-string settings key")),
        })
        .collect()
}
