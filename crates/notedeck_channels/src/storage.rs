use std::{
    fs, io,
    path::{Path, PathBuf},
};

use hashbrown::HashMap;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::{Error, Result};

/// Opaque JSON blobs by key. Channels, dismissals, unread timestamps and
/// settings all go through this.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn set(&mut self, key: &str, value: Value) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<()>;
}

/// Read a typed value. Missing keys and values that no longer parse are
/// both `None`; the latter is logged.
pub fn load<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Option<T> {
    let value = match store.get(key) {
        Ok(Some(value)) => value,
        Ok(None) => return None,
        Err(err) => {
            error!("could not read '{key}': {err}");
            return None;
        }
    };

    match serde_json::from_value(value) {
        Ok(v) => Some(v),
        Err(err) => {
            error!("invalid data under '{key}': {err}");
            None
        }
    }
}

/// Write a typed value, logging failures. In-memory state is the source
/// of truth, so a failed write is never fatal.
pub fn save<T: Serialize + ?Sized>(store: &mut dyn KeyValueStore, key: &str, value: &T) {
    let result = serde_json::to_value(value)
        .map_err(Error::from)
        .and_then(|value| store.set(key, value));

    if let Err(err) = result {
        error!("could not save '{key}': {err}");
    }
}

#[derive(Debug, Clone)]
pub struct DataPath {
    base: PathBuf,
}

impl DataPath {
    pub fn new(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref().to_path_buf();
        Self { base }
    }

    pub fn default_base() -> Option<PathBuf> {
        dirs::data_local_dir().map(|pb| pb.join("notedeck"))
    }

    pub fn default_base_or_cwd() -> PathBuf {
        Self::default_base().unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn channels(&self) -> PathBuf {
        self.base.join("channels")
    }
}

impl Default for DataPath {
    fn default() -> Self {
        Self::new(Self::default_base_or_cwd())
    }
}

/// One `<key>.json` file per key.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    directory: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(path: &DataPath) -> Self {
        Self {
            directory: path.channels(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file_name(key: &str) -> String {
        format!("{key}.json")
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.directory.join(Self::file_name(key));
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        let data = serde_json::to_string(&value)?;
        write_file(&self.directory, Self::file_name(key), &data)?;
        debug!("wrote {key} to {:?}", self.directory);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        let path = self.directory.join(Self::file_name(key));
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::Io(err)),
        }
    }
}

pub fn write_file(directory: &Path, file_name: String, data: &str) -> Result<()> {
    if !directory.exists() {
        fs::create_dir_all(directory)?
    }

    fs::write(directory.join(file_name), data)?;
    Ok(())
}

#[derive(Debug, Default, Clone)]
pub struct MemoryKeyValueStore {
    values: HashMap<String, Value>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        self.values.insert(key.to_owned(), value);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }
}
