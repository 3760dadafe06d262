//! Where transferred files live.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use dashmap::DashMap;

use crate::error::{Error, Result};

/// A map from file name to contents, shared by all concurrent transfers.
///
/// Both operations work on copies: callers never alias stored bytes.
pub trait Storage: Send + Sync {
    /// Store `data` under `name`, replacing any previous contents.
    fn put(&self, name: &str, data: &[u8]) -> Result<()>;

    /// A copy of the contents of `name`, or [`Error::NotFound`].
    fn get(&self, name: &str) -> Result<Vec<u8>>;
}

/// Files kept in memory.
#[derive(Debug, Default)]
pub struct MemStore {
    files: DashMap<String, Vec<u8>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStore {
    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        self.files.insert(name.to_owned(), data.to_vec());
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Vec<u8>> {
        self.files
            .get(name)
            .map(|data| data.value().clone())
            .ok_or(Error::NotFound)
    }
}

/// Files kept under a directory on disk.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Only plain relative names resolve, so no request escapes the root.
    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let path = Path::new(name);
        let plain = path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if name.is_empty() || !plain {
            return Err(Error::AccessViolation);
        }
        Ok(self.root.join(path))
    }
}

impl Storage for DirStore {
    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        fs::write(&path, data).map_err(io_error)
    }

    fn get(&self, name: &str) -> Result<Vec<u8>> {
        fs::read(self.resolve(name)?).map_err(io_error)
    }
}

fn io_error(err: std::io::Error) -> Error {
    match err.kind() {
        ErrorKind::NotFound => Error::NotFound,
        ErrorKind::PermissionDenied => Error::AccessViolation,
        _ => Error::Io(err),
    }
}
