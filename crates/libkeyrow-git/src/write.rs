//! Record staging against the mirror's working area
//!
//! `RecordWriter` writes or removes one key's content and stages the path in
//! the index. It never creates a revision and never touches the remote.
//!
//! Writes hold an exclusive advisory lock on the target file. The lock only
//! guards against concurrent access to the same path from within this
//! process; cross-process exclusion is the caller's external lock. Content is
//! replaced truncate-then-write, so an interrupted write is restartable by
//! running the operation again.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use git2::Repository;
use libkeyrow_core::Key;

use crate::error::StoreError;

/// Staging mode for [`RecordWriter::stage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// The key must not exist yet
    Create,
    /// The key may exist as a regular file, or not at all
    Upsert,
}

/// Stages content changes for single keys
pub struct RecordWriter<'repo> {
    repo: &'repo Repository,
}

impl<'repo> RecordWriter<'repo> {
    pub fn new(repo: &'repo Repository) -> Self {
        Self { repo }
    }

    /// Write `data` to `key` and stage the path for the next revision
    pub fn stage(&self, key: &Key, data: &[u8], mode: WriteMode) -> Result<(), StoreError> {
        let path = self.key_path(key)?;

        match std::fs::metadata(&path) {
            Ok(existing) => match mode {
                WriteMode::Create => {
                    return Err(StoreError::KeyExists {
                        key: key.to_string(),
                    })
                }
                WriteMode::Upsert if existing.is_dir() => {
                    return Err(StoreError::KeyIsDirectory {
                        key: key.to_string(),
                    })
                }
                WriteMode::Upsert => {}
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        fs2::FileExt::lock_exclusive(&file).map_err(|e| StoreError::Lock {
            path: path.clone(),
            source: e,
        })?;
        let written = replace_content(&file, data);
        let unlocked = fs2::FileExt::unlock(&file);
        written?;
        unlocked.map_err(|e| StoreError::Lock {
            path: path.clone(),
            source: e,
        })?;

        self.stage_index(key)
    }

    /// Remove `key` from the working area and stage the removal
    pub fn remove(&self, key: &Key) -> Result<(), StoreError> {
        let path = self.key_path(key)?;

        match std::fs::metadata(&path) {
            Ok(existing) if existing.is_dir() => {
                return Err(StoreError::KeyIsDirectory {
                    key: key.to_string(),
                })
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::KeyNotFound {
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        }

        std::fs::remove_file(&path)?;

        let mut index = self.repo.index()?;
        index.remove_path(Path::new(key.as_str()))?;
        index.write()?;
        Ok(())
    }

    /// Read `key`'s current content under a shared advisory lock
    pub fn read(&self, key: &Key) -> Result<Vec<u8>, StoreError> {
        let path = self.key_path(key)?;

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::KeyNotFound {
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        if file.metadata()?.is_dir() {
            return Err(StoreError::KeyNotFound {
                key: key.to_string(),
            });
        }

        fs2::FileExt::lock_shared(&file).map_err(|e| StoreError::Lock {
            path: path.clone(),
            source: e,
        })?;
        let mut data = Vec::new();
        let read = (&file).read_to_end(&mut data);
        let unlocked = fs2::FileExt::unlock(&file);
        read?;
        unlocked.map_err(|e| StoreError::Lock {
            path,
            source: e,
        })?;
        Ok(data)
    }

    fn stage_index(&self, key: &Key) -> Result<(), StoreError> {
        let mut index = self.repo.index()?;
        index.add_path(Path::new(key.as_str()))?;
        index.write()?;
        Ok(())
    }

    fn key_path(&self, key: &Key) -> Result<PathBuf, StoreError> {
        let workdir = self
            .repo
            .workdir()
            .ok_or_else(|| git2::Error::from_str("mirror has no working area"))?;
        Ok(workdir.join(key.as_str()))
    }
}

fn replace_content(mut file: &File, data: &[u8]) -> Result<(), StoreError> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(data)?;
    file.flush()?;
    Ok(())
}
