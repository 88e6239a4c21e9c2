//! One file per record.
//!
//! Layout: `<root>/<queue>/<id>.<ext>`, each file holding
//!
//! ```text
//! [version: u8][seq: u64 LE][crc32: u32 LE][record]
//! ```
//!
//! `seq` is a store counter so that restore can hand identifiers back in
//! the order they were stored. Files are written as `<id>.<ext>.tmp` and
//! renamed into place.

use super::codec::{self, Record};
use super::strategy::QueuePersistenceStrategy;
use super::types::{Holder, PersistenceError, Result};
use crate::core::types::{IdGenerator, ObjectId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const FILE_FORMAT_VERSION: u8 = 1;
const ENVELOPE_HEADER_SIZE: usize = 1 + 8 + 4;

#[derive(Debug, Clone)]
struct FileEntry {
    queue: String,
    seq: u64,
}

#[derive(Debug, Default)]
struct FileState {
    open: bool,
    index: HashMap<ObjectId, FileEntry>,
    next_seq: u64,
}

pub struct FilePersistenceStrategy {
    root: PathBuf,
    extension: String,
    sync: bool,
    ids: Arc<dyn IdGenerator>,
    state: Mutex<FileState>,
}

impl FilePersistenceStrategy {
    pub fn new(
        root: impl Into<PathBuf>,
        extension: impl Into<String>,
        sync: bool,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
            sync,
            ids,
            state: Mutex::new(FileState::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, queue: &str, id: ObjectId) -> PathBuf {
        self.root
            .join(queue)
            .join(format!("{}.{}", id, self.extension))
    }

    fn tmp_extension(&self) -> String {
        format!("{}.tmp", self.extension)
    }

    fn write_record_file(&self, path: &Path, seq: u64, record: &[u8]) -> Result<()> {
        let tmp = path.with_extension(self.tmp_extension());
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&[FILE_FORMAT_VERSION])?;
            file.write_all(&seq.to_le_bytes())?;
            file.write_all(&codec::frame_crc(seq, record).to_le_bytes())?;
            file.write_all(record)?;
            if self.sync {
                file.sync_all()?;
            }
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read_record_file(path: &Path) -> Result<(u64, Record)> {
        let bytes = fs::read(path)?;
        if bytes.len() < ENVELOPE_HEADER_SIZE {
            return Err(corrupted(path, "file shorter than header"));
        }
        if bytes[0] != FILE_FORMAT_VERSION {
            return Err(corrupted(path, &format!("unknown version {}", bytes[0])));
        }

        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&bytes[1..9]);
        let seq = u64::from_le_bytes(seq_bytes);
        let expected = u32::from_le_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]);
        let record = &bytes[ENVELOPE_HEADER_SIZE..];

        let actual = codec::frame_crc(seq, record);
        if actual != expected {
            return Err(PersistenceError::ChecksumMismatch { expected, actual });
        }
        Ok((seq, Record::decode(record)?))
    }
}

fn corrupted(path: &Path, reason: &str) -> PersistenceError {
    PersistenceError::Corrupted {
        offset: 0,
        reason: format!("{}: {}", path.display(), reason),
    }
}

/// Queue names become directory names
fn validate_queue_dir(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(PersistenceError::InvalidQueueName(name.to_string()));
    }
    Ok(())
}

impl QueuePersistenceStrategy for FilePersistenceStrategy {
    fn name(&self) -> &'static str {
        "file"
    }

    fn open(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        self.state.lock().open = true;
        info!("File store opened at {:?}", self.root);
        Ok(())
    }

    fn store(&self, holder: &Holder) -> Result<ObjectId> {
        validate_queue_dir(&holder.queue)?;

        let id = self.ids.next_id();
        let record = codec::encode_store(id, holder)?;

        let seq = {
            let mut state = self.state.lock();
            if !state.open {
                return Err(PersistenceError::Closed);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            seq
        };

        let path = self.record_path(&holder.queue, id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        self.write_record_file(&path, seq, &record)?;

        self.state.lock().index.insert(
            id,
            FileEntry {
                queue: holder.queue.clone(),
                seq,
            },
        );
        debug!("file store {} -> {:?}", id, path);
        Ok(id)
    }

    fn load(&self, id: ObjectId) -> Result<Holder> {
        let entry = {
            let state = self.state.lock();
            if !state.open {
                return Err(PersistenceError::Closed);
            }
            state
                .index
                .get(&id)
                .cloned()
                .ok_or(PersistenceError::NotFound(id))?
        };

        let path = self.record_path(&entry.queue, id);
        match Self::read_record_file(&path)? {
            (_, Record::Store { id: stored, holder }) if stored == id => Ok(holder),
            _ => Err(corrupted(&path, "record does not match file name")),
        }
    }

    fn remove(&self, id: ObjectId) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(PersistenceError::Closed);
        }
        let entry = state
            .index
            .get(&id)
            .cloned()
            .ok_or(PersistenceError::NotFound(id))?;

        let path = self.record_path(&entry.queue, id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PersistenceError::DeleteFailed { id, path });
            }
            Err(e) => return Err(e.into()),
        }
        state.index.remove(&id);
        debug!("file remove {} (seq {})", id, entry.seq);
        Ok(())
    }

    fn restore(&self) -> Result<Vec<ObjectId>> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(PersistenceError::Closed);
        }

        let record_suffix = format!(".{}", self.extension);
        let tmp_suffix = format!(".{}", self.tmp_extension());
        let mut found: Vec<(u64, ObjectId, String)> = Vec::new();

        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if file_name.ends_with(&tmp_suffix) {
                warn!("Removing incomplete record file {:?}", path);
                fs::remove_file(path)?;
                continue;
            }
            let Some(stem) = file_name.strip_suffix(&record_suffix) else {
                continue;
            };
            let Some(id) = ObjectId::parse(stem) else {
                warn!("Skipping unrecognised file {:?}", path);
                continue;
            };

            match Self::read_record_file(path)? {
                (seq, Record::Store { id: stored, holder }) if stored == id => {
                    found.push((seq, id, holder.queue));
                }
                _ => return Err(corrupted(path, "record does not match file name")),
            }
        }

        found.sort_unstable_by_key(|(seq, id, _)| (*seq, *id));
        state.index.clear();
        state.next_seq = found.last().map_or(0, |(seq, _, _)| seq + 1);

        let mut ids = Vec::with_capacity(found.len());
        for (seq, id, queue) in found {
            state.index.insert(id, FileEntry { queue, seq });
            ids.push(id);
        }

        info!("File store restored {} records from {:?}", ids.len(), self.root);
        Ok(ids)
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.open = false;
        state.index.clear();
        info!("File store closed at {:?}", self.root);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_dir_validation() {
        assert!(validate_queue_dir("orders").is_ok());
        assert!(validate_queue_dir("orders.eu-1").is_ok());
        assert!(validate_queue_dir("").is_err());
        assert!(validate_queue_dir("..").is_err());
        assert!(validate_queue_dir("a/b").is_err());
        assert!(validate_queue_dir("a\\b").is_err());
    }
}
