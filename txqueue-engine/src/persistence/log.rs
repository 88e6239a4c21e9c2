//! Segmented write-ahead log with a persisted low-water mark.
//!
//! ```text
//! <dir>/log-00000001.seg   frames, oldest first
//! <dir>/log-00000002.seg
//! <dir>/log.mark           [lsn: u64 LE][crc32: u32 LE]
//! ```
//!
//! The active segment rolls once it reaches the configured size. When the
//! low-water mark advances it is written to `log.mark` and every closed
//! segment whose last lsn is below it is deleted. Replay skips frames below
//! the mark.

use super::codec::{self, Lsn};
use super::frame_file::{self, FrameFile, SyncPolicy};
use super::marks::{Compactor, MarkTracker, Replay, Retention};
use super::strategy::QueuePersistenceStrategy;
use super::types::{FsyncMode, Holder, PersistenceError, Result};
use crate::core::types::{IdGenerator, ObjectId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const MARK_FILE: &str = "log.mark";
const SEGMENT_PREFIX: &str = "log-";
const SEGMENT_SUFFIX: &str = ".seg";
const MARK_FILE_SIZE: usize = 8 + 4;

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub dir: PathBuf,
    pub fsync_mode: FsyncMode,
    pub fsync_interval: Duration,
    pub buffer_size: usize,
    /// Roll the active segment once it holds this many bytes
    pub segment_size: u64,
    pub compaction_interval: Duration,
}

#[derive(Debug, Clone)]
struct Segment {
    number: u64,
    path: PathBuf,
    first_lsn: Option<Lsn>,
    last_lsn: Option<Lsn>,
}

impl Segment {
    fn frame_count(&self) -> usize {
        match (self.first_lsn, self.last_lsn) {
            (Some(first), Some(last)) => (last - first + 1) as usize,
            _ => 0,
        }
    }
}

struct LogWriter {
    closed: Vec<Segment>,
    active: FrameFile,
    active_number: u64,
    next_lsn: Lsn,
    /// Mark last written to `log.mark`
    mark: Lsn,
}

fn segment_name(number: u64) -> String {
    format!("{SEGMENT_PREFIX}{number:08}{SEGMENT_SUFFIX}")
}

fn parse_segment_name(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if let Some(number) = parse_segment_name(&name) {
            segments.push((number, entry.path()));
        }
    }
    segments.sort_unstable_by_key(|(number, _)| *number);
    Ok(segments)
}

fn read_mark(path: &Path) -> Result<Lsn> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    if bytes.len() != MARK_FILE_SIZE {
        return Err(PersistenceError::Corrupted {
            offset: 0,
            reason: format!("{}: expected {} bytes", path.display(), MARK_FILE_SIZE),
        });
    }

    let mut lsn_bytes = [0u8; 8];
    lsn_bytes.copy_from_slice(&bytes[..8]);
    let expected = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    let actual = crc32fast::hash(&lsn_bytes);
    if actual != expected {
        return Err(PersistenceError::ChecksumMismatch { expected, actual });
    }
    Ok(u64::from_le_bytes(lsn_bytes))
}

fn write_mark(path: &Path, lsn: Lsn) -> Result<()> {
    let lsn_bytes = lsn.to_le_bytes();
    let tmp = path.with_extension("mark.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&lsn_bytes)?;
        file.write_all(&crc32fast::hash(&lsn_bytes).to_le_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

struct SegmentedLog {
    config: LogConfig,
    mark_path: PathBuf,
    ids: Arc<dyn IdGenerator>,
    open: AtomicBool,
    writer: Mutex<Option<LogWriter>>,
    marks: Mutex<MarkTracker>,
    index: Mutex<HashMap<ObjectId, Holder>>,
}

impl SegmentedLog {
    fn sync_policy(&self) -> SyncPolicy {
        SyncPolicy::new(self.config.fsync_mode, self.config.fsync_interval)
    }

    fn open_segment(&self, number: u64) -> Result<FrameFile> {
        let path = self.config.dir.join(segment_name(number));
        FrameFile::open(&path, self.config.buffer_size, self.sync_policy())
    }

    fn open(&self) -> Result<()> {
        fs::create_dir_all(&self.config.dir)?;
        let mark = read_mark(&self.mark_path)?;
        let mut found = list_segments(&self.config.dir)?;

        let (active_number, active) = match found.pop() {
            Some((number, _)) => (number, self.open_segment(number)?),
            None => (1, self.open_segment(1)?),
        };

        let mut closed = Vec::with_capacity(found.len());
        for (number, path) in found {
            let scan = frame_file::scan(&path)?;
            if scan.torn {
                warn!("Closed segment {:?} has a torn tail", path);
            }
            closed.push(Segment {
                number,
                path,
                first_lsn: scan.first_lsn,
                last_lsn: scan.last_lsn,
            });
        }

        let last_lsn = active
            .last_lsn()
            .or_else(|| closed.iter().rev().find_map(|s| s.last_lsn));
        let next_lsn = last_lsn.map_or(0, |lsn| lsn + 1).max(mark);

        info!(
            "Log opened at {:?}: {} segments, mark {}, next lsn {}",
            self.config.dir,
            closed.len() + 1,
            mark,
            next_lsn
        );

        *self.writer.lock() = Some(LogWriter {
            closed,
            active,
            active_number,
            next_lsn,
            mark,
        });
        *self.marks.lock() = MarkTracker::new(next_lsn);
        self.index.lock().clear();
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn roll(&self, writer: &mut LogWriter) -> Result<()> {
        writer.active.sync_all()?;
        let number = writer.active_number + 1;
        let next = self.open_segment(number)?;
        let previous = std::mem::replace(&mut writer.active, next);

        writer.closed.push(Segment {
            number: writer.active_number,
            path: previous.path().to_path_buf(),
            first_lsn: previous.first_lsn(),
            last_lsn: previous.last_lsn(),
        });
        writer.active_number = number;
        debug!("Rolled log to segment {}", number);
        Ok(())
    }

    fn append(&self, writer: &mut LogWriter, record: &[u8]) -> Result<Lsn> {
        if writer.active.size() >= self.config.segment_size && writer.active.last_lsn().is_some() {
            self.roll(writer)?;
        }
        let lsn = writer.next_lsn;
        writer.active.append(lsn, record)?;
        writer.next_lsn += 1;
        Ok(lsn)
    }

    fn store(&self, holder: &Holder) -> Result<ObjectId> {
        let id = self.ids.next_id();
        let record = codec::encode_store(id, holder)?;

        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(PersistenceError::Closed)?;
        let lsn = self.append(writer, &record)?;
        self.marks.lock().record_store(id, lsn);
        self.index.lock().insert(id, holder.clone());

        debug!("log store {} at lsn {}", id, lsn);
        Ok(id)
    }

    fn load(&self, id: ObjectId) -> Result<Holder> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(PersistenceError::Closed);
        }
        self.index
            .lock()
            .get(&id)
            .cloned()
            .ok_or(PersistenceError::NotFound(id))
    }

    fn remove(&self, id: ObjectId) -> Result<()> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(PersistenceError::Closed)?;
        if !self.index.lock().contains_key(&id) {
            return Err(PersistenceError::NotFound(id));
        }

        let lsn = self.append(writer, &codec::encode_delete(id))?;
        self.marks.lock().record_delete(id, lsn);
        self.index.lock().remove(&id);

        debug!("log delete {} at lsn {}", id, lsn);
        Ok(())
    }

    fn restore(&self) -> Result<Vec<ObjectId>> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(PersistenceError::Closed)?;
        writer.active.flush()?;

        let mark = writer.mark;
        let mut replay = Replay::new(writer.next_lsn);
        let mut skipped = 0usize;
        let paths = writer
            .closed
            .iter()
            .map(|s| s.path.clone())
            .chain(std::iter::once(writer.active.path().to_path_buf()));

        let mut frames = 0;
        for path in paths {
            frames += frame_file::read_records(&path, |lsn, record| {
                if lsn < mark {
                    skipped += 1;
                    replay.skip(lsn);
                } else {
                    replay.apply(lsn, record);
                }
                Ok(())
            })?;
        }

        let (index, marks, ids) = replay.finish();
        *self.marks.lock() = marks;
        *self.index.lock() = index;

        info!(
            "Log replayed {} frames ({} below mark {}), {} live records",
            frames,
            skipped,
            mark,
            ids.len()
        );
        Ok(ids)
    }

    fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().take() {
            writer.active.sync_all()?;
        }
        self.index.lock().clear();
        info!("Log closed at {:?}", self.config.dir);
        Ok(())
    }
}

impl Retention for SegmentedLog {
    fn compact(&self) -> Result<usize> {
        let mut guard = self.writer.lock();
        let Some(writer) = guard.as_mut() else {
            return Ok(0);
        };

        let mark = self.marks.lock().low_water_mark();
        if mark <= writer.mark {
            return Ok(0);
        }

        // the active segment may still be buffering frames the mark covers
        writer.active.sync_all()?;
        write_mark(&self.mark_path, mark)?;
        writer.mark = mark;

        let mut reclaimed = 0;
        let mut kept = Vec::with_capacity(writer.closed.len());
        for segment in writer.closed.drain(..) {
            let obsolete = segment.last_lsn.is_none_or(|last| last < mark);
            if !obsolete {
                kept.push(segment);
                continue;
            }
            match fs::remove_file(&segment.path) {
                Ok(()) => {
                    reclaimed += segment.frame_count();
                    debug!("Deleted segment {} below mark {}", segment.number, mark);
                }
                Err(e) => {
                    warn!("Failed to delete segment {:?}: {}", segment.path, e);
                    kept.push(segment);
                }
            }
        }
        writer.closed = kept;
        self.marks.lock().release_until(mark);
        Ok(reclaimed)
    }
}

/// Howl-style segmented log strategy
pub struct LogPersistenceStrategy {
    log: Arc<SegmentedLog>,
    compactor: Mutex<Option<Compactor>>,
}

impl LogPersistenceStrategy {
    pub fn new(config: LogConfig, ids: Arc<dyn IdGenerator>) -> Self {
        let mark_path = config.dir.join(MARK_FILE);
        Self {
            log: Arc::new(SegmentedLog {
                config,
                mark_path,
                ids,
                open: AtomicBool::new(false),
                writer: Mutex::new(None),
                marks: Mutex::new(MarkTracker::default()),
                index: Mutex::new(HashMap::new()),
            }),
            compactor: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.log.config.dir
    }

    /// Advance the persisted mark now; returns frames dropped from disk
    pub fn compact(&self) -> Result<usize> {
        self.log.compact()
    }

    /// Mark currently persisted in `log.mark`
    pub fn persisted_mark(&self) -> Option<Lsn> {
        self.log.writer.lock().as_ref().map(|w| w.mark)
    }

    pub fn segment_count(&self) -> usize {
        self.log
            .writer
            .lock()
            .as_ref()
            .map_or(0, |w| w.closed.len() + 1)
    }
}

impl QueuePersistenceStrategy for LogPersistenceStrategy {
    fn name(&self) -> &'static str {
        "log"
    }

    fn open(&self) -> Result<()> {
        self.log.open()?;
        let interval = self.log.config.compaction_interval;
        if !interval.is_zero() {
            let target: Arc<dyn Retention> = self.log.clone();
            *self.compactor.lock() = Some(Compactor::spawn("log", interval, target)?);
        }
        Ok(())
    }

    fn store(&self, holder: &Holder) -> Result<ObjectId> {
        self.log.store(holder)
    }

    fn load(&self, id: ObjectId) -> Result<Holder> {
        self.log.load(id)
    }

    fn remove(&self, id: ObjectId) -> Result<()> {
        self.log.remove(id)
    }

    fn restore(&self) -> Result<Vec<ObjectId>> {
        self.log.restore()
    }

    fn close(&self) -> Result<()> {
        if let Some(mut compactor) = self.compactor.lock().take() {
            compactor.stop();
        }
        self.log.close()
    }
}

impl Drop for LogPersistenceStrategy {
    fn drop(&mut self) {
        if let Some(mut compactor) = self.compactor.lock().take() {
            compactor.stop();
        }
        if self.log.open.load(Ordering::SeqCst) {
            if let Err(e) = self.log.close() {
                warn!("Failed to close log on drop: {}", e);
            }
        }
    }
}
