use super::codec::{self, Lsn};
use super::frame_file::{self, FrameFile, SyncPolicy};
use super::marks::{Compactor, MarkTracker, Replay, Retention};
use super::strategy::QueuePersistenceStrategy;
use super::types::{FsyncMode, Holder, PersistenceError, Result};
use crate::core::types::{IdGenerator, ObjectId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const JOURNAL_FILE: &str = "queue.journal";

/// Journal tuning
#[derive(Debug, Clone)]
pub struct JournalConfig {
    pub dir: PathBuf,
    pub fsync_mode: FsyncMode,
    pub fsync_interval: Duration,
    pub buffer_size: usize,
    pub compaction_interval: Duration,
}

struct JournalWriter {
    file: FrameFile,
    next_lsn: Lsn,
}

/// Single append-only journal file
struct Journal {
    config: JournalConfig,
    path: PathBuf,
    ids: Arc<dyn IdGenerator>,
    open: AtomicBool,
    writer: Mutex<Option<JournalWriter>>,
    /// Pending/unused marks; shared with the compactor thread
    marks: Mutex<MarkTracker>,
    index: Mutex<HashMap<ObjectId, Holder>>,
    /// Held for a whole compaction pass, and by close
    compacting: Mutex<()>,
}

impl Journal {
    fn sync_policy(&self) -> SyncPolicy {
        SyncPolicy::new(self.config.fsync_mode, self.config.fsync_interval)
    }

    fn open(&self) -> Result<()> {
        fs::create_dir_all(&self.config.dir)?;
        let file = FrameFile::open(&self.path, self.config.buffer_size, self.sync_policy())?;
        let next_lsn = file.last_lsn().map_or(0, |lsn| lsn + 1);

        *self.writer.lock() = Some(JournalWriter { file, next_lsn });
        *self.marks.lock() = MarkTracker::new(next_lsn);
        self.index.lock().clear();
        self.open.store(true, Ordering::SeqCst);

        info!("Journal opened at {:?}, next lsn {}", self.path, next_lsn);
        Ok(())
    }

    fn append(&self, writer: &mut JournalWriter, record: &[u8]) -> Result<Lsn> {
        let lsn = writer.next_lsn;
        writer.file.append(lsn, record)?;
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

        debug!("journal store {} at lsn {}", id, lsn);
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

        debug!("journal delete {} at lsn {}", id, lsn);
        Ok(())
    }

    fn restore(&self) -> Result<Vec<ObjectId>> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(PersistenceError::Closed)?;
        writer.file.flush()?;

        let mut replay = Replay::new(writer.next_lsn);
        let frames = frame_file::read_records(&self.path, |lsn, record| {
            replay.apply(lsn, record);
            Ok(())
        })?;

        let (index, marks, ids) = replay.finish();
        *self.marks.lock() = marks;
        *self.index.lock() = index;

        info!(
            "Journal replayed {} frames, {} live records",
            frames,
            ids.len()
        );
        Ok(ids)
    }

    fn close(&self) -> Result<()> {
        let _compacting = self.compacting.lock();
        self.open.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().take() {
            writer.file.sync_all()?;
        }
        self.index.lock().clear();
        info!("Journal closed at {:?}", self.path);
        Ok(())
    }

    /// Rewrite the journal without the frames below `mark`.
    ///
    /// The bulk of the file, up to `snapshot_len`, is copied with the writer
    /// unlocked. The writer lock is re-taken only to copy what was appended
    /// since and swap the files.
    fn rewrite_from(&self, mark: Lsn, snapshot_len: u64) -> Result<usize> {
        let tmp = self.path.with_extension("journal.compact");
        let mut out = BufWriter::new(File::create(&tmp)?);
        let mut kept = 0usize;
        let mut dropped = 0usize;
        frame_file::read_frames_until(&self.path, snapshot_len, |lsn, record| {
            if lsn < mark {
                dropped += 1;
                return Ok(());
            }
            codec::write_frame(&mut out, lsn, record)?;
            kept += 1;
            Ok(())
        })?;

        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(PersistenceError::Closed)?;
        writer.file.flush()?;
        let tail = frame_file::copy_tail(&self.path, snapshot_len, &mut out)?;
        let file = out
            .into_inner()
            .map_err(|e| PersistenceError::IOError(e.into_error()))?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;

        writer.file = FrameFile::open(&self.path, self.config.buffer_size, self.sync_policy())?;
        self.marks.lock().release_until(mark);
        debug!(
            "Journal rewritten from lsn {}: kept {}, dropped {}, {} tail bytes",
            mark, kept, dropped, tail
        );
        Ok(dropped)
    }
}

impl Retention for Journal {
    fn compact(&self) -> Result<usize> {
        let _compacting = self.compacting.lock();

        // writer first, then marks: the same order store/remove take them
        let (mark, snapshot_len) = {
            let mut guard = self.writer.lock();
            let Some(writer) = guard.as_mut() else {
                return Ok(0);
            };

            let mark = {
                let marks = self.marks.lock();
                let mark = marks.low_water_mark();
                if marks.reclaimable(mark) == 0 {
                    return Ok(0);
                }
                mark
            };
            if writer.file.first_lsn().is_none_or(|first| first >= mark) {
                self.marks.lock().release_until(mark);
                return Ok(0);
            }

            writer.file.sync_all()?;
            (mark, writer.file.size())
        };

        self.rewrite_from(mark, snapshot_len)
    }
}

/// Simple append-only journal strategy.
///
/// Every store and remove appends one frame to `<dir>/queue.journal`. The
/// compactor rewrites the file from the low-water mark once frames below
/// it become unused. Stores and removes only wait on a rewrite while the
/// frames appended during the copy are moved across.
pub struct JournalPersistenceStrategy {
    journal: Arc<Journal>,
    compactor: Mutex<Option<Compactor>>,
}

impl JournalPersistenceStrategy {
    pub fn new(config: JournalConfig, ids: Arc<dyn IdGenerator>) -> Self {
        let path = config.dir.join(JOURNAL_FILE);
        Self {
            journal: Arc::new(Journal {
                config,
                path,
                ids,
                open: AtomicBool::new(false),
                writer: Mutex::new(None),
                marks: Mutex::new(MarkTracker::default()),
                index: Mutex::new(HashMap::new()),
                compacting: Mutex::new(()),
            }),
            compactor: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.journal.path
    }

    /// Run one compaction pass now; returns frames reclaimed
    pub fn compact(&self) -> Result<usize> {
        self.journal.compact()
    }

    pub fn low_water_mark(&self) -> Lsn {
        self.journal.marks.lock().low_water_mark()
    }
}

impl QueuePersistenceStrategy for JournalPersistenceStrategy {
    fn name(&self) -> &'static str {
        "journal"
    }

    fn open(&self) -> Result<()> {
        self.journal.open()?;
        let interval = self.journal.config.compaction_interval;
        if !interval.is_zero() {
            let target: Arc<dyn Retention> = self.journal.clone();
            *self.compactor.lock() = Some(Compactor::spawn("journal", interval, target)?);
        }
        Ok(())
    }

    fn store(&self, holder: &Holder) -> Result<ObjectId> {
        self.journal.store(holder)
    }

    fn load(&self, id: ObjectId) -> Result<Holder> {
        self.journal.load(id)
    }

    fn remove(&self, id: ObjectId) -> Result<()> {
        self.journal.remove(id)
    }

    fn restore(&self) -> Result<Vec<ObjectId>> {
        self.journal.restore()
    }

    fn close(&self) -> Result<()> {
        if let Some(mut compactor) = self.compactor.lock().take() {
            compactor.stop();
        }
        self.journal.close()
    }
}

impl Drop for JournalPersistenceStrategy {
    fn drop(&mut self) {
        if let Some(mut compactor) = self.compactor.lock().take() {
            compactor.stop();
        }
        if self.journal.open.load(Ordering::SeqCst) {
            if let Err(e) = self.journal.close() {
                warn!("Failed to close journal on drop: {}", e);
            }
        }
    }
}
