//! Append-only file of codec frames, shared by the journal and log backends.

use super::codec::{self, FrameRead, FrameReader, Lsn, Record};
use super::types::{FsyncMode, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// When to fsync after an append
#[derive(Debug, Clone, Copy)]
pub(crate) struct SyncPolicy {
    mode: FsyncMode,
    interval: Duration,
    last_fsync: Instant,
}

impl SyncPolicy {
    pub fn new(mode: FsyncMode, interval: Duration) -> Self {
        Self {
            mode,
            interval,
            last_fsync: Instant::now(),
        }
    }

    fn after_append(&mut self, writer: &mut BufWriter<File>) -> Result<()> {
        // always hand the bytes to the OS; only the fsync is optional
        writer.flush()?;
        match self.mode {
            FsyncMode::Always => writer.get_ref().sync_data()?,
            FsyncMode::Periodic => {
                if self.last_fsync.elapsed() >= self.interval {
                    writer.get_ref().sync_data()?;
                    self.last_fsync = Instant::now();
                }
            }
            FsyncMode::Never => {}
        }
        Ok(())
    }
}

/// What a scan found in an existing file
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ScanResult {
    pub valid_len: u64,
    pub first_lsn: Option<Lsn>,
    pub last_lsn: Option<Lsn>,
    pub torn: bool,
    pub frames: usize,
}

/// Walk every frame of `path`. A missing file scans as empty.
pub(crate) fn scan(path: &Path) -> Result<ScanResult> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ScanResult::default()),
        Err(e) => return Err(e.into()),
    };

    let mut reader = FrameReader::new(BufReader::new(file));
    let mut result = ScanResult::default();
    loop {
        match reader.next_frame()? {
            FrameRead::Frame { lsn, .. } => {
                result.first_lsn.get_or_insert(lsn);
                result.last_lsn = Some(lsn);
                result.frames += 1;
            }
            FrameRead::End => break,
            FrameRead::Torn => {
                result.torn = true;
                break;
            }
        }
    }
    result.valid_len = reader.offset();
    Ok(result)
}

/// Decode every frame of `path` in order, handing each record to `apply`
pub(crate) fn read_records<F>(path: &Path, mut apply: F) -> Result<usize>
where
    F: FnMut(Lsn, Record) -> Result<()>,
{
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut reader = FrameReader::new(BufReader::new(file));
    let mut count = 0;
    loop {
        match reader.next_frame()? {
            FrameRead::Frame { lsn, record } => {
                apply(lsn, Record::decode(&record)?)?;
                count += 1;
            }
            FrameRead::End => break,
            FrameRead::Torn => {
                warn!("Incomplete frame at end of {:?}, ignoring", path);
                break;
            }
        }
    }
    Ok(count)
}

/// Raw frames lying wholly inside the first `limit` bytes of `path`
pub(crate) fn read_frames_until<F>(path: &Path, limit: u64, mut apply: F) -> Result<usize>
where
    F: FnMut(Lsn, &[u8]) -> Result<()>,
{
    let file = File::open(path)?;
    let mut reader = FrameReader::new(BufReader::new(file.take(limit)));
    let mut count = 0;
    loop {
        match reader.next_frame()? {
            FrameRead::Frame { lsn, record } => {
                apply(lsn, &record)?;
                count += 1;
            }
            FrameRead::End | FrameRead::Torn => break,
        }
    }
    Ok(count)
}

/// Copy every byte of `path` from `offset` to the end into `out`
pub(crate) fn copy_tail<W: Write>(path: &Path, offset: u64, out: &mut W) -> Result<u64> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    Ok(io::copy(&mut file, out)?)
}

/// Open append-only frame file
pub(crate) struct FrameFile {
    path: PathBuf,
    writer: BufWriter<File>,
    size: u64,
    first_lsn: Option<Lsn>,
    last_lsn: Option<Lsn>,
    sync: SyncPolicy,
}

impl FrameFile {
    /// Open for append, truncating a torn tail left by a crash
    pub fn open(path: &Path, buffer_size: usize, sync: SyncPolicy) -> Result<Self> {
        let scan = scan(path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;

        if scan.torn {
            warn!(
                "Torn write detected in {:?}, truncating to {} bytes",
                path, scan.valid_len
            );
            file.set_len(scan.valid_len)?;
            file.sync_all()?;
        }

        debug!(
            "Opened {:?}: {} frames, {} bytes",
            path, scan.frames, scan.valid_len
        );

        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::with_capacity(buffer_size.max(4096), file),
            size: scan.valid_len,
            first_lsn: scan.first_lsn,
            last_lsn: scan.last_lsn,
            sync,
        })
    }

    pub fn append(&mut self, lsn: Lsn, record: &[u8]) -> Result<()> {
        self.size += codec::write_frame(&mut self.writer, lsn, record)?;
        self.sync.after_append(&mut self.writer)?;
        self.first_lsn.get_or_insert(lsn);
        self.last_lsn = Some(lsn);
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flush and fsync regardless of policy
    pub fn sync_all(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn first_lsn(&self) -> Option<Lsn> {
        self.first_lsn
    }

    pub fn last_lsn(&self) -> Option<Lsn> {
        self.last_lsn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ObjectId;
    use crate::persistence::types::Holder;
    use std::fs;

    fn policy() -> SyncPolicy {
        SyncPolicy::new(FsyncMode::Never, Duration::from_secs(1))
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.log");

        let mut file = FrameFile::open(&path, 4096, policy()).unwrap();
        let store = codec::encode_store(ObjectId::from_u128(1), &Holder::new("q", "a")).unwrap();
        file.append(7, &store).unwrap();
        file.append(8, &codec::encode_delete(ObjectId::from_u128(1)))
            .unwrap();
        assert_eq!(file.first_lsn(), Some(7));
        assert_eq!(file.last_lsn(), Some(8));
        drop(file);

        let mut seen = Vec::new();
        let count = read_records(&path, |lsn, record| {
            seen.push((lsn, record.id()));
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 2);
        assert_eq!(seen[0], (7, ObjectId::from_u128(1)));
    }

    #[test]
    fn test_open_truncates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.log");

        let mut file = FrameFile::open(&path, 4096, policy()).unwrap();
        file.append(0, b"x-record-one").unwrap();
        let good_len = file.size();
        drop(file);

        // simulate a crash halfway through the next frame
        let mut bytes = fs::read(&path).unwrap();
        bytes.extend_from_slice(&[9, 0, 0, 0, 1, 2]);
        fs::write(&path, bytes).unwrap();

        let reopened = FrameFile::open(&path, 4096, policy()).unwrap();
        assert_eq!(reopened.size(), good_len);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
        assert_eq!(reopened.last_lsn(), Some(0));
    }

    #[test]
    fn test_missing_file_scans_empty() {
        let dir = tempfile::tempdir().unwrap();
        let result = scan(&dir.path().join("absent")).unwrap();
        assert_eq!(result.frames, 0);
        assert!(result.first_lsn.is_none());
    }
}
