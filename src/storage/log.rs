//! Local copy of the committed command log.
//!
//! Entries are stored in numbered segment files. Each segment holds a run of
//! contiguous entries, each written as a little-endian `u32` length prefix
//! followed by the bincode-encoded [`LogEntry`]. A segment is sealed once it
//! grows past the configured rotation size and a new one is opened on the
//! next append.
//!
//! Pruning removes whole sealed segments from the front of the log. The
//! active segment is never removed, so the newest entries always survive a
//! prune.

use crate::consensus::{LogEntry, LogPosition};
use crate::core::error::StorageError;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

/// Default rotation size (250 KB).
pub const DEFAULT_ROTATION_SIZE: u64 = 250 * 1024;

const SEGMENT_PREFIX: &str = "segment_";
const SEGMENT_EXTENSION: &str = "log";

/// Segment state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Segment is open for writing.
    Open,
    /// Segment is sealed and immutable.
    Sealed,
}

#[derive(Debug)]
struct Segment {
    id: u64,
    path: PathBuf,
    first_index: u64,
    last_index: u64,
    /// Term of the entry at `last_index`.
    last_term: u64,
    size_bytes: u64,
    state: SegmentState,
}

/// Summary of one segment, as seen by the prune planner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSummary {
    pub id: u64,
    pub first_index: u64,
    pub last_index: u64,
    pub size_bytes: u64,
    pub state: SegmentState,
}

/// Shape of the local log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogLayout {
    /// Oldest retained index (equals `last_index + 1` when empty).
    pub first_index: u64,
    /// Newest index, or the reset base when empty.
    pub last_index: u64,
    /// Segments, oldest first.
    pub segments: Vec<SegmentSummary>,
}

impl LogLayout {
    /// Total bytes held by all segments.
    pub fn total_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.size_bytes).sum()
    }

    /// Number of retained entries.
    pub fn entry_count(&self) -> u64 {
        (self.last_index + 1).saturating_sub(self.first_index)
    }
}

/// What a prune removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub segments_removed: usize,
    pub entries_removed: u64,
    pub bytes_reclaimed: u64,
    /// Oldest retained index after the prune.
    pub first_index: u64,
}

/// A log whose prefix can be discarded.
pub trait PrunableLog {
    /// Current layout.
    fn layout(&self) -> LogLayout;

    /// Remove sealed segments whose entries all lie at or below `index`.
    fn prune_through(&mut self, index: u64) -> Result<PruneReport, StorageError>;
}

/// Segmented on-disk command log.
#[derive(Debug)]
pub struct CommandLog {
    dir: PathBuf,
    rotation_size: u64,
    segments: Vec<Segment>,
    next_segment_id: u64,
    /// Position before the first retained entry.
    base: LogPosition,
    last: LogPosition,
    writer: Option<File>,
}

impl CommandLog {
    /// Open (or create) the log in `dir`, recovering existing segments.
    ///
    /// A torn record at the tail of the newest segment is truncated away.
    pub fn open(dir: impl Into<PathBuf>, rotation_size: u64) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| StorageError::io(format!("create log dir {}", dir.display()), e))?;

        let mut ids = list_segment_ids(&dir)?;
        ids.sort_unstable();

        let mut log = Self {
            dir,
            rotation_size: rotation_size.max(1),
            segments: Vec::with_capacity(ids.len()),
            next_segment_id: ids.last().map_or(0, |id| id + 1),
            base: LogPosition::ZERO,
            last: LogPosition::ZERO,
            writer: None,
        };

        let count = ids.len();
        for (i, id) in ids.into_iter().enumerate() {
            let is_tail = i + 1 == count;
            log.recover_segment(id, is_tail)?;
        }

        if let Some(first) = log.segments.first() {
            log.base = LogPosition::new(first.first_index - 1, 0);
        }
        if let Some(tail) = log.segments.last_mut() {
            tail.state = SegmentState::Open;
        }

        tracing::debug!(
            dir = %log.dir.display(),
            segments = log.segments.len(),
            first_index = log.first_index(),
            last = %log.last,
            "command log recovered"
        );
        Ok(log)
    }

    fn recover_segment(&mut self, id: u64, is_tail: bool) -> Result<(), StorageError> {
        let path = segment_path(&self.dir, id);
        let scan = scan_segment(&path)?;

        if let Some(valid_len) = scan.torn_at {
            if !is_tail {
                return Err(StorageError::codec(
                    format!("segment {}", path.display()),
                    format!("corrupt record at offset {valid_len}"),
                ));
            }
            tracing::warn!(
                path = %path.display(),
                offset = valid_len,
                "truncating torn record at log tail"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| StorageError::io("open torn segment", e))?;
            file.set_len(valid_len)
                .and_then(|_| file.sync_all())
                .map_err(|e| StorageError::io("truncate torn segment", e))?;
        }

        let (Some(first), Some(last)) = (scan.entries.first(), scan.entries.last()) else {
            std::fs::remove_file(&path).map_err(|e| StorageError::io("remove empty segment", e))?;
            return Ok(());
        };

        if self.last != LogPosition::ZERO && first.index() != self.last.index + 1 {
            return Err(StorageError::NonContiguous {
                expected: self.last.index + 1,
                actual: first.index(),
            });
        }

        self.segments.push(Segment {
            id,
            path,
            first_index: first.index(),
            last_index: last.index(),
            last_term: last.position.term,
            size_bytes: scan.valid_len,
            state: SegmentState::Sealed,
        });
        self.last = last.position;
        Ok(())
    }

    /// Directory holding the segments.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Oldest retained index.
    pub fn first_index(&self) -> u64 {
        self.base.index + 1
    }

    /// Position just before the first retained entry.
    ///
    /// The term is only known for a base set by a prune or reset in this
    /// process; after reopening it is reported as 0.
    pub fn base_position(&self) -> LogPosition {
        self.base
    }

    /// Position of the newest entry, or the reset base when empty.
    pub fn last_position(&self) -> LogPosition {
        self.last
    }

    /// Check if the log holds no entries.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Append one entry. The entry must directly follow the previous one.
    pub fn append(&mut self, entry: &LogEntry) -> Result<(), StorageError> {
        let expected = self.last.index + 1;
        if entry.index() != expected {
            return Err(StorageError::NonContiguous {
                expected,
                actual: entry.index(),
            });
        }

        let bytes = bincode::serialize(entry).map_err(|e| StorageError::codec("log entry", e))?;
        self.ensure_open_segment(entry.index())?;

        let writer = match self.writer.as_mut() {
            Some(writer) => writer,
            None => return Err(StorageError::codec("log append", "no open segment")),
        };
        let len = bytes.len() as u32;
        writer
            .write_all(&len.to_le_bytes())
            .and_then(|_| writer.write_all(&bytes))
            .and_then(|_| writer.sync_data())
            .map_err(|e| StorageError::io("append log entry", e))?;

        if let Some(segment) = self.segments.last_mut() {
            segment.size_bytes += 4 + bytes.len() as u64;
            segment.last_index = entry.index();
            segment.last_term = entry.position.term;
        }
        self.last = entry.position;
        Ok(())
    }

    fn ensure_open_segment(&mut self, next_index: u64) -> Result<(), StorageError> {
        let needs_new = match self.segments.last() {
            None => true,
            Some(segment) => {
                segment.state != SegmentState::Open || segment.size_bytes >= self.rotation_size
            }
        };

        if !needs_new {
            if self.writer.is_none() {
                if let Some(segment) = self.segments.last() {
                    self.writer = Some(open_append(&segment.path)?);
                }
            }
            return Ok(());
        }

        if let Some(segment) = self.segments.last_mut() {
            segment.state = SegmentState::Sealed;
            tracing::trace!(segment = segment.id, "log segment sealed");
        }

        let id = self.next_segment_id;
        self.next_segment_id += 1;
        let path = segment_path(&self.dir, id);
        self.writer = Some(open_append(&path)?);
        self.segments.push(Segment {
            id,
            path,
            first_index: next_index,
            last_index: next_index,
            last_term: 0,
            size_bytes: 0,
            state: SegmentState::Open,
        });
        Ok(())
    }

    /// Read entries in `[start_index, end_index)`.
    pub fn read_entries(
        &self,
        start_index: u64,
        end_index: u64,
    ) -> Result<Vec<LogEntry>, StorageError> {
        let mut entries = Vec::new();
        for segment in &self.segments {
            if segment.last_index < start_index || segment.first_index >= end_index {
                continue;
            }
            let scan = scan_segment(&segment.path)?;
            entries.extend(
                scan.entries
                    .into_iter()
                    .filter(|e| e.index() >= start_index && e.index() < end_index),
            );
        }
        Ok(entries)
    }

    /// Discard every entry and restart the log after `base`.
    ///
    /// Used when a snapshot replaces the state: the next appended entry must
    /// be `base.index + 1`.
    pub fn reset(&mut self, base: LogPosition) -> Result<(), StorageError> {
        self.writer = None;
        for segment in self.segments.drain(..) {
            remove_if_present(&segment.path)
                .map_err(|e| StorageError::io("remove segment on reset", e))?;
        }
        self.base = base;
        self.last = base;
        tracing::debug!(dir = %self.dir.display(), base = %base, "command log reset");
        Ok(())
    }
}

impl PrunableLog for CommandLog {
    fn layout(&self) -> LogLayout {
        LogLayout {
            first_index: self.first_index(),
            last_index: self.last.index,
            segments: self
                .segments
                .iter()
                .map(|s| SegmentSummary {
                    id: s.id,
                    first_index: s.first_index,
                    last_index: s.last_index,
                    size_bytes: s.size_bytes,
                    state: s.state,
                })
                .collect(),
        }
    }

    fn prune_through(&mut self, index: u64) -> Result<PruneReport, StorageError> {
        let mut report = PruneReport::default();

        while self.segments.len() > 1 {
            let segment = &self.segments[0];
            if segment.state != SegmentState::Sealed || segment.last_index > index {
                break;
            }

            remove_if_present(&segment.path).map_err(|e| {
                StorageError::io(format!("remove segment {}", segment.path.display()), e)
            })?;

            let segment = self.segments.remove(0);
            report.segments_removed += 1;
            report.entries_removed += segment.last_index - segment.first_index + 1;
            report.bytes_reclaimed += segment.size_bytes;
            self.base = LogPosition::new(segment.last_index, segment.last_term);
        }

        report.first_index = self.first_index();
        Ok(report)
    }
}

struct SegmentScan {
    entries: Vec<LogEntry>,
    valid_len: u64,
    /// Offset of the first undecodable record, if any.
    torn_at: Option<u64>,
}

fn scan_segment(path: &Path) -> Result<SegmentScan, StorageError> {
    let file = File::open(path).map_err(|e| StorageError::io("open segment", e))?;
    let file_len = file
        .metadata()
        .map_err(|e| StorageError::io("stat segment", e))?
        .len();
    let mut reader = BufReader::new(file);
    let mut scan = SegmentScan {
        entries: Vec::new(),
        valid_len: 0,
        torn_at: None,
    };
    let mut len_buf = [0u8; 4];

    loop {
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // A partial length prefix is a torn write as well.
                if has_trailing_bytes(path, scan.valid_len)? {
                    scan.torn_at = Some(scan.valid_len);
                }
                break;
            }
            Err(e) => return Err(StorageError::io("read entry length", e)),
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        // A length running past the end of the file is a torn prefix.
        if len as u64 > file_len.saturating_sub(scan.valid_len + 4) {
            scan.torn_at = Some(scan.valid_len);
            break;
        }
        let mut entry_buf = vec![0u8; len];
        match reader.read_exact(&mut entry_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                scan.torn_at = Some(scan.valid_len);
                break;
            }
            Err(e) => return Err(StorageError::io("read entry data", e)),
        }

        match bincode::deserialize::<LogEntry>(&entry_buf) {
            Ok(entry) => {
                scan.entries.push(entry);
                scan.valid_len += 4 + len as u64;
            }
            Err(_) => {
                scan.torn_at = Some(scan.valid_len);
                break;
            }
        }
    }

    Ok(scan)
}

fn has_trailing_bytes(path: &Path, valid_len: u64) -> Result<bool, StorageError> {
    let len = std::fs::metadata(path)
        .map_err(|e| StorageError::io("stat segment", e))?
        .len();
    Ok(len > valid_len)
}

fn open_append(path: &Path) -> Result<File, StorageError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StorageError::io(format!("open segment {}", path.display()), e))
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{id:016}.{SEGMENT_EXTENSION}"))
}

fn list_segment_ids(dir: &Path) -> Result<Vec<u64>, StorageError> {
    let entries = std::fs::read_dir(dir).map_err(|e| StorageError::io("list log dir", e))?;
    Ok(entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == SEGMENT_EXTENSION))
        .filter_map(|p| {
            p.file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.strip_prefix(SEGMENT_PREFIX))
                .and_then(|s| s.parse::<u64>().ok())
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::Command;
    use tempfile::TempDir;

    fn entry(index: u64) -> LogEntry {
        LogEntry::new(
            LogPosition::new(index, 1),
            Command::data(format!("key-{index}"), vec![0u8; 32]),
        )
    }

    fn fill(log: &mut CommandLog, from: u64, to: u64) {
        for i in from..=to {
            log.append(&entry(i)).unwrap();
        }
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let mut log = CommandLog::open(dir.path(), DEFAULT_ROTATION_SIZE).unwrap();
        fill(&mut log, 1, 5);

        let entries = log.read_entries(2, 4).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index(), 2);
        assert_eq!(log.last_position().index, 5);
        assert_eq!(log.first_index(), 1);
    }

    #[test]
    fn test_append_rejects_gap() {
        let dir = TempDir::new().unwrap();
        let mut log = CommandLog::open(dir.path(), DEFAULT_ROTATION_SIZE).unwrap();
        fill(&mut log, 1, 2);

        let err = log.append(&entry(4)).unwrap_err();
        assert!(matches!(
            err,
            StorageError::NonContiguous {
                expected: 3,
                actual: 4
            }
        ));
    }

    #[test]
    fn test_rotation_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = CommandLog::open(dir.path(), 128).unwrap();
            fill(&mut log, 1, 20);
            assert!(log.layout().segments.len() > 1);
        }

        let log = CommandLog::open(dir.path(), 128).unwrap();
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_position().index, 20);
        assert_eq!(log.read_entries(1, 21).unwrap().len(), 20);
    }

    #[test]
    fn test_prune_keeps_active_segment() {
        let dir = TempDir::new().unwrap();
        let mut log = CommandLog::open(dir.path(), 128).unwrap();
        fill(&mut log, 1, 30);
        let before = log.layout();

        let report = log.prune_through(u64::MAX).unwrap();
        assert_eq!(report.segments_removed, before.segments.len() - 1);

        let after = log.layout();
        assert_eq!(after.segments.len(), 1);
        assert_eq!(after.last_index, 30);
        assert_eq!(report.first_index, after.segments[0].first_index);
    }

    #[test]
    fn test_prune_respects_bound() {
        let dir = TempDir::new().unwrap();
        let mut log = CommandLog::open(dir.path(), 128).unwrap();
        fill(&mut log, 1, 30);

        log.prune_through(5).unwrap();
        let layout = log.layout();
        assert!(layout.first_index <= 6);
        assert_eq!(log.read_entries(6, 7).unwrap().len(), 1);
    }

    #[test]
    fn test_torn_tail_truncated() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = CommandLog::open(dir.path(), DEFAULT_ROTATION_SIZE).unwrap();
            fill(&mut log, 1, 3);
        }

        let path = segment_path(dir.path(), 0);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[200, 0, 0, 0, 1, 2]).unwrap();
        drop(file);

        let mut log = CommandLog::open(dir.path(), DEFAULT_ROTATION_SIZE).unwrap();
        assert_eq!(log.last_position().index, 3);
        log.append(&entry(4)).unwrap();
        assert_eq!(log.read_entries(1, 10).unwrap().len(), 4);
    }

    #[test]
    fn test_oversized_length_prefix_is_torn() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = CommandLog::open(dir.path(), DEFAULT_ROTATION_SIZE).unwrap();
            fill(&mut log, 1, 3);
        }

        let path = segment_path(dir.path(), 0);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&u32::MAX.to_le_bytes()).unwrap();
        file.write_all(&[9u8; 16]).unwrap();
        drop(file);

        let scan = scan_segment(&path).unwrap();
        assert_eq!(scan.entries.len(), 3);
        assert!(scan.torn_at.is_some());

        let log = CommandLog::open(dir.path(), DEFAULT_ROTATION_SIZE).unwrap();
        assert_eq!(log.last_position().index, 3);
    }

    #[test]
    fn test_prune_keeps_boundary_term() {
        let dir = TempDir::new().unwrap();
        let mut log = CommandLog::open(dir.path(), 128).unwrap();
        for i in 1..=30 {
            let term = if i <= 10 { 1 } else { 3 };
            log.append(&LogEntry::new(
                LogPosition::new(i, term),
                Command::data(format!("key-{i}"), vec![0u8; 32]),
            ))
            .unwrap();
        }

        log.prune_through(20).unwrap();
        let base = log.base_position();
        assert!(base.index > 0);
        let expected_term = if base.index <= 10 { 1 } else { 3 };
        assert_eq!(base, LogPosition::new(base.index, expected_term));
        assert_eq!(log.first_index(), base.index + 1);
    }

    #[test]
    fn test_reset_restarts_after_base() {
        let dir = TempDir::new().unwrap();
        let mut log = CommandLog::open(dir.path(), DEFAULT_ROTATION_SIZE).unwrap();
        fill(&mut log, 1, 3);

        log.reset(LogPosition::new(50, 2)).unwrap();
        assert!(log.is_empty());
        assert_eq!(log.first_index(), 51);
        assert!(log.append(&entry(4)).is_err());
        log.append(&entry(51)).unwrap();
        assert_eq!(log.layout().entry_count(), 1);
    }
}
