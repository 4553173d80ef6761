use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use prost::Message;

use crate::proto::{Entry, LogMetadata};

/// Ordered, durable storage for Raft log entries plus the critical
/// `{current_term, voted_for}` metadata blob.
///
/// Entry ids are 1-based and dense; id 0 is the sentinel "before the log".
/// With a storage directory configured, each entry lives in its own file
/// named by its zero-padded hex id and the metadata blob is rewritten
/// atomically on every change. Without one, everything stays in memory.
///
/// Mutations update memory immediately and queue the matching file
/// operations on the [`LogSync`] handle; the consensus lock is never held
/// across a disk write. Callers flush the queue past a mutation's marker
/// before sending any RPC or reply that depends on it.
///
/// Durability failures abort the process: losing an entry or a vote that was
/// already acknowledged would silently break safety.
pub struct Log {
    /// Persisted via `update_metadata` after every change to the term or
    /// the vote; the blob reaches disk on the next sync.
    pub metadata: LogMetadata,
    /// index is entry id - 1
    entries: Vec<Entry>,
    sync: Arc<LogSync>,
}

/// A queued file operation, applied in enqueue order.
enum SyncOp {
    WriteEntry { entry_id: u64, bytes: Vec<u8> },
    RemoveEntry { entry_id: u64 },
    WriteMetadata { bytes: Vec<u8> },
}

struct Pending {
    ops: Vec<(u64, SyncOp)>,
    enqueued: u64,
}

/// Performs the log's queued disk writes, outside the consensus lock and
/// internally synchronized. Whichever caller holds the flush lock drains
/// every operation queued so far, so `sync(seq)` returns once the operation
/// with that sequence number is on disk, no matter who wrote it.
pub struct LogSync {
    dir: Option<PathBuf>,
    pending: StdMutex<Pending>,
    flush_lock: tokio::sync::Mutex<()>,
    synced: AtomicU64,
}

impl LogSync {
    fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            pending: StdMutex::new(Pending {
                ops: Vec::new(),
                enqueued: 0,
            }),
            flush_lock: tokio::sync::Mutex::new(()),
            synced: AtomicU64::new(0),
        }
    }

    fn enqueue(&self, op: SyncOp) {
        if self.dir.is_none() {
            return;
        }
        let mut pending = self.pending.lock().expect("sync queue poisoned");
        pending.enqueued += 1;
        let seq = pending.enqueued;
        pending.ops.push((seq, op));
    }

    /// Sequence number of the newest queued operation.
    pub fn enqueued_seq(&self) -> u64 {
        self.pending.lock().expect("sync queue poisoned").enqueued
    }

    /// Block until the operation with sequence number `seq` is durable,
    /// draining the queue if nobody else is.
    pub async fn sync(&self, seq: u64) {
        if self.synced.load(Ordering::Acquire) >= seq {
            return;
        }
        let _guard = self.flush_lock.lock().await;
        self.flush_pending(seq);
    }

    /// Drain the queue immediately. Only valid while no concurrent flusher
    /// can exist, i.e. during startup before workers run.
    pub fn sync_blocking(&self) {
        let _guard = self
            .flush_lock
            .try_lock()
            .expect("log flusher busy during startup");
        let seq = self.enqueued_seq();
        self.flush_pending(seq);
    }

    fn flush_pending(&self, seq: u64) {
        if self.synced.load(Ordering::Acquire) >= seq {
            return;
        }
        let ops = std::mem::take(&mut self.pending.lock().expect("sync queue poisoned").ops);
        let mut last = self.synced.load(Ordering::Acquire);
        for (op_seq, op) in ops {
            self.perform(op);
            last = op_seq;
        }
        self.synced.store(last, Ordering::Release);
    }

    fn perform(&self, op: SyncOp) {
        let dir = self.dir.as_ref().expect("ops only queued with a directory");
        match op {
            SyncOp::WriteEntry { entry_id, bytes } => {
                write_file(&entry_path(dir, entry_id), &bytes)
                    .unwrap_or_else(|e| panic!("failed to persist log entry {entry_id}: {e}"));
            }
            SyncOp::RemoveEntry { entry_id } => {
                fs::remove_file(entry_path(dir, entry_id))
                    .unwrap_or_else(|e| panic!("failed to remove log entry {entry_id}: {e}"));
            }
            SyncOp::WriteMetadata { bytes } => {
                write_file(&dir.join("metadata"), &bytes)
                    .unwrap_or_else(|e| panic!("failed to persist log metadata: {e}"));
            }
        }
    }
}

impl Log {
    /// Open the log, reading back any entries and metadata found in `dir`.
    pub fn open(dir: Option<PathBuf>) -> io::Result<Self> {
        let mut log = Self {
            metadata: LogMetadata::default(),
            entries: Vec::new(),
            sync: Arc::new(LogSync::new(None)),
        };

        let Some(dir) = dir else {
            return Ok(log);
        };
        fs::create_dir_all(&dir)?;

        let metadata_path = dir.join("metadata");
        if metadata_path.exists() {
            let bytes = fs::read(&metadata_path)?;
            log.metadata = LogMetadata::decode(bytes.as_slice())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }

        let mut entry_ids = Vec::new();
        for dir_entry in fs::read_dir(&dir)? {
            let name = dir_entry?.file_name();
            let name = name.to_string_lossy();
            if name == "metadata" || name.ends_with(".tmp") {
                continue;
            }
            match u64::from_str_radix(&name, 16) {
                Ok(id) => entry_ids.push(id),
                Err(_) => {
                    tracing::warn!(file = %name, "Ignoring file that is not a log entry");
                }
            }
        }
        entry_ids.sort_unstable();

        for id in entry_ids {
            let bytes = fs::read(entry_path(&dir, id))?;
            let entry = Entry::decode(bytes.as_slice())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            log.entries.push(entry);
            assert_eq!(
                log.entries.len() as u64,
                id,
                "log directory has a gap in entry ids"
            );
        }

        log.sync = Arc::new(LogSync::new(Some(dir)));
        Ok(log)
    }

    /// Handle used to flush queued writes with the consensus lock released.
    pub fn sync_handle(&self) -> Arc<LogSync> {
        self.sync.clone()
    }

    /// Marker for everything queued so far; pass to [`LogSync::sync`].
    pub fn sync_marker(&self) -> u64 {
        self.sync.enqueued_seq()
    }

    /// Flush queued writes immediately. Startup only.
    pub fn sync_blocking(&self) {
        self.sync.sync_blocking();
    }

    /// Append a new entry. The entry id is assigned here and returned; the
    /// entry reaches disk on the next sync.
    pub fn append(&mut self, entry: Entry) -> u64 {
        let bytes = entry.encode_to_vec();
        self.entries.push(entry);
        let entry_id = self.entries.len() as u64;
        self.sync.enqueue(SyncOp::WriteEntry { entry_id, bytes });
        entry_id
    }

    /// Look up an entry. Defined for ids in `[1, last_id()]`.
    pub fn get_entry(&self, entry_id: u64) -> Option<&Entry> {
        if entry_id == 0 {
            return None;
        }
        self.entries.get((entry_id - 1) as usize)
    }

    /// The term of the given entry, or 0 for id 0 and ids past the end.
    pub fn get_term(&self, entry_id: u64) -> u64 {
        self.get_entry(entry_id).map(|e| e.term).unwrap_or(0)
    }

    /// Id of the most recent entry, or 0 if the log is empty.
    pub fn last_id(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.get_term(self.last_id())
    }

    /// Id of the earliest entry sharing the last entry's term, or 0 if the
    /// log is empty.
    pub fn begin_last_term_id(&self) -> u64 {
        let mut entry_id = self.last_id();
        if entry_id == 0 {
            return 0;
        }
        let last_term = self.get_term(entry_id);
        while self.get_term(entry_id - 1) == last_term {
            entry_id -= 1;
        }
        entry_id
    }

    /// Drop all entries with ids greater than `last_entry_id`, which may be
    /// any id including 0 and ids past the end.
    pub fn truncate(&mut self, last_entry_id: u64) {
        if last_entry_id >= self.last_id() {
            return;
        }
        for entry_id in (last_entry_id + 1)..=self.last_id() {
            self.sync.enqueue(SyncOp::RemoveEntry { entry_id });
        }
        self.entries.truncate(last_entry_id as usize);
    }

    /// All entries in id order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Queue `metadata` for persistence. Call after changing it.
    pub fn update_metadata(&mut self) {
        let bytes = self.metadata.encode_to_vec();
        self.sync.enqueue(SyncOp::WriteMetadata { bytes });
    }
}

fn entry_path(dir: &Path, entry_id: u64) -> PathBuf {
    dir.join(format!("{entry_id:016x}"))
}

/// Write via a temp file and rename so readers never observe a torn write.
fn write_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::EntryType;

    fn data_entry(term: u64, data: &[u8]) -> Entry {
        Entry {
            term,
            r#type: EntryType::Data as i32,
            configuration: None,
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_empty_log() {
        let log = Log::open(None).unwrap();
        assert_eq!(log.last_id(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.get_term(0), 0);
        assert_eq!(log.get_term(1), 0);
        assert_eq!(log.begin_last_term_id(), 0);
        assert!(log.get_entry(0).is_none());
        assert!(log.get_entry(1).is_none());
    }

    #[test]
    fn test_append_assigns_dense_ids() {
        let mut log = Log::open(None).unwrap();
        assert_eq!(log.append(data_entry(1, b"a")), 1);
        assert_eq!(log.append(data_entry(1, b"b")), 2);
        assert_eq!(log.append(data_entry(2, b"c")), 3);
        assert_eq!(log.last_id(), 3);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.get_entry(2).unwrap().data, b"b");
        assert_eq!(log.get_term(3), 2);
        assert_eq!(log.get_term(4), 0);
    }

    #[test]
    fn test_begin_last_term_id() {
        let mut log = Log::open(None).unwrap();
        log.append(data_entry(1, b"a"));
        log.append(data_entry(1, b"b"));
        log.append(data_entry(3, b"c"));
        log.append(data_entry(3, b"d"));
        assert_eq!(log.begin_last_term_id(), 3);
        log.truncate(2);
        assert_eq!(log.begin_last_term_id(), 1);
    }

    #[test]
    fn test_truncate() {
        let mut log = Log::open(None).unwrap();
        log.append(data_entry(1, b"a"));
        log.append(data_entry(1, b"b"));
        log.append(data_entry(1, b"c"));

        log.truncate(5); // past the end: no-op
        assert_eq!(log.last_id(), 3);

        log.truncate(1);
        assert_eq!(log.last_id(), 1);
        assert!(log.get_entry(2).is_none());

        log.truncate(0);
        assert_eq!(log.last_id(), 0);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();

        {
            let mut log = Log::open(Some(path.clone())).unwrap();
            log.append(data_entry(1, b"a"));
            log.append(data_entry(2, b"b"));
            log.metadata.current_term = 2;
            log.metadata.voted_for = 3;
            log.update_metadata();
            log.sync_blocking();
        }

        let log = Log::open(Some(path)).unwrap();
        assert_eq!(log.last_id(), 2);
        assert_eq!(log.get_entry(1).unwrap().data, b"a");
        assert_eq!(log.get_term(2), 2);
        assert_eq!(log.metadata.current_term, 2);
        assert_eq!(log.metadata.voted_for, 3);
    }

    #[test]
    fn test_writes_reach_disk_only_after_sync() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();

        {
            let mut log = Log::open(Some(path.clone())).unwrap();
            log.append(data_entry(1, b"a"));
            // Not synced: nothing is on disk yet.
            let unsynced = Log::open(Some(path.clone())).unwrap();
            assert_eq!(unsynced.last_id(), 0);
            log.sync_blocking();
        }

        let log = Log::open(Some(path)).unwrap();
        assert_eq!(log.last_id(), 1);
    }

    #[test]
    fn test_sync_is_ordered_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();

        {
            let mut log = Log::open(Some(path.clone())).unwrap();
            log.append(data_entry(1, b"a"));
            log.append(data_entry(1, b"b"));
            log.truncate(1);
            log.append(data_entry(2, b"c"));
            log.sync_blocking();
            log.sync_blocking();
        }

        let log = Log::open(Some(path)).unwrap();
        assert_eq!(log.last_id(), 2);
        assert_eq!(log.get_entry(1).unwrap().data, b"a");
        assert_eq!(log.get_entry(2).unwrap().data, b"c");
        assert_eq!(log.get_term(2), 2);
    }

    #[test]
    fn test_truncate_removes_entry_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();

        {
            let mut log = Log::open(Some(path.clone())).unwrap();
            log.append(data_entry(1, b"a"));
            log.append(data_entry(1, b"b"));
            log.sync_blocking();
            log.truncate(1);
            log.sync_blocking();
        }

        let log = Log::open(Some(path)).unwrap();
        assert_eq!(log.last_id(), 1);
        assert_eq!(log.get_entry(1).unwrap().data, b"a");
    }
}
