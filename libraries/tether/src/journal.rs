//! # Journal
//! Durable log of local writes that the remote store has not resolved yet.
//!
//! The on-disk format is an append-only binary log:
//!
//! ```text
//! header:  b"TETHERJL" | u32 LE format version
//! record:  u32 LE length of (kind + payload) | u8 kind | payload
//!   kind 1 Checkpoint: u64 LE next seq
//!   kind 2 Append:     PendingWrite as JSON
//!   kind 3 Transition: u64 LE seq | u8 state
//! ```
//!
//! Every record is followed by `sync_data`, so a write exists on disk before the cache ever shows
//! it. Resolved writes move to a small in-memory archive; once enough dead records pile up the file
//! is rewritten with only the live writes and a checkpoint that keeps the seq counter from ever
//! going backwards.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path as FsPath, PathBuf};

use crate::data_model::{
    InvalidTransition, LocalSeq, Mutation, Path, PendingWrite, WriteState, WriteTransition,
};

pub const JOURNAL_MAGIC: &[u8] = b"TETHERJL";
pub const JOURNAL_VERSION: u32 = 1;
pub const JOURNAL_HEADER_LEN: usize = JOURNAL_MAGIC.len() + 4;

const KIND_CHECKPOINT: u8 = 1;
const KIND_APPEND: u8 = 2;
const KIND_TRANSITION: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JournalError {
    #[error("journal I/O failed ({kind:?}): {message}")]
    Io { kind: io::ErrorKind, message: String },

    #[error("could not encode journal record: {0}")]
    Codec(String),

    #[error("journal file is not readable: {0}")]
    Corrupt(String),

    #[error("no pending write {0} in journal")]
    UnknownWrite(LocalSeq),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

impl From<io::Error> for JournalError {
    fn from(error: io::Error) -> Self {
        JournalError::Io {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JournalRecord {
    Checkpoint { next_seq: LocalSeq },
    Append(PendingWrite),
    Transition { seq: LocalSeq, state: WriteState },
}

#[derive(Debug)]
struct JournalFile {
    path: PathBuf,
    file: File,
}

#[derive(Debug)]
pub struct Journal {
    file: Option<JournalFile>,
    writes: BTreeMap<LocalSeq, PendingWrite>,
    archive: VecDeque<PendingWrite>,
    archive_len: usize,
    next_seq: u64,
    records: usize,
    compact_after: usize,
}

impl Journal {
    /// A journal that lives only as long as the process.
    pub fn in_memory(archive_len: usize) -> Self {
        Self {
            file: None,
            writes: BTreeMap::new(),
            archive: VecDeque::new(),
            archive_len,
            next_seq: 1,
            records: 0,
            compact_after: usize::MAX,
        }
    }

    /// Opens (or creates) a journal file and replays it.
    pub fn open(
        path: impl AsRef<FsPath>,
        archive_len: usize,
        compact_after: usize,
    ) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut journal = Self::in_memory(archive_len);
        journal.compact_after = compact_after;

        let valid_len = if bytes.is_empty() {
            0
        } else {
            check_header(&bytes)?;
            let (records, valid_len) = parse_journal_records(&bytes);
            for record in records {
                journal.replay(record);
            }
            valid_len
        };

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        if valid_len == 0 {
            file.set_len(0)?;
            file.write_all(&journal_header_bytes())?;
            file.write_all(&encode_journal_record(&JournalRecord::Checkpoint {
                next_seq: LocalSeq(journal.next_seq),
            })?)?;
            file.sync_data()?;
            journal.records = 1;
        } else if valid_len < bytes.len() {
            log::warn!(
                "Dropping {} trailing bytes from journal {} (torn write)",
                bytes.len() - valid_len,
                path.display()
            );
            file.set_len(valid_len as u64)?;
            file.sync_data()?;
        }

        log::info!(
            "Opened journal {} with {} pending writes, next seq {}",
            path.display(),
            journal.writes.len(),
            journal.next_seq
        );

        journal.file = Some(JournalFile { path, file });
        Ok(journal)
    }

    fn replay(&mut self, record: JournalRecord) {
        self.records += 1;
        match record {
            JournalRecord::Checkpoint { next_seq } => {
                self.next_seq = self.next_seq.max(next_seq.0);
            }
            JournalRecord::Append(write) => {
                self.next_seq = self.next_seq.max(write.local_seq.0 + 1);
                if write.state.is_terminal() {
                    self.archive_write(write);
                } else {
                    self.writes.insert(write.local_seq, write);
                }
            }
            JournalRecord::Transition { seq, state } => {
                if state.is_terminal() {
                    if let Some(mut write) = self.writes.remove(&seq) {
                        write.state = state;
                        self.archive_write(write);
                    }
                } else if let Some(write) = self.writes.get_mut(&seq) {
                    write.state = state;
                } else {
                    log::warn!("Journal transition for unknown write {seq}");
                }
            }
        }
    }

    /// Assigns the next seq and durably records the write. Nothing else should observe the write
    /// until this returns `Ok`.
    pub fn append(&mut self, path: Path, mutation: Mutation) -> Result<PendingWrite, JournalError> {
        // a seq is burned even if persisting fails, so it can never be handed out twice
        let seq = LocalSeq(self.next_seq);
        self.next_seq += 1;

        let write = PendingWrite::new(seq, path, mutation);
        self.persist(&JournalRecord::Append(write.clone()))?;
        self.writes.insert(seq, write.clone());
        Ok(write)
    }

    /// Moves a write through its state machine and records the move. Terminal writes leave the
    /// journal for the archive.
    pub fn transition(
        &mut self,
        seq: LocalSeq,
        transition: WriteTransition,
    ) -> Result<PendingWrite, JournalError> {
        let write = self
            .writes
            .get(&seq)
            .ok_or(JournalError::UnknownWrite(seq))?;
        let state = write.state.next(transition)?;

        self.persist(&JournalRecord::Transition { seq, state })?;

        let write = if state.is_terminal() {
            let mut write = self
                .writes
                .remove(&seq)
                .ok_or(JournalError::UnknownWrite(seq))?;
            write.state = state;
            self.archive_write(write.clone());
            write
        } else {
            let write = self
                .writes
                .get_mut(&seq)
                .ok_or(JournalError::UnknownWrite(seq))?;
            write.state = state;
            write.clone()
        };

        self.maybe_compact()?;
        Ok(write)
    }

    pub fn get(&self, seq: LocalSeq) -> Option<&PendingWrite> {
        self.writes.get(&seq)
    }

    /// Unresolved writes in seq order.
    pub fn pending(&self) -> impl Iterator<Item = &PendingWrite> {
        self.writes.values()
    }

    /// The oldest unresolved write for exactly `path`.
    pub fn first_for(&self, path: &Path) -> Option<&PendingWrite> {
        self.writes.values().find(|write| &write.path == path)
    }

    /// Recently resolved writes, oldest first.
    pub fn archive(&self) -> impl Iterator<Item = &PendingWrite> {
        self.archive.iter()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn next_seq(&self) -> LocalSeq {
        LocalSeq(self.next_seq)
    }

    pub fn file_path(&self) -> Option<&FsPath> {
        self.file.as_ref().map(|f| f.path.as_path())
    }

    pub fn size_on_disk(&self) -> u64 {
        self.file
            .as_ref()
            .and_then(|f| f.file.metadata().ok())
            .map(|metadata| metadata.len())
            .unwrap_or(0)
    }

    /// Removes the journal file. Used when a user signs out and discards local data.
    pub fn destroy(self) -> Result<(), JournalError> {
        if let Some(JournalFile { path, file }) = self.file {
            drop(file);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn archive_write(&mut self, write: PendingWrite) {
        if self.archive_len == 0 {
            return;
        }
        while self.archive.len() >= self.archive_len {
            self.archive.pop_front();
        }
        self.archive.push_back(write);
    }

    fn persist(&mut self, record: &JournalRecord) -> Result<(), JournalError> {
        let Some(journal_file) = self.file.as_mut() else {
            return Ok(());
        };
        let bytes = encode_journal_record(record)?;
        journal_file
            .file
            .write_all(&bytes)
            .and_then(|()| journal_file.file.sync_data())
            .inspect_err(|e| {
                log::error!(
                    "Failed to persist journal record to {}: {e:?}",
                    journal_file.path.display()
                )
            })?;
        self.records += 1;
        Ok(())
    }

    fn maybe_compact(&mut self) -> Result<(), JournalError> {
        if self.records.saturating_sub(self.writes.len() + 1) < self.compact_after {
            return Ok(());
        }
        self.compact()
    }

    /// Rewrites the file with a checkpoint and the live writes only.
    pub fn compact(&mut self) -> Result<(), JournalError> {
        let Some(journal_file) = self.file.as_ref() else {
            return Ok(());
        };
        let path = journal_file.path.clone();
        let directory = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or(FsPath::new("."));

        let mut temp = tempfile::NamedTempFile::new_in(directory)?;
        temp.write_all(&journal_header_bytes())?;
        temp.write_all(&encode_journal_record(&JournalRecord::Checkpoint {
            next_seq: LocalSeq(self.next_seq),
        })?)?;
        for write in self.writes.values() {
            temp.write_all(&encode_journal_record(&JournalRecord::Append(write.clone()))?)?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| JournalError::from(e.error))?;

        let file = OpenOptions::new().read(true).append(true).open(&path)?;
        let before = self.records;
        self.records = 1 + self.writes.len();
        self.file = Some(JournalFile { path, file });

        log::info!(
            "Compacted journal from {before} to {} records",
            self.records
        );
        Ok(())
    }
}

pub fn journal_header_bytes() -> Vec<u8> {
    let mut header = Vec::with_capacity(JOURNAL_HEADER_LEN);
    header.extend_from_slice(JOURNAL_MAGIC);
    header.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
    header
}

fn check_header(bytes: &[u8]) -> Result<(), JournalError> {
    if bytes.len() < JOURNAL_HEADER_LEN {
        return Err(JournalError::Corrupt(format!(
            "header too small ({} bytes)",
            bytes.len()
        )));
    }
    if !bytes.starts_with(JOURNAL_MAGIC) {
        return Err(JournalError::Corrupt("magic bytes did not match".into()));
    }
    let version = read_u32(bytes, JOURNAL_MAGIC.len()).unwrap_or_default();
    if version != JOURNAL_VERSION {
        return Err(JournalError::Corrupt(format!(
            "unsupported journal version {version}"
        )));
    }
    Ok(())
}

pub fn encode_journal_record(record: &JournalRecord) -> Result<Vec<u8>, JournalError> {
    let (kind, payload) = match record {
        JournalRecord::Checkpoint { next_seq } => (KIND_CHECKPOINT, next_seq.0.to_le_bytes().to_vec()),
        JournalRecord::Append(write) => (
            KIND_APPEND,
            serde_json::to_vec(write).map_err(|e| JournalError::Codec(e.to_string()))?,
        ),
        JournalRecord::Transition { seq, state } => {
            let mut payload = seq.0.to_le_bytes().to_vec();
            payload.push(state.to_byte());
            (KIND_TRANSITION, payload)
        }
    };

    let body_len: u32 = (1 + payload.len())
        .try_into()
        .map_err(|_| JournalError::Codec(format!("record too large ({} bytes)", payload.len())))?;

    let mut buffer = Vec::with_capacity(std::mem::size_of::<u32>() + 1 + payload.len());
    buffer.extend_from_slice(&body_len.to_le_bytes());
    buffer.push(kind);
    buffer.extend_from_slice(&payload);
    Ok(buffer)
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let slice = bytes.get(offset..offset + std::mem::size_of::<u32>())?;
    Some(u32::from_le_bytes(slice.try_into().ok()?))
}

fn read_u64(bytes: &[u8], offset: usize) -> Option<u64> {
    let slice = bytes.get(offset..offset + std::mem::size_of::<u64>())?;
    Some(u64::from_le_bytes(slice.try_into().ok()?))
}

/// Parses every readable record after the header.
///
/// Malformed records are skipped with a warning. Returns the records along with the length of the
/// prefix that parsed cleanly, so a torn final record can be truncated away.
pub fn parse_journal_records(bytes: &[u8]) -> (Vec<JournalRecord>, usize) {
    if check_header(bytes)
        .inspect_err(|e| log::warn!("{e}"))
        .is_err()
    {
        return (Vec::new(), 0);
    }

    let mut offset = JOURNAL_HEADER_LEN;
    let mut records = Vec::new();

    while let Some(record_len) = read_u32(bytes, offset) {
        let record_len = record_len as usize;
        let body = offset + std::mem::size_of::<u32>();
        let record_end = body + record_len;

        if record_len == 0 || record_end > bytes.len() {
            log::warn!(
                "Journal record length {} exceeds remaining bytes {}",
                record_len,
                bytes.len().saturating_sub(body)
            );
            break;
        }

        let kind = bytes[body];
        let payload = &bytes[body + 1..record_end];
        offset = record_end;

        let record = match kind {
            KIND_CHECKPOINT => read_u64(payload, 0).map(|next_seq| JournalRecord::Checkpoint {
                next_seq: LocalSeq(next_seq),
            }),
            KIND_APPEND => serde_json::from_slice::<PendingWrite>(payload)
                .inspect_err(|e| log::warn!("Failed to deserialize journal write: {e:?}"))
                .ok()
                .map(JournalRecord::Append),
            KIND_TRANSITION => {
                let seq = read_u64(payload, 0);
                let state = payload
                    .get(std::mem::size_of::<u64>())
                    .copied()
                    .and_then(WriteState::from_byte);
                seq.zip(state).map(|(seq, state)| JournalRecord::Transition {
                    seq: LocalSeq(seq),
                    state,
                })
            }
            other => {
                log::warn!("Unknown journal record kind {other}");
                None
            }
        };

        match record {
            Some(record) => records.push(record),
            None => log::warn!("Skipping malformed journal record of kind {kind}"),
        }
    }

    (records, offset)
}
