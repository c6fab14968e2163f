//! # SyncEngine
//! Decides what an incoming remote event means for the cache and the journal.
//!
//! - A foreign update replaces the base if it is newer than what we have, and pending writes are
//!   replayed over it. Anything older is a stale delivery and is dropped.
//! - An ACK retires the write and folds it into the base. Writes to one path are acknowledged in
//!   seq order, so an ACK that overtakes an earlier pending write for the same path waits until
//!   that write resolves.
//! - A REJECT retires the write without applying it.
//!
//! The engine owns no I/O. It reports what happened as [`Resolution`]s and the caller turns those
//! into notifications.

use std::collections::BTreeMap;

use crate::cache::LocalCache;
use crate::data_model::{LocalSeq, Path, PendingWrite, Version, WriteTransition};
use crate::journal::{Journal, JournalError};
use crate::remote::RemoteEvent;

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Foreign {
        path: Path,
        version: Version,
    },
    StaleIgnored {
        path: Path,
        version: Version,
        known: Version,
    },
    Acked {
        write: PendingWrite,
        version: Version,
    },
    Rejected {
        write: PendingWrite,
        reason: String,
    },
    Deferred {
        seq: LocalSeq,
        path: Path,
    },
    /// An outcome for a write that is no longer pending, usually a duplicate delivery.
    Unknown {
        seq: LocalSeq,
    },
}

#[derive(Debug, Default)]
pub struct SyncEngine {
    deferred_acks: BTreeMap<LocalSeq, Version>,
}

impl SyncEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred_acks.len()
    }

    pub fn handle(
        &mut self,
        cache: &mut LocalCache,
        journal: &mut Journal,
        event: RemoteEvent,
    ) -> Result<Vec<Resolution>, JournalError> {
        match event {
            RemoteEvent::ForeignUpdate {
                path,
                value,
                version,
            } => {
                if let Some(known) = cache.version(&path)
                    && known >= version
                {
                    log::debug!("Ignoring stale update for {path}: {version} <= {known}");
                    return Ok(vec![Resolution::StaleIgnored {
                        path,
                        version,
                        known,
                    }]);
                }
                cache.apply_remote(&path, value, version);
                Ok(vec![Resolution::Foreign { path, version }])
            }
            RemoteEvent::Ack { seq, version } => {
                let Some(write) = journal.get(seq) else {
                    log::debug!("Ignoring ack {seq} at {version}: write is not pending");
                    return Ok(vec![Resolution::Unknown { seq }]);
                };
                let path = write.path.clone();

                let first = journal.first_for(&path).map(|write| write.local_seq);
                if first != Some(seq) {
                    if self.deferred_acks.insert(seq, version).is_none() {
                        log::warn!("Ack {seq} for {path} arrived before earlier writes; deferring");
                    }
                    return Ok(vec![Resolution::Deferred { seq, path }]);
                }

                let mut resolutions = vec![self.acknowledge(cache, journal, seq, version)?];
                resolutions.extend(self.release_deferred(cache, journal, &path)?);
                Ok(resolutions)
            }
            RemoteEvent::Reject { seq, reason } => {
                if journal.get(seq).is_none() {
                    log::debug!("Ignoring reject {seq}: write is not pending");
                    return Ok(vec![Resolution::Unknown { seq }]);
                }
                self.deferred_acks.remove(&seq);

                let write = journal.transition(seq, WriteTransition::Reject)?;
                cache.discard(&write.path, seq);
                log::info!("Write {seq} to {} rejected: {reason}", write.path);

                let path = write.path.clone();
                let mut resolutions = vec![Resolution::Rejected { write, reason }];
                resolutions.extend(self.release_deferred(cache, journal, &path)?);
                Ok(resolutions)
            }
        }
    }

    fn acknowledge(
        &mut self,
        cache: &mut LocalCache,
        journal: &mut Journal,
        seq: LocalSeq,
        version: Version,
    ) -> Result<Resolution, JournalError> {
        let write = journal.transition(seq, WriteTransition::Ack)?;
        cache.acknowledge(&write.path, seq, version);
        log::debug!("Write {seq} to {} acknowledged at {version}", write.path);
        Ok(Resolution::Acked { write, version })
    }

    /// Applies buffered ACKs that are now at the head of `path`'s pending writes.
    fn release_deferred(
        &mut self,
        cache: &mut LocalCache,
        journal: &mut Journal,
        path: &Path,
    ) -> Result<Vec<Resolution>, JournalError> {
        let mut resolutions = Vec::new();
        while let Some(next) = journal.first_for(path).map(|write| write.local_seq) {
            let Some(version) = self.deferred_acks.remove(&next) else {
                break;
            };
            resolutions.push(self.acknowledge(cache, journal, next, version)?);
        }
        Ok(resolutions)
    }
}
