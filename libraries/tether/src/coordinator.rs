//! # WriteCoordinator
//! Owns the outgoing side of every local write: the outbox of writes waiting to be submitted, the
//! status channel behind each [`WriteHandle`], and the internal pins that keep a subscription open
//! until a write's outcome arrives.
//!
//! A write becomes real the moment [`Journal::append`] returns. Only then is it layered into the
//! cache, so a write that fails to persist never shows up anywhere.

use std::collections::{HashMap, VecDeque};

use tokio::sync::watch;

use crate::cache::LocalCache;
use crate::data_model::{LocalSeq, Mutation, Path, PendingWrite, Version, WriteState, WriteTransition};
use crate::engine::Resolution;
use crate::error::{SyncError, TransportError};
use crate::journal::{Journal, JournalError};
use crate::remote::ReplayPolicy;

#[derive(Debug, Clone, PartialEq)]
pub enum WriteStatus {
    Pending,
    /// No outcome within the write deadline. The write is still journaled and will be retried.
    Stalled,
    /// Submission stopped because of `error`; the write resumes when the connection does.
    Interrupted(SyncError),
    Acked(Version),
    Rejected(SyncError),
}

impl WriteStatus {
    pub fn is_settled(&self) -> bool {
        matches!(self, WriteStatus::Acked(_) | WriteStatus::Rejected(_))
    }
}

/// The caller's view of one write.
#[derive(Debug, Clone)]
pub struct WriteHandle {
    seq: LocalSeq,
    path: Path,
    status: watch::Receiver<WriteStatus>,
}

impl WriteHandle {
    pub fn seq(&self) -> LocalSeq {
        self.seq
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self) -> WriteStatus {
        self.status.borrow().clone()
    }

    /// Resolves once the remote store acknowledged or rejected the write.
    pub async fn settled(&self) -> Result<Version, SyncError> {
        let mut status = self.status.clone();
        let outcome = status
            .wait_for(WriteStatus::is_settled)
            .await
            .map(|status| status.clone());
        match outcome {
            Ok(WriteStatus::Acked(version)) => Ok(version),
            Ok(WriteStatus::Rejected(error)) => Err(error),
            Ok(other) => Err(closed(format!("write ended as {other:?}"))),
            Err(_) => match status.borrow().clone() {
                WriteStatus::Interrupted(error) => Err(error),
                _ => Err(closed("session closed".to_string())),
            },
        }
    }

    /// Resolves with `true` once the write is stalled, or `false` if it settled (or the session
    /// closed) first.
    pub async fn stalled(&self) -> bool {
        let mut status = self.status.clone();
        status
            .wait_for(|status| matches!(status, WriteStatus::Stalled) || status.is_settled())
            .await
            .map(|status| matches!(*status, WriteStatus::Stalled))
            .unwrap_or(false)
    }
}

fn closed(message: String) -> SyncError {
    SyncError::Transport(TransportError::Disconnected(message))
}

/// A write the sender should push next. `verify` asks it to check whether the write already landed
/// before submitting it again.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub write: PendingWrite,
    pub verify: bool,
}

struct Queued {
    seq: LocalSeq,
    verify: bool,
}

pub struct WriteCoordinator {
    policy: ReplayPolicy,
    outbox: VecDeque<Queued>,
    handles: HashMap<LocalSeq, watch::Sender<WriteStatus>>,
    pins: HashMap<LocalSeq, Path>,
}

impl WriteCoordinator {
    pub fn new(policy: ReplayPolicy) -> Self {
        Self {
            policy,
            outbox: VecDeque::new(),
            handles: HashMap::new(),
            pins: HashMap::new(),
        }
    }

    pub fn policy(&self) -> ReplayPolicy {
        self.policy
    }

    /// Journals the write, layers it into the cache and queues it for submission.
    pub fn write(
        &mut self,
        cache: &mut LocalCache,
        journal: &mut Journal,
        path: Path,
        mutation: Mutation,
    ) -> Result<WriteHandle, JournalError> {
        let write = journal
            .append(path, mutation)
            .inspect_err(|e| log::error!("Refusing write, journal append failed: {e}"))?;
        cache.apply_optimistic(&write.path, write.local_seq, write.mutation.clone());
        self.outbox.push_back(Queued {
            seq: write.local_seq,
            verify: false,
        });
        log::debug!("Queued write {} to {}", write.local_seq, write.path);
        Ok(self.track(&write))
    }

    /// Picks up writes left in the journal by a previous run.
    pub fn restore(
        &mut self,
        cache: &mut LocalCache,
        journal: &mut Journal,
    ) -> Result<Vec<WriteHandle>, JournalError> {
        let writes: Vec<PendingWrite> = journal.pending().cloned().collect();
        let handles = writes
            .iter()
            .map(|write| {
                cache.apply_optimistic(&write.path, write.local_seq, write.mutation.clone());
                self.track(write)
            })
            .collect();
        let queued = self.requeue(journal)?;
        if queued > 0 {
            log::info!("Restored {queued} pending writes from the journal");
        }
        Ok(handles)
    }

    /// A new handle on a write that is still tracked.
    pub fn handle_for(&self, write: &PendingWrite) -> Option<WriteHandle> {
        let sender = self.handles.get(&write.local_seq)?;
        Some(WriteHandle {
            seq: write.local_seq,
            path: write.path.clone(),
            status: sender.subscribe(),
        })
    }

    fn track(&mut self, write: &PendingWrite) -> WriteHandle {
        let (sender, receiver) = watch::channel(WriteStatus::Pending);
        self.handles.insert(write.local_seq, sender);
        WriteHandle {
            seq: write.local_seq,
            path: write.path.clone(),
            status: receiver,
        }
    }

    /// Rebuilds the outbox from the journal in seq order. Writes that were sent but never answered
    /// go back to `Queued`, flagged for a landing check unless the remote replays idempotently.
    pub fn requeue(&mut self, journal: &mut Journal) -> Result<usize, JournalError> {
        self.outbox.clear();
        let writes: Vec<(LocalSeq, WriteState)> = journal
            .pending()
            .map(|write| (write.local_seq, write.state))
            .collect();

        for (seq, state) in writes {
            let verify = state == WriteState::Sent;
            if verify {
                journal.transition(seq, WriteTransition::Requeue)?;
            }
            self.outbox.push_back(Queued {
                seq,
                verify: verify && self.policy == ReplayPolicy::QueryBeforeResubmit,
            });
            if let Some(sender) = self.handles.get(&seq) {
                sender.send_if_modified(|status| {
                    if matches!(status, WriteStatus::Interrupted(_)) {
                        *status = WriteStatus::Pending;
                        true
                    } else {
                        false
                    }
                });
            }
        }
        Ok(self.outbox.len())
    }

    /// The next write to submit, without taking it off the outbox. Writes resolved in the meantime
    /// are dropped from the front.
    pub fn peek(&mut self, journal: &Journal) -> Option<Outgoing> {
        while let Some(front) = self.outbox.front() {
            match journal.get(front.seq) {
                Some(write) if write.state == WriteState::Queued => {
                    return Some(Outgoing {
                        write: write.clone(),
                        verify: front.verify,
                    });
                }
                _ => {
                    self.outbox.pop_front();
                }
            }
        }
        None
    }

    pub fn pop(&mut self) {
        self.outbox.pop_front();
    }

    pub fn mark_sent(
        &mut self,
        journal: &mut Journal,
        seq: LocalSeq,
    ) -> Result<PendingWrite, JournalError> {
        journal.transition(seq, WriteTransition::Submit)
    }

    /// Records that the session opened an internal subscription on `path` for write `seq`.
    pub fn pin(&mut self, seq: LocalSeq, path: Path) {
        self.pins.insert(seq, path);
    }

    pub fn is_pinned(&self, seq: LocalSeq) -> bool {
        self.pins.contains_key(&seq)
    }

    /// Settles the handle behind an engine resolution. Returns the pin to release, if the write
    /// held one.
    pub fn resolve(&mut self, resolution: &Resolution) -> Option<Path> {
        let (seq, status) = match resolution {
            Resolution::Acked { write, version } => {
                (write.local_seq, WriteStatus::Acked(*version))
            }
            Resolution::Rejected { write, reason } => (
                write.local_seq,
                WriteStatus::Rejected(SyncError::ConflictRejected {
                    seq: write.local_seq,
                    reason: reason.clone(),
                }),
            ),
            _ => return None,
        };
        if let Some(sender) = self.handles.remove(&seq) {
            sender.send_replace(status);
        }
        self.pins.remove(&seq)
    }

    /// Moves a pending write to `Stalled`. Returns false if it already settled or was interrupted.
    pub fn mark_stalled(&mut self, seq: LocalSeq) -> bool {
        let Some(sender) = self.handles.get(&seq) else {
            return false;
        };
        sender.send_if_modified(|status| {
            if *status == WriteStatus::Pending {
                *status = WriteStatus::Stalled;
                true
            } else {
                false
            }
        })
    }

    pub fn interrupt(&mut self, seq: LocalSeq, error: SyncError) {
        if let Some(sender) = self.handles.get(&seq) {
            sender.send_replace(WriteStatus::Interrupted(error));
        }
    }

    pub fn interrupt_all(&mut self, error: SyncError) {
        for sender in self.handles.values() {
            sender.send_replace(WriteStatus::Interrupted(error.clone()));
        }
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    /// Interrupts every handle and forgets all bookkeeping (sign-out).
    pub fn clear(&mut self, error: SyncError) {
        self.interrupt_all(error);
        self.handles.clear();
        self.outbox.clear();
        self.pins.clear();
    }
}
