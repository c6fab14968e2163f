//! # PendingWrite
//! Each local write walks an explicit state machine. Transitions are named so the journal can
//! record them and tests can drive them without a transport.
//!
//! ```text
//! Queued --Submit--> Sent --Requeue--> Queued
//! Queued | Sent --Ack--> Acked
//! Queued | Sent --Reject--> Rejected
//! ```

use crate::data_model::{LocalSeq, Mutation, Path};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum WriteState {
    Queued,
    Sent,
    Acked,
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteTransition {
    Submit,
    Requeue,
    Ack,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("write cannot go from {from:?} via {transition:?}")]
pub struct InvalidTransition {
    pub from: WriteState,
    pub transition: WriteTransition,
}

impl WriteState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WriteState::Acked | WriteState::Rejected)
    }

    pub fn next(self, transition: WriteTransition) -> Result<WriteState, InvalidTransition> {
        use WriteState::*;
        use WriteTransition::*;

        match (self, transition) {
            (Queued, Submit) => Ok(Sent),
            (Sent, Requeue) => Ok(Queued),
            (Queued | Sent, Ack) => Ok(Acked),
            (Queued | Sent, Reject) => Ok(Rejected),
            (from, transition) => Err(InvalidTransition { from, transition }),
        }
    }

    pub(crate) fn to_byte(self) -> u8 {
        match self {
            WriteState::Queued => 0,
            WriteState::Sent => 1,
            WriteState::Acked => 2,
            WriteState::Rejected => 3,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(WriteState::Queued),
            1 => Some(WriteState::Sent),
            2 => Some(WriteState::Acked),
            3 => Some(WriteState::Rejected),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PendingWrite {
    pub local_seq: LocalSeq,
    pub path: Path,
    pub mutation: Mutation,
    pub submitted_at: chrono::DateTime<chrono::Utc>,
    pub state: WriteState,
}

impl PendingWrite {
    pub fn new(local_seq: LocalSeq, path: Path, mutation: Mutation) -> Self {
        Self {
            local_seq,
            path,
            mutation,
            submitted_at: chrono::Utc::now(),
            state: WriteState::Queued,
        }
    }

    pub fn transition(&mut self, transition: WriteTransition) -> Result<(), InvalidTransition> {
        self.state = self.state.next(transition)?;
        Ok(())
    }
}
