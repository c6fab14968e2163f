//! The remote-store boundary. Anything that can stream changes for a path and accept writes can
//! sit behind [`RemoteStore`]; [`memory::MemoryRemote`] is the in-process reference.

use futures::stream::LocalBoxStream;

use crate::auth::AuthToken;
use crate::data_model::{Entity, LocalSeq, Mutation, Path, Version};
use crate::error::{RemoteError, TransportError};

pub mod memory;

/// One item of a subscription stream.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    /// Another writer changed `path`.
    ForeignUpdate {
        path: Path,
        value: Entity,
        version: Version,
    },
    /// One of our writes landed at `version`.
    Ack { seq: LocalSeq, version: Version },
    /// One of our writes was refused.
    Reject { seq: LocalSeq, reason: String },
}

impl RemoteEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteEvent::ForeignUpdate { .. } => "foreign_update",
            RemoteEvent::Ack { .. } => "ack",
            RemoteEvent::Reject { .. } => "reject",
        }
    }
}

pub type EventStream = LocalBoxStream<'static, Result<RemoteEvent, TransportError>>;

/// What the remote store promises about a write it may already have seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayPolicy {
    /// Resubmitting a seq the store already applied is harmless; it answers with the original ACK.
    IdempotentBySeq,
    /// Resubmitting may apply the write twice, so ask [`RemoteStore::lookup_write`] first.
    #[default]
    QueryBeforeResubmit,
}

pub trait RemoteStore {
    /// Opens a stream of events for `path` and everything below it. The first items describe the
    /// current remote state. Outcomes of our own writes under `path` arrive on it too.
    fn subscribe(
        &self,
        path: &Path,
        token: &AuthToken,
    ) -> impl Future<Output = Result<EventStream, RemoteError>>;

    /// Fire-and-forget; the outcome arrives on a subscription stream.
    fn submit(
        &self,
        path: &Path,
        mutation: &Mutation,
        seq: LocalSeq,
        token: &AuthToken,
    ) -> impl Future<Output = Result<(), RemoteError>>;

    fn unsubscribe(&self, path: &Path);

    /// Whether write `seq` to `path` already landed, and at which version.
    fn lookup_write(
        &self,
        path: &Path,
        seq: LocalSeq,
        token: &AuthToken,
    ) -> impl Future<Output = Result<Option<Version>, RemoteError>>;

    fn replay_policy(&self) -> ReplayPolicy {
        ReplayPolicy::QueryBeforeResubmit
    }
}
