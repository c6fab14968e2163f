//! This is a library for keeping a local, always-readable copy of a remote hierarchical data store
//! in sync with that store, while letting the app write to it as if it were local.
//!
//! Syncing strategy:
//! 1. The app subscribes to the paths it is showing. The remote store streams the current value of
//!    each path, then every later change, and the latest of those is kept in a local cache.
//! 2. Reads never wait on the network. They are answered from the cache, which can be warmed from a
//!    snapshot saved by the previous session.
//! 3. Writes are appended to a durable journal first, then applied to the cache immediately as a
//!    "dirty overlay" on top of the last value the remote store confirmed, then submitted.
//! 4. When the remote store answers:
//!   1. A change from someone else replaces the confirmed value, and our pending writes are
//!      replayed on top of it, so the overlay always reads as "our intent applied after theirs".
//!   2. An ACK folds our write into the confirmed value. A REJECT drops it and tells the caller.
//!
//! Sounds simple, but there are a few tricky parts that this library handles: stale and duplicate
//! deliveries, ACKs that arrive out of order, writes whose outcome was lost in a disconnect,
//! resubmitting in the original order after reconnecting, and never losing a write that was
//! accepted locally, even across a crash.

pub mod auth;
pub mod backoff;
pub mod blob;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod data_model;
pub mod engine;
pub mod error;
pub mod journal;
pub mod registry;
pub mod remote;
pub mod session;
pub mod snapshot;

pub use auth::{AuthProvider, AuthToken, StaticToken};
pub use blob::{BlobCache, BlobError, BlobStore};
pub use cache::{CacheSnapshot, LocalCache};
pub use config::{ConfigError, SyncConfig};
pub use coordinator::{WriteHandle, WriteStatus};
pub use data_model::{CacheEntry, Entity, LocalSeq, Mutation, Path, PathError, Version};
pub use error::{AuthError, RemoteError, SyncError, TransportError};
pub use registry::{Observer, Scope, SubscriptionHandle};
pub use remote::{RemoteEvent, RemoteStore, ReplayPolicy};
pub use session::{ConnectionState, LocalData, Session, StorageInfo};
