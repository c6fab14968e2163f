//! # Session
//! Ties the pieces together for one signed-in user and one connection to the remote store.
//!
//! All state lives in a single [`RefCell`] owned by the session. Work happens on a tokio
//! [`LocalSet`](tokio::task::LocalSet) in small tasks that each borrow the state briefly:
//!
//! - one pump per open subscription, feeding remote events to the [`SyncEngine`],
//! - one sender that submits queued writes in seq order,
//! - a reconnect loop while the connection is down,
//! - a watchdog per in-flight write that flags it as stalled after the deadline.
//!
//! No borrow is ever held across an `.await`. Observer callbacks run after the borrow is released,
//! so an observer may call straight back into the session.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use futures::StreamExt;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, spawn_local};

use crate::auth::{AuthProvider, Authenticator};
use crate::backoff::Backoff;
use crate::blob::{BlobCache, BlobStore};
use crate::cache::{CacheSnapshot, LocalCache};
use crate::config::SyncConfig;
use crate::coordinator::{Outgoing, WriteCoordinator, WriteHandle};
use crate::data_model::{CacheEntry, LocalSeq, Mutation, Path};
use crate::engine::{Resolution, SyncEngine};
use crate::error::{RemoteError, SyncError, TransportError};
use crate::journal::Journal;
use crate::registry::{Attach, ListenerRegistry, Observer, Released, Scope, SubscriptionHandle};
use crate::remote::{EventStream, RemoteEvent, RemoteStore};
use crate::snapshot::{SnapshotError, load_snapshot, save_snapshot};

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Connected,
    /// Waiting out backoff before reconnect attempt `attempt` (counting from one).
    Reconnecting { attempt: u32 },
    /// Gave up. Nothing is sent until [`Session::reconnect`] is called.
    Offline { reason: SyncError },
}

/// What to do with on-disk state when signing out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalData {
    /// Save a snapshot and keep the journal, so the next session starts warm.
    Keep,
    /// Delete the snapshot and the journal.
    Discard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageInfo {
    pub entries: usize,
    pub dirty_entries: usize,
    pub pending_writes: usize,
    /// Writes waiting for their turn to be submitted.
    pub queued_writes: usize,
    pub archived_writes: usize,
    pub subscriptions: usize,
    pub journal_bytes: u64,
    /// The seq the next write will be given.
    pub next_seq: LocalSeq,
}

pub struct Session<R: RemoteStore + 'static, A: AuthProvider + 'static> {
    inner: Rc<Inner<R, A>>,
}

struct Inner<R, A> {
    remote: R,
    auth: Authenticator<A>,
    config: SyncConfig,
    wake: Notify,
    /// Set while the outermost `flush` is delivering; nested calls leave the work to it.
    flushing: Cell<bool>,
    state: RefCell<State>,
}

struct State {
    cache: LocalCache,
    journal: Journal,
    registry: ListenerRegistry<JoinHandle<()>>,
    engine: SyncEngine,
    coordinator: WriteCoordinator,
    connection: ConnectionState,
    backoff: Backoff,
    sender: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    watchdogs: HashMap<LocalSeq, JoinHandle<()>>,
}

impl<R: RemoteStore + 'static, A: AuthProvider + 'static> Session<R, A> {
    /// Loads the snapshot and journal named in `config` and starts syncing. Must be called from
    /// within a [`LocalSet`](tokio::task::LocalSet).
    pub fn open(config: SyncConfig, remote: R, auth: A) -> Result<Self, SyncError> {
        let mut journal = match &config.journal_path {
            Some(path) => Journal::open(path, config.archive_len, config.compact_after)?,
            None => Journal::in_memory(config.archive_len),
        };

        let mut cache = LocalCache::new(config.max_cache_entries);
        if let Some(path) = &config.snapshot_path {
            cache.restore(load_snapshot(path)?);
        }

        let mut coordinator = WriteCoordinator::new(remote.replay_policy());
        let restored = coordinator.restore(&mut cache, &mut journal)?;
        cache.drain_changes();

        let backoff = Backoff::new(config.backoff_base(), config.backoff_max());
        let inner = Rc::new(Inner {
            remote,
            auth: Authenticator::new(auth),
            config,
            wake: Notify::new(),
            flushing: Cell::new(false),
            state: RefCell::new(State {
                cache,
                journal,
                registry: ListenerRegistry::new(),
                engine: SyncEngine::new(),
                coordinator,
                connection: ConnectionState::Connected,
                backoff,
                sender: None,
                reconnect: None,
                watchdogs: HashMap::new(),
            }),
        });

        {
            let mut state = inner.state.borrow_mut();
            for handle in &restored {
                inner.pin_write(&mut state, handle.seq(), handle.path());
                inner.start_watchdog(&mut state, handle.seq());
            }
            state.sender = Some(spawn_local(send_loop(Rc::clone(&inner))));
            log::info!(
                "Session open: {} cached entries, {} pending writes",
                state.cache.len(),
                state.journal.len()
            );
        }

        Ok(Self { inner })
    }

    /// Registers `observer` on `path`. Whatever the cache already knows is delivered right away.
    pub fn subscribe(
        &self,
        path: &Path,
        scope: Scope,
        observer: Rc<dyn Observer>,
    ) -> SubscriptionHandle {
        let inner = &self.inner;
        let mut state = inner.state.borrow_mut();
        let current = match scope {
            Scope::Exact => state.cache.read(path).into_iter().collect(),
            Scope::Subtree => state.cache.descendants(path),
        };
        let (handle, attach) = state
            .registry
            .subscribe(path.clone(), scope, observer, current);
        state.cache.retain(path);
        if attach == Attach::Opened {
            inner.open_remote(&mut state, path);
        }
        drop(state);
        inner.flush();
        handle
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        let inner = &self.inner;
        let mut state = inner.state.borrow_mut();
        if let Some(released) = state.registry.unsubscribe(handle) {
            inner.release(&mut state, released);
        }
    }

    /// Applies `mutation` locally right away and submits it in the background.
    ///
    /// Fails only if the write could not be journaled, in which case nothing was applied.
    pub fn write(&self, path: &Path, mutation: Mutation) -> Result<WriteHandle, SyncError> {
        let inner = &self.inner;
        let mut state = inner.state.borrow_mut();
        let State {
            cache,
            journal,
            coordinator,
            connection,
            ..
        } = &mut *state;
        let handle = coordinator.write(cache, journal, path.clone(), mutation)?;
        if let ConnectionState::Offline { reason } = connection {
            coordinator.interrupt(handle.seq(), reason.clone());
        }

        inner.pin_write(&mut state, handle.seq(), path);
        inner.start_watchdog(&mut state, handle.seq());
        inner.publish_changes(&mut state);
        drop(state);

        inner.wake.notify_one();
        inner.flush();
        Ok(handle)
    }

    pub fn read(&self, path: &Path) -> Option<CacheEntry> {
        self.inner.state.borrow().cache.read(path)
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        self.inner.state.borrow().cache.snapshot()
    }

    /// Every cached entry at or below `path`.
    pub fn children(&self, path: &Path) -> Vec<CacheEntry> {
        self.inner.state.borrow().cache.descendants(path)
    }

    /// Handles for every write still waiting on the remote store, including ones restored from the
    /// journal at startup.
    pub fn pending_writes(&self) -> Vec<WriteHandle> {
        let state = self.inner.state.borrow();
        state
            .journal
            .pending()
            .filter_map(|write| state.coordinator.handle_for(write))
            .collect()
    }

    pub fn storage_info(&self) -> StorageInfo {
        let state = self.inner.state.borrow();
        StorageInfo {
            entries: state.cache.len(),
            dirty_entries: state.cache.dirty_len(),
            pending_writes: state.journal.len(),
            queued_writes: state.coordinator.outbox_len(),
            archived_writes: state.journal.archive().count(),
            subscriptions: state.registry.len(),
            journal_bytes: state.journal.size_on_disk(),
            next_seq: state.journal.next_seq(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.borrow().connection.clone()
    }

    /// Starts over after the session gave up reconnecting (or after an auth failure). While
    /// connected, reopens any subscription whose stream could not be opened.
    pub fn reconnect(&self) {
        let inner = &self.inner;
        let mut state = inner.state.borrow_mut();
        let connection = state.connection.clone();
        match connection {
            ConnectionState::Offline { .. } => {
                log::info!("Reconnect requested");
                inner.auth.forget();
                state.connection = ConnectionState::Reconnecting { attempt: 0 };
                state.reconnect = Some(spawn_local(reconnect_loop(Rc::clone(inner))));
            }
            ConnectionState::Connected => {
                for path in state.registry.paths() {
                    if !state.registry.has_remote(&path) {
                        inner.open_remote(&mut state, &path);
                    }
                }
            }
            ConnectionState::Reconnecting { .. } => {}
        }
    }

    /// Uploads `bytes` and writes the resulting URL into `field` of the entity at `path`.
    pub async fn attach_blob<B: BlobStore + 'static>(
        &self,
        blobs: &BlobCache<B>,
        path: &Path,
        field: &str,
        bytes: Vec<u8>,
    ) -> Result<WriteHandle, SyncError> {
        let url = blobs.put(bytes).await?;
        self.write(path, Mutation::patch([(field, url)]))
    }

    /// Closes every subscription, stops all background work and either persists or wipes local
    /// state. Unsettled write handles resolve with an error.
    pub fn sign_out(self, local: LocalData) -> Result<(), SyncError> {
        let inner = &self.inner;
        let mut state = inner.state.borrow_mut();
        inner.shutdown(&mut state);
        state
            .coordinator
            .clear(SyncError::Transport(TransportError::Disconnected(
                "signed out".to_string(),
            )));
        inner.auth.forget();

        match local {
            LocalData::Keep => {
                if let Some(path) = &inner.config.snapshot_path {
                    save_snapshot(path, state.cache.authoritative())?;
                }
            }
            LocalData::Discard => {
                if let Some(path) = &inner.config.snapshot_path {
                    match std::fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(SnapshotError::from(e).into()),
                    }
                }
                let journal = std::mem::replace(
                    &mut state.journal,
                    Journal::in_memory(inner.config.archive_len),
                );
                journal.destroy()?;
                state.cache.clear();
            }
        }
        log::info!("Signed out ({local:?})");
        Ok(())
    }
}

impl<R: RemoteStore + 'static, A: AuthProvider + 'static> Drop for Session<R, A> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.state.try_borrow_mut() {
            self.inner.shutdown(&mut state);
        }
    }
}

impl<R: RemoteStore + 'static, A: AuthProvider + 'static> Inner<R, A> {
    /// Delivers queued notifications in order. An observer that calls back into the session only
    /// queues more; the outermost call delivers them after whatever was already waiting.
    fn flush(&self) {
        if self.flushing.replace(true) {
            return;
        }
        let _reset = FlushGuard(&self.flushing);
        loop {
            let next = self.state.borrow_mut().registry.next_due_notification();
            let Some(callback) = next else {
                break;
            };
            callback();
        }
    }

    fn publish_changes(&self, state: &mut State) {
        for entry in state.cache.drain_changes() {
            state.registry.notify(entry);
        }
    }

    async fn open_stream(&self, path: &Path) -> Result<EventStream, RemoteError> {
        let remote = &self.remote;
        self.auth
            .call(|token| async move { remote.subscribe(path, &token).await })
            .await
    }

    /// Starts a pump for `path`. While disconnected this is left to the reconnect loop.
    fn open_remote(self: &Rc<Self>, state: &mut State, path: &Path) {
        if state.connection != ConnectionState::Connected {
            return;
        }
        let task = spawn_local(pump(Rc::clone(self), path.clone(), None));
        if let Some(orphan) = state.registry.set_remote(path, task) {
            orphan.abort();
        }
    }

    /// Makes sure some subscription will carry the outcome of write `seq`.
    fn pin_write(self: &Rc<Self>, state: &mut State, seq: LocalSeq, path: &Path) {
        if state.registry.covers(path) {
            return;
        }
        if state.registry.pin(path) == Attach::Opened {
            self.open_remote(state, path);
        }
        state.coordinator.pin(seq, path.clone());
    }

    fn release(self: &Rc<Self>, state: &mut State, released: Released<JoinHandle<()>>) {
        if let Some(task) = released.remote {
            task.abort();
            self.remote.unsubscribe(&released.path);
            log::debug!("Closed subscription on {}", released.path);
        }
        state.cache.evict(&released.path);

        let orphans: Vec<(LocalSeq, Path)> = state
            .journal
            .pending()
            .filter(|write| {
                released.path.contains(&write.path)
                    && !state.coordinator.is_pinned(write.local_seq)
                    && !state.registry.covers(&write.path)
            })
            .map(|write| (write.local_seq, write.path.clone()))
            .collect();
        for (seq, path) in orphans {
            self.pin_write(state, seq, &path);
        }
    }

    fn start_watchdog(self: &Rc<Self>, state: &mut State, seq: LocalSeq) {
        let timeout = self.config.write_timeout();
        let inner = Rc::clone(self);
        let task = spawn_local(async move {
            tokio::time::sleep(timeout).await;
            let mut state = inner.state.borrow_mut();
            state.watchdogs.remove(&seq);
            if state.coordinator.mark_stalled(seq) {
                log::warn!("Write {seq} has no outcome after {timeout:?}");
            }
        });
        state.watchdogs.insert(seq, task);
    }

    fn handle_event(self: &Rc<Self>, event: RemoteEvent) {
        log::trace!("Remote event: {}", event.kind());
        let mut state = self.state.borrow_mut();
        let affected = match &event {
            RemoteEvent::ForeignUpdate { path, .. } => Some(path.clone()),
            RemoteEvent::Ack { seq, .. } | RemoteEvent::Reject { seq, .. } => {
                state.journal.get(*seq).map(|write| write.path.clone())
            }
        };

        let State {
            cache,
            journal,
            engine,
            ..
        } = &mut *state;
        match engine.handle(cache, journal, event) {
            Ok(resolutions) => {
                for resolution in &resolutions {
                    self.settle(&mut state, resolution);
                }
            }
            Err(error) => {
                log::error!("Could not apply remote event: {error}");
                if let Some(path) = affected {
                    state
                        .registry
                        .notify_error(&path, SyncError::Journal(error));
                }
            }
        }

        self.publish_changes(&mut state);
        drop(state);
        self.flush();
    }

    fn settle(self: &Rc<Self>, state: &mut State, resolution: &Resolution) {
        let seq = match resolution {
            Resolution::Acked { write, .. } | Resolution::Rejected { write, .. } => {
                write.local_seq
            }
            _ => return,
        };
        if let Some(watchdog) = state.watchdogs.remove(&seq) {
            watchdog.abort();
        }
        if let Some(pinned) = state.coordinator.resolve(resolution)
            && let Some(released) = state.registry.unpin(&pinned)
        {
            self.release(state, released);
        }
    }

    fn subscription_failed(self: &Rc<Self>, path: &Path, error: RemoteError) {
        match error {
            RemoteError::Transport(error) => self.connection_lost(error),
            RemoteError::Auth(error) => {
                log::warn!("Could not subscribe to {path}: {error}");
                let mut state = self.state.borrow_mut();
                // this is the pump that just failed, so there is nothing to abort
                state.registry.take_remote(path);
                state.registry.notify_error(path, SyncError::Auth(error));
                drop(state);
                self.flush();
            }
        }
    }

    fn connection_lost(self: &Rc<Self>, error: TransportError) {
        let mut state = self.state.borrow_mut();
        if state.connection != ConnectionState::Connected {
            return;
        }
        log::warn!("Lost connection to the remote store: {error}");
        drop_streams(&mut state);
        state.connection = ConnectionState::Reconnecting { attempt: 0 };
        state.reconnect = Some(spawn_local(reconnect_loop(Rc::clone(self))));
    }

    /// Reopens every subscription. Nothing is committed unless all of them succeed.
    async fn resume(self: &Rc<Self>) -> Result<(), RemoteError> {
        let paths = self.state.borrow().registry.paths();
        let mut streams: Vec<(Path, EventStream)> = Vec::with_capacity(paths.len());
        for path in paths {
            match self.open_stream(&path).await {
                Ok(stream) => streams.push((path, stream)),
                Err(error) => {
                    for (opened, _) in &streams {
                        self.remote.unsubscribe(opened);
                    }
                    return Err(error);
                }
            }
        }

        let mut state = self.state.borrow_mut();
        if !matches!(state.connection, ConnectionState::Reconnecting { .. }) {
            for (path, _) in &streams {
                self.remote.unsubscribe(path);
            }
            return Ok(());
        }
        state.connection = ConnectionState::Connected;

        for (path, stream) in streams {
            if !state.registry.is_subscribed(&path) {
                self.remote.unsubscribe(&path);
                continue;
            }
            let task = spawn_local(pump(Rc::clone(self), path.clone(), Some(stream)));
            if let Some(orphan) = state.registry.set_remote(&path, task) {
                orphan.abort();
            }
        }
        // subscriptions made while we were reconnecting
        for path in state.registry.paths() {
            if !state.registry.has_remote(&path) {
                self.open_remote(&mut state, &path);
            }
        }

        let State {
            coordinator,
            journal,
            ..
        } = &mut *state;
        match coordinator.requeue(journal) {
            Ok(queued) => log::info!("Reconnected, {queued} writes queued for resubmission"),
            Err(error) => {
                log::error!("Could not requeue writes after reconnect: {error}");
                coordinator.interrupt_all(SyncError::Journal(error));
            }
        }
        drop(state);
        self.wake.notify_one();
        Ok(())
    }

    fn go_offline(self: &Rc<Self>, reason: SyncError) {
        let mut state = self.state.borrow_mut();
        log::warn!("Sync is offline: {reason}");
        drop_streams(&mut state);
        if let Some(task) = state.reconnect.take() {
            task.abort();
        }
        state.connection = ConnectionState::Offline {
            reason: reason.clone(),
        };
        state.coordinator.interrupt_all(reason.clone());
        for path in state.registry.paths() {
            state.registry.notify_error(&path, reason.clone());
        }
        drop(state);
        self.flush();
    }

    fn next_outgoing(&self) -> Option<Outgoing> {
        let mut state = self.state.borrow_mut();
        if state.connection != ConnectionState::Connected {
            return None;
        }
        let State {
            coordinator,
            journal,
            registry,
            ..
        } = &mut *state;
        let outgoing = coordinator.peek(journal)?;
        if !registry.is_ready(&outgoing.write.path) {
            return None;
        }
        coordinator.pop();
        Some(outgoing)
    }

    async fn send(self: &Rc<Self>, outgoing: Outgoing) {
        let Outgoing { write, verify } = outgoing;
        let seq = write.local_seq;
        let remote = &self.remote;
        let (path, mutation) = (&write.path, &write.mutation);

        if verify {
            let landed = self
                .auth
                .call(|token| async move { remote.lookup_write(path, seq, &token).await })
                .await;
            match landed {
                Ok(Some(version)) => {
                    log::info!("Write {seq} had already landed at {version}");
                    self.handle_event(RemoteEvent::Ack { seq, version });
                    return;
                }
                Ok(None) => {}
                Err(error) => {
                    self.send_failed(seq, error);
                    return;
                }
            }
        }

        {
            let mut state = self.state.borrow_mut();
            let State {
                coordinator,
                journal,
                ..
            } = &mut *state;
            if journal.get(seq).is_none() {
                return;
            }
            if let Err(error) = coordinator.mark_sent(journal, seq) {
                log::error!("Could not record submission of write {seq}: {error}");
                coordinator.interrupt(seq, SyncError::Journal(error));
                return;
            }
        }

        let submitted = self
            .auth
            .call(|token| async move { remote.submit(path, mutation, seq, &token).await })
            .await;
        match submitted {
            Ok(()) => log::debug!("Submitted write {seq} to {path}"),
            Err(error) => self.send_failed(seq, error),
        }
    }

    fn send_failed(self: &Rc<Self>, seq: LocalSeq, error: RemoteError) {
        match error {
            RemoteError::Transport(error) => self.connection_lost(error),
            RemoteError::Auth(error) => {
                log::warn!("Write {seq} was refused by auth: {error}");
                self.go_offline(SyncError::Auth(error));
            }
        }
    }

    /// Stops every background task and drops every subscription.
    fn shutdown(&self, state: &mut State) {
        if let Some(task) = state.sender.take() {
            task.abort();
        }
        if let Some(task) = state.reconnect.take() {
            task.abort();
        }
        for (_, task) in state.watchdogs.drain() {
            task.abort();
        }
        for released in state.registry.clear() {
            if let Some(task) = released.remote {
                task.abort();
                self.remote.unsubscribe(&released.path);
            }
        }
    }
}

/// Clears the flushing flag even if an observer panics.
struct FlushGuard<'a>(&'a Cell<bool>);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Aborts every pump without telling the remote store; the connection is already gone.
fn drop_streams(state: &mut State) {
    for path in state.registry.paths() {
        if let Some(task) = state.registry.take_remote(&path) {
            task.abort();
        }
    }
}

async fn pump<R: RemoteStore + 'static, A: AuthProvider + 'static>(
    inner: Rc<Inner<R, A>>,
    path: Path,
    stream: Option<EventStream>,
) {
    let mut stream = match stream {
        Some(stream) => stream,
        None => match inner.open_stream(&path).await {
            Ok(stream) => stream,
            Err(error) => {
                inner.subscription_failed(&path, error);
                return;
            }
        },
    };
    inner.state.borrow_mut().registry.mark_ready(&path);
    inner.wake.notify_one();
    log::debug!("Subscribed to {path}");

    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => inner.handle_event(event),
            Err(error) => {
                inner.connection_lost(error);
                return;
            }
        }
    }
    inner.connection_lost(TransportError::Disconnected(format!(
        "stream for {path} ended"
    )));
}

async fn send_loop<R: RemoteStore + 'static, A: AuthProvider + 'static>(inner: Rc<Inner<R, A>>) {
    loop {
        match inner.next_outgoing() {
            Some(outgoing) => inner.send(outgoing).await,
            None => inner.wake.notified().await,
        }
    }
}

async fn reconnect_loop<R: RemoteStore + 'static, A: AuthProvider + 'static>(
    inner: Rc<Inner<R, A>>,
) {
    let attempts = inner.config.max_reconnect_attempts;
    for attempt in 0..attempts {
        let delay = {
            let mut state = inner.state.borrow_mut();
            state.connection = ConnectionState::Reconnecting {
                attempt: attempt + 1,
            };
            state.backoff.delay(attempt)
        };
        log::info!(
            "Reconnecting in {delay:?} (attempt {} of {attempts})",
            attempt + 1
        );
        tokio::time::sleep(delay).await;

        match inner.resume().await {
            Ok(()) => return,
            Err(RemoteError::Auth(error)) => {
                inner.go_offline(SyncError::Auth(error));
                return;
            }
            Err(RemoteError::Transport(error)) => {
                log::info!("Reconnect attempt {} failed: {error}", attempt + 1);
            }
        }
    }
    inner.go_offline(SyncError::Transport(TransportError::RetriesExhausted {
        attempts,
    }));
}
