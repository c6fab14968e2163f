//! An in-process remote store shared by any number of clients.
//!
//! Every path carries its own version counter and the last write wins. The writer of a change hears
//! an ACK (or REJECT) on its subscriptions covering the path, every other client hears a foreign
//! update. Switches on the store simulate the things a real backend does to a client: going
//! offline, expiring tokens, answering slowly, or refusing writes.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::auth::AuthToken;
use crate::data_model::{Entity, LocalSeq, Mutation, Path, Version};
use crate::error::{AuthError, RemoteError, TransportError};
use crate::remote::{EventStream, RemoteEvent, RemoteStore, ReplayPolicy};

type Validator = Box<dyn Fn(&Path, &Mutation) -> Result<(), String>>;

/// One call to `submit`, as the store saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub client: u32,
    pub seq: LocalSeq,
    pub path: Path,
    pub mutation: Mutation,
}

struct Subscriber {
    client: u32,
    path: Path,
    sender: mpsc::UnboundedSender<Result<RemoteEvent, TransportError>>,
}

struct Store {
    online: bool,
    entries: BTreeMap<Path, (Entity, Version)>,
    subscribers: Vec<Subscriber>,
    landed: HashMap<(u32, LocalSeq), (Path, Version)>,
    validator: Option<Validator>,
    policy: ReplayPolicy,
    accepted_token: Option<AuthToken>,
    hold_writes: bool,
    held: VecDeque<Submission>,
    submissions: Vec<Submission>,
    subscribe_calls: Vec<(u32, Path)>,
    unsubscribe_calls: Vec<(u32, Path)>,
    next_client: u32,
}

impl Store {
    fn check(&self, token: &AuthToken) -> Result<(), RemoteError> {
        if !self.online {
            return Err(TransportError::Disconnected("remote store is offline".to_string()).into());
        }
        if let Some(accepted) = &self.accepted_token
            && accepted != token
        {
            return Err(AuthError::Expired.into());
        }
        Ok(())
    }

    fn fan_out(&mut self, path: &Path, writer: Option<u32>, event: impl Fn(bool) -> RemoteEvent) {
        self.subscribers.retain(|subscriber| !subscriber.sender.is_closed());
        for subscriber in &self.subscribers {
            if subscriber.path.contains(path) {
                let own = Some(subscriber.client) == writer;
                let _ = subscriber.sender.send(Ok(event(own)));
            }
        }
    }

    fn to_writer(&mut self, client: u32, path: &Path, event: RemoteEvent) {
        self.subscribers.retain(|subscriber| !subscriber.sender.is_closed());
        for subscriber in &self.subscribers {
            if subscriber.client == client && subscriber.path.contains(path) {
                let _ = subscriber.sender.send(Ok(event.clone()));
            }
        }
    }

    fn apply(&mut self, submission: Submission) {
        let Submission {
            client,
            seq,
            path,
            mutation,
        } = submission;

        if let Some((landed_path, version)) = self.landed.get(&(client, seq)).cloned()
            && self.policy == ReplayPolicy::IdempotentBySeq
        {
            self.to_writer(client, &landed_path, RemoteEvent::Ack { seq, version });
            return;
        }

        if let Some(validator) = &self.validator
            && let Err(reason) = validator(&path, &mutation)
        {
            self.to_writer(client, &path, RemoteEvent::Reject { seq, reason });
            return;
        }

        let (base, previous) = self
            .entries
            .get(&path)
            .cloned()
            .unwrap_or((Entity::null(), Version(0)));
        let value = mutation.apply(&base);
        let version = Version(previous.0 + 1);
        self.entries.insert(path.clone(), (value.clone(), version));
        self.landed.insert((client, seq), (path.clone(), version));

        self.fan_out(&path, Some(client), |own| {
            if own {
                RemoteEvent::Ack { seq, version }
            } else {
                RemoteEvent::ForeignUpdate {
                    path: path.clone(),
                    value: value.clone(),
                    version,
                }
            }
        });
    }
}

/// A client's connection to a shared in-memory store. Clones share both the store and the client
/// identity; [`MemoryRemote::connect_client`] makes a new client.
#[derive(Clone)]
pub struct MemoryRemote {
    store: Rc<RefCell<Store>>,
    client: u32,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            store: Rc::new(RefCell::new(Store {
                online: true,
                entries: BTreeMap::new(),
                subscribers: Vec::new(),
                landed: HashMap::new(),
                validator: None,
                policy: ReplayPolicy::default(),
                accepted_token: None,
                hold_writes: false,
                held: VecDeque::new(),
                submissions: Vec::new(),
                subscribe_calls: Vec::new(),
                unsubscribe_calls: Vec::new(),
                next_client: 1,
            })),
            client: 0,
        }
    }

    pub fn connect_client(&self) -> Self {
        let mut store = self.store.borrow_mut();
        let client = store.next_client;
        store.next_client += 1;
        Self {
            store: Rc::clone(&self.store),
            client,
        }
    }

    pub fn client_id(&self) -> u32 {
        self.client
    }

    /// Sets a value without telling anyone, as if it had been there all along.
    pub fn seed(&self, path: &Path, value: impl Into<Value>, version: Version) {
        self.store
            .borrow_mut()
            .entries
            .insert(path.clone(), (Entity::new(value.into()), version));
    }

    /// A write from outside any client (another device, a server job). Every subscriber hears it.
    pub fn put(&self, path: &Path, value: impl Into<Value>) -> Version {
        let mut store = self.store.borrow_mut();
        let value = Entity::new(value.into());
        let version = store
            .entries
            .get(path)
            .map(|(_, version)| Version(version.0 + 1))
            .unwrap_or(Version(1));
        store.entries.insert(path.clone(), (value.clone(), version));
        store.fan_out(path, None, |_| RemoteEvent::ForeignUpdate {
            path: path.clone(),
            value: value.clone(),
            version,
        });
        version
    }

    pub fn value(&self, path: &Path) -> Option<(Entity, Version)> {
        self.store.borrow().entries.get(path).cloned()
    }

    /// Going offline fails every open stream and every later call until back online.
    pub fn set_online(&self, online: bool) {
        let mut store = self.store.borrow_mut();
        store.online = online;
        if !online {
            for subscriber in store.subscribers.drain(..) {
                let _ = subscriber.sender.send(Err(TransportError::Disconnected(
                    "remote store went offline".to_string(),
                )));
            }
            log::debug!("Memory remote offline");
        }
    }

    pub fn is_online(&self) -> bool {
        self.store.borrow().online
    }

    pub fn set_validator(&self, validator: impl Fn(&Path, &Mutation) -> Result<(), String> + 'static) {
        self.store.borrow_mut().validator = Some(Box::new(validator));
    }

    pub fn set_replay_policy(&self, policy: ReplayPolicy) {
        self.store.borrow_mut().policy = policy;
    }

    /// Only `token` is accepted from now on; anything else is answered with `AuthError::Expired`.
    pub fn require_token(&self, token: Option<AuthToken>) {
        self.store.borrow_mut().accepted_token = token;
    }

    /// While held, submissions are recorded but not applied until [`MemoryRemote::release_writes`].
    pub fn hold_writes(&self, hold: bool) {
        self.store.borrow_mut().hold_writes = hold;
    }

    /// Applies held submissions in arrival order. Returns how many were applied.
    pub fn release_writes(&self) -> usize {
        let mut store = self.store.borrow_mut();
        let held: Vec<Submission> = store.held.drain(..).collect();
        let count = held.len();
        for submission in held {
            store.apply(submission);
        }
        count
    }

    pub fn held_writes(&self) -> usize {
        self.store.borrow().held.len()
    }

    /// Every `submit` call this client made, in order.
    pub fn submissions(&self) -> Vec<Submission> {
        self.store
            .borrow()
            .submissions
            .iter()
            .filter(|submission| submission.client == self.client)
            .cloned()
            .collect()
    }

    pub fn subscribe_calls(&self, path: &Path) -> usize {
        self.count_calls(|store| &store.subscribe_calls, path)
    }

    pub fn unsubscribe_calls(&self, path: &Path) -> usize {
        self.count_calls(|store| &store.unsubscribe_calls, path)
    }

    fn count_calls(&self, calls: impl Fn(&Store) -> &Vec<(u32, Path)>, path: &Path) -> usize {
        let store = self.store.borrow();
        calls(&store)
            .iter()
            .filter(|(client, called)| *client == self.client && called == path)
            .count()
    }

    /// Streams this client currently has open on exactly `path`.
    pub fn open_streams(&self, path: &Path) -> usize {
        self.store
            .borrow()
            .subscribers
            .iter()
            .filter(|subscriber| {
                subscriber.client == self.client
                    && &subscriber.path == path
                    && !subscriber.sender.is_closed()
            })
            .count()
    }
}

impl RemoteStore for MemoryRemote {
    async fn subscribe(&self, path: &Path, token: &AuthToken) -> Result<EventStream, RemoteError> {
        let mut store = self.store.borrow_mut();
        store.check(token)?;
        store.subscribe_calls.push((self.client, path.clone()));

        let (sender, receiver) = mpsc::unbounded_channel();
        let mut initial: Vec<RemoteEvent> = store
            .entries
            .iter()
            .filter(|(existing, _)| path.contains(existing))
            .map(|(existing, (value, version))| RemoteEvent::ForeignUpdate {
                path: existing.clone(),
                value: value.clone(),
                version: *version,
            })
            .collect();
        if !store.entries.contains_key(path) {
            initial.insert(
                0,
                RemoteEvent::ForeignUpdate {
                    path: path.clone(),
                    value: Entity::null(),
                    version: Version(0),
                },
            );
        }
        for event in initial {
            let _ = sender.send(Ok(event));
        }

        store.subscribers.push(Subscriber {
            client: self.client,
            path: path.clone(),
            sender,
        });

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        Ok(stream.boxed_local())
    }

    async fn submit(
        &self,
        path: &Path,
        mutation: &Mutation,
        seq: LocalSeq,
        token: &AuthToken,
    ) -> Result<(), RemoteError> {
        let mut store = self.store.borrow_mut();
        store.check(token)?;
        let submission = Submission {
            client: self.client,
            seq,
            path: path.clone(),
            mutation: mutation.clone(),
        };
        store.submissions.push(submission.clone());
        if store.hold_writes {
            store.held.push_back(submission);
        } else {
            store.apply(submission);
        }
        Ok(())
    }

    fn unsubscribe(&self, path: &Path) {
        let mut store = self.store.borrow_mut();
        store.unsubscribe_calls.push((self.client, path.clone()));
        let client = self.client;
        store
            .subscribers
            .retain(|subscriber| !(subscriber.client == client && &subscriber.path == path));
    }

    async fn lookup_write(
        &self,
        path: &Path,
        seq: LocalSeq,
        token: &AuthToken,
    ) -> Result<Option<Version>, RemoteError> {
        let store = self.store.borrow();
        store.check(token)?;
        Ok(store
            .landed
            .get(&(self.client, seq))
            .filter(|(landed, _)| landed == path)
            .map(|(_, version)| *version))
    }

    fn replay_policy(&self) -> ReplayPolicy {
        self.store.borrow().policy
    }
}
