//! # ListenerRegistry
//! Tracks who is interested in which path and fans changes out to them.
//!
//! There is at most one [`Subscription`] per path no matter how many observers attach to it; the
//! remote handle behind it is opened when the first interest arrives and handed back for closing
//! when the last one leaves. Interest is either an observer or an internal write pin (a write
//! whose outcome needs a stream to arrive on).
//!
//! Deliveries are queued rather than invoked directly. The session pops them one at a time with
//! [`ListenerRegistry::next_due_notification`] and runs each after releasing its state borrow,
//! because observers routinely call back into the session. Popping one at a time keeps every
//! observer's deliveries in queue order and lets `unsubscribe` cancel whatever is still queued.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;

use slotmap::SlotMap;

use crate::data_model::{CacheEntry, Path};
use crate::error::SyncError;

slotmap::new_key_type! {
    pub struct ObserverKey;
}

pub trait Observer {
    fn on_change(&self, path: &Path, entry: &CacheEntry);
    fn on_error(&self, path: &Path, error: &SyncError);
}

/// Whether an observer also hears about descendants of the path it subscribed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Scope {
    #[default]
    Exact,
    Subtree,
}

struct ObserverSlot {
    path: Path,
    scope: Scope,
    observer: Rc<dyn Observer>,
}

struct Subscription<H> {
    observers: BTreeSet<ObserverKey>,
    pins: usize,
    remote: Option<H>,
    /// The remote stream is established, so outcomes of writes under this path will arrive.
    ready: bool,
}

impl<H> Subscription<H> {
    fn new() -> Self {
        Self {
            observers: BTreeSet::new(),
            pins: 0,
            remote: None,
            ready: false,
        }
    }

    fn is_unused(&self) -> bool {
        self.observers.is_empty() && self.pins == 0
    }
}

/// Proof of one observer's registration. Consumed by `unsubscribe`, so it can only be released
/// once.
#[derive(Debug, PartialEq, Eq)]
pub struct SubscriptionHandle {
    key: ObserverKey,
    path: Path,
}

impl SubscriptionHandle {
    pub fn key(&self) -> ObserverKey {
        self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attach {
    /// First interest in this path; the caller must open the remote side.
    Opened,
    /// The path was already subscribed.
    Joined,
}

/// A subscription whose last interest went away. The caller closes `remote` (if it was ever
/// opened) and lets the cache release the path.
#[derive(Debug)]
pub struct Released<H> {
    pub path: Path,
    pub remote: Option<H>,
}

enum Delivery {
    Change {
        key: ObserverKey,
        entry: CacheEntry,
    },
    Error {
        key: ObserverKey,
        path: Path,
        error: SyncError,
    },
}

impl Delivery {
    fn key(&self) -> ObserverKey {
        match self {
            Delivery::Change { key, .. } | Delivery::Error { key, .. } => *key,
        }
    }
}

pub struct ListenerRegistry<H> {
    observers: SlotMap<ObserverKey, ObserverSlot>,
    subscriptions: BTreeMap<Path, Subscription<H>>,
    queue: VecDeque<Delivery>,
}

impl<H> Default for ListenerRegistry<H> {
    fn default() -> Self {
        Self {
            observers: SlotMap::with_key(),
            subscriptions: BTreeMap::new(),
            queue: VecDeque::new(),
        }
    }
}

impl<H> ListenerRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `observer` on `path`. `current` is whatever the cache holds right now; it is
    /// queued for the new observer immediately, without waiting on the remote store.
    pub fn subscribe(
        &mut self,
        path: Path,
        scope: Scope,
        observer: Rc<dyn Observer>,
        current: impl IntoIterator<Item = CacheEntry>,
    ) -> (SubscriptionHandle, Attach) {
        let key = self.observers.insert(ObserverSlot {
            path: path.clone(),
            scope,
            observer,
        });

        let attach = if self.subscriptions.contains_key(&path) {
            Attach::Joined
        } else {
            Attach::Opened
        };
        self.subscriptions
            .entry(path.clone())
            .or_insert_with(Subscription::new)
            .observers
            .insert(key);

        for entry in current {
            self.queue.push_back(Delivery::Change { key, entry });
        }

        (SubscriptionHandle { key, path }, attach)
    }

    /// Detaches one observer and cancels anything still queued for it. Returns the subscription if
    /// this was the last interest in the path. Unknown handles are ignored.
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) -> Option<Released<H>> {
        let slot = self.observers.remove(handle.key)?;
        self.queue.retain(|delivery| delivery.key() != handle.key);

        let subscription = self.subscriptions.get_mut(&slot.path)?;
        subscription.observers.remove(&handle.key);
        self.release_if_unused(&slot.path)
    }

    /// Holds a subscription open on behalf of an in-flight write.
    pub fn pin(&mut self, path: &Path) -> Attach {
        let attach = if self.subscriptions.contains_key(path) {
            Attach::Joined
        } else {
            Attach::Opened
        };
        self.subscriptions
            .entry(path.clone())
            .or_insert_with(Subscription::new)
            .pins += 1;
        attach
    }

    pub fn unpin(&mut self, path: &Path) -> Option<Released<H>> {
        let subscription = self.subscriptions.get_mut(path)?;
        subscription.pins = subscription.pins.saturating_sub(1);
        self.release_if_unused(path)
    }

    fn release_if_unused(&mut self, path: &Path) -> Option<Released<H>> {
        if !self.subscriptions.get(path)?.is_unused() {
            return None;
        }
        let subscription = self.subscriptions.remove(path)?;
        Some(Released {
            path: path.clone(),
            remote: subscription.remote,
        })
    }

    /// Stores the remote handle for an open subscription. If the subscription vanished while the
    /// remote side was being opened, the handle is given back so the caller can close it.
    pub fn set_remote(&mut self, path: &Path, remote: H) -> Option<H> {
        match self.subscriptions.get_mut(path) {
            Some(subscription) => {
                subscription.remote = Some(remote);
                None
            }
            None => Some(remote),
        }
    }

    /// Detaches the remote handle (the connection dropped). The subscription itself stays.
    pub fn take_remote(&mut self, path: &Path) -> Option<H> {
        let subscription = self.subscriptions.get_mut(path)?;
        subscription.ready = false;
        subscription.remote.take()
    }

    pub fn has_remote(&self, path: &Path) -> bool {
        self.subscriptions
            .get(path)
            .is_some_and(|subscription| subscription.remote.is_some())
    }

    pub fn mark_ready(&mut self, path: &Path) {
        if let Some(subscription) = self.subscriptions.get_mut(path) {
            subscription.ready = true;
        }
    }

    /// True if an established remote stream at `path` or above will carry its events.
    pub fn is_ready(&self, path: &Path) -> bool {
        path.ancestors().any(|ancestor| {
            self.subscriptions
                .get(&ancestor)
                .is_some_and(|subscription| subscription.ready)
        })
    }

    pub fn is_subscribed(&self, path: &Path) -> bool {
        self.subscriptions.contains_key(path)
    }

    /// True if some subscription at `path` or above would see events for it.
    pub fn covers(&self, path: &Path) -> bool {
        path.ancestors()
            .any(|ancestor| self.subscriptions.contains_key(&ancestor))
    }

    pub fn paths(&self) -> Vec<Path> {
        self.subscriptions.keys().cloned().collect()
    }

    pub fn observer_count(&self, path: &Path) -> usize {
        self.subscriptions
            .get(path)
            .map(|subscription| subscription.observers.len())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Queues `entry` for observers of its path and `Subtree` observers of any ancestor.
    pub fn notify(&mut self, entry: CacheEntry) {
        for ancestor in entry.path.ancestors() {
            let Some(subscription) = self.subscriptions.get(&ancestor) else {
                continue;
            };
            for key in &subscription.observers {
                let Some(slot) = self.observers.get(*key) else {
                    continue;
                };
                if ancestor == entry.path || slot.scope == Scope::Subtree {
                    self.queue.push_back(Delivery::Change {
                        key: *key,
                        entry: entry.clone(),
                    });
                }
            }
        }
    }

    /// Queues `error` for every observer subscribed at exactly `path`.
    pub fn notify_error(&mut self, path: &Path, error: SyncError) {
        let Some(subscription) = self.subscriptions.get(path) else {
            return;
        };
        for key in &subscription.observers {
            self.queue.push_back(Delivery::Error {
                key: *key,
                path: path.clone(),
                error: error.clone(),
            });
        }
    }

    /// Pops the oldest queued delivery as a callback. Run it after releasing any borrow of the
    /// registry, then pop the next one.
    pub fn next_due_notification(&mut self) -> Option<Box<dyn FnOnce()>> {
        while let Some(delivery) = self.queue.pop_front() {
            let Some(slot) = self.observers.get(delivery.key()) else {
                continue;
            };
            let observer = Rc::clone(&slot.observer);
            let callback: Box<dyn FnOnce()> = match delivery {
                Delivery::Change { entry, .. } => {
                    Box::new(move || observer.on_change(&entry.path, &entry))
                }
                Delivery::Error { path, error, .. } => {
                    Box::new(move || observer.on_error(&path, &error))
                }
            };
            return Some(callback);
        }
        None
    }

    /// Drops every observer and hands back every subscription (sign-out).
    pub fn clear(&mut self) -> Vec<Released<H>> {
        self.observers.clear();
        self.queue.clear();
        std::mem::take(&mut self.subscriptions)
            .into_iter()
            .map(|(path, subscription)| Released {
                path,
                remote: subscription.remote,
            })
            .collect()
    }
}
