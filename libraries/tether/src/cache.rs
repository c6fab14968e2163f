//! # LocalCache
//! In-memory store of the last known state of every path we care about.
//!
//! Each slot keeps the authoritative base (whatever the remote store last told us, with its
//! version) separately from the local writes still waiting on an answer. The visible value is
//! always recomputed as `base` with those writes folded over it in `LocalSeq` order, so a foreign
//! update or an acknowledgement only has to swap the base or drop a layer and replay.
//!
//! Slots live in an [`im::OrdMap`], so [`LocalCache::snapshot`] is a constant-time clone that
//! readers can hold onto without seeing later mutations.

use std::collections::BTreeSet;

use im::{OrdMap, Vector};

use crate::data_model::{CacheEntry, Entity, LocalSeq, Mutation, Path, Version};

#[derive(Clone, Debug)]
struct Layer {
    seq: LocalSeq,
    mutation: Mutation,
}

#[derive(Clone, Debug)]
struct Slot {
    base: Entity,
    version: Option<Version>,
    layers: Vector<Layer>,
    value: Entity,
    last_used: u64,
}

impl Slot {
    fn empty(last_used: u64) -> Self {
        Self {
            base: Entity::null(),
            version: None,
            layers: Vector::new(),
            value: Entity::null(),
            last_used,
        }
    }

    fn replay(&mut self) {
        self.value = self
            .layers
            .iter()
            .fold(self.base.clone(), |value, layer| layer.mutation.apply(&value));
    }

    fn entry(&self, path: &Path) -> CacheEntry {
        CacheEntry {
            path: path.clone(),
            value: self.value.clone(),
            version: self.version,
            dirty: !self.layers.is_empty(),
        }
    }

    fn take_layer(&mut self, seq: LocalSeq) -> Option<Layer> {
        let index = self.layers.iter().position(|layer| layer.seq == seq)?;
        Some(self.layers.remove(index))
    }
}

/// Immutable view of the whole cache at one point in time.
#[derive(Clone, Debug)]
pub struct CacheSnapshot {
    slots: OrdMap<Path, Slot>,
}

impl CacheSnapshot {
    pub fn read(&self, path: &Path) -> Option<CacheEntry> {
        self.slots.get(path).map(|slot| slot.entry(path))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = CacheEntry> + '_ {
        self.slots.iter().map(|(path, slot)| slot.entry(path))
    }

    pub fn descendants(&self, path: &Path) -> Vec<CacheEntry> {
        descendants(&self.slots, path)
    }
}

fn descendants(slots: &OrdMap<Path, Slot>, path: &Path) -> Vec<CacheEntry> {
    slots
        .range(path.clone()..)
        .take_while(|(candidate, _)| path.contains(candidate))
        .map(|(candidate, slot)| slot.entry(candidate))
        .collect()
}

#[derive(Debug)]
pub struct LocalCache {
    slots: OrdMap<Path, Slot>,
    /// Roots of live subscriptions. Nothing at or below one of these is evicted.
    live: BTreeSet<Path>,
    max_entries: usize,
    clock: u64,
    changes: Vec<CacheEntry>,
}

impl LocalCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            slots: OrdMap::new(),
            live: BTreeSet::new(),
            max_entries,
            clock: 0,
            changes: Vec::new(),
        }
    }

    pub fn read(&self, path: &Path) -> Option<CacheEntry> {
        self.slots.get(path).map(|slot| slot.entry(path))
    }

    pub fn version(&self, path: &Path) -> Option<Version> {
        self.slots.get(path).and_then(|slot| slot.version)
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            slots: self.slots.clone(),
        }
    }

    /// Every cached entry at or below `path`, in path order.
    pub fn descendants(&self, path: &Path) -> Vec<CacheEntry> {
        descendants(&self.slots, path)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn dirty_len(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| !slot.layers.is_empty())
            .count()
    }

    /// Replaces the authoritative base for `path` and replays any pending layers over it.
    ///
    /// Staleness is the caller's concern: this always applies.
    pub fn apply_remote(&mut self, path: &Path, value: Entity, version: Version) {
        self.update(path, |slot| {
            slot.base = value;
            slot.version = Some(version);
        });
        self.enforce_capacity();
    }

    /// Layers a pending write over the current value without touching the base.
    pub fn apply_optimistic(&mut self, path: &Path, seq: LocalSeq, mutation: Mutation) {
        self.update(path, |slot| {
            let layer = Layer { seq, mutation };
            // restored journals hand us writes in order, but keep the invariant regardless
            match slot.layers.iter().position(|existing| existing.seq > seq) {
                Some(index) => slot.layers.insert(index, layer),
                None => slot.layers.push_back(layer),
            }
        });
    }

    /// Folds the acknowledged layer into the base at `version`.
    ///
    /// If the cache already holds something newer than `version`, the write landed before that
    /// state, so the layer is simply retired. Returns false if no such layer exists.
    pub fn acknowledge(&mut self, path: &Path, seq: LocalSeq, version: Version) -> bool {
        let Some(slot) = self.slots.get(path) else {
            return false;
        };
        if !slot.layers.iter().any(|layer| layer.seq == seq) {
            return false;
        }

        self.update(path, |slot| {
            let Some(layer) = slot.take_layer(seq) else {
                return;
            };
            if slot.version.is_none_or(|known| known < version) {
                slot.base = layer.mutation.apply(&slot.base);
                slot.version = Some(version);
            } else {
                log::debug!(
                    "ack {seq} at {version} for {path} is older than cached {:?}; keeping newer base",
                    slot.version
                );
            }
        });
        self.enforce_capacity();
        true
    }

    /// Drops a layer without applying it (the write was rejected).
    pub fn discard(&mut self, path: &Path, seq: LocalSeq) -> bool {
        let Some(slot) = self.slots.get(path) else {
            return false;
        };
        if !slot.layers.iter().any(|layer| layer.seq == seq) {
            return false;
        }

        self.update(path, |slot| {
            slot.take_layer(seq);
        });
        self.enforce_capacity();
        true
    }

    /// Marks `path` as the root of a live subscription.
    pub fn retain(&mut self, path: &Path) {
        self.live.insert(path.clone());
        if let Some(slot) = self.slots.get_mut(path) {
            self.clock += 1;
            slot.last_used = self.clock;
        }
    }

    /// Releases a subscription root. Its entries stay cached until capacity pressure pushes them
    /// out, oldest first. Returns how many entries were evicted.
    pub fn evict(&mut self, path: &Path) -> usize {
        self.live.remove(path);
        self.enforce_capacity()
    }

    /// Loads authoritative bases without emitting change notifications (startup restore).
    pub fn restore(&mut self, entries: impl IntoIterator<Item = (Path, Entity, Version)>) {
        for (path, value, version) in entries {
            self.clock += 1;
            let mut slot = Slot::empty(self.clock);
            slot.base = value;
            slot.version = Some(version);
            slot.replay();
            self.slots.insert(path, slot);
        }
    }

    /// Every authoritative base, for persisting a snapshot.
    pub fn authoritative(&self) -> Vec<(Path, Entity, Version)> {
        self.slots
            .iter()
            .filter_map(|(path, slot)| {
                slot.version
                    .map(|version| (path.clone(), slot.base.clone(), version))
            })
            .collect()
    }

    /// Entries as they stood after each mutation since the last drain, oldest first.
    pub fn drain_changes(&mut self) -> Vec<CacheEntry> {
        std::mem::take(&mut self.changes)
    }

    pub fn clear(&mut self) {
        self.slots = OrdMap::new();
        self.live.clear();
        self.changes.clear();
    }

    fn update(&mut self, path: &Path, f: impl FnOnce(&mut Slot)) {
        self.clock += 1;
        let clock = self.clock;
        let slot = self
            .slots
            .entry(path.clone())
            .or_insert_with(|| Slot::empty(clock));
        f(slot);
        slot.last_used = clock;
        slot.replay();
        let entry = slot.entry(path);
        self.changes.push(entry);
    }

    fn is_live(&self, path: &Path) -> bool {
        path.ancestors().any(|ancestor| self.live.contains(&ancestor))
    }

    fn enforce_capacity(&mut self) -> usize {
        let mut evicted = 0;
        while self.slots.len() > self.max_entries {
            let candidate = self
                .slots
                .iter()
                .filter(|(path, slot)| slot.layers.is_empty() && !self.is_live(path))
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(path, _)| path.clone());

            let Some(path) = candidate else {
                log::debug!(
                    "cache holds {} entries over a limit of {}, but none are evictable",
                    self.slots.len(),
                    self.max_entries
                );
                break;
            };
            log::debug!("evicting {path} from cache");
            self.slots.remove(&path);
            evicted += 1;
        }
        evicted
    }
}
