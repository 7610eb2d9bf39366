//! Owned/shared result-set merging.
//!
//! A user's view of a collection is the union of two live queries. Each
//! side keeps its own map keyed by record id; the union prefers the owned
//! copy when an id appears on both sides. Applying an event that is older
//! than the copy already held is a no-op, so duplicate or late delivery
//! cannot roll a record back.
//!
//! When a record leaves a side (unshared, deleted, or missing from a fresh
//! snapshot) the side remembers the version it left at. A late copy at or
//! below that version is ignored, so reordering within one subscription
//! cannot bring a revoked record back.

use crate::remote::{Query, RecordEvent};
use hearth_types::{HybridTimestamp, RawRecord, RecordId, UserId};
use std::collections::{HashMap, HashSet};

/// Which live query an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Owned,
    Shared,
}

impl Side {
    /// The query backing this side for `user`.
    pub fn query(self, user: &UserId) -> Query {
        match self {
            Side::Owned => Query::OwnedBy(user.clone()),
            Side::Shared => Query::SharedWith(user.clone()),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SideState {
    live: HashMap<RecordId, RawRecord>,
    /// Version at which a record left this side.
    departed: HashMap<RecordId, HybridTimestamp>,
}

impl SideState {
    fn is_stale(&self, record: &RawRecord) -> bool {
        self.live
            .get(&record.id)
            .is_some_and(|held| held.supersedes(record))
            || self
                .departed
                .get(&record.id)
                .is_some_and(|left_at| record.updated_at <= *left_at)
    }

    fn admit(&mut self, record: RawRecord) {
        self.departed.remove(&record.id);
        self.live.insert(record.id, record);
    }

    fn depart(&mut self, id: RecordId, at: HybridTimestamp) {
        self.live.remove(&id);
        let left_at = self.departed.entry(id).or_insert(at);
        if at > *left_at {
            *left_at = at;
        }
    }
}

/// Merged, deduplicated view of one collection for one user.
#[derive(Debug, Clone)]
pub struct MergedView {
    user: UserId,
    owned: SideState,
    shared: SideState,
}

impl MergedView {
    pub fn new(user: UserId) -> Self {
        Self {
            user,
            owned: SideState::default(),
            shared: SideState::default(),
        }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    fn side_mut(&mut self, side: Side) -> &mut SideState {
        match side {
            Side::Owned => &mut self.owned,
            Side::Shared => &mut self.shared,
        }
    }

    fn belongs(&self, side: Side, record: &RawRecord) -> bool {
        match side {
            Side::Owned => record.owner_id == self.user,
            Side::Shared => record.shared_with.contains(&self.user),
        }
    }

    /// Applies an event from one side. Returns true if the merged view
    /// changed.
    pub fn apply(&mut self, side: Side, event: RecordEvent) -> bool {
        let before = self.records();
        match event {
            RecordEvent::Snapshot(records) => {
                let mut present = HashSet::with_capacity(records.len());
                for record in records {
                    present.insert(record.id);
                    self.upsert(side, record);
                }
                let state = self.side_mut(side);
                let absent: Vec<_> = state
                    .live
                    .values()
                    .filter(|held| !present.contains(&held.id))
                    .map(|held| (held.id, held.updated_at))
                    .collect();
                for (id, at) in absent {
                    state.depart(id, at);
                }
            }
            RecordEvent::Upserted(record) => self.upsert(side, record),
            RecordEvent::Removed(id) => {
                let state = self.side_mut(side);
                if let Some(at) = state.live.get(&id).map(|held| held.updated_at) {
                    state.depart(id, at);
                }
            }
        }
        before != self.records()
    }

    fn upsert(&mut self, side: Side, record: RawRecord) {
        let belongs = self.belongs(side, &record);
        let state = self.side_mut(side);
        if state.is_stale(&record) {
            return;
        }
        if belongs {
            state.admit(record);
        } else {
            state.depart(record.id, record.updated_at);
        }
    }

    /// Drops everything held for one side. Returns true if the merged view
    /// changed.
    pub fn clear(&mut self, side: Side) -> bool {
        let before = self.records();
        self.side_mut(side).live.clear();
        before != self.records()
    }

    /// The union of both sides, owned copies first on collision, ordered by
    /// `updated_at` descending then id.
    pub fn records(&self) -> Vec<RawRecord> {
        let mut merged: HashMap<RecordId, &RawRecord> = HashMap::new();
        for record in self.shared.live.values() {
            merged.insert(record.id, record);
        }
        for record in self.owned.live.values() {
            merged.insert(record.id, record);
        }

        let mut records: Vec<RawRecord> = merged
            .into_values()
            .filter(|r| r.is_visible_to(&self.user))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.lww_cmp(a));
        records
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.owned.live.is_empty() && self.shared.live.is_empty()
    }
}
