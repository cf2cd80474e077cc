//! Layer 6: Deferred forward references
//!
//! `manager` and `member` arrive as DNs whose target may not be ingested
//! yet. Each referring entity keeps its unresolved DNs in its own link
//! fields; this registry is the reverse view (for every pending DN, the
//! set of tags waiting on it), so ingesting or renaming an entity
//! resolves exactly the references parked on that DN, queue-free.
//!
//! A reference that never resolves stays registered indefinitely and is
//! reported by the store's `deferred_objects()`.

use std::collections::{BTreeSet, HashMap};

use super::identity::{Dn, DnKey, Tag};

/// What kind of forward link a deferred DN belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeferredKind {
    Manager,
    Member,
}

impl DeferredKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manager => "manager",
            Self::Member => "member",
        }
    }
}

/// One still-unresolved forward reference, as reported outward.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeferredReference {
    pub referrer: Tag,
    pub target_dn: Dn,
    pub kind: DeferredKind,
}

/// Reverse map: pending DN → tags waiting on it.
#[derive(Debug, Default)]
pub struct DeferredRegistry {
    waiters: HashMap<DnKey, BTreeSet<Tag>>,
}

impl DeferredRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, dn: &Dn, referrer: Tag) {
        self.waiters.entry(dn.key()).or_default().insert(referrer);
    }

    pub fn unregister(&mut self, dn: &Dn, referrer: Tag) {
        if let Some(set) = self.waiters.get_mut(&dn.key()) {
            set.remove(&referrer);
            if set.is_empty() {
                self.waiters.remove(&dn.key());
            }
        }
    }

    /// Tags waiting on `key`, removed from the registry; the caller
    /// re-registers whatever still fails to resolve.
    pub fn take_waiters(&mut self, key: &DnKey) -> BTreeSet<Tag> {
        self.waiters.remove(key).unwrap_or_default()
    }

    pub fn waiters(&self, key: &DnKey) -> Option<&BTreeSet<Tag>> {
        self.waiters.get(key)
    }

    /// Every tag with at least one pending reference.
    pub fn all_referrers(&self) -> BTreeSet<Tag> {
        self.waiters.values().flatten().copied().collect()
    }

    pub fn pending_dn_count(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
