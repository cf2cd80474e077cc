//! Layer 5: Secondary indexes
//!
//! Nine logically independent maps from lookup keys to tags. All are
//! mutated only under the store's write lock; lookups clone tags out.
//!
//! Duplicate keys are tolerated: the later writer wins the slot and the
//! displacement is reported to the caller for defect logging. Removals
//! are guarded: an entry is only removed when it still points at the
//! departing tag, so a loser's deletion cannot evict the winner.
//!
//! Foreign security principals are indexed in the foreign-SID map only,
//! never in the regular SID map.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use super::identity::{DnKey, EmailKey, ObjectGuid, SamKey, Sid, Tag, UpnKey};

/// Which index a duplicate key was observed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexKind {
    Dn,
    Guid,
    SamAccountName,
    Upn,
    Email,
    Sid,
    ForeignSid,
    PrimaryGroupToken,
}

impl IndexKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dn => "dn",
            Self::Guid => "guid",
            Self::SamAccountName => "sam_account_name",
            Self::Upn => "upn",
            Self::Email => "email",
            Self::Sid => "sid",
            Self::ForeignSid => "foreign_sid",
            Self::PrimaryGroupToken => "primary_group_token",
        }
    }
}

/// A duplicate-key observation: `winner` now owns the slot `loser` held.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexConflict {
    pub kind: IndexKind,
    pub key: String,
    pub winner: Tag,
    pub loser: Tag,
}

/// Shared, per-entry-locked set of entities whose primaryGroupId points
/// at one group token.
pub type MemberSet = Arc<Mutex<BTreeSet<Tag>>>;

#[derive(Debug, Default)]
pub struct Indexes {
    by_dn: HashMap<DnKey, Tag>,
    by_guid: HashMap<ObjectGuid, Tag>,
    by_sam: HashMap<SamKey, Tag>,
    by_upn: HashMap<UpnKey, Tag>,
    by_email: HashMap<EmailKey, Tag>,
    by_sid: HashMap<Sid, Tag>,
    by_foreign_sid: HashMap<Sid, Tag>,
    by_primary_group_token: HashMap<u32, Tag>,
    primary_group_members: HashMap<u32, MemberSet>,
}

impl Indexes {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub fn dn(&self, key: &DnKey) -> Option<Tag> {
        self.by_dn.get(key).copied()
    }

    pub fn guid(&self, guid: &ObjectGuid) -> Option<Tag> {
        self.by_guid.get(guid).copied()
    }

    pub fn sam(&self, key: &SamKey) -> Option<Tag> {
        self.by_sam.get(key).copied()
    }

    pub fn upn(&self, key: &UpnKey) -> Option<Tag> {
        self.by_upn.get(key).copied()
    }

    pub fn email(&self, key: &EmailKey) -> Option<Tag> {
        self.by_email.get(key).copied()
    }

    pub fn sid(&self, sid: &Sid) -> Option<Tag> {
        self.by_sid.get(sid).copied()
    }

    pub fn foreign_sid(&self, sid: &Sid) -> Option<Tag> {
        self.by_foreign_sid.get(sid).copied()
    }

    pub fn primary_group_token(&self, token: u32) -> Option<Tag> {
        self.by_primary_group_token.get(&token).copied()
    }

    /// The shared member set for a token, if any entity points at it.
    pub fn primary_group_members(&self, token: u32) -> Option<MemberSet> {
        self.primary_group_members.get(&token).cloned()
    }

    pub fn dn_len(&self) -> usize {
        self.by_dn.len()
    }

    pub(crate) fn dn_entries(&self) -> impl Iterator<Item = (&DnKey, Tag)> {
        self.by_dn.iter().map(|(key, &tag)| (key, tag))
    }

    pub fn guid_len(&self) -> usize {
        self.by_guid.len()
    }

    // =========================================================================
    // Installs (last writer wins; displacement reported)
    // =========================================================================

    pub fn install_dn(&mut self, key: DnKey, tag: Tag) -> Option<IndexConflict> {
        let display = key.as_str().to_string();
        Self::displacing(IndexKind::Dn, display, self.by_dn.insert(key, tag), tag)
    }

    pub fn install_guid(&mut self, guid: ObjectGuid, tag: Tag) -> Option<IndexConflict> {
        let display = guid.to_string();
        Self::displacing(IndexKind::Guid, display, self.by_guid.insert(guid, tag), tag)
    }

    pub fn install_sam(&mut self, key: SamKey, tag: Tag) -> Option<IndexConflict> {
        let display = key.as_str().to_string();
        Self::displacing(
            IndexKind::SamAccountName,
            display,
            self.by_sam.insert(key, tag),
            tag,
        )
    }

    pub fn install_upn(&mut self, key: UpnKey, tag: Tag) -> Option<IndexConflict> {
        let display = key.as_str().to_string();
        Self::displacing(IndexKind::Upn, display, self.by_upn.insert(key, tag), tag)
    }

    pub fn install_email(&mut self, key: EmailKey, tag: Tag) -> Option<IndexConflict> {
        let display = key.as_str().to_string();
        Self::displacing(IndexKind::Email, display, self.by_email.insert(key, tag), tag)
    }

    pub fn install_sid(&mut self, sid: Sid, tag: Tag) -> Option<IndexConflict> {
        let display = sid.to_string();
        Self::displacing(IndexKind::Sid, display, self.by_sid.insert(sid, tag), tag)
    }

    pub fn install_foreign_sid(&mut self, sid: Sid, tag: Tag) -> Option<IndexConflict> {
        let display = sid.to_string();
        Self::displacing(
            IndexKind::ForeignSid,
            display,
            self.by_foreign_sid.insert(sid, tag),
            tag,
        )
    }

    pub fn install_primary_group_token(&mut self, token: u32, tag: Tag) -> Option<IndexConflict> {
        Self::displacing(
            IndexKind::PrimaryGroupToken,
            token.to_string(),
            self.by_primary_group_token.insert(token, tag),
            tag,
        )
    }

    fn displacing(
        kind: IndexKind,
        key: String,
        previous: Option<Tag>,
        winner: Tag,
    ) -> Option<IndexConflict> {
        match previous {
            Some(loser) if loser != winner => Some(IndexConflict {
                kind,
                key,
                winner,
                loser,
            }),
            _ => None,
        }
    }

    // =========================================================================
    // Guarded removals
    // =========================================================================

    pub fn remove_dn(&mut self, key: &DnKey, tag: Tag) {
        Self::remove_if(&mut self.by_dn, key, tag);
    }

    pub fn remove_guid(&mut self, guid: &ObjectGuid, tag: Tag) {
        Self::remove_if(&mut self.by_guid, guid, tag);
    }

    pub fn remove_sam(&mut self, key: &SamKey, tag: Tag) {
        Self::remove_if(&mut self.by_sam, key, tag);
    }

    pub fn remove_upn(&mut self, key: &UpnKey, tag: Tag) {
        Self::remove_if(&mut self.by_upn, key, tag);
    }

    pub fn remove_email(&mut self, key: &EmailKey, tag: Tag) {
        Self::remove_if(&mut self.by_email, key, tag);
    }

    pub fn remove_sid(&mut self, sid: &Sid, tag: Tag) {
        Self::remove_if(&mut self.by_sid, sid, tag);
    }

    pub fn remove_foreign_sid(&mut self, sid: &Sid, tag: Tag) {
        Self::remove_if(&mut self.by_foreign_sid, sid, tag);
    }

    pub fn remove_primary_group_token(&mut self, token: u32, tag: Tag) {
        Self::remove_if(&mut self.by_primary_group_token, &token, tag);
    }

    fn remove_if<K: std::hash::Hash + Eq + Clone>(map: &mut HashMap<K, Tag>, key: &K, tag: Tag) {
        if map.get(key) == Some(&tag) {
            map.remove(key);
        }
    }

    // =========================================================================
    // Primary-group member sets
    // =========================================================================

    /// Add `member` to the set for `token`, creating the set on first use.
    pub fn add_primary_group_member(&mut self, token: u32, member: Tag) {
        let set = self
            .primary_group_members
            .entry(token)
            .or_insert_with(|| Arc::new(Mutex::new(BTreeSet::new())));
        set.lock().expect("primary group set lock poisoned").insert(member);
    }

    pub fn remove_primary_group_member(&mut self, token: u32, member: Tag) {
        let mut drop_entry = false;
        if let Some(set) = self.primary_group_members.get(&token) {
            let mut guard = set.lock().expect("primary group set lock poisoned");
            guard.remove(&member);
            drop_entry = guard.is_empty();
        }
        if drop_entry {
            self.primary_group_members.remove(&token);
        }
    }

    /// Flat copy of a token's member set (no recursion; primary-group
    /// members are never groups themselves).
    pub fn primary_group_member_tags(&self, token: u32) -> Vec<Tag> {
        match self.primary_group_members.get(&token) {
            Some(set) => set
                .lock()
                .expect("primary group set lock poisoned")
                .iter()
                .copied()
                .collect(),
            None => Vec::new(),
        }
    }
}
