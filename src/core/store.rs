//! Layer 8: The Store
//!
//! Owns the tag table and all secondary indexes; the single entry point
//! for ingestion (`apply_record`) and the query surface for readers.
//!
//! Concurrency: single-writer-many-readers. All mutation happens under
//! the interior write lock on the consumer thread; lookups take short
//! read locks and hand out `Arc<Entity>` clones.
//!
//! INVARIANT: after every operation,
//! - `table[e.tag].tag == e.tag` for every live entity
//! - the GUID index is injective and covers exactly the live entities
//! - manager/manages and member/memberOf backlinks are symmetric
//! - `primary_group_members[p]` contains exactly the live tags whose
//!   `primary_group_id == p`

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use super::deferred::{DeferredKind, DeferredReference, DeferredRegistry};
use super::domain::{EntityStatus, RecordSource};
use super::entity::{guid_of_record, Entity, ParsedEntity};
use super::error::{ConsistencyError, CoreError};
use super::identity::{Dn, DnKey, EmailKey, ObjectGuid, SamKey, Sid, Tag, UpnKey};
use super::indexes::{IndexConflict, Indexes};
use super::tag_table::TagTable;
use super::transitive::GraphView;
use crate::defects::{Defect, DefectLog};
use crate::directory::RawObject;
use crate::metrics::{Counter, MetricSink, MetricSinkExt};

/// What `apply_record` did with a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created(Tag),
    Updated(Tag),
    /// Bulk-load replay suppressed by the change-notify priority rule.
    Superseded(Tag),
    Deleted(Tag),
    /// Delete notice for an object we never mirrored.
    DeleteUnknown,
    /// Record carried no usable objectGUID.
    DroppedNoGuid,
    /// Record failed to parse; logged and skipped.
    SkippedParseError,
}

struct StoreMetrics {
    records_applied: Counter,
    records_skipped: Counter,
    records_dropped: Counter,
    bulk_superseded: Counter,
    entities_deleted: Counter,
    duplicate_keys: Counter,
}

impl StoreMetrics {
    fn new(sink: &Arc<dyn MetricSink>) -> Self {
        Self {
            records_applied: sink.counter("store_records_applied"),
            records_skipped: sink.counter("store_records_skipped"),
            records_dropped: sink.counter("store_records_dropped_no_guid"),
            bulk_superseded: sink.counter("store_bulk_superseded"),
            entities_deleted: sink.counter("store_entities_deleted"),
            duplicate_keys: sink.counter("store_duplicate_keys"),
        }
    }
}

pub(crate) struct StoreInner {
    table: TagTable,
    indexes: Indexes,
    deferred: DeferredRegistry,
    default_flat_name: Option<String>,
}

pub struct Store {
    inner: RwLock<StoreInner>,
    defects: Arc<DefectLog>,
    metrics: StoreMetrics,
}

impl Store {
    pub fn new(defects: Arc<DefectLog>, sink: Arc<dyn MetricSink>) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                table: TagTable::new(),
                indexes: Indexes::new(),
                deferred: DeferredRegistry::new(),
                default_flat_name: None,
            }),
            defects,
            metrics: StoreMetrics::new(&sink),
        }
    }

    /// Domain flat name inherited by entities whose record omits it, and
    /// the prefix stripped from `DOMAIN\user` SAM lookups.
    pub fn set_default_flat_name(&self, flat_name: impl Into<String>) {
        self.write().default_flat_name = Some(flat_name.into());
    }

    pub fn default_flat_name(&self) -> Option<String> {
        self.read().default_flat_name.clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreInner> {
        self.inner.read().expect("store lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().expect("store lock poisoned")
    }

    // =========================================================================
    // Ingestion
    // =========================================================================

    /// The single ingestion entry point, executed on one worker.
    pub fn apply_record(
        &self,
        raw: &RawObject,
        source: RecordSource,
    ) -> Result<ApplyOutcome, CoreError> {
        if raw.is_delete_notice() {
            return self.apply_delete_notice(raw);
        }

        let parsed = match ParsedEntity::from_raw(raw) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => {
                self.metrics.records_dropped.incr();
                return Ok(ApplyOutcome::DroppedNoGuid);
            }
            Err(CoreError::Parse(err)) => {
                self.metrics.records_skipped.incr();
                self.defects.report(Defect::RecordSkipped {
                    dn: raw.dn.clone(),
                    reason: err.to_string(),
                });
                return Ok(ApplyOutcome::SkippedParseError);
            }
            Err(other) => return Err(other),
        };

        let mut inner = self.write();
        let outcome = match inner.indexes.guid(&parsed.guid) {
            None => self.insert_new(&mut inner, parsed, source)?,
            Some(tag) => self.update_existing(&mut inner, tag, parsed, source)?,
        };
        if matches!(outcome, ApplyOutcome::Created(_) | ApplyOutcome::Updated(_)) {
            self.metrics.records_applied.incr();
        }
        Ok(outcome)
    }

    fn apply_delete_notice(&self, raw: &RawObject) -> Result<ApplyOutcome, CoreError> {
        let guid = match guid_of_record(raw) {
            Ok(Some(guid)) => guid,
            Ok(None) => {
                self.metrics.records_dropped.incr();
                return Ok(ApplyOutcome::DroppedNoGuid);
            }
            Err(CoreError::Parse(err)) => {
                self.metrics.records_skipped.incr();
                self.defects.report(Defect::RecordSkipped {
                    dn: raw.dn.clone(),
                    reason: err.to_string(),
                });
                return Ok(ApplyOutcome::SkippedParseError);
            }
            Err(other) => return Err(other),
        };

        let mut inner = self.write();
        match inner.indexes.guid(&guid) {
            Some(tag) => {
                self.delete_inner(&mut inner, tag);
                self.metrics.entities_deleted.incr();
                Ok(ApplyOutcome::Deleted(tag))
            }
            None => Ok(ApplyOutcome::DeleteUnknown),
        }
    }

    fn insert_new(
        &self,
        inner: &mut StoreInner,
        parsed: ParsedEntity,
        source: RecordSource,
    ) -> Result<ApplyOutcome, CoreError> {
        let tag = Tag::from_index(inner.table.len());
        let mut entity = Entity::from_parsed(tag, parsed);
        entity.is_change_notified = source == RecordSource::ChangeNotify;
        entity.status = EntityStatus::Exists;
        if entity.domain_flat_name.is_none() {
            entity.domain_flat_name = inner.default_flat_name.clone();
        }

        let guid = entity.guid;
        let dn_key = entity.dn.key();
        let appended = inner.table.append(entity);
        debug_assert_eq!(appended, tag);
        inner.indexes.install_guid(guid, tag);

        self.resolve_own_links(inner, tag);
        self.install_indexes(inner, tag);
        // Forward references parked on this DN can resolve now.
        self.resolve_waiters_for(inner, &dn_key);

        Ok(ApplyOutcome::Created(tag))
    }

    fn update_existing(
        &self,
        inner: &mut StoreInner,
        tag: Tag,
        parsed: ParsedEntity,
        source: RecordSource,
    ) -> Result<ApplyOutcome, CoreError> {
        let existing = match inner.table.get(tag) {
            Some(entity) => Arc::clone(entity),
            None => {
                return Err(ConsistencyError {
                    reason: format!("guid index points at nulled slot {tag}"),
                }
                .into());
            }
        };

        // Priority rule: change-notified state is never overwritten by a
        // bulk-load replay. The observation still counts for the sweep.
        if source == RecordSource::BulkLoad && existing.is_change_notified {
            if let Some(entity) = inner.table.get_mut(tag) {
                entity.status = EntityStatus::Exists;
            }
            self.metrics.bulk_superseded.incr();
            return Ok(ApplyOutcome::Superseded(tag));
        }

        let mut candidate = Entity::from_parsed(tag, parsed);
        candidate.is_change_notified = source == RecordSource::ChangeNotify;
        candidate.status = EntityStatus::Exists;
        if candidate.domain_flat_name.is_none() {
            candidate.domain_flat_name = inner.default_flat_name.clone();
        }

        // Backlinks are derived from other entities; they survive
        // re-ingestion by riding on the replacement.
        candidate.links.manages = existing.links.manages.clone();
        candidate.links.direct_member_ofs = existing.links.direct_member_ofs.clone();

        // This entity's own pending registrations are rebuilt from the
        // candidate's deferred fields during resolution below.
        if let Some(dn) = &existing.links.manager_deferred_dn {
            inner.deferred.unregister(dn, tag);
        }
        for dn in &existing.links.member_deferred_dns {
            inner.deferred.unregister(dn, tag);
        }

        let dn_changed = existing.dn.key() != candidate.dn.key();
        if dn_changed {
            // Flush references parked on the outgoing DN before its
            // mapping disappears, then retire it.
            let old_key = existing.dn.key();
            self.resolve_waiters_for(inner, &old_key);
            inner.indexes.remove_dn(&old_key, tag);
        }

        self.remove_obsolete(inner, &existing, &mut candidate);

        inner.table.replace(tag, candidate)?;
        self.resolve_own_links(inner, tag);
        self.install_indexes(inner, tag);
        if dn_changed {
            let new_key = match inner.table.get(tag) {
                Some(entity) => entity.dn.key(),
                None => return Ok(ApplyOutcome::Updated(tag)),
            };
            // References deferred on the incoming DN resolve now.
            self.resolve_waiters_for(inner, &new_key);
        }

        Ok(ApplyOutcome::Updated(tag))
    }

    /// Remove index entries and backlinks that the candidate no longer
    /// justifies, BEFORE the new ones are installed. Still-valid resolved
    /// links are carried onto the candidate so they do not re-defer.
    fn remove_obsolete(&self, inner: &mut StoreInner, existing: &Entity, candidate: &mut Entity) {
        let tag = existing.tag;

        // sAMAccountName / UPN
        let old_sam = existing.sam_account_name.as_deref().map(SamKey::of);
        let new_sam = candidate.sam_account_name.as_deref().map(SamKey::of);
        if let Some(key) = old_sam.filter(|key| Some(key) != new_sam.as_ref()) {
            inner.indexes.remove_sam(&key, tag);
        }
        let old_upn = existing.user_principal_name.as_deref().map(UpnKey::of);
        let new_upn = candidate.user_principal_name.as_deref().map(UpnKey::of);
        if let Some(key) = old_upn.filter(|key| Some(key) != new_upn.as_ref()) {
            inner.indexes.remove_upn(&key, tag);
        }

        // SIDs (current + history), in whichever namespace the old class
        // put them.
        let new_sids: BTreeSet<&Sid> = candidate
            .sid
            .iter()
            .chain(candidate.sid_history.iter())
            .collect();
        for sid in existing.sid.iter().chain(existing.sid_history.iter()) {
            let gone = !new_sids.contains(sid) || existing.is_foreign() != candidate.is_foreign();
            if gone {
                if existing.is_foreign() {
                    inner.indexes.remove_foreign_sid(sid, tag);
                } else {
                    inner.indexes.remove_sid(sid, tag);
                }
            }
        }

        // Email keys
        if existing.email_indexable() {
            let new_keys: BTreeSet<EmailKey> = if candidate.email_indexable() {
                candidate
                    .email
                    .iter()
                    .chain(candidate.email_aliases.iter())
                    .map(|addr| EmailKey::of(addr))
                    .collect()
            } else {
                BTreeSet::new()
            };
            for addr in existing.email.iter().chain(existing.email_aliases.iter()) {
                let key = EmailKey::of(addr);
                if !new_keys.contains(&key) {
                    inner.indexes.remove_email(&key, tag);
                }
            }
        }

        // Primary-group token index
        let old_token = existing.effective_primary_group_token();
        if let Some(token) = old_token.filter(|t| Some(*t) != candidate.effective_primary_group_token())
        {
            inner.indexes.remove_primary_group_token(token, tag);
        }

        // Primary-group membership
        if let Some(id) = existing
            .primary_group_id
            .filter(|id| Some(*id) != candidate.primary_group_id)
        {
            inner.indexes.remove_primary_group_member(id, tag);
        }

        // Manager: keep the resolved tag when the DN is unchanged,
        // otherwise withdraw the backlink.
        if let Some(manager_tag) = existing.links.manager {
            let same = manager_dn_matches(inner, manager_tag, candidate.links.manager_deferred_dn.as_ref());
            if same {
                candidate.links.manager = Some(manager_tag);
                candidate.links.manager_deferred_dn = None;
            } else if let Some(manager) = inner.table.get_mut(manager_tag) {
                manager.links.manages.remove(&tag);
            }
        }

        // Members: carry resolutions whose DN is still listed; withdraw
        // the rest.
        let new_member_keys: BTreeSet<DnKey> = candidate
            .links
            .member_deferred_dns
            .iter()
            .map(Dn::key)
            .collect();
        let mut kept: BTreeSet<Tag> = BTreeSet::new();
        let mut withdrawn: Vec<Tag> = Vec::new();
        for &member in &existing.links.direct_members {
            let member_key = inner.table.get(member).map(|m| m.dn.key());
            match member_key {
                Some(key) if new_member_keys.contains(&key) => {
                    kept.insert(member);
                    candidate
                        .links
                        .member_deferred_dns
                        .retain(|dn| dn.key() != key);
                }
                _ => withdrawn.push(member),
            }
        }
        for member in withdrawn {
            if let Some(entity) = inner.table.get_mut(member) {
                entity.links.direct_member_ofs.remove(&tag);
            }
        }
        candidate.links.direct_members = kept;
    }

    /// Resolve the entity's own deferred manager/member DNs against the
    /// DN index, installing backlinks on the targets; what stays
    /// unresolved is (re)registered.
    fn resolve_own_links(&self, inner: &mut StoreInner, tag: Tag) {
        let (manager_dn, member_dns) = match inner.table.get(tag) {
            Some(entity) => (
                entity.links.manager_deferred_dn.clone(),
                entity.links.member_deferred_dns.clone(),
            ),
            None => return,
        };

        if let Some(dn) = manager_dn {
            match inner.indexes.dn(&dn.key()) {
                Some(manager_tag) if manager_tag != tag => {
                    if let Some(entity) = inner.table.get_mut(tag) {
                        entity.links.manager = Some(manager_tag);
                        entity.links.manager_deferred_dn = None;
                    }
                    if let Some(manager) = inner.table.get_mut(manager_tag) {
                        manager.links.manages.insert(tag);
                    }
                }
                _ => inner.deferred.register(&dn, tag),
            }
        }

        let mut still_deferred = Vec::new();
        for dn in member_dns {
            match inner.indexes.dn(&dn.key()) {
                Some(member_tag) => {
                    if let Some(entity) = inner.table.get_mut(tag) {
                        entity.links.direct_members.insert(member_tag);
                    }
                    if let Some(member) = inner.table.get_mut(member_tag) {
                        member.links.direct_member_ofs.insert(tag);
                    }
                }
                None => {
                    inner.deferred.register(&dn, tag);
                    still_deferred.push(dn);
                }
            }
        }
        if let Some(entity) = inner.table.get_mut(tag) {
            entity.links.member_deferred_dns = still_deferred;
        }
    }

    /// Resolve every reference parked on `key` now that (or in case) the
    /// DN maps to a live entity.
    fn resolve_waiters_for(&self, inner: &mut StoreInner, key: &DnKey) {
        let waiters = inner.deferred.take_waiters(key);
        if waiters.is_empty() {
            return;
        }
        let Some(target) = inner.indexes.dn(key) else {
            // Still unresolved; park them again.
            for referrer in waiters {
                reregister(inner, key, referrer);
            }
            return;
        };

        for referrer in waiters {
            let Some(entity) = inner.table.get(referrer) else {
                continue;
            };
            let manager_hit = entity
                .links
                .manager_deferred_dn
                .as_ref()
                .is_some_and(|dn| dn.key() == *key);
            let member_hit = entity
                .links
                .member_deferred_dns
                .iter()
                .any(|dn| dn.key() == *key);

            if manager_hit {
                if let Some(entity) = inner.table.get_mut(referrer) {
                    entity.links.manager = Some(target);
                    entity.links.manager_deferred_dn = None;
                }
                if let Some(manager) = inner.table.get_mut(target) {
                    manager.links.manages.insert(referrer);
                }
            }
            if member_hit {
                if let Some(entity) = inner.table.get_mut(referrer) {
                    entity.links.member_deferred_dns.retain(|dn| dn.key() != *key);
                    entity.links.direct_members.insert(target);
                }
                if let Some(member) = inner.table.get_mut(target) {
                    member.links.direct_member_ofs.insert(referrer);
                }
            }
        }
    }

    /// Install every index entry and the forward-link backlinks for the
    /// entity at `tag`, logging displacements.
    fn install_indexes(&self, inner: &mut StoreInner, tag: Tag) {
        let entity = match inner.table.get(tag) {
            Some(entity) => Arc::clone(entity),
            None => return,
        };

        let mut conflicts: Vec<IndexConflict> = Vec::new();
        conflicts.extend(inner.indexes.install_dn(entity.dn.key(), tag));

        if let Some(sam) = &entity.sam_account_name {
            conflicts.extend(inner.indexes.install_sam(SamKey::of(sam), tag));
        }
        if let Some(upn) = &entity.user_principal_name {
            conflicts.extend(inner.indexes.install_upn(UpnKey::of(upn), tag));
        }

        for sid in entity.sid.iter().chain(entity.sid_history.iter()) {
            let conflict = if entity.is_foreign() {
                inner.indexes.install_foreign_sid(sid.clone(), tag)
            } else {
                inner.indexes.install_sid(sid.clone(), tag)
            };
            conflicts.extend(conflict);
        }

        if entity.email_indexable() {
            for addr in entity.email.iter().chain(entity.email_aliases.iter()) {
                conflicts.extend(inner.indexes.install_email(EmailKey::of(addr), tag));
            }
        }

        if let Some(token) = entity.effective_primary_group_token() {
            conflicts.extend(inner.indexes.install_primary_group_token(token, tag));
        }
        if let Some(id) = entity.primary_group_id {
            inner.indexes.add_primary_group_member(id, tag);
        }

        for conflict in conflicts {
            self.report_conflict(inner, conflict);
        }
    }

    fn report_conflict(&self, inner: &StoreInner, conflict: IndexConflict) {
        self.metrics.duplicate_keys.incr();
        let dn_of = |tag: Tag| {
            inner
                .table
                .get(tag)
                .map(|entity| entity.dn.as_str().to_string())
                .unwrap_or_else(|| "<deleted>".to_string())
        };
        self.defects.report(Defect::DuplicateKey {
            index: conflict.kind.as_str(),
            key: conflict.key,
            winner_dn: dn_of(conflict.winner),
            loser_dn: dn_of(conflict.loser),
        });
    }

    /// Full removal: every index entry, every backlink, then the slot.
    fn delete_inner(&self, inner: &mut StoreInner, tag: Tag) {
        let Some(entity) = inner.table.get(tag).map(Arc::clone) else {
            return;
        };

        inner.indexes.remove_dn(&entity.dn.key(), tag);
        inner.indexes.remove_guid(&entity.guid, tag);
        if let Some(sam) = &entity.sam_account_name {
            inner.indexes.remove_sam(&SamKey::of(sam), tag);
        }
        if let Some(upn) = &entity.user_principal_name {
            inner.indexes.remove_upn(&UpnKey::of(upn), tag);
        }
        for sid in entity.sid.iter().chain(entity.sid_history.iter()) {
            if entity.is_foreign() {
                inner.indexes.remove_foreign_sid(sid, tag);
            } else {
                inner.indexes.remove_sid(sid, tag);
            }
        }
        for addr in entity.email.iter().chain(entity.email_aliases.iter()) {
            inner.indexes.remove_email(&EmailKey::of(addr), tag);
        }
        if let Some(token) = entity.effective_primary_group_token() {
            inner.indexes.remove_primary_group_token(token, tag);
        }
        if let Some(id) = entity.primary_group_id {
            inner.indexes.remove_primary_group_member(id, tag);
        }

        // Withdraw from the manager's backlink set.
        if let Some(manager_tag) = entity.links.manager {
            if let Some(manager) = inner.table.get_mut(manager_tag) {
                manager.links.manages.remove(&tag);
            }
        }
        // Members lose this group from their memberOf sets.
        for &member in &entity.links.direct_members {
            if let Some(member_entity) = inner.table.get_mut(member) {
                member_entity.links.direct_member_ofs.remove(&tag);
            }
        }
        // Groups containing this entity re-defer the DN so a later
        // re-creation under the same name re-links.
        for &group in &entity.links.direct_member_ofs {
            if let Some(group_entity) = inner.table.get_mut(group) {
                group_entity.links.direct_members.remove(&tag);
                group_entity
                    .links
                    .member_deferred_dns
                    .push(entity.dn.clone());
                inner.deferred.register(&entity.dn, group);
            }
        }
        // Subordinates lose their manager; re-defer likewise.
        for &report in &entity.links.manages {
            if let Some(report_entity) = inner.table.get_mut(report) {
                report_entity.links.manager = None;
                report_entity.links.manager_deferred_dn = Some(entity.dn.clone());
                inner.deferred.register(&entity.dn, report);
            }
        }

        // Retire this entity's own pending registrations.
        if let Some(dn) = &entity.links.manager_deferred_dn {
            inner.deferred.unregister(dn, tag);
        }
        for dn in &entity.links.member_deferred_dns {
            inner.deferred.unregister(dn, tag);
        }

        inner.table.null_out(tag);
    }

    /// Delete one entity by GUID (admin/test surface).
    pub fn delete_by_guid(&self, guid: &ObjectGuid) -> Option<Tag> {
        let mut inner = self.write();
        let tag = inner.indexes.guid(guid)?;
        self.delete_inner(&mut inner, tag);
        self.metrics.entities_deleted.incr();
        Some(tag)
    }

    // =========================================================================
    // Bulk-load sweep
    // =========================================================================

    /// Flag every live entity `Detecting` at the start of a full load.
    pub fn mark_all_detecting(&self) {
        let mut inner = self.write();
        let tags = inner.table.live_tags();
        for tag in tags {
            if let Some(entity) = inner.table.get_mut(tag) {
                entity.status = EntityStatus::Detecting;
            }
        }
    }

    /// Delete everything a completed full load did not re-observe.
    ///
    /// Change-notified entities are spared: their latest state came from
    /// the live stream, which the replay has no authority over.
    pub fn delete_undetected(&self) -> usize {
        let mut inner = self.write();
        let doomed: Vec<Tag> = inner
            .table
            .iter_live()
            .filter(|entity| {
                entity.status == EntityStatus::Detecting && !entity.is_change_notified
            })
            .map(|entity| entity.tag)
            .collect();
        for &tag in &doomed {
            self.delete_inner(&mut inner, tag);
        }
        self.metrics.entities_deleted.add(doomed.len() as u64);
        doomed.len()
    }

    // =========================================================================
    // Deferred references
    // =========================================================================

    /// Full resolution pass over every pending DN (end of bulk load).
    pub fn resolve_all_deferred(&self) {
        let mut inner = self.write();
        let keys: Vec<DnKey> = {
            let mut keys = Vec::new();
            for tag in inner.deferred.all_referrers() {
                if let Some(entity) = inner.table.get(tag) {
                    if let Some(dn) = &entity.links.manager_deferred_dn {
                        keys.push(dn.key());
                    }
                    for dn in &entity.links.member_deferred_dns {
                        keys.push(dn.key());
                    }
                }
            }
            keys.sort_unstable_by(|a, b| a.as_str().cmp(b.as_str()));
            keys.dedup();
            keys
        };
        for key in keys {
            self.resolve_waiters_for(&mut inner, &key);
        }
    }

    /// Every still-unresolved forward reference.
    pub fn deferred_objects(&self) -> Vec<DeferredReference> {
        let inner = self.read();
        let mut out = Vec::new();
        for tag in inner.deferred.all_referrers() {
            let Some(entity) = inner.table.get(tag) else {
                continue;
            };
            if let Some(dn) = &entity.links.manager_deferred_dn {
                out.push(DeferredReference {
                    referrer: tag,
                    target_dn: dn.clone(),
                    kind: DeferredKind::Manager,
                });
            }
            for dn in &entity.links.member_deferred_dns {
                out.push(DeferredReference {
                    referrer: tag,
                    target_dn: dn.clone(),
                    kind: DeferredKind::Member,
                });
            }
        }
        out
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub fn lookup_by_dn(&self, dn: &str) -> Option<Arc<Entity>> {
        let inner = self.read();
        let tag = inner.indexes.dn(&DnKey::of(dn))?;
        inner.table.get(tag).map(Arc::clone)
    }

    pub fn lookup_by_guid(&self, guid: &ObjectGuid) -> Option<Arc<Entity>> {
        let inner = self.read();
        let tag = inner.indexes.guid(guid)?;
        inner.table.get(tag).map(Arc::clone)
    }

    /// SAM lookup; a `DOMAIN\user` input is stripped when `DOMAIN`
    /// matches the store's flat name.
    pub fn lookup_by_sam_account_name(&self, sam: &str) -> Option<Arc<Entity>> {
        let inner = self.read();
        let bare = match sam.split_once('\\') {
            Some((domain, rest)) => {
                let matches = inner
                    .default_flat_name
                    .as_deref()
                    .is_some_and(|flat| flat.eq_ignore_ascii_case(domain));
                if matches { rest } else { sam }
            }
            None => sam,
        };
        let tag = inner.indexes.sam(&SamKey::of(bare))?;
        inner.table.get(tag).map(Arc::clone)
    }

    pub fn lookup_by_upn(&self, upn: &str) -> Option<Arc<Entity>> {
        let inner = self.read();
        let tag = inner.indexes.upn(&UpnKey::of(upn))?;
        inner.table.get(tag).map(Arc::clone)
    }

    pub fn lookup_by_email(&self, email: &str) -> Option<Arc<Entity>> {
        let inner = self.read();
        let tag = inner.indexes.email(&EmailKey::of(email))?;
        inner.table.get(tag).map(Arc::clone)
    }

    /// Current SID or any SID-history entry (non-foreign principals).
    pub fn lookup_by_sid(&self, sid: &Sid) -> Option<Arc<Entity>> {
        let inner = self.read();
        let tag = inner.indexes.sid(sid)?;
        inner.table.get(tag).map(Arc::clone)
    }

    pub fn lookup_by_foreign_sid(&self, sid: &Sid) -> Option<Arc<Entity>> {
        let inner = self.read();
        let tag = inner.indexes.foreign_sid(sid)?;
        inner.table.get(tag).map(Arc::clone)
    }

    pub fn lookup_by_primary_group_token(&self, token: u32) -> Option<Arc<Entity>> {
        let inner = self.read();
        let tag = inner.indexes.primary_group_token(token)?;
        inner.table.get(tag).map(Arc::clone)
    }

    pub fn get(&self, tag: Tag) -> Option<Arc<Entity>> {
        self.read().table.get(tag).map(Arc::clone)
    }

    pub fn live_count(&self) -> usize {
        self.read().table.live_count()
    }

    pub fn table_len(&self) -> usize {
        self.read().table.len()
    }

    /// Consistent iteration snapshot: slot pointers captured atomically.
    pub fn capture(&self) -> Vec<Option<Arc<Entity>>> {
        self.read().table.snapshot()
    }

    // =========================================================================
    // Transitive queries
    // =========================================================================

    pub fn all_members(&self, group: Tag) -> BTreeSet<Tag> {
        let inner = self.read();
        GraphView::new(&inner.table, &inner.indexes).all_members(group)
    }

    pub fn all_member_ofs(&self, entity: Tag) -> BTreeSet<Tag> {
        let inner = self.read();
        GraphView::new(&inner.table, &inner.indexes).all_member_ofs(entity)
    }

    pub fn has_member(&self, group: Tag, candidate: Tag) -> bool {
        let inner = self.read();
        GraphView::new(&inner.table, &inner.indexes).has_member(group, candidate)
    }

    pub fn all_group_members(&self, group: Tag) -> BTreeSet<Tag> {
        let inner = self.read();
        GraphView::new(&inner.table, &inner.indexes).all_group_members(group)
    }

    // =========================================================================
    // Snapshot restore
    // =========================================================================

    /// Rebuild the store from snapshot slots: indexes and backlinks are
    /// derived by replaying the ingestion install rules in tag order.
    /// The deferred resolver is NOT invoked (snapshots are internally
    /// consistent), but still-deferred DNs re-enter the registry.
    pub fn restore(&self, slots: Vec<Option<Entity>>) -> Result<usize, CoreError> {
        let mut table = TagTable::restore(slots)?;
        // Backlink sets are recomputed below; drop whatever rode in.
        for tag in table.live_tags() {
            if let Some(entity) = table.get_mut(tag) {
                entity.links.manages.clear();
                entity.links.direct_member_ofs.clear();
            }
        }
        let mut indexes = Indexes::new();
        let mut deferred = DeferredRegistry::new();

        // Backlink sets are derived state; recompute from forward links.
        let mut manages: Vec<(Tag, Tag)> = Vec::new();
        let mut member_ofs: Vec<(Tag, Tag)> = Vec::new();

        for entity in table.iter_live() {
            let tag = entity.tag;
            indexes.install_guid(entity.guid, tag);
            indexes.install_dn(entity.dn.key(), tag);
            if let Some(sam) = &entity.sam_account_name {
                indexes.install_sam(SamKey::of(sam), tag);
            }
            if let Some(upn) = &entity.user_principal_name {
                indexes.install_upn(UpnKey::of(upn), tag);
            }
            for sid in entity.sid.iter().chain(entity.sid_history.iter()) {
                if entity.is_foreign() {
                    indexes.install_foreign_sid(sid.clone(), tag);
                } else {
                    indexes.install_sid(sid.clone(), tag);
                }
            }
            if entity.email_indexable() {
                for addr in entity.email.iter().chain(entity.email_aliases.iter()) {
                    indexes.install_email(EmailKey::of(addr), tag);
                }
            }
            if let Some(token) = entity.effective_primary_group_token() {
                indexes.install_primary_group_token(token, tag);
            }
            if let Some(id) = entity.primary_group_id {
                indexes.add_primary_group_member(id, tag);
            }

            if let Some(manager) = entity.links.manager {
                if table.get(manager).is_none() {
                    return Err(ConsistencyError {
                        reason: format!("snapshot entity {tag} has dangling manager {manager}"),
                    }
                    .into());
                }
                manages.push((manager, tag));
            }
            for &member in &entity.links.direct_members {
                if table.get(member).is_none() {
                    return Err(ConsistencyError {
                        reason: format!("snapshot entity {tag} has dangling member {member}"),
                    }
                    .into());
                }
                member_ofs.push((member, tag));
            }

            if let Some(dn) = &entity.links.manager_deferred_dn {
                deferred.register(dn, tag);
            }
            for dn in &entity.links.member_deferred_dns {
                deferred.register(dn, tag);
            }
        }

        let mut inner = self.write();
        inner.table = table;
        inner.indexes = indexes;
        inner.deferred = deferred;
        for (manager, report) in manages {
            if let Some(entity) = inner.table.get_mut(manager) {
                entity.links.manages.insert(report);
            }
        }
        for (member, group) in member_ofs {
            if let Some(entity) = inner.table.get_mut(member) {
                entity.links.direct_member_ofs.insert(group);
            }
        }
        Ok(inner.table.live_count())
    }

    // =========================================================================
    // Consistency audit
    // =========================================================================

    /// Check every store invariant; used by tests and as a runtime
    /// tripwire. A violation is fatal to the process.
    pub fn verify_consistency(&self) -> Result<(), ConsistencyError> {
        let inner = self.read();
        let table = &inner.table;

        let mut live = 0usize;
        for entity in table.iter_live() {
            live += 1;
            let tag = entity.tag;
            if table.get(tag).map(|slot| slot.tag) != Some(tag) {
                return Err(ConsistencyError {
                    reason: format!("entity {tag} not at its slot"),
                });
            }
            if inner.indexes.guid(&entity.guid) != Some(tag) {
                return Err(ConsistencyError {
                    reason: format!("guid index missing or misdirected for {tag}"),
                });
            }

            if let Some(manager) = entity.links.manager {
                let ok = table
                    .get(manager)
                    .is_some_and(|m| m.links.manages.contains(&tag));
                if !ok {
                    return Err(ConsistencyError {
                        reason: format!("manager backlink missing for {tag}"),
                    });
                }
            }
            for &report in &entity.links.manages {
                let ok = table
                    .get(report)
                    .is_some_and(|r| r.links.manager == Some(tag));
                if !ok {
                    return Err(ConsistencyError {
                        reason: format!("manages set of {tag} has stale entry {report}"),
                    });
                }
            }
            for &member in &entity.links.direct_members {
                let ok = table
                    .get(member)
                    .is_some_and(|m| m.links.direct_member_ofs.contains(&tag));
                if !ok {
                    return Err(ConsistencyError {
                        reason: format!("memberOf backlink missing for member {member} of {tag}"),
                    });
                }
            }
            for &group in &entity.links.direct_member_ofs {
                let ok = table
                    .get(group)
                    .is_some_and(|g| g.links.direct_members.contains(&tag));
                if !ok {
                    return Err(ConsistencyError {
                        reason: format!("memberOf set of {tag} has stale group {group}"),
                    });
                }
            }
            if let Some(id) = entity.primary_group_id {
                let ok = inner
                    .indexes
                    .primary_group_member_tags(id)
                    .contains(&tag);
                if !ok {
                    return Err(ConsistencyError {
                        reason: format!("primary group set {id} missing member {tag}"),
                    });
                }
            }
        }

        if inner.indexes.guid_len() != live {
            return Err(ConsistencyError {
                reason: format!(
                    "guid index has {} entries for {live} live entities",
                    inner.indexes.guid_len()
                ),
            });
        }

        // The DN index never points at a nulled slot or a renamed entity.
        for (key, tag) in inner.indexes.dn_entries() {
            let ok = table.get(tag).is_some_and(|entity| entity.dn.key() == *key);
            if !ok {
                return Err(ConsistencyError {
                    reason: format!("dn index entry {key:?} dangles at {tag}"),
                });
            }
        }
        Ok(())
    }

    pub fn defects(&self) -> &DefectLog {
        &self.defects
    }
}

fn manager_dn_matches(inner: &StoreInner, manager_tag: Tag, candidate_dn: Option<&Dn>) -> bool {
    match (inner.table.get(manager_tag), candidate_dn) {
        (Some(manager), Some(dn)) => manager.dn.key() == dn.key(),
        _ => false,
    }
}

fn reregister(inner: &mut StoreInner, key: &DnKey, referrer: Tag) {
    // Re-park under the entity's own deferred DN fields matching `key`.
    let Some(entity) = inner.table.get(referrer) else {
        return;
    };
    let dn = entity
        .links
        .manager_deferred_dn
        .iter()
        .chain(entity.links.member_deferred_dns.iter())
        .find(|dn| dn.key() == *key)
        .cloned();
    if let Some(dn) = dn {
        inner.deferred.register(&dn, referrer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::Sid;
    use crate::metrics;
    use crate::test_harness::{guid, RecordBuilder};
    use proptest::prelude::*;

    fn test_store() -> Store {
        Store::new(Arc::new(DefectLog::disabled()), metrics::noop())
    }

    fn apply(store: &Store, raw: &RawObject) -> ApplyOutcome {
        store.apply_record(raw, RecordSource::BulkLoad).unwrap()
    }

    fn apply_notify(store: &Store, raw: &RawObject) -> ApplyOutcome {
        store.apply_record(raw, RecordSource::ChangeNotify).unwrap()
    }

    #[test]
    fn basic_ingestion_and_lookup() {
        let store = test_store();
        let raw = RecordBuilder::user(1, "CN=A,DC=x")
            .sam("A")
            .upn("a@corp.example")
            .sid(1001)
            .build();
        let outcome = apply(&store, &raw);
        assert!(matches!(outcome, ApplyOutcome::Created(_)));

        let by_dn = store.lookup_by_dn("CN=A,DC=x").unwrap();
        assert_eq!(by_dn.sam_account_name.as_deref(), Some("A"));
        let by_guid = store.lookup_by_guid(&guid(1)).unwrap();
        assert_eq!(by_guid.sam_account_name.as_deref(), Some("A"));
        let sid = Sid::parse("S-1-5-21-7-8-1001").unwrap();
        let by_sid = store.lookup_by_sid(&sid).unwrap();
        assert_eq!(by_sid.sam_account_name.as_deref(), Some("A"));
        let by_upn = store.lookup_by_upn("A@CORP.EXAMPLE").unwrap();
        assert_eq!(by_upn.tag, by_dn.tag);

        store.verify_consistency().unwrap();
    }

    #[test]
    fn manager_resolves_when_target_arrives() {
        let store = test_store();
        apply(
            &store,
            &RecordBuilder::user(1, "CN=A,DC=x").manager("CN=B,DC=x").build(),
        );
        let a = store.lookup_by_dn("CN=A,DC=x").unwrap();
        assert!(a.links.manager.is_none());
        assert!(a.links.manager_deferred_dn.is_some());
        assert_eq!(store.deferred_objects().len(), 1);

        apply(&store, &RecordBuilder::user(2, "CN=B,DC=x").build());

        let a = store.lookup_by_dn("CN=A,DC=x").unwrap();
        let b = store.lookup_by_dn("CN=B,DC=x").unwrap();
        assert_eq!(a.links.manager, Some(b.tag));
        assert!(b.links.manages.contains(&a.tag));
        assert!(store.deferred_objects().is_empty());
        store.verify_consistency().unwrap();
    }

    #[test]
    fn rename_moves_the_dn_index_entry() {
        let store = test_store();
        apply(&store, &RecordBuilder::user(1, "CN=A,DC=x").build());
        let before = store.lookup_by_dn("CN=A,DC=x").unwrap();

        let outcome = apply(&store, &RecordBuilder::user(1, "CN=A2,DC=x").build());
        assert_eq!(outcome, ApplyOutcome::Updated(before.tag));

        assert!(store.lookup_by_dn("CN=A,DC=x").is_none());
        let after = store.lookup_by_dn("CN=A2,DC=x").unwrap();
        assert_eq!(after.tag, before.tag);
        store.verify_consistency().unwrap();
    }

    #[test]
    fn rename_resolves_waiters_on_the_new_dn() {
        let store = test_store();
        apply(
            &store,
            &RecordBuilder::user(1, "CN=A,DC=x").manager("CN=Boss,DC=x").build(),
        );
        apply(&store, &RecordBuilder::user(2, "CN=Interim,DC=x").build());
        // Rename the second entity onto the awaited DN.
        apply(&store, &RecordBuilder::user(2, "CN=Boss,DC=x").build());

        let a = store.lookup_by_dn("CN=A,DC=x").unwrap();
        let boss = store.lookup_by_dn("CN=Boss,DC=x").unwrap();
        assert_eq!(a.links.manager, Some(boss.tag));
        assert!(boss.links.manages.contains(&a.tag));
        store.verify_consistency().unwrap();
    }

    #[test]
    fn primary_group_membership() {
        let store = test_store();
        apply(
            &store,
            &RecordBuilder::group(2, "CN=Users,DC=x").primary_group_token(513).build(),
        );
        apply(
            &store,
            &RecordBuilder::user(1, "CN=U,DC=x").primary_group_id(513).build(),
        );

        let group = store.lookup_by_guid(&guid(2)).unwrap();
        let user = store.lookup_by_guid(&guid(1)).unwrap();
        assert!(store.has_member(group.tag, user.tag));
        assert!(store.all_member_ofs(user.tag).contains(&group.tag));
        assert_eq!(
            store.lookup_by_primary_group_token(513).unwrap().tag,
            group.tag
        );
        store.verify_consistency().unwrap();
    }

    #[test]
    fn change_notify_outranks_bulk_replay() {
        let store = test_store();
        apply(&store, &RecordBuilder::user(1, "CN=A-old,DC=x").build());
        apply_notify(&store, &RecordBuilder::user(1, "CN=A-new,DC=x").build());

        // Bulk replay of stale state must not win.
        let outcome = apply(&store, &RecordBuilder::user(1, "CN=A-old,DC=x").build());
        let entity = store.lookup_by_dn("CN=A-new,DC=x").unwrap();
        assert_eq!(outcome, ApplyOutcome::Superseded(entity.tag));
        assert!(store.lookup_by_dn("CN=A-old,DC=x").is_none());
        assert!(entity.is_change_notified);

        // A later change-notify write still applies.
        apply_notify(&store, &RecordBuilder::user(1, "CN=A-newer,DC=x").build());
        assert!(store.lookup_by_dn("CN=A-newer,DC=x").is_some());
        store.verify_consistency().unwrap();
    }

    #[test]
    fn cyclic_groups_via_store_queries() {
        let store = test_store();
        apply(
            &store,
            &RecordBuilder::group(1, "CN=G1,DC=x").member("CN=G2,DC=x").build(),
        );
        apply(
            &store,
            &RecordBuilder::group(2, "CN=G2,DC=x").member("CN=G1,DC=x").build(),
        );

        let g1 = store.lookup_by_dn("CN=G1,DC=x").unwrap();
        let g2 = store.lookup_by_dn("CN=G2,DC=x").unwrap();
        let members = store.all_members(g1.tag);
        assert!(members.contains(&g1.tag) && members.contains(&g2.tag));
        assert!(store.has_member(g1.tag, g1.tag));
        store.verify_consistency().unwrap();
    }

    #[test]
    fn applying_the_same_record_twice_is_idempotent() {
        let store = test_store();
        let raw = RecordBuilder::user(1, "CN=A,DC=x")
            .sam("A")
            .sid(1001)
            .mail("a@corp.example")
            .mailbox(9)
            .manager("CN=B,DC=x")
            .build();
        apply(&store, &raw);
        let first = store.lookup_by_guid(&guid(1)).unwrap();

        apply(&store, &raw);
        let second = store.lookup_by_guid(&guid(1)).unwrap();
        assert_eq!(*first, *second);
        assert_eq!(store.deferred_objects().len(), 1);
        store.verify_consistency().unwrap();
    }

    #[test]
    fn duplicate_sam_defects_and_last_writer_wins() {
        let store = test_store();
        apply(&store, &RecordBuilder::user(1, "CN=A,DC=x").sam("dup").build());
        apply(&store, &RecordBuilder::user(2, "CN=B,DC=x").sam("dup").build());

        let winner = store.lookup_by_sam_account_name("dup").unwrap();
        assert_eq!(winner.dn.as_str(), "CN=B,DC=x");
        assert_eq!(store.defects().reported_count(), 1);

        // Both entities remain intact and reachable by GUID.
        assert!(store.lookup_by_guid(&guid(1)).is_some());
        assert!(store.lookup_by_guid(&guid(2)).is_some());

        // The loser's deletion must not evict the winner's entry.
        store.delete_by_guid(&guid(1));
        assert!(store.lookup_by_sam_account_name("dup").is_some());
        store.verify_consistency().unwrap();
    }

    #[test]
    fn delete_withdraws_backlinks_and_redefers() {
        let store = test_store();
        apply(&store, &RecordBuilder::user(2, "CN=B,DC=x").build());
        apply(
            &store,
            &RecordBuilder::user(1, "CN=A,DC=x").manager("CN=B,DC=x").build(),
        );
        apply(
            &store,
            &RecordBuilder::group(3, "CN=G,DC=x").member("CN=B,DC=x").build(),
        );

        let b_tag = store.lookup_by_dn("CN=B,DC=x").unwrap().tag;
        store.delete_by_guid(&guid(2));

        assert!(store.get(b_tag).is_none());
        let a = store.lookup_by_dn("CN=A,DC=x").unwrap();
        assert!(a.links.manager.is_none());
        let g = store.lookup_by_dn("CN=G,DC=x").unwrap();
        assert!(g.links.direct_members.is_empty());
        assert_eq!(store.deferred_objects().len(), 2);
        store.verify_consistency().unwrap();

        // Re-creation under the same DN re-links both references.
        apply(&store, &RecordBuilder::user(4, "CN=B,DC=x").build());
        let b2 = store.lookup_by_dn("CN=B,DC=x").unwrap();
        assert_ne!(b2.tag, b_tag, "tags are never reused");
        let a = store.lookup_by_dn("CN=A,DC=x").unwrap();
        assert_eq!(a.links.manager, Some(b2.tag));
        let g = store.lookup_by_dn("CN=G,DC=x").unwrap();
        assert!(g.links.direct_members.contains(&b2.tag));
        store.verify_consistency().unwrap();
    }

    #[test]
    fn sweep_deletes_undetected_but_spares_change_notified() {
        let store = test_store();
        apply(&store, &RecordBuilder::user(1, "CN=Stale,DC=x").build());
        apply(&store, &RecordBuilder::user(2, "CN=Kept,DC=x").build());
        apply(&store, &RecordBuilder::user(3, "CN=Live,DC=x").build());

        store.mark_all_detecting();
        // Re-observed by the new load.
        apply(&store, &RecordBuilder::user(2, "CN=Kept,DC=x").build());
        // Touched by the live stream during the load.
        apply_notify(&store, &RecordBuilder::user(3, "CN=Live,DC=x").build());

        let deleted = store.delete_undetected();
        assert_eq!(deleted, 1);
        assert!(store.lookup_by_dn("CN=Stale,DC=x").is_none());
        assert!(store.lookup_by_dn("CN=Kept,DC=x").is_some());
        assert!(store.lookup_by_dn("CN=Live,DC=x").is_some());
        store.verify_consistency().unwrap();
    }

    #[test]
    fn priority_suppressed_replay_still_counts_as_observation() {
        let store = test_store();
        apply_notify(&store, &RecordBuilder::user(1, "CN=A,DC=x").build());
        store.mark_all_detecting();

        // Bulk replay is suppressed but must still flip the status.
        apply(&store, &RecordBuilder::user(1, "CN=A,DC=x").build());
        let entity = store.lookup_by_dn("CN=A,DC=x").unwrap();
        assert_eq!(entity.status, EntityStatus::Exists);
        assert_eq!(store.delete_undetected(), 0);
    }

    #[test]
    fn foreign_principals_use_the_foreign_index_only() {
        let store = test_store();
        apply(
            &store,
            &RecordBuilder::foreign(1, "CN=S-1-5-21-7-8-77,CN=ForeignSecurityPrincipals,DC=x")
                .sid(77)
                .build(),
        );
        let sid = Sid::parse("S-1-5-21-7-8-77").unwrap();
        assert!(store.lookup_by_sid(&sid).is_none());
        assert!(store.lookup_by_foreign_sid(&sid).is_some());
        store.verify_consistency().unwrap();
    }

    #[test]
    fn sam_lookup_strips_matching_domain_prefix() {
        let store = test_store();
        store.set_default_flat_name("CORP");
        apply(&store, &RecordBuilder::user(1, "CN=A,DC=x").sam("alice").build());

        assert!(store.lookup_by_sam_account_name("CORP\\alice").is_some());
        assert!(store.lookup_by_sam_account_name("corp\\ALICE").is_some());
        assert!(store.lookup_by_sam_account_name("OTHER\\alice").is_none());
        assert!(store.lookup_by_sam_account_name("alice").is_some());
    }

    #[test]
    fn flat_name_default_is_inherited() {
        let store = test_store();
        store.set_default_flat_name("CORP");
        apply(&store, &RecordBuilder::user(1, "CN=A,DC=x").build());
        let entity = store.lookup_by_dn("CN=A,DC=x").unwrap();
        assert_eq!(entity.domain_flat_name.as_deref(), Some("CORP"));
    }

    #[test]
    fn disabling_a_mailbox_user_removes_email_keys() {
        let store = test_store();
        apply(
            &store,
            &RecordBuilder::user(1, "CN=A,DC=x")
                .mail("a@corp.example")
                .alias("a2@corp.example")
                .mailbox(9)
                .uac(512)
                .build(),
        );
        assert!(store.lookup_by_email("a@corp.example").is_some());
        assert!(store.lookup_by_email("a2@corp.example").is_some());

        apply(
            &store,
            &RecordBuilder::user(1, "CN=A,DC=x")
                .mail("a@corp.example")
                .alias("a2@corp.example")
                .mailbox(9)
                .uac(514)
                .build(),
        );
        assert!(store.lookup_by_email("a@corp.example").is_none());
        assert!(store.lookup_by_email("a2@corp.example").is_none());
        store.verify_consistency().unwrap();
    }

    #[test]
    fn member_list_shrink_withdraws_backlinks() {
        let store = test_store();
        apply(&store, &RecordBuilder::user(1, "CN=A,DC=x").build());
        apply(&store, &RecordBuilder::user(2, "CN=B,DC=x").build());
        apply(
            &store,
            &RecordBuilder::group(3, "CN=G,DC=x")
                .member("CN=A,DC=x")
                .member("CN=B,DC=x")
                .build(),
        );
        let a = store.lookup_by_dn("CN=A,DC=x").unwrap();
        let b = store.lookup_by_dn("CN=B,DC=x").unwrap();
        let g = store.lookup_by_dn("CN=G,DC=x").unwrap();
        assert_eq!(g.links.direct_members.len(), 2);

        apply(
            &store,
            &RecordBuilder::group(3, "CN=G,DC=x").member("CN=A,DC=x").build(),
        );
        let g = store.lookup_by_dn("CN=G,DC=x").unwrap();
        assert!(g.links.direct_members.contains(&a.tag));
        assert!(!g.links.direct_members.contains(&b.tag));
        let b = store.get(b.tag).unwrap();
        assert!(!b.links.direct_member_ofs.contains(&g.tag));
        store.verify_consistency().unwrap();
    }

    #[test]
    fn parse_failures_are_skipped_and_logged() {
        let store = test_store();
        let raw = RecordBuilder::user(1, "CN=Bad,DC=x")
            .attr("userAccountControl", "not-a-number")
            .build();
        let outcome = apply(&store, &raw);
        assert_eq!(outcome, ApplyOutcome::SkippedParseError);
        assert_eq!(store.defects().reported_count(), 1);
        assert_eq!(store.live_count(), 0);
    }

    #[test]
    fn delete_notice_removes_the_entity() {
        let store = test_store();
        apply(&store, &RecordBuilder::user(1, "CN=A,DC=x").build());
        let outcome = apply_notify(
            &store,
            &RecordBuilder::user(1, "CN=A,DC=x").delete_notice().build(),
        );
        assert!(matches!(outcome, ApplyOutcome::Deleted(_)));
        assert!(store.lookup_by_dn("CN=A,DC=x").is_none());
        assert_eq!(
            apply_notify(
                &store,
                &RecordBuilder::user(42, "CN=Gone,DC=x").delete_notice().build(),
            ),
            ApplyOutcome::DeleteUnknown
        );
    }

    // A small random universe of interlinked records, applied in
    // arbitrary order and arbitrary repetition, must keep every store
    // invariant.
    proptest! {
        #![proptest_config(ProptestConfig { cases: 48, .. ProptestConfig::default() })]

        #[test]
        fn invariants_hold_under_arbitrary_application(
            order in proptest::collection::vec(0usize..6, 1..24),
            deletions in proptest::collection::vec(any::<bool>(), 6),
        ) {
            let universe = [
                RecordBuilder::user(1, "CN=U1,DC=x").sam("u1").sid(1001)
                    .manager("CN=U2,DC=x").primary_group_id(513).build(),
                RecordBuilder::user(2, "CN=U2,DC=x").sam("u2").sid(1002)
                    .manager("CN=U3,DC=x").build(),
                RecordBuilder::user(3, "CN=U3,DC=x").sam("u3")
                    .mail("u3@corp.example").mailbox(9).build(),
                RecordBuilder::group(4, "CN=G1,DC=x").sid(513)
                    .member("CN=U1,DC=x").member("CN=G2,DC=x").build(),
                RecordBuilder::group(5, "CN=G2,DC=x").sid(601)
                    .member("CN=G1,DC=x").member("CN=U3,DC=x").build(),
                RecordBuilder::user(6, "CN=Dup,DC=x").sam("u1").build(),
            ];

            let store = test_store();
            for &i in &order {
                let source = if i % 2 == 0 {
                    RecordSource::BulkLoad
                } else {
                    RecordSource::ChangeNotify
                };
                store.apply_record(&universe[i], source).unwrap();
                store.verify_consistency().unwrap();
            }
            store.resolve_all_deferred();
            store.verify_consistency().unwrap();

            for (i, &delete) in deletions.iter().enumerate() {
                if delete {
                    store.delete_by_guid(&guid(i as u8 + 1));
                    store.verify_consistency().unwrap();
                }
            }
        }
    }
}
