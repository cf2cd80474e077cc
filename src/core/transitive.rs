//! Layer 7: Transitive membership engine
//!
//! Derived queries over the composite graph whose edges are direct
//! membership (`group → member`) and primary-group membership
//! (`primaryGroupToken(group) → {e | e.primaryGroupId == token}`).
//!
//! Every traversal carries a visited set and expands a node at most
//! once, so a group that contains itself (directly or transitively)
//! terminates, and shows up in its own closure, keeping
//! `has_member(g, x) ⟺ x ∈ all_members(g)` exact. DFS is iterative;
//! pathological nesting cannot overflow the call stack. Primary-group
//! edges cost O(1) per node via the member map.

use std::collections::BTreeSet;

use super::entity::Entity;
use super::identity::Tag;
use super::indexes::Indexes;
use super::tag_table::TagTable;

/// Read-only view over the store interior, held for one traversal.
pub struct GraphView<'a> {
    table: &'a TagTable,
    indexes: &'a Indexes,
}

impl<'a> GraphView<'a> {
    pub fn new(table: &'a TagTable, indexes: &'a Indexes) -> Self {
        Self { table, indexes }
    }

    fn entity(&self, tag: Tag) -> Option<&Entity> {
        self.table.get(tag).map(AsRef::as_ref)
    }

    fn is_group(&self, tag: Tag) -> bool {
        self.entity(tag).is_some_and(Entity::is_group)
    }

    /// All members of `group`, direct and transitive: the union of every
    /// expanded group's primary-group members (flat: primary-group
    /// members are never groups themselves) and its direct members,
    /// descending into direct members that are groups.
    pub fn all_members(&self, group: Tag) -> BTreeSet<Tag> {
        let mut members = BTreeSet::new();
        let mut expanded: BTreeSet<Tag> = BTreeSet::new();
        let mut stack = vec![group];

        while let Some(current) = stack.pop() {
            if !expanded.insert(current) {
                continue;
            }
            let Some(entity) = self.entity(current) else {
                continue;
            };

            if let Some(token) = entity.effective_primary_group_token() {
                for member in self.indexes.primary_group_member_tags(token) {
                    members.insert(member);
                }
            }

            for &member in &entity.links.direct_members {
                members.insert(member);
                if self.is_group(member) {
                    stack.push(member);
                }
            }
        }
        members
    }

    /// All groups `entity` belongs to, direct and transitive, seeded by
    /// its primary group when resolved.
    pub fn all_member_ofs(&self, entity: Tag) -> BTreeSet<Tag> {
        let mut groups = BTreeSet::new();
        let mut stack = Vec::new();

        if let Some(start) = self.entity(entity) {
            if let Some(primary) = self.primary_group_of(start) {
                stack.push(primary);
            }
            stack.extend(start.links.direct_member_ofs.iter().copied());
        }

        // The result set doubles as the visited set: every reached node
        // is a containing group, and each is expanded exactly once.
        while let Some(current) = stack.pop() {
            if !groups.insert(current) {
                continue;
            }
            let Some(node) = self.entity(current) else {
                continue;
            };
            if let Some(primary) = self.primary_group_of(node) {
                stack.push(primary);
            }
            stack.extend(node.links.direct_member_ofs.iter().copied());
        }
        groups
    }

    /// Short-circuit membership test: direct and primary-group edges are
    /// checked at every frame before descending.
    pub fn has_member(&self, group: Tag, candidate: Tag) -> bool {
        let candidate_primary = self
            .entity(candidate)
            .and_then(|entity| entity.primary_group_id);

        let mut expanded: BTreeSet<Tag> = BTreeSet::new();
        let mut stack = vec![group];

        while let Some(current) = stack.pop() {
            if !expanded.insert(current) {
                continue;
            }
            let Some(entity) = self.entity(current) else {
                continue;
            };

            if entity.links.direct_members.contains(&candidate) {
                return true;
            }
            if let (Some(token), Some(primary)) =
                (entity.effective_primary_group_token(), candidate_primary)
            {
                if token == primary {
                    return true;
                }
            }

            for &member in &entity.links.direct_members {
                if self.is_group(member) {
                    stack.push(member);
                }
            }
        }
        false
    }

    /// Transitive members whose class indicates a group.
    pub fn all_group_members(&self, group: Tag) -> BTreeSet<Tag> {
        let mut groups = BTreeSet::new();
        let mut expanded: BTreeSet<Tag> = BTreeSet::new();
        let mut stack = vec![group];

        while let Some(current) = stack.pop() {
            if !expanded.insert(current) {
                continue;
            }
            let Some(entity) = self.entity(current) else {
                continue;
            };
            for &member in &entity.links.direct_members {
                if self.is_group(member) {
                    groups.insert(member);
                    stack.push(member);
                }
            }
        }
        groups
    }

    /// Resolve an entity's primary group through the token index.
    fn primary_group_of(&self, entity: &Entity) -> Option<Tag> {
        let id = entity.primary_group_id?;
        self.indexes.primary_group_token(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entity::Entity;
    use crate::test_harness::{entity_named, group_named};

    struct Fixture {
        table: TagTable,
        indexes: Indexes,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                table: TagTable::new(),
                indexes: Indexes::new(),
            }
        }

        fn add(&mut self, entity: Entity) -> Tag {
            let guid = entity.guid;
            let tag = self.table.append(entity);
            self.indexes.install_guid(guid, tag);
            tag
        }

        fn add_group(&mut self, seed: u8, dn: &str, token: u32) -> Tag {
            let mut group = group_named(seed, dn);
            group.primary_group_token = Some(token);
            let tag = self.add(group);
            self.indexes.install_primary_group_token(token, tag);
            tag
        }

        fn member(&mut self, group: Tag, member: Tag) {
            self.table
                .get_mut(group)
                .unwrap()
                .links
                .direct_members
                .insert(member);
            self.table
                .get_mut(member)
                .unwrap()
                .links
                .direct_member_ofs
                .insert(group);
        }

        fn primary(&mut self, member: Tag, token: u32) {
            self.table.get_mut(member).unwrap().primary_group_id = Some(token);
            self.indexes.add_primary_group_member(token, member);
        }

        fn view(&self) -> GraphView<'_> {
            GraphView::new(&self.table, &self.indexes)
        }
    }

    #[test]
    fn all_members_walks_nested_groups() {
        let mut fx = Fixture::new();
        let outer = fx.add_group(1, "CN=Outer", 100);
        let inner = fx.add_group(2, "CN=Inner", 101);
        let alice = fx.add(entity_named(3, "CN=Alice"));
        let bob = fx.add(entity_named(4, "CN=Bob"));
        fx.member(outer, inner);
        fx.member(inner, alice);
        fx.member(outer, bob);

        let members = fx.view().all_members(outer);
        assert_eq!(
            members.into_iter().collect::<Vec<_>>(),
            vec![inner, alice, bob]
        );
    }

    #[test]
    fn all_members_includes_primary_members_of_nested_groups() {
        let mut fx = Fixture::new();
        let outer = fx.add_group(1, "CN=Outer", 100);
        let inner = fx.add_group(2, "CN=Inner", 101);
        let carol = fx.add(entity_named(3, "CN=Carol"));
        fx.member(outer, inner);
        fx.primary(carol, 101);

        let members = fx.view().all_members(outer);
        assert!(members.contains(&carol));
        assert!(members.contains(&inner));
    }

    #[test]
    fn cyclic_groups_terminate_and_close() {
        let mut fx = Fixture::new();
        let g1 = fx.add_group(1, "CN=G1", 100);
        let g2 = fx.add_group(2, "CN=G2", 101);
        fx.member(g1, g2);
        fx.member(g2, g1);

        let view = fx.view();
        // Closure of reachable nodes: g1 contains itself via the cycle.
        let members = view.all_members(g1);
        assert_eq!(members.into_iter().collect::<Vec<_>>(), vec![g1, g2]);
        assert!(view.has_member(g1, g1));
        assert!(view.has_member(g1, g2));
        assert!(view.has_member(g2, g1));

        let ofs = view.all_member_ofs(g1);
        assert_eq!(ofs.into_iter().collect::<Vec<_>>(), vec![g1, g2]);
    }

    #[test]
    fn member_ofs_climb_through_primary_group() {
        let mut fx = Fixture::new();
        let users = fx.add_group(1, "CN=Domain Users", 513);
        let staff = fx.add_group(2, "CN=Staff", 600);
        let alice = fx.add(entity_named(3, "CN=Alice"));
        fx.primary(alice, 513);
        fx.member(staff, users);

        let ofs = fx.view().all_member_ofs(alice);
        assert_eq!(ofs.into_iter().collect::<Vec<_>>(), vec![users, staff]);
    }

    #[test]
    fn has_member_checks_primary_edges_at_depth() {
        let mut fx = Fixture::new();
        let outer = fx.add_group(1, "CN=Outer", 100);
        let inner = fx.add_group(2, "CN=Inner", 101);
        let dave = fx.add(entity_named(3, "CN=Dave"));
        fx.member(outer, inner);
        fx.primary(dave, 101);

        let view = fx.view();
        assert!(view.has_member(outer, dave));
        assert!(view.has_member(inner, dave));
        assert!(!view.has_member(inner, outer));
    }

    #[test]
    fn group_members_filters_non_groups() {
        let mut fx = Fixture::new();
        let outer = fx.add_group(1, "CN=Outer", 100);
        let inner = fx.add_group(2, "CN=Inner", 101);
        let deep = fx.add_group(3, "CN=Deep", 102);
        let user = fx.add(entity_named(4, "CN=User"));
        fx.member(outer, inner);
        fx.member(inner, deep);
        fx.member(outer, user);

        let groups = fx.view().all_group_members(outer);
        assert_eq!(groups.into_iter().collect::<Vec<_>>(), vec![inner, deep]);
    }

    #[test]
    fn membership_equivalences_hold() {
        let mut fx = Fixture::new();
        let g1 = fx.add_group(1, "CN=G1", 100);
        let g2 = fx.add_group(2, "CN=G2", 101);
        let alice = fx.add(entity_named(3, "CN=Alice"));
        fx.member(g1, g2);
        fx.member(g2, alice);
        fx.primary(alice, 100);

        let view = fx.view();
        for &g in &[g1, g2] {
            let members = view.all_members(g);
            for &x in &[g1, g2, alice] {
                assert_eq!(
                    view.has_member(g, x),
                    members.contains(&x),
                    "HasMember({g},{x}) must match AllMembers"
                );
            }
            for x in members {
                assert!(
                    view.all_member_ofs(x).contains(&g),
                    "{g} must appear in AllMemberOfs({x})"
                );
            }
        }
    }
}
