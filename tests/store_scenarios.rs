//! End-to-end store scenarios over the public API.

mod common;

use common::{group, guid, test_store, user, with_attr};
use dirmirror::{ApplyOutcome, RecordSource, Sid};

fn bulk(store: &dirmirror::Store, raw: &dirmirror::RawObject) -> ApplyOutcome {
    store.apply_record(raw, RecordSource::BulkLoad).unwrap()
}

fn notify(store: &dirmirror::Store, raw: &dirmirror::RawObject) -> ApplyOutcome {
    store.apply_record(raw, RecordSource::ChangeNotify).unwrap()
}

#[test]
fn ingest_then_query_through_every_index() {
    let store = test_store();
    store.set_default_flat_name("CORP");

    let mut alice = user(1, "CN=Alice,OU=People,DC=corp,DC=example");
    alice = with_attr(alice, "sAMAccountName", "alice");
    alice = with_attr(alice, "userPrincipalName", "alice@corp.example");
    alice = with_attr(alice, "objectSid", "S-1-5-21-1-2-1104");
    alice = with_attr(alice, "sidhistory", "S-1-5-21-9-9-77");
    alice = with_attr(alice, "mail", "alice@corp.example");
    alice = with_attr(alice, "msExchMailboxGuid", &common::guid_text(200));
    bulk(&store, &alice);

    let entity = store.lookup_by_dn("cn=alice,ou=people,dc=corp,dc=example").unwrap();
    assert_eq!(entity.sam_account_name.as_deref(), Some("alice"));
    assert_eq!(store.lookup_by_guid(&guid(1)).unwrap().tag, entity.tag);
    assert_eq!(
        store.lookup_by_sam_account_name("CORP\\alice").unwrap().tag,
        entity.tag
    );
    assert_eq!(store.lookup_by_upn("ALICE@corp.example").unwrap().tag, entity.tag);
    assert_eq!(store.lookup_by_email("alice@corp.example").unwrap().tag, entity.tag);
    let history = Sid::parse("S-1-5-21-9-9-77").unwrap();
    assert_eq!(store.lookup_by_sid(&history).unwrap().tag, entity.tag);
    store.verify_consistency().unwrap();
}

#[test]
fn deferred_manager_and_members_resolve_in_any_order() {
    let store = test_store();
    let g = with_attr(
        with_attr(group(10, "CN=Team,DC=x"), "member", "CN=A,DC=x"),
        "member",
        "CN=B,DC=x",
    );
    bulk(&store, &g);
    bulk(&store, &with_attr(user(1, "CN=A,DC=x"), "manager", "CN=B,DC=x"));
    assert_eq!(store.deferred_objects().len(), 3);

    bulk(&store, &user(2, "CN=B,DC=x"));
    assert!(store.deferred_objects().is_empty());

    let team = store.lookup_by_dn("CN=Team,DC=x").unwrap();
    let a = store.lookup_by_dn("CN=A,DC=x").unwrap();
    let b = store.lookup_by_dn("CN=B,DC=x").unwrap();
    assert!(team.links.direct_members.contains(&a.tag));
    assert!(team.links.direct_members.contains(&b.tag));
    assert_eq!(a.links.manager, Some(b.tag));
    assert!(store.has_member(team.tag, a.tag));
    store.verify_consistency().unwrap();
}

#[test]
fn rename_keeps_identity_and_moves_the_dn() {
    let store = test_store();
    bulk(&store, &user(1, "CN=A,DC=x"));
    let before = store.lookup_by_guid(&guid(1)).unwrap().tag;

    bulk(&store, &user(1, "CN=A2,DC=x"));
    assert!(store.lookup_by_dn("CN=A,DC=x").is_none());
    let after = store.lookup_by_dn("CN=A2,DC=x").unwrap();
    assert_eq!(after.tag, before);
    assert_eq!(store.table_len(), 1);
}

#[test]
fn primary_group_queries_match_the_spec_scenarios() {
    let store = test_store();
    bulk(
        &store,
        &with_attr(group(2, "CN=Users,DC=x"), "primaryGroupToken", "513"),
    );
    bulk(
        &store,
        &with_attr(user(1, "CN=U,DC=x"), "primaryGroupID", "513"),
    );

    let g = store.lookup_by_guid(&guid(2)).unwrap();
    let u = store.lookup_by_guid(&guid(1)).unwrap();
    assert!(store.has_member(g.tag, u.tag));
    assert!(store.all_member_ofs(u.tag).contains(&g.tag));
    assert!(store.all_members(g.tag).contains(&u.tag));
}

#[test]
fn change_notify_priority_over_bulk_replay() {
    let store = test_store();
    notify(&store, &user(1, "CN=A-new,DC=x"));
    let outcome = bulk(&store, &user(1, "CN=A-old,DC=x"));
    assert!(matches!(outcome, ApplyOutcome::Superseded(_)));
    assert!(store.lookup_by_dn("CN=A-new,DC=x").is_some());
    assert!(store.lookup_by_dn("CN=A-old,DC=x").is_none());
}

#[test]
fn cyclic_group_closure_terminates() {
    let store = test_store();
    bulk(&store, &with_attr(group(1, "CN=G1,DC=x"), "member", "CN=G2,DC=x"));
    bulk(&store, &with_attr(group(2, "CN=G2,DC=x"), "member", "CN=G1,DC=x"));

    let g1 = store.lookup_by_dn("CN=G1,DC=x").unwrap();
    let g2 = store.lookup_by_dn("CN=G2,DC=x").unwrap();
    let members = store.all_members(g1.tag);
    assert!(members.len() <= 2);
    assert!(members.contains(&g2.tag));
    assert!(store.has_member(g1.tag, g1.tag));

    // HasMember must agree with AllMembers for every pair.
    for g in [g1.tag, g2.tag] {
        let all = store.all_members(g);
        for x in [g1.tag, g2.tag] {
            assert_eq!(store.has_member(g, x), all.contains(&x));
        }
    }
}

#[test]
fn full_sweep_cycle_matches_a_reconnect() {
    let store = test_store();
    bulk(&store, &user(1, "CN=Stays,DC=x"));
    bulk(&store, &user(2, "CN=Goes,DC=x"));
    notify(&store, &user(3, "CN=Streamed,DC=x"));

    store.mark_all_detecting();
    bulk(&store, &user(1, "CN=Stays,DC=x"));
    let deleted = store.delete_undetected();

    assert_eq!(deleted, 1);
    assert!(store.lookup_by_dn("CN=Stays,DC=x").is_some());
    assert!(store.lookup_by_dn("CN=Goes,DC=x").is_none());
    assert!(
        store.lookup_by_dn("CN=Streamed,DC=x").is_some(),
        "change-notified entities survive the sweep"
    );
    store.verify_consistency().unwrap();
}
