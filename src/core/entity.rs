//! Layer 3: The Entity
//!
//! One directory object as mirrored in memory: identity, security
//! attributes, mail surface, timestamps, link scratch fields, and the
//! schema-agnostic attribute tail.
//!
//! `ParsedEntity` is the tag-less product of parsing a raw record;
//! `Entity` is what lives in the tag table. Backlink sets (`manages`,
//! `direct_member_ofs`) are derived from *other* entities and are only
//! ever mutated by the store's single writer.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;

use super::domain::{EntityStatus, GroupType, ObjectClass, SamAccountType, UserAccountControl};
use super::error::{CoreError, ParseError};
use super::identity::{Dn, ObjectGuid, Sid, Tag};
use super::time::{parse_filetime_text, parse_generalized_time, DirTimestamp};
use crate::directory::RawObject;

/// Forward/backward link fields.
///
/// `manager`/`direct_members` are forward links owned by this record;
/// `manages`/`direct_member_ofs` are backlinks derived from other
/// entities and must survive re-ingestion of this one. The deferred
/// fields hold DNs whose target has not been ingested yet.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Links {
    pub manager: Option<Tag>,
    pub manager_deferred_dn: Option<Dn>,
    pub manages: BTreeSet<Tag>,
    pub direct_members: BTreeSet<Tag>,
    pub member_deferred_dns: Vec<Dn>,
    pub direct_member_ofs: BTreeSet<Tag>,
}

impl Links {
    pub fn has_deferred(&self) -> bool {
        self.manager_deferred_dn.is_some() || !self.member_deferred_dns.is_empty()
    }
}

/// One mirrored directory object.
#[derive(Clone, Debug, PartialEq)]
pub struct Entity {
    /// Table index; immutable for the life of the process.
    pub tag: Tag,
    pub dn: Dn,
    pub guid: ObjectGuid,
    pub class: ObjectClass,

    pub sid: Option<Sid>,
    pub sid_history: BTreeSet<Sid>,
    pub sam_account_name: Option<String>,
    pub user_principal_name: Option<String>,
    /// May be inherited from the store default when the record omits it.
    pub domain_flat_name: Option<String>,
    pub sam_account_type: Option<SamAccountType>,
    pub user_account_control: Option<UserAccountControl>,
    pub group_type: Option<GroupType>,

    pub when_created: DirTimestamp,
    pub password_last_set: DirTimestamp,
    pub last_logon_timestamp: DirTimestamp,
    pub account_expires: DirTimestamp,
    pub logon_count: Option<u32>,

    pub email: Option<String>,
    pub email_aliases: BTreeSet<String>,
    pub target_email: Option<String>,
    pub mailbox_guid: Option<ObjectGuid>,
    pub hide_from_address_book: bool,
    pub sip_address: Option<String>,

    /// RID of the group this entity treats as primary.
    pub primary_group_id: Option<u32>,
    /// RID this entity carries when it IS a group.
    pub primary_group_token: Option<u32>,

    pub links: Links,

    pub other_text: BTreeMap<String, Vec<String>>,
    pub other_binary: BTreeMap<String, Vec<Bytes>>,

    pub status: EntityStatus,
    /// True if the latest write came via change notification.
    pub is_change_notified: bool,
}

impl Entity {
    pub fn from_parsed(tag: Tag, parsed: ParsedEntity) -> Self {
        Self {
            tag,
            dn: parsed.dn,
            guid: parsed.guid,
            class: parsed.class,
            sid: parsed.sid,
            sid_history: parsed.sid_history,
            sam_account_name: parsed.sam_account_name,
            user_principal_name: parsed.user_principal_name,
            domain_flat_name: parsed.domain_flat_name,
            sam_account_type: parsed.sam_account_type,
            user_account_control: parsed.user_account_control,
            group_type: parsed.group_type,
            when_created: parsed.when_created,
            password_last_set: parsed.password_last_set,
            last_logon_timestamp: parsed.last_logon_timestamp,
            account_expires: parsed.account_expires,
            logon_count: parsed.logon_count,
            email: parsed.email,
            email_aliases: parsed.email_aliases,
            target_email: parsed.target_email,
            mailbox_guid: parsed.mailbox_guid,
            hide_from_address_book: parsed.hide_from_address_book,
            sip_address: parsed.sip_address,
            primary_group_id: parsed.primary_group_id,
            primary_group_token: parsed.primary_group_token,
            links: Links {
                manager: None,
                manager_deferred_dn: parsed.manager_dn,
                manages: BTreeSet::new(),
                direct_members: BTreeSet::new(),
                member_deferred_dns: parsed.member_dns,
                direct_member_ofs: BTreeSet::new(),
            },
            other_text: parsed.other_text,
            other_binary: parsed.other_binary,
            status: EntityStatus::Exists,
            is_change_notified: false,
        }
    }

    pub fn is_group(&self) -> bool {
        self.class.is_group()
    }

    pub fn is_foreign(&self) -> bool {
        self.class.is_foreign_security_principal()
    }

    pub fn mailbox_enabled(&self) -> bool {
        self.mailbox_guid.is_some()
    }

    pub fn is_disabled(&self) -> bool {
        self.user_account_control
            .is_some_and(UserAccountControl::is_disabled)
    }

    /// Whether email/alias keys for this entity belong in the email index.
    pub fn email_indexable(&self) -> bool {
        self.mailbox_enabled() && !self.is_disabled()
    }

    /// The token other entities point at via primaryGroupId.
    ///
    /// Falls back to the RID of the group's own SID when the constructed
    /// attribute was not returned.
    pub fn effective_primary_group_token(&self) -> Option<u32> {
        if !self.is_group() {
            return self.primary_group_token;
        }
        self.primary_group_token
            .or_else(|| self.sid.as_ref().and_then(Sid::rid))
    }
}

/// Attributes consumed by named entity fields; everything else goes to
/// the schema-agnostic tail.
const CONSUMED_ATTRIBUTES: &[&str] = &[
    "objectclass",
    "objectguid",
    "objectsid",
    "sidhistory",
    "samaccountname",
    "samaccounttype",
    "userprincipalname",
    "flatname",
    "useraccountcontrol",
    "grouptype",
    "pwdlastset",
    "lastlogontimestamp",
    "logoncount",
    "accountexpires",
    "mail",
    "proxyaddresses",
    "targetaddress",
    "msexchmailboxguid",
    "msexchhidefromaddresslists",
    "msrtcsip-primaryuseraddress",
    "whencreated",
    "primarygrouptoken",
    "primarygroupid",
    "manager",
    "member",
    "isdeleted",
];

/// The tag-less result of parsing one raw record.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedEntity {
    pub dn: Dn,
    pub guid: ObjectGuid,
    pub class: ObjectClass,
    pub sid: Option<Sid>,
    pub sid_history: BTreeSet<Sid>,
    pub sam_account_name: Option<String>,
    pub user_principal_name: Option<String>,
    pub domain_flat_name: Option<String>,
    pub sam_account_type: Option<SamAccountType>,
    pub user_account_control: Option<UserAccountControl>,
    pub group_type: Option<GroupType>,
    pub when_created: DirTimestamp,
    pub password_last_set: DirTimestamp,
    pub last_logon_timestamp: DirTimestamp,
    pub account_expires: DirTimestamp,
    pub logon_count: Option<u32>,
    pub email: Option<String>,
    pub email_aliases: BTreeSet<String>,
    pub target_email: Option<String>,
    pub mailbox_guid: Option<ObjectGuid>,
    pub hide_from_address_book: bool,
    pub sip_address: Option<String>,
    pub primary_group_id: Option<u32>,
    pub primary_group_token: Option<u32>,
    pub manager_dn: Option<Dn>,
    pub member_dns: Vec<Dn>,
    pub other_text: BTreeMap<String, Vec<String>>,
    pub other_binary: BTreeMap<String, Vec<Bytes>>,
}

impl ParsedEntity {
    /// Parse a raw record into a candidate entity.
    ///
    /// Returns `Ok(None)` when the record carries no objectGUID; such
    /// records are dropped silently per the ingestion protocol.
    pub fn from_raw(raw: &RawObject) -> Result<Option<Self>, CoreError> {
        let guid = match guid_of_record(raw)? {
            Some(guid) => guid,
            None => return Ok(None),
        };
        let dn = Dn::parse(raw.dn.clone())?;
        let class = ObjectClass::from_hierarchy(raw.texts("objectclass"));

        let sid = match raw.first_binary("objectsid") {
            Some(bytes) => Some(Sid::from_ad_bytes(bytes)?),
            None => match raw.first_text("objectsid") {
                Some(text) => Some(Sid::parse(text)?),
                None => None,
            },
        };
        let mut sid_history = BTreeSet::new();
        for value in raw.values("sidhistory") {
            let sid = match value.as_binary() {
                Some(bytes) => Sid::from_ad_bytes(bytes)?,
                None => Sid::parse(value.as_text().unwrap_or_default())?,
            };
            sid_history.insert(sid);
        }

        let sam_account_type = read_u32(raw, "samaccounttype")?.map(SamAccountType::from_raw);
        let user_account_control =
            read_u32(raw, "useraccountcontrol")?.map(UserAccountControl::from_raw);
        let group_type = read_u32(raw, "grouptype")?.map(GroupType::from_raw);

        let when_created = match raw.first_text("whencreated") {
            Some(text) => parse_generalized_time("whenCreated", text)?,
            None => DirTimestamp::NEVER,
        };
        let password_last_set = read_filetime(raw, "pwdlastset", "pwdLastSet")?;
        let last_logon_timestamp = read_filetime(raw, "lastlogontimestamp", "lastLogonTimeStamp")?;
        let account_expires = read_filetime(raw, "accountexpires", "accountExpires")?;
        let logon_count = read_u32(raw, "logoncount")?;

        let (email, email_aliases) = read_addresses(raw);
        let target_email = raw
            .first_text("targetaddress")
            .map(strip_smtp_prefix)
            .map(str::to_string);
        let mailbox_guid = match raw.first_binary("msexchmailboxguid") {
            Some(bytes) => Some(ObjectGuid::from_ad_bytes(bytes)?),
            None => match raw.first_text("msexchmailboxguid") {
                Some(text) => Some(ObjectGuid::parse(text)?),
                None => None,
            },
        };
        let hide_from_address_book = raw
            .first_text("msexchhidefromaddresslists")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        let mut primary_group_token = read_u32(raw, "primarygrouptoken")?;
        if primary_group_token.is_none() && class.is_group() {
            primary_group_token = sid.as_ref().and_then(Sid::rid);
        }

        let manager_dn = match raw.first_text("manager") {
            Some(text) => Some(Dn::parse(text)?),
            None => None,
        };
        let mut member_dns = Vec::new();
        for text in raw.texts("member") {
            member_dns.push(Dn::parse(text)?);
        }

        let mut other_text: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut other_binary: BTreeMap<String, Vec<Bytes>> = BTreeMap::new();
        for (name, values) in raw.iter() {
            if CONSUMED_ATTRIBUTES.contains(&name) {
                continue;
            }
            for value in values {
                match value {
                    crate::directory::AttrValue::Text(text) => other_text
                        .entry(name.to_string())
                        .or_default()
                        .push(text.clone()),
                    crate::directory::AttrValue::Binary(bytes) => other_binary
                        .entry(name.to_string())
                        .or_default()
                        .push(bytes.clone()),
                }
            }
        }

        Ok(Some(Self {
            dn,
            guid,
            class,
            sid,
            sid_history,
            sam_account_name: raw.first_text("samaccountname").map(str::to_string),
            user_principal_name: raw.first_text("userprincipalname").map(str::to_string),
            domain_flat_name: raw.first_text("flatname").map(str::to_string),
            sam_account_type,
            user_account_control,
            group_type,
            when_created,
            password_last_set,
            last_logon_timestamp,
            account_expires,
            logon_count,
            email,
            email_aliases,
            target_email,
            mailbox_guid,
            hide_from_address_book,
            sip_address: raw
                .first_text("msrtcsip-primaryuseraddress")
                .map(str::to_string),
            primary_group_id: read_u32(raw, "primarygroupid")?,
            primary_group_token,
            manager_dn,
            member_dns,
            other_text,
            other_binary,
        }))
    }
}

/// The GUID of a raw record, if it carries a usable one.
///
/// Delete notices are matched by GUID alone, so this is also the probe
/// the store uses before full parsing.
pub(crate) fn guid_of_record(raw: &RawObject) -> Result<Option<ObjectGuid>, CoreError> {
    if let Some(bytes) = raw.first_binary("objectguid") {
        if bytes.is_empty() {
            return Ok(None);
        }
        return ObjectGuid::from_ad_bytes(bytes).map(Some);
    }
    match raw.first_text("objectguid") {
        Some(text) if !text.trim().is_empty() => {
            let guid = ObjectGuid::parse(text)?;
            if guid.is_nil() {
                Ok(None)
            } else {
                Ok(Some(guid))
            }
        }
        _ => Ok(None),
    }
}

/// Numeric attributes arrive as text; groupType is signed on the wire, so
/// parse through i64 and keep the low 32 bits.
fn read_u32(raw: &RawObject, attr: &str) -> Result<Option<u32>, CoreError> {
    match raw.first_text(attr) {
        None => Ok(None),
        Some(text) => {
            let value: i64 = text.trim().parse().map_err(|_| ParseError::Attribute {
                attr: attr.to_string(),
                reason: format!("`{text}` is not an integer"),
            })?;
            Ok(Some(value as u32))
        }
    }
}

fn read_filetime(
    raw: &RawObject,
    attr: &str,
    display: &'static str,
) -> Result<DirTimestamp, CoreError> {
    match raw.first_text(attr) {
        Some(text) => parse_filetime_text(display, text),
        None => Ok(DirTimestamp::NEVER),
    }
}

fn strip_smtp_prefix(addr: &str) -> &str {
    addr.strip_prefix("SMTP:")
        .or_else(|| addr.strip_prefix("smtp:"))
        .unwrap_or(addr)
}

/// Primary address and aliases.
///
/// `mail` wins as primary; otherwise the `SMTP:` (uppercase) proxy
/// address does. Every other smtp proxy is an alias.
fn read_addresses(raw: &RawObject) -> (Option<String>, BTreeSet<String>) {
    let mut primary = raw.first_text("mail").map(str::to_string);
    let mut aliases = BTreeSet::new();

    for proxy in raw.texts("proxyaddresses") {
        if let Some(addr) = proxy.strip_prefix("SMTP:") {
            if primary.is_none() {
                primary = Some(addr.to_string());
            } else if primary.as_deref() != Some(addr) {
                aliases.insert(addr.to_string());
            }
        } else if let Some(addr) = proxy.strip_prefix("smtp:") {
            aliases.insert(addr.to_string());
        }
    }

    if let Some(p) = &primary {
        aliases.remove(p);
    }
    (primary, aliases)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::AttrValue;

    fn guid_bytes(seed: u8) -> Vec<u8> {
        vec![seed; 16]
    }

    fn sid_bytes(rid: u32) -> Vec<u8> {
        let mut bytes = vec![1u8, 3, 0, 0, 0, 0, 0, 5];
        for sub in [21u32, 9, rid] {
            bytes.extend_from_slice(&sub.to_le_bytes());
        }
        bytes
    }

    fn user_record() -> RawObject {
        let mut raw = RawObject::new("CN=Alice,OU=People,DC=corp,DC=example");
        for class in ["top", "person", "organizationalPerson", "user"] {
            raw.push("objectClass", AttrValue::text(class));
        }
        raw.push("objectGuid", AttrValue::binary(guid_bytes(7)));
        raw.push("objectSid", AttrValue::binary(sid_bytes(1104)));
        raw.push("sAMAccountName", AttrValue::text("alice"));
        raw.push("sAMAccountType", AttrValue::text("805306368"));
        raw.push("userPrincipalName", AttrValue::text("alice@corp.example"));
        raw.push("userAccountControl", AttrValue::text("512"));
        raw.push("primaryGroupID", AttrValue::text("513"));
        raw.push("pwdlastset", AttrValue::text("132230688000000000"));
        raw.push("whenCreated", AttrValue::text("20200102030405.0Z"));
        raw.push("manager", AttrValue::text("CN=Boss,OU=People,DC=corp,DC=example"));
        raw.push("mail", AttrValue::text("alice@corp.example"));
        raw.push("proxyAddresses", AttrValue::text("SMTP:alice@corp.example"));
        raw.push("proxyAddresses", AttrValue::text("smtp:al@corp.example"));
        raw.push("msExchMailboxGuid", AttrValue::binary(guid_bytes(9)));
        raw.push("displayName", AttrValue::text("Alice A."));
        raw
    }

    #[test]
    fn parses_user_record() {
        let parsed = ParsedEntity::from_raw(&user_record()).unwrap().unwrap();
        assert_eq!(parsed.class.as_str(), "top.person.organizationalPerson.user");
        assert_eq!(parsed.sam_account_name.as_deref(), Some("alice"));
        assert_eq!(parsed.sam_account_type, Some(SamAccountType::UserObject));
        assert_eq!(parsed.primary_group_id, Some(513));
        assert_eq!(parsed.sid.as_ref().unwrap().rid(), Some(1104));
        assert_eq!(
            parsed.manager_dn.as_ref().map(Dn::as_str),
            Some("CN=Boss,OU=People,DC=corp,DC=example")
        );
        assert_eq!(parsed.email.as_deref(), Some("alice@corp.example"));
        assert_eq!(
            parsed.email_aliases.iter().collect::<Vec<_>>(),
            vec!["al@corp.example"]
        );
        assert!(parsed.mailbox_guid.is_some());
        assert!(!parsed.when_created.is_never());
        // Unconsumed attribute landed in the tail.
        assert_eq!(parsed.other_text["displayname"], vec!["Alice A."]);
    }

    #[test]
    fn entity_from_parsed_wires_deferred_links() {
        let parsed = ParsedEntity::from_raw(&user_record()).unwrap().unwrap();
        let entity = Entity::from_parsed(Tag::from_index(0), parsed);
        assert!(entity.links.manager.is_none());
        assert!(entity.links.manager_deferred_dn.is_some());
        assert!(entity.links.has_deferred());
        assert!(entity.email_indexable());
        assert_eq!(entity.status, EntityStatus::Exists);
    }

    #[test]
    fn record_without_guid_is_dropped() {
        let mut raw = RawObject::new("CN=NoGuid,DC=x");
        raw.push("objectClass", AttrValue::text("top"));
        assert!(ParsedEntity::from_raw(&raw).unwrap().is_none());

        let mut raw = RawObject::new("CN=EmptyGuid,DC=x");
        raw.push("objectGuid", AttrValue::binary(Vec::new()));
        assert!(ParsedEntity::from_raw(&raw).unwrap().is_none());
    }

    #[test]
    fn malformed_numeric_attribute_is_a_parse_error() {
        let mut raw = user_record();
        raw.set("userAccountControl", vec![AttrValue::text("not-a-number")]);
        let err = ParsedEntity::from_raw(&raw).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Parse(ParseError::Attribute { .. })
        ));
    }

    #[test]
    fn negative_group_type_keeps_bits() {
        let mut raw = RawObject::new("CN=G,DC=x");
        raw.push("objectGuid", AttrValue::binary(guid_bytes(3)));
        raw.push("objectClass", AttrValue::text("top"));
        raw.push("objectClass", AttrValue::text("group"));
        raw.push("groupType", AttrValue::text("-2147483646"));
        let parsed = ParsedEntity::from_raw(&raw).unwrap().unwrap();
        let gt = parsed.group_type.unwrap();
        assert!(gt.is_security_group());
        assert!(gt.is_global());
    }

    #[test]
    fn group_token_falls_back_to_sid_rid() {
        let mut raw = RawObject::new("CN=Ops,OU=Groups,DC=corp,DC=example");
        raw.push("objectClass", AttrValue::text("top"));
        raw.push("objectClass", AttrValue::text("group"));
        raw.push("objectGuid", AttrValue::binary(guid_bytes(4)));
        raw.push("objectSid", AttrValue::binary(sid_bytes(9001)));
        let parsed = ParsedEntity::from_raw(&raw).unwrap().unwrap();
        assert_eq!(parsed.primary_group_token, Some(9001));
    }

    #[test]
    fn disabled_mailbox_is_not_email_indexable() {
        let mut raw = user_record();
        raw.set("userAccountControl", vec![AttrValue::text("514")]);
        let parsed = ParsedEntity::from_raw(&raw).unwrap().unwrap();
        let entity = Entity::from_parsed(Tag::from_index(1), parsed);
        assert!(entity.mailbox_enabled());
        assert!(entity.is_disabled());
        assert!(!entity.email_indexable());
    }

    #[test]
    fn primary_from_proxy_when_mail_absent() {
        let mut raw = RawObject::new("CN=B,DC=x");
        raw.push("objectGuid", AttrValue::binary(guid_bytes(5)));
        raw.push("objectClass", AttrValue::text("top"));
        raw.push("proxyAddresses", AttrValue::text("SMTP:b@corp.example"));
        raw.push("proxyAddresses", AttrValue::text("smtp:b2@corp.example"));
        let parsed = ParsedEntity::from_raw(&raw).unwrap().unwrap();
        assert_eq!(parsed.email.as_deref(), Some("b@corp.example"));
        assert_eq!(
            parsed.email_aliases.iter().collect::<Vec<_>>(),
            vec!["b2@corp.example"]
        );
    }
}
