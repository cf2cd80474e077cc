//! Opaque directory-client surface.
//!
//! The core treats LDAP as a stream of raw attribute records; the client
//! mechanics (connections, controls, cookies) live behind these traits.
//! A scripted in-memory implementation backs the tests.

pub mod range;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::error::{Effect, Transience};

/// The attribute set the mirror requests by default.
///
/// Ingestion tolerates records missing any of these.
pub const DEFAULT_ATTRIBUTES: &[&str] = &[
    "objectClass",
    "userPrincipalName",
    "servicePrincipalName",
    "objectGuid",
    "objectSid",
    "sidhistory",
    "sAMAccountName",
    "sAMAccountType",
    "flatName",
    "userAccountControl",
    "groupType",
    "pwdlastset",
    "lastlogontimestamp",
    "logonCount",
    "accountExpires",
    "msDS-AllowedToDelegateTo",
    "telephoneNumber",
    "facsimileTelephoneNumber",
    "mobile",
    "mail",
    "proxyAddresses",
    "targetAddress",
    "msExchMailboxGuid",
    "msExchHideFromAddressLists",
    "msRTCSIP-PrimaryUserAddress",
    "msRTCSIP-UserEnabled",
    "co",
    "l",
    "st",
    "streetAddress",
    "postalCode",
    "company",
    "department",
    "physicalDeliveryOfficeName",
    "displayName",
    "title",
    "givenName",
    "sn",
    "name",
    "personalTitle",
    "thumbnailPhoto",
    "employeeType",
    "employeeID",
    "manager",
    "member",
    "userWorkstations",
    "description",
    "whenCreated",
    "primaryGroupToken",
    "primaryGroupID",
];

/// Which attributes the feeds ask the server for.
///
/// `load_all` requests everything (the schema-agnostic tail then holds
/// whatever comes back); otherwise the default set plus any configured
/// extras is requested explicitly.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttributeSelection {
    pub load_all: bool,
    pub extra: Vec<String>,
}

impl AttributeSelection {
    /// The explicit request list, or `None` for "all attributes".
    pub fn requested(&self) -> Option<Vec<String>> {
        if self.load_all {
            return None;
        }
        let mut out: Vec<String> = DEFAULT_ATTRIBUTES.iter().map(|s| s.to_string()).collect();
        for extra in &self.extra {
            if !out.iter().any(|have| have.eq_ignore_ascii_case(extra)) {
                out.push(extra.clone());
            }
        }
        Some(out)
    }
}

/// One attribute value as delivered on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttrValue {
    Text(String),
    Binary(Bytes),
}

impl AttrValue {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn binary(b: impl Into<Bytes>) -> Self {
        Self::Binary(b.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Binary(_) => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(b) => Some(b.as_ref()),
            Self::Text(_) => None,
        }
    }
}

/// A raw directory record: a DN plus its attribute multimap.
///
/// Attribute names are folded to lowercase on insert so lookups are
/// case-insensitive regardless of what the server returned.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawObject {
    pub dn: String,
    attrs: BTreeMap<String, Vec<AttrValue>>,
}

impl RawObject {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, name: &str, value: AttrValue) {
        self.attrs.entry(name.to_lowercase()).or_default().push(value);
    }

    pub fn set(&mut self, name: &str, values: Vec<AttrValue>) {
        self.attrs.insert(name.to_lowercase(), values);
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<AttrValue>> {
        self.attrs.remove(&name.to_lowercase())
    }

    pub fn values(&self, name: &str) -> &[AttrValue] {
        self.attrs
            .get(&name.to_lowercase())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn first_text(&self, name: &str) -> Option<&str> {
        self.values(name).iter().find_map(AttrValue::as_text)
    }

    pub fn first_binary(&self, name: &str) -> Option<&[u8]> {
        self.values(name).iter().find_map(AttrValue::as_binary)
    }

    pub fn texts(&self, name: &str) -> impl Iterator<Item = &str> {
        self.values(name).iter().filter_map(AttrValue::as_text)
    }

    pub fn attr_names(&self) -> impl Iterator<Item = &str> {
        self.attrs.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[AttrValue])> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// True for a change-notification tombstone.
    pub fn is_delete_notice(&self) -> bool {
        self.first_text("isdeleted")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

/// Result of the lightweight availability probe against a DC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapInfo {
    /// Flat NetBIOS name for the domain.
    pub flat_name: String,
}

/// One subnet→site mapping from the configuration partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubnetSite {
    pub network: Ipv4Addr,
    pub prefix_len: u8,
    pub site: String,
}

impl SubnetSite {
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        if self.prefix_len == 0 {
            return true;
        }
        if self.prefix_len > 32 {
            return false;
        }
        let mask = u32::MAX << (32 - u32::from(self.prefix_len));
        (u32::from(addr) & mask) == (u32::from(self.network) & mask)
    }
}

/// Site topology loaded at startup from the configuration partition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SiteTopology {
    pub subnets: Vec<SubnetSite>,
    pub site_servers: BTreeMap<String, Vec<String>>,
}

impl SiteTopology {
    /// Site of an address, longest prefix wins.
    pub fn site_of(&self, addr: Ipv4Addr) -> Option<&str> {
        self.subnets
            .iter()
            .filter(|s| s.contains(addr))
            .max_by_key(|s| s.prefix_len)
            .map(|s| s.site.as_str())
    }

    pub fn servers_in(&self, site: &str) -> &[String] {
        self.site_servers
            .get(site)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

/// A chunk of a range-retrieved attribute.
#[derive(Clone, Debug)]
pub struct RangedChunk {
    pub values: Vec<AttrValue>,
    /// Index of the last value in this chunk; `None` means final chunk.
    pub end: Option<u32>,
}

/// Feed faults, split by whether a DC switch can help.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum FeedError {
    /// Network error or server disconnect; the watchdog recovers by
    /// switching DC.
    #[error("transient directory fault: {reason}")]
    Transient { reason: String },
    /// Authentication failure or permanent configuration error; surfaced
    /// up, the pipeline halts.
    #[error("fatal directory fault: {reason}")]
    Fatal { reason: String },
}

impl FeedError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    pub fn transience(&self) -> Transience {
        match self {
            Self::Transient { .. } => Transience::Retryable,
            Self::Fatal { .. } => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}

/// A paged enumeration of the full tree.
///
/// `next_page` issues the next server request only when called, so the
/// feed naturally paces requests by queue backpressure.
pub trait BulkPages: Send {
    fn next_page(&mut self) -> Result<Option<Vec<RawObject>>, FeedError>;
}

/// An open-ended change-notification stream.
pub trait ChangeStream: Send {
    /// Block up to `timeout` for the next change. `Ok(None)` means the
    /// timeout elapsed with no change; the caller decides whether to
    /// re-arm or bail.
    fn next_change(&mut self, timeout: Duration) -> Result<Option<RawObject>, FeedError>;
}

/// One connected directory client, bound to a specific DC.
pub trait DirectoryClient: Send + Sync {
    /// Lightweight availability probe: fetch the domain flat name.
    fn bootstrap(&self, timeout: Duration) -> Result<BootstrapInfo, FeedError>;

    /// Load the subnet→site map and site→DC lists from the configuration
    /// partition.
    fn load_topology(&self) -> Result<SiteTopology, FeedError>;

    fn open_bulk(
        &self,
        page_size: u32,
        attrs: &AttributeSelection,
    ) -> Result<Box<dyn BulkPages>, FeedError>;

    fn open_notify(&self, attrs: &AttributeSelection) -> Result<Box<dyn ChangeStream>, FeedError>;

    /// Fetch the next chunk of a range-retrieved attribute, starting at
    /// value index `start`.
    fn fetch_ranged(&self, dn: &str, attr: &str, start: u32) -> Result<RangedChunk, FeedError>;
}

/// Connection factory: one client per DC host.
pub trait DirectoryConnector: Send + Sync {
    fn connect(&self, host: &str) -> Result<std::sync::Arc<dyn DirectoryClient>, FeedError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_object_folds_attribute_case() {
        let mut obj = RawObject::new("CN=A,DC=x");
        obj.push("sAMAccountName", AttrValue::text("alice"));
        assert_eq!(obj.first_text("samaccountname"), Some("alice"));
        assert_eq!(obj.first_text("SAMACCOUNTNAME"), Some("alice"));
        assert!(obj.first_binary("samaccountname").is_none());
    }

    #[test]
    fn delete_notice_detection() {
        let mut obj = RawObject::new("CN=A,DC=x");
        assert!(!obj.is_delete_notice());
        obj.push("isDeleted", AttrValue::text("TRUE"));
        assert!(obj.is_delete_notice());
    }

    #[test]
    fn attribute_selection_requests_defaults_plus_extras() {
        let selection = AttributeSelection {
            load_all: false,
            extra: vec!["carLicense".into(), "MAIL".into()],
        };
        let requested = selection.requested().unwrap();
        assert!(requested.iter().any(|a| a == "objectGuid"));
        assert!(requested.iter().any(|a| a == "carLicense"));
        // Case-insensitive dedup against the default set.
        assert_eq!(requested.iter().filter(|a| a.eq_ignore_ascii_case("mail")).count(), 1);

        let all = AttributeSelection {
            load_all: true,
            extra: Vec::new(),
        };
        assert!(all.requested().is_none());
    }

    #[test]
    fn subnet_longest_prefix_wins() {
        let topo = SiteTopology {
            subnets: vec![
                SubnetSite {
                    network: Ipv4Addr::new(10, 0, 0, 0),
                    prefix_len: 8,
                    site: "hq".into(),
                },
                SubnetSite {
                    network: Ipv4Addr::new(10, 1, 0, 0),
                    prefix_len: 16,
                    site: "branch".into(),
                },
            ],
            site_servers: BTreeMap::new(),
        };
        assert_eq!(topo.site_of(Ipv4Addr::new(10, 1, 2, 3)), Some("branch"));
        assert_eq!(topo.site_of(Ipv4Addr::new(10, 9, 2, 3)), Some("hq"));
        assert_eq!(topo.site_of(Ipv4Addr::new(192, 168, 0, 1)), None);
    }

    #[test]
    fn subnet_mask_edges() {
        let all = SubnetSite {
            network: Ipv4Addr::new(0, 0, 0, 0),
            prefix_len: 0,
            site: "any".into(),
        };
        assert!(all.contains(Ipv4Addr::new(1, 2, 3, 4)));
        let host = SubnetSite {
            network: Ipv4Addr::new(10, 0, 0, 7),
            prefix_len: 32,
            site: "one".into(),
        };
        assert!(host.contains(Ipv4Addr::new(10, 0, 0, 7)));
        assert!(!host.contains(Ipv4Addr::new(10, 0, 0, 8)));
    }
}
