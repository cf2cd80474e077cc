//! Layer 2: Domain enums and bit carriers
//!
//! ObjectClass: dot-joined class path with category probes
//! SamAccountType: closed enum over the documented values
//! UserAccountControl / GroupType: raw bit carriers with named accessors
//! EntityStatus: bulk-load sweep lifecycle
//! RecordSource: which feed produced a record

use serde::{Deserialize, Serialize};

/// Dot-joined object class path, e.g. `top.group` or
/// `top.person.organizationalPerson.user`.
///
/// The directory returns objectClass multi-valued in hierarchy order; we
/// keep the joined path and probe the most-derived component.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectClass(String);

impl ObjectClass {
    pub fn from_hierarchy<'a>(classes: impl IntoIterator<Item = &'a str>) -> Self {
        let mut path = String::new();
        for class in classes {
            if !path.is_empty() {
                path.push('.');
            }
            path.push_str(class);
        }
        Self(path)
    }

    pub fn from_path(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn leaf(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or("")
    }

    pub fn is_group(&self) -> bool {
        self.leaf().eq_ignore_ascii_case("group")
    }

    pub fn is_user(&self) -> bool {
        self.leaf().eq_ignore_ascii_case("user")
    }

    pub fn is_computer(&self) -> bool {
        self.leaf().eq_ignore_ascii_case("computer")
    }

    pub fn is_foreign_security_principal(&self) -> bool {
        self.leaf().eq_ignore_ascii_case("foreignSecurityPrincipal")
    }

    pub fn is_container(&self) -> bool {
        let leaf = self.leaf();
        leaf.eq_ignore_ascii_case("organizationalUnit") || leaf.eq_ignore_ascii_case("container")
    }
}

impl std::fmt::Debug for ObjectClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectClass({})", self.0)
    }
}

impl std::fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// sAMAccountType values as published by the directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamAccountType {
    DomainObject,
    GroupObject,
    NonSecurityGroupObject,
    AliasObject,
    NonSecurityAliasObject,
    UserObject,
    MachineAccount,
    TrustAccount,
    AppBasicGroup,
    AppQueryGroup,
    Unknown(u32),
}

impl SamAccountType {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0x0000_0000 => Self::DomainObject,
            0x1000_0000 => Self::GroupObject,
            0x1000_0001 => Self::NonSecurityGroupObject,
            0x2000_0000 => Self::AliasObject,
            0x2000_0001 => Self::NonSecurityAliasObject,
            0x3000_0000 => Self::UserObject,
            0x3000_0001 => Self::MachineAccount,
            0x3000_0002 => Self::TrustAccount,
            0x4000_0000 => Self::AppBasicGroup,
            0x4000_0001 => Self::AppQueryGroup,
            other => Self::Unknown(other),
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            Self::DomainObject => 0x0000_0000,
            Self::GroupObject => 0x1000_0000,
            Self::NonSecurityGroupObject => 0x1000_0001,
            Self::AliasObject => 0x2000_0000,
            Self::NonSecurityAliasObject => 0x2000_0001,
            Self::UserObject => 0x3000_0000,
            Self::MachineAccount => 0x3000_0001,
            Self::TrustAccount => 0x3000_0002,
            Self::AppBasicGroup => 0x4000_0000,
            Self::AppQueryGroup => 0x4000_0001,
            Self::Unknown(raw) => raw,
        }
    }
}

/// userAccountControl bit carrier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserAccountControl(u32);

impl UserAccountControl {
    pub const ACCOUNT_DISABLED: u32 = 0x0002;
    pub const NORMAL_ACCOUNT: u32 = 0x0200;
    pub const WORKSTATION_TRUST_ACCOUNT: u32 = 0x1000;
    pub const DONT_EXPIRE_PASSWORD: u32 = 0x1_0000;
    pub const PASSWORD_EXPIRED: u32 = 0x80_0000;

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn is_disabled(self) -> bool {
        self.0 & Self::ACCOUNT_DISABLED != 0
    }

    pub fn is_normal_account(self) -> bool {
        self.0 & Self::NORMAL_ACCOUNT != 0
    }

    pub fn password_never_expires(self) -> bool {
        self.0 & Self::DONT_EXPIRE_PASSWORD != 0
    }

    pub fn password_expired(self) -> bool {
        self.0 & Self::PASSWORD_EXPIRED != 0
    }
}

/// groupType bit carrier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupType(u32);

impl GroupType {
    pub const GLOBAL_SCOPE: u32 = 0x0002;
    pub const DOMAIN_LOCAL_SCOPE: u32 = 0x0004;
    pub const UNIVERSAL_SCOPE: u32 = 0x0008;
    pub const SECURITY_ENABLED: u32 = 0x8000_0000;

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn is_security_group(self) -> bool {
        self.0 & Self::SECURITY_ENABLED != 0
    }

    pub fn is_global(self) -> bool {
        self.0 & Self::GLOBAL_SCOPE != 0
    }

    pub fn is_domain_local(self) -> bool {
        self.0 & Self::DOMAIN_LOCAL_SCOPE != 0
    }

    pub fn is_universal(self) -> bool {
        self.0 & Self::UNIVERSAL_SCOPE != 0
    }
}

/// Bulk-load sweep lifecycle.
///
/// `Detecting` is transient: set on every live entity when a full load
/// begins, flipped back to `Exists` by observation, and any entity still
/// `Detecting` after the load is deleted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Exists,
    Detecting,
    Deleted,
}

impl EntityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exists => "exists",
            Self::Detecting => "detecting",
            Self::Deleted => "deleted",
        }
    }
}

/// Which feed produced a record.
///
/// Change-notify writes take priority: a change-notified entity is never
/// overwritten by a bulk-load replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    BulkLoad,
    ChangeNotify,
}

impl RecordSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BulkLoad => "bulk_load",
            Self::ChangeNotify => "change_notify",
        }
    }
}
