//! The directory store core, layered bottom-up:
//!
//! time/identity atoms → domain enums → entity → tag table → indexes →
//! deferred references → transitive engine → store.

pub mod deferred;
pub mod domain;
pub mod entity;
pub mod error;
pub mod identity;
pub mod indexes;
pub mod store;
pub mod tag_table;
pub mod time;
pub mod transitive;

pub use deferred::{DeferredKind, DeferredReference, DeferredRegistry};
pub use domain::{
    EntityStatus, GroupType, ObjectClass, RecordSource, SamAccountType, UserAccountControl,
};
pub use entity::{Entity, Links, ParsedEntity};
pub use error::{ConsistencyError, CoreError, ParseError};
pub use identity::{Dn, DnKey, EmailKey, ObjectGuid, SamKey, Sid, Tag, UpnKey};
pub use indexes::{IndexConflict, IndexKind, Indexes, MemberSet};
pub use store::{ApplyOutcome, Store};
pub use tag_table::TagTable;
pub use time::{parse_filetime_text, parse_generalized_time, DirTimestamp};
pub use transitive::GraphView;
