//! Snapshot codec.
//!
//! Serializes the entire tag table to a self-describing binary file and
//! restores it for warm starts. All integers little-endian:
//!
//! ```text
//! MAGIC_START (0xFEEDBEEF)
//! elementSize (u32)
//! descriptorLength (u32)
//! descriptor (NUL-separated name:kind field list)
//! MAGIC_MID (0xCAFEF00D)
//! elementsWritten (u32)
//! originalArrayLength (u32)
//! [element bytes × elementsWritten]
//! MAGIC_END (0xDEADBEEF)
//! HEAP_MAGIC (0xBEEFCAFE) heapLength (u64) heap bytes crc32c (u32)
//! ```
//!
//! Elements are fixed-size, encoded field by field from the single
//! `FIELDS` table that also generates the descriptor; every
//! variable-length field is an (offset,len) reference into the packed
//! heap region. The descriptor is compared byte for byte on load; any
//! mismatch is an incompatible element layout and the caller starts
//! empty. Backlink sets are derived state and are not written; the
//! store recomputes them on restore.
//!
//! Files are written next to their final name and atomically renamed, so
//! abrupt termination never leaves a torn snapshot behind.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use crc32c::crc32c;
use thiserror::Error;

use crate::core::{
    DirTimestamp, Dn, Entity, EntityStatus, GroupType, Links, ObjectClass, ObjectGuid,
    SamAccountType, Sid, Tag, UserAccountControl,
};
use crate::error::{Effect, Transience};

const MAGIC_START: u32 = 0xFEED_BEEF;
const MAGIC_MID: u32 = 0xCAFE_F00D;
const MAGIC_END: u32 = 0xDEAD_BEEF;
const MAGIC_HEAP: u32 = 0xBEEF_CAFE;

/// Optional-field presence bits within an element's `flags` word.
mod flag {
    pub const SID: u32 = 1 << 0;
    pub const SAM: u32 = 1 << 1;
    pub const UPN: u32 = 1 << 2;
    pub const FLAT_NAME: u32 = 1 << 3;
    pub const SAM_TYPE: u32 = 1 << 4;
    pub const UAC: u32 = 1 << 5;
    pub const GROUP_TYPE: u32 = 1 << 6;
    pub const LOGON_COUNT: u32 = 1 << 7;
    pub const EMAIL: u32 = 1 << 8;
    pub const TARGET_EMAIL: u32 = 1 << 9;
    pub const MAILBOX_GUID: u32 = 1 << 10;
    pub const SIP: u32 = 1 << 11;
    pub const PRIMARY_GROUP_ID: u32 = 1 << 12;
    pub const PRIMARY_GROUP_TOKEN: u32 = 1 << 13;
    pub const MANAGER: u32 = 1 << 14;
    pub const MANAGER_DEFERRED: u32 = 1 << 15;
    pub const KNOWN: u32 = (1 << 16) - 1;
}

/// Field encodings. Fixed widths; anything variable is a heap reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    U8,
    U32,
    I64,
    Guid,
    Str,
    StrList,
    TagSet,
    TextMap,
    BinMap,
}

impl Kind {
    fn width(self) -> u32 {
        match self {
            Kind::U8 => 1,
            Kind::U32 => 4,
            Kind::I64 => 8,
            Kind::Guid => 16,
            Kind::Str | Kind::StrList | Kind::TagSet | Kind::TextMap | Kind::BinMap => 8,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Kind::U8 => "u8",
            Kind::U32 => "u32",
            Kind::I64 => "i64",
            Kind::Guid => "guid",
            Kind::Str => "str",
            Kind::StrList => "strlist",
            Kind::TagSet => "tagset",
            Kind::TextMap => "textmap",
            Kind::BinMap => "binmap",
        }
    }
}

/// The element layout. Encoder, decoder, and descriptor all derive from
/// this table; reorder or retype a field and old snapshots are rejected.
const FIELDS: &[(&str, Kind)] = &[
    ("tag", Kind::U32),
    ("flags", Kind::U32),
    ("guid", Kind::Guid),
    ("dn", Kind::Str),
    ("class", Kind::Str),
    ("sid", Kind::Str),
    ("sid_history", Kind::StrList),
    ("sam_account_name", Kind::Str),
    ("user_principal_name", Kind::Str),
    ("domain_flat_name", Kind::Str),
    ("sam_account_type", Kind::U32),
    ("user_account_control", Kind::U32),
    ("group_type", Kind::U32),
    ("when_created", Kind::I64),
    ("password_last_set", Kind::I64),
    ("last_logon_timestamp", Kind::I64),
    ("account_expires", Kind::I64),
    ("logon_count", Kind::U32),
    ("email", Kind::Str),
    ("email_aliases", Kind::StrList),
    ("target_email", Kind::Str),
    ("mailbox_guid", Kind::Guid),
    ("hide_from_address_book", Kind::U8),
    ("sip_address", Kind::Str),
    ("primary_group_id", Kind::U32),
    ("primary_group_token", Kind::U32),
    ("manager", Kind::U32),
    ("manager_deferred_dn", Kind::Str),
    ("direct_members", Kind::TagSet),
    ("member_deferred_dns", Kind::StrList),
    ("other_text", Kind::TextMap),
    ("other_binary", Kind::BinMap),
    ("status", Kind::U8),
    ("is_change_notified", Kind::U8),
];

fn element_size() -> u32 {
    FIELDS.iter().map(|(_, kind)| kind.width()).sum()
}

fn descriptor() -> Vec<u8> {
    let mut out = Vec::new();
    for (i, (name, kind)) in FIELDS.iter().enumerate() {
        if i > 0 {
            out.push(0);
        }
        out.extend_from_slice(name.as_bytes());
        out.push(b':');
        out.extend_from_slice(kind.as_str().as_bytes());
    }
    out
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SnapshotError {
    #[error("snapshot io failed at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("snapshot format invalid: {reason}")]
    Format { reason: String },
    #[error("incompatible element layout")]
    IncompatibleLayout,
}

impl SnapshotError {
    pub fn transience(&self) -> Transience {
        match self {
            SnapshotError::Io { .. } => Transience::Retryable,
            SnapshotError::Format { .. } | SnapshotError::IncompatibleLayout => {
                Transience::Permanent
            }
        }
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }

    /// True when the file simply does not exist (cold start, not a fault).
    pub fn is_missing(&self) -> bool {
        matches!(
            self,
            SnapshotError::Io { source, .. }
                if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotStats {
    pub elements_written: u32,
    pub original_array_length: u32,
    pub file_bytes: u64,
}

// =============================================================================
// Writing
// =============================================================================

/// Serialize captured slots and atomically publish the file.
pub fn write_snapshot(
    path: &Path,
    slots: &[Option<Arc<Entity>>],
) -> Result<SnapshotStats, SnapshotError> {
    let live: Vec<&Entity> = slots.iter().flatten().map(AsRef::as_ref).collect();
    let elements_written =
        u32::try_from(live.len()).map_err(|_| SnapshotError::Format {
            reason: "element count exceeds u32".into(),
        })?;
    let original_len = u32::try_from(slots.len()).map_err(|_| SnapshotError::Format {
        reason: "table length exceeds u32".into(),
    })?;

    let mut heap = Heap::default();
    let mut elements = Vec::with_capacity(live.len() * element_size() as usize);
    for entity in &live {
        encode_element(entity, &mut elements, &mut heap);
    }

    let descriptor = descriptor();
    let mut buf = Vec::with_capacity(
        4 * 6 + descriptor.len() + elements.len() + heap.buf.len() + 16,
    );
    buf.extend_from_slice(&MAGIC_START.to_le_bytes());
    buf.extend_from_slice(&element_size().to_le_bytes());
    buf.extend_from_slice(&(descriptor.len() as u32).to_le_bytes());
    buf.extend_from_slice(&descriptor);
    buf.extend_from_slice(&MAGIC_MID.to_le_bytes());
    buf.extend_from_slice(&elements_written.to_le_bytes());
    buf.extend_from_slice(&original_len.to_le_bytes());
    buf.extend_from_slice(&elements);
    buf.extend_from_slice(&MAGIC_END.to_le_bytes());
    buf.extend_from_slice(&MAGIC_HEAP.to_le_bytes());
    buf.extend_from_slice(&(heap.buf.len() as u64).to_le_bytes());
    buf.extend_from_slice(&heap.buf);
    buf.extend_from_slice(&crc32c(&heap.buf).to_le_bytes());

    let file_bytes = buf.len() as u64;
    atomic_write(path, &buf)?;
    Ok(SnapshotStats {
        elements_written,
        original_array_length: original_len,
        file_bytes,
    })
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), SnapshotError> {
    let dir = path.parent().ok_or_else(|| SnapshotError::Format {
        reason: "snapshot path has no parent directory".into(),
    })?;
    fs::create_dir_all(dir).map_err(|source| io_err(dir, source))?;

    let tmp_path = path.with_extension("cache.tmp");
    let mut file = File::create(&tmp_path).map_err(|source| io_err(&tmp_path, source))?;
    file.write_all(data)
        .map_err(|source| io_err(&tmp_path, source))?;
    file.sync_all().map_err(|source| io_err(&tmp_path, source))?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(|source| io_err(path, source))?;
    fsync_dir(dir)
}

#[cfg(unix)]
fn fsync_dir(path: &Path) -> Result<(), SnapshotError> {
    let dir = File::open(path).map_err(|source| io_err(path, source))?;
    dir.sync_all().map_err(|source| io_err(path, source))?;
    Ok(())
}

#[cfg(not(unix))]
fn fsync_dir(_path: &Path) -> Result<(), SnapshotError> {
    Ok(())
}

fn io_err(path: &Path, source: std::io::Error) -> SnapshotError {
    SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Default)]
struct Heap {
    buf: Vec<u8>,
}

impl Heap {
    fn push_bytes(&mut self, bytes: &[u8]) -> (u32, u32) {
        let off = self.buf.len() as u32;
        self.buf.extend_from_slice(bytes);
        (off, bytes.len() as u32)
    }

    fn push_str(&mut self, s: &str) -> (u32, u32) {
        self.push_bytes(s.as_bytes())
    }

    fn begin(&self) -> u32 {
        self.buf.len() as u32
    }

    fn push_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn push_framed(&mut self, bytes: &[u8]) {
        self.push_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    fn push_str_list<'a>(&mut self, items: impl ExactSizeIterator<Item = &'a str>) -> (u32, u32) {
        let off = self.begin();
        self.push_u32(items.len() as u32);
        for item in items {
            self.push_framed(item.as_bytes());
        }
        (off, self.begin() - off)
    }

    fn push_tag_set(&mut self, tags: &BTreeSet<Tag>) -> (u32, u32) {
        let off = self.begin();
        self.push_u32(tags.len() as u32);
        for tag in tags {
            self.push_u32(tag.as_u32());
        }
        (off, self.begin() - off)
    }

    fn push_text_map(&mut self, map: &BTreeMap<String, Vec<String>>) -> (u32, u32) {
        let off = self.begin();
        self.push_u32(map.len() as u32);
        for (key, values) in map {
            self.push_framed(key.as_bytes());
            self.push_u32(values.len() as u32);
            for value in values {
                self.push_framed(value.as_bytes());
            }
        }
        (off, self.begin() - off)
    }

    fn push_bin_map(&mut self, map: &BTreeMap<String, Vec<Bytes>>) -> (u32, u32) {
        let off = self.begin();
        self.push_u32(map.len() as u32);
        for (key, values) in map {
            self.push_framed(key.as_bytes());
            self.push_u32(values.len() as u32);
            for value in values {
                self.push_framed(value.as_ref());
            }
        }
        (off, self.begin() - off)
    }
}

fn encode_element(entity: &Entity, out: &mut Vec<u8>, heap: &mut Heap) {
    let mut flags = 0u32;
    let mut set = |bit: u32, on: bool| {
        if on {
            flags |= bit;
        }
    };
    set(flag::SID, entity.sid.is_some());
    set(flag::SAM, entity.sam_account_name.is_some());
    set(flag::UPN, entity.user_principal_name.is_some());
    set(flag::FLAT_NAME, entity.domain_flat_name.is_some());
    set(flag::SAM_TYPE, entity.sam_account_type.is_some());
    set(flag::UAC, entity.user_account_control.is_some());
    set(flag::GROUP_TYPE, entity.group_type.is_some());
    set(flag::LOGON_COUNT, entity.logon_count.is_some());
    set(flag::EMAIL, entity.email.is_some());
    set(flag::TARGET_EMAIL, entity.target_email.is_some());
    set(flag::MAILBOX_GUID, entity.mailbox_guid.is_some());
    set(flag::SIP, entity.sip_address.is_some());
    set(flag::PRIMARY_GROUP_ID, entity.primary_group_id.is_some());
    set(
        flag::PRIMARY_GROUP_TOKEN,
        entity.primary_group_token.is_some(),
    );
    set(flag::MANAGER, entity.links.manager.is_some());
    set(
        flag::MANAGER_DEFERRED,
        entity.links.manager_deferred_dn.is_some(),
    );

    let push_u32 = |out: &mut Vec<u8>, v: u32| out.extend_from_slice(&v.to_le_bytes());
    let push_i64 = |out: &mut Vec<u8>, v: i64| out.extend_from_slice(&v.to_le_bytes());
    let push_ref = |out: &mut Vec<u8>, (off, len): (u32, u32)| {
        out.extend_from_slice(&off.to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
    };
    let opt_str = |heap: &mut Heap, value: Option<&str>| match value {
        Some(s) => heap.push_str(s),
        None => (0, 0),
    };

    push_u32(out, entity.tag.as_u32());
    push_u32(out, flags);
    out.extend_from_slice(&entity.guid.to_ad_bytes());
    push_ref(out, heap.push_str(entity.dn.as_str()));
    push_ref(out, heap.push_str(entity.class.as_str()));
    push_ref(out, opt_str(heap, entity.sid.as_ref().map(Sid::as_str)));
    push_ref(
        out,
        heap.push_str_list(entity.sid_history.iter().map(Sid::as_str)),
    );
    push_ref(out, opt_str(heap, entity.sam_account_name.as_deref()));
    push_ref(out, opt_str(heap, entity.user_principal_name.as_deref()));
    push_ref(out, opt_str(heap, entity.domain_flat_name.as_deref()));
    push_u32(out, entity.sam_account_type.map_or(0, SamAccountType::raw));
    push_u32(
        out,
        entity.user_account_control.map_or(0, UserAccountControl::raw),
    );
    push_u32(out, entity.group_type.map_or(0, GroupType::raw));
    push_i64(out, entity.when_created.to_filetime());
    push_i64(out, entity.password_last_set.to_filetime());
    push_i64(out, entity.last_logon_timestamp.to_filetime());
    push_i64(out, entity.account_expires.to_filetime());
    push_u32(out, entity.logon_count.unwrap_or(0));
    push_ref(out, opt_str(heap, entity.email.as_deref()));
    push_ref(
        out,
        heap.push_str_list(entity.email_aliases.iter().map(String::as_str)),
    );
    push_ref(out, opt_str(heap, entity.target_email.as_deref()));
    out.extend_from_slice(
        &entity
            .mailbox_guid
            .map_or([0u8; 16], |guid| guid.to_ad_bytes()),
    );
    out.push(entity.hide_from_address_book as u8);
    push_ref(out, opt_str(heap, entity.sip_address.as_deref()));
    push_u32(out, entity.primary_group_id.unwrap_or(0));
    push_u32(out, entity.primary_group_token.unwrap_or(0));
    push_u32(out, entity.links.manager.map_or(0, Tag::as_u32));
    push_ref(
        out,
        opt_str(
            heap,
            entity.links.manager_deferred_dn.as_ref().map(Dn::as_str),
        ),
    );
    push_ref(out, heap.push_tag_set(&entity.links.direct_members));
    push_ref(
        out,
        heap.push_str_list(entity.links.member_deferred_dns.iter().map(Dn::as_str)),
    );
    push_ref(out, heap.push_text_map(&entity.other_text));
    push_ref(out, heap.push_bin_map(&entity.other_binary));
    out.push(match entity.status {
        EntityStatus::Exists => 0,
        EntityStatus::Detecting => 1,
        EntityStatus::Deleted => 2,
    });
    out.push(entity.is_change_notified as u8);
}

// =============================================================================
// Reading
// =============================================================================

/// Read and decode a snapshot file into table slots.
pub fn read_snapshot(path: &Path) -> Result<Vec<Option<Entity>>, SnapshotError> {
    let mut file = File::open(path).map_err(|source| io_err(path, source))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .map_err(|source| io_err(path, source))?;
    decode_snapshot(&data)
}

fn decode_snapshot(data: &[u8]) -> Result<Vec<Option<Entity>>, SnapshotError> {
    let mut cursor = Cursor::new(data);

    if cursor.read_u32()? != MAGIC_START {
        return Err(SnapshotError::Format {
            reason: "bad start magic".into(),
        });
    }
    let stored_element_size = cursor.read_u32()?;
    let descriptor_len = cursor.read_u32()? as usize;
    let stored_descriptor = cursor.read_bytes(descriptor_len)?;
    if stored_descriptor != descriptor().as_slice() || stored_element_size != element_size() {
        return Err(SnapshotError::IncompatibleLayout);
    }
    if cursor.read_u32()? != MAGIC_MID {
        return Err(SnapshotError::Format {
            reason: "bad mid magic".into(),
        });
    }
    let elements_written = cursor.read_u32()? as usize;
    let original_len = cursor.read_u32()? as usize;
    let element_bytes = cursor.read_bytes(
        elements_written
            .checked_mul(stored_element_size as usize)
            .ok_or_else(|| SnapshotError::Format {
                reason: "element region overflow".into(),
            })?,
    )?;
    if cursor.read_u32()? != MAGIC_END {
        return Err(SnapshotError::Format {
            reason: "bad end magic".into(),
        });
    }
    if cursor.read_u32()? != MAGIC_HEAP {
        return Err(SnapshotError::Format {
            reason: "bad heap magic".into(),
        });
    }
    let heap_len = cursor.read_u64()? as usize;
    let heap = cursor.read_bytes(heap_len)?;
    let stored_crc = cursor.read_u32()?;
    let actual_crc = crc32c(heap);
    if stored_crc != actual_crc {
        return Err(SnapshotError::Format {
            reason: format!("heap crc mismatch (stored {stored_crc:#x}, got {actual_crc:#x})"),
        });
    }

    let mut slots: Vec<Option<Entity>> = Vec::new();
    slots.resize_with(original_len, || None);
    for i in 0..elements_written {
        let start = i * stored_element_size as usize;
        let element = &element_bytes[start..start + stored_element_size as usize];
        let entity = decode_element(element, heap)?;
        let index = entity.tag.index();
        if index >= original_len {
            return Err(SnapshotError::Format {
                reason: format!("element tag {} beyond table length {original_len}", entity.tag),
            });
        }
        if slots[index].is_some() {
            return Err(SnapshotError::Format {
                reason: format!("duplicate element tag {}", entity.tag),
            });
        }
        slots[index] = Some(entity);
    }
    Ok(slots)
}

fn decode_element(element: &[u8], heap: &[u8]) -> Result<Entity, SnapshotError> {
    let mut cursor = Cursor::new(element);
    let heap = HeapReader { heap };

    let tag = Tag::from_u32(cursor.read_u32()?);
    let flags = cursor.read_u32()?;
    if flags & !flag::KNOWN != 0 {
        return Err(SnapshotError::Format {
            reason: format!("unknown flag bits {flags:#x}"),
        });
    }
    let has = |bit: u32| flags & bit != 0;

    let guid = ObjectGuid::from_ad_bytes(cursor.read_bytes(16)?).map_err(invalid_field)?;
    let dn = Dn::parse(heap.str_at(cursor.read_ref()?)?).map_err(invalid_field)?;
    let class = ObjectClass::from_path(heap.str_at(cursor.read_ref()?)?);

    let sid_ref = cursor.read_ref()?;
    let sid = if has(flag::SID) {
        Some(Sid::parse(heap.str_at(sid_ref)?).map_err(invalid_field)?)
    } else {
        None
    };
    let mut sid_history = BTreeSet::new();
    for raw in heap.str_list_at(cursor.read_ref()?)? {
        sid_history.insert(Sid::parse(&raw).map_err(invalid_field)?);
    }

    let opt_string = |r: (u32, u32), on: bool| -> Result<Option<String>, SnapshotError> {
        if on {
            Ok(Some(heap.str_at(r)?.to_string()))
        } else {
            Ok(None)
        }
    };

    let sam_account_name = opt_string(cursor.read_ref()?, has(flag::SAM))?;
    let user_principal_name = opt_string(cursor.read_ref()?, has(flag::UPN))?;
    let domain_flat_name = opt_string(cursor.read_ref()?, has(flag::FLAT_NAME))?;

    let sam_raw = cursor.read_u32()?;
    let sam_account_type = has(flag::SAM_TYPE).then(|| SamAccountType::from_raw(sam_raw));
    let uac_raw = cursor.read_u32()?;
    let user_account_control = has(flag::UAC).then(|| UserAccountControl::from_raw(uac_raw));
    let group_raw = cursor.read_u32()?;
    let group_type = has(flag::GROUP_TYPE).then(|| GroupType::from_raw(group_raw));

    let when_created = DirTimestamp::from_filetime(cursor.read_i64()?).map_err(invalid_field)?;
    let password_last_set =
        DirTimestamp::from_filetime(cursor.read_i64()?).map_err(invalid_field)?;
    let last_logon_timestamp =
        DirTimestamp::from_filetime(cursor.read_i64()?).map_err(invalid_field)?;
    let account_expires = DirTimestamp::from_filetime(cursor.read_i64()?).map_err(invalid_field)?;

    let logon_raw = cursor.read_u32()?;
    let logon_count = has(flag::LOGON_COUNT).then_some(logon_raw);

    let email = opt_string(cursor.read_ref()?, has(flag::EMAIL))?;
    let email_aliases: BTreeSet<String> =
        heap.str_list_at(cursor.read_ref()?)?.into_iter().collect();
    let target_email = opt_string(cursor.read_ref()?, has(flag::TARGET_EMAIL))?;

    let mailbox_raw = cursor.read_bytes(16)?;
    let mailbox_guid = if has(flag::MAILBOX_GUID) {
        Some(ObjectGuid::from_ad_bytes(mailbox_raw).map_err(invalid_field)?)
    } else {
        None
    };
    let hide_from_address_book = cursor.read_u8()? != 0;
    let sip_address = opt_string(cursor.read_ref()?, has(flag::SIP))?;

    let pgid_raw = cursor.read_u32()?;
    let primary_group_id = has(flag::PRIMARY_GROUP_ID).then_some(pgid_raw);
    let pgt_raw = cursor.read_u32()?;
    let primary_group_token = has(flag::PRIMARY_GROUP_TOKEN).then_some(pgt_raw);

    let manager_raw = cursor.read_u32()?;
    let manager = has(flag::MANAGER).then(|| Tag::from_u32(manager_raw));
    let manager_deferred_ref = cursor.read_ref()?;
    let manager_deferred_dn = if has(flag::MANAGER_DEFERRED) {
        Some(Dn::parse(heap.str_at(manager_deferred_ref)?).map_err(invalid_field)?)
    } else {
        None
    };

    let direct_members = heap.tag_set_at(cursor.read_ref()?)?;
    let mut member_deferred_dns = Vec::new();
    for raw in heap.str_list_at(cursor.read_ref()?)? {
        member_deferred_dns.push(Dn::parse(raw).map_err(invalid_field)?);
    }
    let other_text = heap.text_map_at(cursor.read_ref()?)?;
    let other_binary = heap.bin_map_at(cursor.read_ref()?)?;

    let status = match cursor.read_u8()? {
        0 => EntityStatus::Exists,
        1 => EntityStatus::Detecting,
        2 => EntityStatus::Deleted,
        other => {
            return Err(SnapshotError::Format {
                reason: format!("unknown status byte {other}"),
            });
        }
    };
    let is_change_notified = cursor.read_u8()? != 0;

    Ok(Entity {
        tag,
        dn,
        guid,
        class,
        sid,
        sid_history,
        sam_account_name,
        user_principal_name,
        domain_flat_name,
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
        sip_address,
        primary_group_id,
        primary_group_token,
        links: Links {
            manager,
            manager_deferred_dn,
            manages: BTreeSet::new(),
            direct_members,
            member_deferred_dns,
            direct_member_ofs: BTreeSet::new(),
        },
        other_text,
        other_binary,
        status,
        is_change_notified,
    })
}

fn invalid_field(err: crate::core::CoreError) -> SnapshotError {
    SnapshotError::Format {
        reason: err.to_string(),
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], SnapshotError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| SnapshotError::Format {
                reason: "truncated".into(),
            })?;
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, SnapshotError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, SnapshotError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, SnapshotError> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_i64(&mut self) -> Result<i64, SnapshotError> {
        Ok(self.read_u64()? as i64)
    }

    fn read_ref(&mut self) -> Result<(u32, u32), SnapshotError> {
        Ok((self.read_u32()?, self.read_u32()?))
    }
}

struct HeapReader<'a> {
    heap: &'a [u8],
}

impl<'a> HeapReader<'a> {
    fn slice_at(&self, (off, len): (u32, u32)) -> Result<&'a [u8], SnapshotError> {
        let start = off as usize;
        let end = start
            .checked_add(len as usize)
            .filter(|&end| end <= self.heap.len())
            .ok_or_else(|| SnapshotError::Format {
                reason: "heap reference out of bounds".into(),
            })?;
        Ok(&self.heap[start..end])
    }

    fn str_at(&self, r: (u32, u32)) -> Result<&'a str, SnapshotError> {
        std::str::from_utf8(self.slice_at(r)?).map_err(|_| SnapshotError::Format {
            reason: "heap string is not utf-8".into(),
        })
    }

    fn str_list_at(&self, r: (u32, u32)) -> Result<Vec<String>, SnapshotError> {
        let mut cursor = Cursor::new(self.slice_at(r)?);
        let count = cursor.read_u32()?;
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = cursor.read_u32()? as usize;
            let bytes = cursor.read_bytes(len)?;
            out.push(
                std::str::from_utf8(bytes)
                    .map_err(|_| SnapshotError::Format {
                        reason: "heap string is not utf-8".into(),
                    })?
                    .to_string(),
            );
        }
        Ok(out)
    }

    fn tag_set_at(&self, r: (u32, u32)) -> Result<BTreeSet<Tag>, SnapshotError> {
        let mut cursor = Cursor::new(self.slice_at(r)?);
        let count = cursor.read_u32()?;
        let mut out = BTreeSet::new();
        for _ in 0..count {
            out.insert(Tag::from_u32(cursor.read_u32()?));
        }
        Ok(out)
    }

    fn text_map_at(&self, r: (u32, u32)) -> Result<BTreeMap<String, Vec<String>>, SnapshotError> {
        let mut cursor = Cursor::new(self.slice_at(r)?);
        let count = cursor.read_u32()?;
        let mut out = BTreeMap::new();
        for _ in 0..count {
            let key_len = cursor.read_u32()? as usize;
            let key = std::str::from_utf8(cursor.read_bytes(key_len)?)
                .map_err(|_| SnapshotError::Format {
                    reason: "heap string is not utf-8".into(),
                })?
                .to_string();
            let value_count = cursor.read_u32()?;
            let mut values = Vec::with_capacity(value_count as usize);
            for _ in 0..value_count {
                let len = cursor.read_u32()? as usize;
                values.push(
                    std::str::from_utf8(cursor.read_bytes(len)?)
                        .map_err(|_| SnapshotError::Format {
                            reason: "heap string is not utf-8".into(),
                        })?
                        .to_string(),
                );
            }
            out.insert(key, values);
        }
        Ok(out)
    }

    fn bin_map_at(&self, r: (u32, u32)) -> Result<BTreeMap<String, Vec<Bytes>>, SnapshotError> {
        let mut cursor = Cursor::new(self.slice_at(r)?);
        let count = cursor.read_u32()?;
        let mut out = BTreeMap::new();
        for _ in 0..count {
            let key_len = cursor.read_u32()? as usize;
            let key = std::str::from_utf8(cursor.read_bytes(key_len)?)
                .map_err(|_| SnapshotError::Format {
                    reason: "heap string is not utf-8".into(),
                })?
                .to_string();
            let value_count = cursor.read_u32()?;
            let mut values = Vec::with_capacity(value_count as usize);
            for _ in 0..value_count {
                let len = cursor.read_u32()? as usize;
                values.push(Bytes::copy_from_slice(cursor.read_bytes(len)?));
            }
            out.insert(key, values);
        }
        Ok(out)
    }
}

/// Pluggable sink for pushing serialized entities somewhere else
/// (a SQL cache, an export job). Persistence here is crash recovery
/// only; exporters must not assume query semantics.
pub trait SnapshotExporter: Send + Sync {
    fn export(&self, entities: &[Option<Arc<Entity>>]) -> Result<(), SnapshotError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EntityStatus, Tag};
    use crate::test_harness::{entity_named, group_named, guid};

    fn sample_slots() -> Vec<Option<Arc<Entity>>> {
        let mut alice = entity_named(1, "CN=Alice,DC=x");
        alice.tag = Tag::from_index(0);
        alice.sam_account_name = Some("alice".into());
        alice.email = Some("alice@corp.example".into());
        alice.email_aliases.insert("al@corp.example".into());
        alice.sid = Some(Sid::parse("S-1-5-21-7-8-1104").unwrap());
        alice.sid_history.insert(Sid::parse("S-1-5-21-9-9-55").unwrap());
        alice.primary_group_id = Some(513);
        alice.links.manager = Some(Tag::from_index(2));
        alice
            .other_text
            .insert("displayname".into(), vec!["Alice A.".into()]);
        alice
            .other_binary
            .insert("thumbnailphoto".into(), vec![Bytes::from_static(b"\x01\x02")]);
        alice.is_change_notified = true;

        let mut group = group_named(2, "CN=G,DC=x");
        group.tag = Tag::from_index(1);
        group.primary_group_token = Some(513);
        group.links.direct_members.insert(Tag::from_index(0));
        group
            .links
            .member_deferred_dns
            .push(Dn::parse("CN=Missing,DC=x").unwrap());

        let mut boss = entity_named(3, "CN=Boss,DC=x");
        boss.tag = Tag::from_index(2);
        boss.status = EntityStatus::Detecting;

        // Slot 3 was deleted; the tag stays retired.
        vec![
            Some(Arc::new(alice)),
            Some(Arc::new(group)),
            Some(Arc::new(boss)),
            None,
        ]
    }

    #[test]
    fn roundtrip_preserves_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.corp.example.cache");
        let slots = sample_slots();

        let stats = write_snapshot(&path, &slots).unwrap();
        assert_eq!(stats.elements_written, 3);
        assert_eq!(stats.original_array_length, 4);

        let restored = read_snapshot(&path).unwrap();
        assert_eq!(restored.len(), 4);
        assert!(restored[3].is_none());
        for (slot, original) in restored.iter().zip(slots.iter()) {
            match (slot, original) {
                (Some(entity), Some(original)) => assert_eq!(entity, original.as_ref()),
                (None, None) => {}
                _ => panic!("slot occupancy changed"),
            }
        }
    }

    #[test]
    fn empty_table_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.cache");
        write_snapshot(&path, &[]).unwrap();
        assert!(read_snapshot(&path).unwrap().is_empty());
    }

    #[test]
    fn missing_file_is_distinguishable() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_snapshot(&dir.path().join("absent.cache")).unwrap_err();
        assert!(err.is_missing());
    }

    #[test]
    fn descriptor_mismatch_is_incompatible_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("victim.cache");
        write_snapshot(&path, &sample_slots()).unwrap();

        let mut data = fs::read(&path).unwrap();
        // Flip a byte inside the descriptor region.
        data[12] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        let err = read_snapshot(&path).unwrap_err();
        assert!(matches!(err, SnapshotError::IncompatibleLayout));
    }

    #[test]
    fn corrupt_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("victim.cache");
        write_snapshot(&path, &sample_slots()).unwrap();

        let mut data = fs::read(&path).unwrap();
        data[0] ^= 0xFF;
        fs::write(&path, &data).unwrap();
        assert!(matches!(
            read_snapshot(&path).unwrap_err(),
            SnapshotError::Format { .. }
        ));
    }

    #[test]
    fn heap_corruption_fails_the_crc() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("victim.cache");
        write_snapshot(&path, &sample_slots()).unwrap();

        let mut data = fs::read(&path).unwrap();
        // Flip a heap byte: the last 4 bytes are the crc, so step back
        // past them into the heap body.
        let heap_byte = data.len() - 8;
        data[heap_byte] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        let err = read_snapshot(&path).unwrap_err();
        assert!(matches!(err, SnapshotError::Format { reason } if reason.contains("crc")));
    }

    #[test]
    fn truncated_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("victim.cache");
        write_snapshot(&path, &sample_slots()).unwrap();

        let data = fs::read(&path).unwrap();
        fs::write(&path, &data[..data.len() / 2]).unwrap();
        assert!(matches!(
            read_snapshot(&path).unwrap_err(),
            SnapshotError::Format { .. }
        ));
    }

    #[test]
    fn write_is_atomic_under_the_final_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("atomic.cache");
        write_snapshot(&path, &sample_slots()).unwrap();
        // No stray temp file survives a successful write.
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["atomic.cache".to_string()]);
    }

    #[test]
    fn backlinks_are_not_serialized() {
        // manages/direct_member_ofs are derived; the reader must get
        // them empty regardless of what the writer held in memory.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("derived.cache");
        let mut entity = entity_named(1, "CN=A,DC=x");
        entity.tag = Tag::from_index(0);
        entity.links.manages.insert(Tag::from_index(5));
        entity.links.direct_member_ofs.insert(Tag::from_index(6));
        write_snapshot(&path, &[Some(Arc::new(entity))]).unwrap();

        let restored = read_snapshot(&path).unwrap();
        let entity = restored[0].as_ref().unwrap();
        assert!(entity.links.manages.is_empty());
        assert!(entity.links.direct_member_ofs.is_empty());
        assert_eq!(entity.guid, guid(1));
    }
}
