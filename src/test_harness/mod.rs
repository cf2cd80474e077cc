//! Shared builders and fakes for tests.
//!
//! Record builders produce wire-shaped `RawObject`s; the scripted
//! directory plays back bulk pages and change events so pipeline tests
//! run without a server. Compiled for unit tests and behind the
//! `test-harness` feature for the integration suites.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::core::{Entity, ObjectGuid, ParsedEntity, Tag};
use crate::directory::{
    AttrValue, AttributeSelection, BootstrapInfo, BulkPages, ChangeStream, DirectoryClient,
    DirectoryConnector, FeedError, RangedChunk, RawObject, SiteTopology,
};

pub fn guid(seed: u8) -> ObjectGuid {
    ObjectGuid::from_bytes([seed; 16])
}

pub fn guid_bytes(seed: u8) -> Vec<u8> {
    guid(seed).to_ad_bytes().to_vec()
}

/// Binary SID for `S-1-5-21-7-8-{rid}`.
pub fn sid_bytes(rid: u32) -> Vec<u8> {
    let mut bytes = vec![1u8, 4, 0, 0, 0, 0, 0, 5];
    for sub in [21u32, 7, 8, rid] {
        bytes.extend_from_slice(&sub.to_le_bytes());
    }
    bytes
}

/// Fluent wire-record builder.
pub struct RecordBuilder {
    raw: RawObject,
}

impl RecordBuilder {
    fn with_classes(seed: u8, dn: &str, classes: &[&str]) -> Self {
        let mut raw = RawObject::new(dn);
        for class in classes {
            raw.push("objectClass", AttrValue::text(*class));
        }
        raw.push("objectGuid", AttrValue::binary(guid_bytes(seed)));
        Self { raw }
    }

    pub fn user(seed: u8, dn: &str) -> Self {
        Self::with_classes(seed, dn, &["top", "person", "organizationalPerson", "user"])
    }

    pub fn group(seed: u8, dn: &str) -> Self {
        Self::with_classes(seed, dn, &["top", "group"])
    }

    pub fn computer(seed: u8, dn: &str) -> Self {
        Self::with_classes(
            seed,
            dn,
            &["top", "person", "organizationalPerson", "user", "computer"],
        )
    }

    pub fn foreign(seed: u8, dn: &str) -> Self {
        Self::with_classes(seed, dn, &["top", "foreignSecurityPrincipal"])
    }

    pub fn sam(mut self, sam: &str) -> Self {
        self.raw.set("sAMAccountName", vec![AttrValue::text(sam)]);
        self
    }

    pub fn upn(mut self, upn: &str) -> Self {
        self.raw.set("userPrincipalName", vec![AttrValue::text(upn)]);
        self
    }

    pub fn sid(mut self, rid: u32) -> Self {
        self.raw.set("objectSid", vec![AttrValue::binary(sid_bytes(rid))]);
        self
    }

    pub fn sid_history(mut self, rid: u32) -> Self {
        self.raw.push("sidhistory", AttrValue::binary(sid_bytes(rid)));
        self
    }

    pub fn mail(mut self, addr: &str) -> Self {
        self.raw.set("mail", vec![AttrValue::text(addr)]);
        self
    }

    pub fn alias(mut self, addr: &str) -> Self {
        self.raw
            .push("proxyAddresses", AttrValue::text(format!("smtp:{addr}")));
        self
    }

    pub fn mailbox(mut self, seed: u8) -> Self {
        self.raw
            .set("msExchMailboxGuid", vec![AttrValue::binary(guid_bytes(seed))]);
        self
    }

    pub fn uac(mut self, bits: u32) -> Self {
        self.raw
            .set("userAccountControl", vec![AttrValue::text(bits.to_string())]);
        self
    }

    pub fn manager(mut self, dn: &str) -> Self {
        self.raw.set("manager", vec![AttrValue::text(dn)]);
        self
    }

    pub fn member(mut self, dn: &str) -> Self {
        self.raw.push("member", AttrValue::text(dn));
        self
    }

    pub fn primary_group_id(mut self, rid: u32) -> Self {
        self.raw
            .set("primaryGroupID", vec![AttrValue::text(rid.to_string())]);
        self
    }

    pub fn primary_group_token(mut self, rid: u32) -> Self {
        self.raw
            .set("primaryGroupToken", vec![AttrValue::text(rid.to_string())]);
        self
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.raw.push(name, AttrValue::text(value));
        self
    }

    pub fn delete_notice(mut self) -> Self {
        self.raw.set("isDeleted", vec![AttrValue::text("TRUE")]);
        self
    }

    pub fn build(self) -> RawObject {
        self.raw
    }
}

/// A minimal live user entity for table-level tests.
pub fn entity_named(seed: u8, dn: &str) -> Entity {
    let raw = RecordBuilder::user(seed, dn).build();
    let parsed = ParsedEntity::from_raw(&raw)
        .expect("builder record parses")
        .expect("builder record has a guid");
    Entity::from_parsed(Tag::from_index(0), parsed)
}

/// A minimal live group entity for table-level tests.
pub fn group_named(seed: u8, dn: &str) -> Entity {
    let raw = RecordBuilder::group(seed, dn).build();
    let parsed = ParsedEntity::from_raw(&raw)
        .expect("builder record parses")
        .expect("builder record has a guid");
    Entity::from_parsed(Tag::from_index(0), parsed)
}

type PageScript = VecDeque<Result<Vec<RawObject>, FeedError>>;

/// Scripted in-memory directory bound to one fake DC.
pub struct ScriptedDirectory {
    flat_name: String,
    topology: SiteTopology,
    pages: Mutex<PageScript>,
    notify_tx: Sender<Result<RawObject, FeedError>>,
    notify_rx: Receiver<Result<RawObject, FeedError>>,
    ranged: Mutex<HashMap<(String, String, u32), RangedChunk>>,
    fail_bootstrap: Mutex<bool>,
    fail_open_bulk: Mutex<Option<FeedError>>,
}

impl ScriptedDirectory {
    pub fn new(flat_name: &str) -> Arc<Self> {
        let (notify_tx, notify_rx) = unbounded();
        Arc::new(Self {
            flat_name: flat_name.to_string(),
            topology: SiteTopology::default(),
            pages: Mutex::new(VecDeque::new()),
            notify_tx,
            notify_rx,
            ranged: Mutex::new(HashMap::new()),
            fail_bootstrap: Mutex::new(false),
            fail_open_bulk: Mutex::new(None),
        })
    }

    pub fn push_page(&self, page: Vec<RawObject>) {
        self.pages.lock().unwrap().push_back(Ok(page));
    }

    pub fn push_page_error(&self, err: FeedError) {
        self.pages.lock().unwrap().push_back(Err(err));
    }

    /// Deliver one change-notification record.
    pub fn notify(&self, record: RawObject) {
        let _ = self.notify_tx.send(Ok(record));
    }

    pub fn notify_error(&self, err: FeedError) {
        let _ = self.notify_tx.send(Err(err));
    }

    pub fn script_ranged(&self, dn: &str, attr: &str, start: u32, chunk: RangedChunk) {
        self.ranged
            .lock()
            .unwrap()
            .insert((dn.to_string(), attr.to_string(), start), chunk);
    }

    pub fn set_bootstrap_failure(&self, fail: bool) {
        *self.fail_bootstrap.lock().unwrap() = fail;
    }

    pub fn set_open_bulk_failure(&self, err: Option<FeedError>) {
        *self.fail_open_bulk.lock().unwrap() = err;
    }
}

struct ScriptedBulk {
    dir: Arc<ScriptedDirectory>,
}

impl BulkPages for ScriptedBulk {
    fn next_page(&mut self) -> Result<Option<Vec<RawObject>>, FeedError> {
        match self.dir.pages.lock().unwrap().pop_front() {
            Some(Ok(page)) => Ok(Some(page)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }
}

struct ScriptedNotify {
    rx: Receiver<Result<RawObject, FeedError>>,
}

impl ChangeStream for ScriptedNotify {
    fn next_change(&mut self, timeout: Duration) -> Result<Option<RawObject>, FeedError> {
        match self.rx.recv_timeout(timeout) {
            Ok(Ok(record)) => Ok(Some(record)),
            Ok(Err(err)) => Err(err),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(FeedError::transient("notify stream closed"))
            }
        }
    }
}

impl DirectoryClient for ScriptedDirectory {
    fn bootstrap(&self, _timeout: Duration) -> Result<BootstrapInfo, FeedError> {
        if *self.fail_bootstrap.lock().unwrap() {
            return Err(FeedError::transient("bootstrap refused"));
        }
        Ok(BootstrapInfo {
            flat_name: self.flat_name.clone(),
        })
    }

    fn load_topology(&self) -> Result<SiteTopology, FeedError> {
        Ok(self.topology.clone())
    }

    fn open_bulk(
        &self,
        _page_size: u32,
        _attrs: &AttributeSelection,
    ) -> Result<Box<dyn BulkPages>, FeedError> {
        if let Some(err) = self.fail_open_bulk.lock().unwrap().clone() {
            return Err(err);
        }
        Err(FeedError::fatal(
            "ScriptedDirectory::open_bulk requires an Arc handle",
        ))
    }

    fn open_notify(&self, _attrs: &AttributeSelection) -> Result<Box<dyn ChangeStream>, FeedError> {
        Ok(Box::new(ScriptedNotify {
            rx: self.notify_rx.clone(),
        }))
    }

    fn fetch_ranged(&self, dn: &str, attr: &str, start: u32) -> Result<RangedChunk, FeedError> {
        self.ranged
            .lock()
            .unwrap()
            .remove(&(dn.to_string(), attr.to_string(), start))
            .ok_or_else(|| FeedError::transient(format!("no ranged chunk scripted at {start}")))
    }
}

/// Arc wrapper so bulk cursors can hold the scripted directory.
pub struct ScriptedHandle(pub Arc<ScriptedDirectory>);

impl DirectoryClient for ScriptedHandle {
    fn bootstrap(&self, timeout: Duration) -> Result<BootstrapInfo, FeedError> {
        self.0.bootstrap(timeout)
    }

    fn load_topology(&self) -> Result<SiteTopology, FeedError> {
        self.0.load_topology()
    }

    fn open_bulk(
        &self,
        _page_size: u32,
        _attrs: &AttributeSelection,
    ) -> Result<Box<dyn BulkPages>, FeedError> {
        if let Some(err) = self.0.fail_open_bulk.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(Box::new(ScriptedBulk {
            dir: Arc::clone(&self.0),
        }))
    }

    fn open_notify(&self, attrs: &AttributeSelection) -> Result<Box<dyn ChangeStream>, FeedError> {
        self.0.open_notify(attrs)
    }

    fn fetch_ranged(&self, dn: &str, attr: &str, start: u32) -> Result<RangedChunk, FeedError> {
        self.0.fetch_ranged(dn, attr, start)
    }
}

/// Connector over a fixed host→directory map.
pub struct ScriptedConnector {
    directories: Mutex<HashMap<String, Arc<ScriptedDirectory>>>,
    connects: Mutex<Vec<String>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self {
            directories: Mutex::new(HashMap::new()),
            connects: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, host: &str, dir: Arc<ScriptedDirectory>) {
        self.directories.lock().unwrap().insert(host.to_string(), dir);
    }

    /// Hosts handed to `connect`, in order.
    pub fn connect_log(&self) -> Vec<String> {
        self.connects.lock().unwrap().clone()
    }
}

impl Default for ScriptedConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryConnector for ScriptedConnector {
    fn connect(&self, host: &str) -> Result<Arc<dyn DirectoryClient>, FeedError> {
        self.connects.lock().unwrap().push(host.to_string());
        match self.directories.lock().unwrap().get(host) {
            Some(dir) => Ok(Arc::new(ScriptedHandle(Arc::clone(dir)))),
            None => Err(FeedError::transient(format!("no route to {host}"))),
        }
    }
}
