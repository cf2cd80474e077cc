//! Shared fixtures for the integration suites, built on the public API.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dirmirror::defects::DefectLog;
use dirmirror::{
    AttrValue, AttributeSelection, BootstrapInfo, BulkPages, ChangeStream, DirectoryClient,
    DirectoryConnector, FeedError, ObjectGuid, RangedChunk, RawObject, SiteTopology, Store,
};

pub fn guid(seed: u8) -> ObjectGuid {
    ObjectGuid::parse(&format!("00000000-0000-0000-0000-0000000000{seed:02x}")).unwrap()
}

pub fn guid_text(seed: u8) -> String {
    guid(seed).to_string()
}

pub fn user(seed: u8, dn: &str) -> RawObject {
    let mut raw = RawObject::new(dn);
    for class in ["top", "person", "organizationalPerson", "user"] {
        raw.push("objectClass", AttrValue::text(class));
    }
    raw.push("objectGuid", AttrValue::text(guid_text(seed)));
    raw
}

pub fn group(seed: u8, dn: &str) -> RawObject {
    let mut raw = RawObject::new(dn);
    for class in ["top", "group"] {
        raw.push("objectClass", AttrValue::text(class));
    }
    raw.push("objectGuid", AttrValue::text(guid_text(seed)));
    raw
}

pub fn with_attr(mut raw: RawObject, name: &str, value: &str) -> RawObject {
    raw.push(name, AttrValue::text(value));
    raw
}

pub fn test_store() -> Store {
    Store::new(Arc::new(DefectLog::disabled()), dirmirror::metrics::noop())
}

pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

/// In-memory fake DC: scripted bulk pages plus a live change queue.
pub struct FakeDc {
    flat_name: String,
    pages: Mutex<VecDeque<Result<Vec<RawObject>, FeedError>>>,
    changes: Mutex<VecDeque<Result<RawObject, FeedError>>>,
    bootstrap_ok: Mutex<bool>,
}

impl FakeDc {
    pub fn new(flat_name: &str) -> Arc<Self> {
        Arc::new(Self {
            flat_name: flat_name.to_string(),
            pages: Mutex::new(VecDeque::new()),
            changes: Mutex::new(VecDeque::new()),
            bootstrap_ok: Mutex::new(true),
        })
    }

    pub fn page(&self, records: Vec<RawObject>) {
        self.pages.lock().unwrap().push_back(Ok(records));
    }

    pub fn page_error(&self, err: FeedError) {
        self.pages.lock().unwrap().push_back(Err(err));
    }

    pub fn notify(&self, record: RawObject) {
        self.changes.lock().unwrap().push_back(Ok(record));
    }

    pub fn notify_error(&self, err: FeedError) {
        self.changes.lock().unwrap().push_back(Err(err));
    }

    pub fn refuse_bootstrap(&self) {
        *self.bootstrap_ok.lock().unwrap() = false;
    }

    pub fn allow_bootstrap(&self) {
        *self.bootstrap_ok.lock().unwrap() = true;
    }
}

pub struct FakeClient(pub Arc<FakeDc>);

struct FakeBulk(Arc<FakeDc>);

impl BulkPages for FakeBulk {
    fn next_page(&mut self) -> Result<Option<Vec<RawObject>>, FeedError> {
        match self.0.pages.lock().unwrap().pop_front() {
            Some(Ok(page)) => Ok(Some(page)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }
}

struct FakeNotify(Arc<FakeDc>);

impl ChangeStream for FakeNotify {
    fn next_change(&mut self, timeout: Duration) -> Result<Option<RawObject>, FeedError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = self.0.changes.lock().unwrap().pop_front() {
                return item.map(Some);
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl DirectoryClient for FakeClient {
    fn bootstrap(&self, _timeout: Duration) -> Result<BootstrapInfo, FeedError> {
        if !*self.0.bootstrap_ok.lock().unwrap() {
            return Err(FeedError::transient("bootstrap refused"));
        }
        Ok(BootstrapInfo {
            flat_name: self.0.flat_name.clone(),
        })
    }

    fn load_topology(&self) -> Result<SiteTopology, FeedError> {
        Ok(SiteTopology::default())
    }

    fn open_bulk(
        &self,
        _page_size: u32,
        _attrs: &AttributeSelection,
    ) -> Result<Box<dyn BulkPages>, FeedError> {
        Ok(Box::new(FakeBulk(Arc::clone(&self.0))))
    }

    fn open_notify(&self, _attrs: &AttributeSelection) -> Result<Box<dyn ChangeStream>, FeedError> {
        Ok(Box::new(FakeNotify(Arc::clone(&self.0))))
    }

    fn fetch_ranged(&self, _dn: &str, _attr: &str, start: u32) -> Result<RangedChunk, FeedError> {
        Err(FeedError::transient(format!(
            "no ranged data scripted at {start}"
        )))
    }
}

/// Host→DC map with connection logging.
pub struct FakeConnector {
    dcs: Mutex<HashMap<String, Arc<FakeDc>>>,
    log: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dcs: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn add(&self, host: &str, dc: Arc<FakeDc>) {
        self.dcs.lock().unwrap().insert(host.to_string(), dc);
    }

    pub fn connect_log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl DirectoryConnector for FakeConnector {
    fn connect(&self, host: &str) -> Result<Arc<dyn DirectoryClient>, FeedError> {
        self.log.lock().unwrap().push(host.to_string());
        match self.dcs.lock().unwrap().get(host) {
            Some(dc) => Ok(Arc::new(FakeClient(Arc::clone(dc)))),
            None => Err(FeedError::transient(format!("no route to {host}"))),
        }
    }
}
