//! Sync pipeline.
//!
//! Two producer threads (a paged bulk enumeration and an open-ended
//! change-notification stream) feed bounded queues drained by a single
//! consumer thread that owns all store writes. Backpressure is the
//! channels themselves: a full queue blocks the producer, which defers
//! the next server request.
//!
//! When the bulk feed completes, the consumer runs the end-of-load
//! steps (resolve deferred references, delete undetected entities) and
//! flips `initial_load_complete`, which arms the snapshot writer.
//!
//! Faults never unwind across the pipeline: feed errors land in the
//! shared `FeedHealth` block for the watchdog. A consumer panic is
//! fatal and re-raised from `stop`.

pub mod backoff;
pub mod cancel;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, never, Receiver, Sender};

use crate::core::{RecordSource, Store};
use crate::directory::{range, AttributeSelection, DirectoryClient, FeedError, RawObject};
use crate::metrics::{Counter, MetricSink, MetricSinkExt};
use cancel::CancelToken;

/// How often blocking feed calls wake up to observe cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub page_size: u32,
    pub queue_capacity: usize,
    /// A change stream silent for this long is considered stale and
    /// re-established through the watchdog path.
    pub notify_idle_timeout: Duration,
    /// What the feeds ask the server for.
    pub attributes: AttributeSelection,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            queue_capacity: 512,
            notify_idle_timeout: Duration::from_secs(2 * 24 * 60 * 60),
            attributes: AttributeSelection::default(),
        }
    }
}

enum FeedItem {
    Record(RawObject),
    BulkComplete,
}

/// Fault indicators shared between the feeds and the watchdog.
#[derive(Default)]
pub struct FeedHealth {
    bulk_error: Mutex<Option<FeedError>>,
    notify_error: Mutex<Option<FeedError>>,
    initial_load_complete: AtomicBool,
}

impl FeedHealth {
    pub fn record_bulk_error(&self, err: FeedError) {
        tracing::warn!(%err, "bulk feed fault");
        *self.bulk_error.lock().expect("health lock poisoned") = Some(err);
    }

    pub fn record_notify_error(&self, err: FeedError) {
        tracing::warn!(%err, "change-notify feed fault");
        *self.notify_error.lock().expect("health lock poisoned") = Some(err);
    }

    pub fn bulk_error(&self) -> Option<FeedError> {
        self.bulk_error.lock().expect("health lock poisoned").clone()
    }

    pub fn notify_error(&self) -> Option<FeedError> {
        self.notify_error
            .lock()
            .expect("health lock poisoned")
            .clone()
    }

    /// Either feed has tripped.
    pub fn faulted(&self) -> bool {
        self.bulk_error().is_some() || self.notify_error().is_some()
    }

    /// A fatal fault, if any; the watchdog gives up instead of retrying.
    pub fn fatal_error(&self) -> Option<FeedError> {
        [self.bulk_error(), self.notify_error()]
            .into_iter()
            .flatten()
            .find(FeedError::is_fatal)
    }

    pub fn initial_load_complete(&self) -> bool {
        self.initial_load_complete.load(Ordering::SeqCst)
    }

    fn set_initial_load_complete(&self) {
        self.initial_load_complete.store(true, Ordering::SeqCst);
    }
}

struct PipelineMetrics {
    bulk_pages: Counter,
    bulk_records: Counter,
    notify_records: Counter,
}

/// A running feed pair + consumer.
pub struct Pipeline {
    cancel: CancelToken,
    health: Arc<FeedHealth>,
    bulk: Option<JoinHandle<()>>,
    notify: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
}

impl Pipeline {
    pub fn start(
        store: Arc<Store>,
        client: Arc<dyn DirectoryClient>,
        config: PipelineConfig,
        sink: Arc<dyn MetricSink>,
    ) -> Self {
        let cancel = CancelToken::new();
        let health = Arc::new(FeedHealth::default());
        let metrics = Arc::new(PipelineMetrics {
            bulk_pages: sink.counter("feed_bulk_pages"),
            bulk_records: sink.counter("feed_bulk_records"),
            notify_records: sink.counter("feed_notify_records"),
        });

        // A full load begins: everything currently held is up for
        // re-detection.
        store.mark_all_detecting();

        let (bulk_tx, bulk_rx) = bounded::<FeedItem>(config.queue_capacity);
        let (notify_tx, notify_rx) = bounded::<FeedItem>(config.queue_capacity);

        let bulk = {
            let client = Arc::clone(&client);
            let cancel = cancel.clone();
            let health = Arc::clone(&health);
            let metrics = Arc::clone(&metrics);
            let page_size = config.page_size;
            let attrs = config.attributes.clone();
            std::thread::Builder::new()
                .name("mirror-bulk".into())
                .spawn(move || {
                    run_bulk_feed(client, bulk_tx, cancel, health, metrics, page_size, &attrs)
                })
                .expect("spawn bulk feed")
        };

        let notify = {
            let client = Arc::clone(&client);
            let cancel = cancel.clone();
            let health = Arc::clone(&health);
            let metrics = Arc::clone(&metrics);
            let idle_timeout = config.notify_idle_timeout;
            let attrs = config.attributes.clone();
            std::thread::Builder::new()
                .name("mirror-notify".into())
                .spawn(move || {
                    run_notify_feed(
                        client, notify_tx, cancel, health, metrics, idle_timeout, &attrs,
                    )
                })
                .expect("spawn notify feed")
        };

        let consumer = {
            let health = Arc::clone(&health);
            std::thread::Builder::new()
                .name("mirror-consumer".into())
                .spawn(move || run_consumer(store, bulk_rx, notify_rx, health))
                .expect("spawn consumer")
        };

        Self {
            cancel,
            health,
            bulk: Some(bulk),
            notify: Some(notify),
            consumer: Some(consumer),
        }
    }

    pub fn health(&self) -> Arc<FeedHealth> {
        Arc::clone(&self.health)
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Cancel and join everything. A consumer panic is re-raised here:
    /// store corruption must take the process down, not be swallowed.
    pub fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.bulk.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.notify.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.consumer.take() {
            if let Err(panic) = handle.join() {
                std::panic::resume_unwind(panic);
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
fn run_bulk_feed(
    client: Arc<dyn DirectoryClient>,
    tx: Sender<FeedItem>,
    cancel: CancelToken,
    health: Arc<FeedHealth>,
    metrics: Arc<PipelineMetrics>,
    page_size: u32,
    attrs: &AttributeSelection,
) {
    let mut pages = match client.open_bulk(page_size, attrs) {
        Ok(pages) => pages,
        Err(err) => {
            health.record_bulk_error(err);
            return;
        }
    };

    loop {
        if cancel.is_cancelled() {
            return;
        }
        // The next server request is issued only after the previous page
        // has been fully enqueued.
        match pages.next_page() {
            Ok(Some(page)) => {
                metrics.bulk_pages.incr();
                for mut record in page {
                    if let Err(err) = range::complete_ranged(&mut record, client.as_ref()) {
                        health.record_bulk_error(err);
                        return;
                    }
                    metrics.bulk_records.incr();
                    if tx.send(FeedItem::Record(record)).is_err() {
                        return;
                    }
                }
            }
            Ok(None) => {
                let _ = tx.send(FeedItem::BulkComplete);
                return;
            }
            Err(err) => {
                health.record_bulk_error(err);
                return;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_notify_feed(
    client: Arc<dyn DirectoryClient>,
    tx: Sender<FeedItem>,
    cancel: CancelToken,
    health: Arc<FeedHealth>,
    metrics: Arc<PipelineMetrics>,
    idle_timeout: Duration,
    attrs: &AttributeSelection,
) {
    let mut stream = match client.open_notify(attrs) {
        Ok(stream) => stream,
        Err(err) => {
            health.record_notify_error(err);
            return;
        }
    };

    let mut last_activity = Instant::now();
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match stream.next_change(POLL_INTERVAL) {
            Ok(Some(mut record)) => {
                last_activity = Instant::now();
                if let Err(err) = range::complete_ranged(&mut record, client.as_ref()) {
                    health.record_notify_error(err);
                    return;
                }
                metrics.notify_records.incr();
                if tx.send(FeedItem::Record(record)).is_err() {
                    return;
                }
            }
            Ok(None) => {
                if last_activity.elapsed() >= idle_timeout {
                    health.record_notify_error(FeedError::transient(
                        "change stream idle past deadline",
                    ));
                    return;
                }
            }
            Err(err) => {
                health.record_notify_error(err);
                return;
            }
        }
    }
}

fn run_consumer(
    store: Arc<Store>,
    bulk_rx: Receiver<FeedItem>,
    notify_rx: Receiver<FeedItem>,
    health: Arc<FeedHealth>,
) {
    let mut bulk_rx = bulk_rx;
    let mut notify_rx = notify_rx;
    let mut bulk_open = true;
    let mut notify_open = true;

    while bulk_open || notify_open {
        crossbeam::select! {
            recv(bulk_rx) -> msg => match msg {
                Ok(FeedItem::Record(record)) => {
                    apply(&store, &record, RecordSource::BulkLoad);
                }
                Ok(FeedItem::BulkComplete) => {
                    store.resolve_all_deferred();
                    let deleted = store.delete_undetected();
                    tracing::info!(deleted, live = store.live_count(), "initial load complete");
                    health.set_initial_load_complete();
                }
                Err(_) => {
                    bulk_open = false;
                    bulk_rx = never();
                }
            },
            recv(notify_rx) -> msg => match msg {
                Ok(FeedItem::Record(record)) => {
                    apply(&store, &record, RecordSource::ChangeNotify);
                }
                Ok(FeedItem::BulkComplete) => {}
                Err(_) => {
                    notify_open = false;
                    notify_rx = never();
                }
            },
        }
    }
}

fn apply(store: &Store, record: &RawObject, source: RecordSource) {
    if let Err(err) = store.apply_record(record, source) {
        // Only consistency violations reach here; the store is no longer
        // trustworthy and the process must restart.
        panic!("store consistency violation while applying record: {err}");
    }
}
