//! Mirror run-loop.
//!
//! Glues the pieces together for a single domain: warm start from the
//! snapshot, DC selection with startup backoff, the sync pipeline, the
//! watchdog, and the periodic snapshot writer. The embedder gets back a
//! handle exposing the store as the query surface.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crate::config::Config;
use crate::core::Store;
use crate::defects::DefectLog;
use crate::directory::DirectoryConnector;
use crate::error::Error;
use crate::locator::{DcLocator, LocatorConfig};
use crate::metrics::{MetricSink, MetricSinkExt};
use crate::snapshot;
use crate::sync::backoff::Backoff;
use crate::sync::cancel::CancelToken;
use crate::sync::{FeedHealth, Pipeline, PipelineConfig};
use crate::watchdog::{HealthSlot, Watchdog, WatchdogConfig};
use crate::{
    directory::{AttributeSelection, FeedError},
    paths,
};

/// A running mirror for one domain.
pub struct Mirror {
    store: Arc<Store>,
    cancel: CancelToken,
    watchdog: Option<Watchdog>,
    snapshot_writer: Option<JoinHandle<()>>,
    slot: HealthSlot,
    snapshot_file: PathBuf,
}

impl Mirror {
    /// Bring the mirror up: warm start, select a DC (retrying with
    /// doubling backoff on transient init failures), start the pipeline
    /// and its minders. Returns once the pipeline is running; the
    /// initial load continues in the background.
    pub fn start(
        config: Config,
        connector: Arc<dyn DirectoryConnector>,
        sink: Arc<dyn MetricSink>,
    ) -> Result<Self, Error> {
        let base = config.data_base();
        if let Err(err) = fs::create_dir_all(&base) {
            tracing::warn!(dir = %base.display(), %err, "data dir unavailable");
        }
        let snapshot_file = paths::cache_file(&base, &config.identity, &config.domain);
        let defect_file = paths::defect_log_file(&base, &config.identity, &config.domain);
        let sidecar_file = paths::dc_sidecar_file(&base, &config.identity, &config.domain);

        let defects = Arc::new(DefectLog::open(&defect_file));
        let store = Arc::new(Store::new(defects, Arc::clone(&sink)));

        // Warm start: any usable snapshot beats an empty table; a bad
        // one just means a cold start.
        match snapshot::read_snapshot(&snapshot_file) {
            Ok(slots) => match store.restore(slots) {
                Ok(live) => {
                    tracing::info!(live, file = %snapshot_file.display(), "warm start from snapshot");
                }
                Err(err) => {
                    tracing::warn!(%err, "snapshot inconsistent; starting empty");
                }
            },
            Err(err) if err.is_missing() => {
                tracing::info!("no snapshot; starting empty");
            }
            Err(err) => {
                tracing::warn!(%err, "snapshot rejected; starting empty");
            }
        }

        let locator = Arc::new(DcLocator::new(LocatorConfig {
            domain: config.domain.clone(),
            preferred_server: config.preferred_server.clone(),
            sidecar_path: Some(sidecar_file),
            bootstrap_timeout: config.bootstrap_timeout(),
            local_ipv4_override: None,
        }));

        let cancel = CancelToken::new();
        let mut backoff = Backoff::new(config.backoff_min(), config.backoff_max());
        let (selected, client) = loop {
            match locator.select(connector.as_ref()) {
                Ok(found) => break found,
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    tracing::warn!(%err, "startup dc selection failed; backing off");
                    if !cancel.sleep(backoff.next_delay()) {
                        return Err(FeedError::transient("cancelled during startup").into());
                    }
                }
            }
        };
        store.set_default_flat_name(selected.flat_name.clone());

        let pipeline_config = PipelineConfig {
            page_size: config.bulk_load_page_size,
            queue_capacity: config.queue_capacity,
            notify_idle_timeout: config.notify_idle_timeout(),
            attributes: AttributeSelection {
                load_all: config.load_all_attributes,
                extra: config.other_attributes.clone(),
            },
        };
        let pipeline = Pipeline::start(
            Arc::clone(&store),
            client,
            pipeline_config.clone(),
            Arc::clone(&sink),
        );
        let slot = HealthSlot::new(pipeline.health());

        let watchdog = Watchdog::start(
            Arc::clone(&store),
            locator,
            connector,
            pipeline,
            pipeline_config,
            Arc::clone(&sink),
            slot.clone(),
            WatchdogConfig {
                interval: config.watchdog_interval(),
                backoff_min: config.backoff_min(),
                backoff_max: config.backoff_max(),
            },
            cancel.clone(),
        );

        let snapshot_writer = {
            let store = Arc::clone(&store);
            let slot = slot.clone();
            let cancel = cancel.clone();
            let path = snapshot_file.clone();
            let interval = config.snapshot_interval();
            let ok = sink.counter("snapshot_write_ok");
            let failed = sink.counter("snapshot_write_err");
            let timer = sink.timer("snapshot_write");
            std::thread::Builder::new()
                .name("mirror-snapshot".into())
                .spawn(move || {
                    while cancel.sleep(interval) {
                        if !slot.health().initial_load_complete() {
                            continue;
                        }
                        write_snapshot_once(&store, &path, &ok, &failed, &timer);
                    }
                })
                .expect("spawn snapshot writer")
        };

        Ok(Self {
            store,
            cancel,
            watchdog: Some(watchdog),
            snapshot_writer: Some(snapshot_writer),
            slot,
            snapshot_file,
        })
    }

    /// The query surface.
    pub fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    pub fn health(&self) -> Arc<FeedHealth> {
        self.slot.health()
    }

    pub fn initial_load_complete(&self) -> bool {
        self.slot.health().initial_load_complete()
    }

    /// Set when the watchdog gave up on a fatal feed fault.
    pub fn fatal_error(&self) -> Option<FeedError> {
        self.slot.fatal_error()
    }

    /// Stop everything and write a parting snapshot so the next start
    /// is warm.
    pub fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.snapshot_writer.take() {
            let _ = handle.join();
        }
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.stop();
        }
        if self.slot.health().initial_load_complete() {
            match snapshot::write_snapshot(&self.snapshot_file, &self.store.capture()) {
                Ok(stats) => {
                    tracing::info!(entities = stats.elements_written, "final snapshot written");
                }
                Err(err) => tracing::warn!(%err, "final snapshot failed"),
            }
        }
    }
}

fn write_snapshot_once(
    store: &Store,
    path: &std::path::Path,
    ok: &crate::metrics::Counter,
    failed: &crate::metrics::Counter,
    timer: &crate::metrics::Timer,
) {
    let started = Instant::now();
    // Capture under the read lock, serialize outside it.
    let slots = store.capture();
    match snapshot::write_snapshot(path, &slots) {
        Ok(stats) => {
            ok.incr();
            timer.observe(started.elapsed());
            tracing::debug!(
                entities = stats.elements_written,
                bytes = stats.file_bytes,
                "snapshot written"
            );
        }
        Err(err) => {
            failed.incr();
            tracing::warn!(%err, "snapshot write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics;
    use crate::test_harness::{RecordBuilder, ScriptedConnector, ScriptedDirectory};
    use std::time::Duration;

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("timed out waiting for {what}");
    }

    fn test_config(data_dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.domain = "corp.invalid".into();
        config.preferred_server = Some("dc1".into());
        config.snapshot_path = Some(data_dir.to_path_buf());
        config.snapshot_interval_secs = 1;
        config.watchdog_interval_secs = 1;
        config.backoff_min_secs = 1;
        config.backoff_max_secs = 1;
        config.bootstrap_timeout_secs = 1;
        config.logging.stdout = false;
        config
    }

    #[test]
    fn cold_start_load_shutdown_then_warm_start() {
        let data = tempfile::tempdir().unwrap();
        let connector = Arc::new(ScriptedConnector::new());
        let dc = ScriptedDirectory::new("CORP");
        dc.push_page(vec![
            RecordBuilder::user(1, "CN=A,DC=x").sam("a").build(),
            RecordBuilder::group(2, "CN=G,DC=x").member("CN=A,DC=x").build(),
        ]);
        connector.add("dc1", Arc::clone(&dc));

        let mirror = Mirror::start(
            test_config(data.path()),
            Arc::clone(&connector) as Arc<dyn DirectoryConnector>,
            metrics::noop(),
        )
        .unwrap();
        wait_until("initial load", || mirror.initial_load_complete());

        let store = mirror.store();
        assert_eq!(store.live_count(), 2);
        assert_eq!(
            store.default_flat_name().as_deref(),
            Some("CORP"),
            "flat name learned from bootstrap"
        );
        mirror.shutdown();

        let cache = data.path().join("mirror.corp.invalid.cache");
        assert!(cache.exists(), "shutdown wrote a parting snapshot");

        // Second start is warm: entities are queryable before any load.
        // The bulk feed cannot even open, so the answers below can only
        // come from the snapshot.
        let dc2 = ScriptedDirectory::new("CORP");
        dc2.set_open_bulk_failure(Some(crate::directory::FeedError::transient("outage")));
        let connector2 = Arc::new(ScriptedConnector::new());
        connector2.add("dc1", dc2);
        let mut config = test_config(data.path());
        config.watchdog_interval_secs = 3600;
        let mirror = Mirror::start(
            config,
            connector2 as Arc<dyn DirectoryConnector>,
            metrics::noop(),
        )
        .unwrap();
        let store = mirror.store();
        let a = store.lookup_by_sam_account_name("a").unwrap();
        let g = store.lookup_by_dn("CN=G,DC=x").unwrap();
        assert!(g.links.direct_members.contains(&a.tag));
        store.verify_consistency().unwrap();
        mirror.shutdown();
    }

    #[test]
    fn periodic_snapshots_appear_after_the_load() {
        let data = tempfile::tempdir().unwrap();
        let connector = Arc::new(ScriptedConnector::new());
        let dc = ScriptedDirectory::new("CORP");
        dc.push_page(vec![RecordBuilder::user(1, "CN=A,DC=x").build()]);
        connector.add("dc1", dc);

        let mirror = Mirror::start(
            test_config(data.path()),
            connector as Arc<dyn DirectoryConnector>,
            metrics::noop(),
        )
        .unwrap();
        wait_until("initial load", || mirror.initial_load_complete());

        let cache = data.path().join("mirror.corp.invalid.cache");
        wait_until("periodic snapshot", || cache.exists());
        mirror.shutdown();
    }
}
