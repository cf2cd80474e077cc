//! Pipeline watchdog.
//!
//! A repeating task polls the running pipeline for fault indicators. On
//! fault it tears both feeds down, selects a new DC, and starts a fresh
//! bulk-load/change-notify pair against it. In-memory state is
//! preserved across the switch: the re-load marks everything detecting,
//! and change-notified entities survive the replay by the priority
//! rule. A fatal feed error (credentials, configuration) stops the
//! watchdog instead of hammering the next DC with the same doomed bind.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::core::Store;
use crate::directory::{DirectoryConnector, FeedError};
use crate::locator::DcLocator;
use crate::metrics::MetricSink;
use crate::sync::backoff::Backoff;
use crate::sync::cancel::CancelToken;
use crate::sync::{FeedHealth, Pipeline, PipelineConfig};

#[derive(Clone, Debug)]
pub struct WatchdogConfig {
    pub interval: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            backoff_min: Duration::from_secs(2),
            backoff_max: Duration::from_secs(300),
        }
    }
}

/// Shared view of the pipeline generation currently running, so other
/// components (the snapshot writer) follow across restarts.
#[derive(Clone)]
pub struct HealthSlot {
    current: Arc<Mutex<Arc<FeedHealth>>>,
    fatal: Arc<Mutex<Option<FeedError>>>,
}

impl HealthSlot {
    pub fn new(health: Arc<FeedHealth>) -> Self {
        Self {
            current: Arc::new(Mutex::new(health)),
            fatal: Arc::new(Mutex::new(None)),
        }
    }

    pub fn health(&self) -> Arc<FeedHealth> {
        Arc::clone(&self.current.lock().expect("health slot poisoned"))
    }

    fn replace(&self, health: Arc<FeedHealth>) {
        *self.current.lock().expect("health slot poisoned") = health;
    }

    /// Set when the watchdog gave up; the mirror surfaces it.
    pub fn fatal_error(&self) -> Option<FeedError> {
        self.fatal.lock().expect("health slot poisoned").clone()
    }

    fn set_fatal(&self, err: FeedError) {
        *self.fatal.lock().expect("health slot poisoned") = Some(err);
    }
}

pub struct Watchdog {
    handle: Option<JoinHandle<()>>,
    cancel: CancelToken,
}

impl Watchdog {
    /// Take ownership of the running pipeline and babysit it.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        store: Arc<Store>,
        locator: Arc<DcLocator>,
        connector: Arc<dyn DirectoryConnector>,
        pipeline: Pipeline,
        pipeline_config: PipelineConfig,
        sink: Arc<dyn MetricSink>,
        slot: HealthSlot,
        config: WatchdogConfig,
        cancel: CancelToken,
    ) -> Self {
        let loop_cancel = cancel.clone();
        let handle = std::thread::Builder::new()
            .name("mirror-watchdog".into())
            .spawn(move || {
                run_watchdog(
                    store,
                    locator,
                    connector,
                    pipeline,
                    pipeline_config,
                    sink,
                    slot,
                    config,
                    loop_cancel,
                );
            })
            .expect("spawn watchdog");
        Self {
            handle: Some(handle),
            cancel,
        }
    }

    /// Cancel and join; the owned pipeline is stopped by the loop.
    pub fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(panic) = handle.join() {
                std::panic::resume_unwind(panic);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_watchdog(
    store: Arc<Store>,
    locator: Arc<DcLocator>,
    connector: Arc<dyn DirectoryConnector>,
    mut pipeline: Pipeline,
    pipeline_config: PipelineConfig,
    sink: Arc<dyn MetricSink>,
    slot: HealthSlot,
    config: WatchdogConfig,
    cancel: CancelToken,
) {
    loop {
        if !cancel.sleep(config.interval) {
            pipeline.stop();
            return;
        }

        let health = pipeline.health();
        if let Some(err) = health.fatal_error() {
            tracing::error!(%err, "pipeline fault is fatal; watchdog giving up");
            slot.set_fatal(err);
            pipeline.stop();
            return;
        }
        if !health.faulted() {
            continue;
        }

        tracing::warn!("pipeline fault detected; switching domain controller");
        pipeline.stop();

        let mut backoff = Backoff::new(config.backoff_min, config.backoff_max);
        let replacement = loop {
            match locator.select(connector.as_ref()) {
                Ok((selected, client)) => {
                    store.set_default_flat_name(selected.flat_name.clone());
                    break Pipeline::start(
                        Arc::clone(&store),
                        client,
                        pipeline_config.clone(),
                        Arc::clone(&sink),
                    );
                }
                Err(err) if err.is_fatal() => {
                    tracing::error!(%err, "dc selection failed fatally; watchdog giving up");
                    slot.set_fatal(err);
                    return;
                }
                Err(err) => {
                    tracing::warn!(%err, "dc selection failed; backing off");
                    if !cancel.sleep(backoff.next_delay()) {
                        return;
                    }
                }
            }
        };
        slot.replace(replacement.health());
        pipeline = replacement;
    }
}
