//! Tracing initialization: stdout and rolling-file layers with
//! retention pruning of rotated log files.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{FileLoggingConfig, LogFormat, LogRotation, LoggingConfig};
use crate::paths;

const LOG_FILE_PREFIX: &str = "dirmirror.log";

/// Keeps the non-blocking appender workers alive.
pub struct TelemetryGuard {
    _guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init(verbosity: u8, logging: &LoggingConfig) -> TelemetryGuard {
    let filter = build_filter(
        verbosity,
        logging.filter.as_deref(),
        std::env::var("DM_LOG").ok(),
    );

    let mut guards = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if logging.stdout {
        layers.push(build_stdout_layer(logging.stdout_format));
    }

    let mut file_dir = None;
    let mut file_setup_error = None;
    if logging.file.enabled {
        let dir = resolve_log_dir(&logging.file);
        match fs::create_dir_all(&dir) {
            Ok(()) => {
                let (layer, guard) = build_file_layer(&logging.file, &dir);
                layers.push(layer);
                guards.push(guard);
                file_dir = Some(dir);
            }
            Err(err) => {
                file_setup_error =
                    Some(format!("log dir init failed for {}: {err}", dir.display()));
            }
        }
    }

    layers.push(Box::new(filter));

    Registry::default().with(layers).init();

    if let Some(error) = file_setup_error {
        tracing::warn!("{error}");
    }
    // Prune after init so the freshly rolled file is the newest candidate
    // and the outcome can be reported through the live subscriber.
    if let Some(dir) = file_dir {
        let (removed, failed) = prune_stale_logs(&dir, &logging.file, SystemTime::now());
        if removed > 0 || failed > 0 {
            tracing::info!(removed, failed, "stale log files pruned");
        }
    }

    TelemetryGuard { _guards: guards }
}

/// Filter precedence: the `DM_LOG` env var beats the configured
/// `logging.filter` directives, which beat the plain verbosity level.
fn build_filter(verbosity: u8, configured: Option<&str>, env_value: Option<String>) -> EnvFilter {
    let builder =
        EnvFilter::builder().with_default_directive(level_from_verbosity(verbosity).into());
    let directives = env_value
        .filter(|v| !v.trim().is_empty())
        .or_else(|| configured.map(str::to_string))
        .unwrap_or_default();
    builder.parse_lossy(directives)
}

fn build_stdout_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        LogFormat::Tree => Box::new(tracing_tree::HierarchicalLayer::new(2)),
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true)
                .with_current_span(true)
                .with_span_list(true),
        ),
    }
}

fn build_file_layer(
    config: &FileLoggingConfig,
    dir: &Path,
) -> (
    Box<dyn Layer<Registry> + Send + Sync>,
    tracing_appender::non_blocking::WorkerGuard,
) {
    let rotation = match config.rotation {
        LogRotation::Daily => tracing_appender::rolling::Rotation::DAILY,
        LogRotation::Hourly => tracing_appender::rolling::Rotation::HOURLY,
        LogRotation::Never => tracing_appender::rolling::Rotation::NEVER,
    };
    let appender =
        tracing_appender::rolling::RollingFileAppender::new(rotation, dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Tree => Box::new(
            tracing_tree::HierarchicalLayer::new(2)
                .with_ansi(false)
                .with_writer(writer),
        ),
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_names(true),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_names(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_target(true)
                .with_thread_names(true)
                .with_current_span(true)
                .with_span_list(true),
        ),
    };
    (layer, guard)
}

fn level_from_verbosity(verbosity: u8) -> tracing::metadata::LevelFilter {
    match verbosity {
        0 => tracing::metadata::LevelFilter::ERROR,
        1 => tracing::metadata::LevelFilter::INFO,
        _ => tracing::metadata::LevelFilter::DEBUG,
    }
}

fn resolve_log_dir(config: &FileLoggingConfig) -> PathBuf {
    config.dir.clone().unwrap_or_else(paths::log_dir)
}

/// Delete rotated `dirmirror.log*` files past the retention limits.
///
/// Returns (removed, failed). The currently active file is always the
/// newest candidate, so neither limit can take it.
fn prune_stale_logs(dir: &Path, config: &FileLoggingConfig, now: SystemTime) -> (usize, usize) {
    let max_age = config
        .retention_max_age_days
        .map(|days| Duration::from_secs(days.saturating_mul(24 * 60 * 60)));
    if max_age.is_none() && config.retention_max_files.is_none() {
        return (0, 0);
    }

    let Ok(entries) = fs::read_dir(dir) else {
        return (0, 0);
    };
    let mut files: Vec<(PathBuf, SystemTime)> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let is_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
        if !is_log {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        files.push((path, meta.modified().unwrap_or(now)));
    }

    let mut removed = 0usize;
    let mut failed = 0usize;
    for path in select_prunable(files, max_age, config.retention_max_files, now) {
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(_) => failed += 1,
        }
    }
    (removed, failed)
}

/// Pure retention policy: everything past the age cutoff, plus whatever
/// overflows the newest-N cap.
fn select_prunable(
    mut files: Vec<(PathBuf, SystemTime)>,
    max_age: Option<Duration>,
    max_files: Option<usize>,
    now: SystemTime,
) -> Vec<PathBuf> {
    files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut doomed = Vec::new();
    for (index, (path, modified)) in files.into_iter().enumerate() {
        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
        let too_old = max_age.is_some_and(|limit| age > limit);
        let over_cap = max_files.is_some_and(|cap| index >= cap);
        if too_old || over_cap {
            doomed.push(path);
        }
    }
    doomed
}
