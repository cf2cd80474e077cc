#![forbid(unsafe_code)]

pub mod config;
pub mod core;
pub mod defects;
pub mod directory;
pub mod error;
pub mod locator;
pub mod metrics;
pub mod mirror;
mod paths;
pub mod snapshot;
pub mod sync;
pub mod telemetry;
#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;
pub mod watchdog;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the core surface at the crate root for convenience
pub use crate::config::Config;
pub use crate::core::{
    ApplyOutcome, ConsistencyError, CoreError, DeferredKind, DeferredReference, DirTimestamp, Dn,
    Entity, EntityStatus, GroupType, Links, ObjectClass, ObjectGuid, ParseError, ParsedEntity,
    RecordSource, SamAccountType, Sid, Store, Tag, UserAccountControl,
};
pub use crate::directory::{
    AttrValue, AttributeSelection, BootstrapInfo, BulkPages, ChangeStream, DirectoryClient,
    DirectoryConnector, FeedError, RangedChunk, RawObject, SiteTopology, SubnetSite,
    DEFAULT_ATTRIBUTES,
};
pub use crate::metrics::{MetricSink, MetricSinkExt};
pub use crate::mirror::Mirror;
pub use crate::snapshot::{SnapshotError, SnapshotExporter, SnapshotStats};
pub use crate::sync::{FeedHealth, Pipeline, PipelineConfig};
