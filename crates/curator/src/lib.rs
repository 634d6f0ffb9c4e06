pub mod balance;
pub mod cli;
pub mod config;
pub mod corpus;
pub mod dedup;
pub mod errors;
pub mod fingerprint;
pub mod ingest;
pub mod integrity;
pub mod labels;
pub mod manifest;
pub mod persist;
pub mod pipeline;
pub mod source;
pub mod split;
pub mod telemetry;
pub mod types;
pub mod validate;

pub use config::{CuratorConfig, Overrides, SplitConfig};
pub use corpus::UnifiedCorpus;
pub use errors::{CuratorError, Result};
pub use pipeline::{CurationOutput, CurationStage, Curator};
pub use split::{SplitAssignment, SplitOptions};
pub use types::{Annotation, BoundingBox, ImageRecord, Partition, UnifiedClass};
