//! shelf-enrich: catalog enrichment over an anonymizing, identity-rotating HTTP layer.

pub mod config;
pub mod dataset;
pub mod extract;
pub mod fetch;
pub mod identity;
pub mod job;
pub mod progress;
pub mod scheduler;
pub mod types;
pub mod worker;

pub use config::{ColumnConfig, ControlAuth, EnrichConfig, SelectorConfig, TorConfig};
pub use dataset::Dataset;
pub use extract::{ExtractedFields, FieldExtractor};
pub use fetch::{book_url, Document, DocumentFetcher, DocumentSource};
pub use identity::{whoami, IdentityProvider, IdentitySettings, IpInfo, Session};
pub use job::EnrichJob;
pub use scheduler::{Aggregator, OutputColumns, Scheduler};
pub use types::*;
pub use worker::{EnrichmentWorker, RetryPolicy};
