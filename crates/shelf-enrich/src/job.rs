//! A complete enrichment job: pre-flight checks, then the scheduler.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::info;

use crate::config::EnrichConfig;
use crate::dataset::Dataset;
use crate::extract::FieldExtractor;
use crate::fetch::{DocumentFetcher, DocumentSource};
use crate::identity::IdentityProvider;
use crate::progress::ProgressSender;
use crate::scheduler::{OutputColumns, Scheduler};
use crate::types::{EnrichResult, JobSummary};
use crate::worker::{EnrichmentWorker, RetryPolicy};

pub struct EnrichJob {
    config: EnrichConfig,
    identity: Arc<IdentityProvider>,
    source: Option<Arc<dyn DocumentSource>>,
    events: Option<ProgressSender>,
    job_id: String,
}

impl EnrichJob {
    /// Job with an identity provider built from `config.tor`.
    pub fn new(config: EnrichConfig) -> EnrichResult<Self> {
        config.validate()?;
        let identity = Arc::new(IdentityProvider::from_config(&config)?);
        Ok(Self::with_identity(config, identity))
    }

    pub fn with_identity(config: EnrichConfig, identity: Arc<IdentityProvider>) -> Self {
        Self {
            config,
            identity,
            source: None,
            events: None,
            job_id: format!("job-{}", Utc::now().format("%Y%m%dT%H%M%S")),
        }
    }

    /// Replace the HTTP fetcher with another document source.
    pub fn with_source(mut self, source: Arc<dyn DocumentSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_progress(mut self, events: ProgressSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &EnrichConfig {
        &self.config
    }

    pub fn identity(&self) -> &Arc<IdentityProvider> {
        &self.identity
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Enrich `dataset` in place.
    ///
    /// The entity limit is applied and every column is resolved before any
    /// network activity; the identity provider is verified before the first
    /// task is dispatched.
    pub async fn run(&self, dataset: &mut Dataset) -> EnrichResult<JobSummary> {
        let started = Instant::now();
        let config = &self.config;
        config.validate()?;
        dataset.apply_limit(config.entity_limit)?;

        let columns = OutputColumns {
            key: dataset.column(&config.columns.key)?,
            title: dataset.column(&config.columns.title).ok(),
            author: dataset.column(&config.columns.author).ok(),
            taxonomy: dataset.ensure_column(&config.columns.taxonomy),
            image: dataset.ensure_column(&config.columns.image),
        };
        let extractor = Arc::new(FieldExtractor::new(&config.selectors)?);

        let progress = if dataset.is_empty() {
            info!("dataset is empty, nothing to enrich");
            Default::default()
        } else {
            self.identity.verify().await?;
            let source: Arc<dyn DocumentSource> = match &self.source {
                Some(source) => source.clone(),
                None => Arc::new(DocumentFetcher::new(
                    config.base_url.clone(),
                    self.identity.clone(),
                )),
            };
            let worker =
                EnrichmentWorker::new(source, extractor, RetryPolicy::new(config.max_retries));
            Scheduler::new(worker, config.pool_width)
                .with_progress(self.events.clone(), self.job_id.clone())
                .run(dataset, columns)
                .await?
        };

        let summary = JobSummary {
            total: dataset.len(),
            done: progress.done,
            failed: progress.failed,
            requests: self.identity.requests_issued().await,
            rotations: self.identity.rotations().await,
            elapsed_ms: started.elapsed().as_millis() as u64,
            finished_at: Utc::now(),
        };
        info!(
            total = summary.total,
            done = summary.done,
            failed = summary.failed,
            rotations = summary.rotations,
            "enrichment finished"
        );
        Ok(summary)
    }
}
