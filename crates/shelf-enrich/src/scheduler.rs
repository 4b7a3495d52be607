//! Bounded fan-out of enrichment tasks and in-order merging of their results.
//!
//! Tasks complete in any order. Each completion carries the row index it was
//! dispatched for, and the [`Aggregator`] is the only writer of the dataset,
//! so the output keeps the input's row order regardless of pool width.

use std::time::Instant;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::dataset::Dataset;
use crate::progress::{self, ProgressEventKind, ProgressSender};
use crate::types::{EnrichError, EnrichResult, EnrichmentResult, Progress};
use crate::worker::EnrichmentWorker;

/// Column positions the aggregator reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputColumns {
    pub key: usize,
    /// Title and author are used for diagnostics only.
    pub title: Option<usize>,
    pub author: Option<usize>,
    pub taxonomy: usize,
    pub image: usize,
}

/// Merges results into the dataset at their original positions.
pub struct Aggregator<'a> {
    dataset: &'a mut Dataset,
    columns: OutputColumns,
    merged: Vec<bool>,
    progress: Progress,
    events: Option<ProgressSender>,
    job_id: String,
    seq: u64,
}

impl<'a> Aggregator<'a> {
    pub fn new(dataset: &'a mut Dataset, columns: OutputColumns) -> Self {
        let rows = dataset.len();
        Self {
            dataset,
            columns,
            merged: vec![false; rows],
            progress: Progress::default(),
            events: None,
            job_id: String::new(),
            seq: 0,
        }
    }

    pub fn with_events(mut self, events: Option<ProgressSender>, job_id: impl Into<String>) -> Self {
        self.events = events;
        self.job_id = job_id.into();
        self
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    /// Whether every row has been merged exactly once.
    pub fn is_complete(&self) -> bool {
        self.progress.merged() == self.merged.len()
    }

    /// Merge one result. A second merge for the same row is rejected.
    pub fn apply(&mut self, index: usize, key: &str, result: &EnrichmentResult) -> EnrichResult<()> {
        match self.merged.get_mut(index) {
            None => return Err(EnrichError::UnknownRow(index)),
            Some(true) => return Err(EnrichError::DuplicateMerge(index)),
            Some(slot) => *slot = true,
        }

        let cell = |col: Option<usize>| col.and_then(|c| self.dataset.get(index, c)).unwrap_or_default();
        let title = cell(self.columns.title).to_string();
        let desc = describe(key, &title, cell(self.columns.author));

        match result {
            EnrichmentResult::Success { fields, attempts } => {
                self.dataset
                    .set(index, self.columns.taxonomy, fields.taxonomy_column());
                self.dataset
                    .set(index, self.columns.image, fields.image.as_str());
                self.progress.done += 1;
                info!("[Updated] {desc}");
                debug!(key, attempts, "merged row {index}");
            }
            failure => {
                self.dataset.set(index, self.columns.taxonomy, "");
                self.dataset.set(index, self.columns.image, "");
                self.progress.failed += 1;
                warn!("[Failed] {desc}: {}", failure.reason().unwrap_or_default());
            }
        }

        let Progress { done, failed } = self.progress;
        self.emit(ProgressEventKind::EntityMerged {
            index,
            key: key.to_string(),
            title,
            success: result.is_success(),
            reason: result.reason().map(String::from),
            done,
            failed,
        });
        Ok(())
    }

    fn emit(&mut self, event: ProgressEventKind) {
        progress::emit(&self.events, &self.job_id, &mut self.seq, event);
    }
}

/// `key: title (author)`, leaving out whatever is blank.
fn describe(key: &str, title: &str, author: &str) -> String {
    let mut desc = key.to_string();
    if !title.is_empty() {
        desc.push_str(": ");
        desc.push_str(title);
    }
    if !author.is_empty() {
        desc.push_str(&format!(" ({author})"));
    }
    desc
}

/// Runs one worker task per entity on a pool of fixed width.
pub struct Scheduler {
    worker: EnrichmentWorker,
    pool_width: usize,
    events: Option<ProgressSender>,
    job_id: String,
}

impl Scheduler {
    pub fn new(worker: EnrichmentWorker, pool_width: usize) -> Self {
        Self {
            worker,
            pool_width: pool_width.max(1),
            events: None,
            job_id: String::new(),
        }
    }

    pub fn with_progress(mut self, events: Option<ProgressSender>, job_id: impl Into<String>) -> Self {
        self.events = events;
        self.job_id = job_id.into();
        self
    }

    /// Enrich every row of `dataset` and merge the results in place.
    ///
    /// Returns once every dispatched task was merged. A rotation failure
    /// stops dispatch, drops in-flight tasks and is returned as the job error.
    pub async fn run(&self, dataset: &mut Dataset, columns: OutputColumns) -> EnrichResult<Progress> {
        let started = Instant::now();
        let entities = dataset.entities(columns.key);
        let total = entities.len();

        let mut aggregator =
            Aggregator::new(dataset, columns).with_events(self.events.clone(), self.job_id.clone());
        aggregator.emit(ProgressEventKind::JobStarted {
            total,
            pool_width: self.pool_width,
        });
        info!(total, pool_width = self.pool_width, "dispatching enrichment tasks");

        let worker = &self.worker;
        let mut completions = stream::iter(entities)
            .map(|(index, key)| async move {
                let result = worker.enrich(&key).await;
                (index, key, result)
            })
            .buffer_unordered(self.pool_width);

        while let Some((index, key, result)) = completions.next().await {
            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    aggregator.emit(ProgressEventKind::Warning {
                        message: format!("aborting at {key}: {e}"),
                    });
                    return Err(e.into());
                }
            };
            aggregator.apply(index, &key, &result)?;
        }

        debug_assert!(aggregator.is_complete());
        let Progress { done, failed } = aggregator.progress();
        aggregator.emit(ProgressEventKind::JobComplete {
            done,
            failed,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
        Ok(aggregator.progress())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SelectorConfig;
    use crate::extract::FieldExtractor;
    use crate::fetch::{Document, DocumentSource};
    use crate::types::{EnrichedFields, FetchError, RotationError};
    use crate::worker::RetryPolicy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const BOOK_PAGE: &str = include_str!("../tests/fixtures/book_show.html");
    const INTERSTITIAL: &str = include_str!("../tests/fixtures/interstitial.html");

    /// Keys starting with `x` get an interstitial, `boom` fails rotation,
    /// everything else gets a full page. Lower keys answer later.
    #[derive(Default)]
    struct CatalogSource {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        fetched: std::sync::Mutex<Vec<String>>,
    }

    impl CatalogSource {
        fn fetched(&self) -> Vec<String> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DocumentSource for CatalogSource {
        async fn fetch(&self, key: &str) -> Result<Document, FetchError> {
            self.fetched.lock().unwrap().push(key.to_string());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let delay = 40u64.saturating_sub(key.trim_start_matches('x').parse::<u64>().unwrap_or(0) * 4);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if key == "boom" {
                return Err(RotationError::Authentication("rejected".into()).into());
            }
            let body = if key.starts_with('x') { INTERSTITIAL } else { BOOK_PAGE };
            Ok(Document {
                url: format!("http://books.test/show/{key}"),
                final_url: format!("http://books.test/show/{key}"),
                status: 200,
                body: body.to_string(),
                generation: 0,
            })
        }
    }

    fn dataset(keys: &[&str]) -> (Dataset, OutputColumns) {
        let mut ds = Dataset::new(
            vec!["Book Id".into(), "Title".into()],
            keys.iter()
                .map(|k| vec![k.to_string(), format!("Title {k}")])
                .collect(),
        );
        let columns = OutputColumns {
            key: 0,
            title: Some(1),
            author: None,
            taxonomy: ds.ensure_column("Genres"),
            image: ds.ensure_column("Cover Image"),
        };
        (ds, columns)
    }

    fn scheduler(source: Arc<CatalogSource>, width: usize) -> Scheduler {
        let extractor = Arc::new(FieldExtractor::new(&SelectorConfig::default()).unwrap());
        Scheduler::new(
            EnrichmentWorker::new(source, extractor, RetryPolicy::new(2)),
            width,
        )
    }

    #[tokio::test]
    async fn test_results_land_in_original_rows() {
        let keys = ["1", "x2", "3", "4", "x5", "6", "7", "8"];
        let (mut ds, columns) = dataset(&keys);
        let source = Arc::new(CatalogSource::default());

        let progress = scheduler(source.clone(), 4).run(&mut ds, columns).await.unwrap();

        assert_eq!(progress, Progress { done: 6, failed: 2 });
        for (row, key) in keys.iter().enumerate() {
            assert_eq!(ds.get(row, 0), Some(*key));
            assert_eq!(ds.get(row, 1), Some(format!("Title {key}").as_str()));
            let genres = ds.get(row, columns.taxonomy).unwrap();
            if key.starts_with('x') {
                assert_eq!(genres, "");
                assert_eq!(ds.get(row, columns.image), Some(""));
            } else {
                assert_eq!(genres, "Fantasy, Young Adult > Young Adult Fantasy");
            }
        }
        assert!(source.peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn test_order_independent_of_pool_width() {
        let keys = ["1", "2", "x3", "4", "5"];
        let mut outputs = Vec::new();
        for width in [1, 2, 5, 16] {
            let (mut ds, columns) = dataset(&keys);
            scheduler(Arc::new(CatalogSource::default()), width)
                .run(&mut ds, columns)
                .await
                .unwrap();
            outputs.push(ds);
        }
        assert!(outputs.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_rotation_failure_aborts_job() {
        let (mut ds, columns) = dataset(&["1", "boom", "3", "4"]);
        let source = Arc::new(CatalogSource::default());
        let result = scheduler(source.clone(), 1).run(&mut ds, columns).await;
        assert!(matches!(result, Err(EnrichError::Rotation(_))));

        // No task is started once the rotation failure is seen.
        assert_eq!(source.fetched(), vec!["1", "boom"]);
        assert_eq!(ds.get(2, columns.taxonomy), Some(""));
        assert_eq!(ds.get(3, columns.taxonomy), Some(""));
    }

    #[tokio::test]
    async fn test_progress_events_emitted() {
        let (tx, mut rx) = progress::channel();
        let (mut ds, columns) = dataset(&["1", "x2"]);
        scheduler(Arc::new(CatalogSource::default()), 2)
            .with_progress(Some(tx), "job-test")
            .run(&mut ds, columns)
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.job_id, "job-test");
            kinds.push(event.event);
        }
        assert_eq!(kinds.len(), 4);
        assert!(matches!(kinds[0], ProgressEventKind::JobStarted { total: 2, .. }));
        assert!(matches!(
            kinds[3],
            ProgressEventKind::JobComplete { done: 1, failed: 1, .. }
        ));
    }

    #[test]
    fn test_duplicate_merge_rejected() {
        let (mut ds, columns) = dataset(&["1", "2"]);
        let mut aggregator = Aggregator::new(&mut ds, columns);
        let ok = EnrichmentResult::Success {
            fields: EnrichedFields {
                taxonomy: vec!["Horror".into()],
                image: "https://img/1.jpg".into(),
            },
            attempts: 1,
        };
        aggregator.apply(0, "1", &ok).unwrap();
        assert!(matches!(
            aggregator.apply(0, "1", &ok),
            Err(EnrichError::DuplicateMerge(0))
        ));
        assert!(matches!(
            aggregator.apply(9, "9", &ok),
            Err(EnrichError::UnknownRow(9))
        ));
        assert_eq!(aggregator.progress(), Progress { done: 1, failed: 0 });
        assert!(!aggregator.is_complete());
    }

    #[test]
    fn test_describe_row() {
        assert_eq!(
            describe("40042001", "Shadow & Flame", "Mindee Arnett"),
            "40042001: Shadow & Flame (Mindee Arnett)"
        );
        assert_eq!(describe("7", "", "Anon"), "7 (Anon)");
        assert_eq!(describe("7", "", ""), "7");
    }

    #[test]
    fn test_failure_blanks_output_cells() {
        let (mut ds, columns) = dataset(&["1"]);
        ds.set(0, columns.taxonomy, "stale");
        let mut aggregator = Aggregator::new(&mut ds, columns);
        let failed = EnrichmentResult::FetchFailure {
            reason: "HTTP 503".into(),
            attempts: 3,
        };
        aggregator.apply(0, "1", &failed).unwrap();
        assert!(aggregator.is_complete());
        assert_eq!(ds.get(0, columns.taxonomy), Some(""));
    }
}
