//! Two-stage tracking pipeline
//!
//! The fetch stage turns batches into persisted raw responses; the parse stage
//! turns persisted raw responses into per-shipment event records. Each stage
//! drains its own [`WorkQueue`] with a fixed [`WorkerPool`] and is fully joined
//! before the next one starts, so every raw response the parse stage reads was
//! durably written first.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shiptrack_common::{Result, TrackError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::batch::{Batch, BatchName, BatchSet};
use crate::config::PipelineConfig;
use crate::fetcher::{PartnerClient, ResilientFetcher};
use crate::models::RawResponse;
use crate::parser::ResponseParser;
use crate::progress::{LogSink, ProgressReporter, ProgressSink};
use crate::queue::{ProgressSnapshot, TaskFailure, WorkQueue};
use crate::store::{get_json, put_json, DurableStore, FsStore, Stage, StoreKey};
use crate::url::UrlBuilder;
use crate::worker::{TaskHandler, WorkerPool};

pub const FETCH_STAGE: &str = "fetch";
pub const PARSE_STAGE: &str = "parse";

// ============================================================================
// Reports
// ============================================================================

/// Outcome of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    pub total: usize,
    pub completed: usize,
    pub failed: Vec<TaskFailure>,
    /// Names of the tasks that completed, in enqueue order
    #[serde(skip)]
    pub completed_tasks: Vec<String>,
}

impl StageReport {
    fn collect<T: crate::queue::QueueTask>(
        stage: &str,
        queue: &WorkQueue<T>,
        snapshot: &ProgressSnapshot,
    ) -> Self {
        Self {
            stage: stage.to_string(),
            total: snapshot.total,
            completed: snapshot.completed,
            failed: queue.failures(),
            completed_tasks: queue.completed_labels(),
        }
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }
}

/// Outcome of the parse stage, with per-identifier tallies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseReport {
    pub stage: StageReport,
    pub identifiers_parsed: usize,
    pub identifiers_degraded: usize,
    pub identifiers_failed: usize,
}

/// User-visible result of a full run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub partner: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub identifiers_requested: usize,
    pub fetch: StageReport,
    pub parse: StageReport,
    pub identifiers_parsed: usize,
    pub identifiers_degraded: usize,
    pub identifiers_failed: usize,
}

impl RunSummary {
    /// Batches that failed in either stage
    pub fn failed_batches(&self) -> usize {
        self.fetch.failed_count() + self.parse.failed_count()
    }

    pub fn is_clean(&self) -> bool {
        self.failed_batches() == 0 && self.identifiers_failed == 0
    }
}

// ============================================================================
// Stage handlers
// ============================================================================

struct FetchHandler {
    partner: String,
    urls: UrlBuilder,
    client: Arc<dyn PartnerClient>,
    store: Arc<dyn DurableStore>,
}

#[async_trait]
impl TaskHandler<Batch> for FetchHandler {
    async fn handle(&self, batch: Batch) -> Result<()> {
        let requests = self.urls.requests_for(&batch)?;

        let mut records = Vec::new();
        for request in &requests {
            records.extend(self.client.fetch(request).await?);
        }

        let response = RawResponse::new(batch.name(), records);
        let key = StoreKey::batch(&self.partner, batch.name());
        put_json(self.store.as_ref(), &key, &response).await?;

        info!(
            partner = %self.partner,
            batch = batch.name(),
            identifiers = batch.len(),
            requests = requests.len(),
            records = response.records.len(),
            "Persisted raw response"
        );
        Ok(())
    }
}

#[derive(Default)]
struct ParseTallies {
    parsed: AtomicUsize,
    degraded: AtomicUsize,
    failed: AtomicUsize,
}

struct ParseHandler {
    partner: String,
    parser: ResponseParser,
    store: Arc<dyn DurableStore>,
    retain_raw: bool,
    tallies: Arc<ParseTallies>,
}

#[async_trait]
impl TaskHandler<BatchName> for ParseHandler {
    async fn handle(&self, name: BatchName) -> Result<()> {
        let key = StoreKey::batch(&self.partner, name.as_str());
        let raw: RawResponse = get_json(self.store.as_ref(), &key)
            .await?
            .ok_or_else(|| TrackError::persistence(key.to_string(), "raw response not found"))?;

        let parsed = self.parser.parse(&raw);
        let mut persisted = 0usize;
        let mut unpersisted = 0usize;

        for outcome in parsed.outcomes {
            let degraded = outcome.is_degraded();
            let Some(group) = outcome.into_events() else {
                self.tallies.failed.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            // A repeated tracking id within a batch replaces the earlier group
            let details = StoreKey::details(&self.partner, &group.tracking_id);
            match put_json(self.store.as_ref(), &details, &group).await {
                Ok(()) => {
                    persisted += 1;
                    let tally = if degraded {
                        &self.tallies.degraded
                    } else {
                        &self.tallies.parsed
                    };
                    tally.fetch_add(1, Ordering::Relaxed);
                },
                Err(e) => {
                    warn!(
                        partner = %self.partner,
                        batch = %name,
                        tracking_id = %group.tracking_id,
                        error = %e,
                        "Failed to persist shipment events"
                    );
                    unpersisted += 1;
                    self.tallies.failed.fetch_add(1, Ordering::Relaxed);
                },
            }
        }

        if persisted == 0 {
            return Err(TrackError::NoUsableRecords(name.0));
        }

        // Raw data is the only way to recover records that were not written
        if unpersisted > 0 {
            warn!(
                partner = %self.partner,
                batch = %name,
                unpersisted,
                "Keeping raw response for records that failed to persist"
            );
        } else if !self.retain_raw {
            if let Err(e) = self.store.delete(&key).await {
                warn!(partner = %self.partner, batch = %name, error = %e, "Failed to delete raw response");
            } else {
                debug!(batch = %name, "Deleted raw response after parse");
            }
        }

        Ok(())
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Fetch-and-parse pipeline for one partner
pub struct TrackingPipeline {
    config: PipelineConfig,
    urls: UrlBuilder,
    parser: ResponseParser,
    client: Arc<dyn PartnerClient>,
    store: Arc<dyn DurableStore>,
    sink: Arc<dyn ProgressSink>,
    pool: WorkerPool,
}

impl TrackingPipeline {
    /// Pipeline with the HTTP fetcher, a filesystem store under
    /// `config.store_root` and log-based progress
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let client = Arc::new(ResilientFetcher::from_config(&config)?);
        let store = Arc::new(FsStore::new(config.store_root.clone()));
        Self::with_components(config, client, store)
    }

    /// Pipeline over caller-provided client and store
    pub fn with_components(
        config: PipelineConfig,
        client: Arc<dyn PartnerClient>,
        store: Arc<dyn DurableStore>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            urls: UrlBuilder::from_config(&config),
            parser: ResponseParser::with_fallback_formats(&config.datetime_formats),
            pool: WorkerPool::new(config.workers),
            sink: Arc::new(LogSink),
            client,
            store,
            config,
        })
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn url_builder(&self) -> &UrlBuilder {
        &self.urls
    }

    pub fn store(&self) -> Arc<dyn DurableStore> {
        Arc::clone(&self.store)
    }

    fn reporter(&self, stage: &str) -> Arc<ProgressReporter> {
        Arc::new(ProgressReporter::new(
            stage,
            self.config.progress_step,
            Arc::clone(&self.sink),
        ))
    }

    /// Fetch every batch and persist its raw response under `API_Batches`
    pub async fn fetch_stage(&self, batches: BatchSet) -> StageReport {
        let partner = &self.config.partner_name;
        info!(partner = %partner, batches = batches.len(), identifiers = batches.total_ids(), "Starting fetch stage");

        let queue = WorkQueue::from_tasks(batches);
        let handler = Arc::new(FetchHandler {
            partner: partner.clone(),
            urls: self.urls.clone(),
            client: Arc::clone(&self.client),
            store: Arc::clone(&self.store),
        });

        let snapshot = self
            .pool
            .run(FETCH_STAGE, Arc::clone(&queue), handler, self.reporter(FETCH_STAGE))
            .instrument(info_span!("stage", name = FETCH_STAGE))
            .await;

        let report = StageReport::collect(FETCH_STAGE, &queue, &snapshot);
        info!(
            partner = %partner,
            completed = report.completed,
            failed = report.failed_count(),
            "Fetch stage finished"
        );
        report
    }

    /// Parse persisted raw responses and persist events under `API_Details`
    pub async fn parse_stage(&self, batch_names: Vec<BatchName>) -> ParseReport {
        let partner = &self.config.partner_name;
        info!(partner = %partner, batches = batch_names.len(), "Starting parse stage");

        let tallies = Arc::new(ParseTallies::default());
        let queue = WorkQueue::from_tasks(batch_names);
        let handler = Arc::new(ParseHandler {
            partner: partner.clone(),
            parser: self.parser.clone(),
            store: Arc::clone(&self.store),
            retain_raw: self.config.retain_raw,
            tallies: Arc::clone(&tallies),
        });

        let snapshot = self
            .pool
            .run(PARSE_STAGE, Arc::clone(&queue), handler, self.reporter(PARSE_STAGE))
            .instrument(info_span!("stage", name = PARSE_STAGE))
            .await;

        let report = ParseReport {
            stage: StageReport::collect(PARSE_STAGE, &queue, &snapshot),
            identifiers_parsed: tallies.parsed.load(Ordering::Relaxed),
            identifiers_degraded: tallies.degraded.load(Ordering::Relaxed),
            identifiers_failed: tallies.failed.load(Ordering::Relaxed),
        };
        info!(
            partner = %partner,
            completed = report.stage.completed,
            failed = report.stage.failed_count(),
            identifiers_parsed = report.identifiers_parsed,
            identifiers_degraded = report.identifiers_degraded,
            identifiers_failed = report.identifiers_failed,
            "Parse stage finished"
        );
        report
    }

    /// Batch names with a raw response in the store, for re-parsing
    pub async fn stored_batches(&self) -> Result<Vec<BatchName>> {
        let names = self
            .store
            .list(&self.config.partner_name, Stage::Batches)
            .await?;
        Ok(names.into_iter().map(BatchName).collect())
    }

    /// Fetch then parse; only batches whose fetch completed are parsed
    pub async fn run(&self, batches: BatchSet) -> RunSummary {
        let run_id = Uuid::new_v4();
        let partner = self.config.partner_name.clone();
        let span = info_span!("tracking_run", run_id = %run_id, partner = %partner);

        async move {
            let started_at = Utc::now();
            let identifiers_requested = batches.total_ids();
            info!(workers = self.pool.workers(), batches = batches.len(), "Tracking run started");

            let fetch = self.fetch_stage(batches).await;
            let fetched: Vec<BatchName> = fetch
                .completed_tasks
                .iter()
                .map(|name| BatchName(name.clone()))
                .collect();
            let parse = self.parse_stage(fetched).await;

            let summary = RunSummary {
                run_id,
                partner,
                started_at,
                finished_at: Utc::now(),
                identifiers_requested,
                fetch,
                parse: parse.stage,
                identifiers_parsed: parse.identifiers_parsed,
                identifiers_degraded: parse.identifiers_degraded,
                identifiers_failed: parse.identifiers_failed,
            };

            if summary.is_clean() {
                info!(identifiers_parsed = summary.identifiers_parsed, "Tracking run finished");
            } else {
                warn!(
                    failed_batches = summary.failed_batches(),
                    identifiers_failed = summary.identifiers_failed,
                    "Tracking run finished with failures"
                );
            }
            summary
        }
        .instrument(span)
        .await
    }
}
