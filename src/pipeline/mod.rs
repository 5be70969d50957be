//! The backup pipeline: batch orchestration over candidate discovery,
//! export, upload, and registration.

use std::sync::Arc;

use chrono::Utc;
use futures::{StreamExt, stream};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::candidate::{AdmitAll, BackupCandidate, CandidateSource, RetryPolicyFilter};
use crate::catalog::{Catalog, PgCatalog};
use crate::config::Config;
use crate::emit;
use crate::error::{BackupError, BackupErrorKind};
use crate::export::Exporter;
use crate::failures::{FailureStore, NoopFailureStore, PgFailureStore};
use crate::ipfs::{IpfsApi, IpfsClient, await_daemon};
use crate::metrics::HealthState;
use crate::metrics::events::{
    BackupCompleted, BackupFailed, BackupStarted, BackupStatus, BytesUploaded, GcCompleted,
};
use crate::sink::{CarSink, SinkConfig};
use crate::swarm::{SwarmBind, SwarmConfig};

/// Per-candidate outcome record, written to stdout as one JSON line.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BackupOutcome {
    Ok { cid: String, size: u64 },
    Error { cid: String, error: String, code: String },
}

fn write_outcome(outcome: &BackupOutcome) {
    match serde_json::to_string(outcome) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!(error = %e, "failed to encode outcome record"),
    }
}

/// Counters for the run summary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunTotals {
    pub processed: u64,
    pub successful: u64,
    pub skipped: u64,
}

impl RunTotals {
    pub fn failed(&self) -> u64 {
        self.processed - self.successful - self.skipped
    }

    fn tally(&mut self, status: BackupStatus) {
        self.processed += 1;
        match status {
            BackupStatus::Success => self.successful += 1,
            BackupStatus::Skipped => self.skipped += 1,
            BackupStatus::Failed => {}
        }
    }
}

/// Everything a single candidate needs, shared across in-flight tasks.
struct PipelineContext {
    ipfs: Arc<dyn IpfsApi>,
    catalog: Arc<dyn Catalog>,
    failures: Arc<dyn FailureStore>,
    exporter: Exporter,
    sink: CarSink,
    health: HealthState,
}

impl PipelineContext {
    /// Drive one candidate to a terminal state, emitting its outcome.
    ///
    /// Every path ends in exactly one [`BackupCompleted`], which pairs with
    /// the [`BackupStarted`] here to keep the in-flight gauge balanced.
    async fn process(&self, candidate: BackupCandidate) -> BackupStatus {
        let cid = candidate.source_cid;
        emit!(BackupStarted);

        match self.sink.exists(&cid).await {
            Ok(true) => {
                // Already durably stored; no outcome line for skips.
                tracing::debug!(cid = %cid, "already stored, skipping");
                emit!(BackupCompleted {
                    status: BackupStatus::Skipped,
                });
                return BackupStatus::Skipped;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(cid = %cid, error = %e, "sink existence check failed");
            }
        }

        match self.backup(&candidate).await {
            Ok(size) => {
                write_outcome(&BackupOutcome::Ok {
                    cid: cid.to_string(),
                    size,
                });
                emit!(BytesUploaded { bytes: size });
                emit!(BackupCompleted {
                    status: BackupStatus::Success,
                });
                if let Err(e) = self.failures.clear(&cid).await {
                    tracing::warn!(cid = %cid, error = %e, "failed to clear failure record");
                }
                BackupStatus::Success
            }
            Err((kind, message)) => {
                tracing::warn!(cid = %cid, code = %kind, error = %message, "backup failed");
                write_outcome(&BackupOutcome::Error {
                    cid: cid.to_string(),
                    error: message.clone(),
                    code: kind.as_code().to_string(),
                });
                emit!(BackupFailed {
                    code: kind.as_code(),
                });
                emit!(BackupCompleted {
                    status: BackupStatus::Failed,
                });
                if let Err(e) = self
                    .failures
                    .record(&cid, kind, &message, Utc::now())
                    .await
                {
                    tracing::warn!(cid = %cid, error = %e, "failed to record failure");
                }
                BackupStatus::Failed
            }
        }
    }

    /// Export, upload, and register one candidate.
    async fn backup(
        &self,
        candidate: &BackupCandidate,
    ) -> Result<u64, (BackupErrorKind, String)> {
        let cid = &candidate.source_cid;

        let export = self
            .exporter
            .export(cid)
            .await
            .map_err(|e| (e.kind(), e.to_string()))?;

        let size = self
            .sink
            .upload(cid, export)
            .await
            .map_err(|e| (e.kind(), e.to_string()))?;

        let url = self.sink.object_url(cid);
        self.catalog
            .register_backup(&candidate.upload_id, &url, Utc::now())
            .await
            .map_err(|e| (BackupErrorKind::Registration, e.to_string()))?;

        tracing::info!(
            cid = %cid,
            upload_id = %candidate.upload_id,
            user_id = %candidate.user_id,
            size,
            url = %url,
            "backup registered"
        );
        Ok(size)
    }

    /// Run a repo GC pass so the daemon's store doesn't grow with every
    /// exported DAG.
    async fn collect_garbage(&self) {
        let results = match self.ipfs.repo_gc().await {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!(error = %e, "repo gc failed");
                return;
            }
        };

        let mut reclaimed: u64 = 0;
        for result in results {
            if let Some(err) = result.error {
                let cid = result.key.map(|k| k.cid).unwrap_or_default();
                tracing::warn!(cid = %cid, error = %err, "gc could not remove object");
            } else if result.key.is_some() {
                reclaimed += 1;
            }
        }
        tracing::info!(reclaimed, "repo gc complete");
        emit!(GcCompleted { reclaimed });
    }
}

/// Batch sizing and parallelism for one run.
#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub batch_size: usize,
    pub concurrency: usize,
}

/// One backup run over the full candidate scan.
pub struct BackupPipeline {
    ctx: Arc<PipelineContext>,
    source: CandidateSource,
    options: PipelineOptions,
    shutdown: CancellationToken,
}

impl BackupPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ipfs: Arc<dyn IpfsApi>,
        catalog: Arc<dyn Catalog>,
        failures: Arc<dyn FailureStore>,
        exporter: Exporter,
        sink: CarSink,
        source: CandidateSource,
        health: HealthState,
        options: PipelineOptions,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx: Arc::new(PipelineContext {
                ipfs,
                catalog,
                failures,
                exporter,
                sink,
                health,
            }),
            source,
            options,
            shutdown,
        }
    }

    /// Process batches until the candidate scan is exhausted or shutdown
    /// is requested. In-flight candidates always run to completion.
    pub async fn run(mut self) -> Result<RunTotals, BackupError> {
        let mut totals = RunTotals::default();

        loop {
            if self.shutdown.is_cancelled() {
                tracing::info!("shutdown requested, stopping after current batch");
                break;
            }

            let batch = self
                .source
                .next_batch(self.options.batch_size)
                .await
                .map_err(BackupError::from)?;
            if batch.is_empty() {
                break;
            }

            tracing::info!(candidates = batch.len(), "processing batch");

            let ctx = self.ctx.clone();
            let mut outcomes = stream::iter(batch)
                .map(|candidate| {
                    let ctx = ctx.clone();
                    async move { ctx.process(candidate).await }
                })
                .buffer_unordered(self.options.concurrency);

            while let Some(status) = outcomes.next().await {
                self.ctx.health.heartbeat();
                totals.tally(status);
            }
            drop(outcomes);

            self.ctx.collect_garbage().await;
        }

        self.ctx.health.mark_done();
        tracing::info!(
            processed = totals.processed,
            successful = totals.successful,
            skipped = totals.skipped,
            failed = totals.failed(),
            "backup run complete"
        );
        Ok(totals)
    }
}

/// Wire a pipeline up from configuration and run it.
///
/// The caller owns `health` so the liveness endpoint can observe the run.
pub async fn run(
    config: Config,
    shutdown: CancellationToken,
    health: HealthState,
) -> Result<RunTotals, BackupError> {
    let ipfs: Arc<dyn IpfsApi> = Arc::new(
        IpfsClient::new(&config.ipfs_api_url)
            .map_err(|source| BackupError::IpfsUnreachable { source })?,
    );
    let identity = await_daemon(ipfs.as_ref(), 5, std::time::Duration::from_secs(1))
        .await
        .map_err(|source| BackupError::IpfsUnreachable { source })?;
    tracing::info!(peer_id = %identity.id, "connected to IPFS daemon");

    let catalog: Arc<dyn Catalog> = Arc::new(
        PgCatalog::connect(&config.database_url)
            .await
            .map_err(BackupError::from)?,
    );

    let failures: Arc<dyn FailureStore> = match &config.failure_memory_url {
        Some(url) => match PgFailureStore::connect(url).await {
            Ok(store) => Arc::new(store),
            Err(source) => {
                catalog.close().await;
                return Err(BackupError::FailureStore { source });
            }
        },
        None => Arc::new(NoopFailureStore),
    };

    let swarm = if config.peer_addrs.is_empty() {
        None
    } else {
        let min_connections = config
            .min_connections
            .unwrap_or(config.peer_addrs.len())
            .min(config.peer_addrs.len());
        Some(SwarmBind::spawn(
            ipfs.clone(),
            SwarmConfig {
                addrs: config.peer_addrs.clone(),
                min_connections,
                check_interval: config.peer_check_interval(),
            },
        ))
    };

    let result = run_inner(
        config,
        shutdown,
        health,
        ipfs,
        catalog.clone(),
        failures.clone(),
    )
    .await;

    failures.close().await;
    catalog.close().await;
    if let Some(swarm) = swarm {
        swarm.stop().await;
    }
    result
}

async fn run_inner(
    config: Config,
    shutdown: CancellationToken,
    health: HealthState,
    ipfs: Arc<dyn IpfsApi>,
    catalog: Arc<dyn Catalog>,
    failures: Arc<dyn FailureStore>,
) -> Result<RunTotals, BackupError> {
    let start = crate::candidate::Watermark::new(config.start_date).window_start();
    let pending = catalog.count_pending(start).await?;
    tracing::info!(pending, since = %start, "candidate backlog");

    let filter: Arc<dyn crate::candidate::AdmissionFilter> = if config.failure_memory_url.is_some()
    {
        Arc::new(RetryPolicyFilter::new(
            failures.clone(),
            &config.retryable_error_codes,
        ))
    } else {
        Arc::new(AdmitAll)
    };

    let source = CandidateSource::new(
        catalog.clone(),
        filter,
        config.start_date,
        config.page_size,
    );

    let sink = CarSink::connect(&SinkConfig {
        bucket: config.s3_bucket_name.clone(),
        region: config.s3_region.clone(),
        endpoint: config.s3_endpoint.clone(),
        access_key_id: config.s3_access_key_id.clone(),
        secret_access_key: config.s3_secret_access_key.clone(),
    })
    .map_err(|source| BackupError::Sink { source })?;

    let exporter = Exporter::new(ipfs.clone(), config.max_dag_size).with_health(health.clone());

    let pipeline = BackupPipeline::new(
        ipfs,
        catalog,
        failures,
        exporter,
        sink,
        source,
        health,
        PipelineOptions {
            batch_size: config.batch_size,
            concurrency: config.concurrency,
        },
        shutdown,
    );
    pipeline.run().await
}
