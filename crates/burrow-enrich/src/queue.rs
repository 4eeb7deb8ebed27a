//! Bounded enrichment queue with dedup and retry scheduling

use burrow_relay_db::{RecordKind, RecordStore};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lookup::MetadataLookup;
use crate::EnrichmentError;

#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    /// Concurrent lookups
    pub workers: usize,
    pub queue_capacity: usize,
    /// Submissions with the same request id inside this window coalesce
    pub dedup_window: Duration,
    pub max_attempts: u32,
    /// Backoff after the first failure; doubles on each further failure
    pub base_backoff: Duration,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            dedup_window: Duration::from_secs(60),
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentJob {
    pub request_id: String,
    pub client_ip: String,
    pub kind: RecordKind,
    /// 1-based attempt number
    pub attempt: u32,
}

/// Fire-and-forget submission handle
#[derive(Clone)]
pub struct EnrichmentQueue {
    tx: mpsc::Sender<EnrichmentJob>,
    seen: Arc<DashMap<String, Instant>>,
    dedup_window: Duration,
}

struct Worker {
    tx: mpsc::Sender<EnrichmentJob>,
    lookup: Arc<dyn MetadataLookup>,
    store: Arc<dyn RecordStore>,
    config: EnrichmentConfig,
    cancel: CancellationToken,
}

impl EnrichmentQueue {
    /// Start the dispatcher; it runs until `cancel` fires
    pub fn start(
        config: EnrichmentConfig,
        lookup: Arc<dyn MetadataLookup>,
        store: Arc<dyn RecordStore>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let seen = Arc::new(DashMap::new());

        let queue = Self {
            tx: tx.clone(),
            seen: seen.clone(),
            dedup_window: config.dedup_window,
        };

        let worker = Arc::new(Worker {
            tx,
            lookup,
            store,
            config,
            cancel,
        });
        let handle = tokio::spawn(dispatch(worker, rx, seen));

        (queue, handle)
    }

    /// Enqueue a job without waiting. Returns false when the job was
    /// coalesced with a recent submission or the queue is full.
    pub fn submit(&self, request_id: &str, client_ip: &str, kind: RecordKind) -> bool {
        let now = Instant::now();
        match self.seen.entry(request_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if now.duration_since(*occupied.get()) < self.dedup_window {
                    debug!("Coalesced enrichment job for {}", request_id);
                    return false;
                }
                occupied.insert(now);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now);
            }
        }

        let job = EnrichmentJob {
            request_id: request_id.to_string(),
            client_ip: client_ip.to_string(),
            kind,
            attempt: 1,
        };

        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropping enrichment job for {}: {}", request_id, e);
                false
            }
        }
    }
}

async fn dispatch(
    worker: Arc<Worker>,
    mut rx: mpsc::Receiver<EnrichmentJob>,
    seen: Arc<DashMap<String, Instant>>,
) {
    let permits = Arc::new(Semaphore::new(worker.config.workers.max(1)));
    let mut purge = tokio::time::interval(worker.config.dedup_window);
    purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = worker.cancel.cancelled() => break,

            _ = purge.tick() => {
                let window = worker.config.dedup_window;
                seen.retain(|_, submitted| submitted.elapsed() < window);
            }

            job = rx.recv() => {
                let Some(job) = job else { break };
                let permit = tokio::select! {
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    _ = worker.cancel.cancelled() => break,
                };

                let worker = worker.clone();
                tokio::spawn(async move {
                    worker.run(job).await;
                    drop(permit);
                });
            }
        }
    }

    info!("Enrichment dispatcher stopped");
}

impl Worker {
    async fn run(&self, job: EnrichmentJob) {
        match self.attempt(&job).await {
            Ok(()) => debug!(
                "Enriched {} {} on attempt {}",
                job.kind, job.request_id, job.attempt
            ),
            Err(e) if !e.is_retryable() => {
                debug!("Skipping enrichment of {}: {}", job.request_id, e);
            }
            Err(e) if job.attempt >= self.config.max_attempts => {
                warn!(
                    "Dropping enrichment of {} after {} attempts: {}",
                    job.request_id, job.attempt, e
                );
            }
            Err(e) => {
                let delay = self.backoff(job.attempt);
                debug!(
                    "Enrichment of {} failed on attempt {} ({}), retrying in {:?}",
                    job.request_id, job.attempt, e, delay
                );
                self.schedule_retry(job, delay);
            }
        }
    }

    async fn attempt(&self, job: &EnrichmentJob) -> Result<(), EnrichmentError> {
        let enrichment = self.lookup.lookup(&job.client_ip).await?;
        self.store
            .apply_enrichment(job.kind, &job.request_id, &enrichment)
            .await?;
        Ok(())
    }

    /// base, 2×base, 4×base, ...
    fn backoff(&self, attempt: u32) -> Duration {
        self.config.base_backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    fn schedule_retry(&self, mut job: EnrichmentJob, delay: Duration) {
        job.attempt += 1;
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if tx.send(job).await.is_err() {
                        debug!("Enrichment queue closed before retry");
                    }
                }
                _ = cancel.cancelled() => {}
            }
        });
    }
}
