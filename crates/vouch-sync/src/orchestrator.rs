//! One provider sync: local bucket, shared window, fetch, validate, upsert.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;
use vouch_adapters::{AdapterContext, Provider};
use vouch_core::{
    Clock, ErrorKind, FetchBatch, IngestError, NormalizedRecord, ReviewerIdentity, SyncRun,
};
use vouch_storage::{validate_record, ProfileStore, RecordStore, TokenBucket, UpsertSummary};

use crate::health::{HealthSink, HealthTracker, LogHealthSink, ProviderHealth};
use crate::limiter::SlidingWindowLimiter;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Deadline for one run, on top of whatever cancellation the caller supplies.
    pub sync_timeout: Duration,
    pub health_threshold: u32,
    /// Upper bound on the local bucket's burst; the quota count caps it further.
    pub bucket_burst: u32,
    /// Stamped on records the adapter left unscoped.
    pub workspace_id: Option<Uuid>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            sync_timeout: Duration::from_secs(300),
            health_threshold: crate::health::DEFAULT_DEGRADED_THRESHOLD,
            bucket_burst: 5,
            workspace_id: None,
        }
    }
}

/// Listing entry for operators: what is registered, how it is scheduled, how it is doing.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSummary {
    pub name: String,
    pub configured: bool,
    pub schedule: String,
    pub quota_count: u32,
    pub quota_window_secs: u64,
    pub requires_oauth: bool,
    pub health: ProviderHealth,
}

struct Registered {
    provider: Arc<dyn Provider>,
    bucket: TokenBucket,
}

pub struct Orchestrator {
    providers: BTreeMap<String, Registered>,
    limiter: SlidingWindowLimiter,
    records: Arc<dyn RecordStore>,
    profiles: Option<Arc<dyn ProfileStore>>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    health: HealthTracker,
    in_flight: Mutex<HashSet<String>>,
}

/// Releases the provider's single-flight slot however the run ends.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.name);
    }
}

impl Orchestrator {
    pub fn new(
        providers: Vec<Arc<dyn Provider>>,
        limiter: SlidingWindowLimiter,
        records: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Self {
        let providers = providers
            .into_iter()
            .map(|provider| {
                let quota = provider.rate_limit();
                let burst = quota.count.min(config.bucket_burst).max(1);
                let bucket = TokenBucket::new(quota.per_second(), burst);
                (provider.name().to_string(), Registered { provider, bucket })
            })
            .collect();
        let health = HealthTracker::new(config.health_threshold, Arc::new(LogHealthSink));
        Self {
            providers,
            limiter,
            records,
            profiles: None,
            clock,
            config,
            health,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_health_sink(mut self, sink: Arc<dyn HealthSink>) -> Self {
        self.health = HealthTracker::new(self.config.health_threshold, sink);
        self
    }

    /// Resolves every reviewer to a customer profile before records are stored.
    pub fn with_profiles(mut self, profiles: Arc<dyn ProfileStore>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn provider(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).map(|r| r.provider.clone())
    }

    pub fn providers(&self) -> Vec<ProviderSummary> {
        self.providers
            .iter()
            .map(|(name, registered)| {
                let provider = &registered.provider;
                let quota = provider.rate_limit();
                ProviderSummary {
                    name: name.clone(),
                    configured: provider.is_configured(),
                    schedule: provider.schedule().to_string(),
                    quota_count: quota.count,
                    quota_window_secs: quota.window.as_secs(),
                    requires_oauth: provider.oauth_requirement().is_some(),
                    health: self.health.get(name),
                }
            })
            .collect()
    }

    pub fn health(&self) -> BTreeMap<String, ProviderHealth> {
        self.providers
            .keys()
            .map(|name| (name.clone(), self.health.get(name)))
            .collect()
    }

    /// Current refill rate of the provider's local bucket.
    pub async fn local_rate(&self, name: &str) -> Option<f64> {
        match self.providers.get(name) {
            Some(registered) => Some(registered.bucket.rate().await),
            None => None,
        }
    }

    /// Runs one sync of `name`. Failures come back as `Err`; they are already logged and
    /// folded into the provider's health by the time the caller sees them.
    pub async fn sync(&self, name: &str, cancel: &CancellationToken) -> Result<SyncRun, IngestError> {
        self.sync_with_id(name, cancel, Uuid::new_v4()).await
    }

    /// Like [`Orchestrator::sync`] but always yields a run record, failed or not.
    pub async fn sync_report(&self, name: &str, cancel: &CancellationToken) -> SyncRun {
        let run_id = Uuid::new_v4();
        let started_at = self.clock.now();
        match self.sync_with_id(name, cancel, run_id).await {
            Ok(run) => run,
            Err(err) => SyncRun::failed(run_id, name, started_at, self.clock.now(), &err),
        }
    }

    async fn sync_with_id(
        &self,
        name: &str,
        cancel: &CancellationToken,
        run_id: Uuid,
    ) -> Result<SyncRun, IngestError> {
        let registered = self
            .providers
            .get(name)
            .ok_or_else(|| IngestError::provider_not_found(name))?;
        if !registered.provider.is_configured() {
            // Rejected ahead of the window and health bookkeeping.
            return Err(IngestError::new(
                ErrorKind::ProviderNotFound,
                format!("{name} is registered but has no credentials configured"),
            ));
        }
        let _guard = self.claim(name)?;

        let ctx = AdapterContext {
            run_id,
            fetched_at: self.clock.now(),
        };
        let span = info_span!("sync_run", provider = name, run_id = %run_id);
        let deadline = self.config.sync_timeout;

        let outcome = async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(IngestError::cancelled(format!("{name} sync"))),
                _ = tokio::time::sleep(deadline) => Err(IngestError::cancelled(
                    format!("{name} sync after {}s deadline", deadline.as_secs())
                )),
                result = self.pipeline(name, registered, &ctx, cancel) => result,
            }
        }
        .instrument(span)
        .await;

        let completed_at = self.clock.now();
        match outcome {
            Ok((batch_len, skipped, summary)) => {
                let run = SyncRun {
                    run_id,
                    provider: name.to_string(),
                    started_at: ctx.fetched_at,
                    completed_at,
                    items_fetched: batch_len,
                    items_skipped: skipped,
                    items_upserted: summary.inserted + summary.updated,
                    error: None,
                };
                info!(
                    provider = name,
                    run_id = %run_id,
                    items_fetched = batch_len,
                    items_skipped = skipped,
                    inserted = summary.inserted,
                    updated = summary.updated,
                    unchanged = summary.unchanged,
                    "sync completed"
                );
                self.health.record(&run);
                Ok(run)
            }
            Err(err) => {
                match err.kind() {
                    ErrorKind::RateLimited | ErrorKind::Cancelled => {
                        info!(provider = name, run_id = %run_id, error = %err, "sync skipped")
                    }
                    _ => warn!(provider = name, run_id = %run_id, error = %err, "sync failed"),
                }
                let run = SyncRun::failed(run_id, name, ctx.fetched_at, completed_at, &err);
                self.health.record(&run);
                Err(err)
            }
        }
    }

    fn claim(&self, name: &str) -> Result<InFlightGuard<'_>, IngestError> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(name.to_string()) {
            return Err(IngestError::new(
                ErrorKind::SyncInFlight,
                format!("{name} sync already running; trigger dropped"),
            ));
        }
        Ok(InFlightGuard {
            set: &self.in_flight,
            name: name.to_string(),
        })
    }

    async fn pipeline(
        &self,
        name: &str,
        registered: &Registered,
        ctx: &AdapterContext,
        cancel: &CancellationToken,
    ) -> Result<(usize, usize, UpsertSummary), IngestError> {
        registered.bucket.wait(cancel).await?;

        let quota = registered.provider.rate_limit();
        if !self.limiter.allow(name, quota.count, quota.window).await? {
            return Err(IngestError::new(
                ErrorKind::RateLimited,
                format!(
                    "{name} quota of {} per {}s exhausted",
                    quota.count,
                    quota.window.as_secs()
                ),
            ));
        }

        let batch = match registered.provider.fetch(ctx).await {
            Ok(batch) => batch,
            Err(err) => {
                if err.is_too_many_requests() {
                    let throttled = registered.bucket.rate().await / 2.0;
                    registered.bucket.set_limit(throttled).await;
                    warn!(provider = name, rate_per_sec = throttled, "platform returned 429; halving local rate");
                }
                return Err(err);
            }
        };

        let fetched = batch.records.len();
        let (records, skipped) = prepare_records(name, batch);
        let records = self.link_profiles(records).await?;

        let summary = if records.is_empty() {
            UpsertSummary::default()
        } else {
            self.records
                .batch_upsert(&records)
                .await
                .map_err(|e| e.into_ingest(ErrorKind::PersistFailed, "upserting records"))?
        };

        if registered.bucket.rate().await < registered.bucket.base_rate() {
            registered.bucket.reset_rate().await;
            debug!(provider = name, "local rate restored");
        }
        Ok((fetched, skipped, summary))
    }

    async fn link_profiles(
        &self,
        mut records: Vec<NormalizedRecord>,
    ) -> Result<Vec<NormalizedRecord>, IngestError> {
        for record in &mut records {
            if record.workspace_id.is_none() {
                record.workspace_id = self.config.workspace_id;
            }
            let Some(profiles) = &self.profiles else {
                continue;
            };
            // Anonymous reviewers stay unlinked.
            let Some(identity) = ReviewerIdentity::from_record(record) else {
                continue;
            };
            let profile = profiles
                .find_or_create_profile(&identity)
                .await
                .map_err(|e| e.into_ingest(ErrorKind::PersistFailed, "resolving reviewer profile"))?;
            record.customer_profile_id = Some(profile.id);
        }
        Ok(records)
    }
}

/// Drops records that cannot be stored or that claim another platform, then collapses
/// repeated external ids so the last occurrence wins. Returns the survivors and the total
/// number of items left out, including those the adapter already skipped.
fn prepare_records(name: &str, batch: FetchBatch) -> (Vec<NormalizedRecord>, usize) {
    let mut dropped = batch.skipped;
    let mut records: Vec<NormalizedRecord> = Vec::with_capacity(batch.records.len());
    let mut position: HashMap<String, usize> = HashMap::new();

    for record in batch.records {
        if record.platform_name != name {
            warn!(provider = name, platform = %record.platform_name, "dropping record for another platform");
            dropped += 1;
            continue;
        }
        if let Err(err) = validate_record(&record) {
            warn!(provider = name, error = %err, "dropping invalid record");
            dropped += 1;
            continue;
        }
        match position.get(&record.external_id) {
            Some(&index) => {
                records[index] = record;
                dropped += 1;
            }
            None => {
                position.insert(record.external_id.clone(), records.len());
                records.push(record);
            }
        }
    }
    (records, dropped)
}
