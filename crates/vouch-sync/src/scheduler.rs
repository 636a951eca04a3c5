//! Cron fan-out: one job per configured provider, each firing a spawned orchestrator run.

use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use vouch_core::{ErrorKind, IngestError, SyncRun};

use crate::orchestrator::Orchestrator;

/// Rewrites `expr` into the six-field (seconds-first) form the job scheduler expects.
///
/// Accepts five-field cron, six-field cron and the `@hourly`/`@daily`/`@weekly`/`@monthly`
/// shorthands. Day-of-week is best given by name (`MON`..`SUN`).
pub fn normalize_schedule(expr: &str) -> Result<String, IngestError> {
    let trimmed = expr.trim();
    let normalized = match trimmed {
        "@hourly" => "0 0 * * * *".to_string(),
        "@daily" | "@midnight" => "0 0 0 * * *".to_string(),
        "@weekly" => "0 0 0 * * SUN".to_string(),
        "@monthly" => "0 0 0 1 * *".to_string(),
        _ => {
            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            match fields.len() {
                5 => format!("0 {}", fields.join(" ")),
                6 => fields.join(" "),
                n => {
                    return Err(IngestError::new(
                        ErrorKind::Configuration,
                        format!("schedule {expr:?} has {n} fields; expected 5 or 6"),
                    ))
                }
            }
        }
    };

    cron::Schedule::from_str(&normalized).map_err(|e| {
        IngestError::new(ErrorKind::Configuration, format!("invalid schedule {expr:?}: {e}"))
    })?;
    Ok(normalized)
}

struct Dispatch {
    orchestrator: Arc<Orchestrator>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    results: mpsc::UnboundedSender<SyncRun>,
}

impl Dispatch {
    fn fire(&self, name: &str) {
        if self.cancel.is_cancelled() || self.tracker.is_closed() {
            debug!(provider = name, "scheduler stopping; trigger ignored");
            return;
        }
        let orchestrator = self.orchestrator.clone();
        let cancel = self.cancel.child_token();
        let results = self.results.clone();
        let name = name.to_string();
        self.tracker.spawn(async move {
            let run = orchestrator.sync_report(&name, &cancel).await;
            if results.send(run).is_err() {
                debug!(provider = %name, "sync result receiver dropped");
            }
        });
    }
}

pub struct Scheduler {
    dispatch: Arc<Dispatch>,
    schedules: Vec<(String, String)>,
    jobs: Mutex<Option<JobScheduler>>,
}

impl Scheduler {
    /// Validates every configured provider's schedule up front; a bad expression fails here,
    /// never during a tick. Finished runs are delivered on the returned receiver.
    pub fn new(
        orchestrator: Arc<Orchestrator>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SyncRun>), IngestError> {
        let mut schedules = Vec::new();
        for summary in orchestrator.providers() {
            if !summary.configured {
                warn!(provider = %summary.name, "provider not configured; not scheduling");
                continue;
            }
            let cron = normalize_schedule(&summary.schedule)?;
            schedules.push((summary.name, cron));
        }

        let (results, receiver) = mpsc::unbounded_channel();
        let scheduler = Self {
            dispatch: Arc::new(Dispatch {
                orchestrator,
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
                results,
            }),
            schedules,
            jobs: Mutex::new(None),
        };
        Ok((scheduler, receiver))
    }

    /// `(provider, six-field cron)` for every provider that will be scheduled.
    pub fn schedules(&self) -> &[(String, String)] {
        &self.schedules
    }

    pub async fn start(&self) -> Result<(), IngestError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.is_some() {
            return Err(IngestError::new(ErrorKind::Configuration, "scheduler already started"));
        }

        let sched = JobScheduler::new()
            .await
            .map_err(|e| scheduler_error("creating scheduler", e))?;
        for (name, cron) in &self.schedules {
            let dispatch = self.dispatch.clone();
            let provider = name.clone();
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let dispatch = dispatch.clone();
                let provider = provider.clone();
                Box::pin(async move {
                    dispatch.fire(&provider);
                })
            })
            .map_err(|e| scheduler_error(&format!("creating job for {name} ({cron})"), e))?;
            sched
                .add(job)
                .await
                .map_err(|e| scheduler_error("adding scheduler job", e))?;
            info!(provider = %name, schedule = %cron, "scheduled provider sync");
        }
        sched
            .start()
            .await
            .map_err(|e| scheduler_error("starting scheduler", e))?;
        *jobs = Some(sched);
        Ok(())
    }

    /// Spawns a run of `name` without waiting for it. Fire-and-forget: the outcome arrives
    /// on the result channel.
    pub fn fire(&self, name: &str) {
        self.dispatch.fire(name);
    }

    /// Operator-initiated run outside the timer. Still subject to the limiter and the
    /// single-flight guard.
    pub fn trigger_now(&self, name: &str) -> Result<(), IngestError> {
        match self.dispatch.orchestrator.provider(name) {
            None => return Err(IngestError::provider_not_found(name)),
            Some(provider) if !provider.is_configured() => {
                return Err(IngestError::new(
                    ErrorKind::ProviderNotFound,
                    format!("{name} is registered but has no credentials configured"),
                ))
            }
            Some(_) => {}
        }
        self.fire(name);
        Ok(())
    }

    pub fn in_flight(&self) -> usize {
        self.dispatch.tracker.len()
    }

    /// Stops the timer, cancels in-flight runs and waits for them to report.
    pub async fn shutdown(&self) {
        self.dispatch.cancel.cancel();
        if let Some(mut sched) = self.jobs.lock().await.take() {
            if let Err(e) = sched.shutdown().await {
                warn!(error = %e, "job scheduler did not shut down cleanly");
            }
        }
        self.dispatch.tracker.close();
        self.dispatch.tracker.wait().await;
        info!("scheduler stopped");
    }
}

fn scheduler_error(what: &str, err: impl std::fmt::Display) -> IngestError {
    IngestError::new(ErrorKind::Configuration, format!("{what}: {err}"))
}
