//! Per-provider failure streaks and the degraded/recovered signal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use vouch_core::{RunError, SyncRun};

pub const DEFAULT_DEGRADED_THRESHOLD: u32 = 3;

/// Receives health transitions. Called synchronously from the sync task, so implementations
/// should hand off anything slow.
pub trait HealthSink: Send + Sync {
    fn degraded(&self, provider: &str, consecutive_failures: u32, last_error: &RunError);

    fn recovered(&self, provider: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogHealthSink;

impl HealthSink for LogHealthSink {
    fn degraded(&self, provider: &str, consecutive_failures: u32, last_error: &RunError) {
        warn!(
            provider,
            consecutive_failures,
            error_kind = %last_error.kind,
            error = %last_error.message,
            "provider health degraded"
        );
    }

    fn recovered(&self, provider: &str) {
        info!(provider, "provider health recovered");
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderHealth {
    pub consecutive_failures: u32,
    pub degraded: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<RunError>,
}

pub struct HealthTracker {
    threshold: u32,
    sink: Arc<dyn HealthSink>,
    state: Mutex<HashMap<String, ProviderHealth>>,
}

impl HealthTracker {
    pub fn new(threshold: u32, sink: Arc<dyn HealthSink>) -> Self {
        Self {
            threshold: threshold.max(1),
            sink,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Folds one finished run into the provider's streak. Runs that ended for reasons other
    /// than the platform itself (rate limiting, cancellation, storage) leave the streak alone.
    pub fn record(&self, run: &SyncRun) {
        enum Transition {
            Degraded(u32, RunError),
            Recovered,
        }

        let transition = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let health = state.entry(run.provider.clone()).or_default();
            health.last_run_at = Some(run.completed_at);
            match &run.error {
                None => {
                    health.last_success_at = Some(run.completed_at);
                    health.last_error = None;
                    health.consecutive_failures = 0;
                    let was_degraded = std::mem::replace(&mut health.degraded, false);
                    was_degraded.then_some(Transition::Recovered)
                }
                Some(error) => {
                    health.last_error = Some(error.clone());
                    if !error.kind.is_platform_failure() {
                        None
                    } else {
                        health.consecutive_failures += 1;
                        if !health.degraded && health.consecutive_failures >= self.threshold {
                            health.degraded = true;
                            Some(Transition::Degraded(health.consecutive_failures, error.clone()))
                        } else {
                            None
                        }
                    }
                }
            }
        };

        match transition {
            Some(Transition::Degraded(failures, error)) => {
                self.sink.degraded(&run.provider, failures, &error)
            }
            Some(Transition::Recovered) => self.sink.recovered(&run.provider),
            None => {}
        }
    }

    pub fn get(&self, provider: &str) -> ProviderHealth {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(provider)
            .cloned()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> HashMap<String, ProviderHealth> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
