//! Consecutive-failure health monitor

use crate::clock::Clock;
use crate::config::HealthConfig;
use crate::error::{Error, Result};
use crate::provider::{Instance, Prober};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One probe result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthSample {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub latency_ms: u64,
}

/// What a sample means for the association
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// Probe succeeded, no outage in progress
    Healthy,
    /// Failure below the threshold
    Degraded { consecutive_failures: u32 },
    /// Threshold reached; raised once per outage episode
    FailureDetected,
    /// Outage episode already raised; nothing to do until it is cleared
    Suppressed,
    /// Sample taken before the episode was cleared; discarded
    Stale,
}

/// Health view exposed through association status
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HealthSummary {
    pub consecutive_failures: u32,
    pub episode_open: bool,
    pub last_healthy_at: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<u64>,
    /// Successful fraction of the sample window, 0.0 when empty
    pub window_success_rate: f64,
    pub samples: usize,
}

#[derive(Default)]
struct MonitorState {
    /// Bumped by every `clear_episode`
    generation: u64,
    consecutive_failures: u32,
    episode_open: bool,
    last_healthy_at: Option<DateTime<Utc>>,
    window: VecDeque<HealthSample>,
}

/// Counts consecutive probe failures against a threshold
///
/// Only an unbroken run of failures counts: one success resets the run, so
/// a flapping primary never crosses the threshold. Once raised, the failure
/// stays raised until [`clear_episode`](Self::clear_episode) is called after
/// a completed recovery; a primary that answers again does not clear it.
pub struct HealthMonitor {
    threshold: u32,
    window_size: usize,
    probe_timeout: Duration,
    state: Mutex<MonitorState>,
}

impl HealthMonitor {
    pub fn new(config: &HealthConfig) -> Self {
        HealthMonitor {
            threshold: config.failure_threshold.max(1),
            window_size: config.window_size.max(1),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Current episode generation, captured before a probe starts
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Fold one sample into the state
    pub fn record(&self, sample: HealthSample) -> ProbeVerdict {
        let generation = self.generation();
        self.record_if_current(generation, sample)
    }

    /// Fold a sample in unless the episode was cleared since `generation`
    pub fn record_if_current(&self, generation: u64, sample: HealthSample) -> ProbeVerdict {
        let mut state = self.state.lock();
        if state.generation != generation {
            debug!(
                taken = generation,
                current = state.generation,
                "discarding sample from a cleared episode"
            );
            return ProbeVerdict::Stale;
        }

        let success = sample.success;
        let timestamp = sample.timestamp;
        state.window.push_back(sample);
        while state.window.len() > self.window_size {
            state.window.pop_front();
        }

        if success {
            state.consecutive_failures = 0;
            state.last_healthy_at = Some(timestamp);
            return if state.episode_open {
                ProbeVerdict::Suppressed
            } else {
                ProbeVerdict::Healthy
            };
        }

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.episode_open {
            return ProbeVerdict::Suppressed;
        }
        if state.consecutive_failures >= self.threshold {
            state.episode_open = true;
            warn!(
                failures = state.consecutive_failures,
                threshold = self.threshold,
                "primary failure detected"
            );
            return ProbeVerdict::FailureDetected;
        }

        ProbeVerdict::Degraded {
            consecutive_failures: state.consecutive_failures,
        }
    }

    /// Probe `instance` once under the per-probe timeout and record it
    pub async fn probe_once(
        &self,
        prober: &dyn Prober,
        instance: &Instance,
        clock: &dyn Clock,
    ) -> ProbeVerdict {
        let generation = self.generation();
        let started = std::time::Instant::now();
        let outcome: Result<()> = match tokio::time::timeout(self.probe_timeout, prober.probe(instance)).await {
            Ok(result) => result,
            Err(_) => Err(Error::HealthProbeTimeout(self.probe_timeout.as_millis() as u64)),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        if let Err(e) = &outcome {
            debug!(instance = %instance.id, "probe failed: {}", e);
        }

        self.record_if_current(
            generation,
            HealthSample {
                timestamp: clock.now(),
                success: outcome.is_ok(),
                latency_ms,
            },
        )
    }

    /// Mark an outage as already raised (manual failover, reload)
    pub fn open_episode(&self) {
        self.state.lock().episode_open = true;
    }

    /// End the outage episode after a completed recovery
    pub fn clear_episode(&self) {
        let mut state = self.state.lock();
        if state.episode_open {
            info!("health episode cleared");
        }
        state.episode_open = false;
        state.consecutive_failures = 0;
        state.generation = state.generation.wrapping_add(1);
    }

    pub fn episode_open(&self) -> bool {
        self.state.lock().episode_open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    pub fn summary(&self) -> HealthSummary {
        let state = self.state.lock();
        let successes = state.window.iter().filter(|s| s.success).count();
        HealthSummary {
            consecutive_failures: state.consecutive_failures,
            episode_open: state.episode_open,
            last_healthy_at: state.last_healthy_at,
            last_latency_ms: state.window.back().map(|s| s.latency_ms),
            window_success_rate: if state.window.is_empty() {
                0.0
            } else {
                successes as f64 / state.window.len() as f64
            },
            samples: state.window.len(),
        }
    }
}
