// Call governor for outbound API traffic
//
// One shared instance keyed by API name. Each API gets a minimum spacing between
// calls and its own exponential backoff after consecutive errors. Backoff on one
// API never delays another.

use anyhow::Result;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Typed failures the governor distinguishes when recording errors.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("{api} rate limited the request")]
    RateLimited { api: String },

    #[error("{api} returned HTTP {status}")]
    Status { api: String, status: u16 },

    #[error("{api} call timed out after {seconds}s")]
    Timeout { api: String, seconds: u64 },
}

impl CallError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            CallError::RateLimited { .. } | CallError::Status { status: 429, .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Spacing for APIs without an explicit entry
    pub default_interval_ms: u64,
    /// Per-API minimum spacing between calls
    pub intervals_ms: HashMap<String, u64>,
    pub call_timeout_seconds: u64,
    pub max_backoff_seconds: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        let intervals_ms = [
            ("overpass", 5000),
            ("nominatim", 1000),
            ("osrm", 1000),
            ("open_meteo", 1000),
            ("aladhan", 2000),
            ("tfl", 1000),
            ("classifier", 0),
        ]
        .into_iter()
        .map(|(api, ms)| (api.to_string(), ms))
        .collect();

        Self {
            default_interval_ms: 1000,
            intervals_ms,
            call_timeout_seconds: 20,
            max_backoff_seconds: 60,
        }
    }
}

impl GovernorConfig {
    pub fn interval_for(&self, api: &str) -> Duration {
        let ms = self
            .intervals_ms
            .get(api)
            .copied()
            .unwrap_or(self.default_interval_ms);
        Duration::from_millis(ms)
    }
}

/// `2^(n-1)` seconds for `n` consecutive errors, capped; zero when `n == 0`.
pub fn backoff_for(consecutive_errors: u32, cap: Duration) -> Duration {
    if consecutive_errors == 0 {
        return Duration::ZERO;
    }
    let exponent = (consecutive_errors - 1).min(31);
    Duration::from_secs(1u64 << exponent).min(cap)
}

#[derive(Debug, Default)]
struct ApiState {
    calls: u64,
    successes: u64,
    errors: u64,
    rate_limit_hits: u64,
    consecutive_errors: u32,
    last_call: Option<Instant>,
    last_error: Option<Instant>,
}

impl ApiState {
    /// Time until a call may start: the larger of the remaining backoff and
    /// the remaining inter-call interval.
    fn wait_time(&self, now: Instant, min_interval: Duration, cap: Duration) -> Duration {
        let backoff = match self.last_error {
            Some(at) => (at + backoff_for(self.consecutive_errors, cap)).saturating_duration_since(now),
            None => Duration::ZERO,
        };
        let spacing = match self.last_call {
            Some(at) => (at + min_interval).saturating_duration_since(now),
            None => Duration::ZERO,
        };
        backoff.max(spacing)
    }
}

/// Per-API counters for stats.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ApiStats {
    pub calls: u64,
    pub successes: u64,
    pub errors: u64,
    pub rate_limit_hits: u64,
    pub consecutive_errors: u32,
    pub backoff_seconds: u64,
}

/// Shared throttle for every outbound call.
///
/// State is created lazily per API name and kept in memory only.
pub struct CallGovernor {
    config: GovernorConfig,
    apis: DashMap<String, ApiState>,
}

impl CallGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            apis: DashMap::new(),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.config.call_timeout_seconds)
    }

    fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.config.max_backoff_seconds)
    }

    /// Wait out any active backoff and the minimum interval, then reserve the slot.
    pub async fn acquire(&self, api: &str) {
        let min_interval = self.config.interval_for(api);
        let cap = self.max_backoff();

        loop {
            // The guard must not be held across the sleep
            let wait = {
                let mut state = self.apis.entry(api.to_string()).or_default();
                let now = Instant::now();
                let wait = state.wait_time(now, min_interval, cap);
                if wait.is_zero() {
                    state.last_call = Some(now);
                    state.calls += 1;
                }
                wait
            };

            if wait.is_zero() {
                return;
            }

            debug!(api, wait_ms = wait.as_millis() as u64, "Waiting for call slot");
            tokio::time::sleep(wait).await;
        }
    }

    /// Reset the consecutive error counter for this API only.
    pub fn record_success(&self, api: &str) {
        let mut state = self.apis.entry(api.to_string()).or_default();
        state.successes += 1;
        state.consecutive_errors = 0;
    }

    pub fn record_error(&self, api: &str, rate_limited: bool) {
        let mut state = self.apis.entry(api.to_string()).or_default();
        state.errors += 1;
        state.consecutive_errors = state.consecutive_errors.saturating_add(1);
        state.last_error = Some(Instant::now());
        if rate_limited {
            state.rate_limit_hits += 1;
        }

        warn!(
            api,
            consecutive_errors = state.consecutive_errors,
            rate_limited,
            backoff_secs = backoff_for(state.consecutive_errors, self.max_backoff()).as_secs(),
            "External call failed"
        );
    }

    /// Current backoff for an API (0 when healthy).
    pub fn backoff_duration(&self, api: &str) -> Duration {
        let errors = self
            .apis
            .get(api)
            .map(|s| s.consecutive_errors)
            .unwrap_or(0);
        backoff_for(errors, self.max_backoff())
    }

    /// Acquire, run `f` under the call timeout, and record the outcome.
    pub async fn call<T, F, Fut>(&self, api: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire(api).await;

        let timeout = self.call_timeout();
        match tokio::time::timeout(timeout, f()).await {
            Ok(Ok(value)) => {
                self.record_success(api);
                Ok(value)
            }
            Ok(Err(e)) => {
                let rate_limited = e
                    .downcast_ref::<CallError>()
                    .map_or(false, CallError::is_rate_limit);
                self.record_error(api, rate_limited);
                Err(e)
            }
            Err(_) => {
                self.record_error(api, false);
                Err(CallError::Timeout {
                    api: api.to_string(),
                    seconds: timeout.as_secs(),
                }
                .into())
            }
        }
    }

    pub fn stats(&self) -> BTreeMap<String, ApiStats> {
        let cap = self.max_backoff();
        self.apis
            .iter()
            .map(|entry| {
                let s = entry.value();
                (
                    entry.key().clone(),
                    ApiStats {
                        calls: s.calls,
                        successes: s.successes,
                        errors: s.errors,
                        rate_limit_hits: s.rate_limit_hits,
                        consecutive_errors: s.consecutive_errors,
                        backoff_seconds: backoff_for(s.consecutive_errors, cap).as_secs(),
                    },
                )
            })
            .collect()
    }
}

impl Default for CallGovernor {
    fn default() -> Self {
        Self::new(GovernorConfig::default())
    }
}
