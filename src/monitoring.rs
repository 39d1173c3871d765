//! API health monitoring and rate limiting.
//!
//! The collection orchestrator reports every API call here; the recovery
//! engine and the checkpoint snapshots read the resulting [`HealthStatus`] and
//! [`UsageInfo`] records. Both collaborators are traits so API clients can
//! plug in their own accounting. In-memory implementations are provided.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Outcomes kept per API for success-rate and latency averages
const DEFAULT_HEALTH_WINDOW: usize = 20;

/// Consecutive errors after which an API is considered offline
const OFFLINE_CONSECUTIVE_ERRORS: u32 = 5;

/// Average latency above which an API is degraded
const SLOW_RESPONSE_MS: f64 = 5000.0;

/// Backoff cap after repeated failures
const MAX_BACKOFF: Duration = Duration::from_secs(120);

/// Coarse health classification of one API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiStatus {
    Healthy,
    Degraded,
    Critical,
    Offline,
}

impl ApiStatus {
    /// Factor by which the request window capacity is divided
    pub fn rate_multiplier(self) -> f64 {
        match self {
            ApiStatus::Healthy => 1.0,
            ApiStatus::Degraded => 2.0,
            ApiStatus::Critical => 4.0,
            ApiStatus::Offline => 8.0,
        }
    }

    /// Whether collection against this API is expected to stall
    pub fn is_unusable(self) -> bool {
        matches!(self, ApiStatus::Critical | ApiStatus::Offline)
    }
}

/// Health snapshot for one API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub api_name: String,
    pub status: ApiStatus,
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub consecutive_errors: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_successful_request: Option<DateTime<Utc>>,
}

impl HealthStatus {
    /// Status for an API that has not been observed yet
    pub fn unobserved(api_name: &str) -> Self {
        Self {
            api_name: api_name.to_string(),
            status: ApiStatus::Healthy,
            success_rate: 1.0,
            avg_response_time_ms: 0.0,
            consecutive_errors: 0,
            last_error: None,
            last_successful_request: None,
        }
    }
}

/// Rate-limit window usage for one API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageInfo {
    pub requests_in_window: usize,
    pub window_capacity: usize,
    pub current_delay_seconds: f64,
    pub health_multiplier: f64,
}

/// Minimal view of an API response used for health accounting
#[derive(Debug, Clone, Default)]
pub struct ApiResponse {
    /// HTTP status, if a response was received at all
    pub status_code: Option<u16>,
    /// Transport or client-side error
    pub error: Option<String>,
}

impl ApiResponse {
    /// Successful response with the given status
    pub fn ok(status_code: u16) -> Self {
        Self {
            status_code: Some(status_code),
            error: None,
        }
    }

    /// Failed request
    pub fn failed(status_code: Option<u16>, error: impl Into<String>) -> Self {
        Self {
            status_code,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status_code.is_some_and(|c| (200..300).contains(&c))
    }

    fn error_summary(&self) -> String {
        match (&self.error, self.status_code) {
            (Some(e), _) => e.clone(),
            (None, Some(code)) => format!("HTTP {}", code),
            (None, None) => "no response".to_string(),
        }
    }
}

/// Tracks per-API health from observed responses
pub trait ApiHealthMonitor: Send + Sync {
    /// Record one response and return the updated status
    fn monitor_api_health(&self, api_name: &str, response: &ApiResponse, duration_ms: f64) -> HealthStatus;

    /// Current status of an API
    fn get_health_status(&self, api_name: &str) -> HealthStatus;
}

/// Adaptive request pacing per API
pub trait RateLimitManager: Send + Sync {
    fn can_make_request(&self, api_name: &str) -> bool;

    /// Block until a request is allowed; returns seconds waited
    fn wait_if_needed(&self, api_name: &str) -> f64;

    fn record_request(&self, api_name: &str, success: bool, response_time_ms: f64);

    fn update_api_health(&self, api_name: &str, health_status: &HealthStatus);

    fn get_current_usage(&self, api_name: &str) -> UsageInfo;
}

// ============================================================================
// Health tracking
// ============================================================================

#[derive(Debug, Default)]
struct HealthWindow {
    outcomes: VecDeque<(bool, f64)>,
    consecutive_errors: u32,
    last_error: Option<String>,
    last_successful_request: Option<DateTime<Utc>>,
}

impl HealthWindow {
    fn status(&self, api_name: &str) -> HealthStatus {
        if self.outcomes.is_empty() {
            return HealthStatus::unobserved(api_name);
        }

        let total = self.outcomes.len() as f64;
        let successes = self.outcomes.iter().filter(|(ok, _)| *ok).count() as f64;
        let success_rate = successes / total;
        let avg_response_time_ms = self.outcomes.iter().map(|(_, ms)| ms).sum::<f64>() / total;

        let status = if self.consecutive_errors >= OFFLINE_CONSECUTIVE_ERRORS {
            ApiStatus::Offline
        } else if success_rate < 0.5 {
            ApiStatus::Critical
        } else if success_rate < 0.9 || avg_response_time_ms > SLOW_RESPONSE_MS {
            ApiStatus::Degraded
        } else {
            ApiStatus::Healthy
        };

        HealthStatus {
            api_name: api_name.to_string(),
            status,
            success_rate,
            avg_response_time_ms,
            consecutive_errors: self.consecutive_errors,
            last_error: self.last_error.clone(),
            last_successful_request: self.last_successful_request,
        }
    }
}

/// In-memory [`ApiHealthMonitor`] over a bounded window of recent outcomes
pub struct HealthTracker {
    window_size: usize,
    windows: Mutex<HashMap<String, HealthWindow>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_HEALTH_WINDOW)
    }

    /// Tracker that averages over the last `window_size` outcomes
    pub fn with_window(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
            windows: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiHealthMonitor for HealthTracker {
    fn monitor_api_health(&self, api_name: &str, response: &ApiResponse, duration_ms: f64) -> HealthStatus {
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let window = windows.entry(api_name.to_string()).or_default();

        let success = response.is_success();
        window.outcomes.push_back((success, duration_ms.max(0.0)));
        while window.outcomes.len() > self.window_size {
            window.outcomes.pop_front();
        }

        if success {
            window.consecutive_errors = 0;
            window.last_successful_request = Some(Utc::now());
        } else {
            window.consecutive_errors += 1;
            window.last_error = Some(response.error_summary());
        }

        let status = window.status(api_name);
        if status.status.is_unusable() {
            warn!(
                api = api_name,
                status = ?status.status,
                consecutive_errors = status.consecutive_errors,
                "API health deteriorated"
            );
        } else {
            debug!(api = api_name, status = ?status.status, "API health updated");
        }
        status
    }

    fn get_health_status(&self, api_name: &str) -> HealthStatus {
        let windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        windows
            .get(api_name)
            .map(|w| w.status(api_name))
            .unwrap_or_else(|| HealthStatus::unobserved(api_name))
    }
}

// ============================================================================
// Rate limiting
// ============================================================================

#[derive(Debug)]
struct LimiterState {
    requests: VecDeque<Instant>,
    capacity: usize,
    window: Duration,
    consecutive_failures: u32,
    backoff_until: Option<Instant>,
    health_multiplier: f64,
    offline: bool,
}

impl LimiterState {
    fn new(capacity: usize, window: Duration) -> Self {
        Self {
            requests: VecDeque::new(),
            capacity: capacity.max(1),
            window,
            consecutive_failures: 0,
            backoff_until: None,
            health_multiplier: 1.0,
            offline: false,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.requests.front() {
            if now.duration_since(*front) >= self.window {
                self.requests.pop_front();
            } else {
                break;
            }
        }
    }

    /// Capacity after the health multiplier is applied; at least one request
    fn effective_capacity(&self) -> usize {
        if self.offline {
            return 0;
        }
        ((self.capacity as f64 / self.health_multiplier).floor() as usize).max(1)
    }

    fn delay(&mut self, now: Instant) -> Duration {
        self.prune(now);

        let backoff_wait = self
            .backoff_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default();

        if self.offline {
            return backoff_wait.max(self.window);
        }

        let window_wait = if self.requests.len() >= self.effective_capacity() {
            self.requests
                .front()
                .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
                .unwrap_or_default()
        } else {
            Duration::ZERO
        };

        window_wait.max(backoff_wait)
    }
}

/// Exponential backoff for the n-th consecutive failure: 1s * 2^(n-1), capped
pub fn failure_backoff(consecutive_failures: u32) -> Duration {
    if consecutive_failures == 0 {
        return Duration::ZERO;
    }
    let exponent = consecutive_failures.saturating_sub(1).min(16);
    Duration::from_secs(2_u64.pow(exponent)).min(MAX_BACKOFF)
}

/// In-memory [`RateLimitManager`] with a sliding request window per API
pub struct SlidingWindowRateLimiter {
    default_capacity: usize,
    default_window: Duration,
    states: Mutex<HashMap<String, LimiterState>>,
}

impl SlidingWindowRateLimiter {
    /// Limiter allowing `capacity` requests per `window` for every API
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            default_capacity: capacity,
            default_window: window,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Override the limit for one API
    pub fn with_limit(self, api_name: &str, capacity: usize, window: Duration) -> Self {
        if let Ok(mut states) = self.states.lock() {
            states.insert(api_name.to_string(), LimiterState::new(capacity, window));
        }
        self
    }

    fn with_state<R>(&self, api_name: &str, f: impl FnOnce(&mut LimiterState) -> R) -> R {
        let mut states = match self.states.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let state = states
            .entry(api_name.to_string())
            .or_insert_with(|| LimiterState::new(self.default_capacity, self.default_window));
        f(state)
    }
}

impl RateLimitManager for SlidingWindowRateLimiter {
    fn can_make_request(&self, api_name: &str) -> bool {
        self.with_state(api_name, |state| state.delay(Instant::now()).is_zero())
    }

    fn wait_if_needed(&self, api_name: &str) -> f64 {
        let delay = self.with_state(api_name, |state| state.delay(Instant::now()));
        if delay.is_zero() {
            return 0.0;
        }
        debug!(api = api_name, delay_ms = delay.as_millis() as u64, "Rate limit wait");
        std::thread::sleep(delay);
        delay.as_secs_f64()
    }

    fn record_request(&self, api_name: &str, success: bool, response_time_ms: f64) {
        self.with_state(api_name, |state| {
            let now = Instant::now();
            state.prune(now);
            state.requests.push_back(now);

            if success {
                state.consecutive_failures = 0;
                state.backoff_until = None;
            } else {
                state.consecutive_failures += 1;
                let backoff = failure_backoff(state.consecutive_failures);
                state.backoff_until = Some(now + backoff);
                warn!(
                    api = api_name,
                    failures = state.consecutive_failures,
                    backoff_secs = backoff.as_secs(),
                    response_time_ms,
                    "Request failed, backing off"
                );
            }
        });
    }

    fn update_api_health(&self, api_name: &str, health_status: &HealthStatus) {
        let multiplier = health_status.status.rate_multiplier();
        let offline = health_status.status == ApiStatus::Offline;
        self.with_state(api_name, |state| {
            if state.offline != offline || (state.health_multiplier - multiplier).abs() > f64::EPSILON {
                info!(
                    api = api_name,
                    status = ?health_status.status,
                    multiplier,
                    "Adjusting rate limit for API health"
                );
            }
            state.health_multiplier = multiplier;
            state.offline = offline;
        });
    }

    fn get_current_usage(&self, api_name: &str) -> UsageInfo {
        self.with_state(api_name, |state| {
            let delay = state.delay(Instant::now());
            UsageInfo {
                requests_in_window: state.requests.len(),
                window_capacity: state.effective_capacity(),
                current_delay_seconds: delay.as_secs_f64(),
                health_multiplier: state.health_multiplier,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_goes_offline_after_consecutive_errors() {
        let tracker = HealthTracker::new();
        tracker.monitor_api_health("openalex", &ApiResponse::ok(200), 120.0);
        for _ in 0..5 {
            tracker.monitor_api_health("openalex", &ApiResponse::failed(None, "connection reset"), 30_000.0);
        }

        let status = tracker.get_health_status("openalex");
        assert_eq!(status.status, ApiStatus::Offline);
        assert_eq!(status.consecutive_errors, 5);
        assert_eq!(status.last_error.as_deref(), Some("connection reset"));
        assert!(status.last_successful_request.is_some());
    }

    #[test]
    fn test_health_degraded_and_recovering() {
        let tracker = HealthTracker::with_window(10);
        for _ in 0..8 {
            tracker.monitor_api_health("crossref", &ApiResponse::ok(200), 100.0);
        }
        let status = tracker.monitor_api_health("crossref", &ApiResponse::failed(Some(429), "rate limited"), 10.0);
        assert_eq!(status.status, ApiStatus::Degraded);

        // Window of 10 slides past the failure
        for _ in 0..10 {
            tracker.monitor_api_health("crossref", &ApiResponse::ok(200), 100.0);
        }
        assert_eq!(tracker.get_health_status("crossref").status, ApiStatus::Healthy);
    }

    #[test]
    fn test_unobserved_api_is_healthy() {
        let tracker = HealthTracker::new();
        let status = tracker.get_health_status("semantic_scholar");
        assert_eq!(status.status, ApiStatus::Healthy);
        assert_eq!(status.success_rate, 1.0);
    }

    #[test]
    fn test_failure_backoff_caps() {
        assert_eq!(failure_backoff(0), Duration::ZERO);
        assert_eq!(failure_backoff(1), Duration::from_secs(1));
        assert_eq!(failure_backoff(3), Duration::from_secs(4));
        assert_eq!(failure_backoff(20), MAX_BACKOFF);
    }

    #[test]
    fn test_window_capacity_blocks_then_frees() {
        let limiter = SlidingWindowRateLimiter::new(2, Duration::from_millis(50));
        assert!(limiter.can_make_request("acl"));
        limiter.record_request("acl", true, 10.0);
        limiter.record_request("acl", true, 10.0);
        assert!(!limiter.can_make_request("acl"));

        let waited = limiter.wait_if_needed("acl");
        assert!(waited > 0.0 && waited <= 0.05);
        assert!(limiter.can_make_request("acl"));
    }

    #[test]
    fn test_failure_sets_backoff() {
        let limiter = SlidingWindowRateLimiter::new(100, Duration::from_secs(60));
        limiter.record_request("ijcai", false, 500.0);
        assert!(!limiter.can_make_request("ijcai"));
        let usage = limiter.get_current_usage("ijcai");
        assert!(usage.current_delay_seconds > 0.0);

        limiter.record_request("ijcai", true, 100.0);
        assert!(limiter.can_make_request("ijcai"));
    }

    #[test]
    fn test_health_multiplier_shrinks_capacity() {
        let limiter = SlidingWindowRateLimiter::new(10, Duration::from_secs(60))
            .with_limit("openalex", 8, Duration::from_secs(60));

        let mut degraded = HealthStatus::unobserved("openalex");
        degraded.status = ApiStatus::Degraded;
        limiter.update_api_health("openalex", &degraded);
        let usage = limiter.get_current_usage("openalex");
        assert_eq!(usage.window_capacity, 4);
        assert_eq!(usage.health_multiplier, 2.0);

        let mut offline = degraded.clone();
        offline.status = ApiStatus::Offline;
        limiter.update_api_health("openalex", &offline);
        assert!(!limiter.can_make_request("openalex"));
        assert_eq!(limiter.get_current_usage("openalex").window_capacity, 0);
    }
}
