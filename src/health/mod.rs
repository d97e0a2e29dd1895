//! Source health monitoring
//!
//! Tracks success/failure/latency per source, computes rolling health
//! scores, runs a circuit breaker per source, raises deduplicated alerts,
//! and ingests aggregation-level conflict statistics. The monitor is the
//! sole writer of per-source health state.

pub mod circuit;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitState, Clock, SystemClock};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use crate::config::HealthConfig;
use crate::types::SourceId;

/// Outcome details for a successful fetch
#[derive(Debug, Clone)]
pub struct SuccessDetails {
    pub duration_ms: u64,
    pub record_count: usize,
    pub operation: &'static str,
}

/// Outcome details for a failed fetch
#[derive(Debug, Clone)]
pub struct FailureDetails {
    pub error_type: String,
    pub message: String,
    pub status_code: Option<u16>,
    pub retryable: bool,
    pub operation: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighErrorRate,
    ConsecutiveFailures,
    CircuitOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// An active alert, deduplicated by (source, kind). Severity upgrades in
/// place when a worse condition recurs.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub source: SourceId,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub raised_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    ok: bool,
    duration_ms: u64,
    at: DateTime<Utc>,
}

struct SourceHealth {
    breaker: CircuitBreaker,
    samples: VecDeque<Sample>,
    total_success: u64,
    total_failure: u64,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    last_error: Option<String>,
    alerts: Vec<Alert>,
}

impl SourceHealth {
    fn new(circuit: CircuitConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(circuit),
            samples: VecDeque::new(),
            total_success: 0,
            total_failure: 0,
            last_success: None,
            last_failure: None,
            last_error: None,
            alerts: Vec::new(),
        }
    }

    fn push_sample(&mut self, sample: Sample, window: usize) {
        self.samples.push_back(sample);
        while self.samples.len() > window.max(1) {
            self.samples.pop_front();
        }
    }

    fn error_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let failures = self.samples.iter().filter(|s| !s.ok).count();
        failures as f64 / self.samples.len() as f64
    }

    fn avg_response_ms(&self) -> f64 {
        let ok: Vec<u64> = self
            .samples
            .iter()
            .filter(|s| s.ok)
            .map(|s| s.duration_ms)
            .collect();
        if ok.is_empty() {
            return 0.0;
        }
        ok.iter().sum::<u64>() as f64 / ok.len() as f64
    }

    fn response_percentile(&self, pct: f64) -> Option<u64> {
        let mut ok: Vec<u64> = self
            .samples
            .iter()
            .filter(|s| s.ok)
            .map(|s| s.duration_ms)
            .collect();
        if ok.is_empty() {
            return None;
        }
        ok.sort_unstable();
        let idx = ((ok.len() as f64 - 1.0) * pct).round() as usize;
        ok.get(idx.min(ok.len() - 1)).copied()
    }
}

/// Serializable per-source health report
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealthReport {
    pub source: SourceId,
    pub health_score: f64,
    pub operational: bool,
    pub circuit_state: CircuitState,
    pub next_retry_time: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub error_rate: f64,
    pub avg_response_ms: f64,
    pub p50_response_ms: Option<u64>,
    pub p95_response_ms: Option<u64>,
    pub total_success: u64,
    pub total_failure: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub active_alerts: Vec<Alert>,
}

/// Degraded-mode recommendation with human-readable reasons
#[derive(Debug, Clone, Serialize)]
pub struct DegradedMode {
    pub recommended: bool,
    pub reasons: Vec<String>,
}

/// System-wide health view
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealthReport {
    pub score: f64,
    pub operational_sources: usize,
    pub total_sources: usize,
    pub conflict_rate_per_hour: f64,
    pub conflict_penalty: f64,
    pub degraded: DegradedMode,
}

#[derive(Debug, Clone)]
struct ConflictCycle {
    at: DateTime<Utc>,
    conflicts: u64,
}

struct MonitorState {
    sources: HashMap<SourceId, SourceHealth>,
    conflict_cycles: VecDeque<ConflictCycle>,
    conflicts_by_field: BTreeMap<String, u64>,
}

/// Tracks per-source health. Interior mutability so fetch outcome recording
/// does not require `&mut self` across the engine.
pub struct HealthMonitor {
    config: HealthConfig,
    clock: Arc<dyn Clock>,
    state: RwLock<MonitorState>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: HealthConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: RwLock::new(MonitorState {
                sources: HashMap::new(),
                conflict_cycles: VecDeque::new(),
                conflicts_by_field: BTreeMap::new(),
            }),
        }
    }

    fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.config.failure_threshold,
            cooldown: Duration::seconds(self.config.cooldown_secs as i64),
            half_open_max_calls: self.config.half_open_max_calls,
            half_open_successes_to_close: self.config.half_open_successes_to_close,
        }
    }

    /// Create the health record for a source. Idempotent; records are
    /// never deleted while the process runs.
    pub fn initialize_source(&self, id: SourceId) {
        let circuit = self.circuit_config();
        let mut state = self.state.write().expect("health state poisoned");
        state
            .sources
            .entry(id)
            .or_insert_with(|| SourceHealth::new(circuit));
    }

    /// Whether a call to this source may proceed (circuit gate). Also
    /// performs the open -> half-open transition when the cooldown elapsed.
    pub fn allow_request(&self, id: SourceId) -> bool {
        let now = self.clock.now();
        let circuit = self.circuit_config();
        let mut state = self.state.write().expect("health state poisoned");
        let health = state
            .sources
            .entry(id)
            .or_insert_with(|| SourceHealth::new(circuit));
        let allowed = health.breaker.allow_request(now);
        if !allowed {
            tracing::debug!(source = %id, "Circuit open; skipping source this cycle");
        }
        allowed
    }

    pub fn record_success(&self, id: SourceId, details: SuccessDetails) {
        let now = self.clock.now();
        let circuit = self.circuit_config();
        let mut state = self.state.write().expect("health state poisoned");
        let health = state
            .sources
            .entry(id)
            .or_insert_with(|| SourceHealth::new(circuit));

        health.breaker.record_success(now);
        health.total_success += 1;
        health.last_success = Some(now);
        health.push_sample(
            Sample {
                ok: true,
                duration_ms: details.duration_ms,
                at: now,
            },
            self.config.sample_window,
        );

        // Clear condition-bound alerts once the condition is gone
        let error_rate = health.error_rate();
        let circuit_closed = health.breaker.state() == CircuitState::Closed;
        let consecutive = health.breaker.consecutive_failures();
        let error_rate_alert = self.config.error_rate_alert;
        health.alerts.retain(|alert| match alert.kind {
            AlertKind::CircuitOpen => !circuit_closed,
            AlertKind::ConsecutiveFailures => consecutive >= 3,
            AlertKind::HighErrorRate => error_rate >= error_rate_alert,
        });

        tracing::debug!(
            source = %id,
            duration_ms = details.duration_ms,
            records = details.record_count,
            operation = details.operation,
            "Recorded source success"
        );
    }

    pub fn record_failure(&self, id: SourceId, details: FailureDetails) {
        let now = self.clock.now();
        let circuit = self.circuit_config();
        let error_rate_alert = self.config.error_rate_alert;
        let sample_window = self.config.sample_window;
        let mut state = self.state.write().expect("health state poisoned");
        let health = state
            .sources
            .entry(id)
            .or_insert_with(|| SourceHealth::new(circuit));

        health.breaker.record_failure(now);
        health.total_failure += 1;
        health.last_failure = Some(now);
        health.last_error = Some(format!("{}: {}", details.error_type, details.message));
        health.push_sample(
            Sample {
                ok: false,
                duration_ms: 0,
                at: now,
            },
            sample_window,
        );

        tracing::warn!(
            source = %id,
            error_type = %details.error_type,
            status = ?details.status_code,
            retryable = details.retryable,
            operation = details.operation,
            "Recorded source failure: {}",
            details.message
        );

        // Threshold evaluation -> raise/upgrade alerts
        let consecutive = health.breaker.consecutive_failures();
        let error_rate = health.error_rate();
        let circuit_state = health.breaker.state();

        if error_rate >= error_rate_alert && health.samples.len() >= 5 {
            Self::raise_alert(
                &mut health.alerts,
                id,
                AlertKind::HighErrorRate,
                AlertSeverity::Warning,
                format!("error rate {:.0}% over recent window", error_rate * 100.0),
                now,
            );
        }
        if consecutive >= 3 {
            Self::raise_alert(
                &mut health.alerts,
                id,
                AlertKind::ConsecutiveFailures,
                if consecutive >= 5 {
                    AlertSeverity::Critical
                } else {
                    AlertSeverity::Warning
                },
                format!("{consecutive} consecutive failures"),
                now,
            );
        }
        if circuit_state == CircuitState::Open {
            Self::raise_alert(
                &mut health.alerts,
                id,
                AlertKind::CircuitOpen,
                AlertSeverity::Critical,
                "circuit breaker open".to_string(),
                now,
            );
        }
    }

    /// Raise a new alert or upgrade the existing one in place. Never emits
    /// duplicate active alerts for the same (source, kind).
    fn raise_alert(
        alerts: &mut Vec<Alert>,
        source: SourceId,
        kind: AlertKind,
        severity: AlertSeverity,
        message: String,
        now: DateTime<Utc>,
    ) {
        if let Some(existing) = alerts.iter_mut().find(|a| a.kind == kind) {
            if severity > existing.severity {
                tracing::warn!(source = %source, kind = ?kind, "Alert upgraded to {:?}", severity);
                existing.severity = severity;
            }
            existing.message = message;
            existing.updated_at = now;
            return;
        }
        tracing::warn!(source = %source, kind = ?kind, severity = ?severity, "Alert raised: {message}");
        alerts.push(Alert {
            source,
            kind,
            severity,
            message,
            raised_at: now,
            updated_at: now,
        });
    }

    /// Health score 0-100 per source:
    /// 100, minus up to 50 proportional to rolling error rate, minus 10 per
    /// consecutive failure (capped at 40), minus 20 when the average
    /// response time exceeds the threshold; forced to 0 while open, halved
    /// while half-open.
    fn score(&self, health: &SourceHealth) -> f64 {
        if health.breaker.state() == CircuitState::Open {
            return 0.0;
        }

        let mut score = 100.0;
        score -= 50.0 * health.error_rate().clamp(0.0, 1.0);
        score -= (10.0 * health.breaker.consecutive_failures() as f64).min(40.0);
        if health.avg_response_ms() > self.config.response_time_threshold_ms as f64 {
            score -= 20.0;
        }
        let mut score = score.max(0.0);
        if health.breaker.state() == CircuitState::HalfOpen {
            score /= 2.0;
        }
        score
    }

    fn report_for(&self, id: SourceId, health: &SourceHealth) -> SourceHealthReport {
        let score = self.score(health);
        SourceHealthReport {
            source: id,
            health_score: score,
            operational: score > 20.0,
            circuit_state: health.breaker.state(),
            next_retry_time: health.breaker.next_retry_time(),
            consecutive_failures: health.breaker.consecutive_failures(),
            error_rate: health.error_rate(),
            avg_response_ms: health.avg_response_ms(),
            p50_response_ms: health.response_percentile(0.50),
            p95_response_ms: health.response_percentile(0.95),
            total_success: health.total_success,
            total_failure: health.total_failure,
            last_success: health.last_success,
            last_failure: health.last_failure,
            last_error: health.last_error.clone(),
            active_alerts: health.alerts.clone(),
        }
    }

    pub fn source_health(&self, id: SourceId) -> Option<SourceHealthReport> {
        let state = self.state.read().expect("health state poisoned");
        state.sources.get(&id).map(|h| self.report_for(id, h))
    }

    pub fn all_source_health(&self) -> Vec<SourceHealthReport> {
        let state = self.state.read().expect("health state poisoned");
        let mut reports: Vec<SourceHealthReport> = state
            .sources
            .iter()
            .map(|(id, h)| self.report_for(*id, h))
            .collect();
        reports.sort_by_key(|r| r.source);
        reports
    }

    /// Ingest one aggregation cycle's conflict tallies. Conflicts degrade
    /// system health, not individual source health.
    pub fn record_conflict_metrics(
        &self,
        conflicts_by_field: &BTreeMap<String, u64>,
        asset_count: usize,
    ) {
        let now = self.clock.now();
        let total: u64 = conflicts_by_field.values().sum();
        let window = Duration::minutes(self.config.conflict_window_mins);
        let mut state = self.state.write().expect("health state poisoned");

        state.conflict_cycles.push_back(ConflictCycle {
            at: now,
            conflicts: total,
        });
        while let Some(front) = state.conflict_cycles.front() {
            if now - front.at > window {
                state.conflict_cycles.pop_front();
            } else {
                break;
            }
        }
        for (field, count) in conflicts_by_field {
            *state.conflicts_by_field.entry(field.clone()).or_insert(0) += count;
        }

        if total > 0 {
            tracing::info!(
                conflicts = total,
                assets = asset_count,
                "Cross-source conflicts recorded this cycle"
            );
        }
    }

    /// Conflicts per hour over the sliding window of recent cycles
    pub fn conflict_rate_per_hour(&self) -> f64 {
        let state = self.state.read().expect("health state poisoned");
        let total: u64 = state.conflict_cycles.iter().map(|c| c.conflicts).sum();
        let window_hours = self.config.conflict_window_mins as f64 / 60.0;
        if window_hours <= 0.0 {
            return 0.0;
        }
        total as f64 / window_hours
    }

    fn conflict_penalty(&self) -> f64 {
        (self.conflict_rate_per_hour() * self.config.conflict_penalty_per_hour).min(20.0)
    }

    /// Degraded-mode recommendation from three independent checks. Callers
    /// keep serving the last good snapshot either way.
    pub fn check_degraded_mode(&self) -> DegradedMode {
        let reports = self.all_source_health();
        let mut reasons = Vec::new();

        let healthy = reports.iter().filter(|r| r.operational).count();
        if healthy < self.config.min_healthy_sources {
            reasons.push(format!(
                "only {healthy} of {} sources operational (minimum {})",
                reports.len(),
                self.config.min_healthy_sources
            ));
        }

        let (rates, times): (Vec<f64>, Vec<f64>) = reports
            .iter()
            .map(|r| (r.error_rate, r.avg_response_ms))
            .unzip();
        if !rates.is_empty() {
            let avg_error_rate = rates.iter().sum::<f64>() / rates.len() as f64;
            if avg_error_rate > self.config.degraded_error_rate {
                reasons.push(format!(
                    "system error rate {:.0}% above {:.0}% threshold",
                    avg_error_rate * 100.0,
                    self.config.degraded_error_rate * 100.0
                ));
            }
            let avg_response = times.iter().sum::<f64>() / times.len() as f64;
            if avg_response > self.config.degraded_avg_response_ms as f64 {
                reasons.push(format!(
                    "system average response time {avg_response:.0}ms above {}ms threshold",
                    self.config.degraded_avg_response_ms
                ));
            }
        }

        DegradedMode {
            recommended: !reasons.is_empty(),
            reasons,
        }
    }

    /// System-wide health: mean of per-source scores minus the capped
    /// conflict penalty
    pub fn system_health(&self) -> SystemHealthReport {
        let reports = self.all_source_health();
        let base = if reports.is_empty() {
            100.0
        } else {
            reports.iter().map(|r| r.health_score).sum::<f64>() / reports.len() as f64
        };
        let penalty = self.conflict_penalty();
        SystemHealthReport {
            score: (base - penalty).max(0.0),
            operational_sources: reports.iter().filter(|r| r.operational).count(),
            total_sources: reports.len(),
            conflict_rate_per_hour: self.conflict_rate_per_hour(),
            conflict_penalty: penalty,
            degraded: self.check_degraded_mode(),
        }
    }

    /// Drop samples older than the rolling window. Records themselves are
    /// never deleted.
    pub fn prune_stale_samples(&self, max_age: Duration) {
        let now = self.clock.now();
        let mut state = self.state.write().expect("health state poisoned");
        for health in state.sources.values_mut() {
            health.samples.retain(|s| now - s.at <= max_age);
        }
    }
}
