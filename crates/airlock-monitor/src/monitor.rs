//! Metrics store, rolling error log and health snapshot

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

/// How many recent error records the monitor retains.
pub const ERROR_LOG_CAPACITY: usize = 100;

/// Error rate (per second) above which the endpoint reports unhealthy.
const UNHEALTHY_ERROR_RATE: f64 = 1.0;

/// Derived health of the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: i64,
    pub messages_total: u64,
    pub bytes_transferred: u64,
    pub errors_total: u64,
    pub reconnects_total: u64,
    pub sessions_total: u64,
    pub sessions_active: i64,
}

/// One retained error occurrence.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub level: String,
    pub message: String,
}

/// Health information for one connected agent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealth {
    pub id: String,
    pub connected: bool,
    pub last_ping: chrono::DateTime<chrono::Utc>,
    pub active_sessions: usize,
}

/// Health information for one active session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHealth {
    pub id: String,
    pub client_id: String,
    pub target: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Full health snapshot served by the relay's `/health` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub implementation: String,
    pub uptime: String,
    pub metrics: MetricsSnapshot,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub clients: Vec<AgentHealth>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sessions: Vec<SessionHealth>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorRecord>,
}

/// Hot-path counters, all atomic.
#[derive(Debug, Default)]
pub struct MetricsStore {
    connections_total: AtomicU64,
    connections_active: AtomicI64,
    messages_total: AtomicU64,
    bytes_transferred: AtomicU64,
    errors_total: AtomicU64,
    reconnects_total: AtomicU64,
    sessions_total: AtomicU64,
    sessions_active: AtomicI64,
}

impl MetricsStore {
    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn session_opened(&self) {
        self.sessions_total.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record one control message carrying `bytes` of payload.
    pub fn record_message(&self, bytes: usize) {
        self.messages_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connections_active(&self) -> i64 {
        self.connections_active.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            messages_total: self.messages_total.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            reconnects_total: self.reconnects_total.load(Ordering::Relaxed),
            sessions_total: self.sessions_total.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
        }
    }
}

/// Health monitor for one endpoint process.
pub struct Monitor {
    implementation: String,
    started: Instant,
    metrics: MetricsStore,
    errors: Mutex<VecDeque<ErrorRecord>>,
}

impl Monitor {
    pub fn new(implementation: impl Into<String>) -> Self {
        Self {
            implementation: implementation.into(),
            started: Instant::now(),
            metrics: MetricsStore::default(),
            errors: Mutex::new(VecDeque::with_capacity(ERROR_LOG_CAPACITY)),
        }
    }

    pub fn metrics(&self) -> &MetricsStore {
        &self.metrics
    }

    /// Record an error occurrence into the counters and the rolling log.
    pub fn record_error(&self, level: &str, message: impl Into<String>) {
        self.metrics.errors_total.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut errors) = self.errors.lock() {
            if errors.len() == ERROR_LOG_CAPACITY {
                errors.pop_front();
            }
            errors.push_back(ErrorRecord {
                timestamp: chrono::Utc::now(),
                level: level.to_string(),
                message: message.into(),
            });
        }
    }

    /// Most recent error records, newest first.
    pub fn recent_errors(&self, count: usize) -> Vec<ErrorRecord> {
        match self.errors.lock() {
            Ok(errors) => errors.iter().rev().take(count).cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Derive the endpoint's health from the counters.
    pub fn health_state(&self) -> HealthState {
        if self.metrics.connections_active() == 0 {
            return HealthState::Degraded;
        }

        let elapsed = self.started.elapsed().as_secs_f64().max(1.0);
        let error_rate = self.metrics.errors_total.load(Ordering::Relaxed) as f64 / elapsed;
        if error_rate > UNHEALTHY_ERROR_RATE {
            return HealthState::Unhealthy;
        }

        HealthState::Healthy
    }

    /// Assemble the full health snapshot. Callers supply the live agent
    /// and session views they hold.
    pub fn health(
        &self,
        clients: Vec<AgentHealth>,
        sessions: Vec<SessionHealth>,
    ) -> HealthStatus {
        HealthStatus {
            status: self.health_state(),
            implementation: self.implementation.clone(),
            uptime: format_uptime(self.started.elapsed().as_secs()),
            metrics: self.metrics.snapshot(),
            clients,
            sessions,
            errors: self.recent_errors(10),
        }
    }
}

fn format_uptime(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}
