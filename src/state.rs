//! # Application State Management
//!
//! Shared state handed to every HTTP handler and websocket upgrade.
//!
//! ## What lives here:
//! - **Configuration** behind `Arc<RwLock<_>>`; handlers take a cloned copy
//!   so no lock is held across an await
//! - **Request metrics** updated by the metrics middleware on every request
//! - **Conversation counters** updated by the websocket upgrade handler
//! - **The conversation core**: the process-wide [`StateStore`] and the
//!   [`ConversationOrchestrator`] that serves each connection
//!
//! Live conversation count is read straight from the store. Admission is
//! counted separately with [`ConversationSlot`]s, which are taken at upgrade
//! time and cover connections still authenticating.

use crate::config::AppConfig;
use crate::conversation::{ConversationOrchestrator, StateStore};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,

    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Live conversations keyed by connection id
    pub store: Arc<StateStore>,

    pub orchestrator: Arc<ConversationOrchestrator>,

    /// Admitted conversations, from upgrade until the orchestrator returns
    reserved: Arc<AtomicUsize>,

    /// When the server started (never changes)
    pub start_time: Instant,
}

/// One admitted conversation. Releases its capacity when dropped.
#[derive(Debug)]
pub struct ConversationSlot {
    reserved: Arc<AtomicUsize>,
}

impl Drop for ConversationSlot {
    fn drop(&mut self) {
        self.reserved.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Counters collected across all requests and conversations.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of requests that ended in a 4xx/5xx
    pub error_count: u64,

    /// Websocket upgrades that reached the orchestrator
    pub conversations_started: u64,

    /// Upgrades refused before the handshake (bad request, at capacity)
    pub conversations_rejected: u64,

    /// Conversations that ended after becoming active
    pub conversations_completed: u64,

    /// Conversations that failed during authentication or session setup
    pub conversations_failed: u64,

    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    pub error_count: u64,
}

/// How a conversation ended, for the counters above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationEnd {
    Completed,
    Failed,
}

impl AppState {
    pub fn new(config: AppConfig, store: Arc<StateStore>, orchestrator: Arc<ConversationOrchestrator>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            store,
            orchestrator,
            reserved: Arc::new(AtomicUsize::new(0)),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn metrics_ref(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn record_conversation_started(&self) {
        self.metrics_mut().conversations_started += 1;
    }

    pub fn record_conversation_rejected(&self) {
        self.metrics_mut().conversations_rejected += 1;
    }

    pub fn record_conversation_ended(&self, end: ConversationEnd) {
        let mut metrics = self.metrics_mut();
        match end {
            ConversationEnd::Completed => metrics.conversations_completed += 1,
            ConversationEnd::Failed => metrics.conversations_failed += 1,
        }
    }

    /// Number of conversations currently held in the store.
    pub fn active_conversations(&self) -> usize {
        self.store.len()
    }

    /// Conversations admitted but not yet finished, including those still in setup.
    pub fn reserved_conversations(&self) -> usize {
        self.reserved.load(Ordering::SeqCst)
    }

    /// Admit one more conversation, or `None` when at capacity.
    pub fn try_reserve_conversation(&self) -> Option<ConversationSlot> {
        let max = self.get_config().performance.max_concurrent_sessions;
        self.reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| ConversationSlot {
                reserved: self.reserved.clone(),
            })
    }

    /// Consistent copy of the metrics; no lock is held afterwards.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_ref().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate as a fraction (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
