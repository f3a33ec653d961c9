//! Bounded wait for the collector pods to come up after a deploy.
//!
//! The poller never fails: running out of attempts is reported through
//! [`PollResult::ready`] so the caller's own assertions produce the visible
//! failure.

use crate::kubernetes::Orchestrator;
use crate::types::{PodStatusSnapshot, PollResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, Span, debug, info, warn};

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub interval: Duration,
    /// Extra wait after readiness while the pipeline warms up.
    pub settle: Duration,
    /// Upper bound on a single status query.
    pub call_timeout: Duration,
    /// Treat a namespace without pods as ready.
    pub empty_is_ready: bool,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            interval: Duration::from_secs(1),
            settle: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            empty_is_ready: false,
        }
    }
}

pub struct ReadinessPoller {
    orchestrator: Arc<dyn Orchestrator>,
    namespace: String,
    settings: PollSettings,
    span: Span,
}

impl ReadinessPoller {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        namespace: impl Into<String>,
        settings: PollSettings,
        span: Span,
    ) -> Self {
        Self {
            orchestrator,
            namespace: namespace.into(),
            settings,
            span,
        }
    }

    pub async fn poll_until_ready(&self) -> PollResult {
        self.poll().instrument(self.span.clone()).await
    }

    async fn poll(&self) -> PollResult {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut last_snapshot = PodStatusSnapshot::default();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.settings.interval).await;
            }

            let listed = self.snapshot().await;
            let ready = listed.as_ref().is_some_and(|s| self.is_ready(s));
            last_snapshot = listed.unwrap_or_default();
            if ready {
                info!(
                    "All {} pod(s) in {} running after {} attempt(s)",
                    last_snapshot.total(),
                    self.namespace,
                    attempt
                );
                if !self.settings.settle.is_zero() {
                    debug!("Settling for {:?}", self.settings.settle);
                    tokio::time::sleep(self.settings.settle).await;
                }
                return PollResult {
                    ready: true,
                    attempts_used: attempt,
                    last_snapshot,
                };
            }

            for pod in last_snapshot.not_running() {
                info!("Not ready pod: {}, status: {}", pod.name, pod.status);
            }
            debug!(
                "Attempt {}/{}: {}/{} pods running",
                attempt,
                max_attempts,
                last_snapshot.running(),
                last_snapshot.total()
            );
        }

        warn!(
            "Pods in {} not ready after {} attempts; continuing",
            self.namespace, max_attempts
        );
        PollResult {
            ready: false,
            attempts_used: max_attempts,
            last_snapshot,
        }
    }

    /// `None` when the query failed or timed out; such an attempt never
    /// counts as ready, even when an empty namespace would.
    async fn snapshot(&self) -> Option<PodStatusSnapshot> {
        let query = self.orchestrator.list_pods(&self.namespace);
        match tokio::time::timeout(self.settings.call_timeout, query).await {
            Ok(Ok(snapshot)) => Some(snapshot),
            Ok(Err(e)) => {
                warn!("Pod status query failed: {}", e);
                None
            }
            Err(_) => {
                warn!(
                    "Pod status query timed out after {:?}",
                    self.settings.call_timeout
                );
                None
            }
        }
    }

    fn is_ready(&self, snapshot: &PodStatusSnapshot) -> bool {
        if snapshot.is_empty() {
            return self.settings.empty_is_ready;
        }
        snapshot.all_running()
    }
}
