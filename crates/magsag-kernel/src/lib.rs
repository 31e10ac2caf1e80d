//! Assembles the gate: client rate limiting in front of the permission and
//! approval pipeline, with events journaled and fanned out to subscribers.

mod client;
mod config;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use magsag_approval::{ApprovalGate, InMemoryTicketStore};
use magsag_events::{EventHub, EventJournal, JsonlEventLog};
use magsag_policy::PolicyHandle;
use magsag_protocol::{
    ApprovalTicket, EventSink, GateError, GateEvent, GateEventKind, GateResult, PolicyDocument,
    RateLimiter, ResolutionAction, RunId, TicketId, TicketStore,
};
use magsag_ratelimit::{DistributedRateLimiter, InMemoryRateLimiter, LocalWindowStore};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

pub use client::ClientKey;
pub use config::{ApprovalSettings, GatewayConfig, RateLimitBackend, RateLimitConfig};
pub use magsag_approval::{ApprovalConfig, ToolRequest};

#[derive(Default)]
pub struct GatewayBuilder {
    config: GatewayConfig,
    ticket_store: Option<Arc<dyn TicketStore>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: GatewayConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn policy(mut self, policy: PolicyDocument) -> Self {
        self.config.policy = policy;
        self
    }

    pub fn qps(mut self, qps: u32) -> Self {
        self.config.rate_limit.qps = qps;
        self
    }

    pub fn rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.config.rate_limit = rate_limit;
        self
    }

    pub fn rate_limit_backend(mut self, backend: RateLimitBackend) -> Self {
        self.config.rate_limit.backend = backend;
        self
    }

    pub fn approval(mut self, settings: ApprovalSettings) -> Self {
        self.config.approval = settings;
        self
    }

    pub fn journal(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.journal_path = Some(path.into());
        self
    }

    pub fn ticket_store(mut self, store: Arc<dyn TicketStore>) -> Self {
        self.ticket_store = Some(store);
        self
    }

    /// Overrides the limiter the configured backend would build.
    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub async fn build(self) -> Result<Gateway> {
        let config = self.config;
        config.validate()?;

        let log = config
            .journal_path
            .as_ref()
            .map(|path| Arc::new(JsonlEventLog::new(path.clone())));
        let journal = EventJournal::new(log, EventHub::new(1024));
        let events: Arc<dyn EventSink> = Arc::new(journal.clone());

        let policy = PolicyHandle::new(config.policy.clone()).context("invalid policy")?;

        let limiter = match self.rate_limiter {
            Some(limiter) => limiter,
            None => build_limiter(&config.rate_limit.backend, events.clone()).await?,
        };
        let store = self
            .ticket_store
            .unwrap_or_else(|| Arc::new(InMemoryTicketStore::new()));

        let gate = ApprovalGate::new(Arc::new(policy.clone()), store, events.clone())
            .with_config(config.approval.gate_config());

        info!(
            qps = config.rate_limit.qps,
            backend = ?config.rate_limit.backend,
            journal = ?config.journal_path,
            "gateway built"
        );
        Ok(Gateway {
            gate: Arc::new(gate),
            limiter,
            policy,
            journal,
            events,
            qps: config.rate_limit.qps,
            sweep_interval: config.approval.sweep_interval(),
            idle_evict: config.rate_limit.idle_evict(),
        })
    }
}

async fn build_limiter(
    backend: &RateLimitBackend,
    events: Arc<dyn EventSink>,
) -> Result<Arc<dyn RateLimiter>> {
    Ok(match backend {
        RateLimitBackend::Memory => Arc::new(InMemoryRateLimiter::new()),
        RateLimitBackend::LocalShared => {
            Arc::new(DistributedRateLimiter::new(LocalWindowStore::new()).with_events(events))
        }
        #[cfg(feature = "redis")]
        RateLimitBackend::Redis { url } => {
            let store = magsag_ratelimit::RedisWindowStore::connect(url)
                .await
                .with_context(|| format!("failed connecting to redis at {url}"))?;
            Arc::new(DistributedRateLimiter::new(store).with_events(events))
        }
        #[cfg(not(feature = "redis"))]
        RateLimitBackend::Redis { .. } => {
            anyhow::bail!("redis rate limit backend requires the `redis` feature")
        }
    })
}

#[derive(Clone)]
pub struct Gateway {
    gate: Arc<ApprovalGate>,
    limiter: Arc<dyn RateLimiter>,
    policy: PolicyHandle,
    journal: EventJournal,
    events: Arc<dyn EventSink>,
    qps: u32,
    sweep_interval: Duration,
    idle_evict: Duration,
}

impl Gateway {
    /// Rate limit the client, then run the request through the approval gate.
    #[instrument(skip_all, fields(%client, tool = %request.tool_name))]
    pub async fn execute<F, Fut, T, E>(
        &self,
        client: &ClientKey,
        request: ToolRequest,
        timeout: Option<Duration>,
        tool_fn: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<GateError>,
    {
        let key = client.as_key();
        let decision = self.limiter.allow(&key, self.qps).await?;
        if !decision.granted {
            let retry_after_ms = decision.retry_after_ms.unwrap_or(1);
            info!(retry_after_ms, "rate limit exceeded");
            self.emit(GateEventKind::RateLimitRejected {
                key: key.clone(),
                retry_after_ms,
            })
            .await;
            return Err(GateError::RateLimitExceeded {
                key,
                retry_after_ms,
            }
            .into());
        }
        self.gate
            .execute_with_approval(request, timeout, tool_fn)
            .await
    }

    pub async fn resolve_ticket(
        &self,
        ticket_id: &TicketId,
        action: ResolutionAction,
        resolved_by: impl Into<String>,
        note: Option<String>,
    ) -> GateResult<ApprovalTicket> {
        self.gate
            .resolve_ticket(ticket_id, action, resolved_by, note)
            .await
    }

    pub async fn get_ticket(&self, ticket_id: &TicketId) -> GateResult<ApprovalTicket> {
        self.gate.get_ticket(ticket_id).await
    }

    pub async fn list_pending(&self, run_id: Option<&RunId>) -> GateResult<Vec<ApprovalTicket>> {
        self.gate.list_pending(run_id).await
    }

    pub async fn expire_old_tickets(&self) -> GateResult<usize> {
        self.gate.expire_old_tickets().await
    }

    pub async fn cancel_run(&self, run_id: &RunId, reason: &str) -> GateResult<usize> {
        self.gate.cancel_run(run_id, reason).await
    }

    /// Swap in a new policy. Calls already evaluating keep the old one.
    pub fn reload_policy(&self, policy: PolicyDocument) -> GateResult<()> {
        self.policy.reload(policy)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GateEvent> {
        self.journal.subscribe()
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.gate
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Periodically expire lapsed tickets and drop idle rate-limit state
    /// until the handle is aborted. A zero interval is raised to 1ms.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let gate = self.gate.clone();
        let limiter = self.limiter.clone();
        let idle_evict = self.idle_evict;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(error) = gate.expire_old_tickets().await {
                    warn!(%error, "ticket sweep failed");
                }
                let evicted = limiter.evict_idle(idle_evict).await;
                if evicted > 0 {
                    debug!(evicted, "evicted idle rate limit keys");
                }
            }
        })
    }

    async fn emit(&self, kind: GateEventKind) {
        let event = GateEvent::new(kind);
        if let Err(error) = self.events.emit(&event).await {
            warn!(%error, event = event.name(), "failed to emit gate event");
        }
    }
}
