use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use magsag_policy::PolicyEngine;
use magsag_protocol::{
    APPROVAL_WINDOW_ELAPSED, ApprovalTicket, EventSink, GateError, GateEvent, GateEventKind,
    GateResult, Permission, PolicyContext, ResolutionAction, RunId, TicketFilter, TicketId,
    TicketStatus, TicketStore, TicketUpdate,
};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalConfig {
    /// First poll interval; doubles after each poll up to `poll_max`.
    pub poll_initial: Duration,
    pub poll_max: Duration,
    /// Used when a caller passes no timeout.
    pub default_timeout: Duration,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            poll_initial: Duration::from_millis(10),
            poll_max: Duration::from_millis(250),
            default_timeout: Duration::from_secs(300),
        }
    }
}

/// One tool invocation an agent wants to perform.
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub run_id: RunId,
    pub agent_slug: String,
    pub tool_name: String,
    pub tool_args: Value,
    pub context: PolicyContext,
}

impl ToolRequest {
    pub fn new(
        run_id: RunId,
        agent_slug: impl Into<String>,
        tool_name: impl Into<String>,
        tool_args: Value,
    ) -> Self {
        Self {
            run_id,
            agent_slug: agent_slug.into(),
            tool_name: tool_name.into(),
            tool_args,
            context: PolicyContext::new(),
        }
    }

    pub fn with_context(mut self, context: PolicyContext) -> Self {
        self.context = context;
        self
    }
}

pub struct ApprovalGate {
    policy: Arc<dyn PolicyEngine>,
    store: Arc<dyn TicketStore>,
    events: Arc<dyn EventSink>,
    config: ApprovalConfig,
}

impl ApprovalGate {
    pub fn new(
        policy: Arc<dyn PolicyEngine>,
        store: Arc<dyn TicketStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            policy,
            store,
            events,
            config: ApprovalConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ApprovalConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ApprovalConfig {
        &self.config
    }

    /// Run `tool_fn` if policy and, where required, a human allow it.
    ///
    /// Errors from `tool_fn` are returned unchanged; gate failures are
    /// converted through `E: From<GateError>`.
    ///
    /// An identical request made while a live ticket exists waits on that
    /// ticket instead of opening a new one. One approval then releases every
    /// waiter, and each runs its own `tool_fn`: deduplicate destructive calls
    /// upstream if they must run once.
    #[instrument(
        skip(self, request, tool_fn),
        fields(run_id = %request.run_id, tool = %request.tool_name)
    )]
    pub async fn execute_with_approval<F, Fut, T, E>(
        &self,
        request: ToolRequest,
        timeout: Option<Duration>,
        tool_fn: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<GateError>,
    {
        let decision = self.policy.decide(&request.tool_name, &request.context);
        self.emit(GateEventKind::PolicyEvaluated {
            run_id: request.run_id.clone(),
            tool_name: request.tool_name.clone(),
            permission: decision.permission,
            matched_rule: decision.matched_rule,
        })
        .await;

        match decision.permission {
            Permission::Always => tool_fn(request.tool_args).await,
            Permission::Never => {
                info!("tool call forbidden by policy");
                Err(GateError::PermissionForbidden {
                    tool_name: request.tool_name,
                }
                .into())
            }
            Permission::RequireApproval => {
                let timeout = timeout.unwrap_or(self.config.default_timeout);
                let ticket = self.await_approval(&request, timeout).await?;
                match ticket.status {
                    TicketStatus::Approved => tool_fn(request.tool_args).await,
                    TicketStatus::Denied => Err(GateError::ApprovalDenied {
                        ticket_id: ticket.ticket_id,
                        note: ticket.resolution_note,
                    }
                    .into()),
                    TicketStatus::Expired | TicketStatus::Pending => {
                        Err(GateError::ApprovalTimeout {
                            ticket_id: ticket.ticket_id,
                        }
                        .into())
                    }
                }
            }
        }
    }

    /// Create (or reuse) a ticket and wait until it is terminal.
    async fn await_approval(
        &self,
        request: &ToolRequest,
        timeout: Duration,
    ) -> GateResult<ApprovalTicket> {
        let ttl = chrono::Duration::from_std(timeout).map_err(|error| {
            GateError::InvalidPolicy(format!("approval timeout out of range: {error}"))
        })?;
        let deadline = Instant::now().checked_add(timeout).ok_or_else(|| {
            GateError::InvalidPolicy(format!("approval timeout out of range: {timeout:?}"))
        })?;
        let ticket = ApprovalTicket::pending(
            request.run_id.clone(),
            request.agent_slug.clone(),
            request.tool_name.clone(),
            request.tool_args.clone(),
            Utc::now(),
            ttl,
        );

        let creation = self.store.create(ticket.clone()).await?;
        let ticket_id = creation.ticket_id().clone();
        if creation.is_created() {
            info!(%ticket_id, expires_at = %ticket.expires_at, "approval required");
            self.emit(GateEventKind::ApprovalRequired { ticket }).await;
        } else {
            info!(%ticket_id, "waiting on existing approval ticket");
        }

        self.wait_for_resolution(&ticket_id, deadline).await
    }

    /// Poll with exponential backoff. The store is never locked while
    /// sleeping; dropping this future leaves the ticket to its TTL.
    async fn wait_for_resolution(
        &self,
        ticket_id: &TicketId,
        deadline: Instant,
    ) -> GateResult<ApprovalTicket> {
        let mut interval = self.config.poll_initial;
        loop {
            let ticket = self.load(ticket_id).await?;
            if ticket.status.is_terminal() {
                return Ok(ticket);
            }

            let now = Instant::now();
            if now >= deadline || ticket.is_lapsed(Utc::now()) {
                return self.expire_or_observe(ticket_id, APPROVAL_WINDOW_ELAPSED).await;
            }

            let sleep_for = interval.min(deadline - now);
            debug!(%ticket_id, sleep_ms = sleep_for.as_millis() as u64, "ticket still pending");
            tokio::time::sleep(sleep_for).await;
            interval = interval.saturating_mul(2).min(self.config.poll_max);
        }
    }

    /// Approve or deny a pending ticket. The first resolution wins.
    #[instrument(skip_all, fields(%ticket_id, ?action))]
    pub async fn resolve_ticket(
        &self,
        ticket_id: &TicketId,
        action: ResolutionAction,
        resolved_by: impl Into<String>,
        note: Option<String>,
    ) -> GateResult<ApprovalTicket> {
        let update = TicketUpdate::resolve(action, resolved_by, note, Utc::now());
        let wanted = update.status;
        let ticket = self.store.update(ticket_id, update).await?;
        self.emit(GateEventKind::updated(&ticket)).await;

        if ticket.status != wanted {
            info!(status = %ticket.status, "ticket lapsed before resolution");
            return Err(GateError::ApprovalAlreadyResolved {
                ticket_id: ticket_id.clone(),
                status: ticket.status,
            });
        }
        info!(
            status = %ticket.status,
            resolved_by = ticket.resolved_by.as_deref().unwrap_or_default(),
            "ticket resolved"
        );
        Ok(ticket)
    }

    /// Read a ticket, expiring it first if its TTL has lapsed.
    pub async fn get_ticket(&self, ticket_id: &TicketId) -> GateResult<ApprovalTicket> {
        let ticket = self.load(ticket_id).await?;
        if ticket.is_lapsed(Utc::now()) {
            return self.expire_or_observe(ticket_id, APPROVAL_WINDOW_ELAPSED).await;
        }
        Ok(ticket)
    }

    /// Live pending tickets, oldest request first.
    pub async fn list_pending(&self, run_id: Option<&RunId>) -> GateResult<Vec<ApprovalTicket>> {
        let mut filter = TicketFilter::pending();
        if let Some(run_id) = run_id {
            filter = filter.for_run(run_id.clone());
        }
        let now = Utc::now();
        let mut tickets = self.store.list(&filter).await?;
        tickets.retain(|ticket| ticket.is_live(now));
        Ok(tickets)
    }

    /// Expire every pending ticket whose TTL has run out. Returns how many
    /// transitions this call performed; concurrent sweeps never double count.
    #[instrument(skip(self))]
    pub async fn expire_old_tickets(&self) -> GateResult<usize> {
        let now = Utc::now();
        let lapsed = self
            .store
            .list(&TicketFilter::pending())
            .await?
            .into_iter()
            .filter(|ticket| ticket.expires_at <= now);

        let mut expired = 0;
        for ticket in lapsed {
            if self
                .try_expire(&ticket.ticket_id, APPROVAL_WINDOW_ELAPSED)
                .await?
                .is_some()
            {
                expired += 1;
            }
        }
        if expired > 0 {
            info!(expired, "expired lapsed tickets");
        }
        Ok(expired)
    }

    /// Expire every pending ticket of `run_id` now. Waiters on those tickets
    /// fail with `ApprovalTimeout`.
    #[instrument(skip_all, fields(%run_id, reason))]
    pub async fn cancel_run(&self, run_id: &RunId, reason: &str) -> GateResult<usize> {
        let note = format!("run cancelled: {reason}");
        let pending = self
            .store
            .list(&TicketFilter::pending().for_run(run_id.clone()))
            .await?;

        let mut cancelled = 0;
        for ticket in pending {
            if self.try_expire(&ticket.ticket_id, &note).await?.is_some() {
                cancelled += 1;
            }
        }
        info!(cancelled, "run cancelled");
        Ok(cancelled)
    }

    async fn load(&self, ticket_id: &TicketId) -> GateResult<ApprovalTicket> {
        self.store
            .get(ticket_id)
            .await?
            .ok_or_else(|| GateError::TicketNotFound(ticket_id.clone()))
    }

    /// CAS pending -> expired. `None` when another writer got there first.
    async fn try_expire(
        &self,
        ticket_id: &TicketId,
        note: &str,
    ) -> GateResult<Option<ApprovalTicket>> {
        match self
            .store
            .update(ticket_id, TicketUpdate::expire(note, Utc::now()))
            .await
        {
            Ok(ticket) => {
                debug!(%ticket_id, note, "ticket expired");
                self.emit(GateEventKind::updated(&ticket)).await;
                Ok(Some(ticket))
            }
            Err(GateError::ApprovalAlreadyResolved { .. }) => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Expire the ticket, or return whatever terminal state beat us to it.
    async fn expire_or_observe(
        &self,
        ticket_id: &TicketId,
        note: &str,
    ) -> GateResult<ApprovalTicket> {
        match self.try_expire(ticket_id, note).await? {
            Some(ticket) => Ok(ticket),
            None => self.load(ticket_id).await,
        }
    }

    async fn emit(&self, kind: GateEventKind) {
        let event = GateEvent::new(kind);
        if let Err(error) = self.events.emit(&event).await {
            warn!(%error, event = event.name(), "failed to emit gate event");
        }
    }
}
