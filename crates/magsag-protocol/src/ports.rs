//! Boundary ports between the gate core and its collaborators.
//!
//! These traits are the only way the core touches persistence, throttling
//! state, and notification transports:
//! - [`TicketStore`] owns approval tickets; every mutation is a single
//!   compare-and-set step.
//! - [`RateLimiter`] admits or rejects one request for a client key.
//! - [`EventSink`] receives gate events.
//!
//! Object-safety note: traits use `async-trait` for async dyn-dispatch.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GateResult;
use crate::event::GateEvent;
use crate::ids::TicketId;
use crate::ticket::{ApprovalTicket, TicketCreation, TicketFilter, TicketUpdate};

#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Insert a pending ticket, or return the live pending ticket that
    /// already carries the same idempotency key. Atomic.
    async fn create(&self, ticket: ApprovalTicket) -> GateResult<TicketCreation>;

    async fn get(&self, ticket_id: &TicketId) -> GateResult<Option<ApprovalTicket>>;

    /// Apply a compare-and-set transition.
    ///
    /// Fails with `TicketNotFound` for unknown IDs and with
    /// `ApprovalAlreadyResolved` (carrying the observed status) when the
    /// current status differs from `update.expected`. When the liveness
    /// guard trips the ticket is expired instead and returned as stored, so
    /// callers compare the returned status with the one they asked for.
    async fn update(&self, ticket_id: &TicketId, update: TicketUpdate)
    -> GateResult<ApprovalTicket>;

    async fn list(&self, filter: &TicketFilter) -> GateResult<Vec<ApprovalTicket>>;
}

/// Admission decision for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateDecision {
    pub granted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl RateDecision {
    pub fn granted() -> Self {
        Self {
            granted: true,
            retry_after_ms: None,
        }
    }

    pub fn rejected(retry_after_ms: u64) -> Self {
        Self {
            granted: false,
            retry_after_ms: Some(retry_after_ms),
        }
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Try to admit one request for `key` under a `qps_limit` budget.
    ///
    /// A rejection is `Ok` with `granted == false`; `Err` means the limiter
    /// itself could not decide.
    async fn allow(&self, key: &str, qps_limit: u32) -> GateResult<RateDecision>;

    /// Forget per-key state untouched for longer than `max_idle`. Returns the
    /// number of keys dropped. Limiters whose state expires on its own keep
    /// the default.
    async fn evict_idle(&self, _max_idle: Duration) -> usize {
        0
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &GateEvent) -> GateResult<()>;
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn emit(&self, _event: &GateEvent) -> GateResult<()> {
        Ok(())
    }
}
