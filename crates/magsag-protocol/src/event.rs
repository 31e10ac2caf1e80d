//! Gate events: what observers learn about tickets, throttling, and policy.
//!
//! Events are internally tagged on `"type"`. [`GateEventKind::name`] gives
//! the dotted wire name (`approval.required`, `approval.updated`, ...) used
//! by transports such as webhooks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{EventId, RunId, TicketId};
use crate::policy::Permission;
use crate::ticket::{ApprovalTicket, TicketStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateEvent {
    pub event_id: EventId,
    pub timestamp: DateTime<Utc>,
    pub kind: GateEventKind,
}

impl GateEvent {
    pub fn new(kind: GateEventKind) -> Self {
        Self {
            event_id: EventId::new_uuid(),
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateEventKind {
    /// A ticket was created and awaits a human decision.
    ApprovalRequired { ticket: ApprovalTicket },
    /// A ticket left `pending` (approved, denied, or expired).
    ApprovalUpdated {
        ticket_id: TicketId,
        run_id: RunId,
        tool_name: String,
        status: TicketStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resolved_by: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    PolicyEvaluated {
        run_id: RunId,
        tool_name: String,
        permission: Permission,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        matched_rule: Option<usize>,
    },
    RateLimitRejected { key: String, retry_after_ms: u64 },
    /// The shared limiter store was unreachable and the request was admitted.
    RateLimiterDegraded { key: String, reason: String },
}

impl GateEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ApprovalRequired { .. } => "approval.required",
            Self::ApprovalUpdated { .. } => "approval.updated",
            Self::PolicyEvaluated { .. } => "policy.evaluated",
            Self::RateLimitRejected { .. } => "rate_limit.rejected",
            Self::RateLimiterDegraded { .. } => "rate_limiter.degraded",
        }
    }

    pub fn updated(ticket: &ApprovalTicket) -> Self {
        Self::ApprovalUpdated {
            ticket_id: ticket.ticket_id.clone(),
            run_id: ticket.run_id.clone(),
            tool_name: ticket.tool_name.clone(),
            status: ticket.status,
            resolved_by: ticket.resolved_by.clone(),
            note: ticket.resolution_note.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_is_tagged_by_type() {
        let event = GateEvent::new(GateEventKind::RateLimiterDegraded {
            key: "ip:10.0.0.1".to_owned(),
            reason: "connection refused".to_owned(),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"]["type"], "rate_limiter_degraded");
        assert_eq!(event.name(), "rate_limiter.degraded");
    }
}
