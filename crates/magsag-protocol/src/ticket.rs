//! Approval tickets and the compare-and-set update contract.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::ids::{RunId, TicketId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A human decision on a pending ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    Approve,
    Deny,
}

impl ResolutionAction {
    pub fn target_status(&self) -> TicketStatus {
        match self {
            Self::Approve => TicketStatus::Approved,
            Self::Deny => TicketStatus::Denied,
        }
    }
}

/// Resolution note recorded when a ticket lapses without a decision.
pub const APPROVAL_WINDOW_ELAPSED: &str = "approval window elapsed";

/// One human-approval request and its resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalTicket {
    pub ticket_id: TicketId,
    pub run_id: RunId,
    pub agent_slug: String,
    pub tool_name: String,
    pub tool_args: Value,
    pub idempotency_key: String,
    pub status: TicketStatus,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_note: Option<String>,
}

impl ApprovalTicket {
    /// Build a fresh pending ticket expiring `ttl` after `requested_at`.
    pub fn pending(
        run_id: RunId,
        agent_slug: impl Into<String>,
        tool_name: impl Into<String>,
        tool_args: Value,
        requested_at: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        let agent_slug = agent_slug.into();
        let tool_name = tool_name.into();
        let idempotency_key = idempotency_key(&run_id, &agent_slug, &tool_name, &tool_args);
        Self {
            ticket_id: TicketId::new_uuid(),
            run_id,
            agent_slug,
            tool_name,
            tool_args,
            idempotency_key,
            status: TicketStatus::Pending,
            requested_at,
            expires_at: requested_at
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            resolved_by: None,
            resolved_at: None,
            resolution_note: None,
        }
    }

    /// Pending but past its deadline; only a status change is missing.
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.status == TicketStatus::Pending && now > self.expires_at
    }

    /// Pending and still inside its TTL.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == TicketStatus::Pending && self.expires_at > now
    }
}

/// SHA-256 over the canonical JSON of the immutable request context.
///
/// `serde_json` maps are ordered, so equal arguments hash equally regardless
/// of the key order the caller built them in.
pub fn idempotency_key(run_id: &RunId, agent_slug: &str, tool_name: &str, tool_args: &Value) -> String {
    let canonical = json!({
        "run_id": run_id,
        "agent_slug": agent_slug,
        "tool_name": tool_name,
        "tool_args": tool_args,
    });
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    hex::encode(Sha256::digest(bytes))
}

/// Result of `TicketStore::create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketCreation {
    Created(TicketId),
    /// A live pending ticket with the same idempotency key already existed.
    Existing(TicketId),
}

impl TicketCreation {
    pub fn ticket_id(&self) -> &TicketId {
        match self {
            Self::Created(id) | Self::Existing(id) => id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// A single compare-and-set transition.
///
/// The store applies it only when the ticket's current status equals
/// `expected`. When `live_at` is set, a ticket whose `expires_at` is not
/// after that instant is moved to `Expired` in the same step instead, and
/// the expired ticket is returned.
#[derive(Debug, Clone, PartialEq)]
pub struct TicketUpdate {
    pub expected: TicketStatus,
    pub status: TicketStatus,
    pub resolved_by: Option<String>,
    pub resolved_at: DateTime<Utc>,
    pub resolution_note: Option<String>,
    pub live_at: Option<DateTime<Utc>>,
}

impl TicketUpdate {
    pub fn resolve(
        action: ResolutionAction,
        resolved_by: impl Into<String>,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            expected: TicketStatus::Pending,
            status: action.target_status(),
            resolved_by: Some(resolved_by.into()),
            resolved_at: now,
            resolution_note: note,
            live_at: Some(now),
        }
    }

    pub fn expire(note: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            expected: TicketStatus::Pending,
            status: TicketStatus::Expired,
            resolved_by: None,
            resolved_at: now,
            resolution_note: Some(note.into()),
            live_at: None,
        }
    }

    pub fn apply(&self, ticket: &mut ApprovalTicket) {
        ticket.status = self.status;
        ticket.resolved_by = self.resolved_by.clone();
        ticket.resolved_at = Some(self.resolved_at);
        ticket.resolution_note = self.resolution_note.clone();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketFilter {
    pub run_id: Option<RunId>,
    pub status: Option<TicketStatus>,
}

impl TicketFilter {
    pub fn pending() -> Self {
        Self {
            run_id: None,
            status: Some(TicketStatus::Pending),
        }
    }

    pub fn for_run(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn matches(&self, ticket: &ApprovalTicket) -> bool {
        self.run_id.as_ref().is_none_or(|run| *run == ticket.run_id)
            && self.status.is_none_or(|status| status == ticket.status)
    }
}
