use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use magsag_protocol::{
    APPROVAL_WINDOW_ELAPSED, ApprovalTicket, GateError, GateResult, TicketCreation, TicketFilter,
    TicketId, TicketStatus, TicketStore, TicketUpdate,
};
use parking_lot::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
struct StoreState {
    tickets: HashMap<TicketId, ApprovalTicket>,
    by_idempotency_key: HashMap<String, TicketId>,
}

/// Process-local [`TicketStore`]. Every operation runs under one lock, so
/// each compare-and-set is a single step.
#[derive(Debug, Default)]
pub struct InMemoryTicketStore {
    state: RwLock<StoreState>,
}

impl InMemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.read().tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TicketStore for InMemoryTicketStore {
    async fn create(&self, ticket: ApprovalTicket) -> GateResult<TicketCreation> {
        let now = Utc::now();
        let mut state = self.state.write();

        let existing = state
            .by_idempotency_key
            .get(&ticket.idempotency_key)
            .and_then(|id| state.tickets.get(id))
            .filter(|current| current.is_live(now))
            .map(|current| current.ticket_id.clone());
        if let Some(ticket_id) = existing {
            debug!(%ticket_id, "reusing live ticket for identical request");
            return Ok(TicketCreation::Existing(ticket_id));
        }

        let ticket_id = ticket.ticket_id.clone();
        state
            .by_idempotency_key
            .insert(ticket.idempotency_key.clone(), ticket_id.clone());
        state.tickets.insert(ticket_id.clone(), ticket);
        Ok(TicketCreation::Created(ticket_id))
    }

    async fn get(&self, ticket_id: &TicketId) -> GateResult<Option<ApprovalTicket>> {
        Ok(self.state.read().tickets.get(ticket_id).cloned())
    }

    async fn update(
        &self,
        ticket_id: &TicketId,
        update: TicketUpdate,
    ) -> GateResult<ApprovalTicket> {
        let mut state = self.state.write();
        let ticket = state
            .tickets
            .get_mut(ticket_id)
            .ok_or_else(|| GateError::TicketNotFound(ticket_id.clone()))?;

        if ticket.status != update.expected {
            return Err(GateError::ApprovalAlreadyResolved {
                ticket_id: ticket_id.clone(),
                status: ticket.status,
            });
        }

        if let Some(live_at) = update.live_at {
            if ticket.status == TicketStatus::Pending && ticket.expires_at <= live_at {
                TicketUpdate::expire(APPROVAL_WINDOW_ELAPSED, live_at).apply(ticket);
                return Ok(ticket.clone());
            }
        }

        update.apply(ticket);
        Ok(ticket.clone())
    }

    async fn list(&self, filter: &TicketFilter) -> GateResult<Vec<ApprovalTicket>> {
        let mut tickets = self
            .state
            .read()
            .tickets
            .values()
            .filter(|ticket| filter.matches(ticket))
            .cloned()
            .collect::<Vec<_>>();
        tickets.sort_by(|a, b| {
            a.requested_at
                .cmp(&b.requested_at)
                .then_with(|| a.ticket_id.cmp(&b.ticket_id))
        });
        Ok(tickets)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use chrono::Duration;
    use magsag_protocol::{ResolutionAction, RunId};
    use serde_json::json;

    use super::*;

    fn ticket(run: &str, ttl: Duration) -> ApprovalTicket {
        ApprovalTicket::pending(
            RunId::from_string(run),
            "sag",
            "delete_file",
            json!({"path": "/srv/data"}),
            Utc::now(),
            ttl,
        )
    }

    #[tokio::test]
    async fn identical_live_request_reuses_ticket() -> Result<()> {
        let store = InMemoryTicketStore::new();
        let first = store.create(ticket("run-1", Duration::seconds(30))).await?;
        let second = store.create(ticket("run-1", Duration::seconds(30))).await?;
        assert!(first.is_created());
        assert_eq!(second, TicketCreation::Existing(first.ticket_id().clone()));
        assert_eq!(store.len(), 1);

        let other_run = store.create(ticket("run-2", Duration::seconds(30))).await?;
        assert!(other_run.is_created());
        Ok(())
    }

    #[tokio::test]
    async fn resolved_ticket_does_not_absorb_retries() -> Result<()> {
        let store = InMemoryTicketStore::new();
        let first = store.create(ticket("run-1", Duration::seconds(30))).await?;
        store
            .update(
                first.ticket_id(),
                TicketUpdate::resolve(ResolutionAction::Deny, "alice", None, Utc::now()),
            )
            .await?;

        let retry = store.create(ticket("run-1", Duration::seconds(30))).await?;
        assert!(retry.is_created());
        assert_ne!(retry.ticket_id(), first.ticket_id());
        Ok(())
    }

    #[tokio::test]
    async fn compare_and_set_rejects_stale_expectation() -> Result<()> {
        let store = InMemoryTicketStore::new();
        let id = store
            .create(ticket("run-1", Duration::seconds(30)))
            .await?
            .ticket_id()
            .clone();

        let now = Utc::now();
        let approved = store
            .update(&id, TicketUpdate::resolve(ResolutionAction::Approve, "alice", None, now))
            .await?;
        assert_eq!(approved.status, TicketStatus::Approved);

        let err = store
            .update(&id, TicketUpdate::expire("late sweep", now))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GateError::ApprovalAlreadyResolved {
                status: TicketStatus::Approved,
                ..
            }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn liveness_guard_expires_lapsed_ticket() -> Result<()> {
        let store = InMemoryTicketStore::new();
        let id = store
            .create(ticket("run-1", Duration::milliseconds(50)))
            .await?
            .ticket_id()
            .clone();

        let later = Utc::now() + Duration::seconds(1);
        let stored = store
            .update(&id, TicketUpdate::resolve(ResolutionAction::Approve, "alice", None, later))
            .await?;
        assert_eq!(stored.status, TicketStatus::Expired);
        assert_eq!(stored.resolved_by, None);
        assert_eq!(stored.resolution_note.as_deref(), Some(APPROVAL_WINDOW_ELAPSED));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_ticket_is_not_found() {
        let store = InMemoryTicketStore::new();
        let err = store
            .update(&TicketId::new_uuid(), TicketUpdate::expire("sweep", Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::TicketNotFound(_)));
    }
}
