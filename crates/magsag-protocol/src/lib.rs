//! # magsag-protocol: shared contracts for the MAGSAG gate
//!
//! Types and trait interfaces every gate crate depends on. Kept free of
//! runtime dependencies (no tokio, no storage clients) so it can serve as a
//! pure contract crate.
//!
//! ## Module Overview
//!
//! - [`ids`]: Typed ID wrappers (TicketId, RunId, EventId)
//! - [`policy`]: Permission, ContextKey, PolicyContext, PolicyDocument
//! - [`ticket`]: ApprovalTicket, TicketStatus, compare-and-set updates
//! - [`event`]: GateEvent + GateEventKind
//! - [`ports`]: TicketStore, RateLimiter, EventSink
//! - [`error`]: GateError, GateResult

pub mod error;
pub mod event;
pub mod ids;
pub mod policy;
pub mod ports;
pub mod ticket;

pub use error::{BoxError, GateError, GateResult};
pub use event::{GateEvent, GateEventKind};
pub use ids::{EventId, RunId, TicketId};
pub use policy::{
    ContextKey, Permission, PolicyContext, PolicyDecision, PolicyDocument, PolicyRule,
};
pub use ports::{EventSink, NullSink, RateDecision, RateLimiter, TicketStore};
pub use ticket::{
    APPROVAL_WINDOW_ELAPSED, ApprovalTicket, ResolutionAction, TicketCreation, TicketFilter,
    TicketStatus, TicketUpdate, idempotency_key,
};
