//! Approval gate: pauses REQUIRE_APPROVAL tool calls on a ticket until a
//! human approves, denies, or the wait runs out.

mod gate;
mod store;

pub use gate::{ApprovalConfig, ApprovalGate, ToolRequest};
pub use store::InMemoryTicketStore;
