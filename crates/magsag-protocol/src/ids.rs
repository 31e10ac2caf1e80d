//! Typed ID wrappers for the gate.
//!
//! IDs are opaque String wrappers (serde-transparent). Ticket and event IDs
//! are generated as UUID v4; run IDs come from the orchestrator and are taken
//! verbatim.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Create a new ID using UUID v4 (random).
            pub fn new_uuid() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new_uuid()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Unique identifier for an approval ticket.
    TicketId
);
typed_id!(
    /// Identifier of the agent run a ticket belongs to.
    RunId
);
typed_id!(
    /// Unique identifier for a gate event.
    EventId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_id_new_is_unique() {
        let a = TicketId::new_uuid();
        let b = TicketId::new_uuid();
        assert_ne!(a, b);
    }

    #[test]
    fn run_id_from_string() {
        let id = RunId::from_string("mag-20251018-001");
        assert_eq!(id.as_str(), "mag-20251018-001");
        assert_eq!(id.to_string(), "mag-20251018-001");
    }

    #[test]
    fn typed_id_serializes_transparently() {
        let id = TicketId::from_string("T-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"T-1\"");
    }
}
