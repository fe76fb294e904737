//! Typed identifiers for the orchestration core.
//!
//! IDs are opaque String wrappers (serde-transparent). Fresh IDs are UUID v4;
//! backends and tests may supply their own stable strings instead.

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

            /// Create a new random ID (UUID v4).
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::generate()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
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
    /// A conversation session: one composition of dispatcher, ledger, bus and gate.
    SessionId
);
typed_id!(
    /// Identity of a tool backend (e.g. "excel", "ai").
    BackendId
);
typed_id!(
    /// Identifier of a single tool call.
    CallId
);
typed_id!(
    /// Ledger entry identifier.
    OperationId
);
typed_id!(
    /// Ledger batch identifier.
    BatchId
);
typed_id!(NotificationId);
typed_id!(SubscriptionId);
typed_id!(
    /// Correlation id of one outstanding approval or elicitation request.
    ApprovalId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let a = OperationId::generate();
        let b = OperationId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn backend_id_from_str_displays_verbatim() {
        let id: BackendId = "excel".into();
        assert_eq!(id.as_str(), "excel");
        assert_eq!(id.to_string(), "excel");
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = ApprovalId::from_string("appr-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"appr-1\"");
        let back: ApprovalId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn ids_work_as_hash_keys() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(SessionId::from_string("same"));
        assert!(set.contains(&SessionId::from_string("same")));
    }
}
