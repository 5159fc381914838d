//! Identifier newtypes.
//!
//! Every identifier that crosses the client boundary is a string so that
//! the browser can echo it back verbatim. Fresh identifiers are UUIDv4.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identifies a conversation (the parent of many streaming sessions).
    SessionId
);

string_id!(
    /// Identifies a stored message; also the id of an in-flight streaming session.
    MessageId
);

string_id!(
    /// Identifies one tool invocation.
    ToolCallId
);

string_id!(
    /// Identifies one approval prompt shown to the user.
    ApprovalId
);

string_id!(
    /// Identifies a stored tool-execution row.
    ExecutionId
);
