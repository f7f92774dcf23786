//! Identity types for channels, messages and users.
//!
//! Server-assigned identifiers are opaque strings. The client never parses
//! them, only compares them. Correlation ids are generated locally (UUID v4)
//! but are also carried as strings because the backend echoes them verbatim.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier string.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Server-assigned channel identifier.
    ChannelId
);

string_id!(
    /// Server-assigned message identifier.
    ///
    /// Absent on provisional messages; once assigned it never changes.
    MessageId
);

string_id!(
    /// Server-assigned user identifier.
    UserId
);

string_id!(
    /// Client-generated identifier attached to a message at submission time.
    ///
    /// The backend round-trips it on the push echo and on upload responses,
    /// which lets the reconciler match confirmations to provisional entries.
    CorrelationId
);

impl CorrelationId {
    /// Generate a fresh random correlation id (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}
