//! Call and participant identifiers
//!
//! Both identifiers are opaque strings chosen by callers (room names, user ids).
//! They are validated once at the boundary so the rest of the crate can treat
//! them as trusted keys for hash maps and log fields.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use thiserror::Error;

/// Maximum identifier length in bytes
pub const MAX_ID_LENGTH: usize = 256;

/// Identifier validation failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    /// Identifier was empty
    #[error("{0} must not be empty")]
    Empty(&'static str),

    /// Identifier exceeded [`MAX_ID_LENGTH`]
    #[error("{0} exceeds {MAX_ID_LENGTH} bytes")]
    TooLong(&'static str),

    /// Identifier contained a control character
    #[error("{0} contains control characters")]
    ControlCharacter(&'static str),
}

fn validate(kind: &'static str, value: &str) -> Result<(), IdError> {
    if value.is_empty() {
        return Err(IdError::Empty(kind));
    }
    if value.len() > MAX_ID_LENGTH {
        return Err(IdError::TooLong(kind));
    }
    if value.chars().any(char::is_control) {
        return Err(IdError::ControlCharacter(kind));
    }
    Ok(())
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validate and wrap an identifier
            ///
            /// # Errors
            ///
            /// Returns error if the value is empty, too long, or contains control characters
            pub fn parse(value: impl Into<String>) -> Result<Self, IdError> {
                let value = value.into();
                validate($kind, &value)?;
                Ok(Self(value))
            }

            /// Get the inner string
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = IdError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of a call (a named, time-bounded group session)
    CallId,
    "call id"
);

string_id!(
    /// Identifier of a participant, as resolved by the authentication layer
    ParticipantId,
    "participant id"
);
