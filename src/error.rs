//! Error taxonomy for the booking dispatcher.
//!
//! Every failure that can reach the command boundary is a [`BookingError`].
//! The binary turns it into a JSON error document and an exit code, so the
//! process never dies with an unstructured panic.

use serde::Serialize;
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, BookingError>;

#[derive(Debug, Error)]
pub enum BookingError {
    /// No record matched a lookup that expected exactly one.
    #[error("no booking matches {key}")]
    NotFound { key: String },

    /// `post` targeted a key that already exists.
    #[error("a booking with {key} already exists")]
    Conflict { key: String },

    /// More than one record matched a lookup that expected exactly one.
    #[error("{count} bookings match {key}; refusing to pick one")]
    Ambiguous { key: String, count: usize },

    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// A `data` key that is not a column of the booking table.
    #[error("unknown field `{field}`")]
    UnknownField { field: String },

    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    #[error("record store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// JSON body written to stdout when a command fails.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: &'static str,
}

impl BookingError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedInput(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable(message.into())
    }

    /// Stable snake_case tag for the error category.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::Ambiguous { .. } => "ambiguous",
            Self::MalformedInput(_) => "malformed_input",
            Self::UnknownField { .. } => "unknown_field",
            Self::UnknownCommand(_) => "unknown_command",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Storage(_) => "storage",
        }
    }

    /// Process exit code for this error.
    ///
    /// - `1`: the request was well formed but the store state rejected it
    /// - `2`: the request itself was invalid
    /// - `3`: the store could not serve the request
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotFound { .. } | Self::Conflict { .. } | Self::Ambiguous { .. } => 1,
            Self::MalformedInput(_) | Self::UnknownField { .. } | Self::UnknownCommand(_) => 2,
            Self::StoreUnavailable(_) | Self::Storage(_) => 3,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_carries_message_and_kind() {
        let err = BookingError::NotFound {
            key: "id = 4".to_string(),
        };
        let body = serde_json::to_value(err.body()).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"error": "no booking matches id = 4", "kind": "not_found"})
        );
    }

    #[test]
    fn test_exit_codes_are_non_zero() {
        let errors = [
            BookingError::Conflict { key: "id = 1".into() },
            BookingError::malformed("bad"),
            BookingError::UnknownCommand("put".into()),
            BookingError::unavailable("no url"),
        ];
        for err in errors {
            assert_ne!(err.exit_code(), 0, "{err}");
        }
        assert_eq!(BookingError::UnknownCommand("x".into()).exit_code(), 2);
        assert_eq!(BookingError::unavailable("x").exit_code(), 3);
    }
}
