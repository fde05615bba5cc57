//! Domain error types.

use thiserror::Error;

/// Rejection of an entity snapshot before it enters a saga.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is empty.
    #[error("{field} is required")]
    Missing { field: &'static str },

    /// A field is present but unusable.
    #[error("{field} is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ValidationError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ValidationError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_field() {
        let missing = ValidationError::Missing { field: "email" };
        assert_eq!(missing.to_string(), "email is required");

        let invalid = ValidationError::invalid("max_guests", "below min_guests");
        assert_eq!(
            invalid.to_string(),
            "max_guests is invalid: below min_guests"
        );
    }
}
