//! Error types for the expiry subsystem
//!
//! This module defines the various errors that can occur while scheduling or
//! reversing timed punishments.

use thiserror::Error;

/// Errors that can occur during expiry operations
#[derive(Debug, Error)]
pub enum ExpiryError {
    /// Punishment store query failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Discord API error
    #[error("Discord API error: {0}")]
    Discord(#[from] Box<poise::serenity_prelude::Error>),

    /// The guild referenced by a row has no configuration entry
    #[error("guild {0} has no configuration entry")]
    UnconfiguredGuild(u64),

    /// Generic error
    #[error("expiry error: {0}")]
    Other(String),
}

impl From<poise::serenity_prelude::Error> for ExpiryError {
    fn from(error: poise::serenity_prelude::Error) -> Self {
        Self::Discord(Box::new(error))
    }
}

impl From<String> for ExpiryError {
    fn from(message: String) -> Self {
        Self::Other(message)
    }
}

/// Result type for expiry operations
pub type ExpiryResult<T> = Result<T, ExpiryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ExpiryError::UnconfiguredGuild(42);
        assert_eq!(error.to_string(), "guild 42 has no configuration entry");

        let error = ExpiryError::from("something went wrong".to_string());
        assert_eq!(error.to_string(), "expiry error: something went wrong");
    }
}
