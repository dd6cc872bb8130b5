use crate::error::{Error, Result};
use regex::Regex;
use std::sync::LazyLock;

/// Longest cache key accepted; Redis would take more, the file tier hashes it anyway.
pub const MAX_KEY_LEN: usize = 250;
pub const MAX_IDENTIFIER_LEN: usize = 255;

static ACTION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_.-]{0,63}$").expect("valid action regex"));

/// Validates caller-supplied keys and names before they reach a tier
pub struct RequestValidator;

impl RequestValidator {
    pub fn validate_cache_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(Error::Validation("Cache key cannot be empty".to_string()));
        }

        if key.len() > MAX_KEY_LEN {
            return Err(Error::Validation(format!(
                "Cache key exceeds {} bytes",
                MAX_KEY_LEN
            )));
        }

        if key.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(Error::Validation(
                "Cache key cannot contain whitespace or control characters".to_string(),
            ));
        }

        Ok(())
    }

    /// Action names are lowercase words: `login`, `password_reset`, `email.confirm`.
    pub fn validate_action(action: &str) -> Result<()> {
        if !ACTION_PATTERN.is_match(action) {
            return Err(Error::Validation(format!(
                "Invalid action name '{}'",
                action
            )));
        }
        Ok(())
    }

    pub fn validate_identifier(identifier: &str) -> Result<()> {
        let trimmed = identifier.trim();
        if trimmed.is_empty() {
            return Err(Error::Validation("Identifier cannot be empty".to_string()));
        }

        if identifier.len() > MAX_IDENTIFIER_LEN {
            return Err(Error::Validation(format!(
                "Identifier exceeds {} bytes",
                MAX_IDENTIFIER_LEN
            )));
        }

        if identifier.chars().any(char::is_control) {
            return Err(Error::Validation(
                "Identifier contains invalid characters".to_string(),
            ));
        }

        Ok(())
    }
}
