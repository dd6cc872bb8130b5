use crate::error::{Error, Result};
use crate::validation::RequestValidator;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Limit for one action: at most `limit` attempts per fixed `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct QuotaPolicy {
    #[validate(range(min = 1, message = "limit must be greater than 0"))]
    pub limit: u32,
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_window"))]
    pub window: Duration,
}

fn validate_window(window: &Duration) -> std::result::Result<(), ValidationError> {
    if window.as_secs() == 0 {
        return Err(ValidationError::new("window_too_short")
            .with_message("window must be at least one second".into()));
    }
    Ok(())
}

impl QuotaPolicy {
    pub const fn new(limit: u32, window_secs: u64) -> Self {
        Self {
            limit,
            window: Duration::from_secs(window_secs),
        }
    }

    pub fn window_secs(&self) -> u64 {
        self.window.as_secs()
    }
}

/// Static `action -> policy` table. Actions missing from the table are not limited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuotaTable {
    policies: HashMap<String, QuotaPolicy>,
}

impl Default for QuotaTable {
    /// Quotas for the registration site's abuse-prone actions.
    fn default() -> Self {
        Self::new()
            .with("register", QuotaPolicy::new(5, 3600))
            .with("login", QuotaPolicy::new(5, 900))
            .with("password_reset", QuotaPolicy::new(3, 3600))
            .with("email", QuotaPolicy::new(10, 3600))
            .with("contact", QuotaPolicy::new(5, 3600))
            .with("admin_api", QuotaPolicy::new(120, 60))
    }
}

impl QuotaTable {
    pub fn new() -> Self {
        Self {
            policies: HashMap::new(),
        }
    }

    pub fn with(mut self, action: &str, policy: QuotaPolicy) -> Self {
        self.set_policy(action, policy);
        self
    }

    /// Load a table from JSON: `{"login": {"limit": 5, "window": "15m"}}`.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Cannot read quota file {}: {}", path.display(), e))
        })?;
        let table: Self = serde_json::from_str(&raw).map_err(|e| {
            Error::Configuration(format!("Invalid quota file {}: {}", path.display(), e))
        })?;
        table.validate()?;
        Ok(table)
    }

    pub fn get(&self, action: &str) -> Option<&QuotaPolicy> {
        self.policies.get(action)
    }

    pub fn set_policy(&mut self, action: &str, policy: QuotaPolicy) {
        self.policies.insert(action.to_string(), policy);
    }

    pub fn actions(&self) -> Vec<&str> {
        let mut actions: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        actions.sort_unstable();
        actions
    }

    pub fn longest_window(&self) -> Duration {
        self.policies
            .values()
            .map(|policy| policy.window)
            .max()
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<()> {
        for (action, policy) in &self.policies {
            RequestValidator::validate_action(action)
                .map_err(|e| Error::Configuration(e.to_string()))?;
            policy.validate().map_err(|e| {
                Error::Configuration(format!("Invalid quota for '{}': {}", action, e))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let table = QuotaTable::default();
        assert!(table.validate().is_ok());
        assert_eq!(table.get("login"), Some(&QuotaPolicy::new(5, 900)));
        assert!(table.get("unknown").is_none());
        assert_eq!(table.longest_window(), Duration::from_secs(3600));
    }

    #[test]
    fn test_zero_limit_or_window_rejected() {
        let table = QuotaTable::new().with("login", QuotaPolicy::new(0, 60));
        assert!(matches!(table.validate(), Err(Error::Configuration(_))));

        let table = QuotaTable::new().with("login", QuotaPolicy::new(5, 0));
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_load_from_json_with_humantime_windows() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"login": {{"limit": 5, "window": "15m"}},
                "email": {{"limit": 10, "window": "1h"}}}}"#
        )
        .unwrap();

        let table = QuotaTable::from_json_file(file.path()).unwrap();
        assert_eq!(table.get("login").unwrap().window_secs(), 900);
        assert_eq!(table.get("email").unwrap().limit, 10);
        assert_eq!(table.actions(), vec!["email", "login"]);
    }

    #[test]
    fn test_load_rejects_bad_action_name() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"Bad Name": {{"limit": 5, "window": "1m"}}}}"#).unwrap();
        assert!(QuotaTable::from_json_file(file.path()).is_err());
    }

    #[test]
    fn test_empty_table_longest_window_is_zero() {
        assert_eq!(QuotaTable::new().longest_window(), Duration::ZERO);
    }
}
