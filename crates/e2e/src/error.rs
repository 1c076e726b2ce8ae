//! Error types for E2E runs

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Element not found: {selector} (waited {timeout:?})")]
    ElementNotFound { selector: String, timeout: Duration },

    #[error("Timeout waiting for network exchange '@{alias}' after {timeout:?}")]
    NetworkWaitTimeout { alias: String, timeout: Duration },

    #[error("Assertion failed: expected {expected}, got {actual}")]
    AssertionFailure { expected: String, actual: String },

    #[error("Server failed to start: {0}")]
    ServerStartup(String),

    #[error("Server health check failed after {0} attempts")]
    ServerHealthCheck(usize),

    #[error("Playwright not found. Install with: npm i playwright && npx playwright install")]
    PlaywrightNotFound,

    #[error("Playwright error: {0}")]
    Playwright(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Test spec parse error: {0}")]
    SpecParse(String),

    #[error("Invalid suite '{suite}': {reason}")]
    InvalidSpec { suite: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Run aborted: {0}")]
    RunAborted(String),

    #[error("Invalid case transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid path pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl E2eError {
    /// Case-scoped failures are recorded against a single test case and do
    /// not abort the rest of the suite.
    pub fn is_case_scoped(&self) -> bool {
        matches!(
            self,
            E2eError::ElementNotFound { .. }
                | E2eError::NetworkWaitTimeout { .. }
                | E2eError::AssertionFailure { .. }
        )
    }

    pub(crate) fn assertion(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        E2eError::AssertionFailure {
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

pub type E2eResult<T> = Result<T, E2eError>;
