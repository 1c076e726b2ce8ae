//! Run reports: per-case state, JSON and JUnit output

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{E2eError, E2eResult};
use crate::intercept::CapturedExchange;

/// Why a case failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ElementNotFound,
    NetworkWaitTimeout,
    AssertionFailure,
    /// Driver or harness problem unrelated to the application under test
    Harness,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ElementNotFound => "element_not_found",
            FailureKind::NetworkWaitTimeout => "network_wait_timeout",
            FailureKind::AssertionFailure => "assertion_failure",
            FailureKind::Harness => "harness",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

impl From<&E2eError> for FailureReason {
    fn from(err: &E2eError) -> Self {
        let (kind, expected, actual) = match err {
            E2eError::ElementNotFound { .. } => (FailureKind::ElementNotFound, None, None),
            E2eError::NetworkWaitTimeout { .. } => (FailureKind::NetworkWaitTimeout, None, None),
            E2eError::AssertionFailure { expected, actual } => (
                FailureKind::AssertionFailure,
                Some(expected.clone()),
                Some(actual.clone()),
            ),
            _ => (FailureKind::Harness, None, None),
        };
        Self {
            kind,
            message: err.to_string(),
            expected,
            actual,
        }
    }
}

/// Lifecycle of a test case.
///
/// `Pending -> Running -> {Passed, Failed}`; a case whose setup fails goes
/// straight from `Pending` to `Failed`, and filtered or disabled cases go
/// from `Pending` to `Skipped`. `Passed`, `Failed` and `Skipped` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CaseState {
    Pending,
    Running,
    Passed,
    Failed { reason: FailureReason },
    Skipped { reason: String },
}

impl CaseState {
    fn label(&self) -> &'static str {
        match self {
            CaseState::Pending => "pending",
            CaseState::Running => "running",
            CaseState::Passed => "passed",
            CaseState::Failed { .. } => "failed",
            CaseState::Skipped { .. } => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CaseState::Passed | CaseState::Failed { .. } | CaseState::Skipped { .. }
        )
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow
    pub fn transition(&mut self, next: CaseState) -> E2eResult<()> {
        let allowed = matches!(
            (&*self, &next),
            (CaseState::Pending, CaseState::Running)
                | (CaseState::Pending, CaseState::Failed { .. })
                | (CaseState::Pending, CaseState::Skipped { .. })
                | (CaseState::Running, CaseState::Passed)
                | (CaseState::Running, CaseState::Failed { .. })
        );

        if !allowed {
            return Err(E2eError::InvalidTransition {
                from: self.label().to_string(),
                to: next.label().to_string(),
            });
        }

        *self = next;
        Ok(())
    }
}

impl fmt::Display for CaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Setup,
    Action,
    Wait,
    Assertion,
}

/// Result of executing one step of a case
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub kind: StepKind,
    pub step_name: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Result of running a single test case
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub suite: String,
    pub name: String,
    #[serde(flatten)]
    pub state: CaseState,
    pub duration_ms: u64,
    pub assertions_evaluated: usize,
    pub steps: Vec<StepResult>,
    /// Exchange the case waited on, if any
    pub exchange: Option<CapturedExchange>,
}

impl CaseResult {
    pub fn pending(suite: &str, name: &str) -> Self {
        Self {
            suite: suite.to_string(),
            name: name.to_string(),
            state: CaseState::Pending,
            duration_ms: 0,
            assertions_evaluated: 0,
            steps: Vec::new(),
            exchange: None,
        }
    }

    pub fn passed(&self) -> bool {
        self.state == CaseState::Passed
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.state {
            CaseState::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Aggregate outcome of one or more suites
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    /// Harness error that ended the run early; later cases are skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    pub results: Vec<CaseResult>,
}

impl RunReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            total: 0,
            passed: 0,
            failed: 0,
            skipped: 0,
            duration_ms: 0,
            aborted: None,
            results: Vec::new(),
        }
    }

    pub fn push(&mut self, result: CaseResult) {
        self.total += 1;
        match result.state {
            CaseState::Passed => self.passed += 1,
            CaseState::Skipped { .. } => self.skipped += 1,
            _ => self.failed += 1,
        }
        self.results.push(result);
    }

    pub fn merge(&mut self, other: RunReport) {
        self.duration_ms += other.duration_ms;
        if self.aborted.is_none() {
            self.aborted = other.aborted;
        }
        for result in other.results {
            self.push(result);
        }
    }

    /// True when no case failed and the run was not aborted
    pub fn success(&self) -> bool {
        self.failed == 0 && self.aborted.is_none()
    }

    /// `(suite, case, state)` triples, independent of timing and captures.
    /// Two runs against identical backend state yield equal outcomes.
    pub fn outcomes(&self) -> Vec<(String, String, CaseState)> {
        self.results
            .iter()
            .map(|r| (r.suite.clone(), r.name.clone(), r.state.clone()))
            .collect()
    }

    /// Log failed cases and the totals line
    pub fn log_summary(&self) {
        for result in &self.results {
            if let Some(reason) = result.failure() {
                error!("✗ {} › {} - {}", result.suite, result.name, reason.message);
            }
        }

        if let Some(reason) = &self.aborted {
            error!("Run aborted: {}", reason);
        }

        info!(
            "Test Results: {} passed, {} failed, {} skipped ({} ms)",
            self.passed, self.failed, self.skipped, self.duration_ms
        );
    }

    /// Write the report as pretty JSON into `output_dir`
    pub fn write_json(&self, output_dir: &Path) -> E2eResult<PathBuf> {
        std::fs::create_dir_all(output_dir)?;

        let path = output_dir.join("test-results.json");
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }

    /// Write a JUnit XML report into `output_dir`, one `<testsuite>` per suite
    pub fn write_junit(&self, output_dir: &Path) -> E2eResult<PathBuf> {
        std::fs::create_dir_all(output_dir)?;

        let path = output_dir.join("junit.xml");
        std::fs::write(&path, self.to_junit())?;

        info!("JUnit report written to: {}", path.display());
        Ok(path)
    }

    pub fn to_junit(&self) -> String {
        let mut suites: Vec<&str> = Vec::new();
        for result in &self.results {
            if !suites.contains(&result.suite.as_str()) {
                suites.push(&result.suite);
            }
        }

        let mut xml = String::new();
        xml.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
        xml.push('\n');
        xml.push_str(&format!(
            r#"<testsuites tests="{}" failures="{}" skipped="{}">"#,
            self.total, self.failed, self.skipped
        ));
        xml.push('\n');

        for suite in suites {
            let cases: Vec<&CaseResult> =
                self.results.iter().filter(|r| r.suite == suite).collect();
            let failures = cases.iter().filter(|r| r.failure().is_some()).count();
            let skipped = cases
                .iter()
                .filter(|r| matches!(r.state, CaseState::Skipped { .. }))
                .count();

            xml.push_str(&format!(
                r#"  <testsuite name="{}" tests="{}" failures="{}" skipped="{}">"#,
                escape(suite),
                cases.len(),
                failures,
                skipped
            ));
            xml.push('\n');

            for case in cases {
                xml.push_str(&format!(
                    r#"    <testcase classname="{}" name="{}" time="{:.3}">"#,
                    escape(suite),
                    escape(&case.name),
                    case.duration_ms as f64 / 1000.0
                ));
                match &case.state {
                    CaseState::Failed { reason } => xml.push_str(&format!(
                        r#"<failure type="{}" message="{}"/>"#,
                        reason.kind.as_str(),
                        escape(&reason.message)
                    )),
                    CaseState::Skipped { reason } => {
                        xml.push_str(&format!(r#"<skipped message="{}"/>"#, escape(reason)))
                    }
                    _ => {}
                }
                xml.push_str("</testcase>\n");
            }

            xml.push_str("  </testsuite>\n");
        }

        xml.push_str("</testsuites>\n");
        xml
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(suite: &str, name: &str) -> CaseResult {
        let mut result = CaseResult::pending(suite, name);
        result.state = CaseState::Failed {
            reason: FailureReason::from(&E2eError::AssertionFailure {
                expected: "status 400".into(),
                actual: "status 200".into(),
            }),
        };
        result
    }

    #[test]
    fn test_transitions() {
        let mut state = CaseState::Pending;
        state.transition(CaseState::Running).unwrap();
        state.transition(CaseState::Passed).unwrap();
        assert!(state.is_terminal());

        let err = state.transition(CaseState::Running).unwrap_err();
        assert!(matches!(err, E2eError::InvalidTransition { .. }));
    }

    #[test]
    fn test_setup_failure_skips_running() {
        let mut state = CaseState::Pending;
        let reason = FailureReason::from(&E2eError::ElementNotFound {
            selector: "#email".into(),
            timeout: std::time::Duration::from_secs(1),
        });
        state.transition(CaseState::Failed { reason }).unwrap();
        assert!(state.transition(CaseState::Passed).is_err());
    }

    #[test]
    fn test_running_cannot_be_skipped() {
        let mut state = CaseState::Running;
        assert!(state
            .transition(CaseState::Skipped { reason: "late".into() })
            .is_err());
    }

    #[test]
    fn test_report_counts() {
        let mut report = RunReport::new(Utc::now());
        let mut ok = CaseResult::pending("registration", "registers");
        ok.state = CaseState::Passed;
        report.push(ok);
        report.push(failed("registration", "duplicate"));
        let mut skipped = CaseResult::pending("registration", "later");
        skipped.state = CaseState::Skipped { reason: "filtered".into() };
        report.push(skipped);

        assert_eq!(report.total, 3);
        assert_eq!(report.passed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 1);
        assert!(!report.success());
    }

    #[test]
    fn test_junit_escapes_and_groups() {
        let mut report = RunReport::new(Utc::now());
        report.push(failed("registration", "requires <email>"));
        let mut ok = CaseResult::pending("login", "logs in");
        ok.state = CaseState::Passed;
        report.push(ok);

        let xml = report.to_junit();
        assert!(xml.contains(r#"<testsuite name="registration" tests="1" failures="1" skipped="0">"#));
        assert!(xml.contains(r#"<testsuite name="login" tests="1" failures="0" skipped="0">"#));
        assert!(xml.contains("requires &lt;email&gt;"));
        assert!(xml.contains(r#"<failure type="assertion_failure""#));
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut report = RunReport::new(Utc::now());
        report.push(failed("registration", "duplicate"));

        let path = report.write_json(dir.path()).unwrap();
        let parsed: RunReport =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(parsed.failed, 1);
        assert_eq!(parsed.results[0].failure().unwrap().kind, FailureKind::AssertionFailure);
    }
}
