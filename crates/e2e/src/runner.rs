//! Scenario runner: executes suites case by case against a browser driver

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::RunnerConfig;
use crate::driver::BrowserDriver;
use crate::error::{E2eError, E2eResult};
use crate::intercept::InterceptRegistry;
use crate::report::{
    CaseResult, CaseState, FailureKind, FailureReason, RunReport, StepKind, StepResult,
};
use crate::spec::{Action, Assertion, TestCase, TestSuite};

const ABORTED: &str = "run aborted";

/// Selects which cases run; everything else is reported as skipped
#[derive(Debug, Clone, Default)]
pub struct CaseFilter {
    pub tag: Option<String>,
    pub name: Option<String>,
}

impl CaseFilter {
    pub fn selects(&self, suite: &TestSuite, case: &TestCase) -> bool {
        let tag_ok = self
            .tag
            .as_deref()
            .map(|t| suite.has_tag(t) || case.has_tag(t))
            .unwrap_or(true);
        let name_ok = self
            .name
            .as_deref()
            .map(|n| case.name == n)
            .unwrap_or(true);
        tag_ok && name_ok
    }
}

/// Runs test suites sequentially against one browser context
pub struct ScenarioRunner<D: BrowserDriver> {
    driver: D,
    registry: Arc<InterceptRegistry>,
    wait_timeout: Duration,
    action_timeout: Duration,
    filter: CaseFilter,
}

impl<D: BrowserDriver> ScenarioRunner<D> {
    pub fn new(mut driver: D, config: &RunnerConfig) -> Self {
        let registry = Arc::new(InterceptRegistry::new());
        driver.attach(Arc::clone(&registry));

        Self {
            driver,
            registry,
            wait_timeout: config.wait_timeout,
            action_timeout: config.action_timeout,
            filter: CaseFilter::default(),
        }
    }

    pub fn with_filter(mut self, filter: CaseFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn into_driver(self) -> D {
        self.driver
    }

    /// Run several suites in order and merge their reports
    pub async fn run_suites(&mut self, suites: &[TestSuite]) -> RunReport {
        let mut report = RunReport::new(Utc::now());
        for suite in suites {
            if report.aborted.is_some() {
                for case in &suite.cases {
                    let mut result = CaseResult::pending(&suite.name, &case.name);
                    skip(&mut result, ABORTED);
                    report.push(result);
                }
                continue;
            }
            report.merge(self.run_suite(suite).await);
        }
        report
    }

    /// Run every case of `suite` in declared order.
    ///
    /// A failing case never stops the suite; its failure is recorded in the
    /// report and the next case starts from the shared setup. A harness error
    /// (driver or bridge failure) ends the run: the remaining cases are
    /// reported as skipped and [`RunReport::aborted`] carries the error.
    pub async fn run_suite(&mut self, suite: &TestSuite) -> RunReport {
        let start = Instant::now();
        let mut report = RunReport::new(Utc::now());

        let wait_timeout = suite
            .wait_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.wait_timeout);

        info!("Running suite '{}' ({} case(s))", suite.name, suite.cases.len());

        for case in &suite.cases {
            if report.aborted.is_some() {
                let mut result = CaseResult::pending(&suite.name, &case.name);
                skip(&mut result, ABORTED);
                report.push(result);
                continue;
            }

            let result = self.run_case(suite, case, wait_timeout).await;
            if let Some(reason) = result.failure().filter(|r| r.kind == FailureKind::Harness) {
                error!("Aborting run after harness error in '{}'", result.name);
                report.aborted = Some(reason.message.clone());
            }
            match &result.state {
                CaseState::Passed => info!("✓ {} ({} ms)", result.name, result.duration_ms),
                CaseState::Failed { reason } => error!("✗ {} - {}", result.name, reason.message),
                CaseState::Skipped { reason } => info!("- {} (skipped: {})", result.name, reason),
                CaseState::Pending | CaseState::Running => {
                    warn!("Case '{}' ended in non-terminal state {}", result.name, result.state)
                }
            }
            report.push(result);
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        report
    }

    async fn run_case(
        &mut self,
        suite: &TestSuite,
        case: &TestCase,
        wait_timeout: Duration,
    ) -> CaseResult {
        let start = Instant::now();
        let mut result = CaseResult::pending(&suite.name, &case.name);

        if case.skip {
            skip(&mut result, "marked skip");
            return result;
        }
        if !self.filter.selects(suite, case) {
            skip(&mut result, "excluded by filter");
            return result;
        }

        debug!("Running case: {}", case.name);

        if let Err(e) = self.execute_case(suite, case, wait_timeout, &mut result).await {
            if !e.is_case_scoped() {
                warn!("Harness error in '{}': {}", case.name, e);
            }
            let reason = FailureReason::from(&e);
            if let Err(t) = result.state.transition(CaseState::Failed { reason }) {
                warn!("{}", t);
            }
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        result
    }

    async fn execute_case(
        &mut self,
        suite: &TestSuite,
        case: &TestCase,
        wait_timeout: Duration,
        result: &mut CaseResult,
    ) -> E2eResult<()> {
        for action in &suite.setup {
            self.step(StepKind::Setup, action, result).await?;
        }

        // Interceptors are installed once setup has settled, so setup traffic
        // never satisfies a case's wait.
        let case_number = self.registry.begin_case(suite.rules_for(case));
        self.driver.begin_case(case_number).await?;
        result.state.transition(CaseState::Running)?;

        for action in &case.actions {
            self.step(StepKind::Action, action, result).await?;
        }

        if let Some(alias) = &case.wait {
            let step_start = Instant::now();
            let waited = self.registry.wait(alias, wait_timeout).await;
            result.steps.push(step_result(
                StepKind::Wait,
                format!("wait:@{}", alias),
                step_start,
                waited.as_ref().err(),
            ));
            result.exchange = Some(waited?);
        }

        for assertion in &case.assertions {
            let step_start = Instant::now();
            result.assertions_evaluated += 1;
            let outcome = self.evaluate(assertion, case.wait.as_deref()).await;
            result.steps.push(step_result(
                StepKind::Assertion,
                assertion.to_string(),
                step_start,
                outcome.as_ref().err(),
            ));
            outcome?;
        }

        result.state.transition(CaseState::Passed)
    }

    async fn step(&mut self, kind: StepKind, action: &Action, result: &mut CaseResult) -> E2eResult<()> {
        let step_start = Instant::now();
        debug!("Executing step: {}", action);
        let outcome = self.execute_action(action).await;
        result
            .steps
            .push(step_result(kind, action.to_string(), step_start, outcome.as_ref().err()));
        outcome
    }

    /// Execute one action; returns once its effect is observable
    pub async fn execute_action(&mut self, action: &Action) -> E2eResult<()> {
        match action {
            Action::Navigate { url } => self.driver.navigate(url).await,
            Action::Click { selector } => {
                let element = self.driver.resolve(selector, self.action_timeout).await?;
                self.driver.click(&element).await
            }
            Action::ClickText { text, within } => {
                let element = self
                    .driver
                    .resolve_text(text, within.as_deref(), self.action_timeout)
                    .await?;
                self.driver.click(&element).await
            }
            Action::TypeText {
                selector,
                text,
                submit_on_enter,
            } => {
                let element = self.driver.resolve(selector, self.action_timeout).await?;
                self.driver.type_text(&element, text, *submit_on_enter).await
            }
            Action::ClearCookies => self.driver.clear_cookies().await,
        }
    }

    /// Evaluate one assertion against the captured exchange, DOM, or cookies
    pub async fn evaluate(&mut self, assertion: &Assertion, wait: Option<&str>) -> E2eResult<()> {
        match assertion {
            Assertion::StatusEquals { code } => {
                let exchange = self.captured(assertion, wait)?;
                if exchange.status != *code {
                    return Err(E2eError::AssertionFailure {
                        expected: format!("status {}", code),
                        actual: format!("status {}", exchange.status),
                    });
                }
            }
            Assertion::BodyContains { text } => {
                let exchange = self.captured(assertion, wait)?;
                if !exchange.body.contains(text.as_str()) {
                    return Err(E2eError::AssertionFailure {
                        expected: format!("response body containing '{}'", text),
                        actual: format!("'{}'", exchange.body),
                    });
                }
            }
            Assertion::ElementVisible { selector } => {
                let element = self.driver.resolve(selector, self.action_timeout).await?;
                if !self.driver.is_visible(&element).await? {
                    return Err(E2eError::AssertionFailure {
                        expected: format!("{} to be visible", selector),
                        actual: "hidden".to_string(),
                    });
                }
            }
            Assertion::ElementContains { selector, text } => {
                let element = self.driver.resolve(selector, self.action_timeout).await?;
                let actual = self.driver.text(&element).await?;
                if !actual.contains(text.as_str()) {
                    return Err(E2eError::AssertionFailure {
                        expected: format!("{} to contain '{}'", selector, text),
                        actual: format!("'{}'", actual),
                    });
                }
            }
            Assertion::CookieExists { name } => {
                if self.driver.cookie(name).await?.is_none() {
                    return Err(E2eError::AssertionFailure {
                        expected: format!("cookie '{}' to exist", name),
                        actual: "no such cookie".to_string(),
                    });
                }
            }
            Assertion::CookieAbsent { name } => {
                if let Some(cookie) = self.driver.cookie(name).await? {
                    return Err(E2eError::AssertionFailure {
                        expected: format!("cookie '{}' to be absent", name),
                        actual: format!("cookie set to '{}'", cookie.value),
                    });
                }
            }
        }
        Ok(())
    }

    fn captured(
        &self,
        assertion: &Assertion,
        wait: Option<&str>,
    ) -> E2eResult<crate::intercept::CapturedExchange> {
        let alias = wait.ok_or_else(|| {
            E2eError::assertion(format!("a captured exchange for '{}'", assertion), "no wait alias")
        })?;
        self.registry.latest(alias).ok_or_else(|| {
            E2eError::assertion(format!("a captured exchange for '@{}'", alias), "none captured")
        })
    }
}

fn skip(result: &mut CaseResult, reason: &str) {
    let next = CaseState::Skipped {
        reason: reason.to_string(),
    };
    if let Err(e) = result.state.transition(next) {
        warn!("{}", e);
    }
}

fn step_result(kind: StepKind, name: String, start: Instant, error: Option<&E2eError>) -> StepResult {
    StepResult {
        kind,
        step_name: name,
        success: error.is_none(),
        duration_ms: start.elapsed().as_millis() as u64,
        error: error.map(|e| e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Cookie, ElementHandle, ElementLocator};
    use async_trait::async_trait;

    /// A driver whose browser has gone away: every command fails
    #[derive(Default)]
    struct DeadBridge {
        commands: usize,
    }

    impl DeadBridge {
        fn fail<T>(&mut self) -> E2eResult<T> {
            self.commands += 1;
            Err(E2eError::Driver("bridge exited".to_string()))
        }
    }

    #[async_trait]
    impl ElementLocator for DeadBridge {
        async fn resolve(&mut self, _: &str, _: Duration) -> E2eResult<ElementHandle> {
            self.fail()
        }

        async fn resolve_text(
            &mut self,
            _: &str,
            _: Option<&str>,
            _: Duration,
        ) -> E2eResult<ElementHandle> {
            self.fail()
        }
    }

    #[async_trait]
    impl BrowserDriver for DeadBridge {
        fn attach(&mut self, _: Arc<InterceptRegistry>) {}

        async fn begin_case(&mut self, _: u64) -> E2eResult<()> {
            self.fail()
        }

        async fn navigate(&mut self, _: &str) -> E2eResult<()> {
            self.fail()
        }

        async fn click(&mut self, _: &ElementHandle) -> E2eResult<()> {
            self.fail()
        }

        async fn type_text(&mut self, _: &ElementHandle, _: &str, _: bool) -> E2eResult<()> {
            self.fail()
        }

        async fn text(&mut self, _: &ElementHandle) -> E2eResult<String> {
            self.fail()
        }

        async fn is_visible(&mut self, _: &ElementHandle) -> E2eResult<bool> {
            self.fail()
        }

        async fn cookie(&mut self, _: &str) -> E2eResult<Option<Cookie>> {
            self.fail()
        }

        async fn clear_cookies(&mut self) -> E2eResult<()> {
            self.fail()
        }
    }

    #[tokio::test]
    async fn test_harness_error_aborts_run() {
        let first = TestSuite::from_yaml(
            "name: first\nsetup:\n  - action: navigate\n    url: /\ncases:\n  - name: a\n  - name: b\n",
        )
        .unwrap();
        let second = TestSuite::from_yaml("name: second\ncases:\n  - name: c\n").unwrap();

        let mut runner = ScenarioRunner::new(DeadBridge::default(), &RunnerConfig::default());
        let report = runner.run_suites(&[first, second]).await;

        assert_eq!(report.total, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 2);
        assert!(!report.success());
        assert!(report.aborted.as_deref().unwrap().contains("bridge exited"));

        let reason = report.results[0].failure().unwrap();
        assert_eq!(reason.kind, FailureKind::Harness);
        for result in &report.results[1..] {
            assert_eq!(
                result.state,
                CaseState::Skipped {
                    reason: ABORTED.to_string()
                }
            );
        }
        // Nothing is sent to the driver after the first failure.
        assert_eq!(runner.driver().commands, 1);
    }

    fn suite(tags: &[&str]) -> TestSuite {
        let yaml = format!(
            "name: s\ntags: [{}]\ncases:\n  - name: a\n    tags: [smoke]\n  - name: b\n",
            tags.join(", ")
        );
        TestSuite::from_yaml(&yaml).unwrap()
    }

    #[test]
    fn test_filter_by_case_tag() {
        let suite = suite(&[]);
        let filter = CaseFilter {
            tag: Some("smoke".into()),
            name: None,
        };
        assert!(filter.selects(&suite, &suite.cases[0]));
        assert!(!filter.selects(&suite, &suite.cases[1]));
    }

    #[test]
    fn test_filter_by_suite_tag_and_name() {
        let suite = suite(&["auth"]);
        let filter = CaseFilter {
            tag: Some("auth".into()),
            name: Some("b".into()),
        };
        assert!(!filter.selects(&suite, &suite.cases[0]));
        assert!(filter.selects(&suite, &suite.cases[1]));
        assert!(CaseFilter::default().selects(&suite, &suite.cases[0]));
    }
}
