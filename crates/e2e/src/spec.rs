//! Declarative YAML test suites

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{E2eError, E2eResult};
use crate::intercept::InterceptRule;

/// Key chord that submits the focused form when appended to typed text
const ENTER_CHORD: &str = "{enter}";

/// A group of test cases sharing setup actions and interceptors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuite {
    /// Unique name for this suite
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Tags for filtering suites
    #[serde(default)]
    pub tags: Vec<String>,

    /// Actions executed before every case
    #[serde(default)]
    pub setup: Vec<Action>,

    /// Interceptors registered before every case
    #[serde(default)]
    pub intercepts: Vec<InterceptRule>,

    /// Overrides the runner's network wait timeout for this suite
    #[serde(default)]
    pub wait_timeout_ms: Option<u64>,

    /// Cases to execute in order
    pub cases: Vec<TestCase>,
}

/// A single scenario: actions, an optional network wait, then assertions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Report the case as skipped without running it
    #[serde(default)]
    pub skip: bool,

    /// Interceptors registered for this case only, after the suite's
    #[serde(default)]
    pub intercepts: Vec<InterceptRule>,

    #[serde(default)]
    pub actions: Vec<Action>,

    /// Alias of the exchange to wait for once actions complete
    #[serde(default)]
    pub wait: Option<String>,

    #[serde(default)]
    pub assertions: Vec<Assertion>,
}

/// A simulated user interaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Navigate to a URL (relative to base)
    Navigate { url: String },

    /// Click an element
    Click { selector: String },

    /// Click the first element whose text contains `text`
    ClickText {
        text: String,
        #[serde(default)]
        within: Option<String>,
    },

    /// Type into an input, optionally pressing Enter afterwards.
    ///
    /// A trailing `{enter}` in `text` is equivalent to `submit_on_enter: true`.
    TypeText {
        selector: String,
        text: String,
        #[serde(default)]
        submit_on_enter: bool,
    },

    /// Drop every cookie in the browser context
    ClearCookies,
}

impl Action {
    pub fn type_text(selector: &str, text: &str) -> Self {
        let (text, submit_on_enter) = match text.strip_suffix(ENTER_CHORD) {
            Some(stripped) => (stripped, true),
            None => (text, false),
        };
        Action::TypeText {
            selector: selector.to_string(),
            text: text.to_string(),
            submit_on_enter,
        }
    }

    /// Fold a trailing `{enter}` chord into `submit_on_enter`
    fn normalize(&mut self) {
        if let Action::TypeText { text, submit_on_enter, .. } = self {
            if let Some(stripped) = text.strip_suffix(ENTER_CHORD) {
                let stripped = stripped.to_string();
                *text = stripped;
                *submit_on_enter = true;
            }
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Navigate { url } => write!(f, "navigate:{}", url),
            Action::Click { selector } => write!(f, "click:{}", selector),
            Action::ClickText { text, within: Some(scope) } => {
                write!(f, "click_text:{} >> '{}'", scope, text)
            }
            Action::ClickText { text, within: None } => write!(f, "click_text:'{}'", text),
            Action::TypeText { selector, submit_on_enter, .. } => {
                write!(f, "type:{}", selector)?;
                if *submit_on_enter {
                    f.write_str("{enter}")?;
                }
                Ok(())
            }
            Action::ClearCookies => f.write_str("clear_cookies"),
        }
    }
}

/// A check against the captured exchange, the DOM, or the cookie jar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "assert", rename_all = "snake_case", deny_unknown_fields)]
pub enum Assertion {
    /// Reads the exchange captured by the case's wait
    StatusEquals { code: u16 },
    BodyContains { text: String },
    ElementVisible { selector: String },
    ElementContains { selector: String, text: String },
    CookieExists { name: String },
    CookieAbsent { name: String },
}

impl Assertion {
    /// Whether this assertion reads a captured network exchange
    pub fn is_exchange(&self) -> bool {
        matches!(self, Assertion::StatusEquals { .. } | Assertion::BodyContains { .. })
    }
}

impl fmt::Display for Assertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Assertion::StatusEquals { code } => write!(f, "status:{}", code),
            Assertion::BodyContains { text } => write!(f, "body_contains:'{}'", text),
            Assertion::ElementVisible { selector } => write!(f, "visible:{}", selector),
            Assertion::ElementContains { selector, text } => {
                write!(f, "contains:{} '{}'", selector, text)
            }
            Assertion::CookieExists { name } => write!(f, "cookie_exists:{}", name),
            Assertion::CookieAbsent { name } => write!(f, "cookie_absent:{}", name),
        }
    }
}

impl TestSuite {
    /// Parse and validate a suite from a YAML string
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        let mut suite: TestSuite = serde_yaml::from_str(yaml)?;
        suite.normalize();
        suite.validate()?;
        Ok(suite)
    }

    /// Parse a suite from a YAML file
    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content).map_err(|e| match e {
            E2eError::Yaml(err) => {
                E2eError::SpecParse(format!("{}: {}", path.display(), err))
            }
            other => other,
        })
    }

    /// Load all suites from a directory, ordered by file path
    pub fn load_all(dir: &Path) -> E2eResult<Vec<Self>> {
        let mut suites = Vec::new();

        for entry in walkdir::WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
        {
            suites.push(Self::from_file(entry.path())?);
        }

        Ok(suites)
    }

    /// Filter suites by tag. A suite matches when it or any of its cases carries the tag.
    pub fn filter_by_tag<'a>(suites: &'a [Self], tag: &str) -> Vec<&'a Self> {
        suites
            .iter()
            .filter(|s| s.has_tag(tag) || s.cases.iter().any(|c| c.has_tag(tag)))
            .collect()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    fn normalize(&mut self) {
        for action in self.setup.iter_mut() {
            action.normalize();
        }
        for case in self.cases.iter_mut() {
            for action in case.actions.iter_mut() {
                action.normalize();
            }
        }
    }

    /// Interceptors active for `case`: suite rules first, then the case's own
    pub fn rules_for(&self, case: &TestCase) -> Vec<InterceptRule> {
        self.intercepts
            .iter()
            .chain(case.intercepts.iter())
            .cloned()
            .collect()
    }

    /// Reject suites that could only fail for structural reasons
    pub fn validate(&self) -> E2eResult<()> {
        let invalid = |reason: String| E2eError::InvalidSpec {
            suite: self.name.clone(),
            reason,
        };

        if self.cases.is_empty() {
            return Err(invalid("suite has no cases".to_string()));
        }

        let mut case_names = HashSet::new();
        for case in &self.cases {
            if !case_names.insert(case.name.as_str()) {
                return Err(invalid(format!("duplicate case name '{}'", case.name)));
            }

            let rules = self.rules_for(case);
            let mut aliases = HashSet::new();
            for rule in &rules {
                if !aliases.insert(rule.alias.as_str()) {
                    return Err(invalid(format!(
                        "case '{}': alias '@{}' registered twice",
                        case.name, rule.alias
                    )));
                }
            }

            if let Some(wait) = &case.wait {
                if !aliases.contains(wait.as_str()) {
                    return Err(invalid(format!(
                        "case '{}': waits on '@{}' but no interceptor has that alias",
                        case.name, wait
                    )));
                }
            }

            if case.wait.is_none() {
                if let Some(assertion) = case.assertions.iter().find(|a| a.is_exchange()) {
                    return Err(invalid(format!(
                        "case '{}': '{}' needs a captured exchange but the case has no wait",
                        case.name, assertion
                    )));
                }
            }
        }

        Ok(())
    }
}

impl TestCase {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}
