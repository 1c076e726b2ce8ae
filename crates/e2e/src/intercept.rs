//! Network interception
//!
//! Interceptors are registered per test case as `(method, path pattern) -> alias`.
//! Drivers report every completed network exchange through
//! [`InterceptRegistry::record`]; the runner then blocks on
//! [`InterceptRegistry::wait`] until a capture for the awaited alias exists.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{E2eError, E2eResult};

/// HTTP method an interceptor is scoped to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = E2eError;

    fn from_str(s: &str) -> E2eResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            other => Err(E2eError::SpecParse(format!("Unknown HTTP method: {}", other))),
        }
    }
}

/// Path matcher for an interceptor.
///
/// Three forms are accepted:
/// - `/api/auth/register` matches that path exactly
/// - `/api/users/*` matches one path segment per `*`, `**` matches across segments
/// - `re:^/api/auth/(login|register)$` is a raw regular expression
///
/// The query string of a request path is ignored when matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PathPattern {
    source: String,
    matcher: Matcher,
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact(String),
    Regex(Regex),
}

impl PathPattern {
    pub fn parse(source: &str) -> E2eResult<Self> {
        let matcher = if let Some(raw) = source.strip_prefix("re:") {
            Matcher::Regex(Regex::new(raw)?)
        } else if source.contains('*') {
            Matcher::Regex(Regex::new(&glob_to_regex(source))?)
        } else {
            Matcher::Exact(source.to_string())
        };

        Ok(Self {
            source: source.to_string(),
            matcher,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, path: &str) -> bool {
        let path = path.split_once('?').map(|(p, _)| p).unwrap_or(path);
        match &self.matcher {
            Matcher::Exact(expected) => path == expected,
            Matcher::Regex(re) => re.is_match(path),
        }
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::from("^");
    let mut rest = glob;
    while let Some(idx) = rest.find('*') {
        out.push_str(&regex::escape(&rest[..idx]));
        if rest[idx..].starts_with("**") {
            out.push_str(".*");
            rest = &rest[idx + 2..];
        } else {
            out.push_str("[^/]*");
            rest = &rest[idx + 1..];
        }
    }
    out.push_str(&regex::escape(rest));
    out.push('$');
    out
}

impl TryFrom<String> for PathPattern {
    type Error = E2eError;

    fn try_from(value: String) -> E2eResult<Self> {
        Self::parse(&value)
    }
}

impl From<PathPattern> for String {
    fn from(value: PathPattern) -> Self {
        value.source
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Interceptor registration: captures matching exchanges under `alias`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterceptRule {
    pub method: HttpMethod,
    pub path: PathPattern,
    pub alias: String,
}

impl InterceptRule {
    pub fn new(method: HttpMethod, path: &str, alias: &str) -> E2eResult<Self> {
        Ok(Self {
            method,
            path: PathPattern::parse(path)?,
            alias: alias.to_string(),
        })
    }

    pub fn matches(&self, method: HttpMethod, path: &str) -> bool {
        self.method == method && self.path.matches(path)
    }
}

/// A completed request/response pair as observed by a driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkExchange {
    pub method: HttpMethod,
    pub path: String,
    pub status: u16,
    #[serde(default)]
    pub request_body: Option<String>,
    #[serde(default)]
    pub body: String,
    /// Case number current when the request was issued, if the driver tracks it
    #[serde(default)]
    pub case: Option<u64>,
}

/// An exchange matched by an interceptor. Read-only once captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedExchange {
    pub alias: String,
    pub method: HttpMethod,
    pub path: String,
    pub status: u16,
    pub request_body: Option<String>,
    pub body: String,
    pub captured_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryState {
    case: u64,
    rules: Vec<InterceptRule>,
    pending: HashMap<String, VecDeque<CapturedExchange>>,
    consumed: HashMap<String, CapturedExchange>,
}

/// Registry of active interceptors and their captures.
///
/// Shared between the runner and a driver's network feed.
#[derive(Default)]
pub struct InterceptRegistry {
    state: Mutex<RegistryState>,
    notify: Notify,
}

impl InterceptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the interceptors for a new test case, dropping rules and
    /// captures left over from the previous one. Returns the new case number;
    /// exchanges stamped with any other number are discarded by [`record`](Self::record).
    pub fn begin_case(&self, rules: Vec<InterceptRule>) -> u64 {
        let mut state = self.state.lock();
        state.case += 1;
        state.rules = rules;
        state.pending.clear();
        state.consumed.clear();
        state.case
    }

    pub fn current_case(&self) -> u64 {
        self.state.lock().case
    }

    pub fn is_registered(&self, alias: &str) -> bool {
        self.state.lock().rules.iter().any(|r| r.alias == alias)
    }

    /// Record an exchange reported by the driver. Returns the alias it was
    /// captured under, or `None` if no interceptor matched.
    pub fn record(&self, exchange: NetworkExchange) -> Option<String> {
        let alias = {
            let mut state = self.state.lock();
            if let Some(case) = exchange.case.filter(|c| *c != state.case) {
                debug!(
                    "Dropping exchange from case {} (current {}): {} {}",
                    case, state.case, exchange.method, exchange.path
                );
                return None;
            }

            let alias = state
                .rules
                .iter()
                .find(|r| r.matches(exchange.method, &exchange.path))
                .map(|r| r.alias.clone());

            let Some(alias) = alias else {
                trace!("Unmatched exchange: {} {}", exchange.method, exchange.path);
                return None;
            };

            let captured = CapturedExchange {
                alias: alias.clone(),
                method: exchange.method,
                path: exchange.path,
                status: exchange.status,
                request_body: exchange.request_body,
                body: exchange.body,
                captured_at: Utc::now(),
            };
            debug!(
                "Captured @{}: {} {} -> {}",
                alias, captured.method, captured.path, captured.status
            );
            state.pending.entry(alias.clone()).or_default().push_back(captured);
            alias
        };

        self.notify.notify_waiters();
        Some(alias)
    }

    /// Block until an exchange for `alias` has been captured, or fail with
    /// [`E2eError::NetworkWaitTimeout`] once `timeout` elapses.
    ///
    /// Each call consumes the oldest capture not yet returned, so repeated
    /// waits on the same alias observe successive requests.
    pub async fn wait(&self, alias: &str, timeout: Duration) -> E2eResult<CapturedExchange> {
        if !self.is_registered(alias) {
            return Err(E2eError::SpecParse(format!(
                "No interceptor registered for alias '@{}'",
                alias
            )));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(exchange) = self.take(alias) {
                return Ok(exchange);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(E2eError::NetworkWaitTimeout {
                    alias: alias.to_string(),
                    timeout,
                });
            }
        }
    }

    fn take(&self, alias: &str) -> Option<CapturedExchange> {
        let mut state = self.state.lock();
        let exchange = state.pending.get_mut(alias)?.pop_front()?;
        state.consumed.insert(alias.to_string(), exchange.clone());
        Some(exchange)
    }

    /// The exchange most recently returned by [`wait`](Self::wait) for `alias`
    pub fn latest(&self, alias: &str) -> Option<CapturedExchange> {
        self.state.lock().consumed.get(alias).cloned()
    }

    /// Number of captures for `alias` that no wait has consumed yet
    pub fn pending_count(&self, alias: &str) -> usize {
        self.state
            .lock()
            .pending
            .get(alias)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn register_exchange(status: u16) -> NetworkExchange {
        NetworkExchange {
            method: HttpMethod::Post,
            path: "/api/auth/register".to_string(),
            status,
            request_body: None,
            body: String::new(),
            case: None,
        }
    }

    #[test]
    fn test_exact_pattern_ignores_query() {
        let pattern = PathPattern::parse("/api/auth/register").unwrap();
        assert!(pattern.matches("/api/auth/register"));
        assert!(pattern.matches("/api/auth/register?next=/"));
        assert!(!pattern.matches("/api/auth/register/extra"));
    }

    #[test]
    fn test_glob_pattern() {
        let pattern = PathPattern::parse("/api/*/register").unwrap();
        assert!(pattern.matches("/api/auth/register"));
        assert!(!pattern.matches("/api/a/b/register"));

        let deep = PathPattern::parse("/api/**").unwrap();
        assert!(deep.matches("/api/a/b/register"));
    }

    #[test]
    fn test_regex_pattern() {
        let pattern = PathPattern::parse("re:^/api/auth/(login|register)$").unwrap();
        assert!(pattern.matches("/api/auth/login"));
        assert!(!pattern.matches("/api/auth/logout"));
        assert!(PathPattern::parse("re:(").is_err());
    }

    #[test]
    fn test_record_requires_matching_method() {
        let registry = InterceptRegistry::new();
        registry.begin_case(vec![InterceptRule::new(
            HttpMethod::Post,
            "/api/auth/register",
            "auth",
        )
        .unwrap()]);

        let mut get = register_exchange(200);
        get.method = HttpMethod::Get;
        assert_eq!(registry.record(get), None);
        assert_eq!(registry.record(register_exchange(200)).as_deref(), Some("auth"));
        assert_eq!(registry.pending_count("auth"), 1);
    }

    #[test]
    fn test_begin_case_discards_captures() {
        let registry = InterceptRegistry::new();
        let rule = InterceptRule::new(HttpMethod::Post, "/api/auth/register", "auth").unwrap();
        registry.begin_case(vec![rule.clone()]);
        registry.record(register_exchange(400));

        registry.begin_case(vec![rule]);
        assert_eq!(registry.pending_count("auth"), 0);
        assert!(registry.latest("auth").is_none());
    }

    #[test]
    fn test_record_drops_exchange_stamped_by_earlier_case() {
        let registry = InterceptRegistry::new();
        let rule = InterceptRule::new(HttpMethod::Post, "/api/auth/register", "auth").unwrap();
        let first = registry.begin_case(vec![rule.clone()]);
        let second = registry.begin_case(vec![rule]);
        assert_eq!(second, first + 1);
        assert_eq!(registry.current_case(), second);

        let mut late = register_exchange(200);
        late.case = Some(first);
        assert_eq!(registry.record(late), None);
        assert_eq!(registry.pending_count("auth"), 0);

        let mut current = register_exchange(400);
        current.case = Some(second);
        assert_eq!(registry.record(current).as_deref(), Some("auth"));
    }

    #[tokio::test]
    async fn test_wait_returns_captures_in_order() {
        let registry = InterceptRegistry::new();
        registry.begin_case(vec![InterceptRule::new(
            HttpMethod::Post,
            "/api/auth/register",
            "auth",
        )
        .unwrap()]);
        registry.record(register_exchange(400));
        registry.record(register_exchange(200));

        let first = registry.wait("auth", Duration::from_millis(10)).await.unwrap();
        let second = registry.wait("auth", Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.status, 400);
        assert_eq!(second.status, 200);
        assert_eq!(registry.latest("auth").unwrap().status, 200);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_late_capture() {
        let registry = Arc::new(InterceptRegistry::new());
        registry.begin_case(vec![InterceptRule::new(
            HttpMethod::Post,
            "/api/auth/register",
            "auth",
        )
        .unwrap()]);

        let feed = Arc::clone(&registry);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            feed.record(register_exchange(200));
        });

        let exchange = registry.wait("auth", Duration::from_secs(2)).await.unwrap();
        assert_eq!(exchange.status, 200);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let registry = InterceptRegistry::new();
        registry.begin_case(vec![InterceptRule::new(
            HttpMethod::Post,
            "/api/auth/register",
            "auth",
        )
        .unwrap()]);

        let err = registry
            .wait("auth", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, E2eError::NetworkWaitTimeout { ref alias, .. } if alias == "auth"));
    }
}
