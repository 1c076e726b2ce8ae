//! In-process browser double
//!
//! [`SimBrowser`] renders pages from a [`SimApp`] model instead of a real
//! browser: elements are plain records addressed by selector, typing stores
//! values, and pressing Enter in a field wired to a [`SimForm`] sends the form
//! to the app as a JSON request. Completed requests are reported to the
//! intercept registry like a real driver would, optionally after a delay.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::driver::{BrowserDriver, Cookie, ElementHandle, ElementLocator};
use crate::error::{E2eError, E2eResult};
use crate::intercept::{HttpMethod, InterceptRegistry, NetworkExchange};

/// What happens when an element is clicked or receives Enter
#[derive(Debug, Clone)]
pub enum SimEvent {
    Goto(String),
    Submit(SimForm),
}

/// A form submission: each field sends the value typed into `selector` as `param`
#[derive(Debug, Clone)]
pub struct SimForm {
    pub method: HttpMethod,
    pub path: String,
    pub fields: Vec<(String, String)>,
}

impl SimForm {
    pub fn new(method: HttpMethod, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, param: &str, selector: &str) -> Self {
        self.fields.push((param.to_string(), selector.to_string()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct SimElement {
    pub selector: String,
    pub text: String,
    pub visible: bool,
    /// Selector of the enclosing container, for scoped text lookups
    pub parent: Option<String>,
    pub on_click: Option<SimEvent>,
    pub on_enter: Option<SimEvent>,
}

impl SimElement {
    pub fn new(selector: &str) -> Self {
        Self {
            selector: selector.to_string(),
            text: String::new(),
            visible: true,
            parent: None,
            on_click: None,
            on_enter: None,
        }
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn within(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    pub fn on_click(mut self, event: SimEvent) -> Self {
        self.on_click = Some(event);
        self
    }

    pub fn on_enter(mut self, event: SimEvent) -> Self {
        self.on_enter = Some(event);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimPage {
    pub elements: Vec<SimElement>,
}

impl SimPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, element: SimElement) -> Self {
        self.elements.push(element);
        self
    }
}

#[derive(Debug, Clone)]
pub struct SimRequest {
    pub method: HttpMethod,
    pub path: String,
    pub body: Value,
}

#[derive(Debug, Clone)]
pub struct SimResponse {
    pub status: u16,
    pub body: Value,
    pub set_cookies: Vec<Cookie>,
}

impl SimResponse {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            set_cookies: Vec::new(),
        }
    }

    pub fn with_cookie(mut self, cookie: Cookie) -> Self {
        self.set_cookies.push(cookie);
        self
    }
}

/// The application model behind a [`SimBrowser`]
pub trait SimApp: Send {
    /// Render `route` for a browser holding `cookies`
    fn render(&mut self, route: &str, cookies: &[Cookie]) -> SimPage;

    /// Handle a request sent by a form submission
    fn handle(&mut self, request: &SimRequest, cookies: &[Cookie]) -> SimResponse;
}

/// [`BrowserDriver`] over a [`SimApp`]
pub struct SimBrowser<A: SimApp> {
    app: A,
    route: String,
    page: SimPage,
    generation: u64,
    values: HashMap<String, String>,
    cookies: Vec<Cookie>,
    registry: Option<Arc<InterceptRegistry>>,
    latency: Option<Duration>,
    case: u64,
}

impl<A: SimApp> SimBrowser<A> {
    pub fn new(app: A) -> Self {
        Self {
            app,
            route: String::new(),
            page: SimPage::default(),
            generation: 0,
            values: HashMap::new(),
            cookies: Vec::new(),
            registry: None,
            latency: None,
            case: 0,
        }
    }

    /// Report network exchanges only after `latency` has elapsed
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    fn rerender(&mut self) {
        self.page = self.app.render(&self.route, &self.cookies);
        self.generation += 1;
    }

    fn handle_for(&self, index: usize, selector: &str) -> ElementHandle {
        ElementHandle {
            id: format!("{}:{}", self.generation, index),
            selector: selector.to_string(),
        }
    }

    fn element(&self, handle: &ElementHandle) -> E2eResult<&SimElement> {
        let stale = || E2eError::Driver(format!("stale element handle for {}", handle.selector));
        let (generation, index) = handle.id.split_once(':').ok_or_else(stale)?;
        if generation.parse::<u64>().ok() != Some(self.generation) {
            return Err(stale());
        }
        let index: usize = index.parse().map_err(|_| stale())?;
        self.page.elements.get(index).ok_or_else(stale)
    }

    async fn fire(&mut self, event: SimEvent) -> E2eResult<()> {
        match event {
            SimEvent::Goto(route) => self.navigate(&route).await,
            SimEvent::Submit(form) => {
                self.submit(form);
                Ok(())
            }
        }
    }

    fn submit(&mut self, form: SimForm) {
        let mut body = Map::new();
        for (param, selector) in &form.fields {
            let value = self
                .values
                .get(&normalize(selector))
                .cloned()
                .unwrap_or_default();
            body.insert(param.clone(), Value::String(value));
        }

        let request = SimRequest {
            method: form.method,
            path: form.path,
            body: Value::Object(body),
        };
        let response = self.app.handle(&request, &self.cookies);
        debug!("{} {} -> {}", request.method, request.path, response.status);

        for cookie in response.set_cookies {
            self.cookies.retain(|c| c.name != cookie.name);
            self.cookies.push(cookie);
        }

        let exchange = NetworkExchange {
            method: request.method,
            path: request.path,
            status: response.status,
            request_body: Some(request.body.to_string()),
            body: response.body.to_string(),
            case: Some(self.case),
        };
        self.report(exchange);
        self.rerender();
    }

    fn report(&self, exchange: NetworkExchange) {
        let Some(registry) = self.registry.clone() else {
            return;
        };
        match self.latency {
            Some(latency) => {
                tokio::spawn(async move {
                    tokio::time::sleep(latency).await;
                    registry.record(exchange);
                });
            }
            None => {
                registry.record(exchange);
            }
        }
    }
}

/// Quotes inside attribute selectors are optional: `input[type='password']`
/// and `input[type=password]` address the same element.
fn normalize(selector: &str) -> String {
    selector.chars().filter(|c| *c != '\'' && *c != '"').collect()
}

#[async_trait]
impl<A: SimApp> ElementLocator for SimBrowser<A> {
    async fn resolve(&mut self, selector: &str, timeout: Duration) -> E2eResult<ElementHandle> {
        let wanted = normalize(selector);
        self.page
            .elements
            .iter()
            .position(|e| normalize(&e.selector) == wanted)
            .map(|index| self.handle_for(index, selector))
            .ok_or_else(|| E2eError::ElementNotFound {
                selector: selector.to_string(),
                timeout,
            })
    }

    async fn resolve_text(
        &mut self,
        text: &str,
        within: Option<&str>,
        timeout: Duration,
    ) -> E2eResult<ElementHandle> {
        let scope = within.map(normalize);
        self.page
            .elements
            .iter()
            .position(|e| {
                e.visible
                    && e.text.contains(text)
                    && match &scope {
                        Some(scope) => e.parent.as_deref().map(normalize).as_ref() == Some(scope),
                        None => true,
                    }
            })
            .map(|index| self.handle_for(index, &format!("text={}", text)))
            .ok_or_else(|| E2eError::ElementNotFound {
                selector: match within {
                    Some(scope) => format!("{} >> text={}", scope, text),
                    None => format!("text={}", text),
                },
                timeout,
            })
    }
}

#[async_trait]
impl<A: SimApp> BrowserDriver for SimBrowser<A> {
    fn attach(&mut self, registry: Arc<InterceptRegistry>) {
        self.registry = Some(registry);
    }

    async fn begin_case(&mut self, case: u64) -> E2eResult<()> {
        self.case = case;
        Ok(())
    }

    async fn navigate(&mut self, url: &str) -> E2eResult<()> {
        self.route = url.to_string();
        self.values.clear();
        self.rerender();
        Ok(())
    }

    async fn click(&mut self, element: &ElementHandle) -> E2eResult<()> {
        let event = self.element(element)?.on_click.clone();
        match event {
            Some(event) => self.fire(event).await,
            None => Ok(()),
        }
    }

    async fn type_text(
        &mut self,
        element: &ElementHandle,
        text: &str,
        submit: bool,
    ) -> E2eResult<()> {
        let target = self.element(element)?;
        let key = normalize(&target.selector);
        let on_enter = target.on_enter.clone();

        self.values.entry(key).or_default().push_str(text);

        match (submit, on_enter) {
            (true, Some(event)) => self.fire(event).await,
            _ => Ok(()),
        }
    }

    async fn text(&mut self, element: &ElementHandle) -> E2eResult<String> {
        Ok(self.element(element)?.text.clone())
    }

    async fn is_visible(&mut self, element: &ElementHandle) -> E2eResult<bool> {
        Ok(self.element(element)?.visible)
    }

    async fn cookie(&mut self, name: &str) -> E2eResult<Option<Cookie>> {
        Ok(self.cookies.iter().find(|c| c.name == name).cloned())
    }

    async fn clear_cookies(&mut self) -> E2eResult<()> {
        self.cookies.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl SimApp for Echo {
        fn render(&mut self, route: &str, _cookies: &[Cookie]) -> SimPage {
            match route {
                "/" => SimPage::new().with(
                    SimElement::new("a.next")
                        .text("Next page")
                        .on_click(SimEvent::Goto("/form".into())),
                ),
                _ => SimPage::new().with(
                    SimElement::new("input[name='q']").on_enter(SimEvent::Submit(
                        SimForm::new(HttpMethod::Post, "/echo").field("q", "input[name=q]"),
                    )),
                ),
            }
        }

        fn handle(&mut self, request: &SimRequest, _cookies: &[Cookie]) -> SimResponse {
            SimResponse::json(200, request.body.clone()).with_cookie(Cookie::new("seen", "1"))
        }
    }

    #[tokio::test]
    async fn test_click_navigates() {
        let mut browser = SimBrowser::new(Echo);
        browser.navigate("/").await.unwrap();
        let link = browser
            .resolve_text("Next", None, Duration::from_millis(10))
            .await
            .unwrap();
        browser.click(&link).await.unwrap();
        assert_eq!(browser.route(), "/form");
    }

    #[tokio::test]
    async fn test_stale_handle_rejected() {
        let mut browser = SimBrowser::new(Echo);
        browser.navigate("/").await.unwrap();
        let link = browser.resolve("a.next", Duration::from_millis(10)).await.unwrap();
        browser.navigate("/").await.unwrap();
        assert!(matches!(browser.text(&link).await, Err(E2eError::Driver(_))));
    }

    #[tokio::test]
    async fn test_submit_reports_exchange_and_sets_cookie() {
        let registry = Arc::new(InterceptRegistry::new());
        let case = registry.begin_case(vec![crate::intercept::InterceptRule::new(
            HttpMethod::Post,
            "/echo",
            "echo",
        )
        .unwrap()]);

        let mut browser = SimBrowser::new(Echo);
        browser.attach(Arc::clone(&registry));
        browser.begin_case(case).await.unwrap();
        browser.navigate("/form").await.unwrap();
        let input = browser
            .resolve("input[name=\"q\"]", Duration::from_millis(10))
            .await
            .unwrap();
        browser.type_text(&input, "hello", true).await.unwrap();

        let exchange = registry.wait("echo", Duration::from_millis(10)).await.unwrap();
        assert_eq!(exchange.status, 200);
        assert_eq!(
            serde_json::from_str::<Value>(&exchange.body).unwrap(),
            json!({ "q": "hello" })
        );
        assert!(browser.cookie("seen").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_element() {
        let mut browser = SimBrowser::new(Echo);
        browser.navigate("/").await.unwrap();
        let err = browser
            .resolve("#email", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, E2eError::ElementNotFound { .. }));
    }
}
