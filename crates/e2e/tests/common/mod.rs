//! Registration app model shared by the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::time::Duration;

use authflow_e2e::sim::{SimApp, SimElement, SimEvent, SimForm, SimPage, SimRequest, SimResponse};
use authflow_e2e::{Cookie, HttpMethod, RunnerConfig, TestSuite};
use serde_json::json;

pub const SESSION_COOKIE: &str = "ring-session";
pub const MISSING_PARAMETERS: &str = "missing parameters. name and password required";
pub const DUPLICATE_USER: &str = "There is already a user with that name";

pub const REGISTRATION_YAML: &str = include_str!("../specs/registration.yaml");

pub fn registration_suite() -> TestSuite {
    TestSuite::from_yaml(REGISTRATION_YAML).expect("registration suite parses")
}

pub fn fast_config() -> RunnerConfig {
    RunnerConfig {
        wait_timeout: Duration::from_millis(250),
        action_timeout: Duration::from_millis(50),
        ..Default::default()
    }
}

/// Landing page -> login form -> sign-up form backed by an in-memory user table
#[derive(Default)]
pub struct RegistrationApp {
    users: HashMap<String, String>,
    sessions: HashMap<String, String>,
    error: Option<String>,
    next_session: u64,
    pub requests: usize,
}

impl RegistrationApp {
    pub fn with_user(name: &str, password: &str) -> Self {
        let mut app = Self::default();
        app.users.insert(name.to_string(), password.to_string());
        app
    }

    pub fn has_user(&self, name: &str) -> bool {
        self.users.contains_key(name)
    }

    fn signed_in(&self, cookies: &[Cookie]) -> Option<&String> {
        cookies
            .iter()
            .find(|c| c.name == SESSION_COOKIE)
            .and_then(|c| self.sessions.get(&c.value))
    }

    fn reject(&mut self, message: &str) -> SimResponse {
        self.error = Some(message.to_string());
        SimResponse::json(400, json!({ "error": message }))
    }
}

impl SimApp for RegistrationApp {
    fn render(&mut self, route: &str, cookies: &[Cookie]) -> SimPage {
        match route {
            "/" => SimPage::new()
                .with(SimElement::new("h1").text("Welcome"))
                .with(
                    SimElement::new("a.login")
                        .text("Log In")
                        .on_click(SimEvent::Goto("/login".into())),
                ),
            "/login" => {
                self.error = None;
                SimPage::new()
                    // Same text outside the form; scoped lookups must skip it.
                    .with(
                        SimElement::new("p.help")
                            .text("I don't have an account? Read the FAQ")
                            .on_click(SimEvent::Goto("/faq".into())),
                    )
                    .with(SimElement::new("form").text("Log in"))
                    .with(
                        SimElement::new("a.signup")
                            .text("I don't have an account")
                            .within("form")
                            .on_click(SimEvent::Goto("/register".into())),
                    )
            }
            "/register" => {
                let submit = SimEvent::Submit(
                    SimForm::new(HttpMethod::Post, "/api/auth/register")
                        .field("name", "#email")
                        .field("password", "input[type=password]"),
                );
                let mut page = SimPage::new()
                    .with(SimElement::new("#email").on_enter(submit.clone()))
                    .with(SimElement::new("input[type=password]").on_enter(submit));

                let error_box = SimElement::new(".error-box");
                page = page.with(match &self.error {
                    Some(message) => error_box.text(message),
                    None => error_box.hidden(),
                });

                if let Some(name) = self.signed_in(cookies) {
                    page = page.with(SimElement::new(".long-name").text(name));
                }
                page
            }
            _ => SimPage::new().with(SimElement::new("h1").text("Not Found")),
        }
    }

    fn handle(&mut self, request: &SimRequest, _cookies: &[Cookie]) -> SimResponse {
        self.requests += 1;

        let field = |key: &str| {
            request
                .body
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let name = field("name");
        let password = field("password");

        if name.is_empty() || password.is_empty() {
            return self.reject(MISSING_PARAMETERS);
        }
        if self.users.contains_key(&name) {
            return self.reject(DUPLICATE_USER);
        }

        self.users.insert(name.clone(), password);
        self.next_session += 1;
        let token = format!("session-{}", self.next_session);
        self.sessions.insert(token.clone(), name.clone());
        self.error = None;

        SimResponse::json(200, json!({ "name": name }))
            .with_cookie(Cookie::new(SESSION_COOKIE, &token))
    }
}
