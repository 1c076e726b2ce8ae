//! Authflow E2E Scenario Runner
//!
//! Declarative acceptance tests for browser-driven authentication flows:
//! - Parses YAML suites of actions, interceptors and assertions
//! - Drives a browser through the [`BrowserDriver`] interface
//! - Waits on intercepted network exchanges with a bounded timeout
//! - Reports per-case outcomes as JSON and JUnit XML
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ScenarioRunner (per suite)                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  for each case:                                             │
//! │    ├── setup actions            (shared by every case)      │
//! │    ├── registry.begin_case()    (method + path -> alias)    │
//! │    ├── case actions             navigate / click / type     │
//! │    ├── registry.wait(alias)     bounded, NetworkWaitTimeout │
//! │    └── assertions               status / body / DOM / cookie│
//! ├─────────────────────────────────────────────────────────────┤
//! │  BrowserDriver: PlaywrightDriver | SimBrowser               │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod intercept;
pub mod playwright;
pub mod report;
pub mod runner;
pub mod server;
pub mod sim;
pub mod spec;

pub use config::RunnerConfig;
pub use driver::{BrowserDriver, Cookie, ElementHandle, ElementLocator};
pub use error::{E2eError, E2eResult};
pub use intercept::{CapturedExchange, HttpMethod, InterceptRegistry, InterceptRule};
pub use report::{CaseResult, CaseState, RunReport};
pub use runner::{CaseFilter, ScenarioRunner};
pub use spec::{Action, Assertion, TestCase, TestSuite};
