//! Browser collaborator interfaces
//!
//! The runner never touches a DOM directly. It resolves selectors through an
//! [`ElementLocator`] and drives the page through a [`BrowserDriver`]; the
//! Playwright bridge and the in-process simulator both implement these.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::E2eResult;
use crate::intercept::InterceptRegistry;

/// Opaque reference to a resolved element, valid until the page changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementHandle {
    pub id: String,
    pub selector: String,
}

/// A cookie in the browser context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default, rename = "httpOnly")]
    pub http_only: bool,
}

impl Cookie {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            domain: None,
            path: Some("/".to_string()),
            http_only: true,
        }
    }
}

/// Resolves selectors to element handles.
///
/// Resolution waits up to `timeout` for the element to become available and
/// fails with [`E2eError::ElementNotFound`](crate::E2eError::ElementNotFound)
/// otherwise.
#[async_trait]
pub trait ElementLocator: Send {
    async fn resolve(&mut self, selector: &str, timeout: Duration) -> E2eResult<ElementHandle>;

    /// Resolve the first element whose text contains `text`, optionally
    /// restricted to descendants of `within`.
    async fn resolve_text(
        &mut self,
        text: &str,
        within: Option<&str>,
        timeout: Duration,
    ) -> E2eResult<ElementHandle>;
}

/// A single browser context driven one step at a time
#[async_trait]
pub trait BrowserDriver: ElementLocator {
    /// Route every completed network exchange into `registry`
    fn attach(&mut self, registry: Arc<InterceptRegistry>);

    /// Stamp requests issued from now on with `case`, the number returned by
    /// [`InterceptRegistry::begin_case`]. Exchanges carrying an older stamp are
    /// dropped when they complete.
    async fn begin_case(&mut self, case: u64) -> E2eResult<()>;

    /// Load `url` (relative to the base URL) and wait for the page to settle
    async fn navigate(&mut self, url: &str) -> E2eResult<()>;

    async fn click(&mut self, element: &ElementHandle) -> E2eResult<()>;

    /// Type `text` into the element, pressing Enter afterwards when `submit` is set
    async fn type_text(&mut self, element: &ElementHandle, text: &str, submit: bool)
        -> E2eResult<()>;

    async fn text(&mut self, element: &ElementHandle) -> E2eResult<String>;

    async fn is_visible(&mut self, element: &ElementHandle) -> E2eResult<bool>;

    async fn cookie(&mut self, name: &str) -> E2eResult<Option<Cookie>>;

    async fn clear_cookies(&mut self) -> E2eResult<()>;

    /// Release the browser. Called once after the last suite.
    async fn close(&mut self) -> E2eResult<()> {
        Ok(())
    }
}
