//! Playwright browser automation
//!
//! A single Node process runs an embedded bridge script that owns one
//! browser context for the whole run. The driver writes one JSON command per
//! line to its stdin and a reader task routes JSON lines from its stdout:
//! replies go back to the waiting command, `exchange` events go into the
//! attached [`InterceptRegistry`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::driver::{BrowserDriver, Cookie, ElementHandle, ElementLocator};
use crate::error::{E2eError, E2eResult};
use crate::intercept::{InterceptRegistry, NetworkExchange};

/// Extra time granted to a bridge reply beyond the command's own timeout
const REPLY_GRACE: Duration = Duration::from_secs(10);

const BRIDGE_SCRIPT: &str = r#"
const readline = require('readline');
const playwright = require('playwright');

const config = JSON.parse(process.env.AUTHFLOW_BRIDGE_CONFIG);
const emit = (msg) => process.stdout.write(JSON.stringify(msg) + '\n');

(async () => {
  const browser = await playwright[config.browser].launch({ headless: config.headless });
  const context = await browser.newContext({
    baseURL: config.base_url,
    viewport: { width: config.viewport_width, height: config.viewport_height },
  });
  const page = await context.newPage();
  const handles = new Map();
  let nextHandle = 0;
  let currentCase = 0;
  const issuedIn = new WeakMap();

  page.on('request', (request) => issuedIn.set(request, currentCase));
  page.on('requestfinished', async (request) => {
    if (!['xhr', 'fetch', 'document'].includes(request.resourceType())) return;
    const response = await request.response();
    if (!response) return;
    let body = '';
    try { body = await response.text(); } catch (_) {}
    const url = new URL(request.url());
    emit({
      event: 'exchange',
      exchange: {
        method: request.method(),
        path: url.pathname + url.search,
        status: response.status(),
        request_body: request.postData(),
        body,
        case: issuedIn.has(request) ? issuedIn.get(request) : null,
      },
    });
  });

  const store = (selector, locator) => {
    const id = `h${nextHandle++}`;
    handles.set(id, locator);
    return { id, selector };
  };
  const handle = (id) => {
    const locator = handles.get(id);
    if (!locator) throw new Error(`unknown element handle ${id}`);
    return locator;
  };

  const commands = {
    begin_case: async (c) => { currentCase = c.case; return null; },
    navigate: async (c) => { handles.clear(); await page.goto(c.url, { waitUntil: 'load' }); return null; },
    resolve: async (c) => {
      const locator = page.locator(c.selector).first();
      await locator.waitFor({ state: 'attached', timeout: c.timeout_ms });
      return store(c.selector, locator);
    },
    resolve_text: async (c) => {
      const scope = c.within ? page.locator(c.within) : page;
      const locator = scope.getByText(c.text).first();
      await locator.waitFor({ state: 'visible', timeout: c.timeout_ms });
      return store(c.within ? `${c.within} >> text=${c.text}` : `text=${c.text}`, locator);
    },
    click: async (c) => { await handle(c.handle).click(); return null; },
    type: async (c) => {
      const locator = handle(c.handle);
      await locator.pressSequentially(c.text);
      if (c.submit) await locator.press('Enter');
      return null;
    },
    text: async (c) => (await handle(c.handle).textContent()) || '',
    visible: async (c) => handle(c.handle).isVisible(),
    cookie: async (c) => (await context.cookies()).find((k) => k.name === c.name) || null,
    clear_cookies: async () => { await context.clearCookies(); return null; },
    close: async () => { await browser.close(); return null; },
  };

  emit({ event: 'ready' });

  const rl = readline.createInterface({ input: process.stdin });
  for await (const line of rl) {
    if (!line.trim()) continue;
    const command = JSON.parse(line);
    try {
      const result = await commands[command.cmd](command);
      emit({ id: command.id, ok: true, result });
      if (command.cmd === 'close') process.exit(0);
    } catch (error) {
      const kind = error.name === 'TimeoutError' ? 'timeout' : 'error';
      emit({ id: command.id, ok: false, kind, error: error.message });
    }
  }
})().catch((error) => {
  process.stderr.write(`bridge failed: ${error.stack}\n`);
  process.exit(1);
});
"#;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

impl FromStr for Browser {
    type Err = E2eError;

    fn from_str(s: &str) -> E2eResult<Self> {
        match s {
            "chromium" => Ok(Browser::Chromium),
            "firefox" => Ok(Browser::Firefox),
            "webkit" => Ok(Browser::Webkit),
            other => Err(E2eError::Config(format!("Unknown browser: {}", other))),
        }
    }
}

/// Configuration for Playwright
#[derive(Debug, Clone)]
pub struct PlaywrightConfig {
    pub base_url: String,
    pub browser: Browser,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Directory whose `node_modules` provides the `playwright` package
    pub node_root: PathBuf,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            browser: Browser::Chromium,
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            node_root: PathBuf::from("."),
        }
    }
}

#[derive(Serialize)]
struct BridgeConfig<'a> {
    browser: &'a str,
    headless: bool,
    base_url: &'a str,
    viewport_width: u32,
    viewport_height: u32,
}

#[derive(Debug, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum BridgeCommand<'a> {
    BeginCase { case: u64 },
    Navigate { url: &'a str },
    Resolve { selector: &'a str, timeout_ms: u64 },
    ResolveText { text: &'a str, within: Option<&'a str>, timeout_ms: u64 },
    Click { handle: &'a str },
    Type { handle: &'a str, text: &'a str, submit: bool },
    Text { handle: &'a str },
    Visible { handle: &'a str },
    Cookie { name: &'a str },
    ClearCookies,
    Close,
}

#[derive(Serialize)]
struct Envelope<'a> {
    id: u64,
    #[serde(flatten)]
    command: BridgeCommand<'a>,
}

#[derive(Debug, Deserialize)]
struct BridgeReply {
    id: u64,
    ok: bool,
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BridgeMessage {
    Exchange { exchange: NetworkExchange },
    Event { event: String },
    Reply(BridgeReply),
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<BridgeReply>>>>;
type RegistrySlot = Arc<Mutex<Option<Arc<InterceptRegistry>>>>;

/// Playwright-backed [`BrowserDriver`]
pub struct PlaywrightDriver {
    child: Child,
    stdin: ChildStdin,
    pending: PendingReplies,
    registry: RegistrySlot,
    reader: JoinHandle<()>,
    next_id: u64,
    closed: bool,
    _script_dir: tempfile::TempDir,
}

impl PlaywrightDriver {
    /// Start the bridge and wait until the browser is ready
    pub async fn launch(config: PlaywrightConfig) -> E2eResult<Self> {
        Self::check_playwright_installed(&config).await?;

        let script_dir = tempfile::tempdir()?;
        let script_path = script_dir.path().join("bridge.js");
        std::fs::write(&script_path, BRIDGE_SCRIPT)?;

        let bridge_config = serde_json::to_string(&BridgeConfig {
            browser: config.browser.as_str(),
            headless: config.headless,
            base_url: &config.base_url,
            viewport_width: config.viewport_width,
            viewport_height: config.viewport_height,
        })?;

        info!(
            "Launching {} ({}) against {}",
            config.browser.as_str(),
            if config.headless { "headless" } else { "headed" },
            config.base_url
        );

        let mut child = Command::new("node")
            .arg(&script_path)
            .current_dir(&config.node_root)
            .env("NODE_PATH", config.node_root.join("node_modules"))
            .env("AUTHFLOW_BRIDGE_CONFIG", bridge_config)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| E2eError::Playwright(format!("Failed to spawn node: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| E2eError::Playwright("bridge stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| E2eError::Playwright("bridge stdout unavailable".to_string()))?;

        let pending: PendingReplies = Arc::default();
        let registry: RegistrySlot = Arc::default();
        let (ready_tx, ready_rx) = oneshot::channel();

        let reader = {
            let pending = Arc::clone(&pending);
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let mut ready_tx = Some(ready_tx);
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => route_line(&line, &pending, &registry, &mut ready_tx),
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Bridge read error: {}", e);
                            break;
                        }
                    }
                }
                debug!("Bridge output closed");
                // Dropping outstanding senders fails every in-flight command.
                pending.lock().clear();
            })
        };

        match tokio::time::timeout(Duration::from_secs(60), ready_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                return Err(E2eError::Playwright(
                    "bridge exited before the browser was ready".to_string(),
                ))
            }
            Err(_) => {
                return Err(E2eError::Playwright(
                    "timed out waiting for the browser to start".to_string(),
                ))
            }
        }

        Ok(Self {
            child,
            stdin,
            pending,
            registry,
            reader,
            next_id: 0,
            closed: false,
            _script_dir: script_dir,
        })
    }

    /// Check if Playwright is installed
    async fn check_playwright_installed(config: &PlaywrightConfig) -> E2eResult<()> {
        let status = Command::new("npx")
            .args(["playwright", "--version"])
            .current_dir(&config.node_root)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => Ok(()),
            _ => Err(E2eError::PlaywrightNotFound),
        }
    }

    async fn send(&mut self, command: BridgeCommand<'_>, timeout: Duration) -> E2eResult<BridgeReply> {
        self.next_id += 1;
        let id = self.next_id;

        let mut line = serde_json::to_string(&Envelope { id, command })?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if let Err(e) = self.stdin.write_all(line.as_bytes()).await {
            self.pending.lock().remove(&id);
            return Err(E2eError::Playwright(format!("bridge write failed: {}", e)));
        }
        self.stdin.flush().await?;

        match tokio::time::timeout(timeout + REPLY_GRACE, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(E2eError::Playwright("bridge exited".to_string())),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(E2eError::Playwright(format!("no reply to command {}", id)))
            }
        }
    }

    /// Send a command whose failures are driver errors
    async fn call(&mut self, command: BridgeCommand<'_>) -> E2eResult<serde_json::Value> {
        let reply = self.send(command, Duration::from_secs(30)).await?;
        if reply.ok {
            Ok(reply.result)
        } else {
            Err(E2eError::Driver(reply.error.unwrap_or_default()))
        }
    }

    async fn locate(
        &mut self,
        command: BridgeCommand<'_>,
        selector: String,
        timeout: Duration,
    ) -> E2eResult<ElementHandle> {
        let reply = self.send(command, timeout).await?;
        if reply.ok {
            return Ok(serde_json::from_value(reply.result)?);
        }

        match reply.kind.as_deref() {
            Some("timeout") => Err(E2eError::ElementNotFound { selector, timeout }),
            _ => Err(E2eError::Driver(reply.error.unwrap_or_default())),
        }
    }
}

fn route_line(
    line: &str,
    pending: &PendingReplies,
    registry: &RegistrySlot,
    ready_tx: &mut Option<oneshot::Sender<()>>,
) {
    match serde_json::from_str::<BridgeMessage>(line) {
        Ok(BridgeMessage::Exchange { exchange }) => {
            if let Some(registry) = registry.lock().as_ref() {
                registry.record(exchange);
            }
        }
        Ok(BridgeMessage::Event { event }) if event == "ready" => {
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(());
            }
        }
        Ok(BridgeMessage::Event { event }) => debug!("Ignoring bridge event: {}", event),
        Ok(BridgeMessage::Reply(reply)) => {
            if let Some(tx) = pending.lock().remove(&reply.id) {
                let _ = tx.send(reply);
            }
        }
        Err(e) => warn!("Unparseable bridge output ({}): {}", e, line),
    }
}

#[async_trait]
impl ElementLocator for PlaywrightDriver {
    async fn resolve(&mut self, selector: &str, timeout: Duration) -> E2eResult<ElementHandle> {
        let command = BridgeCommand::Resolve {
            selector,
            timeout_ms: timeout.as_millis() as u64,
        };
        self.locate(command, selector.to_string(), timeout).await
    }

    async fn resolve_text(
        &mut self,
        text: &str,
        within: Option<&str>,
        timeout: Duration,
    ) -> E2eResult<ElementHandle> {
        let description = match within {
            Some(scope) => format!("{} >> text={}", scope, text),
            None => format!("text={}", text),
        };
        let command = BridgeCommand::ResolveText {
            text,
            within,
            timeout_ms: timeout.as_millis() as u64,
        };
        self.locate(command, description, timeout).await
    }
}

#[async_trait]
impl BrowserDriver for PlaywrightDriver {
    fn attach(&mut self, registry: Arc<InterceptRegistry>) {
        *self.registry.lock() = Some(registry);
    }

    async fn begin_case(&mut self, case: u64) -> E2eResult<()> {
        self.call(BridgeCommand::BeginCase { case }).await?;
        Ok(())
    }

    async fn navigate(&mut self, url: &str) -> E2eResult<()> {
        self.call(BridgeCommand::Navigate { url }).await?;
        Ok(())
    }

    async fn click(&mut self, element: &ElementHandle) -> E2eResult<()> {
        self.call(BridgeCommand::Click { handle: &element.id }).await?;
        Ok(())
    }

    async fn type_text(
        &mut self,
        element: &ElementHandle,
        text: &str,
        submit: bool,
    ) -> E2eResult<()> {
        self.call(BridgeCommand::Type {
            handle: &element.id,
            text,
            submit,
        })
        .await?;
        Ok(())
    }

    async fn text(&mut self, element: &ElementHandle) -> E2eResult<String> {
        let value = self.call(BridgeCommand::Text { handle: &element.id }).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn is_visible(&mut self, element: &ElementHandle) -> E2eResult<bool> {
        let value = self.call(BridgeCommand::Visible { handle: &element.id }).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn cookie(&mut self, name: &str) -> E2eResult<Option<Cookie>> {
        let value = self.call(BridgeCommand::Cookie { name }).await?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }

    async fn clear_cookies(&mut self) -> E2eResult<()> {
        self.call(BridgeCommand::ClearCookies).await?;
        Ok(())
    }

    async fn close(&mut self) -> E2eResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Err(e) = self.call(BridgeCommand::Close).await {
            warn!("Bridge did not close cleanly: {}", e);
        }
        if tokio::time::timeout(Duration::from_secs(5), self.child.wait())
            .await
            .is_err()
        {
            self.child.start_kill()?;
        }
        self.reader.abort();
        Ok(())
    }
}

impl Drop for PlaywrightDriver {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.child.start_kill();
        }
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intercept::{HttpMethod, InterceptRule};

    #[test]
    fn test_command_encoding() {
        let line = serde_json::to_string(&Envelope {
            id: 7,
            command: BridgeCommand::Type {
                handle: "h3",
                text: "yay",
                submit: true,
            },
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["cmd"], "type");
        assert_eq!(value["submit"], true);

        let line = serde_json::to_string(&Envelope {
            id: 8,
            command: BridgeCommand::ClearCookies,
        })
        .unwrap();
        assert_eq!(line, r#"{"id":8,"cmd":"clear_cookies"}"#);
    }

    #[test]
    fn test_route_exchange_event() {
        let pending: PendingReplies = Arc::default();
        let registry = Arc::new(InterceptRegistry::new());
        registry.begin_case(vec![InterceptRule::new(
            HttpMethod::Post,
            "/api/auth/register",
            "auth",
        )
        .unwrap()]);
        let slot: RegistrySlot = Arc::new(Mutex::new(Some(Arc::clone(&registry))));
        let mut ready = None;

        route_line(
            r#"{"event":"exchange","exchange":{"method":"POST","path":"/api/auth/register","status":400,"request_body":"{}","body":"missing parameters"}}"#,
            &pending,
            &slot,
            &mut ready,
        );
        assert_eq!(registry.pending_count("auth"), 1);
    }

    #[test]
    fn test_route_drops_exchange_from_previous_case() {
        let pending: PendingReplies = Arc::default();
        let registry = Arc::new(InterceptRegistry::new());
        let rule = InterceptRule::new(HttpMethod::Post, "/api/auth/register", "auth").unwrap();
        registry.begin_case(vec![rule.clone()]);
        let current = registry.begin_case(vec![rule]);
        let slot: RegistrySlot = Arc::new(Mutex::new(Some(Arc::clone(&registry))));
        let mut ready = None;

        let line = |case: u64| {
            format!(
                r#"{{"event":"exchange","exchange":{{"method":"POST","path":"/api/auth/register","status":200,"body":"","case":{}}}}}"#,
                case
            )
        };
        route_line(&line(current - 1), &pending, &slot, &mut ready);
        assert_eq!(registry.pending_count("auth"), 0);
        route_line(&line(current), &pending, &slot, &mut ready);
        assert_eq!(registry.pending_count("auth"), 1);
    }

    #[test]
    fn test_begin_case_encoding() {
        let line = serde_json::to_string(&Envelope {
            id: 1,
            command: BridgeCommand::BeginCase { case: 4 },
        })
        .unwrap();
        assert_eq!(line, r#"{"id":1,"cmd":"begin_case","case":4}"#);
    }

    #[test]
    fn test_route_reply_and_ready() {
        let pending: PendingReplies = Arc::default();
        let slot: RegistrySlot = Arc::default();
        let (ready_tx, mut ready_rx) = oneshot::channel();
        let mut ready = Some(ready_tx);

        route_line(r#"{"event":"ready"}"#, &pending, &slot, &mut ready);
        assert!(ready.is_none());
        assert!(ready_rx.try_recv().is_ok());

        let (tx, mut rx) = oneshot::channel();
        pending.lock().insert(3, tx);
        route_line(
            r#"{"id":3,"ok":false,"kind":"timeout","error":"Timeout 100ms exceeded"}"#,
            &pending,
            &slot,
            &mut ready,
        );
        let reply = rx.try_recv().unwrap();
        assert!(!reply.ok);
        assert_eq!(reply.kind.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_cookie_from_playwright_shape() {
        let cookie: Cookie = serde_json::from_str(
            r#"{"name":"ring-session","value":"abc","domain":"localhost","path":"/","httpOnly":true,"secure":false,"sameSite":"Lax","expires":-1}"#,
        )
        .unwrap();
        assert_eq!(cookie.name, "ring-session");
        assert!(cookie.http_only);
    }

    #[test]
    fn test_browser_from_str() {
        assert_eq!("webkit".parse::<Browser>().unwrap(), Browser::Webkit);
        assert!("netscape".parse::<Browser>().is_err());
    }
}
