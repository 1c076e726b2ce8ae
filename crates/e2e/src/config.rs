//! Runner configuration
//!
//! Built from defaults, then an optional TOML file, then command-line flags.
//!
//! ```toml
//! specs_dir = "tests/specs"
//! wait_timeout_ms = 5000
//!
//! [browser]
//! base_url = "http://127.0.0.1:3000"
//! browser = "firefox"
//!
//! [server]
//! binary = "target/debug/app"
//! health_path = "/health"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{E2eError, E2eResult};
use crate::playwright::{Browser, PlaywrightConfig};
use crate::server::ServerConfig;

/// Default bound on the network-exchange wait
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on element resolution
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(4);

/// Configuration for the scenario runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub wait_timeout: Duration,
    pub action_timeout: Duration,
    pub specs_dir: PathBuf,
    pub output_dir: PathBuf,
    pub junit: bool,
    pub playwright: PlaywrightConfig,
    /// Application to spawn before the run, if any
    pub server: Option<ServerConfig>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            specs_dir: PathBuf::from("tests/specs"),
            output_dir: PathBuf::from("test-results"),
            junit: false,
            playwright: PlaywrightConfig::default(),
            server: None,
        }
    }
}

/// On-disk configuration; every field is optional
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub specs_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub wait_timeout_ms: Option<u64>,
    pub action_timeout_ms: Option<u64>,
    pub junit: Option<bool>,
    #[serde(default)]
    pub browser: BrowserSection,
    pub server: Option<ServerSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrowserSection {
    pub base_url: Option<String>,
    pub browser: Option<Browser>,
    pub headless: Option<bool>,
    pub viewport_width: Option<u32>,
    pub viewport_height: Option<u32>,
    pub node_root: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    pub binary: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub port: Option<u16>,
    pub health_path: Option<String>,
    pub startup_timeout_secs: Option<u64>,
}

impl FileConfig {
    pub fn from_toml(content: &str) -> E2eResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            E2eError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }
}

impl RunnerConfig {
    /// Load defaults overlaid with a TOML file
    pub fn from_file(path: &Path) -> E2eResult<Self> {
        Ok(Self::default().merge(FileConfig::from_file(path)?))
    }

    /// Overlay every field present in `file`
    pub fn merge(mut self, file: FileConfig) -> Self {
        if let Some(dir) = file.specs_dir {
            self.specs_dir = dir;
        }
        if let Some(dir) = file.output_dir {
            self.output_dir = dir;
        }
        if let Some(ms) = file.wait_timeout_ms {
            self.wait_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.action_timeout_ms {
            self.action_timeout = Duration::from_millis(ms);
        }
        if let Some(junit) = file.junit {
            self.junit = junit;
        }

        let browser = file.browser;
        if let Some(url) = browser.base_url {
            self.playwright.base_url = url;
        }
        if let Some(b) = browser.browser {
            self.playwright.browser = b;
        }
        if let Some(headless) = browser.headless {
            self.playwright.headless = headless;
        }
        if let Some(w) = browser.viewport_width {
            self.playwright.viewport_width = w;
        }
        if let Some(h) = browser.viewport_height {
            self.playwright.viewport_height = h;
        }
        if let Some(root) = browser.node_root {
            self.playwright.node_root = root;
        }

        if let Some(server) = file.server {
            let defaults = ServerConfig::default();
            self.server = Some(ServerConfig {
                binary_path: server.binary,
                args: server.args,
                env: server.env.into_iter().collect(),
                port: server.port,
                health_path: server.health_path.unwrap_or(defaults.health_path),
                startup_timeout: server
                    .startup_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.startup_timeout),
            });
        }

        self
    }
}
