//! E2E runner entry point
//!
//! Loads YAML suites, optionally spawns the application, drives Playwright
//! through every case, and writes the reports.
//! Exit codes: 0 all cases passed, 1 a case failed, 2 harness error (including
//! a driver failure that aborts the run).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use authflow_e2e::playwright::{Browser, PlaywrightDriver};
use authflow_e2e::server::{ServerConfig, ServerHandle};
use authflow_e2e::{
    BrowserDriver, CaseFilter, E2eError, E2eResult, RunnerConfig, ScenarioRunner, TestSuite,
};

#[derive(Parser, Debug)]
#[command(name = "authflow-e2e")]
#[command(about = "Run browser-driven authentication scenarios", version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "AUTHFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Path to test suites directory
    #[arg(short, long, env = "AUTHFLOW_SPECS")]
    specs: Option<PathBuf>,

    /// Run only cases carrying this tag (on the case or its suite)
    #[arg(short, long)]
    tag: Option<String>,

    /// Run only the case with this name
    #[arg(short, long)]
    name: Option<String>,

    /// Base URL of the application under test
    #[arg(long, env = "AUTHFLOW_BASE_URL")]
    base_url: Option<String>,

    /// Spawn this application binary before the run
    #[arg(long)]
    server_binary: Option<PathBuf>,

    /// Health endpoint polled after spawning the server
    #[arg(long, default_value = "/")]
    health_path: String,

    /// Browser to use (chromium, firefox, webkit)
    #[arg(long)]
    browser: Option<Browser>,

    /// Show the browser window
    #[arg(long)]
    headed: bool,

    /// Network wait bound in milliseconds
    #[arg(long)]
    wait_timeout_ms: Option<u64>,

    /// Element resolution bound in milliseconds
    #[arg(long)]
    action_timeout_ms: Option<u64>,

    /// Also write junit.xml
    #[arg(long)]
    junit: bool,

    /// Output directory for results
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Parse and validate suites, then exit
    #[arg(long)]
    check: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to create tokio runtime: {}", e);
            return ExitCode::from(2);
        }
    };

    match rt.block_on(async_main(args)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!("{}", e);
            ExitCode::from(2)
        }
    }
}

fn init_logging(args: &Args) {
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match args.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn build_config(args: &Args) -> E2eResult<RunnerConfig> {
    let mut config = match &args.config {
        Some(path) => RunnerConfig::from_file(path)?,
        None => RunnerConfig::default(),
    };

    if let Some(specs) = &args.specs {
        config.specs_dir = specs.clone();
    }
    if let Some(output) = &args.output {
        config.output_dir = output.clone();
    }
    if let Some(url) = &args.base_url {
        config.playwright.base_url = url.clone();
    }
    if let Some(browser) = args.browser {
        config.playwright.browser = browser;
    }
    if args.headed {
        config.playwright.headless = false;
    }
    if let Some(ms) = args.wait_timeout_ms {
        config.wait_timeout = std::time::Duration::from_millis(ms);
    }
    if let Some(ms) = args.action_timeout_ms {
        config.action_timeout = std::time::Duration::from_millis(ms);
    }
    if args.junit {
        config.junit = true;
    }
    if let Some(binary) = &args.server_binary {
        config.server = Some(ServerConfig {
            binary_path: binary.clone(),
            health_path: args.health_path.clone(),
            ..Default::default()
        });
    }

    Ok(config)
}

async fn async_main(args: Args) -> E2eResult<bool> {
    let mut config = build_config(&args)?;

    let mut suites = TestSuite::load_all(&config.specs_dir)?;
    if let Some(tag) = &args.tag {
        let tagged: Vec<TestSuite> = TestSuite::filter_by_tag(&suites, tag)
            .into_iter()
            .cloned()
            .collect();
        suites = tagged;
    }
    let cases: usize = suites.iter().map(|s| s.cases.len()).sum();
    info!(
        "Loaded {} suite(s), {} case(s) from {}",
        suites.len(),
        cases,
        config.specs_dir.display()
    );

    if args.check {
        return Ok(true);
    }

    // Held until the run ends; dropping it stops the server.
    let _server = match config.server.clone() {
        Some(server_config) => {
            let server = ServerHandle::spawn(server_config).await?;
            config.playwright.base_url = server.base_url().to_string();
            Some(server)
        }
        None => None,
    };

    let driver = PlaywrightDriver::launch(config.playwright.clone()).await?;
    let filter = CaseFilter {
        tag: args.tag.clone(),
        name: args.name.clone(),
    };
    let mut runner = ScenarioRunner::new(driver, &config).with_filter(filter);

    let report = runner.run_suites(&suites).await;
    runner.driver_mut().close().await?;

    report.log_summary();
    report.write_json(&config.output_dir)?;
    if config.junit {
        report.write_junit(&config.output_dir)?;
    }

    if let Some(reason) = &report.aborted {
        return Err(E2eError::RunAborted(reason.clone()));
    }
    Ok(report.success())
}
