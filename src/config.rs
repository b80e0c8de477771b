//! Configuration management with serde serialization/deserialization
//!
//! A run is configured by a JSON file (see [`Config`]) whose values can be
//! overridden from the command line. Everything here is plain data; the
//! browser launch settings are turned into a chromiumoxide config by
//! [`create_browser_config`].

use crate::RunnerError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Main configuration structure for a capture run
///
/// # Examples
///
/// ```rust
/// use screenshot_runner::Config;
///
/// let config = Config {
///     base_url: "http://localhost:4000".to_string(),
///     concurrency: 4,
///     recycle_after: Some(50),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Root the page paths are resolved against (default: http://localhost:8080)
    pub base_url: String,

    /// Maximum number of tasks in flight at once (default: CPU count, at most 8)
    pub concurrency: usize,

    /// Number of browser tabs kept in the pool (default: same as concurrency)
    ///
    /// A pool smaller than the concurrency limit makes the extra tasks queue
    /// on the pool rather than on the scheduler.
    pub pool_size: Option<usize>,

    /// Replace a tab after it has been handed out this many times (default: never)
    pub recycle_after: Option<usize>,

    /// Per-navigation timeout in milliseconds (default: 30000)
    pub navigation_timeout_ms: u64,

    /// Viewports every page is captured at unless a page override narrows them
    pub viewports: Vec<Viewport>,

    /// Capture options applied to pages without an override
    pub capture: CaptureOptions,

    /// Per-page settings, matched by exact page path
    pub pages: Vec<PageOverride>,

    /// Directory screenshots and the run report are written to
    pub output_dir: PathBuf,

    /// Output image format for screenshots (default: PNG)
    pub output_format: OutputFormat,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Custom User-Agent string for every tab
    pub user_agent: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            concurrency: num_cpus::get().clamp(1, 8),
            pool_size: None,
            recycle_after: None,
            navigation_timeout_ms: 30_000,
            viewports: vec![Viewport::default()],
            capture: CaptureOptions::default(),
            pages: Vec::new(),
            output_dir: PathBuf::from("screenshots"),
            output_format: OutputFormat::Png,
            chrome_path: None,
            user_agent: None,
        }
    }
}

impl Config {
    /// Reads a JSON config file. Missing fields take their defaults.
    pub async fn from_file(path: &Path) -> Result<Self, RunnerError> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size.unwrap_or(self.concurrency)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn page_override(&self, path: &str) -> Option<&PageOverride> {
        self.pages.iter().find(|page| page.path == path)
    }

    pub fn viewport(&self, name: &str) -> Option<&Viewport> {
        self.viewports.iter().find(|viewport| viewport.name == name)
    }

    pub fn validate(&self) -> Result<(), RunnerError> {
        if self.concurrency == 0 {
            return Err(RunnerError::InvalidConcurrency(0));
        }

        if self.pool_size() == 0 {
            return Err(RunnerError::Configuration(
                "Pool size must be greater than 0".to_string(),
            ));
        }

        if self.recycle_after == Some(0) {
            return Err(RunnerError::Configuration(
                "recycle_after must be greater than 0".to_string(),
            ));
        }

        if self.navigation_timeout_ms == 0 {
            return Err(RunnerError::Configuration(
                "Navigation timeout must be greater than 0".to_string(),
            ));
        }

        if self.viewports.is_empty() {
            return Err(RunnerError::Configuration(
                "At least one viewport is required".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for viewport in &self.viewports {
            if viewport.width == 0 || viewport.height == 0 {
                return Err(RunnerError::Configuration(format!(
                    "Viewport '{}' dimensions must be greater than 0",
                    viewport.name
                )));
            }
            if !names.insert(viewport.name.as_str()) {
                return Err(RunnerError::Configuration(format!(
                    "Duplicate viewport name '{}'",
                    viewport.name
                )));
            }
        }

        for page in &self.pages {
            for name in page.viewports.iter().flatten() {
                if !names.contains(name.as_str()) {
                    return Err(RunnerError::Configuration(format!(
                        "Page '{}' references unknown viewport '{}'",
                        page.path, name
                    )));
                }
            }
        }

        Url::parse(&self.base_url)?;

        Ok(())
    }
}

/// Browser viewport a page is captured at
///
/// # Examples
///
/// ```rust
/// use screenshot_runner::Viewport;
///
/// let mobile = Viewport {
///     name: "mobile".to_string(),
///     width: 375,
///     height: 667,
///     device_scale_factor: 2.0,
///     mobile: true,
/// };
/// assert!(mobile.mobile);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Viewport {
    /// Name used in file names, failure records and page overrides
    pub name: String,

    /// Viewport width in pixels (default: 1920)
    pub width: u32,

    /// Viewport height in pixels (default: 1080)
    pub height: u32,

    /// Device pixel ratio for high-DPI displays (default: 1.0)
    #[serde(default = "default_scale_factor")]
    pub device_scale_factor: f64,

    /// Whether to emulate mobile device (default: false)
    #[serde(default)]
    pub mobile: bool,
}

fn default_scale_factor() -> f64 {
    1.0
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            name: "desktop".to_string(),
            width: 1920,
            height: 1080,
            device_scale_factor: 1.0,
            mobile: false,
        }
    }
}

/// How a single screenshot is taken once the page is ready
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureOptions {
    /// Capture the whole scrollable page instead of the viewport
    pub full_page: bool,

    /// Extra settle time after navigation and the hook, in milliseconds
    pub wait_ms: Option<u64>,

    /// Capture only the first element matching this CSS selector
    pub selector: Option<String>,
}

impl CaptureOptions {
    pub fn wait(&self) -> Option<Duration> {
        self.wait_ms.map(Duration::from_millis)
    }
}

/// Settings for one page path
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PageOverride {
    pub path: String,

    /// Names of the viewports this page is captured at (default: all)
    pub viewports: Option<Vec<String>>,

    /// Script evaluated in the page after navigation, before capture
    pub hook: Option<String>,

    /// Replaces the global capture options for this page
    pub capture: Option<CaptureOptions>,
}

/// Supported output image formats for screenshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Png,
    Jpeg,
    Webp,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Webp => "webp",
        }
    }
}

/// Generate Chrome command-line arguments based on configuration
pub fn get_chrome_args(config: &Config) -> Vec<String> {
    let widest = config
        .viewports
        .iter()
        .max_by_key(|viewport| viewport.width)
        .cloned()
        .unwrap_or_default();

    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--hide-scrollbars".to_string(),
        "--font-render-hinting=none".to_string(),
        format!("--window-size={},{}", widest.width, widest.height),
        format!(
            "--user-data-dir=/tmp/screenshot-runner-{}",
            std::process::id()
        ),
    ];

    if let Some(user_agent) = &config.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}

pub fn create_browser_config(
    config: &Config,
) -> Result<chromiumoxide::browser::BrowserConfig, RunnerError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder().args(get_chrome_args(config));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(RunnerError::BrowserLaunch)
}
