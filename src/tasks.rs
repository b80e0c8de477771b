//! Expansion of discovered pages into (page, viewport) capture tasks.

use crate::{flatten_path, CaptureOptions, Config, RunnerError, Viewport};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;
use url::Url;

/// One unit of capture work. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureTask {
    pub page: String,
    pub viewport: Viewport,
    pub hook: Option<String>,
    pub url: String,
    pub options: CaptureOptions,
}

impl CaptureTask {
    /// Short label used in progress and log lines.
    pub fn label(&self) -> String {
        format!("{} @ {}", self.page, self.viewport.name)
    }

    /// Output file name without extension: `<page>__<viewport>`, with the
    /// page path flattened into one component.
    pub fn file_stem(&self) -> String {
        format!("{}__{}", flatten_path(&self.page), flatten_path(&self.viewport.name))
    }
}

/// Builds the task list: every page, in order, crossed with the viewports
/// resolved for it.
///
/// A page override narrows the viewports and supplies the hook and capture
/// options; pages without one use every configured viewport and the global
/// options. A page listed twice is captured once. Two different pages whose
/// screenshots would land in the same file are a configuration error.
/// This has no side effects and does not depend on execution order.
pub fn build_tasks(pages: &[String], config: &Config) -> Result<Vec<CaptureTask>, RunnerError> {
    let base = Url::parse(&config.base_url)?;
    let mut tasks = Vec::new();
    let mut owners: HashMap<String, &str> = HashMap::new();

    for page in pages {
        let stem = flatten_path(page);
        match owners.get(stem.as_str()) {
            Some(&owner) if owner == page.as_str() => {
                debug!(page = %page, "Skipping duplicate page");
                continue;
            }
            Some(&owner) => {
                return Err(RunnerError::Configuration(format!(
                    "Pages '{owner}' and '{page}' would both be saved as '{stem}'"
                )));
            }
            None => {
                owners.insert(stem, page);
            }
        }

        let page_override = config.page_override(page);
        let viewports = resolve_viewports(page, config)?;
        let url = base.join(page)?.to_string();
        let hook = page_override.and_then(|o| o.hook.clone());
        let options = page_override
            .and_then(|o| o.capture.clone())
            .unwrap_or_else(|| config.capture.clone());

        for viewport in viewports {
            tasks.push(CaptureTask {
                page: page.clone(),
                viewport,
                hook: hook.clone(),
                url: url.clone(),
                options: options.clone(),
            });
        }
    }

    Ok(tasks)
}

fn resolve_viewports(page: &str, config: &Config) -> Result<Vec<Viewport>, RunnerError> {
    let names = match config.page_override(page).and_then(|o| o.viewports.as_ref()) {
        Some(names) => names,
        None => return Ok(config.viewports.clone()),
    };

    names
        .iter()
        .map(|name| {
            config.viewport(name).cloned().ok_or_else(|| {
                RunnerError::Configuration(format!(
                    "Page '{page}' references unknown viewport '{name}'"
                ))
            })
        })
        .collect()
}

/// Reads page paths from a file, one per line. Blank lines and lines
/// starting with `#` are skipped.
pub async fn read_pages_from_file(path: &Path) -> Result<Vec<String>, RunnerError> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(parse_pages(&content))
}

pub fn parse_pages(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.to_string())
        .collect()
}
