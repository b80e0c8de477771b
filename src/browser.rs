//! Chrome tabs as pooled resources
//!
//! One headless Chrome process is launched per run; the pool hands out tabs
//! opened on it. The Chrome DevTools Protocol handler has to be polled for
//! the browser to make progress, so it runs on its own task for the life of
//! the factory.

use crate::{create_browser_config, CaptureError, Config, Resource, ResourceFactory, RunnerError};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::network::ClearBrowserCookiesParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Neutral page a tab sits on between tasks.
pub const BLANK_PAGE: &str = "about:blank";

const CLEAR_STORAGE: &str =
    "(() => { try { localStorage.clear(); sessionStorage.clear(); } catch (e) {} })()";

/// A single browser tab.
#[derive(Debug)]
pub struct BrowserTab {
    page: Page,
}

impl BrowserTab {
    pub fn page(&self) -> &Page {
        &self.page
    }
}

#[async_trait]
impl Resource for BrowserTab {
    async fn reset(&mut self) -> Result<(), CaptureError> {
        self.page.execute(ClearBrowserCookiesParams::default()).await?;
        self.page.evaluate(CLEAR_STORAGE).await?;
        self.page.goto(BLANK_PAGE).await?;
        Ok(())
    }

    async fn close(self) -> Result<(), CaptureError> {
        self.page.close().await?;
        Ok(())
    }
}

/// Opens tabs on one shared Chrome process.
pub struct TabFactory {
    browser: Mutex<Browser>,
    handler: JoinHandle<()>,
}

impl TabFactory {
    pub async fn launch(config: &Config) -> Result<Self, RunnerError> {
        let browser_config = create_browser_config(config)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| RunnerError::BrowserLaunch(e.to_string()))?;

        // Individual protocol errors (e.g. unknown events) are not fatal to
        // the connection, so keep polling until the stream ends.
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Handler error: {}", e);
                }
            }
            info!("Handler stream ended");
        });

        info!("Chrome launched");

        Ok(Self {
            browser: Mutex::new(browser),
            handler,
        })
    }

    pub async fn shutdown(&self) {
        info!("Shutting down Chrome...");
        let mut browser = self.browser.lock().await;

        if let Err(e) = browser.close().await {
            debug!("Browser close failed: {}", e);
        }

        // reap the child so no zombie Chrome process is left behind
        match browser.wait().await {
            Ok(status) => debug!(?status, "Chrome exited"),
            Err(e) => debug!("Failed to wait for Chrome: {}", e),
        }

        self.handler.abort();
    }
}

#[async_trait]
impl ResourceFactory for TabFactory {
    type Resource = BrowserTab;

    async fn create(&self) -> Result<BrowserTab, CaptureError> {
        if self.handler.is_finished() {
            return Err(CaptureError::TargetClosed);
        }

        let page = self.browser.lock().await.new_page(BLANK_PAGE).await?;
        Ok(BrowserTab { page })
    }
}
