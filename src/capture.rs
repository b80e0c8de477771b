//! The per-task capture pipeline
//!
//! [`CaptureWork`] is what the scheduler runs for every task once it holds a
//! tab. [`PageCapture`] is the Chrome implementation: size the viewport,
//! navigate, run the pre-capture hook, take the screenshot and write it out.

use crate::{BrowserTab, CaptureError, CaptureTask, Config, OutputFormat, Viewport};
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::{Page, ScreenshotParams};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::debug;

/// Work performed for one task on one checked-out resource.
///
/// `is_retry` is true on the single second attempt the scheduler makes after
/// a transient failure.
#[async_trait]
pub trait CaptureWork<R: Send>: Send + Sync + 'static {
    async fn capture(&self, resource: &mut R, task: &CaptureTask, is_retry: bool) -> Result<(), CaptureError>;
}

/// Captures pages in Chrome and writes the images to the output directory.
#[derive(Debug, Clone)]
pub struct PageCapture {
    output_dir: PathBuf,
    format: OutputFormat,
    navigation_timeout: Duration,
}

impl PageCapture {
    pub fn new(config: &Config) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            format: config.output_format,
            navigation_timeout: config.navigation_timeout(),
        }
    }

    pub fn output_path(&self, task: &CaptureTask) -> PathBuf {
        self.output_dir.join(screenshot_file_name(task, self.format))
    }

    async fn set_viewport(&self, page: &Page, viewport: &Viewport) -> Result<(), CaptureError> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width)
            .height(viewport.height)
            .device_scale_factor(viewport.device_scale_factor)
            .mobile(viewport.mobile)
            .build()
            .map_err(CaptureError::Protocol)?;

        page.execute(params).await?;
        Ok(())
    }

    async fn navigate(&self, page: &Page, url: &str) -> Result<(), CaptureError> {
        match timeout(self.navigation_timeout, page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(CdpError::Timeout)) | Err(_) => Err(CaptureError::Timeout(self.navigation_timeout)),
            Ok(Err(e)) => Err(CaptureError::Navigation(e.to_string())),
        }
    }

    async fn screenshot(&self, page: &Page, task: &CaptureTask) -> Result<Vec<u8>, CaptureError> {
        if let Some(selector) = &task.options.selector {
            let element = page
                .find_element(selector.as_str())
                .await
                .map_err(|e| CaptureError::ElementNotFound(format!("{selector}: {e}")))?;

            return Ok(element.screenshot(CaptureScreenshotFormat::Png).await?);
        }

        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(task.options.full_page)
            .build();

        Ok(page.screenshot(params).await?)
    }
}

#[async_trait]
impl CaptureWork<BrowserTab> for PageCapture {
    async fn capture(&self, tab: &mut BrowserTab, task: &CaptureTask, is_retry: bool) -> Result<(), CaptureError> {
        let page = tab.page();
        debug!(task = %task.label(), is_retry, "Capturing");

        self.set_viewport(page, &task.viewport).await?;
        self.navigate(page, &task.url).await?;

        if let Some(hook) = &task.hook {
            page.evaluate(hook.as_str())
                .await
                .map_err(|e| CaptureError::Hook(e.to_string()))?;
        }

        if let Some(wait) = task.options.wait() {
            sleep(wait).await;
        }

        let png = self.screenshot(page, task).await?;
        let data = encode_screenshot(png, self.format)?;

        let path = self.output_path(task);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &data).await?;
        debug!(path = %path.display(), bytes = data.len(), "Screenshot saved");

        Ok(())
    }
}

/// `<page>__<viewport>.<ext>`, see [`CaptureTask::file_stem`].
pub fn screenshot_file_name(task: &CaptureTask, format: OutputFormat) -> String {
    format!("{}.{}", task.file_stem(), format.extension())
}

/// Re-encodes a PNG capture into the configured output format.
pub fn encode_screenshot(png_data: Vec<u8>, format: OutputFormat) -> Result<Vec<u8>, CaptureError> {
    let image_format = match format {
        OutputFormat::Png => return Ok(png_data),
        OutputFormat::Jpeg => image::ImageFormat::Jpeg,
        OutputFormat::Webp => image::ImageFormat::WebP,
    };

    let img = image::load_from_memory(&png_data)?;
    // JPEG has no alpha channel
    let img = match format {
        OutputFormat::Jpeg => image::DynamicImage::ImageRgb8(img.to_rgb8()),
        _ => img,
    };

    let mut encoded = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut encoded), image_format)?;
    Ok(encoded)
}
