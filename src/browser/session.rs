//! One Chrome process per scheduler group.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::fetcher::{BrowserFetcher, BrowserFetcherOptions};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{BrowserError, RetryPolicy};
use crate::scheduler::SessionProvider;

/// Viewport before the first per-graph override.
const DEFAULT_VIEWPORT_WIDTH: u32 = 1920;
const DEFAULT_VIEWPORT_HEIGHT: u32 = 1080;

/// Upper bound on a single page navigation.
const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on one full-page screenshot.
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(30);

/// Socket-level timeout for individual CDP requests.
const CDP_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Pause after closing Chrome so the process can release its profile dir
/// before a restart reuses it.
const SHUTDOWN_SETTLE: Duration = Duration::from_millis(500);

/// A live headless Chrome with one page, owned by a single group task.
pub struct BrowserSession {
    browser: Browser,
    handler_task: JoinHandle<()>,
    page: Page,
    started: Instant,
}

impl BrowserSession {
    /// Directory where the fetcher caches downloaded Chrome binaries.
    fn fetcher_cache_dir() -> PathBuf {
        let base = std::env::var("HOME").map_or_else(|_| PathBuf::from("/tmp"), PathBuf::from);
        base.join(".cache/watchboard/chromium")
    }

    fn browser_config(
        instance: &str,
        executable: Option<&Path>,
    ) -> Result<BrowserConfig, BrowserError> {
        let user_data_dir = format!("/tmp/watchboard-chrome-{instance}");

        // Remove a stale profile left by a crashed run to avoid Chrome's
        // SingletonLock refusing the launch.
        let _ = std::fs::remove_dir_all(&user_data_dir);

        let mut builder = BrowserConfig::builder()
            .new_headless_mode()
            .no_sandbox()
            .request_timeout(CDP_REQUEST_TIMEOUT)
            .arg("--disable-gpu")
            .arg("--disable-software-rasterizer")
            .user_data_dir(&user_data_dir)
            .viewport(chromiumoxide::handler::viewport::Viewport {
                width: DEFAULT_VIEWPORT_WIDTH,
                height: DEFAULT_VIEWPORT_HEIGHT,
                device_scale_factor: Some(1.0),
                emulating_mobile: false,
                is_landscape: true,
                has_touch: false,
            });

        if let Some(path) = executable {
            builder = builder.chrome_executable(path);
        }

        builder.build().map_err(BrowserError::LaunchFailed)
    }

    /// Launch Chrome and open a blank page.
    ///
    /// Tries system Chrome first. On failure, downloads a compatible
    /// Chromium via the fetcher and caches it for future runs.
    pub async fn launch(instance: &str) -> Result<Self, BrowserError> {
        match Self::launch_with(instance, None).await {
            Ok(session) => return Ok(session),
            Err(e) => {
                info!("System Chrome not available ({e}), trying fetcher...");
            }
        }

        let cache_dir = Self::fetcher_cache_dir();
        std::fs::create_dir_all(&cache_dir).map_err(|e| {
            BrowserError::LaunchFailed(format!(
                "failed to create cache dir {}: {e}",
                cache_dir.display()
            ))
        })?;

        let fetcher_opts = BrowserFetcherOptions::builder()
            .with_path(&cache_dir)
            .build()
            .map_err(|e| BrowserError::LaunchFailed(format!("fetcher config error: {e}")))?;

        let fetcher = BrowserFetcher::new(fetcher_opts);
        let info = fetcher
            .fetch()
            .await
            .map_err(|e| BrowserError::LaunchFailed(format!("Chrome download failed: {e:#}")))?;

        info!("Using Chrome at {:?}", info.executable_path);
        Self::launch_with(instance, Some(&info.executable_path)).await
    }

    async fn launch_with(instance: &str, executable: Option<&Path>) -> Result<Self, BrowserError> {
        let config = Self::browser_config(instance, executable)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("CDP handler error: {e}");
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        info!(instance, "Browser session started");

        Ok(Self {
            browser,
            handler_task,
            page,
            started: Instant::now(),
        })
    }

    /// How long this Chrome process has been alive.
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    /// Navigate the page, bounded by [`NAVIGATION_TIMEOUT`].
    pub async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        let nav = async {
            self.page.goto(url).await?;
            self.page.wait_for_navigation().await?;
            Ok::<_, chromiumoxide::error::CdpError>(())
        };
        match tokio::time::timeout(NAVIGATION_TIMEOUT, nav).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BrowserError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(BrowserError::Navigation {
                url: url.to_string(),
                reason: format!("timed out after {NAVIGATION_TIMEOUT:?}"),
            }),
        }
    }

    /// Resize the emulated viewport to a graph's declared dimensions.
    pub async fn set_viewport(&self, width: u32, height: u32) -> Result<(), BrowserError> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(i64::from(width))
            .height(i64::from(height))
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(BrowserError::OperationFailed)?;
        self.page.execute(params).await?;
        Ok(())
    }

    /// Capture the full page as PNG bytes.
    pub async fn screenshot_png(&self) -> Result<Vec<u8>, BrowserError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        match tokio::time::timeout(CAPTURE_TIMEOUT, self.page.screenshot(params)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(BrowserError::OperationFailed(format!(
                "screenshot timed out after {CAPTURE_TIMEOUT:?}"
            ))),
        }
    }

    /// Close Chrome. Best effort: a wedged process is abandoned rather than
    /// blocking the group's restart.
    pub async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("Browser close failed: {e}");
        }
        if let Err(e) = self.browser.wait().await {
            warn!("Browser did not exit cleanly: {e}");
        }
        self.handler_task.abort();
        tokio::time::sleep(SHUTDOWN_SETTLE).await;
    }
}

/// Launches real Chrome sessions for one browser instance name, retrying
/// per the configured policy until cancelled.
pub struct ChromiumSessions {
    instance: String,
    retry: RetryPolicy,
}

impl ChromiumSessions {
    pub fn new(instance: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            instance: instance.into(),
            retry,
        }
    }
}

#[async_trait]
impl SessionProvider for ChromiumSessions {
    type Session = BrowserSession;

    async fn start(&self, cancel: &CancellationToken) -> Result<BrowserSession, BrowserError> {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(BrowserError::Cancelled);
            }

            match BrowserSession::launch(&self.instance).await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    attempt += 1;
                    if self.retry.exhausted(attempt) {
                        warn!(instance = %self.instance, attempt, "Giving up on browser launch: {e}");
                        return Err(BrowserError::RetriesExhausted(attempt));
                    }
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        instance = %self.instance,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Browser launch failed, retrying: {e}"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Err(BrowserError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn stop(&self, session: BrowserSession) {
        info!(instance = %self.instance, age_secs = session.age().as_secs(), "Stopping browser session");
        session.close().await;
    }
}
