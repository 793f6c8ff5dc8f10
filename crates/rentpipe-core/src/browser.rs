use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Response bodies shorter than this are treated as an anti-bot bootstrap
/// page rather than real listing content.
pub const BLOCK_BYTE_THRESHOLD: usize = 10_000;

/// Consecutive blocks before the current search area is abandoned.
pub const MAX_CONSECUTIVE_BLOCKS: u32 = 3;

/// Detail-page fetches between automatic profile resets.
pub const DEFAULT_RESET_INTERVAL: u32 = 30;

#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("failed to reset profile directory {path}: {source}")]
    ProfileReset {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("search area abandoned after {0} consecutive anti-bot blocks")]
    AreaAbandoned(u32),
}

/// Outcome of a single `goto`, distinguishing a clean load from a detected
/// anti-bot block so the caller can decide whether to retry or abandon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationOutcome {
    Loaded,
    Blocked,
    TimedOut,
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn open(&mut self, profile_path: &Path) -> Result<(), BrowserError>;
    async fn goto(&mut self, url: &str, settle_ms: u64) -> Result<NavigationOutcome, BrowserError>;
    async fn scroll(&mut self, px: i64) -> Result<(), BrowserError>;
    async fn wait(&mut self, ms: u64) -> Result<(), BrowserError>;
    async fn page_source(&mut self) -> Result<String, BrowserError>;
    async fn reset_profile(&mut self) -> Result<(), BrowserError>;
    async fn close(&mut self) -> Result<(), BrowserError>;
}

/// Real `BrowserDriver` backed by `chromiumoxide`. Exclusive to the
/// orchestrator's task during LIST/DETAIL; never touched from the SCORE or
/// COMMUTE worker pools.
pub struct ChromiumBrowserDriver {
    headless: bool,
    profile_path: Option<PathBuf>,
    browser: Option<Browser>,
    handler: Option<tokio::task::JoinHandle<()>>,
    page: Option<chromiumoxide::Page>,
    consecutive_blocks: u32,
    fetches_since_reset: u32,
    reset_interval: u32,
}

impl ChromiumBrowserDriver {
    pub fn new(headless: bool) -> Self {
        Self {
            headless,
            profile_path: None,
            browser: None,
            handler: None,
            page: None,
            consecutive_blocks: 0,
            fetches_since_reset: 0,
            reset_interval: DEFAULT_RESET_INTERVAL,
        }
    }

    pub fn with_reset_interval(mut self, reset_interval: u32) -> Self {
        self.reset_interval = reset_interval;
        self
    }

    async fn launch(&mut self, profile_path: &Path) -> Result<(), BrowserError> {
        std::fs::create_dir_all(profile_path).map_err(|source| BrowserError::ProfileReset {
            path: profile_path.to_path_buf(),
            source,
        })?;

        let mut config_builder =
            BrowserConfigBuilder::default().user_data_dir(profile_path);
        config_builder = if self.headless {
            config_builder.headless_mode(HeadlessMode::default())
        } else {
            config_builder.with_head()
        };
        let config = config_builder.build().map_err(BrowserError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;

        let join = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        self.browser = Some(browser);
        self.handler = Some(join);
        self.page = None;
        self.profile_path = Some(profile_path.to_path_buf());
        Ok(())
    }
}

#[async_trait]
impl BrowserDriver for ChromiumBrowserDriver {
    async fn open(&mut self, profile_path: &Path) -> Result<(), BrowserError> {
        self.launch(profile_path).await
    }

    async fn goto(&mut self, url: &str, settle_ms: u64) -> Result<NavigationOutcome, BrowserError> {
        let browser = self.browser.as_ref().ok_or_else(|| {
            BrowserError::Navigation("goto called before open".to_string())
        })?;

        let page = if let Some(page) = self.page.take() {
            page
        } else {
            browser
                .new_page("about:blank")
                .await
                .map_err(|err| BrowserError::Navigation(err.to_string()))?
        };

        if let Err(err) = page.goto(url).await {
            self.page = Some(page);
            return Err(BrowserError::Navigation(err.to_string()));
        }

        // DOM-content-only wait: portals stream long-tail resources and a
        // full-load wait would time out on every request.
        let waited = tokio::time::timeout(
            Duration::from_millis(settle_ms),
            page.wait_for_navigation(),
        )
        .await;

        if waited.is_err() {
            self.page = Some(page);
            return Ok(NavigationOutcome::TimedOut);
        }

        let html = page.content().await.unwrap_or_default();
        self.page = Some(page);
        self.fetches_since_reset += 1;

        if html.len() < BLOCK_BYTE_THRESHOLD {
            self.consecutive_blocks += 1;
            if self.consecutive_blocks >= MAX_CONSECUTIVE_BLOCKS {
                return Err(BrowserError::AreaAbandoned(self.consecutive_blocks));
            }
            return Ok(NavigationOutcome::Blocked);
        }

        self.consecutive_blocks = 0;
        if self.fetches_since_reset >= self.reset_interval {
            debug!(fetches = self.fetches_since_reset, "profile reset interval reached");
        }
        Ok(NavigationOutcome::Loaded)
    }

    async fn scroll(&mut self, px: i64) -> Result<(), BrowserError> {
        if let Some(page) = &self.page {
            let script = format!("window.scrollBy(0, {px});");
            page.evaluate(script)
                .await
                .map_err(|err| BrowserError::Navigation(err.to_string()))?;
        }
        Ok(())
    }

    async fn wait(&mut self, ms: u64) -> Result<(), BrowserError> {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(())
    }

    async fn page_source(&mut self) -> Result<String, BrowserError> {
        let page = self
            .page
            .as_ref()
            .ok_or_else(|| BrowserError::Navigation("no page loaded".to_string()))?;
        page.content()
            .await
            .map_err(|err| BrowserError::Navigation(err.to_string()))
    }

    async fn reset_profile(&mut self) -> Result<(), BrowserError> {
        let Some(profile_path) = self.profile_path.clone() else {
            return Ok(());
        };

        if let Some(browser) = &mut self.browser {
            let _ = browser.close().await;
        }
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }

        if profile_path.exists() {
            std::fs::remove_dir_all(&profile_path).map_err(|source| BrowserError::ProfileReset {
                path: profile_path.clone(),
                source,
            })?;
        }

        self.consecutive_blocks = 0;
        self.fetches_since_reset = 0;
        warn!(path = %profile_path.display(), "browser profile reset");
        self.launch(&profile_path).await
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        if let Some(browser) = &mut self.browser {
            let _ = browser.close().await;
        }
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }
        self.browser = None;
        self.page = None;
        Ok(())
    }
}

/// Test double replaying canned HTML per URL, grounded on how
/// `services/cli` substitutes in-memory fakes for real backends.
#[derive(Debug, Default)]
pub struct RecordedBrowserDriver {
    pub pages: std::collections::HashMap<String, String>,
    pub block_urls: std::collections::HashSet<String>,
    current: Option<String>,
    consecutive_blocks: u32,
    pub reset_count: u32,
    pub fetch_count: u32,
}

impl RecordedBrowserDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.pages.insert(url.into(), html.into());
        self
    }

    pub fn block_url(mut self, url: impl Into<String>) -> Self {
        self.block_urls.insert(url.into());
        self
    }
}

#[async_trait]
impl BrowserDriver for RecordedBrowserDriver {
    async fn open(&mut self, _profile_path: &Path) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn goto(&mut self, url: &str, _settle_ms: u64) -> Result<NavigationOutcome, BrowserError> {
        self.fetch_count += 1;
        self.current = Some(url.to_string());

        if self.block_urls.contains(url) {
            self.consecutive_blocks += 1;
            if self.consecutive_blocks >= MAX_CONSECUTIVE_BLOCKS {
                return Err(BrowserError::AreaAbandoned(self.consecutive_blocks));
            }
            return Ok(NavigationOutcome::Blocked);
        }

        self.consecutive_blocks = 0;
        if self.pages.contains_key(url) {
            Ok(NavigationOutcome::Loaded)
        } else {
            Ok(NavigationOutcome::TimedOut)
        }
    }

    async fn scroll(&mut self, _px: i64) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn wait(&mut self, _ms: u64) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn page_source(&mut self) -> Result<String, BrowserError> {
        let url = self
            .current
            .as_ref()
            .ok_or_else(|| BrowserError::Navigation("no page loaded".to_string()))?;
        Ok(self.pages.get(url).cloned().unwrap_or_default())
    }

    async fn reset_profile(&mut self) -> Result<(), BrowserError> {
        self.reset_count += 1;
        self.consecutive_blocks = 0;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recorded_driver_returns_loaded_for_known_page() {
        let mut driver = RecordedBrowserDriver::new().with_page("https://a", "<html>content</html>");
        let outcome = driver.goto("https://a", 1_000).await.unwrap();
        assert_eq!(outcome, NavigationOutcome::Loaded);
        assert_eq!(driver.page_source().await.unwrap(), "<html>content</html>");
    }

    #[tokio::test]
    async fn recorded_driver_reports_blocked() {
        let mut driver = RecordedBrowserDriver::new().block_url("https://blocked");
        let outcome = driver.goto("https://blocked", 1_000).await.unwrap();
        assert_eq!(outcome, NavigationOutcome::Blocked);
    }

    #[tokio::test]
    async fn three_consecutive_blocks_abandon_area() {
        let mut driver = RecordedBrowserDriver::new().block_url("https://blocked");
        driver.goto("https://blocked", 1_000).await.unwrap();
        driver.goto("https://blocked", 1_000).await.unwrap();
        let result = driver.goto("https://blocked", 1_000).await;
        assert!(matches!(result, Err(BrowserError::AreaAbandoned(3))));
    }

    #[tokio::test]
    async fn reset_profile_clears_block_counter() {
        let mut driver = RecordedBrowserDriver::new().block_url("https://blocked");
        driver.goto("https://blocked", 1_000).await.unwrap();
        driver.goto("https://blocked", 1_000).await.unwrap();
        driver.reset_profile().await.unwrap();
        assert_eq!(driver.reset_count, 1);
        let outcome = driver.goto("https://blocked", 1_000).await.unwrap();
        assert_eq!(outcome, NavigationOutcome::Blocked);
    }
}
