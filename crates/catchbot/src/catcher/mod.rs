//! Connection to the live crash page and single-shot extraction.
//!
//! [`CrashPage`] is the seam the poll loop and the session coordinator
//! work against; [`CrashCatcher`] implements it over a chromiumoxide
//! connection to the browser's debug endpoint.

pub mod dom;

use crate::config::CatchConfig;
use crate::types::{CatchError, CatchResult, CrashResult};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Time given to chromiumoxide to attach to existing tabs after discovery.
const TARGET_ATTACH_SETTLE: Duration = Duration::from_millis(300);

/// Extra allowance on top of the in-page deadline for the CDP round trip.
const BANNER_WAIT_SLACK: Duration = Duration::from_secs(2);

/// A live page that shows crash results.
#[async_trait]
pub trait CrashPage: Send + Sync {
    /// Attach to the browser and pick the target tab.
    async fn connect(&self) -> CatchResult<()>;
    /// Wait until the results banner is visible.
    async fn wait_for_banner(&self, timeout: Duration) -> CatchResult<()>;
    /// The most recent result; strict about malformed data.
    async fn latest(&self) -> CatchResult<CrashResult>;
    /// All well-formed results currently shown, oldest first.
    async fn all(&self) -> CatchResult<Vec<CrashResult>>;
    /// Account balance shown in the page header.
    async fn balance(&self) -> CatchResult<f64>;
    /// Release the connection. Safe to call when not connected.
    async fn disconnect(&self);
    /// Whether a connection is currently held.
    async fn is_connected(&self) -> bool;
}

/// Whether `url` contains every match token.
pub fn url_matches(url: &str, tokens: &[String]) -> bool {
    !tokens.is_empty() && tokens.iter().all(|t| url.contains(t.as_str()))
}

/// In-page promise resolving to `true` once the banner is visible, or
/// `false` when the deadline passes.
fn banner_visible_script(timeout_ms: u64) -> String {
    format!(
        r#"new Promise((resolve) => {{
  const deadline = Date.now() + {timeout_ms};
  const visible = () => {{
    const el = document.querySelector({selector:?});
    if (!el) return false;
    const style = window.getComputedStyle(el);
    if (style.display === 'none' || style.visibility === 'hidden') return false;
    const rect = el.getBoundingClientRect();
    return rect.width > 0 && rect.height > 0;
  }};
  const check = () => {{
    if (visible()) return resolve(true);
    if (Date.now() >= deadline) return resolve(false);
    setTimeout(check, 100);
  }};
  check();
}})"#,
        selector = dom::BANNER_SELECTOR,
    )
}

fn banner_html_script() -> String {
    format!(
        "(() => {{ const el = document.querySelector({:?}); return el ? el.outerHTML : ''; }})()",
        dom::BANNER_SELECTOR
    )
}

struct Connection {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
}

impl Connection {
    async fn evaluate<T: DeserializeOwned>(&self, script: String) -> CatchResult<T> {
        let params = EvaluateParams::builder()
            .expression(script)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(CatchError::Evaluation)?;
        let result = self.page.evaluate_expression(params).await?;
        result
            .into_value::<T>()
            .map_err(|e| CatchError::Evaluation(format!("failed to convert result: {e}")))
    }

    async fn wait_for_banner(&self, timeout: Duration) -> CatchResult<()> {
        let timeout_ms = timeout.as_millis() as u64;
        let wait = self.evaluate::<bool>(banner_visible_script(timeout_ms));
        match tokio::time::timeout(timeout + BANNER_WAIT_SLACK, wait).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) | Err(_) => Err(CatchError::BannerTimeout { timeout_ms }),
            Ok(Err(e)) => Err(e),
        }
    }

    async fn banner_snapshot(&self) -> CatchResult<dom::BannerSnapshot> {
        // An absent banner comes back as an empty string; CDP reports a
        // by-value null as "no value".
        let html: String = self.evaluate(banner_html_script()).await?;
        Ok(if html.is_empty() {
            dom::BannerSnapshot { items: None }
        } else {
            dom::parse_banner(&html)
        })
    }

    fn close(self) {
        drop(self.page);
        drop(self.browser);
        self.handler.abort();
    }
}

/// chromiumoxide-backed [`CrashPage`].
pub struct CrashCatcher {
    port: u16,
    endpoint: String,
    page_match: Vec<String>,
    banner_timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

impl CrashCatcher {
    pub fn new(config: &CatchConfig) -> Self {
        Self {
            port: config.debug_port,
            endpoint: config.endpoint_url(),
            page_match: config.page_match.clone(),
            banner_timeout: config.banner_timeout,
            conn: Mutex::new(None),
        }
    }

    async fn open(&self) -> CatchResult<Connection> {
        let (mut browser, mut handler) = Browser::connect(self.endpoint.clone())
            .await
            .map_err(|e| CatchError::EndpointUnreachable {
                port: self.port,
                reason: e.to_string(),
            })?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "CDP handler event error");
                }
            }
        });

        let page = match self.select_page(&mut browser).await {
            Ok(page) => page,
            Err(e) => {
                handler.abort();
                return Err(e);
            }
        };

        Ok(Connection {
            browser,
            page,
            handler,
        })
    }

    /// The first tab matching every URL token, else the first tab, else a new blank one.
    async fn select_page(&self, browser: &mut Browser) -> CatchResult<Page> {
        if let Err(e) = browser.fetch_targets().await {
            debug!(error = %e, "target discovery failed");
        }
        tokio::time::sleep(TARGET_ATTACH_SETTLE).await;

        let mut first = None;
        for page in browser.pages().await? {
            let url = page
                .url()
                .await
                .ok()
                .flatten()
                .map(|u| u.to_string())
                .unwrap_or_default();
            if url_matches(&url, &self.page_match) {
                debug!(%url, "found target page");
                return Ok(page);
            }
            if first.is_none() {
                first = Some(page);
            }
        }

        warn!(
            tokens = ?self.page_match,
            "no target page found, using first available page"
        );
        match first {
            Some(page) => Ok(page),
            None => Ok(browser.new_page("about:blank").await?),
        }
    }
}

#[async_trait]
impl CrashPage for CrashCatcher {
    async fn connect(&self) -> CatchResult<()> {
        let mut guard = self.conn.lock().await;
        if let Some(old) = guard.take() {
            old.close();
        }
        match self.open().await {
            Ok(conn) => {
                *guard = Some(conn);
                info!(endpoint = %self.endpoint, "connected to browser");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "failed to connect to browser");
                Err(e)
            }
        }
    }

    async fn wait_for_banner(&self, timeout: Duration) -> CatchResult<()> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(CatchError::NotConnected)?;
        conn.wait_for_banner(timeout).await
    }

    async fn latest(&self) -> CatchResult<CrashResult> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(CatchError::NotConnected)?;
        conn.wait_for_banner(self.banner_timeout).await?;
        conn.banner_snapshot().await?.latest()
    }

    async fn all(&self) -> CatchResult<Vec<CrashResult>> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(CatchError::NotConnected)?;
        conn.wait_for_banner(self.banner_timeout).await?;
        Ok(conn.banner_snapshot().await?.all())
    }

    async fn balance(&self) -> CatchResult<f64> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(CatchError::NotConnected)?;
        let html = conn.page.content().await?;
        dom::parse_balance(&html).ok_or(CatchError::BalanceUnavailable)
    }

    async fn disconnect(&self) {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.close();
            info!("disconnected from browser");
        }
    }

    async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }
}
