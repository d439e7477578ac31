//! Headless browser control.
//!
//! `BrowserDriver` is the seam the orchestrator drives; `CdpBrowser` is the
//! real implementation speaking the Chrome DevTools Protocol. Firefox is
//! driven through its CDP-compatible remote-debugging endpoint with the
//! same client. Every operation except launch is best-effort: the
//! orchestrator treats failures as degraded outcomes, not fatal ones,
//! unless the process itself has died.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::{
    Bounds, GetWindowForTargetParams, SetWindowBoundsParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, CreateIsolatedWorldParams, FrameTree, GetFrameTreeParams,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures_util::StreamExt;
use log::{debug, info, warn};
use serde::Deserialize;

use crate::configuration::types::BrowserKind;
use crate::error_handling::types::BrowserError;

/// Deepest frame level visited by the frame walk.
const FRAME_DEPTH_LIMIT: usize = 3;
/// Max total frames visited by the frame walk.
const FRAME_TOTAL_LIMIT: usize = 20;

pub const BROWSER_WINDOW: (u32, u32) = (1024, 800);

const OUTER_HTML_SCRIPT: &str = "document.documentElement.outerHTML";

// Scroll down in window-height jumps with a render pause at each position,
// then back to the top; returns how long the scrolling will take.
const SCROLL_SCRIPT: &str = r#"
    var delay=50,
        height=document.body.scrollHeight,
        jump=window.innerHeight,
        scrollTo=function(scrollY){ window.scrollTo(0, scrollY) },
        i=1;
    for(;i*jump<height;i++){
        setTimeout(scrollTo, i*delay, i*jump);
    }
    setTimeout(scrollTo, i*delay, 0);
    (i*delay)/1000;
"#;

const PAGE_SIZE_SCRIPT: &str = r#"
    (function() {
        var body = document.body;
        var html = document.documentElement;
        var height = Math.max(body.scrollHeight, body.offsetHeight,
                              html.clientHeight, html.scrollHeight, html.offsetHeight);
        var width = Math.max(body.scrollWidth, body.offsetWidth,
                             html.clientWidth, html.scrollWidth, html.offsetWidth);
        return {height: height, width: width};
    })()
"#;

/// One frame's URL and serialized DOM, as found during the frame walk.
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    pub url: String,
    pub html: String,
}

/// What the orchestrator needs to launch a browser for one capture.
#[derive(Debug, Clone)]
pub struct BrowserSpec {
    pub kind: BrowserKind,
    pub user_agent: String,
    pub proxy_address: String,
    /// Bound on quick DOM queries (current URL, page size), which should
    /// be instant on a loaded page.
    pub element_discovery_timeout: Duration,
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Page load; returns after the load event fires (callers bound it).
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;

    async fn current_url(&self) -> Result<String, BrowserError>;

    /// Post-parse DOM via an in-page script, falling back to the raw page
    /// content when script execution fails.
    async fn dom_snapshot(&self) -> Result<String, BrowserError>;

    /// Run a site-specific post-load script, discarding its value.
    async fn run_script(&self, script: &str) -> Result<(), BrowserError>;

    /// Depth-first visit of http(s) frames, bounded by depth and total
    /// count, tolerating frame-tree mutation mid-walk.
    async fn walk_frames(&self) -> Result<Vec<FrameSnapshot>, BrowserError>;

    /// Animated scroll to the bottom and back, waiting at most 1s.
    async fn scroll(&self) -> Result<(), BrowserError>;

    /// `(width, height)` of the page in pixels.
    async fn page_size(&self) -> Result<(u64, u64), BrowserError>;

    /// Full-page PNG. When `resize_to_page` is set the window is grown to
    /// the page dimensions first (Chrome needs this for full-page shots).
    async fn screenshot(&self, resize_to_page: bool) -> Result<Vec<u8>, BrowserError>;

    /// Whether the browser process is still with us.
    fn alive(&self) -> bool;

    async fn close(&self);
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, spec: &BrowserSpec) -> Result<Box<dyn BrowserDriver>, BrowserError>;
}

/// Launches real browsers over CDP.
pub struct CdpLauncher;

#[async_trait]
impl BrowserLauncher for CdpLauncher {
    async fn launch(&self, spec: &BrowserSpec) -> Result<Box<dyn BrowserDriver>, BrowserError> {
        Ok(Box::new(CdpBrowser::launch(spec).await?))
    }
}

pub struct CdpBrowser {
    browser: tokio::sync::Mutex<Browser>,
    page: Page,
    alive: Arc<AtomicBool>,
    handler_task: tokio::task::JoinHandle<()>,
    discovery_timeout: Duration,
}

impl CdpBrowser {
    pub async fn launch(spec: &BrowserSpec) -> Result<Self, BrowserError> {
        info!("Using browser: {:?}", spec.kind);
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .window_size(BROWSER_WINDOW.0, BROWSER_WINDOW.1)
            .arg(format!("--proxy-server={}", spec.proxy_address))
            // the proxy presents leaves signed by the capture CA
            .arg("--ignore-certificate-errors")
            .arg(format!("--user-agent={}", spec.user_agent))
            .arg("--disable-gpu")
            .arg("--hide-scrollbars");
        if spec.kind == BrowserKind::Firefox {
            builder = builder.chrome_executable("firefox");
        }
        let config = builder.build().map_err(BrowserError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;

        // the handler stream ends when the browser process goes away
        let alive = Arc::new(AtomicBool::new(true));
        let alive_flag = alive.clone();
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
            alive_flag.store(false, Ordering::Release);
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;

        Ok(Self {
            browser: tokio::sync::Mutex::new(browser),
            page,
            alive,
            handler_task,
            discovery_timeout: spec.element_discovery_timeout,
        })
    }

    async fn frame_html(&self, frame_id: chromiumoxide::cdp::browser_protocol::page::FrameId)
        -> Result<String, BrowserError> {
        let world = self
            .page
            .execute(
                CreateIsolatedWorldParams::builder()
                    .frame_id(frame_id)
                    .build()
                    .map_err(BrowserError::Script)?,
            )
            .await
            .map_err(|e| BrowserError::Script(e.to_string()))?;

        let evaluation = self
            .page
            .execute(
                EvaluateParams::builder()
                    .expression(OUTER_HTML_SCRIPT)
                    .context_id(world.execution_context_id)
                    .return_by_value(true)
                    .build()
                    .map_err(BrowserError::Script)?,
            )
            .await
            .map_err(|e| BrowserError::Script(e.to_string()))?;

        evaluation
            .result
            .result
            .value
            .as_ref()
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| BrowserError::Script("frame outerHTML returned no value".to_string()))
    }
}

#[async_trait]
impl BrowserDriver for CdpBrowser {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.page
            .goto(url)
            .await
            .map_err(|e| BrowserError::Navigation(e.to_string()))?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        tokio::time::timeout(self.discovery_timeout, self.page.url())
            .await
            .map_err(|_| BrowserError::Script("current URL query timed out".to_string()))?
            .map_err(|e| BrowserError::Script(e.to_string()))?
            .ok_or_else(|| BrowserError::Script("page has no URL".to_string()))
    }

    async fn dom_snapshot(&self) -> Result<String, BrowserError> {
        match self.page.evaluate(OUTER_HTML_SCRIPT).await {
            Ok(result) => {
                if let Ok(html) = result.into_value::<String>() {
                    return Ok(html);
                }
            }
            Err(e) => debug!("outerHTML script failed ({}); using page content", e),
        }
        self.page
            .content()
            .await
            .map_err(|e| BrowserError::Script(e.to_string()))
    }

    async fn run_script(&self, script: &str) -> Result<(), BrowserError> {
        self.page
            .evaluate(script)
            .await
            .map_err(|e| BrowserError::Script(e.to_string()))?;
        Ok(())
    }

    async fn walk_frames(&self) -> Result<Vec<FrameSnapshot>, BrowserError> {
        let tree = self
            .page
            .execute(GetFrameTreeParams::default())
            .await
            .map_err(|e| BrowserError::Script(e.to_string()))?;

        // explicit stack: the tree can mutate under us, so each frame visit
        // is independent and failures just skip that subtree
        let mut snapshots = Vec::new();
        let mut stack: Vec<(FrameTree, usize)> = vec![(tree.frame_tree.clone(), 0)];
        while let Some((node, depth)) = stack.pop() {
            if snapshots.len() >= FRAME_TOTAL_LIMIT {
                break;
            }
            let url = node.frame.url.clone();
            // skip about:blank, about:srcdoc and any other non-http frame
            if !(url.starts_with("http:") || url.starts_with("https:")) {
                continue;
            }
            match self.frame_html(node.frame.id.clone()).await {
                Ok(html) => snapshots.push(FrameSnapshot { url, html }),
                Err(e) => {
                    debug!("skipping frame {}: {}", url, e);
                    continue;
                }
            }
            if depth >= FRAME_DEPTH_LIMIT {
                continue;
            }
            if let Some(children) = &node.child_frames {
                for child in children {
                    stack.push((child.clone(), depth + 1));
                }
            }
        }
        Ok(snapshots)
    }

    async fn scroll(&self) -> Result<(), BrowserError> {
        let result = self
            .page
            .evaluate(SCROLL_SCRIPT)
            .await
            .map_err(|e| BrowserError::Script(e.to_string()))?;
        let delay = result.into_value::<f64>().unwrap_or(0.0);
        tokio::time::sleep(Duration::from_secs_f64(delay.clamp(0.0, 1.0))).await;
        Ok(())
    }

    async fn page_size(&self) -> Result<(u64, u64), BrowserError> {
        #[derive(Deserialize)]
        struct PageSize {
            width: u64,
            height: u64,
        }
        let result = tokio::time::timeout(self.discovery_timeout, self.page.evaluate(PAGE_SIZE_SCRIPT))
            .await
            .map_err(|_| BrowserError::Script("page size query timed out".to_string()))?
            .map_err(|e| BrowserError::Script(e.to_string()))?;
        let size: PageSize = result
            .into_value()
            .map_err(|e| BrowserError::Script(e.to_string()))?;
        Ok((size.width, size.height))
    }

    async fn screenshot(&self, resize_to_page: bool) -> Result<Vec<u8>, BrowserError> {
        if resize_to_page {
            // grow the window to the page, best effort
            if let Ok((width, height)) = self.page_size().await {
                let width = width.max(BROWSER_WINDOW.0 as u64) as i64;
                let height = height.max(BROWSER_WINDOW.1 as u64) as i64;
                let resize = async {
                    let window = self
                        .page
                        .execute(GetWindowForTargetParams::default())
                        .await
                        .map_err(|e| e.to_string())?;
                    let params = SetWindowBoundsParams::builder()
                        .window_id(window.window_id.clone())
                        .bounds(Bounds::builder().width(width).height(height).build())
                        .build()?;
                    self.page.execute(params).await.map_err(|e| e.to_string())?;
                    Ok::<(), String>(())
                };
                if let Err(e) = resize.await {
                    warn!("window resize before screenshot failed: {}", e);
                }
            }
        }

        self.page
            .screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .full_page(true)
                    .build(),
            )
            .await
            .map_err(|e| BrowserError::Script(e.to_string()))
    }

    fn alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    async fn close(&self) {
        let mut browser = self.browser.lock().await;
        let _ = browser.close().await;
        let _ = browser.wait().await;
        self.handler_task.abort();
        self.alive.store(false, Ordering::Release);
    }
}
