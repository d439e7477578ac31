//! The capture orchestrator.
//!
//! Stages one capture job through its phases: reclaim and reserve, proxy
//! and browser bring-up, the wait for a first useful response, policy
//! checks, HTML enrichment, post-load draining, screenshot, teardown,
//! metadata persistence and WARC assembly. Phase errors short-circuit to
//! the finalize block, which is the only place that writes completion
//! status and is itself guarded so a job never stays in progress.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{error, info, warn};
use regex::Regex;
use uuid::Uuid;

use crate::configuration::types::BrowserKind;
use crate::configuration::Config;
use crate::error_handling::types::{CaptureError, StorageError};
use crate::models::{Capture, CaptureJob, CaptureRole, CaptureStatus, JobStatus, Link};
use crate::storage::{BlobStore, LinkStore};

use super::browser::{BrowserDriver, BrowserLauncher, BrowserSpec};
use super::monitor::SizeMonitor;
use super::proxy::{ProxyContext, ProxyLimits, RecordingProxy, SocksUpstream};
use super::state::CaptureState;
use super::tls::CaptureTls;
use super::warc::{self, WarcWriter};
use super::workers::{FaviconResults, WorkerPool};

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (compatible; Perma/1.0; +https://perma.cc)";

/// Page metadata accumulated across DOM snapshots. A user-chosen title is
/// seeded up front and survives extraction.
#[derive(Debug, Default, Clone)]
struct PageMetadata {
    title: Option<String>,
    meta_tags: Option<BTreeMap<String, String>>,
}

impl PageMetadata {
    fn absorb(&mut self, html: &str) {
        if self.title.is_some() {
            self.meta_tags = Some(super::dom::extract_meta_tags(html));
        } else {
            self.meta_tags = Some(super::dom::extract_meta_tags(html));
            self.title = Some(super::dom::extract_title(html).unwrap_or_default());
        }
    }

    fn is_empty(&self) -> bool {
        self.title.is_none() && self.meta_tags.is_none()
    }
}

/// Does an x-robots-tag header blacklist this capture? Directives arrive
/// joined with `;`; agent-less directives only count when the generic
/// policy is enabled, and malformed directives are matched best-effort.
fn xrobots_blacklists_perma(directives: &str, generic_policy: bool) -> bool {
    if directives.is_empty() {
        return false;
    }
    for directive in directives.split(';') {
        let lowered = directive.to_ascii_lowercase();
        let parsed: Vec<&str> = lowered.split(':').collect();
        match parsed.len() {
            1 if generic_policy => {
                if parsed[0].trim() == "noarchive" {
                    return true;
                }
            }
            2 => {
                if parsed[0].trim() == "perma" && parsed[1].contains("noarchive") {
                    return true;
                }
            }
            _ => {
                if lowered.contains("perma") && lowered.contains("noarchive") {
                    return true;
                }
            }
        }
    }
    false
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Everything one capture run owns; dropped pieces are cleaned up in
/// teardown even when a phase bailed early.
struct CaptureSession {
    state: Arc<CaptureState>,
    _tempdir: tempfile::TempDir,
    recorded_path: std::path::PathBuf,
    writer: Option<WarcWriter>,
    proxy: Option<RecordingProxy>,
    proxy_address: String,
    browser: Option<Arc<dyn BrowserDriver>>,
    navigate_task: Option<tokio::task::JoinHandle<()>>,
    pool: Option<WorkerPool>,
    monitor: Option<SizeMonitor>,
    favicons: FaviconResults,
    page_metadata: PageMetadata,
    have_content: bool,
    have_html: bool,
    content_url: String,
    content_type: String,
    screenshot: Option<Vec<u8>>,
    started: Instant,
}

pub struct Orchestrator {
    config: Config,
    store: Arc<dyn LinkStore>,
    blobs: Arc<dyn BlobStore>,
    launcher: Arc<dyn BrowserLauncher>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        store: Arc<dyn LinkStore>,
        blobs: Arc<dyn BlobStore>,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Self {
        Self {
            config,
            store,
            blobs,
            launcher,
        }
    }

    /// True while the deployment sentinel says captures may keep chaining.
    pub fn may_chain(&self) -> bool {
        !std::path::Path::new(&self.config.capture.deployment_sentinel).exists()
    }

    /// Reclaim stale jobs, then grab and run the next one. Returns whether
    /// a job was found.
    pub async fn run_next_capture(&self) -> Result<bool, StorageError> {
        let hard_limit = chrono::Duration::seconds(self.config.capture.timeouts.hard_task_limit as i64);
        self.store.reclaim_stale_jobs(Utc::now() - hard_limit).await?;

        let Some(job) = self.store.reserve_next_job().await? else {
            return Ok(false); // no jobs waiting
        };
        self.capture_job(job).await;
        Ok(true)
    }

    fn user_agent_for_domain(&self, netloc: &str) -> String {
        self.config
            .capture
            .user_agents_by_domain
            .iter()
            .find(|o| netloc.contains(&o.domain))
            .map(|o| o.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    fn post_load_script_for(&self, current_url: &str) -> Option<String> {
        let lowered = current_url.to_ascii_lowercase();
        for entry in &self.config.capture.post_load_scripts {
            if let Ok(re) = Regex::new(&entry.url_pattern) {
                if re.is_match(&lowered) {
                    return Some(entry.script.clone());
                }
            }
        }
        None
    }

    async fn inc_progress(&self, job: &mut CaptureJob, inc: f32, description: &str) {
        job.inc_progress(inc, description);
        if let Err(e) = self
            .store
            .update_job_progress(job.id, job.step_count, description)
            .await
        {
            warn!("progress update failed for job {}: {}", job.id, e);
        }
        info!(
            "{} step {}: {}",
            job.link_guid, job.step_count, job.step_description
        );
    }

    async fn capture_job(&self, mut job: CaptureJob) {
        let link = match self.store.get_link(job.link_guid).await {
            Ok(link) => link,
            Err(e) => {
                error!("cannot load link for job {}: {}", job.id, e);
                let _ = self.store.set_job_status(job.id, JobStatus::Failed).await;
                return;
            }
        };

        // Get started, unless the user deleted the capture in the meantime
        self.inc_progress(&mut job, 0.0, "Starting capture").await;
        let primary_pending = matches!(
            self.store.get_capture(link.guid, CaptureRole::Primary).await,
            Ok(Some(capture)) if capture.status == CaptureStatus::Pending
        );
        if link.user_deleted || !primary_pending {
            let _ = self.store.set_job_status(job.id, JobStatus::Deleted).await;
            return;
        }
        let _ = self.store.set_job_attempt(job.id, job.attempt + 1).await;

        let capture_user_agent = self.user_agent_for_domain(&link.netloc());
        info!("Using user-agent: {}", capture_user_agent);

        let use_upstream_proxy = self.config.capture.proxy_captures
            && self
                .config
                .capture
                .domains_to_proxy
                .iter()
                .any(|domain| link.netloc().contains(domain));
        if use_upstream_proxy {
            info!("Using upstream proxy.");
        }

        // preserve a user-supplied title through metadata extraction
        let mut page_metadata = PageMetadata::default();
        if link.submitted_title != link.default_title() {
            page_metadata.title = Some(link.submitted_title.clone());
        }

        let tempdir = match tempfile::tempdir() {
            Ok(tempdir) => tempdir,
            Err(e) => {
                error!("no temp dir for job {}: {}", job.id, e);
                let _ = self.store.set_job_status(job.id, JobStatus::Failed).await;
                return;
            }
        };
        let recorded_path = tempdir.path().join(format!("{}.warc.gz", link.guid));

        let mut session = CaptureSession {
            state: CaptureState::new(),
            recorded_path,
            _tempdir: tempdir,
            writer: None,
            proxy: None,
            proxy_address: String::new(),
            browser: None,
            navigate_task: None,
            pool: None,
            monitor: None,
            favicons: Arc::new(Mutex::new(Vec::new())),
            page_metadata,
            have_content: false,
            have_html: false,
            content_url: String::new(),
            content_type: String::new(),
            screenshot: None,
            started: Instant::now(),
        };

        let soft_limit = Duration::from_secs(self.config.capture.timeouts.soft_task_limit);
        let phases = self.run_phases(&mut job, &link, &mut session, capture_user_agent, use_upstream_proxy);
        let result = match tokio::time::timeout(soft_limit, phases).await {
            Ok(result) => result,
            Err(_) => Err(CaptureError::SoftTimeLimit),
        };

        match &result {
            Ok(()) => {}
            Err(CaptureError::Halt(reason)) => info!("capture halted: {}", reason),
            Err(CaptureError::SoftTimeLimit) => {
                let _ = self.store.add_link_tag(link.guid, "timeout-failure").await;
            }
            Err(e) => error!("Exception while capturing job {}: {}", link.guid, e),
        }

        // finalize: the only place completion status is written
        if let Err(e) = self.finalize(&mut job, &link, session).await {
            error!("Exception while finishing job {}: {}", link.guid, e);
        }
        let _ = self.store.mark_pending_captures_failed(link.guid).await;
        if let Ok(current) = self.store.get_job(job.id).await {
            if current.status == JobStatus::InProgress {
                let _ = self.store.set_job_status(job.id, JobStatus::Failed).await;
            }
        }
    }

    async fn run_phases(
        &self,
        job: &mut CaptureJob,
        link: &Link,
        session: &mut CaptureSession,
        capture_user_agent: String,
        use_upstream_proxy: bool,
    ) -> Result<(), CaptureError> {
        let target_url = link.submitted_url.clone();
        let timeouts = &self.config.capture.timeouts;

        // proxy up
        let writer = WarcWriter::create(&session.recorded_path).await?;
        let tls = match &self.config.capture.ca_cert_path {
            Some(path) => {
                let bundle = std::fs::read_to_string(path)
                    .map_err(|e| CaptureError::Halt(format!("CA bundle {}: {}", path, e)))?;
                Arc::new(CaptureTls::from_ca_pem(&bundle)?)
            }
            None => Arc::new(CaptureTls::ephemeral()?),
        };
        let socks_upstream = if use_upstream_proxy {
            self.config
                .capture
                .upstream_proxy_address
                .as_ref()
                .map(|address| SocksUpstream {
                    address: address.clone(),
                    username: "user".to_string(),
                    // fresh credentials per job force a fresh upstream IP
                    password: link.guid.to_string(),
                })
        } else {
            None
        };
        let ctx = ProxyContext::new(
            session.state.clone(),
            writer.handle(),
            tls,
            self.config.capture.max_resource_size,
            self.config.capture.blocked_ip_ranges.clone(),
            socks_upstream,
        );
        let proxy = RecordingProxy::start(
            &self.config.capture.port_range,
            ctx,
            ProxyLimits {
                max_handlers: self.config.capture.max_proxy_threads,
                queue_size: self.config.capture.max_proxy_queue_size,
            },
            Duration::from_secs(timeouts.shutdown_grace),
        )
        .await?;
        info!("Recording proxy opened.");
        session.proxy_address = proxy.address.clone();
        session.writer = Some(writer);
        session.proxy = Some(proxy);

        // browser up
        let browser: Arc<dyn BrowserDriver> = Arc::from(
            self.launcher
                .launch(&BrowserSpec {
                    kind: self.config.capture.browser,
                    user_agent: capture_user_agent.clone(),
                    proxy_address: session.proxy_address.clone(),
                    element_discovery_timeout: Duration::from_secs(timeouts.element_discovery),
                })
                .await?,
        );
        session.browser = Some(browser.clone());

        info!("Tracking capture size...");
        session.monitor = Some(SizeMonitor::start(
            session.state.clone(),
            self.config.capture.max_archive_file_size,
        ));

        let mut pool = WorkerPool::new(
            session.state.clone(),
            Some(&session.proxy_address),
            &capture_user_agent,
        )?;

        // fetch page in the background; navigate returns after onload
        self.inc_progress(job, 1.0, "Fetching target URL").await;
        let nav_browser = browser.clone();
        let nav_url = target_url.clone();
        session.navigate_task = Some(tokio::spawn(async move {
            if let Err(e) = nav_browser.navigate(&nav_url).await {
                info!("navigation ended with {}", e);
            }
        }));

        // await the first response that isn't a forward
        let resource_deadline = session.started + Duration::from_secs(timeouts.resource_load);
        let first_response = loop {
            if !browser.alive() {
                return Err(CaptureError::Halt("Browser crashed".to_string()));
            }
            if let Some(response) = session.state.first_useful_response(&target_url) {
                break response;
            }
            if Instant::now() > resource_deadline {
                return Err(CaptureError::Halt(
                    "no useful response before the resource load timeout".to_string(),
                ));
            }
            let wait_fraction =
                session.started.elapsed().as_secs_f32() / timeouts.resource_load as f32;
            self.inc_progress(job, wait_fraction.min(1.0), "Fetching target URL")
                .await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        };

        session.have_content = true;
        session.content_url = first_response.url.clone();
        session.content_type = first_response
            .content_type
            .clone()
            .unwrap_or_else(|| "text/html; charset=utf-8".to_string());
        session.have_html = session.content_type.starts_with("text/html");
        let robots_directives = first_response.x_robots_tag.clone();

        // policy checks
        info!("Fetching robots.txt ...");
        pool.spawn_robots(
            link.guid,
            target_url.clone(),
            session.content_url.clone(),
            self.store.clone(),
            Duration::from_secs(timeouts.robots_txt),
        );

        self.inc_progress(job, 1.0, "Checking x-robots-tag directives")
            .await;
        if xrobots_blacklists_perma(
            &robots_directives,
            self.config.capture.private_links_if_generic_noarchive,
        ) {
            self.store
                .set_link_private(link.guid, crate::models::PrivateReason::Policy)
                .await?;
            info!("x-robots-tag found, darchiving");
        }

        if session.have_html {
            // metadata without waiting for onload, which can take a long
            // time and might even crash the browser
            info!("Retrieving DOM (pre-onload)");
            if !browser.alive() {
                session.pool = Some(pool);
                return Err(CaptureError::Halt("Browser crashed".to_string()));
            }
            if let Ok(snapshot) = browser.dom_snapshot().await {
                session.page_metadata.absorb(&snapshot);

                info!("Fetching favicons ...");
                let candidates =
                    super::dom::extract_favicon_urls(&snapshot, &session.content_url);
                pool.spawn_favicon(candidates, session.favicons.clone());
            }

            info!("Waiting for onload event before proceeding.");
            if let Some(mut task) = session.navigate_task.take() {
                let remaining = Duration::from_secs(timeouts.onload_event)
                    .saturating_sub(session.started.elapsed());
                if tokio::time::timeout(remaining, &mut task).await.is_err() {
                    info!("Onload timed out");
                    // navigation keeps running; abandoned at teardown
                    session.navigate_task = Some(task);
                }
            }

            if !browser.alive() {
                session.pool = Some(pool);
                return Err(CaptureError::Halt("Browser crashed".to_string()));
            }
            let current_url = browser
                .current_url()
                .await
                .unwrap_or_else(|_| session.content_url.clone());
            if let Some(script) = self.post_load_script_for(&current_url) {
                info!("Running domain's post-load script");
                if let Err(e) = browser.run_script(&script).await {
                    info!("post-load script failed: {}", e);
                }
            }

            info!("Retrieving DOM (post-onload)");
            if let Ok(snapshot) = browser.dom_snapshot().await {
                session.page_metadata.absorb(&snapshot);
            }

            if !browser.alive() {
                session.pool = Some(pool);
                return Err(CaptureError::Halt("Browser crashed".to_string()));
            }
            self.inc_progress(job, 0.5, "Checking for scroll-loaded assets")
                .await;
            if let Err(e) = browser.scroll().await {
                info!("scroll failed: {}", e);
            }

            self.inc_progress(job, 1.0, "Fetching media").await;
            match browser.walk_frames().await {
                Ok(frames) => {
                    let mut media_urls = Vec::new();
                    for frame in frames {
                        media_urls
                            .extend(super::dom::extract_media_urls(&frame.html, &frame.url));
                    }
                    pool.spawn_media(media_urls);
                }
                Err(e) => info!("Error fetching media: {}", e),
            }
        }

        session.pool = Some(pool);

        // wait for outstanding requests to finish
        self.inc_progress(job, 1.0, "Waiting for post-load requests")
            .await;
        let load_time = Instant::now();
        let after_load = Duration::from_secs(timeouts.after_load);
        loop {
            let unfinished = session.state.unfinished_pair_count();
            if unfinished == 0 || !browser.alive() {
                break;
            }
            if session.state.limit_reached() {
                session.state.request_stop();
                info!("Size limit reached: not waiting for additional pending requests.");
                break;
            }
            if load_time.elapsed() > after_load {
                session.state.request_stop();
                info!(
                    "Waited {}s to finish post-load requests -- giving up.",
                    after_load.as_secs()
                );
                break;
            }
            info!("Waiting for {} pending requests", unfinished);
            let fraction = load_time.elapsed().as_secs_f32() / after_load.as_secs_f32();
            self.inc_progress(job, fraction.min(1.0), "Waiting for post-load requests")
                .await;
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        // screenshot of html pages, after requests have settled
        if session.have_html && browser.alive() {
            self.inc_progress(job, 1.0, "Taking screenshot").await;
            match browser.page_size().await {
                Ok((width, height)) if width * height < self.config.capture.max_image_size => {
                    let resize = self.config.capture.browser == BrowserKind::Chrome;
                    match browser.screenshot(resize).await {
                        Ok(png) => session.screenshot = Some(png),
                        Err(e) => info!("screenshot failed: {}", e),
                    }
                }
                Ok(size) => info!("Not taking screenshot! Page size is {:?}", size),
                Err(e) => info!("screenshot skipped, page size unknown: {}", e),
            }
        }

        Ok(())
    }

    /// Teardown plus persistence, always run.
    async fn finalize(
        &self,
        job: &mut CaptureJob,
        link: &Link,
        mut session: CaptureSession,
    ) -> Result<(), CaptureError> {
        info!("Shutting down browser and proxies.");
        let grace = Duration::from_secs(self.config.capture.timeouts.shutdown_grace);

        if let Some(mut pool) = session.pool.take() {
            pool.stop_all(grace).await;
        }
        if let Some(monitor) = session.monitor.take() {
            monitor.stop().await;
        }
        if let Some(task) = session.navigate_task.take() {
            task.abort();
        }
        if let Some(browser) = session.browser.take() {
            if !browser.alive() {
                let _ = self.store.add_link_tag(link.guid, "browser-crashed").await;
            }
            browser.close().await;
        }
        if let Some(proxy) = session.proxy.take() {
            proxy.shutdown().await;
        }
        if let Some(writer) = session.writer.take() {
            writer.close().await?; // blocking flush
        }

        // page metadata
        if session.have_html {
            if !session.page_metadata.is_empty() {
                self.process_metadata(link, &session.page_metadata).await?;
            } else {
                self.meta_tag_analysis_failed(link).await?;
            }
        }

        if session.have_content {
            self.inc_progress(job, 1.0, "Saving web archive file").await;
            self.save_warc(job, link, &mut session).await?;
            info!("{} capture succeeded.", link.guid);
        } else {
            info!("{} capture failed.", link.guid);
        }
        Ok(())
    }

    async fn process_metadata(
        &self,
        link: &Link,
        metadata: &PageMetadata,
    ) -> Result<(), CaptureError> {
        let empty = BTreeMap::new();
        let meta_tags = metadata.meta_tags.as_ref().unwrap_or(&empty);

        // the generic robots meta only counts when no perma meta exists
        let mut darchive_tag = meta_tags.get("perma");
        if self.config.capture.private_links_if_generic_noarchive && darchive_tag.is_none() {
            darchive_tag = meta_tags.get("robots");
        }
        if let Some(tag) = darchive_tag {
            if tag.to_ascii_lowercase().contains("noarchive") {
                self.store
                    .set_link_private(link.guid, crate::models::PrivateReason::Policy)
                    .await?;
                info!("Meta found, darchiving");
            }
        }

        if let Some(description) = meta_tags.get("description") {
            if !description.is_empty() {
                self.store
                    .set_link_description(link.guid, &truncate_chars(description, 300))
                    .await?;
            }
        }

        let title = metadata.title.clone().unwrap_or_default();
        self.store
            .set_link_title(link.guid, &truncate_chars(&title, 2100))
            .await?;
        Ok(())
    }

    async fn meta_tag_analysis_failed(&self, link: &Link) -> Result<(), CaptureError> {
        if self.config.capture.private_links_on_failure {
            self.store
                .set_link_private(link.guid, crate::models::PrivateReason::Failure)
                .await?;
        }
        info!("Meta tag retrieval failure.");
        self.store
            .add_link_tag(link.guid, "meta-tag-retrieval-failure")
            .await?;
        Ok(())
    }

    /// Assemble one WARC from the recorded traffic and the screenshot, and
    /// persist every success marker.
    async fn save_warc(
        &self,
        job: &mut CaptureJob,
        link: &Link,
        session: &mut CaptureSession,
    ) -> Result<(), CaptureError> {
        let screenshot_url = format!("file:///{}/screenshot.png", link.guid);
        let screenshot = session
            .screenshot
            .take()
            .map(|png| (screenshot_url.clone(), png));

        let archive = warc::assemble_archive(
            &format!("{}.warc.gz", link.guid),
            link.created_at,
            screenshot
                .as_ref()
                .map(|(url, png)| (url.as_str(), png.clone())),
            &session.recorded_path,
        )
        .await?;
        let size = self
            .blobs
            .write(&link.warc_storage_file(), &archive)
            .await?;

        self.store.set_link_warc_size(link.guid, size).await?;
        self.store
            .set_capture_content_type(link.guid, CaptureRole::Primary, &session.content_type)
            .await?;
        self.store
            .set_capture_status(link.guid, CaptureRole::Primary, CaptureStatus::Success)
            .await?;

        if screenshot.is_some() {
            self.store
                .set_capture_status(link.guid, CaptureRole::Screenshot, CaptureStatus::Success)
                .await?;
        }

        self.save_favicons(link.guid, &session.favicons).await?;
        self.store
            .set_job_status(job.id, JobStatus::Completed)
            .await?;
        Ok(())
    }

    async fn save_favicons(
        &self,
        guid: Uuid,
        favicons: &FaviconResults,
    ) -> Result<(), CaptureError> {
        let first = favicons.lock().unwrap().first().cloned();
        if let Some((url, mime)) = first {
            self.store
                .create_capture(&Capture {
                    link_guid: guid,
                    role: CaptureRole::Favicon,
                    status: CaptureStatus::Success,
                    record_type: "response".to_string(),
                    url: url.clone(),
                    content_type: mime.to_ascii_lowercase(),
                })
                .await?;
            info!("Saved favicon {}", url);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::browser::FrameSnapshot;
    use crate::capture::warc::test_support::read_record_summaries;
    use crate::models::PrivateReason;
    use crate::storage::{DbLinkStore, FileBlobStore};
    use async_trait::async_trait;
    use serial_test::serial;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    // one-pixel-ish png magic; content is irrelevant to the assembler
    const FAKE_PNG: &[u8] = &[137, 80, 78, 71, 13, 10, 26, 10];

    /// Browser stand-in that "renders" by fetching the page through the
    /// recording proxy, exactly as a real browser would be routed.
    struct ProxiedFakeBrowser {
        proxy_address: String,
        fetched: Mutex<Option<String>>,
    }

    impl ProxiedFakeBrowser {
        fn client(&self) -> reqwest::Client {
            reqwest::Client::builder()
                .proxy(reqwest::Proxy::all(format!("http://{}", self.proxy_address)).unwrap())
                .danger_accept_invalid_certs(true)
                .build()
                .unwrap()
        }
    }

    #[async_trait]
    impl BrowserDriver for ProxiedFakeBrowser {
        async fn navigate(&self, url: &str) -> Result<(), crate::error_handling::types::BrowserError> {
            if let Ok(response) = self.client().get(url).send().await {
                let body = response.text().await.unwrap_or_default();
                *self.fetched.lock().unwrap() = Some(body);
            }
            Ok(())
        }

        async fn current_url(&self) -> Result<String, crate::error_handling::types::BrowserError> {
            Ok("http://unused.test/".to_string())
        }

        async fn dom_snapshot(&self) -> Result<String, crate::error_handling::types::BrowserError> {
            Ok(self.fetched.lock().unwrap().clone().unwrap_or_default())
        }

        async fn run_script(&self, _script: &str) -> Result<(), crate::error_handling::types::BrowserError> {
            Ok(())
        }

        async fn walk_frames(&self) -> Result<Vec<FrameSnapshot>, crate::error_handling::types::BrowserError> {
            Ok(Vec::new())
        }

        async fn scroll(&self) -> Result<(), crate::error_handling::types::BrowserError> {
            Ok(())
        }

        async fn page_size(&self) -> Result<(u64, u64), crate::error_handling::types::BrowserError> {
            Ok((1024, 800))
        }

        async fn screenshot(&self, _resize: bool) -> Result<Vec<u8>, crate::error_handling::types::BrowserError> {
            Ok(FAKE_PNG.to_vec())
        }

        fn alive(&self) -> bool {
            true
        }

        async fn close(&self) {}
    }

    struct FakeLauncher;

    #[async_trait]
    impl BrowserLauncher for FakeLauncher {
        async fn launch(
            &self,
            spec: &BrowserSpec,
        ) -> Result<Box<dyn BrowserDriver>, crate::error_handling::types::BrowserError> {
            Ok(Box::new(ProxiedFakeBrowser {
                proxy_address: spec.proxy_address.clone(),
                fetched: Mutex::new(None),
            }))
        }
    }

    async fn canned_site(page: String) -> String {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let page = page.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]).to_string();
                    let response = if request.contains("favicon.ico") {
                        "HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: 8\r\n\r\nPNGPNGPN"
                            .to_string()
                    } else if request.contains("robots.txt") {
                        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_string()
                    } else {
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{}",
                            page.len(),
                            page
                        )
                    };
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        format!("127.0.0.1:{}", addr.port())
    }

    struct Harness {
        store: Arc<DbLinkStore>,
        blobs: Arc<FileBlobStore>,
        orchestrator: Orchestrator,
        _blob_dir: tempfile::TempDir,
    }

    async fn harness(mut config: Config) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let blob_dir = tempfile::tempdir().unwrap();
        config.capture.timeouts.soft_task_limit = 60;
        config.capture.timeouts.after_load = 3;
        config.capture.timeouts.onload_event = 5;
        config.capture.timeouts.resource_load = 5;
        config.capture.timeouts.shutdown_grace = 3;
        let store = Arc::new(DbLinkStore::new_in_memory().await.unwrap());
        let blobs = Arc::new(FileBlobStore::new(blob_dir.path()).unwrap());
        let orchestrator = Orchestrator::new(
            config,
            store.clone(),
            blobs.clone(),
            Arc::new(FakeLauncher),
        );
        Harness {
            store,
            blobs,
            orchestrator,
            _blob_dir: blob_dir,
        }
    }

    async fn seed_link(store: &DbLinkStore, url: &str) -> Link {
        let link = Link::new(url);
        store.create_link(&link).await.unwrap();
        for role in [CaptureRole::Primary, CaptureRole::Screenshot] {
            store
                .create_capture(&Capture {
                    link_guid: link.guid,
                    role,
                    status: CaptureStatus::Pending,
                    record_type: if role == CaptureRole::Primary {
                        "response".to_string()
                    } else {
                        "resource".to_string()
                    },
                    url: url.to_string(),
                    content_type: String::new(),
                })
                .await
                .unwrap();
        }
        store.create_job(link.guid).await.unwrap();
        link
    }

    #[tokio::test]
    #[serial]
    async fn basic_html_capture_succeeds_end_to_end() {
        let page = r#"<html><head><title>T</title><meta name="description" content="D"></head><body>hi</body></html>"#;
        let server = canned_site(page.to_string()).await;
        let h = harness(Config::default()).await;
        let link = seed_link(&h.store, &format!("http://{}/", server)).await;

        assert!(h.orchestrator.run_next_capture().await.unwrap());

        let loaded = h.store.get_link(link.guid).await.unwrap();
        assert_eq!(loaded.submitted_title, "T");
        assert_eq!(loaded.submitted_description, "D");
        assert!(loaded.warc_size.unwrap() > 0);

        let primary = h
            .store
            .get_capture(link.guid, CaptureRole::Primary)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(primary.status, CaptureStatus::Success);
        assert!(primary.content_type.starts_with("text/html"));

        // favicon fetched through the proxy and whitelisted
        let favicon = h
            .store
            .get_capture(link.guid, CaptureRole::Favicon)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(favicon.status, CaptureStatus::Success);
        assert_eq!(favicon.content_type, "image/png");

        // the archive holds warcinfo, the screenshot resource first, then
        // recorded request/response pairs
        let archive = h.blobs.open(&loaded.warc_storage_file()).await.unwrap();
        assert_eq!(archive.len() as u64, loaded.warc_size.unwrap());
        let records = read_record_summaries(&archive);
        assert_eq!(records[0].0, "warcinfo");
        assert_eq!(records[1].0, "resource");
        assert!(records[1].1.contains("screenshot.png"));
        assert!(records.iter().any(|r| r.0 == "response"));

        let job = h.store.get_job(1).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempt, 1);
    }

    #[tokio::test]
    #[serial]
    async fn noarchive_meta_tag_marks_private_but_still_archives() {
        let page = r#"<html><head><title>T</title><meta name="perma" content="noarchive"></head><body>hi</body></html>"#;
        let server = canned_site(page.to_string()).await;
        let h = harness(Config::default()).await;
        let link = seed_link(&h.store, &format!("http://{}/", server)).await;

        h.orchestrator.run_next_capture().await.unwrap();

        let loaded = h.store.get_link(link.guid).await.unwrap();
        assert!(loaded.is_private);
        assert_eq!(loaded.private_reason, Some(PrivateReason::Policy));
        // the WARC was still written
        assert!(h.blobs.size(&loaded.warc_storage_file()).await.unwrap() > 0);
    }

    #[tokio::test]
    #[serial]
    async fn oversize_response_is_truncated_and_archived() {
        let big_body = "x".repeat(512 * 1024);
        let page = format!(
            "<html><head><title>big</title></head><body>{}</body></html>",
            big_body
        );
        let server = canned_site(page).await;

        let mut config = Config::default();
        // both the per-resource cap and the archive cap are tiny
        config.capture.max_resource_size = 16 * 1024;
        config.capture.max_archive_file_size = 16 * 1024;
        let h = harness(config).await;
        let link = seed_link(&h.store, &format!("http://{}/", server)).await;

        h.orchestrator.run_next_capture().await.unwrap();

        let loaded = h.store.get_link(link.guid).await.unwrap();
        let archive = h.blobs.open(&loaded.warc_storage_file()).await.unwrap();
        let records = read_record_summaries(&archive);
        let truncated = records
            .iter()
            .find(|r| r.0 == "response" && r.2.is_some())
            .expect("a truncated response record");
        assert_eq!(truncated.2.as_deref(), Some("length"));
    }

    #[tokio::test]
    #[serial]
    async fn user_deleted_link_completes_as_deleted() {
        let h = harness(Config::default()).await;
        let mut link = Link::new("http://unreachable.test/");
        link.user_deleted = true;
        h.store.create_link(&link).await.unwrap();
        h.store
            .create_capture(&Capture {
                link_guid: link.guid,
                role: CaptureRole::Primary,
                status: CaptureStatus::Pending,
                record_type: "response".to_string(),
                url: link.submitted_url.clone(),
                content_type: String::new(),
            })
            .await
            .unwrap();
        h.store.create_job(link.guid).await.unwrap();

        h.orchestrator.run_next_capture().await.unwrap();
        let job = h.store.get_job(1).await.unwrap();
        assert_eq!(job.status, JobStatus::Deleted);
    }

    #[tokio::test]
    #[serial]
    async fn unreachable_target_fails_the_job_and_captures() {
        let h = harness(Config::default()).await;
        // a port nothing listens on
        let link = seed_link(&h.store, "http://127.0.0.1:9/").await;

        h.orchestrator.run_next_capture().await.unwrap();

        let job = h.store.get_job(1).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let primary = h
            .store
            .get_capture(link.guid, CaptureRole::Primary)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(primary.status, CaptureStatus::Failed);
    }

    #[test]
    fn xrobots_parsing_covers_the_directive_shapes() {
        // perma-specific directive always darchives
        assert!(xrobots_blacklists_perma("perma: noarchive", false));
        assert!(xrobots_blacklists_perma("googlebot: nofollow;perma: noarchive", false));
        // generic directive only under the policy flag
        assert!(!xrobots_blacklists_perma("noarchive", false));
        assert!(xrobots_blacklists_perma("noarchive", true));
        // poorly formed directives are matched best-effort
        assert!(xrobots_blacklists_perma("perma: noindex: noarchive", false));
        // unrelated directives never darchive
        assert!(!xrobots_blacklists_perma("googlebot: noarchive", true));
        assert!(!xrobots_blacklists_perma("", true));
    }

    #[test]
    fn truncation_is_by_characters() {
        let s = "é".repeat(400);
        assert_eq!(truncate_chars(&s, 300).chars().count(), 300);
    }
}
