//! Cancellable background fetchers: auxiliary resources (robots.txt,
//! favicons, media) are pulled through the recording proxy by short-lived
//! tasks that honor the shared stop flag and the archive size limit, and
//! report their in-flight byte counts to the size monitor.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, info, warn};
use texting_robots::Robot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error_handling::types::ProxyError;
use crate::models::PrivateReason;
use crate::storage::LinkStore;

use super::state::CaptureState;

/// MIME types accepted for favicon captures.
pub const VALID_FAVICON_MIME_TYPES: &[&str] = &[
    "image/png",
    "image/gif",
    "image/jpg",
    "image/jpeg",
    "image/x-icon",
    "image/vnd.microsoft.icon",
    "image/ico",
];

/// A response pulled by a fetch worker. `body` may be partial when the
/// stop flag or the size limit cut the stream short.
#[derive(Debug)]
pub struct FetchedResponse {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Successful favicon fetches, in candidate order.
pub type FaviconResults = Arc<Mutex<Vec<(String, String)>>>;

/// Registry of the capture's background fetch tasks.
pub struct WorkerPool {
    state: Arc<CaptureState>,
    stop: Arc<AtomicBool>,
    client: reqwest::Client,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// `proxy_address` routes every worker request through the recording
    /// proxy; `None` fetches directly (tests).
    pub fn new(
        state: Arc<CaptureState>,
        proxy_address: Option<&str>,
        user_agent: &str,
    ) -> Result<Self, ProxyError> {
        let mut builder = reqwest::Client::builder()
            // sites with broken TLS are still captured; and the proxy's CA
            // is not in any trust store
            .danger_accept_invalid_certs(true)
            .user_agent(user_agent.to_string())
            .connect_timeout(Duration::from_secs(1));
        if let Some(address) = proxy_address {
            let proxy = reqwest::Proxy::all(format!("http://{}", address))
                .map_err(|e| ProxyError::Tls(e.to_string()))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| ProxyError::Tls(e.to_string()))?;
        Ok(Self {
            state,
            stop: Arc::new(AtomicBool::new(false)),
            client,
            handles: Vec::new(),
        })
    }

    pub fn active_workers(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Fetch a URL for its side effect of being recorded by the proxy.
    pub fn spawn_fetch(&mut self, url: String) {
        let state = self.state.clone();
        let stop = self.stop.clone();
        let client = self.client.clone();
        self.handles.push(tokio::spawn(async move {
            let _ = fetch_streaming(&client, &url, &state, &stop).await;
        }));
    }

    /// Fetch `/robots.txt` relative to the content URL; rules apply only
    /// when the file mentions Perma specifically (we are not a crawler).
    pub fn spawn_robots(
        &mut self,
        link_guid: Uuid,
        target_url: String,
        content_url: String,
        store: Arc<dyn LinkStore>,
        timeout: Duration,
    ) {
        let state = self.state.clone();
        let stop = self.stop.clone();
        let client = self.client.clone();
        self.handles.push(tokio::spawn(async move {
            let work = robots_check(&client, link_guid, &target_url, &content_url, store, state, stop);
            if tokio::time::timeout(timeout, work).await.is_err() {
                info!("robots.txt check timed out for {}", content_url);
            }
        }));
    }

    /// Fetch favicon candidates in order, keeping every one whose MIME type
    /// is in the whitelist.
    pub fn spawn_favicon(&mut self, candidates: Vec<String>, results: FaviconResults) {
        let state = self.state.clone();
        let stop = self.stop.clone();
        let client = self.client.clone();
        self.handles.push(tokio::spawn(async move {
            for url in candidates {
                debug!("Fetching favicon from {} ...", url);
                let Some(response) = fetch_streaming(&client, &url, &state, &stop).await else {
                    continue;
                };
                if !(200..300).contains(&response.status) {
                    continue;
                }
                let Some(mime) = response.content_type else {
                    continue;
                };
                if VALID_FAVICON_MIME_TYPES.contains(&mime.as_str()) {
                    results.lock().unwrap().push((url, mime));
                }
            }
            if results.lock().unwrap().is_empty() {
                info!("Couldn't get any favicons");
            }
        }));
    }

    /// One fetch worker per media URL not already requested.
    pub fn spawn_media(&mut self, urls: Vec<String>) {
        for url in urls {
            if self.state.was_requested(&url) {
                continue;
            }
            self.spawn_fetch(url);
        }
    }

    /// Signal stop and wait for workers, abandoning any that ignore the
    /// signal past the grace period.
    pub async fn stop_all(&mut self, grace: Duration) {
        self.stop.store(true, Ordering::Release);
        for mut handle in self.handles.drain(..) {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("worker ignored stop signal; abandoning it");
                handle.abort();
            }
        }
    }
}

/// GET a URL streaming in small chunks, tracking pending bytes and bailing
/// out when stopped or when the archive limit trips.
async fn fetch_streaming(
    client: &reqwest::Client,
    url: &str,
    state: &Arc<CaptureState>,
    stop: &Arc<AtomicBool>,
) -> Option<FetchedResponse> {
    state.note_requested(url);
    if state.limit_reached() {
        return None;
    }

    let pending = state.new_pending_counter();
    let result = async {
        let response = client.get(url).send().await.ok()?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or("").trim().to_ascii_lowercase());

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.ok()?;
            pending.fetch_add(chunk.len() as u64, Ordering::AcqRel);
            body.extend_from_slice(&chunk);
            if stop.load(Ordering::Acquire) || state.limit_reached() {
                // partial response is still useful; the proxy recorded
                // whatever made it through
                break;
            }
        }
        Some(FetchedResponse {
            url: url.to_string(),
            status,
            content_type,
            body,
        })
    }
    .await;
    pending.store(0, Ordering::Release);
    result
}

async fn robots_check(
    client: &reqwest::Client,
    link_guid: Uuid,
    target_url: &str,
    content_url: &str,
    store: Arc<dyn LinkStore>,
    state: Arc<CaptureState>,
    stop: Arc<AtomicBool>,
) {
    let Ok(base) = url::Url::parse(content_url) else {
        return;
    };
    let Ok(robots_url) = base.join("/robots.txt") else {
        return;
    };
    let Some(response) = fetch_streaming(client, robots_url.as_str(), &state, &stop).await else {
        info!("Couldn't reach robots.txt");
        return;
    };
    if !(200..300).contains(&response.status) {
        info!("Couldn't reach robots.txt");
        return;
    }
    info!("Robots.txt fetched.");

    let content = String::from_utf8_lossy(&response.body);
    // only respect robots.txt when Perma is specifically asked not to archive
    if !content.contains("Perma") {
        return;
    }
    let Ok(robot) = Robot::new("Perma", response.body.as_slice()) else {
        return;
    };
    if !robot.allowed(target_url) {
        info!("Robots.txt disallows Perma.");
        if let Err(e) = store.set_link_private(link_guid, PrivateReason::Policy).await {
            warn!("failed to mark link {} private: {}", link_guid, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Link;
    use crate::storage::DbLinkStore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn canned_server(responses: Vec<(&'static str, String)>) -> String {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let responses = responses.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]).to_string();
                    for (path, body) in &responses {
                        if request.starts_with(&format!("GET {}", path)) {
                            let _ = stream.write_all(body.as_bytes()).await;
                            break;
                        }
                    }
                    let _ = stream.shutdown().await;
                });
            }
        });
        format!("127.0.0.1:{}", addr.port())
    }

    fn http_response(content_type: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n{}",
            content_type,
            body.len(),
            body
        )
    }

    #[tokio::test]
    async fn robots_disallow_marks_link_private_with_policy() {
        let server = canned_server(vec![(
            "/robots.txt",
            http_response("text/plain", "User-agent: Perma\nDisallow: /\n"),
        )])
        .await;

        let store = Arc::new(DbLinkStore::new_in_memory().await.unwrap());
        let link = Link::new(format!("http://{}/page", server));
        store.create_link(&link).await.unwrap();

        let state = CaptureState::new();
        let mut pool = WorkerPool::new(state, None, "test-agent").unwrap();
        pool.spawn_robots(
            link.guid,
            format!("http://{}/page", server),
            format!("http://{}/page", server),
            store.clone(),
            Duration::from_secs(5),
        );
        pool.stop_all(Duration::from_secs(5)).await;

        let link = store.get_link(link.guid).await.unwrap();
        assert!(link.is_private);
        assert_eq!(link.private_reason, Some(PrivateReason::Policy));
    }

    #[tokio::test]
    async fn robots_without_perma_mention_is_ignored() {
        let server = canned_server(vec![(
            "/robots.txt",
            http_response("text/plain", "User-agent: *\nDisallow: /\n"),
        )])
        .await;

        let store = Arc::new(DbLinkStore::new_in_memory().await.unwrap());
        let link = Link::new(format!("http://{}/page", server));
        store.create_link(&link).await.unwrap();

        let state = CaptureState::new();
        let mut pool = WorkerPool::new(state, None, "test-agent").unwrap();
        pool.spawn_robots(
            link.guid,
            format!("http://{}/page", server),
            format!("http://{}/page", server),
            store.clone(),
            Duration::from_secs(5),
        );
        pool.stop_all(Duration::from_secs(5)).await;

        let link = store.get_link(link.guid).await.unwrap();
        assert!(!link.is_private, "generic disallow must not darchive");
    }

    #[tokio::test]
    async fn favicon_worker_keeps_whitelisted_types_in_order() {
        let server = canned_server(vec![
            ("/not-an-icon", http_response("text/html", "<html></html>")),
            ("/icon.png", http_response("image/png", "PNGBYTES")),
            ("/favicon.ico", http_response("image/x-icon", "ICOBYTES")),
        ])
        .await;

        let state = CaptureState::new();
        let mut pool = WorkerPool::new(state.clone(), None, "test-agent").unwrap();
        let results: FaviconResults = Arc::new(Mutex::new(Vec::new()));
        pool.spawn_favicon(
            vec![
                format!("http://{}/not-an-icon", server),
                format!("http://{}/icon.png", server),
                format!("http://{}/favicon.ico", server),
            ],
            results.clone(),
        );
        pool.stop_all(Duration::from_secs(5)).await;

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 2);
        // the declared icon came before the fallback
        assert!(results[0].0.ends_with("/icon.png"));
        assert_eq!(results[0].1, "image/png");
    }

    #[tokio::test]
    async fn fetch_skips_entirely_once_limit_reached() {
        let server = canned_server(vec![("/big", http_response("text/plain", "payload"))]).await;
        let state = CaptureState::new();
        state.set_limit_reached();

        let pool = WorkerPool::new(state.clone(), None, "test-agent").unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let fetched = fetch_streaming(
            &pool.client,
            &format!("http://{}/big", server),
            &state,
            &stop,
        )
        .await;
        assert!(fetched.is_none());
        // the URL is still marked requested so nobody retries it
        assert!(state.was_requested(&format!("http://{}/big", server)));
    }

    #[tokio::test]
    async fn media_spawn_dedups_against_requested_urls() {
        let state = CaptureState::new();
        state.note_requested("http://example.test/seen.png");
        let mut pool = WorkerPool::new(state.clone(), None, "test-agent").unwrap();
        pool.spawn_media(vec!["http://example.test/seen.png".to_string()]);
        assert_eq!(pool.handles.len(), 0, "already-requested URL not refetched");
        pool.stop_all(Duration::from_secs(1)).await;
    }
}
