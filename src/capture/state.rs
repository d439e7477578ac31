//! Shared per-capture state.
//!
//! One `CaptureState` is created for each capture job and shared by the
//! recording proxy (writes `bytes_recorded`, `any_response_seen`), the size
//! monitor (writes `limit_reached`), the orchestrator (writes
//! `stop_requested`) and the fetch workers (own their `pending_bytes`
//! counters). Each field has a single writer; readers load with acquire
//! ordering.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Summary of one recorded response, kept for orchestrator correlation.
#[derive(Debug, Clone)]
pub struct RecordedResponse {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    /// All x-robots-tag header values joined with `;` so multi-agent
    /// directives survive.
    pub x_robots_tag: String,
}

impl RecordedResponse {
    pub fn is_favicon(&self) -> bool {
        self.url.ends_with("/favicon.ico")
    }

    pub fn is_redirect_or_partial(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308 | 206)
    }
}

/// `(requested_url, response?)`, one per URL-instance the proxy accepts.
#[derive(Debug, Clone)]
pub struct ProxiedPair {
    pub id: u64,
    pub requested_url: String,
    pub response: Option<RecordedResponse>,
}

/// State shared across the threads of one capture.
pub struct CaptureState {
    any_response_seen: AtomicBool,
    bytes_recorded: AtomicU64,
    limit_reached: AtomicBool,
    stop_requested: AtomicBool,
    next_pair_id: AtomicU64,
    pairs: Mutex<Vec<ProxiedPair>>,
    requested_urls: Mutex<HashSet<String>>,
    pending_counters: Mutex<Vec<Arc<AtomicU64>>>,
}

impl CaptureState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            any_response_seen: AtomicBool::new(false),
            bytes_recorded: AtomicU64::new(0),
            limit_reached: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            next_pair_id: AtomicU64::new(1),
            pairs: Mutex::new(Vec::new()),
            requested_urls: Mutex::new(HashSet::new()),
            pending_counters: Mutex::new(Vec::new()),
        })
    }

    // -- flags -----------------------------------------------------------

    pub fn any_response_seen(&self) -> bool {
        self.any_response_seen.load(Ordering::Acquire)
    }

    pub fn bytes_recorded(&self) -> u64 {
        self.bytes_recorded.load(Ordering::Acquire)
    }

    /// Proxy only.
    pub fn add_recorded_bytes(&self, n: u64) {
        self.bytes_recorded.fetch_add(n, Ordering::AcqRel);
    }

    pub fn limit_reached(&self) -> bool {
        self.limit_reached.load(Ordering::Acquire)
    }

    /// Size monitor only.
    pub fn set_limit_reached(&self) {
        self.limit_reached.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Orchestrator only.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    // -- requested urls --------------------------------------------------

    /// Record that a URL is being requested; returns false if it already was.
    pub fn note_requested(&self, url: &str) -> bool {
        self.requested_urls.lock().unwrap().insert(url.to_string())
    }

    pub fn was_requested(&self, url: &str) -> bool {
        self.requested_urls.lock().unwrap().contains(url)
    }

    // -- proxied pairs ---------------------------------------------------

    /// Register a pair the proxy is starting to serve.
    pub fn register_pair(&self, url: &str) -> u64 {
        let id = self.next_pair_id.fetch_add(1, Ordering::AcqRel);
        self.note_requested(url);
        self.pairs.lock().unwrap().push(ProxiedPair {
            id,
            requested_url: url.to_string(),
            response: None,
        });
        id
    }

    /// Attach the completed response to its pair.
    pub fn complete_pair(&self, id: u64, response: RecordedResponse) {
        let mut pairs = self.pairs.lock().unwrap();
        if let Some(pair) = pairs.iter_mut().find(|p| p.id == id) {
            pair.response = Some(response);
        }
        drop(pairs);
        self.any_response_seen.store(true, Ordering::Release);
    }

    /// Drop a pair the proxy could not serve, so the capture can proceed.
    pub fn abandon_pair(&self, id: u64) {
        self.pairs.lock().unwrap().retain(|p| p.id != id);
    }

    pub fn pairs_snapshot(&self) -> Vec<ProxiedPair> {
        self.pairs.lock().unwrap().clone()
    }

    pub fn unfinished_pair_count(&self) -> usize {
        self.pairs
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.response.is_none())
            .count()
    }

    /// The first completed response that is neither a favicon (unless it is
    /// the target itself) nor a redirect/partial. `None` while the earliest
    /// pair is still streaming, so the target's content type is identified
    /// from the earliest finished response.
    pub fn first_useful_response(&self, target_url: &str) -> Option<RecordedResponse> {
        let pairs = self.pairs.lock().unwrap();
        for pair in pairs.iter() {
            let Some(response) = &pair.response else {
                return None;
            };
            if response.is_favicon() && response.url != target_url {
                continue;
            }
            if response.is_redirect_or_partial() {
                continue;
            }
            return Some(response.clone());
        }
        None
    }

    // -- pending bytes ---------------------------------------------------

    /// Hand out a pending-byte counter owned by one worker.
    pub fn new_pending_counter(&self) -> Arc<AtomicU64> {
        let counter = Arc::new(AtomicU64::new(0));
        self.pending_counters.lock().unwrap().push(counter.clone());
        counter
    }

    pub fn pending_bytes_total(&self) -> u64 {
        self.pending_counters
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.load(Ordering::Acquire))
            .sum()
    }

    /// Recorded plus in-flight worker bytes; what the size monitor compares
    /// against the archive limit.
    pub fn current_size(&self) -> u64 {
        self.bytes_recorded() + self.pending_bytes_total()
    }
}
