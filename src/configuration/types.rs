use serde::Deserialize;
use std::net::IpAddr;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Deserialize)]
pub enum BrowserKind {
    Firefox,
    Chrome,
}

impl Default for BrowserKind {
    fn default() -> Self {
        BrowserKind::Chrome
    }
}

/// An inclusive IP range captures are forbidden to touch.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct IpRange {
    pub start: IpAddr,
    pub end: IpAddr,
}

impl IpRange {
    pub fn contains(&self, addr: IpAddr) -> bool {
        addr >= self.start && addr <= self.end
    }
}

/// Local ports the recording proxy may bind, scanned in order.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 27500,
            end: 28000,
        }
    }
}

fn default_resource_load_timeout() -> u64 {
    60
}

fn default_robots_txt_timeout() -> u64 {
    30
}

fn default_onload_event_timeout() -> u64 {
    30
}

fn default_element_discovery_timeout() -> u64 {
    2
}

fn default_after_load_timeout() -> u64 {
    25
}

fn default_shutdown_grace_period() -> u64 {
    30
}

/// Per-phase wall-clock deadlines, in seconds.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct CaptureTimeouts {
    #[serde(default = "default_resource_load_timeout")]
    pub resource_load: u64,
    #[serde(default = "default_robots_txt_timeout")]
    pub robots_txt: u64,
    #[serde(default = "default_onload_event_timeout")]
    pub onload_event: u64,
    #[serde(default = "default_element_discovery_timeout")]
    pub element_discovery: u64,
    #[serde(default = "default_after_load_timeout")]
    pub after_load: u64,
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace: u64,
    /// Soft limit on one whole capture; exceeding it tags the link
    /// `timeout-failure` and does not requeue.
    #[serde(default = "default_soft_task_limit")]
    pub soft_task_limit: u64,
    /// Hard limit after which a stale in-progress job is reclaimable.
    #[serde(default = "default_hard_task_limit")]
    pub hard_task_limit: u64,
}

fn default_soft_task_limit() -> u64 {
    300
}

fn default_hard_task_limit() -> u64 {
    600
}

impl Default for CaptureTimeouts {
    fn default() -> Self {
        Self {
            resource_load: default_resource_load_timeout(),
            robots_txt: default_robots_txt_timeout(),
            onload_event: default_onload_event_timeout(),
            element_discovery: default_element_discovery_timeout(),
            after_load: default_after_load_timeout(),
            shutdown_grace: default_shutdown_grace_period(),
            soft_task_limit: default_soft_task_limit(),
            hard_task_limit: default_hard_task_limit(),
        }
    }
}

fn default_max_archive_file_size() -> u64 {
    1024 * 1024 * 1024
}

fn default_max_image_size() -> u64 {
    15_000_000
}

fn default_max_resource_size() -> u64 {
    500 * 1024 * 1024
}

fn default_max_proxy_threads() -> usize {
    500
}

fn default_max_proxy_queue_size() -> usize {
    500
}

/// Capture-engine settings.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub browser: BrowserKind,
    /// Route captures for these domains (netloc substring match) through the
    /// upstream SOCKS proxy.
    #[serde(default)]
    pub proxy_captures: bool,
    #[serde(default)]
    pub domains_to_proxy: Vec<String>,
    /// host:port of the upstream SOCKS proxy, when `proxy_captures` is set.
    #[serde(default)]
    pub upstream_proxy_address: Option<String>,
    #[serde(default = "default_max_archive_file_size")]
    pub max_archive_file_size: u64,
    #[serde(default = "default_max_resource_size")]
    pub max_resource_size: u64,
    /// width*height gate for screenshots, in pixels.
    #[serde(default = "default_max_image_size")]
    pub max_image_size: u64,
    #[serde(default)]
    pub timeouts: CaptureTimeouts,
    #[serde(default)]
    pub port_range: PortRange,
    #[serde(default = "default_max_proxy_threads")]
    pub max_proxy_threads: usize,
    #[serde(default = "default_max_proxy_queue_size")]
    pub max_proxy_queue_size: usize,
    #[serde(default)]
    pub blocked_ip_ranges: Vec<IpRange>,
    /// Tag-along privacy policy: a generic (agent-less) noarchive directive
    /// marks the link private, not just a Perma-specific one.
    #[serde(default)]
    pub private_links_if_generic_noarchive: bool,
    /// Mark links private when metadata extraction fails outright.
    #[serde(default)]
    pub private_links_on_failure: bool,
    /// Overrides of the capture user-agent keyed by domain substring.
    #[serde(default)]
    pub user_agents_by_domain: Vec<UserAgentOverride>,
    /// Site-specific scripts run after onload, matched against the current
    /// URL by regex.
    #[serde(default)]
    pub post_load_scripts: Vec<PostLoadScript>,
    /// Path whose existence stops the capture loop from chaining.
    #[serde(default = "default_deployment_sentinel")]
    pub deployment_sentinel: String,
    /// PEM bundle holding the capture CA certificate and key. Generated
    /// fresh when absent.
    #[serde(default)]
    pub ca_cert_path: Option<String>,
}

fn default_deployment_sentinel() -> String {
    "./deployment-in-progress".to_string()
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            browser: BrowserKind::default(),
            proxy_captures: false,
            domains_to_proxy: Vec::new(),
            upstream_proxy_address: None,
            max_archive_file_size: default_max_archive_file_size(),
            max_resource_size: default_max_resource_size(),
            max_image_size: default_max_image_size(),
            timeouts: CaptureTimeouts::default(),
            port_range: PortRange::default(),
            max_proxy_threads: default_max_proxy_threads(),
            max_proxy_queue_size: default_max_proxy_queue_size(),
            blocked_ip_ranges: Vec::new(),
            private_links_if_generic_noarchive: false,
            private_links_on_failure: false,
            user_agents_by_domain: Vec::new(),
            post_load_scripts: Vec::new(),
            deployment_sentinel: default_deployment_sentinel(),
            ca_cert_path: None,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct UserAgentOverride {
    pub domain: String,
    pub user_agent: String,
}

/// JavaScript run after onload on pages whose URL matches the pattern.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct PostLoadScript {
    pub url_pattern: String,
    pub script: String,
}

fn default_retry_for_ratelimiting_limit() -> u32 {
    10
}

fn default_upload_max_timeouts() -> u32 {
    3
}

fn default_retry_for_error_limit() -> u32 {
    5
}

fn default_retry_for_confirmation_connection_error() -> u32 {
    5
}

fn default_max_simultaneous_uploads() -> u32 {
    100
}

fn default_task_soft_time_limit() -> u64 {
    3600
}

fn default_daily_limit() -> u32 {
    100
}

fn default_identifier_prefix() -> String {
    "daily_perma_cc".to_string()
}

/// Replication settings for the external archive.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct ReplicationConfig {
    pub endpoint: String,
    pub metadata_endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default = "default_identifier_prefix")]
    pub daily_identifier_prefix: String,
    #[serde(default = "default_retry_for_ratelimiting_limit")]
    pub retry_for_ratelimiting_limit: u32,
    #[serde(default = "default_upload_max_timeouts")]
    pub upload_max_timeouts: u32,
    #[serde(default = "default_retry_for_error_limit")]
    pub retry_for_error_limit: u32,
    #[serde(default = "default_retry_for_confirmation_connection_error")]
    pub retry_for_confirmation_connection_error: u32,
    #[serde(default = "default_max_simultaneous_uploads")]
    pub max_simultaneous_uploads: u32,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    /// Days never scheduled (identifiers we cannot edit).
    #[serde(default)]
    pub date_blocklist: Vec<String>,
    /// Soft wall-clock limit on one upload task, seconds; exceeding it
    /// retries under the timeout budget.
    #[serde(default = "default_task_soft_time_limit")]
    pub task_soft_time_limit: u64,
    /// Escalate budget exhaustion from a warning to an error-level log.
    #[serde(default)]
    pub exception_if_retries_exceeded: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://s3.us.archive.org".to_string(),
            metadata_endpoint: "https://archive.org/metadata".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            daily_identifier_prefix: default_identifier_prefix(),
            retry_for_ratelimiting_limit: default_retry_for_ratelimiting_limit(),
            upload_max_timeouts: default_upload_max_timeouts(),
            retry_for_error_limit: default_retry_for_error_limit(),
            retry_for_confirmation_connection_error:
                default_retry_for_confirmation_connection_error(),
            max_simultaneous_uploads: default_max_simultaneous_uploads(),
            daily_limit: default_daily_limit(),
            date_blocklist: Vec::new(),
            task_soft_time_limit: default_task_soft_time_limit(),
            exception_if_retries_exceeded: false,
        }
    }
}
