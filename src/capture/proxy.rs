//! The recording MITM proxy.
//!
//! A first-class fork of the usual proxy request loop: every request is
//! registered as a proxied pair, filtered against the blocked IP ranges,
//! forwarded with hop-by-hop headers stripped and a Via header added, and
//! recorded through the interruptible streaming recorder. CONNECT requests
//! are terminated locally with a leaf certificate minted by the capture CA,
//! so HTTPS traffic is observed in the clear.
//!
//! Per request the handler moves through
//! `connecting → headers_received → streaming → {complete|truncated|failed}`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::configuration::types::{IpRange, PortRange};
use crate::error_handling::types::ProxyError;

use super::recorder::{self, RecorderFailure};
use super::state::{CaptureState, RecordedResponse};
use super::tls::CaptureTls;
use super::warc::{WarcRecord, WarcWriterHandle};

/// Entries in the bad-host cache expire after this long.
const BAD_HOST_TTL: Duration = Duration::from_secs(300);

/// Streams we can read and write regardless of TLS wrapping.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Upstream SOCKS5 route with per-job credentials. A fresh password per
/// capture forces the upstream to assign a fresh exit IP.
#[derive(Debug, Clone)]
pub struct SocksUpstream {
    pub address: String,
    pub username: String,
    pub password: String,
}

/// Everything one capture's proxy needs, constructed fresh per job.
pub struct ProxyContext {
    pub state: Arc<CaptureState>,
    pub warc: WarcWriterHandle,
    pub tls: Arc<CaptureTls>,
    pub max_resource_size: u64,
    pub blocked_ip_ranges: Vec<IpRange>,
    pub socks_upstream: Option<SocksUpstream>,
    bad_hostnames_ports: Mutex<HashMap<String, Instant>>,
}

impl ProxyContext {
    pub fn new(
        state: Arc<CaptureState>,
        warc: WarcWriterHandle,
        tls: Arc<CaptureTls>,
        max_resource_size: u64,
        blocked_ip_ranges: Vec<IpRange>,
        socks_upstream: Option<SocksUpstream>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            warc,
            tls,
            max_resource_size,
            blocked_ip_ranges,
            socks_upstream,
            bad_hostnames_ports: Mutex::new(HashMap::new()),
        })
    }

    fn host_is_bad(&self, host_port: &str) -> bool {
        let mut cache = self.bad_hostnames_ports.lock().unwrap();
        cache.retain(|_, added| added.elapsed() < BAD_HOST_TTL);
        cache.contains_key(host_port)
    }

    fn mark_host_bad(&self, host_port: &str) {
        let mut cache = self.bad_hostnames_ports.lock().unwrap();
        cache.insert(host_port.to_string(), Instant::now());
        info!(
            "bad_hostnames_ports cache size: {} (added {})",
            cache.len(),
            host_port
        );
    }

    fn ip_is_blocked(&self, addr: IpAddr) -> bool {
        self.blocked_ip_ranges.iter().any(|r| r.contains(addr))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestPhase {
    Connecting,
    HeadersReceived,
    Streaming,
    Complete,
    Truncated,
    Failed,
}

/// A parsed client request head plus any body.
#[derive(Debug)]
struct RequestHead {
    method: String,
    target: String,
    version: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

async fn read_request_head<S>(stream: &mut S) -> Result<Option<RequestHead>, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > 64 * 1024 {
            return Err(ProxyError::Io(std::io::Error::other(
                "request head too large",
            )));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None); // clean connection close
            }
            return Err(ProxyError::Io(std::io::Error::other(
                "client closed mid-request",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head_text = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head_text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();
    let version = parts.next().unwrap_or("HTTP/1.1").to_string();
    if method.is_empty() || target.is_empty() {
        return Err(ProxyError::Io(std::io::Error::other("bad request line")));
    }

    let mut headers = Vec::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    // read any request body announced by Content-Length
    let mut body = buf[head_end..].to_vec();
    let content_length = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers,
        body,
    }))
}

/// Hop-by-hop headers never forwarded upstream.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "upgrade",
];

fn build_upstream_request(head: &RequestHead, origin_form: &str) -> Vec<u8> {
    let mut req = format!("{} {} {}\r\n", head.method, origin_form, head.version);
    for (name, value) in &head.headers {
        if HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        req.push_str(&format!("{}: {}\r\n", name, value));
    }
    let via_version = head.version.trim_start_matches("HTTP/");
    req.push_str(&format!("Via: {} amber\r\n", via_version));
    req.push_str("\r\n");
    let mut bytes = req.into_bytes();
    bytes.extend_from_slice(&head.body);
    bytes
}

async fn respond_bad_gateway<S>(stream: &mut S)
where
    S: AsyncWrite + Unpin,
{
    let _ = stream
        .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n")
        .await;
}

/// RFC 1928/1929 SOCKS5 CONNECT with username/password auth.
async fn socks5_connect(
    proxy_address: &str,
    host: &str,
    port: u16,
    username: &str,
    password: &str,
) -> std::io::Result<TcpStream> {
    let mut stream = TcpStream::connect(proxy_address).await?;

    // offer no-auth and username/password
    stream.write_all(&[0x05, 0x02, 0x00, 0x02]).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    match reply[1] {
        0x00 => {}
        0x02 => {
            let mut auth = vec![0x01, username.len() as u8];
            auth.extend_from_slice(username.as_bytes());
            auth.push(password.len() as u8);
            auth.extend_from_slice(password.as_bytes());
            stream.write_all(&auth).await?;
            let mut auth_reply = [0u8; 2];
            stream.read_exact(&mut auth_reply).await?;
            if auth_reply[1] != 0x00 {
                return Err(std::io::Error::other("socks auth rejected"));
            }
        }
        _ => return Err(std::io::Error::other("no acceptable socks auth method")),
    }

    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        return Err(std::io::Error::other(format!(
            "socks connect failed: {:#04x}",
            head[1]
        )));
    }
    // consume the bound address
    let addr_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        _ => return Err(std::io::Error::other("bad socks address type")),
    };
    let mut skip = vec![0u8; addr_len + 2];
    stream.read_exact(&mut skip).await?;
    Ok(stream)
}

async fn connect_upstream(
    ctx: &ProxyContext,
    host: &str,
    port: u16,
    tls: bool,
) -> Result<Box<dyn AsyncStream>, ProxyError> {
    let tcp = match &ctx.socks_upstream {
        Some(socks) => socks5_connect(
            &socks.address,
            host,
            port,
            &socks.username,
            &socks.password,
        )
        .await
        .map_err(ProxyError::Io)?,
        None => TcpStream::connect((host, port)).await.map_err(ProxyError::Io)?,
    };

    if tls {
        let server_name = rustls::ServerName::try_from(host)
            .map_err(|e| ProxyError::Tls(format!("bad server name {}: {}", host, e)))?;
        let stream = ctx
            .tls
            .upstream_connector()
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::Tls(format!("upstream handshake with {}: {}", host, e)))?;
        Ok(Box::new(stream))
    } else {
        Ok(Box::new(tcp))
    }
}

/// Serve one request that has already been read off the client connection.
/// Returns whether the connection can keep serving requests: a truncated or
/// failed response leaves the client short of its promised body, so the
/// connection must close.
async fn proxy_request<S>(
    client: &mut S,
    head: RequestHead,
    scheme: &str,
    host: &str,
    port: u16,
    origin_form: &str,
    ctx: &Arc<ProxyContext>,
) -> bool
where
    S: AsyncStream,
{
    let url = if (scheme == "http" && port == 80) || (scheme == "https" && port == 443) {
        format!("{}://{}{}", scheme, host, origin_form)
    } else {
        format!("{}://{}:{}{}", scheme, host, port, origin_form)
    };

    // stop taking on new work once the archive limit has been hit
    if ctx.state.limit_reached() {
        respond_bad_gateway(client).await;
        return true;
    }

    let host_port = format!("{}:{}", host, port);
    if ctx.host_is_bad(&host_port) {
        debug!("Skipping {}: host is in the bad-host cache", url);
        respond_bad_gateway(client).await;
        return true;
    }

    // never touch a banned IP range; checked before the pair is registered
    // so refused URLs leave no trace in the archive
    if ctx.socks_upstream.is_none() {
        match lookup_host((host, port)).await {
            Ok(addrs) => {
                let mut resolved_any = false;
                for addr in addrs {
                    resolved_any = true;
                    if ctx.ip_is_blocked(addr.ip()) {
                        warn!("Refusing {}: {} is in a blocked IP range", url, addr.ip());
                        respond_bad_gateway(client).await;
                        return true;
                    }
                }
                if !resolved_any {
                    respond_bad_gateway(client).await;
                    return true;
                }
            }
            Err(_) => {
                respond_bad_gateway(client).await;
                return true;
            }
        }
    }

    let pair_id = ctx.state.register_pair(&url);
    let mut phase = RequestPhase::Connecting;
    debug!("[{}] {:?} {}", pair_id, phase, url);

    let mut upstream = match connect_upstream(ctx, host, port, scheme == "https").await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("[{}] connect to {} failed: {}", pair_id, host_port, e);
            ctx.state.abandon_pair(pair_id);
            respond_bad_gateway(client).await;
            return true;
        }
    };

    let request_bytes = build_upstream_request(&head, origin_form);
    if let Err(e) = upstream.write_all(&request_bytes).await {
        debug!("[{}] write to {} failed: {}", pair_id, host_port, e);
        ctx.state.abandon_pair(pair_id);
        respond_bad_gateway(client).await;
        return true;
    }

    phase = RequestPhase::HeadersReceived;
    debug!("[{}] {:?} {}", pair_id, phase, url);
    let outcome = recorder::proxy_and_record(
        &mut upstream,
        client,
        ctx.state.clone(),
        ctx.max_resource_size,
        &url,
    )
    .await;
    phase = RequestPhase::Streaming;
    debug!("[{}] {:?} {}", pair_id, phase, url);

    match outcome {
        Ok(outcome) => {
            let truncated = outcome.truncated.is_some();
            if truncated {
                // cleanly tear the remote end down mid-stream
                let _ = upstream.shutdown().await;
                phase = RequestPhase::Truncated;
            } else {
                phase = RequestPhase::Complete;
            }
            debug!("[{}] {:?} {} ({} bytes)", pair_id, phase, url, outcome.raw.len());

            let request_ok = ctx
                .warc
                .write(WarcRecord::request(&url, request_bytes))
                .is_ok();
            let response_ok = ctx
                .warc
                .write(WarcRecord::response(&url, outcome.raw, outcome.truncated))
                .is_ok();
            if request_ok && response_ok {
                ctx.state.complete_pair(
                    pair_id,
                    RecordedResponse {
                        url: url.clone(),
                        status: outcome.status,
                        content_type: outcome.content_type,
                        x_robots_tag: outcome.x_robots_tag,
                    },
                );
            } else {
                ctx.state.abandon_pair(pair_id);
            }
            !truncated
        }
        Err(RecorderFailure::StatusLine(reason)) => {
            phase = RequestPhase::Failed;
            debug!("[{}] {:?} {}: {}", pair_id, phase, url, reason);
            ctx.mark_host_bad(&host_port);
            ctx.state.abandon_pair(pair_id);
            respond_bad_gateway(client).await;
            true
        }
        Err(RecorderFailure::Io(e)) => {
            phase = RequestPhase::Failed;
            debug!("[{}] {:?} {}: {}", pair_id, phase, url, e);
            ctx.state.abandon_pair(pair_id);
            false
        }
    }
}

fn split_authority(authority: &str, default_port: u16) -> (String, u16) {
    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (authority.to_string(), default_port),
        },
        None => (authority.to_string(), default_port),
    }
}

/// Requests arriving on one client connection, plain or inside a CONNECT
/// tunnel.
async fn handle_connection(stream: TcpStream, ctx: Arc<ProxyContext>) {
    let mut stream = stream;
    loop {
        let head = match read_request_head(&mut stream).await {
            Ok(Some(head)) => head,
            Ok(None) => return,
            Err(e) => {
                debug!("client request parse failed: {}", e);
                return;
            }
        };

        if head.method.eq_ignore_ascii_case("CONNECT") {
            let (host, port) = split_authority(&head.target, 443);
            if stream
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await
                .is_err()
            {
                return;
            }
            let acceptor = match ctx.tls.acceptor_for(&host) {
                Ok(acceptor) => acceptor,
                Err(e) => {
                    warn!("no TLS leaf for {}: {}", host, e);
                    return;
                }
            };
            let mut tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    debug!("TLS handshake with client failed for {}: {}", host, e);
                    return;
                }
            };
            // serve requests inside the tunnel until the client closes it
            loop {
                let inner = match read_request_head(&mut tls_stream).await {
                    Ok(Some(inner)) => inner,
                    _ => return,
                };
                let origin_form = inner.target.clone();
                let keep_alive = proxy_request(
                    &mut tls_stream,
                    inner,
                    "https",
                    &host,
                    port,
                    &origin_form,
                    &ctx,
                )
                .await;
                if !keep_alive {
                    return;
                }
            }
        }

        // plain proxy request: absolute-form target
        let Ok(parsed) = url::Url::parse(&head.target) else {
            respond_bad_gateway(&mut stream).await;
            continue;
        };
        let Some(host) = parsed.host_str().map(|h| h.to_string()) else {
            respond_bad_gateway(&mut stream).await;
            continue;
        };
        let port = parsed.port().unwrap_or(80);
        let mut origin_form = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            origin_form.push('?');
            origin_form.push_str(query);
        }
        let keep_alive =
            proxy_request(&mut stream, head, "http", &host, port, &origin_form, &ctx).await;
        if !keep_alive {
            return;
        }
    }
}

/// Concurrency caps for the proxy's connection handlers.
#[derive(Debug, Clone, Copy)]
pub struct ProxyLimits {
    /// Max connections handled at once; excess waits in the accept queue.
    pub max_handlers: usize,
    /// Listen backlog for connections not yet accepted.
    pub queue_size: usize,
}

impl Default for ProxyLimits {
    fn default() -> Self {
        Self {
            max_handlers: 500,
            queue_size: 500,
        }
    }
}

/// A running recording proxy.
pub struct RecordingProxy {
    pub address: String,
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl RecordingProxy {
    /// Bind the first free port in the range and start accepting.
    pub async fn start(
        port_range: &PortRange,
        ctx: Arc<ProxyContext>,
        limits: ProxyLimits,
        shutdown_grace: Duration,
    ) -> Result<Self, ProxyError> {
        let mut bound = None;
        for port in port_range.start..port_range.end {
            let socket = tokio::net::TcpSocket::new_v4().map_err(ProxyError::Bind)?;
            match socket.bind(format!("127.0.0.1:{}", port).parse().expect("local addr")) {
                Ok(()) => {
                    let listener = socket
                        .listen(limits.queue_size as u32)
                        .map_err(ProxyError::Bind)?;
                    bound = Some((listener, port));
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
                Err(e) => return Err(ProxyError::Bind(e)),
            }
        }
        let (listener, port) = bound.ok_or(ProxyError::NoOpenPort)?;
        let address = format!("127.0.0.1:{}", port);
        info!("Recording proxy listening on {}", address);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handler_slots = Arc::new(tokio::sync::Semaphore::new(limits.max_handlers));
        let task = tokio::spawn(async move {
            let mut handlers: JoinSet<()> = JoinSet::new();
            loop {
                let slot = tokio::select! {
                    slot = handler_slots.clone().acquire_owned() => match slot {
                        Ok(slot) => slot,
                        Err(_) => break,
                    },
                    _ = shutdown_rx.changed() => break,
                };
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _)) => {
                                let ctx = ctx.clone();
                                handlers.spawn(async move {
                                    let _slot = slot;
                                    handle_connection(stream, ctx).await;
                                });
                            }
                            Err(e) => {
                                warn!("accept failed: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        break;
                    }
                }
            }
            drop(listener);
            // let in-flight handlers drain for the grace period, then drop them
            let drain = async {
                while handlers.join_next().await.is_some() {}
            };
            if tokio::time::timeout(shutdown_grace, drain).await.is_err() {
                warn!("proxy handlers still active at shutdown grace expiry; abandoning them");
                handlers.abort_all();
            }
        });

        Ok(Self {
            address,
            shutdown_tx,
            task,
        })
    }

    /// Stop accepting and wait (bounded by the grace period given at start)
    /// for handlers to drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::warc::test_support::read_record_summaries;
    use crate::capture::warc::WarcWriter;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpListener;

    async fn canned_http_server(response: &'static [u8]) -> String {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream.write_all(response).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        format!("127.0.0.1:{}", addr.port())
    }

    async fn start_proxy(
        state: Arc<CaptureState>,
        warc: WarcWriterHandle,
        blocked: Vec<IpRange>,
    ) -> RecordingProxy {
        let ctx = ProxyContext::new(
            state,
            warc,
            Arc::new(CaptureTls::ephemeral().unwrap()),
            u64::MAX,
            blocked,
            None,
        );
        RecordingProxy::start(
            &PortRange::default(),
            ctx,
            ProxyLimits::default(),
            Duration::from_secs(2),
        )
        .await
        .unwrap()
    }

    async fn proxied_get(proxy_address: &str, url: &str) -> Vec<u8> {
        let mut client = TcpStream::connect(proxy_address).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: ignored\r\nConnection: close\r\n\r\n", url);
        client.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        let _ = client.read_to_end(&mut response).await;
        response
    }

    #[tokio::test]
    async fn records_a_plain_http_exchange() {
        let _ = env_logger::builder().is_test(true).try_init();
        let server =
            canned_http_server(b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 2\r\n\r\nhi")
                .await;

        let dir = tempfile::tempdir().unwrap();
        let warc_path = dir.path().join("recorded.warc.gz");
        let writer = WarcWriter::create(&warc_path).await.unwrap();
        let state = CaptureState::new();
        let proxy = start_proxy(state.clone(), writer.handle(), Vec::new()).await;

        let url = format!("http://{}/page", server);
        let response = proxied_get(&proxy.address, &url).await;
        assert!(response.ends_with(b"hi"), "client got the body through the tee");

        // wait for pair completion
        tokio::time::timeout(Duration::from_secs(2), async {
            while state.first_useful_response("x").is_none() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        let useful = state.first_useful_response("x").unwrap();
        assert_eq!(useful.status, 200);
        assert_eq!(useful.content_type.as_deref(), Some("text/html"));
        assert!(state.bytes_recorded() >= 2);

        proxy.shutdown().await;
        writer.close().await.unwrap();
        let records = read_record_summaries(&std::fs::read(&warc_path).unwrap());
        let types: Vec<&str> = records.iter().map(|r| r.0.as_str()).collect();
        assert_eq!(types, vec!["request", "response"]);
        assert_eq!(records[0].1, url);
    }

    #[tokio::test]
    async fn blocked_ip_ranges_are_refused_without_a_pair() {
        let dir = tempfile::tempdir().unwrap();
        let writer = WarcWriter::create(&dir.path().join("r.warc.gz")).await.unwrap();
        let state = CaptureState::new();
        let blocked = vec![IpRange {
            start: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 0)),
            end: IpAddr::V4(Ipv4Addr::new(127, 255, 255, 255)),
        }];
        let proxy = start_proxy(state.clone(), writer.handle(), blocked).await;

        let response = proxied_get(&proxy.address, "http://127.0.0.1:1/").await;
        assert!(response.starts_with(b"HTTP/1.1 502"));
        assert_eq!(state.pairs_snapshot().len(), 0);
        assert!(!state.was_requested("http://127.0.0.1:1/"));

        proxy.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_host_lands_in_bad_host_cache() {
        let dir = tempfile::tempdir().unwrap();
        let writer = WarcWriter::create(&dir.path().join("r.warc.gz")).await.unwrap();
        let state = CaptureState::new();

        // a listener that accepts then slams the connection: status line
        // can never be read
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let ctx = ProxyContext::new(
            state.clone(),
            writer.handle(),
            Arc::new(CaptureTls::ephemeral().unwrap()),
            u64::MAX,
            Vec::new(),
            None,
        );
        let proxy = RecordingProxy::start(
            &PortRange::default(),
            ctx.clone(),
            ProxyLimits::default(),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        let url = format!("http://127.0.0.1:{}/x", addr.port());
        let response = proxied_get(&proxy.address, &url).await;
        assert!(response.starts_with(b"HTTP/1.1 502"));
        assert!(ctx.host_is_bad(&format!("127.0.0.1:{}", addr.port())));
        // the abandoned pair must not block the capture
        assert_eq!(state.unfinished_pair_count(), 0);

        proxy.shutdown().await;
    }

    #[tokio::test]
    async fn hop_by_hop_headers_are_stripped_and_via_added() {
        let head = RequestHead {
            method: "GET".to_string(),
            target: "http://a.test/".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: vec![
                ("Host".to_string(), "a.test".to_string()),
                ("Proxy-Connection".to_string(), "keep-alive".to_string()),
                ("Keep-Alive".to_string(), "timeout=5".to_string()),
                ("Accept".to_string(), "*/*".to_string()),
            ],
            body: Vec::new(),
        };
        let bytes = build_upstream_request(&head, "/");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("Host: a.test\r\n"));
        assert!(text.contains("Accept: */*\r\n"));
        assert!(text.contains("Via: 1.1 amber\r\n"));
        assert!(!text.to_lowercase().contains("proxy-connection"));
        assert!(!text.to_lowercase().contains("keep-alive"));
    }

    #[test]
    fn authority_splitting_defaults_the_port() {
        assert_eq!(split_authority("a.test:8443", 443), ("a.test".to_string(), 8443));
        assert_eq!(split_authority("a.test", 443), ("a.test".to_string(), 443));
    }
}
