//! Interruptible response recording.
//!
//! `proxy_and_record` reads an upstream HTTP response, streams it to the
//! proxy client, and keeps the raw bytes for the WARC. The read loop
//! consults a `ChunkPolicy` on every chunk and exits early with a
//! truncation marker when the per-resource size cap is exceeded, an
//! external stop was requested, or an open-ended stream has run too long.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::state::CaptureState;
use super::warc::Truncated;

/// Streams without a Content-Length are cut off after this long.
const OPEN_ENDED_STREAM_LIMIT: Duration = Duration::from_secs(3 * 60 * 60);

const CHUNK_SIZE: usize = 16 * 1024;
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Verdict for one streamed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueDecision {
    Continue,
    TruncateLength,
    TruncateTime,
}

/// The per-chunk checks, separated from IO so they are testable.
pub struct ChunkPolicy {
    pub state: Arc<CaptureState>,
    pub max_resource_size: u64,
    pub started: Instant,
    pub has_content_length: bool,
}

impl ChunkPolicy {
    pub fn decide(&self, recorded_len: u64) -> ContinueDecision {
        if recorded_len > self.max_resource_size || self.state.stop_requested() {
            ContinueDecision::TruncateLength
        } else if !self.has_content_length && self.started.elapsed() > OPEN_ENDED_STREAM_LIMIT {
            ContinueDecision::TruncateTime
        } else {
            ContinueDecision::Continue
        }
    }
}

/// The recorded response plus what the orchestrator correlates on.
#[derive(Debug)]
pub struct RecorderOutcome {
    /// Exact bytes received (status line, headers, body as streamed).
    pub raw: Vec<u8>,
    pub status: u16,
    pub content_type: Option<String>,
    /// All x-robots-tag values joined with `;`.
    pub x_robots_tag: String,
    pub truncated: Option<Truncated>,
}

/// Why recording failed before completing.
#[derive(Debug)]
pub enum RecorderFailure {
    /// The remote disconnected or sent garbage before a status line could
    /// be read; the host belongs in the bad-host cache.
    StatusLine(String),
    Io(std::io::Error),
}

impl From<std::io::Error> for RecorderFailure {
    fn from(err: std::io::Error) -> Self {
        RecorderFailure::Io(err)
    }
}

struct ResponseHead {
    status: u16,
    content_length: Option<u64>,
    content_type: Option<String>,
    x_robots_tag: String,
    /// head bytes, including the blank line
    raw: Vec<u8>,
    /// body bytes read past the head while buffering
    body_prefix: Vec<u8>,
}

async fn read_head<R>(upstream: &mut R, url: &str) -> Result<ResponseHead, RecorderFailure>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(RecorderFailure::StatusLine(format!(
                "response head exceeds {} bytes for {}",
                MAX_HEAD_SIZE, url
            )));
        }
        let n = upstream.read(&mut chunk).await?;
        if n == 0 {
            return Err(RecorderFailure::StatusLine(format!(
                "remote disconnected before sending a status line for {}",
                url
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head_bytes = buf[..head_end].to_vec();
    let body_prefix = buf[head_end..].to_vec();
    let head_text = String::from_utf8_lossy(&head_bytes);
    let mut lines = head_text.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let mut status_parts = status_line.split_whitespace();
    let version = status_parts.next().unwrap_or_default();
    let status = status_parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|_| version.starts_with("HTTP/"))
        .ok_or_else(|| {
            RecorderFailure::StatusLine(format!("bad status line {:?} for {}", status_line, url))
        })?;

    let mut content_length = None;
    let mut content_type = None;
    let mut robots_directives: Vec<String> = Vec::new();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.to_ascii_lowercase().as_str() {
            "content-length" => content_length = value.parse::<u64>().ok(),
            "content-type" => content_type = Some(value.to_ascii_lowercase()),
            // multiple directives survive joined with `;`, since several
            // agents may be addressed by separate header lines
            "x-robots-tag" => {
                robots_directives.push(value.replace(['\r', '\n'], ""));
            }
            _ => {}
        }
    }

    Ok(ResponseHead {
        status,
        content_length,
        content_type,
        x_robots_tag: robots_directives.join(";"),
        raw: head_bytes,
        body_prefix,
    })
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Read the upstream response, tee it to the client, and keep the raw
/// bytes. Truncation exits the loop cleanly; the caller shuts the upstream
/// socket down when `outcome.truncated` is set.
pub async fn proxy_and_record<R, W>(
    upstream: &mut R,
    client: &mut W,
    state: Arc<CaptureState>,
    max_resource_size: u64,
    url: &str,
) -> Result<RecorderOutcome, RecorderFailure>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let head = read_head(upstream, url).await?;
    let policy = ChunkPolicy {
        state: state.clone(),
        max_resource_size,
        started: Instant::now(),
        has_content_length: head.content_length.is_some(),
    };

    let mut raw = head.raw.clone();
    client.write_all(&head.raw).await?;

    let mut body_len = 0u64;
    let mut truncated = None;

    // bytes that arrived while buffering the head are body too
    if !head.body_prefix.is_empty() {
        client.write_all(&head.body_prefix).await?;
        raw.extend_from_slice(&head.body_prefix);
        body_len += head.body_prefix.len() as u64;
        state.add_recorded_bytes(head.body_prefix.len() as u64);
    }

    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        if let Some(expected) = head.content_length {
            if body_len >= expected {
                break;
            }
        }
        match policy.decide(body_len) {
            ContinueDecision::Continue => {}
            ContinueDecision::TruncateLength => {
                truncated = Some(Truncated::Length);
                info!("Truncating response from {} (length/stop)", url);
                break;
            }
            ContinueDecision::TruncateTime => {
                truncated = Some(Truncated::Time);
                warn!(
                    "Truncating response from {}: open-ended stream exceeded hard time limit",
                    url
                );
                break;
            }
        }

        let n = upstream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        client.write_all(&chunk[..n]).await?;
        raw.extend_from_slice(&chunk[..n]);
        body_len += n as u64;
        state.add_recorded_bytes(n as u64);
    }
    client.flush().await?;

    Ok(RecorderOutcome {
        raw,
        status: head.status,
        content_type: head.content_type,
        x_robots_tag: head.x_robots_tag,
        truncated,
    })
}
