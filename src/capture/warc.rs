//! WARC/1.0 writing and assembly.
//!
//! Records are written as individually-gzipped members, so finished archives
//! can be concatenated byte-for-byte. The recording proxy feeds a background
//! writer task through an unbounded queue; the assembler later merges the
//! recorded file with synthesized resource records into the final archive.

use std::io::Write;

use chrono::{DateTime, SecondsFormat, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, info};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error_handling::types::WarcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Warcinfo,
    Request,
    Response,
    Resource,
}

impl RecordType {
    fn as_str(&self) -> &'static str {
        match self {
            RecordType::Warcinfo => "warcinfo",
            RecordType::Request => "request",
            RecordType::Response => "response",
            RecordType::Resource => "resource",
        }
    }
}

/// Why a record's block is shorter than the full network payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truncated {
    /// Size cap hit, or an external stop ended the stream.
    Length,
    /// Open-ended stream exceeded the hard time limit.
    Time,
}

impl Truncated {
    fn as_str(&self) -> &'static str {
        match self {
            Truncated::Length => "length",
            Truncated::Time => "time",
        }
    }
}

/// One WARC record ready to be serialized.
#[derive(Debug, Clone)]
pub struct WarcRecord {
    pub record_type: RecordType,
    pub target_uri: Option<String>,
    /// Content-Type of the record block itself.
    pub content_type: String,
    pub date: DateTime<Utc>,
    pub truncated: Option<Truncated>,
    pub block: Vec<u8>,
}

impl WarcRecord {
    pub fn response(url: &str, raw_http: Vec<u8>, truncated: Option<Truncated>) -> Self {
        Self {
            record_type: RecordType::Response,
            target_uri: Some(url.to_string()),
            content_type: "application/http;msgtype=response".to_string(),
            date: Utc::now(),
            truncated,
            block: raw_http,
        }
    }

    pub fn request(url: &str, raw_http: Vec<u8>) -> Self {
        Self {
            record_type: RecordType::Request,
            target_uri: Some(url.to_string()),
            content_type: "application/http;msgtype=request".to_string(),
            date: Utc::now(),
            truncated: None,
            block: raw_http,
        }
    }

    pub fn resource(url: &str, content_type: &str, body: Vec<u8>) -> Self {
        Self {
            record_type: RecordType::Resource,
            target_uri: Some(url.to_string()),
            content_type: content_type.to_string(),
            date: Utc::now(),
            truncated: None,
            block: body,
        }
    }

    pub fn warcinfo(filename: &str, created: DateTime<Utc>) -> Self {
        let block = format!(
            "software: amber\r\nformat: WARC File Format 1.0\r\ncreated: {}\r\n",
            created.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
        .into_bytes();
        Self {
            record_type: RecordType::Warcinfo,
            target_uri: Some(filename.to_string()),
            content_type: "application/warc-fields".to_string(),
            date: created,
            truncated: None,
            block,
        }
    }

    /// Serialize as one gzip member.
    pub fn to_gzip_member(&self) -> Result<Vec<u8>, WarcError> {
        let mut head = String::new();
        head.push_str("WARC/1.0\r\n");
        head.push_str(&format!("WARC-Type: {}\r\n", self.record_type.as_str()));
        head.push_str(&format!("WARC-Record-ID: <urn:uuid:{}>\r\n", Uuid::new_v4()));
        head.push_str(&format!(
            "WARC-Date: {}\r\n",
            self.date.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        if let Some(uri) = &self.target_uri {
            match self.record_type {
                RecordType::Warcinfo => head.push_str(&format!("WARC-Filename: {}\r\n", uri)),
                _ => head.push_str(&format!("WARC-Target-URI: {}\r\n", uri)),
            }
        }
        if let Some(truncated) = self.truncated {
            head.push_str(&format!("WARC-Truncated: {}\r\n", truncated.as_str()));
        }
        head.push_str(&format!("Content-Type: {}\r\n", self.content_type));
        head.push_str(&format!("Content-Length: {}\r\n", self.block.len()));
        head.push_str("\r\n");

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(head.as_bytes())?;
        encoder.write_all(&self.block)?;
        encoder.write_all(b"\r\n\r\n")?;
        Ok(encoder.finish()?)
    }
}

/// Handle used by proxy handlers to enqueue finished records.
#[derive(Clone)]
pub struct WarcWriterHandle {
    tx: mpsc::UnboundedSender<WarcRecord>,
}

impl WarcWriterHandle {
    pub fn write(&self, record: WarcRecord) -> Result<(), WarcError> {
        self.tx.send(record).map_err(|_| WarcError::QueueClosed)
    }
}

/// Background writer appending gzip members to the recorded file in queue
/// order (which is response-completion order).
pub struct WarcWriter {
    handle: WarcWriterHandle,
    task: JoinHandle<Result<(), WarcError>>,
}

impl WarcWriter {
    pub async fn create(path: &std::path::Path) -> Result<Self, WarcError> {
        let file = fs::File::create(path).await?;
        let (tx, mut rx) = mpsc::unbounded_channel::<WarcRecord>();
        let path_display = path.display().to_string();
        let task = tokio::spawn(async move {
            let mut file = file;
            let mut written = 0usize;
            while let Some(record) = rx.recv().await {
                let member = record.to_gzip_member()?;
                file.write_all(&member).await?;
                written += 1;
            }
            file.flush().await?;
            debug!("WARC writer for {} flushed {} record(s)", path_display, written);
            Ok(())
        });
        Ok(Self {
            handle: WarcWriterHandle { tx },
            task,
        })
    }

    pub fn handle(&self) -> WarcWriterHandle {
        self.handle.clone()
    }

    /// Close the queue and block until every queued record is on disk.
    pub async fn close(self) -> Result<(), WarcError> {
        drop(self.handle);
        self.task.await.map_err(|_| WarcError::QueueClosed)?
    }
}

/// Merge the recorded file and synthesized records into the final archive.
///
/// Record order in the output: the envelope warcinfo, the screenshot
/// resource (if any), then every recorded record byte-for-byte in the order
/// the proxy completed them. Returns the assembled archive.
pub async fn assemble_archive(
    warc_filename: &str,
    link_created_at: DateTime<Utc>,
    screenshot: Option<(&str, Vec<u8>)>,
    recorded_path: &std::path::Path,
) -> Result<Vec<u8>, WarcError> {
    let mut out = Vec::new();
    out.extend(WarcRecord::warcinfo(warc_filename, link_created_at).to_gzip_member()?);

    let had_screenshot = screenshot.is_some();
    if let Some((screenshot_url, png)) = screenshot {
        out.extend(WarcRecord::resource(screenshot_url, "image/png", png).to_gzip_member()?);
    }

    // gzip members concatenate, so the recorded file is appended verbatim,
    // preserving completion order
    let recorded = fs::read(recorded_path).await?;
    out.extend_from_slice(&recorded);

    info!(
        "Assembled {}: {} byte(s){}",
        warc_filename,
        out.len(),
        if had_screenshot {
            " (with screenshot)"
        } else {
            ""
        }
    );
    Ok(out)
}

#[cfg(test)]
pub mod test_support {
    //! Decoding helpers for asserting on finished archives.

    use flate2::read::MultiGzDecoder;
    use std::io::Read;

    /// `(WARC-Type, WARC-Target-URI or filename, truncated?)` per record.
    pub fn read_record_summaries(raw: &[u8]) -> Vec<(String, String, Option<String>)> {
        let mut decoder = MultiGzDecoder::new(raw);
        let mut all = Vec::new();
        decoder.read_to_end(&mut all).expect("gunzip");

        let text = String::from_utf8_lossy(&all);
        let mut records = Vec::new();
        for chunk in text.split("WARC/1.0\r\n").skip(1) {
            let mut warc_type = String::new();
            let mut uri = String::new();
            let mut truncated = None;
            for line in chunk.lines().take_while(|l| !l.is_empty()) {
                if let Some(v) = line.strip_prefix("WARC-Type: ") {
                    warc_type = v.to_string();
                } else if let Some(v) = line.strip_prefix("WARC-Target-URI: ") {
                    uri = v.to_string();
                } else if let Some(v) = line.strip_prefix("WARC-Filename: ") {
                    uri = v.to_string();
                } else if let Some(v) = line.strip_prefix("WARC-Truncated: ") {
                    truncated = Some(v.to_string());
                }
            }
            records.push((warc_type, uri, truncated));
        }
        records
    }
}
