//! Client for the external archive's S3-like API.
//!
//! Three endpoints matter: the metadata read API, the S3-like write API,
//! and the load-info probe. Every failure is classified into one of the
//! retry classes the state machine budgets against.

use std::collections::BTreeMap;

use log::{debug, info};
use serde_json::Value;

use crate::error_handling::types::{ArchiveApiError, ArchiveErrorClass};

/// Share of a ration we allow before treating the limit as "approaching".
const LIMIT_FRACTION: f64 = 0.8;

/// Phrases the service emits when concurrent uploads race to create the
/// same item; these retry without consuming any budget.
const CONCURRENT_CREATION_PHRASES: &[&str] = &[
    "The bucket namespace is shared",
    "Failed to get necessary short term bucket lock",
    "auto_make_bucket requested",
];

const RATE_LIMIT_PHRASE: &str = "Please reduce your request rate";

/// Classify an error body from the write API.
pub fn classify_error_text(text: &str) -> ArchiveErrorClass {
    if text.contains(RATE_LIMIT_PHRASE) {
        ArchiveErrorClass::RateLimited
    } else if CONCURRENT_CREATION_PHRASES.iter().any(|p| text.contains(p))
        || (text.contains("Checking for identifier availability...") && text.contains("not_available"))
    {
        ArchiveErrorClass::ConcurrentCreation
    } else {
        ArchiveErrorClass::Http
    }
}

fn transport_error(e: reqwest::Error) -> ArchiveApiError {
    ArchiveApiError::new(ArchiveErrorClass::Connection, e.to_string())
}

/// One file as the external service reports it.
#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub name: String,
    pub size: Option<i64>,
    pub metadata: BTreeMap<String, Value>,
}

/// An item's metadata snapshot.
#[derive(Debug, Clone)]
pub struct RemoteItem {
    pub identifier: String,
    pub metadata: BTreeMap<String, Value>,
    pub files: Vec<RemoteFile>,
    pub files_count: i64,
}

impl RemoteItem {
    pub fn get_file(&self, name: &str) -> Option<&RemoteFile> {
        self.files.iter().find(|f| f.name == name)
    }
}

/// The load-info probe's answer.
#[derive(Debug, Clone)]
pub struct LoadInfo {
    pub overloaded: bool,
    pub accesskey_ration: i64,
    pub accesskey_tasks_queued: i64,
    pub bucket_ration: i64,
    pub bucket_tasks_queued: i64,
    pub total_global_limit: i64,
    pub total_tasks_queued: i64,
}

impl LoadInfo {
    fn approaching(queued: i64, ration: i64) -> bool {
        ration > 0 && (queued as f64) >= (ration as f64) * LIMIT_FRACTION
    }

    /// Our key's share of the service is nearly used up.
    pub fn perma_task_limit_approaching(&self) -> bool {
        Self::approaching(self.accesskey_tasks_queued, self.accesskey_ration)
    }

    pub fn global_task_limit_approaching(&self) -> bool {
        Self::approaching(self.total_tasks_queued, self.total_global_limit)
    }

    pub fn bucket_task_limit_approaching(&self) -> bool {
        Self::approaching(self.bucket_tasks_queued, self.bucket_ration)
    }
}

/// Session against the external archive.
pub struct ArchiveSession {
    http: reqwest::Client,
    endpoint: String,
    metadata_endpoint: String,
    access_key: String,
    secret_key: String,
}

impl ArchiveSession {
    pub fn new(
        endpoint: &str,
        metadata_endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, ArchiveApiError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(transport_error)?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            metadata_endpoint: metadata_endpoint.trim_end_matches('/').to_string(),
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
        })
    }

    fn auth_header(&self) -> String {
        format!("LOW {}:{}", self.access_key, self.secret_key)
    }

    /// Item metadata snapshot. An item that does not exist yet comes back
    /// as an empty snapshot, not an error.
    pub async fn get_item(&self, identifier: &str) -> Result<RemoteItem, ArchiveApiError> {
        let url = format!("{}/{}", self.metadata_endpoint, identifier);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(ArchiveApiError::new(classify_error_text(&text), text));
        }
        let value: Value = serde_json::from_str(&text).map_err(|e| {
            ArchiveApiError::new(ArchiveErrorClass::Http, format!("bad metadata JSON: {}", e))
        })?;

        let metadata = value
            .get("metadata")
            .and_then(|m| m.as_object())
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        let files: Vec<RemoteFile> = value
            .get("files")
            .and_then(|f| f.as_array())
            .map(|files| {
                files
                    .iter()
                    .filter_map(|f| {
                        let obj = f.as_object()?;
                        Some(RemoteFile {
                            name: obj.get("name")?.as_str()?.to_string(),
                            size: obj.get("size").and_then(|s| {
                                s.as_i64().or_else(|| s.as_str()?.parse().ok())
                            }),
                            metadata: obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        let files_count = value
            .get("files_count")
            .and_then(|c| c.as_i64())
            .unwrap_or(files.len() as i64);

        debug!("{}: {} file(s) on the external side", identifier, files.len());
        Ok(RemoteItem {
            identifier: identifier.to_string(),
            metadata,
            files,
            files_count,
        })
    }

    /// PUT one file into an item, creating the item on first write.
    /// Metadata headers ride along on every call; derive queueing stays
    /// off (the confirmation poller flags derives instead) and internal
    /// retries are disabled, since retry policy lives in the state machine.
    pub async fn upload_file(
        &self,
        identifier: &str,
        key: &str,
        body: tokio::fs::File,
        metadata: &BTreeMap<String, String>,
        file_metadata: &BTreeMap<String, String>,
    ) -> Result<(), ArchiveApiError> {
        let url = format!("{}/{}/{}", self.endpoint, identifier, key);
        let mut request = self
            .http
            .put(&url)
            .header("authorization", self.auth_header())
            .header("x-archive-auto-make-bucket", "1")
            .header("x-archive-queue-derive", "0");
        for (k, v) in metadata {
            request = request.header(format!("x-archive-meta-{}", k), sanitize_header_value(v));
        }
        for (k, v) in file_metadata {
            request = request.header(format!("x-archive-filemeta-{}", k), sanitize_header_value(v));
        }

        let response = request
            .body(reqwest::Body::from(body))
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status.as_u16() != 200 {
            return Err(ArchiveApiError::new(
                classify_error_text(&text),
                format!("IA returned {}: {}", status.as_u16(), text),
            ));
        }
        info!("Uploaded {} to {}", key, identifier);
        Ok(())
    }

    /// DELETE one file from an item, without cascading to derived files.
    pub async fn delete_file(&self, identifier: &str, key: &str) -> Result<(), ArchiveApiError> {
        let url = format!("{}/{}/{}", self.endpoint, identifier, key);
        let response = self
            .http
            .delete(&url)
            .header("authorization", self.auth_header())
            .header("x-archive-cascade-delete", "0")
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status.as_u16() != 204 {
            return Err(ArchiveApiError::new(
                classify_error_text(&text),
                format!("IA returned {}: {}", status.as_u16(), text),
            ));
        }
        info!("Requested deletion of {} from {}", key, identifier);
        Ok(())
    }

    /// Probe the write API's load before spending an upload slot.
    pub async fn get_s3_load_info(&self, identifier: &str) -> Result<LoadInfo, ArchiveApiError> {
        let url = format!(
            "{}/?check_limit=1&accesskey={}&bucket={}",
            self.endpoint, self.access_key, identifier
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(transport_error)?;
        let text = response.text().await.map_err(transport_error)?;
        let value: Value = serde_json::from_str(&text).map_err(|e| {
            ArchiveApiError::new(ArchiveErrorClass::Http, format!("bad load info JSON: {}", e))
        })?;

        let detail = value.get("detail").cloned().unwrap_or(Value::Null);
        let int = |v: &Value, key: &str| v.get(key).and_then(|x| x.as_i64()).unwrap_or(0);
        Ok(LoadInfo {
            overloaded: value
                .get("over_limit")
                .and_then(|x| x.as_i64())
                .unwrap_or(0)
                != 0,
            accesskey_ration: int(&detail, "accesskey_ration"),
            accesskey_tasks_queued: int(&detail, "accesskey_tasks_queued"),
            bucket_ration: int(&detail, "bucket_ration"),
            bucket_tasks_queued: int(&detail, "bucket_tasks_queued"),
            total_global_limit: int(&detail, "total_global_limit"),
            total_tasks_queued: int(&detail, "total_tasks_queued"),
        })
    }
}

/// Header values cannot carry newlines; the service normalizes whitespace
/// anyway, so flatten it here.
fn sanitize_header_value(v: &str) -> String {
    v.replace(['\r', '\n'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn session(server: &MockServer) -> ArchiveSession {
        ArchiveSession::new(&server.uri(), &format!("{}/metadata", server.uri()), "ak", "sk")
            .unwrap()
    }

    #[tokio::test]
    async fn get_item_parses_files_and_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metadata/daily_perma_cc_2024-03-07"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "metadata": {"title": "Perma.cc archives", "addeddate": "2024-03-07 10:00:00"},
                "files": [
                    {"name": "archive-abc.warc.gz", "size": "123", "title": "T"},
                ],
                "files_count": 1
            })))
            .mount(&server)
            .await;

        let item = session(&server)
            .await
            .get_item("daily_perma_cc_2024-03-07")
            .await
            .unwrap();
        assert_eq!(item.files_count, 1);
        let file = item.get_file("archive-abc.warc.gz").unwrap();
        assert_eq!(file.size, Some(123));
        assert!(item.get_file("archive-missing.warc.gz").is_none());
    }

    #[tokio::test]
    async fn upload_success_requires_exactly_200() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/item/archive-x.warc.gz"))
            .and(header("x-archive-queue-derive", "0"))
            .and(header("authorization", "LOW ak:sk"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let file = tokio::fs::File::open("/dev/null").await.unwrap();
        let metadata = BTreeMap::from([("title".to_string(), "daily".to_string())]);
        session(&server)
            .await
            .upload_file("item", "archive-x.warc.gz", file, &metadata, &BTreeMap::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rate_limit_body_classifies_as_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(
                ResponseTemplate::new(503).set_body_string("Please reduce your request rate."),
            )
            .mount(&server)
            .await;

        let file = tokio::fs::File::open("/dev/null").await.unwrap();
        let err = session(&server)
            .await
            .upload_file("item", "k", file, &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.class, ArchiveErrorClass::RateLimited);
    }

    #[tokio::test]
    async fn concurrent_creation_phrases_classify_budget_free() {
        for text in [
            "The bucket namespace is shared ...",
            "Failed to get necessary short term bucket lock",
            "auto_make_bucket requested for existing bucket",
            "Checking for identifier availability... not_available",
        ] {
            assert_eq!(
                classify_error_text(text),
                ArchiveErrorClass::ConcurrentCreation,
                "{}",
                text
            );
        }
        assert_eq!(classify_error_text("not_available"), ArchiveErrorClass::Http);
        assert_eq!(
            classify_error_text("500 Internal Server Error"),
            ArchiveErrorClass::Http
        );
    }

    #[tokio::test]
    async fn load_info_limits_approach_at_the_fraction() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "over_limit": 0,
                "detail": {
                    "accesskey_ration": 10,
                    "accesskey_tasks_queued": 8,
                    "bucket_ration": 10,
                    "bucket_tasks_queued": 1,
                    "total_global_limit": 100,
                    "total_tasks_queued": 5
                }
            })))
            .mount(&server)
            .await;

        let info = session(&server).await.get_s3_load_info("item").await.unwrap();
        assert!(!info.overloaded);
        assert!(info.perma_task_limit_approaching());
        assert!(!info.bucket_task_limit_approaching());
        assert!(!info.global_task_limit_approaching());
    }

    #[tokio::test]
    async fn connection_failures_classify_as_connection() {
        // nothing listens on this port
        let session =
            ArchiveSession::new("http://127.0.0.1:1", "http://127.0.0.1:1", "ak", "sk").unwrap();
        let err = session.get_item("item").await.unwrap_err();
        assert_eq!(err.class, ArchiveErrorClass::Connection);
    }
}
