//! SQLite-backed LinkStore implementation using SeaORM.
//!
//! Schema is bootstrapped with `CREATE TABLE IF NOT EXISTS` on connect.
//! Timestamps are RFC3339 strings, enums status strings, tags a JSON array.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, error, info, warn};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, DbBackend,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set, Statement, TransactionTrait,
};
use uuid::Uuid;

use crate::error_handling::types::StorageError;
use crate::models::{
    Capture, CaptureJob, CaptureRole, CaptureStatus, FileStatus, InternetArchiveFile,
    InternetArchiveItem, JobStatus, Link, PrivateReason,
};
use crate::storage::db_entities as links;
use crate::storage::db_entities::{capture_jobs, captures, ia_files, ia_items};
use crate::storage::link_store::LinkStore;

/// LinkStore backend that uses SQLite via SeaORM.
pub struct DbLinkStore {
    conn: DatabaseConnection,
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS links (
        guid TEXT PRIMARY KEY,
        submitted_url TEXT NOT NULL,
        created_at TEXT NOT NULL,
        submitted_title TEXT NOT NULL,
        submitted_description TEXT NOT NULL,
        is_private INTEGER NOT NULL,
        private_reason TEXT,
        warc_size INTEGER,
        cached_can_play_back INTEGER,
        user_deleted INTEGER NOT NULL,
        tags TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS captures (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        link_guid TEXT NOT NULL,
        role TEXT NOT NULL,
        status TEXT NOT NULL,
        record_type TEXT NOT NULL,
        url TEXT NOT NULL,
        content_type TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS capture_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        link_guid TEXT NOT NULL,
        status TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        capture_start_time TEXT,
        step_count REAL NOT NULL,
        step_description TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ia_items (
        identifier TEXT PRIMARY KEY,
        span_start TEXT NOT NULL,
        span_end TEXT NOT NULL,
        confirmed_exists INTEGER NOT NULL,
        derive_required INTEGER NOT NULL,
        complete INTEGER NOT NULL,
        tasks_in_progress INTEGER NOT NULL,
        added_date TEXT,
        cached_title TEXT,
        cached_description TEXT,
        cached_file_count INTEGER
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ia_files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        item_id TEXT NOT NULL,
        link_guid TEXT NOT NULL,
        status TEXT NOT NULL,
        cached_size INTEGER,
        cached_title TEXT,
        cached_comments TEXT,
        cached_external_identifier TEXT,
        cached_external_identifier_match_date TEXT,
        cached_format TEXT,
        cached_submitted_url TEXT,
        cached_perma_url TEXT,
        UNIQUE(item_id, link_guid)
    );
    "#,
];

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::ReadFailed(format!("bad timestamp {}: {}", raw, e)))
}

fn parse_guid(raw: &str) -> Result<Uuid, StorageError> {
    raw.parse::<Uuid>()
        .map_err(|e| StorageError::ReadFailed(format!("bad guid {}: {}", raw, e)))
}

fn link_from_model(model: links::Model) -> Result<Link, StorageError> {
    Ok(Link {
        guid: parse_guid(&model.guid)?,
        submitted_url: model.submitted_url,
        created_at: parse_ts(&model.created_at)?,
        submitted_title: model.submitted_title,
        submitted_description: model.submitted_description,
        is_private: model.is_private,
        private_reason: model.private_reason.as_deref().and_then(PrivateReason::from_str),
        warc_size: model.warc_size.map(|s| s as u64),
        cached_can_play_back: model.cached_can_play_back,
        user_deleted: model.user_deleted,
        tags: serde_json::from_str(&model.tags).unwrap_or_default(),
    })
}

fn job_from_model(model: capture_jobs::Model) -> Result<CaptureJob, StorageError> {
    Ok(CaptureJob {
        id: model.id,
        link_guid: parse_guid(&model.link_guid)?,
        status: JobStatus::from_str(&model.status)
            .ok_or_else(|| StorageError::ReadFailed(format!("bad job status {}", model.status)))?,
        attempt: model.attempt as u32,
        capture_start_time: match model.capture_start_time {
            Some(raw) => Some(parse_ts(&raw)?),
            None => None,
        },
        step_count: model.step_count,
        step_description: model.step_description,
    })
}

fn capture_from_model(model: captures::Model) -> Result<Capture, StorageError> {
    let role = match model.role.as_str() {
        "primary" => CaptureRole::Primary,
        "screenshot" => CaptureRole::Screenshot,
        "favicon" => CaptureRole::Favicon,
        other => {
            return Err(StorageError::ReadFailed(format!(
                "bad capture role {}",
                other
            )))
        }
    };
    Ok(Capture {
        link_guid: parse_guid(&model.link_guid)?,
        role,
        status: CaptureStatus::from_str(&model.status).ok_or_else(|| {
            StorageError::ReadFailed(format!("bad capture status {}", model.status))
        })?,
        record_type: model.record_type,
        url: model.url,
        content_type: model.content_type,
    })
}

fn item_from_model(model: ia_items::Model) -> Result<InternetArchiveItem, StorageError> {
    Ok(InternetArchiveItem {
        identifier: model.identifier,
        span_start: parse_ts(&model.span_start)?,
        span_end: parse_ts(&model.span_end)?,
        confirmed_exists: model.confirmed_exists,
        derive_required: model.derive_required,
        complete: model.complete,
        tasks_in_progress: model.tasks_in_progress,
        added_date: match model.added_date {
            Some(raw) => Some(parse_ts(&raw)?),
            None => None,
        },
        cached_title: model.cached_title,
        cached_description: model.cached_description,
        cached_file_count: model.cached_file_count,
    })
}

fn file_from_model(model: ia_files::Model) -> Result<InternetArchiveFile, StorageError> {
    Ok(InternetArchiveFile {
        id: model.id,
        item_id: model.item_id,
        link_guid: parse_guid(&model.link_guid)?,
        status: FileStatus::from_str(&model.status).ok_or_else(|| {
            StorageError::ReadFailed(format!("bad file status {}", model.status))
        })?,
        cached_size: model.cached_size,
        cached_title: model.cached_title,
        cached_comments: model.cached_comments,
        cached_external_identifier: model.cached_external_identifier,
        cached_external_identifier_match_date: match model.cached_external_identifier_match_date {
            Some(raw) => Some(parse_ts(&raw)?),
            None => None,
        },
        cached_format: model.cached_format,
        cached_submitted_url: model.cached_submitted_url,
        cached_perma_url: model.cached_perma_url,
    })
}

impl DbLinkStore {
    /// Create or open the database at the specified filesystem path.
    pub async fn new_file<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
            }
        }
        info!("Connecting to SQLite at: {}", path_ref.display());
        let dsn = format!("sqlite://{}?mode=rwc", path_ref.to_string_lossy());
        Self::connect(&dsn).await
    }

    /// In-memory database, for tests.
    pub async fn new_in_memory() -> Result<Self, StorageError> {
        Self::connect("sqlite::memory:").await
    }

    async fn connect(dsn: &str) -> Result<Self, StorageError> {
        let conn = Database::connect(dsn).await.map_err(|e| {
            error!("DB connect failed: {}", e);
            StorageError::ConnectionFailed(e.to_string())
        })?;
        for ddl in SCHEMA {
            conn.execute(Statement::from_string(DbBackend::Sqlite, ddl.to_string()))
                .await
                .map_err(|e| {
                    error!("Schema bootstrap failed: {}", e);
                    StorageError::WriteFailed(e.to_string())
                })?;
        }
        debug!("Database schema ensured");
        Ok(Self { conn })
    }
}

#[async_trait]
impl LinkStore for DbLinkStore {
    async fn create_link(&self, link: &Link) -> Result<(), StorageError> {
        links::ActiveModel {
            guid: Set(link.guid.to_string()),
            submitted_url: Set(link.submitted_url.clone()),
            created_at: Set(link.created_at.to_rfc3339()),
            submitted_title: Set(link.submitted_title.clone()),
            submitted_description: Set(link.submitted_description.clone()),
            is_private: Set(link.is_private),
            private_reason: Set(link.private_reason.map(|r| r.as_str().to_string())),
            warc_size: Set(link.warc_size.map(|s| s as i64)),
            cached_can_play_back: Set(link.cached_can_play_back),
            user_deleted: Set(link.user_deleted),
            tags: Set(serde_json::to_string(&link.tags).unwrap_or_else(|_| "[]".to_string())),
        }
        .insert(&self.conn)
        .await?;
        Ok(())
    }

    async fn get_link(&self, guid: Uuid) -> Result<Link, StorageError> {
        let model = links::Entity::find_by_id(guid.to_string())
            .one(&self.conn)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("link {}", guid)))?;
        link_from_model(model)
    }

    async fn set_link_private(
        &self,
        guid: Uuid,
        reason: PrivateReason,
    ) -> Result<(), StorageError> {
        links::Entity::update_many()
            .col_expr(links::Column::IsPrivate, Expr::value(true))
            .col_expr(
                links::Column::PrivateReason,
                Expr::value(reason.as_str().to_string()),
            )
            .filter(links::Column::Guid.eq(guid.to_string()))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn set_link_title(&self, guid: Uuid, title: &str) -> Result<(), StorageError> {
        links::Entity::update_many()
            .col_expr(links::Column::SubmittedTitle, Expr::value(title.to_string()))
            .filter(links::Column::Guid.eq(guid.to_string()))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn set_link_description(
        &self,
        guid: Uuid,
        description: &str,
    ) -> Result<(), StorageError> {
        links::Entity::update_many()
            .col_expr(
                links::Column::SubmittedDescription,
                Expr::value(description.to_string()),
            )
            .filter(links::Column::Guid.eq(guid.to_string()))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn set_link_warc_size(&self, guid: Uuid, size: u64) -> Result<(), StorageError> {
        links::Entity::update_many()
            .col_expr(links::Column::WarcSize, Expr::value(size as i64))
            .filter(links::Column::Guid.eq(guid.to_string()))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn add_link_tag(&self, guid: Uuid, tag: &str) -> Result<(), StorageError> {
        // read-modify-write; tags are only touched by the single orchestrator
        let link = self.get_link(guid).await?;
        if link.tags.iter().any(|t| t == tag) {
            return Ok(());
        }
        let mut tags = link.tags;
        tags.push(tag.to_string());
        links::Entity::update_many()
            .col_expr(
                links::Column::Tags,
                Expr::value(serde_json::to_string(&tags).unwrap_or_else(|_| "[]".to_string())),
            )
            .filter(links::Column::Guid.eq(guid.to_string()))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn create_capture(&self, capture: &Capture) -> Result<(), StorageError> {
        captures::ActiveModel {
            link_guid: Set(capture.link_guid.to_string()),
            role: Set(capture.role.as_str().to_string()),
            status: Set(capture.status.as_str().to_string()),
            record_type: Set(capture.record_type.clone()),
            url: Set(capture.url.clone()),
            content_type: Set(capture.content_type.clone()),
            ..Default::default()
        }
        .insert(&self.conn)
        .await?;
        Ok(())
    }

    async fn get_capture(
        &self,
        guid: Uuid,
        role: CaptureRole,
    ) -> Result<Option<Capture>, StorageError> {
        let model = captures::Entity::find()
            .filter(captures::Column::LinkGuid.eq(guid.to_string()))
            .filter(captures::Column::Role.eq(role.as_str()))
            .one(&self.conn)
            .await?;
        model.map(capture_from_model).transpose()
    }

    async fn set_capture_status(
        &self,
        guid: Uuid,
        role: CaptureRole,
        status: CaptureStatus,
    ) -> Result<(), StorageError> {
        captures::Entity::update_many()
            .col_expr(
                captures::Column::Status,
                Expr::value(status.as_str().to_string()),
            )
            .filter(captures::Column::LinkGuid.eq(guid.to_string()))
            .filter(captures::Column::Role.eq(role.as_str()))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn set_capture_content_type(
        &self,
        guid: Uuid,
        role: CaptureRole,
        content_type: &str,
    ) -> Result<(), StorageError> {
        captures::Entity::update_many()
            .col_expr(
                captures::Column::ContentType,
                Expr::value(content_type.to_string()),
            )
            .filter(captures::Column::LinkGuid.eq(guid.to_string()))
            .filter(captures::Column::Role.eq(role.as_str()))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn mark_pending_captures_failed(&self, guid: Uuid) -> Result<u64, StorageError> {
        let result = captures::Entity::update_many()
            .col_expr(
                captures::Column::Status,
                Expr::value(CaptureStatus::Failed.as_str().to_string()),
            )
            .filter(captures::Column::LinkGuid.eq(guid.to_string()))
            .filter(captures::Column::Status.eq(CaptureStatus::Pending.as_str()))
            .exec(&self.conn)
            .await?;
        Ok(result.rows_affected)
    }

    async fn create_job(&self, link_guid: Uuid) -> Result<CaptureJob, StorageError> {
        let model = capture_jobs::ActiveModel {
            link_guid: Set(link_guid.to_string()),
            status: Set(JobStatus::Pending.as_str().to_string()),
            attempt: Set(0),
            capture_start_time: Set(None),
            step_count: Set(0.0),
            step_description: Set(String::new()),
            ..Default::default()
        }
        .insert(&self.conn)
        .await?;
        job_from_model(model)
    }

    async fn reclaim_stale_jobs(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let in_progress = capture_jobs::Entity::find()
            .filter(capture_jobs::Column::Status.eq(JobStatus::InProgress.as_str()))
            .all(&self.conn)
            .await?;

        let mut reclaimed = 0;
        for model in in_progress {
            let started = match model.capture_start_time.as_deref() {
                Some(raw) => parse_ts(raw)?,
                None => continue,
            };
            if started >= stale_before {
                continue;
            }
            let guid = parse_guid(&model.link_guid)?;
            warn!("Reclaiming stale capture job {} ({})", model.id, guid);
            capture_jobs::Entity::update_many()
                .col_expr(
                    capture_jobs::Column::Status,
                    Expr::value(JobStatus::Failed.as_str().to_string()),
                )
                .filter(capture_jobs::Column::Id.eq(model.id))
                .exec(&self.conn)
                .await?;
            self.mark_pending_captures_failed(guid).await?;
            self.add_link_tag(guid, "hard-timeout-failure").await?;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    async fn reserve_next_job(&self) -> Result<Option<CaptureJob>, StorageError> {
        // Reserve under a transaction so two workers cannot take the same job.
        let txn = self.conn.begin().await?;
        let candidate = capture_jobs::Entity::find()
            .filter(capture_jobs::Column::Status.eq(JobStatus::Pending.as_str()))
            .order_by_asc(capture_jobs::Column::Id)
            .one(&txn)
            .await?;
        let Some(model) = candidate else {
            txn.commit().await?;
            return Ok(None);
        };
        let now = Utc::now();
        let updated = capture_jobs::Entity::update_many()
            .col_expr(
                capture_jobs::Column::Status,
                Expr::value(JobStatus::InProgress.as_str().to_string()),
            )
            .col_expr(
                capture_jobs::Column::CaptureStartTime,
                Expr::value(now.to_rfc3339()),
            )
            .filter(capture_jobs::Column::Id.eq(model.id))
            .filter(capture_jobs::Column::Status.eq(JobStatus::Pending.as_str()))
            .exec(&txn)
            .await?;
        txn.commit().await?;
        if updated.rows_affected == 0 {
            return Ok(None);
        }
        let mut job = job_from_model(model)?;
        job.status = JobStatus::InProgress;
        job.capture_start_time = Some(now);
        Ok(Some(job))
    }

    async fn update_job_progress(
        &self,
        job_id: i64,
        step_count: f32,
        step_description: &str,
    ) -> Result<(), StorageError> {
        capture_jobs::Entity::update_many()
            .col_expr(capture_jobs::Column::StepCount, Expr::value(step_count))
            .col_expr(
                capture_jobs::Column::StepDescription,
                Expr::value(step_description.to_string()),
            )
            .filter(capture_jobs::Column::Id.eq(job_id))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn set_job_attempt(&self, job_id: i64, attempt: u32) -> Result<(), StorageError> {
        capture_jobs::Entity::update_many()
            .col_expr(capture_jobs::Column::Attempt, Expr::value(attempt as i32))
            .filter(capture_jobs::Column::Id.eq(job_id))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn set_job_status(&self, job_id: i64, status: JobStatus) -> Result<(), StorageError> {
        capture_jobs::Entity::update_many()
            .col_expr(
                capture_jobs::Column::Status,
                Expr::value(status.as_str().to_string()),
            )
            .filter(capture_jobs::Column::Id.eq(job_id))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn get_job(&self, job_id: i64) -> Result<CaptureJob, StorageError> {
        let model = capture_jobs::Entity::find_by_id(job_id)
            .one(&self.conn)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("capture job {}", job_id)))?;
        job_from_model(model)
    }

    async fn get_or_create_item(
        &self,
        item: &InternetArchiveItem,
    ) -> Result<InternetArchiveItem, StorageError> {
        if let Some(existing) = self.get_item(&item.identifier).await? {
            return Ok(existing);
        }
        let insert = ia_items::ActiveModel {
            identifier: Set(item.identifier.clone()),
            span_start: Set(item.span_start.to_rfc3339()),
            span_end: Set(item.span_end.to_rfc3339()),
            confirmed_exists: Set(item.confirmed_exists),
            derive_required: Set(item.derive_required),
            complete: Set(item.complete),
            tasks_in_progress: Set(item.tasks_in_progress),
            added_date: Set(item.added_date.map(|d| d.to_rfc3339())),
            cached_title: Set(item.cached_title.clone()),
            cached_description: Set(item.cached_description.clone()),
            cached_file_count: Set(item.cached_file_count),
        }
        .insert(&self.conn)
        .await;
        match insert {
            Ok(model) => item_from_model(model),
            // lost a create race; the row exists now
            Err(_) => self
                .get_item(&item.identifier)
                .await?
                .ok_or_else(|| StorageError::NotFound(format!("item {}", item.identifier))),
        }
    }

    async fn get_item(
        &self,
        identifier: &str,
    ) -> Result<Option<InternetArchiveItem>, StorageError> {
        let model = ia_items::Entity::find_by_id(identifier.to_string())
            .one(&self.conn)
            .await?;
        model.map(item_from_model).transpose()
    }

    async fn update_item(&self, item: &InternetArchiveItem) -> Result<(), StorageError> {
        ia_items::Entity::update_many()
            .col_expr(
                ia_items::Column::ConfirmedExists,
                Expr::value(item.confirmed_exists),
            )
            .col_expr(
                ia_items::Column::DeriveRequired,
                Expr::value(item.derive_required),
            )
            .col_expr(ia_items::Column::Complete, Expr::value(item.complete))
            .col_expr(
                ia_items::Column::AddedDate,
                Expr::value(item.added_date.map(|d| d.to_rfc3339())),
            )
            .col_expr(
                ia_items::Column::CachedTitle,
                Expr::value(item.cached_title.clone()),
            )
            .col_expr(
                ia_items::Column::CachedDescription,
                Expr::value(item.cached_description.clone()),
            )
            .col_expr(
                ia_items::Column::CachedFileCount,
                Expr::value(item.cached_file_count),
            )
            .filter(ia_items::Column::Identifier.eq(item.identifier.clone()))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn adjust_tasks_in_progress(
        &self,
        identifier: &str,
        delta: i64,
        floored: bool,
    ) -> Result<(), StorageError> {
        let txn = self.conn.begin().await?;
        let model = ia_items::Entity::find_by_id(identifier.to_string())
            .one(&txn)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("item {}", identifier)))?;
        let mut next = model.tasks_in_progress + delta;
        if floored && next < 0 {
            next = 0;
        }
        ia_items::Entity::update_many()
            .col_expr(ia_items::Column::TasksInProgress, Expr::value(next))
            .filter(ia_items::Column::Identifier.eq(identifier.to_string()))
            .exec(&txn)
            .await?;
        txn.commit().await?;
        Ok(())
    }

    async fn total_tasks_in_progress(&self) -> Result<i64, StorageError> {
        let items = ia_items::Entity::find().all(&self.conn).await?;
        Ok(items.iter().map(|i| i.tasks_in_progress).sum())
    }

    async fn mark_item_complete(&self, identifier: &str) -> Result<(), StorageError> {
        ia_items::Entity::update_many()
            .col_expr(ia_items::Column::Complete, Expr::value(true))
            .filter(ia_items::Column::Identifier.eq(identifier.to_string()))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn oldest_incomplete_item_date(&self) -> Result<Option<NaiveDate>, StorageError> {
        let model = ia_items::Entity::find()
            .filter(ia_items::Column::Complete.eq(false))
            .order_by_asc(ia_items::Column::SpanStart)
            .one(&self.conn)
            .await?;
        match model {
            Some(model) => Ok(Some(parse_ts(&model.span_start)?.date_naive())),
            None => Ok(None),
        }
    }

    async fn create_file(
        &self,
        file: &InternetArchiveFile,
    ) -> Result<InternetArchiveFile, StorageError> {
        let model = ia_files::ActiveModel {
            item_id: Set(file.item_id.clone()),
            link_guid: Set(file.link_guid.to_string()),
            status: Set(file.status.as_str().to_string()),
            cached_size: Set(file.cached_size),
            cached_title: Set(file.cached_title.clone()),
            cached_comments: Set(file.cached_comments.clone()),
            cached_external_identifier: Set(file.cached_external_identifier.clone()),
            cached_external_identifier_match_date: Set(file
                .cached_external_identifier_match_date
                .map(|d| d.to_rfc3339())),
            cached_format: Set(file.cached_format.clone()),
            cached_submitted_url: Set(file.cached_submitted_url.clone()),
            cached_perma_url: Set(file.cached_perma_url.clone()),
            ..Default::default()
        }
        .insert(&self.conn)
        .await?;
        file_from_model(model)
    }

    async fn get_file(
        &self,
        item_id: &str,
        link_guid: Uuid,
    ) -> Result<Option<InternetArchiveFile>, StorageError> {
        let model = ia_files::Entity::find()
            .filter(ia_files::Column::ItemId.eq(item_id.to_string()))
            .filter(ia_files::Column::LinkGuid.eq(link_guid.to_string()))
            .one(&self.conn)
            .await?;
        model.map(file_from_model).transpose()
    }

    async fn get_file_for_link(
        &self,
        link_guid: Uuid,
    ) -> Result<Option<InternetArchiveFile>, StorageError> {
        let model = ia_files::Entity::find()
            .filter(ia_files::Column::LinkGuid.eq(link_guid.to_string()))
            .one(&self.conn)
            .await?;
        model.map(file_from_model).transpose()
    }

    async fn get_file_by_id(&self, id: i64) -> Result<InternetArchiveFile, StorageError> {
        let model = ia_files::Entity::find_by_id(id)
            .one(&self.conn)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("ia file {}", id)))?;
        file_from_model(model)
    }

    async fn set_file_status(&self, id: i64, status: FileStatus) -> Result<(), StorageError> {
        ia_files::Entity::update_many()
            .col_expr(
                ia_files::Column::Status,
                Expr::value(status.as_str().to_string()),
            )
            .filter(ia_files::Column::Id.eq(id))
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn transition_file(
        &self,
        file: &InternetArchiveFile,
        tasks_delta: i64,
        floored: bool,
    ) -> Result<(), StorageError> {
        let txn = self.conn.begin().await?;
        ia_files::Entity::update_many()
            .col_expr(
                ia_files::Column::Status,
                Expr::value(file.status.as_str().to_string()),
            )
            .col_expr(ia_files::Column::CachedSize, Expr::value(file.cached_size))
            .col_expr(
                ia_files::Column::CachedTitle,
                Expr::value(file.cached_title.clone()),
            )
            .col_expr(
                ia_files::Column::CachedComments,
                Expr::value(file.cached_comments.clone()),
            )
            .col_expr(
                ia_files::Column::CachedExternalIdentifier,
                Expr::value(file.cached_external_identifier.clone()),
            )
            .col_expr(
                ia_files::Column::CachedExternalIdentifierMatchDate,
                Expr::value(
                    file.cached_external_identifier_match_date
                        .map(|d| d.to_rfc3339()),
                ),
            )
            .col_expr(
                ia_files::Column::CachedFormat,
                Expr::value(file.cached_format.clone()),
            )
            .col_expr(
                ia_files::Column::CachedSubmittedUrl,
                Expr::value(file.cached_submitted_url.clone()),
            )
            .col_expr(
                ia_files::Column::CachedPermaUrl,
                Expr::value(file.cached_perma_url.clone()),
            )
            .filter(ia_files::Column::Id.eq(file.id))
            .exec(&txn)
            .await?;

        if tasks_delta != 0 {
            let item = ia_items::Entity::find_by_id(file.item_id.clone())
                .one(&txn)
                .await?
                .ok_or_else(|| StorageError::NotFound(format!("item {}", file.item_id)))?;
            let mut next = item.tasks_in_progress + tasks_delta;
            if floored && next < 0 {
                next = 0;
            }
            ia_items::Entity::update_many()
                .col_expr(ia_items::Column::TasksInProgress, Expr::value(next))
                .filter(ia_items::Column::Identifier.eq(file.item_id.clone()))
                .exec(&txn)
                .await?;
        }
        txn.commit().await?;
        Ok(())
    }

    async fn files_with_status(
        &self,
        status: FileStatus,
        exclude_items: &[String],
        limit: u64,
    ) -> Result<Vec<InternetArchiveFile>, StorageError> {
        let mut query = ia_files::Entity::find()
            .filter(ia_files::Column::Status.eq(status.as_str()))
            .order_by_asc(ia_files::Column::Id);
        if !exclude_items.is_empty() {
            query = query.filter(ia_files::Column::ItemId.is_not_in(exclude_items.to_vec()));
        }
        let models = query.limit(limit).all(&self.conn).await?;
        models.into_iter().map(file_from_model).collect()
    }

    async fn links_pending_upload(
        &self,
        prefix: &str,
        date: NaiveDate,
        limit: u64,
    ) -> Result<Vec<Uuid>, StorageError> {
        let item = InternetArchiveItem::for_date(prefix, date);
        let day_start = item.span_start.to_rfc3339();
        let day_end = item.span_end.to_rfc3339();

        let candidates = links::Entity::find()
            .filter(links::Column::CreatedAt.gte(day_start))
            .filter(links::Column::CreatedAt.lt(day_end))
            .filter(links::Column::UserDeleted.eq(false))
            .filter(links::Column::IsPrivate.eq(false))
            .order_by_asc(links::Column::CreatedAt)
            .all(&self.conn)
            .await?;

        let mut pending = Vec::new();
        for model in candidates {
            if pending.len() as u64 >= limit {
                break;
            }
            let guid = parse_guid(&model.guid)?;
            let primary_ok = self
                .get_capture(guid, CaptureRole::Primary)
                .await?
                .map(|c| c.status == CaptureStatus::Success)
                .unwrap_or(false);
            if !primary_ok {
                continue;
            }
            if self.get_file(&item.identifier, guid).await?.is_some() {
                continue;
            }
            pending.push(guid);
        }
        Ok(pending)
    }

    async fn links_pending_deletion(&self, limit: u64) -> Result<Vec<Uuid>, StorageError> {
        let present = ia_files::Entity::find()
            .filter(
                ia_files::Column::Status.is_in(vec![
                    FileStatus::ConfirmedPresent.as_str(),
                    FileStatus::DeletionAttempted.as_str(),
                ]),
            )
            .all(&self.conn)
            .await?;

        let mut out = Vec::new();
        for model in present {
            if out.len() as u64 >= limit {
                break;
            }
            let guid = parse_guid(&model.link_guid)?;
            let link = self.get_link(guid).await?;
            if link.user_deleted || link.is_private {
                out.push(guid);
            }
        }
        Ok(out)
    }
}
