//! SeaORM entity models used by the database-backed link store.
//!
//! These structs map to the SQLite tables created by `db_link_store`:
//! - `links` — archival requests and their outcome fields
//! - `captures` — per-link artifacts (primary / screenshot / favicon)
//! - `capture_jobs` — the capture queue
//! - `ia_items` — daily buckets in the external archive
//! - `ia_files` — per-link replication state inside a daily bucket

use sea_orm::entity::prelude::*;

/// Links table entity model.
///
/// Timestamps are stored as RFC3339 strings and enums as strings for
/// portability; tags as a JSON array string.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "links")]
pub struct Model {
    /// UUID as string primary key
    #[sea_orm(primary_key, auto_increment = false)]
    pub guid: String,
    pub submitted_url: String,
    pub created_at: String,
    pub submitted_title: String,
    pub submitted_description: String,
    pub is_private: bool,
    pub private_reason: Option<String>,
    pub warc_size: Option<i64>,
    pub cached_can_play_back: Option<bool>,
    pub user_deleted: bool,
    /// JSON array of tag strings
    pub tags: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Captures table entity models.
pub mod captures {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "captures")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub link_guid: String,
        /// primary | screenshot | favicon
        pub role: String,
        /// pending | success | failed
        pub status: String,
        /// response | resource
        pub record_type: String,
        pub url: String,
        pub content_type: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// Capture job queue entity models.
pub mod capture_jobs {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "capture_jobs")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub link_guid: String,
        /// pending | in_progress | completed | deleted | failed
        pub status: String,
        pub attempt: i32,
        pub capture_start_time: Option<String>,
        pub step_count: f32,
        pub step_description: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// Daily item entity models.
pub mod ia_items {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "ia_items")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub identifier: String,
        pub span_start: String,
        pub span_end: String,
        pub confirmed_exists: bool,
        pub derive_required: bool,
        pub complete: bool,
        pub tasks_in_progress: i64,
        pub added_date: Option<String>,
        pub cached_title: Option<String>,
        pub cached_description: Option<String>,
        pub cached_file_count: Option<i64>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// Per-link archive file entity models.
pub mod ia_files {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "ia_files")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub item_id: String,
        pub link_guid: String,
        /// One of the six replication statuses
        pub status: String,
        pub cached_size: Option<i64>,
        pub cached_title: Option<String>,
        pub cached_comments: Option<String>,
        pub cached_external_identifier: Option<String>,
        pub cached_external_identifier_match_date: Option<String>,
        pub cached_format: Option<String>,
        pub cached_submitted_url: Option<String>,
        pub cached_perma_url: Option<String>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}
