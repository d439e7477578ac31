//! Persistence subsystem.
//!
//! Components:
//! - `link_store`: the LinkStore trait defining everything the capture and
//!   replication engines need from the database.
//! - `db_link_store`: SQLite implementation using SeaORM.
//! - `db_entities`: SeaORM entity models for the database backend.
//! - `blob_store`: trait + filesystem backend for finished WARC files.

pub mod blob_store;
pub mod db_entities;
pub mod db_link_store;
pub mod link_store;

pub use blob_store::{BlobStore, FileBlobStore};
pub use db_link_store::DbLinkStore;
pub use link_store::LinkStore;
