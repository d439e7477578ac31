pub mod capture;

pub mod configuration;

pub mod controller;

pub mod error_handling;

pub mod models;

pub mod replication;

pub mod storage;

pub use capture::Orchestrator;

pub use controller::Controller;

pub use models::*;
