//! Capture engine: recording proxy, browser control, worker pool, size
//! monitoring, WARC assembly and the orchestrator that stages them.
//!
//! One capture at a time per engine: the orchestrator owns the engine
//! mutably for the duration of a job, and every per-capture object (proxy
//! context, writer queue, shared state) is constructed fresh for each run.

pub mod browser;
pub mod dom;
pub mod monitor;
pub mod orchestrator;
pub mod proxy;
pub mod recorder;
pub mod state;
pub mod tls;
pub mod warc;
pub mod workers;

pub use orchestrator::Orchestrator;
pub use state::CaptureState;
