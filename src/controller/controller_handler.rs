//! The daemon controller: wires storage, the capture orchestrator and the
//! replication machinery together and runs them until shutdown.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::capture::browser::CdpLauncher;
use crate::capture::Orchestrator;
use crate::configuration::Config;
use crate::error_handling::types::{ControllerError, ReplicationError};
use crate::replication::confirm::ConfirmationPoller;
use crate::replication::queues::replication_queues;
use crate::replication::worker::ReplicationWorker;
use crate::replication::{ArchiveSession, DailyBatchScheduler, ReplicationEngine};
use crate::storage::{BlobStore, DbLinkStore, FileBlobStore, LinkStore};

/// How often the schedulers look at the backlog.
const SCHEDULE_INTERVAL: Duration = Duration::from_secs(60);
/// Pause when the capture queue is empty.
const IDLE_CAPTURE_PAUSE: Duration = Duration::from_secs(5);
/// Pause while the deployment sentinel blocks chaining.
const SENTINEL_PAUSE: Duration = Duration::from_secs(30);
/// Batch size for deletion and confirmation scheduling passes.
const SCHEDULE_BATCH: u64 = 100;

pub struct Controller {
    config: Config,
    store: Arc<dyn LinkStore>,
    blobs: Arc<dyn BlobStore>,
    capture_handle: Option<JoinHandle<()>>,
    worker_handle: Option<JoinHandle<()>>,
}

impl Controller {
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing SQLite link store");
        let store: Arc<dyn LinkStore> = Arc::new(DbLinkStore::new_file(&config.db_path).await?);
        info!("Initializing filesystem blob store");
        let blobs: Arc<dyn BlobStore> = Arc::new(FileBlobStore::new(&config.blob_root)?);

        Ok(Self {
            config,
            store,
            blobs,
            capture_handle: None,
            worker_handle: None,
        })
    }

    fn archive_session(&self) -> Result<ArchiveSession, ControllerError> {
        let r = &self.config.replication;
        ArchiveSession::new(&r.endpoint, &r.metadata_endpoint, &r.access_key, &r.secret_key)
            .map_err(|e| ControllerError::Replication(ReplicationError::Api(e)))
    }

    pub async fn run(
        &mut self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), ControllerError> {
        // replication plumbing
        let (queues, receivers) = replication_queues();
        let engine = Arc::new(ReplicationEngine::new(
            self.config.replication.clone(),
            self.store.clone(),
            self.blobs.clone(),
            self.archive_session()?,
            queues.clone(),
        ));
        let poller = Arc::new(ConfirmationPoller::new(
            self.config.replication.clone(),
            self.store.clone(),
            self.archive_session()?,
            queues.clone(),
        ));
        let scheduler = DailyBatchScheduler::new(
            self.config.replication.clone(),
            self.store.clone(),
            queues.clone(),
        );

        let worker = ReplicationWorker::new(engine, poller.clone(), receivers);
        let worker_shutdown = shutdown_rx.resubscribe();
        self.worker_handle = Some(tokio::spawn(worker.run(worker_shutdown)));

        // capture loop: chains job after job unless the deployment
        // sentinel is present
        let orchestrator = Orchestrator::new(
            self.config.clone(),
            self.store.clone(),
            self.blobs.clone(),
            Arc::new(CdpLauncher),
        );
        let mut capture_shutdown = shutdown_rx.resubscribe();
        self.capture_handle = Some(tokio::spawn(async move {
            loop {
                match capture_shutdown.try_recv() {
                    Err(broadcast::error::TryRecvError::Empty) => {}
                    _ => {
                        info!("Capture loop stopping.");
                        return;
                    }
                }
                if !orchestrator.may_chain() {
                    info!("Deployment sentinel is present, not running next capture.");
                    tokio::time::sleep(SENTINEL_PAUSE).await;
                    continue;
                }
                match orchestrator.run_next_capture().await {
                    Ok(true) => {}
                    Ok(false) => tokio::time::sleep(IDLE_CAPTURE_PAUSE).await,
                    Err(e) => {
                        error!("capture scheduling failed: {}", e);
                        tokio::time::sleep(IDLE_CAPTURE_PAUSE).await;
                    }
                }
            }
        }));

        info!("Controller is now operational");
        let mut schedule = tokio::time::interval(SCHEDULE_INTERVAL);
        loop {
            tokio::select! {
                _ = schedule.tick() => {
                    if let Err(e) = scheduler.queue_uploads().await {
                        error!("upload scheduling failed: {}", e);
                    }
                    if let Err(e) = scheduler.queue_deletions(SCHEDULE_BATCH).await {
                        error!("deletion scheduling failed: {}", e);
                    }
                    if let Err(e) = poller.queue_upload_confirmations(SCHEDULE_BATCH).await {
                        error!("confirmation scheduling failed: {}", e);
                    }
                    if let Err(e) = poller.queue_delete_confirmations(SCHEDULE_BATCH).await {
                        error!("confirmation scheduling failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received in controller, stopping gracefully");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&mut self) {
        info!("Starting Controller shutdown...");
        for (name, handle) in [
            ("capture loop", self.capture_handle.take()),
            ("replication worker", self.worker_handle.take()),
        ] {
            let Some(mut handle) = handle else { continue };
            match tokio::time::timeout(Duration::from_secs(10), &mut handle).await {
                Ok(_) => info!("{} terminated cleanly", name),
                Err(_) => {
                    warn!("{} did not stop in time; aborting it", name);
                    handle.abort();
                }
            }
        }
        info!("Controller shutdown completed");
    }
}
