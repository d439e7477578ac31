//! The replication task loop.
//!
//! Drains both queues, preferring writes over confirmation polls so the
//! read-only traffic never holds up uploads. Tasks re-queue themselves
//! through the shared queue handles; this loop just dispatches.

use std::sync::Arc;

use log::{error, info};
use tokio::sync::broadcast;

use super::confirm::ConfirmationPoller;
use super::queues::{ReplicationQueueReceivers, ReplicationTask};
use super::state_machine::ReplicationEngine;

pub struct ReplicationWorker {
    engine: Arc<ReplicationEngine>,
    poller: Arc<ConfirmationPoller>,
    receivers: ReplicationQueueReceivers,
}

impl ReplicationWorker {
    pub fn new(
        engine: Arc<ReplicationEngine>,
        poller: Arc<ConfirmationPoller>,
        receivers: ReplicationQueueReceivers,
    ) -> Self {
        Self {
            engine,
            poller,
            receivers,
        }
    }

    async fn dispatch(&self, task: ReplicationTask) {
        let result = match task {
            ReplicationTask::Upload { link_guid, counters } => {
                self.engine.upload_link(link_guid, counters).await
            }
            ReplicationTask::Delete { link_guid, counters } => {
                self.engine.delete_link(link_guid, counters).await
            }
            ReplicationTask::ConfirmUpload { file_id, counters } => {
                self.poller.confirm_upload(file_id, counters).await
            }
            ReplicationTask::ConfirmDelete { file_id, counters } => {
                self.poller.confirm_delete(file_id, counters).await
            }
        };
        if let Err(e) = result {
            error!("replication task failed: {}", e);
        }
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                // biased: writes drain before confirmation polls
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Replication worker stopping.");
                    return;
                }
                task = self.receivers.write_rx.recv() => {
                    match task {
                        Some(task) => {
                            self.dispatch(task).await;
                            self.receivers.task_done_write();
                        }
                        None => return,
                    }
                }
                task = self.receivers.readonly_rx.recv() => {
                    match task {
                        Some(task) => {
                            self.dispatch(task).await;
                            self.receivers.task_done_readonly();
                        }
                        None => return,
                    }
                }
            }
        }
    }
}
