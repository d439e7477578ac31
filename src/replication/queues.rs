//! In-process replication task queues.
//!
//! Two named queues mirror the deployment's broker queues: the write queue
//! carries uploads and deletions, the read-only queue carries confirmation
//! polls. Depth gauges let the schedulers hold off while a queue still has
//! work, so confirmations never starve writes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use super::budgets::RetryCounters;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationTask {
    Upload {
        link_guid: Uuid,
        counters: RetryCounters,
    },
    Delete {
        link_guid: Uuid,
        counters: RetryCounters,
    },
    ConfirmUpload {
        file_id: i64,
        counters: RetryCounters,
    },
    ConfirmDelete {
        file_id: i64,
        counters: RetryCounters,
    },
}

struct Gauge(Arc<AtomicUsize>);

impl Gauge {
    fn new() -> (Self, Arc<AtomicUsize>) {
        let inner = Arc::new(AtomicUsize::new(0));
        (Self(inner.clone()), inner)
    }
}

/// Sender half shared by schedulers, the state machine and the poller.
#[derive(Clone)]
pub struct ReplicationQueues {
    write_tx: mpsc::UnboundedSender<ReplicationTask>,
    readonly_tx: mpsc::UnboundedSender<ReplicationTask>,
    write_depth: Arc<AtomicUsize>,
    readonly_depth: Arc<AtomicUsize>,
}

/// Receiver half owned by the worker loop.
pub struct ReplicationQueueReceivers {
    pub write_rx: mpsc::UnboundedReceiver<ReplicationTask>,
    pub readonly_rx: mpsc::UnboundedReceiver<ReplicationTask>,
    write_depth: Arc<AtomicUsize>,
    readonly_depth: Arc<AtomicUsize>,
}

impl ReplicationQueueReceivers {
    pub fn task_done_write(&self) {
        self.write_depth.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn task_done_readonly(&self) {
        self.readonly_depth.fetch_sub(1, Ordering::AcqRel);
    }
}

pub fn replication_queues() -> (ReplicationQueues, ReplicationQueueReceivers) {
    let (write_tx, write_rx) = mpsc::unbounded_channel();
    let (readonly_tx, readonly_rx) = mpsc::unbounded_channel();
    let (write_gauge, write_depth) = Gauge::new();
    let (readonly_gauge, readonly_depth) = Gauge::new();
    (
        ReplicationQueues {
            write_tx,
            readonly_tx,
            write_depth: write_gauge.0,
            readonly_depth: readonly_gauge.0,
        },
        ReplicationQueueReceivers {
            write_rx,
            readonly_rx,
            write_depth,
            readonly_depth,
        },
    )
}

impl ReplicationQueues {
    pub fn push_write(&self, task: ReplicationTask) {
        if self.write_tx.send(task).is_ok() {
            self.write_depth.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn push_readonly(&self, task: ReplicationTask) {
        if self.readonly_tx.send(task).is_ok() {
            self.readonly_depth.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn write_depth(&self) -> usize {
        self.write_depth.load(Ordering::Acquire)
    }

    pub fn readonly_depth(&self) -> usize {
        self.readonly_depth.load(Ordering::Acquire)
    }
}
