//! Archive size monitoring.
//!
//! Polls recorded plus pending bytes and flips the shared `limit_reached`
//! flag once the maximum archive size is exceeded, which makes the proxy
//! truncate in-flight streams, fetch workers exit early, and the
//! orchestrator skip the post-load wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::task::JoinHandle;

use super::state::CaptureState;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct SizeMonitor {
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl SizeMonitor {
    pub fn start(state: Arc<CaptureState>, max_archive_size: u64) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let task = tokio::spawn(async move {
            loop {
                if stop_flag.load(Ordering::Acquire) {
                    return;
                }
                if state.current_size() > max_archive_size {
                    state.set_limit_reached();
                    info!("Size limit reached.");
                    return;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        });
        Self { stop, task }
    }

    pub async fn stop(self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.task.await;
    }
}
