use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::trace;

use super::handler::RpcHandler;
use crate::{conn::KadWriter, request::Request};

/// A unit of work for the pool: one inbound request plus the handler the
/// reply thread resolved for it.
pub(crate) struct WorkRequest {
    pub handler: Arc<dyn RpcHandler>,
    pub request: Request,
}

/// Spawns the worker pool. Workers share a single inbound queue; whichever
/// worker is idle takes the next item, so handler execution is bounded by
/// the pool size.
pub(crate) fn spawn_workers(
    tracker: &TaskTracker,
    cancel: CancellationToken,
    writer: KadWriter,
    work_rx: mpsc::Receiver<WorkRequest>,
    count: usize,
) {
    let shared = Arc::new(Mutex::new(work_rx));
    for id in 0..count {
        tracker.spawn(worker_loop(
            id,
            shared.clone(),
            writer.clone(),
            cancel.clone(),
        ));
    }
}

async fn worker_loop(
    id: usize,
    shared: Arc<Mutex<mpsc::Receiver<WorkRequest>>>,
    writer: KadWriter,
    cancel: CancellationToken,
) {
    loop {
        // The queue lock is held only while waiting for the next item,
        // never across handler execution.
        let work = {
            let mut rx = shared.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                work = rx.recv() => work,
            }
        };
        match work {
            Some(work) => {
                trace!(
                    worker = id,
                    message_type = %work.request.multiplex_key(),
                    "Worker picked up request"
                );
                work.handler.handle(&writer, &work.request).await;
            }
            None => return,
        }
    }
}
