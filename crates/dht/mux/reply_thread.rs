use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{Buffers, dispatcher::WorkRequest, handler::RpcHandler};
use crate::{
    messages::{MessageType, RawMessage},
    request::Request,
};

/// Routes inbound traffic: responses are written to the reply buffer their
/// multiplex key selects, requests are paired with their handler and queued
/// for the dispatcher. The FIFO between the two channels gives the worker
/// pool backpressure without ever blocking response delivery.
pub(crate) struct ReplyThread {
    pub on_response: mpsc::Receiver<Bytes>,
    pub on_request: mpsc::Receiver<Request>,
    pub handlers: Arc<HashMap<MessageType, Arc<dyn RpcHandler>>>,
    pub buffers: Buffers,
    pub dispatch_tx: mpsc::Sender<WorkRequest>,
    pub cancel: CancellationToken,
}

impl ReplyThread {
    pub(crate) async fn run(self) {
        let ReplyThread {
            mut on_response,
            mut on_request,
            handlers,
            buffers,
            dispatch_tx,
            cancel,
        } = self;
        let mut queue: VecDeque<WorkRequest> = VecDeque::new();

        loop {
            if queue.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    Some(raw) = on_response.recv() => buffer_response(&buffers, raw).await,
                    Some(request) = on_request.recv() => enqueue(&handlers, &mut queue, request),
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    Some(raw) = on_response.recv() => buffer_response(&buffers, raw).await,
                    Some(request) = on_request.recv() => enqueue(&handlers, &mut queue, request),
                    permit = dispatch_tx.reserve() => match permit {
                        Ok(permit) => {
                            if let Some(work) = queue.pop_front() {
                                permit.send(work);
                            }
                        }
                        Err(_) => return,
                    },
                }
            }
        }
    }
}

/// Stores an inbound response in the buffer its multiplex key selects.
async fn buffer_response(buffers: &Buffers, raw: Bytes) {
    let Ok(view) = RawMessage::new(&raw) else {
        return;
    };
    let Ok(kind) = view.multiplex_key() else {
        return;
    };
    let Some(buffer) = buffers.for_response(kind) else {
        debug!(message_type = %kind, "No reply buffer for response");
        return;
    };
    if let Err(e) = buffer.write(raw).await {
        trace!(message_type = %kind, error = %e, "Response dropped");
    }
}

fn enqueue(
    handlers: &HashMap<MessageType, Arc<dyn RpcHandler>>,
    queue: &mut VecDeque<WorkRequest>,
    request: Request,
) {
    let Some(handler) = handlers.get(&request.multiplex_key()) else {
        debug!(message_type = %request.multiplex_key(), "Handler not found");
        return;
    };
    queue.push_back(WorkRequest {
        handler: handler.clone(),
        request,
    });
}
