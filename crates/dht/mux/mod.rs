//! Inbound message multiplexer: splits the datagram stream into responses
//! (fanned out to reply buffers) and requests (dispatched to a bounded
//! worker pool through an ordered middleware chain).

pub mod dispatcher;
pub mod handler;
mod reply_thread;

use std::{collections::HashMap, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};

use self::{
    dispatcher::{WorkRequest, spawn_workers},
    handler::{Middleware, RpcHandler},
    reply_thread::ReplyThread,
};
use crate::{
    buffers::{KeyRule, ReplyBuffer},
    config::NodeConfig,
    conn::KadSocket,
    messages::{Message, MessageType, RawMessage},
    request::Request,
};

const STREAM_CHANNEL_CAPACITY: usize = 64;
const DISPATCH_CHANNEL_CAPACITY: usize = 1;

const NODE_REPLY_PURGE_INTERVAL: Duration = Duration::from_secs(60);
const PING_REPLY_PURGE_INTERVAL: Duration = Duration::from_secs(3);

/// The four reply buffers a node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferId {
    NodeReply,
    PingReply,
    StoreReply,
    ValueReply,
}

#[derive(Clone)]
pub(crate) struct Buffers {
    node: Arc<ReplyBuffer>,
    ping: Arc<ReplyBuffer>,
    store: Arc<ReplyBuffer>,
    value: Arc<ReplyBuffer>,
}

impl Buffers {
    fn new(config: &NodeConfig) -> Self {
        Self {
            node: Arc::new(ReplyBuffer::new(
                "node-reply",
                KeyRule::SenderAndEcho,
                config.node_reply_expiry,
                NODE_REPLY_PURGE_INTERVAL,
            )),
            ping: Arc::new(ReplyBuffer::new(
                "ping-reply",
                KeyRule::SenderAndEcho,
                config.ping_reply_expiry,
                PING_REPLY_PURGE_INTERVAL,
            )),
            store: Arc::new(ReplyBuffer::new(
                "store-reply",
                KeyRule::SenderOnly,
                config.node_reply_expiry,
                NODE_REPLY_PURGE_INTERVAL,
            )),
            value: Arc::new(ReplyBuffer::new(
                "value-reply",
                KeyRule::SenderAndEcho,
                config.node_reply_expiry,
                NODE_REPLY_PURGE_INTERVAL,
            )),
        }
    }

    fn get(&self, id: BufferId) -> Arc<ReplyBuffer> {
        match id {
            BufferId::NodeReply => self.node.clone(),
            BufferId::PingReply => self.ping.clone(),
            BufferId::StoreReply => self.store.clone(),
            BufferId::ValueReply => self.value.clone(),
        }
    }

    /// The buffer an inbound response is routed to, by multiplex key.
    pub(crate) fn for_response(&self, kind: MessageType) -> Option<&Arc<ReplyBuffer>> {
        match kind {
            MessageType::FindNodeRes => Some(&self.node),
            MessageType::PingResExplicit => Some(&self.ping),
            MessageType::StoreRes => Some(&self.store),
            MessageType::FindValueRes | MessageType::FindValueResOk => Some(&self.value),
            _ => None,
        }
    }

    fn close_all(&self) {
        self.node.close();
        self.ping.close();
        self.store.close();
        self.value.close();
    }
}

pub struct KadMux {
    handlers: HashMap<MessageType, Arc<dyn RpcHandler>>,
    middlewares: Vec<Middleware>,
    buffers: Buffers,
    worker_pool_size: usize,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl KadMux {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            handlers: HashMap::new(),
            middlewares: Vec::new(),
            buffers: Buffers::new(config),
            worker_pool_size: config.worker_pool_size,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Appends a middleware. Middlewares wrap handlers registered after
    /// them; the last one added runs innermost.
    pub fn use_middleware(&mut self, middleware: Middleware) {
        self.middlewares.push(middleware);
    }

    /// Registers the handler for a message type, wrapped in the middleware
    /// chain as registered so far.
    pub fn handle_func(&mut self, kind: MessageType, handler: Arc<dyn RpcHandler>) {
        let mut wrapped = handler;
        for middleware in self.middlewares.iter().rev() {
            wrapped = middleware(wrapped);
        }
        self.handlers.insert(kind, wrapped);
    }

    pub fn buffer(&self, id: BufferId) -> Arc<ReplyBuffer> {
        self.buffers.get(id)
    }

    /// Starts the receiver, reply thread and worker pool on the given
    /// endpoint. The ping-reply buffer stays open for the lifetime of the
    /// mux; the per-operation buffers are opened by their operations.
    pub fn serve(&self, conn: KadSocket) {
        self.buffers.ping.open();

        let (on_response_tx, on_response_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (on_request_tx, on_request_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(DISPATCH_CHANNEL_CAPACITY);

        spawn_workers(
            &self.tracker,
            self.cancel.clone(),
            conn.writer(),
            dispatch_rx,
            self.worker_pool_size,
        );

        let reply = ReplyThread {
            on_response: on_response_rx,
            on_request: on_request_rx,
            handlers: Arc::new(self.handlers.clone()),
            buffers: self.buffers.clone(),
            dispatch_tx,
            cancel: self.cancel.clone(),
        };
        self.tracker.spawn(reply.run());

        self.tracker.spawn(receive(
            conn,
            on_response_tx,
            on_request_tx,
            self.cancel.clone(),
        ));
    }

    /// Stops the receiver and reply threads, waits for them and the workers
    /// to acknowledge by finishing, then closes every buffer.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.buffers.close_all();
    }
}

/// The receiver: reads datagrams off the endpoint and splits them into the
/// response and request streams. Malformed datagrams are logged and
/// dropped; only cancellation stops the loop.
async fn receive(
    conn: KadSocket,
    on_response: mpsc::Sender<Bytes>,
    on_request: mpsc::Sender<Request>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            received = conn.recv() => received,
        };
        let (raw, from) = match received {
            Ok(received) => received,
            Err(e) => {
                debug!(error = %e, "Dropping datagram");
                continue;
            }
        };

        let Ok(kind) = RawMessage::new(&raw).and_then(|view| view.multiplex_key()) else {
            continue;
        };
        if kind.is_response() {
            if on_response.send(raw).await.is_err() {
                return;
            }
        } else {
            match Message::parse(&raw) {
                Ok(message) => {
                    if on_request.send(Request::new(from, message)).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!(error = %e, %from, "Could not decode request"),
            }
        }
    }
}
