use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace};

use crate::{
    buffers::ReplyBuffer,
    conn::KadWriter,
    messages::{Message, MessageType},
    request::Request,
    types::NodeId,
};

/// A request handler registered on the mux for one message type. Handlers
/// run on the worker pool and write any reply through the passed writer;
/// they never propagate errors upward, only log them.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, writer: &KadWriter, request: &Request);
}

/// Wraps a handler in another handler. The chain is applied at registration
/// time; the last middleware registered runs innermost.
pub type Middleware = Box<dyn Fn(Arc<dyn RpcHandler>) -> Arc<dyn RpcHandler> + Send + Sync>;

/// Emits a one-line record for every dispatched request.
pub fn logging() -> Middleware {
    Box::new(|next| Arc::new(LoggingMiddleware { next }) as Arc<dyn RpcHandler>)
}

struct LoggingMiddleware {
    next: Arc<dyn RpcHandler>,
}

#[async_trait]
impl RpcHandler for LoggingMiddleware {
    async fn handle(&self, writer: &KadWriter, request: &Request) {
        let message = &request.message;
        debug!(
            message_type = %message.multiplex_key(),
            sender = %message.sender_id(),
            random_id = %message.random_id(),
            echo = %message
                .echo_random_id()
                .map(|id| id.to_string())
                .unwrap_or_default(),
            from = %request.from,
            "Dispatching request"
        );
        self.next.handle(writer, request).await;
    }
}

/// On any request that is sent to us we also expect to receive an implicit
/// PingResponse after we have replied. This middleware synthesizes that
/// expected reply from the request's sender and nonce and pre-writes it into
/// the ping-reply buffer, so the handler for PingResImplicit can later
/// verify the remote answered at the address we saw.
pub fn expect_ping_reply(buffer: Arc<ReplyBuffer>) -> Middleware {
    Box::new(move |next| {
        Arc::new(ExpectPingReplyMiddleware {
            buffer: buffer.clone(),
            next,
        }) as Arc<dyn RpcHandler>
    })
}

struct ExpectPingReplyMiddleware {
    buffer: Arc<ReplyBuffer>,
    next: Arc<dyn RpcHandler>,
}

#[async_trait]
impl RpcHandler for ExpectPingReplyMiddleware {
    async fn handle(&self, writer: &KadWriter, request: &Request) {
        // A ping reply is itself the liveness proof; expecting another one
        // in response would never be answered.
        if request.multiplex_key() == MessageType::PingResImplicit {
            self.next.handle(writer, request).await;
            return;
        }

        let expected = Message::PingResImplicit {
            sender: request.message.sender_id(),
            echo_random_id: request.message.random_id(),
            random_id: NodeId::random(),
        };
        if let Err(e) = self.buffer.write(Bytes::from(expected.encode())).await {
            trace!(error = %e, "Could not pre-register expected ping reply");
        }

        self.next.handle(writer, request).await;
    }
}
