use std::{net::IpAddr, net::SocketAddr, sync::Arc};

use tracing::debug;

use crate::{
    buffers::ReplyBuffer,
    conn::KadWriter,
    messages::Message,
    mux::{BufferId, KadMux},
    response::{ImplicitPingFn, Response},
    types::{Contact, NodeId},
};

/// The RPC surface. Every operation builds a request with a fresh nonce,
/// fires it through the endpoint without waiting, and returns a [`Response`]
/// handle bound to the reply buffer that will receive the answer.
#[derive(Clone)]
pub struct Client {
    id: NodeId,
    writer: KadWriter,
    node_buffer: Arc<ReplyBuffer>,
    ping_buffer: Arc<ReplyBuffer>,
    store_buffer: Arc<ReplyBuffer>,
    value_buffer: Arc<ReplyBuffer>,
}

impl Client {
    pub fn new(id: NodeId, writer: KadWriter, mux: &KadMux) -> Self {
        Self {
            id,
            writer,
            node_buffer: mux.buffer(BufferId::NodeReply),
            ping_buffer: mux.buffer(BufferId::PingReply),
            store_buffer: mux.buffer(BufferId::StoreReply),
            value_buffer: mux.buffer(BufferId::ValueReply),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.id
    }

    /// FIND_NODE: asks `contact` for the k contacts closest to `target`.
    /// The reply correlates on the request nonce.
    pub fn find_node(&self, contact: &Contact, target: NodeId) -> Response {
        let random_id = NodeId::random();
        let request = Message::FindNodeReq {
            sender: self.id,
            target,
            random_id,
        };
        self.send(request.encode(), contact.udp_addr());

        Response::new(*contact, self.node_buffer.clone(), random_id.to_string())
            .with_implicit_ping(self.implicit_ping_fn(contact.udp_addr()))
    }

    /// FIND_VALUE: like find_node, but the remote answers with the value's
    /// contacts when it holds the key.
    pub fn find_value(&self, contact: &Contact, key: NodeId) -> Response {
        let random_id = NodeId::random();
        let request = Message::FindValueReq {
            sender: self.id,
            key,
            random_id,
        };
        self.send(request.encode(), contact.udp_addr());

        Response::new(*contact, self.value_buffer.clone(), random_id.to_string())
            .with_implicit_ping(self.implicit_ping_fn(contact.udp_addr()))
    }

    /// PING: explicit liveness probe. The explicit pong correlates on the
    /// request nonce.
    pub fn ping(&self, contact: &Contact) -> Response {
        let random_id = self.send_ping(contact.udp_addr());
        Response::new(*contact, self.ping_buffer.clone(), random_id.to_string())
            .with_implicit_ping(self.implicit_ping_fn(contact.udp_addr()))
    }

    /// Sends a PING to a bare address. Used during bootstrap when the
    /// gateway's id is unknown and the reply has to be taken with a
    /// first-available read instead of a keyed one.
    pub fn send_ping(&self, addr: SocketAddr) -> NodeId {
        let random_id = NodeId::random();
        let request = Message::PingReq {
            sender: self.id,
            random_id,
        };
        self.send(request.encode(), addr);
        random_id
    }

    /// STORE: asks `contact` to remember `key -> (ip, port)`. Store acks
    /// carry no distinguishing payload, so the reply correlates per peer
    /// (empty matcher).
    pub fn store(&self, contact: &Contact, key: NodeId, ip: IpAddr, port: u16) -> Response {
        let request = Message::StoreReq {
            sender: self.id,
            key,
            port,
            ip,
            random_id: NodeId::random(),
        };
        self.send(request.encode(), contact.udp_addr());

        Response::new(*contact, self.store_buffer.clone(), String::new())
            .with_implicit_ping(self.implicit_ping_fn(contact.udp_addr()))
    }

    /// Sends an unsolicited PingResImplicit echoing `echo`; the receiving
    /// side matches it against its pre-registered expectation and inserts
    /// us into its routing table.
    pub fn send_implicit_ping(&self, addr: SocketAddr, echo: NodeId) {
        let message = Message::PingResImplicit {
            sender: self.id,
            echo_random_id: echo,
            random_id: NodeId::random(),
        };
        self.send(message.encode(), addr);
    }

    fn implicit_ping_fn(&self, addr: SocketAddr) -> ImplicitPingFn {
        let client = self.clone();
        Box::new(move |echo| client.send_implicit_ping(addr, echo))
    }

    /// Fire-and-forget write; send failures abandon the RPC and are only
    /// logged, the pending read runs into its own deadline.
    fn send(&self, raw: Vec<u8>, addr: SocketAddr) {
        let writer = self.writer.clone();
        tokio::spawn(async move {
            if let Err(e) = writer.write(&raw, addr).await {
                debug!(error = %e, to = %addr, "Failed to send request");
            }
        });
    }
}
