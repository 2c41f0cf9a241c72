use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{debug, error, trace};

use crate::{
    buffers::ReplyBuffer,
    conn::KadWriter,
    kademlia::Kademlia,
    messages::Message,
    mux::handler::RpcHandler,
    request::Request,
    types::{Contact, NodeId},
};

/// How long the implicit-ping handler waits for its pre-registered
/// expectation. The expectation is written before our reply leaves the
/// socket, so when the remote's implicit ping arrives it is either already
/// buffered or it never will be.
const EXPECTED_PING_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Serves FIND_NODE: answers with the k closest known contacts.
pub struct FindNodeHandler {
    id: NodeId,
    kademlia: Kademlia,
    k: usize,
}

impl FindNodeHandler {
    pub fn new(id: NodeId, kademlia: Kademlia, k: usize) -> Self {
        Self { id, kademlia, k }
    }
}

#[async_trait]
impl RpcHandler for FindNodeHandler {
    async fn handle(&self, writer: &KadWriter, request: &Request) {
        let Message::FindNodeReq {
            target, random_id, ..
        } = &request.message
        else {
            return;
        };

        let contacts = self.kademlia.closest(target, self.k).await;
        let response = Message::FindNodeRes {
            sender: self.id,
            echo_random_id: *random_id,
            contacts,
            random_id: NodeId::random(),
        };
        if let Err(e) = writer.write(&response.encode(), request.from).await {
            error!(error = %e, to = %request.from, "Failed to send FindNode response");
        }
    }
}

/// Serves PING with an explicit pong.
pub struct PingHandler {
    id: NodeId,
}

impl PingHandler {
    pub fn new(id: NodeId) -> Self {
        Self { id }
    }
}

#[async_trait]
impl RpcHandler for PingHandler {
    async fn handle(&self, writer: &KadWriter, request: &Request) {
        let Message::PingReq { random_id, .. } = &request.message else {
            return;
        };

        let response = Message::PingResExplicit {
            sender: self.id,
            echo_random_id: *random_id,
            random_id: NodeId::random(),
        };
        if let Err(e) = writer.write(&response.encode(), request.from).await {
            error!(error = %e, to = %request.from, "Failed to send pong");
        }
    }
}

/// Serves FIND_VALUE: the stored value if we hold the key, otherwise the
/// closest contacts, like FIND_NODE.
pub struct FindValueHandler {
    id: NodeId,
    kademlia: Kademlia,
    k: usize,
}

impl FindValueHandler {
    pub fn new(id: NodeId, kademlia: Kademlia, k: usize) -> Self {
        Self { id, kademlia, k }
    }
}

#[async_trait]
impl RpcHandler for FindValueHandler {
    async fn handle(&self, writer: &KadWriter, request: &Request) {
        let Message::FindValueReq {
            key, random_id, ..
        } = &request.message
        else {
            return;
        };

        let response = match self.kademlia.find_value(key).await {
            Some((ip, port)) => Message::FindValueResOk {
                sender: self.id,
                echo_random_id: *random_id,
                key: *key,
                contacts: vec![Contact::new(*key, ip, port)],
                random_id: NodeId::random(),
            },
            None => Message::FindValueRes {
                sender: self.id,
                echo_random_id: *random_id,
                contacts: self.kademlia.closest(key, self.k).await,
                random_id: NodeId::random(),
            },
        };
        if let Err(e) = writer.write(&response.encode(), request.from).await {
            error!(error = %e, to = %request.from, "Failed to send FindValue response");
        }
    }
}

/// Serves STORE: records the value and acknowledges.
pub struct StoreHandler {
    id: NodeId,
    kademlia: Kademlia,
}

impl StoreHandler {
    pub fn new(id: NodeId, kademlia: Kademlia) -> Self {
        Self { id, kademlia }
    }
}

#[async_trait]
impl RpcHandler for StoreHandler {
    async fn handle(&self, writer: &KadWriter, request: &Request) {
        let Message::StoreReq {
            key,
            port,
            ip,
            random_id,
            ..
        } = &request.message
        else {
            return;
        };

        self.kademlia.store_value(*key, *ip, *port).await;
        trace!(key = %key, value = %format!("{ip}:{port}"), "Stored value");

        let response = Message::StoreRes {
            sender: self.id,
            echo_random_id: *random_id,
            random_id: NodeId::random(),
        };
        if let Err(e) = writer.write(&response.encode(), request.from).await {
            error!(error = %e, to = %request.from, "Failed to send Store response");
        }
    }
}

/// Handles unsolicited PingResImplicit messages, the closing leg of the
/// implicit-ping exchange. A matching pre-registered expectation proves the
/// remote read our reply at the address we saw, so the contact is inserted
/// into the routing table. Anything that does not match is dropped.
pub struct PingReplyHandler {
    kademlia: Kademlia,
    buffer: Arc<ReplyBuffer>,
}

impl PingReplyHandler {
    pub fn new(kademlia: Kademlia, buffer: Arc<ReplyBuffer>) -> Self {
        Self { kademlia, buffer }
    }
}

#[async_trait]
impl RpcHandler for PingReplyHandler {
    async fn handle(&self, _writer: &KadWriter, request: &Request) {
        let Message::PingResImplicit {
            sender,
            echo_random_id,
            ..
        } = &request.message
        else {
            return;
        };

        let mut reader = self.buffer.reader(format!("{sender}{echo_random_id}"));
        reader.set_deadline(EXPECTED_PING_READ_TIMEOUT);
        match reader.read().await {
            Ok(expected)
                if expected.sender_id() == *sender
                    && expected.echo_random_id() == Some(*echo_random_id) =>
            {
                let contact = request.sender_contact();
                trace!(contact = %contact, "Implicit ping verified");
                self.kademlia.insert(contact).await;
            }
            Ok(_) => debug!(sender = %sender, "Implicit ping did not align; dropping"),
            Err(e) => {
                trace!(sender = %sender, error = %e, "Unexpected implicit ping; dropping");
            }
        }
    }
}
