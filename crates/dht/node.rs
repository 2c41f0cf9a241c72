use std::{net::SocketAddr, sync::Arc};

use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info};

use crate::{
    buffers::BufferError,
    client::Client,
    config::NodeConfig,
    conn::KadSocket,
    handlers::{
        FindNodeHandler, FindValueHandler, PingHandler, PingReplyHandler, StoreHandler,
    },
    kademlia::Kademlia,
    lookup::{IterativeLookup, LookupKind, LookupRefresher, LookupResult},
    messages::{Message, MessageType},
    mux::{
        BufferId, KadMux,
        handler::{expect_ping_reply, logging},
    },
    types::{Contact, NodeId},
};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Failed to bind socket: {0}")]
    BindSocket(std::io::Error),
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),
    #[error("Unexpected bootstrap reply: {0}")]
    UnexpectedBootstrapReply(MessageType),
    #[error("No contacts found")]
    NoContactsFound,
}

/// A running DHT node: the socket, the mux serving it, the routing table
/// and the client issuing RPCs.
pub struct Node {
    id: NodeId,
    config: NodeConfig,
    kademlia: Kademlia,
    mux: Arc<KadMux>,
    client: Client,
    local_addr: SocketAddr,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Node {
    /// Binds the UDP socket, wires up middleware and request handlers, and
    /// begins serving.
    pub async fn try_new(config: NodeConfig) -> Result<Self, NodeError> {
        let id = NodeId::random();
        let kademlia = Kademlia::new(id, config.k);

        let socket = KadSocket::bind(SocketAddr::new(config.host, config.port))
            .await
            .map_err(NodeError::BindSocket)?;
        let local_addr = socket.local_addr().map_err(NodeError::BindSocket)?;

        let mut mux = KadMux::new(&config);
        mux.use_middleware(logging());
        mux.use_middleware(expect_ping_reply(mux.buffer(BufferId::PingReply)));

        mux.handle_func(
            MessageType::FindNodeReq,
            Arc::new(FindNodeHandler::new(id, kademlia.clone(), config.k)),
        );
        mux.handle_func(MessageType::PingReq, Arc::new(PingHandler::new(id)));
        mux.handle_func(
            MessageType::FindValueReq,
            Arc::new(FindValueHandler::new(id, kademlia.clone(), config.k)),
        );
        mux.handle_func(
            MessageType::StoreReq,
            Arc::new(StoreHandler::new(id, kademlia.clone())),
        );
        mux.handle_func(
            MessageType::PingResImplicit,
            Arc::new(PingReplyHandler::new(
                kademlia.clone(),
                mux.buffer(BufferId::PingReply),
            )),
        );

        let client = Client::new(id, socket.writer(), &mux);
        let mux = Arc::new(mux);
        mux.serve(socket);

        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let refresher = LookupRefresher::new(
            client.clone(),
            kademlia.clone(),
            mux.buffer(BufferId::NodeReply),
            config.k,
            config.alpha,
            config.round_timeout,
            config.refresh_interval,
            cancel.clone(),
        );
        tracker.spawn(refresher.run());

        Ok(Self {
            id,
            config,
            kademlia,
            mux,
            client,
            local_addr,
            tracker,
            cancel,
        })
    }

    /// Convenience: build and start in one call.
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        let node = Self::try_new(config).await?;
        info!(id = %node.id, addr = %node.local_addr, "Node listening");
        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_contact(&self) -> Contact {
        Contact::new(self.id, self.local_addr.ip(), self.local_addr.port())
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn kademlia(&self) -> Kademlia {
        self.kademlia.clone()
    }

    /// Inserts already-known contacts directly into the routing table.
    pub async fn seed(&self, contacts: impl IntoIterator<Item = Contact>) {
        for contact in contacts {
            self.kademlia.insert(contact).await;
        }
    }

    /// Visits every routing-table entry with its bucket index.
    pub async fn walk<F>(&self, f: F)
    where
        F: FnMut(usize, &Contact),
    {
        self.kademlia.table.lock().await.walk(f);
    }

    /// Joins the network through a gateway whose id is unknown:
    /// ping it, take its first pong off the ping-reply buffer, insert the
    /// learned contact, then run a lookup for the local id so the closest
    /// neighbors populate the k-buckets.
    pub async fn bootstrap(&self, gateway: SocketAddr) -> Result<Contact, NodeError> {
        let ping_buffer = self.mux.buffer(BufferId::PingReply);
        self.client.send_ping(gateway);

        let mut reader = ping_buffer.first_reader();
        reader.set_deadline(self.config.round_timeout);
        let reply = reader.read().await?;

        let Message::PingResExplicit {
            sender,
            echo_random_id,
            ..
        } = reply
        else {
            return Err(NodeError::UnexpectedBootstrapReply(reply.multiplex_key()));
        };

        // The pong was read successfully; close the implicit-ping exchange
        // so the gateway inserts us too.
        self.client.send_implicit_ping(gateway, echo_random_id);

        let contact = Contact::new(sender, gateway.ip(), gateway.port());
        self.kademlia.insert(contact).await;
        debug!(gateway = %contact, "Bootstrap gateway inserted");

        self.lookup(self.id).await?;
        Ok(contact)
    }

    /// Iterative node lookup: the k closest contacts to `target` that
    /// answered.
    pub async fn lookup(&self, target: NodeId) -> Result<Vec<Contact>, NodeError> {
        let seeds = self
            .kademlia
            .alpha_closest(&target, self.config.alpha)
            .await;
        let lookup = IterativeLookup::new(
            LookupKind::Node,
            target,
            self.client.clone(),
            self.kademlia.clone(),
            self.mux.buffer(BufferId::NodeReply),
            self.config.k,
            self.config.alpha,
            self.config.round_timeout,
        );
        match lookup.run(seeds).await {
            LookupResult::Nodes(contacts) => Ok(contacts),
            LookupResult::Value { .. } => Ok(Vec::new()),
        }
    }

    /// Publishes `key -> value` on the network: the value is kept locally
    /// and offered to the alpha closest known contacts. Returns how many of
    /// them acknowledged.
    pub async fn store(&self, key: NodeId, value: SocketAddr) -> Result<usize, NodeError> {
        self.kademlia
            .store_value(key, value.ip(), value.port())
            .await;

        let targets = self.kademlia.closest(&key, self.config.alpha).await;
        if targets.is_empty() {
            return Err(NodeError::NoContactsFound);
        }

        let store_buffer = self.mux.buffer(BufferId::StoreReply);
        store_buffer.open();

        let mut responses: Vec<_> = targets
            .iter()
            .map(|contact| self.client.store(contact, key, value.ip(), value.port()))
            .collect();

        let mut acked = 0;
        for response in &mut responses {
            response.read_timeout(self.config.round_timeout);
            match response.read().await {
                Ok(_) => acked += 1,
                Err(e) => {
                    debug!(peer = %response.contact(), error = %e, "Store not acknowledged")
                }
            }
        }

        store_buffer.close();
        Ok(acked)
    }

    /// Resolves a stored key to the address it maps to, via an iterative
    /// FIND_VALUE lookup.
    pub async fn resolve(&self, key: NodeId) -> Result<SocketAddr, NodeError> {
        let seeds = self.kademlia.alpha_closest(&key, self.config.alpha).await;
        let lookup = IterativeLookup::new(
            LookupKind::Value,
            key,
            self.client.clone(),
            self.kademlia.clone(),
            self.mux.buffer(BufferId::ValueReply),
            self.config.k,
            self.config.alpha,
            self.config.round_timeout,
        );
        match lookup.run(seeds).await {
            LookupResult::Value { contacts, .. } => contacts
                .first()
                .map(|c| c.udp_addr())
                .ok_or(NodeError::NoContactsFound),
            LookupResult::Nodes(_) => Err(NodeError::NoContactsFound),
        }
    }

    /// Stops the refresher and the mux (receiver, reply thread, workers),
    /// then closes every reply buffer. Pending readers observe
    /// `BufferClosed`.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.mux.close().await;
        debug!(id = %self.id, "Node shut down");
    }
}
