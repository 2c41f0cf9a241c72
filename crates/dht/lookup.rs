use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, trace};

use crate::{
    buffers::{BufferError, ReplyBuffer},
    client::Client,
    kademlia::Kademlia,
    messages::Message,
    types::{Contact, Distance, NodeId},
};

const LATE_REPLY_CHANNEL_CAPACITY: usize = 64;

/// Which RPC the lookup iterates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    /// FIND_NODE: converge on the k closest contacts to the key.
    Node,
    /// FIND_VALUE: same walk, but a value hit short-circuits.
    Value,
}

/// What a finished lookup produced.
#[derive(Debug, Clone)]
pub enum LookupResult {
    /// The k closest contacts that answered, ascending by distance.
    Nodes(Vec<Contact>),
    /// A FIND_VALUE hit: the contacts carrying the stored value.
    Value { key: NodeId, contacts: Vec<Contact> },
}

/// A frontier candidate. Queried at most once per lookup; `answered` marks
/// it eligible for the result set.
struct PendingNode {
    contact: Contact,
    queried: bool,
    answered: bool,
}

impl PendingNode {
    fn new(contact: Contact) -> Self {
        Self {
            contact,
            queried: false,
            answered: false,
        }
    }
}

/// One RPC completion, from the round itself or from a late reply.
struct FindNodeResult {
    /// Frontier key of the node that was queried.
    origin: Distance,
    contacts: Vec<Contact>,
    value_key: Option<NodeId>,
}

/// The iterative FIND_NODE / FIND_VALUE state machine.
///
/// Rounds query up to `concurrency` of the closest unqueried candidates in
/// parallel with a per-RPC deadline. An RPC that misses the deadline is not
/// written off: its response handle moves to a long-lived reader whose
/// eventual answer feeds the same merge stream and can still steer later
/// rounds. A round that uncovers nothing new widens the next one to k; the
/// lookup ends when the first k frontier entries hold no unqueried node.
pub struct IterativeLookup {
    kind: LookupKind,
    key: NodeId,
    client: Client,
    kademlia: Kademlia,
    buffer: Arc<ReplyBuffer>,
    k: usize,
    alpha: usize,
    round_timeout: Duration,
    frontier: BTreeMap<Distance, PendingNode>,
    tracker: TaskTracker,
}

impl IterativeLookup {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: LookupKind,
        key: NodeId,
        client: Client,
        kademlia: Kademlia,
        buffer: Arc<ReplyBuffer>,
        k: usize,
        alpha: usize,
        round_timeout: Duration,
    ) -> Self {
        Self {
            kind,
            key,
            client,
            kademlia,
            buffer,
            k,
            alpha,
            round_timeout,
            frontier: BTreeMap::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Runs the lookup to completion. The reply buffer is opened for the
    /// duration and closed at the end, which also releases every
    /// still-waiting late-reply reader.
    pub async fn run(mut self, seeds: Vec<Contact>) -> LookupResult {
        self.buffer.open();
        for contact in seeds {
            self.frontier
                .insert(self.key.distance_to(&contact.id), PendingNode::new(contact));
        }

        let (late_tx, mut late_rx) = mpsc::channel(LATE_REPLY_CHANNEL_CAPACITY);
        let mut concurrency = self.alpha;
        let mut value_hit: Option<(NodeId, Vec<Contact>)> = None;

        loop {
            let selected = self.next_round(concurrency);
            if selected.is_empty() {
                break;
            }
            trace!(key = %self.key, round_size = selected.len(), "Lookup round");

            let (round_tx, mut round_rx) = mpsc::channel(selected.len());
            for (origin, contact) in selected {
                self.tracker.spawn(query_node(
                    self.kind,
                    self.key,
                    self.client.clone(),
                    contact,
                    origin,
                    self.round_timeout,
                    round_tx.clone(),
                    late_tx.clone(),
                    self.tracker.clone(),
                ));
            }
            drop(round_tx);

            // Merge this round's completions with whatever late replies
            // trickle in, until the round channel closes.
            let mut found_new_contact = false;
            loop {
                let result = tokio::select! {
                    result = round_rx.recv() => match result {
                        Some(result) => result,
                        None => break,
                    },
                    Some(result) = late_rx.recv() => result,
                };
                if let Some(found) = self.absorb(result, &mut found_new_contact).await {
                    value_hit = Some(found);
                    break;
                }
            }
            if value_hit.is_some() {
                break;
            }

            // A round that revealed nothing new gets one widened sweep over
            // the k closest unqueried nodes; a productive round resets the
            // width to alpha.
            concurrency = if found_new_contact { self.alpha } else { self.k };
        }

        self.buffer.close();
        self.tracker.close();
        self.tracker.wait().await;

        match value_hit {
            Some((key, contacts)) => LookupResult::Value { key, contacts },
            None => LookupResult::Nodes(self.closest_answered()),
        }
    }

    /// Picks up to `concurrency` unqueried nodes, closest first, from the
    /// first k frontier entries, marking them queried.
    fn next_round(&mut self, concurrency: usize) -> Vec<(Distance, Contact)> {
        let mut selected = Vec::with_capacity(concurrency);
        for (distance, node) in self.frontier.iter_mut().take(self.k) {
            if selected.len() >= concurrency {
                break;
            }
            if !node.queried {
                node.queried = true;
                selected.push((*distance, node.contact));
            }
        }
        selected
    }

    /// Folds one RPC completion into the frontier. Returns the value
    /// contacts on a FIND_VALUE hit.
    async fn absorb(
        &mut self,
        result: FindNodeResult,
        found_new_contact: &mut bool,
    ) -> Option<(NodeId, Vec<Contact>)> {
        if let Some(node) = self.frontier.get_mut(&result.origin) {
            node.answered = true;
        }

        if let Some(key) = result.value_key {
            return Some((key, result.contacts));
        }

        for contact in result.contacts {
            if contact.id == self.client.local_id() {
                continue;
            }
            let distance = self.key.distance_to(&contact.id);
            if !self.frontier.contains_key(&distance) {
                *found_new_contact = true;
                self.frontier.insert(distance, PendingNode::new(contact));
                // Learned contacts are offered to the routing table exactly
                // once, when they first enter the frontier.
                self.kademlia.insert(contact).await;
            }
        }
        None
    }

    /// The k closest contacts that answered, in ascending distance.
    fn closest_answered(&self) -> Vec<Contact> {
        self.frontier
            .values()
            .filter(|node| node.answered)
            .take(self.k)
            .map(|node| node.contact)
            .collect()
    }
}

/// Periodic routing-table refresh: on every tick, a node lookup for the
/// local id followed by lookups for a few random targets, so quiet nodes
/// keep discovering their neighborhood. The first tick fires immediately.
///
/// Refresh lookups share the node-reply buffer with caller-initiated
/// lookups, so only one lookup should be in flight at a time; a collision
/// degrades the older lookup to whatever it has accumulated rather than
/// failing it.
pub struct LookupRefresher {
    client: Client,
    kademlia: Kademlia,
    buffer: Arc<ReplyBuffer>,
    k: usize,
    alpha: usize,
    round_timeout: Duration,
    interval: Duration,
    cancel: CancellationToken,
}

const RANDOM_REFRESH_TARGETS: usize = 3;

impl LookupRefresher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client,
        kademlia: Kademlia,
        buffer: Arc<ReplyBuffer>,
        k: usize,
        alpha: usize,
        round_timeout: Duration,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            kademlia,
            buffer,
            k,
            alpha,
            round_timeout,
            interval,
            cancel,
        }
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.refresh() => {}
            }
        }
    }

    async fn refresh(&self) {
        debug!("Starting refresh lookups");

        let mut targets = vec![self.client.local_id()];
        targets.extend((0..RANDOM_REFRESH_TARGETS).map(|_| NodeId::random()));

        for target in targets {
            let seeds = self.kademlia.alpha_closest(&target, self.alpha).await;
            if seeds.is_empty() {
                continue;
            }
            let lookup = IterativeLookup::new(
                LookupKind::Node,
                target,
                self.client.clone(),
                self.kademlia.clone(),
                self.buffer.clone(),
                self.k,
                self.alpha,
                self.round_timeout,
            );
            lookup.run(seeds).await;
        }

        debug!("Refresh lookups finished");
    }
}

/// One round RPC. A timely answer goes to the round channel. A deadline
/// miss hands the response to a detached reader that waits without a
/// deadline and feeds the late channel; closing the lookup's reply buffer
/// is what finally releases it. Any other failure drops the node for this
/// lookup.
#[allow(clippy::too_many_arguments)]
async fn query_node(
    kind: LookupKind,
    key: NodeId,
    client: Client,
    contact: Contact,
    origin: Distance,
    round_timeout: Duration,
    round_tx: mpsc::Sender<FindNodeResult>,
    late_tx: mpsc::Sender<FindNodeResult>,
    tracker: TaskTracker,
) {
    let mut response = match kind {
        LookupKind::Node => client.find_node(&contact, key),
        LookupKind::Value => client.find_value(&contact, key),
    };
    response.read_timeout(round_timeout);

    match response.read().await {
        Ok(message) => {
            let _ = round_tx.send(result_of(origin, message)).await;
        }
        Err(BufferError::Timeout) => {
            trace!(peer = %contact, "Round deadline missed; waiting for a late reply");
            tracker.spawn(async move {
                match response.read().await {
                    Ok(message) => {
                        let _ = late_tx.send(result_of(origin, message)).await;
                    }
                    Err(e) => trace!(peer = %contact, error = %e, "Late reply never came"),
                }
            });
        }
        Err(e) => {
            debug!(peer = %contact, error = %e, "Lookup RPC failed");
        }
    }
}

fn result_of(origin: Distance, message: Message) -> FindNodeResult {
    match message {
        Message::FindNodeRes { contacts, .. } | Message::FindValueRes { contacts, .. } => {
            FindNodeResult {
                origin,
                contacts,
                value_key: None,
            }
        }
        Message::FindValueResOk { key, contacts, .. } => FindNodeResult {
            origin,
            contacts,
            value_key: Some(key),
        },
        other => {
            debug!(message_type = %other.multiplex_key(), "Unexpected lookup reply");
            FindNodeResult {
                origin,
                contacts: Vec::new(),
                value_key: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use std::net::{IpAddr, Ipv4Addr};

    fn contact(id_bytes: [u8; 20]) -> Contact {
        Contact::new(
            NodeId::from_bytes(id_bytes),
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            5050,
        )
    }

    #[test]
    fn frontier_iterates_closest_first() {
        let key = NodeId::from_bytes(hex!("28f787e3b60f99fb29b14266c40b536d6037307e"));
        let far = contact(hex!("68f787e3b60f99fb29b14266c40b536d6037307e"));
        let close = contact(hex!("28f787e3b60f99fb29b14266c40b536d6037303e"));
        let closer = contact(hex!("28f787e3b60f99fb29b14266c40b536d6037307f"));
        let furthest = contact(hex!("a8f787e3b60f99fb29b14266c40b536d6037307e"));

        let mut frontier: BTreeMap<Distance, PendingNode> = BTreeMap::new();
        for c in [far, closer, furthest, close] {
            frontier.insert(key.distance_to(&c.id), PendingNode::new(c));
        }

        let order: Vec<NodeId> = frontier.values().map(|n| n.contact.id).collect();
        assert_eq!(order, vec![closer.id, close.id, far.id, furthest.id]);
    }

    #[test]
    fn frontier_minimum_never_increases_on_insert() {
        let key = NodeId::random();
        let mut frontier: BTreeMap<Distance, PendingNode> = BTreeMap::new();

        let mut minimum: Option<Distance> = None;
        for _ in 0..64 {
            let c = contact(*NodeId::random().as_bytes());
            frontier.insert(key.distance_to(&c.id), PendingNode::new(c));
            let current = frontier.keys().next().copied();
            if let (Some(previous), Some(current)) = (minimum, current) {
                assert!(current <= previous);
            }
            minimum = current;
        }
    }
}
