use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex as StdMutex,
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    sync::{mpsc, oneshot},
    time::{Instant, MissedTickBehavior, interval_at, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::messages::{Message, MessageError, RawMessage};

const QUERY_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("Reply message not found")]
    NotFound,
    #[error("Read timed out")]
    Timeout,
    #[error("Buffer is closed")]
    Closed,
    #[error("Buffered reply failed to decode: {0}")]
    Decode(#[from] MessageError),
}

/// How a buffered response is keyed for correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRule {
    /// `sender_id || echoed_random_id`, both hex. Node, value and ping
    /// replies correlate on the nonce the response echoes.
    SenderAndEcho,
    /// `sender_id` alone. Store acks correlate per peer.
    SenderOnly,
}

impl KeyRule {
    fn key_of(&self, view: &RawMessage<'_>) -> Option<String> {
        let sender = view.sender_id().ok()?;
        match self {
            KeyRule::SenderOnly => Some(sender.to_string()),
            KeyRule::SenderAndEcho => {
                let echo = view.echo_random_id().ok()??;
                Some(format!("{sender}{echo}"))
            }
        }
    }
}

struct PendingQuery {
    /// `None` asks for the first available message regardless of key; used
    /// during bootstrap when the gateway's id is unknown.
    key: Option<String>,
    response: oneshot::Sender<Result<Bytes, BufferError>>,
    expires_at: Instant,
}

#[derive(Clone)]
struct BufferChannels {
    write_tx: mpsc::Sender<Bytes>,
    query_tx: mpsc::Sender<PendingQuery>,
    cancel: CancellationToken,
}

/// A reply-correlation buffer.
///
/// Producers feed raw response datagrams in through [`ReplyBuffer::write`];
/// consumers await the message whose correlation key matches through
/// [`BufferReader`]. State lives in a single actor task: writes buffer the
/// message under its key with an expiry, reads register a pending query, and
/// the actor delivers whenever a key shows up on both sides, deleting both
/// entries. A periodic sweep purges expired messages and answers expired
/// pending queries with `NotFound`. Closing the buffer answers everything
/// still pending with `Closed`.
pub struct ReplyBuffer {
    name: &'static str,
    key_rule: KeyRule,
    entry_expiry: Duration,
    purge_interval: Duration,
    channels: StdMutex<Option<BufferChannels>>,
}

impl ReplyBuffer {
    pub fn new(
        name: &'static str,
        key_rule: KeyRule,
        entry_expiry: Duration,
        purge_interval: Duration,
    ) -> Self {
        Self {
            name,
            key_rule,
            entry_expiry,
            purge_interval,
            channels: StdMutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_open(&self) -> bool {
        self.channels.lock().is_ok_and(|ch| ch.is_some())
    }

    /// Spawns the buffer actor. A no-op if the buffer is already open.
    pub fn open(&self) {
        let Ok(mut slot) = self.channels.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }

        let (write_tx, write_rx) = mpsc::channel(QUERY_CHANNEL_CAPACITY);
        let (query_tx, query_rx) = mpsc::channel(QUERY_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        *slot = Some(BufferChannels {
            write_tx,
            query_tx,
            cancel: cancel.clone(),
        });

        tokio::spawn(accept(
            self.name,
            self.key_rule,
            self.entry_expiry,
            self.purge_interval,
            write_rx,
            query_rx,
            cancel,
        ));
    }

    /// Stops the actor; pending readers observe `Closed`. A no-op if the
    /// buffer is not open.
    pub fn close(&self) {
        let Ok(mut slot) = self.channels.lock() else {
            return;
        };
        if let Some(channels) = slot.take() {
            channels.cancel.cancel();
        }
    }

    /// Enqueues a raw response datagram. Never blocks on matching; fails
    /// only when the buffer is closed or its inbox is gone.
    pub async fn write(&self, raw: Bytes) -> Result<usize, BufferError> {
        let len = raw.len();
        let tx = {
            let slot = self.channels.lock().map_err(|_| BufferError::Closed)?;
            slot.as_ref()
                .ok_or(BufferError::Closed)?
                .write_tx
                .clone()
        };
        tx.send(raw).await.map_err(|_| BufferError::Closed)?;
        Ok(len)
    }

    /// A reader for the given correlation key.
    pub fn reader(&self, key: String) -> BufferReader {
        BufferReader {
            channels: self.snapshot(),
            key: Some(key),
            deadline: None,
            default_expiry: self.entry_expiry,
        }
    }

    /// A reader that takes whichever message arrives first, regardless of
    /// key. Only the ping-reply buffer uses this, during bootstrap.
    pub fn first_reader(&self) -> BufferReader {
        BufferReader {
            channels: self.snapshot(),
            key: None,
            deadline: None,
            default_expiry: self.entry_expiry,
        }
    }

    fn snapshot(&self) -> Option<BufferChannels> {
        self.channels.lock().ok().and_then(|slot| slot.clone())
    }
}

impl Drop for ReplyBuffer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consumer handle bound to one correlation key (or to "first available").
pub struct BufferReader {
    channels: Option<BufferChannels>,
    key: Option<String>,
    deadline: Option<Duration>,
    default_expiry: Duration,
}

impl BufferReader {
    /// Arms a per-read deadline; `Timeout` is returned if it elapses before
    /// a matching message is delivered.
    pub fn set_deadline(&mut self, deadline: Duration) {
        self.deadline = Some(deadline);
    }

    /// Blocks until a message with the reader's key is delivered, the
    /// deadline elapses, the pending query expires, or the buffer closes.
    pub async fn read(&mut self) -> Result<Message, BufferError> {
        let Some(channels) = &self.channels else {
            return Err(BufferError::Closed);
        };

        let (response_tx, response_rx) = oneshot::channel();
        let expires_at = Instant::now() + self.deadline.unwrap_or(self.default_expiry);
        let query = PendingQuery {
            key: self.key.clone(),
            response: response_tx,
            expires_at,
        };
        channels
            .query_tx
            .send(query)
            .await
            .map_err(|_| BufferError::Closed)?;

        let outcome = match self.deadline {
            Some(deadline) => timeout(deadline, response_rx)
                .await
                .map_err(|_| BufferError::Timeout)?,
            None => response_rx.await,
        };
        let raw = outcome.map_err(|_| BufferError::Closed)??;
        Ok(Message::parse(&raw)?)
    }
}

/// The buffer actor: sole owner of the buffered-message and pending-query
/// maps. On every iteration it first delivers all keys present on both
/// sides, then waits for the next write, query, purge tick or exit.
async fn accept(
    name: &'static str,
    key_rule: KeyRule,
    entry_expiry: Duration,
    purge_interval: Duration,
    mut write_rx: mpsc::Receiver<Bytes>,
    mut query_rx: mpsc::Receiver<PendingQuery>,
    cancel: CancellationToken,
) {
    let mut buf: HashMap<String, (Bytes, Instant)> = HashMap::new();
    let mut pending: HashMap<String, PendingQuery> = HashMap::new();
    let mut first_waiters: VecDeque<PendingQuery> = VecDeque::new();

    let mut purge = interval_at(Instant::now() + purge_interval, purge_interval);
    purge.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        deliver_matches(&mut buf, &mut pending, &mut first_waiters);

        tokio::select! {
            _ = cancel.cancelled() => {
                for (_, query) in pending.drain() {
                    let _ = query.response.send(Err(BufferError::Closed));
                }
                for query in first_waiters.drain(..) {
                    let _ = query.response.send(Err(BufferError::Closed));
                }
                buf.clear();
                trace!(buffer = name, "Reply buffer closed");
                return;
            }
            Some(raw) = write_rx.recv() => {
                match RawMessage::new(&raw).ok().and_then(|view| key_rule.key_of(&view)) {
                    Some(key) => {
                        trace!(buffer = name, %key, "Buffered reply");
                        buf.insert(key, (raw, Instant::now() + entry_expiry));
                    }
                    None => debug!(buffer = name, "Dropping reply without a correlation key"),
                }
            }
            Some(query) = query_rx.recv() => {
                if let Some(key) = query.key.clone() {
                    trace!(buffer = name, %key, "Pending query registered");
                    pending.insert(key, query);
                } else {
                    first_waiters.push_back(query);
                }
            }
            _ = purge.tick() => {
                let now = Instant::now();
                buf.retain(|_, (_, expires_at)| *expires_at > now);
                let expired: Vec<String> = pending
                    .iter()
                    .filter(|(_, q)| q.expires_at <= now)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in expired {
                    if let Some(query) = pending.remove(&key) {
                        let _ = query.response.send(Err(BufferError::NotFound));
                    }
                }
                while let Some(idx) = first_waiters.iter().position(|q| q.expires_at <= now) {
                    if let Some(query) = first_waiters.remove(idx) {
                        let _ = query.response.send(Err(BufferError::NotFound));
                    }
                }
            }
        }
    }
}

fn deliver_matches(
    buf: &mut HashMap<String, (Bytes, Instant)>,
    pending: &mut HashMap<String, PendingQuery>,
    first_waiters: &mut VecDeque<PendingQuery>,
) {
    let ready: Vec<String> = pending
        .keys()
        .filter(|key| buf.contains_key(*key))
        .cloned()
        .collect();
    for key in ready {
        if let (Some((raw, expires_at)), Some(query)) = (buf.remove(&key), pending.remove(&key)) {
            // A reader that gave up (deadline fired) leaves a dead query
            // behind; keep the message buffered so a retry can still take
            // it.
            if let Err(Ok(raw)) = query.response.send(Ok(raw)) {
                buf.insert(key, (raw, expires_at));
            }
        }
    }

    while !first_waiters.is_empty() {
        let Some(key) = buf.keys().next().cloned() else {
            break;
        };
        if let (Some((raw, expires_at)), Some(query)) = (buf.remove(&key), first_waiters.pop_front())
        {
            if let Err(Ok(raw)) = query.response.send(Ok(raw)) {
                buf.insert(key, (raw, expires_at));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;
    use std::time::Duration;

    fn store_response(sender: NodeId, echo: NodeId) -> Bytes {
        Bytes::from(
            Message::StoreRes {
                sender,
                echo_random_id: echo,
                random_id: NodeId::random(),
            }
            .encode(),
        )
    }

    fn keyed_buffer() -> ReplyBuffer {
        ReplyBuffer::new(
            "test-reply",
            KeyRule::SenderAndEcho,
            Duration::from_secs(1),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn delivers_match_by_sender_and_echo() {
        let buffer = keyed_buffer();
        buffer.open();

        let sender = NodeId::random();
        let echo = NodeId::random();
        buffer
            .write(store_response(sender, echo))
            .await
            .expect("write succeeds");

        let mut reader = buffer.reader(format!("{sender}{echo}"));
        let message = reader.read().await.expect("match is delivered");
        assert_eq!(message.sender_id(), sender);
        assert_eq!(message.echo_random_id(), Some(echo));
    }

    #[tokio::test]
    async fn delivers_when_query_arrives_first() {
        let buffer = keyed_buffer();
        buffer.open();

        let sender = NodeId::random();
        let echo = NodeId::random();
        let mut reader = buffer.reader(format!("{sender}{echo}"));

        let write = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            buffer.write(store_response(sender, echo)).await
        };
        let (read_result, write_result) = tokio::join!(reader.read(), write);
        write_result.expect("write succeeds");
        assert_eq!(read_result.expect("delivered").sender_id(), sender);
    }

    #[tokio::test]
    async fn mismatched_key_times_out_on_reader_deadline() {
        // A purge cadence far beyond the deadline, so the reader's own timer
        // is the first to fire.
        let buffer = ReplyBuffer::new(
            "test-reply",
            KeyRule::SenderAndEcho,
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        buffer.open();

        buffer
            .write(store_response(NodeId::random(), NodeId::random()))
            .await
            .expect("write succeeds");

        let mut reader = buffer.reader(format!("{}{}", NodeId::random(), NodeId::random()));
        reader.set_deadline(Duration::from_millis(100));
        assert!(matches!(reader.read().await, Err(BufferError::Timeout)));
    }

    #[tokio::test]
    async fn mismatched_key_expires_to_not_found() {
        let buffer = ReplyBuffer::new(
            "test-reply",
            KeyRule::SenderAndEcho,
            Duration::from_millis(100),
            Duration::from_millis(30),
        );
        buffer.open();

        let mut reader = buffer.reader(format!("{}{}", NodeId::random(), NodeId::random()));
        assert!(matches!(reader.read().await, Err(BufferError::NotFound)));
    }

    #[tokio::test]
    async fn timed_out_reader_absorbs_a_late_message_on_retry() {
        let buffer = keyed_buffer();
        buffer.open();

        let sender = NodeId::random();
        let echo = NodeId::random();

        let mut reader = buffer.reader(format!("{sender}{echo}"));
        reader.set_deadline(Duration::from_millis(50));
        assert!(matches!(reader.read().await, Err(BufferError::Timeout)));

        // The reply shows up after the deadline; a deadline-less re-read
        // still gets it.
        buffer
            .write(store_response(sender, echo))
            .await
            .expect("write succeeds");
        let mut retry = buffer.reader(format!("{sender}{echo}"));
        let message = retry.read().await.expect("late message delivered");
        assert_eq!(message.sender_id(), sender);
    }

    #[tokio::test]
    async fn close_drains_pending_readers() {
        let buffer = keyed_buffer();
        buffer.open();

        let mut reader = buffer.reader(format!("{}{}", NodeId::random(), NodeId::random()));
        let read = tokio::spawn(async move { reader.read().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();

        let outcome = read.await.expect("reader task finishes");
        assert!(matches!(outcome, Err(BufferError::Closed)));
        assert!(!buffer.is_open());
    }

    #[tokio::test]
    async fn write_to_closed_buffer_fails() {
        let buffer = keyed_buffer();
        assert!(matches!(
            buffer
                .write(store_response(NodeId::random(), NodeId::random()))
                .await,
            Err(BufferError::Closed)
        ));
    }

    #[tokio::test]
    async fn first_reader_takes_any_message() {
        let buffer = ReplyBuffer::new(
            "ping-reply",
            KeyRule::SenderAndEcho,
            Duration::from_secs(5),
            Duration::from_secs(3),
        );
        buffer.open();

        let sender = NodeId::random();
        buffer
            .write(store_response(sender, NodeId::random()))
            .await
            .expect("write succeeds");

        let mut reader = buffer.first_reader();
        reader.set_deadline(Duration::from_millis(200));
        let message = reader.read().await.expect("first message delivered");
        assert_eq!(message.sender_id(), sender);
    }

    #[tokio::test]
    async fn store_acks_correlate_per_sender() {
        let buffer = ReplyBuffer::new(
            "store-reply",
            KeyRule::SenderOnly,
            Duration::from_secs(1),
            Duration::from_millis(50),
        );
        buffer.open();

        let sender = NodeId::random();
        buffer
            .write(store_response(sender, NodeId::random()))
            .await
            .expect("write succeeds");

        let mut reader = buffer.reader(sender.to_string());
        assert_eq!(reader.read().await.expect("delivered").sender_id(), sender);
    }
}
