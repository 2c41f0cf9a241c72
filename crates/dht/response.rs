use std::{sync::Arc, time::Duration};

use crate::{
    buffers::{BufferError, ReplyBuffer},
    messages::Message,
    types::{Contact, NodeId},
};

/// Fired with the echoed random id whenever a response is successfully read.
pub(crate) type ImplicitPingFn = Box<dyn Fn(NodeId) + Send + Sync>;

/// A pending RPC reply, bound to the reply buffer that will receive it.
///
/// The correlation key is `contact_id || matcher`: requests that correlate
/// on their nonce pass it as the matcher, store requests (which correlate
/// per peer) pass an empty one.
pub struct Response {
    contact: Contact,
    buffer: Arc<ReplyBuffer>,
    matcher: String,
    read_timeout: Option<Duration>,
    send_implicit_ping: Option<ImplicitPingFn>,
}

impl Response {
    pub fn new(contact: Contact, buffer: Arc<ReplyBuffer>, matcher: String) -> Self {
        Self {
            contact,
            buffer,
            matcher,
            read_timeout: None,
            send_implicit_ping: None,
        }
    }

    pub(crate) fn with_implicit_ping(mut self, callback: ImplicitPingFn) -> Self {
        self.send_implicit_ping = Some(callback);
        self
    }

    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    /// Installs a deadline for the next `read` call only.
    pub fn read_timeout(&mut self, deadline: Duration) {
        self.read_timeout = Some(deadline);
    }

    /// Awaits the correlated reply. On success the implicit-ping callback
    /// fires with the nonce the reply echoed, telling the remote we are
    /// alive without an extra round trip.
    pub async fn read(&mut self) -> Result<Message, BufferError> {
        let mut reader = self
            .buffer
            .reader(format!("{}{}", self.contact.id, self.matcher));
        if let Some(deadline) = self.read_timeout.take() {
            reader.set_deadline(deadline);
        }

        let message = reader.read().await?;
        if let (Some(callback), Some(echo)) =
            (&self.send_implicit_ping, message.echo_random_id())
        {
            callback(echo);
        }
        Ok(message)
    }
}
