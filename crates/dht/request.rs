use std::net::SocketAddr;

use crate::{
    messages::{Message, MessageType},
    types::Contact,
};

/// An inbound request queued for a handler: the decoded message plus the
/// datagram's source address.
#[derive(Debug, Clone)]
pub struct Request {
    pub from: SocketAddr,
    pub message: Message,
}

impl Request {
    pub fn new(from: SocketAddr, message: Message) -> Self {
        Self { from, message }
    }

    pub fn multiplex_key(&self) -> MessageType {
        self.message.multiplex_key()
    }

    /// The sender as a contact at the address the datagram actually came
    /// from.
    pub fn sender_contact(&self) -> Contact {
        Contact::new(self.message.sender_id(), self.from.ip(), self.from.port())
    }
}
