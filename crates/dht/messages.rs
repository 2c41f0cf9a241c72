use std::fmt::{self, Display};
use std::net::IpAddr;

use bytes::BufMut;
use thiserror::Error;

use crate::types::{CONTACT_LENGTH_IN_BYTES, Contact, ID_LENGTH_IN_BYTES, NodeId, TypesError};

/// Largest datagram the protocol produces: a FindNodeRes carrying a full
/// bucket of contacts. Receive buffers are sized to this.
pub const MAX_MESSAGE_SIZE: usize = 841;

const HEADER_LENGTH_IN_BYTES: usize = 1 + ID_LENGTH_IN_BYTES;
const ECHO_OFFSET: usize = HEADER_LENGTH_IN_BYTES;

const PING_REQ_SIZE: usize = 41;
const PING_RES_SIZE: usize = 61;
const FIND_NODE_REQ_SIZE: usize = 61;
const FIND_VALUE_REQ_SIZE: usize = 61;
const STORE_REQ_SIZE: usize = 79;
const STORE_RES_SIZE: usize = 61;
const FIND_NODE_RES_MIN_SIZE: usize = 61;
const FIND_VALUE_RES_MIN_SIZE: usize = 61;
const FIND_VALUE_RES_OK_MIN_SIZE: usize = 81;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),
    #[error("Byte length does not match message size: {0}")]
    InvalidSize(usize),
    #[error("Contacts malformed: payload of {0} bytes is not a whole number of contacts")]
    MalformedContacts(usize),
    #[error("Malformed field: {0}")]
    Malformed(#[from] TypesError),
    #[error("Sender id is zero")]
    ZeroSender,
}

/// The multiplex key carried in byte 0 of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    FindNodeReq = 20,
    FindNodeRes = 21,
    PingReq = 22,
    /// Sent automatically after reading every response to a request.
    PingResImplicit = 23,
    /// Sent as the direct answer to a PingReq.
    PingResExplicit = 24,
    FindValueReq = 25,
    FindValueRes = 26,
    StoreReq = 27,
    StoreRes = 28,
    /// FindValue answer that carries the value; the key field is present.
    FindValueResOk = 29,
}

impl MessageType {
    pub fn from_u8(tag: u8) -> Result<Self, MessageError> {
        match tag {
            20 => Ok(Self::FindNodeReq),
            21 => Ok(Self::FindNodeRes),
            22 => Ok(Self::PingReq),
            23 => Ok(Self::PingResImplicit),
            24 => Ok(Self::PingResExplicit),
            25 => Ok(Self::FindValueReq),
            26 => Ok(Self::FindValueRes),
            27 => Ok(Self::StoreReq),
            28 => Ok(Self::StoreRes),
            29 => Ok(Self::FindValueResOk),
            other => Err(MessageError::InvalidMessageType(other)),
        }
    }

    /// Requests are dispatched to handlers. PingResImplicit counts as a
    /// request: it arrives unsolicited and only triggers side effects.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::FindNodeReq
                | Self::PingReq
                | Self::FindValueReq
                | Self::StoreReq
                | Self::PingResImplicit
        )
    }

    /// Responses are matched against outstanding queries in a reply buffer.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Self::FindNodeRes
                | Self::FindValueRes
                | Self::FindValueResOk
                | Self::StoreRes
                | Self::PingResExplicit
        )
    }

    /// Whether the layout has an echoed random id at offset 21.
    pub fn has_echo(&self) -> bool {
        self.is_response() || matches!(self, Self::PingResImplicit)
    }

    /// Minimum valid length for this variant; fixed variants must match it
    /// exactly.
    fn min_size(&self) -> usize {
        match self {
            Self::FindNodeReq => FIND_NODE_REQ_SIZE,
            Self::FindNodeRes => FIND_NODE_RES_MIN_SIZE,
            Self::PingReq => PING_REQ_SIZE,
            Self::PingResImplicit | Self::PingResExplicit => PING_RES_SIZE,
            Self::FindValueReq => FIND_VALUE_REQ_SIZE,
            Self::FindValueRes => FIND_VALUE_RES_MIN_SIZE,
            Self::StoreReq => STORE_REQ_SIZE,
            Self::StoreRes => STORE_RES_SIZE,
            Self::FindValueResOk => FIND_VALUE_RES_OK_MIN_SIZE,
        }
    }

    fn has_contact_list(&self) -> bool {
        matches!(
            self,
            Self::FindNodeRes | Self::FindValueRes | Self::FindValueResOk
        )
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FindNodeReq => "FindNodeRequest",
            Self::FindNodeRes => "FindNodeResponse",
            Self::PingReq => "PingRequest",
            Self::PingResImplicit => "PingResponse(implicit)",
            Self::PingResExplicit => "PingResponse(explicit)",
            Self::FindValueReq => "FindValueRequest",
            Self::FindValueRes => "FindValueResponse",
            Self::StoreReq => "StoreRequest",
            Self::StoreRes => "StoreResponse",
            Self::FindValueResOk => "FindValueResponse(found)",
        };
        write!(f, "{name}")
    }
}

/// A fully decoded protocol message.
///
/// General wire structure, after the 1-byte multiplex key:
/// sender (20) || [echo (20)] || payload || random id (20)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    FindNodeReq {
        sender: NodeId,
        target: NodeId,
        random_id: NodeId,
    },
    FindNodeRes {
        sender: NodeId,
        echo_random_id: NodeId,
        contacts: Vec<Contact>,
        random_id: NodeId,
    },
    PingReq {
        sender: NodeId,
        random_id: NodeId,
    },
    PingResImplicit {
        sender: NodeId,
        echo_random_id: NodeId,
        random_id: NodeId,
    },
    PingResExplicit {
        sender: NodeId,
        echo_random_id: NodeId,
        random_id: NodeId,
    },
    FindValueReq {
        sender: NodeId,
        key: NodeId,
        random_id: NodeId,
    },
    FindValueRes {
        sender: NodeId,
        echo_random_id: NodeId,
        contacts: Vec<Contact>,
        random_id: NodeId,
    },
    FindValueResOk {
        sender: NodeId,
        echo_random_id: NodeId,
        key: NodeId,
        contacts: Vec<Contact>,
        random_id: NodeId,
    },
    StoreReq {
        sender: NodeId,
        key: NodeId,
        port: u16,
        ip: IpAddr,
        random_id: NodeId,
    },
    StoreRes {
        sender: NodeId,
        echo_random_id: NodeId,
        random_id: NodeId,
    },
}

impl Message {
    pub fn multiplex_key(&self) -> MessageType {
        match self {
            Self::FindNodeReq { .. } => MessageType::FindNodeReq,
            Self::FindNodeRes { .. } => MessageType::FindNodeRes,
            Self::PingReq { .. } => MessageType::PingReq,
            Self::PingResImplicit { .. } => MessageType::PingResImplicit,
            Self::PingResExplicit { .. } => MessageType::PingResExplicit,
            Self::FindValueReq { .. } => MessageType::FindValueReq,
            Self::FindValueRes { .. } => MessageType::FindValueRes,
            Self::FindValueResOk { .. } => MessageType::FindValueResOk,
            Self::StoreReq { .. } => MessageType::StoreReq,
            Self::StoreRes { .. } => MessageType::StoreRes,
        }
    }

    pub fn sender_id(&self) -> NodeId {
        match self {
            Self::FindNodeReq { sender, .. }
            | Self::FindNodeRes { sender, .. }
            | Self::PingReq { sender, .. }
            | Self::PingResImplicit { sender, .. }
            | Self::PingResExplicit { sender, .. }
            | Self::FindValueReq { sender, .. }
            | Self::FindValueRes { sender, .. }
            | Self::FindValueResOk { sender, .. }
            | Self::StoreReq { sender, .. }
            | Self::StoreRes { sender, .. } => *sender,
        }
    }

    pub fn random_id(&self) -> NodeId {
        match self {
            Self::FindNodeReq { random_id, .. }
            | Self::FindNodeRes { random_id, .. }
            | Self::PingReq { random_id, .. }
            | Self::PingResImplicit { random_id, .. }
            | Self::PingResExplicit { random_id, .. }
            | Self::FindValueReq { random_id, .. }
            | Self::FindValueRes { random_id, .. }
            | Self::FindValueResOk { random_id, .. }
            | Self::StoreReq { random_id, .. }
            | Self::StoreRes { random_id, .. } => *random_id,
        }
    }

    /// The nonce this message echoes, if the layout carries one.
    pub fn echo_random_id(&self) -> Option<NodeId> {
        match self {
            Self::FindNodeRes { echo_random_id, .. }
            | Self::PingResImplicit { echo_random_id, .. }
            | Self::PingResExplicit { echo_random_id, .. }
            | Self::FindValueRes { echo_random_id, .. }
            | Self::FindValueResOk { echo_random_id, .. }
            | Self::StoreRes { echo_random_id, .. } => Some(*echo_random_id),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut dyn BufMut) {
        buf.put_u8(self.multiplex_key() as u8);
        match self {
            Self::FindNodeReq {
                sender,
                target,
                random_id,
            } => {
                buf.put_slice(sender.as_bytes());
                buf.put_slice(target.as_bytes());
                buf.put_slice(random_id.as_bytes());
            }
            Self::FindNodeRes {
                sender,
                echo_random_id,
                contacts,
                random_id,
            }
            | Self::FindValueRes {
                sender,
                echo_random_id,
                contacts,
                random_id,
            } => {
                buf.put_slice(sender.as_bytes());
                buf.put_slice(echo_random_id.as_bytes());
                for contact in contacts {
                    contact.encode(buf);
                }
                buf.put_slice(random_id.as_bytes());
            }
            Self::FindValueResOk {
                sender,
                echo_random_id,
                key,
                contacts,
                random_id,
            } => {
                buf.put_slice(sender.as_bytes());
                buf.put_slice(echo_random_id.as_bytes());
                buf.put_slice(key.as_bytes());
                for contact in contacts {
                    contact.encode(buf);
                }
                buf.put_slice(random_id.as_bytes());
            }
            Self::PingReq { sender, random_id } => {
                buf.put_slice(sender.as_bytes());
                buf.put_slice(random_id.as_bytes());
            }
            Self::PingResImplicit {
                sender,
                echo_random_id,
                random_id,
            }
            | Self::PingResExplicit {
                sender,
                echo_random_id,
                random_id,
            }
            | Self::StoreRes {
                sender,
                echo_random_id,
                random_id,
            } => {
                buf.put_slice(sender.as_bytes());
                buf.put_slice(echo_random_id.as_bytes());
                buf.put_slice(random_id.as_bytes());
            }
            Self::FindValueReq {
                sender,
                key,
                random_id,
            } => {
                buf.put_slice(sender.as_bytes());
                buf.put_slice(key.as_bytes());
                buf.put_slice(random_id.as_bytes());
            }
            Self::StoreReq {
                sender,
                key,
                port,
                ip,
                random_id,
            } => {
                buf.put_slice(sender.as_bytes());
                buf.put_slice(key.as_bytes());
                buf.put_u16(*port);
                let octets = match ip {
                    IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
                    IpAddr::V6(v6) => v6.octets(),
                };
                buf.put_slice(&octets);
                buf.put_slice(random_id.as_bytes());
            }
        }
    }

    /// Parses a datagram into a typed message. Byte 0 selects the variant;
    /// fixed-size variants must match their size exactly and contact lists
    /// must be a whole number of 38-byte entries.
    pub fn parse(raw: &[u8]) -> Result<Message, MessageError> {
        let raw_view = RawMessage::new(raw)?;
        let kind = raw_view.multiplex_key()?;

        if !kind.has_contact_list() && raw.len() != kind.min_size() {
            return Err(MessageError::InvalidSize(raw.len()));
        }

        let sender = raw_view.sender_id()?;
        if sender.is_zero() {
            return Err(MessageError::ZeroSender);
        }
        let random_id = raw_view.random_id()?;
        let payload = raw_view.payload()?;

        let message = match kind {
            MessageType::FindNodeReq => Message::FindNodeReq {
                sender,
                target: NodeId::from_slice(payload)?,
                random_id,
            },
            MessageType::PingReq => Message::PingReq { sender, random_id },
            MessageType::FindValueReq => Message::FindValueReq {
                sender,
                key: NodeId::from_slice(payload)?,
                random_id,
            },
            MessageType::PingResImplicit => Message::PingResImplicit {
                sender,
                echo_random_id: raw_view.required_echo()?,
                random_id,
            },
            MessageType::PingResExplicit => Message::PingResExplicit {
                sender,
                echo_random_id: raw_view.required_echo()?,
                random_id,
            },
            MessageType::StoreRes => Message::StoreRes {
                sender,
                echo_random_id: raw_view.required_echo()?,
                random_id,
            },
            MessageType::FindNodeRes => Message::FindNodeRes {
                sender,
                echo_random_id: raw_view.required_echo()?,
                contacts: parse_contacts(payload)?,
                random_id,
            },
            MessageType::FindValueRes => Message::FindValueRes {
                sender,
                echo_random_id: raw_view.required_echo()?,
                contacts: parse_contacts(payload)?,
                random_id,
            },
            MessageType::FindValueResOk => {
                let key = NodeId::from_slice(
                    payload
                        .get(..ID_LENGTH_IN_BYTES)
                        .ok_or(MessageError::InvalidSize(raw.len()))?,
                )?;
                Message::FindValueResOk {
                    sender,
                    echo_random_id: raw_view.required_echo()?,
                    key,
                    contacts: parse_contacts(&payload[ID_LENGTH_IN_BYTES..])?,
                    random_id,
                }
            }
            MessageType::StoreReq => {
                let key = NodeId::from_slice(&payload[..ID_LENGTH_IN_BYTES])?;
                let port = u16::from_be_bytes([payload[20], payload[21]]);
                let octets: [u8; 16] = payload[22..38]
                    .try_into()
                    .map_err(|_| MessageError::InvalidSize(raw.len()))?;
                let ip = crate::types::unmap_ipv4in6_address(IpAddr::V6(
                    std::net::Ipv6Addr::from(octets),
                ));
                Message::StoreReq {
                    sender,
                    key,
                    port,
                    ip,
                    random_id,
                }
            }
        };

        Ok(message)
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {}", self.multiplex_key(), self.sender_id())
    }
}

/// Splits a response payload into 38-byte wire contacts.
fn parse_contacts(raw: &[u8]) -> Result<Vec<Contact>, MessageError> {
    if raw.len() % CONTACT_LENGTH_IN_BYTES != 0 {
        return Err(MessageError::MalformedContacts(raw.len()));
    }
    raw.chunks_exact(CONTACT_LENGTH_IN_BYTES)
        .map(|chunk| Contact::decode(chunk).map_err(MessageError::from))
        .collect()
}

/// Cheap read-only view over an undecoded datagram.
///
/// Shares a single layout rule with the codec: header = key (1) || sender
/// (20); messages with an echo carry it at offset 21; the trailing 20 bytes
/// are always the random id; whatever sits between is the payload. The mux
/// routes and correlates on this view without paying for a full decode.
#[derive(Debug, Clone, Copy)]
pub struct RawMessage<'a>(&'a [u8]);

impl<'a> RawMessage<'a> {
    /// Wraps raw bytes, validating only that the multiplex key is known and
    /// the buffer meets the variant's minimum size.
    pub fn new(raw: &'a [u8]) -> Result<Self, MessageError> {
        let view = RawMessage(raw);
        let kind = view.multiplex_key()?;
        if raw.len() < kind.min_size() {
            return Err(MessageError::InvalidSize(raw.len()));
        }
        Ok(view)
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.0
    }

    pub fn multiplex_key(&self) -> Result<MessageType, MessageError> {
        let tag = self.0.first().ok_or(MessageError::InvalidSize(0))?;
        MessageType::from_u8(*tag)
    }

    pub fn sender_id(&self) -> Result<NodeId, MessageError> {
        let bytes = self
            .0
            .get(1..HEADER_LENGTH_IN_BYTES)
            .ok_or(MessageError::InvalidSize(self.0.len()))?;
        NodeId::from_slice(bytes).map_err(MessageError::from)
    }

    /// The echoed random id, or `None` for request layouts that do not carry
    /// one. PingResImplicit is a request but does echo.
    pub fn echo_random_id(&self) -> Result<Option<NodeId>, MessageError> {
        if !self.multiplex_key()?.has_echo() {
            return Ok(None);
        }
        let bytes = self
            .0
            .get(ECHO_OFFSET..ECHO_OFFSET + ID_LENGTH_IN_BYTES)
            .ok_or(MessageError::InvalidSize(self.0.len()))?;
        Ok(Some(NodeId::from_slice(bytes)?))
    }

    pub fn random_id(&self) -> Result<NodeId, MessageError> {
        let len = self.0.len();
        if len < HEADER_LENGTH_IN_BYTES + ID_LENGTH_IN_BYTES {
            return Err(MessageError::InvalidSize(len));
        }
        NodeId::from_slice(&self.0[len - ID_LENGTH_IN_BYTES..]).map_err(MessageError::from)
    }

    /// The bytes between the header (plus echo, when present) and the
    /// trailing random id.
    pub fn payload(&self) -> Result<&'a [u8], MessageError> {
        let start = if self.multiplex_key()?.has_echo() {
            ECHO_OFFSET + ID_LENGTH_IN_BYTES
        } else {
            HEADER_LENGTH_IN_BYTES
        };
        let end = self.0.len() - ID_LENGTH_IN_BYTES;
        if end < start {
            return Err(MessageError::InvalidSize(self.0.len()));
        }
        Ok(&self.0[start..end])
    }

    fn required_echo(&self) -> Result<NodeId, MessageError> {
        self.echo_random_id()?
            .ok_or(MessageError::InvalidSize(self.0.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use std::net::Ipv4Addr;

    fn id(bytes: [u8; 20]) -> NodeId {
        NodeId::from_bytes(bytes)
    }

    fn contact(bytes: [u8; 20]) -> Contact {
        Contact::new(id(bytes), IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 5050)
    }

    #[test]
    fn find_node_request_layout() {
        let msg = Message::FindNodeReq {
            sender: id(hex!("8bc8082329609092bf86dea25cf7784cd708cc5d")),
            target: id(hex!("8f2d6ae2378dda228d3bd39c41a4b6f6f538a41a")),
            random_id: id(hex!("28f787e3b60f99fb29b14266c40b536d6037307e")),
        };
        let raw = msg.encode();
        assert_eq!(raw.len(), FIND_NODE_REQ_SIZE);

        let view = RawMessage::new(&raw).expect("valid raw message");
        assert_eq!(view.multiplex_key().expect("key"), MessageType::FindNodeReq);
        assert_eq!(
            view.sender_id().expect("sender"),
            id(hex!("8bc8082329609092bf86dea25cf7784cd708cc5d"))
        );
        assert_eq!(
            view.payload().expect("payload"),
            hex!("8f2d6ae2378dda228d3bd39c41a4b6f6f538a41a")
        );
        assert_eq!(
            view.random_id().expect("random id"),
            id(hex!("28f787e3b60f99fb29b14266c40b536d6037307e"))
        );
        // A request layout has no echoed id.
        assert_eq!(view.echo_random_id().expect("echo"), None);

        assert_eq!(Message::parse(&raw).expect("parses"), msg);
    }

    #[test]
    fn find_node_response_roundtrip() {
        let msg = Message::FindNodeRes {
            sender: id(hex!("8bc8082329609092bf86dea25cf7784cd708cc5d")),
            echo_random_id: id(hex!("28f787e3b60f99fb29b14266c40b536d6037307e")),
            contacts: vec![
                contact(hex!("b4945c02ddd3d4484ed7200107b46f65f5300305")),
                contact(hex!("dc03f8f281c7118225901c8655f788cd84e3f449")),
                contact(hex!("9d079f19f9edca7f8b2f5ce58624b55ffec2c4f3")),
            ],
            random_id: id(hex!("8f2d6ae2378dda228d3bd39c41a4b6f6f538a41a")),
        };
        let raw = msg.encode();
        assert_eq!(raw.len(), FIND_NODE_RES_MIN_SIZE + 3 * CONTACT_LENGTH_IN_BYTES);

        let view = RawMessage::new(&raw).expect("valid raw message");
        assert_eq!(
            view.echo_random_id().expect("echo"),
            Some(id(hex!("28f787e3b60f99fb29b14266c40b536d6037307e")))
        );
        assert_eq!(view.payload().expect("payload").len(), 3 * CONTACT_LENGTH_IN_BYTES);

        assert_eq!(Message::parse(&raw).expect("parses"), msg);
    }

    #[test]
    fn ping_roundtrips() {
        let req = Message::PingReq {
            sender: NodeId::random(),
            random_id: NodeId::random(),
        };
        let raw = req.encode();
        assert_eq!(raw.len(), PING_REQ_SIZE);
        assert_eq!(Message::parse(&raw).expect("parses"), req);

        let implicit = Message::PingResImplicit {
            sender: NodeId::random(),
            echo_random_id: NodeId::random(),
            random_id: NodeId::random(),
        };
        let raw = implicit.encode();
        assert_eq!(raw.len(), PING_RES_SIZE);
        assert_eq!(raw[0], MessageType::PingResImplicit as u8);
        assert_eq!(Message::parse(&raw).expect("parses"), implicit);

        let explicit = Message::PingResExplicit {
            sender: NodeId::random(),
            echo_random_id: NodeId::random(),
            random_id: NodeId::random(),
        };
        assert_eq!(explicit.encode()[0], MessageType::PingResExplicit as u8);
    }

    #[test]
    fn store_request_roundtrip() {
        let msg = Message::StoreReq {
            sender: NodeId::random(),
            key: NodeId::random(),
            port: 8000,
            ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            random_id: NodeId::random(),
        };
        let raw = msg.encode();
        assert_eq!(raw.len(), STORE_REQ_SIZE);
        assert_eq!(Message::parse(&raw).expect("parses"), msg);
    }

    #[test]
    fn find_value_variants_roundtrip() {
        let not_found = Message::FindValueRes {
            sender: NodeId::random(),
            echo_random_id: NodeId::random(),
            contacts: vec![contact(hex!("b4945c02ddd3d4484ed7200107b46f65f5300305"))],
            random_id: NodeId::random(),
        };
        assert_eq!(not_found.encode()[0], MessageType::FindValueRes as u8);
        assert_eq!(
            Message::parse(&not_found.encode()).expect("parses"),
            not_found
        );

        let found = Message::FindValueResOk {
            sender: NodeId::random(),
            echo_random_id: NodeId::random(),
            key: id(hex!("8f2d6ae2378dda228d3bd39c41a4b6f6f538a41a")),
            contacts: vec![contact(hex!("dc03f8f281c7118225901c8655f788cd84e3f449"))],
            random_id: NodeId::random(),
        };
        assert_eq!(found.encode()[0], MessageType::FindValueResOk as u8);
        assert_eq!(Message::parse(&found.encode()).expect("parses"), found);
    }

    #[test]
    fn rejects_unknown_multiplex_key() {
        let mut raw = Message::PingReq {
            sender: NodeId::random(),
            random_id: NodeId::random(),
        }
        .encode();
        raw[0] = 42;
        assert!(matches!(
            Message::parse(&raw),
            Err(MessageError::InvalidMessageType(42))
        ));
    }

    #[test]
    fn rejects_wrong_fixed_size() {
        let mut raw = Message::PingReq {
            sender: NodeId::random(),
            random_id: NodeId::random(),
        }
        .encode();
        raw.push(0);
        assert!(matches!(
            Message::parse(&raw),
            Err(MessageError::InvalidSize(_))
        ));
    }

    #[test]
    fn rejects_ragged_contact_list() {
        let mut raw = Message::FindNodeRes {
            sender: NodeId::random(),
            echo_random_id: NodeId::random(),
            contacts: vec![contact(hex!("b4945c02ddd3d4484ed7200107b46f65f5300305"))],
            random_id: NodeId::random(),
        }
        .encode();
        // Shear one byte off the contact list; the trailing random id slides
        // left so the payload is no longer a multiple of 38.
        raw.remove(FIND_NODE_RES_MIN_SIZE - ID_LENGTH_IN_BYTES);
        assert!(matches!(
            Message::parse(&raw),
            Err(MessageError::MalformedContacts(_))
        ));
    }

    #[test]
    fn rejects_zero_sender() {
        let raw = Message::PingReq {
            sender: NodeId::random(),
            random_id: NodeId::random(),
        }
        .encode();
        let mut zeroed = raw.clone();
        zeroed[1..21].fill(0);
        assert!(matches!(
            Message::parse(&zeroed),
            Err(MessageError::ZeroSender)
        ));
    }
}
