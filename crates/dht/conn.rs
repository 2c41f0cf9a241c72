use std::{io, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use tokio::{net::UdpSocket, sync::Mutex};
use tracing::trace;

use crate::messages::{MAX_MESSAGE_SIZE, MessageError, RawMessage};

#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] MessageError),
    #[error("Sender id is zero")]
    ZeroSender,
}

/// The node's datagram endpoint. Reads validate the multiplex key before any
/// further processing; writes are serialized through a single-writer lock so
/// concurrent handlers and clients never interleave on the socket.
#[derive(Debug, Clone)]
pub struct KadSocket {
    socket: Arc<UdpSocket>,
    write_lock: Arc<Mutex<()>>,
}

impl KadSocket {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::new(Arc::new(socket)))
    }

    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self {
            socket,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn writer(&self) -> KadWriter {
        KadWriter {
            socket: self.socket.clone(),
            write_lock: self.write_lock.clone(),
        }
    }

    /// Receives the next datagram. The buffer is sized to the largest
    /// message the protocol produces; anything with an unknown multiplex
    /// key, an undersized body or a zero sender id is rejected here so the
    /// caller can discard it and keep receiving.
    pub async fn recv(&self) -> Result<(Bytes, SocketAddr), ConnError> {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        let (read, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(read);

        let view = RawMessage::new(&buf)?;
        if view.sender_id()?.is_zero() {
            return Err(ConnError::ZeroSender);
        }
        trace!(bytes = read, %from, "Received datagram");

        Ok((Bytes::from(buf), from))
    }
}

/// Clone-able write half handed to request handlers and the client.
#[derive(Debug, Clone)]
pub struct KadWriter {
    socket: Arc<UdpSocket>,
    write_lock: Arc<Mutex<()>>,
}

impl KadWriter {
    /// Sends a datagram, looping until every byte is written.
    pub async fn write(&self, bytes: &[u8], addr: SocketAddr) -> Result<usize, ConnError> {
        let _guard = self.write_lock.lock().await;
        let mut written = 0;
        while written < bytes.len() {
            written += self.socket.send_to(&bytes[written..], addr).await?;
        }
        Ok(written)
    }
}
