//! A Kademlia DHT node.
//!
//! The pieces, leaves first: a fixed-layout message codec
//! ([`messages`]), a locked UDP endpoint ([`conn`]), actor-style reply
//! buffers correlating responses to outstanding queries ([`buffers`]), a
//! multiplexer feeding requests to a bounded worker pool ([`mux`]), the RPC
//! client ([`client`]), the iterative FIND_NODE / FIND_VALUE engine
//! ([`lookup`]) and the routing table ([`kademlia`]). [`node::Node`] ties
//! them together into a peer that can bootstrap, look up, store and
//! resolve.
//!
//! Liveness is piggy-backed on regular traffic: serving any request
//! pre-registers an expected PingResponse, the requester echoes our nonce
//! back after reading our reply, and the match is what admits the contact
//! into the routing table.

pub mod buffers;
pub mod client;
pub mod config;
pub mod conn;
pub mod handlers;
pub mod kademlia;
pub mod lookup;
pub mod messages;
pub mod mux;
pub mod node;
pub mod request;
pub mod response;
pub mod types;

pub use config::NodeConfig;
pub use node::{Node, NodeError};
pub use types::{Contact, NodeId};
