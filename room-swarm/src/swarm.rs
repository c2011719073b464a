//! Transport-agnostic swarm traits (spec §4.6).
//!
//! The gossip topic is used for lightweight presence/announcement
//! broadcast, but replication and pairing need a point-to-point encrypted
//! stream per peer, so this crate adds [`Duplex`] and a `connections()`
//! event source on top of the topic/gossip primitives.

use async_trait::async_trait;

use crate::topic::Topic;

/// Identifies a remote peer on the swarm: its 32-byte public key plus
/// whatever address hints the transport resolved for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub public_key: [u8; 32],
    pub addr_hint: Option<String>,
}

impl PeerInfo {
    pub fn key_hex(&self) -> String {
        hex::encode(self.public_key)
    }
}

/// A broadcast topic handle: publish bytes to every subscriber, receive
/// bytes other subscribers published. Used for presence announcements and
/// the blind-pairing side channel, never for replication bulk data.
#[async_trait]
pub trait TopicHandle: Send + Sync {
    async fn publish(&self, bytes: &[u8]) -> anyhow::Result<()>;
    async fn next(&mut self) -> anyhow::Result<Vec<u8>>;
}

/// A single-owner, length-framed, encrypted point-to-point stream.
///
/// Block-store replication and the pairing handshake both exchange
/// discrete frames, never raw byte ranges, so the duplex is framed at this
/// layer rather than exposing `AsyncRead`/`AsyncWrite`.
#[async_trait]
pub trait Duplex: Send + Sync {
    async fn send(&mut self, frame: &[u8]) -> anyhow::Result<()>;
    async fn recv(&mut self) -> anyhow::Result<Vec<u8>>;
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// A freshly accepted or dialed connection, handed to the room so it can
/// multiplex block-store replication over it.
pub struct Connection {
    pub stream: Box<dyn Duplex>,
    pub info: PeerInfo,
}

/// The swarm: DHT discovery by topic plus encrypted streams to peers found
/// that way. `join` subscribes to broadcast announcements on a topic;
/// `connect` dials a specific peer directly; `connections()` drains the
/// channel of inbound connections the swarm accepted.
#[async_trait]
pub trait Swarm: Send + Sync {
    fn local_peer(&self) -> PeerInfo;

    async fn join(&self, topic: Topic) -> anyhow::Result<Box<dyn TopicHandle>>;

    async fn connect(&self, peer: &PeerInfo) -> anyhow::Result<Box<dyn Duplex>>;

    /// Resolves once the local node has completed at least one discovery
    /// round (spec §4.6, `flush()`).
    async fn flush(&self) -> anyhow::Result<()>;

    /// Awaits the next `connection(stream, info)` event. Implementations
    /// hold the receiving half of their accept channel behind an internal
    /// lock so any number of callers (room, drive) can await connections
    /// concurrently without owning the swarm mutably.
    async fn accept(&self) -> anyhow::Result<Connection>;

    /// Tears down the swarm's network resources (endpoint, subscriptions).
    /// Part of the room's ordered close (spec §5).
    async fn close(&self) -> anyhow::Result<()>;
}
