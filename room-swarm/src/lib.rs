//! DHT discovery and encrypted multiplexed streams for the Room Engine.
//!
//! This crate is the swarm layer of spec §4.6: a Kademlia-style DHT for
//! peer discovery by 32-byte topic, plus Noise-grade encrypted streams for
//! point-to-point replication. `room-core` never names an `iroh` type
//! directly; it only depends on the [`Swarm`], [`TopicHandle`] and
//! [`Duplex`] traits exported here, so the replication and pairing
//! protocols stay transport-agnostic.

pub mod iroh_swarm;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod swarm;
pub mod topic;

pub use iroh_swarm::IrohSwarm;
pub use swarm::{Connection, Duplex, PeerInfo, Swarm, TopicHandle};
pub use topic::{Topic, topic_from_discovery_key, topic_from_name};
