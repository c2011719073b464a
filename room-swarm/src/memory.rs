//! In-memory [`Swarm`] double for tests.
//!
//! Autobase, view and pairing tests need a swarm that behaves like the real
//! one (topics, direct streams, connection events) without touching a DHT
//! or opening sockets. Every node sharing a [`MemoryNetwork`] can discover
//! and connect to every other node registered on it.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast, mpsc};

use crate::swarm::{Connection, Duplex, PeerInfo, Swarm, TopicHandle};
use crate::topic::Topic;

#[derive(Default)]
struct NetworkState {
    peers: HashMap<[u8; 32], mpsc::Sender<Connection>>,
    topics: HashMap<Topic, broadcast::Sender<Vec<u8>>>,
}

/// Shared rendezvous point for a cluster of [`MemorySwarm`] instances.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct MemorySwarm {
    network: MemoryNetwork,
    local: PeerInfo,
    incoming_tx: mpsc::Sender<Connection>,
    incoming_rx: Mutex<mpsc::Receiver<Connection>>,
}

impl MemorySwarm {
    pub async fn new(network: MemoryNetwork, public_key: [u8; 32]) -> Result<Self> {
        let (tx, rx) = mpsc::channel(64);
        {
            let mut state = network.state.lock().await;
            state.peers.insert(public_key, tx.clone());
        }
        Ok(Self {
            network,
            local: PeerInfo {
                public_key,
                addr_hint: None,
            },
            incoming_tx: tx,
            incoming_rx: Mutex::new(rx),
        })
    }
}

#[async_trait]
impl Swarm for MemorySwarm {
    fn local_peer(&self) -> PeerInfo {
        self.local.clone()
    }

    async fn join(&self, topic: Topic) -> Result<Box<dyn TopicHandle>> {
        let mut state = self.network.state.lock().await;
        let sender = state
            .topics
            .entry(topic)
            .or_insert_with(|| broadcast::channel(256).0)
            .clone();
        let receiver = sender.subscribe();
        Ok(Box::new(MemoryTopicHandle { sender, receiver }))
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<Box<dyn Duplex>> {
        let target_tx = {
            let state = self.network.state.lock().await;
            state
                .peers
                .get(&peer.public_key)
                .cloned()
                .ok_or_else(|| anyhow!("peer {} not registered on memory network", peer.key_hex()))?
        };
        let (a_tx, a_rx) = mpsc::channel::<Vec<u8>>(64);
        let (b_tx, b_rx) = mpsc::channel::<Vec<u8>>(64);
        let local_side = MemoryDuplex { tx: a_tx, rx: b_rx };
        let remote_side = MemoryDuplex { tx: b_tx, rx: a_rx };
        target_tx
            .send(Connection {
                stream: Box::new(remote_side),
                info: self.local.clone(),
            })
            .await
            .map_err(|_| anyhow!("peer accept channel closed"))?;
        Ok(Box::new(local_side))
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn accept(&self) -> Result<Connection> {
        let mut rx = self.incoming_rx.lock().await;
        rx.recv().await.ok_or_else(|| anyhow!("memory swarm closed"))
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.network.state.lock().await;
        state.peers.remove(&self.local.public_key);
        Ok(())
    }
}

impl Drop for MemorySwarm {
    fn drop(&mut self) {
        let _ = &self.incoming_tx;
    }
}

struct MemoryTopicHandle {
    sender: broadcast::Sender<Vec<u8>>,
    receiver: broadcast::Receiver<Vec<u8>>,
}

#[async_trait]
impl TopicHandle for MemoryTopicHandle {
    async fn publish(&self, bytes: &[u8]) -> Result<()> {
        let _ = self.sender.send(bytes.to_vec());
        Ok(())
    }

    async fn next(&mut self) -> Result<Vec<u8>> {
        loop {
            match self.receiver.recv().await {
                Ok(bytes) => return Ok(bytes),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(anyhow!("topic closed"));
                }
            }
        }
    }
}

struct MemoryDuplex {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl Duplex for MemoryDuplex {
    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.tx
            .send(frame.to_vec())
            .await
            .map_err(|_| anyhow!("peer hung up"))
    }

    async fn recv(&mut self) -> Result<Vec<u8>> {
        self.rx.recv().await.ok_or_else(|| anyhow!("peer hung up"))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_exchanges_frames() {
        let net = MemoryNetwork::new();
        let a = MemorySwarm::new(net.clone(), [1u8; 32]).await.unwrap();
        let b = MemorySwarm::new(net.clone(), [2u8; 32]).await.unwrap();

        let b_peer = b.local_peer();
        let mut to_b = a.connect(&b_peer).await.unwrap();
        let mut accepted = b.accept().await.unwrap();

        to_b.send(b"hello").await.unwrap();
        let got = accepted.stream.recv().await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn topic_broadcasts_to_subscribers() {
        let net = MemoryNetwork::new();
        let a = MemorySwarm::new(net.clone(), [3u8; 32]).await.unwrap();
        let b = MemorySwarm::new(net.clone(), [4u8; 32]).await.unwrap();

        let topic = crate::topic::topic_from_name(b"test-topic");
        let handle_a = a.join(topic).await.unwrap();
        let mut handle_b = b.join(topic).await.unwrap();

        handle_a.publish(b"ping").await.unwrap();
        let got = handle_b.next().await.unwrap();
        assert_eq!(got, b"ping");
    }
}
