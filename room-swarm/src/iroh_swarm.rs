//! `iroh` + `iroh-gossip` backed [`Swarm`] (spec §4.6).
//!
//! The gossip half subscribes to a `TopicId` and broadcasts/receives framed
//! bytes; a second ALPN is registered on the same [`Router`] for direct,
//! bidirectional replication streams, since block-store replication is a
//! pull protocol between two known peers rather than a broadcast.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use iroh::endpoint::Connection as IrohConnection;
use iroh::{Endpoint, NodeAddr, PublicKey, Watcher, protocol::Router};
use iroh_gossip::{
    ALPN as GOSSIP_ALPN,
    api::{Event, GossipTopic, Message},
    net::Gossip,
    proto::TopicId,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};

use crate::swarm::{Connection, Duplex, PeerInfo, Swarm, TopicHandle};
use crate::topic::Topic;

/// ALPN for the room replication protocol; distinct from the gossip ALPN
/// so the same `Router` can dispatch both kinds of incoming stream.
const REPLICATION_ALPN: &[u8] = b"room-engine/replication/1";

pub struct IrohSwarm {
    endpoint: Endpoint,
    gossip: Gossip,
    _router: Router,
    addr: NodeAddr,
    incoming: Mutex<mpsc::Receiver<Connection>>,
}

impl IrohSwarm {
    pub async fn new(bootstrap: Vec<String>) -> Result<Self> {
        let _ = bootstrap; // discovery_n0() uses the public n0 discovery service
        let endpoint = Endpoint::builder().discovery_n0().bind().await?;
        let gossip = Gossip::builder().spawn(endpoint.clone());

        let (tx, rx) = mpsc::channel(64);
        let handler = ReplicationHandler { tx };

        let router = Router::builder(endpoint.clone())
            .accept(GOSSIP_ALPN, gossip.clone())
            .accept(REPLICATION_ALPN, handler)
            .spawn();
        let addr = endpoint.node_addr().initialized().await;

        Ok(Self {
            endpoint,
            gossip,
            _router: router,
            addr,
            incoming: Mutex::new(rx),
        })
    }
}

#[async_trait]
impl Swarm for IrohSwarm {
    fn local_peer(&self) -> PeerInfo {
        PeerInfo {
            public_key: *self.addr.node_id.as_bytes(),
            addr_hint: None,
        }
    }

    async fn join(&self, topic: Topic) -> Result<Box<dyn TopicHandle>> {
        let topic_id = TopicId::from_bytes(topic.0);
        let handle = self.gossip.subscribe(topic_id, vec![]).await?;
        Ok(Box::new(IrohTopicHandle {
            inner: Arc::new(Mutex::new(handle)),
        }))
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<Box<dyn Duplex>> {
        let node_id = PublicKey::from_bytes(&peer.public_key)?;
        let addr = NodeAddr::from(node_id);
        let conn = self.endpoint.connect(addr, REPLICATION_ALPN).await?;
        let (send, recv) = conn.open_bi().await?;
        Ok(Box::new(IrohDuplex { send, recv }))
    }

    async fn flush(&self) -> Result<()> {
        // A single discovery round against the n0 relay/DHT; iroh resolves
        // addressing lazily on first connect, so flush just confirms the
        // endpoint has bound and published its own address.
        let _ = self.endpoint.node_addr().initialized().await;
        Ok(())
    }

    async fn accept(&self) -> Result<Connection> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or_else(|| anyhow!("swarm accept loop closed"))
    }

    async fn close(&self) -> Result<()> {
        self.endpoint.close().await;
        Ok(())
    }
}

#[derive(Clone)]
struct ReplicationHandler {
    tx: mpsc::Sender<Connection>,
}

impl iroh::protocol::ProtocolHandler for ReplicationHandler {
    fn accept(&self, connection: IrohConnection) -> BoxFuture<'static, Result<()>> {
        let tx = self.tx.clone();
        Box::pin(async move {
            let remote = connection.remote_node_id()?;
            let (send, recv) = connection.accept_bi().await?;
            let info = PeerInfo {
                public_key: *remote.as_bytes(),
                addr_hint: None,
            };
            let duplex: Box<dyn Duplex> = Box::new(IrohDuplex { send, recv });
            let _ = tx.send(Connection { stream: duplex, info }).await;
            Ok(())
        })
    }
}

struct IrohTopicHandle {
    inner: Arc<Mutex<GossipTopic>>,
}

#[async_trait]
impl TopicHandle for IrohTopicHandle {
    async fn publish(&self, bytes: &[u8]) -> Result<()> {
        let mut topic = self.inner.lock().await;
        topic.broadcast(Bytes::copy_from_slice(bytes)).await?;
        Ok(())
    }

    async fn next(&mut self) -> Result<Vec<u8>> {
        let mut topic = self.inner.lock().await;
        while let Some(ev) = topic.next().await {
            match ev? {
                Event::Received(Message { content, .. }) => return Ok(content.to_vec()),
                _ => continue,
            }
        }
        Err(anyhow!("gossip topic closed"))
    }
}

struct IrohDuplex {
    send: iroh::endpoint::SendStream,
    recv: iroh::endpoint::RecvStream,
}

#[async_trait]
impl Duplex for IrohDuplex {
    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        let len = u32::try_from(frame.len())?;
        self.send.write_all(&len.to_be_bytes()).await?;
        self.send.write_all(frame).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.recv.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        self.recv.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn close(&mut self) -> Result<()> {
        self.send.finish()?;
        Ok(())
    }
}
