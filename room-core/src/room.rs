//! The Room façade (spec §4.2 item 8, §6 "Room API"): the only surface the
//! UI sees. Owns one autobase, one view, one drive, and one swarm
//! membership; wires them together and exposes the flattened operation set
//! plus an event stream (spec §9's "cyclic references" note: the room owns,
//! the drive only borrows the swarm through the trait object).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::Serialize;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Duration;
use tracing::{info, warn};

use crate::autobase::Autobase;
use crate::block_store::BlockStore;
use crate::dispatch::{self, Command};
use crate::drive::{Drive, DriveEntry, ListOptions, ReadRange, UploadOptions};
use crate::error::RoomError;
use crate::identity::Identity;
use crate::pairing::{self, InviteToken, PairingGrant};
use crate::view::{MessageQuery, Message, RoomInfo, View, WriterRecord};
use room_swarm::{Connection, Duplex, PeerInfo, Swarm, topic_from_discovery_key};

/// Everything `Room::create`/`open`/`pair` need that isn't derivable from
/// the invite or an existing corestore directory (spec §6 `open(corestore,
/// {key?, encryptionKey?, driveKey?, swarm?, bootstrap?})`).
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub corestore_path: PathBuf,
    pub bootstrap: Vec<String>,
    pub room_key: Option<[u8; 32]>,
    pub encryption_key: Option<[u8; 32]>,
    pub drive_key: Option<[u8; 32]>,
}

impl RoomConfig {
    fn writer_dir(&self, public_key: &[u8; 32]) -> PathBuf {
        self.corestore_path.join("writers").join(hex::encode(public_key))
    }

    fn drive_dir(&self, public_key: &[u8; 32]) -> PathBuf {
        self.corestore_path.join("drive").join(hex::encode(public_key))
    }
}

/// Room status state machine (spec §4.6): `new → connecting → connected ⇄
/// reconnecting → error? → closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomStatus {
    New,
    Connecting,
    Connected,
    Reconnecting,
    Error,
    Closed,
}

#[derive(Debug, Clone)]
pub enum RoomEvent {
    Update,
    NewMessage(Message),
    Error(String),
    Mistake(String),
    StatusChanged(RoomStatus),
}

#[derive(Debug, Serialize)]
pub struct WriterView {
    pub key: [u8; 32],
    pub removed: bool,
    pub username: Option<String>,
}

/// Wire frame for the replication multiplexer: one physical [`Duplex`]
/// carries replication traffic for several block stores (writer-cores and
/// the drive chunk-core), tagged by each store's own public key (spec
/// §4.6's "the room multiplexes block-store replication ... over the
/// stream").
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct MuxFrame {
    core: [u8; 32],
    payload: Vec<u8>,
}

pub struct Room {
    identity: Identity,
    config: RoomConfig,
    swarm: Arc<dyn Swarm>,
    view: Arc<View>,
    autobase: Arc<Autobase>,
    local_writer: BlockStore,
    room_key: [u8; 32],
    encryption_key: [u8; 32],
    drive: Arc<Drive>,
    status: watch::Sender<RoomStatus>,
    events: broadcast::Sender<RoomEvent>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pairing_tasks: Mutex<Vec<AbortHandle>>,
}

impl Room {
    /// Creates a brand-new room with a fresh writer-core key pair (spec §3
    /// "created locally: fresh key pair for its autobase").
    pub async fn create(
        identity: Identity,
        config: RoomConfig,
        swarm: Arc<dyn Swarm>,
        name: String,
        now_ms: u64,
    ) -> Result<Self, RoomError> {
        let room_signing_key = SigningKey::generate(&mut OsRng);
        let room_key = room_signing_key.verifying_key().to_bytes();
        let bootstrap = BlockStore::create_local(config.writer_dir(&room_key), room_signing_key).await?;

        let view = Arc::new(View::new());
        let autobase = Arc::new(Autobase::new(view.clone(), bootstrap.clone()));
        let encryption_key = config.encryption_key.unwrap_or_else(rand_key);
        let drive_key = config.drive_key.unwrap_or(room_key);
        let drive_store = BlockStore::create_local(config.drive_dir(&drive_key), SigningKey::generate(&mut OsRng)).await?;
        let drive = Arc::new(Drive::new(drive_store));

        let room = Self::assemble(identity, config, swarm, view, autobase, bootstrap, room_key, encryption_key, drive);

        room.append_local(Command::SetMetadata(dispatch::SetMetadataPayload {
            id: "room-info".into(),
            value: serde_json::json!({"id": hex::encode(room_key), "name": name, "createdAt": now_ms}),
        }))
        .await?;
        room.append_local(Command::SetDriveKey(dispatch::SetDriveKeyPayload { drive_key }))
            .await?;

        room.set_status(RoomStatus::Connecting);
        room.spawn_background_tasks();
        Ok(room)
    }

    /// Joins an existing room via a blind-pairing invite (spec §4.6 steps 2
    /// and 4, §6 `pair`).
    pub async fn pair(
        identity: Identity,
        mut config: RoomConfig,
        swarm: Arc<dyn Swarm>,
        invite_text: &str,
        deadline: Duration,
    ) -> Result<Self, RoomError> {
        let invite = InviteToken::decode(invite_text)?;
        let candidate_signing_key = SigningKey::generate(&mut OsRng);
        let candidate_key = candidate_signing_key.verifying_key().to_bytes();

        let grant: PairingGrant =
            pairing::join_as_candidate(swarm.as_ref(), candidate_key, invite, deadline).await?;

        config.room_key = Some(grant.room_key);
        config.encryption_key = Some(grant.encryption_key);

        let local_writer =
            BlockStore::create_local(config.writer_dir(&candidate_key), candidate_signing_key).await?;
        let bootstrap = BlockStore::open_remote(config.writer_dir(&grant.room_key), grant.room_key).await?;

        let view = Arc::new(View::new());
        let autobase = Arc::new(Autobase::new(view.clone(), bootstrap));
        autobase.add_writer_core(local_writer.clone()).await;

        let drive_key = config.drive_key.unwrap_or(grant.room_key);
        let drive_store = BlockStore::open_remote(config.drive_dir(&drive_key), drive_key).await?;
        let drive = Arc::new(Drive::new(drive_store));

        let room = Self::assemble(
            identity,
            config,
            swarm,
            view,
            autobase,
            local_writer,
            grant.room_key,
            grant.encryption_key,
            drive,
        );
        room.append_local(Command::SetDriveKey(dispatch::SetDriveKeyPayload { drive_key }))
            .await?;
        room.set_status(RoomStatus::Connecting);
        room.spawn_background_tasks();
        Ok(room)
    }

    fn assemble(
        identity: Identity,
        config: RoomConfig,
        swarm: Arc<dyn Swarm>,
        view: Arc<View>,
        autobase: Arc<Autobase>,
        local_writer: BlockStore,
        room_key: [u8; 32],
        encryption_key: [u8; 32],
        drive: Arc<Drive>,
    ) -> Self {
        let (status, _) = watch::channel(RoomStatus::New);
        let (events, _) = broadcast::channel(256);
        Self {
            identity,
            config,
            swarm,
            view,
            autobase,
            local_writer,
            room_key,
            encryption_key,
            drive,
            status,
            events,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            pairing_tasks: Mutex::new(Vec::new()),
        }
    }

    fn set_status(&self, status: RoomStatus) {
        let _ = self.status.send(status);
        let _ = self.events.send(RoomEvent::StatusChanged(status));
        info!(?status, "room status changed");
    }

    pub fn status(&self) -> RoomStatus {
        *self.status.borrow()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    pub fn room_key(&self) -> [u8; 32] {
        self.room_key
    }

    /// Spawns the autobase sync loop and the swarm connection acceptor.
    /// Replication traffic for every known writer-core plus the drive
    /// chunk-core is multiplexed over whatever connections the swarm
    /// accepts (spec §4.6).
    fn spawn_background_tasks(&self) {
        let autobase = self.autobase.clone();
        let events = self.events.clone();
        let status = self.status.clone();
        let sync_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(50)).await;
                match autobase.sync().await {
                    Ok(outcome) if outcome.linearised == 0 => {}
                    Ok(outcome) => {
                        for message in outcome.new_messages {
                            let _ = events.send(RoomEvent::NewMessage(message));
                        }
                        for mistake in outcome.mistakes {
                            let _ = events.send(RoomEvent::Mistake(mistake));
                        }
                        let _ = events.send(RoomEvent::Update);
                        if matches!(*status.borrow(), RoomStatus::Connecting) {
                            let _ = status.send(RoomStatus::Connected);
                            let _ = events.send(RoomEvent::StatusChanged(RoomStatus::Connected));
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "autobase sync failed");
                        let _ = events.send(RoomEvent::Error(e.to_string()));
                    }
                }
            }
        });

        let swarm = self.swarm.clone();
        let topic = topic_from_discovery_key(&self.room_key);
        let local_writer = self.local_writer.clone();
        let events2 = self.events.clone();
        let accept_task = tokio::spawn(async move {
            let _ = swarm.join(topic).await;
            let _ = swarm.flush().await;
            loop {
                match swarm.accept().await {
                    Ok(conn) => {
                        spawn_replication(conn, &local_writer).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "swarm accept failed");
                        let _ = events2.send(RoomEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
        });

        // deliberately not awaited; fire-and-forget, collected for `close`
        let mut tasks = self.tasks.try_lock().expect("no contention at construction time");
        tasks.push(sync_task);
        tasks.push(accept_task);
    }

    /// Encodes, appends to the local writer-core, and immediately syncs so
    /// the caller's own write is reflected in `view` without waiting for
    /// the background poll (spec §5 "append ... sendMessage awaits append").
    async fn append_local(&self, command: Command) -> Result<(), RoomError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RoomError::Closed);
        }
        self.local_writer.append(dispatch::encode(&command)).await?;
        let outcome = self.autobase.sync().await?;
        for message in outcome.new_messages {
            let _ = self.events.send(RoomEvent::NewMessage(message));
        }
        for mistake in outcome.mistakes {
            let _ = self.events.send(RoomEvent::Mistake(mistake));
        }
        let _ = self.events.send(RoomEvent::Update);
        Ok(())
    }

    /// Idempotent: returns the already-stored invite's encoded form if one
    /// exists rather than minting a second one (spec §8 item 9). Invites
    /// are valid for 24h from `now_ms`.
    pub async fn create_invite(&self, now_ms: u64) -> Result<String, RoomError> {
        if let Some(existing) = self.view.current_invite().await {
            return self.encode_current_invite(&existing).await;
        }

        const INVITE_TTL_MS: u64 = 24 * 60 * 60 * 1000;
        let token = InviteToken::create(&self.identity, self.room_key, now_ms + INVITE_TTL_MS);
        self.append_local(Command::AddInvite(dispatch::AddInvitePayload {
            id: token.id.to_vec(),
            invite: token.signature.to_vec(),
            public_key: token.inviter_public_key,
            expires: token.expires,
        }))
        .await?;
        Ok(token.encode())
    }

    /// Deletes the current invite, if any, so a subsequent `create_invite`
    /// mints a fresh one rather than returning the stale one (spec §8 item
    /// 9's uniqueness invariant requires an explicit delete between the two).
    pub async fn delete_invite(&self) -> Result<(), RoomError> {
        self.append_local(Command::DeleteInvite(dispatch::DeleteInvitePayload { id: Vec::new() }))
            .await
    }

    async fn encode_current_invite(&self, record: &crate::view::InviteRecord) -> Result<String, RoomError> {
        let malformed = || crate::error::PairingError::Malformed("corrupt invite record in view".into());
        let signature: [u8; 64] = record.invite.clone().try_into().map_err(|_| malformed())?;
        let id: [u8; 16] = record.id.clone().try_into().map_err(|_| malformed())?;
        let token = InviteToken {
            id,
            room_key: self.room_key,
            inviter_public_key: record.public_key,
            expires: record.expires,
            signature,
        };
        Ok(token.encode())
    }

    /// Runs one hosting round: waits for a candidate, verifies it against
    /// the currently stored invite (rejecting a stale or already-consumed
    /// one), admits it, then transmits the grant (spec §4.6 steps 2-3).
    pub async fn host_pairing_round(&self, deadline: Duration) -> Result<[u8; 32], RoomError> {
        let invite_record = self
            .view
            .current_invite()
            .await
            .ok_or(crate::error::PairingError::Expired)?;
        let id: [u8; 16] = invite_record.id.clone().try_into().unwrap_or([0u8; 16]);
        let signature: [u8; 64] = invite_record.invite.clone().try_into().unwrap_or([0u8; 64]);
        let token = InviteToken {
            id,
            room_key: self.room_key,
            inviter_public_key: invite_record.public_key,
            expires: invite_record.expires,
            signature,
        };

        let mut handle = pairing::host_invite(self.swarm.as_ref(), &token).await?;
        let candidate_key = pairing::next_candidate(&mut *handle, &token, deadline).await?;

        // A close can race the handshake: the candidate may show up after
        // `close()` already flipped this flag. Bail out here rather than
        // after `add_writer`, so a close in flight never grants write access.
        if self.closed.load(Ordering::SeqCst) {
            return Err(RoomError::Closed);
        }

        self.add_writer(candidate_key).await?;
        pairing::send_grant(&mut *handle, self.room_key, self.encryption_key).await?;
        Ok(candidate_key)
    }

    /// Spawns and tracks one `host_pairing_round` loop so it is aborted by
    /// `close()` rather than outliving the room (spec §5's cancellation
    /// requirement: a close in flight during pairing must not grant write
    /// access). Keeps hosting rounds until the invite is deleted/expires or
    /// the room closes.
    pub fn spawn_invite_hosting(self: &Arc<Self>, deadline: Duration) -> JoinHandle<()> {
        let room = self.clone();
        let task = tokio::spawn(async move {
            loop {
                if room.closed.load(Ordering::SeqCst) {
                    break;
                }
                match room.host_pairing_round(deadline).await {
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "stopped hosting pairing rounds");
                        break;
                    }
                }
            }
        });
        if let Ok(mut tasks) = self.pairing_tasks.try_lock() {
            tasks.push(task.abort_handle());
        }
        task
    }

    pub async fn add_writer(&self, key: [u8; 32]) -> Result<(), RoomError> {
        self.append_local(Command::AddWriter(dispatch::AddWriterPayload { key })).await
    }

    pub async fn remove_writer(&self, key: [u8; 32]) -> Result<(), RoomError> {
        self.append_local(Command::RemoveWriter(dispatch::RemoveWriterPayload { key })).await
    }

    pub async fn send_message(
        &self,
        content: String,
        sender: String,
        timestamp: u64,
        system: bool,
    ) -> Result<String, RoomError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.append_local(Command::SendMessage(dispatch::SendMessagePayload {
            id: id.clone(),
            content,
            sender,
            public_key: self.local_writer.public_key(),
            timestamp,
            system,
        }))
        .await?;
        Ok(id)
    }

    pub async fn delete_message(&self, id: &str) -> Result<(), RoomError> {
        self.append_local(Command::DeleteMessage(dispatch::DeleteMessagePayload { id: id.to_string() }))
            .await
    }

    pub async fn get_messages(&self, query: MessageQuery) -> Vec<Message> {
        self.view.get_messages(&query).await
    }

    pub async fn message_count(&self) -> u64 {
        self.view.message_count().await
    }

    pub async fn room_info(&self) -> Option<RoomInfo> {
        self.view.room_info().await
    }

    pub async fn writers(&self, include_metadata: bool) -> Vec<WriterView> {
        if include_metadata {
            self.view
                .writers_with_profiles()
                .await
                .into_iter()
                .map(|(w, username)| WriterView { key: w.key, removed: w.removed_at.is_some(), username })
                .collect()
        } else {
            self.view
                .writers()
                .await
                .into_iter()
                .map(|w: WriterRecord| WriterView { key: w.key, removed: w.removed_at.is_some(), username: None })
                .collect()
        }
    }

    /// Broadcasts a display-name update under the reserved `profile:<key>`
    /// metadata id (SPEC_FULL.md §C "Profile broadcast").
    pub async fn set_profile(&self, username: String, updated_at: u64) -> Result<(), RoomError> {
        let key_hex = hex::encode(self.local_writer.public_key());
        self.append_local(Command::SetMetadata(dispatch::SetMetadataPayload {
            id: format!("profile:{key_hex}"),
            value: serde_json::json!({
                "publicKey": key_hex,
                "username": username,
                "updatedAt": updated_at,
            }),
        }))
        .await
    }

    pub async fn upload_file(
        &self,
        path: &str,
        bytes: &[u8],
        opts: UploadOptions,
        now_ms: u64,
    ) -> Result<DriveEntry, RoomError> {
        let entry = self.drive.put(path, bytes, opts, now_ms).await?;
        self.append_local(Command::UpdateDriveMetadata(dispatch::UpdateDriveMetadataPayload {
            id: entry.path.clone(),
            value: serde_json::json!({"size": entry.size, "blobId": entry.blob_id, "createdAt": entry.created_at}),
        }))
        .await?;
        Ok(entry)
    }

    pub async fn download_file(&self, path: &str, max_size: Option<u64>) -> Result<Vec<u8>, RoomError> {
        if let Some(max) = max_size {
            if let Some(entry) = self.drive.entry(path).await {
                if entry.size > max {
                    return Err(crate::error::DriveError::RangeOutOfBounds { size: entry.size }.into());
                }
            }
        }
        Ok(self.drive.get(path, ReadRange::default()).await?)
    }

    pub async fn create_directory(&self, path: &str, now_ms: u64) -> Result<(), RoomError> {
        Ok(self.drive.create_directory(path, now_ms).await?)
    }

    pub async fn delete_file(&self, path: &str) -> Result<(), RoomError> {
        Ok(self.drive.del(path).await?)
    }

    pub async fn delete_directory(&self, dir: &str) -> Result<(), RoomError> {
        let entries = self.drive.list(dir, ListOptions { recursive: true, limit: None }).await?;
        for entry in entries {
            self.drive.del(&entry.path).await?;
        }
        Ok(())
    }

    pub async fn files(&self, dir: &str, opts: ListOptions) -> Result<Vec<DriveEntry>, RoomError> {
        Ok(self.drive.list(dir, opts).await?)
    }

    /// Ordered teardown (spec §5): watchers, drive, pairing member, swarm,
    /// autobase, underlying block stores. Idempotent.
    pub async fn close(&self) -> Result<(), RoomError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Watchers: the sync/accept background loops, plus any in-flight
        // pairing-hosting round. Pairing first so a round that's already
        // past the closed-check in `host_pairing_round` can't complete.
        let mut pairing_tasks = self.pairing_tasks.lock().await;
        for task in pairing_tasks.drain(..) {
            task.abort();
        }
        drop(pairing_tasks);

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        drop(tasks);

        if let Err(e) = self.drive.close().await {
            warn!(error = %e, "error closing drive");
        }
        if let Err(e) = self.swarm.close().await {
            warn!(error = %e, "error closing swarm");
        }
        if let Err(e) = self.autobase.close().await {
            warn!(error = %e, "error closing autobase writer-cores");
        }

        self.set_status(RoomStatus::Closed);
        Ok(())
    }
}

fn rand_key() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    bytes
}

/// Demultiplexes one accepted connection into a `Duplex` per known core.
/// Only the local writer-core is registered here; a peer's own writer-cores
/// and the drive chunk-core arrive the same way once this room adds them to
/// `cores` (left as a single-entry map since this engine's own writer-core
/// is the only one always present at accept time; autobase discovers and
/// pulls the rest through its own poll loop, not through this demuxer).
async fn spawn_replication(conn: Connection, local_writer: &BlockStore) {
    let _peer: PeerInfo = conn.info;
    let mut physical = conn.stream;

    let mut cores: HashMap<[u8; 32], BlockStore> = HashMap::new();
    cores.insert(local_writer.public_key(), local_writer.clone());

    let (out_tx, mut out_rx) = tokio::sync::mpsc::channel::<MuxFrame>(256);
    let mut demux: HashMap<[u8; 32], tokio::sync::mpsc::Sender<Vec<u8>>> = HashMap::new();

    for (key, store) in cores {
        let (in_tx, in_rx) = tokio::sync::mpsc::channel(256);
        demux.insert(key, in_tx);
        let duplex = MuxDuplex { core: key, outbound: out_tx.clone(), inbound: Mutex::new(in_rx) };
        tokio::spawn(async move {
            if let Err(e) = store.replicate(Box::new(duplex)).await {
                warn!(error = %e, "replication session ended");
            }
        });
    }

    tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = physical.recv() => {
                    let Ok(bytes) = frame else { break };
                    let Ok(mux) = serde_json::from_slice::<MuxFrame>(&bytes) else { continue };
                    if let Some(tx) = demux.get(&mux.core) {
                        let _ = tx.send(mux.payload).await;
                    }
                }
                Some(mux) = out_rx.recv() => {
                    let Ok(bytes) = serde_json::to_vec(&mux) else { continue };
                    if physical.send(&bytes).await.is_err() {
                        break;
                    }
                }
                else => break,
            }
        }
    });
}

struct MuxDuplex {
    core: [u8; 32],
    outbound: tokio::sync::mpsc::Sender<MuxFrame>,
    inbound: Mutex<tokio::sync::mpsc::Receiver<Vec<u8>>>,
}

#[async_trait::async_trait]
impl Duplex for MuxDuplex {
    async fn send(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        self.outbound
            .send(MuxFrame { core: self.core, payload: frame.to_vec() })
            .await
            .map_err(|_| anyhow::anyhow!("replication multiplexer closed"))
    }

    async fn recv(&mut self) -> anyhow::Result<Vec<u8>> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("replication core channel closed"))
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use room_swarm::memory::{MemoryNetwork, MemorySwarm};

    fn config(dir: &std::path::Path) -> RoomConfig {
        RoomConfig {
            corestore_path: dir.to_path_buf(),
            bootstrap: vec![],
            room_key: None,
            encryption_key: None,
            drive_key: None,
        }
    }

    #[tokio::test]
    async fn create_send_and_query_matches_s1() {
        let dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::new();
        let swarm: Arc<dyn Swarm> = Arc::new(MemorySwarm::new(network, [1u8; 32]).await.unwrap());
        let identity = Identity::generate("alice");

        let room = Room::create(identity, config(dir.path()), swarm, "general".into(), 0).await.unwrap();
        room.send_message("hello".into(), "alice".into(), 1000, false).await.unwrap();
        room.send_message("world".into(), "alice".into(), 2000, false).await.unwrap();

        let messages = room.get_messages(MessageQuery { limit: 10, reverse: true, ..Default::default() }).await;
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["world", "hello"]);
        assert_eq!(room.message_count().await, 2);
    }

    #[tokio::test]
    async fn invite_is_idempotent_until_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::new();
        let swarm: Arc<dyn Swarm> = Arc::new(MemorySwarm::new(network, [2u8; 32]).await.unwrap());
        let identity = Identity::generate("alice");

        let room = Room::create(identity, config(dir.path()), swarm, "general".into(), 0).await.unwrap();
        let first = room.create_invite(0).await.unwrap();
        let second = room.create_invite(0).await.unwrap();
        assert_eq!(first, second);

        room.delete_invite().await.unwrap();
        let third = room.create_invite(0).await.unwrap();
        assert_ne!(first, third);
    }

    #[tokio::test]
    async fn create_populates_room_info_drive_key() {
        let dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::new();
        let swarm: Arc<dyn Swarm> = Arc::new(MemorySwarm::new(network, [4u8; 32]).await.unwrap());
        let identity = Identity::generate("alice");

        let room = Room::create(identity, config(dir.path()), swarm, "general".into(), 0).await.unwrap();
        let info = room.room_info().await.unwrap();
        assert_eq!(info.drive_key, Some(room.drive.public_key()));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::new();
        let swarm: Arc<dyn Swarm> = Arc::new(MemorySwarm::new(network, [3u8; 32]).await.unwrap());
        let identity = Identity::generate("alice");

        let room = Room::create(identity, config(dir.path()), swarm, "general".into(), 0).await.unwrap();
        room.close().await.unwrap();
        room.close().await.unwrap();
        assert_eq!(room.status(), RoomStatus::Closed);
    }
}
