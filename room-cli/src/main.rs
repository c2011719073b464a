//! Terminal chat entry point (spec §1, §6): a trivial collaborator that
//! maps the `/join`, `/create`, `/leave`, `/invite`, `/profile`, `/send`,
//! `/files`, `/clear` commands onto [`room_core::Room`] API calls. It owns
//! no engine logic of its own; swap this module for any other UI and the
//! Room Engine underneath is unaffected (spec §1 "In scope"/"Out of scope").

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use room_core::identity::{self, Identity};
use room_core::room::{Room, RoomConfig, RoomEvent};
use room_core::ListOptions;
use room_swarm::{IrohSwarm, Swarm};

#[derive(Parser, Debug)]
#[command(name = "room-chat")]
#[command(about = "Room Engine terminal chat", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "Player")]
    nickname: String,

    /// Directory holding this node's identity and corestore state.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// DHT bootstrap addresses; empty uses the default public discovery service.
    #[arg(long)]
    bootstrap: Vec<String>,

    /// Create a fresh room with this name instead of starting unjoined.
    #[arg(long)]
    create: Option<String>,

    /// Join an existing room via an invite string instead of starting unjoined.
    #[arg(long)]
    join: Option<String>,
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    info!(nickname = %args.nickname, "starting room-chat");

    let state_dir = args.state_dir.unwrap_or_else(|| identity::default_state_dir("room-chat"));
    let mut identity = Identity::load_or_create(&state_dir, &args.nickname)?;

    let swarm: Arc<dyn Swarm> = Arc::new(IrohSwarm::new(args.bootstrap.clone()).await?);
    let mut room: Option<Arc<Room>> = None;
    let mut printer: Option<tokio::task::JoinHandle<()>> = None;

    if let Some(name) = args.create {
        room = Some(open_room(Room::create(identity.clone(), config(&state_dir), swarm.clone(), name, now_ms()).await?, &mut printer));
    } else if let Some(invite) = args.join {
        match Room::pair(identity.clone(), config(&state_dir), swarm.clone(), &invite, tokio::time::Duration::from_secs(30)).await {
            Ok(r) => room = Some(open_room(r, &mut printer)),
            Err(e) => warn!(error = %e, "failed to join via invite"),
        }
    }

    println!("room-chat ready. Type /create <name>, /join <invite>, or /send <text>. /clear for help.");
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("/create ") {
            match Room::create(identity.clone(), config(&state_dir), swarm.clone(), rest.trim().to_string(), now_ms()).await {
                Ok(r) => {
                    room = Some(open_room(r, &mut printer));
                    println!("created room \"{}\"", rest.trim());
                }
                Err(e) => eprintln!("mistake: could not create room: {e}"),
            }
        } else if let Some(rest) = line.strip_prefix("/join ") {
            match Room::pair(identity.clone(), config(&state_dir), swarm.clone(), rest.trim(), tokio::time::Duration::from_secs(30)).await {
                Ok(r) => {
                    room = Some(open_room(r, &mut printer));
                    println!("joined room");
                }
                Err(e) => eprintln!("mistake: could not join room: {e}"),
            }
        } else if line == "/leave" {
            if let Some(r) = room.take() {
                r.close().await?;
            }
            if let Some(task) = printer.take() {
                task.abort();
            }
            println!("left room");
        } else if line == "/invite" {
            match with_room(&room, |r| r.create_invite(now_ms())).await {
                Some(Ok(invite)) => {
                    println!("invite: {invite}");
                    if let Some(r) = &room {
                        r.spawn_invite_hosting(tokio::time::Duration::from_secs(300));
                    }
                }
                Some(Err(e)) => eprintln!("mistake: {e}"),
                None => println!("no room open; use /create or /join first"),
            }
        } else if let Some(rest) = line.strip_prefix("/profile ") {
            let name = rest.trim().to_string();
            identity.set_username(name.clone());
            identity.save_profile(&state_dir)?;
            if let Some(r) = &room {
                if let Err(e) = r.set_profile(name, now_ms()).await {
                    eprintln!("mistake: could not broadcast profile: {e}");
                }
            }
            println!("profile set to {}", identity.username);
        } else if let Some(rest) = line.strip_prefix("/send ") {
            match with_room(&room, |r| r.send_message(rest.to_string(), identity.username.clone(), now_ms(), false)).await {
                Some(Ok(_)) => {}
                Some(Err(e)) => eprintln!("mistake: could not send: {e}"),
                None => println!("no room open; use /create or /join first"),
            }
        } else if line == "/files" {
            match with_room(&room, |r| r.files("/", ListOptions { recursive: true, limit: None })).await {
                Some(Ok(entries)) => {
                    for entry in entries {
                        println!("{}\t{} bytes", entry.path, entry.size);
                    }
                }
                Some(Err(e)) => eprintln!("mistake: {e}"),
                None => println!("no room open; use /create or /join first"),
            }
        } else if line == "/clear" {
            print!("\x1B[2J\x1B[1;1H");
        } else if !line.starts_with('/') {
            match with_room(&room, |r| r.send_message(line.to_string(), identity.username.clone(), now_ms(), false)).await {
                Some(Ok(_)) => {}
                Some(Err(e)) => eprintln!("mistake: could not send: {e}"),
                None => println!("no room open; use /create or /join first"),
            }
        } else {
            println!("unknown command: {line}");
        }
    }

    if let Some(r) = room {
        r.close().await?;
    }
    Ok(())
}

fn config(state_dir: &std::path::Path) -> RoomConfig {
    RoomConfig {
        corestore_path: state_dir.join("corestore"),
        bootstrap: Vec::new(),
        room_key: None,
        encryption_key: None,
        drive_key: None,
    }
}

/// Subscribes to room events and prints chat-relevant ones to stdout,
/// mirroring the UI's `update`/`new-message`/`mistake` handlers (spec §6).
fn open_room(room: Room, printer: &mut Option<tokio::task::JoinHandle<()>>) -> Arc<Room> {
    let room = Arc::new(room);
    let mut events = room.subscribe_events();
    let task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RoomEvent::NewMessage(msg) => println!("[{}] {}: {}", msg.timestamp, msg.sender, msg.content),
                RoomEvent::Mistake(m) => eprintln!("mistake: {m}"),
                RoomEvent::Error(e) => eprintln!("error: {e}"),
                RoomEvent::StatusChanged(status) => info!(?status, "room status changed"),
                RoomEvent::Update => {}
            }
        }
    });
    *printer = Some(task);
    room
}

async fn with_room<T, F, Fut>(room: &Option<Arc<Room>>, f: F) -> Option<T>
where
    F: FnOnce(Arc<Room>) -> Fut,
    Fut: std::future::Future<Output = T>,
{
    let r = room.clone()?;
    Some(f(r).await)
}
