//! Room Engine: the per-room peer-to-peer replicated database described in
//! spec §1-§9. Layered bottom-up exactly as §2 lays it out:
//!
//! 1. [`block_store`]: the append-only, integrity-verified single-writer log.
//! 2. [`autobase`]: combines many writer-cores into one deterministic,
//!    linearised multi-writer log and folds it into the view.
//! 3. [`view`]: the schema-typed collections apply mutates and queries read.
//! 4. [`dispatch`]: the typed command tag plus schema-encoded payload layer.
//! 5. [`drive`]: the content-addressed blob store.
//! 6. [`pairing`]: the blind-pairing capability handshake, built on
//!    [`room_swarm`]'s transport-agnostic traits.
//! 7. [`room`]: the façade that owns one of each of the above and exposes
//!    the flattened Room API (spec §6) the UI/CLI consumes.
//!
//! [`identity`] and [`error`] are cross-cutting: every layer signs with the
//! former and reports through the latter.

pub mod autobase;
pub mod block_store;
pub mod dispatch;
pub mod drive;
pub mod error;
pub mod identity;
pub mod pairing;
pub mod room;
pub mod view;

pub use block_store::BlockStore;
pub use drive::{DriveEntry, ListOptions, ReadRange, UploadOptions};
pub use error::{ErrorKind, RoomError};
pub use identity::Identity;
pub use pairing::InviteToken;
pub use room::{Room, RoomConfig, RoomEvent, RoomStatus, WriterView};
pub use view::{Message, MessageQuery, RoomInfo};
