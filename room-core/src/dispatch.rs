//! Dispatch and router (spec §4.4).
//!
//! Every mutation is `[tag: u8] || serde_json::to_vec(&payload)` rather than
//! a hand-rolled binary schema: JSON payloads keep schema evolution to
//! adding `#[serde(default)]` fields instead of hand-written bit layouts.
//! `encode`/`decode` are pure and invert each other; the `Router` maps a
//! decoded command to the handler apply calls.

use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

/// Stable command tag enumeration (spec §4.4). Never renumbered; schema
/// evolution only appends `#[serde(default)]` fields to a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    AddWriter = 0,
    RemoveWriter = 1,
    AddInvite = 2,
    SendMessage = 3,
    DeleteMessage = 4,
    SetMetadata = 5,
    SetDriveKey = 6,
    UpdateDriveMetadata = 7,
    DeleteInvite = 8,
}

impl Tag {
    fn from_u8(b: u8) -> Option<Tag> {
        match b {
            0 => Some(Tag::AddWriter),
            1 => Some(Tag::RemoveWriter),
            2 => Some(Tag::AddInvite),
            3 => Some(Tag::SendMessage),
            4 => Some(Tag::DeleteMessage),
            5 => Some(Tag::SetMetadata),
            6 => Some(Tag::SetDriveKey),
            7 => Some(Tag::UpdateDriveMetadata),
            8 => Some(Tag::DeleteInvite),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddWriterPayload {
    pub key: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoveWriterPayload {
    pub key: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddInvitePayload {
    pub id: Vec<u8>,
    pub invite: Vec<u8>,
    pub public_key: [u8; 32],
    #[serde(default)]
    pub expires: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteInvitePayload {
    pub id: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendMessagePayload {
    pub id: String,
    pub content: String,
    pub sender: String,
    pub public_key: [u8; 32],
    pub timestamp: u64,
    #[serde(default)]
    pub system: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteMessagePayload {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SetMetadataPayload {
    pub id: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SetDriveKeyPayload {
    pub drive_key: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateDriveMetadataPayload {
    pub id: String,
    pub value: serde_json::Value,
}

/// A decoded dispatch record, ready to hand to the router.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    AddWriter(AddWriterPayload),
    RemoveWriter(RemoveWriterPayload),
    AddInvite(AddInvitePayload),
    DeleteInvite(DeleteInvitePayload),
    SendMessage(SendMessagePayload),
    DeleteMessage(DeleteMessagePayload),
    SetMetadata(SetMetadataPayload),
    SetDriveKey(SetDriveKeyPayload),
    UpdateDriveMetadata(UpdateDriveMetadataPayload),
}

impl Command {
    fn tag(&self) -> Tag {
        match self {
            Command::AddWriter(_) => Tag::AddWriter,
            Command::RemoveWriter(_) => Tag::RemoveWriter,
            Command::AddInvite(_) => Tag::AddInvite,
            Command::DeleteInvite(_) => Tag::DeleteInvite,
            Command::SendMessage(_) => Tag::SendMessage,
            Command::DeleteMessage(_) => Tag::DeleteMessage,
            Command::SetMetadata(_) => Tag::SetMetadata,
            Command::SetDriveKey(_) => Tag::SetDriveKey,
            Command::UpdateDriveMetadata(_) => Tag::UpdateDriveMetadata,
        }
    }
}

/// Encodes a command as `[tag] || json(payload)`.
pub fn encode(command: &Command) -> Vec<u8> {
    let tag = command.tag() as u8;
    let payload = match command {
        Command::AddWriter(p) => serde_json::to_vec(p),
        Command::RemoveWriter(p) => serde_json::to_vec(p),
        Command::AddInvite(p) => serde_json::to_vec(p),
        Command::DeleteInvite(p) => serde_json::to_vec(p),
        Command::SendMessage(p) => serde_json::to_vec(p),
        Command::DeleteMessage(p) => serde_json::to_vec(p),
        Command::SetMetadata(p) => serde_json::to_vec(p),
        Command::SetDriveKey(p) => serde_json::to_vec(p),
        Command::UpdateDriveMetadata(p) => serde_json::to_vec(p),
    }
    .expect("payload types are always json-serializable");

    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(tag);
    out.extend_from_slice(&payload);
    out
}

/// Decodes a dispatch record. Unknown tags are `Invalid` for forward-compat
/// (spec §4.4): the apply loop logs and drops them rather than propagating.
pub fn decode(record: &[u8]) -> Result<Command, DispatchError> {
    let (&tag_byte, payload) = record.split_first().ok_or(DispatchError::UnknownTag(0))?;
    let tag = Tag::from_u8(tag_byte).ok_or(DispatchError::UnknownTag(tag_byte))?;

    macro_rules! parse {
        ($variant:ident) => {
            serde_json::from_slice(payload)
                .map(Command::$variant)
                .map_err(|e| DispatchError::DecodeFailed(tag_byte, e.to_string()))
        };
    }

    match tag {
        Tag::AddWriter => parse!(AddWriter),
        Tag::RemoveWriter => parse!(RemoveWriter),
        Tag::AddInvite => parse!(AddInvite),
        Tag::DeleteInvite => parse!(DeleteInvite),
        Tag::SendMessage => parse!(SendMessage),
        Tag::DeleteMessage => parse!(DeleteMessage),
        Tag::SetMetadata => parse!(SetMetadata),
        Tag::SetDriveKey => parse!(SetDriveKey),
        Tag::UpdateDriveMetadata => parse!(UpdateDriveMetadata),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_command() {
        let commands = vec![
            Command::AddWriter(AddWriterPayload { key: [1; 32] }),
            Command::RemoveWriter(RemoveWriterPayload { key: [2; 32] }),
            Command::AddInvite(AddInvitePayload {
                id: vec![1, 2, 3],
                invite: vec![4, 5, 6],
                public_key: [3; 32],
                expires: 0,
            }),
            Command::DeleteInvite(DeleteInvitePayload { id: vec![1, 2, 3] }),
            Command::SendMessage(SendMessagePayload {
                id: "m1".into(),
                content: "hello".into(),
                sender: "alice".into(),
                public_key: [4; 32],
                timestamp: 1000,
                system: false,
            }),
            Command::DeleteMessage(DeleteMessagePayload { id: "m1".into() }),
            Command::SetMetadata(SetMetadataPayload {
                id: "room".into(),
                value: serde_json::json!({"name": "general"}),
            }),
            Command::SetDriveKey(SetDriveKeyPayload { drive_key: [5; 32] }),
            Command::UpdateDriveMetadata(UpdateDriveMetadataPayload {
                id: "drive".into(),
                value: serde_json::json!({"size": 10}),
            }),
        ];

        for command in commands {
            let encoded = encode(&command);
            let decoded = decode(&encoded).unwrap();
            assert_eq!(decoded, command);
        }
    }

    #[test]
    fn unknown_tag_is_rejected_not_panicked() {
        let record = vec![255u8, 0, 0];
        let err = decode(&record).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownTag(255)));
    }

    #[test]
    fn schema_evolution_defaults_missing_fields() {
        // Simulates an old peer's AddInvite record encoded before `expires`
        // existed: the field must default rather than fail to decode.
        let legacy = serde_json::json!({
            "id": [1,2,3],
            "invite": [4,5,6],
            "public_key": [0u8; 32],
        });
        let mut record = vec![Tag::AddInvite as u8];
        record.extend(serde_json::to_vec(&legacy).unwrap());
        let decoded = decode(&record).unwrap();
        assert_eq!(
            decoded,
            Command::AddInvite(AddInvitePayload {
                id: vec![1, 2, 3],
                invite: vec![4, 5, 6],
                public_key: [0; 32],
                expires: 0,
            })
        );
    }
}
