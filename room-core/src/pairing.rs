//! Blind-pairing capability handshake (spec §4.6).
//!
//! Sits below autobase in the layering: this module never touches a
//! [`crate::view::View`] or [`crate::autobase::Autobase`] directly. It only
//! proves "this candidate holds a capability signed by the inviter for this
//! invite id" and carries the resulting grant across the wire. The room
//! façade is the one that calls `addWriter` and decides whether an invite
//! has already been consumed, since only it holds the view.
//!
//! The pairing side-channel is a gossip topic derived from the invite id
//! (spec §4.6 step 2): unguessable because `id` is sixteen random bytes, but
//! not itself authentication: authentication comes from `InviteToken`'s
//! signature, verified independently by whichever side checks it.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, timeout};

use crate::error::PairingError;
use crate::identity::{self, Identity};
use room_swarm::{Topic, TopicHandle, topic_from_name};

/// A signed, shareable capability binding an invite id to a room and its
/// inviter (spec §4.6 step 1). Encoded as z-base32 for sharing (spec §6
/// "Invite string").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InviteToken {
    pub id: [u8; 16],
    pub room_key: [u8; 32],
    pub inviter_public_key: [u8; 32],
    pub expires: u64,
    pub signature: [u8; 64],
}

impl InviteToken {
    fn signing_payload(id: &[u8; 16], room_key: &[u8; 32], expires: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + 32 + 8);
        buf.extend_from_slice(id);
        buf.extend_from_slice(room_key);
        buf.extend_from_slice(&expires.to_be_bytes());
        buf
    }

    /// Mints a fresh invite for `room_key`, signed by `identity`. Callers
    /// that want idempotent `createInvite()` semantics (spec §8 item 9) are
    /// responsible for reusing a prior token rather than calling this twice.
    pub fn create(identity: &Identity, room_key: [u8; 32], expires: u64) -> Self {
        let mut id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id);
        let signature = identity.sign(&Self::signing_payload(&id, &room_key, expires));
        Self {
            id,
            room_key,
            inviter_public_key: identity.public_key(),
            expires,
            signature,
        }
    }

    pub fn verify(&self) -> bool {
        let payload = Self::signing_payload(&self.id, &self.room_key, self.expires);
        identity::verify(&self.inviter_public_key, &payload, &self.signature)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires != 0 && now_ms >= self.expires
    }

    pub fn pairing_topic(&self) -> Topic {
        topic_from_name(&self.id)
    }

    pub fn encode(&self) -> String {
        let bytes = serde_json::to_vec(self).expect("invite token is always json-serializable");
        zbase32::encode_full_bytes(&bytes)
    }

    pub fn decode(text: &str) -> Result<Self, PairingError> {
        let bytes = zbase32::decode_full_bytes_str(text)
            .map_err(|e| PairingError::Malformed(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| PairingError::Malformed(e.to_string()))
    }
}

/// What the candidate receives once admitted (spec §4.6 step 3): the room's
/// discovery key and its symmetric encryption key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingGrant {
    pub room_key: [u8; 32],
    pub encryption_key: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum WireMessage {
    Hello { candidate_key: [u8; 32], invite: InviteToken },
    Grant { room_key: [u8; 32], encryption_key: [u8; 32] },
}

/// Candidate side of the handshake (spec §4.6 steps 2 and 4): announces
/// itself on the invite's pairing topic, presenting the invite and its own
/// writer key, then waits for the inviter's grant or `deadline` to pass.
pub async fn join_as_candidate(
    swarm: &dyn room_swarm::Swarm,
    candidate_key: [u8; 32],
    invite: InviteToken,
    deadline: Duration,
) -> Result<PairingGrant, PairingError> {
    if !invite.verify() {
        return Err(PairingError::BadSignature);
    }

    let mut handle = swarm.join(invite.pairing_topic()).await.map_err(PairingError::Swarm)?;
    send(&mut *handle, &WireMessage::Hello { candidate_key, invite }).await?;

    timeout(deadline, async {
        loop {
            let frame = handle.next().await.map_err(PairingError::Swarm)?;
            let Ok(WireMessage::Grant { room_key, encryption_key }) =
                serde_json::from_slice::<WireMessage>(&frame)
            else {
                continue;
            };
            return Ok(PairingGrant { room_key, encryption_key });
        }
    })
    .await
    .map_err(|_| PairingError::Aborted)?
}

/// Inviter side: joins the pairing topic for `invite` so candidates can find
/// it. Returns the handle so the caller can loop [`next_candidate`] and,
/// once it has admitted a writer, [`send_grant`].
pub async fn host_invite(
    swarm: &dyn room_swarm::Swarm,
    invite: &InviteToken,
) -> Result<Box<dyn TopicHandle>, PairingError> {
    swarm.join(invite.pairing_topic()).await.map_err(PairingError::Swarm)
}

/// Waits for the next candidate to present a validly signed hello for
/// `invite`, ignoring anything else on the topic (malformed frames, hellos
/// for a different, since-deleted invite). The room façade still has to
/// check `AlreadyConsumed`/expiry against its own view before granting.
pub async fn next_candidate(
    handle: &mut dyn TopicHandle,
    invite: &InviteToken,
    deadline: Duration,
) -> Result<[u8; 32], PairingError> {
    timeout(deadline, async {
        loop {
            let frame = handle.next().await.map_err(PairingError::Swarm)?;
            let Ok(WireMessage::Hello { candidate_key, invite: presented }) =
                serde_json::from_slice::<WireMessage>(&frame)
            else {
                continue;
            };
            if presented.id != invite.id || !presented.verify() {
                continue;
            }
            return Ok(candidate_key);
        }
    })
    .await
    .map_err(|_| PairingError::Expired)?
}

pub async fn send_grant(
    handle: &mut dyn TopicHandle,
    room_key: [u8; 32],
    encryption_key: [u8; 32],
) -> Result<(), PairingError> {
    send(handle, &WireMessage::Grant { room_key, encryption_key }).await
}

async fn send(handle: &mut dyn TopicHandle, message: &WireMessage) -> Result<(), PairingError> {
    let bytes = serde_json::to_vec(message).map_err(|e| PairingError::Malformed(e.to_string()))?;
    handle.publish(&bytes).await.map_err(PairingError::Swarm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use room_swarm::memory::{MemoryNetwork, MemorySwarm};

    #[test]
    fn invite_signature_round_trips() {
        let inviter = Identity::generate("alice");
        let token = InviteToken::create(&inviter, [9u8; 32], 0);
        assert!(token.verify());

        let mut tampered = token.clone();
        tampered.room_key = [1u8; 32];
        assert!(!tampered.verify());
    }

    #[test]
    fn encode_decode_round_trips() {
        let inviter = Identity::generate("alice");
        let token = InviteToken::create(&inviter, [3u8; 32], 5000);
        let text = token.encode();
        let decoded = InviteToken::decode(&text).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn expiry_is_checked_against_now() {
        let inviter = Identity::generate("alice");
        let token = InviteToken::create(&inviter, [0u8; 32], 1000);
        assert!(!token.is_expired(999));
        assert!(token.is_expired(1000));
        let never_expires = InviteToken::create(&inviter, [0u8; 32], 0);
        assert!(!never_expires.is_expired(u64::MAX));
    }

    #[tokio::test]
    async fn candidate_and_inviter_converge_on_a_grant() {
        let network = MemoryNetwork::new();
        let inviter_key = [11u8; 32];
        let candidate_key = [22u8; 32];
        let inviter_swarm = MemorySwarm::new(network.clone(), inviter_key).await.unwrap();
        let candidate_swarm = MemorySwarm::new(network.clone(), candidate_key).await.unwrap();

        let inviter = Identity::generate("alice");
        let token = InviteToken::create(&inviter, [99u8; 32], 0);

        let mut host_handle = host_invite(&inviter_swarm, &token).await.unwrap();

        let candidate_token = token.clone();
        let candidate_task = tokio::spawn(async move {
            join_as_candidate(&candidate_swarm, candidate_key, candidate_token, Duration::from_secs(5)).await
        });

        let admitted = next_candidate(&mut *host_handle, &token, Duration::from_secs(5)).await.unwrap();
        assert_eq!(admitted, candidate_key);
        send_grant(&mut *host_handle, [99u8; 32], [7u8; 32]).await.unwrap();

        let grant = candidate_task.await.unwrap().unwrap();
        assert_eq!(grant.room_key, [99u8; 32]);
        assert_eq!(grant.encryption_key, [7u8; 32]);
    }
}
