//! Relay packet: a 16-byte id followed by an opaque payload.
//!
//! Wire form is `id || payload` with no inner length field; the frame codec in
//! [`crate::network::wire`] supplies the total length. The SHA-256 of the packed
//! form is the dedup key and is never transmitted.

use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::RelayError;

/// Total id length
pub const PACKET_ID_LEN: usize = 16;
/// Leading timestamp portion of the id
const ID_TIME_LEN: usize = 11;
/// Trailing random portion of the id
const ID_RANDOM_LEN: usize = PACKET_ID_LEN - ID_TIME_LEN;

/// Last timestamp handed out, so ids stay strictly increasing within a process
static LAST_ID_NANOS: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketId([u8; PACKET_ID_LEN]);

impl PacketId {
    /// Generate a fresh id: 11 bytes of big-endian nanosecond time + 5 random bytes.
    pub fn generate() -> Self {
        let mut id = [0u8; PACKET_ID_LEN];
        let nanos = next_timestamp_nanos().to_be_bytes();
        // u64 fits in the low 8 bytes of the 11-byte time field
        id[ID_TIME_LEN - nanos.len()..ID_TIME_LEN].copy_from_slice(&nanos);
        rand::thread_rng().fill_bytes(&mut id[ID_TIME_LEN..ID_TIME_LEN + ID_RANDOM_LEN]);
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; PACKET_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PACKET_ID_LEN] {
        &self.0
    }

    /// Timestamp component in nanoseconds since the UNIX epoch
    pub fn timestamp_nanos(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[ID_TIME_LEN - 8..ID_TIME_LEN]);
        u64::from_be_bytes(buf)
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketId({})", self)
    }
}

/// SHA-256 of a packed packet
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketHash([u8; 32]);

impl PacketHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for PacketHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for PacketHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PacketHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketHash({})", self)
    }
}

/// A single relayed message. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    id: PacketId,
    payload: Bytes,
}

impl Packet {
    /// Wrap `payload` under a freshly generated id
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            id: PacketId::generate(),
            payload: payload.into(),
        }
    }

    pub fn from_parts(id: PacketId, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }

    pub fn id(&self) -> PacketId {
        self.id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Length of the packed form
    pub fn packed_len(&self) -> usize {
        PACKET_ID_LEN + self.payload.len()
    }

    /// Serialize as `id || payload`. Size limits are enforced by the sender.
    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.packed_len());
        buf.put_slice(&self.id.0);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Split received bytes into id and payload without copying the payload.
    pub fn unpack(bytes: Bytes) -> Result<Self, RelayError> {
        if bytes.len() < PACKET_ID_LEN {
            return Err(RelayError::PacketTooShort(bytes.len()));
        }

        let mut id = [0u8; PACKET_ID_LEN];
        id.copy_from_slice(&bytes[..PACKET_ID_LEN]);

        Ok(Self {
            id: PacketId(id),
            payload: bytes.slice(PACKET_ID_LEN..),
        })
    }

    /// Content hash used as the dedup key
    pub fn hash(&self) -> PacketHash {
        let mut hasher = Sha256::new();
        hasher.update(self.id.0);
        hasher.update(&self.payload);
        PacketHash(hasher.finalize().into())
    }
}

fn next_timestamp_nanos() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let mut last = LAST_ID_NANOS.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_ID_NANOS.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}
