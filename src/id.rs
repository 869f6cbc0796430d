use rand::{
    distributions::{Distribution, Standard},
    rngs::StdRng,
    Rng, SeedableRng,
};
use std::{
    convert::{TryFrom, TryInto},
    fmt,
    sync::Mutex,
};
use thiserror::Error;

/// Length of a descriptor id and of a servent id.
pub const ID_LEN: usize = 16;

/// 16-byte identifier used by Gnutella descriptors.
///
/// Ordering and hashing follow the bytes as one unsigned big-endian integer, so the id can be used
/// directly as a key of the history tables.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct MessageId([u8; ID_LEN]);

impl MessageId {
    pub fn to_bytes(self) -> [u8; ID_LEN] {
        self.0
    }
}

impl AsRef<[u8]> for MessageId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<MessageId> for [u8; ID_LEN] {
    fn from(id: MessageId) -> [u8; ID_LEN] {
        id.0
    }
}

impl From<[u8; ID_LEN]> for MessageId {
    fn from(id: [u8; ID_LEN]) -> MessageId {
        Self(id)
    }
}

#[derive(Debug, Error)]
#[error("invalid id length")]
pub struct LengthError;

impl<'a> TryFrom<&'a [u8]> for MessageId {
    type Error = LengthError;

    fn try_from(slice: &'a [u8]) -> Result<Self, Self::Error> {
        Ok(Self(slice.try_into().map_err(|_| LengthError)?))
    }
}

impl Distribution<MessageId> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> MessageId {
        MessageId(rng.gen())
    }
}

impl fmt::LowerHex for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }

        Ok(())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self)
    }
}

// ----------------------------------------------------------------------------//

/// Identifier of a servent answering a query. Same shape as a descriptor id.
pub type ServentId = MessageId;

/// Source of fresh descriptor and servent ids.
///
/// Safe to share between tasks; every call draws from the same generator.
pub struct IdGenerator {
    rng: Mutex<StdRng>,
}

impl IdGenerator {
    /// Generator seeded from the operating system entropy source.
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic generator, useful for reproducible tests.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.rng.lock().unwrap().gen()
    }

    pub fn servent_id(&self) -> ServentId {
        self.rng.lock().unwrap().gen()
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------//
