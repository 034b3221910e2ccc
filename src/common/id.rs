//! Node identifiers, lookup targets, and the XOR metric.

use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// The size of identifiers in bytes.
pub const ID_SIZE: usize = 20;

/// The size of identifiers in bits, which is also the number of buckets in a
/// [RoutingTable][crate::RoutingTable].
pub const MAX_DISTANCE: usize = ID_SIZE * 8;

/// A node identifier or a lookup target in the 160 bit key space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    /// Generates a random Id.
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();

        Id(rng.gen())
    }

    /// Creates an Id from some bytes, failing unless `bytes` is exactly
    /// [ID_SIZE] long.
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id, InvalidId> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(InvalidId::WrongLength(bytes.len()));
        }

        let mut id = [0_u8; ID_SIZE];
        id.copy_from_slice(bytes);

        Ok(Id(id))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    /// The XOR distance between this Id and `other`.
    pub fn xor(&self, other: &Id) -> Distance {
        let mut xor = [0_u8; ID_SIZE];

        for (i, byte) in xor.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Distance(xor)
    }
}

/// XOR distance between two [Id]s, compared as a 160 bit unsigned integer.
///
/// `Ord` is derived over the big-endian bytes, which is exactly the unsigned
/// integer ordering.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance(pub [u8; ID_SIZE]);

impl Distance {
    /// Distance to self; two identical identifiers.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&byte| byte == 0)
    }

    /// Position of the highest set bit, which is the routing table bucket this
    /// distance falls into; `None` for the zero distance (self).
    ///
    /// Equal to `MAX_DISTANCE - 1 - common_prefix_length`.
    pub fn bucket_index(&self) -> Option<usize> {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return Some(MAX_DISTANCE - 1 - (i * 8 + byte.leading_zeros() as usize));
            }
        }

        None
    }

    /// Number of leading bits the two identifiers share.
    pub fn common_prefix_length(&self) -> usize {
        match self.bucket_index() {
            Some(index) => MAX_DISTANCE - 1 - index,
            None => MAX_DISTANCE,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InvalidId {
    /// Expected [ID_SIZE] bytes.
    #[error("Invalid Id size, expected 20 bytes, got {0}")]
    WrongLength(usize),

    #[error("Invalid Id encoding, expected 40 hex characters")]
    InvalidHex,
}

impl FromStr for Id {
    type Err = InvalidId;

    fn from_str(s: &str) -> Result<Id, InvalidId> {
        if s.len() != ID_SIZE * 2 {
            return Err(InvalidId::InvalidHex);
        }

        let mut bytes = [0_u8; ID_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte =
                u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| InvalidId::InvalidHex)?;
        }

        Ok(Id(bytes))
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl Debug for Distance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({:x?})", &self.0)
    }
}
