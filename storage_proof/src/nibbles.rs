//! Define [`Nibbles`] and how to convert bytes and hex prefix encodings into
//! nibbles.
//!
//! Storage proof paths are at most 64 nibbles long (the length of a hashed
//! key), so nibbles are simply kept one per byte.
use std::fmt::{self, Display};

use bytes::{BufMut, Bytes, BytesMut};
use ethereum_types::H256;
use thiserror::Error;

// Use a whole byte for a Nibble just for convenience
/// A Nibble has 4 bits and is stored as `u8`.
pub type Nibble = u8;

/// Maximum number of nibbles in a trie path (a hashed 32 byte key).
pub const MAX_NIBBLES: usize = 64;

#[derive(Clone, Debug, Eq, Error, PartialEq, Hash)]
/// Errors encountered when converting from a hex prefix byte string to
/// `Nibbles`.
pub enum FromHexPrefixError {
    #[error("Tried to convert an empty hex prefix byte string into `Nibbles`")]
    /// The hex prefix encoding has no flag byte.
    Empty,

    #[error("Tried to convert a hex prefix byte string into `Nibbles` with invalid flags at the start: {0:#04b}")]
    /// The hex prefix encoding flag is invalid.
    InvalidFlags(Nibble),

    #[error("Tried to convert a hex prefix byte string with padding {0:#x} in an even length path")]
    /// The low nibble of the flag byte must be zero for even length paths.
    NonZeroPadding(Nibble),

    #[error("Tried to convert a hex prefix byte string into `Nibbles` that was longer than 33 bytes: (length: {1}, bytes: {0})")]
    /// The hex prefix encoding is too large.
    TooLong(String, usize),
}

/// A sequence of nibbles which is used as the key type into a trie.
#[derive(Clone, Default, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Nibbles {
    nibbles: Vec<Nibble>,
}

impl fmt::Debug for Nibbles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Display for Nibbles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for n in &self.nibbles {
            write!(f, "{:x}", n)?;
        }

        Ok(())
    }
}

impl From<Vec<Nibble>> for Nibbles {
    fn from(nibbles: Vec<Nibble>) -> Self {
        debug_assert!(nibbles.iter().all(|n| *n < 16));
        Self { nibbles }
    }
}

impl Nibbles {
    /// Creates `Nibbles` from big endian bytes. Every byte yields two nibbles.
    pub fn from_bytes_be(bytes: &[u8]) -> Self {
        let nibbles = bytes.iter().flat_map(|b| [b >> 4, b & 0x0f]).collect();

        Self { nibbles }
    }

    /// Creates the 64 nibble path of a `H256`.
    pub fn from_h256_be(v: H256) -> Self {
        Self::from_bytes_be(v.as_bytes())
    }

    /// Returns the number of nibbles.
    pub fn len(&self) -> usize {
        self.nibbles.len()
    }

    /// Returns whether or not this `Nibbles` contains any nibbles.
    pub fn is_empty(&self) -> bool {
        self.nibbles.is_empty()
    }

    /// Gets the nibble at the given index.
    ///
    /// # Panics
    /// Panics if `idx` is out of bounds.
    pub fn get_nibble(&self, idx: usize) -> Nibble {
        self.nibbles[idx]
    }

    /// Returns the nibbles as a slice.
    pub fn as_slice(&self) -> &[Nibble] {
        &self.nibbles
    }

    /// Returns the nibbles remaining after dropping the first `n`. Truncating
    /// more nibbles than are present yields an empty sequence.
    pub fn truncate_n_nibbles_front(&self, n: usize) -> Nibbles {
        let n = n.min(self.len());

        Self {
            nibbles: self.nibbles[n..].to_vec(),
        }
    }

    /// Appends a single nibble.
    pub fn push_nibble_back(&mut self, n: Nibble) {
        assert!(n < 16, "Attempted to append a nibble that was greater than 15!");
        self.nibbles.push(n);
    }

    /// Whether `prefix` is a prefix of these nibbles.
    pub fn starts_with(&self, prefix: &Nibbles) -> bool {
        self.nibbles.starts_with(&prefix.nibbles)
    }

    /// Converts `Nibbles` to hex-prefix encoding (AKA "compact").
    ///
    /// The first nibble of the output carries two flags: bit 0 is set for an
    /// odd number of nibbles and bit 1 is set for leaf paths. Even length
    /// paths pad the flag byte with a zero nibble.
    pub fn to_hex_prefix_encoding(&self, is_leaf: bool) -> Bytes {
        let is_odd = self.len() % 2 == 1;
        let flags: u8 = (is_odd as u8) | ((is_leaf as u8) << 1);

        let mut bytes = BytesMut::with_capacity(self.len() / 2 + 1);
        let rest = match is_odd {
            false => {
                bytes.put_u8(flags << 4);
                &self.nibbles[..]
            }
            true => {
                bytes.put_u8((flags << 4) | self.nibbles[0]);
                &self.nibbles[1..]
            }
        };

        for pair in rest.chunks(2) {
            bytes.put_u8((pair[0] << 4) | pair[1]);
        }

        bytes.freeze()
    }

    /// Converts a hex prefix byte string ("AKA "compact") into `Nibbles`.
    /// Also returns whether the encoding carried the leaf flag.
    pub fn from_hex_prefix_encoding(
        hex_prefix_bytes: &[u8],
    ) -> Result<(Self, bool), FromHexPrefixError> {
        let Some(first) = hex_prefix_bytes.first() else {
            return Err(FromHexPrefixError::Empty);
        };

        if hex_prefix_bytes.len() > MAX_NIBBLES / 2 + 1 {
            return Err(FromHexPrefixError::TooLong(
                hex::encode(hex_prefix_bytes),
                hex_prefix_bytes.len(),
            ));
        }

        let flag_bits = first >> 4;

        // is_odd --> 0b01
        // is_leaf --> 0b10
        let (is_leaf, is_odd) = match flag_bits {
            0b00 => (false, false),
            0b01 => (false, true),
            0b10 => (true, false),
            0b11 => (true, true),
            _ => return Err(FromHexPrefixError::InvalidFlags(flag_bits)),
        };

        let mut nibbles = Vec::with_capacity(hex_prefix_bytes.len() * 2);
        match is_odd {
            true => nibbles.push(first & 0x0f),
            false if first & 0x0f != 0 => {
                return Err(FromHexPrefixError::NonZeroPadding(first & 0x0f))
            }
            false => (),
        }

        nibbles.extend(
            hex_prefix_bytes[1..]
                .iter()
                .flat_map(|b| [b >> 4, b & 0x0f]),
        );

        Ok((Self { nibbles }, is_leaf))
    }
}
