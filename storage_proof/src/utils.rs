//! Various types and logic that don't fit well into any other module.

use std::fmt::{self, Display};

use ethereum_types::{Address, H256, U256};
use keccak_hash::keccak;

/// Root hash of a trie with no entries (`keccak(rlp(""))`).
pub const EMPTY_TRIE_HASH: H256 = H256([
    0x56, 0xe8, 0x1f, 0x17, 0x1b, 0xcc, 0x55, 0xa6, 0xff, 0x83, 0x45, 0xe6, 0x92, 0xc0, 0xf8, 0x6e,
    0x5b, 0x48, 0xe0, 0x1b, 0x99, 0x6c, 0xad, 0xc0, 0x01, 0x62, 0x2f, 0xb5, 0xe3, 0x63, 0xb4, 0x21,
]);

#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
/// Simplified trie node type to make logging cleaner.
pub enum TrieNodeType {
    /// Branch node.
    Branch,

    /// Extension node.
    Extension,

    /// Leaf node.
    Leaf,
}

impl Display for TrieNodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrieNodeType::Branch => "Branch",
            TrieNodeType::Extension => "Extension",
            TrieNodeType::Leaf => "Leaf",
        };

        write!(f, "{}", s)
    }
}

/// Path of a storage slot in the storage trie: `keccak256(leftpad32(slot))`.
pub fn hashed_storage_key(slot: H256) -> H256 {
    keccak(slot.as_bytes())
}

/// Path of an account in the world-state trie: `keccak256(address)`.
pub fn hashed_address(address: Address) -> H256 {
    keccak(address.as_bytes())
}

/// The bytes a storage leaf holds for `value`: the RLP of the trimmed big
/// endian integer. Zero encodes as the empty string (`0x80`).
pub fn storage_value_rlp(value: U256) -> Vec<u8> {
    rlp::encode(&value).to_vec()
}

/// Left pads a big endian quantity of at most 32 bytes into a word.
pub(crate) fn left_pad_word(bytes: &[u8]) -> Option<H256> {
    if bytes.len() > 32 {
        return None;
    }

    let mut word = H256::zero();
    word.0[32 - bytes.len()..].copy_from_slice(bytes);

    Some(word)
}
