//! Decoding of raw trie nodes as they appear in `eth_getProof` responses.
//!
//! A node is an RLP list of either 17 items (branch) or 2 items (extension or
//! leaf, told apart by the flag nibble of the hex prefix encoded path).
use bytes::Bytes;
use ethereum_types::H256;
use keccak_hash::keccak;
use rlp::{DecoderError, Rlp};
use thiserror::Error;

use crate::{
    nibbles::{FromHexPrefixError, Nibbles},
    utils::TrieNodeType,
};

/// Number of child slots of a branch node (the value slot excluded).
pub const BRANCH_WIDTH: usize = 16;

/// An error encountered when decoding a raw trie node.
#[derive(Debug, Error)]
pub enum NodeDecodeError {
    /// The node is not valid RLP.
    #[error("Node is not valid RLP: {0}")]
    Rlp(#[from] DecoderError),

    /// The node is RLP but not a list.
    #[error("Node is not an RLP list")]
    NotAList,

    /// The node is a list of neither 2 nor 17 items.
    #[error("Node has {0} items (expected 2 or 17)")]
    UnexpectedItemCount(usize),

    /// Extra bytes follow the node's RLP list.
    #[error("Node has {0} trailing bytes")]
    TrailingBytes(usize),

    /// The path of an extension or leaf is not valid hex prefix encoding.
    #[error(transparent)]
    HexPrefix(#[from] FromHexPrefixError),

    /// A child reference is neither empty, a 32 byte hash nor an embedded
    /// node shorter than 32 bytes.
    #[error("Invalid child reference of {0} bytes")]
    InvalidChildRef(usize),
}

/// How a node refers to one of its children.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum ChildRef {
    /// No child in this slot.
    #[default]
    Empty,

    /// The child is stored out of line and referenced by its hash.
    Hash(H256),

    /// The child's RLP is shorter than 32 bytes and embedded directly.
    Inline(Bytes),
}

impl ChildRef {
    fn from_rlp(item: &Rlp) -> Result<Self, NodeDecodeError> {
        if item.is_list() {
            let raw = item.as_raw();
            return match raw.len() < 32 {
                false => Err(NodeDecodeError::InvalidChildRef(raw.len())),
                true => Ok(Self::Inline(Bytes::copy_from_slice(raw))),
            };
        }

        let data = item.data()?;
        match data.len() {
            0 => Ok(Self::Empty),
            32 => Ok(Self::Hash(H256::from_slice(data))),
            n => Err(NodeDecodeError::InvalidChildRef(n)),
        }
    }

    /// Whether this slot is empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Whether `raw_node` is the node this reference points to.
    pub fn matches(&self, raw_node: &[u8]) -> bool {
        match self {
            ChildRef::Empty => false,
            ChildRef::Hash(h) => keccak(raw_node) == *h,
            ChildRef::Inline(b) => b[..] == *raw_node,
        }
    }
}

/// A single decoded trie node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TrieNode {
    /// A branch node.
    Branch {
        /// A slice containing the 16 children of this branch node.
        children: Box<[ChildRef; BRANCH_WIDTH]>,
        /// The value stored at this node, if a key ends here.
        value: Option<Bytes>,
    },

    /// An extension node.
    Extension {
        /// The path of this extension.
        path: Nibbles,
        /// The child of this extension node.
        child: ChildRef,
    },

    /// A leaf node.
    Leaf {
        /// The remaining path to the leaf's key.
        path: Nibbles,
        /// The value stored at the leaf (the RLP of the storage value).
        value: Bytes,
    },
}

impl TrieNode {
    /// Decodes a raw RLP trie node.
    pub fn decode(raw: &[u8]) -> Result<Self, NodeDecodeError> {
        let rlp = Rlp::new(raw);
        let info = rlp.payload_info()?;
        let consumed = info.header_len + info.value_len;
        if consumed != raw.len() {
            return Err(NodeDecodeError::TrailingBytes(
                raw.len().saturating_sub(consumed),
            ));
        }

        if !rlp.is_list() {
            return Err(NodeDecodeError::NotAList);
        }

        match rlp.item_count()? {
            17 => {
                let mut children: [ChildRef; BRANCH_WIDTH] = Default::default();
                for (i, child) in children.iter_mut().enumerate() {
                    *child = ChildRef::from_rlp(&rlp.at(i)?)?;
                }

                let value = rlp.at(BRANCH_WIDTH)?.data()?;
                let value = (!value.is_empty()).then(|| Bytes::copy_from_slice(value));

                Ok(Self::Branch {
                    children: Box::new(children),
                    value,
                })
            }
            2 => {
                let (path, is_leaf) = Nibbles::from_hex_prefix_encoding(rlp.at(0)?.data()?)?;
                match is_leaf {
                    false => Ok(Self::Extension {
                        path,
                        child: ChildRef::from_rlp(&rlp.at(1)?)?,
                    }),
                    true => Ok(Self::Leaf {
                        path,
                        value: Bytes::copy_from_slice(rlp.at(1)?.data()?),
                    }),
                }
            }
            n => Err(NodeDecodeError::UnexpectedItemCount(n)),
        }
    }

    /// The kind of this node.
    pub fn node_type(&self) -> TrieNodeType {
        match self {
            TrieNode::Branch { .. } => TrieNodeType::Branch,
            TrieNode::Extension { .. } => TrieNodeType::Extension,
            TrieNode::Leaf { .. } => TrieNodeType::Leaf,
        }
    }
}
