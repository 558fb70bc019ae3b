//! Proof types in the shape `eth_getProof` ([EIP-1186]) returns them.
//!
//! [EIP-1186]: https://eips.ethereum.org/EIPS/eip-1186
use bytes::Bytes;
use ethereum_types::{Address, H256, U256};
use rlp_derive::{RlpDecodable, RlpEncodable};
use serde::{Deserialize, Serialize};

use crate::utils::left_pad_word;

/// An account record as stored in the world-state trie.
#[derive(
    Clone, Debug, Default, Eq, Hash, PartialEq, RlpEncodable, RlpDecodable, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Number of transactions sent (or contracts created) by the account.
    pub nonce: U256,
    /// Balance in wei.
    pub balance: U256,
    /// Root of the account's storage trie.
    #[serde(rename = "storageHash")]
    pub storage_root: H256,
    /// Hash of the account's code.
    pub code_hash: H256,
}

/// Inclusion (or exclusion) proof of a single storage slot.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StorageProof {
    /// The slot, left padded to 32 bytes.
    #[serde(with = "word")]
    pub key: H256,
    /// The value the proof claims for the slot.
    pub value: U256,
    /// Raw trie nodes from the storage root towards the slot's leaf.
    #[serde(with = "hex_seq")]
    pub proof: Vec<Bytes>,
}

/// The full response of `eth_getProof`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountProof {
    /// The proven account.
    pub address: Address,
    /// Raw trie nodes from the state root towards the account's leaf.
    #[serde(with = "hex_seq")]
    pub account_proof: Vec<Bytes>,
    /// Balance in wei.
    pub balance: U256,
    /// Hash of the account's code.
    pub code_hash: H256,
    /// Account nonce.
    pub nonce: U256,
    /// Root of the account's storage trie.
    pub storage_hash: H256,
    /// One proof per requested slot.
    pub storage_proof: Vec<StorageProof>,
}

impl AccountProof {
    /// The account record this response claims.
    pub fn account(&self) -> Account {
        Account {
            nonce: self.nonce,
            balance: self.balance,
            storage_root: self.storage_hash,
            code_hash: self.code_hash,
        }
    }
}

/// Parses a `0x` prefixed (or bare) hex quantity of at most 32 bytes into a
/// left padded word. Odd digit counts are accepted.
pub fn parse_word(s: &str) -> Option<H256> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    let bytes = match digits.len() % 2 {
        0 => hex::decode(digits),
        _ => hex::decode(format!("0{}", digits)),
    }
    .ok()?;

    left_pad_word(&bytes)
}

/// Serde helper for storage keys, which nodes return both padded (`0x00..01`)
/// and as quantities (`0x1`).
pub(crate) mod word {
    use ethereum_types::H256;
    use serde::{de::Error as _, Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &H256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:#x}", key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<H256, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_word(&s).ok_or_else(|| D::Error::custom(format!("invalid word: {}", s)))
    }
}

/// Like `#[serde(with = "::hex")]` over a sequence of byte strings, but
/// tolerates and emits leading `0x` prefixes.
pub(crate) mod hex_seq {
    use bytes::Bytes;
    use serde::{de::Error as _, ser::SerializeSeq as _, Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[Bytes], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(data.len()))?;
        for b in data {
            seq.serialize_element(&format!("0x{}", hex::encode(b)))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Bytes>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .into_iter()
            .map(|s| {
                let digits = s.strip_prefix("0x").unwrap_or(&s);
                hex::decode(digits)
                    .map(Bytes::from)
                    .map_err(D::Error::custom)
            })
            .collect()
    }
}
