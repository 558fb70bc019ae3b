//! Verification and compaction of Ethereum storage proofs.
//!
//! Porting a contract's storage to another chain means proving many of its
//! slots against a single storage root. Submitting one `eth_getProof` proof
//! per slot repeats the upper trie nodes over and over; this crate merges
//! such proofs into one [`CompactedTrie`][compact::CompactedTrie] whose
//! encoding still lets a verifier recompute the root in a single bottom-up
//! pass and extract every slot's value.
//!
//! The [`verify`] module checks single account and storage proofs, and
//! [`compact`] builds (and decodes) the merged proof.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_debug_implementations)]
#![deny(missing_docs)]

pub mod compact;
pub mod nibbles;
pub mod node;
pub mod proof;
pub mod utils;
pub mod verify;

#[cfg(test)]
pub(crate) mod testing_utils;
