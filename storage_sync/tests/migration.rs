mod common;

use alloy::rpc::types::BlockNumberOrTag;
use common::{proof_response, word, FakeChain};
use ethereum_types::{Address, H160, H256, U256};
use rlp::Rlp;
use storage_proof::verify::VerifyError;
use storage_sync::migration::{
    encode_account, encode_parent_nodes, fetch_migration_proof, MigrationError, MigrationProof,
};

const CONTRACT: Address = H160([0xcc; 20]);
const SLOTS: &[(u64, u64)] = &[(1, 9000), (2, 5), (0x10, 7), (0xfeed, 1 << 40)];

#[tokio::test]
async fn ports_account_and_storage() {
    let (state_root, response) = proof_response(CONTRACT, SLOTS, &[1, 2, 0x10, 0xfeed, 3]);
    let chain = FakeChain::new("node", 10).with_proof(state_root, response.clone());

    let proof = fetch_migration_proof(
        &chain,
        CONTRACT,
        vec![word(1), word(2), word(0x10), word(0xfeed)],
        &[],
        BlockNumberOrTag::Latest,
    )
    .await
    .unwrap();
    assert_eq!(chain.calls_to("eth_getProof"), 1);

    let blob = proof.encode();
    let decoded = MigrationProof::decode(&blob).unwrap();
    assert_eq!(decoded, proof);
    assert_eq!(decoded.account(), &response.account());

    let storage = decoded.verify(CONTRACT, state_root).unwrap().unwrap();
    assert_eq!(storage.root_hash(), response.storage_hash);
    for (k, v) in SLOTS {
        assert_eq!(storage.value(word(*k)), Some(U256::from(*v)));
    }
    assert_eq!(storage.values().len(), SLOTS.len());
}

/// Six slots, each hanging off its own child of the root branch.
const SPREAD: &[(u64, u64)] = &[(0, 10), (1, 11), (2, 12), (3, 13), (4, 14), (5, 15)];

#[tokio::test]
async fn last_unchanged_sibling_is_proven_too() {
    let (state_root, response) = proof_response(CONTRACT, SPREAD, &[0, 1, 2, 3, 4, 5]);
    let chain = FakeChain::new("node", 10).with_proof(state_root, response);

    let proof = fetch_migration_proof(
        &chain,
        CONTRACT,
        (0..5).map(word).collect(),
        &[word(5)],
        BlockNumberOrTag::Latest,
    )
    .await
    .unwrap();
    assert_eq!(chain.calls_to("eth_getProof"), 2);

    let storage = proof.verify(CONTRACT, state_root).unwrap().unwrap();
    assert_eq!(storage.values().len(), SPREAD.len());
    for (k, v) in SPREAD {
        assert_eq!(storage.value(word(*k)), Some(U256::from(*v)));
    }
}

#[tokio::test]
async fn unchanged_keys_are_only_fetched_when_needed() {
    let (state_root, response) = proof_response(CONTRACT, SPREAD, &[0, 1, 2, 3, 4, 5]);
    let chain = FakeChain::new("node", 10).with_proof(state_root, response);

    // Two children of the root stay uncovered.
    let proof = fetch_migration_proof(
        &chain,
        CONTRACT,
        (0..4).map(word).collect(),
        &[word(4), word(5)],
        BlockNumberOrTag::Latest,
    )
    .await
    .unwrap();
    assert_eq!(chain.calls_to("eth_getProof"), 1);

    let storage = proof.verify(CONTRACT, state_root).unwrap().unwrap();
    assert_eq!(storage.values().len(), 4);
    assert_eq!(storage.value(word(5)), None);
}

#[test]
fn blob_layout() {
    let (state_root, response) = proof_response(CONTRACT, SLOTS, &[1, 2]);
    let proof = MigrationProof::build(&response, state_root, true).unwrap();

    let blob = proof.encode();
    let items = Rlp::new(&blob);
    assert_eq!(items.item_count().unwrap(), 3);
    assert_eq!(
        items.at(0).unwrap().data().unwrap(),
        &encode_account(&response.account())[..]
    );
    assert_eq!(
        items.at(1).unwrap().data().unwrap(),
        &encode_parent_nodes(&response.account_proof)[..]
    );
    assert_eq!(
        items.at(2).unwrap().data().unwrap(),
        &proof.storage_proof().unwrap()[..]
    );

    let parent_nodes = Rlp::new(items.at(1).unwrap().data().unwrap());
    let nodes: Vec<&[u8]> = parent_nodes.iter().map(|node| node.as_raw()).collect();
    let expected: Vec<&[u8]> = response.account_proof.iter().map(|n| &n[..]).collect();
    assert_eq!(nodes, expected);
}

#[test]
fn account_only_blob_has_an_empty_storage_entry() {
    let (state_root, response) = proof_response(CONTRACT, SLOTS, &[1]);
    let proof = MigrationProof::build(&response, state_root, false).unwrap();
    assert!(proof.storage_proof().is_none());

    let blob = proof.encode();
    let storage = Rlp::new(&blob).at(2).unwrap();
    assert!(storage.is_list());
    assert_eq!(storage.item_count().unwrap(), 0);

    let decoded = MigrationProof::decode(&blob).unwrap();
    assert!(decoded.verify(CONTRACT, state_root).unwrap().is_none());
}

#[test]
fn contract_without_storage() {
    let (state_root, response) = proof_response(CONTRACT, &[], &[1, 2]);
    let proof = MigrationProof::build(&response, state_root, true).unwrap();

    assert!(proof.storage_proof().is_none());
    assert!(proof.verify(CONTRACT, state_root).unwrap().is_none());
}

#[test]
fn wrong_state_root_is_rejected() {
    let (_, response) = proof_response(CONTRACT, SLOTS, &[1]);

    let err = MigrationProof::build(&response, H256::repeat_byte(0x42), true).unwrap_err();
    assert!(matches!(
        err,
        MigrationError::Verify(VerifyError::InvalidProof { .. })
    ));
}

#[test]
fn claimed_account_must_match_the_trie() {
    let (state_root, mut response) = proof_response(CONTRACT, SLOTS, &[1]);
    response.balance += U256::one();

    let err = MigrationProof::build(&response, state_root, false).unwrap_err();
    assert!(matches!(
        err,
        MigrationError::Verify(VerifyError::ValueMismatch { .. })
    ));
}

#[test]
fn claimed_storage_value_must_match_the_trie() {
    let (state_root, mut response) = proof_response(CONTRACT, SLOTS, &[1, 2]);
    response.storage_proof[1].value = U256::from(6);

    assert!(MigrationProof::build(&response, state_root, false).is_ok());
    assert!(matches!(
        MigrationProof::build(&response, state_root, true).unwrap_err(),
        MigrationError::Compact(_)
    ));
}

#[test]
fn blob_for_another_address_does_not_verify() {
    let (state_root, response) = proof_response(CONTRACT, SLOTS, &[1]);
    let proof = MigrationProof::build(&response, state_root, true).unwrap();

    assert!(proof
        .verify(Address::repeat_byte(0xdd), state_root)
        .is_err());
}

#[test]
fn malformed_blobs_are_rejected() {
    let (state_root, response) = proof_response(CONTRACT, SLOTS, &[1]);
    let blob = MigrationProof::build(&response, state_root, true)
        .unwrap()
        .encode();

    let mut trailing = blob.to_vec();
    trailing.push(0x80);
    assert!(matches!(
        MigrationProof::decode(&trailing),
        Err(MigrationError::Malformed(_))
    ));

    let mut s = rlp::RlpStream::new_list(2);
    s.append(&1u8).append(&2u8);
    assert!(matches!(
        MigrationProof::decode(&s.out()),
        Err(MigrationError::Malformed(_))
    ));
}
