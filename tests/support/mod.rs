#![allow(dead_code)]

use std::sync::OnceLock;

use anyhow::Result;
use chrono::Utc;
use rsa::RsaPrivateKey;
use uuid::Uuid;

use sealvault_node::chain::Chain;
use sealvault_node::config::NodeConfig;
use sealvault_node::crypto::{generate_keypair, key_bits, public_key_pem};
use sealvault_node::miner::{self, CommitPayload};
use sealvault_node::storage::Storage;
use sealvault_node::types::{Block, Creator};

/// RSA keygen is the slow part of these tests; one shared keypair is enough
/// because every scenario signs with a freshly registered creator row.
pub fn test_private_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| generate_keypair().expect("test keypair"))
}

pub fn test_config(difficulty: u32) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.difficulty = difficulty;
    config
}

pub fn fresh_chain() -> Result<(Storage, Chain)> {
    let storage = Storage::open_in_memory()?;
    let chain = Chain::load(storage.clone())?;
    Ok((storage, chain))
}

pub fn register_creator(storage: &Storage, display_name: &str) -> Result<Creator> {
    let public_key = test_private_key().to_public_key();
    let creator = Creator {
        creator_id: Uuid::new_v4(),
        display_name: display_name.to_string(),
        public_key_pem: public_key_pem(&public_key)?,
        key_bits: key_bits(&public_key),
        active: true,
        created_at: Utc::now(),
    };
    storage.insert_creator(&creator)?;
    Ok(creator)
}

/// Registers the same creator identity (id and key) into another node's
/// store, the out-of-band replication the cluster assumes.
pub fn mirror_creator(storage: &Storage, creator: &Creator) -> Result<()> {
    storage.insert_creator(creator)?;
    Ok(())
}

/// Runs the full client side of the two-phase protocol: prepare, seal,
/// proof-of-work search, sign.
pub fn mine_payload(
    chain: &Chain,
    storage: &Storage,
    config: &NodeConfig,
    display_name: &str,
    plaintext: &[u8],
) -> Result<CommitPayload> {
    let preparation =
        miner::prepare_mining(chain, storage, config, display_name, plaintext.len())?;
    let sealed = miner::seal_record(&preparation.public_key_pem, plaintext)?;
    Ok(miner::mine_and_sign(&preparation, &sealed, test_private_key())?)
}

/// Mines and commits `count` blocks, returning the committed tip sequence.
pub fn grow_chain(
    chain: &Chain,
    storage: &Storage,
    config: &NodeConfig,
    display_name: &str,
    count: usize,
) -> Result<Vec<Block>> {
    let mut committed = Vec::new();
    for index in 0..count {
        let plaintext = format!("sealed record {index}");
        let payload = mine_payload(chain, storage, config, display_name, plaintext.as_bytes())?;
        let outcome = miner::commit_block(chain, storage, &payload)?;
        assert!(outcome.inserted, "expected a fresh append");
        committed.push(outcome.block);
    }
    Ok(committed)
}
