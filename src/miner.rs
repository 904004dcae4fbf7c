use std::time::Instant;

use chrono::{DateTime, Utc};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chain::{check_shape, Chain};
use crate::config::NodeConfig;
use crate::crypto::{
    aes_decrypt, aes_encrypt, generate_data_key, generate_iv, hashes_match, sign_block_hash,
    unwrap_data_key, verify_block_hash_signature, wrap_data_key,
};
use crate::errors::{ChainError, ChainResult, CommitError};
use crate::storage::Storage;
use crate::types::{
    canonical_hash_input, hash_meets_difficulty, sha256_hex, AppendOutcome, AppendReject, Block,
    Creator, DATA_IV_LEN, GENESIS_HASH,
};

/// Phase-one response: everything a client needs to seal, mine and sign
/// offline. `mining_timeout_ms` is advisory; the node accepts any valid
/// proof regardless of how long the search took.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MiningPreparation {
    pub creator_id: Uuid,
    pub public_key_pem: String,
    pub previous_hash: String,
    pub difficulty: u32,
    pub mining_timeout_ms: u64,
}

/// Phase-two submission. Byte fields travel as lowercase hex; `nonce` is a
/// string-encoded integer so clients without native 64-bit integers stay
/// exact.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitPayload {
    pub creator_id: String,
    pub previous_hash: String,
    pub block_hash: String,
    pub nonce: String,
    pub difficulty: u32,
    pub encrypted_data: String,
    pub data_iv: String,
    pub encrypted_data_key: String,
    pub data_size: u64,
    pub signature: String,
    pub created_at: String,
    #[serde(default)]
    pub mining_duration_ms: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct CommitOutcome {
    pub block: Block,
    /// False when the submission was a replay of an already-appended block.
    pub inserted: bool,
}

pub fn prepare_mining(
    chain: &Chain,
    storage: &Storage,
    config: &NodeConfig,
    display_name: &str,
    data_len: usize,
) -> ChainResult<MiningPreparation> {
    if data_len == 0 {
        return Err(ChainError::Validation("data_text must not be empty".into()));
    }
    if data_len > config.max_data_size {
        return Err(ChainError::Validation(format!(
            "data_text of {data_len} bytes exceeds the {} byte limit",
            config.max_data_size
        )));
    }
    let creator = storage
        .creator_by_display_name(display_name)?
        .ok_or(CommitError::CreatorMissing)?;
    let previous_hash = chain
        .latest_block()
        .map(|tip| tip.block_hash)
        .unwrap_or_else(|| GENESIS_HASH.to_string());
    Ok(MiningPreparation {
        creator_id: creator.creator_id,
        public_key_pem: creator.public_key_pem,
        previous_hash,
        difficulty: config.difficulty,
        mining_timeout_ms: config.mining_timeout_ms,
    })
}

/// The commit pipeline, in contract order: creator, signature,
/// proof-of-work, hash recomputation, shape, previous-hash freshness,
/// append. A duplicate append is surfaced as success with `inserted =
/// false`; a tip move inside the append transaction is reported exactly
/// like one detected up front.
pub fn commit_block(
    chain: &Chain,
    storage: &Storage,
    payload: &CommitPayload,
) -> ChainResult<CommitOutcome> {
    let creator_id = Uuid::parse_str(payload.creator_id.trim())
        .map_err(|_| CommitError::CreatorMissing)?;
    let creator = storage
        .creator_by_id(creator_id)?
        .ok_or(CommitError::CreatorMissing)?;

    let encrypted_data = decode_hex_field(&payload.encrypted_data, "encrypted_data")?;
    let data_iv = decode_hex_field(&payload.data_iv, "data_iv")?;
    let encrypted_data_key = decode_hex_field(&payload.encrypted_data_key, "encrypted_data_key")?;
    let signature = decode_hex_field(&payload.signature, "signature")?;
    let nonce: u64 = payload
        .nonce
        .trim()
        .parse()
        .map_err(|_| ChainError::Validation("nonce is not a valid integer".into()))?;

    if verify_block_hash_signature(&creator.public_key_pem, &payload.block_hash, &signature)
        .is_err()
    {
        return Err(CommitError::SignatureInvalid.into());
    }

    if !hash_meets_difficulty(&payload.block_hash, payload.difficulty) {
        return Err(CommitError::PowFailed.into());
    }

    let previous_hash = normalize_previous_hash(&payload.previous_hash);
    let recomputed = sha256_hex(
        canonical_hash_input(
            previous_hash,
            &encrypted_data,
            &data_iv,
            &encrypted_data_key,
            nonce,
            &payload.created_at,
            Some(creator_id),
            payload.difficulty,
        )
        .as_bytes(),
    );
    if !hashes_match(&recomputed, &payload.block_hash) {
        return Err(CommitError::HashMismatch.into());
    }

    let candidate = Block {
        block_id: Uuid::new_v4(),
        block_number: 0,
        creator_id,
        previous_hash: previous_hash.map(str::to_string),
        block_hash: payload.block_hash.clone(),
        nonce,
        difficulty: payload.difficulty,
        encrypted_data,
        data_iv,
        encrypted_data_key,
        data_size: payload.data_size,
        signature,
        created_at: payload.created_at.clone(),
        verified: false,
        verified_at: None,
        mining_duration_ms: payload.mining_duration_ms,
    };
    check_commit_shape(&candidate, &creator, &payload.created_at)?;

    if let Some(tip) = chain.latest_block() {
        if payload.previous_hash != tip.block_hash && payload.previous_hash != GENESIS_HASH {
            return Err(CommitError::TipMoved.into());
        }
    } else if payload.previous_hash != GENESIS_HASH {
        return Err(CommitError::TipMoved.into());
    }

    match chain.append(&candidate)? {
        AppendOutcome::Inserted(block) => Ok(CommitOutcome {
            block,
            inserted: true,
        }),
        AppendOutcome::Duplicate(block) => Ok(CommitOutcome {
            block,
            inserted: false,
        }),
        AppendOutcome::Rejected(AppendReject::TipMoved) => Err(CommitError::TipMoved.into()),
        AppendOutcome::Rejected(AppendReject::GenesisShape) => {
            Err(CommitError::ShapeInvalid("genesis shape violation".into()).into())
        }
        AppendOutcome::Rejected(AppendReject::Constraint(detail)) => {
            Err(ChainError::Validation(detail))
        }
    }
}

/// Acceptance test for gossiped blocks: recomputed hash, proof-of-work,
/// shape, and the signature under the locally registered creator key.
/// Creator records replicate out-of-band; a block from a creator this node
/// has never seen cannot be stored.
pub fn validate_incoming_block(storage: &Storage, block: &Block) -> Result<(), String> {
    if !block.meets_difficulty() {
        return Err("gossiped block fails its difficulty target".to_string());
    }
    if block.compute_hash() != block.block_hash {
        return Err("gossiped block hash does not match its contents".to_string());
    }
    check_shape(block)?;
    let creator = storage
        .creator_by_id(block.creator_id)
        .map_err(|err| format!("creator lookup failed: {err}"))?
        .ok_or_else(|| format!("gossiped block references unknown creator {}", block.creator_id))?;
    verify_block_hash_signature(&creator.public_key_pem, &block.block_hash, &block.signature)
        .map_err(|_| "gossiped block signature invalid".to_string())?;
    Ok(())
}

fn check_commit_shape(block: &Block, creator: &Creator, created_at: &str) -> ChainResult<()> {
    if !(1..=10).contains(&block.difficulty) {
        return Err(CommitError::ShapeInvalid("difficulty outside 1..=10".into()).into());
    }
    if DateTime::parse_from_rfc3339(created_at).is_err() {
        return Err(
            CommitError::ShapeInvalid("created_at is not an RFC 3339 timestamp".into()).into(),
        );
    }
    let expected_key_len = (creator.key_bits / 8) as usize;
    if block.encrypted_data_key.len() != expected_key_len {
        return Err(CommitError::ShapeInvalid(format!(
            "encrypted_data_key must be {expected_key_len} bytes for a {}-bit key, found {}",
            creator.key_bits,
            block.encrypted_data_key.len()
        ))
        .into());
    }
    check_shape(block).map_err(|reason| CommitError::ShapeInvalid(reason).into())
}

fn decode_hex_field(raw: &str, field: &str) -> ChainResult<Vec<u8>> {
    hex::decode(raw.trim())
        .map_err(|_| ChainError::Validation(format!("{field} is not valid hex")))
}

fn normalize_previous_hash(previous_hash: &str) -> Option<&str> {
    if previous_hash == GENESIS_HASH {
        None
    } else {
        Some(previous_hash)
    }
}

// ---------------------------------------------------------------------
// Client-side sealing. The node never runs these on its own behalf; they
// back the CLI tooling and the test suite, and they are the reference for
// what browsers must produce.
// ---------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct SealedRecord {
    pub encrypted_data: Vec<u8>,
    pub data_iv: [u8; DATA_IV_LEN],
    pub encrypted_data_key: Vec<u8>,
    pub data_size: u64,
}

/// Hybrid seal: fresh AES-256 data key, GCM encryption, OAEP key wrap.
pub fn seal_record(public_key_pem: &str, plaintext: &[u8]) -> ChainResult<SealedRecord> {
    let public_key = crate::crypto::parse_public_key_pem(public_key_pem)?;
    let data_key = generate_data_key();
    let data_iv = generate_iv();
    let encrypted_data = aes_encrypt(&data_key, &data_iv, plaintext)?;
    let encrypted_data_key = wrap_data_key(&public_key, &data_key)?;
    let data_size =
        (encrypted_data.len() + data_iv.len() + encrypted_data_key.len()) as u64;
    Ok(SealedRecord {
        encrypted_data,
        data_iv,
        encrypted_data_key,
        data_size,
    })
}

/// Recovers the plaintext of a sealed block with the creator's private key.
pub fn open_record(private_key: &RsaPrivateKey, block: &Block) -> ChainResult<Vec<u8>> {
    let data_key = unwrap_data_key(private_key, &block.encrypted_data_key)?;
    aes_decrypt(&data_key, &block.data_iv, &block.encrypted_data)
}

/// Proof-of-work search plus signing, producing a ready-to-commit payload.
pub fn mine_and_sign(
    preparation: &MiningPreparation,
    sealed: &SealedRecord,
    private_key: &RsaPrivateKey,
) -> ChainResult<CommitPayload> {
    let created_at = Utc::now().to_rfc3339();
    let started = Instant::now();
    let mut nonce: u64 = 0;
    let previous_hash = normalize_previous_hash(&preparation.previous_hash);
    let block_hash = loop {
        let input = canonical_hash_input(
            previous_hash,
            &sealed.encrypted_data,
            &sealed.data_iv,
            &sealed.encrypted_data_key,
            nonce,
            &created_at,
            Some(preparation.creator_id),
            preparation.difficulty,
        );
        let digest = sha256_hex(input.as_bytes());
        if hash_meets_difficulty(&digest, preparation.difficulty) {
            break digest;
        }
        nonce = nonce.checked_add(1).ok_or_else(|| {
            ChainError::Crypto("nonce space exhausted during mining".into())
        })?;
    };
    let signature = sign_block_hash(private_key, &block_hash);
    Ok(CommitPayload {
        creator_id: preparation.creator_id.to_string(),
        previous_hash: preparation.previous_hash.clone(),
        block_hash,
        nonce: nonce.to_string(),
        difficulty: preparation.difficulty,
        encrypted_data: hex::encode(&sealed.encrypted_data),
        data_iv: hex::encode(sealed.data_iv),
        encrypted_data_key: hex::encode(&sealed.encrypted_data_key),
        data_size: sealed.data_size,
        signature: hex::encode(signature),
        created_at,
        mining_duration_ms: Some(started.elapsed().as_millis() as u64),
    })
}
