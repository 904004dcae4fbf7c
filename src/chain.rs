use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::crypto::verify_block_hash_signature;
use crate::errors::{ChainError, ChainResult};
use crate::storage::{constraint_detail, Storage};
use crate::types::{
    AppendOutcome, Block, ReplaceOutcome, DATA_IV_LEN, DATA_SIZE_TOLERANCE, MIN_ENCRYPTED_DATA_LEN,
};

/// The in-memory chain view over the store. The view is an optimization:
/// reads come from memory, but every write re-derives tip state inside the
/// store's own transaction, and the view is refreshed only after a
/// successful write.
pub struct Chain {
    storage: Storage,
    view: Arc<RwLock<Vec<Block>>>,
}

impl Chain {
    /// Warms the view from the store and refuses to start on a store whose
    /// link structure is broken.
    pub fn load(storage: Storage) -> ChainResult<Self> {
        let blocks = storage.load_chain()?;
        if let Err(reason) = check_links(&blocks) {
            return Err(ChainError::Config(format!(
                "stored chain failed integrity check: {reason}"
            )));
        }
        info!(height = blocks.len(), "chain loaded from store");
        Ok(Self {
            storage,
            view: Arc::new(RwLock::new(blocks)),
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn latest_block(&self) -> Option<Block> {
        self.view.read().last().cloned()
    }

    pub fn height(&self) -> u64 {
        self.view.read().len() as u64
    }

    pub fn snapshot(&self) -> Vec<Block> {
        self.view.read().clone()
    }

    pub fn reload(&self) -> ChainResult<()> {
        let blocks = self.storage.load_chain()?;
        *self.view.write() = blocks;
        Ok(())
    }

    /// Appends through the store and refreshes the view on success.
    pub fn append(&self, candidate: &Block) -> ChainResult<AppendOutcome> {
        let outcome = self.storage.append_block(candidate)?;
        if let AppendOutcome::Inserted(block) = &outcome {
            let mut view = self.view.write();
            let extends_view = view
                .last()
                .map(|tip| Some(tip.block_hash.as_str()) == block.previous_hash.as_deref())
                .unwrap_or(block.previous_hash.is_none());
            if extends_view {
                view.push(block.clone());
            } else {
                // The view lagged the store; rebuild it.
                drop(view);
                self.reload()?;
            }
        }
        Ok(outcome)
    }

    /// Longest-chain replacement: strictly longer candidates only, and every
    /// candidate block is re-validated before the transactional swap.
    pub fn replace_chain(&self, candidate: Vec<Block>) -> ChainResult<ReplaceOutcome> {
        let current = self.height();
        if candidate.len() as u64 <= current {
            return Ok(ReplaceOutcome::Rejected(format!(
                "candidate length {} does not exceed local height {current}",
                candidate.len()
            )));
        }
        if let Err(reason) = self.validate_candidate(&candidate) {
            warn!(%reason, "rejecting candidate chain");
            return Ok(ReplaceOutcome::Rejected(reason));
        }
        match self.storage.replace_chain(&candidate) {
            Ok(()) => {
                self.reload()?;
                info!(height = candidate.len(), "chain replaced");
                Ok(ReplaceOutcome::Accepted {
                    height: candidate.len() as u64,
                })
            }
            Err(ChainError::Storage(err)) => match constraint_detail(&err) {
                Some(detail) => Ok(ReplaceOutcome::Rejected(detail)),
                None => Err(ChainError::Storage(err)),
            },
            Err(err) => Err(err),
        }
    }

    /// Full structural validation of a candidate chain: contiguous numbering
    /// from one, hash links, recomputed hashes, proof-of-work, field shapes
    /// and signatures. Every creator must be registered locally; creator
    /// records replicate out-of-band of the chain itself.
    fn validate_candidate(&self, blocks: &[Block]) -> Result<(), String> {
        check_links(blocks)?;
        for block in blocks {
            if !block.meets_difficulty() {
                return Err(format!(
                    "block {} fails its difficulty target",
                    block.block_number
                ));
            }
            if block.compute_hash() != block.block_hash {
                return Err(format!(
                    "block {} hash does not match its contents",
                    block.block_number
                ));
            }
            check_shape(block)?;
            let creator = self
                .storage
                .creator_by_id(block.creator_id)
                .map_err(|err| format!("creator lookup failed: {err}"))?
                .ok_or_else(|| {
                    format!(
                        "block {} references unknown creator {}",
                        block.block_number, block.creator_id
                    )
                })?;
            verify_block_hash_signature(
                &creator.public_key_pem,
                &block.block_hash,
                &block.signature,
            )
            .map_err(|_| format!("block {} signature invalid", block.block_number))?;
        }
        Ok(())
    }
}

impl Clone for Chain {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            view: self.view.clone(),
        }
    }
}

/// Contiguous numbering from one and intact previous-hash links.
pub fn check_links(blocks: &[Block]) -> Result<(), String> {
    for (idx, block) in blocks.iter().enumerate() {
        let expected_number = idx as u64 + 1;
        if block.block_number != expected_number {
            return Err(format!(
                "expected block number {expected_number}, found {}",
                block.block_number
            ));
        }
        if idx == 0 {
            if block.previous_hash.is_some() {
                return Err("genesis block carries a previous hash".to_string());
            }
        } else {
            let prior = &blocks[idx - 1];
            if block.previous_hash.as_deref() != Some(prior.block_hash.as_str()) {
                return Err(format!(
                    "block {} does not link to block {}",
                    block.block_number, prior.block_number
                ));
            }
        }
    }
    Ok(())
}

/// Field-width checks shared by chain validation and the verifier.
pub fn check_shape(block: &Block) -> Result<(), String> {
    if block.data_iv.len() != DATA_IV_LEN {
        return Err(format!(
            "data_iv must be {DATA_IV_LEN} bytes, found {}",
            block.data_iv.len()
        ));
    }
    if block.encrypted_data.len() < MIN_ENCRYPTED_DATA_LEN {
        return Err("encrypted_data too small to carry an auth tag".to_string());
    }
    if block.encrypted_data_key.is_empty() {
        return Err("encrypted_data_key is empty".to_string());
    }
    let measured = (block.encrypted_data.len()
        + block.data_iv.len()
        + block.encrypted_data_key.len()) as u64;
    if block.data_size.abs_diff(measured) > DATA_SIZE_TOLERANCE {
        return Err(format!(
            "declared data_size {} drifts from measured {measured}",
            block.data_size
        ));
    }
    Ok(())
}
