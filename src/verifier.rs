use std::time::Duration;

use chrono::Utc;
use tokio::time;
use tracing::{debug, info, warn};

use crate::chain::check_shape;
use crate::config::NodeConfig;
use crate::crypto::verify_block_hash_signature;
use crate::errors::ChainResult;
use crate::storage::Storage;
use crate::types::Block;

pub const AUDIT_VERIFIED_OK: &str = "BLOCK_VERIFIED_OK";
pub const AUDIT_VERIFIED_FAIL: &str = "BLOCK_VERIFIED_FAIL";

/// Periodic re-verification of pending blocks. Each tick reads a bounded
/// batch in ascending block order, re-runs the five checks, and records the
/// outcome together with its audit event in one transaction.
pub struct Verifier {
    storage: Storage,
    interval: Duration,
    batch: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub checked: usize,
    pub promoted: usize,
    pub failed: usize,
}

impl Verifier {
    pub fn new(storage: Storage, config: &NodeConfig) -> Self {
        Self {
            storage,
            interval: Duration::from_secs(config.verifier_interval_secs),
            batch: config.verifier_batch,
        }
    }

    pub async fn run(self) -> ChainResult<()> {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.run_tick() {
                Ok(summary) if summary.checked > 0 => {
                    info!(
                        checked = summary.checked,
                        promoted = summary.promoted,
                        failed = summary.failed,
                        "verifier tick complete"
                    );
                }
                Ok(_) => debug!("verifier tick found no pending blocks"),
                Err(err) => warn!(?err, "verifier tick failed"),
            }
        }
    }

    /// One verification pass. Per-block failures mark the block and move on;
    /// they never abort the tick.
    pub fn run_tick(&self) -> ChainResult<TickSummary> {
        let pending = self.storage.pending_blocks(self.batch)?;
        let mut summary = TickSummary {
            checked: pending.len(),
            ..TickSummary::default()
        };
        for block in pending {
            let outcome = self.verify_block(&block);
            let (verified, event_type, detail) = match &outcome {
                Ok(()) => (true, AUDIT_VERIFIED_OK, None),
                Err(reason) => (false, AUDIT_VERIFIED_FAIL, Some(reason.as_str())),
            };
            if let Err(err) = self.storage.update_verification(
                block.block_id,
                verified,
                Utc::now(),
                event_type,
                detail,
            ) {
                warn!(?err, block_number = block.block_number, "verification update failed");
                continue;
            }
            match outcome {
                Ok(()) => {
                    summary.promoted += 1;
                    debug!(block_number = block.block_number, "block verified");
                }
                Err(reason) => {
                    summary.failed += 1;
                    warn!(block_number = block.block_number, %reason, "block failed verification");
                }
            }
        }
        Ok(summary)
    }

    /// Hash, proof-of-work, chain link, signature and shape, in that order.
    fn verify_block(&self, block: &Block) -> Result<(), String> {
        if block.compute_hash() != block.block_hash {
            return Err("recomputed hash does not match stored block_hash".to_string());
        }
        if !block.meets_difficulty() {
            return Err("stored hash fails its difficulty target".to_string());
        }
        if block.block_number > 1 {
            let prior = self
                .storage
                .block_hash_at(block.block_number - 1)
                .map_err(|err| format!("prior block lookup failed: {err}"))?
                .ok_or_else(|| format!("prior block {} is missing", block.block_number - 1))?;
            if block.previous_hash.as_deref() != Some(prior.as_str()) {
                return Err("previous_hash does not match the prior block".to_string());
            }
        } else if block.previous_hash.is_some() {
            return Err("genesis block carries a previous hash".to_string());
        }
        let creator = self
            .storage
            .creator_by_id(block.creator_id)
            .map_err(|err| format!("creator lookup failed: {err}"))?
            .ok_or_else(|| format!("creator {} unknown", block.creator_id))?;
        verify_block_hash_signature(&creator.public_key_pem, &block.block_hash, &block.signature)
            .map_err(|_| "signature does not verify under the creator key".to_string())?;
        check_shape(block)?;
        Ok(())
    }
}
