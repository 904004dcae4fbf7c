use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::chain::Chain;
use crate::config::NodeConfig;
use crate::crypto::{key_bits, parse_public_key_pem, MIN_RSA_BITS};
use crate::errors::{ChainError, ChainResult};
use crate::gossip::Gossip;
use crate::miner::{self, CommitOutcome, CommitPayload, MiningPreparation};
use crate::storage::{BlockSort, Storage};
use crate::types::{Block, ChainStats, Creator, CreatorStats, CreatorSummary};
use crate::verifier::Verifier;

pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: NodeConfig,
    storage: Storage,
    chain: Chain,
    gossip: Arc<Gossip>,
}

#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub database: &'static str,
    pub blocks: u64,
    pub p2p_peers: usize,
}

impl Node {
    pub fn new(config: NodeConfig) -> ChainResult<Self> {
        config.validate()?;
        config.ensure_directories()?;
        let storage = if config.database_path.to_str() == Some(":memory:") {
            Storage::open_in_memory()?
        } else {
            Storage::open(&config.database_path)?
        };
        let chain = Chain::load(storage.clone())?;
        let gossip = Gossip::new(chain.clone());
        Ok(Self {
            inner: Arc::new(NodeInner {
                config,
                storage,
                chain,
                gossip,
            }),
        })
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            inner: self.inner.clone(),
        }
    }

    /// Brings up the gossip fabric and runs the verifier loop in the
    /// foreground until the surrounding task is cancelled.
    pub async fn start(self) -> ChainResult<()> {
        let inner = self.inner;
        inner.gossip.listen(inner.config.p2p_listen).await?;
        for peer in &inner.config.peers {
            inner.gossip.connect_loop(peer.clone());
        }
        info!(
            peers = inner.config.peers.len(),
            difficulty = inner.config.difficulty,
            "node started"
        );
        let verifier = Verifier::new(inner.storage.clone(), &inner.config);
        verifier.run().await
    }
}

impl NodeHandle {
    pub fn prepare_mining(
        &self,
        display_name: &str,
        data_len: usize,
    ) -> ChainResult<MiningPreparation> {
        miner::prepare_mining(
            &self.inner.chain,
            &self.inner.storage,
            &self.inner.config,
            display_name,
            data_len,
        )
    }

    /// Validates and appends a client-mined block, then gossips it when the
    /// append actually extended the chain.
    pub fn commit_block(&self, payload: &CommitPayload) -> ChainResult<CommitOutcome> {
        let outcome = miner::commit_block(&self.inner.chain, &self.inner.storage, payload)?;
        if outcome.inserted {
            info!(
                block_number = outcome.block.block_number,
                "sealed block committed"
            );
            self.inner.gossip.broadcast_block(&outcome.block);
        }
        Ok(outcome)
    }

    pub fn latest_block(&self) -> Option<Block> {
        self.inner.chain.latest_block()
    }

    pub fn paginated_blocks(
        &self,
        page: u64,
        limit: u64,
        verified: Option<bool>,
        sort: BlockSort,
    ) -> ChainResult<(Vec<Block>, u64)> {
        self.inner.storage.paginated_blocks(page, limit, verified, sort)
    }

    pub fn blocks_for_creator(&self, creator_id: Uuid) -> ChainResult<Vec<Block>> {
        self.inner
            .storage
            .creator_by_id(creator_id)?
            .ok_or_else(|| ChainError::NotFound(format!("creator {creator_id}")))?;
        self.inner.storage.blocks_for_creator(creator_id)
    }

    pub fn chain_stats(&self) -> ChainResult<ChainStats> {
        self.inner.storage.chain_stats()
    }

    pub fn list_creators(&self) -> ChainResult<Vec<CreatorSummary>> {
        self.inner.storage.list_creators()
    }

    pub fn register_creator(
        &self,
        display_name: &str,
        public_key_pem: &str,
    ) -> ChainResult<CreatorSummary> {
        validate_display_name(display_name)?;
        let public_key = parse_public_key_pem(public_key_pem)
            .map_err(|_| ChainError::Validation("public_key_pem is not a valid RSA key".into()))?;
        let bits = key_bits(&public_key);
        if bits < MIN_RSA_BITS {
            return Err(ChainError::Validation(format!(
                "RSA modulus must be at least {MIN_RSA_BITS} bits, found {bits}"
            )));
        }
        let creator = Creator {
            creator_id: Uuid::new_v4(),
            display_name: display_name.to_string(),
            public_key_pem: public_key_pem.to_string(),
            key_bits: bits,
            active: true,
            created_at: Utc::now(),
        };
        self.inner.storage.insert_creator(&creator)?;
        info!(display_name, key_bits = bits, "creator registered");
        Ok(CreatorSummary {
            creator_id: creator.creator_id,
            display_name: creator.display_name,
            key_size: creator.key_bits,
            key_algorithm: "RSA",
            created_at: creator.created_at,
            block_count: 0,
        })
    }

    pub fn creator_public_key(&self, display_name: &str) -> ChainResult<(Uuid, String)> {
        let creator = self
            .inner
            .storage
            .creator_by_display_name(display_name)?
            .ok_or_else(|| ChainError::NotFound(format!("creator '{display_name}'")))?;
        Ok((creator.creator_id, creator.public_key_pem))
    }

    pub fn creator_stats(&self) -> ChainResult<CreatorStats> {
        self.inner.storage.creator_stats()
    }

    pub fn health(&self) -> ChainResult<HealthReport> {
        let blocks = self.inner.storage.count_blocks()?;
        Ok(HealthReport {
            status: "ok",
            database: "connected",
            blocks,
            p2p_peers: self.inner.gossip.peer_count(),
        })
    }
}

fn validate_display_name(display_name: &str) -> ChainResult<()> {
    let len = display_name.chars().count();
    if !(3..=255).contains(&len) {
        return Err(ChainError::Validation(
            "display_name must be between 3 and 255 characters".into(),
        ));
    }
    if !display_name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ChainError::Validation(
            "display_name may only contain letters, digits, '_' and '-'".into(),
        ));
    }
    Ok(())
}
