use std::time::Duration;

use anyhow::Result;
use tokio::time;

use sealvault_node::gossip::Gossip;
use sealvault_node::miner;

mod support;

use support::{fresh_chain, grow_chain, mine_payload, mirror_creator, register_creator, test_config};

/// Polls until `predicate` holds or a few seconds elapse.
async fn wait_until(mut predicate: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if predicate() {
            return true;
        }
        time::sleep(Duration::from_millis(50)).await;
    }
    predicate()
}

#[tokio::test]
async fn chain_exchange_on_connect_converges_an_empty_peer() -> Result<()> {
    let config = test_config(1);
    let (storage_a, chain_a) = fresh_chain()?;
    let creator = register_creator(&storage_a, "alice")?;
    grow_chain(&chain_a, &storage_a, &config, "alice", 2)?;

    let (storage_b, chain_b) = fresh_chain()?;
    mirror_creator(&storage_b, &creator)?;

    let gossip_a = Gossip::new(chain_a.clone());
    let addr = gossip_a.listen("127.0.0.1:0".parse()?).await?;

    let gossip_b = Gossip::new(chain_b.clone());
    gossip_b.connect_loop(addr.to_string());

    assert!(
        wait_until(|| chain_b.height() == 2).await,
        "peer never adopted the longer chain"
    );
    let tips: Vec<_> = [&chain_a, &chain_b]
        .iter()
        .map(|chain| chain.latest_block().expect("tip").block_hash)
        .collect();
    assert_eq!(tips[0], tips[1]);
    Ok(())
}

#[tokio::test]
async fn block_broadcast_extends_connected_peers() -> Result<()> {
    let config = test_config(1);
    let (storage_a, chain_a) = fresh_chain()?;
    let creator = register_creator(&storage_a, "alice")?;

    let (storage_b, chain_b) = fresh_chain()?;
    mirror_creator(&storage_b, &creator)?;

    let gossip_a = Gossip::new(chain_a.clone());
    let addr = gossip_a.listen("127.0.0.1:0".parse()?).await?;
    let gossip_b = Gossip::new(chain_b.clone());
    gossip_b.connect_loop(addr.to_string());

    assert!(
        wait_until(|| gossip_a.peer_count() == 1).await,
        "peer never connected"
    );

    // Commit on A and gossip it; B validates and appends.
    let payload = mine_payload(&chain_a, &storage_a, &config, "alice", b"broadcast me")?;
    let outcome = miner::commit_block(&chain_a, &storage_a, &payload)?;
    gossip_a.broadcast_block(&outcome.block);

    assert!(
        wait_until(|| chain_b.height() == 1).await,
        "peer never appended the gossiped block"
    );
    assert_eq!(
        chain_b.latest_block().expect("tip").block_hash,
        outcome.block.block_hash
    );
    Ok(())
}

#[tokio::test]
async fn shorter_chains_never_replace_longer_ones() -> Result<()> {
    let config = test_config(1);

    // A carries two blocks, B carries three on a different branch.
    let (storage_a, chain_a) = fresh_chain()?;
    let creator_a = register_creator(&storage_a, "alice")?;
    grow_chain(&chain_a, &storage_a, &config, "alice", 2)?;

    let (storage_b, chain_b) = fresh_chain()?;
    let creator_b = register_creator(&storage_b, "bob")?;
    mirror_creator(&storage_b, &creator_a)?;
    mirror_creator(&storage_a, &creator_b)?;
    grow_chain(&chain_b, &storage_b, &config, "bob", 3)?;

    let gossip_a = Gossip::new(chain_a.clone());
    let addr = gossip_a.listen("127.0.0.1:0".parse()?).await?;
    let gossip_b = Gossip::new(chain_b.clone());
    gossip_b.connect_loop(addr.to_string());

    // A adopts B's longer branch; B ignores A's shorter opening chain.
    assert!(
        wait_until(|| chain_a.height() == 3).await,
        "shorter side never adopted the longer branch"
    );
    assert_eq!(chain_b.height(), 3);
    assert_eq!(
        chain_a.latest_block().expect("tip").block_hash,
        chain_b.latest_block().expect("tip").block_hash
    );
    Ok(())
}
