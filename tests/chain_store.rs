use anyhow::Result;
use chrono::Utc;
use tempfile::tempdir;
use uuid::Uuid;

use sealvault_node::chain::Chain;
use sealvault_node::miner;
use sealvault_node::storage::{BlockSort, Storage};
use sealvault_node::types::{AppendOutcome, AppendReject, Block, ReplaceOutcome};

mod support;

use support::{fresh_chain, grow_chain, mirror_creator, register_creator, test_config};

fn raw_block(creator_id: Uuid, previous_hash: Option<&str>, block_hash: &str) -> Block {
    Block {
        block_id: Uuid::new_v4(),
        block_number: 0,
        creator_id,
        previous_hash: previous_hash.map(str::to_string),
        block_hash: block_hash.to_string(),
        nonce: 7,
        difficulty: 1,
        encrypted_data: vec![0xab; 32],
        data_iv: vec![0xcd; 16],
        encrypted_data_key: vec![0xef; 256],
        data_size: 304,
        signature: vec![0x11; 256],
        created_at: Utc::now().to_rfc3339(),
        verified: false,
        verified_at: None,
        mining_duration_ms: Some(5),
    }
}

#[test]
fn append_assigns_sequential_numbers() -> Result<()> {
    let (storage, chain) = fresh_chain()?;
    let creator = register_creator(&storage, "alice")?;

    let first = match chain.append(&raw_block(creator.creator_id, None, "aa01"))? {
        AppendOutcome::Inserted(block) => block,
        other => panic!("expected insert, got {other:?}"),
    };
    assert_eq!(first.block_number, 1);
    assert!(first.previous_hash.is_none());

    let second = match chain.append(&raw_block(creator.creator_id, Some("aa01"), "aa02"))? {
        AppendOutcome::Inserted(block) => block,
        other => panic!("expected insert, got {other:?}"),
    };
    assert_eq!(second.block_number, 2);

    let tip = chain.latest_block().expect("tip after two appends");
    assert_eq!(tip.block_hash, "aa02");
    assert_eq!(storage.count_blocks()?, 2);
    Ok(())
}

#[test]
fn duplicate_hash_returns_existing_block() -> Result<()> {
    let (storage, chain) = fresh_chain()?;
    let creator = register_creator(&storage, "alice")?;

    let original = match chain.append(&raw_block(creator.creator_id, None, "aa01"))? {
        AppendOutcome::Inserted(block) => block,
        other => panic!("expected insert, got {other:?}"),
    };
    let replay = chain.append(&raw_block(creator.creator_id, None, "aa01"))?;
    match replay {
        AppendOutcome::Duplicate(block) => assert_eq!(block.block_id, original.block_id),
        other => panic!("expected duplicate, got {other:?}"),
    }
    assert_eq!(storage.count_blocks()?, 1);
    Ok(())
}

#[test]
fn stale_previous_hash_is_a_tip_move() -> Result<()> {
    let (storage, chain) = fresh_chain()?;
    let creator = register_creator(&storage, "alice")?;

    chain.append(&raw_block(creator.creator_id, None, "aa01"))?;
    chain.append(&raw_block(creator.creator_id, Some("aa01"), "aa02"))?;

    let stale = chain.append(&raw_block(creator.creator_id, Some("aa01"), "aa03"))?;
    match stale {
        AppendOutcome::Rejected(AppendReject::TipMoved) => {}
        other => panic!("expected tip-moved rejection, got {other:?}"),
    }
    assert_eq!(storage.count_blocks()?, 2);
    Ok(())
}

#[test]
fn genesis_shape_is_enforced() -> Result<()> {
    let (storage, chain) = fresh_chain()?;
    let creator = register_creator(&storage, "alice")?;

    // A previous hash on an empty store is not a genesis block.
    match chain.append(&raw_block(creator.creator_id, Some("aa00"), "aa01"))? {
        AppendOutcome::Rejected(AppendReject::TipMoved) | AppendOutcome::Rejected(AppendReject::GenesisShape) => {}
        other => panic!("expected rejection, got {other:?}"),
    }

    chain.append(&raw_block(creator.creator_id, None, "aa01"))?;
    // A null previous hash above height one is rejected before insertion.
    match chain.append(&raw_block(creator.creator_id, None, "aa02"))? {
        AppendOutcome::Rejected(AppendReject::GenesisShape) => {}
        other => panic!("expected genesis-shape rejection, got {other:?}"),
    }
    assert_eq!(storage.count_blocks()?, 1);
    Ok(())
}

#[test]
fn store_rejects_malformed_field_widths() -> Result<()> {
    let (storage, chain) = fresh_chain()?;
    let creator = register_creator(&storage, "alice")?;

    let mut short_iv = raw_block(creator.creator_id, None, "aa01");
    short_iv.data_iv = vec![0xcd; 15];
    match chain.append(&short_iv)? {
        AppendOutcome::Rejected(AppendReject::Constraint(_)) => {}
        other => panic!("expected constraint rejection, got {other:?}"),
    }

    let mut tiny_payload = raw_block(creator.creator_id, None, "aa02");
    tiny_payload.encrypted_data = vec![0xab; 15];
    match chain.append(&tiny_payload)? {
        AppendOutcome::Rejected(AppendReject::Constraint(_)) => {}
        other => panic!("expected constraint rejection, got {other:?}"),
    }

    assert_eq!(storage.count_blocks()?, 0);
    Ok(())
}

#[test]
fn appended_rows_resist_mutation_and_deletion() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("ledger.db");
    let storage = Storage::open(&db_path)?;
    let chain = Chain::load(storage.clone())?;
    let creator = register_creator(&storage, "alice")?;
    chain.append(&raw_block(creator.creator_id, None, "aa01"))?;

    // A second connection bypassing the store API still hits the triggers.
    let raw = rusqlite::Connection::open(&db_path)?;
    let update = raw.execute("UPDATE blocks SET nonce = '9' WHERE block_hash = 'aa01'", []);
    assert!(update.is_err(), "nonce update must be rejected");
    let relink = raw.execute(
        "UPDATE blocks SET previous_hash = 'ff' WHERE block_hash = 'aa01'",
        [],
    );
    assert!(relink.is_err(), "previous_hash update must be rejected");
    let delete = raw.execute("DELETE FROM blocks", []);
    assert!(delete.is_err(), "deletes must be rejected");

    // The verification pair stays writable.
    let verified = raw.execute(
        "UPDATE blocks SET verified = 1, verified_at = '2026-01-01T00:00:00Z' \
         WHERE block_hash = 'aa01'",
        [],
    )?;
    assert_eq!(verified, 1);
    assert_eq!(storage.count_blocks()?, 1);
    Ok(())
}

#[test]
fn replace_requires_a_strictly_longer_chain() -> Result<()> {
    let config = test_config(1);
    let (storage, chain) = fresh_chain()?;
    register_creator(&storage, "alice")?;
    grow_chain(&chain, &storage, &config, "alice", 2)?;

    // Build an equally long rival chain on a second node.
    let (other_storage, other_chain) = fresh_chain()?;
    let rival_creator = register_creator(&other_storage, "alice-remote")?;
    mirror_creator(&storage, &rival_creator)?;
    grow_chain(&other_chain, &other_storage, &config, "alice-remote", 2)?;

    let before = chain.snapshot();
    match chain.replace_chain(other_chain.snapshot())? {
        ReplaceOutcome::Rejected(_) => {}
        other => panic!("expected rejection, got {other:?}"),
    }
    let after = chain.snapshot();
    assert_eq!(
        before.iter().map(|b| &b.block_hash).collect::<Vec<_>>(),
        after.iter().map(|b| &b.block_hash).collect::<Vec<_>>()
    );
    Ok(())
}

#[test]
fn replace_swaps_to_a_longer_valid_chain() -> Result<()> {
    let config = test_config(1);
    let (storage, chain) = fresh_chain()?;
    register_creator(&storage, "alice")?;
    grow_chain(&chain, &storage, &config, "alice", 1)?;

    let (other_storage, other_chain) = fresh_chain()?;
    let rival_creator = register_creator(&other_storage, "alice-remote")?;
    mirror_creator(&storage, &rival_creator)?;
    let rival_blocks = grow_chain(&other_chain, &other_storage, &config, "alice-remote", 3)?;

    match chain.replace_chain(other_chain.snapshot())? {
        ReplaceOutcome::Accepted { height } => assert_eq!(height, 3),
        other => panic!("expected acceptance, got {other:?}"),
    }

    // The store now equals the candidate exactly.
    let stored = storage.load_chain()?;
    assert_eq!(stored.len(), 3);
    for (stored_block, rival_block) in stored.iter().zip(rival_blocks.iter()) {
        assert_eq!(stored_block.block_hash, rival_block.block_hash);
        assert_eq!(stored_block.block_number, rival_block.block_number);
    }
    assert_eq!(chain.height(), 3);
    Ok(())
}

#[test]
fn replace_revalidates_candidate_blocks() -> Result<()> {
    let config = test_config(1);
    let (storage, chain) = fresh_chain()?;
    register_creator(&storage, "alice")?;
    grow_chain(&chain, &storage, &config, "alice", 1)?;

    let (other_storage, other_chain) = fresh_chain()?;
    let rival_creator = register_creator(&other_storage, "alice-remote")?;
    mirror_creator(&storage, &rival_creator)?;
    grow_chain(&other_chain, &other_storage, &config, "alice-remote", 3)?;

    let mut candidate = other_chain.snapshot();
    candidate[1].nonce += 1;
    match chain.replace_chain(candidate)? {
        ReplaceOutcome::Rejected(reason) => {
            assert!(reason.contains("hash"), "unexpected reason: {reason}")
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(chain.height(), 1);
    Ok(())
}

#[test]
fn paginated_reads_filter_and_count() -> Result<()> {
    let config = test_config(1);
    let (storage, chain) = fresh_chain()?;
    register_creator(&storage, "alice")?;
    let blocks = grow_chain(&chain, &storage, &config, "alice", 3)?;

    let (page, total) = storage.paginated_blocks(1, 2, None, BlockSort::Newest)?;
    assert_eq!(total, 3);
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].block_number, 3);

    let (oldest, _) = storage.paginated_blocks(1, 2, None, BlockSort::Oldest)?;
    assert_eq!(oldest[0].block_number, 1);

    let (pending, pending_total) = storage.paginated_blocks(1, 10, Some(false), BlockSort::Newest)?;
    assert_eq!(pending_total, 3);
    assert_eq!(pending.len(), 3);
    let (verified, verified_total) =
        storage.paginated_blocks(1, 10, Some(true), BlockSort::Newest)?;
    assert_eq!(verified_total, 0);
    assert!(verified.is_empty());

    let envelopes = storage.blocks_for_creator(blocks[0].creator_id)?;
    assert_eq!(envelopes.len(), 3);
    assert_eq!(envelopes[0].block_number, 1);
    Ok(())
}

#[test]
fn chain_reload_recovers_from_a_lagging_view() -> Result<()> {
    let config = test_config(1);
    let (storage, chain) = fresh_chain()?;
    register_creator(&storage, "alice")?;
    grow_chain(&chain, &storage, &config, "alice", 2)?;

    // A second in-process view over the same store starts cold and catches
    // up on reload.
    let second_view = Chain::load(storage.clone())?;
    assert_eq!(second_view.height(), 2);

    let payload = support::mine_payload(&chain, &storage, &config, "alice", b"third")?;
    miner::commit_block(&chain, &storage, &payload)?;
    second_view.reload()?;
    assert_eq!(second_view.height(), 3);
    Ok(())
}
