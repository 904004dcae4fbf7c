use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use uuid::Uuid;

use crate::errors::{ChainError, ChainResult};
use crate::types::{
    AppendOutcome, AppendReject, Block, ChainStats, Creator, CreatorStats, CreatorSummary,
};

/// Relational schema. The chain invariants live here: uniqueness of
/// `block_hash` and `block_number`, the genesis shape check, field-width
/// checks, and the append-only triggers. `maintenance.unlocked` is the
/// transaction-scoped escape hatch used only by wholesale chain replacement.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS creators (
    creator_id      TEXT PRIMARY KEY,
    display_name    TEXT NOT NULL UNIQUE
                    CHECK (length(display_name) BETWEEN 3 AND 255),
    public_key_pem  TEXT NOT NULL,
    key_bits        INTEGER NOT NULL CHECK (key_bits >= 2048),
    active          INTEGER NOT NULL DEFAULT 1,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS blocks (
    block_id           TEXT PRIMARY KEY,
    block_number       INTEGER NOT NULL UNIQUE CHECK (block_number >= 1),
    creator_id         TEXT NOT NULL REFERENCES creators (creator_id),
    previous_hash      TEXT,
    block_hash         TEXT NOT NULL UNIQUE,
    nonce              TEXT NOT NULL,
    difficulty         INTEGER NOT NULL CHECK (difficulty BETWEEN 1 AND 10),
    encrypted_data     BLOB NOT NULL CHECK (length(encrypted_data) >= 16),
    data_iv            BLOB NOT NULL CHECK (length(data_iv) = 16),
    encrypted_data_key BLOB NOT NULL,
    data_size          INTEGER NOT NULL CHECK (data_size > 0),
    signature          BLOB NOT NULL,
    created_at         TEXT NOT NULL,
    verified           INTEGER NOT NULL DEFAULT 0,
    verified_at        TEXT,
    mining_duration_ms INTEGER,
    CHECK (
        (previous_hash IS NULL AND block_number = 1)
        OR (previous_hash IS NOT NULL AND block_number > 1)
    )
);

CREATE INDEX IF NOT EXISTS idx_blocks_creator ON blocks (creator_id);
CREATE INDEX IF NOT EXISTS idx_blocks_pending ON blocks (verified, block_number);

CREATE TABLE IF NOT EXISTS audit_events (
    event_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    block_id   TEXT NOT NULL,
    detail     TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS maintenance (
    id       INTEGER PRIMARY KEY CHECK (id = 1),
    unlocked INTEGER NOT NULL DEFAULT 0
);
INSERT OR IGNORE INTO maintenance (id, unlocked) VALUES (1, 0);

CREATE TRIGGER IF NOT EXISTS blocks_append_only_delete
BEFORE DELETE ON blocks
WHEN (SELECT unlocked FROM maintenance WHERE id = 1) = 0
BEGIN
    SELECT RAISE(ABORT, 'blocks_append_only');
END;

CREATE TRIGGER IF NOT EXISTS blocks_append_only_update
BEFORE UPDATE ON blocks
WHEN NEW.block_id IS NOT OLD.block_id
    OR NEW.block_number IS NOT OLD.block_number
    OR NEW.creator_id IS NOT OLD.creator_id
    OR NEW.previous_hash IS NOT OLD.previous_hash
    OR NEW.block_hash IS NOT OLD.block_hash
    OR NEW.nonce IS NOT OLD.nonce
    OR NEW.difficulty IS NOT OLD.difficulty
    OR NEW.encrypted_data IS NOT OLD.encrypted_data
    OR NEW.data_iv IS NOT OLD.data_iv
    OR NEW.encrypted_data_key IS NOT OLD.encrypted_data_key
    OR NEW.data_size IS NOT OLD.data_size
    OR NEW.signature IS NOT OLD.signature
    OR NEW.created_at IS NOT OLD.created_at
    OR NEW.mining_duration_ms IS NOT OLD.mining_duration_ms
BEGIN
    SELECT RAISE(ABORT, 'blocks_append_only');
END;

CREATE TRIGGER IF NOT EXISTS audit_events_append_only_update
BEFORE UPDATE ON audit_events
BEGIN
    SELECT RAISE(ABORT, 'audit_append_only');
END;

CREATE TRIGGER IF NOT EXISTS audit_events_append_only_delete
BEFORE DELETE ON audit_events
BEGIN
    SELECT RAISE(ABORT, 'audit_append_only');
END;
"#;

const BLOCK_COLUMNS: &str = "block_id, block_number, creator_id, previous_hash, block_hash, \
     nonce, difficulty, encrypted_data, data_iv, encrypted_data_key, data_size, signature, \
     created_at, verified, verified_at, mining_duration_ms";

/// Sort orders accepted by the paginated read path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockSort {
    Newest,
    Oldest,
    BlockNumber,
}

impl BlockSort {
    fn order_clause(self) -> &'static str {
        match self {
            BlockSort::Newest => "ORDER BY block_number DESC",
            BlockSort::Oldest | BlockSort::BlockNumber => "ORDER BY block_number ASC",
        }
    }
}

pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    pub fn open(path: &Path) -> ChainResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> ChainResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> ChainResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    /// Atomic append. Re-reads the tip inside the transaction, assigns the
    /// next block number, and classifies constraint failures: an identical
    /// `block_hash` is a duplicate, a stale previous hash is a tip move.
    pub fn append_block(&self, candidate: &Block) -> ChainResult<AppendOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = Self::block_by_hash_tx(&tx, &candidate.block_hash)? {
            return Ok(AppendOutcome::Duplicate(existing));
        }

        let tip: Option<(u64, String)> = tx
            .query_row(
                "SELECT block_number, block_hash FROM blocks \
                 ORDER BY block_number DESC LIMIT 1",
                [],
                |row| Ok((row.get::<_, i64>(0)? as u64, row.get(1)?)),
            )
            .optional()?;

        let block_number = match &tip {
            Some((tip_number, tip_hash)) => match candidate.previous_hash.as_deref() {
                Some(prev) if prev == tip_hash => tip_number + 1,
                Some(_) => return Ok(AppendOutcome::Rejected(AppendReject::TipMoved)),
                None => return Ok(AppendOutcome::Rejected(AppendReject::GenesisShape)),
            },
            None => {
                if candidate.previous_hash.is_some() {
                    return Ok(AppendOutcome::Rejected(AppendReject::GenesisShape));
                }
                1
            }
        };

        let stored = Block {
            block_number,
            ..candidate.clone()
        };
        match Self::insert_block_tx(&tx, &stored) {
            Ok(()) => {
                tx.commit()?;
                Ok(AppendOutcome::Inserted(stored))
            }
            Err(err) => {
                drop(tx);
                match constraint_detail(&err) {
                    Some(detail) if detail.contains("block_hash") => {
                        // Lost a race on the uniqueness key; surface the winner.
                        let existing = Self::block_by_hash_conn(&conn, &candidate.block_hash)?
                            .ok_or(ChainError::Storage(err))?;
                        Ok(AppendOutcome::Duplicate(existing))
                    }
                    Some(detail) => Ok(AppendOutcome::Rejected(AppendReject::Constraint(detail))),
                    None => Err(err.into()),
                }
            }
        }
    }

    /// Transactional wholesale replacement: unlock the append-only guard,
    /// delete the chain, insert the candidate, re-lock, commit. Rollback on
    /// any failure leaves the prior chain (and the guard) intact.
    pub fn replace_chain(&self, blocks: &[Block]) -> ChainResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        tx.execute("UPDATE maintenance SET unlocked = 1 WHERE id = 1", [])?;
        tx.execute("DELETE FROM blocks", [])?;
        for block in blocks {
            Self::insert_block_tx(&tx, block)?;
        }
        tx.execute("UPDATE maintenance SET unlocked = 0 WHERE id = 1", [])?;
        tx.commit()?;
        Ok(())
    }

    /// The verifier's single permitted mutation, recorded together with its
    /// audit event in one transaction.
    pub fn update_verification(
        &self,
        block_id: Uuid,
        verified: bool,
        verified_at: DateTime<Utc>,
        event_type: &str,
        detail: Option<&str>,
    ) -> ChainResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE blocks SET verified = ?1, verified_at = ?2 WHERE block_id = ?3",
            params![verified, verified_at.to_rfc3339(), block_id.to_string()],
        )?;
        if changed == 0 {
            return Err(ChainError::NotFound(format!("block {block_id}")));
        }
        tx.execute(
            "INSERT INTO audit_events (event_type, block_id, detail, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                event_type,
                block_id.to_string(),
                detail,
                Utc::now().to_rfc3339()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn load_chain(&self) -> ChainResult<Vec<Block>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks ORDER BY block_number ASC"
        ))?;
        let blocks = stmt
            .query_map([], block_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(blocks)
    }

    pub fn pending_blocks(&self, limit: usize) -> ChainResult<Vec<Block>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE verified = 0 \
             ORDER BY block_number ASC LIMIT ?1"
        ))?;
        let blocks = stmt
            .query_map(params![limit as i64], block_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(blocks)
    }

    pub fn block_hash_at(&self, block_number: u64) -> ChainResult<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT block_hash FROM blocks WHERE block_number = ?1",
                params![block_number as i64],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn paginated_blocks(
        &self,
        page: u64,
        limit: u64,
        verified: Option<bool>,
        sort: BlockSort,
    ) -> ChainResult<(Vec<Block>, u64)> {
        let conn = self.conn.lock();
        let filter = match verified {
            Some(true) => "WHERE verified = 1",
            Some(false) => "WHERE verified = 0",
            None => "",
        };
        let total: u64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM blocks {filter}"),
            [],
            |row| row.get::<_, i64>(0).map(|count| count as u64),
        )?;
        let offset = page.saturating_sub(1).saturating_mul(limit);
        let mut stmt = conn.prepare(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks {filter} {} LIMIT ?1 OFFSET ?2",
            sort.order_clause()
        ))?;
        let blocks = stmt
            .query_map(params![limit as i64, offset as i64], block_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok((blocks, total))
    }

    /// The envelope read path: everything a key holder needs to decrypt
    /// offline, in chain order.
    pub fn blocks_for_creator(&self, creator_id: Uuid) -> ChainResult<Vec<Block>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE creator_id = ?1 \
             ORDER BY block_number ASC"
        ))?;
        let blocks = stmt
            .query_map(params![creator_id.to_string()], block_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(blocks)
    }

    pub fn count_blocks(&self) -> ChainResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM blocks", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn chain_stats(&self) -> ChainResult<ChainStats> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(verified), 0), AVG(mining_duration_ms), \
             COALESCE(SUM(data_size), 0), MAX(block_number) FROM blocks",
            [],
            |row| {
                let total: i64 = row.get(0)?;
                let verified: i64 = row.get(1)?;
                Ok(ChainStats {
                    total_blocks: total as u64,
                    verified_blocks: verified as u64,
                    pending_blocks: (total - verified) as u64,
                    avg_mining_time_ms: row.get(2)?,
                    total_data_bytes: row.get::<_, i64>(3)? as u64,
                    latest_block_number: row.get::<_, Option<i64>>(4)?.map(|n| n as u64),
                })
            },
        )
        .map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Creators
    // ------------------------------------------------------------------

    pub fn insert_creator(&self, creator: &Creator) -> ChainResult<()> {
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO creators (creator_id, display_name, public_key_pem, key_bits, \
             active, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                creator.creator_id.to_string(),
                creator.display_name,
                creator.public_key_pem,
                creator.key_bits,
                creator.active,
                creator.created_at.to_rfc3339()
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(err) => match constraint_detail(&err) {
                Some(detail) if detail.contains("display_name") => Err(ChainError::Conflict(
                    format!("display name '{}' is already registered", creator.display_name),
                )),
                Some(detail) => Err(ChainError::Validation(detail)),
                None => Err(err.into()),
            },
        }
    }

    pub fn creator_by_display_name(&self, display_name: &str) -> ChainResult<Option<Creator>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT creator_id, display_name, public_key_pem, key_bits, active, created_at \
             FROM creators WHERE display_name = ?1 AND active = 1",
            params![display_name],
            creator_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn creator_by_id(&self, creator_id: Uuid) -> ChainResult<Option<Creator>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT creator_id, display_name, public_key_pem, key_bits, active, created_at \
             FROM creators WHERE creator_id = ?1 AND active = 1",
            params![creator_id.to_string()],
            creator_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_creators(&self) -> ChainResult<Vec<CreatorSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT c.creator_id, c.display_name, c.key_bits, c.created_at, \
             COUNT(b.block_id) FROM creators c \
             LEFT JOIN blocks b ON b.creator_id = c.creator_id \
             WHERE c.active = 1 GROUP BY c.creator_id ORDER BY c.display_name ASC",
        )?;
        let creators = stmt
            .query_map([], |row| {
                Ok(CreatorSummary {
                    creator_id: parse_uuid(row, 0)?,
                    display_name: row.get(1)?,
                    key_size: row.get(2)?,
                    key_algorithm: "RSA",
                    created_at: parse_timestamp(row, 3)?,
                    block_count: row.get::<_, i64>(4)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(creators)
    }

    pub fn creator_stats(&self) -> ChainResult<CreatorStats> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(active), 0), AVG(key_bits) FROM creators",
            [],
            |row| {
                Ok(CreatorStats {
                    total_creators: row.get::<_, i64>(0)? as u64,
                    active_creators: row.get::<_, i64>(1)? as u64,
                    avg_key_size: row.get(2)?,
                })
            },
        )
        .map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------

    pub fn audit_events_for_block(&self, block_id: Uuid) -> ChainResult<Vec<(String, Option<String>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT event_type, detail FROM audit_events WHERE block_id = ?1 \
             ORDER BY event_id ASC",
        )?;
        let events = stmt
            .query_map(params![block_id.to_string()], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn insert_block_tx(tx: &Transaction<'_>, block: &Block) -> Result<(), rusqlite::Error> {
        tx.execute(
            "INSERT INTO blocks (block_id, block_number, creator_id, previous_hash, \
             block_hash, nonce, difficulty, encrypted_data, data_iv, encrypted_data_key, \
             data_size, signature, created_at, verified, verified_at, mining_duration_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                block.block_id.to_string(),
                block.block_number as i64,
                block.creator_id.to_string(),
                block.previous_hash,
                block.block_hash,
                block.nonce.to_string(),
                block.difficulty,
                block.encrypted_data,
                block.data_iv,
                block.encrypted_data_key,
                block.data_size as i64,
                block.signature,
                block.created_at,
                block.verified,
                block.verified_at.map(|at| at.to_rfc3339()),
                block.mining_duration_ms.map(|ms| ms as i64),
            ],
        )?;
        Ok(())
    }

    fn block_by_hash_tx(
        tx: &Transaction<'_>,
        block_hash: &str,
    ) -> Result<Option<Block>, rusqlite::Error> {
        tx.query_row(
            &format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE block_hash = ?1"),
            params![block_hash],
            block_from_row,
        )
        .optional()
    }

    fn block_by_hash_conn(
        conn: &Connection,
        block_hash: &str,
    ) -> ChainResult<Option<Block>> {
        conn.query_row(
            &format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE block_hash = ?1"),
            params![block_hash],
            block_from_row,
        )
        .optional()
        .map_err(Into::into)
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
        }
    }
}

pub(crate) fn constraint_detail(err: &rusqlite::Error) -> Option<String> {
    match err {
        rusqlite::Error::SqliteFailure(inner, message)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Some(
                message
                    .clone()
                    .unwrap_or_else(|| "constraint violation".to_string()),
            )
        }
        _ => None,
    }
}

fn creator_from_row(row: &Row<'_>) -> Result<Creator, rusqlite::Error> {
    Ok(Creator {
        creator_id: parse_uuid(row, 0)?,
        display_name: row.get(1)?,
        public_key_pem: row.get(2)?,
        key_bits: row.get(3)?,
        active: row.get(4)?,
        created_at: parse_timestamp(row, 5)?,
    })
}

fn parse_uuid(row: &Row<'_>, idx: usize) -> Result<Uuid, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn parse_timestamp(row: &Row<'_>, idx: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn block_from_row(row: &Row<'_>) -> Result<Block, rusqlite::Error> {
    let nonce_raw: String = row.get(5)?;
    let nonce = nonce_raw.parse::<u64>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(err))
    })?;
    let verified_at: Option<String> = row.get(14)?;
    let verified_at = verified_at
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|at| at.with_timezone(&Utc))
                .map_err(|err| {
                    rusqlite::Error::FromSqlConversionFailure(14, Type::Text, Box::new(err))
                })
        })
        .transpose()?;
    Ok(Block {
        block_id: parse_uuid(row, 0)?,
        block_number: row.get::<_, i64>(1)? as u64,
        creator_id: parse_uuid(row, 2)?,
        previous_hash: row.get(3)?,
        block_hash: row.get(4)?,
        nonce,
        difficulty: row.get(6)?,
        encrypted_data: row.get(7)?,
        data_iv: row.get(8)?,
        encrypted_data_key: row.get(9)?,
        data_size: row.get::<_, i64>(10)? as u64,
        signature: row.get(11)?,
        created_at: row.get(12)?,
        verified: row.get(13)?,
        verified_at,
        mining_duration_ms: row.get::<_, Option<i64>>(15)?.map(|ms| ms as u64),
    })
}
