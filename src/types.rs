use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Sentinel standing in for the previous hash of the genesis block wherever
/// the canonical hash input needs a value.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

pub const BLOCK_HASH_LEN: usize = 64;
pub const DATA_IV_LEN: usize = 16;
/// AES-256-GCM ciphertexts always carry the 16-byte auth tag.
pub const MIN_ENCRYPTED_DATA_LEN: usize = 16;
/// Allowed drift between the declared `data_size` and the measured sum of
/// ciphertext, IV and wrapped-key lengths.
pub const DATA_SIZE_TOLERANCE: u64 = 128;

/// Hex transport for raw byte columns: HTTP and gossip carry lowercase hex,
/// the store and the core hold raw bytes.
pub(crate) mod serde_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw.trim()).map_err(serde::de::Error::custom)
    }
}

/// One sealed record in the chain. Immutable once appended, except for the
/// `(verified, verified_at)` pair owned by the verifier.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub block_id: Uuid,
    pub block_number: u64,
    pub creator_id: Uuid,
    pub previous_hash: Option<String>,
    pub block_hash: String,
    pub nonce: u64,
    pub difficulty: u32,
    #[serde(with = "serde_hex")]
    pub encrypted_data: Vec<u8>,
    #[serde(with = "serde_hex")]
    pub data_iv: Vec<u8>,
    #[serde(with = "serde_hex")]
    pub encrypted_data_key: Vec<u8>,
    pub data_size: u64,
    #[serde(with = "serde_hex")]
    pub signature: Vec<u8>,
    /// The RFC-3339 string exactly as the client produced it. The canonical
    /// hash input reuses it byte-for-byte, so it is never re-rendered.
    pub created_at: String,
    pub verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub mining_duration_ms: Option<u64>,
}

impl Block {
    /// The pipe-delimited ASCII pre-image of `block_hash`.
    pub fn hash_input(&self) -> String {
        canonical_hash_input(
            self.previous_hash.as_deref(),
            &self.encrypted_data,
            &self.data_iv,
            &self.encrypted_data_key,
            self.nonce,
            &self.created_at,
            Some(self.creator_id),
            self.difficulty,
        )
    }

    pub fn compute_hash(&self) -> String {
        sha256_hex(self.hash_input().as_bytes())
    }

    pub fn meets_difficulty(&self) -> bool {
        hash_meets_difficulty(&self.block_hash, self.difficulty)
    }
}

/// Builds the canonical hash input: previous hash (or the genesis sentinel),
/// lowercase hex of the three byte fields, decimal nonce, the literal
/// creation timestamp, the creator id's textual form (empty when absent) and
/// the decimal difficulty, joined with `|`.
#[allow(clippy::too_many_arguments)]
pub fn canonical_hash_input(
    previous_hash: Option<&str>,
    encrypted_data: &[u8],
    data_iv: &[u8],
    encrypted_data_key: &[u8],
    nonce: u64,
    created_at: &str,
    creator_id: Option<Uuid>,
    difficulty: u32,
) -> String {
    let creator = creator_id.map(|id| id.to_string()).unwrap_or_default();
    format!(
        "{}|{}|{}|{}|{}|{}|{}|{}",
        previous_hash.unwrap_or(GENESIS_HASH),
        hex::encode(encrypted_data),
        hex::encode(data_iv),
        hex::encode(encrypted_data_key),
        nonce,
        created_at,
        creator,
        difficulty,
    )
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Proof-of-work predicate: a 64-char lowercase hex digest with at least
/// `difficulty` leading `'0'` digits.
pub fn hash_meets_difficulty(block_hash: &str, difficulty: u32) -> bool {
    block_hash.len() == BLOCK_HASH_LEN
        && block_hash.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        && block_hash.bytes().take(difficulty as usize).all(|b| b == b'0')
}

/// A registered signer. Read-only to the chain core.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Creator {
    pub creator_id: Uuid,
    pub display_name: String,
    pub public_key_pem: String,
    pub key_bits: u32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a single append through the chain store.
#[derive(Clone, Debug)]
pub enum AppendOutcome {
    Inserted(Block),
    Duplicate(Block),
    Rejected(AppendReject),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppendReject {
    /// The candidate's previous hash no longer matches the tip.
    TipMoved,
    /// Genesis shape violation: null previous hash above height one, or a
    /// non-null previous hash at height one.
    GenesisShape,
    /// A store constraint fired; carries the constraint detail.
    Constraint(String),
}

impl AppendReject {
    pub fn detail(&self) -> String {
        match self {
            AppendReject::TipMoved => "previous hash does not match the current tip".to_string(),
            AppendReject::GenesisShape => "genesis shape violation".to_string(),
            AppendReject::Constraint(name) => name.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplaceOutcome {
    Accepted { height: u64 },
    Rejected(String),
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ChainStats {
    pub total_blocks: u64,
    pub verified_blocks: u64,
    pub pending_blocks: u64,
    pub avg_mining_time_ms: Option<f64>,
    pub total_data_bytes: u64,
    pub latest_block_number: Option<u64>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct CreatorStats {
    pub total_creators: u64,
    pub active_creators: u64,
    pub avg_key_size: Option<f64>,
}

/// Creator listing row, including how many blocks the creator has sealed.
#[derive(Clone, Debug, Serialize)]
pub struct CreatorSummary {
    pub creator_id: Uuid,
    pub display_name: String,
    pub key_size: u32,
    pub key_algorithm: &'static str,
    pub created_at: DateTime<Utc>,
    pub block_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_input_uses_sentinel_and_empty_creator() {
        let input = canonical_hash_input(None, &[0xab], &[0x01], &[0x02], 7, "2026-01-01T00:00:00Z", None, 4);
        assert_eq!(
            input,
            format!("{GENESIS_HASH}|ab|01|02|7|2026-01-01T00:00:00Z||4")
        );
    }

    #[test]
    fn canonical_input_is_stable_for_known_creator() {
        let creator = Uuid::parse_str("6c0efb7d-9c32-4f0e-8c6a-0a54eb2b9f3b").unwrap();
        let input = canonical_hash_input(
            Some("ff00"),
            &[0x10, 0x20],
            &[0x30],
            &[0x40],
            42,
            "2026-02-03T04:05:06.789Z",
            Some(creator),
            2,
        );
        assert_eq!(
            input,
            "ff00|1020|30|40|42|2026-02-03T04:05:06.789Z|6c0efb7d-9c32-4f0e-8c6a-0a54eb2b9f3b|2"
        );
    }

    #[test]
    fn difficulty_predicate_checks_prefix_and_shape() {
        let hash = format!("0000{}", "a".repeat(60));
        assert!(hash_meets_difficulty(&hash, 4));
        assert!(!hash_meets_difficulty(&hash, 5));
        assert!(!hash_meets_difficulty(&hash[..63], 4));
        let upper = format!("0000{}", "A".repeat(60));
        assert!(!hash_meets_difficulty(&upper, 4));
    }

    #[test]
    fn block_bytes_round_trip_as_hex() {
        let block = Block {
            block_id: Uuid::new_v4(),
            block_number: 1,
            creator_id: Uuid::new_v4(),
            previous_hash: None,
            block_hash: GENESIS_HASH.to_string(),
            nonce: 3,
            difficulty: 1,
            encrypted_data: vec![1, 2, 3],
            data_iv: vec![4; 16],
            encrypted_data_key: vec![5; 4],
            data_size: 23,
            signature: vec![6; 8],
            created_at: "2026-01-01T00:00:00Z".to_string(),
            verified: false,
            verified_at: None,
            mining_duration_ms: Some(12),
        };
        let encoded = serde_json::to_value(&block).unwrap();
        assert_eq!(encoded["encrypted_data"], "010203");
        let decoded: Block = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.encrypted_data, block.encrypted_data);
        assert_eq!(decoded.created_at, block.created_at);
    }
}
