use std::net::SocketAddr;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

use crate::errors::{ChainError, ChainResult, CommitError};
use crate::miner::{CommitPayload, MiningPreparation};
use crate::node::{HealthReport, NodeHandle};
use crate::storage::BlockSort;
use crate::types::{Block, ChainStats, CreatorStats, CreatorSummary};

#[derive(Clone)]
struct AppState {
    node: NodeHandle,
}

pub async fn serve(node: NodeHandle, addr: SocketAddr) -> ChainResult<()> {
    let state = AppState { node };
    let router = Router::new()
        .route("/health", get(health))
        .route("/creators", get(list_creators).post(register_creator))
        .route("/creators/stats/summary", get(creator_stats))
        .route("/creators/:display_name/public-key", get(creator_public_key))
        .route("/blocks", get(list_blocks))
        .route("/blocks/prepare-mining", post(prepare_mining))
        .route("/blocks/commit", post(commit_block))
        .route("/blocks/stats/summary", get(chain_stats))
        .route("/decrypt/blocks/:creator_id", get(decrypt_envelopes))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!(?addr, "API server listening");
    axum::serve(listener, router)
        .await
        .map_err(|err| ChainError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))
}

// ---------------------------------------------------------------------
// Creators
// ---------------------------------------------------------------------

#[derive(Serialize)]
struct CreatorsResponse {
    creators: Vec<CreatorSummary>,
}

async fn list_creators(
    State(state): State<AppState>,
) -> Result<Json<CreatorsResponse>, ApiError> {
    state
        .node
        .list_creators()
        .map(|creators| Json(CreatorsResponse { creators }))
        .map_err(to_http_error)
}

#[derive(Deserialize)]
struct RegisterCreatorRequest {
    display_name: String,
    public_key_pem: String,
}

async fn register_creator(
    State(state): State<AppState>,
    Json(request): Json<RegisterCreatorRequest>,
) -> Result<(StatusCode, Json<CreatorSummary>), ApiError> {
    state
        .node
        .register_creator(&request.display_name, &request.public_key_pem)
        .map(|creator| (StatusCode::CREATED, Json(creator)))
        .map_err(to_http_error)
}

#[derive(Serialize)]
struct PublicKeyResponse {
    creator_id: Uuid,
    public_key_pem: String,
}

async fn creator_public_key(
    State(state): State<AppState>,
    Path(display_name): Path<String>,
) -> Result<Json<PublicKeyResponse>, ApiError> {
    state
        .node
        .creator_public_key(&display_name)
        .map(|(creator_id, public_key_pem)| {
            Json(PublicKeyResponse {
                creator_id,
                public_key_pem,
            })
        })
        .map_err(to_http_error)
}

#[derive(Serialize)]
struct CreatorStatsResponse {
    stats: CreatorStats,
}

async fn creator_stats(
    State(state): State<AppState>,
) -> Result<Json<CreatorStatsResponse>, ApiError> {
    state
        .node
        .creator_stats()
        .map(|stats| Json(CreatorStatsResponse { stats }))
        .map_err(to_http_error)
}

// ---------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------

#[derive(Deserialize)]
struct BlocksQuery {
    page: Option<u64>,
    limit: Option<u64>,
    verified: Option<String>,
    #[serde(rename = "sortBy")]
    sort_by: Option<String>,
}

#[derive(Serialize)]
struct Pagination {
    page: u64,
    limit: u64,
    total_blocks: u64,
    total_pages: u64,
}

#[derive(Serialize)]
struct BlocksResponse {
    blocks: Vec<Block>,
    pagination: Pagination,
}

async fn list_blocks(
    State(state): State<AppState>,
    Query(query): Query<BlocksQuery>,
) -> Result<Json<BlocksResponse>, ApiError> {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let verified = match query.verified.as_deref() {
        None | Some("all") => None,
        Some("true") => Some(true),
        Some("false") => Some(false),
        Some(other) => {
            return Err(to_http_error(ChainError::Validation(format!(
                "unsupported verified filter '{other}'"
            ))))
        }
    };
    let sort = match query.sort_by.as_deref() {
        None | Some("newest") => BlockSort::Newest,
        Some("oldest") => BlockSort::Oldest,
        Some("block_number") => BlockSort::BlockNumber,
        Some(other) => {
            return Err(to_http_error(ChainError::Validation(format!(
                "unsupported sort order '{other}'"
            ))))
        }
    };
    state
        .node
        .paginated_blocks(page, limit, verified, sort)
        .map(|(blocks, total_blocks)| {
            let total_pages = total_blocks.div_ceil(limit);
            Json(BlocksResponse {
                blocks,
                pagination: Pagination {
                    page,
                    limit,
                    total_blocks,
                    total_pages,
                },
            })
        })
        .map_err(to_http_error)
}

#[derive(Deserialize)]
struct PrepareMiningRequest {
    display_name: String,
    data_text: String,
}

async fn prepare_mining(
    State(state): State<AppState>,
    Json(request): Json<PrepareMiningRequest>,
) -> Result<Json<MiningPreparation>, ApiError> {
    state
        .node
        .prepare_mining(&request.display_name, request.data_text.len())
        .map(Json)
        .map_err(to_http_error)
}

#[derive(Serialize)]
struct CommitResponse {
    status: &'static str,
    block: Block,
}

async fn commit_block(
    State(state): State<AppState>,
    Json(payload): Json<CommitPayload>,
) -> Result<(StatusCode, Json<CommitResponse>), ApiError> {
    state
        .node
        .commit_block(&payload)
        .map(|outcome| {
            let status = if outcome.inserted {
                (StatusCode::CREATED, "committed")
            } else {
                (StatusCode::OK, "duplicate")
            };
            (
                status.0,
                Json(CommitResponse {
                    status: status.1,
                    block: outcome.block,
                }),
            )
        })
        .map_err(to_http_error)
}

#[derive(Serialize)]
struct ChainStatsResponse {
    stats: ChainStats,
}

async fn chain_stats(
    State(state): State<AppState>,
) -> Result<Json<ChainStatsResponse>, ApiError> {
    state
        .node
        .chain_stats()
        .map(|stats| Json(ChainStatsResponse { stats }))
        .map_err(to_http_error)
}

// ---------------------------------------------------------------------
// Decrypt envelopes
// ---------------------------------------------------------------------

/// The minimal fields a key holder needs to decrypt offline; payloads are
/// base64 on this path.
#[derive(Serialize)]
struct BlockEnvelope {
    block_id: Uuid,
    block_number: u64,
    block_hash: String,
    created_at: String,
    encrypted_data: String,
    data_iv: String,
    encrypted_data_key: String,
    data_size: u64,
    verified: bool,
}

#[derive(Serialize)]
struct EnvelopesResponse {
    creator_id: Uuid,
    blocks: Vec<BlockEnvelope>,
}

async fn decrypt_envelopes(
    State(state): State<AppState>,
    Path(creator_id): Path<Uuid>,
) -> Result<Json<EnvelopesResponse>, ApiError> {
    state
        .node
        .blocks_for_creator(creator_id)
        .map(|blocks| {
            let blocks = blocks
                .into_iter()
                .map(|block| BlockEnvelope {
                    block_id: block.block_id,
                    block_number: block.block_number,
                    block_hash: block.block_hash,
                    created_at: block.created_at,
                    encrypted_data: BASE64.encode(&block.encrypted_data),
                    data_iv: BASE64.encode(&block.data_iv),
                    encrypted_data_key: BASE64.encode(&block.encrypted_data_key),
                    data_size: block.data_size,
                    verified: block.verified,
                })
                .collect();
            Json(EnvelopesResponse { creator_id, blocks })
        })
        .map_err(to_http_error)
}

// ---------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Result<Json<HealthReport>, ApiError> {
    state.node.health().map(Json).map_err(to_http_error)
}

// ---------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------

type ApiError = (StatusCode, Json<ErrorBody>);

#[derive(Serialize)]
struct ErrorBody {
    status: &'static str,
    message: String,
    code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    timestamp: DateTime<Utc>,
}

fn to_http_error(err: ChainError) -> ApiError {
    let (status, code, details) = match &err {
        ChainError::Validation(_) => (StatusCode::BAD_REQUEST, "validation".to_string(), None),
        ChainError::Crypto(_) => (StatusCode::BAD_REQUEST, "crypto".to_string(), None),
        ChainError::NotFound(what) => (
            StatusCode::NOT_FOUND,
            "not-found".to_string(),
            Some(what.clone()),
        ),
        ChainError::Conflict(_) => (StatusCode::CONFLICT, "conflict".to_string(), None),
        ChainError::Config(_) => (StatusCode::BAD_REQUEST, "validation".to_string(), None),
        ChainError::Commit(commit) => {
            let status = match commit {
                CommitError::CreatorMissing => StatusCode::NOT_FOUND,
                _ => StatusCode::BAD_REQUEST,
            };
            (status, commit.code().to_string(), None)
        }
        ChainError::Storage(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "database".to_string(),
            None,
        ),
        ChainError::Serialization(_) | ChainError::Io(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal".to_string(),
            None,
        ),
    };
    let body = ErrorBody {
        status: if status.is_server_error() {
            "error"
        } else {
            "fail"
        },
        message: err.to_string(),
        code,
        details,
        timestamp: Utc::now(),
    };
    (status, Json(body))
}
