use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::chain::Chain;
use crate::errors::ChainResult;
use crate::miner::validate_incoming_block;
use crate::types::{AppendOutcome, Block, ReplaceOutcome};

/// Full chains travel in a single frame.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;
const RECONNECT_DELAY: Duration = Duration::from_secs(15);

/// Peer wire messages, framed JSON. A full `CHAIN` is exchanged when a
/// connection opens in either direction; `BLOCK` carries single-block
/// gossip.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PeerMessage {
    #[serde(rename = "CHAIN")]
    Chain { chain: Vec<Block> },
    #[serde(rename = "BLOCK")]
    Block { block: Block },
}

/// The gossip fabric: one acceptor, one task per connection, and a shared
/// peer set used for broadcast. Send failures drop the peer; convergence is
/// re-established by the chain exchange on reconnect.
pub struct Gossip {
    chain: Chain,
    peers: Mutex<HashMap<u64, mpsc::UnboundedSender<PeerMessage>>>,
    next_peer_id: AtomicU64,
}

impl Gossip {
    pub fn new(chain: Chain) -> Arc<Self> {
        Arc::new(Self {
            chain,
            peers: Mutex::new(HashMap::new()),
            next_peer_id: AtomicU64::new(1),
        })
    }

    /// Binds the gossip listener and spawns the accept loop. Returns the
    /// bound address so callers can listen on an ephemeral port.
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> ChainResult<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "gossip listening");
        let gossip = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        debug!(%peer_addr, "peer connected");
                        let gossip = gossip.clone();
                        tokio::spawn(gossip.handle_connection(stream, peer_addr));
                    }
                    Err(err) => {
                        warn!(?err, "gossip accept failed");
                    }
                }
            }
        });
        Ok(local_addr)
    }

    /// Dials a configured peer and keeps redialing after disconnects; the
    /// chain exchange on every fresh connection is what converges nodes
    /// that drifted while apart.
    pub fn connect_loop(self: &Arc<Self>, endpoint: String) {
        let gossip = self.clone();
        tokio::spawn(async move {
            loop {
                match TcpStream::connect(&endpoint).await {
                    Ok(stream) => {
                        let peer_addr = stream
                            .peer_addr()
                            .unwrap_or_else(|_| ([0, 0, 0, 0], 0).into());
                        info!(%endpoint, "connected to peer");
                        gossip.clone().handle_connection(stream, peer_addr).await;
                        warn!(%endpoint, "peer connection closed");
                    }
                    Err(err) => {
                        debug!(%endpoint, ?err, "peer dial failed");
                    }
                }
                time::sleep(RECONNECT_DELAY).await;
            }
        });
    }

    /// Pushes a locally committed block to every connected peer.
    pub fn broadcast_block(&self, block: &Block) {
        self.broadcast_except(
            None,
            PeerMessage::Block {
                block: block.clone(),
            },
        );
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    fn broadcast_except(&self, skip: Option<u64>, message: PeerMessage) {
        let mut peers = self.peers.lock();
        peers.retain(|peer_id, sender| {
            if Some(*peer_id) == skip {
                return true;
            }
            sender.send(message.clone()).is_ok()
        });
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_BYTES)
            .new_codec();
        let mut framed = Framed::new(stream, codec);

        let (sender, mut outbound) = mpsc::unbounded_channel();
        let peer_id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        self.peers.lock().insert(peer_id, sender);

        // Both sides open with their full chain.
        let opening = PeerMessage::Chain {
            chain: self.chain.snapshot(),
        };
        if send_message(&mut framed, &opening).await.is_err() {
            self.peers.lock().remove(&peer_id);
            return;
        }

        loop {
            tokio::select! {
                queued = outbound.recv() => match queued {
                    Some(message) => {
                        if let Err(err) = send_message(&mut framed, &message).await {
                            warn!(%peer_addr, ?err, "peer send failed");
                            break;
                        }
                    }
                    None => break,
                },
                frame = framed.next() => match frame {
                    Some(Ok(bytes)) => match serde_json::from_slice::<PeerMessage>(&bytes) {
                        Ok(message) => self.handle_message(message, peer_id, peer_addr),
                        Err(err) => {
                            warn!(%peer_addr, ?err, "undecodable peer frame");
                        }
                    },
                    Some(Err(err)) => {
                        warn!(%peer_addr, ?err, "peer read failed");
                        break;
                    }
                    None => break,
                },
            }
        }

        self.peers.lock().remove(&peer_id);
        debug!(%peer_addr, "peer disconnected");
    }

    fn handle_message(&self, message: PeerMessage, peer_id: u64, peer_addr: SocketAddr) {
        match message {
            PeerMessage::Block { block } => {
                if let Err(reason) = validate_incoming_block(self.chain.storage(), &block) {
                    warn!(%peer_addr, %reason, "dropping gossiped block");
                    return;
                }
                match self.chain.append(&block) {
                    Ok(AppendOutcome::Inserted(block)) => {
                        info!(
                            block_number = block.block_number,
                            %peer_addr,
                            "appended gossiped block"
                        );
                        self.broadcast_except(Some(peer_id), PeerMessage::Block { block });
                    }
                    Ok(AppendOutcome::Duplicate(_)) => {
                        debug!(%peer_addr, "gossiped block already present");
                    }
                    Ok(AppendOutcome::Rejected(reject)) => {
                        // A block this node cannot extend with; the periodic
                        // chain exchange settles the divergence.
                        debug!(%peer_addr, reason = %reject.detail(), "gossiped block not appended");
                    }
                    Err(err) => {
                        warn!(%peer_addr, ?err, "gossiped block append failed");
                    }
                }
            }
            PeerMessage::Chain { chain } => match self.chain.replace_chain(chain) {
                Ok(ReplaceOutcome::Accepted { height }) => {
                    info!(%peer_addr, height, "adopted longer peer chain");
                }
                Ok(ReplaceOutcome::Rejected(reason)) => {
                    debug!(%peer_addr, %reason, "kept local chain");
                }
                Err(err) => {
                    warn!(%peer_addr, ?err, "chain replacement failed");
                }
            },
        }
    }
}

async fn send_message(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    message: &PeerMessage,
) -> std::io::Result<()> {
    let encoded = serde_json::to_vec(message)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    framed.send(Bytes::from(encoded)).await
}
