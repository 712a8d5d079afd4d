//! TCP transport for gossip messages
//!
//! One reader task and one writer task per connection. Inbound frames go to
//! the [`GossipRouter`]; the [`PeerHub`] fans the outbound queue out to the
//! connections' writers.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{FrameError, GossipRouter, Message, Outbound, PeerId, PeerManager, Target, MAX_MESSAGE_SIZE};
use crate::constants::PROTOCOL_VERSION;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Read one framed message
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, magic: [u8; 4]) -> Result<Message, TransportError> {
    let mut header = [0u8; 8];
    reader.read_exact(&mut header).await?;
    if header[0..4] != magic {
        return Err(FrameError::BadMagic.into());
    }
    let length = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if length > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge(length).into());
    }

    let mut frame = vec![0u8; 8 + length];
    frame[..8].copy_from_slice(&header);
    reader.read_exact(&mut frame[8..]).await?;
    Ok(Message::from_bytes(&frame, magic)?)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
    magic: [u8; 4],
) -> Result<(), TransportError> {
    writer.write_all(&message.to_bytes(magic)).await?;
    writer.flush().await?;
    Ok(())
}

/// Writers of the live connections, by peer id
#[derive(Debug, Default)]
pub struct PeerHub {
    writers: Mutex<HashMap<u64, mpsc::UnboundedSender<Message>>>,
}

impl PeerHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, peer: &PeerId) -> mpsc::UnboundedReceiver<Message> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.writers.lock().insert(peer.id, sender);
        receiver
    }

    pub fn unregister(&self, peer: &PeerId) {
        self.writers.lock().remove(&peer.id);
    }

    pub fn len(&self) -> usize {
        self.writers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand a queued message to its connection(s)
    pub fn dispatch(&self, outbound: Outbound) {
        let writers = self.writers.lock();
        match outbound.target {
            Target::Peer(peer) => {
                if let Some(writer) = writers.get(&peer.id) {
                    let _ = writer.send(outbound.message);
                }
            }
            Target::All => {
                for writer in writers.values() {
                    let _ = writer.send(outbound.message.clone());
                }
            }
        }
    }
}

/// Drain the outbound queue into the hub until the queue closes
pub async fn run_dispatcher(mut queue: mpsc::UnboundedReceiver<Outbound>, hub: Arc<PeerHub>) {
    while let Some(outbound) = queue.recv().await {
        hub.dispatch(outbound);
    }
}

/// Shared state of all connections
pub struct Transport {
    magic: [u8; 4],
    router: Arc<GossipRouter>,
    peers: Arc<Mutex<PeerManager>>,
    hub: Arc<PeerHub>,
    next_id: AtomicU64,
}

impl Transport {
    pub fn new(
        magic: [u8; 4],
        router: Arc<GossipRouter>,
        peers: Arc<Mutex<PeerManager>>,
        hub: Arc<PeerHub>,
    ) -> Self {
        Self {
            magic,
            router,
            peers,
            hub,
            next_id: AtomicU64::new(1),
        }
    }

    /// Accept connections until shutdown
    pub async fn listen(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tokio::spawn(Arc::clone(&self).run_connection(stream, addr, shutdown.clone()));
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Open an outbound connection and serve it in the background
    pub async fn connect(self: Arc<Self>, addr: SocketAddr, shutdown: watch::Receiver<bool>) -> Result<(), TransportError> {
        let stream = TcpStream::connect(addr).await?;
        tokio::spawn(self.run_connection(stream, addr, shutdown));
        Ok(())
    }

    async fn run_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr, mut shutdown: watch::Receiver<bool>) {
        let peer = PeerId::new(self.next_id.fetch_add(1, Ordering::SeqCst), addr);
        if self.peers.lock().is_ip_banned(peer.ip()) {
            debug!("Refusing banned peer {}", peer);
            return;
        }
        self.peers.lock().peer_connected(peer, PROTOCOL_VERSION);
        info!("Peer connected: {}", peer);

        let (mut reader, mut writer) = stream.into_split();
        let mut outgoing = self.hub.register(&peer);
        let magic = self.magic;
        let writer_task = tokio::spawn(async move {
            while let Some(message) = outgoing.recv().await {
                if let Err(e) = write_frame(&mut writer, &message, magic).await {
                    debug!("Write failed: {}", e);
                    break;
                }
            }
        });

        self.router.peer_connected(&peer);

        loop {
            let message = tokio::select! {
                read = read_frame(&mut reader, self.magic) => match read {
                    Ok(message) => message,
                    Err(e) => {
                        debug!("Dropping {}: {}", peer, e);
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            };

            // Errors were already charged to the peer by the handler
            let _ = self.router.process_message(&peer, message);
            if self.peers.lock().is_banned(&peer) {
                break;
            }
        }

        self.hub.unregister(&peer);
        writer_task.abort();
        self.peers.lock().peer_disconnected(&peer);
        info!("Peer disconnected: {}", peer);
    }
}
