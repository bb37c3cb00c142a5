//! # Download Worker
//!
//! One worker runs per discovered peer, in its own thread, and owns that
//! peer's connection for its whole life.
//!
//! ## Download Process
//!
//! 1. **Connection**: TCP connect and BitTorrent handshake
//! 2. **Bitfield**: learn which pieces the peer has
//! 3. **Unchoke + Interested**: ask the peer to serve requests
//! 4. **Work loop**: take piece assignments from the work queue, download
//!    with up to 5 pipelined block requests, verify SHA-1, report back
//!
//! ## Event reporting
//!
//! Workers never write to the work queue. Every outcome goes to the
//! coordinator on the event channel:
//!
//! - `Verified` - a piece downloaded and hash-checked
//! - `Skipped` - the peer's bitfield does not advertise the piece; the
//!   coordinator re-queues it for someone else
//! - `Failed` - download or verification failed; the coordinator re-queues
//!   and keeps count
//! - `Exited` - the worker is gone, whatever the reason
//!
//! Keeping the work-queue sender out of the workers means closing the queue
//! is a real shutdown signal: when the coordinator drops its sender, every
//! worker blocked on the queue wakes up disconnected and exits.
//!
//! ## Error Handling
//!
//! A verification failure is recoverable: the peer stays connected and the
//! piece is retried elsewhere (or here, later). An I/O failure mid-piece
//! leaves the stream in an unknown state, so the worker gives the piece back
//! and dies; remaining workers carry on.

use crate::client::*;
use crate::message::*;
use crate::peer::*;
use crate::piece::*;

use anyhow::{anyhow, Result};
use boring::sha::Sha1;
use crossbeam_channel::{Receiver, Sender};

use std::time::Instant;

// Maximum number of concurrent block requests per peer
const NB_REQUESTS_MAX: u32 = 5;

// Standard block size for piece downloads (16KB)
const BLOCK_SIZE_MAX: u32 = 16384;

/// Outcome of a worker's attempt at one piece, or of the worker itself.
#[derive(Debug)]
pub enum WorkerEvent {
    /// A piece downloaded and SHA-1 verified
    Verified(PieceResult),
    /// The peer does not advertise this piece, give it to someone else
    Skipped { peer: u32, work: PieceWork },
    /// Download or verification failed, the piece needs another attempt
    Failed { peer: u32, work: PieceWork },
    /// The worker terminated
    Exited { peer: u32 },
}

/// Manages downloading from a single BitTorrent peer.
pub struct Worker {
    /// Information about the remote peer (IP, port, ID)
    peer: Peer,
    /// 20-byte unique identifier for this client instance
    peer_id: Vec<u8>,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    info_hash: Vec<u8>,
    /// Queue of piece assignments, closed by the coordinator when done
    work_chan: Receiver<PieceWork>,
    /// Channel for reporting piece outcomes and worker exit
    event_chan: Sender<WorkerEvent>,
}

impl Worker {
    /// Creates a new worker for one peer.
    ///
    /// # Arguments
    ///
    /// * `peer` - Peer information including IP address and port.
    /// * `peer_id` - 20-byte unique identifier for this client.
    /// * `info_hash` - 20-byte SHA-1 hash of the torrent info dictionary.
    /// * `work_chan` - Receiving side of the piece work queue.
    /// * `event_chan` - Sending side of the worker event channel.
    ///
    pub fn new(
        peer: Peer,
        peer_id: Vec<u8>,
        info_hash: Vec<u8>,
        work_chan: Receiver<PieceWork>,
        event_chan: Sender<WorkerEvent>,
    ) -> Worker {
        Worker {
            peer,
            peer_id,
            info_hash,
            work_chan,
            event_chan,
        }
    }

    /// Run the worker until the work queue closes or the peer fails.
    ///
    /// Always announces the exit on the event channel, even when the peer
    /// could not be reached at all.
    pub fn start_download(&self) {
        if let Err(error) = self.run() {
            warn!("Worker for peer {:?} stopped: {}", self.peer.id, error);
        }

        // The coordinator may already be gone, announcing is best-effort
        let _ = self.event_chan.send(WorkerEvent::Exited {
            peer: self.peer.id,
        });
    }

    fn run(&self) -> Result<()> {
        // Connect and handshake with the remote peer
        let mut client = Client::new(
            self.peer.clone(),
            self.peer_id.clone(),
            self.info_hash.clone(),
        )?;
        client.handshake_with_peer()?;

        // The bitfield must come before anything else
        client.read_bitfield()?;

        // Ask the peer to serve our requests
        client.send_unchoke()?;
        client.send_interested()?;

        loop {
            // Receive a piece assignment from the work queue
            let piece_work: PieceWork = match self.work_chan.recv() {
                Ok(piece_work) => piece_work,
                Err(_) => {
                    info!(
                        "Worker for peer {:?} exiting: work queue closed",
                        self.peer.id
                    );
                    return Ok(());
                }
            };

            // Hand back pieces this peer does not have
            if !client.has_piece(piece_work.index) {
                self.send_event(WorkerEvent::Skipped {
                    peer: self.peer.id,
                    work: piece_work,
                })?;
                continue;
            }

            // Download piece
            let buffer = match self.download_piece(&mut client, &piece_work) {
                Ok(buffer) => buffer,
                Err(error) => {
                    // The stream is in an unknown state, give the piece back
                    // and stop serving from this peer
                    self.send_event(WorkerEvent::Failed {
                        peer: self.peer.id,
                        work: piece_work,
                    })?;
                    return Err(error);
                }
            };

            // Verify piece integrity
            if let Err(error) = verify_piece_integrity(&piece_work, &buffer) {
                warn!("Piece {:?} from peer {:?}: {}", piece_work.index, self.peer.id, error);
                self.send_event(WorkerEvent::Failed {
                    peer: self.peer.id,
                    work: piece_work,
                })?;
                continue;
            }

            info!(
                "Successfully verified integrity of piece {:?}",
                piece_work.index
            );

            // Notify peer that piece was downloaded
            if client.send_have(piece_work.index).is_err() {
                warn!("Could not notify peer {:?} of downloaded piece", self.peer.id);
            }

            // Send the verified piece to the coordinator
            let piece_result = PieceResult::new(piece_work.index, buffer);
            self.send_event(WorkerEvent::Verified(piece_result))?;
        }
    }

    fn send_event(&self, event: WorkerEvent) -> Result<()> {
        self.event_chan
            .send(event)
            .map_err(|_| anyhow!("could not send event to coordinator"))
    }

    /// Download a torrent piece.
    ///
    /// Keeps up to 5 block requests in flight and processes whatever the
    /// peer sends back. A single 3 second deadline covers every read of the
    /// piece.
    ///
    /// # Arguments
    ///
    /// * `client` - A client connected to a remote peer.
    /// * `piece_work` - The piece to download.
    ///
    fn download_piece(&self, client: &mut Client, piece_work: &PieceWork) -> Result<Vec<u8>> {
        let mut progress = PieceProgress::new(piece_work);
        let deadline = Instant::now() + PEER_TIMEOUT;

        while progress.downloaded < piece_work.length {
            // While unchoked, keep the request pipeline full
            if !client.is_choked() {
                while progress.backlog < NB_REQUESTS_MAX && progress.requested < piece_work.length
                {
                    // Get block size to request
                    let mut block_size = BLOCK_SIZE_MAX;
                    let remaining = piece_work.length - progress.requested;
                    if remaining < BLOCK_SIZE_MAX {
                        block_size = remaining;
                    }

                    // Send request for a block
                    client.send_request(piece_work.index, progress.requested, block_size)?;

                    progress.backlog += 1;
                    progress.requested += block_size;
                }
            }

            // Listen peer
            let message: Message = client.read_message_before(deadline)?;

            // Parse message
            match message.id {
                MESSAGE_CHOKE => {
                    client.read_choke();
                    warn!("Peer {:?} choked us, waiting for unchoke", self.peer.id);
                }
                MESSAGE_UNCHOKE => client.read_unchoke(),
                MESSAGE_HAVE => client.read_have(&message)?,
                MESSAGE_PIECE => client.read_piece(&message, &mut progress)?,
                MESSAGE_KEEPALIVE => {}
                id => info!("Ignoring message {:?} from peer {:?}", id, self.peer.id),
            }
        }

        info!("Successfully downloaded piece {:?}", piece_work.index);

        Ok(progress.buffer)
    }
}

/// Verify the integrity of a downloaded torrent piece.
fn verify_piece_integrity(piece_work: &PieceWork, buffer: &[u8]) -> Result<()> {
    // Hash piece data
    let mut hasher = Sha1::new();
    hasher.update(buffer);
    let hash = hasher.finish().to_vec();

    // Compare hashes
    if hash != piece_work.hash {
        return Err(anyhow!("piece hash does not match the metainfo"));
    }

    Ok(())
}
