//! # Torrent Management
//!
//! This module turns a `.torrent` file into a validated descriptor, discovers
//! peers through the announce tracker, and coordinates the download.
//!
//! ## Torrent File Format
//!
//! Torrent files are bencoded dictionaries:
//!
//! - **announce**: tracker URL for peer discovery
//! - **info**: dictionary describing the payload
//!   - **name**: suggested filename
//!   - **length**: total file size
//!   - **piece length**: size of each piece
//!   - **pieces**: concatenated 20-byte SHA-1 hashes, one per piece
//! - **comment**, **created by**, **creation date**: optional annotations
//!
//! The info-hash identifying the torrent on the network is the SHA-1 of the
//! `info` dictionary exactly as it appears in the file; the decoder keeps
//! that raw slice around so no re-encoding is involved.
//!
//! ## Download Coordination
//!
//! The coordinator owns two channels: a work queue holding one `PieceWork`
//! per piece, and an event stream on which workers report verified pieces,
//! skipped assignments, failures, and their own exit. Skipped and failed
//! pieces are re-queued here, with accounting that aborts the download once a
//! piece was skipped by every live worker or failed too often. Completed
//! pieces land at their offset in the output buffer, which only this thread
//! writes.
//!
//! Dropping the work sender is the shutdown signal: workers observe the
//! closed queue and terminate.

use crate::bencode;
use crate::peer::*;
use crate::piece::*;
use crate::worker::*;

use anyhow::{anyhow, Result};
use boring::sha::Sha1;
use crossbeam_channel::{unbounded, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use url::Url;

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

// Default port advertised to the tracker
const PORT: u16 = 6881;
// Size of SHA-1 hash in bytes
const SHA1_HASH_SIZE: usize = 20;
// Timeout for the tracker HTTP request
const TRACKER_TIMEOUT: Duration = Duration::from_secs(30);
// Download/verification failures tolerated per piece
const NB_PIECE_ATTEMPTS_MAX: u32 = 5;

/// A validated torrent descriptor and the download entry point.
///
/// Built once by [`Torrent::open`] and immutable afterwards.
#[derive(Default, Clone)]
pub struct Torrent {
    /// Tracker URL for peer discovery
    announce: String,
    /// Suggested filename from torrent metadata
    name: String,
    /// Free-form comment from torrent metadata
    comment: String,
    /// Author annotation from torrent metadata
    created_by: String,
    /// Creation timestamp from torrent metadata (unix seconds)
    creation_date: i64,
    /// 20-byte SHA-1 hash of the raw bencoded info dictionary
    info_hash: Vec<u8>,
    /// Vector of 20-byte SHA-1 hashes, one for each piece
    pieces_hashes: Vec<Vec<u8>>,
    /// Size of each piece in bytes (except possibly the last)
    piece_length: u32,
    /// Total size of the file in bytes
    length: u64,
}

impl Torrent {
    /// Build a new torrent.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the suggested filename from the torrent metadata.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open torrent.
    ///
    /// # Arguments
    ///
    /// * `filepath` - Path to the torrent.
    ///
    pub fn open(&mut self, filepath: PathBuf) -> Result<()> {
        // Open torrent
        let mut file = match File::open(filepath) {
            Ok(file) => file,
            Err(_) => return Err(anyhow!("could not open torrent")),
        };

        // Read torrent content in a buffer
        let mut buf = vec![];
        if file.read_to_end(&mut buf).is_err() {
            return Err(anyhow!("could not read torrent"));
        }

        self.parse_metainfo(&buf)
    }

    /// Validate a bencoded metainfo document into this descriptor.
    fn parse_metainfo(&mut self, buf: &[u8]) -> Result<()> {
        let value = bencode::decode(buf).map_err(|e| anyhow!("could not decode torrent: {}", e))?;
        let dict = value
            .as_dict()
            .ok_or_else(|| anyhow!("torrent is not a dictionary"))?;

        // Announce URL is required
        self.announce = dict
            .find(b"announce")
            .ok_or_else(|| anyhow!("torrent has no announce URL"))?
            .as_str()
            .ok_or_else(|| anyhow!("torrent announce URL is not a string"))?
            .to_string();

        // Optional annotations default to zero values, but when present they
        // must have the right type
        self.comment = match dict.find(b"comment") {
            Some(comment) => comment
                .as_str()
                .ok_or_else(|| anyhow!("torrent comment is not a string"))?
                .to_string(),
            None => String::new(),
        };
        self.created_by = match dict.find(b"created by") {
            Some(created_by) => created_by
                .as_str()
                .ok_or_else(|| anyhow!("torrent created by is not a string"))?
                .to_string(),
            None => String::new(),
        };
        self.creation_date = match dict.find(b"creation date") {
            Some(creation_date) => creation_date
                .as_integer()
                .ok_or_else(|| anyhow!("torrent creation date is not an integer"))?,
            None => 0,
        };

        // The info dictionary is required
        let info = dict
            .find(b"info")
            .ok_or_else(|| anyhow!("torrent has no info dictionary"))?;
        let info_dict = info
            .as_dict()
            .ok_or_else(|| anyhow!("torrent info is not a dictionary"))?;

        self.name = info_dict
            .find(b"name")
            .ok_or_else(|| anyhow!("torrent has no name"))?
            .as_str()
            .ok_or_else(|| anyhow!("torrent name is not a string"))?
            .to_string();

        let piece_length = info_dict
            .find(b"piece length")
            .ok_or_else(|| anyhow!("torrent has no piece length"))?
            .as_integer()
            .ok_or_else(|| anyhow!("torrent piece length is not an integer"))?;
        if piece_length <= 0 {
            return Err(anyhow!("torrent piece length is not positive"));
        }
        self.piece_length = u32::try_from(piece_length)
            .map_err(|_| anyhow!("torrent piece length is too large"))?;

        self.length = match info_dict.find(b"length") {
            Some(length) => length
                .as_u64()
                .ok_or_else(|| anyhow!("torrent length is not a non-negative integer"))?,
            None => 0,
        };

        let pieces = info_dict
            .find(b"pieces")
            .ok_or_else(|| anyhow!("torrent has no pieces"))?
            .as_bytes()
            .ok_or_else(|| anyhow!("torrent pieces is not a byte string"))?;
        self.pieces_hashes = split_pieces_hashes(pieces)?;

        // The piece table must cover the payload and the last piece must not
        // be empty
        let nb_pieces = self.pieces_hashes.len() as u64;
        let piece_length = self.piece_length as u64;
        if self.length > nb_pieces * piece_length
            || (nb_pieces > 0 && self.length <= (nb_pieces - 1) * piece_length)
        {
            return Err(anyhow!("torrent piece table does not match its length"));
        }

        // The info-hash is the SHA-1 of the info value exactly as it appears
        // in the file
        let mut hasher = Sha1::new();
        hasher.update(info.bytes);
        self.info_hash = hasher.finish().to_vec();

        if !self.comment.is_empty() {
            info!("Torrent comment: {:?}", self.comment);
        }
        debug!(
            "Torrent created by {:?} on {:?}",
            self.created_by, self.creation_date
        );

        Ok(())
    }

    /// Request peers from the tracker.
    ///
    /// # Arguments
    ///
    /// * `peer_id` - 20-byte string used as a unique ID for the client.
    /// * `port` - Port number that the client is listening on.
    ///
    fn request_peers(&self, peer_id: &[u8], port: u16) -> Result<Vec<Peer>> {
        // Build tracker URL
        let full_url =
            Torrent::build_tracker_url(&self.info_hash, &self.announce, peer_id, port, self.length)?;

        // Build blocking HTTP client
        let client = match reqwest::blocking::Client::builder()
            .timeout(TRACKER_TIMEOUT)
            .build()
        {
            Ok(client) => client,
            Err(_) => return Err(anyhow!("could not build tracker HTTP client")),
        };

        // Send GET request to the tracker
        let response = match client.get(&full_url).send() {
            Ok(response) => response,
            Err(_) => return Err(anyhow!("could not contact tracker")),
        };
        if !response.status().is_success() {
            return Err(anyhow!("tracker answered with status {}", response.status()));
        }
        let body = match response.bytes() {
            Ok(body) => body,
            Err(_) => return Err(anyhow!("could not read tracker response")),
        };

        parse_tracker_response(&body)
    }

    /// Build tracker URL.
    ///
    /// # Arguments
    ///
    /// * `info_hash` - The 20-byte SHA-1 hash of the info dictionary.
    /// * `announce` - The tracker URL.
    /// * `peer_id` - 20-byte string used as a unique ID for the client.
    /// * `port` - Port number that the client is listening on.
    /// * `length` - Total file size in bytes.
    ///
    fn build_tracker_url(
        info_hash: &[u8],
        announce: &str,
        peer_id: &[u8],
        port: u16,
        length: u64,
    ) -> Result<String> {
        /// Each byte is encoded as %XX where XX is the hexadecimal representation
        fn percent_encode_binary(data: &[u8]) -> String {
            const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
            let mut encoded = String::with_capacity(data.len() * 3);

            for &byte in data {
                encoded.push('%');
                encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
                encoded.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
            }

            encoded
        }

        // Parse tracker URL from torrent
        let base_url = match Url::parse(announce) {
            Ok(url) => url,
            Err(_) => return Err(anyhow!("could not parse tracker url")),
        };

        // Build query string manually to handle binary data properly
        let query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&compact=1&left={}",
            percent_encode_binary(info_hash),
            percent_encode_binary(peer_id),
            port,
            length
        );

        let mut url = base_url.to_string();
        if url.contains('?') {
            url.push('&');
        } else {
            url.push('?');
        }
        url.push_str(&query);

        Ok(url)
    }

    /// Download torrent.
    ///
    /// Discovers peers, spawns one worker per peer and assembles verified
    /// pieces into the returned buffer.
    pub fn download(&self) -> Result<Vec<u8>> {
        println!(
            "Downloading {:?} ({:?} pieces)",
            self.name,
            self.pieces_hashes.len(),
        );

        // Generate a random 20-byte peer id
        let mut peer_id: Vec<u8> = vec![0; 20];
        let mut rng = rand::thread_rng();
        for x in peer_id.iter_mut() {
            *x = rng.gen();
        }

        // Discover peers
        let peers = self.request_peers(&peer_id, PORT)?;
        info!("Tracker returned {:?} peers", peers.len());

        // Create work queue and fill it with every piece
        let work_chan: (Sender<PieceWork>, Receiver<PieceWork>) = unbounded();
        for index in 0..self.pieces_hashes.len() {
            let piece_index = index as u32;
            let piece_hash = self.pieces_hashes[index].clone();
            let piece_length = self.get_piece_length(piece_index);
            let piece_work = PieceWork::new(piece_index, piece_hash, piece_length);

            if work_chan.0.send(piece_work).is_err() {
                return Err(anyhow!("could not send piece to work queue"));
            }
        }

        // Create worker event channel
        let event_chan: (Sender<WorkerEvent>, Receiver<WorkerEvent>) = unbounded();

        // Start one worker per peer, each on its own thread
        let workers_alive: HashSet<u32> = peers.iter().map(|peer| peer.id).collect();
        for peer in peers {
            let worker = Worker::new(
                peer,
                peer_id.clone(),
                self.info_hash.clone(),
                work_chan.1.clone(),
                event_chan.0.clone(),
            );

            thread::spawn(move || {
                worker.start_download();
            });
        }

        // The workers now hold the only receiver/sender clones; keeping ours
        // would mask their disappearance
        let (work_tx, _) = work_chan;
        let (_, event_rx) = event_chan;

        self.assemble(work_tx, event_rx, workers_alive)
    }

    /// Collect worker events until every piece is verified and placed.
    fn assemble(
        &self,
        work_tx: Sender<PieceWork>,
        event_rx: Receiver<WorkerEvent>,
        mut workers_alive: HashSet<u32>,
    ) -> Result<Vec<u8>> {
        // Create progress bar
        let pb = ProgressBar::new(self.length);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")
                .unwrap()
                .progress_chars("#>-"),
        );

        // Build torrent
        let mut data: Vec<u8> = vec![0; self.length as usize];
        let mut nb_pieces_downloaded = 0;

        while nb_pieces_downloaded < self.pieces_hashes.len() {
            let event = match event_rx.recv() {
                Ok(event) => event,
                Err(_) => {
                    return Err(anyhow!(
                        "all peer workers exited before the download completed"
                    ))
                }
            };

            match event {
                WorkerEvent::Verified(piece_result) => {
                    // Copy piece data at its offset
                    let begin = self.get_piece_offset(piece_result.index) as usize;
                    let end = begin + piece_result.data.len();
                    data[begin..end].copy_from_slice(&piece_result.data);

                    // Update progress
                    pb.inc(piece_result.data.len() as u64);
                    nb_pieces_downloaded += 1;
                    let percent =
                        nb_pieces_downloaded as f64 / self.pieces_hashes.len() as f64 * 100.0;
                    info!(
                        "Download progress: {:.1}% ({:?} workers active)",
                        percent,
                        workers_alive.len()
                    );
                }
                WorkerEvent::Skipped { peer, mut work } => {
                    // Once every live worker skipped a piece, nobody has it
                    work.skipped_by.insert(peer);
                    if workers_alive
                        .iter()
                        .all(|worker| work.skipped_by.contains(worker))
                    {
                        return Err(anyhow!("no peer has piece {}", work.index));
                    }
                    self.requeue(&work_tx, work)?;
                }
                WorkerEvent::Failed { peer, mut work } => {
                    work.attempts += 1;
                    warn!(
                        "Piece {:?} failed on peer {:?} (attempt {:?})",
                        work.index, peer, work.attempts
                    );
                    if work.attempts > NB_PIECE_ATTEMPTS_MAX {
                        return Err(anyhow!(
                            "piece {} failed after {} attempts",
                            work.index,
                            work.attempts
                        ));
                    }
                    self.requeue(&work_tx, work)?;
                }
                WorkerEvent::Exited { peer } => {
                    workers_alive.remove(&peer);
                    info!(
                        "Worker for peer {:?} exited ({:?} workers active)",
                        peer,
                        workers_alive.len()
                    );
                    if workers_alive.is_empty() {
                        return Err(anyhow!(
                            "all peer workers exited before the download completed"
                        ));
                    }
                }
            }
        }

        // Closing the work queue tells the workers to stop
        drop(work_tx);
        pb.finish();

        Ok(data)
    }

    /// Put a piece back on the work queue.
    fn requeue(&self, work_tx: &Sender<PieceWork>, work: PieceWork) -> Result<()> {
        work_tx
            .send(work)
            .map_err(|_| anyhow!("could not send piece to work queue"))
    }

    /// Get piece length.
    ///
    /// # Arguments
    ///
    /// * `index` - The piece index.
    ///
    fn get_piece_length(&self, index: u32) -> u32 {
        let begin = self.get_piece_offset(index);
        let mut end = begin + self.piece_length as u64;

        // The final piece covers whatever remains
        if end > self.length {
            end = self.length;
        }

        (end - begin) as u32
    }

    /// Get piece offset in the payload.
    ///
    /// # Arguments
    ///
    /// * `index` - The piece index.
    ///
    fn get_piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length as u64
    }
}

/// Split the concatenated hashes of the metainfo into 20-byte SHA-1 digests.
fn split_pieces_hashes(pieces: &[u8]) -> Result<Vec<Vec<u8>>> {
    let nb_pieces = pieces.len();

    // Check torrent pieces
    if !nb_pieces.is_multiple_of(SHA1_HASH_SIZE) {
        return Err(anyhow!("torrent pieces length is not a multiple of 20"));
    }
    let nb_hashes = nb_pieces / SHA1_HASH_SIZE;
    let mut hashes: Vec<Vec<u8>> = Vec::with_capacity(nb_hashes);

    // Split pieces
    for i in 0..nb_hashes {
        hashes.push(pieces[i * SHA1_HASH_SIZE..(i + 1) * SHA1_HASH_SIZE].to_vec());
    }

    Ok(hashes)
}

/// Parse the bencoded tracker response into its peer list.
fn parse_tracker_response(body: &[u8]) -> Result<Vec<Peer>> {
    let value =
        bencode::decode(body).map_err(|e| anyhow!("could not decode tracker response: {}", e))?;
    let dict = value
        .as_dict()
        .ok_or_else(|| anyhow!("tracker response is not a dictionary"))?;

    let interval = dict
        .find(b"interval")
        .ok_or_else(|| anyhow!("tracker response has no interval"))?
        .as_integer()
        .ok_or_else(|| anyhow!("tracker interval is not an integer"))?;
    info!("Tracker asks for announces every {:?} seconds", interval);

    let peers = dict
        .find(b"peers")
        .ok_or_else(|| anyhow!("tracker response has no peers"))?
        .as_bytes()
        .ok_or_else(|| anyhow!("tracker peers is not a byte string"))?;

    decode_peers(peers)
}
