//! # Piece Download State
//!
//! Pieces are the verification units of a torrent, each with a SHA-1 hash in
//! the metainfo. They travel through three shapes here:
//!
//! 1. **PieceWork**: a queued assignment, re-enqueued until it verifies
//! 2. **PieceProgress**: the in-flight state of one piece on one peer
//! 3. **PieceResult**: a completed, hash-verified piece
//!
//! Pieces are requested from peers in blocks of at most 16 KiB; the progress
//! counters track how far the request pipeline and the received data have
//! advanced.

use std::collections::HashSet;

/// A piece waiting to be downloaded.
///
/// Work items are created once by the coordinator and cycle through the work
/// queue until some worker delivers a verified copy. The bookkeeping fields
/// record how often the item bounced so a piece nobody can serve fails the
/// download instead of circulating forever.
#[derive(Default, Debug, Clone)]
pub struct PieceWork {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Expected SHA-1 hash of the piece contents (20 bytes)
    pub hash: Vec<u8>,
    /// Length of this piece in bytes
    pub length: u32,
    /// Failed download or verification attempts so far
    pub attempts: u32,
    /// Ids of peers whose bitfield did not advertise this piece
    pub skipped_by: HashSet<u32>,
}

/// Download progress of a single piece on a single peer.
#[derive(Default, Debug)]
pub struct PieceProgress {
    /// Zero-based index of the piece being downloaded
    pub index: u32,
    /// Piece buffer blocks are copied into at their offset
    pub buffer: Vec<u8>,
    /// Bytes received and stored into the buffer
    pub downloaded: u32,
    /// Bytes requested from the peer so far
    pub requested: u32,
    /// Outstanding requests not yet answered
    pub backlog: u32,
}

/// A fully downloaded piece whose SHA-1 matched the metainfo.
#[derive(Default, Debug, Clone)]
pub struct PieceResult {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Verified piece contents
    pub data: Vec<u8>,
}

impl PieceWork {
    /// Build a work item for one piece.
    pub fn new(index: u32, hash: Vec<u8>, length: u32) -> PieceWork {
        PieceWork {
            index,
            hash,
            length,
            attempts: 0,
            skipped_by: HashSet::new(),
        }
    }
}

impl PieceProgress {
    /// Start tracking a fresh download of `piece_work`.
    pub fn new(piece_work: &PieceWork) -> PieceProgress {
        PieceProgress {
            index: piece_work.index,
            buffer: vec![0; piece_work.length as usize],
            downloaded: 0,
            requested: 0,
            backlog: 0,
        }
    }
}

impl PieceResult {
    /// Wrap the verified contents of piece `index`.
    pub fn new(index: u32, data: Vec<u8>) -> PieceResult {
        PieceResult { index, data }
    }
}
