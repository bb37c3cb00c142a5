//! # Peer Addresses
//!
//! Trackers answer an announce with a compact binary peer list: 6 bytes per
//! peer, 4 bytes of big-endian IPv4 address followed by 2 bytes of big-endian
//! port.
//!
//! ```text
//! <IP: 4 bytes><Port: 2 bytes>
//! ```
//!
//! Each decoded peer additionally carries a sequential id used for logging
//! and for tracking which peers skipped a piece.

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};

use std::io::Cursor;
use std::net::Ipv4Addr;

const PEER_SIZE: usize = 6;

type PeerId = u32;

/// A BitTorrent peer in the swarm.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Sequential identifier assigned to this peer for internal tracking
    pub id: PeerId,
    /// IPv4 address of the peer
    pub ip: Ipv4Addr,
    /// Port number for connecting to the peer
    pub port: u16,
}

impl Peer {
    /// Format the peer as `host:port` for dialing.
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Parse a compact peer list from a tracker response.
///
/// # Arguments
///
/// * `tracker_peers` - Compact binary peer list, 6 bytes per peer.
///
/// # Errors
///
/// Returns an error if the list is empty or its length is not a multiple of
/// 6 bytes.
pub fn decode_peers(tracker_peers: &[u8]) -> Result<Vec<Peer>> {
    // Check tracker peers are valid
    if tracker_peers.is_empty() {
        return Err(anyhow!("received empty peers from tracker"));
    }
    if !tracker_peers.len().is_multiple_of(PEER_SIZE) {
        return Err(anyhow!("received malformed peers from tracker"));
    }

    let nb_peers = tracker_peers.len() / PEER_SIZE;
    let mut peers: Vec<Peer> = Vec::with_capacity(nb_peers);

    for i in 0..nb_peers {
        let offset = i * PEER_SIZE;

        // Read peer IP address
        let ip = Ipv4Addr::new(
            tracker_peers[offset],
            tracker_peers[offset + 1],
            tracker_peers[offset + 2],
            tracker_peers[offset + 3],
        );

        // Read peer port
        let mut port_cursor = Cursor::new(&tracker_peers[offset + 4..offset + 6]);
        let port = port_cursor.read_u16::<BigEndian>()?;

        peers.push(Peer {
            id: i as u32,
            ip,
            port,
        });
    }

    Ok(peers)
}
