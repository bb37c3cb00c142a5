//! # BitTorrent Handshake
//!
//! The handshake opens every peer connection and confirms both ends are
//! talking about the same torrent.
//!
//! ## Message Format
//!
//! A fixed-shape message, 68 bytes for the standard protocol string:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte - length of the protocol string (19)
//! - **pstr**: protocol identifier ("BitTorrent protocol")
//! - **reserved**: 8 bytes - all zeros, reserved for extensions
//! - **info_hash**: 20 bytes - SHA-1 of the torrent's info dictionary
//! - **peer_id**: 20 bytes - unique identifier of the sending peer
//!
//! A peer answering with a different info-hash is on the wrong swarm and the
//! connection is dropped.

use anyhow::{anyhow, Result};

const PROTOCOL_ID: &str = "BitTorrent protocol";

/// A BitTorrent handshake message.
pub struct Handshake {
    /// Length of the protocol identifier string
    pub pstrlen: usize,
    /// Protocol identifier bytes
    pub pstr: Vec<u8>,
    /// 8 reserved bytes, all zeros
    pub reserved: Vec<u8>,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    pub info_hash: Vec<u8>,
    /// 20-byte unique identifier of the peer
    pub peer_id: Vec<u8>,
}

impl Handshake {
    /// Build a handshake for the standard protocol string.
    pub fn new(peer_id: Vec<u8>, info_hash: Vec<u8>) -> Self {
        let pstr = String::from(PROTOCOL_ID).into_bytes();
        let pstrlen = pstr.len();
        let reserved: Vec<u8> = vec![0; 8];

        Handshake {
            pstrlen,
            pstr,
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Serialize the handshake for transmission.
    ///
    /// The output is `1 + pstrlen + 48` bytes, 68 for the standard protocol
    /// string.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut serialized: Vec<u8> = Vec::with_capacity(1 + self.pstrlen + 48);

        serialized.push(self.pstrlen as u8);
        serialized.extend_from_slice(&self.pstr);
        serialized.extend_from_slice(&self.reserved);
        serialized.extend_from_slice(&self.info_hash);
        serialized.extend_from_slice(&self.peer_id);

        Ok(serialized)
    }
}

/// Deserialize a handshake received from a peer.
///
/// `buf` holds everything after the leading length byte and must be exactly
/// `pstrlen + 48` bytes. Info-hash validation is left to the caller.
///
/// # Arguments
///
/// * `buf` - The handshake bytes, without the leading length byte.
/// * `pstrlen` - Protocol string length announced in the leading byte.
///
pub fn deserialize_handshake(buf: &[u8], pstrlen: usize) -> Result<Handshake> {
    // Check the peer sent the full fixed-shape message
    if buf.len() != pstrlen + 48 {
        return Err(anyhow!("received invalid handshake length from peer"));
    }

    let pstr = buf[0..pstrlen].to_vec();
    let reserved = buf[pstrlen..(pstrlen + 8)].to_vec();
    let info_hash = buf[(pstrlen + 8)..(pstrlen + 8 + 20)].to_vec();
    let peer_id = buf[(pstrlen + 8 + 20)..].to_vec();

    let handshake = Handshake {
        pstrlen,
        pstr,
        reserved,
        info_hash,
        peer_id,
    };

    Ok(handshake)
}
