//! # Peer Connection
//!
//! This module drives a single TCP connection to a remote peer: handshake,
//! message exchange and the per-connection protocol state (choke flag, peer
//! bitfield).
//!
//! ## Connection lifecycle
//!
//! 1. **Connect**: TCP dial with a 3 second timeout
//! 2. **Handshake**: fixed 68-byte exchange, info-hash validated, under one
//!    3 second deadline that is cleared on success
//! 3. **Bitfield**: the first non-keep-alive message must announce the
//!    peer's pieces
//! 4. **Download**: length-prefixed messages, each read bounded by the time
//!    remaining until the caller's piece deadline
//!
//! ## Connection states
//!
//! A connection starts choked: the peer will not answer requests until it
//! sends UNCHOKE. CHOKE/UNCHOKE from the peer flip the flag; HAVE messages
//! augment the stored bitfield.
//!
//! The connection is owned by exactly one worker and closes when the client
//! is dropped.

use crate::bitfield::*;
use crate::handshake::*;
use crate::message::*;
use crate::peer::*;
use crate::piece::*;

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use std::io::{Cursor, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

/// Deadline for connecting, handshaking, and downloading one piece.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(3);

/// A connection to a remote BitTorrent peer.
///
/// Each client instance corresponds to one peer in the swarm and handles all
/// communication with that peer according to the peer wire protocol.
pub struct Client {
    /// Information about the remote peer (IP, port, ID)
    peer: Peer,
    /// 20-byte unique identifier for this client instance
    peer_id: Vec<u8>,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    info_hash: Vec<u8>,
    /// TCP stream connection to the peer
    conn: TcpStream,
    /// Pieces the peer advertises
    bitfield: Bitfield,
    /// Whether the peer has choked this client
    choked: bool,
}

impl Client {
    /// Open a TCP connection to a peer.
    ///
    /// The connection starts choked with an empty bitfield; callers follow up
    /// with [`Client::handshake_with_peer`] and [`Client::read_bitfield`].
    pub fn new(peer: Peer, peer_id: Vec<u8>, info_hash: Vec<u8>) -> Result<Client> {
        // Open connection with remote peer
        let peer_socket = SocketAddr::new(IpAddr::V4(peer.ip), peer.port);
        let conn = match TcpStream::connect_timeout(&peer_socket, PEER_TIMEOUT) {
            Ok(conn) => conn,
            Err(_) => return Err(anyhow!("could not connect to peer {}", peer.address())),
        };

        info!("Connected to peer {:?}", peer.id);

        let client = Client {
            peer,
            peer_id,
            info_hash,
            conn,
            bitfield: Bitfield::default(),
            choked: true,
        };

        Ok(client)
    }

    /// Returns whether this client is choked by the peer.
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    /// Checks if the peer advertises a specific piece.
    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has(index)
    }

    /// Marks a piece as available in the peer's bitfield.
    pub fn set_piece(&mut self, index: u32) {
        self.bitfield.set(index);
    }

    /// Set or clear the read and write timeouts on the TCP connection.
    fn set_connection_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        if self.conn.set_write_timeout(timeout).is_err() {
            return Err(anyhow!("could not set write timeout"));
        }
        if self.conn.set_read_timeout(timeout).is_err() {
            return Err(anyhow!("could not set read timeout"));
        }

        Ok(())
    }

    /// Performs the BitTorrent handshake with the remote peer.
    ///
    /// Sends our handshake, reads the peer's, and validates that the peer is
    /// serving the same info-hash. The whole exchange runs under a single
    /// 3 second deadline which is cleared on success.
    pub fn handshake_with_peer(&mut self) -> Result<()> {
        self.set_connection_timeout(Some(PEER_TIMEOUT))?;

        // Send handshake to remote peer
        let handshake = Handshake::new(self.peer_id.clone(), self.info_hash.clone());
        let handshake_encoded: Vec<u8> = handshake.serialize()?;
        if self.conn.write_all(&handshake_encoded).is_err() {
            return Err(anyhow!("could not send handshake to peer"));
        }

        // Read handshake received from remote peer
        let handshake_len: usize = self.read_handshake_len()?;
        let mut handshake_buf: Vec<u8> = vec![0; 48 + handshake_len];
        if self.conn.read_exact(&mut handshake_buf).is_err() {
            return Err(anyhow!("could not read handshake received from peer"));
        }

        // Check info hash received from remote peer
        let handshake_decoded: Handshake = deserialize_handshake(&handshake_buf, handshake_len)?;
        if handshake_decoded.info_hash != self.info_hash {
            return Err(anyhow!("invalid info hash received from peer"));
        }

        // Handshake complete, lift the deadline
        self.set_connection_timeout(None)?;

        Ok(())
    }

    /// Reads the first byte of the peer's handshake, the protocol string
    /// length. A length of 0 is rejected.
    fn read_handshake_len(&mut self) -> Result<usize> {
        let mut buf = [0; 1];
        if self.conn.read_exact(&mut buf).is_err() {
            return Err(anyhow!(
                "could not read handshake length received from peer"
            ));
        }

        let handshake_len = buf[0];
        if handshake_len == 0 {
            return Err(anyhow!("invalid handshake length received from peer"));
        }

        Ok(handshake_len as usize)
    }

    /// Reads the peer's initial BITFIELD message.
    ///
    /// The bitfield must be the first non-keep-alive message after the
    /// handshake; anything else is a protocol violation. Runs under a fresh
    /// 3 second deadline, cleared afterwards.
    pub fn read_bitfield(&mut self) -> Result<()> {
        self.set_connection_timeout(Some(PEER_TIMEOUT))?;

        // Peers may send keep-alives before the bitfield
        let message: Message = loop {
            let message = self.read_message()?;
            if message.id != MESSAGE_KEEPALIVE {
                break message;
            }
        };

        if message.id != MESSAGE_BITFIELD {
            return Err(anyhow!("received invalid MESSAGE_BITFIELD from peer"));
        }

        info!("Receive MESSAGE_BITFIELD from peer {:?}", self.peer.id);

        // Store bitfield
        self.bitfield = Bitfield::new(message.payload);

        self.set_connection_timeout(None)?;

        Ok(())
    }

    /// Reads and parses one message from the peer.
    ///
    /// A zero length prefix is returned as the keep-alive pseudo-message.
    pub fn read_message(&mut self) -> Result<Message> {
        let message_len: usize = self.read_message_len()?;

        // If message length is 0, it's a keep-alive
        if message_len == 0 {
            info!("Receive KEEP_ALIVE from peer {:?}", self.peer.id);
            return Ok(Message::new(MESSAGE_KEEPALIVE));
        }

        // Read message
        let mut message_buf: Vec<u8> = vec![0; message_len];
        if self.conn.read_exact(&mut message_buf).is_err() {
            return Err(anyhow!("could not read message received from peer"));
        }

        deserialize_message(&message_buf)
    }

    /// Reads one message, bounded by the time remaining until `deadline`.
    ///
    /// The piece download loop calls this so that a single deadline covers
    /// every read of the piece, however many blocks it takes.
    pub fn read_message_before(&mut self, deadline: Instant) -> Result<Message> {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .filter(|remaining| !remaining.is_zero())
            .ok_or_else(|| anyhow!("peer read deadline exceeded"))?;

        if self.conn.set_read_timeout(Some(remaining)).is_err() {
            return Err(anyhow!("could not set read timeout"));
        }

        self.read_message()
    }

    /// Reads the 4-byte big-endian length prefix of an incoming message.
    fn read_message_len(&mut self) -> Result<usize> {
        let mut buf = vec![0; 4];
        if self.conn.read_exact(&mut buf).is_err() {
            return Err(anyhow!("could not read message length received from peer"));
        }

        let mut cursor = Cursor::new(buf);
        let message_len = cursor.read_u32::<BigEndian>()?;

        Ok(message_len as usize)
    }

    /// Processes a CHOKE message from the peer.
    pub fn read_choke(&mut self) {
        info!("Receive MESSAGE_CHOKE from peer {:?}", self.peer.id);
        self.choked = true
    }

    /// Processes an UNCHOKE message from the peer.
    pub fn read_unchoke(&mut self) {
        info!("Receive MESSAGE_UNCHOKE from peer {:?}", self.peer.id);
        self.choked = false
    }

    /// Serialize and transmit one message.
    fn send_message(&mut self, message: &Message, label: &str) -> Result<()> {
        let encoded = message.serialize()?;

        debug!("Send {} to peer {:?}", label, self.peer.id);

        if self.conn.write_all(&encoded).is_err() {
            return Err(anyhow!("could not send {} to peer", label));
        }

        Ok(())
    }

    /// Tell the peer we will answer its requests.
    pub fn send_unchoke(&mut self) -> Result<()> {
        self.send_message(&Message::new(MESSAGE_UNCHOKE), "MESSAGE_UNCHOKE")
    }

    /// Tell the peer we want to download from it.
    ///
    /// Peers ignore REQUEST messages from clients that never declared
    /// interest.
    pub fn send_interested(&mut self) -> Result<()> {
        self.send_message(&Message::new(MESSAGE_INTERESTED), "MESSAGE_INTERESTED")
    }

    /// Announce to the peer that we hold a verified copy of a piece.
    pub fn send_have(&mut self, index: u32) -> Result<()> {
        let mut payload: Vec<u8> = vec![];
        payload.write_u32::<BigEndian>(index)?;

        self.send_message(
            &Message::new_with_payload(MESSAGE_HAVE, payload),
            "MESSAGE_HAVE",
        )
    }

    /// Ask the peer for one block of a piece.
    ///
    /// # Arguments
    ///
    /// * `index` - Zero-based piece index.
    /// * `begin` - Byte offset of the block within the piece.
    /// * `length` - Block size in bytes, at most 16 KiB.
    ///
    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        let mut payload: Vec<u8> = vec![];
        payload.write_u32::<BigEndian>(index)?;
        payload.write_u32::<BigEndian>(begin)?;
        payload.write_u32::<BigEndian>(length)?;

        info!(
            "Request piece {:?} bytes [{:?}..{:?}] from peer {:?}",
            index,
            begin,
            begin + length,
            self.peer.id
        );

        self.send_message(
            &Message::new_with_payload(MESSAGE_REQUEST, payload),
            "MESSAGE_REQUEST",
        )
    }

    /// Processes a HAVE message and updates the peer's bitfield.
    pub fn read_have(&mut self, message: &Message) -> Result<()> {
        info!("Receive MESSAGE_HAVE from peer {:?}", self.peer.id);

        let index = parse_have(message)?;
        self.set_piece(index);

        Ok(())
    }

    /// Processes a PIECE message carrying one block of the piece in progress.
    ///
    /// The block is copied into the progress buffer at its offset and the
    /// downloaded/backlog counters are updated. Integrity is checked later
    /// over the whole piece.
    pub fn read_piece(&mut self, message: &Message, progress: &mut PieceProgress) -> Result<()> {
        let block_len = parse_piece(progress.index, &mut progress.buffer, message)?;

        info!(
            "Download piece {:?} block of {:?} bytes from peer {:?}",
            progress.index, block_len, self.peer.id
        );

        progress.downloaded += block_len;
        progress.backlog = progress.backlog.saturating_sub(1);

        Ok(())
    }
}
