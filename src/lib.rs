//! # Marmot BitTorrent Client
//!
//! A command-line BitTorrent client for single-file torrents.
//!
//! ## Features
//!
//! - Bencode codec with canonical re-encoding
//! - HTTP tracker announce with compact peer lists
//! - Core peer wire protocol (handshake, choke/unchoke, piece transfer)
//! - Multi-peer concurrent downloading with pipelined block requests
//! - Piece verification with SHA-1 hashing
//! - Progress tracking with visual progress bar
//!
//! ## Architecture
//!
//! The client follows a multi-threaded architecture:
//!
//! - **Main thread**: Parses arguments, loads torrent, coordinates download
//! - **Worker threads**: Each handles communication with one peer
//! - **Channels**: Coordinate piece work distribution and result collection

#[macro_use]
extern crate log;

pub mod bencode;
pub mod bitfield;
pub mod client;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod piece;
pub mod torrent;
pub mod worker;
