//! End-to-end worker scenarios against a scripted in-process peer.
//!
//! Each test plays the remote side of the peer wire protocol on a loopback
//! socket while a real `Worker` thread drives the download: handshake,
//! bitfield, choke lifting, block requests and piece delivery.

use marmot::peer::Peer;
use marmot::piece::{PieceResult, PieceWork};
use marmot::worker::{Worker, WorkerEvent};

use boring::sha::Sha1;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crossbeam_channel::{unbounded, Receiver};

use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

const MESSAGE_UNCHOKE: u8 = 1;
const MESSAGE_INTERESTED: u8 = 2;
const MESSAGE_HAVE: u8 = 4;
const MESSAGE_BITFIELD: u8 = 5;
const MESSAGE_REQUEST: u8 = 6;
const MESSAGE_PIECE: u8 = 7;

const INFO_HASH: [u8; 20] = [0x11; 20];
const PIECE_LENGTH: u32 = 16384;

fn sha1(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finish().to_vec()
}

fn piece_data() -> Vec<u8> {
    (0..PIECE_LENGTH).map(|i| (i % 251) as u8).collect()
}

/// Accept the worker's handshake and answer with our own.
fn exchange_handshake(stream: &mut TcpStream) {
    let mut handshake = [0u8; 68];
    stream.read_exact(&mut handshake).unwrap();
    assert_eq!(handshake[0], 19);
    assert_eq!(&handshake[1..20], b"BitTorrent protocol");
    assert_eq!(&handshake[28..48], &INFO_HASH);

    let mut reply: Vec<u8> = vec![19];
    reply.extend_from_slice(b"BitTorrent protocol");
    reply.extend_from_slice(&[0; 8]);
    reply.extend_from_slice(&INFO_HASH);
    reply.extend_from_slice(&[0x22; 20]);
    stream.write_all(&reply).unwrap();
}

fn write_message(stream: &mut TcpStream, id: u8, payload: &[u8]) {
    let mut message: Vec<u8> = vec![];
    message
        .write_u32::<BigEndian>(1 + payload.len() as u32)
        .unwrap();
    message.push(id);
    message.extend_from_slice(payload);
    stream.write_all(&message).unwrap();
}

/// Read one message; `None` on keep-alive or closed connection.
fn read_message(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let length = match stream.read_u32::<BigEndian>() {
        Ok(length) => length as usize,
        Err(_) => return None,
    };
    if length == 0 {
        return Some((255, vec![]));
    }

    let mut body = vec![0u8; length];
    if stream.read_exact(&mut body).is_err() {
        return None;
    }
    Some((body[0], body[1..].to_vec()))
}

/// Spawn a worker wired to fresh channels, returning its event stream and the
/// work queue sender.
fn spawn_worker(
    port: u16,
) -> (
    crossbeam_channel::Sender<PieceWork>,
    Receiver<WorkerEvent>,
    thread::JoinHandle<()>,
) {
    let (work_tx, work_rx) = unbounded();
    let (event_tx, event_rx) = unbounded();

    let peer = Peer {
        id: 0,
        ip: Ipv4Addr::LOCALHOST,
        port,
    };
    let worker = Worker::new(peer, vec![0x33; 20], INFO_HASH.to_vec(), work_rx, event_tx);
    let handle = thread::spawn(move || worker.start_download());

    (work_tx, event_rx, handle)
}

fn recv_event(event_rx: &Receiver<WorkerEvent>) -> WorkerEvent {
    event_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("no worker event within 10 seconds")
}

fn expect_verified(event: WorkerEvent) -> PieceResult {
    match event {
        WorkerEvent::Verified(piece_result) => piece_result,
        other => panic!("expected a verified piece, got {:?}", other),
    }
}

#[test]
fn single_piece_download_verifies_and_completes() {
    let data = piece_data();
    let hash = sha1(&data);

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();

    let peer_data = data.clone();
    let peer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        exchange_handshake(&mut stream);

        // Advertise piece 0 and lift the choke
        write_message(&mut stream, MESSAGE_BITFIELD, &[0x80]);
        write_message(&mut stream, MESSAGE_UNCHOKE, &[]);

        let mut saw_interested = false;
        while let Some((id, payload)) = read_message(&mut stream) {
            match id {
                MESSAGE_INTERESTED => saw_interested = true,
                MESSAGE_REQUEST => {
                    let mut cursor = std::io::Cursor::new(&payload);
                    let index = cursor.read_u32::<BigEndian>().unwrap();
                    let begin = cursor.read_u32::<BigEndian>().unwrap() as usize;
                    let length = cursor.read_u32::<BigEndian>().unwrap() as usize;
                    assert_eq!(index, 0);

                    let mut piece: Vec<u8> = vec![];
                    piece.write_u32::<BigEndian>(index).unwrap();
                    piece.write_u32::<BigEndian>(begin as u32).unwrap();
                    piece.extend_from_slice(&peer_data[begin..begin + length]);
                    write_message(&mut stream, MESSAGE_PIECE, &piece);
                }
                MESSAGE_HAVE => {
                    let mut cursor = std::io::Cursor::new(&payload);
                    assert_eq!(cursor.read_u32::<BigEndian>().unwrap(), 0);
                }
                _ => {}
            }
        }
        assert!(saw_interested);
    });

    let (work_tx, event_rx, handle) = spawn_worker(port);
    work_tx
        .send(PieceWork::new(0, hash, PIECE_LENGTH))
        .unwrap();

    let piece_result = expect_verified(recv_event(&event_rx));
    assert_eq!(piece_result.index, 0);
    assert_eq!(piece_result.data, data);

    // Closing the work queue shuts the worker down
    drop(work_tx);
    match recv_event(&event_rx) {
        WorkerEvent::Exited { peer } => assert_eq!(peer, 0),
        other => panic!("expected worker exit, got {:?}", other),
    }

    handle.join().unwrap();
    peer.join().unwrap();
}

#[test]
fn corrupt_piece_is_requeued_and_retried() {
    let data = piece_data();
    let hash = sha1(&data);

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();

    let peer_data = data.clone();
    let peer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        exchange_handshake(&mut stream);

        write_message(&mut stream, MESSAGE_BITFIELD, &[0x80]);
        write_message(&mut stream, MESSAGE_UNCHOKE, &[]);

        // First answer is corrupted, the retry is served correctly
        let mut nb_requests = 0;
        while let Some((id, payload)) = read_message(&mut stream) {
            if id != MESSAGE_REQUEST {
                continue;
            }
            let mut cursor = std::io::Cursor::new(&payload);
            let index = cursor.read_u32::<BigEndian>().unwrap();
            let begin = cursor.read_u32::<BigEndian>().unwrap() as usize;
            let length = cursor.read_u32::<BigEndian>().unwrap() as usize;

            let mut block = peer_data[begin..begin + length].to_vec();
            nb_requests += 1;
            if nb_requests == 1 {
                block[0] ^= 0xff;
            }

            let mut piece: Vec<u8> = vec![];
            piece.write_u32::<BigEndian>(index).unwrap();
            piece.write_u32::<BigEndian>(begin as u32).unwrap();
            piece.extend_from_slice(&block);
            write_message(&mut stream, MESSAGE_PIECE, &piece);
        }
        assert_eq!(nb_requests, 2);
    });

    let (work_tx, event_rx, handle) = spawn_worker(port);
    work_tx
        .send(PieceWork::new(0, hash, PIECE_LENGTH))
        .unwrap();

    // The corrupted download comes back as a failure carrying the work item
    let mut work = match recv_event(&event_rx) {
        WorkerEvent::Failed { peer, work } => {
            assert_eq!(peer, 0);
            work
        }
        other => panic!("expected a failed piece, got {:?}", other),
    };
    assert_eq!(work.index, 0);

    // Re-queue it, the same worker retries and succeeds
    work.attempts += 1;
    work_tx.send(work).unwrap();

    let piece_result = expect_verified(recv_event(&event_rx));
    assert_eq!(piece_result.data, data);

    drop(work_tx);
    match recv_event(&event_rx) {
        WorkerEvent::Exited { .. } => {}
        other => panic!("expected worker exit, got {:?}", other),
    }

    handle.join().unwrap();
    peer.join().unwrap();
}

#[test]
fn peer_without_pieces_skips_without_requesting() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();

    let peer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        exchange_handshake(&mut stream);

        // Advertise nothing
        write_message(&mut stream, MESSAGE_BITFIELD, &[0x00]);

        // The worker must never request anything
        let mut ids: Vec<u8> = vec![];
        while let Some((id, _)) = read_message(&mut stream) {
            ids.push(id);
        }
        assert!(!ids.contains(&MESSAGE_REQUEST));
        assert_eq!(ids, vec![MESSAGE_UNCHOKE, MESSAGE_INTERESTED]);
    });

    let (work_tx, event_rx, handle) = spawn_worker(port);
    work_tx
        .send(PieceWork::new(0, vec![0; 20], PIECE_LENGTH))
        .unwrap();

    // The assignment bounces back untouched
    match recv_event(&event_rx) {
        WorkerEvent::Skipped { peer, work } => {
            assert_eq!(peer, 0);
            assert_eq!(work.index, 0);
            assert_eq!(work.attempts, 0);
        }
        other => panic!("expected a skipped piece, got {:?}", other),
    }

    // Closing the queue lets the worker exit cleanly
    drop(work_tx);
    match recv_event(&event_rx) {
        WorkerEvent::Exited { peer } => assert_eq!(peer, 0),
        other => panic!("expected worker exit, got {:?}", other),
    }

    handle.join().unwrap();
    peer.join().unwrap();
}
