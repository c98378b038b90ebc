//! Transport collaborators.
//!
//! The connection logic never touches the OS directly. It talks to a
//! [`Socket`] for datagrams, a [`Clock`] for time and a [`Compressor`] for the
//! connect payload. Real implementations (UDP, wall clock, deflate) live next
//! to deterministic ones used by tests (in-memory pair, manual clock).

use std::collections::VecDeque;
use std::io::{self, Read};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;
use tracing::debug;

use crate::msg::MAX_MSGLEN;

/// Leading marker of a connectionless packet.
pub const OOB_MARKER: u32 = 0xFFFF_FFFF;

/// Datagram transport.
pub trait Socket {
    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Returns the next pending datagram without blocking.
    fn receive(&mut self) -> io::Result<Option<Bytes>>;

    /// Blocks up to `timeout` until a datagram is pending.
    fn wait(&mut self, timeout: Duration) -> io::Result<bool>;
}

/// Monotonic millisecond clock.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// Opaque byte compressor used on the connect payload.
pub trait Compressor {
    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>>;
    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>>;
}

/// Builds a connectionless packet.
pub fn oob_packet(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32_le(OOB_MARKER);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Payload of a connectionless packet, `None` for sequenced packets.
pub fn oob_payload(data: &[u8]) -> Option<&[u8]> {
    match data {
        [0xFF, 0xFF, 0xFF, 0xFF, rest @ ..] => Some(rest),
        _ => None,
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

type Queue = Arc<Mutex<VecDeque<Bytes>>>;

/// One end of an in-memory datagram link.
///
/// Outgoing datagrams can be dropped deterministically to exercise loss.
#[derive(Debug, Clone)]
pub struct MemorySocket {
    inbox: Queue,
    outbox: Queue,
    drop_every: Arc<AtomicU64>,
    sent: Arc<AtomicU64>,
}

impl MemorySocket {
    /// Two connected ends.
    pub fn pair() -> (Self, Self) {
        let a: Queue = Arc::default();
        let b: Queue = Arc::default();
        (
            Self {
                inbox: a.clone(),
                outbox: b.clone(),
                drop_every: Arc::default(),
                sent: Arc::default(),
            },
            Self {
                inbox: b,
                outbox: a,
                drop_every: Arc::default(),
                sent: Arc::default(),
            },
        )
    }

    /// Drops every `n`th outgoing datagram; 0 disables loss.
    pub fn set_drop_every(&self, n: u64) {
        self.drop_every.store(n, Ordering::Relaxed);
    }

    /// Discards everything waiting to be received.
    pub fn discard_incoming(&self) -> usize {
        let mut inbox = lock(&self.inbox);
        let n = inbox.len();
        inbox.clear();
        n
    }

    pub fn pending(&self) -> usize {
        lock(&self.inbox).len()
    }
}

impl Socket for MemorySocket {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let n = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        let every = self.drop_every.load(Ordering::Relaxed);
        if every != 0 && n % every == 0 {
            return Ok(());
        }
        lock(&self.outbox).push_back(Bytes::copy_from_slice(data));
        Ok(())
    }

    fn receive(&mut self) -> io::Result<Option<Bytes>> {
        Ok(lock(&self.inbox).pop_front())
    }

    fn wait(&mut self, _timeout: Duration) -> io::Result<bool> {
        Ok(!lock(&self.inbox).is_empty())
    }
}

/// Non-blocking UDP transport bound to one peer.
///
/// A listening transport learns its peer from the first datagram received.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
    buf: Vec<u8>,
}

impl UdpTransport {
    pub fn connect(peer: SocketAddr) -> io::Result<Self> {
        let bind: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            peer: Some(peer),
            buf: vec![0; MAX_MSGLEN],
        })
    }

    pub fn listen(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            peer: None,
            buf: vec![0; MAX_MSGLEN],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl Socket for UdpTransport {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let Some(peer) = self.peer else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no peer yet"));
        };
        match self.socket.send_to(data, peer) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn receive(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            match self.socket.recv_from(&mut self.buf) {
                Ok((n, from)) => {
                    match self.peer {
                        None => {
                            debug!(%from, "peer learned");
                            self.peer = Some(from);
                        }
                        Some(peer) if peer != from => continue,
                        Some(_) => {}
                    }
                    return Ok(Some(Bytes::copy_from_slice(&self.buf[..n])));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<bool> {
        if timeout.is_zero() {
            let mut peek_buf = [0u8; 1];
            return match self.socket.peek_from(&mut peek_buf) {
                Ok(_) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
                Err(e) => Err(e),
            };
        }
        self.socket.set_nonblocking(false)?;
        self.socket.set_read_timeout(Some(timeout))?;
        let mut peek_buf = [0u8; 1];
        let ready = match self.socket.peek_from(&mut peek_buf) {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(false)
            }
            Err(e) => Err(e),
        };
        self.socket.set_nonblocking(true)?;
        ready
    }
}

/// Wall clock measured from construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Clock advanced by hand. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

/// Upper bound on an inflated connect payload.
pub const MAX_DECOMPRESS_SIZE: usize = 65536;

/// Raw deflate compressor.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeflateCompressor;

impl Compressor for DeflateCompressor {
    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(data, Compression::default());
        let mut out = Vec::with_capacity(data.len());
        encoder.read_to_end(&mut out)?;
        Ok(out)
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        DeflateDecoder::new(data)
            .take(MAX_DECOMPRESS_SIZE as u64 + 1)
            .read_to_end(&mut out)?;
        if out.len() > MAX_DECOMPRESS_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "decompressed payload too large",
            ));
        }
        Ok(out)
    }
}

/// Identity compressor.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCompressor;

impl Compressor for PassthroughCompressor {
    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_pair_delivers_in_order() {
        let (mut a, mut b) = MemorySocket::pair();
        a.send(b"one").unwrap();
        a.send(b"two").unwrap();
        assert!(b.wait(Duration::ZERO).unwrap());
        assert_eq!(b.receive().unwrap().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(b.receive().unwrap().unwrap(), Bytes::from_static(b"two"));
        assert!(b.receive().unwrap().is_none());
        assert!(a.receive().unwrap().is_none());
    }

    #[test]
    fn memory_socket_drops_every_nth() {
        let (mut a, b) = MemorySocket::pair();
        a.set_drop_every(2);
        for i in 0..6u8 {
            a.send(&[i]).unwrap();
        }
        assert_eq!(b.pending(), 3);
    }

    #[test]
    fn oob_marker_roundtrip() {
        let pkt = oob_packet(b"getchallenge");
        assert_eq!(oob_payload(&pkt), Some(&b"getchallenge"[..]));
        assert_eq!(oob_payload(&[1, 0, 0, 0, 5]), None);
    }

    #[test]
    fn manual_clock_is_shared() {
        let clock = ManualClock::new(100);
        let other = clock.clone();
        clock.advance(50);
        assert_eq!(other.now_ms(), 150);
    }

    #[test]
    fn deflate_roundtrip() {
        let data = b"\\name\\Player\\rate\\25000\\snaps\\20\\name\\Player".repeat(4);
        let c = DeflateCompressor;
        let packed = c.compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(c.decompress(&packed).unwrap(), data);
    }

    #[test]
    fn udp_loopback() {
        let mut server = UdpTransport::listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = server.local_addr().unwrap();
        let mut client = UdpTransport::connect(addr).unwrap();
        client.send(b"ping").unwrap();
        assert!(server.wait(Duration::from_secs(2)).unwrap());
        assert_eq!(server.receive().unwrap().unwrap(), Bytes::from_static(b"ping"));
        assert!(server.peer_addr().is_some());
        server.send(b"pong").unwrap();
        assert!(client.wait(Duration::from_secs(2)).unwrap());
        assert_eq!(client.receive().unwrap().unwrap(), Bytes::from_static(b"pong"));
    }
}
