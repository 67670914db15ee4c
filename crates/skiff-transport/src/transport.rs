//! # Datagram Transports
//!
//! The session reads and writes through [`Transport`]: one datagram per
//! call, never blocking. `recv_from` returns `Ok(None)` when nothing is
//! pending.
//!
//! - [`UdpTransport`]: a non-blocking `std::net::UdpSocket`.
//! - [`MemoryTransport`]: endpoints on an in-process [`MemoryNetwork`] hub,
//!   for tests and benches that must not touch real sockets.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

/// Receive buffer size; larger than any packet we produce.
const RECV_BUFFER_SIZE: usize = 2048;

/// Non-blocking datagram endpoint.
pub trait Transport: Send {
    fn send_to(&mut self, addr: SocketAddr, data: &[u8]) -> io::Result<()>;

    /// Next pending datagram, or `None` if there is none right now.
    fn recv_from(&mut self) -> io::Result<Option<(SocketAddr, Bytes)>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send_to(&mut self, addr: SocketAddr, data: &[u8]) -> io::Result<()> {
        (**self).send_to(addr, data)
    }

    fn recv_from(&mut self) -> io::Result<Option<(SocketAddr, Bytes)>> {
        (**self).recv_from()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }
}

// ─── UDP ────────────────────────────────────────────────────────────────────

pub struct UdpTransport {
    socket: UdpSocket,
    buf: Box<[u8; RECV_BUFFER_SIZE]>,
}

impl UdpTransport {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(UdpTransport {
            socket,
            buf: Box::new([0u8; RECV_BUFFER_SIZE]),
        })
    }
}

impl Transport for UdpTransport {
    fn send_to(&mut self, addr: SocketAddr, data: &[u8]) -> io::Result<()> {
        self.socket.send_to(data, addr).map(|_| ())
    }

    fn recv_from(&mut self) -> io::Result<Option<(SocketAddr, Bytes)>> {
        loop {
            match self.socket.recv_from(&mut self.buf[..]) {
                Ok((n, from)) => return Ok(Some((from, Bytes::copy_from_slice(&self.buf[..n])))),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // ICMP port-unreachable from an earlier send surfaces here on
                // some platforms; it says nothing about the next datagram.
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

// ─── In-Memory ──────────────────────────────────────────────────────────────

type Inbox = VecDeque<(SocketAddr, Bytes)>;

/// In-process datagram hub. Cloning shares the same hub.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inboxes: Arc<Mutex<HashMap<SocketAddr, Inbox>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SocketAddr, Inbox>> {
        // A panicking test thread must not wedge the others.
        self.inboxes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach an endpoint at `addr`.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<MemoryTransport> {
        let mut inboxes = self.lock();
        if inboxes.contains_key(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{addr} already bound"),
            ));
        }
        inboxes.insert(addr, VecDeque::new());
        Ok(MemoryTransport {
            network: self.clone(),
            addr,
        })
    }

    /// Datagrams waiting at `addr`.
    pub fn pending(&self, addr: SocketAddr) -> usize {
        self.lock().get(&addr).map_or(0, VecDeque::len)
    }
}

/// One endpoint on a [`MemoryNetwork`]. Unbinds on drop.
pub struct MemoryTransport {
    network: MemoryNetwork,
    addr: SocketAddr,
}

impl Transport for MemoryTransport {
    fn send_to(&mut self, addr: SocketAddr, data: &[u8]) -> io::Result<()> {
        // Like UDP, sending to nobody silently vanishes.
        if let Some(inbox) = self.network.lock().get_mut(&addr) {
            inbox.push_back((self.addr, Bytes::copy_from_slice(data)));
        }
        Ok(())
    }

    fn recv_from(&mut self) -> io::Result<Option<(SocketAddr, Bytes)>> {
        Ok(self
            .network
            .lock()
            .get_mut(&self.addr)
            .and_then(VecDeque::pop_front))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.lock().remove(&self.addr);
    }
}
