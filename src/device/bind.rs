//! Transport abstraction: a `Bind` is a capability set `{open, close, send, set_mark,
//! parse_endpoint, batch_size}`, dispatched statically at device construction (no
//! runtime type reflection). Two implementations ship here: plain UDP, the default,
//! and a length-prefixed TCP-stream transport for environments where UDP is blocked.

use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;

use super::Error;

/// An opaque transport endpoint. Binds are free to attach connection state (e.g. a
/// cached TCP stream) behind this; the device only ever compares and displays it.
#[derive(Clone, Debug)]
pub struct Endpoint(pub SocketAddr);

impl Endpoint {
    pub fn dst_to_string(&self) -> String {
        self.0.to_string()
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl std::str::FromStr for Endpoint {
    type Err = io::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(Endpoint)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }
}

/// A batch of `(endpoint, datagram)` pairs read by one receiver-thread iteration.
pub type ReceiveBatch = Vec<(Endpoint, Vec<u8>)>;

pub trait Bind: Send + Sync {
    /// Open the transport on `port` (0 = pick any free port), returning the actual
    /// bound port. After this call, `recv_batch` may be invoked from one or more
    /// receiver threads.
    fn open(&self, port: u16) -> Result<u16, Error>;
    fn close(&self) -> Result<(), Error>;
    fn send(&self, buf: &[u8], dst: &Endpoint) -> Result<(), Error>;
    fn set_mark(&self, mark: u32) -> Result<(), Error>;
    fn parse_endpoint(&self, s: &str) -> Result<Endpoint, Error>;
    /// Ideal number of datagrams to read per receive-loop iteration.
    fn batch_size(&self) -> usize;
    /// Block for up to one batch of inbound datagrams. Returns an empty batch on a
    /// harmless timeout so the caller can check for shutdown; returns `Err` only on a
    /// fatal I/O condition, after which the receiver thread exits.
    fn recv_batch(&self) -> Result<ReceiveBatch, Error>;
}

const IDEAL_BATCH_SIZE: usize = 256;

/// The default transport: one UDP socket per address family, receiving directly into
/// caller-provided buffers.
pub struct UdpBind {
    socket: Mutex<Option<Socket>>,
}

impl UdpBind {
    pub fn new() -> Self {
        UdpBind {
            socket: Mutex::new(None),
        }
    }
}

impl Default for UdpBind {
    fn default() -> Self {
        Self::new()
    }
}

impl Bind for UdpBind {
    fn open(&self, port: u16) -> Result<u16, Error> {
        let addr: SocketAddr = (std::net::Ipv6Addr::UNSPECIFIED, port).into();
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
            .map_err(Error::Socket)?;
        socket.set_only_v6(false).ok();
        socket.bind(&addr.into()).map_err(Error::Socket)?;
        socket.set_nonblocking(true).map_err(Error::Socket)?;
        let bound = socket
            .local_addr()
            .map_err(Error::Socket)?
            .as_socket()
            .ok_or_else(|| Error::Socket(io::Error::new(io::ErrorKind::Other, "no local addr")))?;
        *self.socket.lock() = Some(socket);
        Ok(bound.port())
    }

    fn close(&self) -> Result<(), Error> {
        self.socket.lock().take();
        Ok(())
    }

    fn send(&self, buf: &[u8], dst: &Endpoint) -> Result<(), Error> {
        let guard = self.socket.lock();
        let socket = guard.as_ref().ok_or(Error::NotOpen)?;
        socket
            .send_to(buf, &SockAddr::from(dst.0))
            .map_err(Error::Socket)?;
        Ok(())
    }

    #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
    fn set_mark(&self, mark: u32) -> Result<(), Error> {
        let guard = self.socket.lock();
        let socket = guard.as_ref().ok_or(Error::NotOpen)?;
        socket.set_mark(mark).map_err(Error::Socket)
    }

    #[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
    fn set_mark(&self, _mark: u32) -> Result<(), Error> {
        Ok(())
    }

    fn parse_endpoint(&self, s: &str) -> Result<Endpoint, Error> {
        use std::str::FromStr;
        Endpoint::from_str(s).map_err(|_| Error::InvalidEndpoint)
    }

    fn batch_size(&self) -> usize {
        IDEAL_BATCH_SIZE
    }

    fn recv_batch(&self) -> Result<ReceiveBatch, Error> {
        let mut out = Vec::new();
        let guard = self.socket.lock();
        let socket = match guard.as_ref() {
            Some(s) => s,
            None => return Ok(out),
        };
        let mut buf = [std::mem::MaybeUninit::new(0u8); 65535];
        for _ in 0..self.batch_size() {
            match socket.recv_from(&mut buf) {
                Ok((n, addr)) => {
                    let bytes: Vec<u8> = buf[..n].iter().map(|b| unsafe { b.assume_init() }).collect();
                    if let Some(addr) = addr.as_socket() {
                        out.push((Endpoint(addr), bytes));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    if out.is_empty() {
                        return Err(Error::Socket(e));
                    }
                    break;
                }
            }
        }
        if out.is_empty() {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        Ok(out)
    }
}

/// Length-prefixed TCP-stream transport: each send/receive frames the payload with a
/// 2-byte little-endian length, one connection per remote endpoint, demultiplexed by
/// remote address.
pub struct TcpBind {
    listener: Mutex<Option<TcpListener>>,
    conns: Mutex<HashMap<SocketAddr, Arc<Mutex<TcpStream>>>>,
}

impl TcpBind {
    pub fn new() -> Self {
        TcpBind {
            listener: Mutex::new(None),
            conns: Mutex::new(HashMap::new()),
        }
    }

    fn connection_for(&self, dst: SocketAddr) -> Result<Arc<Mutex<TcpStream>>, Error> {
        let mut conns = self.conns.lock();
        if let Some(conn) = conns.get(&dst) {
            return Ok(Arc::clone(conn));
        }
        let stream = TcpStream::connect(dst).map_err(Error::Socket)?;
        stream.set_nodelay(true).ok();
        let conn = Arc::new(Mutex::new(stream));
        conns.insert(dst, Arc::clone(&conn));
        Ok(conn)
    }
}

impl Default for TcpBind {
    fn default() -> Self {
        Self::new()
    }
}

impl Bind for TcpBind {
    fn open(&self, port: u16) -> Result<u16, Error> {
        let addr: SocketAddr = (std::net::Ipv6Addr::UNSPECIFIED, port).into();
        let listener = TcpListener::bind(addr).map_err(Error::Socket)?;
        listener.set_nonblocking(true).map_err(Error::Socket)?;
        let bound_port = listener.local_addr().map_err(Error::Socket)?.port();
        *self.listener.lock() = Some(listener);
        Ok(bound_port)
    }

    fn close(&self) -> Result<(), Error> {
        self.listener.lock().take();
        self.conns.lock().clear();
        Ok(())
    }

    fn send(&self, buf: &[u8], dst: &Endpoint) -> Result<(), Error> {
        use std::io::Write;
        let conn = self.connection_for(dst.0)?;
        let mut stream = conn.lock();
        let len = (buf.len() as u16).to_le_bytes();
        stream.write_all(&len).map_err(Error::Socket)?;
        stream.write_all(buf).map_err(Error::Socket)?;
        Ok(())
    }

    fn set_mark(&self, _mark: u32) -> Result<(), Error> {
        Ok(())
    }

    fn parse_endpoint(&self, s: &str) -> Result<Endpoint, Error> {
        use std::str::FromStr;
        Endpoint::from_str(s).map_err(|_| Error::InvalidEndpoint)
    }

    fn batch_size(&self) -> usize {
        IDEAL_BATCH_SIZE
    }

    fn recv_batch(&self) -> Result<ReceiveBatch, Error> {
        use std::io::Read;

        // Accept any pending inbound connections first.
        if let Some(listener) = self.listener.lock().as_ref() {
            while let Ok((stream, addr)) = listener.accept() {
                stream.set_nonblocking(true).ok();
                stream.set_nodelay(true).ok();
                self.conns
                    .lock()
                    .insert(addr, Arc::new(Mutex::new(stream)));
            }
        }

        let mut out = Vec::new();
        let conns = self.conns.lock().clone();
        let mut dead = Vec::new();
        for (addr, conn) in conns {
            let mut stream = conn.lock();
            let mut len_buf = [0u8; 2];
            match stream.read_exact(&mut len_buf) {
                Ok(()) => {
                    let len = u16::from_le_bytes(len_buf) as usize;
                    let mut payload = vec![0u8; len];
                    if stream.read_exact(&mut payload).is_ok() {
                        out.push((Endpoint(addr), payload));
                    } else {
                        dead.push(addr);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => dead.push(addr),
            }
            if out.len() >= self.batch_size() {
                break;
            }
        }
        if !dead.is_empty() {
            let mut conns = self.conns.lock();
            for addr in dead {
                conns.remove(&addr);
            }
        }
        if out.is_empty() {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        Ok(out)
    }
}
