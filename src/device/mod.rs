// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! The device pipeline: a TUN interface and a UDP/TCP bind wired together through
//! bounded queues and worker-thread pools, one `Peer` per remote endpoint, and a UAPI
//! control socket. See `obfuscation` for the traffic-shape layer wrapped around every
//! datagram on the wire, and `noise` (one level up) for the Noise-IK engine itself.
//!
//! Threads, not an event loop: a fixed pool of workers per role (sized to the number
//! of CPUs) reading off `crossbeam_channel` bounded queues, plus one reader thread per
//! TUN/bind source and a single shared maintenance thread driving every peer's
//! timers. This mirrors how the underlying crypto engine here has always been used in
//! production, rather than folding everything into a single epoll/kqueue reactor.

pub mod allowed_ips;
pub mod api;
pub mod bind;
mod dev_lock;
mod drop_privileges;
pub mod index_table;
pub mod obfuscation;
pub mod peer;

#[cfg(target_os = "linux")]
#[path = "tun_linux.rs"]
mod tun;

#[cfg(test)]
mod integration_tests;

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use self::allowed_ips::AllowedIps;
use self::bind::{Bind, Endpoint, TcpBind, UdpBind};
use self::dev_lock::Lock;
use self::index_table::IndexTable;
use self::obfuscation::{msg_type_of, Obfuscation, SharedObfuscation, MSG_TYPE_TRANSPORT};
use self::peer::Peer;
use self::tun::TunSocket;
use crate::noise::rate_limiter::RateLimiter;
use crate::noise::{Tunn, TunnResult};
use crate::x25519;

pub use self::peer::AllowedIP;

/// Userspace-facing error codes the UAPI reports via `errno=N`. Matches the numeric
/// convention wireguard-tools' `wg(8)` and friends expect on this control socket:
/// I/O failures and protocol framing errors get small distinct codes, anything else
/// maps to an opaque "unknown" bucket rather than leaking OS errno values that vary by
/// platform.
pub mod errno {
    pub const IO: i32 = 1;
    pub const PROTOCOL: i32 = 2;
    pub const INVALID: i32 = 3;
    pub const PORT_IN_USE: i32 = 4;
    pub const UNKNOWN: i32 = 5;
}

#[derive(Debug)]
pub enum Error {
    Socket(io::Error),
    ApiSocket(io::Error),
    IfaceRead(io::Error),
    IOCtl(io::Error),
    FCntl(io::Error),
    InvalidTunnelName,
    DropPrivileges(String),
    NotOpen,
    InvalidEndpoint,
    /// A UAPI field failed validation (malformed value, or a cross-field obfuscation
    /// constraint from `Obfuscation::build`).
    Invalid(String),
    PortInUse,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Socket(e) => write!(f, "socket error: {e}"),
            Error::ApiSocket(e) => write!(f, "uapi socket error: {e}"),
            Error::IfaceRead(e) => write!(f, "tun read error: {e}"),
            Error::IOCtl(e) => write!(f, "ioctl error: {e}"),
            Error::FCntl(e) => write!(f, "fcntl error: {e}"),
            Error::InvalidTunnelName => write!(f, "invalid tunnel name"),
            Error::DropPrivileges(s) => write!(f, "failed to drop privileges: {s}"),
            Error::NotOpen => write!(f, "bind is not open"),
            Error::InvalidEndpoint => write!(f, "invalid endpoint"),
            Error::Invalid(s) => write!(f, "{s}"),
            Error::PortInUse => write!(f, "listen port already in use"),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Map this error to the UAPI `errno=` value it should be reported as.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Socket(_)
            | Error::ApiSocket(_)
            | Error::IfaceRead(_)
            | Error::IOCtl(_)
            | Error::FCntl(_)
            | Error::DropPrivileges(_)
            | Error::NotOpen => errno::IO,
            Error::InvalidTunnelName | Error::InvalidEndpoint | Error::Invalid(_) => {
                errno::INVALID
            }
            Error::PortInUse => errno::PORT_IN_USE,
        }
    }
}

/// Transport selection for the underlying bind. UDP is the WireGuard default; TCP
/// exists for networks that block or throttle UDP.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportMode {
    Udp,
    Tcp,
}

pub struct DeviceConfig {
    /// Workers per role (encryption, decryption, handshake). Defaults to the number
    /// of logical CPUs when `None`.
    pub n_threads: Option<usize>,
    pub transport: TransportMode,
    #[cfg(target_os = "linux")]
    pub use_multi_queue: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            n_threads: None,
            transport: TransportMode::Udp,
            #[cfg(target_os = "linux")]
            use_multi_queue: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Down,
    Up,
    Closed,
}

const ENCRYPTION_QUEUE_DEPTH: usize = 1024;
const DECRYPTION_QUEUE_DEPTH: usize = 1024;
const HANDSHAKE_QUEUE_DEPTH: usize = 32;

/// Handshake-queue occupancy at or above this fraction of its capacity flips the
/// under-load latch on; the latch stays on for `UNDER_LOAD_LATCH_TIME` after the last
/// observation at or above the threshold, so a bursty attacker can't toggle cookie
/// enforcement on and off packet-by-packet.
const UNDER_LOAD_QUEUE_FRACTION: f32 = 0.125;
const UNDER_LOAD_LATCH_TIME: Duration = Duration::from_secs(1);

struct EncryptionJob {
    peer: Arc<Peer>,
    packet: Vec<u8>,
}

struct DecryptionJob {
    src: Endpoint,
    /// Already stripped of obfuscation framing: a plain WireGuard message with the
    /// default discriminant restored at offset 0.
    msg: Vec<u8>,
}

struct HandshakeJob {
    src: Endpoint,
    msg: Vec<u8>,
}

/// Everything that changes over the lifetime of the interface: keys, listening
/// socket, peer table, and the obfuscation config, guarded by the cooperative
/// upgradable lock so the hot packet path can hold a read guard indefinitely while
/// UAPI's rare writes still make progress.
pub struct Device {
    state: DeviceState,
    name: String,
    mtu: std::sync::atomic::AtomicUsize,

    private_key: Option<x25519::StaticSecret>,
    public_key: Option<x25519::PublicKey>,
    listen_port: AtomicU16,
    fwmark: Option<u32>,

    bind: Arc<dyn Bind>,
    transport: TransportMode,
    tun: Option<Arc<TunSocket>>,

    peers: std::collections::HashMap<x25519::PublicKey, Arc<Peer>>,
    peers_by_ip: AllowedIps<Arc<Peer>>,
    index_table: Arc<IndexTable>,

    rate_limiter: Option<Arc<RateLimiter>>,
    obfuscation: Mutex<SharedObfuscation>,
    /// Opaque passthrough for the `xray_config` UAPI key: stored and echoed back
    /// verbatim, never parsed or acted on here.
    xray_config: Mutex<Option<String>>,

    under_load_until: Mutex<Option<Instant>>,

    encryption_tx: Sender<EncryptionJob>,
    encryption_rx: Receiver<EncryptionJob>,
    decryption_tx: Sender<DecryptionJob>,
    decryption_rx: Receiver<DecryptionJob>,
    handshake_tx: Sender<HandshakeJob>,
    handshake_rx: Receiver<HandshakeJob>,

    cleanup_paths: Vec<String>,
}

impl Device {
    fn new(name: &str, config: &DeviceConfig) -> Result<Self, Error> {
        let bind: Arc<dyn Bind> = match config.transport {
            TransportMode::Udp => Arc::new(UdpBind::new()),
            TransportMode::Tcp => Arc::new(TcpBind::new()),
        };

        let (encryption_tx, encryption_rx) = bounded(ENCRYPTION_QUEUE_DEPTH);
        let (decryption_tx, decryption_rx) = bounded(DECRYPTION_QUEUE_DEPTH);
        let (handshake_tx, handshake_rx) = bounded(HANDSHAKE_QUEUE_DEPTH);

        Ok(Device {
            state: DeviceState::Down,
            name: name.to_owned(),
            mtu: std::sync::atomic::AtomicUsize::new(1420),
            private_key: None,
            public_key: None,
            listen_port: AtomicU16::new(0),
            fwmark: None,
            bind,
            transport: config.transport,
            tun: None,
            peers: std::collections::HashMap::new(),
            peers_by_ip: AllowedIps::new(),
            index_table: Arc::new(IndexTable::new()),
            rate_limiter: None,
            obfuscation: Mutex::new(Arc::new(Obfuscation::default())),
            xray_config: Mutex::new(None),
            under_load_until: Mutex::new(None),
            encryption_tx,
            encryption_rx,
            decryption_tx,
            decryption_rx,
            handshake_tx,
            handshake_rx,
            cleanup_paths: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    // --- UAPI-facing mutators -------------------------------------------------

    pub fn set_private_key(&mut self, private_key: x25519::StaticSecret) {
        let public_key = x25519::PublicKey::from(&private_key);
        self.rate_limiter = Some(Arc::new(RateLimiter::new(&public_key, 0)));
        for peer in self.peers.values() {
            let mut tunn = peer.tunnel.lock();
            tunn.set_static_private(private_key.clone(), public_key, self.rate_limiter.clone());
        }
        self.private_key = Some(private_key);
        self.public_key = Some(public_key);
    }

    pub fn public_key(&self) -> Option<x25519::PublicKey> {
        self.public_key
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::Relaxed)
    }

    pub fn open_listen_socket(&mut self, port: u16) -> Result<(), Error> {
        self.bind.close().ok();
        let bound_port = self.bind.open(port)?;
        self.listen_port.store(bound_port, Ordering::Relaxed);
        if let Some(mark) = self.fwmark {
            self.bind.set_mark(mark)?;
        }
        Ok(())
    }

    pub fn fwmark(&self) -> Option<u32> {
        self.fwmark
    }

    pub fn set_fwmark(&mut self, mark: u32) -> Result<(), Error> {
        self.fwmark = Some(mark);
        self.bind.set_mark(mark)
    }

    pub fn clear_peers(&mut self) {
        self.peers.clear();
        self.peers_by_ip.clear();
    }

    pub fn peers(&self) -> impl Iterator<Item = (&x25519::PublicKey, &Arc<Peer>)> {
        self.peers.iter()
    }

    /// Validated, atomic obfuscation swap: callers pass the fully assembled candidate
    /// (built and validated by `Obfuscation::build`) and it becomes visible to every
    /// worker thread at once via the `Arc` pointer replace.
    pub fn set_obfuscation(&self, obfuscation: Obfuscation) {
        *self.obfuscation.lock() = Arc::new(obfuscation);
    }

    pub fn obfuscation(&self) -> SharedObfuscation {
        Arc::clone(&self.obfuscation.lock())
    }

    pub fn set_xray_config(&self, config: Option<String>) {
        *self.xray_config.lock() = config;
    }

    pub fn xray_config(&self) -> Option<String> {
        self.xray_config.lock().clone()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_peer(
        &mut self,
        public_key: x25519::PublicKey,
        remove: bool,
        update_only: bool,
        replace_ips: bool,
        endpoint: Option<SocketAddr>,
        allowed_ips: &[AllowedIP],
        removed_allowed_ips: &[AllowedIP],
        keepalive: Option<u16>,
        preshared_key: Option<[u8; 32]>,
    ) {
        if remove {
            if let Some(peer) = self.peers.remove(&public_key) {
                self.index_table.remove_by_peer(&peer);
                self.peers_by_ip.remove(&|p: &Arc<Peer>| Arc::ptr_eq(p, &peer));
            }
            return;
        }

        if let Some(peer) = self.peers.get(&public_key) {
            if replace_ips {
                peer.clear_allowed_ips();
                self.peers_by_ip
                    .remove(&|p: &Arc<Peer>| Arc::ptr_eq(p, peer));
            }
            for ip in removed_allowed_ips {
                peer.remove_allowed_ip(ip.addr, ip.cidr as u32);
                self.peers_by_ip.remove_exact(ip.addr, ip.cidr as u32, &|p: &Arc<Peer>| {
                    Arc::ptr_eq(p, peer)
                });
            }
            for ip in allowed_ips {
                peer.add_allowed_ip(ip.addr, ip.cidr as u32);
                self.peers_by_ip
                    .insert(ip.addr, ip.cidr as u32, Arc::clone(peer));
            }
            if let Some(addr) = endpoint {
                peer.set_endpoint(Endpoint(addr));
            }
            if let Some(secs) = keepalive {
                peer.set_persistent_keepalive(secs);
            }
            if let Some(key) = preshared_key {
                peer.set_preshared_key(key);
            }
            return;
        }

        // `update_only` asks that this section be a no-op for a peer that doesn't
        // already exist, rather than implicitly creating one.
        if update_only {
            return;
        }

        let private_key = match &self.private_key {
            Some(k) => k.clone(),
            None => return,
        };

        let tunn = Tunn::new(
            private_key,
            public_key,
            preshared_key,
            keepalive,
            0,
            self.rate_limiter.clone(),
        );
        let peer = Arc::new(Peer::new(
            tunn,
            public_key,
            endpoint.map(Endpoint),
            allowed_ips,
            preshared_key,
            keepalive,
        ));
        for ip in allowed_ips {
            self.peers_by_ip
                .insert(ip.addr, ip.cidr as u32, Arc::clone(&peer));
        }
        self.peers.insert(public_key, peer);
    }

    // --- load tracking ---------------------------------------------------------

    fn note_handshake_queue_depth(&self, depth: usize, capacity: usize) {
        let loaded = depth as f32 >= capacity as f32 * UNDER_LOAD_QUEUE_FRACTION;
        let mut until = self.under_load_until.lock();
        if loaded {
            *until = Some(Instant::now() + UNDER_LOAD_LATCH_TIME);
        }
    }

    fn is_under_load(&self) -> bool {
        match *self.under_load_until.lock() {
            Some(t) => Instant::now() < t,
            None => false,
        }
    }

    // --- packet-path helpers -----------------------------------------------

    /// Bind a freshly minted local index (read back out of an outbound handshake
    /// init/response buffer) to the peer that owns it, so future inbound packets
    /// carrying that receiver index route back here.
    fn note_outbound_handshake_buffer(&self, peer: &Arc<Peer>, buf: &[u8]) {
        if buf.len() < 8 {
            return;
        }
        let msg_type = match msg_type_of(buf[0]) {
            Some(t) => t,
            None => return,
        };
        if msg_type == obfuscation::MSG_TYPE_INIT || msg_type == obfuscation::MSG_TYPE_RESPONSE {
            let index = u32::from_le_bytes(buf[4..8].try_into().unwrap());
            self.index_table.insert(index, Arc::clone(peer));
        }
    }

    fn send_framed(&self, msg_type: usize, buf: &[u8], dst: &Endpoint) -> Result<(), Error> {
        let framed = self.obfuscation().frame_outbound(msg_type, buf);
        self.bind.send(&framed, dst)
    }

    fn encrypt_and_send(&self, peer: &Arc<Peer>, packet: &[u8]) {
        let endpoint = match peer.endpoint() {
            Some(e) => e,
            None => return,
        };
        let mut dst = vec![0u8; packet.len() + 148];
        let result = peer.tunnel.lock().encapsulate(packet, &mut dst);
        self.handle_tunn_result(peer, &endpoint, result);
    }

    fn handle_tunn_result(&self, peer: &Arc<Peer>, endpoint: &Endpoint, result: TunnResult<'_>) {
        match result {
            TunnResult::Done => {}
            TunnResult::Err(e) => {
                tracing::debug!(message = "noise error", peer = ?peer.public_key(), error = ?e);
            }
            TunnResult::WriteToNetwork(buf) => {
                self.note_outbound_handshake_buffer(peer, buf);
                let msg_type = msg_type_of(buf[0]).unwrap_or(MSG_TYPE_TRANSPORT);
                if let Err(e) = self.send_framed(msg_type, buf, endpoint) {
                    tracing::debug!(message = "send failed", error = ?e);
                }
            }
            TunnResult::WriteToTunnelV4(..) | TunnResult::WriteToTunnelV6(..) => {
                // decapsulate() alone ever produces tunnel-bound output; encapsulate()
                // never does.
                unreachable!("encapsulate produced a tunnel-bound result")
            }
        }
    }

    /// Drain any handshake-initiation or queued-data retries this peer still owes the
    /// network after a timer tick or a freshly installed session.
    fn flush_retries(&self, peer: &Arc<Peer>) {
        let endpoint = match peer.endpoint() {
            Some(e) => e,
            None => return,
        };
        loop {
            let mut dst = vec![0u8; 2048];
            let result = peer.tunnel.lock().decapsulate(None, &[], &mut dst, false);
            match result {
                TunnResult::Done => break,
                other => self.handle_tunn_result(peer, &endpoint, other),
            }
        }
    }
}

/// Owns the background threads driving a `Device` and exposes the lifecycle and
/// thread-safe handle the UAPI listener and CLI entry point operate through.
pub struct DeviceHandle {
    device: Arc<Lock<Device>>,
    threads: Vec<std::thread::JoinHandle<()>>,
    running: Arc<AtomicBool>,
    tun_name: String,
    api_cleanup: Arc<Mutex<Vec<String>>>,
}

impl DeviceHandle {
    pub fn new(name: &str, config: DeviceConfig) -> Result<DeviceHandle, Error> {
        let device = Device::new(name, &config)?;
        let device = Arc::new(Lock::new(device));
        let running = Arc::new(AtomicBool::new(true));

        let mut handle = DeviceHandle {
            device,
            threads: Vec::new(),
            running,
            tun_name: name.to_owned(),
            api_cleanup: Arc::new(Mutex::new(Vec::new())),
        };
        handle.spawn_workers(config.n_threads.unwrap_or_else(num_cpus::get));
        handle.spawn_tun_reader()?;
        handle.spawn_bind_receiver();
        handle.spawn_maintenance_thread();
        handle.register_api_handler()?;
        Ok(handle)
    }

    pub fn device(&self) -> &Arc<Lock<Device>> {
        &self.device
    }

    fn spawn_workers(&mut self, n: usize) {
        let n = n.max(1);
        for _ in 0..n {
            self.threads.push(self.spawn_encryption_worker());
        }
        for _ in 0..n {
            self.threads.push(self.spawn_decryption_worker());
        }
        for _ in 0..n {
            self.threads.push(self.spawn_handshake_worker());
        }
    }

    fn spawn_encryption_worker(&self) -> std::thread::JoinHandle<()> {
        let device = Arc::clone(&self.device);
        let running = Arc::clone(&self.running);
        let rx = device.read().encryption_rx.clone();
        std::thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                match rx.recv_timeout(Duration::from_millis(250)) {
                    Ok(job) => {
                        let d = device.read();
                        d.encrypt_and_send(&job.peer, &job.packet);
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            }
        })
    }

    fn spawn_decryption_worker(&self) -> std::thread::JoinHandle<()> {
        let device = Arc::clone(&self.device);
        let running = Arc::clone(&self.running);
        let rx = device.read().decryption_rx.clone();
        std::thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                match rx.recv_timeout(Duration::from_millis(250)) {
                    Ok(job) => Self::handle_decryption_job(&device, job),
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            }
        })
    }

    fn handle_decryption_job(device: &Arc<Lock<Device>>, job: DecryptionJob) {
        if job.msg.len() < 8 {
            return;
        }
        let receiver_idx = u32::from_le_bytes(job.msg[4..8].try_into().unwrap());
        let d = device.read();
        let peer = match d.index_table.lookup(receiver_idx) {
            Some(p) => p,
            None => return,
        };
        let under_load = d.is_under_load();
        let mut dst = vec![0u8; job.msg.len() + 32];
        let result = peer
            .tunnel
            .lock()
            .decapsulate(Some(job.src.0.ip()), &job.msg, &mut dst, under_load);
        match result {
            TunnResult::Done => {}
            TunnResult::Err(e) => {
                tracing::debug!(message = "decapsulate error", error = ?e);
            }
            TunnResult::WriteToNetwork(buf) => {
                d.note_outbound_handshake_buffer(&peer, buf);
                let msg_type = msg_type_of(buf[0]).unwrap_or(MSG_TYPE_TRANSPORT);
                if let Err(e) = d.send_framed(msg_type, buf, &job.src) {
                    tracing::debug!(message = "send failed", error = ?e);
                }
            }
            TunnResult::WriteToTunnelV4(buf, addr) => {
                if peer.is_allowed_ip(addr) {
                    peer.roam_to(job.src.clone());
                    d.tun_write(buf);
                }
            }
            TunnResult::WriteToTunnelV6(buf, addr) => {
                if peer.is_allowed_ip(addr) {
                    peer.roam_to(job.src.clone());
                    d.tun_write(buf);
                }
            }
        }
        drop(d);
        let d = device.read();
        d.flush_retries(&peer);
    }

    fn spawn_handshake_worker(&self) -> std::thread::JoinHandle<()> {
        let device = Arc::clone(&self.device);
        let running = Arc::clone(&self.running);
        let rx = device.read().handshake_rx.clone();
        std::thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                device
                    .read()
                    .note_handshake_queue_depth(rx.len(), HANDSHAKE_QUEUE_DEPTH);
                match rx.recv_timeout(Duration::from_millis(250)) {
                    Ok(job) => Self::handle_handshake_job(&device, job),
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            }
        })
    }

    fn handle_handshake_job(device: &Arc<Lock<Device>>, job: HandshakeJob) {
        let d = device.read();
        let under_load = d.is_under_load();

        let peer = match job.msg.first().copied() {
            Some(1) => {
                // Handshake initiation: the sender is unknown until we decrypt the
                // embedded static public key with our own static private key.
                let (private, public) = match (&d.private_key, d.public_key) {
                    (Some(k), Some(p)) => (k, p),
                    _ => return,
                };
                let parsed = match Tunn::parse_incoming_packet(&job.msg) {
                    Ok(crate::noise::Packet::HandshakeInit(init)) => init,
                    _ => return,
                };
                let half = match crate::noise::handshake::parse_handshake_anon(
                    private, &public, &parsed,
                ) {
                    Ok(h) => h,
                    Err(_) => return,
                };
                let remote_public = x25519::PublicKey::from(half.peer_static_public);
                match d.peers.get(&remote_public) {
                    Some(p) => Arc::clone(p),
                    None => return,
                }
            }
            Some(2) if job.msg.len() >= 12 => {
                // Handshake response: the index to route on is the *local* index this
                // side minted for the initiation, i.e. receiver_idx at [8..12] (see
                // noise/mod.rs's parser) — not sender_idx at [4..8], which is the
                // remote's own index and was never registered in this index_table.
                let receiver_idx = u32::from_le_bytes(job.msg[8..12].try_into().unwrap());
                match d.index_table.lookup(receiver_idx) {
                    Some(p) => p,
                    None => return,
                }
            }
            Some(3) if job.msg.len() >= 8 => {
                let receiver_idx = u32::from_le_bytes(job.msg[4..8].try_into().unwrap());
                match d.index_table.lookup(receiver_idx) {
                    Some(p) => p,
                    None => return,
                }
            }
            _ => return,
        };

        let mut dst = vec![0u8; 512];
        let result = peer
            .tunnel
            .lock()
            .decapsulate(Some(job.src.0.ip()), &job.msg, &mut dst, under_load);
        if !matches!(&result, TunnResult::Err(_)) {
            peer.roam_to(job.src.clone());
        }
        d.handle_tunn_result(&peer, &job.src, result);
        drop(d);
        let d = device.read();
        d.flush_retries(&peer);
    }

    fn spawn_tun_reader(&mut self) -> Result<(), Error> {
        let tun = Arc::new(TunSocket::new(&self.tun_name)?.set_non_blocking()?);
        {
            let mut guard = self.device.read();
            let installed = Arc::clone(&tun);
            guard.try_writeable(
                |_| {},
                move |device| {
                    device.tun = Some(installed);
                },
            );
        }
        let device = Arc::clone(&self.device);
        let running = Arc::clone(&self.running);
        self.threads.push(std::thread::spawn(move || {
            let mut buf = vec![0u8; 2048];
            while running.load(Ordering::Relaxed) {
                let packet = match tun.read(&mut buf) {
                    Ok(p) => p,
                    Err(_) => {
                        std::thread::sleep(Duration::from_millis(10));
                        continue;
                    }
                };
                if packet.is_empty() {
                    continue;
                }
                let dst_ip = match parse_dst_ip(packet) {
                    Some(ip) => ip,
                    None => continue,
                };
                let d = device.read();
                let peer = d.peers_by_ip.find(dst_ip).cloned();
                if let Some(peer) = peer {
                    let job = EncryptionJob {
                        peer,
                        packet: packet.to_vec(),
                    };
                    if let Err(TrySendError::Full(_)) = d.encryption_tx.try_send(job) {
                        tracing::debug!("encryption queue full, dropping packet");
                    }
                }
            }
        }));
        Ok(())
    }

    fn spawn_bind_receiver(&mut self) {
        let device = Arc::clone(&self.device);
        let running = Arc::clone(&self.running);
        self.threads.push(std::thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                let (bind, obfuscation) = {
                    let d = device.read();
                    (Arc::clone(&d.bind), d.obfuscation())
                };
                let batch = match bind.recv_batch() {
                    Ok(b) => b,
                    Err(_) => {
                        std::thread::sleep(Duration::from_millis(50));
                        continue;
                    }
                };
                let d = device.read();
                for (src, datagram) in batch {
                    let msg = match obfuscation.strip_inbound(&datagram) {
                        Some(m) => m,
                        None => continue,
                    };
                    if msg.is_empty() {
                        continue;
                    }
                    match msg[0] {
                        1 | 2 | 3 => {
                            let job = HandshakeJob {
                                src,
                                msg,
                            };
                            let _ = d.handshake_tx.try_send(job);
                        }
                        4 => {
                            let job = DecryptionJob { src, msg };
                            if let Err(TrySendError::Full(_)) = d.decryption_tx.try_send(job) {
                                tracing::debug!("decryption queue full, dropping datagram");
                            }
                        }
                        _ => {}
                    }
                }
            }
        }));
    }

    /// One thread, not one per peer: iterates every peer on a fixed tick and drives
    /// `Tunn::update_timers`, the same granularity the proven timer state machine in
    /// `noise::timers` was designed and tested against. A thread per peer would only
    /// add scheduling overhead without changing what gets sent or when.
    fn spawn_maintenance_thread(&mut self) {
        let device = Arc::clone(&self.device);
        let running = Arc::clone(&self.running);
        self.threads.push(std::thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(250));
                let d = device.read();
                if d.private_key.is_none() {
                    continue;
                }
                for peer in d.peers.values() {
                    let endpoint = match peer.endpoint() {
                        Some(e) => e,
                        None => continue,
                    };
                    let mut dst = vec![0u8; 256];
                    let result = peer.tunnel.lock().update_timers(&mut dst);
                    d.handle_tunn_result(peer, &endpoint, result);
                }
            }
        }));
    }

    pub fn up(&self) -> Result<(), Error> {
        let mut d = self.device.read();
        d.try_writeable(
            |_| {},
            |device| {
                device.state = DeviceState::Up;
            },
        );
        Ok(())
    }

    pub fn down(&self) -> Result<(), Error> {
        let mut d = self.device.read();
        d.try_writeable(
            |_| {},
            |device| {
                device.state = DeviceState::Down;
            },
        );
        Ok(())
    }

    pub fn close(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        for path in self.api_cleanup.lock().drain(..) {
            let _ = std::fs::remove_file(path);
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        let mut d = self.device.read();
        d.try_writeable(
            |_| {},
            |device| {
                device.state = DeviceState::Closed;
            },
        );
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        for path in self.api_cleanup.lock().drain(..) {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Device {
    fn tun_write(&self, buf: &[u8]) {
        if let Some(tun) = &self.tun {
            tun.write4(buf);
        }
    }
}

fn parse_dst_ip(packet: &[u8]) -> Option<IpAddr> {
    if packet.is_empty() {
        return None;
    }
    match packet[0] >> 4 {
        4 if packet.len() >= 20 => Some(IpAddr::from([
            packet[16], packet[17], packet[18], packet[19],
        ])),
        6 if packet.len() >= 40 => {
            let mut addr = [0u8; 16];
            addr.copy_from_slice(&packet[24..40]);
            Some(IpAddr::from(addr))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x25519::{PublicKey, StaticSecret};
    use rand_core::OsRng;

    fn fresh_device() -> Device {
        let mut device = Device::new("test0", &DeviceConfig::default()).unwrap();
        device.set_private_key(StaticSecret::random_from_rng(OsRng));
        device
    }

    fn random_public_key() -> PublicKey {
        PublicKey::from(&StaticSecret::random_from_rng(OsRng))
    }

    #[test]
    fn under_load_trips_at_one_eighth_capacity() {
        let device = fresh_device();
        assert!(!device.is_under_load());
        // one-eighth of HANDSHAKE_QUEUE_DEPTH (32) is 4.
        device.note_handshake_queue_depth(3, HANDSHAKE_QUEUE_DEPTH);
        assert!(!device.is_under_load());
        device.note_handshake_queue_depth(4, HANDSHAKE_QUEUE_DEPTH);
        assert!(device.is_under_load());
    }

    #[test]
    fn update_peer_creates_updates_and_removes() {
        let mut device = fresh_device();
        let public_key = random_public_key();
        let allowed = [AllowedIP {
            addr: "10.0.0.1".parse().unwrap(),
            cidr: 32,
        }];

        device.update_peer(
            public_key, false, false, false, None, &allowed, &[], None, None,
        );
        assert!(device.peers.contains_key(&public_key));
        assert_eq!(
            device
                .peers_by_ip
                .find("10.0.0.1".parse().unwrap())
                .is_some(),
            true
        );

        let keepalive = Some(25u16);
        device.update_peer(
            public_key, false, false, false, None, &[], &[], keepalive, None,
        );
        assert_eq!(device.peers[&public_key].persistent_keepalive(), 25);

        device.update_peer(
            public_key, false, false, false, None, &[], &allowed, None, None,
        );
        assert!(device
            .peers_by_ip
            .find("10.0.0.1".parse().unwrap())
            .is_none());

        device.update_peer(public_key, true, false, false, None, &[], &[], None, None);
        assert!(!device.peers.contains_key(&public_key));
    }

    #[test]
    fn update_only_skips_creation_of_unknown_peer() {
        let mut device = fresh_device();
        let public_key = random_public_key();
        device.update_peer(public_key, false, true, false, None, &[], &[], None, None);
        assert!(!device.peers.contains_key(&public_key));
    }

    #[test]
    fn preshared_key_can_be_set_on_an_existing_peer() {
        let mut device = fresh_device();
        let public_key = random_public_key();
        device.update_peer(public_key, false, false, false, None, &[], &[], None, None);
        let psk = [7u8; 32];
        device.update_peer(
            public_key,
            false,
            false,
            false,
            None,
            &[],
            &[],
            None,
            Some(psk),
        );
        assert_eq!(device.peers[&public_key].preshared_key(), Some(psk));
    }
}
