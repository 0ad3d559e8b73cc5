// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! UAPI: a line-oriented text protocol over a Unix domain socket at
//! `/var/run/wireguard/{iface}.sock`, compatible with `wg(8)` for the fields it
//! shares with stock WireGuard, plus this implementation's obfuscation knobs
//! (`jc`/`jmin`/`jmax`/`s1..s4`/`h1..h4`/`i1..i5`) and an opaque `xray_config`
//! passthrough.
//!
//! Only two commands are legal: `get=1` and `set=1`, each followed by `key=value`
//! lines and terminated by a blank line. The response is always `errno=N` followed by
//! a blank line; `get=1` additionally emits its key/value lines first.
//!
//! `set=1` is a single transaction: ordinary fields (keys, port, fwmark, peers) apply
//! as each line is parsed and are never rolled back. Obfuscation fields accumulate
//! into a scratch copy of the current configuration and are validated together, as a
//! unit, only once the whole command has been read; a validation failure at that
//! point reports `errno=3` but does not undo whatever ordinary fields already took
//! effect earlier in the same transaction.

use super::dev_lock::LockReadGuard;
use super::drop_privileges::get_saved_ids;
use super::obfuscation::{MagicHeader, Obfuscation, SpecialJunkGenerator};
use super::peer::AllowedIP;
use super::{errno, Device, DeviceHandle, Error};
use crate::serialization::KeyBytes;
use crate::x25519;
use hex::encode as encode_hex;
use std::fs::{create_dir, remove_file};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::SocketAddr;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;

const SOCK_DIR: &str = "/var/run/wireguard/";

fn create_sock_dir() {
    let _ = create_dir(SOCK_DIR);

    if let Ok((saved_uid, saved_gid)) = get_saved_ids() {
        unsafe {
            let c_path = std::ffi::CString::new(SOCK_DIR).unwrap();
            // The directory is created while still privileged; hand ownership to the
            // unprivileged user so the socket file can be removed on shutdown.
            libc::chown(
                c_path.as_bytes_with_nul().as_ptr() as _,
                saved_uid,
                saved_gid,
            );
        }
    }
}

impl DeviceHandle {
    /// Bind the control socket and spawn the thread that accepts and serves UAPI
    /// connections, one at a time, for the lifetime of the device.
    pub fn register_api_handler(&mut self) -> Result<(), Error> {
        let path = format!("{}{}.sock", SOCK_DIR, self.tun_name);

        create_sock_dir();
        let _ = remove_file(&path);

        let listener = UnixListener::bind(&path).map_err(Error::ApiSocket)?;
        listener.set_nonblocking(true).map_err(Error::ApiSocket)?;
        self.api_cleanup.lock().push(path);

        let device = Arc::clone(&self.device);
        let running = Arc::clone(&self.running);
        self.threads.push(std::thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                let (conn, _) = match listener.accept() {
                    Ok(c) => c,
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(std::time::Duration::from_millis(50));
                        continue;
                    }
                    Err(_) => continue,
                };
                conn.set_nonblocking(false).ok();
                serve_connection(&device, conn);
            }
        }));

        Ok(())
    }

    /// Serve UAPI requests over an already-open file descriptor (used when the
    /// caller, rather than this implementation, owns the listening socket).
    pub fn register_api_fd(&mut self, fd: std::os::unix::io::RawFd) -> Result<(), Error> {
        use std::os::unix::io::FromRawFd;
        let stream = unsafe { UnixStream::from_raw_fd(fd) };
        let device = Arc::clone(&self.device);
        serve_connection(&device, stream);
        Ok(())
    }
}

fn serve_connection(device: &Arc<super::dev_lock::Lock<Device>>, conn: UnixStream) {
    let mut reader = BufReader::new(&conn);
    let mut writer = BufWriter::new(&conn);
    let mut cmd = String::new();
    if reader.read_line(&mut cmd).is_ok() {
        let cmd = cmd.trim_end().to_owned();
        let status = match cmd.as_str() {
            "get=1" => api_get(&mut writer, &device.read()),
            "set=1" => api_set(&mut reader, &mut device.read()),
            _ => errno::PROTOCOL,
        };
        writeln!(writer, "errno={}\n", status).ok();
    }
}

#[allow(unused_must_use)]
fn api_get(writer: &mut BufWriter<&UnixStream>, d: &Device) -> i32 {
    if let Some(public) = d.public_key() {
        writeln!(writer, "own_public_key={}", encode_hex(public.as_bytes()));
    }

    let port = d.listen_port();
    if port != 0 {
        writeln!(writer, "listen_port={}", port);
    }

    if let Some(fwmark) = d.fwmark() {
        writeln!(writer, "fwmark={}", fwmark);
    }

    if let Some(config) = d.xray_config() {
        writeln!(writer, "xray_config={}", config);
    }

    let obfuscation = d.obfuscation();
    if obfuscation.is_enabled() {
        writeln!(writer, "jc={}", obfuscation.jc);
        writeln!(writer, "jmin={}", obfuscation.jmin);
        writeln!(writer, "jmax={}", obfuscation.jmax);
        for (i, size) in obfuscation.junk_size.iter().enumerate() {
            writeln!(writer, "s{}={}", i + 1, size);
        }
        for (i, magic) in obfuscation.magic.iter().enumerate() {
            writeln!(writer, "h{}={}-{}", i + 1, magic.min, magic.max);
        }
    }

    for (public_key, peer) in d.peers() {
        writeln!(writer, "public_key={}", encode_hex(public_key.as_bytes()));

        if let Some(key) = peer.preshared_key() {
            writeln!(writer, "preshared_key={}", encode_hex(key));
        }

        writeln!(writer, "protocol_version=1");

        if peer.persistent_keepalive() != 0 {
            writeln!(
                writer,
                "persistent_keepalive_interval={}",
                peer.persistent_keepalive()
            );
        }

        if let Some(endpoint) = peer.endpoint() {
            writeln!(writer, "endpoint={}", endpoint.dst_to_string());
        }

        for (ip, cidr) in peer.allowed_ips() {
            writeln!(writer, "allowed_ip={}/{}", ip, cidr);
        }

        if let Some(time) = peer.time_since_last_handshake() {
            writeln!(writer, "last_handshake_time_sec={}", time.as_secs());
            writeln!(writer, "last_handshake_time_nsec={}", time.subsec_nanos());
        }

        let (_, tx_bytes, rx_bytes) = peer.stats();
        writeln!(writer, "rx_bytes={}", rx_bytes);
        writeln!(writer, "tx_bytes={}", tx_bytes);
    }

    0
}

/// The obfuscation fields collected over one `set=1` transaction, seeded from the
/// device's current configuration so fields absent from this transaction keep their
/// previous value.
struct ObfuscationScratch {
    jc: u16,
    jmin: u16,
    jmax: u16,
    s: [usize; 4],
    h: [Option<MagicHeader>; 4],
    special_junk: [Option<SpecialJunkGenerator>; 5],
    touched: bool,
}

impl ObfuscationScratch {
    fn seeded_from(current: &Obfuscation) -> Self {
        ObfuscationScratch {
            jc: current.jc,
            jmin: current.jmin,
            jmax: current.jmax,
            s: current.junk_size,
            h: current.magic.map(Some),
            special_junk: Default::default(),
            touched: false,
        }
    }

    fn build(&self) -> Result<Obfuscation, String> {
        let special_junk = self.special_junk.iter().filter_map(|g| g.clone()).collect();
        Obfuscation::build(self.jc, self.jmin, self.jmax, self.s, self.h, special_junk)
    }
}

fn parse_magic_header(val: &str) -> Result<MagicHeader, String> {
    if let Some((lo, hi)) = val.split_once('-') {
        let min = lo
            .parse::<u32>()
            .map_err(|_| format!("invalid magic header: {val}"))?;
        let max = hi
            .parse::<u32>()
            .map_err(|_| format!("invalid magic header: {val}"))?;
        Ok(MagicHeader { min, max })
    } else {
        let v = val
            .parse::<u32>()
            .map_err(|_| format!("invalid magic header: {val}"))?;
        Ok(MagicHeader { min: v, max: v })
    }
}

/// Two-pass `set=1` body parsing: every line is buffered first so a (possibly
/// multi-line, though in practice single-line) `xray_config=` entry can be pulled out
/// before the remainder is scanned as ordinary settings. The xray engine itself is
/// out of scope here; the value is only ever stored and echoed back.
fn api_set(reader: &mut BufReader<&UnixStream>, d: &mut LockReadGuard<Device>) -> i32 {
    let mut lines = Vec::new();
    let mut line = String::new();
    while reader.read_line(&mut line).is_ok() {
        let trimmed = line.trim_end().to_owned();
        line.clear();
        if trimmed.is_empty() {
            break;
        }
        lines.push(trimmed);
    }

    let mut xray_config = None;
    let mut settings = Vec::with_capacity(lines.len());
    for line in lines {
        if let Some(value) = line.strip_prefix("xray_config=") {
            xray_config = Some(value.to_owned());
        } else {
            settings.push(line);
        }
    }

    d.try_writeable(
        |_| {},
        move |device| apply_settings(device, &settings, xray_config),
    )
    .unwrap_or(errno::IO)
}

fn apply_settings(device: &mut Device, settings: &[String], xray_config: Option<String>) -> i32 {
    let mut scratch = ObfuscationScratch::seeded_from(&device.obfuscation());
    if let Some(config) = xray_config {
        device.set_xray_config(Some(config));
    }

    let mut peer_public_key: Option<x25519::PublicKey> = None;
    let mut peer_state = PeerScratch::default();

    for line in settings {
        let (key, val) = match line.split_once('=') {
            Some(kv) => kv,
            None => return errno::PROTOCOL,
        };

        if peer_public_key.is_some() && key != "public_key" {
            match apply_peer_field(&mut peer_state, key, val) {
                Ok(()) => continue,
                Err(code) => return code,
            }
        }

        match key {
            "private_key" => match val.parse::<KeyBytes>() {
                Ok(bytes) => device.set_private_key(x25519::StaticSecret::from(bytes.0)),
                Err(_) => return errno::INVALID,
            },
            "listen_port" => match val.parse::<u16>() {
                Ok(port) => {
                    if device.open_listen_socket(port).is_err() {
                        return errno::PORT_IN_USE;
                    }
                }
                Err(_) => return errno::INVALID,
            },
            #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
            "fwmark" => match val.parse::<u32>() {
                Ok(mark) => {
                    if device.set_fwmark(mark).is_err() {
                        return errno::IO;
                    }
                }
                Err(_) => return errno::INVALID,
            },
            "replace_peers" => match val.parse::<bool>() {
                Ok(true) => device.clear_peers(),
                Ok(false) => {}
                Err(_) => return errno::INVALID,
            },
            "jc" => match val.parse::<u16>() {
                Ok(v) => {
                    scratch.jc = v;
                    scratch.touched = true;
                }
                Err(_) => return errno::INVALID,
            },
            "jmin" => match val.parse::<u16>() {
                Ok(v) => {
                    scratch.jmin = v;
                    scratch.touched = true;
                }
                Err(_) => return errno::INVALID,
            },
            "jmax" => match val.parse::<u16>() {
                Ok(v) => {
                    scratch.jmax = v;
                    scratch.touched = true;
                }
                Err(_) => return errno::INVALID,
            },
            "s1" | "s2" | "s3" | "s4" => {
                let idx = key.as_bytes()[1] as usize - b'1' as usize;
                match val.parse::<usize>() {
                    Ok(v) => {
                        scratch.s[idx] = v;
                        scratch.touched = true;
                    }
                    Err(_) => return errno::INVALID,
                }
            }
            "h1" | "h2" | "h3" | "h4" => {
                let idx = key.as_bytes()[1] as usize - b'1' as usize;
                match parse_magic_header(val) {
                    Ok(h) => {
                        scratch.h[idx] = Some(h);
                        scratch.touched = true;
                    }
                    Err(_) => return errno::INVALID,
                }
            }
            "i1" | "i2" | "i3" | "i4" | "i5" => {
                let idx = key.as_bytes()[1] as usize - b'1' as usize;
                if val.is_empty() {
                    // An empty value is a deliberate no-op, not an error.
                } else {
                    match SpecialJunkGenerator::parse(val) {
                        Ok(g) => {
                            scratch.special_junk[idx] = Some(g);
                            scratch.touched = true;
                        }
                        Err(_) => return errno::INVALID,
                    }
                }
            }
            "public_key" => match val.parse::<KeyBytes>() {
                Ok(bytes) => {
                    if let Some(prev) = peer_public_key.take() {
                        commit_peer(device, prev, std::mem::take(&mut peer_state));
                    }
                    peer_public_key = Some(x25519::PublicKey::from(bytes.0));
                }
                Err(_) => return errno::INVALID,
            },
            _ => return errno::INVALID,
        }
    }

    if let Some(public_key) = peer_public_key {
        commit_peer(device, public_key, peer_state);
    }

    if scratch.touched {
        match scratch.build() {
            Ok(obfuscation) => device.set_obfuscation(obfuscation),
            Err(_) => return errno::INVALID,
        }
    }

    0
}

#[derive(Default)]
struct PeerScratch {
    remove: bool,
    update_only: bool,
    replace_ips: bool,
    endpoint: Option<SocketAddr>,
    keepalive: Option<u16>,
    preshared_key: Option<[u8; 32]>,
    allowed_ips: Vec<AllowedIP>,
    removed_allowed_ips: Vec<AllowedIP>,
}

fn apply_peer_field(state: &mut PeerScratch, key: &str, val: &str) -> Result<(), i32> {
    match key {
        "remove" => match val.parse::<bool>() {
            Ok(v) => state.remove = v,
            Err(_) => return Err(errno::INVALID),
        },
        "update_only" => match val.parse::<bool>() {
            Ok(v) => state.update_only = v,
            Err(_) => return Err(errno::INVALID),
        },
        "preshared_key" => match val.parse::<KeyBytes>() {
            Ok(bytes) => state.preshared_key = Some(bytes.0),
            Err(_) => return Err(errno::INVALID),
        },
        "endpoint" => match val.parse::<SocketAddr>() {
            Ok(addr) => state.endpoint = Some(addr),
            Err(_) => return Err(errno::INVALID),
        },
        "persistent_keepalive_interval" => match val.parse::<u16>() {
            Ok(v) => state.keepalive = Some(v),
            Err(_) => return Err(errno::INVALID),
        },
        "replace_allowed_ips" => match val.parse::<bool>() {
            Ok(v) => state.replace_ips = v,
            Err(_) => return Err(errno::INVALID),
        },
        "allowed_ip" => {
            // A leading `-` marks the prefix for removal instead of addition.
            if let Some(stripped) = val.strip_prefix('-') {
                match stripped.parse::<AllowedIP>() {
                    Ok(ip) => state.removed_allowed_ips.push(ip),
                    Err(_) => return Err(errno::INVALID),
                }
            } else {
                match val.parse::<AllowedIP>() {
                    Ok(ip) => state.allowed_ips.push(ip),
                    Err(_) => return Err(errno::INVALID),
                }
            }
        }
        "protocol_version" => match val.parse::<u32>() {
            Ok(1) => {}
            _ => return Err(errno::INVALID),
        },
        _ => return Err(errno::INVALID),
    }
    Ok(())
}

fn commit_peer(device: &mut Device, public_key: x25519::PublicKey, state: PeerScratch) {
    device.update_peer(
        public_key,
        state.remove,
        state.update_only,
        state.replace_ips,
        state.endpoint,
        &state.allowed_ips,
        &state.removed_allowed_ips,
        state.keepalive,
        state.preshared_key,
    );
}
