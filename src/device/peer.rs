// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! A peer owns its `Tunn` (handshake + session state), its endpoint, and the
//! allowed-ips it accepts traffic from. The device refers to peers by `Arc<Peer>` so
//! worker threads can hold a reference past the lifetime of the `peers` map read lock.
//!
//! Packets handed to a peer before it has a usable session are staged by `Tunn`
//! itself (a bounded, FIFO, drop-oldest-on-overflow queue, drained automatically once
//! a handshake completes) rather than by a second queue here.

use parking_lot::{Mutex, RwLock};
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use crate::device::allowed_ips::AllowedIps;
use crate::device::bind::Endpoint;
use crate::noise::Tunn;
use crate::x25519;

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct AllowedIP {
    pub addr: IpAddr,
    pub cidr: u8,
}

impl FromStr for AllowedIP {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ip: Vec<&str> = s.split('/').collect();
        if ip.len() != 2 {
            return Err("Invalid IP format".to_owned());
        }

        let (addr, cidr) = (ip[0].parse::<IpAddr>(), ip[1].parse::<u8>());
        match (addr, cidr) {
            (Ok(addr @ IpAddr::V4(_)), Ok(cidr)) if cidr <= 32 => Ok(AllowedIP { addr, cidr }),
            (Ok(addr @ IpAddr::V6(_)), Ok(cidr)) if cidr <= 128 => Ok(AllowedIP { addr, cidr }),
            _ => Err("Invalid IP format".to_owned()),
        }
    }
}

/// Everything the device needs to route to and authenticate a single remote peer.
pub struct Peer {
    pub(crate) public_key: x25519::PublicKey,
    /// Handshake and session state. A single lock serializes both the handshake and
    /// keypair concerns the spec describes separately, since `Tunn` owns them jointly;
    /// readers on the packet path never hold it across a blocking channel send.
    pub(crate) tunnel: Mutex<Tunn>,
    endpoint: RwLock<Option<Endpoint>>,
    /// Disabled once a peer is created with a statically configured endpoint and the
    /// device has "broken roaming" set, or is never re-enabled once an endpoint is
    /// fixed by configuration; otherwise every successful inbound authentication
    /// updates it to the datagram's source.
    roaming_enabled: std::sync::atomic::AtomicBool,
    allowed_ips: RwLock<AllowedIps<()>>,
    preshared_key: RwLock<Option<[u8; 32]>>,
    persistent_keepalive: AtomicU16,
}

impl Peer {
    pub fn new(
        tunnel: Tunn,
        public_key: x25519::PublicKey,
        endpoint: Option<Endpoint>,
        allowed_ips: &[AllowedIP],
        preshared_key: Option<[u8; 32]>,
        persistent_keepalive: Option<u16>,
    ) -> Peer {
        Peer {
            public_key,
            tunnel: Mutex::new(tunnel),
            endpoint: RwLock::new(endpoint),
            roaming_enabled: std::sync::atomic::AtomicBool::new(true),
            allowed_ips: RwLock::new(allowed_ips.iter().map(|ip| (ip, ())).collect()),
            preshared_key: RwLock::new(preshared_key),
            persistent_keepalive: AtomicU16::new(persistent_keepalive.unwrap_or(0)),
        }
    }

    pub fn public_key(&self) -> &x25519::PublicKey {
        &self.public_key
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint.read().clone()
    }

    pub fn set_endpoint(&self, endpoint: Endpoint) {
        *self.endpoint.write() = Some(endpoint);
    }

    /// Called by a decryption worker after a datagram successfully authenticates.
    /// Roams the endpoint to the datagram's source unless roaming has been disabled.
    pub fn roam_to(&self, source: Endpoint) {
        if !self.roaming_enabled.load(Ordering::Relaxed) {
            return;
        }
        let mut endpoint = self.endpoint.write();
        if endpoint.as_ref() != Some(&source) {
            *endpoint = Some(source);
        }
    }

    pub fn disable_roaming(&self) {
        self.roaming_enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_allowed_ip<I: Into<IpAddr>>(&self, addr: I) -> bool {
        self.allowed_ips.read().find(addr.into()).is_some()
    }

    pub fn allowed_ips(&self) -> Vec<(IpAddr, u8)> {
        self.allowed_ips
            .read()
            .iter()
            .map(|(_, ip, cidr)| (ip, cidr))
            .collect()
    }

    pub fn add_allowed_ip(&self, ip: IpAddr, cidr: u32) {
        self.allowed_ips.write().insert(ip, cidr, ());
    }

    pub fn remove_allowed_ip(&self, ip: IpAddr, cidr: u32) {
        self.allowed_ips.write().remove_exact(ip, cidr, &|_| true);
    }

    pub fn clear_allowed_ips(&self) {
        self.allowed_ips.write().clear();
    }

    pub fn time_since_last_handshake(&self) -> Option<Duration> {
        self.tunnel.lock().time_since_last_handshake()
    }

    pub fn persistent_keepalive(&self) -> u16 {
        self.persistent_keepalive.load(Ordering::Relaxed)
    }

    /// Returns the previous value; UAPI uses this to decide whether to fire an
    /// immediate keepalive (turning the interval on from zero).
    pub fn set_persistent_keepalive(&self, secs: u16) -> u16 {
        let old = self.persistent_keepalive.swap(secs, Ordering::Relaxed);
        self.tunnel.lock().set_persistent_keepalive(secs);
        old
    }

    pub fn preshared_key(&self) -> Option<[u8; 32]> {
        *self.preshared_key.read()
    }

    pub fn set_preshared_key(&self, key: [u8; 32]) {
        *self.preshared_key.write() = Some(key);
        self.tunnel.lock().set_preshared_key(Some(key));
    }

    pub fn stats(&self) -> (Option<Duration>, usize, usize) {
        let (time, tx, rx, ..) = self.tunnel.lock().stats();
        (time, tx, rx)
    }
}
