// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Userspace data plane for an obfuscated WireGuard-family VPN: a Noise-IK engine
//! (`noise`) plus, behind the `device` feature, the TUN/UDP pipeline, peer
//! management and UAPI control socket (`device`) built on top of it.

pub mod noise;

#[cfg(feature = "device")]
pub mod device;

pub(crate) mod serialization;
pub(crate) mod sleepyinstant;

/// Re-export of the x25519 types
pub mod x25519 {
    pub use x25519_dalek::{
        EphemeralSecret, PublicKey, ReusableSecret, SharedSecret, StaticSecret,
    };
}
