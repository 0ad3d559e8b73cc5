// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use awgtun::device::{DeviceConfig, DeviceHandle, TransportMode};
use clap::Parser;
use std::process::exit;

/// Userspace obfuscated-WireGuard tunnel daemon. Configuration (keys, peers, the
/// `jc`/`jmin`/`jmax`/`h1..h4`/`i1..i5` obfuscation knobs) is applied afterwards over
/// the UAPI socket at `/var/run/wireguard/<name>.sock`, the same way `wg(8)` drives
/// stock WireGuard.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Name of the TUN interface to create (e.g. "awg0").
    interface_name: String,

    /// Number of worker threads per pipeline stage (encryption, decryption,
    /// handshake). Defaults to the number of logical CPUs.
    #[arg(short = 't', long)]
    threads: Option<usize>,

    /// Serve the tunnel over a TCP bind instead of UDP.
    #[arg(long)]
    tcp: bool,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let config = DeviceConfig {
        n_threads: cli.threads,
        transport: if cli.tcp {
            TransportMode::Tcp
        } else {
            TransportMode::Udp
        },
        #[cfg(target_os = "linux")]
        use_multi_queue: true,
    };

    let mut device_handle = match DeviceHandle::new(&cli.interface_name, config) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!(message = "failed to initialize tunnel", error = ?e);
            exit(1);
        }
    };

    tracing::info!(interface = %cli.interface_name, "tunnel started");

    if let Err(e) = device_handle.up() {
        tracing::error!(message = "failed to bring tunnel up", error = ?e);
        exit(1);
    }

    ctrlc_wait();

    tracing::info!("shutting down");
    device_handle.close();
}

static SHUTDOWN: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

extern "C" fn handle_shutdown_signal(_: i32) {
    SHUTDOWN.store(true, std::sync::atomic::Ordering::SeqCst);
}

/// Blocks the main thread until SIGINT/SIGTERM.
fn ctrlc_wait() {
    unsafe {
        libc::signal(libc::SIGINT, handle_shutdown_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_shutdown_signal as libc::sighandler_t);
    }
    while !SHUTDOWN.load(std::sync::atomic::Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }
}
