// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod arguments;

use std::fmt;
use std::io;
use std::net::TcpListener as StdTcpListener;
use std::time::Duration;

use log::{error, info};
use tokio::net::TcpListener;
use tokio::runtime::Builder;
use tokio::signal;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;

use ippusb_relay::{
    find_device, Bridge, Error as RelayError, ShutdownReason, TransportConfig, UnplugDetector,
    UsbTransport,
};

use crate::arguments::Args;

// How long a graceful shutdown may wait for in-flight transactions before
// the device is reset and the transport closed anyway.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum Error {
    CreateContext(rusb::Error),
    CreateSocket(io::Error),
    CreateTransport(RelayError),
    FindDevice(RelayError),
    ParseArgs(arguments::Error),
    Syslog(syslog::Error),
    TokioRuntime(io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;
        match self {
            CreateContext(err) => write!(f, "Failed to create UsbContext: {}", err),
            CreateSocket(err) => write!(f, "Failed to create socket: {}", err),
            CreateTransport(err) => write!(f, "Failed to create USB transport: {}", err),
            FindDevice(err) => write!(f, "Failed to find device: {}", err),
            ParseArgs(err) => write!(f, "Failed to parse arguments: {}", err),
            Syslog(err) => write!(f, "Failed to initalize syslog: {}", err),
            TokioRuntime(err) => write!(f, "Error setting up tokio runtime: {}", err),
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

fn run() -> Result<()> {
    let argv: Vec<String> = std::env::args().collect();
    let args = match Args::parse(&argv).map_err(Error::ParseArgs)? {
        None => return Ok(()),
        Some(args) => args,
    };
    syslog::init_unix(syslog::Facility::LOG_USER, args.log.level_filter())
        .map_err(Error::Syslog)?;

    // Safe because the syscall doesn't touch any memory and always succeeds.
    unsafe { libc::umask(0o117) };

    let host = format!("127.0.0.1:{}", args.port);
    let listener = StdTcpListener::bind(host).map_err(Error::CreateSocket)?;
    let local_addr = listener.local_addr().map_err(Error::CreateSocket)?;
    info!("Listening on {}", local_addr);

    let context = rusb::Context::new().map_err(Error::CreateContext)?;
    let descriptor = find_device(context.clone(), args.bus_device).map_err(Error::FindDevice)?;

    let config = TransportConfig {
        log: args.log,
        ..TransportConfig::default()
    };
    let transport =
        UsbTransport::new(config, &context, descriptor).map_err(Error::CreateTransport)?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

    let _unplug = if rusb::has_hotplug() {
        match UnplugDetector::new(transport.device(), shutdown_tx.clone()) {
            Ok(detector) => Some(detector),
            Err(e) => {
                error!("Failed to register unplug detection: {}", e);
                None
            }
        }
    } else {
        None
    };

    // Respond to both SIGINT and SIGTERM by doing a clean shutdown.  Deliberately
    // use unwrap in these tasks because if something goes wrong with signal handling
    // then we need the process to exit anyway.
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(Error::TokioRuntime)?;
    let signal_tx = shutdown_tx.clone();
    runtime.spawn(async move {
        signal::ctrl_c().await.unwrap();
        let _ = signal_tx.send(ShutdownReason::Signal).await;
    });
    let signal_tx = shutdown_tx;
    runtime.spawn(async move {
        unix::signal(SignalKind::terminate())
            .unwrap()
            .recv()
            .await
            .unwrap();
        let _ = signal_tx.send(ShutdownReason::Signal).await;
    });

    let serve_transport = transport.clone();
    runtime.block_on(async move {
        listener
            .set_nonblocking(true)
            .map_err(Error::CreateSocket)?;
        let async_listener = TcpListener::from_std(listener).map_err(Error::CreateSocket)?;
        let mut bridge = Bridge::new(shutdown_rx, async_listener, serve_transport);
        bridge.run().await;
        Ok::<(), Error>(())
    })?;

    info!("Shutting down.");
    if runtime
        .block_on(tokio::time::timeout(SHUTDOWN_TIMEOUT, transport.shutdown()))
        .is_err()
    {
        error!("Shutdown timeout expired; closing with connections in flight");
    }
    transport.close();
    runtime.shutdown_timeout(Duration::from_millis(500));
    Ok(())
}

fn main() {
    // Use run() instead of returning a Result from main() so that we can print
    // errors using Display instead of Debug.
    if let Err(e) = run() {
        error!("{}", e);
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
