// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info};
use rusb::{Context, Registration, UsbContext};
use tokio::sync::mpsc;

use crate::bridge::ShutdownReason;
use crate::error::Error;
use crate::error::Result;

/// Watches for the transport's device disappearing from the bus and feeds
/// the daemon's shutdown channel when it does.
pub struct UnplugDetector {
    event_thread_run: Arc<AtomicBool>,
    // These are always Some until the destructor runs.
    registration: Option<Registration<Context>>,
    event_thread: Option<std::thread::JoinHandle<()>>,
}

impl UnplugDetector {
    pub fn new(
        device: rusb::Device<Context>,
        shutdown: mpsc::Sender<ShutdownReason>,
    ) -> Result<Self> {
        let context = device.context().clone();
        let handler = CallbackHandler { device, shutdown };
        let registration = rusb::HotplugBuilder::new()
            .enumerate(false)
            .register(&context, Box::new(handler))
            .map_err(Error::RegisterCallback)?;

        // Spawn a thread to dispatch the plug/unplug events.  While this is
        // technically busy looping, the thread wakes up only when an event
        // arrives.  When the callback is unregistered in Drop, an event is
        // triggered so the thread wakes up immediately.
        let run = Arc::new(AtomicBool::new(true));
        let thread_run = run.clone();
        let event_thread = std::thread::spawn(move || {
            while thread_run.load(Ordering::Relaxed) {
                if let Err(e) = context.handle_events(None) {
                    error!("Failed to handle libusb events: {}", e);
                }
            }
            info!("Shutting down libusb event thread.");
        });

        Ok(Self {
            event_thread_run: run,
            registration: Some(registration),
            event_thread: Some(event_thread),
        })
    }
}

impl Drop for UnplugDetector {
    fn drop(&mut self) {
        self.event_thread_run.store(false, Ordering::Relaxed);

        // The callback is unregistered when the registration is dropped.
        // Unwrap is safe because self.registration is always Some until we drop it here.
        drop(self.registration.take().unwrap());

        // Dropping the callback above wakes the event thread, so this should complete quickly.
        // Unwrap is safe because event_thread only becomes None at drop.
        let t = self.event_thread.take().unwrap();
        t.join()
            .unwrap_or_else(|e| error!("Failed to join event thread: {:?}", e));
    }
}

struct CallbackHandler {
    device: rusb::Device<Context>,
    shutdown: mpsc::Sender<ShutdownReason>,
}

impl rusb::Hotplug<Context> for CallbackHandler {
    fn device_arrived(&mut self, _device: rusb::Device<Context>) {
        // Do nothing.
    }

    fn device_left(&mut self, device: rusb::Device<Context>) {
        if device == self.device {
            info!("Device was unplugged, shutting down");
            // A full channel means a shutdown is already on its way.
            let _ = self.shutdown.try_send(ShutdownReason::Unplugged);
        }
    }
}
