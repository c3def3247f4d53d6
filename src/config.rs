// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Bitmask of log categories emitted for one device.
///
/// More detailed categories imply the less detailed ones once `adjust()`
/// has been applied, mirroring how the daemon's command line treats them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LogMask(u8);

impl LogMask {
    pub const ERROR: LogMask = LogMask(1 << 0);
    pub const INFO: LogMask = LogMask(1 << 1);
    pub const DEBUG: LogMask = LogMask(1 << 2);
    pub const TRACE_HTTP: LogMask = LogMask(1 << 3);
    pub const TRACE_USB: LogMask = LogMask(1 << 4);

    pub const ALL: LogMask = LogMask(0x1f);
    const TRACE_ALL: LogMask = LogMask(Self::TRACE_HTTP.0 | Self::TRACE_USB.0);

    pub const fn empty() -> LogMask {
        LogMask(0)
    }

    pub fn contains(self, other: LogMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: LogMask) -> LogMask {
        LogMask(self.0 | other.0)
    }

    /// Make more detailed levels imply less detailed ones.
    pub fn adjust(self) -> LogMask {
        let mut mask = self;
        if mask.0 & Self::TRACE_ALL.0 != 0 {
            mask = mask.union(Self::DEBUG);
        }
        if mask.contains(Self::DEBUG) {
            mask = mask.union(Self::INFO);
        }
        if mask.contains(Self::INFO) {
            mask = mask.union(Self::ERROR);
        }
        mask
    }

    pub fn trace_http(self) -> bool {
        self.contains(Self::TRACE_HTTP)
    }

    pub fn trace_usb(self) -> bool {
        self.contains(Self::TRACE_USB)
    }

    /// Log level filter matching the most detailed enabled category.
    pub fn level_filter(self) -> log::LevelFilter {
        if self.0 & Self::TRACE_ALL.0 != 0 {
            log::LevelFilter::Trace
        } else if self.contains(Self::DEBUG) {
            log::LevelFilter::Debug
        } else if self.contains(Self::INFO) {
            log::LevelFilter::Info
        } else {
            log::LevelFilter::Error
        }
    }
}

impl Default for LogMask {
    fn default() -> LogMask {
        LogMask::DEBUG.adjust()
    }
}

impl FromStr for LogMask {
    type Err = String;

    /// Parse a comma-separated category list, e.g. "debug,trace-http".
    fn from_str(s: &str) -> std::result::Result<LogMask, String> {
        let mut mask = LogMask::empty();
        for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            mask = mask.union(match name {
                "error" => LogMask::ERROR,
                "info" => LogMask::INFO,
                "debug" => LogMask::DEBUG,
                "trace-http" => LogMask::TRACE_HTTP,
                "trace-usb" => LogMask::TRACE_USB,
                "all" => LogMask::ALL,
                _ => return Err(format!("Unknown log level {:?}", name)),
            });
        }
        Ok(mask.adjust())
    }
}

impl fmt::Display for LogMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names = [
            (Self::ERROR, "error"),
            (Self::INFO, "info"),
            (Self::DEBUG, "debug"),
            (Self::TRACE_HTTP, "trace-http"),
            (Self::TRACE_USB, "trace-usb"),
        ];
        let mut first = true;
        for (bit, name) in names {
            if self.contains(bit) {
                if !first {
                    write!(f, ",")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Transport tuning knobs, fixed at transport construction.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Log categories emitted on this device's log.
    pub log: LogMask,
    /// Request bodies below this many bytes are prefetched into memory
    /// before the request touches USB.
    pub small_body_prefetch_threshold: u64,
    /// Bulk-in buffers of at least this size are truncated to a multiple
    /// of it before being handed to the USB stack.
    pub usb_read_alignment: usize,
    /// First delay after a zero-length bulk-in transfer.
    pub zero_read_backoff_initial: Duration,
    /// Backoff doubles per zero-length transfer up to this cap.
    pub zero_read_backoff_max: Duration,
}

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        TransportConfig {
            log: LogMask::default(),
            small_body_prefetch_threshold: 16384,
            usb_read_alignment: 512,
            zero_read_backoff_initial: Duration::from_millis(100),
            zero_read_backoff_max: Duration::from_millis(1000),
        }
    }
}
