// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod bridge;
mod config;
mod device;
mod device_info;
mod error;
mod hotplug;
mod http;
mod io_adapters;
mod transport;

pub use crate::bridge::{Bridge, ShutdownReason};
pub use crate::config::{LogMask, TransportConfig};
pub use crate::device_info::{
    device_supports_ippusb, find_device, DeviceDescriptor, DeviceInfo, InterfaceAddress,
};
pub use crate::error::{Error, Result};
pub use crate::hotplug::UnplugDetector;
pub use crate::transport::UsbTransport;
