// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;

use log::info;
use rusb::{Direction, TransferType, UsbContext};

use crate::error::Error;
use crate::error::Result;

pub(crate) fn is_ippusb_interface(descriptor: &rusb::InterfaceDescriptor) -> bool {
    descriptor.class_code() == 0x07
        && descriptor.sub_class_code() == 0x01
        && descriptor.protocol_code() == 0x04
}

/// The address of one IPP-USB interface pair.
///
/// Bulk transfers can be read/written to the in/out endpoints, respectively.
#[derive(Copy, Clone, Debug)]
pub struct InterfaceAddress {
    pub config: u8,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub in_endpoint: u8,
    pub out_endpoint: u8,
}

/// Everything discovery learns about one IPP-USB device.
///
/// A valid IPP-USB device has at least two interface pairs, all within the
/// same configuration.
#[derive(Clone, Debug)]
pub struct DeviceDescriptor {
    pub bus_number: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub config: u8,
    pub interfaces: Vec<InterfaceAddress>,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Bus {:03} Device {:03}", self.bus_number, self.address)
    }
}

impl DeviceDescriptor {
    /// Search the device's configurations for one that supports IPP-USB.
    ///
    /// An interface is considered an IPP-USB interface if all of the
    /// following are true:
    ///
    /// *  The USB class is Printer (7).
    /// *  The USB subclass is Printer (1).
    /// *  The USB protocol is IPP-USB (4).
    /// *  The interface contains a bulk-in and a bulk-out endpoint.
    ///
    /// A device qualifies if some configuration holds at least two such
    /// interfaces.  The device's active configuration is not changed.
    pub fn new<T: UsbContext>(device: &rusb::Device<T>) -> Result<Self> {
        let desc = device
            .device_descriptor()
            .map_err(Error::ReadDeviceDescriptor)?;
        for i in 0..desc.num_configurations() {
            let config = device
                .config_descriptor(i)
                .map_err(Error::ReadConfigDescriptor)?;

            let mut interfaces = Vec::new();
            for interface in config.interfaces() {
                'alternates: for alternate in interface.descriptors() {
                    if !is_ippusb_interface(&alternate) {
                        continue;
                    }
                    info!(
                        concat!(
                            "Device {}:{} - Found IPP-USB interface. ",
                            "config {}, interface {}, alternate {}"
                        ),
                        device.bus_number(),
                        device.address(),
                        config.number(),
                        interface.number(),
                        alternate.setting_number()
                    );

                    // Find the bulk in and out endpoints for this interface.
                    let mut in_endpoint: Option<u8> = None;
                    let mut out_endpoint: Option<u8> = None;
                    for endpoint in alternate.endpoint_descriptors() {
                        match (endpoint.direction(), endpoint.transfer_type()) {
                            (Direction::In, TransferType::Bulk) => {
                                in_endpoint.get_or_insert(endpoint.address());
                            }
                            (Direction::Out, TransferType::Bulk) => {
                                out_endpoint.get_or_insert(endpoint.address());
                            }
                            _ => {}
                        };

                        if in_endpoint.is_some() && out_endpoint.is_some() {
                            break;
                        }
                    }

                    if let (Some(in_endpoint), Some(out_endpoint)) = (in_endpoint, out_endpoint) {
                        interfaces.push(InterfaceAddress {
                            config: config.number(),
                            interface_number: interface.number(),
                            alternate_setting: alternate.setting_number(),
                            in_endpoint,
                            out_endpoint,
                        });
                        // We must consider at most one alternate setting per
                        // interface when detecting IPP-USB interfaces.
                        break 'alternates;
                    }
                }
            }

            if interfaces.len() >= 2 {
                return Ok(Self {
                    bus_number: device.bus_number(),
                    address: device.address(),
                    vendor_id: desc.vendor_id(),
                    product_id: desc.product_id(),
                    config: config.number(),
                    interfaces,
                });
            }
        }

        Err(Error::NotIppUsb)
    }
}

/// Check if the given device supports IPP-USB without changing its state.
pub fn device_supports_ippusb<T: UsbContext>(device: &rusb::Device<T>) -> Result<bool> {
    match DeviceDescriptor::new(device) {
        Ok(_) => Ok(true),
        Err(Error::NotIppUsb) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Locate an IPP-USB device and return its descriptor.
///
/// With `bus_device` set, only that bus/address is considered and a
/// non-IPP-USB device there is an error.  Otherwise the first device that
/// qualifies is selected.
pub fn find_device<T: UsbContext>(
    context: T,
    bus_device: Option<(u8, u8)>,
) -> Result<DeviceDescriptor> {
    let device_list = rusb::DeviceList::new_with_context(context).map_err(Error::DeviceList)?;

    let descriptor = match bus_device {
        Some((bus, address)) => {
            let device = device_list
                .iter()
                .find(|d| d.bus_number() == bus && d.address() == address)
                .ok_or(Error::NoDevice)?;
            DeviceDescriptor::new(&device)?
        }
        None => device_list
            .iter()
            .find_map(|d| DeviceDescriptor::new(&d).ok())
            .ok_or(Error::NoDevice)?,
    };

    info!("Selected device {}", descriptor);
    Ok(descriptor)
}

/// String descriptors of an opened device, used for log naming and for
/// advertising-name composition by collaborators.
#[derive(Clone, Debug, Default)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
}

impl DeviceInfo {
    /// Stable identifier: vendor/product ids plus the sanitized serial.
    pub fn ident(&self) -> String {
        let mut ident = format!("{:04x}-{:04x}", self.vendor_id, self.product_id);
        if !self.serial.is_empty() {
            ident.push('-');
            for c in self.serial.chars() {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    ident.push(c);
                } else {
                    ident.push('_');
                }
            }
        }
        ident
    }
}
