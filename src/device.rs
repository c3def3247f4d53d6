// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use rusb::Context;

use crate::device_info::{is_ippusb_interface, DeviceDescriptor, DeviceInfo, InterfaceAddress};
use crate::error::Error;
use crate::error::Result;

fn interface_contains_ippusb(interface: &rusb::Interface) -> bool {
    for descriptor in interface.descriptors() {
        if is_ippusb_interface(&descriptor) {
            return true;
        }
    }
    false
}

fn set_device_config(handle: &rusb::DeviceHandle<Context>, new_config: u8) -> Result<()> {
    let cur_config = handle
        .device()
        .active_config_descriptor()
        .map_err(Error::ReadConfigDescriptor)?;

    if cur_config.number() == new_config {
        return Ok(());
    }

    // While detaching any outstanding kernel drivers for the current config, keep
    // track of non-printer drivers so we can restore them after setting the config.
    let mut restore_interfaces = Vec::new();
    for interface in cur_config.interfaces() {
        if !interface_contains_ippusb(&interface) {
            match handle.kernel_driver_active(interface.number()) {
                Ok(false) => continue, // No active driver.
                Err(e) => return Err(Error::DetachDrivers(interface.number(), e)),
                _ => {}
            }

            info!(
                "Temporarily detaching kernel driver for non-printer interface {}",
                interface.number()
            );
            restore_interfaces.push(interface.number());
        }

        match handle.detach_kernel_driver(interface.number()) {
            Err(e) if e != rusb::Error::NotFound => {
                return Err(Error::DetachDrivers(interface.number(), e))
            }
            _ => {}
        }
    }

    info!(
        "Switching from configuration {} to {}",
        cur_config.number(),
        new_config
    );
    handle
        .set_active_configuration(new_config)
        .map_err(Error::SetActiveConfig)?;

    // Try to put back the previously detached drivers.  We don't return an error if one
    // of these fails because it won't prevent us from claiming the IPP-USB interfaces later.
    for inum in restore_interfaces {
        handle
            .attach_kernel_driver(inum)
            .unwrap_or_else(|e| error!("Failed to reattach driver for interface {}: {}", inum, e));
    }

    Ok(())
}

pub(crate) fn to_io_error(err: rusb::Error) -> io::Error {
    let kind = match err {
        rusb::Error::InvalidParam => io::ErrorKind::InvalidInput,
        rusb::Error::NotFound => io::ErrorKind::NotFound,
        rusb::Error::Timeout => io::ErrorKind::TimedOut,
        rusb::Error::Pipe => io::ErrorKind::BrokenPipe,
        rusb::Error::Interrupted => io::ErrorKind::Interrupted,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err)
}

/// Bulk transfer operations of one claimed interface pair.
///
/// Split out so the connection read path can be exercised against a
/// scripted endpoint in tests.
pub(crate) trait BulkIo {
    fn send(&self, buf: &[u8]) -> io::Result<usize>;
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn clear_halt_in(&self) -> io::Result<()>;
}

/// An opened IPP-USB device.
///
/// `Device` owns the kernel handle and switches the device into the
/// configuration holding the IPP-USB interfaces.  It performs no I/O
/// itself; interface pairs claimed with `open_interface()` do.
pub struct Device {
    handle: Arc<rusb::DeviceHandle<Context>>,
}

impl Device {
    /// Open the device named by `descriptor` and prepare it for interface claiming.
    pub fn open(context: &Context, descriptor: &DeviceDescriptor) -> Result<Device> {
        let device_list =
            rusb::DeviceList::new_with_context(context.clone()).map_err(Error::DeviceList)?;
        let device = device_list
            .iter()
            .find(|d| {
                d.bus_number() == descriptor.bus_number && d.address() == descriptor.address
            })
            .ok_or(Error::NoDevice)?;

        let handle = Arc::new(device.open().map_err(Error::OpenDevice)?);
        handle
            .set_auto_detach_kernel_driver(true)
            .map_err(|e| Error::DetachDrivers(u8::MAX, e))?; // Use MAX to mean "no interface".

        set_device_config(handle.as_ref(), descriptor.config)?;

        Ok(Device { handle })
    }

    /// Return the contained rusb device.
    pub fn rusb_device(&self) -> rusb::Device<Context> {
        self.handle.device()
    }

    /// Read the device's string descriptors.  Absent strings come back empty.
    pub fn read_info(&self) -> Result<DeviceInfo> {
        let desc = self
            .handle
            .device()
            .device_descriptor()
            .map_err(Error::ReadDeviceDescriptor)?;
        Ok(DeviceInfo {
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            manufacturer: self
                .handle
                .read_manufacturer_string_ascii(&desc)
                .unwrap_or_default(),
            product: self
                .handle
                .read_product_string_ascii(&desc)
                .unwrap_or_default(),
            serial: self
                .handle
                .read_serial_number_string_ascii(&desc)
                .unwrap_or_default(),
        })
    }

    /// Claim one interface pair and switch it to its alternate setting.
    pub fn open_interface(&self, address: InterfaceAddress) -> Result<UsbInterface> {
        self.handle
            .claim_interface(address.interface_number)
            .map_err(|e| Error::ClaimInterface(address.interface_number, e))?;
        if let Err(e) = self
            .handle
            .set_alternate_setting(address.interface_number, address.alternate_setting)
        {
            let _ = self.handle.release_interface(address.interface_number);
            return Err(Error::SetAlternateSetting(address.interface_number, e));
        }
        Ok(UsbInterface {
            handle: self.handle.clone(),
            address,
        })
    }

    /// Reset the device, aborting any in-kernel transfers.
    pub fn reset(&self) -> Result<()> {
        // DeviceHandle::reset requires `&mut`, which the shared handle cannot
        // provide while connections hold clones.  Go through the raw handle;
        // libusb_reset_device is safe on a valid handle from any thread.
        match unsafe { rusb::ffi::libusb_reset_device(self.handle.as_raw()) } {
            0 => Ok(()),
            rusb::ffi::constants::LIBUSB_ERROR_NO_DEVICE => {
                Err(Error::ResetDevice(rusb::Error::NoDevice))
            }
            rusb::ffi::constants::LIBUSB_ERROR_NOT_FOUND => {
                Err(Error::ResetDevice(rusb::Error::NotFound))
            }
            _ => Err(Error::ResetDevice(rusb::Error::Other)),
        }
    }
}

/// A claimed IPP-USB interface pair.
///
/// Owned by exactly one bulk connection; the claim is released on drop.
pub(crate) struct UsbInterface {
    handle: Arc<rusb::DeviceHandle<Context>>,
    address: InterfaceAddress,
}

// A zero timeout tells libusb the transfer never times out.  The transport
// relies on caller-side cancellation and device reset instead of transfer
// deadlines.
const NO_TIMEOUT: Duration = Duration::ZERO;

impl BulkIo for UsbInterface {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.handle
            .write_bulk(self.address.out_endpoint, buf, NO_TIMEOUT)
            .map_err(to_io_error)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.handle
            .read_bulk(self.address.in_endpoint, buf, NO_TIMEOUT)
            .map_err(to_io_error)
    }

    fn clear_halt_in(&self) -> io::Result<()> {
        self.handle
            .clear_halt(self.address.in_endpoint)
            .map_err(to_io_error)
    }
}

impl Drop for UsbInterface {
    fn drop(&mut self) {
        match self.handle.release_interface(self.address.interface_number) {
            // If the device was unplugged there is nothing left to release.
            Ok(()) | Err(rusb::Error::NoDevice) => {}
            Err(e) => error!(
                "Failed to release interface {}: {}",
                self.address.interface_number, e
            ),
        }
    }
}
