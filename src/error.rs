// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::io;

use tokio::task::JoinError;

#[derive(Debug)]
pub enum Error {
    BuildResponse(hyper::http::Error),
    ClaimInterface(u8, rusb::Error),
    DetachDrivers(u8, rusb::Error),
    DeviceList(rusb::Error),
    EmptyField(&'static str),
    MalformedResponse,
    NoDevice,
    NotIppUsb,
    OpenDevice(rusb::Error),
    ParseResponse(httparse::Error),
    ReadConfigDescriptor(rusb::Error),
    ReadDeviceDescriptor(rusb::Error),
    ReadRequestBody(hyper::Error),
    ReadResponse(io::Error),
    RegisterCallback(rusb::Error),
    ResetDevice(rusb::Error),
    SetActiveConfig(rusb::Error),
    SetAlternateSetting(u8, rusb::Error),
    Shutdown,
    TaskJoin(JoinError),
    TruncatedRequestBody(u64, u64),
    WriteRequest(io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;
        match self {
            BuildResponse(err) => write!(f, "Failed to build response: {}", err),
            ClaimInterface(i, err) => write!(f, "Failed to claim interface {}: {}", i, err),
            DetachDrivers(i, err) => write!(
                f,
                "Failed to detach kernel driver for interface {}: {}",
                i, err
            ),
            DeviceList(err) => write!(f, "Failed to read device list: {}", err),
            EmptyField(field) => write!(f, "HTTP response field {} was unexpectedly empty", field),
            MalformedResponse => write!(f, "HTTP response is malformed"),
            NoDevice => write!(f, "No valid IPP USB device found."),
            NotIppUsb => write!(f, "The specified device is not an IPP USB device."),
            OpenDevice(err) => write!(f, "Failed to open device: {}", err),
            ParseResponse(err) => write!(f, "Failed to parse HTTP response header: {}", err),
            ReadConfigDescriptor(err) => write!(f, "Failed to read config descriptor: {}", err),
            ReadDeviceDescriptor(err) => write!(f, "Failed to read device descriptor: {}", err),
            ReadRequestBody(err) => write!(f, "Reading request body failed: {}", err),
            ReadResponse(err) => write!(f, "Reading response failed: {}", err),
            RegisterCallback(err) => write!(f, "Failed to register for hotplug callback: {}", err),
            ResetDevice(err) => write!(f, "Failed to reset device: {}", err),
            SetActiveConfig(err) => write!(f, "Failed to set active config: {}", err),
            SetAlternateSetting(i, err) => write!(
                f,
                "Failed to set interface {} alternate setting: {}",
                i, err
            ),
            Shutdown => write!(f, "Transport is shutting down."),
            TaskJoin(err) => write!(f, "Failed to wait for blocking task: {}", err),
            TruncatedRequestBody(got, want) => write!(
                f,
                "Request body ended after {} of {} declared bytes",
                got, want
            ),
            WriteRequest(err) => write!(f, "Writing request failed: {}", err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
