// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::str::FromStr;

use getopts::Options;

use ippusb_relay::LogMask;

const DEFAULT_PORT: u16 = 60000;

#[derive(Debug)]
pub enum Error {
    Getopts(getopts::Fail),
    InvalidBusDevice(String),
    InvalidLogLevels(String),
    InvalidPort(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;
        match self {
            Getopts(err) => write!(f, "{}", err),
            InvalidBusDevice(s) => write!(f, "Invalid bus-device {:?}, expected BUS:DEV", s),
            InvalidLogLevels(s) => write!(f, "Invalid log levels: {}", s),
            InvalidPort(s) => write!(f, "Invalid port {:?}", s),
        }
    }
}

pub struct Args {
    pub bus_device: Option<(u8, u8)>,
    pub port: u16,
    pub log: LogMask,
}

fn parse_bus_device(value: &str) -> Result<(u8, u8), Error> {
    let invalid = || Error::InvalidBusDevice(value.to_string());
    let (bus, device) = value.split_once(':').ok_or_else(invalid)?;
    Ok((
        bus.parse().map_err(|_| invalid())?,
        device.parse().map_err(|_| invalid())?,
    ))
}

impl Args {
    /// Parse the command line.  Returns `Ok(None)` when help was printed
    /// and the program should exit successfully.
    pub fn parse(args: &[String]) -> Result<Option<Args>, Error> {
        let mut opts = Options::new();
        opts.optflag("h", "help", "print this help message");
        opts.optflag("v", "verbose", "enable all log categories");
        opts.optopt("b", "bus-device", "usb device to connect to", "BUS:DEV");
        opts.optopt(
            "p",
            "port",
            "loopback TCP port to listen on (default 60000, 0 for ephemeral)",
            "PORT",
        );
        opts.optopt(
            "l",
            "log-levels",
            "comma-separated log categories: error, info, debug, trace-http, trace-usb, all",
            "LIST",
        );

        let matches = opts.parse(&args[1..]).map_err(Error::Getopts)?;
        if matches.opt_present("help") {
            print!("{}", opts.usage(&format!("Usage: {} [options]", args[0])));
            return Ok(None);
        }

        let bus_device = match matches.opt_str("bus-device") {
            Some(value) => Some(parse_bus_device(&value)?),
            None => None,
        };

        let port = match matches.opt_str("port") {
            Some(value) => value.parse().map_err(|_| Error::InvalidPort(value))?,
            None => DEFAULT_PORT,
        };

        let log = if matches.opt_present("verbose") {
            LogMask::ALL
        } else {
            match matches.opt_str("log-levels") {
                Some(value) => LogMask::from_str(&value).map_err(Error::InvalidLogLevels)?,
                None => LogMask::default(),
            }
        };

        Ok(Some(Args {
            bus_device,
            port,
            log,
        }))
    }
}
