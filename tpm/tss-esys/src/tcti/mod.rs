// Copyright (c) Microsoft. All rights reserved.

//! Transports that carry marshaled commands to a TPM and bring back its responses.

pub mod device;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod mssim;

use std::path::PathBuf;
use std::time::Duration;

use crate::error::base;
use crate::{Error, Result};

pub use device::Device;
pub use mssim::Mssim;

/// Largest command or response any transport moves.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// How long `receive` may wait for a response.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Timeout {
    Block,
    After(Duration),
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::Block
    }
}

pub trait Tcti: Send {
    /// Sends one complete command. Must not block waiting for the TPM.
    fn transmit(&mut self, command: &[u8]) -> Result<()>;

    /// Collects the response to the last transmitted command.
    ///
    /// Returns a TCTI-layer `TRY_AGAIN` error if nothing arrived before `timeout`.
    fn receive(&mut self, timeout: Timeout) -> Result<Vec<u8>>;

    fn cancel(&mut self) -> Result<()> {
        Err(Error::tcti(base::NOT_IMPLEMENTED))
    }

    fn set_locality(&mut self, _locality: u8) -> Result<()> {
        Err(Error::tcti(base::NOT_IMPLEMENTED))
    }
}

impl<T: Tcti + ?Sized> Tcti for Box<T> {
    fn transmit(&mut self, command: &[u8]) -> Result<()> {
        (**self).transmit(command)
    }

    fn receive(&mut self, timeout: Timeout) -> Result<Vec<u8>> {
        (**self).receive(timeout)
    }

    fn cancel(&mut self) -> Result<()> {
        (**self).cancel()
    }

    fn set_locality(&mut self, locality: u8) -> Result<()> {
        (**self).set_locality(locality)
    }
}

pub const DEFAULT_DEVICES: [&str; 2] = ["/dev/tpmrm0", "/dev/tpm0"];

/// A parsed transport configuration string.
///
/// - `""` probes the default devices, then a simulator on localhost.
/// - `device` or `device:/dev/tpm0`
/// - `mssim` or `mssim:host=127.0.0.1,port=2321` (`swtpm` is accepted as an alias)
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Conf {
    Default,
    Device(PathBuf),
    Mssim { host: String, port: u16 },
}

impl std::str::FromStr for Conf {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, args) = s.split_once(':').unwrap_or((s, ""));

        match name {
            "" => Ok(Conf::Default),
            "device" if args.is_empty() => Ok(Conf::Device(DEFAULT_DEVICES[0].into())),
            "device" => Ok(Conf::Device(args.into())),
            "mssim" | "swtpm" => {
                let (host, port) = mssim::parse_args(args)?;
                Ok(Conf::Mssim { host, port })
            }
            other => {
                log::error!("unknown TCTI {other:?}");
                Err(Error::tcti(base::BAD_VALUE))
            }
        }
    }
}

impl Conf {
    pub fn load(&self) -> Result<Box<dyn Tcti>> {
        match self {
            Conf::Default => load_default(),
            Conf::Device(path) => Ok(Box::new(Device::open(path)?)),
            Conf::Mssim { host, port } => Ok(Box::new(Mssim::connect(host, *port)?)),
        }
    }
}

pub fn load(conf: &str) -> Result<Box<dyn Tcti>> {
    conf.parse::<Conf>()?.load()
}

fn load_default() -> Result<Box<dyn Tcti>> {
    for path in DEFAULT_DEVICES {
        match Device::open(path) {
            Ok(device) => {
                log::debug!("using TPM device {path}");
                return Ok(Box::new(device));
            }
            Err(e) => log::debug!("could not open {path}: {e}"),
        }
    }

    match Mssim::connect(mssim::DEFAULT_HOST, mssim::DEFAULT_PORT) {
        Ok(mssim) => Ok(Box::new(mssim)),
        Err(e) => {
            log::debug!(
                "could not connect to simulator at {}:{}: {e}",
                mssim::DEFAULT_HOST,
                mssim::DEFAULT_PORT
            );
            log::error!("no TPM transport could be initialized");
            Err(Error::tcti(base::IO_ERROR))
        }
    }
}

pub(crate) fn io_error(err: &std::io::Error) -> Error {
    log::error!("TCTI I/O failure: {err}");
    Error::tcti(base::IO_ERROR)
}
