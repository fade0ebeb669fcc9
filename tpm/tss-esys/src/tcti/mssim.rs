// Copyright (c) Microsoft. All rights reserved.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::error::base;
use crate::{Error, Result};

use super::{io_error, Tcti, Timeout, MAX_MESSAGE_SIZE};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 2321;

const TPM_SIGNAL_POWER_ON: u32 = 1;
const TPM_SEND_COMMAND: u32 = 8;
const TPM_SIGNAL_NV_ON: u32 = 11;
const TPM_SESSION_END: u32 = 20;

pub(crate) fn parse_args(args: &str) -> Result<(String, u16)> {
    let mut host = DEFAULT_HOST.to_owned();
    let mut port = DEFAULT_PORT;

    for pair in args.split(',').filter(|pair| !pair.is_empty()) {
        match pair.split_once('=') {
            Some(("host", value)) => value.clone_into(&mut host),
            Some(("port", value)) => {
                port = value.parse().map_err(|_| {
                    log::error!("invalid simulator port {value:?}");
                    Error::tcti(base::BAD_VALUE)
                })?;
            }
            _ => {
                log::error!("unknown simulator option {pair:?}");
                return Err(Error::tcti(base::BAD_VALUE));
            }
        }
    }

    Ok((host, port))
}

/// The TCP protocol of the reference TPM simulator and of swtpm in socket mode.
///
/// Commands travel on `port`, platform signals on `port + 1`.
#[derive(Debug)]
pub struct Mssim {
    command: TcpStream,
    platform: TcpStream,
    locality: u8,
    pending: bool,
}

impl Mssim {
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let platform_port = port.checked_add(1).ok_or(Error::tcti(base::BAD_VALUE))?;

        let command = TcpStream::connect((host, port)).map_err(|e| io_error(&e))?;
        let platform = TcpStream::connect((host, platform_port)).map_err(|e| io_error(&e))?;

        let mut mssim = Mssim {
            command,
            platform,
            locality: 0,
            pending: false,
        };
        mssim.signal(TPM_SIGNAL_POWER_ON)?;
        mssim.signal(TPM_SIGNAL_NV_ON)?;

        Ok(mssim)
    }

    fn signal(&mut self, signal: u32) -> Result<()> {
        self.platform
            .write_all(&signal.to_be_bytes())
            .map_err(|e| io_error(&e))?;
        expect_ack(&mut self.platform)
    }
}

fn read_u32(stream: &mut TcpStream) -> Result<u32> {
    let mut buf = [0; 4];
    stream.read_exact(&mut buf).map_err(|e| io_error(&e))?;
    Ok(u32::from_be_bytes(buf))
}

fn expect_ack(stream: &mut TcpStream) -> Result<()> {
    match read_u32(stream)? {
        0 => Ok(()),
        ack => {
            log::error!("simulator returned failure ack 0x{ack:08X}");
            Err(Error::tcti(base::IO_ERROR))
        }
    }
}

impl Tcti for Mssim {
    fn transmit(&mut self, command: &[u8]) -> Result<()> {
        if self.pending {
            return Err(Error::tcti(base::BAD_SEQUENCE));
        }
        let len = u32::try_from(command.len()).map_err(|_| Error::tcti(base::BAD_VALUE))?;

        let mut message = Vec::with_capacity(command.len() + 9);
        message.extend_from_slice(&TPM_SEND_COMMAND.to_be_bytes());
        message.push(self.locality);
        message.extend_from_slice(&len.to_be_bytes());
        message.extend_from_slice(command);

        self.command
            .write_all(&message)
            .map_err(|e| io_error(&e))?;
        self.pending = true;
        Ok(())
    }

    fn receive(&mut self, timeout: Timeout) -> Result<Vec<u8>> {
        if !self.pending {
            return Err(Error::tcti(base::BAD_SEQUENCE));
        }

        // Wait without consuming anything, so a timeout never splits a response.
        let wait = match timeout {
            Timeout::Block => None,
            Timeout::After(d) => Some(d.max(Duration::from_millis(1))),
        };
        self.command
            .set_read_timeout(wait)
            .map_err(|e| io_error(&e))?;
        match self.command.peek(&mut [0; 1]) {
            Ok(_) => (),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(Error::tcti(base::TRY_AGAIN));
            }
            Err(e) => {
                self.pending = false;
                return Err(io_error(&e));
            }
        }
        self.command
            .set_read_timeout(None)
            .map_err(|e| io_error(&e))?;

        self.pending = false;

        let len = usize::try_from(read_u32(&mut self.command)?)
            .map_err(|_| Error::tcti(base::MALFORMED_RESPONSE))?;
        if len > MAX_MESSAGE_SIZE {
            return Err(Error::tcti(base::MALFORMED_RESPONSE));
        }

        let mut response = vec![0; len];
        self.command
            .read_exact(&mut response)
            .map_err(|e| io_error(&e))?;
        expect_ack(&mut self.command)?;

        Ok(response)
    }

    fn set_locality(&mut self, locality: u8) -> Result<()> {
        if self.pending {
            return Err(Error::tcti(base::BAD_SEQUENCE));
        }
        self.locality = locality;
        Ok(())
    }
}

impl Drop for Mssim {
    fn drop(&mut self) {
        for stream in [&mut self.command, &mut self.platform] {
            if let Err(e) = stream.write_all(&TPM_SESSION_END.to_be_bytes()) {
                log::debug!("could not end simulator session: {e}");
            }
        }
    }
}
