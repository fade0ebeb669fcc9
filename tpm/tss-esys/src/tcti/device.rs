// Copyright (c) Microsoft. All rights reserved.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::error::base;
use crate::sys::HEADER_SIZE;
use crate::{Error, Result};

use super::{io_error, Tcti, Timeout, MAX_MESSAGE_SIZE};

/// A TPM character device such as `/dev/tpmrm0`.
#[derive(Debug)]
pub struct Device {
    file: File,
    path: PathBuf,
    pending: bool,
}

impl Device {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                log::debug!("could not open {}: {e}", path.display());
                Error::tcti(base::IO_ERROR)
            })?;

        Ok(Device {
            file,
            path: path.to_owned(),
            pending: false,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn readable(&self, timeout: Timeout) -> Result<bool> {
        let fd = self.file.as_raw_fd();
        wait_readable(timeout, |timeout_ms| {
            let mut fds = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };

            // SAFETY: `fds` is a single valid pollfd that lives across the call.
            match unsafe { libc::poll(&mut fds, 1, timeout_ms) } {
                -1 => Err(std::io::Error::last_os_error()),
                ready => Ok(ready > 0),
            }
        })
        .map_err(|e| io_error(&e))
    }
}

/// Polls until ready or until `timeout` runs out. A poll interrupted by a signal is retried
/// with whatever time remains.
fn wait_readable(
    timeout: Timeout,
    mut poll: impl FnMut(libc::c_int) -> std::io::Result<bool>,
) -> std::io::Result<bool> {
    let deadline = match timeout {
        Timeout::Block => None,
        Timeout::After(d) => Some(Instant::now() + d),
    };

    loop {
        let timeout_ms = match deadline {
            None => -1,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                libc::c_int::try_from(remaining.as_millis()).unwrap_or(libc::c_int::MAX)
            }
        };

        match poll(timeout_ms) {
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                log::debug!("poll interrupted; retrying");
            }
            result => return result,
        }
    }
}

impl Tcti for Device {
    fn transmit(&mut self, command: &[u8]) -> Result<()> {
        if self.pending {
            return Err(Error::tcti(base::BAD_SEQUENCE));
        }

        log::trace!("{}: sending {} bytes", self.path.display(), command.len());
        self.file.write_all(command).map_err(|e| io_error(&e))?;
        self.pending = true;
        Ok(())
    }

    fn receive(&mut self, timeout: Timeout) -> Result<Vec<u8>> {
        if !self.pending {
            return Err(Error::tcti(base::BAD_SEQUENCE));
        }

        if !self.readable(timeout)? {
            return Err(Error::tcti(base::TRY_AGAIN));
        }

        let mut response = vec![0; MAX_MESSAGE_SIZE];
        let read = self.file.read(&mut response);
        self.pending = false;

        let len = read.map_err(|e| io_error(&e))?;
        if len == 0 {
            return Err(Error::tcti(base::IO_ERROR));
        }
        if len < HEADER_SIZE {
            return Err(Error::tcti(base::MALFORMED_RESPONSE));
        }

        response.truncate(len);
        Ok(response)
    }
}
