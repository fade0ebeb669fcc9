// Copyright (c) Microsoft. All rights reserved.

//! Command framing below the session layer: handle area, authorization area and parameters.

use crate::commands::Command;
use crate::error::base;
use crate::marshal::{marshal_to_vec, put_bytes, take_bytes, Marshal, Unmarshal};
use crate::tcti::{Tcti, Timeout, MAX_MESSAGE_SIZE};
use crate::types::{st, AuthCommand, AuthResponse, TpmCc, TpmHandle};
use crate::{Error, Result};

/// `tag || size || code`
pub const HEADER_SIZE: usize = 10;

#[derive(Debug, Default)]
pub(crate) struct Sys {
    command_code: Option<TpmCc>,
    handles: Vec<TpmHandle>,
    parameters: Vec<u8>,
    auths: Vec<AuthCommand>,
    response_handle: bool,
}

#[derive(Debug)]
pub(crate) struct Response {
    pub(crate) handle: Option<TpmHandle>,
    pub(crate) parameters: Vec<u8>,
    pub(crate) auths: Vec<AuthResponse>,
}

impl Sys {
    pub(crate) fn prepare<C: Command>(&mut self, command: &C, handles: Vec<TpmHandle>) -> Result<()> {
        let parameters = marshal_to_vec(MAX_MESSAGE_SIZE - HEADER_SIZE, |buf| {
            command.marshal_parameters(buf)
        })?;

        *self = Sys {
            command_code: Some(C::CODE),
            handles,
            parameters,
            auths: vec![],
            response_handle: C::RESPONSE_HANDLE,
        };
        Ok(())
    }

    pub(crate) fn command_code(&self) -> Result<TpmCc> {
        self.command_code.ok_or(Error::sys(base::BAD_SEQUENCE))
    }

    /// The marshaled parameter area, which is what cpHash covers.
    pub(crate) fn parameters(&self) -> &[u8] {
        &self.parameters
    }

    pub(crate) fn parameters_mut(&mut self) -> &mut [u8] {
        &mut self.parameters
    }

    pub(crate) fn set_auths(&mut self, auths: Vec<AuthCommand>) -> Result<()> {
        self.command_code()?;
        if auths.len() > 3 {
            return Err(Error::sys(base::BAD_VALUE));
        }
        self.auths = auths;
        Ok(())
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        let code = self.command_code()?;

        let mut command = marshal_to_vec(MAX_MESSAGE_SIZE, |buf| {
            let tag = if self.auths.is_empty() {
                st::NO_SESSIONS
            } else {
                st::SESSIONS
            };
            buf.marshal(&tag)?;
            buf.marshal(&0_u32)?;
            buf.marshal(&code)?;
            for handle in &self.handles {
                buf.marshal(handle)?;
            }

            if !self.auths.is_empty() {
                let area = marshal_to_vec(MAX_MESSAGE_SIZE, |area| {
                    self.auths.iter().try_for_each(|auth| area.marshal(auth))
                })?;
                let area_size = u32::try_from(area.len()).map_err(|_| Error::sys(base::BAD_SIZE))?;
                buf.marshal(&area_size)?;
                put_bytes(buf, &area)?;
            }

            put_bytes(buf, &self.parameters)
        })?;

        let size = u32::try_from(command.len()).map_err(|_| Error::sys(base::BAD_SIZE))?;
        command[2..6].copy_from_slice(&size.to_be_bytes());
        Ok(command)
    }

    pub(crate) fn execute_async(&self, tcti: &mut dyn Tcti) -> Result<()> {
        let command = self.encode()?;
        log::trace!("command: {}", hex(&command));
        tcti.transmit(&command)
    }

    pub(crate) fn execute_finish(&self, tcti: &mut dyn Tcti, timeout: Timeout) -> Result<Response> {
        let response = tcti.receive(timeout)?;
        log::trace!("response: {}", hex(&response));
        self.parse_response(&response)
    }

    fn parse_response(&self, response: &[u8]) -> Result<Response> {
        let malformed = |_| Error::sys(base::MALFORMED_RESPONSE);

        let mut buf = response;
        let tag: u16 = buf.unmarshal().map_err(malformed)?;
        let size: u32 = buf.unmarshal().map_err(malformed)?;
        let rc: u32 = buf.unmarshal().map_err(malformed)?;

        if usize::try_from(size).ok() != Some(response.len()) {
            log::error!(
                "response header claims {size} bytes but {} arrived",
                response.len()
            );
            return Err(Error::sys(base::MALFORMED_RESPONSE));
        }
        if rc != 0 {
            return Err(Error::from_code(rc));
        }

        let sessions = match tag {
            st::NO_SESSIONS if self.auths.is_empty() => false,
            st::SESSIONS if !self.auths.is_empty() => true,
            _ => {
                log::error!("unexpected response tag 0x{tag:04X}");
                return Err(Error::sys(base::MALFORMED_RESPONSE));
            }
        };

        self.parse_body(buf, sessions).map_err(malformed)
    }

    fn parse_body(&self, mut buf: &[u8], sessions: bool) -> Result<Response> {
        let handle = if self.response_handle {
            Some(buf.unmarshal()?)
        } else {
            None
        };

        if !sessions {
            return Ok(Response {
                handle,
                parameters: buf.to_vec(),
                auths: vec![],
            });
        }

        let parameter_size: u32 = buf.unmarshal()?;
        let parameter_size =
            usize::try_from(parameter_size).map_err(|_| Error::sys(base::MALFORMED_RESPONSE))?;
        let parameters = take_bytes(&mut buf, parameter_size)?.to_vec();

        let mut auths = Vec::with_capacity(self.auths.len());
        while !buf.is_empty() {
            auths.push(buf.unmarshal()?);
        }
        if auths.len() != self.auths.len() {
            log::error!(
                "response carries {} authorizations for {} sessions",
                auths.len(),
                self.auths.len()
            );
            return Err(Error::sys(base::MALFORMED_RESPONSE));
        }

        Ok(Response {
            handle,
            parameters,
            auths,
        })
    }
}

/// Marshals `command` as a complete session-less wire command addressed to `handles`.
pub fn prepare<C: Command>(command: &C, handles: &[TpmHandle]) -> Result<Vec<u8>> {
    let mut sys = Sys::default();
    sys.prepare(command, handles.to_vec())?;
    sys.encode()
}

/// Unmarshals the response parameter area of `C`.
pub fn complete<C: Command>(parameters: &[u8]) -> Result<C::Response> {
    let mut buf = parameters;
    let response = C::unmarshal_response(&mut buf)?;
    if !buf.is_empty() {
        return Err(Error::sys(base::MALFORMED_RESPONSE));
    }
    Ok(response)
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
