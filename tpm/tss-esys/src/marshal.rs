// Copyright (c) Microsoft. All rights reserved.

use crate::error::base;
use crate::types::{
    alg, AuthCommand, AuthResponse, Tpm2bAuth, Tpm2bData, Tpm2bDigest, Tpm2bEncryptedSecret,
    Tpm2bIv, Tpm2bMaxBuffer, Tpm2bMaxNvBuffer, Tpm2bName, Tpm2bNonce, Tpm2bPublic,
    Tpm2bSensitive, Tpm2bTimeout, TpmsNvPublic, TpmtSymDef, TpmtTk,
};
use crate::{Error, Result};

pub trait Marshal<T> {
    fn marshal(&mut self, data: &T) -> Result<()>;
}

pub trait Unmarshal<T> {
    fn unmarshal(&mut self) -> Result<T>;
}

pub(crate) fn put_bytes(buf: &mut &mut [u8], bytes: &[u8]) -> Result<()> {
    if buf.len() < bytes.len() {
        return Err(Error::mu(base::INSUFFICIENT_BUFFER));
    }

    let (head, rest) = std::mem::take(buf).split_at_mut(bytes.len());
    head.copy_from_slice(bytes);
    *buf = rest;
    Ok(())
}

pub(crate) fn take_bytes<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if buf.len() < len {
        return Err(Error::mu(base::INSUFFICIENT_BUFFER));
    }

    let (head, rest) = buf.split_at(len);
    *buf = rest;
    Ok(head)
}

/// Runs `f` against a cursor over a buffer of `capacity` bytes and returns what was written.
pub(crate) fn marshal_to_vec(
    capacity: usize,
    f: impl FnOnce(&mut &mut [u8]) -> Result<()>,
) -> Result<Vec<u8>> {
    let mut storage = vec![0_u8; capacity];
    let mut cursor = &mut storage[..];
    f(&mut cursor)?;
    let used = capacity - cursor.len();
    storage.truncate(used);
    Ok(storage)
}

/// Writes a `u16` size prefix followed by whatever `f` marshals.
pub(crate) fn marshal_sized(
    buf: &mut &mut [u8],
    f: impl FnOnce(&mut &mut [u8]) -> Result<()>,
) -> Result<()> {
    let body = marshal_to_vec(buf.len(), f)?;
    let size = u16::try_from(body.len()).map_err(|_| Error::mu(base::BAD_SIZE))?;
    buf.marshal(&size)?;
    put_bytes(buf, &body)
}

/// Reads a `u16` size prefix and hands exactly that many bytes to `f`, which must consume them all.
pub(crate) fn unmarshal_sized<T>(
    buf: &mut &[u8],
    f: impl FnOnce(&mut &[u8]) -> Result<T>,
) -> Result<T> {
    let size: u16 = buf.unmarshal()?;
    let mut body = take_bytes(buf, size.into())?;
    let value = f(&mut body)?;
    if !body.is_empty() {
        return Err(Error::mu(base::BAD_SIZE));
    }
    Ok(value)
}

macro_rules! integers {
    ($($ty:ty),*) => {
        $(
            impl Marshal<$ty> for &mut [u8] {
                fn marshal(&mut self, data: &$ty) -> Result<()> {
                    put_bytes(self, &data.to_be_bytes())
                }
            }

            impl Unmarshal<$ty> for &[u8] {
                fn unmarshal(&mut self) -> Result<$ty> {
                    let bytes = take_bytes(self, std::mem::size_of::<$ty>())?;
                    let bytes = bytes.try_into().map_err(|_| Error::mu(base::BAD_SIZE))?;
                    Ok(<$ty>::from_be_bytes(bytes))
                }
            }
        )*
    };
}

integers!(u8, u16, u32, u64);

macro_rules! tpm2b {
    ($($ts:ident),*) => {
        $(
            impl Marshal<$ts> for &mut [u8] {
                fn marshal(&mut self, data: &$ts) -> Result<()> {
                    let size = u16::try_from(data.len()).map_err(|_| Error::mu(base::BAD_SIZE))?;
                    self.marshal(&size)?;
                    put_bytes(self, data)
                }
            }

            impl Unmarshal<$ts> for &[u8] {
                fn unmarshal(&mut self) -> Result<$ts> {
                    let size: u16 = self.unmarshal()?;
                    if usize::from(size) > $ts::MAX_SIZE {
                        return Err(Error::mu(base::BAD_SIZE));
                    }
                    let bytes = take_bytes(self, size.into())?;
                    $ts::new(bytes)
                }
            }
        )*
    };
}

tpm2b! {
    Tpm2bAuth,
    Tpm2bData,
    Tpm2bDigest,
    Tpm2bEncryptedSecret,
    Tpm2bIv,
    Tpm2bMaxBuffer,
    Tpm2bMaxNvBuffer,
    Tpm2bName,
    Tpm2bNonce,
    Tpm2bPublic,
    Tpm2bSensitive,
    Tpm2bTimeout
}

/// An absent buffer is encoded as an empty one.
impl<'a, T> Marshal<Option<T>> for &'a mut [u8]
where
    &'a mut [u8]: Marshal<T>,
    T: Default,
{
    fn marshal(&mut self, data: &Option<T>) -> Result<()> {
        match data {
            Some(data) => self.marshal(data),
            None => self.marshal(&T::default()),
        }
    }
}

impl Marshal<TpmsNvPublic> for &mut [u8] {
    fn marshal(&mut self, data: &TpmsNvPublic) -> Result<()> {
        self.marshal(&data.nv_index)?;
        self.marshal(&data.name_alg)?;
        self.marshal(&data.attributes)?;
        self.marshal(&data.auth_policy)?;
        self.marshal(&data.data_size)
    }
}

impl Unmarshal<TpmsNvPublic> for &[u8] {
    fn unmarshal(&mut self) -> Result<TpmsNvPublic> {
        Ok(TpmsNvPublic {
            nv_index: self.unmarshal()?,
            name_alg: self.unmarshal()?,
            attributes: self.unmarshal()?,
            auth_policy: self.unmarshal()?,
            data_size: self.unmarshal()?,
        })
    }
}

impl Marshal<TpmtSymDef> for &mut [u8] {
    fn marshal(&mut self, data: &TpmtSymDef) -> Result<()> {
        self.marshal(&data.algorithm)?;
        if data.algorithm == alg::NULL {
            return Ok(());
        }
        self.marshal(&data.key_bits)?;
        if data.algorithm == alg::XOR {
            return Ok(());
        }
        self.marshal(&data.mode)
    }
}

impl Unmarshal<TpmtSymDef> for &[u8] {
    fn unmarshal(&mut self) -> Result<TpmtSymDef> {
        let algorithm = self.unmarshal()?;
        if algorithm == alg::NULL {
            return Ok(TpmtSymDef::NULL);
        }
        let key_bits = self.unmarshal()?;
        let mode = if algorithm == alg::XOR {
            alg::NULL
        } else {
            self.unmarshal()?
        };
        Ok(TpmtSymDef {
            algorithm,
            key_bits,
            mode,
        })
    }
}

impl Marshal<TpmtTk> for &mut [u8] {
    fn marshal(&mut self, data: &TpmtTk) -> Result<()> {
        self.marshal(&data.tag)?;
        self.marshal(&data.hierarchy)?;
        self.marshal(&data.digest)
    }
}

impl Unmarshal<TpmtTk> for &[u8] {
    fn unmarshal(&mut self) -> Result<TpmtTk> {
        Ok(TpmtTk {
            tag: self.unmarshal()?,
            hierarchy: self.unmarshal()?,
            digest: self.unmarshal()?,
        })
    }
}

impl Marshal<AuthCommand> for &mut [u8] {
    fn marshal(&mut self, data: &AuthCommand) -> Result<()> {
        self.marshal(&data.session_handle)?;
        self.marshal(&data.nonce)?;
        self.marshal(&data.attributes)?;
        self.marshal(&data.hmac)
    }
}

impl Unmarshal<AuthCommand> for &[u8] {
    fn unmarshal(&mut self) -> Result<AuthCommand> {
        Ok(AuthCommand {
            session_handle: self.unmarshal()?,
            nonce: self.unmarshal()?,
            attributes: self.unmarshal()?,
            hmac: self.unmarshal()?,
        })
    }
}

impl Marshal<AuthResponse> for &mut [u8] {
    fn marshal(&mut self, data: &AuthResponse) -> Result<()> {
        self.marshal(&data.nonce)?;
        self.marshal(&data.attributes)?;
        self.marshal(&data.hmac)
    }
}

impl Unmarshal<AuthResponse> for &[u8] {
    fn unmarshal(&mut self) -> Result<AuthResponse> {
        Ok(AuthResponse {
            nonce: self.unmarshal()?,
            attributes: self.unmarshal()?,
            hmac: self.unmarshal()?,
        })
    }
}
