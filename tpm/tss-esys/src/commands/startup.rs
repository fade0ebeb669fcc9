// Copyright (c) Microsoft. All rights reserved.

use crate::error::base;
use crate::marshal::{Marshal, Unmarshal};
use crate::resource::ResourceTable;
use crate::types::{cc, su, Tpm2bDigest, TpmCc};
use crate::{Error, Result};

use super::{Command, Minted};

#[derive(Clone, Debug)]
pub struct Startup {
    pub startup_type: u16,
}

impl Command for Startup {
    const CODE: TpmCc = cc::STARTUP;

    type Response = ();
    type Output = ();

    fn check_parameters(&self) -> Result<()> {
        match self.startup_type {
            su::CLEAR | su::STATE => Ok(()),
            other => {
                log::error!("invalid startup type 0x{other:04X}");
                Err(Error::esys(base::BAD_VALUE))
            }
        }
    }

    fn marshal_parameters(&self, buf: &mut &mut [u8]) -> Result<()> {
        buf.marshal(&self.startup_type)
    }

    fn unmarshal_response(_buf: &mut &[u8]) -> Result<()> {
        Ok(())
    }

    fn apply(&self, _: &mut ResourceTable, _: Option<Minted>, (): ()) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct GetRandom {
    pub bytes_requested: u16,
}

impl Command for GetRandom {
    const CODE: TpmCc = cc::GET_RANDOM;
    const ENCRYPT: bool = true;

    type Response = Tpm2bDigest;
    type Output = Tpm2bDigest;

    fn marshal_parameters(&self, buf: &mut &mut [u8]) -> Result<()> {
        buf.marshal(&self.bytes_requested)
    }

    fn unmarshal_response(buf: &mut &[u8]) -> Result<Tpm2bDigest> {
        buf.unmarshal()
    }

    fn apply(
        &self,
        _: &mut ResourceTable,
        _: Option<Minted>,
        random_bytes: Tpm2bDigest,
    ) -> Result<Tpm2bDigest> {
        Ok(random_bytes)
    }
}
