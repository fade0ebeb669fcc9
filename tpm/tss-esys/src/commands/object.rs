// Copyright (c) Microsoft. All rights reserved.

use crate::error::base;
use crate::marshal::{Marshal, Unmarshal};
use crate::resource::{object_name, Payload, ResourceTable};
use crate::types::{
    alg, cc, Tpm2bIv, Tpm2bMaxBuffer, Tpm2bName, Tpm2bPublic, Tpm2bSensitive, TpmAlgId, TpmCc,
    TpmHandle,
};
use crate::{EsysTr, Error, Result};

use super::{check_hierarchy, Command, Minted};

#[derive(Clone, Debug)]
pub struct ReadPublic {
    pub object_handle: EsysTr,
}

impl Command for ReadPublic {
    const CODE: TpmCc = cc::READ_PUBLIC;
    const ENCRYPT: bool = true;

    /// `(outPublic, name, qualifiedName)`
    type Response = (Tpm2bPublic, Tpm2bName, Tpm2bName);
    type Output = (Tpm2bPublic, Tpm2bName, Tpm2bName);

    fn handles(&self) -> Vec<EsysTr> {
        vec![self.object_handle]
    }

    fn marshal_parameters(&self, _: &mut &mut [u8]) -> Result<()> {
        Ok(())
    }

    fn unmarshal_response(buf: &mut &[u8]) -> Result<Self::Response> {
        Ok((buf.unmarshal()?, buf.unmarshal()?, buf.unmarshal()?))
    }

    fn apply(
        &self,
        resources: &mut ResourceTable,
        _: Option<Minted>,
        response: Self::Response,
    ) -> Result<Self::Output> {
        let object = resources.get_mut(self.object_handle)?;
        if object_name(&response.0)? != response.1 {
            log::error!(
                "name returned for 0x{:08X} does not match its public area",
                object.handle
            );
            return Err(Error::esys(base::MALFORMED_RESPONSE));
        }
        object.name = response.1.clone();
        object.payload = Payload::Public(response.0.clone());
        Ok(response)
    }
}

/// Loads a public area (and optionally its sensitive part) that was never protected by the TPM.
#[derive(Clone, Debug)]
pub struct LoadExternal {
    pub in_private: Option<Tpm2bSensitive>,
    pub in_public: Tpm2bPublic,
    pub hierarchy: TpmHandle,
}

impl Command for LoadExternal {
    const CODE: TpmCc = cc::LOAD_EXTERNAL;
    const DECRYPT: bool = true;
    const ENCRYPT: bool = true;
    const RESPONSE_HANDLE: bool = true;
    const MINTS: bool = true;

    type Response = Tpm2bName;
    type Output = EsysTr;

    fn check_parameters(&self) -> Result<()> {
        check_hierarchy(self.hierarchy)?;
        if self.in_public.name_alg().is_none() {
            log::error!("public area is too short to carry a name algorithm");
            return Err(Error::esys(base::BAD_VALUE));
        }
        Ok(())
    }

    fn marshal_parameters(&self, buf: &mut &mut [u8]) -> Result<()> {
        buf.marshal(&self.in_private)?;
        buf.marshal(&self.in_public)?;
        buf.marshal(&self.hierarchy)
    }

    fn unmarshal_response(buf: &mut &[u8]) -> Result<Tpm2bName> {
        buf.unmarshal()
    }

    fn apply(
        &self,
        resources: &mut ResourceTable,
        minted: Option<Minted>,
        name: Tpm2bName,
    ) -> Result<EsysTr> {
        let (id, handle) = Minted::require(minted)?.response_handle()?;

        if object_name(&self.in_public)? != name {
            log::error!("name returned for 0x{handle:08X} does not match the loaded public area");
            return Err(Error::esys(base::MALFORMED_RESPONSE));
        }

        let object = resources.get_mut(id)?;
        object.handle = handle;
        object.name = name;
        object.payload = Payload::Public(self.in_public.clone());

        Ok(id)
    }
}

#[derive(Clone, Debug)]
pub struct EncryptDecrypt {
    pub key_handle: EsysTr,
    pub decrypt: bool,
    pub mode: TpmAlgId,
    pub iv_in: Option<Tpm2bIv>,
    pub in_data: Option<Tpm2bMaxBuffer>,
}

impl Command for EncryptDecrypt {
    const CODE: TpmCc = cc::ENCRYPT_DECRYPT;
    const AUTH_HANDLES: usize = 1;
    const MIN_SESSIONS: usize = 1;
    // The first parameter is the decrypt flag, not a sized buffer.
    const ENCRYPT: bool = true;

    /// `(outData, ivOut)`
    type Response = (Tpm2bMaxBuffer, Tpm2bIv);
    type Output = (Tpm2bMaxBuffer, Tpm2bIv);

    fn handles(&self) -> Vec<EsysTr> {
        vec![self.key_handle]
    }

    fn check_parameters(&self) -> Result<()> {
        match self.mode {
            alg::NULL | alg::CFB | alg::CBC | alg::CTR | alg::OFB | alg::ECB => Ok(()),
            other => {
                log::error!("invalid cipher mode 0x{other:04X}");
                Err(Error::esys(base::BAD_VALUE))
            }
        }
    }

    fn marshal_parameters(&self, buf: &mut &mut [u8]) -> Result<()> {
        buf.marshal(&u8::from(self.decrypt))?;
        buf.marshal(&self.mode)?;
        buf.marshal(&self.iv_in)?;
        buf.marshal(&self.in_data)
    }

    fn unmarshal_response(buf: &mut &[u8]) -> Result<Self::Response> {
        Ok((buf.unmarshal()?, buf.unmarshal()?))
    }

    fn apply(
        &self,
        _: &mut ResourceTable,
        _: Option<Minted>,
        response: Self::Response,
    ) -> Result<Self::Output> {
        Ok(response)
    }
}
