// Copyright (c) Microsoft. All rights reserved.

use crate::error::base;
use crate::marshal::{marshal_sized, unmarshal_sized, Marshal, Unmarshal};
use crate::resource::{nv_name, Payload, ResourceTable};
use crate::types::{
    cc, handle_type, ht, nv_attr, Tpm2bAuth, Tpm2bMaxNvBuffer, Tpm2bName, TpmCc, TpmsNvPublic,
};
use crate::{EsysTr, Error, Result};

use super::{check_hash_alg, Command, Minted};

#[derive(Clone, Debug)]
pub struct NvDefineSpace {
    pub auth_handle: EsysTr,
    pub auth: Option<Tpm2bAuth>,
    pub public_info: TpmsNvPublic,
}

impl Command for NvDefineSpace {
    const CODE: TpmCc = cc::NV_DEFINE_SPACE;
    const AUTH_HANDLES: usize = 1;
    const MIN_SESSIONS: usize = 1;
    const DECRYPT: bool = true;
    const MINTS: bool = true;

    type Response = ();
    type Output = EsysTr;

    fn handles(&self) -> Vec<EsysTr> {
        vec![self.auth_handle]
    }

    fn check_parameters(&self) -> Result<()> {
        check_hash_alg(self.public_info.name_alg)?;
        if handle_type(self.public_info.nv_index) != ht::NV_INDEX {
            log::error!(
                "0x{:08X} is not an NV index handle",
                self.public_info.nv_index
            );
            return Err(Error::esys(base::BAD_VALUE));
        }
        Ok(())
    }

    fn marshal_parameters(&self, buf: &mut &mut [u8]) -> Result<()> {
        buf.marshal(&self.auth)?;
        marshal_sized(buf, |buf| buf.marshal(&self.public_info))
    }

    fn unmarshal_response(_: &mut &[u8]) -> Result<()> {
        Ok(())
    }

    fn apply(&self, resources: &mut ResourceTable, minted: Option<Minted>, (): ()) -> Result<EsysTr> {
        let id = Minted::require(minted)?.id;

        let object = resources.get_mut(id)?;
        object.handle = self.public_info.nv_index;
        object.name = nv_name(&self.public_info)?;
        object.auth = self.auth.clone().unwrap_or_default();
        object.payload = Payload::NvPublic(self.public_info.clone());

        Ok(id)
    }
}

#[derive(Clone, Debug)]
pub struct NvUndefineSpace {
    pub auth_handle: EsysTr,
    pub nv_index: EsysTr,
}

impl Command for NvUndefineSpace {
    const CODE: TpmCc = cc::NV_UNDEFINE_SPACE;
    const AUTH_HANDLES: usize = 1;
    const MIN_SESSIONS: usize = 1;

    type Response = ();
    type Output = ();

    fn handles(&self) -> Vec<EsysTr> {
        vec![self.auth_handle, self.nv_index]
    }

    fn marshal_parameters(&self, _: &mut &mut [u8]) -> Result<()> {
        Ok(())
    }

    fn unmarshal_response(_: &mut &[u8]) -> Result<()> {
        Ok(())
    }

    fn apply(&self, resources: &mut ResourceTable, _: Option<Minted>, (): ()) -> Result<()> {
        resources.delete(self.nv_index)?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct NvReadPublic {
    pub nv_index: EsysTr,
}

impl Command for NvReadPublic {
    const CODE: TpmCc = cc::NV_READ_PUBLIC;
    const ENCRYPT: bool = true;

    type Response = (TpmsNvPublic, Tpm2bName);
    type Output = (TpmsNvPublic, Tpm2bName);

    fn handles(&self) -> Vec<EsysTr> {
        vec![self.nv_index]
    }

    fn marshal_parameters(&self, _: &mut &mut [u8]) -> Result<()> {
        Ok(())
    }

    fn unmarshal_response(buf: &mut &[u8]) -> Result<Self::Response> {
        let public = unmarshal_sized(buf, |buf| buf.unmarshal())?;
        let name = buf.unmarshal()?;
        Ok((public, name))
    }

    fn apply(
        &self,
        resources: &mut ResourceTable,
        _: Option<Minted>,
        (public, name): Self::Response,
    ) -> Result<Self::Output> {
        if nv_name(&public)? != name {
            log::error!(
                "name returned for NV index 0x{:08X} does not match its public area",
                public.nv_index
            );
            return Err(Error::esys(base::MALFORMED_RESPONSE));
        }

        let object = resources.get_mut(self.nv_index)?;
        object.name = name.clone();
        object.payload = Payload::NvPublic(public.clone());

        Ok((public, name))
    }
}

#[derive(Clone, Debug)]
pub struct NvRead {
    pub auth_handle: EsysTr,
    pub nv_index: EsysTr,
    pub size: u16,
    pub offset: u16,
}

impl Command for NvRead {
    const CODE: TpmCc = cc::NV_READ;
    const AUTH_HANDLES: usize = 1;
    const MIN_SESSIONS: usize = 1;
    const ENCRYPT: bool = true;

    type Response = Tpm2bMaxNvBuffer;
    type Output = Tpm2bMaxNvBuffer;

    fn handles(&self) -> Vec<EsysTr> {
        vec![self.auth_handle, self.nv_index]
    }

    fn marshal_parameters(&self, buf: &mut &mut [u8]) -> Result<()> {
        buf.marshal(&self.size)?;
        buf.marshal(&self.offset)
    }

    fn unmarshal_response(buf: &mut &[u8]) -> Result<Tpm2bMaxNvBuffer> {
        buf.unmarshal()
    }

    fn apply(
        &self,
        _: &mut ResourceTable,
        _: Option<Minted>,
        data: Tpm2bMaxNvBuffer,
    ) -> Result<Tpm2bMaxNvBuffer> {
        Ok(data)
    }
}

#[derive(Clone, Debug)]
pub struct NvWrite {
    pub auth_handle: EsysTr,
    pub nv_index: EsysTr,
    pub data: Tpm2bMaxNvBuffer,
    pub offset: u16,
}

impl Command for NvWrite {
    const CODE: TpmCc = cc::NV_WRITE;
    const AUTH_HANDLES: usize = 1;
    const MIN_SESSIONS: usize = 1;
    const DECRYPT: bool = true;

    type Response = ();
    type Output = ();

    fn handles(&self) -> Vec<EsysTr> {
        vec![self.auth_handle, self.nv_index]
    }

    fn marshal_parameters(&self, buf: &mut &mut [u8]) -> Result<()> {
        buf.marshal(&self.data)?;
        buf.marshal(&self.offset)
    }

    fn unmarshal_response(_: &mut &[u8]) -> Result<()> {
        Ok(())
    }

    fn apply(&self, resources: &mut ResourceTable, _: Option<Minted>, (): ()) -> Result<()> {
        let object = resources.get_mut(self.nv_index)?;

        // The first write flips TPMA_NV_WRITTEN, which is part of the name.
        match &mut object.payload {
            Payload::NvPublic(public) => {
                public.attributes |= nv_attr::WRITTEN;
                object.name = nv_name(public)?;
            }
            _ => log::warn!(
                "{:?} has no NV public area; its name was not updated",
                self.nv_index
            ),
        }

        Ok(())
    }
}
