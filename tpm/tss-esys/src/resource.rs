// Copyright (c) Microsoft. All rights reserved.

use std::collections::HashMap;

use crate::error::base;
use crate::marshal::{marshal_to_vec, Marshal};
use crate::types::{
    self, Tpm2bAuth, Tpm2bName, Tpm2bNonce, Tpm2bPublic, TpmAlgId, TpmHandle, TpmsNvPublic,
    TpmtSymDef,
};
use crate::{crypto, EsysTr, Error, Result};

/// Per-session state carried between commands.
#[derive(Clone, Debug, Default)]
pub(crate) struct Session {
    pub(crate) session_type: u8,
    pub(crate) auth_hash: TpmAlgId,
    pub(crate) attributes: u8,
    pub(crate) symmetric: TpmtSymDef,
    pub(crate) nonce_caller: Tpm2bNonce,
    pub(crate) nonce_tpm: Tpm2bNonce,
    pub(crate) session_key: Vec<u8>,
    /// Key material for the command currently in flight.
    pub(crate) session_value: Vec<u8>,
    /// Name of the entity the session is bound to.
    pub(crate) bound: Option<Tpm2bName>,
}

#[derive(Clone, Debug, Default)]
pub(crate) enum Payload {
    #[default]
    None,
    Public(Tpm2bPublic),
    NvPublic(TpmsNvPublic),
    Session(Box<Session>),
}

#[derive(Clone, Debug)]
pub(crate) struct ResourceObject {
    pub(crate) handle: TpmHandle,
    pub(crate) name: Tpm2bName,
    pub(crate) auth: Tpm2bAuth,
    pub(crate) payload: Payload,
}

impl Default for ResourceObject {
    fn default() -> Self {
        ResourceObject {
            handle: types::rh::UNASSIGNED,
            name: Tpm2bName::default(),
            auth: Tpm2bAuth::default(),
            payload: Payload::None,
        }
    }
}

impl ResourceObject {
    pub(crate) fn session(&self) -> Option<&Session> {
        match &self.payload {
            Payload::Session(session) => Some(&**session),
            _ => None,
        }
    }

    pub(crate) fn session_mut(&mut self) -> Option<&mut Session> {
        match &mut self.payload {
            Payload::Session(session) => Some(&mut **session),
            _ => None,
        }
    }
}

/// Owned mapping from application-visible identifiers to object metadata.
#[derive(Debug, Default)]
pub struct ResourceTable {
    objects: HashMap<EsysTr, ResourceObject>,
}

impl ResourceTable {
    pub(crate) fn get(&self, id: EsysTr) -> Result<&ResourceObject> {
        self.objects.get(&id).ok_or(Error::esys(base::BAD_TR))
    }

    pub(crate) fn get_mut(&mut self, id: EsysTr) -> Result<&mut ResourceObject> {
        self.objects.get_mut(&id).ok_or(Error::esys(base::BAD_TR))
    }

    /// Inserts fresh metadata under `id`, which must not be in use.
    pub(crate) fn create(&mut self, id: EsysTr) -> Result<&mut ResourceObject> {
        match self.objects.entry(id) {
            std::collections::hash_map::Entry::Occupied(_) => Err(Error::esys(base::BAD_TR)),
            std::collections::hash_map::Entry::Vacant(entry) => {
                Ok(entry.insert(ResourceObject::default()))
            }
        }
    }

    pub(crate) fn delete(&mut self, id: EsysTr) -> Result<ResourceObject> {
        self.objects.remove(&id).ok_or(Error::esys(base::BAD_TR))
    }

    /// Looks up `id`, materializing well-known entities on first use.
    pub(crate) fn resolve(&mut self, id: EsysTr) -> Result<&mut ResourceObject> {
        if !self.objects.contains_key(&id) {
            let handle = id.well_known().ok_or(Error::esys(base::BAD_TR))?;
            let object = self.create(id)?;
            object.handle = handle;
            object.name = handle_name(handle)?;
        }
        self.get_mut(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.objects.len()
    }
}

/// Permanent entities, PCRs and sessions are named by their handle.
pub(crate) fn handle_name(handle: TpmHandle) -> Result<Tpm2bName> {
    Tpm2bName::new(&handle.to_be_bytes())
}

/// `nameAlg || H(TPMT_PUBLIC)`.
pub(crate) fn object_name(public: &Tpm2bPublic) -> Result<Tpm2bName> {
    let name_alg = public.name_alg().ok_or(Error::esys(base::BAD_VALUE))?;
    let digest = crypto::hash(name_alg, &[public.as_bytes()])?;
    let mut name = name_alg.to_be_bytes().to_vec();
    name.extend_from_slice(&digest);
    Tpm2bName::new(&name)
}

/// `nameAlg || H(TPMS_NV_PUBLIC)`.
pub(crate) fn nv_name(public: &TpmsNvPublic) -> Result<Tpm2bName> {
    let marshaled = marshal_to_vec(types::Tpm2bDigest::MAX_SIZE + 16, |buf| buf.marshal(public))?;
    let digest = crypto::hash(public.name_alg, &[&marshaled])?;
    let mut name = public.name_alg.to_be_bytes().to_vec();
    name.extend_from_slice(&digest);
    Tpm2bName::new(&name)
}

#[cfg(test)]
mod tests {
    use super::{handle_name, nv_name, ResourceTable};
    use crate::error::base;
    use crate::types::{alg, nv_attr, rh, Tpm2bDigest, TpmsNvPublic};
    use crate::{EsysTr, Error};

    #[test]
    fn create_get_delete() {
        let mut table = ResourceTable::default();
        let id = EsysTr(0x1000);

        assert_eq!(table.get(id).unwrap_err(), Error::esys(base::BAD_TR));

        let object = table.create(id).unwrap();
        assert_eq!(object.handle, rh::UNASSIGNED);
        assert!(object.name.is_empty());
        object.handle = 0x8000_0000;

        assert!(table.create(id).is_err());
        assert_eq!(table.get(id).unwrap().handle, 0x8000_0000);

        table.delete(id).unwrap();
        assert!(table.get(id).is_err());
        assert!(table.delete(id).is_err());
    }

    #[test]
    fn well_known_resolution_is_lazy() {
        let mut table = ResourceTable::default();
        assert_eq!(table.len(), 0);

        let owner = table.resolve(EsysTr::RH_OWNER).unwrap();
        assert_eq!(owner.handle, rh::OWNER);
        assert_eq!(owner.name.as_bytes(), &[0x40, 0, 0, 1]);
        assert_eq!(table.len(), 1);

        assert!(table.resolve(EsysTr(0x1234)).is_err());
        assert_eq!(handle_name(rh::NULL).unwrap().as_bytes(), &[0x40, 0, 0, 7]);
    }

    #[test]
    fn nv_name_tracks_written_bit() {
        let mut public = TpmsNvPublic {
            nv_index: 0x0150_0016,
            name_alg: alg::SHA256,
            attributes: nv_attr::AUTHWRITE | nv_attr::AUTHREAD,
            auth_policy: Tpm2bDigest::default(),
            data_size: 16,
        };

        let before = nv_name(&public).unwrap();
        assert_eq!(before.len(), 34);
        assert_eq!(&before[..2], &[0x00, 0x0B]);

        public.attributes |= nv_attr::WRITTEN;
        let after = nv_name(&public).unwrap();
        assert_ne!(before, after);
        assert_eq!(after, nv_name(&public).unwrap());
    }
}
