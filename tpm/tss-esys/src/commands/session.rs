// Copyright (c) Microsoft. All rights reserved.

use crate::crypto;
use crate::error::base;
use crate::marshal::{Marshal, Unmarshal};
use crate::resource::{handle_name, Payload, ResourceTable, Session};
use crate::types::{
    alg, cc, digest_size, se, session_attr, Tpm2bDigest, Tpm2bEncryptedSecret, Tpm2bName,
    Tpm2bNonce, Tpm2bTimeout, TpmAlgId, TpmCc, TpmHandle, TpmtSymDef, TpmtTkAuth,
};
use crate::{EsysTr, Error, Result};

use super::{check_hash_alg, Command, Minted};

/// Smallest caller nonce the TPM accepts when opening a session.
const MIN_NONCE_SIZE: usize = 16;

/// Opens an unsalted HMAC, policy or trial session, optionally bound to an entity.
#[derive(Clone, Debug)]
pub struct StartAuthSession {
    /// Salting is not supported, so this must be [`EsysTr::NONE`].
    pub tpm_key: EsysTr,
    pub bind: EsysTr,
    /// Generated with the size of `auth_hash` when absent.
    pub nonce_caller: Option<Tpm2bNonce>,
    pub session_type: u8,
    pub symmetric: TpmtSymDef,
    pub auth_hash: TpmAlgId,
}

impl StartAuthSession {
    fn check_symmetric(&self) -> Result<()> {
        let TpmtSymDef {
            algorithm,
            key_bits,
            mode,
        } = self.symmetric;

        let valid = match algorithm {
            alg::NULL => true,
            alg::AES => matches!(key_bits, 128 | 192 | 256) && mode == alg::CFB,
            alg::XOR => digest_size(key_bits).is_some(),
            _ => false,
        };
        if !valid {
            log::error!("unsupported session cipher {:?}", self.symmetric);
            return Err(Error::esys(base::BAD_VALUE));
        }
        Ok(())
    }
}

impl Command for StartAuthSession {
    const CODE: TpmCc = cc::START_AUTH_SESSION;
    const DECRYPT: bool = true;
    const ENCRYPT: bool = true;
    const RESPONSE_HANDLE: bool = true;
    const MINTS: bool = true;

    type Response = Tpm2bNonce;
    type Output = EsysTr;

    fn handles(&self) -> Vec<EsysTr> {
        vec![self.tpm_key, self.bind]
    }

    fn check_parameters(&self) -> Result<()> {
        if self.tpm_key != EsysTr::NONE {
            log::error!("salted sessions are not supported");
            return Err(Error::esys(base::BAD_VALUE));
        }

        if !matches!(self.session_type, se::HMAC | se::POLICY | se::TRIAL) {
            log::error!("invalid session type 0x{:02X}", self.session_type);
            return Err(Error::esys(base::BAD_VALUE));
        }

        check_hash_alg(self.auth_hash)?;
        self.check_symmetric()?;

        if let Some(nonce) = &self.nonce_caller {
            let max = digest_size(self.auth_hash).unwrap_or(0);
            if nonce.len() < MIN_NONCE_SIZE || nonce.len() > max {
                log::error!("caller nonce of {} bytes is out of range", nonce.len());
                return Err(Error::esys(base::BAD_VALUE));
            }
        }

        Ok(())
    }

    fn prepare_input(&mut self, _: &ResourceTable) -> Result<()> {
        if self.nonce_caller.is_none() {
            let size = digest_size(self.auth_hash).ok_or(Error::esys(base::BAD_VALUE))?;
            self.nonce_caller = Some(Tpm2bNonce::new(&crypto::random(size)?)?);
        }
        Ok(())
    }

    fn marshal_parameters(&self, buf: &mut &mut [u8]) -> Result<()> {
        buf.marshal(&self.nonce_caller)?;
        buf.marshal(&Tpm2bEncryptedSecret::default())?;
        buf.marshal(&self.session_type)?;
        buf.marshal(&self.symmetric)?;
        buf.marshal(&self.auth_hash)
    }

    fn unmarshal_response(buf: &mut &[u8]) -> Result<Tpm2bNonce> {
        buf.unmarshal()
    }

    fn apply(
        &self,
        resources: &mut ResourceTable,
        minted: Option<Minted>,
        nonce_tpm: Tpm2bNonce,
    ) -> Result<EsysTr> {
        let (id, handle) = Minted::require(minted)?.response_handle()?;
        let nonce_caller = self.nonce_caller.clone().unwrap_or_default();

        let (bound, session_key) = if self.bind == EsysTr::NONE {
            (None, vec![])
        } else {
            let bind = resources.resolve(self.bind)?;
            let bits = digest_size(self.auth_hash)
                .and_then(|size| u32::try_from(size * 8).ok())
                .ok_or(Error::esys(base::BAD_VALUE))?;
            let key = crypto::kdfa(
                self.auth_hash,
                crypto::trim_trailing_zeros(&bind.auth),
                b"ATH",
                &nonce_tpm,
                &nonce_caller,
                bits,
            )?;
            (Some(bind.name.clone()), key)
        };

        let object = resources.get_mut(id)?;
        object.handle = handle;
        object.name = handle_name(handle)?;
        object.payload = Payload::Session(Box::new(Session {
            session_type: self.session_type,
            auth_hash: self.auth_hash,
            attributes: session_attr::CONTINUE_SESSION,
            symmetric: self.symmetric,
            nonce_caller,
            nonce_tpm,
            session_key,
            session_value: vec![],
            bound,
        }));

        log::debug!("session 0x{handle:08X} started as {id:?}");
        Ok(id)
    }
}

/// Evicts a transient object, sequence or session from the TPM and forgets its identifier.
#[derive(Clone, Debug)]
pub struct FlushContext {
    pub flush_handle: EsysTr,
    resolved: TpmHandle,
}

impl FlushContext {
    #[must_use]
    pub fn new(flush_handle: EsysTr) -> Self {
        FlushContext {
            flush_handle,
            resolved: crate::types::rh::UNASSIGNED,
        }
    }
}

impl Command for FlushContext {
    const CODE: TpmCc = cc::FLUSH_CONTEXT;

    type Response = ();
    type Output = ();

    fn check_parameters(&self) -> Result<()> {
        if !self.flush_handle.is_minted() {
            return Err(Error::esys(base::BAD_TR));
        }
        Ok(())
    }

    // The flushed handle travels as a parameter, so it is resolved here rather than in the handle area.
    fn prepare_input(&mut self, resources: &ResourceTable) -> Result<()> {
        self.resolved = resources.get(self.flush_handle)?.handle;
        Ok(())
    }

    fn marshal_parameters(&self, buf: &mut &mut [u8]) -> Result<()> {
        buf.marshal(&self.resolved)
    }

    fn unmarshal_response(_: &mut &[u8]) -> Result<()> {
        Ok(())
    }

    fn apply(&self, resources: &mut ResourceTable, _: Option<Minted>, (): ()) -> Result<()> {
        resources.delete(self.flush_handle)?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct PolicyTicket {
    pub policy_session: EsysTr,
    pub timeout: Tpm2bTimeout,
    pub cp_hash_a: Option<Tpm2bDigest>,
    pub policy_ref: Option<Tpm2bNonce>,
    pub auth_name: Tpm2bName,
    pub ticket: TpmtTkAuth,
}

impl Command for PolicyTicket {
    const CODE: TpmCc = cc::POLICY_TICKET;
    const DECRYPT: bool = true;

    type Response = ();
    type Output = ();

    fn handles(&self) -> Vec<EsysTr> {
        vec![self.policy_session]
    }

    fn marshal_parameters(&self, buf: &mut &mut [u8]) -> Result<()> {
        buf.marshal(&self.timeout)?;
        buf.marshal(&self.cp_hash_a)?;
        buf.marshal(&self.policy_ref)?;
        buf.marshal(&self.auth_name)?;
        buf.marshal(&self.ticket)
    }

    fn unmarshal_response(_: &mut &[u8]) -> Result<()> {
        Ok(())
    }

    fn apply(&self, _: &mut ResourceTable, _: Option<Minted>, (): ()) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct PolicyGetDigest {
    pub policy_session: EsysTr,
}

impl Command for PolicyGetDigest {
    const CODE: TpmCc = cc::POLICY_GET_DIGEST;
    const ENCRYPT: bool = true;

    type Response = Tpm2bDigest;
    type Output = Tpm2bDigest;

    fn handles(&self) -> Vec<EsysTr> {
        vec![self.policy_session]
    }

    fn marshal_parameters(&self, _: &mut &mut [u8]) -> Result<()> {
        Ok(())
    }

    fn unmarshal_response(buf: &mut &[u8]) -> Result<Tpm2bDigest> {
        buf.unmarshal()
    }

    fn apply(
        &self,
        _: &mut ResourceTable,
        _: Option<Minted>,
        policy_digest: Tpm2bDigest,
    ) -> Result<Tpm2bDigest> {
        Ok(policy_digest)
    }
}

#[cfg(test)]
mod tests {
    use super::{FlushContext, StartAuthSession};
    use crate::commands::{Command, Minted};
    use crate::error::base;
    use crate::resource::ResourceTable;
    use crate::types::{alg, se, session_attr, Tpm2bNonce, TpmtSymDef};
    use crate::{EsysTr, Error};

    fn start(bind: EsysTr) -> StartAuthSession {
        StartAuthSession {
            tpm_key: EsysTr::NONE,
            bind,
            nonce_caller: Some(Tpm2bNonce::new(&[1; 32]).unwrap()),
            session_type: se::HMAC,
            symmetric: TpmtSymDef::aes_cfb(128),
            auth_hash: alg::SHA256,
        }
    }

    #[test]
    fn parameter_domain() {
        assert!(start(EsysTr::NONE).check_parameters().is_ok());

        let mut salted = start(EsysTr::NONE);
        salted.tpm_key = EsysTr(0x1000);
        assert_eq!(
            salted.check_parameters().unwrap_err(),
            Error::esys(base::BAD_VALUE)
        );

        let mut bad_type = start(EsysTr::NONE);
        bad_type.session_type = 0x02;
        assert!(bad_type.check_parameters().is_err());

        let mut bad_hash = start(EsysTr::NONE);
        bad_hash.auth_hash = alg::NULL;
        assert!(bad_hash.check_parameters().is_err());

        let mut short_nonce = start(EsysTr::NONE);
        short_nonce.nonce_caller = Some(Tpm2bNonce::new(&[1; 8]).unwrap());
        assert!(short_nonce.check_parameters().is_err());
    }

    #[test]
    fn generated_nonce_is_kept() {
        let mut command = start(EsysTr::NONE);
        command.nonce_caller = None;
        command.prepare_input(&ResourceTable::default()).unwrap();
        let nonce = command.nonce_caller.clone().unwrap();
        assert_eq!(nonce.len(), 32);

        command.prepare_input(&ResourceTable::default()).unwrap();
        assert_eq!(command.nonce_caller.unwrap(), nonce);
    }

    #[test]
    fn bound_session_gets_key() {
        let mut resources = ResourceTable::default();
        resources.resolve(EsysTr::RH_OWNER).unwrap().auth =
            crate::types::Tpm2bAuth::new(b"owner\0\0").unwrap();

        let id = EsysTr(0x1000);
        resources.create(id).unwrap();
        let minted = Minted {
            id,
            handle: Some(0x0200_0000),
        };

        let out = start(EsysTr::RH_OWNER)
            .apply(&mut resources, Some(minted), Tpm2bNonce::new(&[2; 32]).unwrap())
            .unwrap();
        assert_eq!(out, id);

        let object = resources.get(id).unwrap();
        assert_eq!(object.handle, 0x0200_0000);
        assert_eq!(object.name.as_bytes(), &[2, 0, 0, 0]);

        let session = object.session().unwrap();
        assert_eq!(session.session_key.len(), 32);
        assert_eq!(session.attributes, session_attr::CONTINUE_SESSION);
        assert_eq!(session.bound.as_ref().unwrap().as_bytes(), &[0x40, 0, 0, 1]);

        let expected = crate::crypto::kdfa(alg::SHA256, b"owner", b"ATH", &[2; 32], &[1; 32], 256).unwrap();
        assert_eq!(session.session_key, expected);
    }

    #[test]
    fn unbound_session_has_no_key() {
        let mut resources = ResourceTable::default();
        let id = EsysTr(0x1000);
        resources.create(id).unwrap();

        start(EsysTr::NONE)
            .apply(
                &mut resources,
                Some(Minted {
                    id,
                    handle: Some(0x0200_0001),
                }),
                Tpm2bNonce::new(&[3; 32]).unwrap(),
            )
            .unwrap();
        let session = resources.get(id).unwrap().session().unwrap();
        assert!(session.session_key.is_empty());
        assert!(session.bound.is_none());
    }

    #[test]
    fn flush_resolves_and_forgets() {
        let mut resources = ResourceTable::default();
        let id = EsysTr(0x1003);
        resources.create(id).unwrap().handle = 0x8000_0002;

        let mut flush = FlushContext::new(id);
        flush.prepare_input(&resources).unwrap();
        assert_eq!(
            crate::sys::prepare(&flush, &[]).unwrap()[10..],
            [0x80, 0, 0, 2]
        );

        flush.apply(&mut resources, None, ()).unwrap();
        assert!(resources.get(id).is_err());

        assert_eq!(
            FlushContext::new(EsysTr::RH_OWNER)
                .check_parameters()
                .unwrap_err(),
            Error::esys(base::BAD_TR)
        );
    }
}
