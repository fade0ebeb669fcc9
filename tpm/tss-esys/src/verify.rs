// Copyright (c) Microsoft. All rights reserved.

//! Response authorization checks and response parameter decryption.

use crate::crypto::{self, Direction};
use crate::error::base;
use crate::resource::ResourceTable;
use crate::session::{self, Slot};
use crate::sys::Response;
use crate::types::{se, session_attr, TpmCc};
use crate::{EsysTr, Error, Result};

/// Checks every session HMAC of `response` and decrypts its first parameter in place.
///
/// Nothing in `response` may be trusted unless this returns `Ok`. Session nonces
/// are only replaced once every slot has verified.
pub(crate) fn check_response(
    resources: &mut ResourceTable,
    slots: &[Slot; 3],
    code: TpmCc,
    response: &mut Response,
) -> Result<()> {
    let zero = 0_u32.to_be_bytes();
    let code = code.to_be_bytes();

    let mut verified_nonces = Vec::with_capacity(response.auths.len());
    for (slot, auth) in slots.iter().zip(&response.auths) {
        let Slot::Session(id) = *slot else {
            continue;
        };
        let session = resources
            .get(id)?
            .session()
            .ok_or(Error::esys(base::BAD_TR))?;

        if session.session_type == se::HMAC {
            let rp_hash = crypto::hash(session.auth_hash, &[&zero, &code, &response.parameters])?;
            let verified = crypto::hmac_verify(
                session.auth_hash,
                &session.session_value,
                &[
                    &rp_hash,
                    &auth.nonce,
                    &session.nonce_caller,
                    &[auth.attributes],
                ],
                &auth.hmac,
            )?;
            if !verified {
                log::error!("response HMAC of session {id:?} does not verify");
                return Err(Error::esys(base::RSP_AUTH_FAILED));
            }
        }

        verified_nonces.push((id, auth.nonce.clone()));
    }

    for (id, nonce) in verified_nonces {
        if let Some(session) = resources.get_mut(id)?.session_mut() {
            session.nonce_tpm = nonce;
        }
    }

    if let Some(i) = session::encrypt_session(resources, slots) {
        if let Slot::Session(id) = slots[i] {
            let session = resources
                .get(id)?
                .session()
                .ok_or(Error::esys(base::BAD_TR))?;
            session::crypt_first_parameter(
                session,
                &mut response.parameters,
                &session.nonce_tpm,
                &session.nonce_caller,
                Direction::Decrypt,
            )?;
        }
    }

    Ok(())
}

/// Forgets sessions that were used without `continueSession`, since the TPM has flushed them.
pub(crate) fn remove_discontinued(resources: &mut ResourceTable, slots: &[Slot; 3]) {
    for slot in slots {
        let Slot::Session(id) = *slot else {
            continue;
        };

        let discontinued = resources
            .get(id)
            .ok()
            .and_then(|object| object.session())
            .is_some_and(|session| session.attributes & session_attr::CONTINUE_SESSION == 0);
        if discontinued {
            log::debug!("session {id:?} was not continued; forgetting it");
            let _ = resources.delete(id);
        }
    }
}

/// Slot contents for the session ids a command was issued with.
pub(crate) fn slots_of(sessions: &[EsysTr; 3]) -> [Slot; 3] {
    sessions.map(|id| match id {
        EsysTr::NONE => Slot::Empty,
        EsysTr::PASSWORD => Slot::Password,
        id => Slot::Session(id),
    })
}

#[cfg(test)]
mod tests {
    use super::{check_response, remove_discontinued, slots_of};
    use crate::crypto;
    use crate::error::base;
    use crate::resource::ResourceTable;
    use crate::session::tests::add_session;
    use crate::session::Slot;
    use crate::sys::Response;
    use crate::types::{alg, cc, se, session_attr, AuthResponse, Tpm2bAuth, Tpm2bNonce};
    use crate::{EsysTr, Error};

    const S1: EsysTr = EsysTr(0x1000);

    fn signed_response(resources: &ResourceTable, parameters: &[u8], attributes: u8) -> Response {
        let session = resources.get(S1).unwrap().session().unwrap();
        let nonce_tpm = Tpm2bNonce::new(&[0x5A; 32]).unwrap();

        let rp_hash = crypto::hash(
            alg::SHA256,
            &[&0_u32.to_be_bytes(), &cc::GET_RANDOM.to_be_bytes(), parameters],
        )
        .unwrap();
        let hmac = crypto::hmac(
            alg::SHA256,
            &session.session_value,
            &[&rp_hash, &nonce_tpm, &session.nonce_caller, &[attributes]],
        )
        .unwrap();

        Response {
            handle: None,
            parameters: parameters.to_vec(),
            auths: vec![AuthResponse {
                nonce: nonce_tpm,
                attributes,
                hmac: Tpm2bAuth::new(&hmac).unwrap(),
            }],
        }
    }

    fn resources() -> ResourceTable {
        let mut resources = ResourceTable::default();
        add_session(&mut resources, S1, se::HMAC, session_attr::CONTINUE_SESSION);
        let session = resources.get_mut(S1).unwrap().session_mut().unwrap();
        session.session_value = b"key".to_vec();
        session.nonce_caller = Tpm2bNonce::new(&[0x11; 32]).unwrap();
        resources
    }

    #[test]
    fn valid_hmac_adopts_nonce() {
        let mut resources = resources();
        let slots = [Slot::Session(S1), Slot::Empty, Slot::Empty];
        let mut response =
            signed_response(&resources, &[0, 2, 7, 7], session_attr::CONTINUE_SESSION);

        check_response(&mut resources, &slots, cc::GET_RANDOM, &mut response).unwrap();
        let session = resources.get(S1).unwrap().session().unwrap();
        assert_eq!(session.nonce_tpm.as_bytes(), &[0x5A; 32]);
        assert_eq!(response.parameters, [0, 2, 7, 7]);
    }

    #[test]
    fn corrupted_parameter_fails() {
        let mut resources = resources();
        let slots = [Slot::Session(S1), Slot::Empty, Slot::Empty];
        let mut response =
            signed_response(&resources, &[0, 2, 7, 7], session_attr::CONTINUE_SESSION);
        response.parameters[3] ^= 1;
        let before = resources.get(S1).unwrap().session().unwrap().nonce_tpm.clone();

        assert_eq!(
            check_response(&mut resources, &slots, cc::GET_RANDOM, &mut response).unwrap_err(),
            Error::esys(base::RSP_AUTH_FAILED)
        );
        let session = resources.get(S1).unwrap().session().unwrap();
        assert_eq!(session.nonce_tpm, before);
    }

    #[test]
    fn encrypted_response_is_decrypted() {
        let mut resources = resources();
        let session = resources.get_mut(S1).unwrap().session_mut().unwrap();
        session.attributes |= session_attr::ENCRYPT;
        let nonce_caller = session.nonce_caller.clone();

        // What the TPM would send: the buffer encrypted under (nonceTPM, nonceCaller).
        let mut parameters = vec![0, 4, b'd', b'a', b't', b'a'];
        crypto::crypt_parameter(
            &crate::types::TpmtSymDef::aes_cfb(128),
            alg::SHA256,
            b"key",
            &[0x5A; 32],
            &nonce_caller,
            &mut parameters[2..],
            crypto::Direction::Encrypt,
        )
        .unwrap();

        let attributes = session_attr::CONTINUE_SESSION | session_attr::ENCRYPT;
        let mut response = signed_response(&resources, &parameters, attributes);
        let slots = [Slot::Session(S1), Slot::Empty, Slot::Empty];
        check_response(&mut resources, &slots, cc::GET_RANDOM, &mut response).unwrap();
        assert_eq!(response.parameters, [0, 4, b'd', b'a', b't', b'a']);
    }

    #[test]
    fn discontinued_sessions_are_forgotten() {
        let mut resources = resources();
        resources.get_mut(S1).unwrap().session_mut().unwrap().attributes = 0;

        let slots = slots_of(&[EsysTr::PASSWORD, S1, EsysTr::NONE]);
        assert_eq!(slots, [Slot::Password, Slot::Session(S1), Slot::Empty]);
        remove_discontinued(&mut resources, &slots);
        assert!(resources.get(S1).is_err());
    }
}
