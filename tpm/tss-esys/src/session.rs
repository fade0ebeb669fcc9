// Copyright (c) Microsoft. All rights reserved.

//! Authorization sessions: slot validation, session values and the command authorization area.

use crate::commands::Command;
use crate::crypto::{self, Direction};
use crate::error::base;
use crate::resource::{ResourceTable, Session};
use crate::sys::Sys;
use crate::types::{
    digest_size, rh, se, session_attr, AuthCommand, Tpm2bAuth, Tpm2bName, Tpm2bNonce,
};
use crate::{EsysTr, Error, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Slot {
    Empty,
    Password,
    Session(EsysTr),
}

fn session(resources: &ResourceTable, id: EsysTr) -> Result<&Session> {
    resources
        .get(id)?
        .session()
        .ok_or(Error::esys(base::BAD_TR))
}

fn session_mut(resources: &mut ResourceTable, id: EsysTr) -> Result<&mut Session> {
    resources
        .get_mut(id)?
        .session_mut()
        .ok_or(Error::esys(base::BAD_TR))
}

/// Rejects a session selection before anything is marshaled.
pub(crate) fn check_session_feasibility<C: Command>(
    resources: &ResourceTable,
    sessions: &[EsysTr; 3],
) -> Result<()> {
    let mut count = 0;
    for (i, &id) in sessions.iter().enumerate() {
        if id == EsysTr::NONE {
            continue;
        }
        if id != EsysTr::PASSWORD && !id.is_minted() {
            log::error!("{id:?} in session slot {} is not a session", i + 1);
            return Err(Error::esys(base::BAD_TR));
        }
        if count != i {
            log::error!("session slot {} is used but an earlier slot is empty", i + 1);
            return Err(Error::esys(base::BAD_TR));
        }
        if sessions[..i].contains(&id) {
            log::error!("{id:?} is used in more than one session slot");
            return Err(Error::esys(base::BAD_TR));
        }
        count += 1;
    }

    if count < C::MIN_SESSIONS {
        log::error!(
            "command 0x{:X} needs {} session(s), got {count}",
            C::CODE,
            C::MIN_SESSIONS
        );
        return Err(Error::esys(base::BAD_VALUE));
    }

    let mut decrypt = vec![];
    let mut encrypt = vec![];
    for &id in sessions.iter().filter(|id| id.is_minted()) {
        let session = session(resources, id)?;
        if session.attributes & session_attr::DECRYPT != 0 {
            decrypt.push(session);
        }
        if session.attributes & session_attr::ENCRYPT != 0 {
            encrypt.push(session);
        }
    }

    if decrypt.len() > 1 {
        return Err(Error::esys(base::MULTIPLE_DECRYPT_SESSIONS));
    }
    if encrypt.len() > 1 {
        return Err(Error::esys(base::MULTIPLE_ENCRYPT_SESSIONS));
    }
    if !decrypt.is_empty() && !C::DECRYPT {
        return Err(Error::esys(base::NO_DECRYPT_PARAM));
    }
    if !encrypt.is_empty() && !C::ENCRYPT {
        return Err(Error::esys(base::NO_ENCRYPT_PARAM));
    }
    if decrypt.iter().chain(&encrypt).any(|s| s.symmetric.is_null()) {
        log::error!("parameter encryption requested on a session without a cipher");
        return Err(Error::esys(base::BAD_VALUE));
    }

    Ok(())
}

pub(crate) fn init_session_slots(
    resources: &ResourceTable,
    sessions: &[EsysTr; 3],
) -> Result<[Slot; 3]> {
    let mut slots = [Slot::Empty; 3];
    for (i, &id) in sessions.iter().enumerate() {
        slots[i] = match id {
            EsysTr::NONE => Slot::Empty,
            EsysTr::PASSWORD => Slot::Password,
            id => {
                if sessions[..i].contains(&id) {
                    return Err(Error::esys(base::BAD_TR));
                }
                session(resources, id)?;
                Slot::Session(id)
            }
        };
    }
    Ok(slots)
}

/// Derives the key material for `slot` from the session key and the auth value of `entity`.
pub(crate) fn compute_session_value(
    resources: &mut ResourceTable,
    slot: Slot,
    entity: Option<EsysTr>,
) -> Result<()> {
    let Slot::Session(id) = slot else {
        return Ok(());
    };

    let entity = match entity {
        Some(entity) => {
            let object = resources
                .resolve(entity)
                .map_err(|_| Error::esys(base::BAD_REFERENCE))?;
            Some((object.name.clone(), object.auth.clone()))
        }
        None => None,
    };

    let session = session_mut(resources, id)?;
    let mut value = session.session_key.clone();
    if let Some((name, auth)) = entity {
        // A bound session already carries the auth value of its bind entity.
        if session.session_type == se::HMAC && session.bound.as_ref() != Some(&name) {
            value.extend_from_slice(crypto::trim_trailing_zeros(&auth));
        }
    }
    session.session_value = value;
    Ok(())
}

/// Encrypts or decrypts the data of the size-prefixed buffer at the start of `parameters`.
pub(crate) fn crypt_first_parameter(
    session: &Session,
    parameters: &mut [u8],
    nonce_newer: &[u8],
    nonce_older: &[u8],
    direction: Direction,
) -> Result<()> {
    let size = match parameters {
        [hi, lo, ..] => usize::from(u16::from_be_bytes([*hi, *lo])),
        _ => return Err(Error::esys(base::BAD_SIZE)),
    };
    let data = parameters
        .get_mut(2..2 + size)
        .ok_or(Error::esys(base::BAD_SIZE))?;

    crypto::crypt_parameter(
        &session.symmetric,
        session.auth_hash,
        &session.session_value,
        nonce_newer,
        nonce_older,
        data,
        direction,
    )
}

fn find_attribute(resources: &ResourceTable, slots: &[Slot; 3], attribute: u8) -> Option<usize> {
    slots.iter().position(|slot| match slot {
        Slot::Session(id) => session(resources, *id)
            .map(|s| s.attributes & attribute != 0)
            .unwrap_or(false),
        _ => false,
    })
}

/// Index of the session that encrypts the first response parameter, if any.
pub(crate) fn encrypt_session(resources: &ResourceTable, slots: &[Slot; 3]) -> Option<usize> {
    find_attribute(resources, slots, session_attr::ENCRYPT)
}

/// Builds the authorization area of the prepared command in `sys`.
///
/// Refreshes every caller nonce, encrypts the first parameter if a session asks for it,
/// and then authorizes the resulting parameter buffer.
pub(crate) fn generate_auths(
    resources: &mut ResourceTable,
    slots: &[Slot; 3],
    entities: &[Option<EsysTr>; 3],
    names: &[Tpm2bName],
    sys: &mut Sys,
) -> Result<Vec<AuthCommand>> {
    for slot in slots {
        if let Slot::Session(id) = *slot {
            let session = session_mut(resources, id)?;
            let size = digest_size(session.auth_hash).ok_or(Error::esys(base::BAD_VALUE))?;
            session.nonce_caller = Tpm2bNonce::new(&crypto::random(size)?)?;
        }
    }

    let decrypt = find_attribute(resources, slots, session_attr::DECRYPT);
    let encrypt = encrypt_session(resources, slots);

    if let Some(i) = decrypt {
        if let Slot::Session(id) = slots[i] {
            let session = session(resources, id)?;
            crypt_first_parameter(
                session,
                sys.parameters_mut(),
                &session.nonce_caller,
                &session.nonce_tpm,
                Direction::Encrypt,
            )?;
        }
    }

    let code = sys.command_code()?.to_be_bytes();

    // Only the first session covers the nonces of the other sessions doing parameter encryption.
    let mut extra_nonces: Vec<Tpm2bNonce> = vec![];
    for i in [decrypt, encrypt.filter(|e| Some(*e) != decrypt)]
        .into_iter()
        .flatten()
        .filter(|i| *i != 0)
    {
        if let Slot::Session(id) = slots[i] {
            extra_nonces.push(session(resources, id)?.nonce_tpm.clone());
        }
    }

    let mut auths = Vec::with_capacity(3);
    for (i, slot) in slots.iter().enumerate() {
        let entity_auth = match entities[i] {
            Some(entity) => resources.resolve(entity)?.auth.clone(),
            None => Tpm2bAuth::default(),
        };

        let auth = match *slot {
            Slot::Empty => break,

            Slot::Password => AuthCommand {
                session_handle: rh::PW,
                nonce: Tpm2bNonce::default(),
                attributes: session_attr::CONTINUE_SESSION,
                hmac: Tpm2bAuth::new(crypto::trim_trailing_zeros(&entity_auth))?,
            },

            Slot::Session(id) => {
                let handle = resources.get(id)?.handle;
                let session = session(resources, id)?;

                let hmac = if session.session_type == se::HMAC {
                    let mut cp_parts: Vec<&[u8]> = vec![&code[..]];
                    cp_parts.extend(names.iter().map(|name| name.as_bytes()));
                    cp_parts.push(sys.parameters());
                    let cp_hash = crypto::hash(session.auth_hash, &cp_parts)?;

                    let attributes = [session.attributes];
                    let mut parts: Vec<&[u8]> = vec![
                        &cp_hash[..],
                        session.nonce_caller.as_bytes(),
                        session.nonce_tpm.as_bytes(),
                    ];
                    if i == 0 {
                        parts.extend(extra_nonces.iter().map(|nonce| nonce.as_bytes()));
                    }
                    parts.push(&attributes);

                    let mac = crypto::hmac(session.auth_hash, &session.session_value, &parts)
                        .map_err(|err| {
                            log::error!("could not authorize session {id:?}: {err}");
                            Error::esys(base::GENERAL_FAILURE)
                        })?;
                    Tpm2bAuth::new(&mac)?
                } else {
                    Tpm2bAuth::default()
                };

                AuthCommand {
                    session_handle: handle,
                    nonce: session.nonce_caller.clone(),
                    attributes: session.attributes,
                    hmac,
                }
            }
        };
        auths.push(auth);
    }

    Ok(auths)
}
