// Copyright (c) Microsoft. All rights reserved.

use hmac::{Hmac, Mac};
use openssl::symm::{self, Cipher};
use sha2::Digest;

use crate::error::base;
use crate::types::{alg, TpmAlgId, TpmtSymDef};
use crate::{Error, Result};

macro_rules! with_digest {
    ($hash_alg:expr, $d:ident => $body:expr) => {
        match $hash_alg {
            alg::SHA1 => {
                type $d = sha1::Sha1;
                $body
            }
            alg::SHA256 => {
                type $d = sha2::Sha256;
                $body
            }
            alg::SHA384 => {
                type $d = sha2::Sha384;
                $body
            }
            alg::SHA512 => {
                type $d = sha2::Sha512;
                $body
            }
            other => {
                log::error!("unsupported hash algorithm 0x{:04X}", other);
                Err(Error::esys(base::BAD_VALUE))
            }
        }
    };
}

pub(crate) fn hash(hash_alg: TpmAlgId, parts: &[&[u8]]) -> Result<Vec<u8>> {
    with_digest!(hash_alg, D => {
        let mut hasher = <D as Digest>::new();
        for part in parts {
            hasher.update(part);
        }
        Ok(hasher.finalize().to_vec())
    })
}

pub(crate) fn hmac(hash_alg: TpmAlgId, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    with_digest!(hash_alg, D => {
        let mut mac = <Hmac<D> as Mac>::new_from_slice(key)
            .map_err(|_| Error::esys(base::GENERAL_FAILURE))?;
        for part in parts {
            mac.update(part);
        }
        Ok(mac.finalize().into_bytes().to_vec())
    })
}

/// Constant-time comparison of `expected` against the HMAC of `parts`.
pub(crate) fn hmac_verify(
    hash_alg: TpmAlgId,
    key: &[u8],
    parts: &[&[u8]],
    expected: &[u8],
) -> Result<bool> {
    with_digest!(hash_alg, D => {
        let mut mac = <Hmac<D> as Mac>::new_from_slice(key)
            .map_err(|_| Error::esys(base::GENERAL_FAILURE))?;
        for part in parts {
            mac.update(part);
        }
        Ok(mac.verify_slice(expected).is_ok())
    })
}

/// SP800-108 counter-mode KDF with HMAC, as TPM 2.0 defines KDFa.
pub(crate) fn kdfa(
    hash_alg: TpmAlgId,
    key: &[u8],
    label: &[u8],
    context_u: &[u8],
    context_v: &[u8],
    bits: u32,
) -> Result<Vec<u8>> {
    let len = usize::try_from(bits.div_ceil(8)).map_err(|_| Error::esys(base::BAD_SIZE))?;
    let mut out = Vec::with_capacity(len + 64);

    let mut counter = 1_u32;
    while out.len() < len {
        let block = hmac(
            hash_alg,
            key,
            &[
                &counter.to_be_bytes(),
                label,
                &[0],
                context_u,
                context_v,
                &bits.to_be_bytes(),
            ],
        )?;
        out.extend_from_slice(&block);
        counter += 1;
    }
    out.truncate(len);

    if bits % 8 != 0 {
        if let Some(first) = out.first_mut() {
            *first &= 0xFF >> (8 - bits % 8);
        }
    }

    Ok(out)
}

pub(crate) fn random(len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; len];
    openssl::rand::rand_bytes(&mut buf).map_err(|e| {
        log::error!("could not generate nonce: {e}");
        Error::esys(base::GENERAL_FAILURE)
    })?;
    Ok(buf)
}

/// Auth values are used as HMAC keys without their trailing zero octets.
pub(crate) fn trim_trailing_zeros(auth: &[u8]) -> &[u8] {
    let end = auth.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    &auth[..end]
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Direction {
    Encrypt,
    Decrypt,
}

/// Applies session parameter encryption to the data octets of a size-prefixed parameter.
///
/// Commands pass `(nonceCaller, nonceTPM)` and responses pass `(nonceTPM, nonceCaller)`.
pub(crate) fn crypt_parameter(
    symmetric: &TpmtSymDef,
    auth_hash: TpmAlgId,
    session_value: &[u8],
    nonce_newer: &[u8],
    nonce_older: &[u8],
    data: &mut [u8],
    direction: Direction,
) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }

    match symmetric.algorithm {
        alg::AES => {
            if symmetric.mode != alg::CFB {
                return Err(Error::esys(base::BAD_VALUE));
            }
            let cipher = match symmetric.key_bits {
                128 => Cipher::aes_128_cfb128(),
                192 => Cipher::aes_192_cfb128(),
                256 => Cipher::aes_256_cfb128(),
                _ => return Err(Error::esys(base::BAD_VALUE)),
            };

            let material = kdfa(
                auth_hash,
                session_value,
                b"CFB",
                nonce_newer,
                nonce_older,
                u32::from(symmetric.key_bits) + 128,
            )?;
            let (key, iv) = material.split_at(usize::from(symmetric.key_bits / 8));

            let out = match direction {
                Direction::Encrypt => symm::encrypt(cipher, key, Some(iv), data),
                Direction::Decrypt => symm::decrypt(cipher, key, Some(iv), data),
            }
            .map_err(|e| {
                log::error!("parameter {direction:?} failed: {e}");
                Error::esys(base::GENERAL_FAILURE)
            })?;
            if out.len() != data.len() {
                return Err(Error::esys(base::GENERAL_FAILURE));
            }
            data.copy_from_slice(&out);
        }

        alg::XOR => {
            let bits = u32::try_from(data.len() * 8).map_err(|_| Error::esys(base::BAD_SIZE))?;
            let mask = kdfa(
                symmetric.key_bits,
                session_value,
                b"XOR",
                nonce_newer,
                nonce_older,
                bits,
            )?;
            for (b, m) in data.iter_mut().zip(mask) {
                *b ^= m;
            }
        }

        _ => return Err(Error::esys(base::BAD_VALUE)),
    }

    Ok(())
}
