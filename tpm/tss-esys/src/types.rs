// Copyright (c) Microsoft. All rights reserved.

use crate::error::base;
use crate::{Error, Result};

pub type TpmHandle = u32;
pub type TpmAlgId = u16;
pub type TpmCc = u32;

pub mod cc {
    use super::TpmCc;

    pub const NV_UNDEFINE_SPACE: TpmCc = 0x0000_0122;
    pub const NV_DEFINE_SPACE: TpmCc = 0x0000_012A;
    pub const NV_WRITE: TpmCc = 0x0000_0137;
    pub const SEQUENCE_COMPLETE: TpmCc = 0x0000_013E;
    pub const STARTUP: TpmCc = 0x0000_0144;
    pub const NV_READ: TpmCc = 0x0000_014E;
    pub const HMAC_START: TpmCc = 0x0000_015B;
    pub const SEQUENCE_UPDATE: TpmCc = 0x0000_015C;
    pub const ENCRYPT_DECRYPT: TpmCc = 0x0000_0164;
    pub const FLUSH_CONTEXT: TpmCc = 0x0000_0165;
    pub const LOAD_EXTERNAL: TpmCc = 0x0000_0167;
    pub const NV_READ_PUBLIC: TpmCc = 0x0000_0169;
    pub const POLICY_TICKET: TpmCc = 0x0000_0172;
    pub const READ_PUBLIC: TpmCc = 0x0000_0173;
    pub const START_AUTH_SESSION: TpmCc = 0x0000_0176;
    pub const GET_RANDOM: TpmCc = 0x0000_017B;
    pub const HASH: TpmCc = 0x0000_017D;
    pub const POLICY_GET_DIGEST: TpmCc = 0x0000_0189;
}

/// Structure tags.
pub mod st {
    pub const NO_SESSIONS: u16 = 0x8001;
    pub const SESSIONS: u16 = 0x8002;
    pub const AUTH_SECRET: u16 = 0x8023;
    pub const HASHCHECK: u16 = 0x8024;
    pub const AUTH_SIGNED: u16 = 0x8025;
}

/// TPM-layer response codes the stack reacts to.
pub mod rc {
    pub const SUCCESS: u32 = 0x000;
    pub const INITIALIZE: u32 = 0x100;
    pub const YIELDED: u32 = 0x908;
    pub const TESTING: u32 = 0x90A;
    pub const RETRY: u32 = 0x922;
}

/// Handle types (the most significant octet of a TPM handle).
pub mod ht {
    pub const PCR: u32 = 0x00;
    pub const NV_INDEX: u32 = 0x01;
    pub const HMAC_SESSION: u32 = 0x02;
    pub const POLICY_SESSION: u32 = 0x03;
    pub const PERMANENT: u32 = 0x40;
    pub const TRANSIENT: u32 = 0x80;
    pub const PERSISTENT: u32 = 0x81;
}

/// Permanent handles.
pub mod rh {
    use super::TpmHandle;

    pub const OWNER: TpmHandle = 0x4000_0001;
    pub const NULL: TpmHandle = 0x4000_0007;
    pub const UNASSIGNED: TpmHandle = 0x4000_0008;
    pub const PW: TpmHandle = 0x4000_0009;
    pub const LOCKOUT: TpmHandle = 0x4000_000A;
    pub const ENDORSEMENT: TpmHandle = 0x4000_000B;
    pub const PLATFORM: TpmHandle = 0x4000_000C;
    pub const PLATFORM_NV: TpmHandle = 0x4000_000D;
}

pub mod alg {
    use super::TpmAlgId;

    pub const SHA1: TpmAlgId = 0x0004;
    pub const AES: TpmAlgId = 0x0006;
    pub const KEYEDHASH: TpmAlgId = 0x0008;
    pub const XOR: TpmAlgId = 0x000A;
    pub const SHA256: TpmAlgId = 0x000B;
    pub const SHA384: TpmAlgId = 0x000C;
    pub const SHA512: TpmAlgId = 0x000D;
    pub const NULL: TpmAlgId = 0x0010;
    pub const CTR: TpmAlgId = 0x0040;
    pub const OFB: TpmAlgId = 0x0041;
    pub const CBC: TpmAlgId = 0x0042;
    pub const CFB: TpmAlgId = 0x0043;
    pub const ECB: TpmAlgId = 0x0044;
}

/// Session types.
pub mod se {
    pub const HMAC: u8 = 0x00;
    pub const POLICY: u8 = 0x01;
    pub const TRIAL: u8 = 0x03;
}

/// Startup types.
pub mod su {
    pub const CLEAR: u16 = 0x0000;
    pub const STATE: u16 = 0x0001;
}

/// TPMA_SESSION bits.
pub mod session_attr {
    pub const CONTINUE_SESSION: u8 = 0x01;
    pub const AUDIT_EXCLUSIVE: u8 = 0x02;
    pub const AUDIT_RESET: u8 = 0x04;
    pub const DECRYPT: u8 = 0x20;
    pub const ENCRYPT: u8 = 0x40;
    pub const AUDIT: u8 = 0x80;
}

/// TPMA_NV bits.
pub mod nv_attr {
    pub const OWNERWRITE: u32 = 0x0000_0002;
    pub const AUTHWRITE: u32 = 0x0000_0004;
    pub const OWNERREAD: u32 = 0x0002_0000;
    pub const AUTHREAD: u32 = 0x0004_0000;
    pub const NO_DA: u32 = 0x0200_0000;
    pub const WRITTEN: u32 = 0x2000_0000;
}

#[must_use]
pub const fn handle_type(handle: TpmHandle) -> u32 {
    handle >> 24
}

/// Size of the digest produced by `hash_alg`.
#[must_use]
pub const fn digest_size(hash_alg: TpmAlgId) -> Option<usize> {
    match hash_alg {
        alg::SHA1 => Some(20),
        alg::SHA256 => Some(32),
        alg::SHA384 => Some(48),
        alg::SHA512 => Some(64),
        _ => None,
    }
}

macro_rules! tpm2b {
    ($($(#[$meta:meta])* $name:ident($max:expr);)*) => {
        paste::paste! {
            $(
                $(#[$meta])*
                #[derive(Clone, Debug, Default, Eq, PartialEq)]
                pub struct [<Tpm2b $name>](Vec<u8>);

                impl [<Tpm2b $name>] {
                    pub const MAX_SIZE: usize = $max;

                    pub fn new(bytes: &[u8]) -> Result<Self> {
                        if bytes.len() > Self::MAX_SIZE {
                            return Err(Error::mu(base::BAD_SIZE));
                        }
                        Ok(Self(bytes.to_vec()))
                    }

                    #[must_use]
                    pub fn as_bytes(&self) -> &[u8] {
                        &self.0
                    }
                }

                impl std::ops::Deref for [<Tpm2b $name>] {
                    type Target = [u8];

                    fn deref(&self) -> &[u8] {
                        &self.0
                    }
                }
            )*
        }
    };
}

tpm2b! {
    Digest(64);
    Nonce(64);
    Auth(64);
    /// A name is a hash algorithm id followed by a digest, or a bare handle.
    Name(66);
    Data(66);
    Iv(16);
    Timeout(8);
    MaxBuffer(1024);
    MaxNvBuffer(2048);
    EncryptedSecret(256);
    /// A marshaled `TPMT_PUBLIC`, kept opaque.
    Public(1024);
    /// A marshaled `TPMT_SENSITIVE`, kept opaque.
    Sensitive(1024);
}

impl Tpm2bPublic {
    /// The `nameAlg` field, which directly follows the object type.
    #[must_use]
    pub fn name_alg(&self) -> Option<TpmAlgId> {
        match self.0.get(2..4) {
            Some(&[hi, lo]) => Some(u16::from_be_bytes([hi, lo])),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TpmsNvPublic {
    pub nv_index: TpmHandle,
    pub name_alg: TpmAlgId,
    pub attributes: u32,
    pub auth_policy: Tpm2bDigest,
    pub data_size: u16,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TpmtSymDef {
    pub algorithm: TpmAlgId,
    /// For XOR this holds the hash algorithm instead of a key size.
    pub key_bits: u16,
    pub mode: TpmAlgId,
}

impl TpmtSymDef {
    pub const NULL: Self = Self {
        algorithm: alg::NULL,
        key_bits: 0,
        mode: alg::NULL,
    };

    #[must_use]
    pub const fn aes_cfb(key_bits: u16) -> Self {
        Self {
            algorithm: alg::AES,
            key_bits,
            mode: alg::CFB,
        }
    }

    #[must_use]
    pub const fn xor(hash_alg: TpmAlgId) -> Self {
        Self {
            algorithm: alg::XOR,
            key_bits: hash_alg,
            mode: alg::NULL,
        }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.algorithm == alg::NULL
    }
}

impl Default for TpmtSymDef {
    fn default() -> Self {
        Self::NULL
    }
}

/// A ticket (`TPMT_TK_*`). Every ticket kind shares this layout.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TpmtTk {
    pub tag: u16,
    pub hierarchy: TpmHandle,
    pub digest: Tpm2bDigest,
}

pub type TpmtTkHashcheck = TpmtTk;
pub type TpmtTkAuth = TpmtTk;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AuthCommand {
    pub session_handle: TpmHandle,
    pub nonce: Tpm2bNonce,
    pub attributes: u8,
    pub hmac: Tpm2bAuth,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AuthResponse {
    pub nonce: Tpm2bNonce,
    pub attributes: u8,
    pub hmac: Tpm2bAuth,
}
