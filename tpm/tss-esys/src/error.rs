// Copyright (c) Microsoft. All rights reserved.

use std::fmt;

pub const LAYER_SHIFT: u32 = 16;
pub const LAYER_MASK: u32 = 0xFF << LAYER_SHIFT;

/// Reason codes shared by every non-TPM layer.
pub mod base {
    pub const GENERAL_FAILURE: u32 = 1;
    pub const NOT_IMPLEMENTED: u32 = 2;
    pub const BAD_CONTEXT: u32 = 3;
    pub const ABI_MISMATCH: u32 = 4;
    pub const BAD_REFERENCE: u32 = 5;
    pub const INSUFFICIENT_BUFFER: u32 = 6;
    pub const BAD_SEQUENCE: u32 = 7;
    pub const NO_CONNECTION: u32 = 8;
    pub const TRY_AGAIN: u32 = 9;
    pub const IO_ERROR: u32 = 10;
    pub const BAD_VALUE: u32 = 11;
    pub const NOT_PERMITTED: u32 = 12;
    pub const INVALID_SESSIONS: u32 = 13;
    pub const NO_DECRYPT_PARAM: u32 = 14;
    pub const NO_ENCRYPT_PARAM: u32 = 15;
    pub const BAD_SIZE: u32 = 16;
    pub const MALFORMED_RESPONSE: u32 = 17;
    pub const INSUFFICIENT_CONTEXT: u32 = 18;
    pub const INSUFFICIENT_RESPONSE: u32 = 19;
    pub const INCOMPATIBLE_TCTI: u32 = 20;
    pub const NOT_SUPPORTED: u32 = 21;
    pub const BAD_TCTI_STRUCTURE: u32 = 22;
    pub const MEMORY: u32 = 23;
    pub const BAD_TR: u32 = 24;
    pub const MULTIPLE_DECRYPT_SESSIONS: u32 = 25;
    pub const MULTIPLE_ENCRYPT_SESSIONS: u32 = 26;
    pub const RSP_AUTH_FAILED: u32 = 27;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Layer {
    Tpm,
    Feature,
    Esapi,
    Sys,
    Mu,
    Tcti,
    ResMgr,
    ResMgrTpm,
    Unknown(u8),
}

impl Layer {
    const fn number(self) -> u32 {
        match self {
            Layer::Tpm => 0,
            Layer::Feature => 6,
            Layer::Esapi => 7,
            Layer::Sys => 8,
            Layer::Mu => 9,
            Layer::Tcti => 10,
            Layer::ResMgr => 11,
            Layer::ResMgrTpm => 12,
            Layer::Unknown(n) => n as u32,
        }
    }

    const fn from_number(n: u8) -> Self {
        match n {
            0 => Layer::Tpm,
            6 => Layer::Feature,
            7 => Layer::Esapi,
            8 => Layer::Sys,
            9 => Layer::Mu,
            10 => Layer::Tcti,
            11 => Layer::ResMgr,
            12 => Layer::ResMgrTpm,
            n => Layer::Unknown(n),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Layer::Tpm => "tpm",
            Layer::Feature => "fapi",
            Layer::Esapi => "esapi",
            Layer::Sys => "sys",
            Layer::Mu => "mu",
            Layer::Tcti => "tcti",
            Layer::ResMgr => "resmgr",
            Layer::ResMgrTpm => "resmgr-tpm",
            Layer::Unknown(_) => "unknown",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A layered TSS2 return code.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Error(pub(crate) u32);

impl Error {
    #[must_use]
    pub const fn new(layer: Layer, base: u32) -> Self {
        Self((layer.number() << LAYER_SHIFT) | base)
    }

    #[must_use]
    pub const fn from_code(code: u32) -> Self {
        Self(code)
    }

    pub(crate) const fn esys(base: u32) -> Self {
        Self::new(Layer::Esapi, base)
    }

    pub(crate) const fn sys(base: u32) -> Self {
        Self::new(Layer::Sys, base)
    }

    pub(crate) const fn mu(base: u32) -> Self {
        Self::new(Layer::Mu, base)
    }

    pub(crate) const fn tcti(base: u32) -> Self {
        Self::new(Layer::Tcti, base)
    }

    #[must_use]
    pub const fn code(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn layer(self) -> Layer {
        #[allow(clippy::cast_possible_truncation)]
        Layer::from_number(((self.0 & LAYER_MASK) >> LAYER_SHIFT) as u8)
    }

    /// The code with the layer tag stripped.
    #[must_use]
    pub const fn base(self) -> u32 {
        self.0 & !LAYER_MASK
    }

    /// Whether this is the "call again" sentinel of any layer.
    #[must_use]
    pub const fn is_try_again(self) -> bool {
        self.base() == base::TRY_AGAIN
    }

    /// Whether the code was reported by the TPM itself (directly or relayed by a resource manager).
    #[must_use]
    pub fn is_tpm(self) -> bool {
        self.0 != 0 && matches!(self.layer(), Layer::Tpm | Layer::ResMgrTpm)
    }
}

fn base_name(base: u32) -> Option<&'static str> {
    let name = match base {
        base::GENERAL_FAILURE => "general failure",
        base::NOT_IMPLEMENTED => "not implemented",
        base::BAD_CONTEXT => "bad context",
        base::ABI_MISMATCH => "abi mismatch",
        base::BAD_REFERENCE => "bad reference",
        base::INSUFFICIENT_BUFFER => "insufficient buffer",
        base::BAD_SEQUENCE => "bad sequence",
        base::NO_CONNECTION => "no connection",
        base::TRY_AGAIN => "try again",
        base::IO_ERROR => "io error",
        base::BAD_VALUE => "bad value",
        base::NOT_PERMITTED => "not permitted",
        base::INVALID_SESSIONS => "invalid sessions",
        base::NO_DECRYPT_PARAM => "no decrypt param",
        base::NO_ENCRYPT_PARAM => "no encrypt param",
        base::BAD_SIZE => "bad size",
        base::MALFORMED_RESPONSE => "malformed response",
        base::INSUFFICIENT_CONTEXT => "insufficient context",
        base::INSUFFICIENT_RESPONSE => "insufficient response",
        base::INCOMPATIBLE_TCTI => "incompatible tcti",
        base::NOT_SUPPORTED => "not supported",
        base::BAD_TCTI_STRUCTURE => "bad tcti structure",
        base::MEMORY => "out of memory",
        base::BAD_TR => "bad esys_tr",
        base::MULTIPLE_DECRYPT_SESSIONS => "multiple decrypt sessions",
        base::MULTIPLE_ENCRYPT_SESSIONS => "multiple encrypt sessions",
        base::RSP_AUTH_FAILED => "response authorization failed",
        _ => return None,
    };
    Some(name)
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let layer = self.layer();
        match layer {
            Layer::Tpm | Layer::ResMgrTpm => {
                write!(f, "{}:0x{:03X}", layer.name(), self.base())
            }
            _ => match base_name(self.base()) {
                Some(name) => write!(f, "{}:{}", layer.name(), name),
                None => write!(f, "{}:0x{:08X}", layer.name(), self.0),
            },
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::{base, Error, Layer};

    #[test]
    fn layer_round_trip() {
        let err = Error::new(Layer::Tcti, base::TRY_AGAIN);
        assert_eq!(err.code(), 0x000A_0009);
        assert_eq!(err.layer(), Layer::Tcti);
        assert_eq!(err.base(), base::TRY_AGAIN);
    }

    #[test]
    fn try_again_ignores_layer() {
        assert!(Error::tcti(base::TRY_AGAIN).is_try_again());
        assert!(Error::esys(base::TRY_AGAIN).is_try_again());
        assert!(!Error::esys(base::BAD_SEQUENCE).is_try_again());
    }

    #[test]
    fn tpm_codes() {
        assert!(Error::from_code(0x922).is_tpm());
        assert!(Error::from_code(0x000C_0908).is_tpm());
        assert!(!Error::esys(base::BAD_TR).is_tpm());
        assert!(!Error::from_code(0).is_tpm());
    }

    #[test]
    fn display() {
        assert_eq!(
            Error::esys(base::BAD_SEQUENCE).to_string(),
            "esapi:bad sequence"
        );
        assert_eq!(Error::from_code(0x922).to_string(), "tpm:0x922");
        assert_eq!(Error::sys(0xFFFF).to_string(), "sys:0x0008FFFF");
    }
}
