// Copyright (c) Microsoft. All rights reserved.

//! Per-command parameter records and the hooks that tie them into the executor.
//!
//! Each record holds owned copies of every input of one TPM command, so the
//! record itself doubles as the snapshot replayed on resubmission.

mod hash;
mod nv;
mod object;
mod session;
mod startup;

pub use hash::{Hash, HmacStart, SequenceComplete, SequenceUpdate};
pub use nv::{NvDefineSpace, NvRead, NvReadPublic, NvUndefineSpace, NvWrite};
pub use object::{EncryptDecrypt, LoadExternal, ReadPublic};
pub use session::{FlushContext, PolicyGetDigest, PolicyTicket, StartAuthSession};
pub use startup::{GetRandom, Startup};

use crate::error::base;
use crate::resource::ResourceTable;
use crate::types::{rh, TpmCc, TpmHandle};
use crate::{EsysTr, Error, Result};

/// A TPM command the executor knows how to drive.
pub trait Command: Clone + std::fmt::Debug + private::Sealed {
    const CODE: TpmCc;

    /// How many leading handles require authorization.
    const AUTH_HANDLES: usize = 0;
    const MIN_SESSIONS: usize = 0;

    /// Whether the first command parameter is a sized buffer that a session may encrypt.
    const DECRYPT: bool = false;
    /// Whether the first response parameter is a sized buffer that a session may encrypt.
    const ENCRYPT: bool = false;

    const RESPONSE_HANDLE: bool = false;
    /// Whether a successful response yields a new resource identifier.
    const MINTS: bool = false;

    /// Unmarshaled response parameters.
    type Response;
    /// What the caller gets back once side effects are applied.
    type Output;

    /// Resource identifiers that populate the handle area, in wire order.
    fn handles(&self) -> Vec<EsysTr> {
        vec![]
    }

    fn check_parameters(&self) -> Result<()> {
        Ok(())
    }

    /// Fills in anything that has to be fixed once and then replayed verbatim.
    fn prepare_input(&mut self, _resources: &ResourceTable) -> Result<()> {
        Ok(())
    }

    fn marshal_parameters(&self, buf: &mut &mut [u8]) -> Result<()>;

    fn unmarshal_response(buf: &mut &[u8]) -> Result<Self::Response>;

    fn apply(
        &self,
        resources: &mut ResourceTable,
        minted: Option<Minted>,
        response: Self::Response,
    ) -> Result<Self::Output>;
}

pub(crate) mod private {
    pub trait Sealed: Into<super::Input> + Sized {
        fn from_input(input: &super::Input) -> Option<&Self>;
    }
}

/// The identifier reserved for a command's new object, plus the handle the TPM returned for it.
#[derive(Clone, Copy, Debug)]
pub struct Minted {
    pub(crate) id: EsysTr,
    pub(crate) handle: Option<TpmHandle>,
}

impl Minted {
    fn require(minted: Option<Minted>) -> Result<Self> {
        minted.ok_or(Error::esys(base::GENERAL_FAILURE))
    }

    fn response_handle(self) -> Result<(EsysTr, TpmHandle)> {
        match self.handle {
            Some(handle) => Ok((self.id, handle)),
            None => Err(Error::esys(base::MALFORMED_RESPONSE)),
        }
    }
}

macro_rules! inputs {
    ($($command:ident,)*) => {
        /// The parameters of the command in flight.
        #[derive(Clone, Debug)]
        pub enum Input {
            $($command($command),)*
        }

        impl Input {
            #[must_use]
            pub fn code(&self) -> TpmCc {
                match self {
                    $(Input::$command(_) => <$command as Command>::CODE,)*
                }
            }
        }

        $(
            impl From<$command> for Input {
                fn from(command: $command) -> Self {
                    Input::$command(command)
                }
            }

            impl private::Sealed for $command {
                fn from_input(input: &Input) -> Option<&Self> {
                    match input {
                        Input::$command(command) => Some(command),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }
            }
        )*
    };
}

inputs! {
    Startup,
    GetRandom,
    StartAuthSession,
    FlushContext,
    ReadPublic,
    LoadExternal,
    NvDefineSpace,
    NvUndefineSpace,
    NvReadPublic,
    NvRead,
    NvWrite,
    Hash,
    HmacStart,
    SequenceUpdate,
    SequenceComplete,
    PolicyTicket,
    PolicyGetDigest,
    EncryptDecrypt,
}

fn check_hierarchy(hierarchy: TpmHandle) -> Result<()> {
    match hierarchy {
        rh::OWNER | rh::PLATFORM | rh::ENDORSEMENT | rh::NULL => Ok(()),
        other => {
            log::error!("0x{other:08X} is not a hierarchy");
            Err(Error::esys(base::BAD_VALUE))
        }
    }
}

fn check_hash_alg(hash_alg: crate::types::TpmAlgId) -> Result<()> {
    if crate::types::digest_size(hash_alg).is_none() {
        log::error!("unsupported hash algorithm 0x{hash_alg:04X}");
        return Err(Error::esys(base::BAD_VALUE));
    }
    Ok(())
}
