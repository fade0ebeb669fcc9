// Copyright (c) Microsoft. All rights reserved.

#![deny(rust_2018_idioms)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

//! A native TPM 2.0 enhanced system API.
//!
//! An [`EsysContext`] owns one transport, a table of resource identifiers and the
//! state of the single command that may be in flight. Every command is available
//! as a one-call method `x`, and as the pair `x_async` / `x_finish` for callers
//! that poll.

pub mod commands;
pub mod handle;
pub mod marshal;
pub mod state;
pub mod sys;
pub mod tcti;
pub mod types;

mod crypto;
mod error;
mod executor;
mod resource;
mod session;
mod verify;

pub use error::{base, Error, Layer, Result};
pub use handle::EsysTr;
pub use resource::ResourceTable;
pub use state::{State, MAX_SUBMISSIONS};
pub use tcti::{Tcti, Timeout};

use crate::commands::Input;
use crate::state::{Event, StateMachine};
use crate::sys::Sys;
use crate::types::{
    handle_type, ht, Tpm2bAuth, Tpm2bDigest, Tpm2bIv, Tpm2bMaxBuffer,
    Tpm2bMaxNvBuffer, Tpm2bName, Tpm2bNonce, Tpm2bPublic, Tpm2bSensitive, Tpm2bTimeout, TpmAlgId,
    TpmHandle, TpmsNvPublic, TpmtSymDef, TpmtTkAuth, TpmtTkHashcheck,
};

/// Session selection for commands that run without authorization.
pub const NO_SESSIONS: [EsysTr; 3] = [EsysTr::NONE; 3];

pub struct EsysContext {
    tcti: Box<dyn Tcti>,
    machine: StateMachine,
    /// Parameters of the command in flight, replayed on resubmission.
    input: Option<Input>,
    sessions: [EsysTr; 3],
    timeout: Timeout,
    resources: ResourceTable,
    next_tr: u32,
    sys: Sys,
}

impl std::fmt::Debug for EsysContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EsysContext")
            .field("state", &self.machine.state())
            .field("submissions", &self.machine.submissions())
            .field("input", &self.input.as_ref().map(Input::code))
            .field("timeout", &self.timeout)
            .field("resources", &self.resources.len())
            .finish_non_exhaustive()
    }
}

impl EsysContext {
    /// Connects to the transport described by `conf`. See [`tcti::Conf`] for the syntax.
    pub fn new(conf: &str) -> Result<Self> {
        Ok(Self::with_tcti(tcti::load(conf)?))
    }

    #[must_use]
    pub fn with_tcti(tcti: impl Tcti + 'static) -> Self {
        EsysContext {
            tcti: Box::new(tcti),
            machine: StateMachine::default(),
            input: None,
            sessions: NO_SESSIONS,
            timeout: Timeout::Block,
            resources: ResourceTable::default(),
            next_tr: EsysTr::MIN_OBJECT,
            sys: Sys::default(),
        }
    }

    /// Bounds how long each `x_finish` waits for a response. One-call methods always block.
    pub fn set_timeout(&mut self, timeout: Timeout) {
        self.timeout = timeout;
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.machine.state()
    }

    /// How many times the current (or last) command was submitted.
    #[must_use]
    pub fn submission_count(&self) -> u32 {
        self.machine.submissions()
    }

    /// Returns a context that hit an internal error or a malformed response to `Init`.
    ///
    /// Fails with `BAD_SEQUENCE` while a command is still pending.
    pub fn recover(&mut self) -> Result<()> {
        self.machine.transition(Event::Recover)?;
        self.input = None;
        Ok(())
    }

    pub fn finalize(self) {
        log::debug!(
            "finalizing context with {} tracked resources",
            self.resources.len()
        );
    }

    /// Registers an existing TPM entity and returns an identifier for it.
    ///
    /// Objects and NV indices are read back from the TPM and their names checked.
    /// Permanent handles and PCRs resolve without a round trip.
    pub fn tr_from_tpm_public(
        &mut self,
        tpm_handle: TpmHandle,
        sessions: [EsysTr; 3],
    ) -> Result<EsysTr> {
        if let Some(id) = EsysTr::from_well_known(tpm_handle) {
            self.resources.resolve(id)?;
            return Ok(id);
        }

        let read = match handle_type(tpm_handle) {
            ht::NV_INDEX => true,
            ht::TRANSIENT | ht::PERSISTENT => false,
            _ => {
                log::error!("0x{tpm_handle:08X} cannot be registered from its public area");
                return Err(Error::esys(base::BAD_VALUE));
            }
        };

        let id = self.mint()?;
        self.resources.get_mut(id)?.handle = tpm_handle;

        let result = if read {
            self.execute(commands::NvReadPublic { nv_index: id }, sessions)
                .map(drop)
        } else {
            self.execute(commands::ReadPublic { object_handle: id }, sessions)
                .map(drop)
        };
        if let Err(err) = result {
            let _ = self.resources.delete(id);
            return Err(err);
        }

        Ok(id)
    }

    pub fn tr_set_auth(&mut self, id: EsysTr, auth: &[u8]) -> Result<()> {
        let auth = Tpm2bAuth::new(auth)?;
        self.resources.resolve(id)?.auth = auth;
        Ok(())
    }

    pub fn tr_get_name(&mut self, id: EsysTr) -> Result<Tpm2bName> {
        Ok(self.resources.resolve(id)?.name.clone())
    }

    /// Forgets `id` without telling the TPM.
    pub fn tr_close(&mut self, id: EsysTr) -> Result<()> {
        self.resources.delete(id)?;
        Ok(())
    }

    /// Replaces the session attributes selected by `mask` with the matching bits of `flags`.
    pub fn trsess_set_attributes(&mut self, session: EsysTr, flags: u8, mask: u8) -> Result<()> {
        let session = self.session_mut(session)?;
        session.attributes = (session.attributes & !mask) | (flags & mask);
        Ok(())
    }

    pub fn trsess_get_attributes(&self, session: EsysTr) -> Result<u8> {
        Ok(self.session(session)?.attributes)
    }

    pub fn trsess_get_nonce_tpm(&self, session: EsysTr) -> Result<Tpm2bNonce> {
        Ok(self.session(session)?.nonce_tpm.clone())
    }

    fn session(&self, id: EsysTr) -> Result<&resource::Session> {
        self.resources
            .get(id)?
            .session()
            .ok_or(Error::esys(base::BAD_TR))
    }

    fn session_mut(&mut self, id: EsysTr) -> Result<&mut resource::Session> {
        self.resources
            .get_mut(id)?
            .session_mut()
            .ok_or(Error::esys(base::BAD_TR))
    }

    pub fn startup(&mut self, startup_type: u16) -> Result<()> {
        self.execute(commands::Startup { startup_type }, NO_SESSIONS)
    }

    pub fn startup_async(&mut self, startup_type: u16) -> Result<()> {
        self.start(commands::Startup { startup_type }, NO_SESSIONS)
    }

    pub fn startup_finish(&mut self) -> Result<()> {
        self.finish::<commands::Startup>()
    }

    /// Evicts `flush_handle` from the TPM. The identifier is invalid afterwards.
    pub fn flush_context(&mut self, flush_handle: EsysTr) -> Result<()> {
        self.execute(commands::FlushContext::new(flush_handle), NO_SESSIONS)
    }

    pub fn flush_context_async(&mut self, flush_handle: EsysTr) -> Result<()> {
        self.start(commands::FlushContext::new(flush_handle), NO_SESSIONS)
    }

    pub fn flush_context_finish(&mut self) -> Result<()> {
        self.finish::<commands::FlushContext>()
    }
}

impl Drop for EsysContext {
    fn drop(&mut self) {
        if self.machine.state() == State::Sent {
            log::warn!("context dropped while a command is pending; its response is never read");
        }
    }
}

macro_rules! entry_points {
    ($(
        $(#[$attr:meta])*
        $name:ident => $command:ident { $($arg:ident: $ty:ty),* $(,)? } -> $output:ty;
    )*) => {
        paste::paste! {
            impl EsysContext {
                $(
                    $(#[$attr])*
                    #[allow(clippy::too_many_arguments)]
                    pub fn $name(
                        &mut self,
                        $($arg: $ty,)*
                        sessions: [EsysTr; 3],
                    ) -> Result<$output> {
                        self.execute(commands::$command { $($arg,)* }, sessions)
                    }

                    #[allow(clippy::too_many_arguments)]
                    pub fn [<$name _async>](
                        &mut self,
                        $($arg: $ty,)*
                        sessions: [EsysTr; 3],
                    ) -> Result<()> {
                        self.start(commands::$command { $($arg,)* }, sessions)
                    }

                    pub fn [<$name _finish>](&mut self) -> Result<$output> {
                        self.finish::<commands::$command>()
                    }
                )*
            }
        }
    };
}

entry_points! {
    get_random => GetRandom { bytes_requested: u16 } -> Tpm2bDigest;

    /// Opens a session. Pass `None` as `nonce_caller` to have one generated.
    start_auth_session => StartAuthSession {
        tpm_key: EsysTr,
        bind: EsysTr,
        nonce_caller: Option<Tpm2bNonce>,
        session_type: u8,
        symmetric: TpmtSymDef,
        auth_hash: TpmAlgId,
    } -> EsysTr;

    /// Returns `(outPublic, name, qualifiedName)`.
    read_public => ReadPublic { object_handle: EsysTr } -> (Tpm2bPublic, Tpm2bName, Tpm2bName);

    load_external => LoadExternal {
        in_private: Option<Tpm2bSensitive>,
        in_public: Tpm2bPublic,
        hierarchy: TpmHandle,
    } -> EsysTr;

    nv_define_space => NvDefineSpace {
        auth_handle: EsysTr,
        auth: Option<Tpm2bAuth>,
        public_info: TpmsNvPublic,
    } -> EsysTr;

    nv_undefine_space => NvUndefineSpace { auth_handle: EsysTr, nv_index: EsysTr } -> ();

    nv_read_public => NvReadPublic { nv_index: EsysTr } -> (TpmsNvPublic, Tpm2bName);

    nv_read => NvRead {
        auth_handle: EsysTr,
        nv_index: EsysTr,
        size: u16,
        offset: u16,
    } -> Tpm2bMaxNvBuffer;

    nv_write => NvWrite {
        auth_handle: EsysTr,
        nv_index: EsysTr,
        data: Tpm2bMaxNvBuffer,
        offset: u16,
    } -> ();

    hash => Hash {
        data: Tpm2bMaxBuffer,
        hash_alg: TpmAlgId,
        hierarchy: TpmHandle,
    } -> (Tpm2bDigest, TpmtTkHashcheck);

    hmac_start => HmacStart {
        handle: EsysTr,
        auth: Option<Tpm2bAuth>,
        hash_alg: TpmAlgId,
    } -> EsysTr;

    sequence_update => SequenceUpdate {
        sequence_handle: EsysTr,
        buffer: Option<Tpm2bMaxBuffer>,
    } -> ();

    sequence_complete => SequenceComplete {
        sequence_handle: EsysTr,
        buffer: Option<Tpm2bMaxBuffer>,
        hierarchy: TpmHandle,
    } -> (Tpm2bDigest, TpmtTkHashcheck);

    policy_ticket => PolicyTicket {
        policy_session: EsysTr,
        timeout: Tpm2bTimeout,
        cp_hash_a: Option<Tpm2bDigest>,
        policy_ref: Option<Tpm2bNonce>,
        auth_name: Tpm2bName,
        ticket: TpmtTkAuth,
    } -> ();

    policy_get_digest => PolicyGetDigest { policy_session: EsysTr } -> Tpm2bDigest;

    /// Returns `(outData, ivOut)`.
    encrypt_decrypt => EncryptDecrypt {
        key_handle: EsysTr,
        decrypt: bool,
        mode: TpmAlgId,
        iv_in: Option<Tpm2bIv>,
        in_data: Option<Tpm2bMaxBuffer>,
    } -> (Tpm2bMaxBuffer, Tpm2bIv);
}
