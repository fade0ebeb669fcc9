// Copyright (c) Microsoft. All rights reserved.

//! Drives one command through Async, Finish and resubmission.

use crate::commands::{Command, Minted};
use crate::error::base;
use crate::resource::handle_name;
use crate::session;
use crate::state::{Event, State};
use crate::sys::{self, Response};
use crate::tcti::Timeout;
use crate::types::{rc, rh};
use crate::verify;
use crate::{EsysContext, EsysTr, Error, Result};

/// What a collected response means for the state machine.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// Nothing arrived yet. The same command is still pending.
    TryAgain(Error),
    /// The TPM asked for the command to be sent again.
    Transient(Error),
    TpmError(Error),
    Fault(Error),
    Success(Response),
}

pub(crate) fn classify(received: Result<Response>) -> Outcome {
    match received {
        Ok(response) => Outcome::Success(response),
        Err(err) if err.is_try_again() => Outcome::TryAgain(err),
        Err(err) if matches!(err.code(), rc::RETRY | rc::TESTING | rc::YIELDED) => {
            Outcome::Transient(err)
        }
        Err(err) if err.is_tpm() => Outcome::TpmError(err),
        Err(err) => Outcome::Fault(err),
    }
}

impl EsysContext {
    /// Validates, marshals, authorizes and transmits `command`.
    pub(crate) fn start<C: Command>(&mut self, mut command: C, sessions: [EsysTr; 3]) -> Result<()> {
        self.machine.transition(Event::BeginAsync)?;

        if let Err(err) = self.prepare(&mut command, sessions) {
            log::debug!("command 0x{:X} rejected before sending: {err}", C::CODE);
            self.machine.transition(Event::RejectedInput)?;
            return Err(err);
        }

        // A transport failure leaves the machine in InternalError.
        self.sys.execute_async(&mut *self.tcti)?;
        self.machine.transition(Event::Dispatched)
    }

    fn prepare<C: Command>(&mut self, command: &mut C, sessions: [EsysTr; 3]) -> Result<()> {
        session::check_session_feasibility::<C>(&self.resources, &sessions)?;
        command.check_parameters()?;
        command.prepare_input(&self.resources)?;

        self.input = Some(command.clone().into());
        self.sessions = sessions;

        let ids = command.handles();
        let mut handles = Vec::with_capacity(ids.len());
        let mut names = Vec::with_capacity(ids.len());
        for &id in &ids {
            if id == EsysTr::NONE {
                handles.push(rh::NULL);
                names.push(handle_name(rh::NULL)?);
            } else {
                let object = self.resources.resolve(id)?;
                handles.push(object.handle);
                names.push(object.name.clone());
            }
        }

        self.sys.prepare(command, handles)?;

        let slots = session::init_session_slots(&self.resources, &sessions)?;
        let mut entities = [None; 3];
        for (i, &slot) in slots.iter().enumerate() {
            let entity = ids
                .get(i)
                .copied()
                .filter(|&id| i < C::AUTH_HANDLES && id != EsysTr::NONE);
            entities[i] = entity;
            session::compute_session_value(&mut self.resources, slot, entity)?;
        }

        let auths = session::generate_auths(
            &mut self.resources,
            &slots,
            &entities,
            &names,
            &mut self.sys,
        )?;
        self.sys.set_auths(auths)
    }

    /// Collects the response to the pending `C` and applies it.
    pub(crate) fn finish<C: Command>(&mut self) -> Result<C::Output> {
        if self.machine.state() == State::Sent
            && self.input.as_ref().and_then(C::from_input).is_none()
        {
            log::error!(
                "finish for command 0x{:X} while a different command is pending",
                C::CODE
            );
            return Err(Error::esys(base::BAD_SEQUENCE));
        }
        self.machine.transition(Event::BeginFinish)?;

        let command = self
            .input
            .as_ref()
            .and_then(C::from_input)
            .cloned()
            .ok_or(Error::esys(base::BAD_SEQUENCE))?;

        let minted = if C::MINTS { Some(self.mint()?) } else { None };
        let result = self.complete(&command, minted);
        if let (Err(_), Some(id)) = (&result, minted) {
            let _ = self.resources.delete(id);
        }
        result
    }

    fn complete<C: Command>(&mut self, command: &C, minted: Option<EsysTr>) -> Result<C::Output> {
        let received = self.sys.execute_finish(&mut *self.tcti, self.timeout);

        match classify(received) {
            Outcome::TryAgain(err) => {
                self.machine.transition(Event::TryAgain)?;
                Err(err)
            }
            Outcome::Transient(err) => self.resubmit::<C>(err),
            Outcome::TpmError(err) => {
                log::warn!("command 0x{:X} failed in the TPM: {err}", C::CODE);
                self.machine.transition(Event::TpmError)?;
                Err(err)
            }
            Outcome::Fault(err) => {
                log::error!("command 0x{:X} failed: {err}", C::CODE);
                self.machine.transition(Event::Fault)?;
                Err(err)
            }
            Outcome::Success(response) => self.accept(command, minted, response),
        }
    }

    fn resubmit<C: Command>(&mut self, err: Error) -> Result<C::Output> {
        if self.machine.ceiling_reached() {
            log::warn!(
                "giving up on command 0x{:X} after {} submissions: {err}",
                C::CODE,
                self.machine.submissions()
            );
            self.machine.transition(Event::GiveUp)?;
            return Err(err);
        }

        log::debug!("TPM answered {err}; resubmitting command 0x{:X}", C::CODE);
        self.machine.transition(Event::Resubmit)?;

        let command = self
            .input
            .as_ref()
            .and_then(C::from_input)
            .cloned()
            .ok_or(Error::esys(base::BAD_SEQUENCE))?;
        let sessions = self.sessions;
        self.start(command, sessions)?;

        Err(Error::esys(base::TRY_AGAIN))
    }

    fn accept<C: Command>(
        &mut self,
        command: &C,
        minted: Option<EsysTr>,
        mut response: Response,
    ) -> Result<C::Output> {
        let slots = verify::slots_of(&self.sessions);

        if let Err(err) = verify::check_response(&mut self.resources, &slots, C::CODE, &mut response)
        {
            self.machine.transition(Event::Fault)?;
            return Err(err);
        }

        let parsed = match sys::complete::<C>(&response.parameters) {
            Ok(parsed) => parsed,
            Err(err) => {
                log::error!("could not unmarshal response to command 0x{:X}: {err}", C::CODE);
                self.machine.transition(Event::Malformed)?;
                return Err(err);
            }
        };

        let minted = minted.map(|id| Minted {
            id,
            handle: response.handle,
        });
        let output = match command.apply(&mut self.resources, minted, parsed) {
            Ok(output) => output,
            Err(err) => {
                self.machine.transition(Event::Fault)?;
                return Err(err);
            }
        };

        verify::remove_discontinued(&mut self.resources, &slots);
        self.machine.transition(Event::Completed)?;
        Ok(output)
    }

    /// Async followed by blocking Finish calls until the command settles.
    pub(crate) fn execute<C: Command>(
        &mut self,
        command: C,
        sessions: [EsysTr; 3],
    ) -> Result<C::Output> {
        self.start(command, sessions)?;

        let timeout = std::mem::replace(&mut self.timeout, Timeout::Block);
        let result = loop {
            match self.finish::<C>() {
                Err(err) if err.is_try_again() => continue,
                result => break result,
            }
        };
        self.timeout = timeout;
        result
    }

    /// Reserves a fresh identifier with empty metadata.
    pub(crate) fn mint(&mut self) -> Result<EsysTr> {
        loop {
            let id = EsysTr(self.next_tr);
            self.next_tr = self.next_tr.checked_add(1).unwrap_or(EsysTr::MIN_OBJECT);
            if self.resources.get(id).is_err() {
                self.resources.create(id)?;
                return Ok(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{classify, Outcome};
    use crate::error::base;
    use crate::sys::Response;
    use crate::Error;

    #[test]
    fn classification() {
        let ok = Response {
            handle: None,
            parameters: vec![],
            auths: vec![],
        };
        assert!(matches!(classify(Ok(ok)), Outcome::Success(_)));

        assert!(matches!(
            classify(Err(Error::tcti(base::TRY_AGAIN))),
            Outcome::TryAgain(_)
        ));
        for code in [0x922, 0x90A, 0x908] {
            assert!(matches!(
                classify(Err(Error::from_code(code))),
                Outcome::Transient(e) if e.code() == code
            ));
        }
        assert!(matches!(
            classify(Err(Error::from_code(0x98E))),
            Outcome::TpmError(_)
        ));
        assert!(matches!(
            classify(Err(Error::from_code(0x000C_0101))),
            Outcome::TpmError(_)
        ));
        assert!(matches!(
            classify(Err(Error::tcti(base::IO_ERROR))),
            Outcome::Fault(_)
        ));
        assert!(matches!(
            classify(Err(Error::sys(base::MALFORMED_RESPONSE))),
            Outcome::Fault(_)
        ));
    }
}
