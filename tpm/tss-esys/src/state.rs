// Copyright (c) Microsoft. All rights reserved.

use crate::error::base;
use crate::{Error, Result};

/// How many times one command may be submitted before a transient TPM condition is reported as final.
pub const MAX_SUBMISSIONS: u32 = 5;

/// Protocol state of an [`EsysContext`](crate::EsysContext).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    /// Ready for a new command.
    Init,
    /// A command was sent and its response has not been collected yet.
    Sent,
    /// A transient TPM condition is being retried.
    Resubmission,
    /// The TPM answered with a response that could not be understood.
    ErrorResponse,
    /// A local fault interrupted the exchange. Use `recover` before sending anything else.
    InternalError,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Event {
    BeginAsync,
    Dispatched,
    RejectedInput,
    BeginFinish,
    TryAgain,
    Resubmit,
    Completed,
    TpmError,
    GiveUp,
    Malformed,
    Fault,
    Recover,
}

#[derive(Debug)]
pub(crate) struct StateMachine {
    state: State,
    submissions: u32,
}

impl Default for StateMachine {
    fn default() -> Self {
        StateMachine {
            state: State::Init,
            submissions: 0,
        }
    }
}

impl StateMachine {
    pub(crate) fn state(&self) -> State {
        self.state
    }

    pub(crate) fn submissions(&self) -> u32 {
        self.submissions
    }

    pub(crate) fn ceiling_reached(&self) -> bool {
        self.submissions >= MAX_SUBMISSIONS
    }

    /// The only place the state changes. A rejected event leaves the machine untouched.
    pub(crate) fn transition(&mut self, event: Event) -> Result<()> {
        let next = match (event, self.state) {
            (Event::BeginAsync, State::Init) => {
                self.submissions = 1;
                State::InternalError
            }
            (Event::BeginAsync, State::Resubmission) => {
                self.submissions += 1;
                State::InternalError
            }
            (Event::BeginFinish, State::Sent) => State::InternalError,
            (Event::BeginAsync | Event::BeginFinish, state) => {
                log::debug!("{event:?} rejected in state {state:?}");
                return Err(Error::esys(base::BAD_SEQUENCE));
            }

            (Event::Recover, State::Init | State::ErrorResponse | State::InternalError) => State::Init,
            (Event::Recover, state) => {
                log::debug!("cannot recover a context in state {state:?}");
                return Err(Error::esys(base::BAD_SEQUENCE));
            }

            (Event::Dispatched | Event::TryAgain, _) => State::Sent,
            (Event::Resubmit, _) => State::Resubmission,
            (Event::RejectedInput | Event::Completed | Event::TpmError | Event::GiveUp, _) => {
                State::Init
            }
            (Event::Malformed, _) => State::ErrorResponse,
            (Event::Fault, _) => State::InternalError,
        };

        if next != self.state {
            log::trace!("{:?} --{:?}--> {:?}", self.state, event, next);
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Event, State, StateMachine, MAX_SUBMISSIONS};
    use crate::error::base;
    use crate::Error;

    fn machine_in(state: State) -> StateMachine {
        StateMachine {
            state,
            submissions: 1,
        }
    }

    #[test]
    fn async_only_from_init_or_resubmission() {
        for state in [State::Sent, State::ErrorResponse, State::InternalError] {
            let mut machine = machine_in(state);
            assert_eq!(
                machine.transition(Event::BeginAsync).unwrap_err(),
                Error::esys(base::BAD_SEQUENCE)
            );
            assert_eq!(machine.state(), state);
        }

        let mut machine = StateMachine::default();
        machine.transition(Event::BeginAsync).unwrap();
        assert_eq!(machine.state(), State::InternalError);
        assert_eq!(machine.submissions(), 1);
    }

    #[test]
    fn finish_only_from_sent() {
        for state in [
            State::Init,
            State::Resubmission,
            State::ErrorResponse,
            State::InternalError,
        ] {
            let mut machine = machine_in(state);
            assert!(machine.transition(Event::BeginFinish).is_err());
            assert_eq!(machine.state(), state);
        }

        let mut machine = machine_in(State::Sent);
        machine.transition(Event::BeginFinish).unwrap();
        assert_eq!(machine.state(), State::InternalError);
    }

    #[test]
    fn resubmission_counts_up_to_ceiling() {
        let mut machine = StateMachine::default();
        machine.transition(Event::BeginAsync).unwrap();
        machine.transition(Event::Dispatched).unwrap();

        while !machine.ceiling_reached() {
            machine.transition(Event::BeginFinish).unwrap();
            machine.transition(Event::Resubmit).unwrap();
            machine.transition(Event::BeginAsync).unwrap();
            machine.transition(Event::Dispatched).unwrap();
        }
        assert_eq!(machine.submissions(), MAX_SUBMISSIONS);

        machine.transition(Event::BeginFinish).unwrap();
        machine.transition(Event::GiveUp).unwrap();
        assert_eq!(machine.state(), State::Init);

        machine.transition(Event::BeginAsync).unwrap();
        assert_eq!(machine.submissions(), 1);
    }

    #[test]
    fn recovery() {
        for state in [State::ErrorResponse, State::InternalError, State::Init] {
            let mut machine = machine_in(state);
            machine.transition(Event::Recover).unwrap();
            assert_eq!(machine.state(), State::Init);
        }

        for state in [State::Sent, State::Resubmission] {
            let mut machine = machine_in(state);
            assert!(machine.transition(Event::Recover).is_err());
            assert_eq!(machine.state(), state);
        }
    }
}
