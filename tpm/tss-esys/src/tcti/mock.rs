// Copyright (c) Microsoft. All rights reserved.

//! An in-process transport that replays scripted responses.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::base;
use crate::{Error, Result};

use super::{Tcti, Timeout};

type Responder = Box<dyn FnMut(&[u8]) -> Result<Vec<u8>> + Send>;

#[derive(Default)]
struct Script {
    queued: VecDeque<Result<Vec<u8>>>,
    responder: Option<Responder>,
    transmit_failures: VecDeque<Error>,
    sent: Vec<Vec<u8>>,
    timeouts: Vec<Timeout>,
    pending: bool,
}

/// Clones share one script, so a test can keep a handle after moving the transport into a context.
///
/// `receive` pops the next queued entry. Once the queue is empty the responder, if any,
/// answers the last transmitted command.
#[derive(Clone, Default)]
pub struct Scripted(Arc<Mutex<Script>>);

impl Scripted {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_response(&self, response: impl Into<Vec<u8>>) {
        self.script().queued.push_back(Ok(response.into()));
    }

    pub fn push_error(&self, err: Error) {
        self.script().queued.push_back(Err(err));
    }

    pub fn respond_with(&self, f: impl FnMut(&[u8]) -> Result<Vec<u8>> + Send + 'static) {
        self.script().responder = Some(Box::new(f));
    }

    pub fn fail_next_transmit(&self, err: Error) {
        self.script().transmit_failures.push_back(err);
    }

    /// Every command transmitted so far, oldest first.
    #[must_use]
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.script().sent.clone()
    }

    /// The timeout passed to each `receive` call.
    #[must_use]
    pub fn timeouts(&self) -> Vec<Timeout> {
        self.script().timeouts.clone()
    }
}

impl Tcti for Scripted {
    fn transmit(&mut self, command: &[u8]) -> Result<()> {
        let mut script = self.script();
        if let Some(err) = script.transmit_failures.pop_front() {
            return Err(err);
        }
        if script.pending {
            return Err(Error::tcti(base::BAD_SEQUENCE));
        }
        script.sent.push(command.to_vec());
        script.pending = true;
        Ok(())
    }

    fn receive(&mut self, timeout: Timeout) -> Result<Vec<u8>> {
        let mut script = self.script();
        if !script.pending {
            return Err(Error::tcti(base::BAD_SEQUENCE));
        }
        script.timeouts.push(timeout);

        let script = &mut *script;
        let result = match script.queued.pop_front() {
            Some(result) => result,
            None => match (&mut script.responder, script.sent.last()) {
                (Some(responder), Some(command)) => responder(command),
                _ => Err(Error::tcti(base::TRY_AGAIN)),
            },
        };

        if !matches!(&result, Err(e) if e.is_try_again()) {
            script.pending = false;
        }
        result
    }
}
