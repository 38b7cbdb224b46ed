//! Chained asynchronous operations.
//!
//! An [`AsyncTask`] is a list of steps followed by a terminal result
//! handler. Each step receives the task itself and must eventually hand a
//! result back through [`AsyncTask::set_result`], usually after a round trip
//! to the coprocessor. A success moves on to the next step; an error skips
//! the remaining steps and goes straight to the handler.
//!
//! Dropping a task whose handler has not fired yet fires it with a failure,
//! so every issued operation resolves exactly once.

use std::collections::VecDeque;
use std::fmt;

use shared::{Error, Result};

pub type ResultHandler = Box<dyn FnOnce(Result<()>)>;
pub type ThenHandler<C> = Box<dyn FnOnce(&mut C, AsyncTask<C>)>;

/// A chain of steps run against a context `C`.
pub struct AsyncTask<C> {
    steps: VecDeque<ThenHandler<C>>,
    handler: Option<ResultHandler>,
}

impl<C> AsyncTask<C> {
    pub fn new(handler: impl FnOnce(Result<()>) + 'static) -> Self {
        Self {
            steps: VecDeque::new(),
            handler: Some(Box::new(handler)),
        }
    }

    /// Set the initial operation of the chain.
    pub fn first(self, step: impl FnOnce(&mut C, AsyncTask<C>) + 'static) -> Self {
        debug_assert!(self.steps.is_empty(), "first() called on a non-empty chain");
        self.then(step)
    }

    /// Append the next operation of the chain.
    pub fn then(mut self, step: impl FnOnce(&mut C, AsyncTask<C>) + 'static) -> Self {
        self.steps.push_back(Box::new(step));
        self
    }

    /// Trigger the first step.
    pub fn run(self, context: &mut C) {
        self.set_result(context, Ok(()));
    }

    /// Hand over the result of the previous operation.
    pub fn set_result(mut self, context: &mut C, result: Result<()>) {
        match result {
            Ok(()) => match self.steps.pop_front() {
                Some(step) => step(context, self),
                None => self.finish(Ok(())),
            },
            Err(e) => {
                self.steps.clear();
                self.finish(Err(e));
            }
        }
    }

    fn finish(&mut self, result: Result<()>) {
        if let Some(handler) = self.handler.take() {
            handler(result);
        }
    }
}

impl<C> Drop for AsyncTask<C> {
    fn drop(&mut self) {
        if self.handler.is_some() {
            self.finish(Err(Error::Failed(
                "AsyncTask ends without setting any result".to_string(),
            )));
        }
    }
}

impl<C> fmt::Debug for AsyncTask<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTask")
            .field("pending_steps", &self.steps.len())
            .field("resolved", &self.handler.is_none())
            .finish()
    }
}
