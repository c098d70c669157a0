//! Scoped unit of work around one handler invocation.
//!
//! # Design Decisions
//! - RAII: a unit that is not committed is rolled back when dropped, so
//!   every early return and every caught panic ends in a rollback
//! - Panics are caught here and become `HandlerError::Panicked`

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::dispatch::handler::{Handler, HandlerError};

/// An open unit of work. Commit explicitly; drop rolls back.
pub struct UnitOfWork<'a, H: Handler + ?Sized> {
    handler: &'a H,
    open: bool,
}

impl<'a, H: Handler + ?Sized> UnitOfWork<'a, H> {
    pub fn begin(handler: &'a H) -> Result<Self, HandlerError> {
        handler.begin_unit()?;
        Ok(Self {
            handler,
            open: true,
        })
    }

    pub fn commit(mut self) -> Result<(), HandlerError> {
        self.open = false;
        if let Err(e) = self.handler.commit_unit() {
            self.rollback();
            return Err(e);
        }
        Ok(())
    }

    fn rollback(&self) {
        if let Err(e) = self.handler.rollback_unit() {
            tracing::warn!(error = %e, "Rollback failed");
        }
    }
}

impl<H: Handler + ?Sized> Drop for UnitOfWork<'_, H> {
    fn drop(&mut self) {
        if self.open {
            self.open = false;
            self.rollback();
        }
    }
}

/// Run `f` inside a fresh unit of work.
pub fn run<H, T, F>(handler: &H, f: F) -> Result<T, HandlerError>
where
    H: Handler + ?Sized,
    F: FnOnce(&H) -> Result<T, HandlerError>,
{
    let unit = UnitOfWork::begin(handler)?;
    let value = catch_unwind(AssertUnwindSafe(|| f(handler)))
        .map_err(|payload| HandlerError::Panicked(panic_message(payload.as_ref())))??;
    unit.commit()?;
    Ok(value)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
