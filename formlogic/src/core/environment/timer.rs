//! Timer primitive that never defers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use minijinja::value::{Object, ObjectRepr, Value as JinjaValue, from_args};
use minijinja::{Error as JinjaError, ErrorKind as JinjaErrorKind, State};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(pub u64);

/// `setTimeout` stand-in: the callback runs before `set_timeout` returns.
///
/// A pass has no later event-loop turn to grant, so a deferred callback would
/// simply never run.
#[derive(Debug, Default)]
pub struct SyncTimer {
    next_id: AtomicU64,
    fired: AtomicU64,
}

impl SyncTimer {
    pub fn set_timeout<F: FnOnce()>(&self, callback: F, _delay: Duration) -> TimerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        callback();
        self.fired.fetch_add(1, Ordering::Relaxed);
        TimerId(id)
    }

    /// Nothing is ever pending, so there is nothing to cancel.
    pub fn clear_timeout(&self, _id: TimerId) {}

    /// Number of callbacks executed so far.
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }
}

/// `setTimeout(callback, delay, ...args)` in the sandbox.
#[derive(Debug)]
pub(super) struct SetTimeout(pub(super) Arc<SyncTimer>);

impl Object for SetTimeout {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Plain
    }

    fn call(
        self: &Arc<Self>,
        state: &State<'_, '_>,
        args: &[JinjaValue],
    ) -> Result<JinjaValue, JinjaError> {
        let Some((callback, rest)) = args.split_first() else {
            return Err(JinjaError::new(
                JinjaErrorKind::MissingArgument,
                "setTimeout needs a callback",
            ));
        };
        let (delay, extra) = match rest.split_first() {
            Some((delay, extra)) => (delay.as_i64().and_then(|ms| u64::try_from(ms).ok()), extra),
            None => (None, rest),
        };
        let mut outcome = Ok(JinjaValue::from(()));
        let id = self.0.set_timeout(
            || outcome = callback.call(state, extra),
            Duration::from_millis(delay.unwrap_or_default()),
        );
        outcome?;
        Ok(JinjaValue::from(id.0))
    }
}

/// `clearTimeout(id)` in the sandbox.
#[derive(Debug)]
pub(super) struct ClearTimeout(pub(super) Arc<SyncTimer>);

impl Object for ClearTimeout {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Plain
    }

    fn call(
        self: &Arc<Self>,
        _state: &State<'_, '_>,
        args: &[JinjaValue],
    ) -> Result<JinjaValue, JinjaError> {
        let (id,): (Option<u64>,) = from_args(args)?;
        if let Some(id) = id {
            self.0.clear_timeout(TimerId(id));
        }
        Ok(JinjaValue::from(()))
    }
}
