// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Resettable one-shot signal used to publish core-op activation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{AccelError, Result};

pub type EventPtr = Arc<Event>;

/// Signal object that blocks waiters until it is signalled.
///
/// Signalled on successful activation, reset on deactivation. Waiters park
/// on a condition variable; nothing busy-polls.
#[derive(Debug, Default)]
pub struct Event {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new(initially_signalled: bool) -> Self {
        Self {
            signalled: Mutex::new(initially_signalled),
            cond: Condvar::new(),
        }
    }

    pub fn new_shared(initially_signalled: bool) -> EventPtr {
        Arc::new(Self::new(initially_signalled))
    }

    /// Signal the event and wake every waiter.
    pub fn signal(&self) -> Result<()> {
        let mut signalled = self.signalled.lock();
        *signalled = true;
        self.cond.notify_all();
        Ok(())
    }

    pub fn reset(&self) {
        *self.signalled.lock() = false;
    }

    pub fn is_signalled(&self) -> bool {
        *self.signalled.lock()
    }

    /// Block until signalled or until `timeout` elapses.
    ///
    /// The deadline is evaluated independently of whoever is expected to
    /// signal, so a never-arriving activation cannot deadlock the caller.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut signalled = self.signalled.lock();
        while !*signalled {
            if self.cond.wait_until(&mut signalled, deadline).timed_out() {
                if *signalled {
                    break;
                }
                return Err(AccelError::Timeout(format!(
                    "event was not signalled within {} ms",
                    timeout.as_millis()
                )));
            }
        }
        Ok(())
    }
}
