// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Device-wide register of the single activated core-op.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::core_op::{CoreOp, CoreOpId};
use crate::error::{AccelError, Result};

pub type ActiveCoreOpHolderPtr = Arc<ActiveCoreOpHolder>;

/// Holds at most one active core-op per device.
///
/// Shared by every core-op configured on the same device. Only a weak
/// reference is kept: a core-op that was dropped counts as inactive.
#[derive(Debug, Default)]
pub struct ActiveCoreOpHolder {
    active: Mutex<Option<(CoreOpId, Weak<CoreOp>)>>,
}

impl ActiveCoreOpHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> ActiveCoreOpHolderPtr {
        Arc::new(Self::new())
    }

    /// Register `core_op` as active if nothing else is.
    pub fn try_set(&self, core_op: &Arc<CoreOp>) -> Result<()> {
        let mut active = self.active.lock();
        if let Some((id, weak)) = active.as_ref() {
            if weak.strong_count() > 0 {
                return Err(AccelError::InvalidOperation(if *id == core_op.id() {
                    format!("core-op '{}' is already active", core_op.name())
                } else {
                    format!(
                        "cannot activate '{}' while another core-op is active",
                        core_op.name()
                    )
                }));
            }
        }
        *active = Some((core_op.id(), Arc::downgrade(core_op)));
        Ok(())
    }

    pub fn get(&self) -> Option<Arc<CoreOp>> {
        self.active
            .lock()
            .as_ref()
            .and_then(|(_, weak)| weak.upgrade())
    }

    /// Id of the registered core-op, even if it is being torn down.
    pub fn active_id(&self) -> Option<CoreOpId> {
        self.active
            .lock()
            .as_ref()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .map(|(id, _)| *id)
    }

    pub fn is_any_active(&self) -> bool {
        self.active_id().is_some()
    }

    /// Clear the register if it holds `id`. Returns whether it did.
    pub fn clear_if(&self, id: CoreOpId) -> bool {
        let mut active = self.active.lock();
        match active.as_ref() {
            Some((active_id, _)) if *active_id == id => {
                *active = None;
                true
            }
            _ => false,
        }
    }

    pub fn clear(&self) {
        *self.active.lock() = None;
    }
}
