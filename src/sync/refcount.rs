//! Reference-counted ownership of a lazily created shared resource.
//!
//! The resource is created by the factory on the 0→1 transition and handed
//! to the destructor on the 1→0 transition. Counter updates and the
//! create/destroy calls happen under one lock, so no caller can observe a
//! counter without its matching value.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use super::{SyncError, SyncResult};

type Factory<R> = Box<dyn Fn() -> R + Send + Sync>;
type Destructor<R> = Box<dyn Fn(R) + Send + Sync>;

struct RefState<R> {
    counter: usize,
    value: Option<R>,
}

/// Shared resource created on first acquire and destroyed on last release.
///
/// The factory and destructor run while the internal lock is held; they must
/// not call back into the same `RefCountedResource`.
pub struct RefCountedResource<R: Clone> {
    state: Mutex<RefState<R>>,
    init: Factory<R>,
    exit: Destructor<R>,
}

impl<R: Clone> RefCountedResource<R> {
    pub fn new(
        init: impl Fn() -> R + Send + Sync + 'static,
        exit: impl Fn(R) + Send + Sync + 'static,
    ) -> Self {
        Self {
            state: Mutex::new(RefState {
                counter: 0,
                value: None,
            }),
            init: Box::new(init),
            exit: Box::new(exit),
        }
    }

    /// Take one reference, creating the resource if this is the first one
    pub fn acquire(&self) -> SyncResult<R> {
        let mut state = self.state.lock();

        state.counter += 1;
        if state.counter == 1 {
            state.value = Some((self.init)());
            debug!("Shared resource created");
        }

        match state.value.clone() {
            Some(value) => Ok(value),
            None => {
                state.counter -= 1;
                Err(SyncError::ContractViolation(
                    "shared resource missing after acquire".to_string(),
                ))
            }
        }
    }

    /// Drop one reference, destroying the resource if it was the last one
    pub fn release(&self) -> SyncResult<()> {
        let mut state = self.state.lock();

        if state.counter == 0 {
            return Err(SyncError::ContractViolation(
                "release called without a matching acquire".to_string(),
            ));
        }

        state.counter -= 1;
        if state.counter == 0 {
            match state.value.take() {
                Some(value) => {
                    (self.exit)(value);
                    debug!("Shared resource destroyed");
                }
                None => {
                    return Err(SyncError::ContractViolation(
                        "shared resource missing on last release".to_string(),
                    ))
                }
            }
        }

        Ok(())
    }

    /// Current number of outstanding acquires
    pub fn count(&self) -> usize {
        self.state.lock().counter
    }

    /// Whether the resource currently exists
    pub fn is_live(&self) -> bool {
        self.state.lock().value.is_some()
    }

    /// Acquire and get a guard that releases on drop
    pub fn lease(self: &Arc<Self>) -> SyncResult<ResourceLease<R>> {
        let value = self.acquire()?;
        Ok(ResourceLease {
            owner: self.clone(),
            value,
        })
    }
}

/// RAII guard over one acquire of a [`RefCountedResource`]
pub struct ResourceLease<R: Clone> {
    owner: Arc<RefCountedResource<R>>,
    value: R,
}

impl<R: Clone> ResourceLease<R> {
    pub fn value(&self) -> &R {
        &self.value
    }
}

impl<R: Clone> std::ops::Deref for ResourceLease<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.value
    }
}

impl<R: Clone> Drop for ResourceLease<R> {
    fn drop(&mut self) {
        if let Err(e) = self.owner.release() {
            tracing::error!("Failed to release leased resource: {}", e);
        }
    }
}
