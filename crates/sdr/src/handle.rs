// Copyright 2025-2026 CEMAXECUTER LLC

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::SdrDriver;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Exclusive binding to the physical radio.
///
/// Clones share the same driver; the mutex serializes hardware calls
/// between the controller and the acquisition thread. A handle that
/// faults is never repaired: the controller drops it and opens a new one.
#[derive(Clone)]
pub struct DeviceHandle {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    label: String,
    driver: Mutex<Box<dyn SdrDriver>>,
    faulted: AtomicBool,
    released: AtomicBool,
    streaming: AtomicBool,
}

impl DeviceHandle {
    pub fn new(driver: Box<dyn SdrDriver>, label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
                label: label.into(),
                driver: Mutex::new(driver),
                faulted: AtomicBool::new(false),
                released: AtomicBool::new(false),
                streaming: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Run `f` with exclusive access to the driver.
    pub fn with_driver<T>(&self, f: impl FnOnce(&mut dyn SdrDriver) -> Result<T>) -> Result<T> {
        if self.is_faulted() || self.is_released() {
            return Err(Error::HandleFaulted);
        }
        let mut guard = match self.inner.driver.lock() {
            Ok(guard) => guard,
            Err(_) => {
                self.mark_faulted();
                return Err(Error::HandleFaulted);
            }
        };
        f(guard.as_mut())
    }

    pub fn is_faulted(&self) -> bool {
        self.inner.faulted.load(Ordering::SeqCst)
    }

    pub fn mark_faulted(&self) {
        if !self.inner.faulted.swap(true, Ordering::SeqCst) {
            log::warn!("device handle #{} ({}) faulted", self.inner.id, self.inner.label);
        }
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Close any open stream and refuse further use. Idempotent.
    pub fn release(&self) {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return;
        }
        // Close even on a poisoned lock; the stream must not outlive the handle.
        let mut guard = match self.inner.driver.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.close_stream();
        log::info!("device handle #{} ({}) released", self.inner.id, self.inner.label);
    }

    /// True while an acquisition loop owns the stream.
    pub fn is_streaming(&self) -> bool {
        self.inner.streaming.load(Ordering::SeqCst)
    }

    /// Claim the stream for one acquisition loop. Returns false when
    /// another loop already holds it.
    pub fn claim_stream(&self) -> bool {
        self.inner
            .streaming
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn release_stream(&self) {
        self.inner.streaming.store(false, Ordering::SeqCst);
    }

    pub fn same_device(&self, other: &DeviceHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("faulted", &self.is_faulted())
            .field("released", &self.is_released())
            .field("streaming", &self.is_streaming())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDriver, SimScript};

    #[test]
    fn test_claim_is_exclusive() {
        let handle = DeviceHandle::new(Box::new(SimDriver::new(SimScript::default())), "sim");
        assert!(handle.claim_stream());
        assert!(!handle.clone().claim_stream());
        handle.release_stream();
        assert!(handle.claim_stream());
    }

    #[test]
    fn test_released_handle_refuses_calls() {
        let handle = DeviceHandle::new(Box::new(SimDriver::new(SimScript::default())), "sim");
        assert!(handle.with_driver(|d| d.set_frequency(100e6)).is_ok());
        handle.release();
        handle.release();
        assert!(matches!(
            handle.with_driver(|d| d.set_frequency(100e6)),
            Err(Error::HandleFaulted)
        ));
    }
}
