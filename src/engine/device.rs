use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, TryLockError};

use crate::audio::AudioSource;

/// Non-reentrant lock owning the capture device
///
/// The guard is the only path to the device, so holding it is the proof of
/// exclusive access. Locking twice from one thread deadlocks; code that
/// already holds the guard must pass the device down instead.
pub struct DeviceLock {
    device: Mutex<Box<dyn AudioSource>>,
}

/// Exclusive access to the capture device; released on drop
pub struct DeviceGuard<'a> {
    guard: MutexGuard<'a, Box<dyn AudioSource>>,
}

impl DeviceLock {
    #[must_use]
    pub fn new(device: Box<dyn AudioSource>) -> Self {
        Self {
            device: Mutex::new(device),
        }
    }

    /// Block until the device is free
    ///
    /// A panic while the lock was held leaves the device usable; poisoning is ignored.
    pub fn acquire(&self) -> DeviceGuard<'_> {
        let guard = self.device.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("device lock was poisoned by a panicking holder");
            poisoned.into_inner()
        });
        DeviceGuard { guard }
    }

    /// Take the device only if nobody holds it
    #[must_use]
    pub fn try_acquire(&self) -> Option<DeviceGuard<'_>> {
        match self.device.try_lock() {
            Ok(guard) => Some(DeviceGuard { guard }),
            Err(TryLockError::Poisoned(poisoned)) => Some(DeviceGuard {
                guard: poisoned.into_inner(),
            }),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

impl Deref for DeviceGuard<'_> {
    type Target = dyn AudioSource;

    fn deref(&self) -> &Self::Target {
        &**self.guard
    }
}

impl DerefMut for DeviceGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.guard
    }
}
