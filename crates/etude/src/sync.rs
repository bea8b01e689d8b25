// src/sync.rs
//! POSIX-backed wait/signal and mutual-exclusion primitives for the pool.
//!
//! Both constructors are fallible: `sem_init` and `pthread_mutex_init` can
//! fail, and the error is handed back instead of aborting.

use crate::error::EtudeResult;
use std::cell::UnsafeCell;
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

/// Counting semaphore.
pub struct Semaphore {
    // Boxed so the sem_t never moves after sem_init.
    raw: Box<UnsafeCell<libc::sem_t>>,
}

unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    pub fn new(initial: u32) -> EtudeResult<Self> {
        let raw: Box<UnsafeCell<libc::sem_t>> =
            Box::new(UnsafeCell::new(unsafe { std::mem::zeroed() }));
        if unsafe { libc::sem_init(raw.get(), 0, initial) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self { raw })
    }

    /// Block until the count is positive, then decrement it.
    pub fn wait(&self) -> EtudeResult<()> {
        loop {
            if unsafe { libc::sem_wait(self.raw.get()) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        }
    }

    /// Increment the count, waking one waiter.
    pub fn post(&self) -> EtudeResult<()> {
        if unsafe { libc::sem_post(self.raw.get()) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_destroy(self.raw.get());
        }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore").finish_non_exhaustive()
    }
}

/// Mutex guarding a value of type `T`.
pub struct Locker<T> {
    raw: Box<UnsafeCell<libc::pthread_mutex_t>>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Locker<T> {}
unsafe impl<T: Send> Sync for Locker<T> {}

impl<T> Locker<T> {
    pub fn new(value: T) -> EtudeResult<Self> {
        let raw: Box<UnsafeCell<libc::pthread_mutex_t>> =
            Box::new(UnsafeCell::new(unsafe { std::mem::zeroed() }));
        let rc = unsafe { libc::pthread_mutex_init(raw.get(), std::ptr::null()) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc).into());
        }
        Ok(Self {
            raw,
            data: UnsafeCell::new(value),
        })
    }

    /// Acquire the lock; it is released when the guard drops.
    pub fn lock(&self) -> EtudeResult<LockerGuard<'_, T>> {
        let rc = unsafe { libc::pthread_mutex_lock(self.raw.get()) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc).into());
        }
        Ok(LockerGuard {
            locker: self,
            _not_send: PhantomData,
        })
    }
}

impl<T> Drop for Locker<T> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_destroy(self.raw.get());
        }
    }
}

impl<T> fmt::Debug for Locker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Locker").finish_non_exhaustive()
    }
}

/// Held lock on a [`Locker`].
///
/// The guard is `!Send`: a default `pthread_mutex_t` must be unlocked by the
/// thread that locked it.
///
/// ```compile_fail
/// fn assert_send<T: Send>() {}
/// assert_send::<etude::sync::LockerGuard<'static, u32>>();
/// ```
pub struct LockerGuard<'a, T> {
    locker: &'a Locker<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for LockerGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.locker.data.get() }
    }
}

impl<T> DerefMut for LockerGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.locker.data.get() }
    }
}

impl<T> Drop for LockerGuard<'_, T> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.locker.raw.get());
        }
    }
}
