#[cfg(feature = "loom")]
mod imp {
    pub(crate) use loom::{
        sync::{
            atomic::{fence, AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering},
            Arc, Condvar, Mutex, MutexGuard,
        },
        thread,
    };
}

#[cfg(not(feature = "loom"))]
mod imp {
    pub(crate) use core::sync::atomic::{
        fence, AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering,
    };
    pub(crate) use std::{
        sync::{Arc, Condvar, Mutex, MutexGuard},
        thread,
    };
}

pub(crate) use imp::*;

use std::sync::PoisonError;

/// Lock a mutex, stripping lock poisoning.
///
/// Panics inside user work are caught at the worker boundary and surface as
/// an abort-flagged completion; poison carries no extra information here.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Block on a condition variable, stripping lock poisoning.
pub(crate) fn wait_on<'a, T>(cv: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cv.wait(guard).unwrap_or_else(PoisonError::into_inner)
}
