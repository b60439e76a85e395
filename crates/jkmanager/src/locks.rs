//
// locks.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if another thread panicked while
/// holding it. None of the state guarded this way can be left half-updated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
