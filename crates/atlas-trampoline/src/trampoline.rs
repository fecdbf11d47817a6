//! Executable trampoline memory
//!
//! `ffi_closure_alloc` hands out two views of one block: a writable
//! `ffi_closure` that `ffi_prep_closure_loc` fills in, and the executable
//! address that becomes the function pointer. This module owns that pair.
//! Nothing outside the crate can create one, and the block is returned to
//! libffi exactly once, on drop.

use crate::cif::CallInterface;
use crate::dispatch::Entry;
use crate::error::{check, ClosureError, ClosureResult};
use libffi::raw;
use std::ffi::c_void;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// Held around allocator calls when serialization is requested
static ALLOCATOR: Mutex<()> = Mutex::new(());

fn lock_allocator() -> MutexGuard<'static, ()> {
    ALLOCATOR.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct TrampolineMemory {
    writable: NonNull<raw::ffi_closure>,
    executable: NonNull<c_void>,
    serialized: bool,
}

// SAFETY: the block is owned exclusively; after `bind` libffi only reads it.
unsafe impl Send for TrampolineMemory {}
unsafe impl Sync for TrampolineMemory {}

impl TrampolineMemory {
    /// Obtain a fresh writable/executable pair
    ///
    /// With `serialize` set, this call and the matching free run under one
    /// process-wide lock.
    pub(crate) fn allocate(serialize: bool) -> ClosureResult<Self> {
        let mut code: *mut c_void = ptr::null_mut();
        let writable = {
            let _guard = serialize.then(lock_allocator);
            // SAFETY: plain allocation call; `code` receives the executable view
            unsafe { raw::ffi_closure_alloc(mem::size_of::<raw::ffi_closure>(), &mut code) }
        };

        let Some(writable) = NonNull::new(writable.cast::<raw::ffi_closure>()) else {
            warn!("ffi_closure_alloc returned no memory");
            return Err(ClosureError::Allocation);
        };

        // From here on the block is owned, so an early return frees it.
        let mut memory = Self {
            writable,
            executable: NonNull::dangling(),
            serialized: serialize,
        };

        match NonNull::new(code) {
            Some(executable) => {
                memory.executable = executable;
                Ok(memory)
            }
            None => {
                warn!("ffi_closure_alloc returned no executable address");
                Err(ClosureError::Allocation)
            }
        }
    }

    /// Point the trampoline at `entry` with `user_data` as its last argument
    ///
    /// # Safety
    ///
    /// `interface` and whatever `user_data` points to must outlive `self`, and
    /// `entry` must accept `user_data` for calls described by `interface`.
    pub(crate) unsafe fn bind(
        &mut self,
        interface: &CallInterface,
        entry: Entry,
        user_data: *mut c_void,
    ) -> ClosureResult<()> {
        let status = raw::ffi_prep_closure_loc(
            self.writable.as_ptr(),
            interface.as_raw_ptr(),
            Some(entry),
            user_data,
            self.executable.as_ptr(),
        );

        check("ffi_prep_closure_loc", status).map_err(|err| {
            warn!(signature = %interface.signature(), error = %err, "ffi_prep_closure_loc failed");
            err
        })
    }

    /// The address handed out as the function pointer
    pub fn executable(&self) -> *mut c_void {
        self.executable.as_ptr()
    }
}

impl Drop for TrampolineMemory {
    fn drop(&mut self) {
        let _guard = self.serialized.then(lock_allocator);
        // SAFETY: `writable` came from ffi_closure_alloc and is freed once
        unsafe { raw::ffi_closure_free(self.writable.as_ptr().cast()) }
    }
}

impl std::fmt::Debug for TrampolineMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrampolineMemory")
            .field("executable", &self.executable)
            .field("serialized", &self.serialized)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_allocations_are_distinct() {
        let blocks: Vec<_> = (0..64)
            .map(|i| TrampolineMemory::allocate(i % 2 == 0).unwrap())
            .collect();
        let addresses: HashSet<_> = blocks.iter().map(|b| b.executable() as usize).collect();
        assert_eq!(addresses.len(), blocks.len());
    }

    #[test]
    fn test_address_is_stable() {
        let block = TrampolineMemory::allocate(false).unwrap();
        let first = block.executable();
        let moved = block;
        assert_eq!(moved.executable(), first);
    }

    #[test]
    fn test_serialized_allocation_from_threads() {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                std::thread::spawn(|| {
                    (0..32)
                        .map(|_| TrampolineMemory::allocate(true).unwrap())
                        .count()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 32);
        }
    }
}
