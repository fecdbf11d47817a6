//! Call interface preparation
//!
//! A [`CallInterface`] is libffi's `ffi_cif` for one signature. libffi keeps
//! pointers into the argument type array and reads the cif on every call
//! through a trampoline, so both live in their own heap cells that never move
//! for as long as the interface exists.

use crate::error::{check, ClosureResult};
use crate::signature::Signature;
use libffi::raw;
use std::mem;
use std::os::raw::c_uint;
use std::ptr::NonNull;
use tracing::{trace, warn};

pub struct CallInterface {
    raw: NonNull<raw::ffi_cif>,
    arg_types: NonNull<[*mut raw::ffi_type]>,
    signature: Signature,
}

// SAFETY: the cif and argument array are only written by `ffi_prep_cif` during
// `new`; afterwards libffi only reads them.
unsafe impl Send for CallInterface {}
unsafe impl Sync for CallInterface {}

impl CallInterface {
    /// Prepare a call interface for `signature`
    ///
    /// On failure every cell allocated here is released before returning.
    pub fn new(signature: Signature) -> ClosureResult<Self> {
        if let Err(err) = signature.validate() {
            warn!(%signature, error = %err, "rejected signature");
            return Err(err);
        }

        let arg_types: Box<[*mut raw::ffi_type]> = signature
            .args()
            .iter()
            .map(|arg| arg.as_raw_ptr())
            .collect();

        // SAFETY: ffi_cif is plain data; an all-zero value is what libffi
        // expects to initialize.
        let cif: raw::ffi_cif = unsafe { mem::zeroed() };

        let interface = Self {
            raw: NonNull::from(Box::leak(Box::new(cif))),
            arg_types: NonNull::from(Box::leak(arg_types)),
            signature,
        };

        // SAFETY: both cells are live and pinned; the descriptors they point
        // at are kept alive by `interface.signature`.
        let status = unsafe {
            raw::ffi_prep_cif(
                interface.raw.as_ptr(),
                interface.signature.abi().as_raw(),
                interface.signature.arity() as c_uint,
                interface.signature.ret().as_raw_ptr(),
                interface.arg_types.cast::<*mut raw::ffi_type>().as_ptr(),
            )
        };

        if let Err(err) = check("ffi_prep_cif", status) {
            warn!(signature = %interface.signature, error = %err, "ffi_prep_cif failed");
            return Err(err);
        }

        trace!(signature = %interface.signature, "prepared call interface");
        Ok(interface)
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn arity(&self) -> usize {
        self.signature.arity()
    }

    pub(crate) fn as_raw_ptr(&self) -> *mut raw::ffi_cif {
        self.raw.as_ptr()
    }
}

impl Drop for CallInterface {
    fn drop(&mut self) {
        // SAFETY: both cells were leaked from boxes in `new` and are freed once
        unsafe {
            drop(Box::from_raw(self.raw.as_ptr()));
            drop(Box::from_raw(self.arg_types.as_ptr()));
        }
    }
}

impl std::fmt::Debug for CallInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallInterface")
            .field("signature", &self.signature)
            .finish()
    }
}
