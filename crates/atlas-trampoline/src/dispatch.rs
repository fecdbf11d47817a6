//! Dispatch routines
//!
//! Generated code calls one of these with libffi's closure callback shape
//! `(cif, ret, args, user_data)`. There is one instantiation per closure type
//! and signature, so argument reads and the call itself are fully typed and
//! nothing is looked up at runtime.
//!
//! A panic cannot unwind through the C frames that called the generated
//! pointer. It is caught here, logged, and the process is aborted.

use crate::signature::{CallSignature, Callable, CallableShared};
use crate::types::{FfiArg, FfiReturn};
use libffi::raw;
use std::any::{type_name, Any};
use std::ffi::c_void;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use tracing::{error, trace};

/// Shape of the callback libffi installs behind a trampoline
pub(crate) type Entry =
    unsafe extern "C" fn(*mut raw::ffi_cif, *mut c_void, *mut *mut c_void, *mut c_void);

/// Argument cells and return buffer of one in-flight call
pub struct DispatchContext<'call> {
    args: *mut *mut c_void,
    ret: *mut c_void,
    _call: PhantomData<&'call mut c_void>,
}

impl<'call> DispatchContext<'call> {
    /// `None` when a buffer the signature needs is missing
    fn new<S: CallSignature>(
        cif: *mut raw::ffi_cif,
        ret: *mut c_void,
        args: *mut *mut c_void,
    ) -> Option<Self> {
        if cif.is_null()
            || (ret.is_null() && !<S::Output as FfiReturn>::IS_VOID)
            || (args.is_null() && S::ARITY > 0)
        {
            return None;
        }

        Some(Self {
            args,
            ret,
            _call: PhantomData,
        })
    }

    /// Read argument `index`
    ///
    /// # Safety
    ///
    /// `index` must be below the call's arity and `T` must be the declared type
    /// of that parameter.
    pub unsafe fn arg<T: FfiArg>(&self, index: usize) -> T {
        (*self.args.add(index)).cast::<T>().read()
    }

    unsafe fn finish<R: FfiReturn>(&self, value: R) {
        value.write_return(self.ret);
    }
}

/// Callback for `FnMut` payloads
///
/// # Safety
///
/// `user_data` must be the payload of a live handle built for `F` and `S`, and
/// no other call into the same payload may be in progress.
pub(crate) unsafe extern "C" fn dispatch_mut<F, S>(
    cif: *mut raw::ffi_cif,
    ret: *mut c_void,
    args: *mut *mut c_void,
    user_data: *mut c_void,
) where
    F: Callable<S>,
    S: CallSignature,
{
    if user_data.is_null() {
        return;
    }
    let Some(cx) = DispatchContext::new::<S>(cif, ret, args) else {
        return;
    };

    trace!(closure = type_name::<F>(), "dispatching call");
    let payload = &mut *user_data.cast::<F>();
    match panic::catch_unwind(AssertUnwindSafe(|| payload.call_mut(&cx))) {
        Ok(value) => cx.finish(value),
        Err(cause) => uncaught_failure::<F>(cause),
    }
}

/// Callback for `Fn + Sync` payloads; may run on many threads at once
///
/// # Safety
///
/// `user_data` must be the payload of a live handle built for `F` and `S`.
pub(crate) unsafe extern "C" fn dispatch_shared<F, S>(
    cif: *mut raw::ffi_cif,
    ret: *mut c_void,
    args: *mut *mut c_void,
    user_data: *mut c_void,
) where
    F: CallableShared<S> + Sync,
    S: CallSignature,
{
    if user_data.is_null() {
        return;
    }
    let Some(cx) = DispatchContext::new::<S>(cif, ret, args) else {
        return;
    };

    trace!(closure = type_name::<F>(), "dispatching shared call");
    let payload = &*user_data.cast::<F>().cast_const();
    match panic::catch_unwind(AssertUnwindSafe(|| payload.call(&cx))) {
        Ok(value) => cx.finish(value),
        Err(cause) => uncaught_failure::<F>(cause),
    }
}

#[cold]
fn uncaught_failure<F>(cause: Box<dyn Any + Send>) -> ! {
    let message = cause
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| cause.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload");

    error!(
        closure = type_name::<F>(),
        panic = message,
        "uncaught failure in wrapped closure, aborting"
    );
    process::abort()
}
