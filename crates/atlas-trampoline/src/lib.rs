//! Atlas Trampoline
//!
//! Turns capturing Rust closures into bare C function pointers, for APIs that
//! take a callback but give it no user-data slot (signal handlers, callback
//! registries, plugin hooks).
//!
//! Every wrapped closure gets its own piece of generated code from libffi. The
//! code recovers the closure's state and forwards the call into it. The
//! pointer stays valid exactly as long as the owning [`Closure`] handle lives.
//!
//! # Example
//!
//! ```
//! let mut calls = 0;
//! let counter = atlas_trampoline::wrap(|| -> i32 {
//!     calls += 1;
//!     calls
//! })
//! .unwrap();
//!
//! let next: unsafe extern "C" fn() -> i32 = counter.pointer();
//! assert_eq!(unsafe { [next(), next(), next()] }, [1, 2, 3]);
//! ```
//!
//! # Supported types
//!
//! Arguments and return values must have a C layout libffi can describe: the
//! fixed-width integers, `isize`/`usize`, `bool`, `f32`, `f64`, raw pointers,
//! C function pointers and structs declared with [`ffi_struct!`]. Anything
//! else is rejected at compile time:
//!
//! ```compile_fail
//! let c = atlas_trampoline::wrap(|s: String| s.len() as i32);
//! ```
//!
//! ```compile_fail
//! let c = atlas_trampoline::wrap(|c: char| c as u32);
//! ```
//!
//! ```compile_fail
//! let c = atlas_trampoline::wrap(|| -> u128 { 0 });
//! ```
//!
//! C may pass NULL for any pointer, so function pointer parameters are taken
//! as `Option<extern "C" fn(..)>`:
//!
//! ```compile_fail
//! let c = atlas_trampoline::wrap(|cb: extern "C" fn()| cb());
//! ```
//!
//! A value whose call signature cannot be determined is rejected too:
//!
//! ```compile_fail
//! let c = atlas_trampoline::wrap(|x| x);
//! ```
//!
//! ```compile_fail
//! let not_callable = 42;
//! let c = atlas_trampoline::wrap(not_callable);
//! ```
//!
//! # Failures inside a closure
//!
//! A panic cannot unwind through the C frames that called the pointer. It is
//! logged through `tracing` and the process is aborted.

pub mod cif;
pub mod closure;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod signature;
pub mod trampoline;
pub mod types;

pub use closure::{Closure, ClosureBuilder};
pub use config::{AbiSetting, ConfigError, ConfigResult, TrampolineConfig};
pub use error::{ClosureError, ClosureResult, FfiStatus, PreparationError};
pub use signature::{Abi, CallSignature, Callable, CallableShared, Signature, MAX_ARITY};
pub use types::{Describe, FfiArg, FfiReturn, Scalar, TypeDescriptor};

/// Wrap an `FnMut` closure; see [`Closure::new`]
pub fn wrap<F, S>(payload: F) -> ClosureResult<Closure<F, S>>
where
    F: Callable<S>,
    S: CallSignature,
{
    Closure::new(payload)
}

/// Wrap an `Fn + Sync` closure; see [`Closure::new_shared`]
pub fn wrap_shared<F, S>(payload: F) -> ClosureResult<Closure<F, S>>
where
    F: CallableShared<S> + Sync,
    S: CallSignature,
{
    Closure::new_shared(payload)
}
