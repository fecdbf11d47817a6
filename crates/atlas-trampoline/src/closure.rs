//! Closure handles
//!
//! A [`Closure`] owns everything behind one generated function pointer: the
//! boxed payload, its call interface and the trampoline memory. The pointer
//! is valid exactly as long as the handle is alive.

use crate::cif::CallInterface;
use crate::config::{ConfigResult, TrampolineConfig};
use crate::dispatch::{dispatch_mut, dispatch_shared, Entry};
use crate::error::ClosureResult;
use crate::signature::{Abi, CallSignature, Callable, CallableShared, Signature};
use crate::trampoline::TrampolineMemory;
use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr::{self, NonNull};
use tracing::debug;

/// Owning handle for a closure exposed as a C function pointer of type `S`
///
/// ```
/// use atlas_trampoline::Closure;
///
/// let k = 10;
/// let add_k = Closure::new(move |x: i32| x + k).unwrap();
/// let f: unsafe extern "C" fn(i32) -> i32 = add_k.pointer();
/// assert_eq!(unsafe { f(5) }, 15);
/// ```
pub struct Closure<F, S: CallSignature> {
    // Freed first: nothing may enter the payload once it starts dropping.
    trampoline: ManuallyDrop<TrampolineMemory>,
    payload: NonNull<F>,
    interface: CallInterface,
    pointer: S,
    _owns: PhantomData<F>,
}

// SAFETY: the handle owns `F` outright. Calling the pointer is unsafe and
// carries its own threading contract.
unsafe impl<F: Send, S: CallSignature> Send for Closure<F, S> {}
unsafe impl<F: Sync, S: CallSignature> Sync for Closure<F, S> {}

impl<F, S: CallSignature> Closure<F, S> {
    /// Wrap an `FnMut` closure
    ///
    /// The returned pointer must not be called while another call through it
    /// is still running.
    pub fn new(payload: F) -> ClosureResult<Self>
    where
        F: Callable<S>,
    {
        ClosureBuilder::new().build(payload)
    }

    /// Wrap an `Fn + Sync` closure whose pointer may be called from many
    /// threads at once
    pub fn new_shared(payload: F) -> ClosureResult<Self>
    where
        F: CallableShared<S> + Sync,
    {
        ClosureBuilder::new().build_shared(payload)
    }

    fn assemble(payload: F, entry: Entry, options: &ClosureBuilder) -> ClosureResult<Self> {
        let interface = CallInterface::new(S::signature().with_abi(options.abi))?;
        let trampoline = TrampolineMemory::allocate(options.serialize_allocation)?;

        // SAFETY: the code implements `S` once bound below, and `pointer` is
        // only handed out after that succeeds.
        let pointer = unsafe { S::from_code_ptr(trampoline.executable()) };

        let mut closure = Self {
            trampoline: ManuallyDrop::new(trampoline),
            payload: NonNull::from(Box::leak(Box::new(payload))),
            interface,
            pointer,
            _owns: PhantomData,
        };

        // SAFETY: payload and interface are heap cells owned by `closure` and
        // released only after the trampoline (see Drop).
        unsafe {
            let user_data = closure.payload.as_ptr().cast::<c_void>();
            closure
                .trampoline
                .bind(&closure.interface, entry, user_data)?;
        }

        debug!(
            signature = %closure.interface.signature(),
            code = ?closure.code_ptr(),
            "wrapped closure"
        );
        Ok(closure)
    }

    /// The generated function pointer
    ///
    /// Always the same address for a given handle. Calling it is only sound
    /// while the handle is alive.
    pub fn pointer(&self) -> S {
        self.pointer
    }

    /// The generated code address as an untyped pointer
    pub fn code_ptr(&self) -> *const c_void {
        self.trampoline.executable().cast_const()
    }

    pub fn signature(&self) -> &Signature {
        self.interface.signature()
    }

    pub fn payload(&self) -> &F {
        // SAFETY: owned by self and only aliased by calls through the pointer,
        // which the caller must not make concurrently with this borrow
        unsafe { self.payload.as_ref() }
    }

    pub fn payload_mut(&mut self) -> &mut F {
        // SAFETY: as for `payload`; `&mut self` excludes other borrows
        unsafe { self.payload.as_mut() }
    }

    /// Release the generated code and give the closure back
    pub fn into_payload(self) -> F {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: each field is released exactly once, trampoline first, and
        // `this` is never dropped as a whole.
        unsafe {
            ManuallyDrop::drop(&mut this.trampoline);
            let payload = *Box::from_raw(this.payload.as_ptr());
            ptr::drop_in_place(&mut this.interface);
            payload
        }
    }
}

impl<F, S: CallSignature> Drop for Closure<F, S> {
    fn drop(&mut self) {
        let code = self.code_ptr();
        // SAFETY: the trampoline goes first so no call can reach the payload
        // while it is being dropped. The payload box was leaked in `assemble`.
        unsafe {
            ManuallyDrop::drop(&mut self.trampoline);
            drop(Box::from_raw(self.payload.as_ptr()));
        }
        debug!(code = ?code, "released closure");
    }
}

impl<F, S: CallSignature> fmt::Debug for Closure<F, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure")
            .field("signature", &self.signature().to_string())
            .field("code", &self.code_ptr())
            .finish()
    }
}

/// Options for building [`Closure`]s
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosureBuilder {
    abi: Abi,
    serialize_allocation: bool,
}

impl ClosureBuilder {
    pub fn new() -> Self {
        Self {
            abi: Abi::DEFAULT,
            serialize_allocation: false,
        }
    }

    /// Builder with the settings of a loaded configuration
    pub fn from_config(config: &TrampolineConfig) -> ConfigResult<Self> {
        Ok(Self {
            abi: config.resolve_abi()?,
            serialize_allocation: config.serialize_allocation,
        })
    }

    /// Calling convention of the generated pointers
    pub fn abi(mut self, abi: Abi) -> Self {
        self.abi = abi;
        self
    }

    /// Take a process-wide lock around trampoline allocation and release
    pub fn serialize_allocation(mut self, serialize: bool) -> Self {
        self.serialize_allocation = serialize;
        self
    }

    pub fn build<F, S>(&self, payload: F) -> ClosureResult<Closure<F, S>>
    where
        F: Callable<S>,
        S: CallSignature,
    {
        Closure::assemble(payload, dispatch_mut::<F, S>, self)
    }

    pub fn build_shared<F, S>(&self, payload: F) -> ClosureResult<Closure<F, S>>
    where
        F: CallableShared<S> + Sync,
        S: CallSignature,
    {
        Closure::assemble(payload, dispatch_shared::<F, S>, self)
    }
}

impl Default for ClosureBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ClosureError, FfiStatus, PreparationError};
    use std::cell::Cell;
    use std::rc::Rc;

    struct DropFlag(Rc<Cell<usize>>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn test_pointer_is_stable() {
        let c = Closure::new(|x: u32| x * 2).unwrap();
        let first = c.pointer() as usize;
        assert_eq!(c.pointer() as usize, first);
        assert_eq!(c.code_ptr() as usize, first);
        assert_eq!(c.signature().to_string(), "(u32) -> u32");
    }

    #[test]
    fn test_payload_access() {
        let mut c = Closure::new({
            let mut total = 0i64;
            move |x: i64| {
                total += x;
                total
            }
        })
        .unwrap();

        let f = c.pointer();
        unsafe {
            assert_eq!(f(4), 4);
            assert_eq!(f(6), 10);
        }
        assert_eq!((c.payload_mut())(5), 15);
        assert_eq!(unsafe { f(1) }, 16);
    }

    #[test]
    fn test_drop_releases_payload_once() {
        let drops = Rc::new(Cell::new(0));
        let flag = DropFlag(drops.clone());
        let c = Closure::new(move || {
            let _ = &flag;
        })
        .unwrap();

        unsafe { (c.pointer())() };
        assert_eq!(drops.get(), 0);
        drop(c);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn test_into_payload_returns_closure() {
        let drops = Rc::new(Cell::new(0));
        let flag = DropFlag(drops.clone());
        let c = Closure::new(move |x: i32| {
            let _ = &flag;
            x + 1
        })
        .unwrap();

        let f = c.into_payload();
        assert_eq!(drops.get(), 0);
        assert_eq!(f(1), 2);
        drop(f);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn test_bad_abi_drops_payload() {
        let drops = Rc::new(Cell::new(0));
        let flag = DropFlag(drops.clone());
        let err = ClosureBuilder::new()
            .abi(Abi::from_raw(0xFFFF))
            .build(move |x: i32| {
                let _ = &flag;
                x
            })
            .unwrap_err();

        assert_eq!(
            err,
            ClosureError::InterfacePreparation(PreparationError::Rejected {
                function: "ffi_prep_cif",
                status: FfiStatus::BadAbi,
            })
        );
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn test_builder_defaults() {
        let builder = ClosureBuilder::default();
        assert_eq!(builder, ClosureBuilder::new());
        let c = builder
            .serialize_allocation(true)
            .build_shared(|a: f32, b: f32| a * b)
            .unwrap();
        assert_eq!(unsafe { (c.pointer())(1.5, 4.0) }, 6.0);
    }
}
