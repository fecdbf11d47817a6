//! Signature extraction
//!
//! The call signature of a closure is read off its type. Each supported
//! arity gets one impl of [`CallSignature`] for the function pointer type and
//! one impl of [`Callable`]/[`CallableShared`] for every closure with the
//! matching `FnMut`/`Fn` shape. A closure implements `FnMut` for exactly one
//! argument list, so exactly one impl applies and the compiler infers the
//! pointer type from it.

use crate::dispatch::DispatchContext;
use crate::error::{ClosureResult, PreparationError};
use crate::types::{Describe, FfiArg, FfiReturn, TypeDescriptor};
use libffi::raw;
use std::ffi::c_void;
use std::fmt;
use std::mem;

/// Largest number of parameters a generated function pointer may take
pub const MAX_ARITY: usize = 16;

/// Calling convention used by a call interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Abi(raw::ffi_abi);

impl Abi {
    /// The platform's default convention for plain C function pointers
    pub const DEFAULT: Abi = Abi(raw::ffi_abi_FFI_DEFAULT_ABI);

    /// Wrap a raw libffi ABI number. Unsupported values are rejected when the
    /// call interface is prepared, not here.
    pub const fn from_raw(raw: raw::ffi_abi) -> Self {
        Abi(raw)
    }

    pub const fn as_raw(self) -> raw::ffi_abi {
        self.0
    }
}

impl Default for Abi {
    fn default() -> Self {
        Abi::DEFAULT
    }
}

impl fmt::Display for Abi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Abi::DEFAULT {
            write!(f, "default")
        } else {
            write!(f, "abi {}", self.0)
        }
    }
}

/// Argument descriptors, return descriptor and calling convention
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    args: Vec<TypeDescriptor>,
    ret: TypeDescriptor,
    abi: Abi,
}

impl Signature {
    /// Build a signature at runtime
    ///
    /// Rejects `void` arguments and more than [`MAX_ARITY`] parameters.
    pub fn new(args: Vec<TypeDescriptor>, ret: TypeDescriptor) -> ClosureResult<Self> {
        let signature = Self::from_parts(args, ret);
        signature.validate()?;
        Ok(signature)
    }

    /// Used by the per-arity impls, whose argument types can never be void
    pub(crate) fn from_parts(args: Vec<TypeDescriptor>, ret: TypeDescriptor) -> Self {
        Self {
            args,
            ret,
            abi: Abi::DEFAULT,
        }
    }

    pub(crate) fn validate(&self) -> ClosureResult<()> {
        if self.args.len() > MAX_ARITY {
            return Err(PreparationError::TooManyArguments {
                count: self.args.len(),
                max: MAX_ARITY,
            }
            .into());
        }

        if let Some(index) = self.args.iter().position(TypeDescriptor::is_void) {
            return Err(PreparationError::VoidArgument { index }.into());
        }

        Ok(())
    }

    pub fn with_abi(mut self, abi: Abi) -> Self {
        self.abi = abi;
        self
    }

    pub fn args(&self) -> &[TypeDescriptor] {
        &self.args
    }

    pub fn ret(&self) -> &TypeDescriptor {
        &self.ret
    }

    pub fn abi(&self) -> Abi {
        self.abi
    }

    pub fn arity(&self) -> usize {
        self.args.len()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ") -> {}", self.ret)?;
        if self.abi != Abi::DEFAULT {
            write!(f, " [{}]", self.abi)?;
        }
        Ok(())
    }
}

/// A C function pointer type a closure can be turned into
///
/// Implemented for `unsafe extern "C" fn(A1, .., An) -> R` for `n` up to
/// [`MAX_ARITY`], where every `Ai` is [`FfiArg`] and `R` is [`FfiReturn`].
///
/// # Safety
///
/// `signature` must describe `Self` exactly, and `from_code_ptr` must be a
/// plain reinterpretation of the address.
pub unsafe trait CallSignature: Copy + 'static {
    type Output: FfiReturn;

    const ARITY: usize;

    fn signature() -> Signature;

    /// Reinterpret generated code as this pointer type
    ///
    /// # Safety
    ///
    /// `code` must be executable code that implements `Self`'s signature.
    unsafe fn from_code_ptr(code: *mut c_void) -> Self;
}

/// A closure that can service calls made through `S`
pub trait Callable<S: CallSignature> {
    /// Read the arguments out of `cx` and call the closure
    ///
    /// # Safety
    ///
    /// `cx` must hold `S::ARITY` valid argument cells of the right types.
    unsafe fn call_mut(&mut self, cx: &DispatchContext<'_>) -> S::Output;
}

/// A closure that can service calls made through `S` from many threads at once
pub trait CallableShared<S: CallSignature>: Callable<S> {
    /// # Safety
    ///
    /// Same contract as [`Callable::call_mut`].
    unsafe fn call(&self, cx: &DispatchContext<'_>) -> S::Output;
}

macro_rules! impl_signature {
    (@unit $arg:ident) => {
        ()
    };
    ($($arg:ident $idx:tt),*) => {
        unsafe impl<Ret $(, $arg)*> CallSignature for unsafe extern "C" fn($($arg),*) -> Ret
        where
            Ret: FfiReturn + 'static,
            $($arg: FfiArg + 'static,)*
        {
            type Output = Ret;

            const ARITY: usize = <[()]>::len(&[$(impl_signature!(@unit $arg)),*]);

            fn signature() -> Signature {
                Signature::from_parts(
                    vec![$(<$arg as Describe>::describe()),*],
                    Ret::describe_return(),
                )
            }

            unsafe fn from_code_ptr(code: *mut c_void) -> Self {
                mem::transmute_copy::<*mut c_void, Self>(&code)
            }
        }

        impl<Func, Ret $(, $arg)*> Callable<unsafe extern "C" fn($($arg),*) -> Ret> for Func
        where
            Func: FnMut($($arg),*) -> Ret,
            Ret: FfiReturn + 'static,
            $($arg: FfiArg + 'static,)*
        {
            #[allow(unused_variables)]
            unsafe fn call_mut(&mut self, cx: &DispatchContext<'_>) -> Ret {
                (*self)($(cx.arg::<$arg>($idx)),*)
            }
        }

        impl<Func, Ret $(, $arg)*> CallableShared<unsafe extern "C" fn($($arg),*) -> Ret> for Func
        where
            Func: Fn($($arg),*) -> Ret,
            Ret: FfiReturn + 'static,
            $($arg: FfiArg + 'static,)*
        {
            #[allow(unused_variables)]
            unsafe fn call(&self, cx: &DispatchContext<'_>) -> Ret {
                (*self)($(cx.arg::<$arg>($idx)),*)
            }
        }
    };
}

impl_signature!();
impl_signature!(A 0);
impl_signature!(A 0, B 1);
impl_signature!(A 0, B 1, C 2);
impl_signature!(A 0, B 1, C 2, D 3);
impl_signature!(A 0, B 1, C 2, D 3, E 4);
impl_signature!(A 0, B 1, C 2, D 3, E 4, F 5);
impl_signature!(A 0, B 1, C 2, D 3, E 4, F 5, G 6);
impl_signature!(A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7);
impl_signature!(A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8);
impl_signature!(A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8, J 9);
impl_signature!(A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8, J 9, K 10);
impl_signature!(A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8, J 9, K 10, L 11);
impl_signature!(A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8, J 9, K 10, L 11, M 12);
impl_signature!(A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8, J 9, K 10, L 11, M 12, N 13);
impl_signature!(A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8, J 9, K 10, L 11, M 12, N 13, O 14);
impl_signature!(A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8, J 9, K 10, L 11, M 12, N 13, O 14, P 15);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClosureError;
    use crate::types::Scalar;

    type Binary = unsafe extern "C" fn(i32, f64);

    #[test]
    fn test_arity_matches_parameter_count() {
        assert_eq!(<unsafe extern "C" fn() as CallSignature>::ARITY, 0);
        assert_eq!(<Binary as CallSignature>::ARITY, 2);
        assert_eq!(
            <unsafe extern "C" fn(u8, u8, u8, u8, u8, u8, u8, u8, u8, u8, u8, u8, u8, u8, u8, u8) -> u8 as CallSignature>::ARITY,
            MAX_ARITY
        );
    }

    #[test]
    fn test_extracted_signature_keeps_declaration_order() {
        let signature = <Binary as CallSignature>::signature();
        assert_eq!(signature.args(), &[i32::describe(), f64::describe()]);
        assert!(signature.ret().is_void());
        assert_eq!(signature.abi(), Abi::DEFAULT);
        assert_eq!(signature.to_string(), "(i32, f64) -> void");
    }

    #[test]
    fn test_runtime_signature_rejects_void_argument() {
        let err = Signature::new(
            vec![i32::describe(), TypeDescriptor::VOID],
            TypeDescriptor::VOID,
        )
        .unwrap_err();
        assert_eq!(
            err,
            ClosureError::InterfacePreparation(PreparationError::VoidArgument { index: 1 })
        );
    }

    #[test]
    fn test_runtime_signature_rejects_too_many_arguments() {
        let args = vec![TypeDescriptor::Scalar(Scalar::I64); MAX_ARITY + 1];
        let err = Signature::new(args, TypeDescriptor::VOID).unwrap_err();
        assert_eq!(
            err.to_string(),
            "could not prepare call interface: 17 arguments exceed the supported maximum of 16"
        );
    }

    #[test]
    fn test_non_default_abi_is_shown() {
        let signature = Signature::new(vec![], i32::describe())
            .unwrap()
            .with_abi(Abi::from_raw(0xFFFF));
        assert_eq!(signature.to_string(), "() -> i32 [abi 65535]");
        assert_eq!(Abi::default().to_string(), "default");
    }
}
