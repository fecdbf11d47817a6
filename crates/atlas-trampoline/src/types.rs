//! Type descriptor table
//!
//! Maps the Rust types that may cross the C boundary to the `ffi_type`
//! records libffi uses to marshal them:
//! - fixed-width integers, `isize`/`usize` and `bool` → libffi's integer types
//! - `f32`/`f64` → `float`/`double`
//! - raw pointers, `Option<NonNull<T>>` and C function pointers → `pointer`;
//!   function pointer arguments must be `Option<..>` since C may pass NULL
//! - `#[repr(C)]` structs declared with [`ffi_struct!`](crate::ffi_struct) and
//!   fixed-size arrays inside them → aggregate records built once per type
//!
//! Anything else has no impl and fails to compile where it is used. Nothing is
//! widened, narrowed or guessed.

use libffi::raw;
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// Value categories with a fixed libffi record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scalar {
    Void,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    Pointer,
}

impl Scalar {
    /// Pointer to libffi's static record for this category
    pub fn as_raw_ptr(self) -> *mut raw::ffi_type {
        match self {
            Scalar::Void => ptr::addr_of_mut!(raw::ffi_type_void),
            Scalar::U8 => ptr::addr_of_mut!(raw::ffi_type_uint8),
            Scalar::I8 => ptr::addr_of_mut!(raw::ffi_type_sint8),
            Scalar::U16 => ptr::addr_of_mut!(raw::ffi_type_uint16),
            Scalar::I16 => ptr::addr_of_mut!(raw::ffi_type_sint16),
            Scalar::U32 => ptr::addr_of_mut!(raw::ffi_type_uint32),
            Scalar::I32 => ptr::addr_of_mut!(raw::ffi_type_sint32),
            Scalar::U64 => ptr::addr_of_mut!(raw::ffi_type_uint64),
            Scalar::I64 => ptr::addr_of_mut!(raw::ffi_type_sint64),
            Scalar::F32 => ptr::addr_of_mut!(raw::ffi_type_float),
            Scalar::F64 => ptr::addr_of_mut!(raw::ffi_type_double),
            Scalar::Pointer => ptr::addr_of_mut!(raw::ffi_type_pointer),
        }
    }

    /// Short display name
    pub fn name(self) -> &'static str {
        match self {
            Scalar::Void => "void",
            Scalar::U8 => "u8",
            Scalar::I8 => "i8",
            Scalar::U16 => "u16",
            Scalar::I16 => "i16",
            Scalar::U32 => "u32",
            Scalar::I32 => "i32",
            Scalar::U64 => "u64",
            Scalar::I64 => "i64",
            Scalar::F32 => "f32",
            Scalar::F64 => "f64",
            Scalar::Pointer => "pointer",
        }
    }
}

/// A struct or array layout owned by this crate
///
/// Size and alignment are filled in from the Rust layout up front, so libffi
/// treats the record as already initialized and never writes to it. That is
/// what makes sharing one record between threads and call interfaces sound.
pub struct Aggregate {
    name: &'static str,
    raw: NonNull<raw::ffi_type>,
    /// Null-terminated element list `raw.elements` points into
    elements: NonNull<[*mut raw::ffi_type]>,
    /// Keeps nested aggregates alive
    members: Vec<TypeDescriptor>,
}

// SAFETY: immutable after construction; the raw pointers refer to heap cells
// owned by this value or to libffi statics.
unsafe impl Send for Aggregate {}
unsafe impl Sync for Aggregate {}

impl Aggregate {
    fn new(name: &'static str, size: usize, align: usize, members: Vec<TypeDescriptor>) -> Self {
        let mut elements: Vec<*mut raw::ffi_type> =
            members.iter().map(TypeDescriptor::as_raw_ptr).collect();
        elements.push(ptr::null_mut());
        let elements = NonNull::from(Box::leak(elements.into_boxed_slice()));

        let raw = Box::new(raw::ffi_type {
            size,
            alignment: align as u16,
            type_: raw::FFI_TYPE_STRUCT as u16,
            elements: elements.cast::<*mut raw::ffi_type>().as_ptr(),
        });

        Self {
            name,
            raw: NonNull::from(Box::leak(raw)),
            elements,
            members,
        }
    }
}

impl Drop for Aggregate {
    fn drop(&mut self) {
        // SAFETY: both cells were leaked from boxes in `new` and are freed once
        unsafe {
            drop(Box::from_raw(self.raw.as_ptr()));
            drop(Box::from_raw(self.elements.as_ptr()));
        }
    }
}

/// ABI description of one value
#[derive(Clone)]
pub enum TypeDescriptor {
    Scalar(Scalar),
    Aggregate(Arc<Aggregate>),
}

impl TypeDescriptor {
    pub const VOID: TypeDescriptor = TypeDescriptor::Scalar(Scalar::Void);

    /// The record libffi reads
    pub fn as_raw_ptr(&self) -> *mut raw::ffi_type {
        match self {
            TypeDescriptor::Scalar(scalar) => scalar.as_raw_ptr(),
            TypeDescriptor::Aggregate(aggregate) => aggregate.raw.as_ptr(),
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, TypeDescriptor::Scalar(Scalar::Void))
    }

    pub fn name(&self) -> &'static str {
        match self {
            TypeDescriptor::Scalar(scalar) => scalar.name(),
            TypeDescriptor::Aggregate(aggregate) => aggregate.name,
        }
    }

    /// Member descriptors of an aggregate, empty for scalars
    pub fn members(&self) -> &[TypeDescriptor] {
        match self {
            TypeDescriptor::Scalar(_) => &[],
            TypeDescriptor::Aggregate(aggregate) => &aggregate.members,
        }
    }

    /// Size in bytes as recorded for libffi
    pub fn size(&self) -> usize {
        // SAFETY: scalar records are libffi statics, aggregates are owned and live
        unsafe { (*self.as_raw_ptr()).size }
    }
}

impl PartialEq for TypeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TypeDescriptor::Scalar(a), TypeDescriptor::Scalar(b)) => a == b,
            (TypeDescriptor::Aggregate(a), TypeDescriptor::Aggregate(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for TypeDescriptor {}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDescriptor::Scalar(scalar) => write!(f, "Scalar({})", scalar.name()),
            TypeDescriptor::Aggregate(aggregate) => f
                .debug_struct("Aggregate")
                .field("name", &aggregate.name)
                .field("members", &aggregate.members)
                .finish(),
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Canonical aggregate descriptor for `T`, built on first use
///
/// Used by [`ffi_struct!`](crate::ffi_struct) and the array impls. Members are
/// described outside the cache lock because describing them may recurse.
#[doc(hidden)]
pub fn aggregate<T: 'static>(members: impl FnOnce() -> Vec<TypeDescriptor>) -> TypeDescriptor {
    static CANONICAL: OnceLock<Mutex<HashMap<TypeId, TypeDescriptor>>> = OnceLock::new();

    let table = CANONICAL.get_or_init(Default::default);
    let id = TypeId::of::<T>();

    if let Some(found) = table
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&id)
    {
        return found.clone();
    }

    let built = TypeDescriptor::Aggregate(Arc::new(Aggregate::new(
        type_name::<T>(),
        mem::size_of::<T>(),
        mem::align_of::<T>(),
        members(),
    )));

    table
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(id)
        .or_insert(built)
        .clone()
}

/// A Rust type with a C layout libffi can describe
///
/// # Safety
///
/// `describe` must return a descriptor whose size, alignment and member
/// layout match `Self` exactly.
pub unsafe trait Describe {
    fn describe() -> TypeDescriptor;
}

/// A type that may be passed by value through a generated function pointer
///
/// # Safety
///
/// Every bit pattern the C side may pass for the described type must be a
/// valid `Self`.
pub unsafe trait FfiArg: Describe + Copy {}

/// A type that may be returned through a generated function pointer; `()` is `void`
///
/// # Safety
///
/// `write_return` must write exactly the representation libffi expects for
/// the descriptor returned by `describe_return`.
pub unsafe trait FfiReturn: Sized {
    const IS_VOID: bool = false;

    fn describe_return() -> TypeDescriptor;

    /// Store `self` into libffi's return buffer
    ///
    /// # Safety
    ///
    /// `ret` must point to a return buffer prepared by libffi for this type.
    unsafe fn write_return(self, ret: *mut c_void) {
        ret.cast::<Self>().write(self);
    }
}

unsafe impl FfiReturn for () {
    const IS_VOID: bool = true;

    fn describe_return() -> TypeDescriptor {
        TypeDescriptor::VOID
    }

    unsafe fn write_return(self, _ret: *mut c_void) {}
}

macro_rules! impl_scalar {
    ($($ty:ty => $scalar:ident),* $(,)?) => {$(
        unsafe impl Describe for $ty {
            fn describe() -> TypeDescriptor {
                TypeDescriptor::Scalar(Scalar::$scalar)
            }
        }

        unsafe impl FfiArg for $ty {}
    )*};
}

impl_scalar! {
    u8 => U8,
    i8 => I8,
    u16 => U16,
    i16 => I16,
    u32 => U32,
    i32 => I32,
    u64 => U64,
    i64 => I64,
    f32 => F32,
    f64 => F64,
    bool => U8,
}

#[cfg(target_pointer_width = "64")]
impl_scalar!(usize => U64, isize => I64);

#[cfg(target_pointer_width = "32")]
impl_scalar!(usize => U32, isize => I32);

// libffi requires integral results narrower than a register to be stored as a
// full `ffi_arg`/`ffi_sarg`.
macro_rules! impl_integral_return {
    ($($ty:ty => $wide:ty),* $(,)?) => {$(
        unsafe impl FfiReturn for $ty {
            fn describe_return() -> TypeDescriptor {
                <$ty as Describe>::describe()
            }

            #[allow(clippy::unnecessary_cast)]
            unsafe fn write_return(self, ret: *mut c_void) {
                if mem::size_of::<$ty>() < mem::size_of::<$wide>() {
                    ret.cast::<$wide>().write(self as $wide);
                } else {
                    ret.cast::<$ty>().write(self);
                }
            }
        }
    )*};
}

impl_integral_return! {
    u8 => raw::ffi_arg,
    i8 => raw::ffi_sarg,
    u16 => raw::ffi_arg,
    i16 => raw::ffi_sarg,
    u32 => raw::ffi_arg,
    i32 => raw::ffi_sarg,
    u64 => raw::ffi_arg,
    i64 => raw::ffi_sarg,
    usize => raw::ffi_arg,
    isize => raw::ffi_sarg,
    bool => raw::ffi_arg,
}

unsafe impl FfiReturn for f32 {
    fn describe_return() -> TypeDescriptor {
        TypeDescriptor::Scalar(Scalar::F32)
    }
}

unsafe impl FfiReturn for f64 {
    fn describe_return() -> TypeDescriptor {
        TypeDescriptor::Scalar(Scalar::F64)
    }
}

macro_rules! impl_pointer_like {
    ($(impl<$($gen:ident),*> for $ty:ty;)*) => {$(
        unsafe impl<$($gen),*> Describe for $ty {
            fn describe() -> TypeDescriptor {
                TypeDescriptor::Scalar(Scalar::Pointer)
            }
        }

        unsafe impl<$($gen),*> FfiArg for $ty {}

        unsafe impl<$($gen),*> FfiReturn for $ty {
            fn describe_return() -> TypeDescriptor {
                TypeDescriptor::Scalar(Scalar::Pointer)
            }
        }
    )*};
}

macro_rules! impl_fn_return {
    ($(impl<$($gen:ident),*> for $ty:ty;)*) => {$(
        unsafe impl<$($gen),*> Describe for $ty {
            fn describe() -> TypeDescriptor {
                TypeDescriptor::Scalar(Scalar::Pointer)
            }
        }

        unsafe impl<$($gen),*> FfiReturn for $ty {
            fn describe_return() -> TypeDescriptor {
                TypeDescriptor::Scalar(Scalar::Pointer)
            }
        }
    )*};
}

impl_pointer_like! {
    impl<T> for *const T;
    impl<T> for *mut T;
    impl<T> for Option<NonNull<T>>;
}

// A non-null Rust fn pointer cannot hold the NULL the C side may pass for a
// `pointer` parameter, so only the `Option` forms are accepted as arguments.
macro_rules! impl_fn_pointers {
    ($($arg:ident),*) => {
        impl_pointer_like! {
            impl<Ret $(, $arg)*> for Option<extern "C" fn($($arg),*) -> Ret>;
            impl<Ret $(, $arg)*> for Option<unsafe extern "C" fn($($arg),*) -> Ret>;
        }

        impl_fn_return! {
            impl<Ret $(, $arg)*> for extern "C" fn($($arg),*) -> Ret;
            impl<Ret $(, $arg)*> for unsafe extern "C" fn($($arg),*) -> Ret;
        }
    };
}

impl_fn_pointers!();
impl_fn_pointers!(A);
impl_fn_pointers!(A, B);
impl_fn_pointers!(A, B, C);
impl_fn_pointers!(A, B, C, D);
impl_fn_pointers!(A, B, C, D, E);
impl_fn_pointers!(A, B, C, D, E, F);

struct NonEmpty<const N: usize>;

impl<const N: usize> NonEmpty<N> {
    const CHECK: () = assert!(N > 0, "zero-length arrays have no C layout");
}

/// Arrays are only describable as struct members; C passes array parameters
/// as pointers.
unsafe impl<T: Describe + 'static, const N: usize> Describe for [T; N] {
    fn describe() -> TypeDescriptor {
        #[allow(clippy::let_unit_value)]
        let () = NonEmpty::<N>::CHECK;
        aggregate::<Self>(|| (0..N).map(|_| T::describe()).collect())
    }
}

/// Declare a `#[repr(C)]` struct that can cross the C boundary by value
///
/// Every field type must itself be describable. The struct must derive
/// `Clone` and `Copy` to be used as an argument.
///
/// ```
/// atlas_trampoline::ffi_struct! {
///     #[derive(Debug, Clone, Copy, PartialEq)]
///     pub struct Point {
///         pub x: i32,
///         pub y: f32,
///     }
/// }
///
/// use atlas_trampoline::Describe;
/// assert_eq!(Point::describe().members().len(), 2);
/// ```
#[macro_export]
macro_rules! ffi_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $($(#[$field_meta:meta])* $field_vis:vis $field:ident : $ty:ty),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(C)]
        $vis struct $name {
            $($(#[$field_meta])* $field_vis $field: $ty),+
        }

        $crate::impl_ffi_struct!(unsafe $name { $($ty),+ });
    };
}

/// Describe an existing struct by its field types, in declaration order
///
/// The `unsafe` keyword is part of the syntax: the struct must be
/// `#[repr(C)]` and the list must match its fields exactly.
#[macro_export]
macro_rules! impl_ffi_struct {
    (unsafe $name:ty { $($ty:ty),+ $(,)? }) => {
        unsafe impl $crate::Describe for $name {
            fn describe() -> $crate::TypeDescriptor {
                $crate::types::aggregate::<Self>(|| {
                    ::std::vec![$(<$ty as $crate::Describe>::describe()),+]
                })
            }
        }

        unsafe impl $crate::FfiArg for $name {}

        unsafe impl $crate::FfiReturn for $name {
            fn describe_return() -> $crate::TypeDescriptor {
                <Self as $crate::Describe>::describe()
            }
        }
    };
}
