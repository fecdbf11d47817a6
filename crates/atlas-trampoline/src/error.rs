//! Errors reported while wrapping a closure
//!
//! Only construction can fail at runtime. Unsupported types and ambiguous
//! signatures are rejected by the trait system before any of these values can
//! exist, and failures inside a wrapped closure abort the process instead of
//! being reported (see [`crate::dispatch`]).

use libffi::raw;
use std::fmt;
use thiserror::Error;

/// Status codes libffi reports from its preparation calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FfiStatus {
    /// `FFI_BAD_TYPEDEF`: a type descriptor is malformed
    BadTypedef,
    /// `FFI_BAD_ABI`: the calling convention is not supported on this target
    BadAbi,
    /// `FFI_BAD_ARGTYPE`: an argument type cannot be passed by this ABI
    BadArgType,
    /// Any status this crate does not know by name
    Unknown(u32),
}

impl FfiStatus {
    /// Convert a raw libffi status, returning `None` for `FFI_OK`
    pub(crate) fn from_raw(status: raw::ffi_status) -> Option<Self> {
        match status {
            raw::ffi_status_FFI_OK => None,
            raw::ffi_status_FFI_BAD_TYPEDEF => Some(FfiStatus::BadTypedef),
            raw::ffi_status_FFI_BAD_ABI => Some(FfiStatus::BadAbi),
            raw::ffi_status_FFI_BAD_ARGTYPE => Some(FfiStatus::BadArgType),
            other => Some(FfiStatus::Unknown(other as u32)),
        }
    }
}

impl fmt::Display for FfiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FfiStatus::BadTypedef => write!(f, "FFI_BAD_TYPEDEF"),
            FfiStatus::BadAbi => write!(f, "FFI_BAD_ABI"),
            FfiStatus::BadArgType => write!(f, "FFI_BAD_ARGTYPE"),
            FfiStatus::Unknown(code) => write!(f, "status {}", code),
        }
    }
}

/// Why a call interface could not be prepared
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreparationError {
    #[error("{function}: error {status}")]
    Rejected {
        function: &'static str,
        status: FfiStatus,
    },

    #[error("{count} arguments exceed the supported maximum of {max}")]
    TooManyArguments { count: usize, max: usize },

    #[error("argument {index} is void")]
    VoidArgument { index: usize },
}

/// Errors from [`crate::wrap`] and friends
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClosureError {
    /// libffi refused the call interface; nothing was allocated
    #[error("could not prepare call interface: {0}")]
    InterfacePreparation(#[from] PreparationError),

    /// The writable/executable memory pair could not be obtained
    #[error("could not allocate an FFI closure")]
    Allocation,
}

/// Result type for closure construction
pub type ClosureResult<T> = Result<T, ClosureError>;

/// Turn a libffi status into a result, naming the call that produced it
pub(crate) fn check(function: &'static str, status: raw::ffi_status) -> ClosureResult<()> {
    match FfiStatus::from_raw(status) {
        None => Ok(()),
        Some(status) => Err(PreparationError::Rejected { function, status }.into()),
    }
}
