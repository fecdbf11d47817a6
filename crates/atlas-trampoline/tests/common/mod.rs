//! Shared test utilities
//!
//! Helpers that stand in for the C side of a callback API, plus logging setup
//! so `RUST_LOG=atlas_trampoline=trace cargo test` shows what the crate does.

#![allow(dead_code)]

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Install a test-friendly fmt subscriber once per test binary
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A C-style API that calls a bare callback with no user data
pub extern "C" fn call_twice(callback: unsafe extern "C" fn(i32) -> i32, x: i32) -> i32 {
    unsafe { callback(callback(x)) }
}

/// A C-style "register and fire later" API
pub struct Registry {
    hooks: Vec<unsafe extern "C" fn(u32)>,
}

impl Registry {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn register(&mut self, hook: unsafe extern "C" fn(u32)) {
        self.hooks.push(hook);
    }

    /// Fire every hook with its registration index
    ///
    /// # Safety
    ///
    /// Every registered hook must still be alive.
    pub unsafe fn fire(&self) {
        for (index, hook) in self.hooks.iter().enumerate() {
            hook(index as u32);
        }
    }
}
