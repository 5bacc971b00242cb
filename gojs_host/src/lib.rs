//! Runs a WebAssembly module built by the Go toolchain for the browser
//! (`GOOS=js GOARCH=wasm`) without a browser. The guest's import section is
//! bound to a small set of host stand-ins: a global object graph, a
//! filesystem that only writes to the standard streams, clocks, and random
//! bytes. Host values cross into guest memory as NaN-boxed references into a
//! per-instance [`ValueTable`].
//!
//! A guest is driven through [`GuestRuntime`]: [`GuestRuntime::start`] runs
//! the guest's `main`, which registers a callable on the global object, and
//! [`GuestRuntime::invoke`] calls that callable with a JSON payload.

mod error;
mod host_object;
mod imports;
mod memory;
mod runtime;
mod table;
mod value;

pub use crate::error::*;
pub use crate::host_object::*;
pub use crate::imports::*;
pub use crate::memory::*;
pub use crate::runtime::*;
pub use crate::table::*;
pub use crate::value::*;

/// Compile-time configuration for a guest runtime.
pub trait Host: 'static + Sized {
    /// The attribute of the global object under which the guest registers its callable.
    const ENTRYPOINT: &'static str = "bder";
    /// The mode flag passed as the second argument to the entrypoint.
    const MODE: &'static str = "0";
    /// The origin reported by the location object.
    const ORIGIN: &'static str = "https://online.mbbank.com.vn";
    /// The command line passed to the guest's `main`.
    const ARGS: &'static [&'static str] = &["js"];
    /// The environment passed to the guest's `main`.
    const ENV: &'static [(&'static str, &'static str)] = &[];

    /// The WebAssembly engine that executes the guest.
    type Engine: wasm_runtime_layer::backend::WasmEngine;

    /// Creates the engine for a new runtime.
    fn create_engine() -> Self::Engine;
}

/// Runs guests on the `wasmi` interpreter with the default configuration.
#[derive(Copy, Clone, Debug, Default)]
pub struct DefaultHost;

impl Host for DefaultHost {
    type Engine = wasmi_runtime_layer::Engine;

    fn create_engine() -> Self::Engine {
        wasmi_runtime_layer::Engine::default()
    }
}
