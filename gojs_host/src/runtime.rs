use crate::*;
use fxhash::*;
use std::marker::*;
use std::time::*;
use wasm_runtime_layer::{AsContextMut, Engine, Extern, ExternType, Func, Imports, Instance, Module, Store};
use wasm_runtime_layer::Value as WasmValue;

/// Where the argument and environment block starts in guest memory.
const ARGV_OFFSET: u32 = 4096;
/// The lowest address the guest's own data may occupy.
const MIN_DATA_ADDRESS: u32 = 4096 + 8192;

/// Lifecycle of a guest program.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// The entry point has not run.
    NotStarted,
    /// The entry point ran and the guest is waiting to be resumed.
    Running,
    /// The guest called its exit routine with the given code.
    Exited(i32)
}

/// The guest exports the shim calls into.
#[derive(Clone)]
pub(crate) struct GuestExports {
    pub memory: LinearMemory,
    pub run: Func,
    pub resume: Func,
    pub getsp: Func
}

/// Everything one guest instance owns. Nothing here is shared between instances.
pub struct GuestState {
    /// Values the guest holds references to.
    pub(crate) values: ValueTable,
    pub(crate) host: HostGraph,
    /// The instantiated guest's exports, once linked.
    pub(crate) exports: Option<GuestExports>,
    /// Where the guest is in its lifecycle.
    pub(crate) status: Status,
    /// An error raised inside an import, waiting to be reported by whoever called into the guest.
    pub(crate) fatal: Option<GuestError>,
    /// Wall-clock time at which the instance was created, since the Unix epoch.
    pub(crate) time_origin: Duration,
    pub(crate) clock: Instant,
    pub(crate) next_timeout: i32,
    /// Timeouts the guest requested and has not cleared. They never fire.
    pub(crate) timeouts: FxHashSet<i32>
}

impl GuestState {
    /// Creates the state for one fresh guest instance.
    pub fn new(origin: &str) -> Self {
        Self {
            values: ValueTable::new(),
            host: HostGraph::new(origin),
            exports: None,
            status: Status::NotStarted,
            fatal: None,
            time_origin: SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default(),
            clock: Instant::now(),
            next_timeout: 1,
            timeouts: FxHashSet::default()
        }
    }

    /// The guest exports, if the module has been instantiated.
    pub(crate) fn exports(&self) -> Result<&GuestExports, GuestError> {
        self.exports.as_ref().ok_or_else(|| GuestError::InvalidModule("The guest has not been instantiated".to_string()))
    }

    /// The value table of this instance.
    pub fn values(&self) -> &ValueTable {
        &self.values
    }

    /// The object graph of this instance.
    pub fn host(&self) -> &HostGraph {
        &self.host
    }

    /// Nanoseconds since the Unix epoch, never decreasing within one instance.
    pub(crate) fn now(&self) -> Duration {
        self.time_origin + self.clock.elapsed()
    }
}

/// Drives one guest module: links the import surface, runs the entry point,
/// and calls the function the guest registers on its global object.
pub struct GuestRuntime<H: Host = DefaultHost> {
    engine: Engine<H::Engine>,
    /// The store holding the instance and all of its host-side state.
    store: Store<GuestState, H::Engine>,
    marker: PhantomData<fn(H)>
}

impl<H: Host> GuestRuntime<H> {
    /// Creates a runtime with fresh, unshared state.
    pub fn new() -> Self {
        let engine = Engine::new(H::create_engine());
        let store = Store::new(&engine, GuestState::new(H::ORIGIN));

        Self {
            engine,
            store,
            marker: PhantomData
        }
    }

    /// Instantiates `bytecode`, lays out its arguments and environment, and runs its entry point once.
    pub fn start(&mut self, bytecode: &[u8]) -> Result<(), GuestError> {
        if self.status() != Status::NotStarted {
            return Err(GuestError::AlreadyStarted);
        }

        let module = Module::new(&self.engine, bytecode).map_err(GuestError::from_invalid_module)?;
        let imports = self.link(&module)?;
        let instance = Instance::new(&mut self.store, &module, &imports).map_err(GuestError::from_invalid_module)?;
        let exports = GuestExports {
            memory: LinearMemory::new(match instance.get_export(&self.store, "mem") {
                Some(Extern::Memory(memory)) => memory,
                _ => return Err(GuestError::InvalidModule("Module missing memory export `mem`".to_string()))
            }),
            run: self.export_func(&instance, "run")?,
            resume: self.export_func(&instance, "resume")?,
            getsp: self.export_func(&instance, "getsp")?
        };

        let run = exports.run.clone();
        let state = self.store.data_mut();
        state.exports = Some(exports);
        state.status = Status::Running;

        let (argc, argv) = self.write_arguments()?;
        tracing::debug!(argc, argv, "Running guest entry point");
        if let Err(error) = run.call(&mut self.store, &[WasmValue::I32(argc as i32), WasmValue::I32(argv as i32)], &mut []) {
            return Err(self.store.data_mut().fatal.take().unwrap_or_else(|| GuestError::from_trap(error)));
        }

        tracing::info!(status = ?self.status(), "Guest started");
        Ok(())
    }

    /// Calls the entrypoint the guest registered during startup with a JSON
    /// payload and the configured mode flag, returning its string result.
    pub fn invoke(&mut self, payload_json: &str) -> Result<String, GuestError> {
        match self.status() {
            Status::NotStarted => return Err(GuestError::NotInitialized(H::ENTRYPOINT.to_string())),
            Status::Exited(code) => return Err(GuestError::Exited(code)),
            Status::Running => {}
        }

        let entrypoint = self.global(H::ENTRYPOINT);
        if !matches!(entrypoint, Value::Function(_)) {
            return Err(GuestError::NotInitialized(H::ENTRYPOINT.to_string()));
        }

        tracing::debug!(len = payload_json.len(), "Invoking guest entrypoint");
        let result = self.call(&entrypoint, vec![Value::from(payload_json), Value::from(H::MODE)])?;
        if let (Status::Exited(code), Ok(Value::Undefined)) = (self.status(), &result) {
            return Err(GuestError::Exited(code));
        }

        match result {
            Ok(Value::String(result)) => Ok(result.to_string()),
            Ok(other) => Err(GuestError::GuestException(format!("Entrypoint returned `{}` instead of a string", other.describe()))),
            Err(exception) => Err(GuestError::GuestException(exception.describe()))
        }
    }

    /// Re-enters the guest so that it processes whatever event is pending.
    pub fn resume(&mut self) -> Result<(), GuestError> {
        Frame::new(&mut self.store)?.resume()
    }

    /// Calls `function` with the global object as receiver. Guest functions run
    /// to completion before this returns. Failures reported by the callee are
    /// returned as the inner error value.
    pub fn call(&mut self, function: &Value, args: Vec<Value>) -> Result<Result<Value, Value>, GuestError> {
        Frame::new(&mut self.store)?.call_value(function, Value::Host(HostObject::Global), args)
    }

    /// Looks up a name on the global object.
    pub fn global(&self, name: &str) -> Value {
        self.store.data().host.get_attr(HostObject::Global, name)
    }

    /// Where the guest is in its lifecycle.
    pub fn status(&self) -> Status {
        self.store.data().status
    }

    /// The host-side state of this instance.
    pub fn state(&self) -> &GuestState {
        self.store.data()
    }

    /// Decodes the boxed value stored at `addr` in guest memory.
    pub fn load_value(&mut self, addr: u32) -> Result<Value, GuestError> {
        Frame::new(&mut self.store)?.load_value(addr)
    }

    /// Copies `len` bytes of guest memory starting at `addr`.
    pub fn read_memory(&self, addr: u32, len: usize) -> Result<Vec<u8>, GuestError> {
        let memory = self.store.data().exports()?.memory.clone();
        memory.read_vec(&self.store, addr, len)
    }

    /// The number of whole pages of guest memory.
    pub fn memory_pages(&self) -> Result<usize, GuestError> {
        Ok(self.store.data().exports()?.memory.pages(&self.store))
    }

    /// Binds every function the module imports, by name, to the shim's implementation.
    fn link(&mut self, module: &Module) -> Result<Imports, GuestError> {
        let mut imports = Imports::new();
        for import in module.imports(&self.engine) {
            let ExternType::Func(func_ty) = import.ty else {
                return Err(GuestError::InvalidModule(format!("Module imported unexpected object {}.{}", import.module, import.name)));
            };

            let func = match Import::from_name(import.name) {
                Some(host_import) => Func::new(&mut self.store, func_ty, move |mut ctx, args, _| {
                    match host_import.invoke(&mut ctx, args) {
                        Ok(()) => Ok(()),
                        Err(error) => {
                            tracing::error!(import = ?host_import, %error, "Host import failed");
                            let message = error.to_string();
                            ctx.data_mut().fatal = Some(error);
                            Err(anyhow::anyhow!(message))
                        }
                    }
                }),
                None => {
                    tracing::warn!(module = import.module, name = import.name, "Module imports an unknown function");
                    let name = import.name.to_string();
                    Func::new(&mut self.store, func_ty, move |_, _, _| anyhow::bail!("Module called unsupported import {name}"))
                }
            };
            imports.define(import.module, import.name, Extern::Func(func));
        }
        Ok(imports)
    }

    /// Fetches an exported function by name.
    fn export_func(&self, instance: &Instance, name: &str) -> Result<Func, GuestError> {
        match instance.get_export(&self.store, name) {
            Some(Extern::Func(func)) => Ok(func),
            _ => Err(GuestError::InvalidModule(format!("Module missing function export `{name}`")))
        }
    }

    /// Lays out argv and the environment as NUL-terminated strings followed by
    /// a table of 64-bit pointers, returning the argument count and table address.
    fn write_arguments(&mut self) -> Result<(u32, u32), GuestError> {
        let mut frame = Frame::new(&mut self.store)?;
        let mut offset = ARGV_OFFSET;

        let mut pointers = Vec::new();
        for arg in H::ARGS {
            pointers.push(write_c_string(&mut frame, &mut offset, arg)?);
        }
        pointers.push(0);

        let mut env = H::ENV.to_vec();
        env.sort();
        for (key, value) in env {
            pointers.push(write_c_string(&mut frame, &mut offset, &format!("{key}={value}"))?);
        }
        pointers.push(0);

        let argv = offset;
        for pointer in pointers {
            frame.set_i64(offset, pointer as i64)?;
            offset += 8;
        }

        if offset >= MIN_DATA_ADDRESS {
            return Err(GuestError::InvalidModule("Total length of command line and environment variables exceeds limit".to_string()));
        }

        Ok((H::ARGS.len() as u32, argv))
    }
}

impl<H: Host> Default for GuestRuntime<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Host> std::fmt::Debug for GuestRuntime<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestRuntime").field("status", &self.status()).finish()
    }
}

/// Writes `value` as a NUL-terminated string at `offset`, advancing it to the next 8-byte boundary.
fn write_c_string<C: AsContextMut<UserState = GuestState>>(frame: &mut Frame<C>, offset: &mut u32, value: &str) -> Result<u32, GuestError> {
    let pointer = *offset;
    let mut bytes = value.as_bytes().to_vec();
    bytes.push(0);
    frame.write_bytes(pointer, &bytes)?;
    *offset = (pointer + bytes.len() as u32).next_multiple_of(8);
    Ok(pointer)
}
