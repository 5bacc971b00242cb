use crate::*;
use wasm_runtime_layer::AsContextMut;
use wasm_runtime_layer::Value as WasmValue;

/// The furthest a call frame field lies from the stack pointer.
const MAX_FRAME_OFFSET: u32 = 128;

/// The host functions a guest compiled for the browser imports.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Import {
    WasmExit,
    WasmWrite,
    ResetMemoryDataView,
    Nanotime,
    Walltime,
    ScheduleTimeoutEvent,
    ClearTimeoutEvent,
    GetRandomData,
    FinalizeRef,
    StringVal,
    ValueGet,
    ValueSet,
    ValueDelete,
    ValueIndex,
    ValueSetIndex,
    ValueCall,
    ValueInvoke,
    ValueNew,
    ValueLength,
    ValuePrepareString,
    ValueLoadString,
    ValueInstanceOf,
    CopyBytesToGo,
    CopyBytesToJs,
    Debug
}

impl Import {
    /// Resolves an import by the name the guest declares it under.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "runtime.wasmExit" => Self::WasmExit,
            "runtime.wasmWrite" => Self::WasmWrite,
            "runtime.resetMemoryDataView" => Self::ResetMemoryDataView,
            "runtime.nanotime" | "runtime.nanotime1" => Self::Nanotime,
            "runtime.walltime" | "runtime.walltime1" => Self::Walltime,
            "runtime.scheduleTimeoutEvent" => Self::ScheduleTimeoutEvent,
            "runtime.clearTimeoutEvent" => Self::ClearTimeoutEvent,
            "runtime.getRandomData" => Self::GetRandomData,
            "syscall/js.finalizeRef" => Self::FinalizeRef,
            "syscall/js.stringVal" => Self::StringVal,
            "syscall/js.valueGet" => Self::ValueGet,
            "syscall/js.valueSet" => Self::ValueSet,
            "syscall/js.valueDelete" => Self::ValueDelete,
            "syscall/js.valueIndex" => Self::ValueIndex,
            "syscall/js.valueSetIndex" => Self::ValueSetIndex,
            "syscall/js.valueCall" => Self::ValueCall,
            "syscall/js.valueInvoke" => Self::ValueInvoke,
            "syscall/js.valueNew" => Self::ValueNew,
            "syscall/js.valueLength" => Self::ValueLength,
            "syscall/js.valuePrepareString" => Self::ValuePrepareString,
            "syscall/js.valueLoadString" => Self::ValueLoadString,
            "syscall/js.valueInstanceOf" => Self::ValueInstanceOf,
            "syscall/js.copyBytesToGo" => Self::CopyBytesToGo,
            "syscall/js.copyBytesToJS" => Self::CopyBytesToJs,
            "debug" => Self::Debug,
            _ => return None
        })
    }

    /// Runs this import against the call frame the guest passed.
    pub fn invoke<C: AsContextMut<UserState = GuestState>>(self, ctx: C, args: &[WasmValue]) -> Result<(), GuestError> {
        let sp = match args.first() {
            Some(WasmValue::I32(sp)) => *sp as u32,
            _ => return Err(GuestError::ProtocolMismatch(format!("{self:?} expects a stack pointer argument")))
        };

        if self == Self::Debug {
            tracing::trace!(value = sp, "Guest debug hook");
            return Ok(());
        }

        let sp = frame_base(sp)?;
        let mut frame = Frame::new(ctx)?;
        match self {
            Self::WasmExit => frame.wasm_exit(sp),
            Self::WasmWrite => frame.wasm_write(sp),
            Self::ResetMemoryDataView | Self::Debug => Ok(()),
            Self::Nanotime => frame.nanotime(sp),
            Self::Walltime => frame.walltime(sp),
            Self::ScheduleTimeoutEvent => frame.schedule_timeout_event(sp),
            Self::ClearTimeoutEvent => frame.clear_timeout_event(sp),
            Self::GetRandomData => frame.get_random_data(sp),
            Self::FinalizeRef => frame.finalize_ref(sp),
            Self::StringVal => frame.string_val(sp),
            Self::ValueGet => frame.value_get(sp),
            Self::ValueSet => frame.value_set(sp),
            Self::ValueDelete => frame.value_delete(sp),
            Self::ValueIndex => frame.value_index(sp),
            Self::ValueSetIndex => frame.value_set_index(sp),
            Self::ValueCall => frame.value_call(sp),
            Self::ValueInvoke => frame.value_invoke(sp),
            Self::ValueNew => frame.value_new(sp),
            Self::ValueLength => frame.value_length(sp),
            Self::ValuePrepareString => frame.value_prepare_string(sp),
            Self::ValueLoadString => frame.value_load_string(sp),
            Self::ValueInstanceOf => frame.value_instance_of(sp),
            Self::CopyBytesToGo => frame.copy_bytes_to_go(sp),
            Self::CopyBytesToJs => frame.copy_bytes_to_js(sp)
        }
    }
}

/// Checks that every field of a call frame at `sp` is addressable.
fn frame_base(sp: u32) -> Result<u32, GuestError> {
    if sp > u32::MAX - MAX_FRAME_OFFSET {
        Err(GuestError::ProtocolMismatch(format!("Stack pointer {sp:#x} leaves no room for a call frame")))
    }
    else {
        Ok(sp)
    }
}

/// Access to one guest instance while the host decodes a call frame or calls into the guest.
pub(crate) struct Frame<C: AsContextMut<UserState = GuestState>> {
    ctx: C,
    memory: LinearMemory
}

impl<C: AsContextMut<UserState = GuestState>> Frame<C> {
    /// Opens a frame over an instantiated guest.
    pub fn new(mut ctx: C) -> Result<Self, GuestError> {
        let memory = ctx.as_context_mut().data_mut().exports()?.memory.clone();
        let size = memory.size(&ctx);
        ctx.as_context_mut().data_mut().host.limit_sequences(size);
        Ok(Self {
            ctx,
            memory
        })
    }

    /// Runs `f` with the instance state.
    fn with<R>(&mut self, f: impl FnOnce(&mut GuestState) -> R) -> R {
        f(self.ctx.as_context_mut().data_mut())
    }

    /// Prefers an error recorded by a nested import over the engine's trap.
    fn take_fatal(&mut self, error: anyhow::Error) -> GuestError {
        self.with(|state| state.fatal.take()).unwrap_or_else(|| GuestError::from_trap(error))
    }

    /// Reads a little-endian 64-bit integer.
    pub fn get_i64(&mut self, addr: u32) -> Result<i64, GuestError> {
        self.memory.get_i64(&self.ctx, addr, Endian::Little)
    }

    /// Writes a little-endian 64-bit integer.
    pub fn set_i64(&mut self, addr: u32, value: i64) -> Result<(), GuestError> {
        self.memory.set_i64(&mut self.ctx, addr, value, Endian::Little)
    }

    /// Writes raw bytes, growing memory if needed.
    pub fn write_bytes(&mut self, addr: u32, bytes: &[u8]) -> Result<(), GuestError> {
        self.memory.write(&mut self.ctx, addr, bytes)
    }

    /// Reads a 64-bit field that holds a guest address.
    fn get_pointer(&mut self, addr: u32) -> Result<u32, GuestError> {
        let value = self.get_i64(addr)?;
        u32::try_from(value).map_err(|_| GuestError::ProtocolMismatch(format!("Pointer {value:#x} at {addr:#x} is outside of linear memory")))
    }

    /// Reads the pointer and length of a slice header.
    fn load_slice(&mut self, addr: u32) -> Result<(u32, usize), GuestError> {
        let pointer = self.get_pointer(addr)?;
        let len = self.get_i64(addr + 8)?;
        let len = usize::try_from(len).map_err(|_| GuestError::ProtocolMismatch(format!("Slice length {len} at {addr:#x} is negative")))?;
        Ok((pointer, len))
    }

    /// Copies the bytes a slice header describes.
    fn load_bytes(&mut self, addr: u32) -> Result<Vec<u8>, GuestError> {
        let (pointer, len) = self.load_slice(addr)?;
        self.memory.read_vec(&self.ctx, pointer, len)
    }

    /// Decodes the UTF-8 string a slice header describes.
    fn load_string(&mut self, addr: u32) -> Result<String, GuestError> {
        let bytes = self.load_bytes(addr)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Decodes the boxed values a slice header describes.
    fn load_values(&mut self, addr: u32) -> Result<Vec<Value>, GuestError> {
        let (pointer, len) = self.load_slice(addr)?;
        (0..len).map(|index| {
            let element = u32::try_from(pointer as u64 + index as u64 * 8)
                .map_err(|_| GuestError::ProtocolMismatch(format!("Value slice at {pointer:#x} runs past linear memory")))?;
            self.load_value(element)
        }).collect()
    }

    /// Decodes the boxed value stored at `addr`.
    pub fn load_value(&mut self, addr: u32) -> Result<Value, GuestError> {
        let bits = self.memory.get_u64(&self.ctx, addr, Endian::Little)?;
        self.with(|state| state.values.load(bits))
    }

    /// Registers `value` and writes its boxed form at `addr`.
    pub fn store_value(&mut self, addr: u32, value: Value) -> Result<(), GuestError> {
        let bits = self.with(|state| state.values.store(value));
        self.memory.set_u64(&mut self.ctx, addr, bits, Endian::Little)
    }

    /// Asks the guest where its stack pointer is now. The guest may have
    /// moved its stack while the host was working.
    fn stack_pointer(&mut self) -> Result<u32, GuestError> {
        let getsp = self.with(|state| state.exports().map(|x| x.getsp.clone()))?;
        let mut result = [WasmValue::I32(0)];
        if let Err(error) = getsp.call(&mut self.ctx, &[], &mut result) {
            return Err(self.take_fatal(error));
        }

        match &result[0] {
            WasmValue::I32(sp) => frame_base(*sp as u32),
            other => Err(GuestError::ProtocolMismatch(format!("Stack pointer export returned {other:?}")))
        }
    }

    /// Writes a call result and its success flag at the current stack pointer.
    fn store_outcome(&mut self, value_offset: u32, flag_offset: u32, outcome: Result<Value, Value>) -> Result<(), GuestError> {
        let sp = self.stack_pointer()?;
        let (value, success) = match outcome {
            Ok(value) => (value, 1),
            Err(exception) => {
                tracing::debug!(exception = %exception.describe(), "Host call failed, reporting to guest");
                (exception, 0)
            }
        };
        self.store_value(sp + value_offset, value)?;
        self.memory.set_u8(&mut self.ctx, sp + flag_offset, success, Endian::Little)
    }

    /// Re-enters the guest to process the pending event.
    pub fn resume(&mut self) -> Result<(), GuestError> {
        if let Status::Exited(code) = self.with(|state| state.status) {
            return Err(GuestError::Exited(code));
        }

        let resume = self.with(|state| state.exports().map(|x| x.resume.clone()))?;
        if let Err(error) = resume.call(&mut self.ctx, &[], &mut []) {
            return Err(self.take_fatal(error));
        }
        Ok(())
    }

    /// Calls `callee` if it is a function; anything else fails the way calling a non-function does.
    pub fn call_value(&mut self, callee: &Value, this: Value, args: Vec<Value>) -> Result<Result<Value, Value>, GuestError> {
        match callee {
            Value::Function(function) => self.call(*function, this, args),
            other => Ok(Err(Value::error("TypeError", format_args!("{} is not a function", other.to_js_string()))))
        }
    }

    /// Calls a function. Guest functions are queued as the pending event and
    /// run by resuming the guest; the result is whatever the guest stored on the event.
    pub fn call(&mut self, function: Function, this: Value, args: Vec<Value>) -> Result<Result<Value, Value>, GuestError> {
        match function {
            Function::Guest(id) => {
                let event = self.with(|state| state.host.queue_event(id, this, args));
                self.resume()?;
                Ok(Ok(event.field("result")))
            },
            Function::Native(NativeFn::FsWrite) => {
                let callback = args.get(5).cloned().unwrap_or_default();
                let callback_args = match self.with(|state| state.host.call_native(NativeFn::FsWrite, &args)) {
                    Ok(written) => vec![Value::Null, written],
                    Err(error) => vec![error]
                };
                if let Err(exception) = self.call_value(&callback, Value::Undefined, callback_args)? {
                    tracing::warn!(exception = %exception.describe(), "Write callback failed");
                }
                Ok(Ok(Value::Undefined))
            },
            Function::Native(native) => Ok(self.with(|state| state.host.call_native(native, &args)))
        }
    }

    fn wasm_exit(&mut self, sp: u32) -> Result<(), GuestError> {
        let code = self.memory.get_i32(&self.ctx, sp + 8, Endian::Little)?;
        tracing::info!(code, "Guest exited");
        self.with(|state| state.status = Status::Exited(code));
        Ok(())
    }

    fn wasm_write(&mut self, sp: u32) -> Result<(), GuestError> {
        let fd = self.get_i64(sp + 8)?;
        let pointer = self.get_pointer(sp + 16)?;
        let len = self.memory.get_i32(&self.ctx, sp + 24, Endian::Little)?;
        let len = usize::try_from(len).map_err(|_| GuestError::ProtocolMismatch(format!("Write length {len} is negative")))?;
        let bytes = self.memory.read_vec(&self.ctx, pointer, len)?;
        if let Err(error) = self.with(|state| state.host.write_sync(fd, &bytes)) {
            tracing::warn!(fd, error = %error.describe(), "Dropped guest output");
        }
        Ok(())
    }

    fn nanotime(&mut self, sp: u32) -> Result<(), GuestError> {
        let now = self.with(|state| state.now());
        self.set_i64(sp + 8, now.as_nanos() as i64)
    }

    fn walltime(&mut self, sp: u32) -> Result<(), GuestError> {
        let now = self.with(|state| state.now());
        self.set_i64(sp + 8, now.as_secs() as i64)?;
        self.memory.set_i32(&mut self.ctx, sp + 16, now.subsec_nanos() as i32, Endian::Little)
    }

    fn schedule_timeout_event(&mut self, sp: u32) -> Result<(), GuestError> {
        let delay = self.get_i64(sp + 8)?;
        let id = self.with(|state| {
            let id = state.next_timeout;
            state.next_timeout = state.next_timeout.wrapping_add(1);
            state.timeouts.insert(id);
            id
        });
        tracing::debug!(id, delay, "Guest scheduled a timeout that will not fire");
        self.memory.set_i32(&mut self.ctx, sp + 16, id, Endian::Little)
    }

    fn clear_timeout_event(&mut self, sp: u32) -> Result<(), GuestError> {
        let id = self.memory.get_i32(&self.ctx, sp + 8, Endian::Little)?;
        self.with(|state| state.timeouts.remove(&id));
        Ok(())
    }

    fn get_random_data(&mut self, sp: u32) -> Result<(), GuestError> {
        let (pointer, len) = self.load_slice(sp + 8)?;
        let mut bytes = vec![0; len];
        getrandom::getrandom(&mut bytes).map_err(GuestError::Entropy)?;
        self.write_bytes(pointer, &bytes)
    }

    fn finalize_ref(&mut self, sp: u32) -> Result<(), GuestError> {
        let id = self.memory.get_u32(&self.ctx, sp + 8, Endian::Little)?;
        self.with(|state| state.values.drop_ref(id))
    }

    fn string_val(&mut self, sp: u32) -> Result<(), GuestError> {
        let value = self.load_string(sp + 8)?;
        let sp = self.stack_pointer()?;
        self.store_value(sp + 24, Value::from(value))
    }

    fn value_get(&mut self, sp: u32) -> Result<(), GuestError> {
        let target = self.load_value(sp + 8)?;
        let name = self.load_string(sp + 16)?;
        let result = self.with(|state| state.host.get(&target, &name));
        let sp = self.stack_pointer()?;
        self.store_value(sp + 32, result)
    }

    fn value_set(&mut self, sp: u32) -> Result<(), GuestError> {
        let target = self.load_value(sp + 8)?;
        let name = self.load_string(sp + 16)?;
        let value = self.load_value(sp + 32)?;
        self.with(|state| state.host.set(&target, &name, value));
        Ok(())
    }

    fn value_delete(&mut self, sp: u32) -> Result<(), GuestError> {
        let target = self.load_value(sp + 8)?;
        let name = self.load_string(sp + 16)?;
        self.with(|state| state.host.delete(&target, &name));
        Ok(())
    }

    fn value_index(&mut self, sp: u32) -> Result<(), GuestError> {
        let target = self.load_value(sp + 8)?;
        let index = self.get_i64(sp + 16)?;
        let result = self.with(|state| state.host.index(&target, index));
        let sp = self.stack_pointer()?;
        self.store_value(sp + 24, result)
    }

    fn value_set_index(&mut self, sp: u32) -> Result<(), GuestError> {
        let target = self.load_value(sp + 8)?;
        let index = self.get_i64(sp + 16)?;
        let value = self.load_value(sp + 24)?;
        self.with(|state| state.host.set_index(&target, index, value));
        Ok(())
    }

    fn value_call(&mut self, sp: u32) -> Result<(), GuestError> {
        let receiver = self.load_value(sp + 8)?;
        let name = self.load_string(sp + 16)?;
        let args = self.load_values(sp + 32)?;
        let method = self.with(|state| state.host.get(&receiver, &name));
        let outcome = self.call_value(&method, receiver, args)?;
        self.store_outcome(56, 64, outcome)
    }

    fn value_invoke(&mut self, sp: u32) -> Result<(), GuestError> {
        let callee = self.load_value(sp + 8)?;
        let args = self.load_values(sp + 16)?;
        let outcome = self.call_value(&callee, Value::Undefined, args)?;
        self.store_outcome(40, 48, outcome)
    }

    fn value_new(&mut self, sp: u32) -> Result<(), GuestError> {
        let class = self.load_value(sp + 8)?;
        let args = self.load_values(sp + 16)?;
        let outcome = match class {
            Value::Function(Function::Native(native)) => self.with(|state| state.host.construct(native, &args)),
            other => Err(Value::error("TypeError", format_args!("{} is not a constructor", other.to_js_string())))
        };
        self.store_outcome(40, 48, outcome)
    }

    fn value_length(&mut self, sp: u32) -> Result<(), GuestError> {
        let target = self.load_value(sp + 8)?;
        let len = target.length().unwrap_or_else(|| {
            tracing::warn!(value = %target.to_js_string(), "Guest asked for the length of a non-sequence");
            0
        });
        let sp = self.stack_pointer()?;
        self.set_i64(sp + 16, len as i64)
    }

    fn value_prepare_string(&mut self, sp: u32) -> Result<(), GuestError> {
        let bytes = self.load_value(sp + 8)?.to_js_string().into_bytes();
        let len = bytes.len();
        let sp = self.stack_pointer()?;
        self.store_value(sp + 16, Value::bytes(bytes))?;
        self.set_i64(sp + 24, len as i64)
    }

    fn value_load_string(&mut self, sp: u32) -> Result<(), GuestError> {
        let source = self.load_value(sp + 8)?;
        let (pointer, len) = self.load_slice(sp + 16)?;
        let Value::Bytes(bytes) = &source else {
            return Err(GuestError::ProtocolMismatch(format!("Cannot load string bytes from `{}`", source.to_js_string())));
        };

        let bytes = bytes.lock();
        let count = len.min(bytes.len());
        self.write_bytes(pointer, &bytes[..count])
    }

    fn value_instance_of(&mut self, sp: u32) -> Result<(), GuestError> {
        let value = self.load_value(sp + 8)?;
        let class = self.load_value(sp + 16)?;
        let result = self.with(|state| state.host.instance_of(&value, &class));
        let sp = self.stack_pointer()?;
        self.memory.set_u8(&mut self.ctx, sp + 24, result as u8, Endian::Little)
    }

    fn copy_bytes_to_go(&mut self, sp: u32) -> Result<(), GuestError> {
        let (pointer, len) = self.load_slice(sp + 8)?;
        let source = self.load_value(sp + 32)?;
        let sp = self.stack_pointer()?;
        let Value::Bytes(bytes) = source else {
            return self.memory.set_u8(&mut self.ctx, sp + 48, 0, Endian::Little);
        };

        let bytes = bytes.lock().clone();
        let count = len.min(bytes.len());
        self.write_bytes(pointer, &bytes[..count])?;
        self.set_i64(sp + 40, count as i64)?;
        self.memory.set_u8(&mut self.ctx, sp + 48, 1, Endian::Little)
    }

    fn copy_bytes_to_js(&mut self, sp: u32) -> Result<(), GuestError> {
        let destination = self.load_value(sp + 8)?;
        let (pointer, len) = self.load_slice(sp + 16)?;
        let sp = self.stack_pointer()?;
        let Value::Bytes(bytes) = destination else {
            return self.memory.set_u8(&mut self.ctx, sp + 48, 0, Endian::Little);
        };

        let count = len.min(bytes.lock().len());
        let source = self.memory.read_vec(&self.ctx, pointer, count)?;
        bytes.lock()[..count].copy_from_slice(&source);
        self.set_i64(sp + 40, count as i64)?;
        self.memory.set_u8(&mut self.ctx, sp + 48, 1, Endian::Little)
    }
}
