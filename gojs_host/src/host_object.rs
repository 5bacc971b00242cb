use crate::*;
use fxhash::*;
use std::sync::*;

/// Filesystem operations the guest's syscall layer may look up but that the environment does not provide.
const FS_UNSUPPORTED: &[&str] = &[
    "chmod", "chown", "close", "fchmod", "fchown", "fstat", "fsync", "ftruncate", "lchown", "link",
    "lstat", "mkdir", "open", "read", "readdir", "readlink", "rename", "rmdir", "stat", "symlink",
    "truncate", "unlink", "utimes"
];

/// Process operations the guest's syscall layer may look up but that the environment does not provide.
const PROCESS_UNSUPPORTED: &[&str] = &["getgroups", "umask", "cwd", "chdir"];

/// The open-file flags the guest reads at startup. None are honored.
const FS_CONSTANTS: &[&str] = &["O_WRONLY", "O_RDWR", "O_CREAT", "O_TRUNC", "O_APPEND", "O_EXCL"];

/// The fixed stand-ins that make up the guest's view of its environment.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum HostObject {
    /// The root of the object graph.
    Global,
    /// A window holding an empty document.
    Window,
    /// A filesystem that only supports writing to standard output and error.
    Fs,
    /// Process information with sentinel identifiers.
    Process,
    /// A location with a fixed origin.
    Location,
    /// The execution driver, through which guest callbacks are exchanged.
    Bridge
}

/// Accumulates guest output and releases it one batch of complete lines at a time.
#[derive(Clone, Debug, Default)]
pub struct LineBuffer {
    /// Bytes written since the last line terminator.
    pending: Vec<u8>
}

impl LineBuffer {
    /// Appends `bytes`. If a line terminator is now buffered, returns everything
    /// before the last terminator and keeps the remainder.
    pub fn write(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let last = self.pending.iter().rposition(|x| *x == b'\n')?;
        let rest = self.pending.split_off(last + 1);
        let lines = std::mem::replace(&mut self.pending, rest);
        Some(String::from_utf8_lossy(&lines[..last]).into_owned())
    }

    /// The bytes still waiting for a terminator.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}

/// Per-instance state behind the host objects.
#[derive(Debug)]
pub struct HostGraph {
    /// The origin reported by the location object.
    origin: Arc<str>,
    document: Value,
    fs_constants: Value,
    /// Attributes the guest assigned onto host objects.
    overlays: FxHashMap<HostObject, Record>,
    /// The event the guest picks up when it is resumed.
    pending_event: Value,
    stdout: LineBuffer,
    stderr: LineBuffer,
    /// The longest sequence the guest may create, at most the size of its memory.
    sequence_limit: usize
}

impl HostGraph {
    /// Builds a fresh object graph whose location reports `origin`.
    pub fn new(origin: &str) -> Self {
        Self {
            origin: origin.into(),
            document: Value::object([]),
            fs_constants: Value::object(FS_CONSTANTS.iter().map(|x| (*x, Value::Number(-1.0)))),
            overlays: FxHashMap::default(),
            pending_event: Value::Null,
            stdout: LineBuffer::default(),
            stderr: LineBuffer::default(),
            sequence_limit: PAGE_SIZE
        }
    }

    /// Bounds the length of sequences the guest creates from here on.
    pub fn limit_sequences(&mut self, len: usize) {
        self.sequence_limit = len;
    }

    /// Looks up `name` on a host object. Unknown names yield undefined.
    pub fn get_attr(&self, object: HostObject, name: &str) -> Value {
        if let Some(value) = self.overlays.get(&object).and_then(|x| x.get(name)) {
            return value.clone();
        }

        match (object, name) {
            (HostObject::Global, "Object") => Value::Function(Function::Native(NativeFn::ObjectConstructor)),
            (HostObject::Global, "Array") => Value::Function(Function::Native(NativeFn::ArrayConstructor)),
            (HostObject::Global, "Uint8Array") => Value::Function(Function::Native(NativeFn::Uint8ArrayConstructor)),
            (HostObject::Global, "window") => Value::Host(HostObject::Window),
            (HostObject::Global, "fs") => Value::Host(HostObject::Fs),
            (HostObject::Global, "process") => Value::Host(HostObject::Process),
            (HostObject::Global, "location") => Value::Host(HostObject::Location),
            (HostObject::Window, "document") => self.document.clone(),
            (HostObject::Fs, "constants") => self.fs_constants.clone(),
            (HostObject::Fs, "writeSync") => Value::Function(Function::Native(NativeFn::FsWriteSync)),
            (HostObject::Fs, "write") => Value::Function(Function::Native(NativeFn::FsWrite)),
            (HostObject::Fs, name) => unsupported(FS_UNSUPPORTED, name),
            (HostObject::Process, "pid" | "ppid") => Value::Number(-1.0),
            (HostObject::Process, "getuid" | "getgid" | "geteuid" | "getegid") => Value::Function(Function::Native(NativeFn::ProcessId)),
            (HostObject::Process, name) => unsupported(PROCESS_UNSUPPORTED, name),
            (HostObject::Location, "origin") => Value::String(self.origin.clone()),
            (HostObject::Bridge, "_pendingEvent") => self.pending_event.clone(),
            (HostObject::Bridge, "_makeFuncWrapper") => Value::Function(Function::Native(NativeFn::MakeFuncWrapper)),
            _ => Value::Undefined
        }
    }

    /// Assigns `name` on a host object.
    pub fn set_attr(&mut self, object: HostObject, name: &str, value: Value) {
        match (object, name) {
            (HostObject::Bridge, "_pendingEvent") => self.pending_event = value,
            _ => {
                self.overlays.entry(object).or_default().insert(name.to_string(), value);
            }
        }
    }

    /// Removes a guest-assigned attribute from a host object.
    pub fn delete_attr(&mut self, object: HostObject, name: &str) {
        match (object, name) {
            (HostObject::Bridge, "_pendingEvent") => self.pending_event = Value::Undefined,
            _ => {
                if let Some(overlay) = self.overlays.get_mut(&object) {
                    overlay.remove(name);
                }
            }
        }
    }

    /// Property lookup on any value.
    pub fn get(&self, target: &Value, name: &str) -> Value {
        match target {
            Value::Host(object) => self.get_attr(*object, name),
            Value::Object(fields) => fields.lock().get(name).cloned().unwrap_or_default(),
            Value::String(_) | Value::Bytes(_) | Value::Array(_) if name == "length" => {
                target.length().map(|x| Value::Number(x as f64)).unwrap_or_default()
            },
            _ => Value::Undefined
        }
    }

    /// Property assignment on any value. Assignments to primitives are ignored.
    pub fn set(&mut self, target: &Value, name: &str, value: Value) {
        match target {
            Value::Host(object) => self.set_attr(*object, name, value),
            Value::Object(fields) => {
                fields.lock().insert(name.to_string(), value);
            },
            _ => tracing::debug!(name, "Ignored property assignment on a primitive")
        }
    }

    /// Property deletion on any value.
    pub fn delete(&mut self, target: &Value, name: &str) {
        match target {
            Value::Host(object) => self.delete_attr(*object, name),
            Value::Object(fields) => {
                fields.lock().remove(name);
            },
            _ => {}
        }
    }

    /// Integer-indexed lookup into an ordered or byte sequence.
    pub fn index(&self, target: &Value, index: i64) -> Value {
        let Ok(index) = usize::try_from(index) else { return Value::Undefined };
        match target {
            Value::Array(items) => items.lock().get(index).cloned().unwrap_or_default(),
            Value::Bytes(bytes) => bytes.lock().get(index).map(|x| Value::Number(*x as f64)).unwrap_or_default(),
            _ => Value::Undefined
        }
    }

    /// Integer-indexed assignment. Arrays extend with undefined up to the sequence limit; byte buffers ignore writes past their end.
    pub fn set_index(&mut self, target: &Value, index: i64, value: Value) {
        let Ok(index) = usize::try_from(index) else { return };
        match target {
            Value::Array(_) if index >= self.sequence_limit => tracing::debug!(index, "Ignored index assignment past the sequence limit"),
            Value::Array(items) => {
                let mut items = items.lock();
                if index >= items.len() {
                    items.resize(index + 1, Value::Undefined);
                }
                items[index] = value;
            },
            Value::Bytes(bytes) => {
                if let Some(byte) = bytes.lock().get_mut(index) {
                    *byte = value.as_number().map(to_byte).unwrap_or(0);
                }
            },
            _ => tracing::debug!(index, "Ignored index assignment on a non-sequence")
        }
    }

    /// Invokes a host-implemented function. Failures are returned as error values for the guest to inspect.
    pub fn call_native(&mut self, function: NativeFn, args: &[Value]) -> Result<Value, Value> {
        match function {
            NativeFn::ObjectConstructor => Ok(Value::object([])),
            NativeFn::ArrayConstructor => self.new_array(args),
            NativeFn::Uint8ArrayConstructor => Err(Value::error("TypeError", "Constructor Uint8Array requires 'new'")),
            NativeFn::FsWriteSync | NativeFn::FsWrite => {
                let fd = args.first().and_then(Value::as_number).unwrap_or(-1.0);
                let Some(Value::Bytes(bytes)) = args.get(1) else {
                    return Err(Value::error("EINVAL", "The buffer argument must be a Uint8Array"));
                };
                let bytes = bytes.lock();
                self.write_sync(fd as i64, &bytes).map(|x| Value::Number(x as f64))
            },
            NativeFn::ProcessId => Ok(Value::Number(-1.0)),
            NativeFn::MakeFuncWrapper => match args.first().and_then(Value::as_number) {
                Some(id) if id >= 0.0 => Ok(Value::Function(Function::Guest(id as u32))),
                _ => Err(Value::error("TypeError", "Function wrapper id must be a number"))
            },
            NativeFn::Unsupported(name) => Err(Value::error("ENOSYS", format_args!("{name} is not supported")))
        }
    }

    /// Constructs a new instance of a host constructor.
    pub fn construct(&mut self, function: NativeFn, args: &[Value]) -> Result<Value, Value> {
        match function {
            NativeFn::ObjectConstructor => Ok(Value::object([])),
            NativeFn::ArrayConstructor => self.new_array(args),
            NativeFn::Uint8ArrayConstructor => Ok(Value::bytes(match args.first() {
                Some(Value::Number(len)) if *len > self.sequence_limit as f64 => {
                    return Err(Value::error("RangeError", format_args!("Invalid typed array length: {}", Value::Number(*len).to_js_string())));
                },
                Some(Value::Number(len)) if *len >= 0.0 => vec![0; *len as usize],
                Some(Value::Bytes(bytes)) => bytes.lock().clone(),
                Some(Value::Array(items)) => items.lock().iter().map(|x| x.as_number().map(to_byte).unwrap_or(0)).collect(),
                _ => Vec::new()
            })),
            _ => Err(Value::error("TypeError", format_args!("{function:?} is not a constructor")))
        }
    }

    /// Creates an array the way the array constructor does.
    fn new_array(&self, args: &[Value]) -> Result<Value, Value> {
        match args {
            [Value::Number(len)] if *len > self.sequence_limit as f64 => Err(Value::error("RangeError", "Invalid array length")),
            [Value::Number(len)] if *len >= 0.0 && len.fract() == 0.0 => Ok(Value::array(vec![Value::Undefined; *len as usize])),
            _ => Ok(Value::array(args.to_vec()))
        }
    }

    /// Whether `value` is an instance of the constructor `class`.
    pub fn instance_of(&self, value: &Value, class: &Value) -> bool {
        match class {
            Value::Function(Function::Native(NativeFn::ObjectConstructor)) => matches!(value,
                Value::Bytes(_) | Value::Array(_) | Value::Object(_) | Value::Host(_) | Value::Function(_)),
            Value::Function(Function::Native(NativeFn::ArrayConstructor)) => matches!(value, Value::Array(_)),
            Value::Function(Function::Native(NativeFn::Uint8ArrayConstructor)) => matches!(value, Value::Bytes(_)),
            _ => false
        }
    }

    /// Writes guest output to a standard stream, logging each completed batch of lines.
    pub fn write_sync(&mut self, fd: i64, bytes: &[u8]) -> Result<usize, Value> {
        match fd {
            1 => if let Some(lines) = self.stdout.write(bytes) {
                tracing::info!(target: "gojs::guest", fd, "{lines}");
            },
            2 => if let Some(lines) = self.stderr.write(bytes) {
                tracing::warn!(target: "gojs::guest", fd, "{lines}");
            },
            _ => return Err(Value::error("EBADF", format_args!("File descriptor {fd} is not writable")))
        }

        Ok(bytes.len())
    }

    /// Queues a call to the guest callback `id`, to be picked up on the next resume.
    pub fn queue_event(&mut self, id: u32, this: Value, args: Vec<Value>) -> Value {
        let event = Value::object([
            ("id", Value::Number(id as f64)),
            ("this", this),
            ("args", Value::array(args))
        ]);
        self.pending_event = event.clone();
        event
    }

    /// The event the guest has not yet picked up, or null.
    pub fn pending_event(&self) -> &Value {
        &self.pending_event
    }
}

/// Looks up a name in a list of deliberately unsupported operations.
fn unsupported(names: &'static [&'static str], name: &str) -> Value {
    names.iter()
        .find(|x| **x == name)
        .map(|x| Value::Function(Function::Native(NativeFn::Unsupported(*x))))
        .unwrap_or_default()
}


/// Converts a number to a byte with wrapping semantics.
fn to_byte(x: f64) -> u8 {
    if x.is_finite() { (x.trunc() as i64).rem_euclid(256) as u8 } else { 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_resolves_constructors_and_stand_ins() {
        let graph = HostGraph::new("https://example.test");
        assert_eq!(graph.get_attr(HostObject::Global, "Object"), Value::Function(Function::Native(NativeFn::ObjectConstructor)));
        assert_eq!(graph.get_attr(HostObject::Global, "Array"), Value::Function(Function::Native(NativeFn::ArrayConstructor)));
        assert_eq!(graph.get_attr(HostObject::Global, "Uint8Array"), Value::Function(Function::Native(NativeFn::Uint8ArrayConstructor)));
        assert_eq!(graph.get_attr(HostObject::Global, "fs"), Value::Host(HostObject::Fs));
        assert_eq!(graph.get_attr(HostObject::Global, "missing"), Value::Undefined);
    }

    #[test]
    fn location_reports_the_configured_origin() {
        let graph = HostGraph::new("https://example.test");
        let location = graph.get_attr(HostObject::Global, "location");
        assert_eq!(graph.get(&location, "origin"), Value::from("https://example.test"));
    }

    #[test]
    fn window_holds_an_empty_document() {
        let graph = HostGraph::new("");
        let window = graph.get_attr(HostObject::Global, "window");
        let document = graph.get(&window, "document");
        assert!(matches!(&document, Value::Object(x) if x.lock().is_empty()));
        assert_eq!(graph.get(&window, "document"), document);
    }

    #[test]
    fn process_reports_sentinels() {
        let mut graph = HostGraph::new("");
        assert_eq!(graph.get_attr(HostObject::Process, "pid"), Value::Number(-1.0));
        let Value::Function(Function::Native(getuid)) = graph.get_attr(HostObject::Process, "getuid") else { panic!("getuid was not callable") };
        assert_eq!(graph.call_native(getuid, &[]), Ok(Value::Number(-1.0)));

        let Value::Function(Function::Native(cwd)) = graph.get_attr(HostObject::Process, "cwd") else { panic!("cwd was not callable") };
        let error = graph.call_native(cwd, &[]).expect_err("cwd should be unsupported");
        assert_eq!(error.field("code"), Value::from("ENOSYS"));
    }

    #[test]
    fn fs_constants_are_sentinels() {
        let graph = HostGraph::new("");
        let constants = graph.get_attr(HostObject::Fs, "constants");
        for name in FS_CONSTANTS {
            assert_eq!(graph.get(&constants, name), Value::Number(-1.0));
        }
    }

    #[test]
    fn assignments_overlay_host_objects() {
        let mut graph = HostGraph::new("");
        let callback = Value::Function(Function::Guest(7));
        graph.set(&Value::Host(HostObject::Global), "bder", callback.clone());
        assert_eq!(graph.get_attr(HostObject::Global, "bder"), callback);

        graph.delete(&Value::Host(HostObject::Global), "bder");
        assert_eq!(graph.get_attr(HostObject::Global, "bder"), Value::Undefined);
    }

    #[test]
    fn pending_events_are_visible_through_the_bridge() {
        let mut graph = HostGraph::new("");
        assert_eq!(graph.get_attr(HostObject::Bridge, "_pendingEvent"), Value::Null);

        let event = graph.queue_event(3, Value::Host(HostObject::Global), vec![Value::from("x")]);
        assert_eq!(graph.get_attr(HostObject::Bridge, "_pendingEvent"), event);
        assert_eq!(graph.get(&event, "id"), Value::Number(3.0));
        assert_eq!(graph.index(&graph.get(&event, "args"), 0), Value::from("x"));

        graph.set_attr(HostObject::Bridge, "_pendingEvent", Value::Null);
        assert_eq!(graph.pending_event(), &Value::Null);
    }

    #[test]
    fn func_wrappers_carry_the_guest_id() {
        let mut graph = HostGraph::new("");
        assert_eq!(graph.call_native(NativeFn::MakeFuncWrapper, &[Value::Number(12.0)]), Ok(Value::Function(Function::Guest(12))));
    }

    #[test]
    fn line_buffer_flushes_through_the_last_terminator() {
        let mut buffer = LineBuffer::default();
        assert_eq!(buffer.write(b"partial"), None);
        assert_eq!(buffer.write(b" line\nsecond\nrest"), Some("partial line\nsecond".to_string()));
        assert_eq!(buffer.pending(), b"rest");
        assert_eq!(buffer.write(b"\n"), Some("rest".to_string()));
        assert!(buffer.pending().is_empty());
    }

    #[test]
    fn write_sync_reports_bytes_and_rejects_other_descriptors() {
        let mut graph = HostGraph::new("");
        assert_eq!(graph.call_native(NativeFn::FsWriteSync, &[Value::Number(1.0), Value::bytes(b"hi\n".to_vec())]), Ok(Value::Number(3.0)));
        assert!(graph.write_sync(5, b"x").is_err());
    }

    #[test]
    fn sequences_support_indexing() {
        let mut graph = HostGraph::new("");
        let array = Value::array(Vec::new());
        graph.set_index(&array, 2, Value::from("c"));
        assert_eq!(array.length(), Some(3));
        assert_eq!(graph.index(&array, 0), Value::Undefined);
        assert_eq!(graph.index(&array, 2), Value::from("c"));

        let bytes = graph.construct(NativeFn::Uint8ArrayConstructor, &[Value::Number(2.0)]).expect("Could not construct bytes");
        graph.set_index(&bytes, 1, Value::Number(257.0));
        assert_eq!(graph.index(&bytes, 1), Value::Number(1.0));
        assert_eq!(graph.index(&bytes, 5), Value::Undefined);
        assert_eq!(graph.get(&bytes, "length"), Value::Number(2.0));
    }

    #[test]
    fn oversized_sequences_are_range_errors() {
        let mut graph = HostGraph::new("");
        let huge = [Value::Number(1e18)];
        let error = graph.construct(NativeFn::Uint8ArrayConstructor, &huge).expect_err("Buffer should be too large");
        assert_eq!(error.field("code"), Value::from("RangeError"));
        let error = graph.call_native(NativeFn::ArrayConstructor, &huge).expect_err("Array should be too large");
        assert_eq!(error.field("code"), Value::from("RangeError"));

        graph.limit_sequences(16);
        assert!(graph.construct(NativeFn::Uint8ArrayConstructor, &[Value::Number(16.0)]).is_ok());
        assert!(graph.construct(NativeFn::Uint8ArrayConstructor, &[Value::Number(17.0)]).is_err());

        let array = Value::array(Vec::new());
        graph.set_index(&array, 1 << 40, Value::Null);
        graph.set_index(&array, 16, Value::Null);
        assert_eq!(array.length(), Some(0));
        graph.set_index(&array, 15, Value::Null);
        assert_eq!(array.length(), Some(16));
    }

    #[test]
    fn instance_checks_follow_constructors() {
        let graph = HostGraph::new("");
        let array_class = graph.get_attr(HostObject::Global, "Array");
        let object_class = graph.get_attr(HostObject::Global, "Object");
        let array = Value::array(Vec::new());
        assert!(graph.instance_of(&array, &array_class));
        assert!(graph.instance_of(&array, &object_class));
        assert!(!graph.instance_of(&Value::from("s"), &object_class));
    }
}
