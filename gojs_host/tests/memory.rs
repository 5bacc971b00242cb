use gojs_host::*;
use wasm_runtime_layer::{Engine, Extern, Imports, Instance, Module, Store};

/// Instantiates a module with one page of exported memory.
fn memory() -> (Store<(), wasmi_runtime_layer::Engine>, LinearMemory) {
    let engine = Engine::new(wasmi_runtime_layer::Engine::default());
    let mut store = Store::new(&engine, ());
    let bytecode = wat::parse_str(r#"(module (memory (export "mem") 1))"#).expect("Could not assemble module");
    let module = Module::new(&engine, &bytecode[..]).expect("Could not compile module");
    let instance = Instance::new(&mut store, &module, &Imports::new()).expect("Could not instantiate module");
    let Some(Extern::Memory(memory)) = instance.get_export(&store, "mem") else { panic!("Module had no memory") };
    (store, LinearMemory::new(memory))
}

#[test]
fn writes_past_the_end_grow_by_whole_pages() {
    let (mut store, memory) = memory();
    assert_eq!(memory.pages(&store), 1);

    memory.write(&mut store, 70_000, b"grown").expect("Could not write");
    assert_eq!(memory.pages(&store), 2);
    assert_eq!(memory.size(&store), 2 * PAGE_SIZE);
    assert_eq!(memory.read_vec(&store, 70_000, 5).expect("Could not read"), b"grown");

    memory.write(&mut store, 4 * PAGE_SIZE as u32 + 1, &[1]).expect("Could not write");
    assert_eq!(memory.pages(&store), 5);
}

#[test]
fn writes_inside_memory_do_not_grow() {
    let (mut store, memory) = memory();
    memory.write(&mut store, PAGE_SIZE as u32 - 4, &[1, 2, 3, 4]).expect("Could not write");
    assert_eq!(memory.pages(&store), 1);
}

#[test]
fn reads_past_the_end_are_protocol_errors() {
    let (store, memory) = memory();
    assert!(matches!(memory.get_u64(&store, PAGE_SIZE as u32 - 4, Endian::Little), Err(GuestError::ProtocolMismatch(_))));
    assert_eq!(memory.pages(&store), 1);
}

#[test]
fn typed_accessors_respect_byte_order() {
    let (mut store, memory) = memory();
    memory.set_u32(&mut store, 16, 0x0102_0304, Endian::Little).expect("Could not write");
    assert_eq!(memory.read_vec(&store, 16, 4).expect("Could not read"), [4, 3, 2, 1]);
    assert_eq!(memory.get_u32(&store, 16, Endian::Big).expect("Could not read"), 0x0403_0201);

    memory.set_f64(&mut store, 32, -2.5, Endian::Little).expect("Could not write");
    assert_eq!(memory.get_f64(&store, 32, Endian::Little).expect("Could not read"), -2.5);

    memory.set_i16(&mut store, 48, -2, Endian::Big).expect("Could not write");
    assert_eq!(memory.read_vec(&store, 48, 2).expect("Could not read"), [0xFF, 0xFE]);
}
