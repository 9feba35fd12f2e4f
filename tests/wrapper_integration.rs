//! End-to-end tests driving wrapped modules built from WAT fixtures.

use parking_lot::Mutex;
use std::sync::Arc;
use wasmglue::{
    FuncRef, GlueError, Imports, IntrinsicRegistry, Value, WasmRuntime, WrapOptions, WrappedModule,
};

/// Shared guest scaffold: one exported memory, a bump allocator that stores
/// the allocation length in the 8 bytes before the returned pointer, and a
/// bulk reset. The heap starts at 16384; lower offsets are static scratch.
const SCAFFOLD: &str = r#"
  (global $top (mut i32) (i32.const 16384))
  (func (export "alloc") (param $size i32) (result i32)
    (local $ptr i32)
    global.get $top
    i32.const 7
    i32.add
    i32.const -8
    i32.and
    local.set $ptr
    local.get $ptr
    local.get $size
    i32.store
    local.get $ptr
    i32.const 0
    i32.store offset=4
    local.get $ptr
    i32.const 8
    i32.add
    local.get $size
    i32.add
    global.set $top
    local.get $ptr
    i32.const 8
    i32.add)
  (func (export "reset")
    i32.const 16384
    global.set $top)
"#;

/// Fixture with scalar, buffer, extern, and function-reference exports.
fn core_wat() -> String {
    format!(
        r#"(module
  (memory (export "memory") 1 200)
  (table (export "table") 2 2 funcref)
  (elem (i32.const 0) func $make_int)
{SCAFFOLD}
  (func (export "identity") (param $v i32) (result i32)
    local.get $v)
  (func (export "half") (param $v f64) (result f64)
    local.get $v
    f64.const 0.5
    f64.mul)
  (func (export "is_nan") (param $v f64) (result i32)
    local.get $v
    local.get $v
    f64.ne)
  (func (export "sum") (param $ptr i32) (result i32)
    (local $len i32) (local $i i32) (local $acc i32)
    local.get $ptr
    i32.const 8
    i32.sub
    i32.load
    local.set $len
    (block $done
      (loop $next
        local.get $i
        local.get $len
        i32.ge_u
        br_if $done
        local.get $acc
        local.get $ptr
        local.get $i
        i32.add
        i32.load8_u
        i32.add
        local.set $acc
        local.get $i
        i32.const 1
        i32.add
        local.set $i
        br $next))
    local.get $acc)
  (func (export "strlen") (param $ptr i32) (result i32)
    local.get $ptr
    i32.const 8
    i32.sub
    i32.load)
  (func (export "u64_first") (param $ptr i32) (result i64)
    local.get $ptr
    i64.load)
  (func (export "grow") (param $pages i32) (result i32)
    local.get $pages
    memory.grow)
  (func (export "wrap_extern#lift") (param $h i32) (result i32)
    i32.const 1024
    i32.const 7
    i32.store offset=8
    i32.const 1024
    local.get $h
    i32.store offset=24
    i32.const 1024)
  (func (export "get_fn#lift") (result i32)
    i32.const 3072
    i32.const 8
    i32.store offset=8
    i32.const 3072
    i32.const 0
    i32.store offset=24
    i32.const 3072)
  (func $make_int (param $v i32) (result i32)
    i32.const 2048
    i32.const 0
    i32.store offset=8
    i32.const 2048
    local.get $v
    i32.store offset=24
    i32.const 2048)
)"#
    )
}

fn runtime() -> WasmRuntime {
    WasmRuntime::with_defaults().expect("runtime")
}

fn core_module(exports: &[&str]) -> WrappedModule {
    let rt = runtime();
    let wasm = wat::parse_str(core_wat()).expect("valid wat");
    WrappedModule::wrap(&rt, wasm, exports, Imports::new(), WrapOptions::default())
        .expect("wrap core module")
}

#[test]
fn instantiation_is_lazy() {
    let mut module = core_module(&["identity"]);
    assert!(!module.is_live());
    assert_eq!(module.instantiation_count(), 0);
    assert_eq!(module.memory_size(), None);

    let out = module.call("identity", &[Value::Int(5)]).unwrap();
    assert_eq!(out, Value::Int(5));
    assert!(module.is_live());
    assert_eq!(module.instantiation_count(), 1);
    assert_eq!(module.memory_size(), Some(65536));
}

#[test]
fn sum_over_bytes() {
    let mut module = core_module(&["sum"]);
    let out = module
        .call("sum", &[Value::from(vec![1u8, 2, 3, 4])])
        .unwrap();
    assert_eq!(out, Value::Int(10));
}

#[test]
fn extra_and_missing_arguments() {
    let mut module = core_module(&["identity", "is_nan"]);
    // extras beyond the arity are dropped
    let out = module
        .call("identity", &[Value::Int(3), Value::Int(9)])
        .unwrap();
    assert_eq!(out, Value::Int(3));
    // a missing float argument coerces to NaN
    let out = module.call("is_nan", &[]).unwrap();
    assert_eq!(out, Value::Int(1));
    let out = module.call("is_nan", &[Value::Float(2.0)]).unwrap();
    assert_eq!(out, Value::Int(0));
}

#[test]
fn float_params_and_results() {
    let mut module = core_module(&["half"]);
    let out = module.call("half", &[Value::Float(3.0)]).unwrap();
    assert_eq!(out, Value::Float(1.5));
    // integer arguments coerce to the declared float parameter
    let out = module.call("half", &[Value::Int(3)]).unwrap();
    assert_eq!(out, Value::Float(1.5));
}

#[test]
fn string_lowering_patches_written_length() {
    let mut module = core_module(&["strlen"]);
    let len = |m: &mut WrappedModule, s: &str| m.call("strlen", &[Value::string(s)]).unwrap();

    assert_eq!(len(&mut module, "hi"), Value::Int(2));
    // 3-byte code points exceed the 2-bytes-per-unit window and are
    // silently dropped
    assert_eq!(len(&mut module, "\u{2713}"), Value::Int(0));
    assert_eq!(len(&mut module, "a\u{2713}"), Value::Int(4));
}

#[test]
fn u64_array_lowering() {
    let mut module = core_module(&["u64_first"]);
    let out = module
        .call("u64_first", &[Value::U64Array(vec![7, 8])])
        .unwrap();
    assert_eq!(out, Value::Int(7));
}

#[test]
fn extern_handles_are_distinct_and_resolve_by_identity() {
    let mut module = core_module(&["identity", "wrap_extern#lift"]);

    let a = Value::extern_val("first".to_string());
    let b = Value::extern_val("second".to_string());
    let ha = module.call("identity", &[a.clone()]).unwrap();
    let hb = module.call("identity", &[b.clone()]).unwrap();
    // no deduplication, monotonic across arena resets
    assert_ne!(ha, hb);

    // a record referencing the handle lifts back to the same allocation
    let lifted = module.call("wrap_extern", &[a.clone()]).unwrap();
    assert_eq!(lifted, a);
}

#[test]
fn stale_extern_handle_errors() {
    let mut module = core_module(&["wrap_extern#lift"]);
    // 999 was never minted in this arena epoch
    let err = module.call("wrap_extern", &[Value::Int(999)]).unwrap_err();
    assert!(matches!(err, GlueError::ExternNotFound { handle: 999 }));
}

#[test]
fn arena_reset_clears_externs_after_each_call() {
    let mut module = core_module(&["identity"]);
    module
        .call("identity", &[Value::extern_val(1u8)])
        .unwrap();
    assert_eq!(module.extern_count(), 0);
}

#[test]
fn function_reference_lift_and_call() {
    let mut module = core_module(&["get_fn#lift"]);
    let out = module.call("get_fn", &[]).unwrap();
    let Value::Function(func_ref) = out else {
        panic!("expected function reference, got {out:?}");
    };
    assert_eq!(func_ref, FuncRef::new(0));

    let out = module.call_function(func_ref, &[Value::Int(21)]).unwrap();
    assert_eq!(out, Value::Int(21));
}

#[test]
fn empty_table_entry_errors() {
    let mut module = core_module(&["identity"]);
    module.call("identity", &[Value::Int(0)]).unwrap();
    // slot 1 exists but holds no function
    let err = module
        .call_function(FuncRef::new(1), &[])
        .unwrap_err();
    assert!(matches!(err, GlueError::TableEntryMissing { index: 1 }));
    // slot 5 is out of range entirely
    let err = module
        .call_function(FuncRef::new(5), &[])
        .unwrap_err();
    assert!(matches!(err, GlueError::TableEntryMissing { index: 5 }));
}

#[test]
fn memory_ceiling_recycles_instance() {
    let mut module = core_module(&["grow", "identity"]);
    // 161 pages is past the 10 MB ceiling, so cleanup disposes the instance
    let out = module.call("grow", &[Value::Int(160)]).unwrap();
    assert_eq!(out, Value::Int(1));
    assert!(!module.is_live());
    assert_eq!(module.instantiation_count(), 1);

    // the next call transparently re-instantiates with fresh memory
    let out = module.call("identity", &[Value::Int(9)]).unwrap();
    assert_eq!(out, Value::Int(9));
    assert_eq!(module.instantiation_count(), 2);
    assert_eq!(module.memory_size(), Some(65536));
}

#[test]
fn no_auto_free_defers_reset_to_caller() {
    let rt = runtime();
    let wasm = wat::parse_str(core_wat()).unwrap();
    let mut module = WrappedModule::wrap(
        &rt,
        wasm,
        &["identity"],
        Imports::new(),
        WrapOptions::default().with_no_auto_free(true),
    )
    .unwrap();

    module.call("identity", &[Value::extern_val(1u8)]).unwrap();
    assert_eq!(module.extern_count(), 1);
    module.call("identity", &[Value::extern_val(2u8)]).unwrap();
    assert_eq!(module.extern_count(), 2);

    module.reset().unwrap();
    assert_eq!(module.extern_count(), 0);
    // reset with nothing outstanding is a no-op
    module.reset().unwrap();
}

#[test]
fn unsupported_argument_types() {
    let mut module = core_module(&["identity"]);
    let err = module.call("identity", &[Value::Bool(true)]).unwrap_err();
    assert!(matches!(
        err,
        GlueError::UnsupportedValue { type_name: "bool" }
    ));
    let err = module
        .call("identity", &[Value::Function(FuncRef::new(0))])
        .unwrap_err();
    assert!(matches!(
        err,
        GlueError::UnsupportedValue {
            type_name: "function"
        }
    ));
}

#[test]
fn non_function_export_degenerates_to_extern() {
    let mut module = core_module(&["memory", "identity"]);
    let out = module.call("memory", &[]).unwrap();
    assert!(matches!(out, Value::Extern(_)));
    // nothing ran, so no arena state was touched
    assert_eq!(module.extern_count(), 0);
}

#[test]
fn unknown_export_errors() {
    let mut module = core_module(&["identity"]);
    let err = module.call("missing", &[]).unwrap_err();
    assert!(matches!(err, GlueError::ExportMissing { .. }));
}

#[test]
fn export_listing() {
    let module = core_module(&["sum", "wrap_extern#lift", "identity"]);
    let names: Vec<&str> = module.export_names().collect();
    assert_eq!(names, vec!["sum", "wrap_extern", "identity"]);
    assert!(module.has_export("wrap_extern"));
    assert!(!module.has_export("wrap_extern#lift"));
}

#[test]
fn base64_source_round_trip() {
    use base64::Engine as _;

    let rt = runtime();
    let wasm = wat::parse_str(core_wat()).unwrap();
    let encoded = base64::engine::general_purpose::STANDARD.encode(&wasm);
    let mut module = WrappedModule::wrap(
        &rt,
        encoded.as_str(),
        &["sum"],
        Imports::new(),
        WrapOptions::default(),
    )
    .unwrap();
    let out = module
        .call("sum", &[Value::from(vec![10u8, 20, 30])])
        .unwrap();
    assert_eq!(out, Value::Int(60));
}

#[test]
fn identical_bytes_share_one_cached_module() {
    let rt = runtime();
    let wasm = wat::parse_str(core_wat()).unwrap();
    let _a = WrappedModule::wrap(
        &rt,
        wasm.clone(),
        &["sum"],
        Imports::new(),
        WrapOptions::default(),
    )
    .unwrap();
    let _b = WrappedModule::wrap(&rt, wasm, &["sum"], Imports::new(), WrapOptions::default())
        .unwrap();
    assert_eq!(rt.cache_size(), 1);
}

// ---------------------------------------------------------------------------
// Static record fixtures
// ---------------------------------------------------------------------------

/// Builds tagged-record bytes in the 16-byte cell layout, with out-of-line
/// buffers in a separate heap segment.
struct RecordBytes {
    record: Vec<u8>,
}

struct RecordHeap {
    bytes: Vec<u8>,
    base: u32,
}

impl RecordBytes {
    fn new() -> Self {
        Self { record: Vec::new() }
    }

    fn cell(&mut self, payload: &[u8]) -> &mut Self {
        assert!(payload.len() <= 8);
        self.record.extend_from_slice(&[0u8; 8]);
        let mut slot = [0u8; 8];
        slot[..payload.len()].copy_from_slice(payload);
        self.record.extend_from_slice(&slot);
        self
    }

    fn tag(&mut self, tag: u8) -> &mut Self {
        self.cell(&[tag])
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.cell(&v.to_le_bytes())
    }

    fn string(&mut self, s: &str, heap: &mut RecordHeap) -> &mut Self {
        let ptr = heap.base + heap.bytes.len() as u32;
        heap.bytes.extend_from_slice(s.as_bytes());
        self.tag(4);
        self.u32(ptr);
        self.u32(s.len() as u32)
    }
}

fn wat_escape(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    let mut out = String::with_capacity(bytes.len() * 3);
    for b in bytes {
        let _ = write!(out, "\\{b:02x}");
    }
    out
}

/// Fixture exporting pointers to prebuilt OBJECT and STRING records.
fn records_wat() -> String {
    let mut heap = RecordHeap {
        bytes: Vec::new(),
        base: 8192,
    };

    // {a: 1, b: "x"} as an OBJECT of [key, value] ARRAY pairs
    let mut obj = RecordBytes::new();
    obj.tag(6).u32(2);
    obj.tag(5).u32(2);
    obj.string("a", &mut heap);
    obj.tag(0).u32(1);
    obj.tag(5).u32(2);
    obj.string("b", &mut heap);
    obj.string("x", &mut heap);

    let mut greet = RecordBytes::new();
    greet.string("hey", &mut heap);

    format!(
        r#"(module
  (memory (export "memory") 1)
{SCAFFOLD}
  (func (export "get_obj#lift") (result i32)
    i32.const 4096)
  (func (export "greet#lift") (result i32)
    i32.const 6144)
  (data (i32.const 4096) "{obj}")
  (data (i32.const 6144) "{greet}")
  (data (i32.const 8192) "{heap}")
)"#,
        obj = wat_escape(&obj.record),
        greet = wat_escape(&greet.record),
        heap = wat_escape(&heap.bytes),
    )
}

#[test]
fn object_lift_preserves_insertion_order() {
    let rt = runtime();
    let wasm = wat::parse_str(records_wat()).expect("valid wat");
    let mut module = WrappedModule::wrap(
        &rt,
        wasm,
        &["get_obj#lift", "greet#lift"],
        Imports::new(),
        WrapOptions::default(),
    )
    .unwrap();

    let out = module.call("get_obj", &[]).unwrap();
    assert_eq!(
        out,
        Value::Object(vec![
            ("a".to_string(), Value::Int(1)),
            ("b".to_string(), Value::string("x")),
        ])
    );
    assert_eq!(out.get("b").and_then(|v| v.as_str()), Some("x"));

    let out = module.call("greet", &[]).unwrap();
    assert_eq!(out, Value::string("hey"));
}

#[test]
fn call_function_without_table_errors() {
    let rt = runtime();
    let wasm = wat::parse_str(records_wat()).unwrap();
    let mut module = WrappedModule::wrap(
        &rt,
        wasm,
        &["greet#lift"],
        Imports::new(),
        WrapOptions::default(),
    )
    .unwrap();
    let err = module
        .call_function(FuncRef::new(0), &[])
        .unwrap_err();
    assert!(matches!(err, GlueError::TableMissing));
}

// ---------------------------------------------------------------------------
// Import binding
// ---------------------------------------------------------------------------

fn imports_wat() -> String {
    format!(
        r#"(module
  (import "./env.js" "add_one" (func $add_one (param i32) (result i32)))
  (import "./env.js" "log#lift" (func $log (param i32) (result i32)))
  (import "./env.js" "memsize#instance" (func $memsize (result i32)))
  (import "./env.js" "memsize_plain" (func $memsize_plain (result i32)))
  (import "./env.js" "poke#instance" (func $poke (result i32)))
  (import "./env.js" "sink#instance,lift" (func $sink (param i32) (result i32)))
  (import "js" "console.log" (func $clog (param i32) (result i32)))
  (memory (export "memory") 1)
{SCAFFOLD}
  (func (export "host_add") (param $v i32) (result i32)
    local.get $v
    call $add_one)
  (func (export "send_int") (param $v i32) (result i32)
    i32.const 2048
    i32.const 0
    i32.store offset=8
    i32.const 2048
    local.get $v
    i32.store offset=24
    i32.const 2048
    call $log)
  (func (export "mem_ok") (result i32)
    call $memsize)
  (func (export "mem_bad") (result i32)
    call $memsize_plain)
  (func (export "poke_read") (result i32)
    call $poke
    drop
    i32.const 512
    i32.load8_u)
  (func (export "console_hi") (result i32)
    i32.const 99
    call $clog)
  (func (export "sink_int") (param $v i32) (result i32)
    i32.const 2560
    i32.const 0
    i32.store offset=8
    i32.const 2560
    local.get $v
    i32.store offset=24
    i32.const 2560
    call $sink)
)"#
    )
}

fn imports_module(seen: Arc<Mutex<Vec<Value>>>) -> WrappedModule {
    let rt = runtime();
    let wasm = wat::parse_str(imports_wat()).expect("valid wat");
    let imports = Imports::new()
        .with_func("./env.js", "add_one", |_, args| {
            Ok(Value::Int(args[0].as_i32().unwrap_or(0) + 1))
        })
        .with_func("./env.js", "log#lift", {
            let seen = Arc::clone(&seen);
            move |_, args| {
                seen.lock().push(args[0].clone());
                Ok(Value::Null)
            }
        })
        .with_func("./env.js", "sink#instance,lift", move |ctx, args| {
            let size = ctx.memory_size()?;
            let mut seen = seen.lock();
            seen.push(Value::Int(size as i32));
            seen.push(args[0].clone());
            Ok(Value::Null)
        })
        .with_func("./env.js", "memsize#instance", |ctx, _| {
            Ok(Value::Int(ctx.memory_size()? as i32))
        })
        .with_func("./env.js", "memsize_plain", |ctx, _| {
            Ok(Value::Int(ctx.memory_size()? as i32))
        })
        .with_func("./env.js", "poke#instance", |ctx, _| {
            ctx.write_memory(512, &[42])?;
            Ok(Value::Null)
        });
    WrappedModule::wrap(
        &rt,
        wasm,
        &[
            "host_add",
            "send_int",
            "mem_ok",
            "mem_bad",
            "poke_read",
            "console_hi",
            "sink_int",
        ],
        imports,
        WrapOptions::default(),
    )
    .expect("wrap imports module")
}

#[test]
fn host_import_round_trip() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut module = imports_module(Arc::clone(&seen));
    let out = module.call("host_add", &[Value::Int(41)]).unwrap();
    assert_eq!(out, Value::Int(42));
}

#[test]
fn lift_flag_decodes_import_arguments() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut module = imports_module(Arc::clone(&seen));
    module.call("send_int", &[Value::Int(7)]).unwrap();
    assert_eq!(*seen.lock(), vec![Value::Int(7)]);
}

#[test]
fn instance_flag_gates_memory_access() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut module = imports_module(seen);

    let out = module.call("mem_ok", &[]).unwrap();
    assert_eq!(out, Value::Int(65536));

    // same host closure, but bound without the instance flag
    let err = module.call("mem_bad", &[]).unwrap_err();
    assert!(matches!(err, GlueError::InstanceNotExposed));
    assert!(err.to_string().starts_with("E204"));
}

#[test]
fn instance_and_lift_flags_combine() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut module = imports_module(Arc::clone(&seen));
    module.call("sink_int", &[Value::Int(7)]).unwrap();
    // the closure saw the instance memory and the decoded argument
    assert_eq!(*seen.lock(), vec![Value::Int(65536), Value::Int(7)]);
}

#[test]
fn instance_flag_allows_memory_writes() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut module = imports_module(seen);
    let out = module.call("poke_read", &[]).unwrap();
    assert_eq!(out, Value::Int(42));
}

#[test]
fn reserved_module_resolves_intrinsics_by_name() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut module = imports_module(seen);
    let out = module.call("console_hi", &[]).unwrap();
    // console.log returns nothing, which lowers to 0
    assert_eq!(out, Value::Int(0));
}

#[test]
fn missing_import_fails_at_wrap_time() {
    let rt = runtime();
    let wasm = wat::parse_str(
        r#"(module
  (import "./env.js" "nope" (func))
  (memory (export "memory") 1)
)"#,
    )
    .unwrap();
    let err = WrappedModule::wrap(&rt, wasm, &[], Imports::new(), WrapOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        GlueError::ImportMissing { module, name } if module == "./env.js" && name == "nope"
    ));
}

#[test]
fn unknown_intrinsic_fails_at_wrap_time() {
    let rt = runtime();
    let wasm = wat::parse_str(
        r#"(module
  (import "js" "document.write" (func))
  (memory (export "memory") 1)
)"#,
    )
    .unwrap();
    let err = WrappedModule::wrap(&rt, wasm, &[], Imports::new(), WrapOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        GlueError::IntrinsicUnknown { name } if name == "document.write"
    ));
}

#[test]
fn explicit_intrinsic_binding_outside_reserved_module() {
    let rt = runtime();
    let wasm = wat::parse_str(
        r#"(module
  (import "./env.js" "warn" (func $warn (param i32) (result i32)))
  (memory (export "memory") 1)
  (global $top (mut i32) (i32.const 16384))
  (func (export "alloc") (param $size i32) (result i32)
    global.get $top
    local.get $size
    i32.store
    global.get $top
    i32.const 8
    i32.add
    local.get $size
    i32.add
    global.set $top
    global.get $top
    local.get $size
    i32.sub)
  (func (export "reset")
    i32.const 16384
    global.set $top)
  (func (export "shout") (result i32)
    i32.const 3
    call $warn)
)"#,
    )
    .unwrap();
    let imports = Imports::new().with_intrinsic("./env.js", "warn", "console.warn");
    let mut module = WrappedModule::wrap(
        &rt,
        wasm,
        &["shout"],
        imports,
        WrapOptions::default().with_intrinsics(IntrinsicRegistry::new()),
    )
    .unwrap();
    let out = module.call("shout", &[]).unwrap();
    assert_eq!(out, Value::Int(0));
}
