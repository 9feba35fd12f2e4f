//! Tagged value codec: the private wire format for values crossing the
//! boundary.
//!
//! Numbers pass by value; everything else passes by pointer into freshly
//! allocated arena memory. A lifted record is a sequence of 16-byte cells,
//! each an 8-byte allocation-length header followed by an 8-byte payload
//! slot. Multi-byte integers are little-endian. Reading is strictly
//! forward-advancing over an offset cursor; there is no backward seeking and
//! no depth limit, so malformed input can exhaust host recursion.

use crate::error::{GlueError, Result};
use crate::externs::ExternTable;
use crate::instance::HostState;
use crate::value::{FuncRef, Value};
use wasmtime::{AsContext, AsContextMut, Memory, TypedFunc, Val, ValType};

/// Size of a cell's allocation-length header.
const CELL_HEADER: usize = 8;
/// Size of a cell's payload slot.
const CELL_DATA: usize = 8;

/// Type tag of a lifted record. The numbering is the wire ABI and must not
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    /// 4-byte signed integer.
    Int = 0,
    /// 8-byte IEEE double.
    Float = 1,
    /// 1-byte flag.
    Bool = 2,
    /// Pointer + length to a raw byte buffer.
    Bytes = 3,
    /// Pointer + length to UTF-8 text.
    Str = 4,
    /// Count followed by recursively-read elements.
    Array = 5,
    /// Count followed by recursively-read `[key, value]` pairs.
    Object = 6,
    /// Integer handle into the extern table.
    Extern = 7,
    /// Index into the guest's function table.
    Function = 8,
    /// Pointer + length to a buffer of unsigned 64-bit elements.
    U64Array = 9,
}

impl Tag {
    /// Decode a tag byte, rejecting anything outside the closed set.
    pub fn from_byte(byte: u8, offset: usize) -> Result<Self> {
        match byte {
            0 => Ok(Self::Int),
            1 => Ok(Self::Float),
            2 => Ok(Self::Bool),
            3 => Ok(Self::Bytes),
            4 => Ok(Self::Str),
            5 => Ok(Self::Array),
            6 => Ok(Self::Object),
            7 => Ok(Self::Extern),
            8 => Ok(Self::Function),
            9 => Ok(Self::U64Array),
            tag => Err(GlueError::UnknownTag { tag, offset }),
        }
    }
}

fn read_u8(mem: &[u8], offset: usize) -> Result<u8> {
    mem.get(offset)
        .copied()
        .ok_or(GlueError::MemoryOutOfBounds { offset, len: 1 })
}

fn read_u32(mem: &[u8], offset: usize) -> Result<u32> {
    let bytes = mem
        .get(offset..offset + 4)
        .ok_or(GlueError::MemoryOutOfBounds { offset, len: 4 })?;
    Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
}

fn read_i32(mem: &[u8], offset: usize) -> Result<i32> {
    Ok(read_u32(mem, offset)? as i32)
}

fn read_f64(mem: &[u8], offset: usize) -> Result<f64> {
    let bytes = mem
        .get(offset..offset + 8)
        .ok_or(GlueError::MemoryOutOfBounds { offset, len: 8 })?;
    Ok(f64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
}

fn read_buffer<'m>(mem: &'m [u8], pointer: u32, len: u32) -> Result<&'m [u8]> {
    let start = pointer as usize;
    let end = start + len as usize;
    mem.get(start..end).ok_or(GlueError::MemoryOutOfBounds {
        offset: start,
        len: len as usize,
    })
}

/// Read one tagged record at the cursor, advancing it past the record.
///
/// Recursive for ARRAY/OBJECT; EXTERN handles resolve through `externs` by
/// identity.
pub(crate) fn read_value(mem: &[u8], cursor: &mut usize, externs: &ExternTable) -> Result<Value> {
    *cursor += CELL_HEADER;
    let tag_offset = *cursor;
    let tag = Tag::from_byte(read_u8(mem, tag_offset)?, tag_offset)?;
    *cursor += CELL_DATA;

    match tag {
        Tag::Int => {
            *cursor += CELL_HEADER;
            let v = read_i32(mem, *cursor)?;
            *cursor += CELL_DATA;
            Ok(Value::Int(v))
        }
        Tag::Float => {
            *cursor += CELL_HEADER;
            let v = read_f64(mem, *cursor)?;
            *cursor += CELL_DATA;
            Ok(Value::Float(v))
        }
        Tag::Bool => {
            *cursor += CELL_HEADER;
            let v = read_u8(mem, *cursor)? != 0;
            *cursor += CELL_DATA;
            Ok(Value::Bool(v))
        }
        Tag::Bytes | Tag::Str | Tag::U64Array => {
            *cursor += CELL_HEADER;
            let pointer = read_u32(mem, *cursor)?;
            *cursor += CELL_DATA;
            *cursor += CELL_HEADER;
            let len = read_u32(mem, *cursor)?;
            *cursor += CELL_DATA;
            let buffer = read_buffer(mem, pointer, len)?;
            match tag {
                Tag::Bytes => Ok(Value::Bytes(buffer.to_vec())),
                Tag::Str => {
                    let s = std::str::from_utf8(buffer).map_err(|e| {
                        GlueError::MalformedRecord {
                            offset: pointer as usize,
                            cause: format!("invalid UTF-8: {e}"),
                        }
                    })?;
                    Ok(Value::Str(s.to_string()))
                }
                _ => {
                    if len % 8 != 0 {
                        return Err(GlueError::MalformedRecord {
                            offset: pointer as usize,
                            cause: format!("u64 array byte length {len} not a multiple of 8"),
                        });
                    }
                    let elems = buffer
                        .chunks_exact(8)
                        .map(|c| u64::from_le_bytes(c.try_into().expect("8-byte chunk")))
                        .collect();
                    Ok(Value::U64Array(elems))
                }
            }
        }
        Tag::Array | Tag::Object => {
            *cursor += CELL_HEADER;
            let count_offset = *cursor;
            let count = read_u8(mem, count_offset)? as usize;
            *cursor += CELL_DATA;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(read_value(mem, cursor, externs)?);
            }
            if tag == Tag::Array {
                Ok(Value::Array(items))
            } else {
                object_from_pairs(items, count_offset)
            }
        }
        Tag::Extern => {
            *cursor += CELL_HEADER;
            let handle = read_i32(mem, *cursor)? as u32;
            *cursor += CELL_DATA;
            Ok(externs.get(handle)?.clone())
        }
        Tag::Function => {
            *cursor += CELL_HEADER;
            let index = read_i32(mem, *cursor)? as u32;
            *cursor += CELL_DATA;
            Ok(Value::Function(FuncRef::new(index)))
        }
    }
}

/// Assemble an object from decoded `[key, value]` pairs.
///
/// Duplicate keys keep their first position and take the last value.
fn object_from_pairs(items: Vec<Value>, offset: usize) -> Result<Value> {
    let mut pairs: Vec<(String, Value)> = Vec::with_capacity(items.len());
    for item in items {
        let Value::Array(mut pair) = item else {
            return Err(GlueError::MalformedRecord {
                offset,
                cause: "object entry is not a [key, value] pair".to_string(),
            });
        };
        if pair.len() != 2 {
            return Err(GlueError::MalformedRecord {
                offset,
                cause: format!("object entry has {} elements, expected 2", pair.len()),
            });
        }
        let value = pair.pop().expect("pair has 2 elements");
        let Value::Str(key) = pair.pop().expect("pair has 2 elements") else {
            return Err(GlueError::MalformedRecord {
                offset,
                cause: "object key is not a string".to_string(),
            });
        };
        if let Some(existing) = pairs.iter_mut().find(|(k, _)| *k == key) {
            existing.1 = value;
        } else {
            pairs.push((key, value));
        }
    }
    Ok(Value::Object(pairs))
}

/// Decode the tagged record at `ptr` in the instance's linear memory.
pub(crate) fn lift(
    store: impl AsContext<Data = HostState>,
    memory: Memory,
    ptr: u32,
) -> Result<Value> {
    let ctx = store.as_context();
    let mem = memory.data(&ctx);
    let externs = &ctx.data().externs;
    let mut cursor = ptr as usize;
    read_value(mem, &mut cursor, externs)
}

/// A host value encoded for the guest calling convention: either a scalar
/// passed by value, or a pointer/handle passed as an integer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Lowered {
    /// Absent value; coerces to 0 for integer params and NaN for floats.
    Absent,
    /// Integer passed by value.
    Int(i32),
    /// Float passed by value.
    Float(f64),
    /// Pointer into freshly allocated arena memory.
    Ptr(u32),
    /// Extern table handle.
    Handle(u32),
}

impl Lowered {
    /// Coerce to the callee's declared parameter type.
    pub(crate) fn to_val(self, ty: &ValType) -> Val {
        let as_f64 = |ty: &ValType, v: f64| match ty {
            ValType::I32 => Val::I32(v as i32),
            ValType::I64 => Val::I64(v as i64),
            ValType::F32 => Val::F32((v as f32).to_bits()),
            ValType::F64 => Val::F64(v.to_bits()),
            _ => Val::I32(0),
        };
        match self {
            Self::Absent => as_f64(ty, f64::NAN),
            Self::Int(i) => match ty {
                ValType::I32 => Val::I32(i),
                ValType::I64 => Val::I64(i64::from(i)),
                _ => as_f64(ty, f64::from(i)),
            },
            Self::Float(f) => as_f64(ty, f),
            Self::Ptr(p) | Self::Handle(p) => match ty {
                ValType::I32 => Val::I32(p as i32),
                ValType::I64 => Val::I64(i64::from(p)),
                _ => as_f64(ty, f64::from(p)),
            },
        }
    }
}

/// The number of bytes `alloc` is asked for when lowering a string of
/// `units` UTF-16 code units.
fn string_alloc_size(units: usize) -> u32 {
    (4 * units) as u32
}

/// The write window for string lowering.
///
/// Deliberately smaller than the allocation: UTF-8 sequences needing 3 bytes
/// per UTF-16 unit can exceed it, in which case encoding truncates silently
/// at a char boundary. This matches the reference behavior; see the crate
/// docs for the known risk.
fn string_write_window(units: usize) -> usize {
    2 * units
}

/// Encode a host value into the guest calling convention.
///
/// Numbers and the absent sentinel pass through by value; strings and
/// byte-like buffers are copied into freshly `alloc`ed arena memory; anything
/// else storable goes into the extern table under a fresh handle. `Bool` and
/// `Function` arguments have no lowering rule and fail the call.
pub(crate) fn lower(
    mut store: impl AsContextMut<Data = HostState>,
    memory: Memory,
    alloc: &TypedFunc<u32, u32>,
    value: &Value,
) -> Result<Lowered> {
    match value {
        Value::Null => Ok(Lowered::Absent),
        Value::Int(i) => Ok(Lowered::Int(*i)),
        Value::Float(f) => Ok(Lowered::Float(*f)),
        Value::Str(s) => lower_string(&mut store, memory, alloc, s),
        Value::Bytes(b) => {
            let ptr = alloc_and_copy(&mut store, memory, alloc, b)?;
            Ok(Lowered::Ptr(ptr))
        }
        Value::U64Array(elems) => {
            let mut bytes = Vec::with_capacity(elems.len() * 8);
            for e in elems {
                bytes.extend_from_slice(&e.to_le_bytes());
            }
            let ptr = alloc_and_copy(&mut store, memory, alloc, &bytes)?;
            Ok(Lowered::Ptr(ptr))
        }
        Value::Array(_) | Value::Object(_) | Value::Extern(_) => {
            let handle = store
                .as_context_mut()
                .data_mut()
                .externs
                .insert(value.clone());
            Ok(Lowered::Handle(handle))
        }
        Value::Bool(_) | Value::Function(_) => Err(GlueError::UnsupportedValue {
            type_name: value.type_name(),
        }),
    }
}

/// Call the guest allocator and copy `data` into the returned region.
fn alloc_and_copy(
    store: &mut impl AsContextMut<Data = HostState>,
    memory: Memory,
    alloc: &TypedFunc<u32, u32>,
    data: &[u8],
) -> Result<u32> {
    let len = data.len() as u32;
    let ptr = alloc
        .call(&mut *store, len)
        .map_err(|e| GlueError::AllocFailed {
            requested: u64::from(len),
            cause: e.to_string(),
        })?;
    if !data.is_empty() {
        let mem = memory.data_mut(&mut *store);
        let dest = mem
            .get_mut(ptr as usize..ptr as usize + data.len())
            .ok_or(GlueError::MemoryOutOfBounds {
                offset: ptr as usize,
                len: data.len(),
            })?;
        dest.copy_from_slice(data);
    }
    Ok(ptr)
}

/// Lower a string: allocate by the conservative size heuristic, UTF-8-encode
/// into the write window (truncating at a char boundary on overflow), and
/// patch the actual byte count into the length header preceding the data.
fn lower_string(
    store: &mut impl AsContextMut<Data = HostState>,
    memory: Memory,
    alloc: &TypedFunc<u32, u32>,
    s: &str,
) -> Result<Lowered> {
    let units = s.encode_utf16().count();
    let capacity = string_alloc_size(units);
    let ptr = alloc
        .call(&mut *store, capacity)
        .map_err(|e| GlueError::AllocFailed {
            requested: u64::from(capacity),
            cause: e.to_string(),
        })?;

    let window = string_write_window(units);
    let mut written = 0usize;
    for ch in s.chars() {
        let next = written + ch.len_utf8();
        if next > window {
            break;
        }
        written = next;
    }

    let mem = memory.data_mut(&mut *store);
    if written > 0 {
        let dest = mem
            .get_mut(ptr as usize..ptr as usize + written)
            .ok_or(GlueError::MemoryOutOfBounds {
                offset: ptr as usize,
                len: written,
            })?;
        dest.copy_from_slice(&s.as_bytes()[..written]);
    }

    // Shrink the allocation's length header to the byte count actually
    // written. Only ever a decrease, which the guest allocator permits.
    let header = (ptr as usize).checked_sub(CELL_HEADER).ok_or(
        GlueError::MemoryOutOfBounds {
            offset: ptr as usize,
            len: CELL_HEADER,
        },
    )?;
    let slot = mem
        .get_mut(header..header + 4)
        .ok_or(GlueError::MemoryOutOfBounds {
            offset: header,
            len: 4,
        })?;
    slot.copy_from_slice(&(written as u32).to_le_bytes());

    Ok(Lowered::Ptr(ptr))
}

/// Interpret a raw (unlifted) guest value as a host value.
pub(crate) fn raw_to_value(val: &Val) -> Value {
    match val {
        Val::I32(i) => Value::Int(*i),
        Val::I64(i) => {
            if let Ok(narrow) = i32::try_from(*i) {
                Value::Int(narrow)
            } else {
                Value::Float(*i as f64)
            }
        }
        Val::F32(bits) => Value::Float(f64::from(f32::from_bits(*bits))),
        Val::F64(bits) => Value::Float(f64::from_bits(*bits)),
        _ => Value::Null,
    }
}

/// Interpret a guest value as a pointer into linear memory.
pub(crate) fn val_as_ptr(val: &Val) -> Result<u32> {
    match val {
        Val::I32(i) => Ok(*i as u32),
        other => Err(GlueError::MalformedRecord {
            offset: 0,
            cause: format!("expected i32 pointer argument, got {other:?}"),
        }),
    }
}

/// A zero-filled value of the given type, used to pre-size result slices for
/// dynamic calls.
pub(crate) fn zero_val(ty: &ValType) -> Val {
    match ty {
        ValType::I32 => Val::I32(0),
        ValType::I64 => Val::I64(0),
        ValType::F32 => Val::F32(0),
        ValType::F64 => Val::F64(0),
        ValType::V128 => Val::V128(0u128.into()),
        _ => Val::FuncRef(None),
    }
}
