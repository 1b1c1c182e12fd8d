//! Typed memory serializer: walks a `TypeInfo` tree starting at an address
//! and produces JSON, with depth and cycle limits so arbitrary pointer
//! graphs always terminate.
//!
//! Failures are contained per field: a bad sub-read yields a sentinel
//! string in that slot, never an error for the enclosing struct.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::framework::MemoryAccess;

pub const MAX_SERIALIZE_DEPTH: u8 = 10;
const MAX_ARRAY_ELEMENTS: usize = 100;
const BYTES_HEX_PREFIX: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeKind {
    Int,
    Uint,
    Float,
    Pointer,
    Struct,
    Array,
    Bytes,
}

/// Shape of a value in target memory, as resolved by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeInfo {
    pub kind: TypeKind,
    pub byte_size: u32,
    #[serde(default)]
    pub signed: bool,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub pointee: Option<Box<TypeInfo>>,
    #[serde(default)]
    pub element: Option<Box<TypeInfo>>,
    #[serde(default)]
    pub count: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub name: String,
    pub offset: u64,
    #[serde(rename = "type")]
    pub ty: TypeInfo,
}

impl TypeInfo {
    pub fn scalar(kind: TypeKind, byte_size: u32, signed: bool) -> Self {
        Self {
            kind,
            byte_size,
            signed,
            members: Vec::new(),
            pointee: None,
            element: None,
            count: None,
        }
    }
}

/// One serialization pass. Holds the per-invocation visited set; build a
/// fresh one per top-level call.
pub struct Serializer<'a> {
    mem: &'a dyn MemoryAccess,
    max_depth: u8,
}

impl<'a> Serializer<'a> {
    pub fn new(mem: &'a dyn MemoryAccess, max_depth: u8) -> Self {
        Self {
            mem,
            max_depth: max_depth.clamp(1, MAX_SERIALIZE_DEPTH),
        }
    }

    pub fn serialize(&self, addr: u64, ty: &TypeInfo) -> Value {
        let mut visited = HashSet::new();
        self.walk(addr, ty, 0, &mut visited)
    }

    fn walk(&self, addr: u64, ty: &TypeInfo, depth: u8, visited: &mut HashSet<u64>) -> Value {
        if depth > self.max_depth {
            return json!(format!("<max depth {} reached>", self.max_depth));
        }
        match ty.kind {
            TypeKind::Int | TypeKind::Uint => self.read_integer(addr, ty),
            TypeKind::Float => self.read_float(addr, ty),
            TypeKind::Pointer => self.read_pointer(addr, ty, depth, visited),
            TypeKind::Struct => {
                let mut map = serde_json::Map::new();
                for member in &ty.members {
                    let value =
                        self.walk(addr.wrapping_add(member.offset), &member.ty, depth + 1, visited);
                    map.insert(member.name.clone(), value);
                }
                Value::Object(map)
            }
            TypeKind::Array => self.read_array(addr, ty, depth, visited),
            TypeKind::Bytes => self.read_bytes(addr, ty),
        }
    }

    fn read_raw(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        if addr == 0 || !self.mem.is_readable(addr, len) {
            return None;
        }
        let mut buf = vec![0u8; len];
        self.mem.read(addr, &mut buf).ok()?;
        Some(buf)
    }

    fn read_integer(&self, addr: u64, ty: &TypeInfo) -> Value {
        let size = ty.byte_size.clamp(1, 8) as usize;
        let Some(buf) = self.read_raw(addr, size) else {
            return unreadable(addr);
        };
        let mut raw = [0u8; 8];
        raw[..size].copy_from_slice(&buf);
        let unsigned = u64::from_le_bytes(raw);
        if ty.kind == TypeKind::Int && ty.signed {
            let shift = 64 - size as u32 * 8;
            let signed = ((unsigned << shift) as i64) >> shift;
            json!(signed)
        } else {
            json!(unsigned)
        }
    }

    fn read_float(&self, addr: u64, ty: &TypeInfo) -> Value {
        match ty.byte_size {
            4 => match self.read_raw(addr, 4) {
                Some(buf) => json!(f32::from_le_bytes(buf.try_into().unwrap()) as f64),
                None => unreadable(addr),
            },
            8 => match self.read_raw(addr, 8) {
                Some(buf) => json!(f64::from_le_bytes(buf.try_into().unwrap())),
                None => unreadable(addr),
            },
            other => json!(format!("<unsupported float size {other}>")),
        }
    }

    fn read_pointer(
        &self,
        addr: u64,
        ty: &TypeInfo,
        depth: u8,
        visited: &mut HashSet<u64>,
    ) -> Value {
        let ptr_size = std::mem::size_of::<u64>();
        if addr % ptr_size as u64 != 0 {
            return json!(format!("<misaligned pointer at 0x{addr:x}>"));
        }
        let Some(buf) = self.read_raw(addr, ptr_size) else {
            return unreadable(addr);
        };
        let target = u64::from_le_bytes(buf.try_into().unwrap());
        if target == 0 {
            return json!("0x0");
        }
        let Some(pointee) = &ty.pointee else {
            return json!(format!("0x{target:x}"));
        };
        if !visited.insert(target) {
            return json!(format!("<circular ref to 0x{target:x}>"));
        }
        if !self.mem.is_readable(target, pointee.byte_size.max(1) as usize) {
            return json!(format!("0x{target:x}"));
        }
        self.walk(target, pointee, depth + 1, visited)
    }

    fn read_array(&self, addr: u64, ty: &TypeInfo, depth: u8, visited: &mut HashSet<u64>) -> Value {
        let Some(element) = &ty.element else {
            return json!("<array without element type>");
        };
        let stride = element.byte_size.max(1) as u64;
        let len = ty.count.unwrap_or(0).min(MAX_ARRAY_ELEMENTS);
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            out.push(self.walk(
                addr.wrapping_add(i as u64 * stride),
                element,
                depth + 1,
                visited,
            ));
        }
        Value::Array(out)
    }

    fn read_bytes(&self, addr: u64, ty: &TypeInfo) -> Value {
        let len = (ty.byte_size as usize).min(BYTES_HEX_PREFIX);
        let Some(buf) = self.read_raw(addr, len) else {
            return unreadable(addr);
        };
        let hex: String = buf.iter().map(|b| format!("{b:02x}")).collect();
        let suffix = if ty.byte_size as usize > len { "…" } else { "" };
        json!(format!("<bytes 0x{hex}{suffix}>"))
    }
}

fn unreadable(addr: u64) -> Value {
    json!(format!("<unreadable 0x{addr:x}>"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::ProcessMemory;

    fn u32_type() -> TypeInfo {
        TypeInfo::scalar(TypeKind::Uint, 4, false)
    }

    #[test]
    fn scalar_reads() {
        let mem = ProcessMemory::new();
        let ser = Serializer::new(&mem, 3);

        let v: Box<u32> = Box::new(1234);
        let out = ser.serialize(&*v as *const u32 as u64, &u32_type());
        assert_eq!(out, json!(1234));

        let neg: Box<i16> = Box::new(-5);
        let out = ser.serialize(
            &*neg as *const i16 as u64,
            &TypeInfo::scalar(TypeKind::Int, 2, true),
        );
        assert_eq!(out, json!(-5));

        let f: Box<f64> = Box::new(2.5);
        let out = ser.serialize(
            &*f as *const f64 as u64,
            &TypeInfo::scalar(TypeKind::Float, 8, false),
        );
        assert_eq!(out, json!(2.5));
    }

    #[test]
    fn struct_members_fail_independently() {
        let mem = ProcessMemory::new();
        let ser = Serializer::new(&mem, 3);

        #[repr(C)]
        struct Pair {
            a: u32,
            bad_ptr: u64,
        }
        let pair = Box::new(Pair { a: 7, bad_ptr: 0 });

        let ty = TypeInfo {
            kind: TypeKind::Struct,
            byte_size: 16,
            signed: false,
            members: vec![
                Member {
                    name: "a".into(),
                    offset: 0,
                    ty: u32_type(),
                },
                Member {
                    name: "b".into(),
                    offset: 8,
                    ty: TypeInfo {
                        pointee: Some(Box::new(u32_type())),
                        ..TypeInfo::scalar(TypeKind::Pointer, 8, false)
                    },
                },
            ],
            pointee: None,
            element: None,
            count: None,
        };

        let out = ser.serialize(&*pair as *const Pair as u64, &ty);
        assert_eq!(out["a"], json!(7));
        assert_eq!(out["b"], json!("0x0"));
    }

    #[test]
    fn pointer_chain_follows_to_value() {
        let mem = ProcessMemory::new();
        let ser = Serializer::new(&mem, 5);

        let value: Box<u32> = Box::new(77);
        let ptr: Box<u64> = Box::new(&*value as *const u32 as u64);

        let ty = TypeInfo {
            pointee: Some(Box::new(u32_type())),
            ..TypeInfo::scalar(TypeKind::Pointer, 8, false)
        };
        let out = ser.serialize(&*ptr as *const u64 as u64, &ty);
        assert_eq!(out, json!(77));
    }

    #[test]
    fn cyclic_pointer_graph_terminates() {
        let mem = ProcessMemory::new();
        let ser = Serializer::new(&mem, 10);

        // A self-referential cell: *cell == &cell.
        let mut cell: Box<u64> = Box::new(0);
        let addr = &mut *cell as *mut u64 as u64;
        *cell = addr;

        fn ptr_chain(depth: usize) -> TypeInfo {
            let mut ty = TypeInfo::scalar(TypeKind::Pointer, 8, false);
            if depth > 0 {
                ty.pointee = Some(Box::new(ptr_chain(depth - 1)));
            }
            ty
        }

        let out = ser.serialize(addr, &ptr_chain(8));
        let text = out.as_str().unwrap();
        assert!(
            text.starts_with("<circular ref to 0x"),
            "unexpected: {text}"
        );
    }

    #[test]
    fn depth_limit_produces_sentinel() {
        let mem = ProcessMemory::new();
        let ser = Serializer::new(&mem, 1);

        let inner: Box<u32> = Box::new(1);
        let mid: Box<u64> = Box::new(&*inner as *const u32 as u64);
        let outer: Box<u64> = Box::new(&*mid as *const u64 as u64);

        let ty = TypeInfo {
            pointee: Some(Box::new(TypeInfo {
                pointee: Some(Box::new(u32_type())),
                ..TypeInfo::scalar(TypeKind::Pointer, 8, false)
            })),
            ..TypeInfo::scalar(TypeKind::Pointer, 8, false)
        };
        let out = ser.serialize(&*outer as *const u64 as u64, &ty);
        assert_eq!(out, json!("<max depth 1 reached>"));
    }

    #[test]
    fn arrays_are_capped() {
        let mem = ProcessMemory::new();
        let ser = Serializer::new(&mem, 3);

        let data: Vec<u32> = (0..300).collect();
        let ty = TypeInfo {
            kind: TypeKind::Array,
            byte_size: 4 * 300,
            signed: false,
            members: Vec::new(),
            pointee: None,
            element: Some(Box::new(u32_type())),
            count: Some(300),
        };
        let out = ser.serialize(data.as_ptr() as u64, &ty);
        let arr = out.as_array().unwrap();
        assert_eq!(arr.len(), 100);
        assert_eq!(arr[99], json!(99));
    }

    #[test]
    fn bytes_render_hex_prefix() {
        let mem = ProcessMemory::new();
        let ser = Serializer::new(&mem, 3);

        let data = [0xABu8; 64];
        let ty = TypeInfo::scalar(TypeKind::Bytes, 64, false);
        let out = ser.serialize(data.as_ptr() as u64, &ty);
        let text = out.as_str().unwrap();
        assert!(text.starts_with("<bytes 0xabab"));
        assert!(text.ends_with("…>"));
    }
}
