//! Runtime data layouts.
//!
//! Strings, slices, maps, channels and interfaces are headers over runtime
//! records whose shape the compiler describes in the debug information. The
//! constructors here build those shapes for a 64-bit target, the way the
//! toolchain lays them out, so builders and tests can describe programs
//! without a real binary.

use super::types::{StructField, Type, TypeId, TypeKind, TypeTable};

/// Slots per map bucket.
pub const BUCKET_SIZE: i64 = 8;

impl TypeTable
{
    /// A named scalar, created on first use.
    pub fn basic(&self, name: &str, size: i64, kind: TypeKind) -> TypeId
    {
        self.by_name(name)
            .unwrap_or_else(|| self.add(Type::new(name, size, kind)))
    }

    fn uintptr(&self) -> TypeId
    {
        self.basic("uintptr", self.pointer_size(), TypeKind::Uint)
    }

    fn int(&self) -> TypeId
    {
        self.basic("int", self.pointer_size(), TypeKind::Int)
    }

    fn uint8(&self) -> TypeId
    {
        self.basic("uint8", 1, TypeKind::Uint)
    }

    /// `unsafe.Pointer`
    pub fn unsafe_pointer(&self) -> TypeId
    {
        if let Some(id) = self.by_name("unsafe.Pointer") {
            return id;
        }
        let void = self.basic("void", 0, TypeKind::Void);
        self.add(Type::new("unsafe.Pointer", self.pointer_size(), TypeKind::Pointer(void)))
    }

    /// `string`: `{str *uint8, len int}`
    pub fn string_type(&self) -> TypeId
    {
        if let Some(id) = self.by_name("string") {
            return id;
        }
        let ptr = self.pointer_size();
        let bytes = self.pointer_to(self.uint8());
        let fields = vec![StructField::new("str", bytes, 0), StructField::new("len", self.int(), ptr)];
        self.add(Type::new("string", 2 * ptr, TypeKind::String(fields)))
    }

    /// `[]elem`: `{array *elem, len int, cap int}`
    pub fn slice_of(&self, elem: TypeId) -> TypeId
    {
        let name = format!("[]{}", self.name(elem));
        if let Some(id) = self.by_name(&name) {
            return id;
        }
        let ptr = self.pointer_size();
        let fields = vec![
            StructField::new("array", self.pointer_to(elem), 0),
            StructField::new("len", self.int(), ptr),
            StructField::new("cap", self.int(), 2 * ptr),
        ];
        self.add(Type::new(name, 3 * ptr, TypeKind::Slice(fields)))
    }

    /// `map[key]value` with its `hmap` header and `bmap` bucket records.
    ///
    /// Buckets hold [`BUCKET_SIZE`] slots: a tag byte array, then all keys,
    /// then all values, then the overflow pointer.
    pub fn map_of(&self, key: TypeId, value: TypeId) -> TypeId
    {
        let name = format!("map[{}]{}", self.name(key), self.name(value));
        if let Some(id) = self.by_name(&name) {
            return id;
        }
        let ptr = self.pointer_size();
        let key_size = self.size(key);
        let value_size = self.size(value);

        let bucket = self.reserve(&format!("map.bucket[{}]{}", self.name(key), self.name(value)));
        let tophash = self.array_of(self.uint8(), BUCKET_SIZE);
        let keys = self.array_of(key, BUCKET_SIZE);
        let values = self.array_of(value, BUCKET_SIZE);
        let keys_at = BUCKET_SIZE;
        let values_at = keys_at + BUCKET_SIZE * key_size;
        let overflow_at = align(values_at + BUCKET_SIZE * value_size, ptr);
        let bucket_ptr = self.pointer_to(bucket);
        self.define(
            bucket,
            Type::new(
                self.name(bucket),
                overflow_at + ptr,
                TypeKind::Struct(vec![
                    StructField::new("tophash", tophash, 0),
                    StructField::new("keys", keys, keys_at),
                    StructField::new("values", values, values_at),
                    StructField::new("overflow", bucket_ptr, overflow_at),
                ]),
            ),
        );

        let hmap = self.add(Type::new(
            format!("hash<{},{}>", self.name(key), self.name(value)),
            6 * ptr,
            TypeKind::Struct(vec![
                StructField::new("count", self.int(), 0),
                StructField::new("flags", self.uint8(), ptr),
                StructField::new("B", self.uint8(), ptr + 1),
                StructField::new("noverflow", self.basic("uint16", 2, TypeKind::Uint), ptr + 2),
                StructField::new("hash0", self.basic("uint32", 4, TypeKind::Uint), ptr + 4),
                StructField::new("buckets", bucket_ptr, 2 * ptr),
                StructField::new("oldbuckets", bucket_ptr, 3 * ptr),
                StructField::new("nevacuate", self.uintptr(), 4 * ptr),
                StructField::new("extra", self.unsafe_pointer(), 5 * ptr),
            ]),
        ));
        let header = self.pointer_to(hmap);
        self.add(Type::new(name, ptr, TypeKind::Map { header, key, value }))
    }

    /// `chan elem` with its `hchan` header record.
    pub fn chan_of(&self, elem: TypeId) -> TypeId
    {
        let name = format!("chan {}", self.name(elem));
        if let Some(id) = self.by_name(&name) {
            return id;
        }
        let ptr = self.pointer_size();
        let uint = self.basic("uint", ptr, TypeKind::Uint);
        let hchan = self.add(Type::new(
            format!("hchan<{}>", self.name(elem)),
            7 * ptr,
            TypeKind::Struct(vec![
                StructField::new("qcount", uint, 0),
                StructField::new("dataqsiz", uint, ptr),
                StructField::new("buf", self.unsafe_pointer(), 2 * ptr),
                StructField::new("elemsize", self.basic("uint16", 2, TypeKind::Uint), 3 * ptr),
                StructField::new("closed", self.basic("uint32", 4, TypeKind::Uint), 3 * ptr + 4),
                StructField::new("sendx", uint, 5 * ptr),
                StructField::new("recvx", uint, 6 * ptr),
            ]),
        ));
        let header = self.pointer_to(hchan);
        self.add(Type::new(name, ptr, TypeKind::Chan { header, elem }))
    }

    /// The runtime's type descriptor record, `runtime._type`.
    ///
    /// With `legacy_names` the record carries its name inline as a
    /// `_string *string` field, as older runtimes did; otherwise names are
    /// resolved through the binary's runtime type table.
    pub fn runtime_type_record(&self, legacy_names: bool) -> TypeId
    {
        if let Some(id) = self.by_name("runtime._type") {
            return id;
        }
        let ptr = self.pointer_size();
        let mut fields = vec![
            StructField::new("size", self.uintptr(), 0),
            StructField::new("ptrdata", self.uintptr(), ptr),
            StructField::new("hash", self.basic("uint32", 4, TypeKind::Uint), 2 * ptr),
            StructField::new("tflag", self.uint8(), 2 * ptr + 4),
            StructField::new("align", self.uint8(), 2 * ptr + 5),
            StructField::new("fieldalign", self.uint8(), 2 * ptr + 6),
            StructField::new("kind", self.uint8(), 2 * ptr + 7),
        ];
        if legacy_names {
            let string = self.string_type();
            fields.push(StructField::new("_string", self.pointer_to(string), 3 * ptr));
        } else {
            fields.push(StructField::new("str", self.basic("int32", 4, TypeKind::Int), 3 * ptr));
        }
        self.add(Type::new("runtime._type", 4 * ptr, TypeKind::Struct(fields)))
    }

    /// An interface type named `name`.
    ///
    /// Empty interfaces are `{_type *runtime._type, data unsafe.Pointer}`;
    /// the rest go through an itab: `{tab *runtime.itab, data unsafe.Pointer}`.
    pub fn interface_type(&self, name: &str, empty: bool) -> TypeId
    {
        if let Some(id) = self.by_name(name) {
            return id;
        }
        let ptr = self.pointer_size();
        let rtype = self.pointer_to(self.runtime_type_record(false));
        let data = self.unsafe_pointer();
        let record = if empty {
            self.basic_record(
                "runtime.eface",
                2 * ptr,
                vec![StructField::new("_type", rtype, 0), StructField::new("data", data, ptr)],
            )
        } else {
            let itab = self.basic_record(
                "runtime.itab",
                4 * ptr,
                vec![
                    StructField::new("inter", self.unsafe_pointer(), 0),
                    StructField::new("_type", rtype, ptr),
                    StructField::new("hash", self.basic("uint32", 4, TypeKind::Uint), 2 * ptr),
                    StructField::new("fun", self.array_of(self.uintptr(), 1), 3 * ptr),
                ],
            );
            self.basic_record(
                "runtime.iface",
                2 * ptr,
                vec![StructField::new("tab", self.pointer_to(itab), 0), StructField::new("data", data, ptr)],
            )
        };
        self.add(Type::new(name, 2 * ptr, TypeKind::Interface(record)))
    }

    fn basic_record(&self, name: &str, size: i64, fields: Vec<StructField>) -> TypeId
    {
        self.by_name(name)
            .unwrap_or_else(|| self.add(Type::new(name, size, TypeKind::Struct(fields))))
    }
}

fn align(offset: i64, to: i64) -> i64
{
    (offset + to - 1) / to * to
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_map_bucket_layout()
    {
        let table = TypeTable::new(8);
        let int = table.basic("int", 8, TypeKind::Int);
        let map = table.map_of(int, int);

        let TypeKind::Map { header, .. } = table.get(map).kind else {
            panic!("not a map");
        };
        let TypeKind::Pointer(hmap) = table.get(header).kind else {
            panic!("header is not a pointer");
        };
        let buckets = table.get(hmap).field("buckets").cloned().unwrap();
        let TypeKind::Pointer(bucket) = table.get(buckets.ty).kind else {
            panic!("buckets is not a pointer");
        };
        let bucket = table.get(bucket);
        assert_eq!(bucket.field("keys").unwrap().byte_offset, 8);
        assert_eq!(bucket.field("values").unwrap().byte_offset, 72);
        assert_eq!(bucket.field("overflow").unwrap().byte_offset, 136);
        assert_eq!(bucket.size, 144);
        assert_eq!(table.map_of(int, int), map);
    }

    #[test]
    fn test_slice_and_string_headers()
    {
        let table = TypeTable::new(8);
        let int = table.basic("int", 8, TypeKind::Int);
        let slice = table.get(table.slice_of(int));
        assert_eq!(slice.name, "[]int");
        assert_eq!(slice.field("cap").unwrap().byte_offset, 16);

        let string = table.get(table.string_type());
        assert_eq!(string.size, 16);
        assert_eq!(string.field("len").unwrap().byte_offset, 8);
    }

    #[test]
    fn test_interface_records()
    {
        let table = TypeTable::new(8);
        let error = table.interface_type("error", false);
        let TypeKind::Interface(record) = table.get(error).kind else {
            panic!("not an interface");
        };
        assert_eq!(table.name(record), "runtime.iface");

        let any = table.interface_type("interface {}", true);
        let TypeKind::Interface(record) = table.get(any).kind else {
            panic!("not an interface");
        };
        assert!(table.get(record).field("_type").is_some());
    }
}
