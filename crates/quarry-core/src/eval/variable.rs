//! Variables and the load engine.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::{FloatSpecial, Kind, LoadConfig, Value, VariableFlags, MAX_ARRAY_STRIDE_PREFETCH, MAX_ERR_COUNT};
use crate::binary::{BinaryInfo, Type, TypeId, TypeKind};
use crate::error::{QuarryError, QuarryResult};
use crate::memory::{cache_memory, dereference_memory, read_exact, read_int, read_uint, Memory, MemoryReadWriter};
use crate::types::Address;

/// A value of the debugged program
///
/// Created from an address and a type; [`Variable::load_value`] then reads
/// it, and its children, out of memory. Once loaded a variable is a plain
/// snapshot.
#[derive(Clone)]
pub struct Variable
{
    pub name: String,
    pub addr: Address,
    /// Only the address is known; the value was not read
    pub only_addr: bool,
    /// Declared type, `None` for untyped constants
    pub dwarf_type: Option<TypeId>,
    /// Declared type with typedefs stripped
    pub real_type: Option<TypeId>,
    pub kind: Kind,
    pub value: Option<Value>,
    pub float_special: FloatSpecial,
    /// Length of strings, arrays, slices, maps and channels; number of
    /// fields of structs
    pub len: i64,
    pub cap: i64,
    pub flags: VariableFlags,
    /// Backing storage of strings, slices and arrays, buffer of channels,
    /// header of maps, entry point of functions
    pub base: Address,
    pub children: Vec<Variable>,
    /// Why the value could not be read; set variables have no children
    pub unreadable: Option<QuarryError>,

    pub(crate) stride: i64,
    pub(crate) field_type: Option<TypeId>,
    /// `hchan` view with a correctly sized buffer, once the channel
    /// capacity is known
    pub(crate) chan_header: Option<TypeId>,
    pub(crate) loaded: bool,
    pub(crate) mem: Memory,
    pub(crate) bi: Arc<BinaryInfo>,
}

impl Variable
{
    /// A variable of type `ty` at `addr`.
    ///
    /// Headers of strings, slices and channels are read immediately; a
    /// failure marks the variable unreadable.
    pub fn new(name: impl Into<String>, addr: Address, ty: TypeId, mem: Memory, bi: Arc<BinaryInfo>) -> Self
    {
        let mut v = Self::untyped(name, addr, mem, bi);
        v.dwarf_type = Some(ty);
        let real = v.bi.types().resolve_typedef(ty);
        v.real_type = Some(real);
        let real = v.bi.types().get(real);

        match &real.kind {
            TypeKind::Pointer(pointee) => {
                let pointee = v.bi.types().get(v.bi.types().resolve_typedef(*pointee));
                v.kind = if matches!(pointee.kind, TypeKind::Void) {
                    Kind::UnsafePointer
                } else {
                    Kind::Ptr
                };
            }
            TypeKind::Chan { .. } => {
                v.kind = Kind::Chan;
                if !v.addr.is_null() {
                    if let Err(err) = v.load_chan_info() {
                        v.poison(err);
                    }
                }
            }
            TypeKind::Map { .. } => v.kind = Kind::Map,
            TypeKind::String(_) => {
                v.kind = Kind::String;
                v.stride = 1;
                v.field_type = Some(v.bi.types().basic("uint8", 1, TypeKind::Uint));
                if !v.addr.is_null() {
                    let ptr_size = v.pointer_size();
                    match read_string_info(&v.mem, ptr_size, v.addr) {
                        Ok((base, len)) => {
                            v.base = base;
                            v.len = len;
                        }
                        Err(err) => v.poison(err),
                    }
                }
            }
            TypeKind::Slice(_) => {
                v.kind = Kind::Slice;
                if !v.addr.is_null() {
                    if let Err(err) = v.load_slice_info(&real) {
                        v.poison(err);
                    }
                }
            }
            TypeKind::Interface(_) => v.kind = Kind::Interface,
            TypeKind::Struct(_) => v.kind = Kind::Struct,
            TypeKind::Array { elem, count, .. } => {
                v.kind = Kind::Array;
                v.base = v.addr;
                v.len = *count;
                v.cap = -1;
                v.field_type = Some(*elem);
                v.stride = if *count > 0 { real.size / count } else { 0 };
            }
            TypeKind::Complex => {
                v.kind = match real.size {
                    8 => Kind::Complex64,
                    16 => Kind::Complex128,
                    _ => Kind::Invalid,
                };
            }
            TypeKind::Int => v.kind = Kind::Int,
            TypeKind::Uint => v.kind = Kind::Uint,
            TypeKind::Float => {
                v.kind = match real.size {
                    4 => Kind::Float32,
                    8 => Kind::Float64,
                    _ => Kind::Invalid,
                };
            }
            TypeKind::Bool => v.kind = Kind::Bool,
            TypeKind::Func => v.kind = Kind::Func,
            TypeKind::Void | TypeKind::Unspecified => v.kind = Kind::Invalid,
            TypeKind::Typedef(_) => v.poison(QuarryError::MalformedType(format!("unresolved typedef {}", real.name))),
        }
        v
    }

    /// A variable with no type, kind `Invalid`.
    pub(crate) fn untyped(name: impl Into<String>, addr: Address, mem: Memory, bi: Arc<BinaryInfo>) -> Self
    {
        Self {
            name: name.into(),
            addr,
            only_addr: false,
            dwarf_type: None,
            real_type: None,
            kind: Kind::Invalid,
            value: None,
            float_special: FloatSpecial::Normal,
            len: 0,
            cap: 0,
            flags: VariableFlags::empty(),
            base: Address::ZERO,
            children: Vec::new(),
            unreadable: None,
            stride: 0,
            field_type: None,
            chan_header: None,
            loaded: false,
            mem,
            bi,
        }
    }

    /// An untyped constant, as written in an expression.
    pub fn constant(value: Value, mem: Memory, bi: Arc<BinaryInfo>) -> Self
    {
        let mut v = Self::untyped("", Address::ZERO, mem, bi);
        v.kind = match &value {
            Value::Bool(_) => Kind::Bool,
            Value::Int(_) | Value::Uint(_) => Kind::Int,
            Value::Float(_) => Kind::Float64,
            Value::Complex(..) => Kind::Complex128,
            Value::String(s) => {
                v.len = s.len() as i64;
                Kind::String
            }
        };
        v.value = Some(value);
        v.flags = VariableFlags::CONSTANT;
        v.loaded = true;
        v
    }

    /// The `nil` literal: an untyped pointer to address zero.
    pub fn nil(mem: Memory, bi: Arc<BinaryInfo>) -> Self
    {
        let mut v = Self::untyped("nil", Address::ZERO, Arc::clone(&mem), Arc::clone(&bi));
        v.kind = Kind::Ptr;
        let mut target = Self::untyped("", Address::ZERO, mem, bi);
        target.only_addr = true;
        v.children = vec![target];
        v.loaded = true;
        v
    }

    pub fn is_nil_literal(&self) -> bool
    {
        self.kind == Kind::Ptr && self.dwarf_type.is_none()
    }

    /// Name of the declared type, or of the kind for untyped values.
    pub fn type_string(&self) -> String
    {
        if self.is_nil_literal() {
            return "nil".to_string();
        }
        match self.dwarf_type {
            Some(ty) => self.bi.types().name(ty),
            None => self.kind.to_string(),
        }
    }

    pub fn binary_info(&self) -> &Arc<BinaryInfo>
    {
        &self.bi
    }

    pub(crate) fn memory(&self) -> &Memory
    {
        &self.mem
    }

    pub(crate) fn real(&self) -> Option<Arc<Type>>
    {
        self.real_type.map(|ty| self.bi.types().get(ty))
    }

    pub(crate) fn pointer_size(&self) -> usize
    {
        usize::from(self.bi.architecture().pointer_size())
    }

    /// Mark the variable unreadable. Its children are dropped.
    pub(crate) fn poison(&mut self, err: QuarryError)
    {
        self.children.clear();
        self.unreadable = Some(err);
    }

    /// A copy whose real type is `ty`, everything else unchanged.
    pub(crate) fn retyped(&self, ty: TypeId) -> Variable
    {
        let mut v = self.clone();
        v.real_type = Some(ty);
        v
    }

    /// Load the value and its children within the budgets of `cfg`.
    pub fn load_value(&mut self, cfg: &LoadConfig)
    {
        self.load_value_internal(0, cfg);
    }

    pub(crate) fn load_value_internal(&mut self, level: i32, cfg: &LoadConfig)
    {
        if self.unreadable.is_some() || self.loaded || (self.addr.is_null() && self.base.is_null()) {
            return;
        }
        self.loaded = true;

        let result = match self.kind {
            Kind::Ptr | Kind::UnsafePointer => {
                self.load_pointer(level, cfg);
                Ok(())
            }
            Kind::Chan => self.load_chan(),
            Kind::Map => {
                if level <= cfg.max_variable_recurse {
                    self.load_map(level, cfg)
                } else {
                    // The element count still tells the reader the map is not empty
                    self.only_addr = true;
                    self.map_iterator().map(drop)
                }
            }
            Kind::String => {
                let mem = dereference_memory(&self.mem);
                read_string_value(mem.as_ref(), self.base, self.len, cfg).map(|s| self.value = Some(Value::String(s)))
            }
            Kind::Slice | Kind::Array => self.load_array_values(level, cfg),
            Kind::Struct => self.load_struct(level, cfg),
            Kind::Interface => self.load_interface(level, true, cfg),
            Kind::Complex64 | Kind::Complex128 => self.read_complex(),
            Kind::Int => {
                let size = self.size();
                read_int(self.mem.as_ref(), self.addr, size).map(|n| self.value = Some(Value::Int(n)))
            }
            Kind::Uint => {
                let size = self.size();
                read_uint(self.mem.as_ref(), self.addr, size).map(|n| self.value = Some(Value::Uint(n)))
            }
            Kind::Bool => {
                let mut byte = [0u8; 1];
                read_exact(self.mem.as_ref(), self.addr, &mut byte).map(|()| self.value = Some(Value::Bool(byte[0] != 0)))
            }
            Kind::Float32 | Kind::Float64 => {
                let size = self.size();
                read_float(self.mem.as_ref(), self.addr, size).map(|x| {
                    self.float_special = if x.is_nan() {
                        FloatSpecial::NaN
                    } else if x == f64::INFINITY {
                        FloatSpecial::PosInf
                    } else if x == f64::NEG_INFINITY {
                        FloatSpecial::NegInf
                    } else {
                        FloatSpecial::Normal
                    };
                    self.value = Some(Value::Float(x));
                })
            }
            Kind::Func => self.read_function_ptr(),
            Kind::Invalid => Err(QuarryError::MalformedType(format!(
                "unknown or unsupported kind \"{}\"",
                self.kind
            ))),
        };

        if let Err(err) = result {
            debug!(name = %self.name, addr = %self.addr, %err, "value unreadable");
            self.poison(err);
        }
    }

    fn size(&self) -> usize
    {
        self.real().map_or(0, |real| real.size.max(0) as usize)
    }

    fn load_pointer(&mut self, level: i32, cfg: &LoadConfig)
    {
        self.len = 1;
        let mut target = self.maybe_dereference();
        if cfg.follow_pointers {
            let next = if target.kind == Kind::Interface { level + 1 } else { level };
            target.load_value_internal(next, cfg);
        } else {
            target.only_addr = true;
        }
        self.children = vec![target];
    }

    fn load_struct(&mut self, level: i32, cfg: &LoadConfig) -> QuarryResult<()>
    {
        let Some(real) = self.real() else {
            return Err(QuarryError::MalformedType("struct without a type".into()));
        };
        self.mem = cache_memory(&self.mem, self.addr, real.size.max(0) as usize);
        let fields = real.fields();
        self.len = fields.len() as i64;

        if level > cfg.max_variable_recurse {
            self.only_addr = true;
            return Ok(());
        }
        let mut children = Vec::with_capacity(fields.len());
        for field in fields {
            if cfg.max_struct_fields >= 0 && children.len() >= cfg.max_struct_fields as usize {
                break;
            }
            let mut child = self.to_field(field)?;
            child.name.clone_from(&field.name);
            child.load_value_internal(level + 1, cfg);
            children.push(child);
        }
        self.children = children;
        Ok(())
    }

    /// Read `len` and `cap` of a slice header and locate its backing array.
    fn load_slice_info(&mut self, real: &Type) -> QuarryResult<()>
    {
        self.mem = cache_memory(&self.mem, self.addr, real.size.max(0) as usize);
        let bi = Arc::clone(&self.bi);
        let types = bi.types();

        for field in real.fields() {
            let at = self.addr.offset(field.byte_offset);
            let size = types.size(field.ty).max(0) as usize;
            match field.name.as_str() {
                "array" => {
                    self.base = Address::new(read_uint(self.mem.as_ref(), at, size)?);
                    match types.get(types.resolve_typedef(field.ty)).kind {
                        TypeKind::Pointer(elem) => self.field_type = Some(elem),
                        _ => {
                            return Err(QuarryError::MalformedType(format!(
                                "invalid type {} in slice array",
                                types.name(field.ty)
                            )))
                        }
                    }
                }
                "len" => self.len = read_int(self.mem.as_ref(), at, size)?,
                "cap" => self.cap = read_int(self.mem.as_ref(), at, size)?,
                _ => {}
            }
        }

        let elem = self
            .field_type
            .ok_or_else(|| QuarryError::MalformedType(format!("slice {} has no array field", real.name)))?;
        self.stride = types.size(elem);
        Ok(())
    }

    /// Read the channel capacity and retype the buffer as an array of that
    /// many elements.
    fn load_chan_info(&mut self) -> QuarryResult<()>
    {
        let real = self.real().ok_or_else(|| QuarryError::MalformedType("bad channel type".into()))?;
        let TypeKind::Chan { header, elem } = real.kind else {
            return Err(QuarryError::MalformedType("bad channel type".into()));
        };
        let hchan = self.retyped(header).maybe_dereference();
        if hchan.unreadable.is_some() || hchan.addr.is_null() {
            return Ok(());
        }
        let (Some(record), Some(record_type)) = (hchan.dwarf_type, hchan.real()) else {
            return Err(QuarryError::MalformedType("bad channel type".into()));
        };
        let field = record_type
            .field("dataqsiz")
            .ok_or_else(|| QuarryError::MalformedType("bad channel type".into()))?;

        let mut capacity = hchan.to_field(field)?;
        capacity.load_value(&LoadConfig::single_value());
        if let Some(err) = &capacity.unreadable {
            return Err(QuarryError::unreadable("channel length", err));
        }
        let capacity = capacity.value.as_ref().and_then(Value::as_u64).unwrap_or(0);

        let types = self.bi.types();
        let view = types.chan_buffer_view(record, elem, capacity as i64);
        self.chan_header = Some(types.pointer_to(view));
        Ok(())
    }

    /// Pointer-to-record type behind a channel.
    pub(crate) fn chan_header_type(&self) -> Option<TypeId>
    {
        if self.chan_header.is_some() {
            return self.chan_header;
        }
        match self.real()?.kind {
            TypeKind::Chan { header, .. } => Some(header),
            _ => None,
        }
    }

    fn load_chan(&mut self) -> QuarryResult<()>
    {
        let header = self
            .chan_header_type()
            .ok_or_else(|| QuarryError::MalformedType("bad channel type".into()))?;
        let mut record = self.retyped(header).maybe_dereference();
        record.load_value_internal(0, &LoadConfig::full_value());
        if let Some(err) = record.unreadable {
            return Err(err);
        }
        self.children = record.children;
        self.len = record.len;
        self.base = record.addr;
        Ok(())
    }

    fn load_array_values(&mut self, level: i32, cfg: &LoadConfig) -> QuarryResult<()>
    {
        if self.len < 0 {
            return Err(QuarryError::NegativeLength {
                what: "array",
                value: self.len,
            });
        }
        let Some(elem) = self.field_type else {
            return Err(QuarryError::MalformedType(format!("{} has no element type", self.type_string())));
        };

        let count = self.len.min(cfg.max_array_values as i64);
        if self.stride < MAX_ARRAY_STRIDE_PREFETCH {
            self.mem = cache_memory(&self.mem, self.base, (self.stride * count).max(0) as usize);
        }
        let mem = if self.kind == Kind::Array {
            Arc::clone(&self.mem)
        } else {
            dereference_memory(&self.mem)
        };

        let mut errors = 0;
        for i in 0..count {
            let addr = self.base.offset(i * self.stride);
            let mut element = Variable::new("", addr, elem, Arc::clone(&mem), Arc::clone(&self.bi));
            element.load_value_internal(level + 1, cfg);
            if element.unreadable.is_some() {
                errors += 1;
            }
            self.children.push(element);
            if errors > MAX_ERR_COUNT {
                break;
            }
        }
        Ok(())
    }

    fn read_complex(&mut self) -> QuarryResult<()>
    {
        let half = match self.size() {
            8 => 4,
            16 => 8,
            size => return Err(QuarryError::MalformedType(format!("invalid size ({size}) for complex type"))),
        };
        let real = read_float(self.mem.as_ref(), self.addr, half)?;
        let imag = read_float(self.mem.as_ref(), self.addr + half as u64, half)?;
        self.value = Some(Value::Complex(real, imag));
        Ok(())
    }

    /// Function values point at a closure record whose first word is the
    /// entry point.
    fn read_function_ptr(&mut self) -> QuarryResult<()>
    {
        let ptr_size = self.pointer_size();
        let closure = read_uint(self.mem.as_ref(), self.addr, ptr_size)?;
        if closure == 0 {
            self.base = Address::ZERO;
            self.value = Some(Value::String(String::new()));
            return Ok(());
        }

        let entry = read_uint(self.mem.as_ref(), Address::new(closure), ptr_size)?;
        self.base = Address::new(entry);
        let function = self
            .bi
            .pc_to_func(entry)
            .ok_or_else(|| QuarryError::SymbolNotFound(format!("function for {:#x}", entry)))?;
        self.value = Some(Value::String(function.name.clone()));
        Ok(())
    }

    /// Signed integer value, loading the variable first if needed.
    pub(crate) fn as_int(&mut self) -> QuarryResult<i64>
    {
        self.load_scalar()?;
        self.value
            .as_ref()
            .and_then(Value::as_i64)
            .ok_or_else(|| QuarryError::TypeMismatch(format!("{} is not an integer", self.type_string())))
    }

    /// Unsigned integer value, loading the variable first if needed.
    pub(crate) fn as_uint(&mut self) -> QuarryResult<u64>
    {
        self.load_scalar()?;
        self.value
            .as_ref()
            .and_then(Value::as_u64)
            .ok_or_else(|| QuarryError::TypeMismatch(format!("{} is not an integer", self.type_string())))
    }

    fn load_scalar(&mut self) -> QuarryResult<()>
    {
        if self.value.is_none() {
            self.load_value(&LoadConfig::single_value());
        }
        match &self.unreadable {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Loaded child named `name`.
    pub(crate) fn field_variable(&self, name: &str) -> Option<&Variable>
    {
        self.children.iter().find(|child| child.name == name)
    }
}

impl fmt::Debug for Variable
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Variable")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("type", &self.type_string())
            .field("kind", &self.kind)
            .field("value", &self.value)
            .field("len", &self.len)
            .field("children", &self.children)
            .field("unreadable", &self.unreadable)
            .finish_non_exhaustive()
    }
}

/// Read the `{str, len}` header of a string at `addr`.
///
/// A nil data pointer yields an empty string regardless of the length.
pub(crate) fn read_string_info(mem: &Memory, ptr_size: usize, addr: Address) -> QuarryResult<(Address, i64)>
{
    let mem = cache_memory(mem, addr, 2 * ptr_size);
    let len = read_int(mem.as_ref(), addr + ptr_size as u64, ptr_size)?;
    if len < 0 {
        return Err(QuarryError::NegativeLength {
            what: "string",
            value: len,
        });
    }
    let data = read_uint(mem.as_ref(), addr, ptr_size)?;
    if data == 0 {
        return Ok((Address::ZERO, 0));
    }
    Ok((Address::new(data), len))
}

/// Read at most `cfg.max_string_len` bytes of string data.
pub(crate) fn read_string_value(
    mem: &dyn MemoryReadWriter,
    base: Address,
    len: i64,
    cfg: &LoadConfig,
) -> QuarryResult<String>
{
    if len == 0 {
        return Ok(String::new());
    }
    let count = (len.max(0) as usize).min(cfg.max_string_len);
    let mut bytes = vec![0u8; count];
    read_exact(mem, base, &mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn read_float(mem: &dyn MemoryReadWriter, addr: Address, size: usize) -> QuarryResult<f64>
{
    match size {
        4 => {
            let mut bytes = [0u8; 4];
            read_exact(mem, addr, &mut bytes)?;
            Ok(f64::from(f32::from_le_bytes(bytes)))
        }
        8 => {
            let mut bytes = [0u8; 8];
            read_exact(mem, addr, &mut bytes)?;
            Ok(f64::from_le_bytes(bytes))
        }
        _ => Err(QuarryError::MalformedType(format!("could not read a {size}-byte float"))),
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::binary::{BinaryInfoBuilder, StructField};
    use crate::memory::SnapshotMemory;
    use crate::types::Architecture;

    fn snapshot(regions: &[(u64, Vec<u8>)]) -> Memory
    {
        let mem = SnapshotMemory::new();
        for (base, bytes) in regions {
            mem.map(Address::new(*base), bytes.clone());
        }
        Arc::new(mem)
    }

    fn words(values: &[u64]) -> Vec<u8>
    {
        values.iter().flat_map(|value| value.to_le_bytes()).collect()
    }

    #[test]
    fn test_struct_field_budget_keeps_length()
    {
        let builder = BinaryInfoBuilder::new(Architecture::X86_64);
        let types = builder.types();
        let int = types.basic("int", 8, TypeKind::Int);
        let fields = ["a", "b", "c", "d", "e"]
            .iter()
            .enumerate()
            .map(|(i, name)| StructField::new(*name, int, 8 * i as i64))
            .collect();
        let record = types.add(Type::new("main.Five", 40, TypeKind::Struct(fields)));
        let bi = Arc::new(builder.build());
        let mem = snapshot(&[(0x1000, words(&[1, 2, 3, 4, 5]))]);

        let mut v = Variable::new("five", Address::new(0x1000), record, mem, bi);
        v.load_value(&LoadConfig {
            max_struct_fields: 2,
            ..LoadConfig::full_value()
        });

        assert_eq!(v.len, 5);
        assert_eq!(v.children.len(), 2);
        assert_eq!(v.children[1].name, "b");
        assert_eq!(v.children[1].value, Some(Value::Int(2)));
    }

    #[test]
    fn test_pointer_not_followed_is_address_only()
    {
        let builder = BinaryInfoBuilder::new(Architecture::X86_64);
        let types = builder.types();
        let int = types.basic("int", 8, TypeKind::Int);
        let ptr3 = types.pointer_to(types.pointer_to(types.pointer_to(int)));
        let bi = Arc::new(builder.build());
        let mem = snapshot(&[(0x1000, words(&[0x2000])), (0x2000, words(&[0x3000])), (0x3000, words(&[0x4000]))]);

        let mut v = Variable::new("p", Address::new(0x1000), ptr3, mem, bi);
        v.load_value(&LoadConfig {
            follow_pointers: false,
            max_variable_recurse: 0,
            ..LoadConfig::full_value()
        });

        assert_eq!(v.children.len(), 1);
        let target = &v.children[0];
        assert!(target.only_addr);
        assert_eq!(target.addr, Address::new(0x2000));
        assert!(target.children.is_empty());
    }

    #[test]
    fn test_recursion_budget_stops_nested_structs()
    {
        let builder = BinaryInfoBuilder::new(Architecture::X86_64);
        let types = builder.types();
        let int = types.basic("int", 8, TypeKind::Int);
        let inner = types.add(Type::new("main.Inner", 8, TypeKind::Struct(vec![StructField::new("x", int, 0)])));
        let outer = types.add(Type::new(
            "main.Outer",
            8,
            TypeKind::Struct(vec![StructField::new("inner", inner, 0)]),
        ));
        let bi = Arc::new(builder.build());
        let mem = snapshot(&[(0x1000, words(&[7]))]);

        let mut v = Variable::new("o", Address::new(0x1000), outer, mem, bi);
        v.load_value(&LoadConfig {
            max_variable_recurse: 0,
            ..LoadConfig::full_value()
        });

        let inner = &v.children[0];
        assert!(inner.only_addr);
        assert!(inner.children.is_empty());
        assert_eq!(inner.len, 1);
    }

    #[test]
    fn test_string_truncated_to_budget()
    {
        let builder = BinaryInfoBuilder::new(Architecture::X86_64);
        let string = builder.types().string_type();
        let bi = Arc::new(builder.build());
        let mem = snapshot(&[(0x1000, words(&[0x2000, 11])), (0x2000, b"hello world".to_vec())]);

        let mut v = Variable::new("s", Address::new(0x1000), string, mem, bi);
        assert_eq!(v.len, 11);
        v.load_value(&LoadConfig {
            max_string_len: 5,
            ..LoadConfig::full_value()
        });
        assert_eq!(v.value, Some(Value::String("hello".into())));
    }

    #[test]
    fn test_nil_string_reads_nothing()
    {
        let builder = BinaryInfoBuilder::new(Architecture::X86_64);
        let string = builder.types().string_type();
        let bi = Arc::new(builder.build());
        let mem = snapshot(&[(0x1000, words(&[0, 99]))]);

        let mut v = Variable::new("s", Address::new(0x1000), string, mem, bi);
        assert_eq!(v.len, 0);
        v.load_value(&LoadConfig::full_value());
        assert_eq!(v.value, Some(Value::String(String::new())));
        assert!(v.unreadable.is_none());
    }

    #[test]
    fn test_slice_elements_and_error_budget()
    {
        let builder = BinaryInfoBuilder::new(Architecture::X86_64);
        let types = builder.types();
        let int = types.basic("int", 8, TypeKind::Int);
        let slice = types.slice_of(int);
        let bi = Arc::new(builder.build());
        let mem = snapshot(&[(0x1000, words(&[0x2000, 3, 4])), (0x2000, words(&[10, 20, 30]))]);

        let mut v = Variable::new("xs", Address::new(0x1000), slice, Arc::clone(&mem), Arc::clone(&bi));
        assert_eq!((v.len, v.cap), (3, 4));
        v.load_value(&LoadConfig::full_value());
        let values: Vec<_> = v.children.iter().map(|child| child.value.clone()).collect();
        assert_eq!(values, [Some(Value::Int(10)), Some(Value::Int(20)), Some(Value::Int(30))]);

        // Ten elements, none mapped: the load gives up after the budget
        let broken = snapshot(&[(0x1000, words(&[0x9000, 10, 10]))]);
        let mut v = Variable::new("xs", Address::new(0x1000), slice, broken, bi);
        v.load_value(&LoadConfig::full_value());
        assert!(v.unreadable.is_none());
        assert_eq!(v.children.len(), MAX_ERR_COUNT + 1);
        assert!(v.children.iter().all(|child| child.unreadable.is_some()));
    }

    #[test]
    fn test_partly_mapped_slice_keeps_readable_elements()
    {
        let builder = BinaryInfoBuilder::new(Architecture::X86_64);
        let types = builder.types();
        let int = types.basic("int", 8, TypeKind::Int);
        let slice = types.slice_of(int);
        let bi = Arc::new(builder.build());
        // Only the first two elements of the backing array are mapped
        let mem = snapshot(&[(0x1000, words(&[0x2000, 3, 3])), (0x2000, words(&[10, 20]))]);

        let mut v = Variable::new("xs", Address::new(0x1000), slice, mem, bi);
        v.load_value(&LoadConfig::full_value());
        assert!(v.unreadable.is_none());
        assert_eq!(v.children.len(), 3);
        assert_eq!(v.children[0].value, Some(Value::Int(10)));
        assert_eq!(v.children[1].value, Some(Value::Int(20)));
        assert!(v.children[2].value.is_none());
        assert!(v.children[2].unreadable.is_some());
    }

    #[test]
    fn test_index_past_address_space_is_rejected()
    {
        let builder = BinaryInfoBuilder::new(Architecture::X86_64);
        let types = builder.types();
        let int = types.basic("int", 8, TypeKind::Int);
        let slice = types.slice_of(int);
        let bi = Arc::new(builder.build());
        let mem = snapshot(&[(0x1000, words(&[0x2000, i64::MAX as u64, i64::MAX as u64]))]);

        let v = Variable::new("xs", Address::new(0x1000), slice, mem, bi);
        assert_eq!(v.len, i64::MAX);
        assert!(matches!(v.slice_access(i64::MAX / 2), Err(QuarryError::InvalidAccess(_))));
        assert!(v.slice_access(1).is_ok());
    }

    #[test]
    fn test_negative_slice_length_poisons()
    {
        let builder = BinaryInfoBuilder::new(Architecture::X86_64);
        let types = builder.types();
        let int = types.basic("int", 8, TypeKind::Int);
        let slice = types.slice_of(int);
        let bi = Arc::new(builder.build());
        let mem = snapshot(&[(0x1000, words(&[0x2000, (-1i64) as u64, 0]))]);

        let mut v = Variable::new("xs", Address::new(0x1000), slice, mem, bi);
        v.load_value(&LoadConfig::full_value());
        assert!(matches!(v.unreadable, Some(QuarryError::NegativeLength { .. })));
        assert!(v.children.is_empty());
    }

    #[test]
    fn test_float_specials_and_complex()
    {
        let builder = BinaryInfoBuilder::new(Architecture::X86_64);
        let types = builder.types();
        let float64 = types.basic("float64", 8, TypeKind::Float);
        let complex64 = types.basic("complex64", 8, TypeKind::Complex);
        let bi = Arc::new(builder.build());
        let mut complex = 1.5f32.to_le_bytes().to_vec();
        complex.extend_from_slice(&(-2.0f32).to_le_bytes());
        let mem = snapshot(&[
            (0x1000, f64::NEG_INFINITY.to_le_bytes().to_vec()),
            (0x2000, f64::NAN.to_le_bytes().to_vec()),
            (0x3000, complex),
        ]);

        let mut inf = Variable::new("a", Address::new(0x1000), float64, Arc::clone(&mem), Arc::clone(&bi));
        inf.load_value(&LoadConfig::single_value());
        assert_eq!(inf.float_special, FloatSpecial::NegInf);

        let mut nan = Variable::new("b", Address::new(0x2000), float64, Arc::clone(&mem), Arc::clone(&bi));
        nan.load_value(&LoadConfig::single_value());
        assert_eq!(nan.float_special, FloatSpecial::NaN);

        let mut c = Variable::new("c", Address::new(0x3000), complex64, mem, bi);
        assert_eq!(c.kind, Kind::Complex64);
        c.load_value(&LoadConfig::single_value());
        assert_eq!(c.value, Some(Value::Complex(1.5, -2.0)));
    }

    #[test]
    fn test_function_pointer_resolves_name()
    {
        let builder = BinaryInfoBuilder::new(Architecture::X86_64);
        let func = builder.types().basic("func()", 8, TypeKind::Func);
        let bi = Arc::new(
            builder
                .function(crate::binary::Function::new("main.handler", 0x40_1000, 0x40_1100))
                .build(),
        );
        let mem = snapshot(&[(0x1000, words(&[0x2000])), (0x2000, words(&[0x40_1000]))]);

        let mut v = Variable::new("f", Address::new(0x1000), func, mem, bi);
        v.load_value(&LoadConfig::single_value());
        assert_eq!(v.value, Some(Value::String("main.handler".into())));
        assert_eq!(v.base, Address::new(0x40_1000));
    }

    #[test]
    fn test_channel_buffer_sized_by_capacity()
    {
        let builder = BinaryInfoBuilder::new(Architecture::X86_64);
        let types = builder.types();
        let int = types.basic("int", 8, TypeKind::Int);
        let chan = types.chan_of(int);
        let bi = Arc::new(builder.build());
        // qcount 2, dataqsiz 3, buf 0x3000
        let mem = snapshot(&[
            (0x1000, words(&[0x2000])),
            (0x2000, words(&[2, 3, 0x3000, 8, 0, 0, 0])),
            (0x3000, words(&[11, 22, 33])),
        ]);

        let mut v = Variable::new("ch", Address::new(0x1000), chan, mem, bi);
        v.load_value(&LoadConfig::full_value());
        assert!(v.unreadable.is_none(), "{:?}", v.unreadable);
        assert_eq!(v.base, Address::new(0x2000));

        let buf = v.children.iter().find(|child| child.name == "buf").unwrap();
        let array = &buf.children[0];
        assert_eq!(array.len, 3);
        let values: Vec<_> = array.children.iter().map(|child| child.value.clone()).collect();
        assert_eq!(values, [Some(Value::Int(11)), Some(Value::Int(22)), Some(Value::Int(33))]);
    }
}
