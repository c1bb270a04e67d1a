//! Field, element and key access; assignment.

use std::sync::Arc;

use super::{Kind, LoadConfig, Value, Variable};
use crate::binary::{StructField, TypeId, TypeKind};
use crate::error::{QuarryError, QuarryResult};
use crate::memory::{dereference_memory, read_uint};
use crate::types::Address;

impl Variable
{
    /// The variable `field` describes, inside this record.
    ///
    /// An unreadable record yields a copy of itself; a record at address
    /// zero has no fields.
    pub fn to_field(&self, field: &StructField) -> QuarryResult<Variable>
    {
        if self.unreadable.is_some() {
            return Ok(self.clone());
        }
        if self.addr.is_null() {
            return Err(QuarryError::Nil(self.name.clone()));
        }
        let name = if self.name.is_empty() {
            String::new()
        } else {
            let short = field.name.split_once('.').map_or(field.name.as_str(), |(_, rest)| rest);
            format!("{}.{}", self.name, short)
        };
        Ok(Variable::new(
            name,
            self.addr.offset(field.byte_offset),
            field.ty,
            Arc::clone(&self.mem),
            Arc::clone(&self.bi),
        ))
    }

    /// The pointee of a pointer, or the variable itself for everything else.
    pub fn maybe_dereference(&self) -> Variable
    {
        if self.unreadable.is_some() {
            return self.clone();
        }
        let Some(real) = self.real() else {
            return self.clone();
        };
        let TypeKind::Pointer(pointee) = real.kind else {
            return self.clone();
        };
        // Pointers built by taking an address carry their target
        if self.addr.is_null() && self.loaded && self.children.len() == 1 {
            return self.children[0].clone();
        }

        let target_mem = dereference_memory(&self.mem);
        match read_uint(self.mem.as_ref(), self.addr, real.size.max(0) as usize) {
            Ok(ptr) => Variable::new("", Address::new(ptr), pointee, target_mem, Arc::clone(&self.bi)),
            Err(err) => {
                let mut target = Variable::new("", Address::ZERO, pointee, target_mem, Arc::clone(&self.bi));
                target.poison(err);
                target
            }
        }
    }

    /// Member `member` of a struct, a pointer to one, an interface holding
    /// one, or a channel header.
    ///
    /// Fields of embedded structs are promoted; an embedded struct can also
    /// be named through its type, as in `pkg.Embedded`.
    pub fn struct_member(&self, member: &str) -> QuarryResult<Variable>
    {
        if self.unreadable.is_some() {
            return Ok(self.clone());
        }

        let holder = match self.kind {
            Kind::Chan => match self.chan_header_type() {
                Some(header) => self.retyped(header),
                None => self.clone(),
            },
            Kind::Interface => {
                let mut iface = self.clone();
                if let Err(err) = iface.load_interface(0, false, &LoadConfig::single_value()) {
                    iface.poison(err);
                    return Ok(iface);
                }
                match iface.children.into_iter().next() {
                    Some(data) => data,
                    None => self.clone(),
                }
            }
            _ => self.clone(),
        };

        let mut record = holder.maybe_dereference();
        record.name.clone_from(&holder.name);
        if record.unreadable.is_some() {
            return Ok(record);
        }

        let real = record.real();
        match real.as_deref().map(|real| &real.kind) {
            Some(TypeKind::Struct(fields)) => {
                if let Some(field) = fields.iter().find(|field| field.name == member) {
                    return record.to_field(field);
                }
                for field in fields.iter().filter(|field| self.is_embedding(field)) {
                    if field.name.split_once('.').is_some_and(|(_, name)| name == member) {
                        return record.to_field(field);
                    }
                    let mut embedded = record.to_field(field)?;
                    embedded.name.clone_from(&record.name);
                    if let Ok(promoted) = embedded.struct_member(member) {
                        return Ok(promoted);
                    }
                }
                Err(QuarryError::InvalidAccess(format!("{} has no member {member}", self.name)))
            }
            _ if self.name.is_empty() => Err(QuarryError::InvalidAccess(format!(
                "type {} is not a struct",
                record.type_string()
            ))),
            _ => Err(QuarryError::InvalidAccess(format!(
                "{} (type {}) is not a struct",
                self.name,
                record.type_string()
            ))),
        }
    }

    fn is_embedding(&self, field: &StructField) -> bool
    {
        if field.embedded {
            return true;
        }
        let type_name = self.bi.types().name(field.ty);
        type_name == field.name
            || (field.name.len() > 1 && field.name.starts_with('*') && type_name.get(1..) == field.name.get(1..))
    }

    /// Element `index` of a string, array or slice.
    pub fn slice_access(&self, index: i64) -> QuarryResult<Variable>
    {
        if index < 0 || index >= self.len {
            return Err(QuarryError::InvalidAccess("index out of bounds".into()));
        }
        let elem = self
            .field_type
            .ok_or_else(|| QuarryError::InvalidAccess(format!("{} does not support indexing", self.type_string())))?;
        let mem = if self.kind == Kind::Array {
            Arc::clone(&self.mem)
        } else {
            dereference_memory(&self.mem)
        };
        let offset = index
            .checked_mul(self.stride)
            .ok_or_else(|| QuarryError::InvalidAccess("index out of bounds".into()))?;
        Ok(Variable::new(
            "",
            self.base.offset(offset),
            elem,
            mem,
            Arc::clone(&self.bi),
        ))
    }

    /// The value stored under `key`.
    pub fn map_access(&self, key: &Variable) -> QuarryResult<Variable>
    {
        let mut map = self.clone();
        let mut it = map
            .map_iterator()
            .map_err(|err| QuarryError::unreadable("map", &err))?;

        let mut cfg = LoadConfig::full_value();
        if let Some(Value::String(s)) = &key.value {
            cfg.max_string_len = cfg.max_string_len.max(s.len());
        }

        let mut first = true;
        while it.next() {
            let mut candidate = it.key()?;
            candidate.load_value(&cfg);
            if let Some(err) = &candidate.unreadable {
                return Err(QuarryError::unreadable("map", err));
            }
            if first {
                first = false;
                key.is_type(candidate.dwarf_type, candidate.kind)?;
            }
            if compare_equal(&candidate, key)? {
                return it.value();
            }
        }
        if let Some(err) = it.err() {
            return Err(err.clone());
        }
        Err(QuarryError::InvalidAccess("key not found".into()))
    }

    /// Whether this value can be stored into a variable of type `ty` and
    /// kind `kind`.
    ///
    /// Typed values need the same type. Untyped constants convert along the
    /// usual numeric lines, and `nil` goes into anything that can be nil.
    pub fn is_type(&self, ty: Option<TypeId>, kind: Kind) -> QuarryResult<()>
    {
        let types = self.bi.types();
        if let Some(own) = self.dwarf_type {
            let same = ty.is_some_and(|ty| types.resolve_typedef(ty) == types.resolve_typedef(own) || types.name(ty) == types.name(own));
            if !same {
                let target = ty.map_or_else(|| "untyped value".to_string(), |ty| types.name(ty));
                return Err(QuarryError::TypeMismatch(format!(
                    "can not convert value of type {} to {target}",
                    types.name(own)
                )));
            }
            return Ok(());
        }
        let Some(ty) = ty else {
            return Ok(());
        };
        let target = types.name(ty);

        if self.is_nil_literal() {
            return match kind {
                Kind::Slice | Kind::Map | Kind::Func | Kind::Ptr | Kind::UnsafePointer | Kind::Chan | Kind::Interface => {
                    Ok(())
                }
                _ => Err(QuarryError::TypeMismatch(format!("mismatched types nil and {target}"))),
            };
        }

        let converts = match (&self.value, kind) {
            (Some(Value::Int(_) | Value::Uint(_)), Kind::Int | Kind::Uint) => true,
            (Some(Value::Int(_) | Value::Uint(_) | Value::Float(_)), Kind::Float32 | Kind::Float64) => true,
            (Some(Value::Bool(_)), Kind::Bool) => true,
            (Some(Value::String(_)), Kind::String) => true,
            (
                Some(Value::Int(_) | Value::Uint(_) | Value::Float(_) | Value::Complex(..)),
                Kind::Complex64 | Kind::Complex128,
            ) => true,
            _ => false,
        };
        if converts {
            Ok(())
        } else {
            let shown = self.value.as_ref().map_or_else(|| self.kind.to_string(), ToString::to_string);
            Err(QuarryError::TypeMismatch(format!("can not convert {shown} constant to {target}")))
        }
    }

    /// Write `src` into this variable's storage.
    ///
    /// `src` must be loaded and already checked with [`Variable::is_type`].
    pub fn set_value(&self, src: &Variable, src_expr: &str) -> QuarryResult<()>
    {
        if let Some(err) = &src.unreadable {
            return Err(QuarryError::unreadable(src_expr, err));
        }
        let size = self.real().map_or(0, |real| real.size.max(0) as usize);
        let missing = || QuarryError::TypeMismatch(format!("{src_expr} has no value to assign"));

        match self.kind {
            Kind::Float32 | Kind::Float64 => {
                let x = src.value.as_ref().and_then(Value::as_f64).ok_or_else(missing)?;
                self.write_float(self.addr, x, size)
            }
            Kind::Complex64 | Kind::Complex128 => {
                let (real, imag) = src.value.as_ref().and_then(Value::as_complex).ok_or_else(missing)?;
                self.write_float(self.addr, real, size / 2)?;
                self.write_float(self.addr + (size / 2) as u64, imag, size / 2)
            }
            Kind::Int => {
                let n = src.value.as_ref().and_then(Value::as_i64).ok_or_else(missing)?;
                self.write_uint(self.addr, n as u64, size)
            }
            Kind::Uint => {
                let n = src.value.as_ref().and_then(Value::as_u64).ok_or_else(missing)?;
                self.write_uint(self.addr, n, size)
            }
            Kind::Bool => {
                let b = src.value.as_ref().and_then(Value::as_bool).ok_or_else(missing)?;
                self.write_uint(self.addr, u64::from(b), 1)
            }
            Kind::Ptr | Kind::UnsafePointer => {
                let target = src.children.first().ok_or_else(missing)?;
                self.write_uint(self.addr, target.addr.value(), self.pointer_size())
            }
            kind => Err(QuarryError::Unsupported(format!(
                "can not set variables of type {kind} (not implemented)"
            ))),
        }
    }

    fn write_uint(&self, addr: Address, value: u64, size: usize) -> QuarryResult<()>
    {
        if size == 0 || size > 8 {
            return Err(QuarryError::InvalidArgument(format!("cannot write a {size}-byte integer")));
        }
        let bytes = value.to_le_bytes();
        self.mem.write_memory(addr, &bytes[..size]).map(drop)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_float(&self, addr: Address, value: f64, size: usize) -> QuarryResult<()>
    {
        match size {
            4 => self.mem.write_memory(addr, &(value as f32).to_le_bytes()).map(drop),
            8 => self.mem.write_memory(addr, &value.to_le_bytes()).map(drop),
            _ => Err(QuarryError::InvalidArgument(format!("cannot write a {size}-byte float"))),
        }
    }
}

/// `a == b` for scalar values.
fn compare_equal(a: &Variable, b: &Variable) -> QuarryResult<bool>
{
    match (&a.value, &b.value) {
        (Some(x), Some(y)) => Ok(x.loosely_equals(y)),
        _ if a.kind == Kind::Ptr && b.kind == Kind::Ptr => {
            let target = |v: &Variable| v.children.first().map(|child| child.addr);
            Ok(target(a) == target(b))
        }
        _ => Err(QuarryError::TypeMismatch(format!(
            "can not compare values of type {}",
            a.type_string()
        ))),
    }
}
