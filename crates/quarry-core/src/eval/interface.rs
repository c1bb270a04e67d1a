//! Interface values: recovering the dynamic type behind `iface`/`eface`.

use std::sync::Arc;

use super::{Kind, LoadConfig, Value, Variable};
use crate::binary::{TypeKind, TypeLookup};
use crate::error::{QuarryError, QuarryResult};
use crate::memory::cache_memory;

/// Type descriptor flag: the value is stored in the data word itself.
const KIND_DIRECT_IFACE: u64 = 1 << 5;

fn invalid(detail: impl std::fmt::Display) -> QuarryError
{
    QuarryError::MalformedType(format!("invalid interface type: {detail}"))
}

impl Variable
{
    /// Resolve the dynamic type and make the held value the only child,
    /// named `data`.
    ///
    /// The child is loaded only with `load_data` and while `level` is within
    /// the recursion budget; otherwise it carries just its address.
    pub(crate) fn load_interface(&mut self, level: i32, load_data: bool, cfg: &LoadConfig) -> QuarryResult<()>
    {
        let real = self.real().ok_or_else(|| invalid("no type"))?;
        let TypeKind::Interface(record) = real.kind else {
            return Err(invalid(format!("{} is not an interface", real.name)));
        };
        self.mem = cache_memory(&self.mem, self.addr, real.size.max(0) as usize);
        let record = self.bi.types().get(self.bi.types().resolve_typedef(record));

        let mut rtype = None;
        let mut type_string = None;
        let mut data = None;
        let mut is_nil = false;

        for field in record.fields() {
            match field.name.as_str() {
                "tab" => {
                    let tab = self.to_field(field)?.maybe_dereference();
                    is_nil = tab.addr.is_null();
                    if !is_nil {
                        let ty = tab.struct_member("_type").map_err(invalid)?;
                        type_string = ty.struct_member("_string").ok().map(|s| s.maybe_dereference());
                        rtype = Some(ty);
                    }
                }
                "_type" => {
                    let ty = self.to_field(field)?;
                    is_nil = ty.maybe_dereference().addr.is_null();
                    if !is_nil {
                        type_string = ty.struct_member("_string").ok().map(|s| s.maybe_dereference());
                        rtype = Some(ty);
                    }
                }
                "data" => data = Some(self.to_field(field)?),
                _ => {}
            }
        }

        if is_nil {
            let mut target = data.ok_or_else(|| invalid("no data field"))?.maybe_dereference();
            target.only_addr = true;
            self.children = vec![target];
            return Ok(());
        }
        let data = data.ok_or_else(|| invalid("no data field"))?;

        let (ty, kind) = match type_string {
            Some(mut name) if !name.addr.is_null() => {
                if name.kind != Kind::String {
                    return Err(invalid("type name is not a string"));
                }
                name.load_value(&LoadConfig {
                    follow_pointers: false,
                    max_variable_recurse: 0,
                    max_string_len: 512,
                    max_array_values: 0,
                    max_struct_fields: 0,
                });
                if let Some(err) = &name.unreadable {
                    return Err(invalid(err));
                }
                let name = match &name.value {
                    Some(Value::String(name)) => name.clone(),
                    _ => return Err(invalid("type name is not a string")),
                };
                let ty = self.bi.find_type(&name).map_err(|err| {
                    QuarryError::MalformedType(format!("interface type {name:?} not found for {}: {err}", data.addr))
                })?;
                (ty, 0)
            }
            _ => {
                let descriptor = rtype.ok_or_else(|| invalid("no type descriptor"))?.maybe_dereference();
                let name = self
                    .bi
                    .runtime_type_name(descriptor.addr.value())
                    .ok_or_else(|| invalid(format!("no type name for runtime type at {}", descriptor.addr)))?
                    .to_string();
                let kind = descriptor.struct_member("kind").and_then(|mut kind| kind.as_uint()).map_err(invalid)?;
                let ty = self.bi.find_type(&name).map_err(|err| {
                    QuarryError::MalformedType(format!("interface type {name:?} not found for {}: {err}", data.addr))
                })?;
                (ty, kind)
            }
        };

        let types = self.bi.types();
        let mut deref = false;
        let mut ty = ty;
        if kind & KIND_DIRECT_IFACE == 0 && !matches!(types.get(types.resolve_typedef(ty)).kind, TypeKind::Pointer(_)) {
            ty = types.pointer_to(ty);
            deref = true;
        }

        let mut held = Variable::new("data", data.addr, ty, Arc::clone(&data.mem), Arc::clone(&self.bi));
        if deref {
            held = held.maybe_dereference();
            held.name = "data".to_string();
        }
        if load_data && level <= cfg.max_variable_recurse {
            held.load_value_internal(level, cfg);
        } else {
            held.only_addr = true;
        }
        self.children = vec![held];
        Ok(())
    }
}
