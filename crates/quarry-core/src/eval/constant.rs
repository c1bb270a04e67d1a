//! Symbolic descriptions of integers through their type's named constants.

use super::{Variable, VariableFlags};
use crate::binary::ConstantValue;

impl Variable
{
    /// The constant, or `|`-joined set of single-bit constants, whose value
    /// equals this integer.
    ///
    /// Only typed, non-constant integers of a package-qualified type that
    /// declares constants get a description.
    pub fn const_descr(&self) -> Option<String>
    {
        if self.flags.contains(VariableFlags::CONSTANT) {
            return None;
        }
        let ty = self.dwarf_type?;
        let values = self.bi.constants_of(ty)?;
        let type_name = self.bi.types().name(ty);
        if !type_name.contains('.') || type_name.starts_with("C.") {
            return None;
        }
        if !self.kind.is_integer() {
            return None;
        }
        describe(values, self.value.as_ref()?.as_i64()?)
    }
}

fn describe(values: &[ConstantValue], mut n: i64) -> Option<String>
{
    if let Some(exact) = values.iter().find(|constant| constant.value == n) {
        return Some(exact.name.clone());
    }
    if n == 0 {
        return None;
    }
    let mut names = Vec::new();
    for constant in values.iter().filter(|constant| constant.single_bit) {
        if n & constant.value != 0 {
            names.push(constant.name.as_str());
            n &= !constant.value;
        }
    }
    (n == 0).then(|| names.join("|"))
}

#[cfg(test)]
mod tests
{
    use std::sync::Arc;

    use super::*;
    use crate::binary::{BinaryInfoBuilder, TypeKind};
    use crate::eval::LoadConfig;
    use crate::memory::{Memory, SnapshotMemory};
    use crate::types::{Address, Architecture};

    fn mode_variable(raw: i64) -> Variable
    {
        let builder = BinaryInfoBuilder::new(Architecture::X86_64);
        let mode = builder.types().basic("main.Mode", 8, TypeKind::Int);
        let bi = Arc::new(
            builder
                .constant(mode, "main.Read", 1)
                .constant(mode, "main.Write", 2)
                .constant(mode, "main.Exec", 4)
                .constant(mode, "main.All", 7)
                .build(),
        );
        let mem: Memory = Arc::new(SnapshotMemory::new().with_region(Address::new(0x1000), raw.to_le_bytes().to_vec()));
        let mut v = Variable::new("m", Address::new(0x1000), mode, mem, bi);
        v.load_value(&LoadConfig::single_value());
        v
    }

    #[test]
    fn test_exact_constant_wins()
    {
        assert_eq!(mode_variable(2).const_descr().as_deref(), Some("Write"));
        assert_eq!(mode_variable(7).const_descr().as_deref(), Some("All"));
    }

    #[test]
    fn test_bit_flags_are_joined()
    {
        assert_eq!(mode_variable(5).const_descr().as_deref(), Some("Read|Exec"));
    }

    #[test]
    fn test_no_description()
    {
        assert_eq!(mode_variable(0).const_descr(), None);
        assert_eq!(mode_variable(9).const_descr(), None);
    }
}
