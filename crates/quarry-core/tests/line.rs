//! Source positions through the binary's function and line tables

use std::sync::Arc;

use gimli::constants;
use quarry_core::binary::{BinaryInfo, BinaryInfoBuilder, Function};
use quarry_core::line::{FileEntry, LineProgramHeader, LineTable};
use quarry_core::types::{Address, Architecture};

/// `main.go` lines 10, 11 and 12 at 0x1000, 0x1004 and 0x100c, ending at
/// 0x1020.
fn table() -> Arc<LineTable>
{
    let header = LineProgramHeader {
        file_names: vec![FileEntry::new("main.go")],
        ..LineProgramHeader::default()
    };

    let mut program = vec![0, 9, constants::DW_LNE_set_address.0];
    program.extend_from_slice(&0x1000u64.to_le_bytes());
    program.extend_from_slice(&[constants::DW_LNS_advance_line.0, 9, constants::DW_LNS_copy.0]);
    // Special opcodes: (line delta + 5) + 14 * address delta + 13
    program.extend_from_slice(&[75, 131]);
    program.extend_from_slice(&[constants::DW_LNS_advance_pc.0, 0x14]);
    program.extend_from_slice(&[0, 1, constants::DW_LNE_end_sequence.0]);

    Arc::new(LineTable::new(header, program))
}

fn binary(table: &Arc<LineTable>) -> BinaryInfo
{
    BinaryInfoBuilder::new(Architecture::X86_64)
        .function(Function::new("main.c", 0x1000, 0x1010).with_line_table(Arc::clone(table)))
        .function(Function::new("main.d", 0x1010, 0x1020).with_line_table(Arc::clone(table)))
        .build()
}

#[test]
fn test_pc_to_line_through_functions()
{
    let table = table();
    let bi = binary(&table);

    let loc = bi.pc_to_line(0x1006);
    assert_eq!(loc.pc, Address::new(0x1006));
    assert_eq!(loc.file, "main.go");
    assert_eq!(loc.line, Some(11));
    assert_eq!(loc.function_name(), Some("main.c"));

    // The row before main.d's entry still covers it
    let loc = bi.pc_to_line(0x1014);
    assert_eq!(loc.line, Some(12));
    assert_eq!(loc.function_name(), Some("main.d"));

    let loc = bi.pc_to_line(0x5000);
    assert!(loc.function.is_none());
    assert!(loc.line.is_none());
}

#[test]
fn test_line_to_pc_reports_function()
{
    let table = table();
    let bi = binary(&table);

    let (pc, function) = bi.line_to_pc("main.go", 11).unwrap();
    assert_eq!(pc, 0x1004);
    assert_eq!(function.name, "main.c");

    let (pc, _) = bi.line_to_pc("main.go", 12).unwrap();
    assert_eq!(pc, 0x100c);

    assert!(bi.line_to_pc("main.go", 40).is_none());
    assert!(bi.line_to_pc("other.go", 10).is_none());
}

#[test]
fn test_repeated_lookups_agree()
{
    let table = table();
    let bi = binary(&table);

    // Forward, then backward within one function, then forward again
    let lines: Vec<_> = [0x1000, 0x100c, 0x1004, 0x100f]
        .into_iter()
        .map(|pc| bi.pc_to_line(pc).line)
        .collect();
    assert_eq!(lines, [Some(10), Some(12), Some(11), Some(12)]);

    assert_eq!(table.all_pcs_between(0x1000, 0x1010), [0x1000, 0x1004, 0x100c]);
    assert_eq!(table.all_pcs_for_file_line("main.go", 11), [0x1004]);
}
