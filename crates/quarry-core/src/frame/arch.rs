//! Architecture default unwind rules.

use super::rules::{FrameContext, FrameRule};
use crate::binary::BinaryInfo;
use crate::types::Architecture;

/// Signal trampoline return function; its frames never carry CFI.
const SIGRETURN: &str = "runtime.sigreturn";

impl Architecture
{
    /// Normalize the unwind rules found for `pc`.
    ///
    /// Without a frame description (or inside the signal return trampoline)
    /// the frame pointer chain is used: the CFA sits two words above the
    /// frame pointer, the return address one word below the CFA and the
    /// saved frame pointer two words below it. With a description, a frame
    /// pointer rule is added when the description has none, so the chain
    /// stays usable for later frames that lack CFI.
    pub fn fix_frame_unwind_context(self, context: Option<FrameContext>, pc: u64, bi: &BinaryInfo) -> FrameContext
    {
        let in_sigreturn = bi
            .lookup_func(SIGRETURN)
            .is_some_and(|function| function.contains(pc));

        let ptr = i64::from(self.pointer_size());
        let bp = self.bp_register();
        match context {
            Some(mut context) if !in_sigreturn => {
                if matches!(context.rule(bp), FrameRule::Undefined) {
                    context.regs.insert(bp, FrameRule::FramePointer(bp));
                }
                context
            }
            _ => FrameContext::new(FrameRule::Cfa { register: bp, offset: 2 * ptr }, self.return_address_register())
                .with_rule(self.return_address_register(), FrameRule::Offset(-ptr))
                .with_rule(bp, FrameRule::Offset(-2 * ptr))
                .with_rule(self.sp_register(), FrameRule::ValOffset(0)),
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::binary::{BinaryInfoBuilder, Function};

    #[test]
    fn test_missing_description_uses_frame_pointer_chain()
    {
        let bi = BinaryInfoBuilder::new(Architecture::X86_64).build();
        let ctx = Architecture::X86_64.fix_frame_unwind_context(None, 0x1000, &bi);

        assert_eq!(ctx.cfa, FrameRule::Cfa { register: 6, offset: 16 });
        assert_eq!(ctx.ret_addr_reg, 16);
        assert_eq!(ctx.rule(16), &FrameRule::Offset(-8));
        assert_eq!(ctx.rule(6), &FrameRule::Offset(-16));
        assert_eq!(ctx.rule(7), &FrameRule::ValOffset(0));
    }

    #[test]
    fn test_frame_pointer_rule_is_added()
    {
        let bi = BinaryInfoBuilder::new(Architecture::X86_64).build();
        let found = FrameContext::new(FrameRule::Cfa { register: 7, offset: 8 }, 16).with_rule(16, FrameRule::Offset(-8));
        let ctx = Architecture::X86_64.fix_frame_unwind_context(Some(found), 0x1000, &bi);

        assert_eq!(ctx.cfa, FrameRule::Cfa { register: 7, offset: 8 });
        assert_eq!(ctx.rule(6), &FrameRule::FramePointer(6));
    }

    #[test]
    fn test_sigreturn_ignores_description()
    {
        let bi = BinaryInfoBuilder::new(Architecture::Arm64)
            .function(Function::new("runtime.sigreturn", 0x5000, 0x5010))
            .build();
        let found = FrameContext::new(FrameRule::Cfa { register: 31, offset: 0 }, 30);
        let ctx = Architecture::Arm64.fix_frame_unwind_context(Some(found), 0x5004, &bi);

        assert_eq!(ctx.cfa, FrameRule::Cfa { register: 29, offset: 16 });
        assert_eq!(ctx.ret_addr_reg, 30);
    }
}
