//! Folding a comparison result into the conditional jump that follows it.
//!
//! Comparison bytecodes peek at the next opcode. When it is a conditional
//! jump the boolean is consumed right away instead of being pushed and popped
//! again; the resulting pc and stack are identical either way.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchFusion {
    /// Push the boolean and continue at the next bytecode.
    Materialize,
    /// Skip the jump instruction and move `advance` bytes forward from its opcode.
    Fold { advance: usize },
}

/// Decides what a comparison yielding `result` does when the next bytecode
/// sits at `code[pc]`.
pub fn fuse_branch(result: bool, code: &[u8], pc: usize) -> BranchFusion {
    let Some(&next) = code.get(pc) else {
        return BranchFusion::Materialize;
    };
    match next {
        // short jump if false
        152..=159 => {
            let taken = if result { 0 } else { usize::from(next & 7) + 1 };
            BranchFusion::Fold { advance: 1 + taken }
        }
        // long jump if true / if false
        168..=175 => {
            let Some(&low) = code.get(pc + 1) else {
                return BranchFusion::Materialize;
            };
            let jump_on = next < 172;
            let offset = usize::from(next & 3) * 256 + usize::from(low);
            let taken = if result == jump_on { offset } else { 0 };
            BranchFusion::Fold { advance: 2 + taken }
        }
        _ => BranchFusion::Materialize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs a jump the slow way: the boolean is on the stack and the jump pops it.
    fn unfused(result: bool, code: &[u8], pc: usize) -> usize {
        let next = code[pc];
        match next {
            152..=159 if !result => pc + 1 + usize::from(next & 7) + 1,
            152..=159 => pc + 1,
            168..=175 => {
                let offset = usize::from(next & 3) * 256 + usize::from(code[pc + 1]);
                let jump_on = next < 172;
                if result == jump_on { pc + 2 + offset } else { pc + 2 }
            }
            _ => pc,
        }
    }

    #[test]
    fn folds_match_the_unfused_jump() {
        let code = [0x99, 0x9F, 0xA8, 0x03, 0xAD, 0x10, 0x76];
        for pc in [0, 1, 2, 4] {
            for result in [true, false] {
                match fuse_branch(result, &code, pc) {
                    BranchFusion::Fold { advance } => {
                        assert_eq!(
                            pc + advance,
                            unfused(result, &code, pc),
                            "pc {pc} result {result}"
                        );
                    }
                    BranchFusion::Materialize => panic!("expected a fold at {pc}"),
                }
            }
        }
    }

    #[test]
    fn other_opcodes_materialize() {
        let code = [0x76, 0x90, 0xA4];
        assert_eq!(fuse_branch(true, &code, 0), BranchFusion::Materialize);
        // unconditional short jump
        assert_eq!(fuse_branch(false, &code, 1), BranchFusion::Materialize);
        // unconditional long jump
        assert_eq!(fuse_branch(true, &code, 2), BranchFusion::Materialize);
        assert_eq!(fuse_branch(true, &code, 3), BranchFusion::Materialize);
    }

    #[test]
    fn truncated_long_jump_materializes() {
        assert_eq!(fuse_branch(true, &[0xA8], 0), BranchFusion::Materialize);
    }
}
