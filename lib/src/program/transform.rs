//! Whole-program rewrite passes. Each pass consumes a program and returns the
//! rewritten one, so they only ever run on clones of the base program.

use tracing::debug;

use super::Program;

pub const IS_TEST: &str = "is_test";
pub const OP_CALLSTACK: &str = "op_callstack";

/// Sets `is_test` on every operator that declares it. Operators without the
/// attribute are left alone.
pub fn set_is_test(mut program: Program, is_test: bool) -> Program {
  let mut changed = 0;
  for op in program.ops_mut().filter(|op| op.has_attr(IS_TEST)) {
    op.set_attr(IS_TEST, is_test);
    changed += 1;
  }
  debug!(is_test, changed, "rewrote is_test attributes");
  program
}

/// Drops the recorded call stacks the tracer attaches to operators.
pub fn strip_debug_attributes(mut program: Program) -> Program {
  for op in program.ops_mut() {
    op.remove_attr(OP_CALLSTACK);
  }
  program
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::program::{Attr, Block, Operator};

  fn two_block_program() -> Program {
    let mut p = Program::new();
    p.global_block_mut().append_op(
      Operator::new("dropout")
        .attr(IS_TEST, false)
        .attr(OP_CALLSTACK, vec!["frame".to_string()]),
    );
    p.global_block_mut().append_op(Operator::new("relu"));
    let mut sub = Block::new(1);
    sub.append_op(Operator::new("batch_norm").attr(IS_TEST, false).attr("epsilon", 1e-5));
    p.blocks.push(sub);
    p
  }

  #[test]
  fn test_set_is_test_only_touches_declaring_ops() {
    let p = set_is_test(two_block_program(), true);
    assert_eq!(p.blocks[0].ops[0].get_attr(IS_TEST), Some(&Attr::Bool(true)));
    assert!(!p.blocks[0].ops[1].has_attr(IS_TEST));
    assert_eq!(p.blocks[1].ops[0].get_attr(IS_TEST), Some(&Attr::Bool(true)));
    assert_eq!(p.blocks[1].ops[0].get_attr("epsilon"), Some(&Attr::Float(1e-5)));
  }

  #[test]
  fn test_strip_debug_attributes() {
    let p = strip_debug_attributes(two_block_program());
    assert!(p.ops().all(|op| !op.has_attr(OP_CALLSTACK)));
    assert!(p.blocks[0].ops[0].has_attr(IS_TEST));
  }
}
