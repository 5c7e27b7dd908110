use tracing::{debug, instrument};

use super::kernels;
use crate::{
  bridge::FAKE_VAR_NAME,
  collaborators::{ExecuteArgs, Interpreter},
  program::grad_var_name,
  Error, Result,
};

/// Runs the global block operator by operator on the CPU.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceInterpreter;

impl Interpreter for ReferenceInterpreter {
  #[instrument(level = "debug", skip_all, fields(scope = args.scope.id(), is_test = args.is_test))]
  fn execute(&self, args: ExecuteArgs<'_>) -> Result<()> {
    if args.inputs.is_empty() || args.outputs.is_empty() {
      return Err(Error::Interpreter("inputs and outputs must not be empty".to_string()));
    }
    let ops = &args.program.global_block().ops;
    let (start, end) = (args.op_range.start, args.op_range.end);
    if start > end || end > ops.len() {
      return Err(Error::Interpreter(format!(
        "op range {}..{} out of bounds for {} ops",
        start,
        end,
        ops.len()
      )));
    }

    for t in args.inputs {
      args.scope.set(t.clone());
    }
    for p in args.params {
      args.scope.set(p.read().clone());
    }

    for op in &ops[start..end] {
      kernels::run(args.scope, op)?;
    }
    if !args.is_test {
      debug!(backward_ops = ops.len() - end, "running backward");
      for op in &ops[end..] {
        kernels::run(args.scope, op)?;
      }
    }

    for out in args.outputs.iter_mut() {
      match args.scope.get(&out.name) {
        Some(value) => {
          out.shape = value.shape;
          out.data = value.data;
          out.kind = value.kind;
        }
        None if out.name == FAKE_VAR_NAME => {}
        None => return Err(Error::MissingValue { name: out.name.clone() }),
      }
    }
    for aux in args.aux_outputs.iter_mut() {
      if let Some(value) = args.scope.get(&aux.name) {
        aux.shape = value.shape;
        aux.data = value.data;
      }
    }

    if !args.is_test {
      for p in args.params {
        let name = p.name();
        if let Some(grad) = args.scope.get(&grad_var_name(&name)) {
          p.write().grad = Some(grad.data);
        }
      }
    }
    Ok(())
  }
}
