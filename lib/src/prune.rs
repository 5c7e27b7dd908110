//! Construction-time checks on the parameter list.

use std::collections::HashSet;

use tracing::debug;

use crate::{program::Program, tensor::Parameter, Error, Result};

/// Every entry must be a persistable tensor, and every persistable variable
/// declared by the program must come from the parameter list.
pub fn check_params_declared(params: &[Parameter], program: &Program) -> Result<()> {
  let mut declared = HashSet::new();
  for (index, param) in params.iter().enumerate() {
    let p = param.read();
    if !p.persistable {
      return Err(Error::TypeContract {
        index,
        name: p.name.clone(),
      });
    }
    declared.insert(p.name.clone());
  }

  for var in program.vars().filter(|v| v.persistable) {
    if !declared.contains(&var.name) {
      return Err(Error::UndeclaredParameter { name: var.name.clone() });
    }
  }
  Ok(())
}

/// Keeps the parameters some operator of `program` reads or writes, in their
/// original order.
pub fn prune_unused(params: Vec<Parameter>, program: &Program) -> Vec<Parameter> {
  let referenced: HashSet<&str> = program
    .ops()
    .flat_map(|op| op.input_arg_names().chain(op.output_arg_names()))
    .collect();
  let before = params.len();
  let kept: Vec<Parameter> = params
    .into_iter()
    .filter(|p| referenced.contains(p.read().name.as_str()))
    .collect();
  debug!(before, after = kept.len(), "pruned unused parameters");
  kept
}
