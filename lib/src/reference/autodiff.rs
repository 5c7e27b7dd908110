//! Reverse-mode backward construction over the global block.

use std::collections::{HashMap, HashSet};

use itertools::Itertools;
use tracing::{debug, instrument};

use super::kernels::IS_SPARSE;
use crate::{
  collaborators::Autodiff,
  program::{grad_var_name, Attr, Block, Operator, Program, Variable},
  tensor::VarKind,
  Error, Result,
};

pub const OP_ROLE: &str = "op_role";

/// Input slots each supported operator propagates gradients to.
fn differentiable_slots(op_type: &str) -> Option<&'static [&'static str]> {
  match op_type {
    "elementwise_add" | "elementwise_mul" => Some(&["X", "Y"]),
    "scale" | "relu" | "mean" | "dropout" | "assign" => Some(&["X"]),
    "lookup_table" => Some(&["W"]),
    "fill_constant" => Some(&[]),
    _ => None,
  }
}

fn rename(name: &str, k: usize) -> String {
  format!("{}@RENAME@{}", grad_var_name(name), k)
}

/// Appends `fill_constant` seeds for the targets and one `<op>_grad` per
/// forward operator on a path from a trainable variable to a target.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceAutodiff;

/// Which variables can carry a gradient: everything downstream of a variable
/// that is not marked `stop_gradient`.
fn trainable_vars(block: &Block) -> HashSet<String> {
  let produced: HashSet<&str> = block.ops.iter().flat_map(|op| op.output_arg_names()).collect();
  let mut trainable: HashSet<String> = block
    .vars
    .values()
    .filter(|v| !v.stop_gradient && !produced.contains(v.name.as_str()))
    .map(|v| v.name.clone())
    .collect();
  for op in &block.ops {
    // unknown operators are assumed to pass gradients through every slot
    let (flows, outs): (bool, Vec<&str>) = match differentiable_slots(&op.op_type) {
      Some(slots) => (
        slots
          .iter()
          .flat_map(|slot| op.input_names(slot))
          .any(|name| trainable.contains(name)),
        op.output_names("Out").iter().map(String::as_str).collect(),
      ),
      None => (
        op.input_arg_names().any(|name| trainable.contains(name)),
        op.output_arg_names().collect(),
      ),
    };
    if flows {
      for out in outs {
        let stopped = block.var(out).map_or(false, |v| v.stop_gradient);
        if !stopped {
          trainable.insert(out.to_string());
        }
      }
    }
  }
  trainable
}

struct Planner<'a> {
  block: &'a Block,
  trainable: HashSet<String>,
  /// Number of gradient contributions each variable receives.
  contributions: HashMap<String, usize>,
}

impl<'a> Planner<'a> {
  /// Edges `(op index, slot, input name)` of the backward pass, in the
  /// reverse order they will be emitted.
  fn plan(&mut self, targets: &[&str]) -> Result<Vec<(usize, &'static str, String)>> {
    let mut live: HashSet<String> = HashSet::new();
    for t in targets {
      *self.contributions.entry(t.to_string()).or_default() += 1;
      live.insert(t.to_string());
    }
    let mut edges = vec![];
    for (index, op) in self.block.ops.iter().enumerate().rev() {
      let Some(out) = op.single_output("Out") else {
        continue;
      };
      if !live.contains(out) {
        continue;
      }
      let slots = differentiable_slots(&op.op_type)
        .ok_or_else(|| Error::Autodiff(format!("no gradient rule for {}", op.op_type)))?;
      for slot in slots {
        for name in op.input_names(slot) {
          if self.trainable.contains(name) {
            *self.contributions.entry(name.clone()).or_default() += 1;
            live.insert(name.clone());
            edges.push((index, *slot, name.clone()));
          }
        }
      }
    }
    Ok(edges)
  }
}

struct Emitter {
  contributions: HashMap<String, usize>,
  emitted: HashMap<String, usize>,
  ops: Vec<Operator>,
  grad_vars: Vec<Variable>,
}

impl Emitter {
  /// Name the next contribution to `var`'s gradient is written to.
  fn target_name(&mut self, var: &str) -> String {
    let total = self.contributions.get(var).copied().unwrap_or(1);
    let k = self.emitted.entry(var.to_string()).or_default();
    *k += 1;
    if total > 1 {
      rename(var, *k - 1)
    } else {
      grad_var_name(var)
    }
  }

  /// Merges renamed contributions once the last one was written.
  fn finish(&mut self, var: &str) {
    let total = self.contributions.get(var).copied().unwrap_or(1);
    if total > 1 && self.emitted.get(var) == Some(&total) {
      let parts: Vec<String> = (0..total).map(|k| rename(var, k)).collect();
      self.ops.push(
        Operator::new("sum")
          .input("X", parts)
          .output("Out", [grad_var_name(var)])
          .attr(OP_ROLE, "backward"),
      );
    }
  }
}

fn declare_grad(block: &Block, name: &str, kind: VarKind) -> Variable {
  let shape = block.var(name).map(|v| v.shape.clone()).unwrap_or_default();
  Variable::new(grad_var_name(name), shape).with_kind(kind)
}

impl Autodiff for ReferenceAutodiff {
  #[instrument(level = "debug", skip_all, fields(targets = targets.len()))]
  fn compute_backward(&self, mut program: Program, targets: &[Variable]) -> Result<Program> {
    let block = program.global_block();
    let trainable = trainable_vars(block);
    let target_names: Vec<&str> = targets
      .iter()
      .map(|t| t.name.as_str())
      .filter(|n| trainable.contains(*n))
      .unique()
      .collect();

    let mut planner = Planner {
      block,
      trainable,
      contributions: HashMap::new(),
    };
    let edges = planner.plan(&target_names)?;
    let mut emitter = Emitter {
      contributions: planner.contributions,
      emitted: HashMap::new(),
      ops: vec![],
      grad_vars: vec![],
    };

    for t in &target_names {
      let out = emitter.target_name(t);
      let var = block.var(t).cloned().unwrap_or_else(|| Variable::new(*t, vec![1]));
      emitter.ops.push(
        Operator::new("fill_constant")
          .input("Like", [*t])
          .output("Out", [out])
          .attr("shape", var.shape.clone())
          .attr("value", 1.0)
          .attr(OP_ROLE, "backward"),
      );
      emitter.grad_vars.push(declare_grad(block, t, VarKind::DenseTensor));
      emitter.finish(t);
    }

    // edges of one operator are adjacent; emit one grad op per operator
    let mut i = 0;
    while i < edges.len() {
      let index = edges[i].0;
      let fwd = &block.ops[index];
      let mut grad = Operator {
        op_type: format!("{}_grad", fwd.op_type),
        inputs: fwd.inputs.clone(),
        outputs: Default::default(),
        attrs: fwd.attrs.clone(),
      };
      for (slot, names) in &fwd.outputs {
        grad.inputs.insert(slot.clone(), names.clone());
        grad
          .inputs
          .insert(grad_var_name(slot), names.iter().map(|n| grad_var_name(n)).collect());
      }
      grad.set_attr(OP_ROLE, "backward");

      let mut finished = vec![];
      while i < edges.len() && edges[i].0 == index {
        let (_, slot, name) = &edges[i];
        let out = emitter.target_name(name);
        grad.outputs.entry(grad_var_name(slot)).or_default().push(out);
        let sparse = fwd.get_attr(IS_SPARSE).and_then(Attr::as_bool).unwrap_or(false);
        let kind = if fwd.op_type == "lookup_table" && sparse {
          VarKind::SelectedRows
        } else {
          VarKind::DenseTensor
        };
        emitter.grad_vars.push(declare_grad(block, name, kind));
        if !finished.contains(name) {
          finished.push(name.clone());
        }
        i += 1;
      }
      emitter.ops.push(grad);
      for name in finished {
        emitter.finish(&name);
      }
    }

    debug!(ops = emitter.ops.len(), "appending backward ops");
    let Emitter { ops, grad_vars, .. } = emitter;
    let block = program.global_block_mut();
    for var in grad_vars {
      block.add_var(var);
    }
    for op in ops {
      block.append_op(op);
    }
    Ok(program)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::program::IS_TEST;

  fn mul_program() -> Program {
    let mut p = Program::new();
    let b = p.global_block_mut();
    b.add_var(Variable::new("x", vec![1]).stop_gradient());
    b.add_var(Variable::new("w", vec![1]).persistable());
    b.add_var(Variable::new("y", vec![1]));
    b.append_op(Operator::new("elementwise_mul").input("X", ["x"]).input("Y", ["w"]).output("Out", ["y"]));
    p
  }

  fn op_types(p: &Program) -> Vec<&str> {
    p.global_block().ops.iter().map(|o| o.op_type.as_str()).collect()
  }

  #[test]
  fn test_mul_backward_skips_stop_gradient_input() {
    let p = ReferenceAutodiff
      .compute_backward(mul_program(), &[Variable::new("y", vec![1])])
      .unwrap();
    assert_eq!(op_types(&p), vec!["elementwise_mul", "fill_constant", "elementwise_mul_grad"]);
    let grad = &p.global_block().ops[2];
    assert_eq!(grad.output_names("Y@GRAD"), &["w@GRAD".to_string()]);
    assert!(grad.output_names("X@GRAD").is_empty());
    assert_eq!(grad.input_names("Out@GRAD"), &["y@GRAD".to_string()]);
    assert_eq!(grad.get_attr(OP_ROLE), Some(&Attr::Str("backward".to_string())));
    assert!(p.global_block().has_var("w@GRAD"));
    assert!(!p.global_block().has_var("x@GRAD"));
  }

  #[test]
  fn test_shared_input_sums_renamed_contributions() {
    let mut p = Program::new();
    let b = p.global_block_mut();
    b.add_var(Variable::new("w", vec![1]).persistable());
    b.append_op(Operator::new("relu").input("X", ["w"]).output("Out", ["a"]));
    b.append_op(Operator::new("scale").input("X", ["w"]).output("Out", ["c"]).attr("scale", 3.0));
    b.append_op(Operator::new("elementwise_add").input("X", ["a"]).input("Y", ["c"]).output("Out", ["y"]));
    let p = ReferenceAutodiff.compute_backward(p, &[Variable::new("y", vec![1])]).unwrap();
    assert_eq!(
      op_types(&p),
      vec![
        "relu",
        "scale",
        "elementwise_add",
        "fill_constant",
        "elementwise_add_grad",
        "scale_grad",
        "relu_grad",
        "sum"
      ]
    );
    let sum = p.global_block().ops.last().unwrap();
    assert_eq!(sum.input_names("X"), &["w@GRAD@RENAME@0".to_string(), "w@GRAD@RENAME@1".to_string()]);
    assert_eq!(sum.single_output("Out"), Some("w@GRAD"));
  }

  #[test]
  fn test_sparse_lookup_declares_selected_rows() {
    let mut p = Program::new();
    let b = p.global_block_mut();
    b.add_var(Variable::new("emb", vec![4, 2]).persistable());
    b.add_var(Variable::new("ids", vec![-1]).stop_gradient());
    b.append_op(
      Operator::new("lookup_table")
        .input("W", ["emb"])
        .input("Ids", ["ids"])
        .output("Out", ["e"])
        .attr(IS_SPARSE, true),
    );
    b.append_op(Operator::new("mean").input("X", ["e"]).output("Out", ["loss"]));
    let p = ReferenceAutodiff.compute_backward(p, &[Variable::new("loss", vec![1])]).unwrap();
    assert_eq!(p.global_block().var("emb@GRAD").unwrap().kind, VarKind::SelectedRows);
    assert!(!p.global_block().has_var("ids@GRAD"));
  }

  #[test]
  fn test_repeated_target_gets_one_seed() {
    let y = Variable::new("y", vec![1]);
    let p = ReferenceAutodiff.compute_backward(mul_program(), &[y.clone(), y]).unwrap();
    assert_eq!(op_types(&p), vec!["elementwise_mul", "fill_constant", "elementwise_mul_grad"]);
    assert_eq!(p.global_block().ops[1].output_names("Out"), &["y@GRAD".to_string()]);
  }

  #[test]
  fn test_grad_ops_copy_forward_attrs() {
    let mut p = Program::new();
    let b = p.global_block_mut();
    b.add_var(Variable::new("w", vec![2]).persistable());
    b.append_op(
      Operator::new("dropout")
        .input("X", ["w"])
        .output("Out", ["y"])
        .output("Mask", ["m"])
        .attr(IS_TEST, false)
        .attr("dropout_prob", 0.25),
    );
    let p = ReferenceAutodiff.compute_backward(p, &[Variable::new("y", vec![2])]).unwrap();
    let grad = &p.global_block().ops[2];
    assert_eq!(grad.op_type, "dropout_grad");
    assert_eq!(grad.get_attr("dropout_prob"), Some(&Attr::Float(0.25)));
    assert_eq!(grad.input_names("Mask"), &["m".to_string()]);
  }

  #[test]
  fn test_unsupported_operator_on_gradient_path() {
    let mut p = Program::new();
    let b = p.global_block_mut();
    b.add_var(Variable::new("w", vec![1]).persistable());
    b.append_op(Operator::new("softmax").input("X", ["w"]).output("Out", ["y"]));
    let err = ReferenceAutodiff.compute_backward(p, &[Variable::new("y", vec![1])]);
    assert!(matches!(err, Err(Error::Autodiff(_))));
  }
}
