//! Train and infer programs derived from one immutable base program.

use itertools::Itertools;
use tracing::{debug, info, instrument};

use crate::{
  collaborators::Autodiff,
  lazy::Lazy,
  program::{grad_var_name, set_is_test, strip_debug_attributes, Program, Variable, GRAD_SUFFIX},
  tensor::{Parameter, RuntimeTensor},
  Result,
};

#[derive(Debug)]
pub struct GraphVariants {
  base: Program,
  /// Traced outputs declared in the base global block; backward targets.
  targets: Vec<Variable>,
  params: Vec<Parameter>,
  strip_callstack: bool,
  infer: Lazy<Program>,
  train: Lazy<Program>,
  double_grads: Vec<RuntimeTensor>,
}

impl GraphVariants {
  /// `params` must already be pruned against `base`.
  pub fn new<'a>(
    base: Program,
    outputs: impl IntoIterator<Item = &'a Variable>,
    params: Vec<Parameter>,
    strip_callstack: bool,
  ) -> Self {
    // a variable returned twice still gets a single gradient seed
    let targets = outputs
      .into_iter()
      .unique_by(|out| out.name.clone())
      .filter_map(|out| base.global_block().var(&out.name).cloned())
      .collect();
    let double_grads = collect_double_grads(&base);
    GraphVariants {
      base,
      targets,
      params,
      strip_callstack,
      infer: Lazy::new(),
      train: Lazy::new(),
      double_grads,
    }
  }

  pub fn base(&self) -> &Program {
    &self.base
  }

  pub fn parameters(&self) -> &[Parameter] {
    &self.params
  }

  pub fn targets(&self) -> &[Variable] {
    &self.targets
  }

  /// Empty placeholders for every gradient-named variable of the base program.
  pub fn double_grads(&self) -> &[RuntimeTensor] {
    &self.double_grads
  }

  pub fn infer(&self) -> &Program {
    self.infer.get_or_init(|| self.build_infer())
  }

  pub fn train(&self, autodiff: &dyn Autodiff) -> Result<&Program> {
    self.train.get_or_try_init(|| self.build_train(autodiff))
  }

  /// Picks the variant for the current mode. Cheap once both are built.
  pub fn select(&self, training: bool, autodiff: &dyn Autodiff) -> Result<&Program> {
    if training {
      self.train(autodiff)
    } else {
      Ok(self.infer())
    }
  }

  pub fn is_built(&self) -> (bool, bool) {
    (self.train.is_initialized(), self.infer.is_initialized())
  }

  /// Total variant builds so far; at most two for the lifetime of `self`.
  pub fn builds(&self) -> usize {
    self.train.builds() + self.infer.builds()
  }

  fn prepare(&self, is_test: bool) -> Program {
    let program = set_is_test(self.base.clone(), is_test);
    if self.strip_callstack {
      strip_debug_attributes(program)
    } else {
      program
    }
  }

  #[instrument(level = "debug", skip(self))]
  fn build_infer(&self) -> Program {
    let program = self.prepare(true);
    info!(ops = program.op_size(), "built infer program");
    program
  }

  #[instrument(level = "debug", skip_all)]
  fn build_train(&self, autodiff: &dyn Autodiff) -> Result<Program> {
    let mut program = self.prepare(false);
    if !self.targets.is_empty() && !self.params.is_empty() {
      program = autodiff.compute_backward(program, &self.targets)?;
    } else {
      debug!(
        targets = self.targets.len(),
        params = self.params.len(),
        "skipping backward construction"
      );
    }
    // only done once, right after the backward part exists
    set_grad_kinds(&self.params, &program);
    info!(
      ops = program.op_size(),
      forward_ops = self.base.op_size(),
      "built train program"
    );
    Ok(program)
  }
}

/// Copies the storage kind of each parameter's gradient variable onto the
/// parameter, so a sparse gradient is not forced back to dense storage.
pub fn set_grad_kinds(params: &[Parameter], program: &Program) {
  for param in params {
    let name = param.name();
    match program.global_block().var(&grad_var_name(&name)) {
      Some(grad) => param.set_grad_kind(grad.kind),
      // e.g. parameters outside every gradient path
      None => debug!(param = %name, "no gradient variable"),
    }
  }
}

fn collect_double_grads(program: &Program) -> Vec<RuntimeTensor> {
  program
    .vars()
    .filter(|v| v.name.contains(GRAD_SUFFIX))
    .map(RuntimeTensor::placeholder)
    .collect()
}
