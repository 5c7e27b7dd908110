//! Running a traced program as one callable unit.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::{
  collaborators::{Collaborators, ExecuteArgs},
  config::Config,
  nest::{value_type_name, FlatTemplate, Leaf, Nested, Slot},
  program::Program,
  prune::{check_params_declared, prune_unused},
  returned::{unwrap_single, OutputLeaf, Returned},
  scope::{Scope, ScopeManager},
  tensor::{ArrayData, Parameter, Place, RuntimeTensor},
  variants::GraphVariants,
  Error, Result,
};

/// Name of the stand-in tensor passed when a tensor list would be empty.
pub const FAKE_VAR_NAME: &str = "Fake_var";

/// One leaf of the arguments of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputLeaf {
  Array(ArrayData),
  /// Moved into the call. Its gradient stays in the call's scope and is not
  /// written back to the caller, unlike a [`Parameter`]'s.
  Tensor(RuntimeTensor),
  /// Not forwarded to the program.
  Value(serde_json::Value),
}

impl Leaf for InputLeaf {
  fn is_tensor(&self) -> bool {
    !matches!(self, InputLeaf::Value(_))
  }

  fn type_name(&self) -> &'static str {
    match self {
      InputLeaf::Array(_) => "array",
      InputLeaf::Tensor(_) => "tensor",
      InputLeaf::Value(v) => value_type_name(v),
    }
  }
}

/// What a tracer hands over after capturing one call.
#[derive(Debug, Clone)]
pub struct ConcreteProgram {
  pub main_program: Program,
  pub inputs: Nested<Slot>,
  pub outputs: Nested<Slot>,
  pub parameters: Vec<Parameter>,
}

/// `concrete.inputs` must hold only the traced arguments; a tracer that
/// captured a method receiver has to drop it before calling this.
pub fn partial_program_from(
  concrete: ConcreteProgram,
  collaborators: Collaborators,
  config: &Config,
) -> Result<PartialProgram> {
  PartialProgram::new(
    concrete.main_program,
    concrete.inputs,
    concrete.outputs,
    concrete.parameters,
    collaborators,
    config,
  )
}

/// Executes all ops of a traced program as a static graph, on every call,
/// without tracing again.
///
/// The train and infer programs are derived from the base program on first
/// use and reused afterwards. Switching modes never rebuilds either.
pub struct PartialProgram {
  inputs: FlatTemplate,
  outputs: FlatTemplate,
  variants: GraphVariants,
  scopes: ScopeManager,
  training: bool,
  collaborators: Collaborators,
}

impl std::fmt::Debug for PartialProgram {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PartialProgram")
      .field("inputs", &self.inputs)
      .field("outputs", &self.outputs)
      .field("variants", &self.variants)
      .field("training", &self.training)
      .finish()
  }
}

impl PartialProgram {
  /// Validates the parameter list against `program` and prunes parameters
  /// no operator touches. Nothing is built until the first call.
  #[instrument(level = "debug", skip_all)]
  pub fn new(
    program: Program,
    inputs: Nested<Slot>,
    outputs: Nested<Slot>,
    params: Vec<Parameter>,
    collaborators: Collaborators,
    config: &Config,
  ) -> Result<Self> {
    if program.blocks.is_empty() {
      return Err(Error::EmptyProgram);
    }
    let inputs = FlatTemplate::new(inputs, false);
    let outputs = FlatTemplate::new(outputs, config.check_outputs);

    check_params_declared(&params, &program)?;
    let params = prune_unused(params, &program);

    let variants = GraphVariants::new(program, outputs.vars(), params, config.strip_op_callstack);
    info!(
      inputs = inputs.tensor_positions().len(),
      outputs = outputs.tensor_positions().len(),
      params = variants.parameters().len(),
      double_grads = variants.double_grads().len(),
      "created partial program"
    );
    Ok(PartialProgram {
      inputs,
      outputs,
      variants,
      scopes: ScopeManager::new(config.keep_scope),
      training: config.training,
      collaborators,
    })
  }

  pub fn training(&self) -> bool {
    self.training
  }

  pub fn set_training(&mut self, training: bool) {
    self.training = training;
  }

  pub fn train(&mut self) {
    self.set_training(true);
  }

  pub fn eval(&mut self) {
    self.set_training(false);
  }

  /// Program for the current mode, building it on first use.
  pub fn program(&self) -> Result<&Program> {
    self.variants.select(self.training, self.collaborators.autodiff.as_ref())
  }

  pub fn train_program(&self) -> Result<&Program> {
    self.variants.train(self.collaborators.autodiff.as_ref())
  }

  pub fn infer_program(&self) -> &Program {
    self.variants.infer()
  }

  pub fn base_program(&self) -> &Program {
    self.variants.base()
  }

  /// Parameters left after pruning.
  pub fn parameters(&self) -> &[Parameter] {
    self.variants.parameters()
  }

  pub fn double_grads(&self) -> &[RuntimeTensor] {
    self.variants.double_grads()
  }

  pub fn variant_builds(&self) -> usize {
    self.variants.builds()
  }

  pub fn last_scope(&self) -> Option<Arc<Scope>> {
    self.scopes.last()
  }

  #[instrument(level = "debug", skip_all, fields(training = self.training))]
  pub fn forward(&self, inputs: Nested<InputLeaf>) -> Result<Returned> {
    let place = self.collaborators.placement.current_place();
    let in_vars = self.prepare_inputs(inputs, place)?;
    let mut out_vars = self.output_placeholders();
    let mut double_grads = self.variants.double_grads().to_vec();

    let program = self.program()?;
    let end = self.variants.infer().op_size();
    let scope = self.scopes.acquire();

    let in_vars = valid_tensors(in_vars, place);
    let params = if self.parameters().is_empty() {
      vec![Parameter::new(fake_tensor(place))]
    } else {
      self.parameters().to_vec()
    };
    let mut fake_out = vec![fake_tensor(place)];
    let outputs: &mut [RuntimeTensor] = if out_vars.is_empty() { &mut fake_out } else { &mut out_vars };

    debug!(inputs = in_vars.len(), end, "executing");
    self.collaborators.interpreter.execute(ExecuteArgs {
      inputs: &in_vars,
      params: &params,
      outputs,
      aux_outputs: &mut double_grads,
      program,
      op_range: 0..end,
      is_test: !self.training,
      scope: &scope,
    })?;
    self.scopes.release(scope);

    let restored = self.restore_outputs(out_vars)?;
    Ok(Returned::from_nested(restored).strip_no_value())
  }

  /// Binds each tensor-like input leaf to the name of the traced input at the
  /// same flattened position. Non-tensor leaves are dropped.
  fn prepare_inputs(&self, inputs: Nested<InputLeaf>, place: Place) -> Result<Vec<RuntimeTensor>> {
    let mut prepared = vec![];
    for (index, leaf) in inputs.into_flat().into_iter().enumerate() {
      if let InputLeaf::Value(_) = leaf {
        continue;
      }
      let name = match self.inputs.get(index).and_then(Slot::as_var) {
        Some(var) => var.name.clone(),
        None => return Err(Error::InputTemplateMismatch { index }),
      };
      let tensor = match leaf {
        InputLeaf::Array(array) => RuntimeTensor::from_array(array, name, place),
        // detached copy on the execution place
        InputLeaf::Tensor(t) if t.stop_gradient => t.to_place(place).renamed(name),
        InputLeaf::Tensor(t) => t.renamed(name),
        InputLeaf::Value(_) => continue,
      };
      prepared.push(tensor);
    }
    Ok(prepared)
  }

  fn output_placeholders(&self) -> Vec<RuntimeTensor> {
    self.outputs.vars().map(RuntimeTensor::placeholder).collect()
  }

  /// Puts executed tensors back at their traced positions; opaque values
  /// keep what was seen while tracing.
  fn restore_outputs(&self, out_vars: Vec<RuntimeTensor>) -> Result<Nested<OutputLeaf>> {
    let mut out_vars = out_vars.into_iter();
    let mut flat = Vec::with_capacity(self.outputs.flat().len());
    for slot in self.outputs.flat() {
      let leaf = match slot {
        Slot::Var(var) => match out_vars.next() {
          Some(t) => OutputLeaf::Tensor(t),
          None => return Err(Error::MissingValue { name: var.name.clone() }),
        },
        Slot::Value(v) => OutputLeaf::Value(v.clone()),
      };
      flat.push(leaf);
    }
    Ok(unwrap_single(self.outputs.restore(flat)?))
  }
}

fn fake_tensor(place: Place) -> RuntimeTensor {
  RuntimeTensor {
    place,
    ..RuntimeTensor::new(FAKE_VAR_NAME, vec![1], vec![1.0])
  }
}

fn valid_tensors(tensors: Vec<RuntimeTensor>, place: Place) -> Vec<RuntimeTensor> {
  if tensors.is_empty() {
    vec![fake_tensor(place)]
  } else {
    tensors
  }
}
