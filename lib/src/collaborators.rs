//! Services the bridge consumes but does not implement: backward synthesis,
//! program execution and tensor placement. See `reference` for in-crate
//! implementations.

use std::{ops::Range, sync::Arc};

use crate::{
  program::{Program, Variable},
  reference::{ReferenceAutodiff, ReferenceInterpreter},
  scope::Scope,
  tensor::{Parameter, Place, RuntimeTensor},
  Result,
};

pub trait Autodiff: Send + Sync {
  /// Appends the operators computing gradients of `targets` to `program`.
  /// With no targets the program comes back unchanged.
  fn compute_backward(&self, program: Program, targets: &[Variable]) -> Result<Program>;
}

/// Everything one execution needs. `inputs` and `outputs` are never empty.
pub struct ExecuteArgs<'a> {
  pub inputs: &'a [RuntimeTensor],
  pub params: &'a [Parameter],
  pub outputs: &'a mut [RuntimeTensor],
  pub aux_outputs: &'a mut [RuntimeTensor],
  pub program: &'a Program,
  /// Forward operators of the global block.
  pub op_range: Range<usize>,
  pub is_test: bool,
  pub scope: &'a Scope,
}

pub trait Interpreter: Send + Sync {
  /// Runs the program, filling `outputs` and whatever `aux_outputs` it produced.
  fn execute(&self, args: ExecuteArgs<'_>) -> Result<()>;
}

pub trait PlacementAuthority: Send + Sync {
  fn current_place(&self) -> Place;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPlacement(pub Place);

impl PlacementAuthority for DefaultPlacement {
  fn current_place(&self) -> Place {
    self.0
  }
}

#[derive(Clone)]
pub struct Collaborators {
  pub interpreter: Arc<dyn Interpreter>,
  pub autodiff: Arc<dyn Autodiff>,
  pub placement: Arc<dyn PlacementAuthority>,
}

impl Collaborators {
  /// The in-crate interpreter and autodiff, placing tensors on the CPU.
  pub fn reference() -> Self {
    Collaborators {
      interpreter: Arc::new(ReferenceInterpreter),
      autodiff: Arc::new(ReferenceAutodiff),
      placement: Arc::new(DefaultPlacement(Place::Cpu)),
    }
  }
}
