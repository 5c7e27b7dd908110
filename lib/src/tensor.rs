use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::program::Variable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
  Bool,
  Int32,
  Int64,
  #[default]
  Fp32,
  Fp64,
}

/// Storage kind of a variable or of a gradient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarKind {
  #[default]
  DenseTensor,
  /// Row-sparse storage, produced by sparse embedding gradients.
  SelectedRows,
  StepScopes,
  TensorArray,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Place {
  #[default]
  Cpu,
  Gpu(u32),
}

/// Raw numeric data handed in by the caller, not yet bound to any variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayData {
  #[serde(default)]
  pub dtype: DType,
  pub shape: Vec<i64>,
  pub data: Vec<f64>,
}

impl ArrayData {
  pub fn new(shape: Vec<i64>, data: Vec<f64>) -> Self {
    ArrayData {
      dtype: DType::Fp32,
      shape,
      data,
    }
  }

  pub fn scalar(value: f64) -> Self {
    Self::new(vec![1], vec![value])
  }
}

/// A live value bound to a variable name for one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeTensor {
  pub name: String,
  #[serde(default)]
  pub dtype: DType,
  #[serde(default)]
  pub shape: Vec<i64>,
  #[serde(default)]
  pub kind: VarKind,
  #[serde(default)]
  pub place: Place,
  #[serde(default)]
  pub persistable: bool,
  #[serde(default)]
  pub stop_gradient: bool,
  /// Empty until something writes into the tensor.
  #[serde(default)]
  pub data: Vec<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub grad: Option<Vec<f64>>,
  #[serde(default)]
  pub grad_kind: VarKind,
}

impl RuntimeTensor {
  pub fn new(name: impl Into<String>, shape: Vec<i64>, data: Vec<f64>) -> Self {
    RuntimeTensor {
      name: name.into(),
      dtype: DType::Fp32,
      shape,
      kind: VarKind::DenseTensor,
      place: Place::Cpu,
      persistable: false,
      stop_gradient: true,
      data,
      grad: None,
      grad_kind: VarKind::DenseTensor,
    }
  }

  /// Uninitialized tensor shaped after a descriptor, ready to receive a result.
  pub fn placeholder(var: &Variable) -> Self {
    RuntimeTensor {
      dtype: var.dtype,
      kind: var.kind,
      persistable: false,
      stop_gradient: false,
      ..Self::new(var.name.clone(), var.shape.clone(), Vec::new())
    }
  }

  /// Takes ownership of the array buffer, so no element is copied.
  pub fn from_array(array: ArrayData, name: impl Into<String>, place: Place) -> Self {
    RuntimeTensor {
      dtype: array.dtype,
      place,
      ..Self::new(name, array.shape, array.data)
    }
  }

  /// Copy of this tensor living on `place`, detached from gradient tracking.
  pub fn to_place(&self, place: Place) -> Self {
    RuntimeTensor {
      place,
      stop_gradient: true,
      grad: None,
      ..self.clone()
    }
  }

  pub fn renamed(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn requires_grad(&self) -> bool {
    !self.stop_gradient
  }

  pub fn is_initialized(&self) -> bool {
    !self.data.is_empty()
  }

  pub fn numel(&self) -> usize {
    self.data.len()
  }
}

/// A persistable tensor shared between the caller and every call of the program.
///
/// Cloning shares the underlying tensor: gradients written by an execution and
/// the gradient storage kind set while building the train program are visible
/// through every handle.
#[derive(Debug, Clone)]
pub struct Parameter(Arc<RwLock<RuntimeTensor>>);

impl Parameter {
  pub fn new(tensor: RuntimeTensor) -> Self {
    Parameter(Arc::new(RwLock::new(tensor)))
  }

  /// A trainable fp32 parameter.
  pub fn trainable(name: impl Into<String>, shape: Vec<i64>, data: Vec<f64>) -> Self {
    Self::new(RuntimeTensor {
      persistable: true,
      stop_gradient: false,
      ..RuntimeTensor::new(name, shape, data)
    })
  }

  pub fn read(&self) -> RwLockReadGuard<'_, RuntimeTensor> {
    self.0.read().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn write(&self) -> RwLockWriteGuard<'_, RuntimeTensor> {
    self.0.write().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn name(&self) -> String {
    self.read().name.clone()
  }

  pub fn grad(&self) -> Option<Vec<f64>> {
    self.read().grad.clone()
  }

  pub fn grad_kind(&self) -> VarKind {
    self.read().grad_kind
  }

  pub fn set_grad_kind(&self, kind: VarKind) {
    self.write().grad_kind = kind;
  }

  pub fn clear_grad(&self) {
    self.write().grad = None;
  }

  pub fn ptr_eq(&self, other: &Parameter) -> bool {
    Arc::ptr_eq(&self.0, &other.0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_from_array_moves_buffer() {
    let array = ArrayData::new(vec![3], vec![1.0, 2.0, 3.0]);
    let ptr = array.data.as_ptr();
    let t = RuntimeTensor::from_array(array, "x", Place::Gpu(0));
    assert_eq!(t.data.as_ptr(), ptr);
    assert_eq!(t.place, Place::Gpu(0));
    assert!(t.stop_gradient);
  }

  #[test]
  fn test_to_place_detaches() {
    let mut t = RuntimeTensor::new("a", vec![1], vec![2.0]);
    t.stop_gradient = false;
    t.grad = Some(vec![1.0]);
    let moved = t.to_place(Place::Gpu(1));
    assert_eq!(moved.place, Place::Gpu(1));
    assert!(moved.stop_gradient);
    assert_eq!(moved.grad, None);
    assert_eq!(moved.data, t.data);
  }

  #[test]
  fn test_parameter_handles_share_state() {
    let w = Parameter::trainable("w", vec![1], vec![3.0]);
    let alias = w.clone();
    alias.set_grad_kind(VarKind::SelectedRows);
    alias.write().grad = Some(vec![2.0]);
    assert_eq!(w.grad_kind(), VarKind::SelectedRows);
    assert_eq!(w.grad(), Some(vec![2.0]));
    assert!(w.ptr_eq(&alias));
    w.clear_grad();
    assert_eq!(alias.grad(), None);
  }
}
