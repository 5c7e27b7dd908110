//! Static program description: blocks of operators over named variables.
//!
//! A `Program` is plain data. Cloning it yields an independent copy, which is
//! how every derived variant is produced from the base program.

pub mod graph;
pub mod transform;

use std::collections::{btree_map::Entry, BTreeMap};

use serde::{Deserialize, Serialize};

pub use graph::*;
pub use transform::*;

use crate::tensor::{DType, VarKind};

pub const GRAD_SUFFIX: &str = "@GRAD";

pub fn grad_var_name(name: &str) -> String {
  format!("{}{}", name, GRAD_SUFFIX)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Attr {
  Bool(bool),
  Int(i64),
  Float(f64),
  Str(String),
  Ints(Vec<i64>),
  Floats(Vec<f64>),
  Strs(Vec<String>),
}

impl Attr {
  pub fn as_bool(&self) -> Option<bool> {
    match self {
      Attr::Bool(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_f64(&self) -> Option<f64> {
    match self {
      Attr::Int(i) => Some(*i as f64),
      Attr::Float(f) => Some(*f),
      _ => None,
    }
  }

  pub fn as_ints(&self) -> Option<&[i64]> {
    match self {
      Attr::Ints(v) => Some(v),
      _ => None,
    }
  }
}

impl From<bool> for Attr {
  fn from(b: bool) -> Self {
    Attr::Bool(b)
  }
}

impl From<i64> for Attr {
  fn from(i: i64) -> Self {
    Attr::Int(i)
  }
}

impl From<f64> for Attr {
  fn from(f: f64) -> Self {
    Attr::Float(f)
  }
}

impl From<&str> for Attr {
  fn from(s: &str) -> Self {
    Attr::Str(s.to_string())
  }
}

impl From<Vec<i64>> for Attr {
  fn from(v: Vec<i64>) -> Self {
    Attr::Ints(v)
  }
}

impl From<Vec<String>> for Attr {
  fn from(v: Vec<String>) -> Self {
    Attr::Strs(v)
  }
}

/// Symbolic descriptor of a graph slot. Carries no data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
  pub name: String,
  #[serde(default)]
  pub dtype: DType,
  /// `-1` marks a dimension only known at run time.
  #[serde(default)]
  pub shape: Vec<i64>,
  #[serde(default)]
  pub kind: VarKind,
  /// Parameters and buffers are persistable, transient values are not.
  #[serde(default)]
  pub persistable: bool,
  #[serde(default)]
  pub stop_gradient: bool,
}

impl Variable {
  pub fn new(name: impl Into<String>, shape: Vec<i64>) -> Self {
    Variable {
      name: name.into(),
      dtype: DType::Fp32,
      shape,
      kind: VarKind::DenseTensor,
      persistable: false,
      stop_gradient: false,
    }
  }

  pub fn persistable(mut self) -> Self {
    self.persistable = true;
    self
  }

  pub fn stop_gradient(mut self) -> Self {
    self.stop_gradient = true;
    self
  }

  pub fn with_kind(mut self, kind: VarKind) -> Self {
    self.kind = kind;
    self
  }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Operator {
  #[serde(rename = "type")]
  pub op_type: String,
  /// slot name -> argument names
  #[serde(default)]
  pub inputs: BTreeMap<String, Vec<String>>,
  #[serde(default)]
  pub outputs: BTreeMap<String, Vec<String>>,
  #[serde(default)]
  pub attrs: BTreeMap<String, Attr>,
}

impl Operator {
  pub fn new(op_type: impl Into<String>) -> Self {
    Operator {
      op_type: op_type.into(),
      ..Default::default()
    }
  }

  pub fn input<S: Into<String>>(mut self, slot: &str, names: impl IntoIterator<Item = S>) -> Self {
    self.inputs.insert(slot.to_string(), names.into_iter().map(Into::into).collect());
    self
  }

  pub fn output<S: Into<String>>(mut self, slot: &str, names: impl IntoIterator<Item = S>) -> Self {
    self.outputs.insert(slot.to_string(), names.into_iter().map(Into::into).collect());
    self
  }

  pub fn attr(mut self, key: &str, value: impl Into<Attr>) -> Self {
    self.attrs.insert(key.to_string(), value.into());
    self
  }

  pub fn input_arg_names(&self) -> impl Iterator<Item = &str> {
    self.inputs.values().flatten().map(String::as_str)
  }

  pub fn output_arg_names(&self) -> impl Iterator<Item = &str> {
    self.outputs.values().flatten().map(String::as_str)
  }

  /// Whether `name` is read or written by this operator.
  pub fn references(&self, name: &str) -> bool {
    self.input_arg_names().chain(self.output_arg_names()).any(|n| n == name)
  }

  pub fn input_names(&self, slot: &str) -> &[String] {
    self.inputs.get(slot).map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn output_names(&self, slot: &str) -> &[String] {
    self.outputs.get(slot).map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn single_input(&self, slot: &str) -> Option<&str> {
    self.input_names(slot).first().map(String::as_str)
  }

  pub fn single_output(&self, slot: &str) -> Option<&str> {
    self.output_names(slot).first().map(String::as_str)
  }

  pub fn has_attr(&self, key: &str) -> bool {
    self.attrs.contains_key(key)
  }

  pub fn get_attr(&self, key: &str) -> Option<&Attr> {
    self.attrs.get(key)
  }

  pub fn set_attr(&mut self, key: &str, value: impl Into<Attr>) {
    self.attrs.insert(key.to_string(), value.into());
  }

  pub fn remove_attr(&mut self, key: &str) -> Option<Attr> {
    self.attrs.remove(key)
  }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Block {
  #[serde(default)]
  pub idx: usize,
  #[serde(default)]
  pub vars: BTreeMap<String, Variable>,
  #[serde(default)]
  pub ops: Vec<Operator>,
}

impl Block {
  pub fn new(idx: usize) -> Self {
    Block {
      idx,
      ..Default::default()
    }
  }

  pub fn var(&self, name: &str) -> Option<&Variable> {
    self.vars.get(name)
  }

  pub fn has_var(&self, name: &str) -> bool {
    self.vars.contains_key(name)
  }

  /// Declares `var`, replacing any descriptor of the same name.
  pub fn add_var(&mut self, var: Variable) -> &mut Variable {
    match self.vars.entry(var.name.clone()) {
      Entry::Occupied(mut e) => {
        e.insert(var);
        e.into_mut()
      }
      Entry::Vacant(e) => e.insert(var),
    }
  }

  pub fn append_op(&mut self, op: Operator) {
    self.ops.push(op);
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
  pub blocks: Vec<Block>,
}

impl Default for Program {
  fn default() -> Self {
    Self::new()
  }
}

impl Program {
  pub fn new() -> Self {
    Program {
      blocks: vec![Block::new(0)],
    }
  }

  pub fn global_block(&self) -> &Block {
    &self.blocks[0]
  }

  pub fn global_block_mut(&mut self) -> &mut Block {
    &mut self.blocks[0]
  }

  pub fn ops(&self) -> impl Iterator<Item = &Operator> {
    self.blocks.iter().flat_map(|b| b.ops.iter())
  }

  pub fn ops_mut(&mut self) -> impl Iterator<Item = &mut Operator> {
    self.blocks.iter_mut().flat_map(|b| b.ops.iter_mut())
  }

  pub fn vars(&self) -> impl Iterator<Item = &Variable> {
    self.blocks.iter().flat_map(|b| b.vars.values())
  }

  /// Number of operators in the global block.
  pub fn op_size(&self) -> usize {
    self.global_block().ops.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_operator_arg_names() {
    let op = Operator::new("elementwise_mul")
      .input("X", ["x"])
      .input("Y", ["w"])
      .output("Out", ["y"]);
    assert_eq!(op.input_arg_names().collect::<Vec<_>>(), vec!["x", "w"]);
    assert!(op.references("y"));
    assert!(!op.references("b"));
    assert_eq!(op.single_input("Y"), Some("w"));
    assert_eq!(op.single_output("Missing"), None);
  }

  #[test]
  fn test_attr_deserializes_untagged() {
    let attrs: BTreeMap<String, Attr> =
      serde_json::from_str(r#"{"is_test": false, "seed": 3, "scale": 0.5, "shape": [1, 2]}"#).unwrap();
    assert_eq!(attrs["is_test"], Attr::Bool(false));
    assert_eq!(attrs["seed"], Attr::Int(3));
    assert_eq!(attrs["scale"].as_f64(), Some(0.5));
    assert_eq!(attrs["shape"].as_ints(), Some(&[1, 2][..]));
  }

  #[test]
  fn test_clone_is_independent() {
    let mut base = Program::new();
    base.global_block_mut().append_op(Operator::new("relu").attr("is_test", false));
    let mut copy = base.clone();
    copy.global_block_mut().ops[0].set_attr("is_test", true);
    assert_eq!(base.global_block().ops[0].get_attr("is_test"), Some(&Attr::Bool(false)));
  }
}
