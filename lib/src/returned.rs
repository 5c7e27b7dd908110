//! Values handed back to the caller, and removal of "no value" sentinels.
//!
//! A traced function with several return statements of different arity is
//! padded to a fixed output list; the padding slots hold a one-element tensor
//! carrying [`NO_VALUE_MAGIC`]. Those slots are dropped before returning.

use serde::Serialize;

use crate::{
  nest::{value_type_name, Leaf, Nested},
  tensor::RuntimeTensor,
};

/// Value of a padding slot.
pub const NO_VALUE_MAGIC: f64 = 1.77113e+279;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLeaf {
  Tensor(RuntimeTensor),
  /// Non-tensor value seen while tracing, returned as is.
  Value(serde_json::Value),
}

impl Leaf for OutputLeaf {
  fn is_tensor(&self) -> bool {
    matches!(self, OutputLeaf::Tensor(_))
  }

  fn type_name(&self) -> &'static str {
    match self {
      OutputLeaf::Tensor(_) => "tensor",
      OutputLeaf::Value(v) => value_type_name(v),
    }
  }
}

impl OutputLeaf {
  pub fn as_tensor(&self) -> Option<&RuntimeTensor> {
    match self {
      OutputLeaf::Tensor(t) => Some(t),
      OutputLeaf::Value(_) => None,
    }
  }
}

pub fn is_no_value(tensor: &RuntimeTensor) -> bool {
  tensor.shape == [1] && tensor.data.first() == Some(&NO_VALUE_MAGIC)
}

fn is_no_value_node(node: &Nested<OutputLeaf>) -> bool {
  matches!(node, Nested::Leaf(OutputLeaf::Tensor(t)) if is_no_value(t))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SeqKind {
  List,
  Tuple,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Returned {
  NoValue,
  /// A single leaf or a dict.
  Scalar(Nested<OutputLeaf>),
  Sequence(SeqKind, Vec<Nested<OutputLeaf>>),
}

impl Returned {
  pub fn from_nested(node: Nested<OutputLeaf>) -> Self {
    match node {
      Nested::List(items) => Returned::Sequence(SeqKind::List, items),
      Nested::Tuple(items) => Returned::Sequence(SeqKind::Tuple, items),
      other => Returned::Scalar(other),
    }
  }

  /// Drops padding slots. A lone padding value, or a sequence that only held
  /// padding, becomes `NoValue`; a sequence left with a single element after
  /// removal is unwrapped to it. Sequences that lost nothing are unchanged.
  pub fn strip_no_value(self) -> Self {
    match self {
      Returned::Scalar(node) if is_no_value_node(&node) => Returned::NoValue,
      Returned::Sequence(kind, items) => {
        let before = items.len();
        let mut kept: Vec<_> = items.into_iter().filter(|n| !is_no_value_node(n)).collect();
        let removed = kept.len() < before;
        match kept.len() {
          0 if removed => Returned::NoValue,
          1 if removed => Returned::from_nested(kept.remove(0)),
          _ => Returned::Sequence(kind, kept),
        }
      }
      other => other,
    }
  }

  pub fn is_no_value(&self) -> bool {
    matches!(self, Returned::NoValue)
  }

  pub fn into_nested(self) -> Option<Nested<OutputLeaf>> {
    match self {
      Returned::NoValue => None,
      Returned::Scalar(node) => Some(node),
      Returned::Sequence(SeqKind::List, items) => Some(Nested::List(items)),
      Returned::Sequence(SeqKind::Tuple, items) => Some(Nested::Tuple(items)),
    }
  }

  /// The tensor, when exactly one tensor was returned.
  pub fn as_tensor(&self) -> Option<&RuntimeTensor> {
    match self {
      Returned::Scalar(Nested::Leaf(leaf)) => leaf.as_tensor(),
      _ => None,
    }
  }
}

/// A top-level list or tuple holding one element is replaced by that element.
pub fn unwrap_single(node: Nested<OutputLeaf>) -> Nested<OutputLeaf> {
  match node {
    Nested::List(mut items) | Nested::Tuple(mut items) if items.len() == 1 => items.remove(0),
    other => other,
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn sentinel() -> Nested<OutputLeaf> {
    Nested::Leaf(OutputLeaf::Tensor(RuntimeTensor::new("ret", vec![1], vec![NO_VALUE_MAGIC])))
  }

  fn tensor(name: &str, v: f64) -> Nested<OutputLeaf> {
    Nested::Leaf(OutputLeaf::Tensor(RuntimeTensor::new(name, vec![1], vec![v])))
  }

  #[test]
  fn test_sentinel_then_value_unwraps() {
    let r = Returned::from_nested(Nested::Tuple(vec![sentinel(), tensor("x", 1.0)])).strip_no_value();
    assert_eq!(r.as_tensor().map(|t| t.name.as_str()), Some("x"));
  }

  #[test]
  fn test_only_sentinels_is_no_value() {
    let r = Returned::from_nested(Nested::List(vec![sentinel(), sentinel()])).strip_no_value();
    assert!(r.is_no_value());
    assert!(Returned::from_nested(sentinel()).strip_no_value().is_no_value());
  }

  #[test]
  fn test_without_sentinels_is_unchanged() {
    let before = Returned::from_nested(Nested::Tuple(vec![tensor("x", 1.0), tensor("y", 2.0)]));
    assert_eq!(before.clone().strip_no_value(), before);
  }

  #[test]
  fn test_container_kind_is_kept() {
    let r = Returned::from_nested(Nested::List(vec![
      tensor("a", 1.0),
      sentinel(),
      Nested::Leaf(OutputLeaf::Value(json!("tag"))),
    ]))
    .strip_no_value();
    match r {
      Returned::Sequence(SeqKind::List, items) => assert_eq!(items.len(), 2),
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn test_empty_sequence_is_not_no_value() {
    let r = Returned::from_nested(Nested::Tuple(vec![])).strip_no_value();
    assert_eq!(r, Returned::Sequence(SeqKind::Tuple, vec![]));
    let one = Returned::from_nested(Nested::List(vec![tensor("a", 1.0)])).strip_no_value();
    assert!(matches!(one, Returned::Sequence(SeqKind::List, ref items) if items.len() == 1));
  }

  #[test]
  fn test_magic_needs_single_element_shape() {
    let t = RuntimeTensor::new("ret", vec![2], vec![NO_VALUE_MAGIC, NO_VALUE_MAGIC]);
    assert!(!is_no_value(&t));
    assert!(!is_no_value(&RuntimeTensor::new("ret", vec![1], vec![])));
  }

  #[test]
  fn test_unwrap_single() {
    assert_eq!(unwrap_single(Nested::Tuple(vec![tensor("a", 1.0)])), tensor("a", 1.0));
    let pair = Nested::Tuple(vec![tensor("a", 1.0), tensor("b", 2.0)]);
    assert_eq!(unwrap_single(pair.clone()), pair);
  }
}
