//! Flattening and restoring arbitrarily nested containers.
//!
//! Leaves are visited depth first; list and tuple elements in order, dict
//! entries in key order. Restoring a flat sequence into a template walks the
//! template the same way, so `restore(flatten(s)) == s` holds for every `s`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{program::Variable, Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Nested<T> {
  Leaf(T),
  List(Vec<Nested<T>>),
  Tuple(Vec<Nested<T>>),
  Dict(BTreeMap<String, Nested<T>>),
}

impl<T> Nested<T> {
  pub fn flatten(&self) -> Vec<&T> {
    let mut out = vec![];
    self.visit(&mut |leaf| out.push(leaf));
    out
  }

  pub fn into_flat(self) -> Vec<T> {
    let mut out = vec![];
    self.into_visit(&mut |leaf| out.push(leaf));
    out
  }

  pub fn leaf_count(&self) -> usize {
    let mut n = 0;
    self.visit(&mut |_| n += 1);
    n
  }

  /// Rebuilds a structure shaped like `self` whose leaves are `values`, in order.
  pub fn restore<U>(&self, values: Vec<U>) -> Result<Nested<U>> {
    let expected = self.leaf_count();
    if expected != values.len() {
      return Err(Error::StructuralMismatch {
        expected,
        actual: values.len(),
      });
    }
    let mut values = values.into_iter();
    Ok(self.rebuild(&mut values))
  }

  pub fn map<U>(self, f: &mut impl FnMut(T) -> U) -> Nested<U> {
    match self {
      Nested::Leaf(t) => Nested::Leaf(f(t)),
      Nested::List(items) => Nested::List(items.into_iter().map(|n| n.map(f)).collect()),
      Nested::Tuple(items) => Nested::Tuple(items.into_iter().map(|n| n.map(f)).collect()),
      Nested::Dict(items) => Nested::Dict(items.into_iter().map(|(k, n)| (k, n.map(f))).collect()),
    }
  }

  /// Elements of a top-level list or tuple.
  pub fn as_sequence(&self) -> Option<&[Nested<T>]> {
    match self {
      Nested::List(items) | Nested::Tuple(items) => Some(items),
      _ => None,
    }
  }

  pub fn as_leaf(&self) -> Option<&T> {
    match self {
      Nested::Leaf(t) => Some(t),
      _ => None,
    }
  }

  fn visit<'a>(&'a self, f: &mut impl FnMut(&'a T)) {
    match self {
      Nested::Leaf(t) => f(t),
      Nested::List(items) | Nested::Tuple(items) => items.iter().for_each(|n| n.visit(f)),
      Nested::Dict(items) => items.values().for_each(|n| n.visit(f)),
    }
  }

  fn into_visit(self, f: &mut impl FnMut(T)) {
    match self {
      Nested::Leaf(t) => f(t),
      Nested::List(items) | Nested::Tuple(items) => items.into_iter().for_each(|n| n.into_visit(f)),
      Nested::Dict(items) => items.into_values().for_each(|n| n.into_visit(f)),
    }
  }

  // caller guarantees `values` has exactly leaf_count() elements
  fn rebuild<U>(&self, values: &mut impl Iterator<Item = U>) -> Nested<U> {
    match self {
      Nested::Leaf(_) => match values.next() {
        Some(v) => Nested::Leaf(v),
        None => unreachable!("arity checked in restore"),
      },
      Nested::List(items) => Nested::List(items.iter().map(|n| n.rebuild(values)).collect()),
      Nested::Tuple(items) => Nested::Tuple(items.iter().map(|n| n.rebuild(values)).collect()),
      Nested::Dict(items) => Nested::Dict(items.iter().map(|(k, n)| (k.clone(), n.rebuild(values))).collect()),
    }
  }
}

/// Distinguishes tensor leaves from opaque values.
pub trait Leaf {
  fn is_tensor(&self) -> bool;
  /// Human readable type of the leaf, used in diagnostics.
  fn type_name(&self) -> &'static str;
}

pub fn value_type_name(v: &serde_json::Value) -> &'static str {
  match v {
    serde_json::Value::Null => "null",
    serde_json::Value::Bool(_) => "bool",
    serde_json::Value::Number(_) => "number",
    serde_json::Value::String(_) => "string",
    serde_json::Value::Array(_) => "array",
    serde_json::Value::Object(_) => "object",
  }
}

/// Leaf of a traced input/output template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
  Var(Variable),
  Value(serde_json::Value),
}

impl Slot {
  pub fn as_var(&self) -> Option<&Variable> {
    match self {
      Slot::Var(v) => Some(v),
      Slot::Value(_) => None,
    }
  }
}

impl Leaf for Slot {
  fn is_tensor(&self) -> bool {
    matches!(self, Slot::Var(_))
  }

  fn type_name(&self) -> &'static str {
    match self {
      Slot::Var(_) => "variable",
      Slot::Value(v) => value_type_name(v),
    }
  }
}

/// Indices into the flattened structure whose leaf is a tensor.
pub fn tensor_positions<T: Leaf>(structure: &Nested<T>) -> Vec<usize> {
  structure
    .flatten()
    .into_iter()
    .enumerate()
    .filter(|(_, leaf)| leaf.is_tensor())
    .map(|(i, _)| i)
    .collect()
}

/// A traced template together with its flattened leaves and tensor positions,
/// computed once.
#[derive(Debug, Clone)]
pub struct FlatTemplate {
  template: Nested<Slot>,
  flat: Vec<Slot>,
  tensor_positions: Vec<usize>,
}

impl FlatTemplate {
  /// With `need_check`, warns once about non-tensor leaves: their traced value
  /// is returned verbatim on every later call.
  pub fn new(template: Nested<Slot>, need_check: bool) -> Self {
    let flat: Vec<Slot> = template.flatten().into_iter().cloned().collect();
    let tensor_positions = tensor_positions(&template);
    if need_check {
      let types: BTreeSet<&str> = flat.iter().filter(|s| !s.is_tensor()).map(Leaf::type_name).collect();
      if !types.is_empty() {
        warn!(
          "Output of traced function contains non-tensor type values: {:?}. They are not updated \
           while running and the first seen value is returned. Return them as tensors instead.",
          types
        );
      }
    }
    FlatTemplate {
      template,
      flat,
      tensor_positions,
    }
  }

  pub fn template(&self) -> &Nested<Slot> {
    &self.template
  }

  pub fn flat(&self) -> &[Slot] {
    &self.flat
  }

  pub fn get(&self, index: usize) -> Option<&Slot> {
    self.flat.get(index)
  }

  pub fn tensor_positions(&self) -> &[usize] {
    &self.tensor_positions
  }

  /// Variables at the tensor positions, in flattened order.
  pub fn vars(&self) -> impl Iterator<Item = &Variable> {
    self.flat.iter().filter_map(Slot::as_var)
  }

  pub fn restore<U>(&self, values: Vec<U>) -> Result<Nested<U>> {
    self.template.restore(values)
  }
}

#[cfg(test)]
mod tests {
  use std::{
    io,
    sync::{Arc, Mutex},
  };

  use proptest::prelude::*;
  use serde_json::json;
  use tracing_subscriber::fmt::MakeWriter;

  use super::*;

  fn var(name: &str) -> Nested<Slot> {
    Nested::Leaf(Slot::Var(Variable::new(name, vec![1])))
  }

  fn sample() -> Nested<Slot> {
    Nested::Tuple(vec![
      var("a"),
      Nested::List(vec![Nested::Leaf(Slot::Value(json!(3))), var("b")]),
      Nested::Dict(BTreeMap::from([
        ("z".to_string(), var("d")),
        ("k".to_string(), var("c")),
      ])),
    ])
  }

  #[test]
  fn test_flatten_order_is_depth_first_with_sorted_keys() {
    let names: Vec<_> = sample()
      .flatten()
      .into_iter()
      .map(|s| match s {
        Slot::Var(v) => v.name.clone(),
        Slot::Value(v) => v.to_string(),
      })
      .collect();
    assert_eq!(names, vec!["a", "3", "b", "c", "d"]);
  }

  #[test]
  fn test_tensor_positions_skip_values() {
    let t = FlatTemplate::new(sample(), true);
    assert_eq!(t.tensor_positions(), &[0, 2, 3, 4]);
    assert_eq!(t.vars().count(), 4);
  }

  /// Log sink shared between a test and its subscriber.
  #[derive(Clone, Default)]
  struct Captured(Arc<Mutex<Vec<u8>>>);

  impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
      self.0.lock().unwrap().extend_from_slice(buf);
      Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
      Ok(())
    }
  }

  impl<'a> MakeWriter<'a> for Captured {
    type Writer = Captured;

    fn make_writer(&'a self) -> Self::Writer {
      self.clone()
    }
  }

  fn warnings_during(f: impl FnOnce()) -> String {
    let captured = Captured::default();
    let subscriber = tracing_subscriber::fmt()
      .with_writer(captured.clone())
      .with_ansi(false)
      .with_max_level(tracing::Level::WARN)
      .finish();
    tracing::subscriber::with_default(subscriber, f);
    let bytes = captured.0.lock().unwrap().clone();
    String::from_utf8(bytes).unwrap()
  }

  #[test]
  fn test_non_tensor_warning_once_at_construction() {
    let logs = warnings_during(|| {
      let t = FlatTemplate::new(sample(), true);
      for _ in 0..3 {
        t.restore((0..5).collect::<Vec<i32>>()).unwrap();
      }
    });
    assert_eq!(logs.matches("non-tensor type values").count(), 1);
    assert!(logs.contains("number"));
  }

  #[test]
  fn test_no_warning_without_check_or_values() {
    let unchecked = warnings_during(|| {
      FlatTemplate::new(sample(), false);
    });
    assert!(unchecked.is_empty());

    let tensors_only = warnings_during(|| {
      FlatTemplate::new(Nested::Tuple(vec![var("a"), var("b")]), true);
    });
    assert!(tensors_only.is_empty());
  }

  #[test]
  fn test_restore_rejects_wrong_arity() {
    let err = sample().restore(vec![1, 2, 3]).unwrap_err();
    assert!(matches!(err, Error::StructuralMismatch { expected: 5, actual: 3 }));
  }

  #[test]
  fn test_restore_keeps_container_kinds() {
    let restored = sample().restore((0..5).collect()).unwrap();
    match restored {
      Nested::Tuple(items) => {
        assert_eq!(items[0], Nested::Leaf(0));
        assert!(matches!(items[1], Nested::List(_)));
        assert!(matches!(items[2], Nested::Dict(_)));
      }
      other => panic!("expected tuple, got {:?}", other),
    }
  }

  #[test]
  fn test_empty_structure() {
    let empty: Nested<i32> = Nested::Tuple(vec![]);
    assert_eq!(empty.leaf_count(), 0);
    assert_eq!(empty.restore::<i32>(vec![]).unwrap(), Nested::Tuple(vec![]));
  }

  fn arb_nested() -> impl Strategy<Value = Nested<i32>> {
    let leaf = any::<i32>().prop_map(Nested::Leaf);
    leaf.prop_recursive(4, 32, 4, |inner| {
      prop_oneof![
        prop::collection::vec(inner.clone(), 0..4).prop_map(Nested::List),
        prop::collection::vec(inner.clone(), 0..4).prop_map(Nested::Tuple),
        prop::collection::btree_map("[a-d]", inner, 0..3).prop_map(Nested::Dict),
      ]
    })
  }

  proptest! {
    #[test]
    fn test_restore_of_flatten_is_identity(s in arb_nested()) {
      let flat: Vec<i32> = s.flatten().into_iter().copied().collect();
      let restored = s.restore(flat.clone()).unwrap();
      prop_assert_eq!(&restored, &s);
      prop_assert_eq!(restored.into_flat().len(), flat.len());
    }
  }
}
