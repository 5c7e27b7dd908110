use std::{error::Error, path::Path};

use partial_program::{
  ConcreteProgram, InputLeaf, Nested, Parameter, Program, RuntimeTensor, Slot,
};
use serde::Deserialize;

fn trainable() -> bool {
  true
}

fn empty_feed() -> Nested<InputLeaf> {
  Nested::Tuple(vec![])
}

#[derive(Debug, Deserialize)]
pub struct ParameterEntry {
  pub name: String,
  pub shape: Vec<i64>,
  pub data: Vec<f64>,
  #[serde(default = "trainable")]
  pub trainable: bool,
}

impl ParameterEntry {
  fn into_parameter(self) -> Parameter {
    if self.trainable {
      return Parameter::trainable(self.name, self.shape, self.data);
    }
    Parameter::new(RuntimeTensor {
      persistable: true,
      ..RuntimeTensor::new(self.name, self.shape, self.data)
    })
  }
}

/// A traced program plus the values to call it with, as stored on disk.
#[derive(Debug, Deserialize)]
pub struct ProgramFile {
  pub program: Program,
  pub inputs: Nested<Slot>,
  pub outputs: Nested<Slot>,
  #[serde(default)]
  pub parameters: Vec<ParameterEntry>,
  #[serde(default = "empty_feed")]
  pub feed: Nested<InputLeaf>,
}

impl ProgramFile {
  pub fn load(path: &Path) -> Result<Self, Box<dyn Error>> {
    let text = std::fs::read_to_string(path)?;
    Ok(Self::from_yaml(&text)?)
  }

  /// Enum variants are written as single-key maps (`tuple: [...]`,
  /// `leaf: {var: ...}`) rather than YAML tags.
  pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::with::singleton_map_recursive::deserialize(serde_yaml::Deserializer::from_str(text))
  }

  pub fn into_parts(self) -> (ConcreteProgram, Nested<InputLeaf>) {
    let concrete = ConcreteProgram {
      main_program: self.program,
      inputs: self.inputs,
      outputs: self.outputs,
      parameters: self.parameters.into_iter().map(ParameterEntry::into_parameter).collect(),
    };
    (concrete, self.feed)
  }
}

#[cfg(test)]
mod tests {
  use partial_program::{partial_program_from, Collaborators, Config, Returned, SeqKind};

  use super::*;

  #[test]
  fn test_demo_program_runs() {
    let file = ProgramFile::from_yaml(include_str!("../../demos/mul.yaml")).unwrap();
    let (concrete, feed) = file.into_parts();
    let params = concrete.parameters.clone();
    let pp = partial_program_from(concrete, Collaborators::reference(), &Config::default()).unwrap();

    match pp.forward(feed).unwrap() {
      Returned::Sequence(SeqKind::Tuple, items) => {
        assert_eq!(items.len(), 2);
        let loss = items[0].as_leaf().and_then(|l| l.as_tensor()).unwrap();
        assert!((loss.data[0] - 9.5 / 3.0).abs() < 1e-12);
      }
      other => panic!("unexpected {:?}", other),
    }
    let w = params[0].grad().unwrap();
    let b = params[1].grad().unwrap();
    assert!((w[0] - 4.0 / 3.0).abs() < 1e-12);
    assert!((b[0] - 1.0).abs() < 1e-12);
  }

  #[test]
  fn test_nested_templates_read_as_single_key_maps() {
    let text = r#"
program:
  blocks:
    - vars:
        x: { name: x, shape: [2] }
      ops: []
inputs:
  list:
    - leaf: { var: { name: x, shape: [2] } }
    - dict:
        flag: { leaf: { value: 3 } }
outputs:
  leaf: { var: { name: x, shape: [2] } }
feed:
  list:
    - leaf: { array: { shape: [2], data: [1.0, 2.0] } }
    - dict:
        flag: { leaf: { value: 3 } }
"#;
    let file = ProgramFile::from_yaml(text).unwrap();
    match &file.inputs {
      Nested::List(items) => {
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], Nested::Leaf(Slot::Var(_))));
        assert!(matches!(items[1], Nested::Dict(_)));
      }
      other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(file.outputs, Nested::Leaf(Slot::Var(_))));
    assert!(file.parameters.is_empty());
  }
}
